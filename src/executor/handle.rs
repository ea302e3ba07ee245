use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::ast::Node;
use crate::config::ExecConfig;
use crate::error::ExecError;
use super::capture::{Channel, StreamLine};
use super::engine::{self, ProcessRecord, RunState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Created,
    Running,
    Finished,
    Killed,
}

#[derive(Debug)]
struct Lifecycle {
    state: HandleState,
    exit: Option<ExitStatus>,
    done: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn complete(lifecycle: &Mutex<Lifecycle>, exit: Option<ExitStatus>) {
    let mut lc = lock(lifecycle);
    lc.exit = exit;
    lc.done = true;
    if lc.state == HandleState::Running {
        lc.state = HandleState::Finished;
    }
}

/// The live side of a [`Node`]: one handle per evaluation.
///
/// A top-level `Async` node is evaluated on a background thread and `run()`
/// returns at once; anything else is evaluated and awaited by `run()` itself.
/// Output is captured either way and can be read in bulk (blocking) or line
/// by line while the processes are still running.
pub struct ProcessHandle {
    node: Node,
    state: Arc<RunState>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    context: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessHandle {
    pub fn new(node: Node) -> Self {
        Self::with_config(node, ExecConfig::default())
    }

    pub fn with_config(node: Node, config: ExecConfig) -> Self {
        ProcessHandle {
            node,
            state: Arc::new(RunState::new(config)),
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: HandleState::Created,
                exit: None,
                done: false,
            })),
            context: Mutex::new(None),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Starts the evaluation. A handle runs at most once.
    pub fn run(&self) -> Result<(), ExecError> {
        // Held for the whole call so a concurrent `finish()` cannot miss the
        // background context.
        let mut context = lock(&self.context);
        {
            let mut lc = lock(&self.lifecycle);
            if lc.state != HandleState::Created {
                return Err(ExecError::AlreadyStarted);
            }
            lc.state = HandleState::Running;
        }
        debug!(node = %self.node, "running");

        match &self.node {
            Node::Async(inner) => {
                let inner = (**inner).clone();
                let state = self.state.clone();
                let lifecycle = self.lifecycle.clone();
                let spawned = thread::Builder::new()
                    .name("shellpipe-run".to_string())
                    .spawn(move || {
                        let exit = engine::evaluate(&inner, &state);
                        complete(&lifecycle, exit);
                    });
                match spawned {
                    Ok(thread) => *context = Some(thread),
                    Err(e) => {
                        self.state.fail(e.into());
                        self.state.capture.close_all();
                        complete(&self.lifecycle, None);
                    }
                }
            }
            node => {
                let exit = engine::evaluate(node, &self.state);
                complete(&self.lifecycle, exit);
            }
        }
        Ok(())
    }

    pub fn state(&self) -> HandleState {
        lock(&self.lifecycle).state
    }

    pub fn running(&self) -> bool {
        self.state() == HandleState::Running
    }

    /// Pid of the first spawned process, `None` until it exists.
    pub fn pid(&self) -> Option<u32> {
        self.state.first_pid()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.state.records().iter().map(|r| r.pid).collect()
    }

    pub fn processes(&self) -> Vec<ProcessRecord> {
        self.state.records()
    }

    /// `None` until the evaluation has completed.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        let lc = lock(&self.lifecycle);
        if lc.done { lc.exit } else { None }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status().and_then(|s| s.code())
    }

    /// The first error recorded by any context of this evaluation.
    pub fn error(&self) -> Option<ExecError> {
        self.state.error()
    }

    /// Non-fatal conditions such as broken pipes.
    pub fn notices(&self) -> Vec<ExecError> {
        self.state.notices()
    }

    /// Blocks until the evaluation completed and its output is drained.
    pub fn finish(&self) -> Result<Option<ExitStatus>, ExecError> {
        self.join()?;
        if let Some(err) = self.state.error() {
            return Err(err);
        }
        Ok(lock(&self.lifecycle).exit)
    }

    fn join(&self) -> Result<(), ExecError> {
        let mut context = lock(&self.context);
        if self.state() == HandleState::Created {
            return Err(ExecError::NotStarted);
        }
        if let Some(thread) = context.take() {
            if thread.join().is_err() {
                self.state.fail(ExecError::ContextPanicked("background evaluation".into()));
                self.state.capture.close_all();
                complete(&self.lifecycle, None);
            }
        }
        Ok(())
    }

    /// Captured stdout. Blocks until the evaluation has completed.
    pub fn stdout(&self) -> Result<Vec<u8>, ExecError> {
        self.finish()?;
        Ok(self.state.capture.bytes(Channel::Stdout))
    }

    /// Captured stderr. Blocks until the evaluation has completed.
    pub fn stderr(&self) -> Result<Vec<u8>, ExecError> {
        self.finish()?;
        Ok(self.state.capture.bytes(Channel::Stderr))
    }

    /// Stdout and stderr in the order the readers saw them.
    pub fn all(&self) -> Result<Vec<u8>, ExecError> {
        self.finish()?;
        Ok(self.state.capture.all())
    }

    /// Whatever stdout holds right now, without waiting or error checks.
    pub fn peek_stdout(&self) -> Vec<u8> {
        self.state.capture.bytes(Channel::Stdout)
    }

    pub fn peek_stderr(&self) -> Vec<u8> {
        self.state.capture.bytes(Channel::Stderr)
    }

    /// Sends the configured kill signal to the running processes.
    ///
    /// Fails on a handle that was never run; a no-op once finished or killed.
    /// Output produced before the kill stays readable.
    pub fn kill(&self) -> Result<(), ExecError> {
        let mut lc = lock(&self.lifecycle);
        match lc.state {
            HandleState::Created => Err(ExecError::NotStarted),
            HandleState::Finished | HandleState::Killed => Ok(()),
            HandleState::Running => {
                lc.state = HandleState::Killed;
                drop(lc);
                info!(node = %self.node, "killing");
                self.state.kill_current_stage()
            }
        }
    }

    /// Next `(stdout, stderr)` lines, never blocking. Either side is `None`
    /// when nothing is available yet.
    pub fn next_stream_line(&self) -> StreamLine {
        self.state.capture.next_line()
    }

    /// True once both streams hit end-of-file and every line was consumed.
    pub fn stream_empty(&self) -> bool {
        self.state.capture.is_drained()
    }

    /// Blocking iterator over stream lines, ending after the evaluation
    /// completed and every line was handed out.
    pub fn stream_lines(&self) -> StreamLines<'_> {
        StreamLines { handle: self }
    }
}

pub struct StreamLines<'a> {
    handle: &'a ProcessHandle,
}

impl Iterator for StreamLines<'_> {
    type Item = StreamLine;

    fn next(&mut self) -> Option<StreamLine> {
        loop {
            if self.handle.state() == HandleState::Created {
                return None;
            }
            let line = self.handle.next_stream_line();
            if line.0.is_some() || line.1.is_some() {
                return Some(line);
            }
            if !self.handle.running() && self.handle.stream_empty() {
                return None;
            }
            thread::sleep(self.handle.state.config.poll_interval);
        }
    }
}
