use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use nix::fcntl::OFlag;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use shared_child::SharedChild;
use tracing::{debug, warn};

use crate::ast::Node;
use crate::config::{ExecConfig, StdinPolicy};
use crate::error::ExecError;
use super::capture::{self, Capture};

/// A process spawned during one evaluation, in spawn order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub command: String,
    /// Incremented every time a sequence moves on to its right side.
    pub stage: u64,
    pub status: Option<ExitStatus>,
}

#[derive(Default)]
struct Registry {
    records: Vec<ProcessRecord>,
    live: Vec<(usize, Arc<SharedChild>)>,
    stage: u64,
    killed_stage: Option<u64>,
}

#[derive(Default)]
struct Failures {
    error: Option<ExecError>,
    notices: Vec<ExecError>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared by every context taking part in one evaluation.
pub(crate) struct RunState {
    pub(crate) config: ExecConfig,
    pub(crate) capture: Arc<Capture>,
    registry: Mutex<Registry>,
    failures: Mutex<Failures>,
}

impl RunState {
    pub(crate) fn new(config: ExecConfig) -> Self {
        RunState {
            config,
            capture: Arc::new(Capture::new()),
            registry: Mutex::new(Registry::default()),
            failures: Mutex::new(Failures::default()),
        }
    }

    /// Keeps the first error; later ones are only logged.
    pub(crate) fn fail(&self, err: ExecError) {
        if err.is_notice() {
            return self.notice(err);
        }
        let mut failures = lock(&self.failures);
        if failures.error.is_none() {
            failures.error = Some(err);
        } else {
            debug!(error = %err, "additional evaluation error");
        }
    }

    pub(crate) fn notice(&self, err: ExecError) {
        warn!(notice = %err, "non-fatal pipeline condition");
        lock(&self.failures).notices.push(err);
    }

    pub(crate) fn error(&self) -> Option<ExecError> {
        lock(&self.failures).error.clone()
    }

    pub(crate) fn notices(&self) -> Vec<ExecError> {
        lock(&self.failures).notices.clone()
    }

    pub(crate) fn records(&self) -> Vec<ProcessRecord> {
        lock(&self.registry).records.clone()
    }

    pub(crate) fn first_pid(&self) -> Option<u32> {
        lock(&self.registry).records.first().map(|r| r.pid)
    }

    fn register(&self, child: &Arc<SharedChild>, command: &str) -> usize {
        let mut registry = lock(&self.registry);
        let index = registry.records.len();
        let stage = registry.stage;
        registry.records.push(ProcessRecord {
            pid: child.id(),
            command: command.to_string(),
            stage,
            status: None,
        });
        // A kill that raced ahead of this spawn still applies to it.
        if registry.killed_stage == Some(stage) {
            if let Err(e) = self.signal(child) {
                warn!(pid = child.id(), error = %e, "failed to signal late process");
            }
        }
        registry.live.push((index, child.clone()));
        index
    }

    fn exited(&self, index: usize, status: ExitStatus) {
        let mut registry = lock(&self.registry);
        if let Some(record) = registry.records.get_mut(index) {
            record.status = Some(status);
        }
        registry.live.retain(|(i, _)| *i != index);
    }

    fn advance_stage(&self) {
        lock(&self.registry).stage += 1;
    }

    /// Every leaf leads its own process group, so the whole group is
    /// signalled and grandchildren holding a capture pipe die with it.
    fn signal(&self, child: &SharedChild) -> Result<(), ExecError> {
        let group = Pid::from_raw(child.id() as libc::pid_t);
        match signal::killpg(group, self.config.kill_signal) {
            // The group is already gone.
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Signals every live process and marks the current stage killed. Later
    /// stages of a sequence are left alone.
    pub(crate) fn kill_current_stage(&self) -> Result<(), ExecError> {
        let mut registry = lock(&self.registry);
        let stage = registry.stage;
        registry.killed_stage = Some(stage);
        let mut result = Ok(());
        for (_, child) in &registry.live {
            debug!(pid = child.id(), signal = ?self.config.kill_signal, "sending kill signal");
            if let Err(e) = self.signal(child) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

/// Descriptors a node is started with.
pub(crate) struct IoContext {
    /// `None` falls back to the configured stdin policy.
    stdin: Option<OwnedFd>,
    stdout: OwnedFd,
    stderr: OwnedFd,
    state: Arc<RunState>,
}

impl IoContext {
    fn try_clone(&self) -> Result<IoContext, ExecError> {
        Ok(IoContext {
            stdin: match &self.stdin {
                Some(fd) => Some(fd.try_clone()?),
                None => None,
            },
            stdout: self.stdout.try_clone()?,
            stderr: self.stderr.try_clone()?,
            state: self.state.clone(),
        })
    }
}

/// Pipes handed to children must not leak into unrelated children, or a
/// reader would never see EOF.
pub(crate) fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd), ExecError> {
    Ok(nix::unistd::pipe2(OFlag::O_CLOEXEC)?)
}

#[derive(Debug, Clone, Copy)]
enum PipeSource {
    Stdout,
    Stderr,
    Both,
}

/// A started node that still has to be waited on.
pub(crate) enum Started {
    Child {
        child: Arc<SharedChild>,
        index: usize,
        command: String,
    },
    Writer {
        thread: JoinHandle<io::Result<()>>,
        consumer: String,
    },
    Pipe(Box<Started>, Box<Started>),
    Seq(Box<Started>, Box<Started>),
    Background(JoinHandle<Option<ExitStatus>>),
    Done(Option<ExitStatus>),
}

impl Started {
    /// Waits for everything this node started. The status follows the
    /// right-most part of the expression that produced one.
    pub(crate) fn wait(self, state: &RunState) -> Option<ExitStatus> {
        match self {
            Started::Child { child, index, command } => match child.wait() {
                Ok(status) => {
                    debug!(pid = child.id(), ?status, "process exited");
                    state.exited(index, status);
                    if status.signal() == Some(Signal::SIGPIPE as i32) {
                        state.notice(ExecError::BrokenPipe(format!(
                            "`{}` was writing to a consumer that exited",
                            command
                        )));
                    }
                    Some(status)
                }
                Err(e) => {
                    state.fail(e.into());
                    None
                }
            },
            Started::Writer { thread, consumer } => {
                match thread.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                        state.notice(ExecError::BrokenPipe(format!(
                            "`{}` exited before reading all of its input",
                            consumer
                        )));
                    }
                    Ok(Err(e)) => state.fail(e.into()),
                    Err(_) => state.fail(ExecError::ContextPanicked("literal writer".into())),
                }
                None
            }
            Started::Pipe(left, right) => {
                let left_status = left.wait(state);
                let right_status = right.wait(state);
                right_status.or(left_status)
            }
            Started::Seq(left, right) => {
                let left_status = left.wait(state);
                right.wait(state).or(left_status)
            }
            Started::Background(thread) => thread.join().unwrap_or_else(|_| {
                state.fail(ExecError::ContextPanicked("background node".into()));
                None
            }),
            Started::Done(status) => status,
        }
    }
}

/// Starts `node`. Failures are recorded on the run state and never stop
/// sibling nodes from starting.
pub(crate) fn start(node: &Node, ctx: IoContext) -> Started {
    let state = ctx.state.clone();
    match try_start(node, ctx) {
        Ok(started) => started,
        Err(e) => {
            warn!(node = %node, error = %e, "failed to start node");
            state.fail(e);
            Started::Done(None)
        }
    }
}

fn try_start(node: &Node, ctx: IoContext) -> Result<Started, ExecError> {
    match node {
        Node::Leaf { program, args } => start_leaf(program, args, ctx),
        Node::Literal(_) => Err(ExecError::InvalidNode(
            "a literal can only be the left side of a pipe".into(),
        )),
        Node::Pipe(left, right) => start_pipe(left, right, ctx, PipeSource::Stdout),
        Node::ErrPipe(left, right) => start_pipe(left, right, ctx, PipeSource::Stderr),
        Node::AllPipe(left, right) => start_pipe(left, right, ctx, PipeSource::Both),
        Node::Seq(left, right) => start_seq(left, right, ctx),
        Node::Async(inner) => start_background(inner, ctx),
    }
}

fn start_leaf(program: &OsString, args: &[OsString], ctx: IoContext) -> Result<Started, ExecError> {
    let IoContext { stdin, stdout, stderr, state } = ctx;
    let command_string = Node::Leaf {
        program: program.clone(),
        args: args.to_vec(),
    }
    .describe();

    let mut command = Command::new(program);
    command.args(args);
    state.config.environment.apply(&mut command);
    command.stdin(match stdin {
        Some(fd) => Stdio::from(fd),
        None => match state.config.stdin {
            StdinPolicy::Inherit => Stdio::inherit(),
            StdinPolicy::Null => Stdio::null(),
        },
    });
    command.stdout(Stdio::from(stdout));
    command.stderr(Stdio::from(stderr));
    command.process_group(0);

    let child = SharedChild::spawn(&mut command)
        .map_err(|e| ExecError::spawn(&command_string, &e))?;
    // Drops the parent's copies of the child's descriptors.
    drop(command);

    let child = Arc::new(child);
    let index = state.register(&child, &command_string);
    debug!(pid = child.id(), command = %command_string, "spawned process");
    Ok(Started::Child {
        child,
        index,
        command: command_string,
    })
}

fn start_pipe(
    left: &Node,
    right: &Node,
    ctx: IoContext,
    source: PipeSource,
) -> Result<Started, ExecError> {
    if right.is_literal() {
        return Err(ExecError::InvalidNode(
            "a literal cannot consume piped input".into(),
        ));
    }
    let (reader, writer) = cloexec_pipe()?;

    let left_started = match left {
        Node::Literal(bytes) => Started::Writer {
            thread: spawn_writer(bytes.clone(), writer)?,
            consumer: right.describe(),
        },
        _ => {
            let mut left_ctx = ctx.try_clone()?;
            match source {
                PipeSource::Stdout => left_ctx.stdout = writer,
                PipeSource::Stderr => left_ctx.stderr = writer,
                PipeSource::Both => {
                    left_ctx.stderr = writer.try_clone()?;
                    left_ctx.stdout = writer;
                }
            }
            if blocks_on_start(left) {
                // The consumer must exist before a sequence waits on its
                // first part, or that part can fill the pipe and stall.
                start_background(left, left_ctx)?
            } else {
                start(left, left_ctx)
            }
        }
    };

    let mut right_ctx = ctx;
    right_ctx.stdin = Some(reader);
    let right_started = start(right, right_ctx);

    Ok(Started::Pipe(Box::new(left_started), Box::new(right_started)))
}

/// Feeds a literal into a pipe from its own thread, so a consumer that
/// writes before it has read everything cannot deadlock against us.
fn spawn_writer(bytes: Vec<u8>, fd: OwnedFd) -> Result<JoinHandle<io::Result<()>>, ExecError> {
    let thread = thread::Builder::new()
        .name("shellpipe-literal".to_string())
        .spawn(move || {
            let mut pipe = File::from(fd);
            pipe.write_all(&bytes)?;
            pipe.flush()
        })?;
    Ok(thread)
}

/// True when starting `node` waits on a process before returning.
fn blocks_on_start(node: &Node) -> bool {
    match node {
        Node::Seq(..) => true,
        Node::Pipe(l, r) | Node::ErrPipe(l, r) | Node::AllPipe(l, r) => {
            blocks_on_start(l) || blocks_on_start(r)
        }
        Node::Leaf { .. } | Node::Literal(_) | Node::Async(_) => false,
    }
}

/// Left is awaited even when it is `Async`: right is never spawned before
/// left's status is known.
fn start_seq(left: &Node, right: &Node, ctx: IoContext) -> Result<Started, ExecError> {
    let state = ctx.state.clone();
    let left_started = Started::Done(start(left, ctx.try_clone()?).wait(&state));
    state.advance_stage();
    let right_started = start(right, ctx);
    Ok(Started::Seq(Box::new(left_started), Box::new(right_started)))
}

fn start_background(inner: &Node, ctx: IoContext) -> Result<Started, ExecError> {
    let inner = inner.clone();
    let thread = thread::Builder::new()
        .name("shellpipe-async".to_string())
        .spawn(move || {
            let state = ctx.state.clone();
            start(&inner, ctx).wait(&state)
        })?;
    Ok(Started::Background(thread))
}

/// Runs a whole expression to completion on the current thread, including
/// draining the capture pipes.
pub(crate) fn evaluate(node: &Node, state: &Arc<RunState>) -> Option<ExitStatus> {
    let (stdout, stderr, readers) =
        match capture::spawn_readers(&state.capture, state.config.read_chunk_size) {
            Ok(parts) => parts,
            Err(e) => {
                state.fail(e);
                state.capture.close_all();
                return None;
            }
        };
    let ctx = IoContext {
        stdin: None,
        stdout,
        stderr,
        state: state.clone(),
    };
    let status = start(node, ctx).wait(state);
    if let Err(e) = readers.join() {
        state.fail(e);
    }
    status
}
