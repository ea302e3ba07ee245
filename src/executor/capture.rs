//! Draining of captured stdout/stderr.
//!
//! Every evaluation owns two capture pipes. Leaves whose stdout or stderr is
//! not wired into a neighbour receive a duplicate of the write end; a reader
//! thread per pipe drains the read end until every writer is gone.
//!
//! ```text
//!   child ──▶ capture pipe ──▶ reader thread ──▶ bytes   (bulk accessors)
//!                                             ├─▶ lines  (next_stream_line)
//!                                             └─▶ all    (both channels, arrival order)
//! ```

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::trace;

use crate::error::ExecError;

/// One poll of both channels: `(stdout_line, stderr_line)`.
pub type StreamLine = (Option<Vec<u8>>, Option<Vec<u8>>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
struct StreamBuffer {
    bytes: Vec<u8>,
    lines: VecDeque<Vec<u8>>,
    /// Bytes after the last newline.
    partial: Vec<u8>,
    eof: bool,
}

impl StreamBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..=pos]);
            self.lines.push_back(std::mem::take(&mut self.partial));
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);
    }

    fn close(&mut self) {
        if !self.partial.is_empty() {
            self.lines.push_back(std::mem::take(&mut self.partial));
        }
        self.eof = true;
    }

    /// Completed lines first; an unterminated fragment is handed out when
    /// nothing else is queued.
    fn pop(&mut self) -> Option<Vec<u8>> {
        if let Some(line) = self.lines.pop_front() {
            return Some(line);
        }
        if self.partial.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial))
        }
    }

    fn is_drained(&self) -> bool {
        self.eof && self.lines.is_empty() && self.partial.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Capture {
    stdout: Mutex<StreamBuffer>,
    stderr: Mutex<StreamBuffer>,
    all: Mutex<Vec<u8>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, channel: Channel) -> &Mutex<StreamBuffer> {
        match channel {
            Channel::Stdout => &self.stdout,
            Channel::Stderr => &self.stderr,
        }
    }

    pub fn push(&self, channel: Channel, chunk: &[u8]) {
        lock(self.stream(channel)).push(chunk);
        lock(&self.all).extend_from_slice(chunk);
    }

    pub fn close(&self, channel: Channel) {
        lock(self.stream(channel)).close();
    }

    pub fn close_all(&self) {
        self.close(Channel::Stdout);
        self.close(Channel::Stderr);
    }

    pub fn pop_line(&self, channel: Channel) -> Option<Vec<u8>> {
        lock(self.stream(channel)).pop()
    }

    pub fn next_line(&self) -> StreamLine {
        (self.pop_line(Channel::Stdout), self.pop_line(Channel::Stderr))
    }

    pub fn bytes(&self, channel: Channel) -> Vec<u8> {
        lock(self.stream(channel)).bytes.clone()
    }

    pub fn all(&self) -> Vec<u8> {
        lock(&self.all).clone()
    }

    #[cfg(test)]
    pub fn is_eof(&self, channel: Channel) -> bool {
        lock(self.stream(channel)).eof
    }

    /// Both channels reached end-of-stream and every line was handed out.
    pub fn is_drained(&self) -> bool {
        lock(&self.stdout).is_drained() && lock(&self.stderr).is_drained()
    }
}

pub(crate) struct Readers {
    stdout: JoinHandle<io::Result<()>>,
    stderr: JoinHandle<io::Result<()>>,
}

impl Readers {
    pub(crate) fn join(self) -> Result<(), ExecError> {
        let stdout = join_reader(self.stdout);
        let stderr = join_reader(self.stderr);
        stdout.and(stderr)
    }
}

fn join_reader(handle: JoinHandle<io::Result<()>>) -> Result<(), ExecError> {
    match handle.join() {
        Ok(result) => result.map_err(ExecError::from),
        Err(_) => Err(ExecError::ContextPanicked("capture reader".into())),
    }
}

/// Starts both reader threads and returns the write ends children should get.
pub(crate) fn spawn_readers(
    capture: &Arc<Capture>,
    chunk_size: usize,
) -> Result<(OwnedFd, OwnedFd, Readers), ExecError> {
    let (stdout_read, stdout_write) = super::engine::cloexec_pipe()?;
    let (stderr_read, stderr_write) = super::engine::cloexec_pipe()?;
    let stdout = spawn_reader(capture.clone(), Channel::Stdout, stdout_read, chunk_size)?;
    let stderr = spawn_reader(capture.clone(), Channel::Stderr, stderr_read, chunk_size)?;
    Ok((stdout_write, stderr_write, Readers { stdout, stderr }))
}

fn spawn_reader(
    capture: Arc<Capture>,
    channel: Channel,
    fd: OwnedFd,
    chunk_size: usize,
) -> Result<JoinHandle<io::Result<()>>, ExecError> {
    let name = match channel {
        Channel::Stdout => "shellpipe-stdout",
        Channel::Stderr => "shellpipe-stderr",
    };
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || drain(File::from(fd), &capture, channel, chunk_size))?;
    Ok(handle)
}

fn drain(mut reader: File, capture: &Capture, channel: Channel, chunk_size: usize) -> io::Result<()> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    let result = loop {
        match reader.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => capture.push(channel, &buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e),
        }
    };
    capture.close(channel);
    trace!(?channel, "capture stream closed");
    result
}
