//! Append-only log of one patch run, shared between the engine worker thread
//! and any number of readers.

use std::sync::{PoisonError, RwLock};

use shared::session::{LogLevel, LogLine};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info};

const LIVE_LOG_CAPACITY: usize = 1024;

/// Append interface handed to the patch engine.
pub trait PatchLogger: Send + Sync {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Pending,
    Open,
    Sealed,
}

struct SinkBuffer {
    state: SinkState,
    lines: Vec<LogLine>,
}

pub struct LogSink {
    verbose: bool,
    buffer: RwLock<SinkBuffer>,
    live: broadcast::Sender<LogLine>,
}

impl LogSink {
    pub fn new(verbose: bool) -> Self {
        let (live, _) = broadcast::channel(LIVE_LOG_CAPACITY);
        Self {
            verbose,
            buffer: RwLock::new(SinkBuffer {
                state: SinkState::Pending,
                lines: Vec::new(),
            }),
            live,
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub(crate) fn open(&self) {
        let mut buffer = self.buffer.write().unwrap_or_else(PoisonError::into_inner);
        if buffer.state == SinkState::Pending {
            buffer.state = SinkState::Open;
        }
    }

    pub(crate) fn seal(&self) {
        let mut buffer = self.buffer.write().unwrap_or_else(PoisonError::into_inner);
        buffer.state = SinkState::Sealed;
    }

    pub fn is_open(&self) -> bool {
        self.buffer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            == SinkState::Open
    }

    /// Records a line if the sink is open and the level passes the verbosity
    /// filter. Returns whether the line was kept.
    pub fn append(&self, level: LogLevel, message: &str) -> bool {
        if level == LogLevel::Debug && !self.verbose {
            return false;
        }

        let line = LogLine::new(level, message);
        {
            let mut buffer = self.buffer.write().unwrap_or_else(PoisonError::into_inner);
            if buffer.state != SinkState::Open {
                debug!(?level, "patch log: dropped line outside of an active run");
                return false;
            }
            buffer.lines.push(line.clone());
            // Live order must match buffer order for `LogFollower` catch-up.
            let _ = self.live.send(line);
        }

        match level {
            LogLevel::Debug => debug!(target: "patch", "{message}"),
            LogLevel::Info => info!(target: "patch", "{message}"),
            LogLevel::Error => error!(target: "patch", "{message}"),
        }
        true
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.buffer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lines
            .clone()
    }

    /// Lines recorded after the first `offset`; lets a renderer fetch only
    /// what it has not shown yet.
    pub fn lines_since(&self, offset: usize) -> Vec<LogLine> {
        let buffer = self.buffer.read().unwrap_or_else(PoisonError::into_inner);
        buffer.lines.iter().skip(offset).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lines
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_errors(&self) -> bool {
        self.buffer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lines
            .iter()
            .any(|line| line.level == LogLevel::Error)
    }

    pub fn render(&self) -> String {
        let buffer = self.buffer.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();
        for line in &buffer.lines {
            out.push_str(&line.message);
            out.push('\n');
        }
        out
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.live.subscribe()
    }

    /// Follows lines appended from now on, in order and without gaps.
    pub fn follow(&self) -> LogFollower<'_> {
        let buffer = self.buffer.read().unwrap_or_else(PoisonError::into_inner);
        LogFollower {
            sink: self,
            live: self.live.subscribe(),
            seen: buffer.lines.len(),
        }
    }
}

/// Live reader over a [`LogSink`]. A reader that falls behind the broadcast
/// buffer refetches the missed lines from the sink.
pub struct LogFollower<'a> {
    sink: &'a LogSink,
    live: broadcast::Receiver<LogLine>,
    seen: usize,
}

impl LogFollower<'_> {
    /// Next batch of lines, or `None` once the sink is dropped.
    pub async fn recv(&mut self) -> Option<Vec<LogLine>> {
        match self.live.recv().await {
            Ok(line) => {
                self.seen += 1;
                Some(vec![line])
            }
            Err(RecvError::Lagged(skipped)) => {
                let missed: Vec<LogLine> = self
                    .sink
                    .lines_since(self.seen)
                    .into_iter()
                    .take(skipped as usize)
                    .collect();
                debug!(skipped, recovered = missed.len(), "patch log: reader fell behind");
                self.seen += missed.len();
                Some(missed)
            }
            Err(RecvError::Closed) => None,
        }
    }

    /// Lines recorded but not yet returned by [`recv`](Self::recv).
    pub fn remaining(&mut self) -> Vec<LogLine> {
        let rest = self.sink.lines_since(self.seen);
        self.seen += rest.len();
        rest
    }

    pub fn seen(&self) -> usize {
        self.seen
    }
}

impl PatchLogger for LogSink {
    fn debug(&self, message: &str) {
        self.append(LogLevel::Debug, message);
    }

    fn info(&self, message: &str) {
        self.append(LogLevel::Info, message);
    }

    fn error(&self, message: &str) {
        self.append(LogLevel::Error, message);
    }
}

#[cfg(test)]
#[path = "tests/log_sink_tests.rs"]
mod tests;
