//! Progress reporting through an injected sink.
//!
//! The engine never writes to any transport itself; attributes carry an
//! optional [`LogSink`] and every message goes through it. The sink may be
//! called from worker threads, so implementations must be `Send + Sync`.

use std::sync::{Arc, Mutex};

/// Receiver for engine progress lines. Purely advisory: nothing the sink
/// does changes the outcome of an operation.
pub trait LogSink: Send + Sync {
    fn message(&self, msg: &str);

    /// Called when an operation finishes; batching sinks emit here.
    fn flush(&self) {}
}

/// Forwards progress lines to the `log` crate at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct DebugLogger;

impl LogSink for DebugLogger {
    fn message(&self, msg: &str) {
        log::debug!("{msg}");
    }
}

/// Collects lines and hands them to the inner sink in one batch on flush,
/// so workers processing different images don't interleave their output.
pub struct BufferedLog {
    inner: Arc<dyn LogSink>,
    lines: Mutex<Vec<String>>,
}

impl BufferedLog {
    pub fn new(inner: Arc<dyn LogSink>) -> Self {
        Self {
            inner,
            lines: Mutex::new(Vec::new()),
        }
    }
}

impl LogSink for BufferedLog {
    fn message(&self, msg: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(msg.to_owned());
        }
    }

    fn flush(&self) {
        let drained = match self.lines.lock() {
            Ok(mut lines) => std::mem::take(&mut *lines),
            Err(_) => return,
        };
        for line in &drained {
            self.inner.message(line);
        }
        self.inner.flush();
    }
}

impl Drop for BufferedLog {
    fn drop(&mut self) {
        self.flush();
    }
}
