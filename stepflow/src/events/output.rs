//! Sinks for process stdout and stderr.

use parking_lot::Mutex;
use tracing::info;

/// Receives bytes written by a running process.
pub trait OutputSink: Send + Sync {
    /// Writes a chunk of output. Never fails; implementations drop what they
    /// cannot deliver.
    fn write(&self, bytes: &[u8]);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn write(&self, _bytes: &[u8]) {}
}

/// Buffers everything in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    buf: Mutex<Vec<u8>>,
}

impl BufferSink {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything written so far.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }

    /// Returns everything written so far as lossy UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }
}

impl OutputSink for BufferSink {
    fn write(&self, bytes: &[u8]) {
        self.buf.lock().extend_from_slice(bytes);
    }
}

/// Forwards output to `tracing`, one event per chunk.
#[derive(Debug, Clone)]
pub struct TracingSink {
    stream: &'static str,
}

impl TracingSink {
    /// A sink labelled as stdout.
    #[must_use]
    pub const fn stdout() -> Self {
        Self { stream: "stdout" }
    }

    /// A sink labelled as stderr.
    #[must_use]
    pub const fn stderr() -> Self {
        Self { stream: "stderr" }
    }
}

impl OutputSink for TracingSink {
    fn write(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        info!(stream = self.stream, output = %text.trim_end(), "process output");
    }
}
