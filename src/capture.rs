//! Output capture buffers installed as the interpreter's stdout/stderr.

use std::sync::{Arc, Mutex, PoisonError};

/// Appendable text sink with a drain operation.
///
/// Clones share the same underlying buffer, so one handle can be moved into
/// the interpreter's writer object while the engine keeps another to drain.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<String>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `text` to the buffer.
    pub fn write(&self, text: &str) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
    }

    /// Return everything written so far and clear the buffer.
    pub fn drain(&self) -> String {
        std::mem::take(&mut *self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}
