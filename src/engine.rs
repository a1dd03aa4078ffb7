//! Runs one snippet against the shared namespace and collects the result.

use serde::Serialize;
use tracing::debug;

use crate::capture::CaptureBuffer;
use crate::error::EngineError;
use crate::namespace::Namespace;

/// Result of one execution, as sent to clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "return")]
    pub return_value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl Outcome {
    /// Whether the executed code raised an unhandled exception.
    pub fn failed(&self) -> bool {
        self.traceback.is_some()
    }

    /// No output, no return value and no failure: nothing worth telling a
    /// websocket client.
    pub fn is_silent(&self) -> bool {
        !self.failed()
            && self.stdout.is_empty()
            && self.stderr.is_empty()
            && self.return_value.is_empty()
    }
}

/// Execute `code` in `namespace`.
///
/// Exceptions raised by `code` are caught and reported in
/// [`Outcome::traceback`]; output written before the exception is kept. Only
/// failures of the namespace bookkeeping itself are returned as errors.
pub fn run(namespace: &Namespace, code: &str) -> Result<Outcome, EngineError> {
    let stdout = CaptureBuffer::new();
    let stderr = CaptureBuffer::new();
    namespace.install_capture(&stdout, &stderr)?;
    namespace.reset_return_slot()?;

    let raised = namespace.execute(code).err();

    let (return_value, failure) = match namespace.take_return_slot()? {
        Ok(text) => (text, raised),
        Err(unprintable) => (String::new(), raised.or(Some(unprintable))),
    };

    let outcome = Outcome {
        stdout: stdout.drain(),
        stderr: stderr.drain(),
        return_value,
        traceback: failure.map(|f| f.traceback),
    };
    debug!(
        code_len = code.len(),
        failed = outcome.failed(),
        stdout_len = outcome.stdout.len(),
        stderr_len = outcome.stderr.len(),
        "execution finished"
    );
    Ok(outcome)
}
