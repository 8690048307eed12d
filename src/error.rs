//! Error types and the central error-reporting hook

use crate::backend::BackendError;
use crate::backend::shader::ShaderError;
use parking_lot::Mutex;
use thiserror::Error;

/// Errors raised by the reference-counted handlers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{kind} `{label}` released more times than it was handled")]
    OverRelease { kind: &'static str, label: String },
    #[error("invalid {kind} `{label}`: {reason}")]
    InvalidDescriptor {
        kind: &'static str,
        label: String,
        reason: String,
    },
}

/// Top-level error type of the crate
#[derive(Error, Debug, Clone)]
pub enum RenderError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error("{owner}: missing {dependency}")]
    MissingDependency { owner: String, dependency: String },
    #[error("uniform `{name}` holds {expected} bytes but the value has {actual}")]
    UniformSizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("write of {len} bytes at offset {offset} does not fit in {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("no frame is being rendered")]
    NoActiveFrame,
    #[error("command `{command}` panicked: {message}")]
    CommandPanicked { command: String, message: String },
}

pub type RenderResult<T> = Result<T, RenderError>;

impl RenderError {
    pub(crate) fn missing(owner: impl Into<String>, dependency: impl Into<String>) -> Self {
        RenderError::MissingDependency {
            owner: owner.into(),
            dependency: dependency.into(),
        }
    }
}

/// Receives every recoverable failure: skipped bindings, failed commands,
/// over-releases.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &RenderError);
}

/// Reporter that forwards to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, error: &RenderError) {
        match error {
            RenderError::MissingDependency { .. } | RenderError::UniformSizeMismatch { .. } => {
                log::warn!("{error}")
            }
            _ => log::error!("{error}"),
        }
    }
}

/// Reporter that keeps every report in memory, and logs it as well.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    reports: Mutex<Vec<RenderError>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything reported so far, oldest first
    pub fn reports(&self) -> Vec<RenderError> {
        self.reports.lock().clone()
    }

    pub fn take(&self) -> Vec<RenderError> {
        std::mem::take(&mut *self.reports.lock())
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, error: &RenderError) {
        LogReporter.report(error);
        self.reports.lock().push(error.clone());
    }
}

/// Turns a panic payload into something printable.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_reporter_keeps_order() {
        let reporter = CollectingReporter::new();
        reporter.report(&RenderError::missing("object", "attribute `uv`"));
        reporter.report(&RenderError::NoActiveFrame);

        let reports = reporter.reports();
        assert_eq!(reports.len(), 2);
        assert!(matches!(reports[0], RenderError::MissingDependency { .. }));
        assert!(matches!(reports[1], RenderError::NoActiveFrame));

        assert_eq!(reporter.take().len(), 2);
        assert!(reporter.is_empty());
    }

    #[test]
    fn test_error_display() {
        let err = RenderError::from(HandlerError::OverRelease {
            kind: "data buffer",
            label: "positions".into(),
        });
        assert_eq!(
            err.to_string(),
            "data buffer `positions` released more times than it was handled"
        );

        let err = RenderError::missing("rendered object `tri`", "program input `normal`");
        assert_eq!(err.to_string(), "rendered object `tri`: missing program input `normal`");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }
}
