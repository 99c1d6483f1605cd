//! Runtime Error Types
//!
//! Error handling for task outcomes, executor failures and isolation
//! contract violations. Cancellation is a distinct outcome, not a failure.

use crate::registry::DomainId;
use thiserror::Error;

/// Main runtime error type
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The task was cancelled before it produced a value
    #[error("Task cancelled")]
    Cancelled,

    /// An awaited dependency failed
    #[error("Operation failed: {message}")]
    Operation {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A continuation panicked while running on its executor
    #[error("Task panicked: {message}")]
    Panicked { message: String },

    /// The awaited task lost a race against its timer
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Actor state touched from outside the actor's own domain
    #[error("Isolation violation: {message} (expected {expected}, running on {actual:?})")]
    IsolationViolation {
        message: String,
        expected: DomainId,
        actual: Option<DomainId>,
    },

    /// Domain resolution errors
    #[error("Domain error: {message}")]
    Domain { message: String },

    /// Executor lifecycle errors
    #[error("Executor error: {executor}: {message}")]
    Executor { executor: String, message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    /// Create an operation error
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation {
            message: message.into(),
            source: None,
        }
    }

    /// Create an operation error with source
    pub fn operation_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Operation {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a panic error
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::Panicked {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an isolation violation
    pub fn isolation_violation(
        message: impl Into<String>,
        expected: DomainId,
        actual: Option<DomainId>,
    ) -> Self {
        Self::IsolationViolation {
            message: message.into(),
            expected,
            actual,
        }
    }

    /// Create a domain error
    pub fn domain(message: impl Into<String>) -> Self {
        Self::Domain {
            message: message.into(),
        }
    }

    /// Create an executor error
    pub fn executor(executor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Executor {
            executor: executor.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Check if this is the cancellation outcome
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RuntimeError::Cancelled)
    }

    /// Check if the caller may reasonably retry
    pub fn is_retryable(&self) -> bool {
        match self {
            RuntimeError::Operation { .. } => true,
            RuntimeError::Timeout { .. } => true,
            RuntimeError::Cancelled => false,
            RuntimeError::Panicked { .. } => false,
            RuntimeError::IsolationViolation { .. } => false,
            RuntimeError::Domain { .. } => false,
            RuntimeError::Executor { .. } => false,
            RuntimeError::Configuration { .. } => false,
        }
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            RuntimeError::Cancelled => "cancelled",
            RuntimeError::Operation { .. } => "operation",
            RuntimeError::Panicked { .. } => "panicked",
            RuntimeError::Timeout { .. } => "timeout",
            RuntimeError::IsolationViolation { .. } => "isolation_violation",
            RuntimeError::Domain { .. } => "domain",
            RuntimeError::Executor { .. } => "executor",
            RuntimeError::Configuration { .. } => "configuration",
        }
    }
}

// Custom Clone implementation since Box<dyn Error> doesn't implement Clone.
// A task's result slot is read by every waiter, so errors must be cloneable.
impl Clone for RuntimeError {
    fn clone(&self) -> Self {
        match self {
            RuntimeError::Cancelled => RuntimeError::Cancelled,
            RuntimeError::Operation { message, source } => RuntimeError::Operation {
                // Keep the source text; the source itself is not cloneable
                message: match source {
                    Some(source) => format!("{}: {}", message, source),
                    None => message.clone(),
                },
                source: None,
            },
            RuntimeError::Panicked { message } => RuntimeError::Panicked {
                message: message.clone(),
            },
            RuntimeError::Timeout {
                operation,
                timeout_ms,
            } => RuntimeError::Timeout {
                operation: operation.clone(),
                timeout_ms: *timeout_ms,
            },
            RuntimeError::IsolationViolation {
                message,
                expected,
                actual,
            } => RuntimeError::IsolationViolation {
                message: message.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            },
            RuntimeError::Domain { message } => RuntimeError::Domain {
                message: message.clone(),
            },
            RuntimeError::Executor { executor, message } => RuntimeError::Executor {
                executor: executor.clone(),
                message: message.clone(),
            },
            RuntimeError::Configuration { message, field } => RuntimeError::Configuration {
                message: message.clone(),
                field: field.clone(),
            },
        }
    }
}

/// Best-effort text of a panic payload
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
    fn test_cancellation_is_distinct() {
        let err = RuntimeError::Cancelled;
        assert!(err.is_cancelled());
        assert!(!err.is_retryable());
        assert_eq!(err.category(), "cancelled");

        let failure = RuntimeError::operation("fetch failed");
        assert!(!failure.is_cancelled());
        assert!(failure.is_retryable());
    }

    #[test]
    fn test_clone_keeps_source_text() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "connection reset");
        let err = RuntimeError::operation_with_source("download", io);
        let cloned = err.clone();

        assert_eq!(cloned.category(), "operation");
        assert!(cloned.to_string().contains("connection reset"));
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(payload.as_ref()), "kaboom");
    }
}
