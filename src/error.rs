//! Error types for the signal/collect engine
//!
//! Recoverable faults (undeliverable signals, mutations on missing vertices,
//! panics inside vertex callbacks) are absorbed at the worker and surface only
//! through logging, so a single vertex cannot poison convergence. The variants
//! here are the unrecoverable remainder that reaches the caller.

use thiserror::Error;

/// Errors that can occur while building or driving a graph computation.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Invalid graph or execution configuration, rejected at build time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A message could not be handed to its destination actor.
    #[error("Message delivery failed: {0}")]
    Delivery(String),

    /// The receiving actor dropped a reply channel before answering.
    #[error("Request dropped by {actor}: {context}")]
    RequestDropped { actor: String, context: String },

    /// An aggregation result did not carry the expected type.
    #[error("Aggregation error: {0}")]
    Aggregation(String),

    /// A worker or node failed in a way the engine cannot absorb;
    /// the job is aborted and partial statistics are returned where possible.
    #[error("Execution aborted: {0}")]
    Aborted(String),
}

impl GraphError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a delivery error
    pub fn delivery(message: impl Into<String>) -> Self {
        Self::Delivery(message.into())
    }

    /// Create a dropped-request error
    pub fn request_dropped(actor: impl Into<String>, context: impl Into<String>) -> Self {
        Self::RequestDropped {
            actor: actor.into(),
            context: context.into(),
        }
    }

    /// Create an aggregation error
    pub fn aggregation(message: impl Into<String>) -> Self {
        Self::Aggregation(message.into())
    }

    /// Create an abort error
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted(message.into())
    }

    /// Check if the error is recoverable by retrying the operation
    ///
    /// Delivery failures can be transient during shutdown races; everything
    /// else is terminal for the running job.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, GraphError::Delivery(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Ensure errors are Send + Sync (compile-time check)
    static_assertions::assert_impl_all!(GraphError: Send, Sync);

    #[test]
    fn test_error_display() {
        let err = GraphError::config("numberOfWorkers must be > 0");
        assert_eq!(
            format!("{}", err),
            "Configuration error: numberOfWorkers must be > 0"
        );
    }

    #[test]
    fn test_request_dropped() {
        let err = GraphError::request_dropped("worker 3", "collect step");
        match err {
            GraphError::RequestDropped { actor, context } => {
                assert_eq!(actor, "worker 3");
                assert_eq!(context, "collect step");
            }
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_is_recoverable() {
        assert!(GraphError::delivery("mailbox closed").is_recoverable());

        assert!(!GraphError::config("bad").is_recoverable());
        assert!(!GraphError::aborted("worker panicked").is_recoverable());
        assert!(!GraphError::aggregation("type mismatch").is_recoverable());
    }
}
