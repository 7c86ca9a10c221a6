/// Ribflow Error Types
///
/// Errors cover recoverable, reportable failures: configuration problems
/// and shutdown races. Contract violations between tasks are assertions,
/// not errors (the caller is expected to serialize its own state machine),
/// and a blocked peer is a normal state, not an error.

use thiserror::Error;

/// Main error type for Ribflow operations
#[derive(Error, Debug)]
pub enum RibflowError {
    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Partition index outside the configured partition space
    #[error("Partition {index} out of range (count: {count})")]
    PartitionOutOfRange { index: usize, count: usize },

    /// An event or notification channel was closed during shutdown
    #[error("Channel closed")]
    ChannelClosed,
}

/// Result type alias for Ribflow operations
pub type Result<T> = std::result::Result<T, RibflowError>;

impl RibflowError {
    /// Create a config error with a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this error indicates shutdown rather than misuse
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::ChannelClosed)
    }
}
