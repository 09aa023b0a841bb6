//! Device endpoints driven by workers.
//!
//! Each endpoint pairs a command handler with a link trait standing in for
//! the vendor binding. Links are owned by the handler and passed explicitly;
//! nothing here holds process-wide connection state.

pub mod arm;
pub mod serial;

/// Errors talking to a device link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The controller rejected a call.
    #[error("{operation} failed: {message}")]
    Call { operation: String, message: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl LinkError {
    pub fn call(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Call {
            operation: operation.into(),
            message: message.into(),
        }
    }
}
