//! CLI error types.

use keyratchet_core::storage::StorageError;
use thiserror::Error;

/// Errors from maintenance commands.
#[derive(Error, Debug)]
pub enum CliError {
    /// The store failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Waiting for the shutdown signal failed
    #[error("signal handling failed: {0}")]
    Signal(#[from] std::io::Error),
}
