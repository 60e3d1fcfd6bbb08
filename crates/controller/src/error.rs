use std::time::Duration;

use loom_core::LoomError;
use loom_realizer::RealizeError;
use loom_runnable::RunnableError;
use loom_store::StoreError;

/// A reconcile that did not finish cleanly. Handled failures (missing templates, failed
/// deployments, rejected objects) are written to status and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Realize(#[from] RealizeError),
    #[error(transparent)]
    Run(#[from] RunnableError),
    #[error(transparent)]
    Internal(#[from] LoomError),
    #[error("reconcile did not finish within {0:?}")]
    Deadline(Duration),
    #[error("reconcile cancelled")]
    Cancelled,
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Store(e) => e.is_retryable(),
            ReconcileError::Realize(e) => e.is_retryable(),
            ReconcileError::Run(e) => e.is_retryable(),
            ReconcileError::Internal(_) => false,
            ReconcileError::Deadline(_) | ReconcileError::Cancelled => true,
        }
    }
}
