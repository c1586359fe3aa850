//! Deferred cleanup that runs on every exit path.
//!
//! The scenario mutates platform-wide state, so restoring it can't depend on
//! the test body reaching its last line. [`with_cleanup`] runs the body in
//! its own task, which turns a failed assertion into a `JoinError` instead of
//! unwinding straight past the cleanup, then awaits the cleanup, then hands
//! back the body's value or re-raises its panic.
//!
//! Nested calls unwind innermost first, like stacked defers.

use std::fmt::Display;
use std::future::Future;
use thiserror::Error;
use tracing::{error, warn};

/// Cleanup errors.
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("Cleanup '{label}' failed: {message}")]
    Failed { label: String, message: String },

    #[error("Task for '{label}' was cancelled before completing")]
    Cancelled { label: String },
}

/// Run `body`, then `cleanup` no matter how `body` ended.
///
/// - `body` returns: cleanup runs, its failure is returned as an error.
/// - `body` panics: cleanup runs, a cleanup failure is logged, and the
///   original panic is resumed so the test still reports it.
pub async fn with_cleanup<T, B, C, E>(label: &str, body: B, cleanup: C) -> Result<T, CleanupError>
where
    T: Send + 'static,
    B: Future<Output = T> + Send + 'static,
    C: Future<Output = Result<(), E>>,
    E: Display,
{
    let outcome = tokio::spawn(body).await;

    let cleanup_result = cleanup.await;

    match outcome {
        Ok(value) => match cleanup_result {
            Ok(()) => Ok(value),
            Err(e) => {
                error!(label, error = %e, "Cleanup failed");
                Err(CleanupError::Failed {
                    label: label.to_string(),
                    message: e.to_string(),
                })
            }
        },
        Err(join_error) => {
            if let Err(e) = cleanup_result {
                error!(label, error = %e, "Cleanup failed after body panicked");
            }
            if join_error.is_panic() {
                warn!(label, "Body panicked; cleanup done, resuming panic");
                std::panic::resume_unwind(join_error.into_panic());
            }
            Err(CleanupError::Cancelled {
                label: label.to_string(),
            })
        }
    }
}
