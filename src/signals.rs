//! Process termination handling.
//!
//! A single process-wide handler flips a shared [`Cancellation`] token on
//! SIGINT/SIGTERM. Long-running operations poll the token between blocking
//! steps and unwind through their scope guards, so cleanup runs on the
//! normal drop path instead of from inside the signal handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

/// Exit status used when the harness stops because of a termination signal.
pub const TERMINATION_EXIT_CODE: i32 = 15;

#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("failed to install termination handler: {0}")]
    Install(#[from] ctrlc::Error),
}

/// Installs the termination handler and returns the token it cancels.
///
/// Can only be called once per process.
pub fn install_termination_handler() -> Result<Cancellation, SignalError> {
    let token = Cancellation::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        warn!("termination requested, finishing the current step before cleanup");
        handler_token.cancel();
    })?;
    Ok(token)
}
