pub mod bootstrap;
pub mod ensure;
pub mod handlers;
pub mod messagebus;
pub mod unit_of_work;

use thiserror::Error;

use super::adapters::BackendError;
use super::domain::CommandKind;

pub use bootstrap::bootstrap;
pub use messagebus::{BusError, BusReport, MessageBus};
pub use unit_of_work::{Committed, Transaction, UnitOfWork};

#[derive(Debug, Error)]
pub enum HandlerError {
    /// A precondition the user can fix; the bus reports it instead of failing.
    #[error("could not find image '{0}'")]
    ImageNotFound(String),
    #[error("image declaration for '{0}' has no FROM layer")]
    MissingBase(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("handler for {expected:?} received {received:?}")]
    Misrouted {
        expected: CommandKind,
        received: CommandKind,
    },
}

impl HandlerError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Backend(error) if error.is_interrupted())
    }
}
