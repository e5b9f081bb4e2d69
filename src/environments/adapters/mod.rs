pub mod buildah;
pub mod podman;
pub mod repository;

use thiserror::Error;

use crate::process::ProcessError;
use crate::signals::Cancellation;

pub use buildah::Buildah;
pub use podman::Podman;
pub use repository::{ContainerRegistry, ImageRegistry, Registry};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("failed to decode output of `{command}`: {source}")]
    Decode {
        command: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("build context i/o failed: {0}")]
    Context(#[from] std::io::Error),
    #[error("context layer '{name}' failed: {source}")]
    ContextHook {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("container {0} has no build context")]
    MissingContext(String),
    #[error("FROM {0} may only start an image declaration")]
    MisplacedFrom(String),
    #[error("`{0}` did not print a container id")]
    MissingContainerId(String),
    #[error("interrupted by termination request")]
    Interrupted,
}

impl BackendError {
    /// True for a termination request, whether it was noticed between
    /// backend calls or killed one that was running.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Interrupted => true,
            Self::Process(error) => error.is_interrupted(),
            _ => false,
        }
    }
}

/// Fails with [`BackendError::Interrupted`] once `cancellation` fired.
pub(crate) fn check_interrupted(cancellation: Option<&Cancellation>) -> Result<(), BackendError> {
    match cancellation {
        Some(token) if token.is_cancelled() => Err(BackendError::Interrupted),
        _ => Ok(()),
    }
}

/// Splits `KEY=VALUE` entries as printed by image inspection.
pub(crate) fn parse_env_entries<'e, I>(entries: I) -> std::collections::BTreeMap<String, String>
where
    I: IntoIterator<Item = &'e serde_json::Value>,
{
    entries
        .into_iter()
        .filter_map(serde_json::Value::as_str)
        .filter_map(|entry| entry.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
