use herald_registry::RegistryError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Beginning a transaction failed (injected).
    #[error("registry unavailable: cannot begin transaction")]
    BeginFailed,

    /// Committing a transaction failed (injected).
    #[error("registry unavailable: commit failed")]
    CommitFailed,

    /// Reading a record failed (injected).
    #[error("registry unavailable: read failed")]
    ReadFailed,
}

impl RegistryError for Error {}
