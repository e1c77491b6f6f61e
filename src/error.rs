use thiserror::Error;

use crate::document::{DocumentUri, LoginHostDocument};
use crate::terminal::TerminalError;

/// Failures reported by the resource lookup service.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("hostname {hostname:?} matches more than one server")]
    AmbiguousHostname { hostname: String },
    #[error("cluster credentials have expired")]
    CredentialsExpired,
    #[error("resource lookup failed: {0}")]
    Service(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not resolve the session target: {0}")]
    Lookup(#[from] LookupError),
    #[error(transparent)]
    Terminal(#[from] TerminalError),
    #[error("session attempt was superseded by a newer attempt")]
    Superseded,
}

impl SessionError {
    pub fn is_superseded(&self) -> bool {
        matches!(self, SessionError::Superseded)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {0} not found")]
    NotFound(DocumentUri),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("document encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
}

/// An SSH document that still carries an unparsed `login@host`.
///
/// Handed back by `LaunchableDocument::try_from` so the caller can resolve it.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("document {} still has an unresolved login host {:?}", .0.uri, .0.login_host)]
pub struct UnresolvedDocument(pub LoginHostDocument);
