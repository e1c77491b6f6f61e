//! Collaborators the session core talks to but does not own.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::document::{ClusterUri, Document, DocumentPatch, DocumentUri};
use crate::error::LookupError;
use crate::retry::RetryWithRelogin;
use crate::terminal::session_manager::ProcessFactory;

/// Persists document fields and re-renders whatever shows them.
///
/// Both operations are fire-and-forget; implementations log their own failures.
pub trait DocumentStore: Send + Sync {
    fn update(&self, uri: &DocumentUri, patch: DocumentPatch);
    fn close(&self, uri: &DocumentUri);
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub uri: String,
    /// Server identifier used to address the node.
    pub name: String,
    pub hostname: String,
}

#[async_trait]
pub trait ResourceLookup: Send + Sync {
    /// `Ok(None)` when no server carries `hostname`.
    async fn get_server_by_hostname(
        &self,
        cluster_uri: &ClusterUri,
        hostname: &str,
    ) -> Result<Option<Server>, LookupError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub description: String,
}

pub trait NotificationSink: Send + Sync {
    fn notify_warning(&self, notification: Notification);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Ssh,
    Kube,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Ssh => "ssh",
            Protocol::Kube => "kube",
        }
    }
}

pub trait UsageSink: Send + Sync {
    fn capture_protocol_use(&self, cluster_uri: &ClusterUri, protocol: Protocol);
}

/// Everything a [`crate::session::TerminalSession`] needs from the outside world.
#[derive(Clone)]
pub struct SessionServices {
    pub store: Arc<dyn DocumentStore>,
    pub lookup: Arc<dyn ResourceLookup>,
    pub retry: Arc<dyn RetryWithRelogin>,
    pub processes: Arc<dyn ProcessFactory>,
    pub notifications: Arc<dyn NotificationSink>,
    pub usage: Arc<dyn UsageSink>,
}

/// Workspace document store kept in memory, in tab order.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: Mutex<Vec<Document>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, document: Document) {
        let mut documents = self.lock();
        documents.retain(|doc| doc.uri() != document.uri());
        documents.push(document);
    }

    pub fn get(&self, uri: &DocumentUri) -> Option<Document> {
        self.lock().iter().find(|doc| doc.uri() == uri).cloned()
    }

    pub fn contains(&self, uri: &DocumentUri) -> bool {
        self.lock().iter().any(|doc| doc.uri() == uri)
    }

    pub fn list(&self) -> Vec<Document> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Document>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn update(&self, uri: &DocumentUri, patch: DocumentPatch) {
        let mut documents = self.lock();
        let Some(doc) = documents.iter_mut().find(|doc| doc.uri() == uri) else {
            debug!(%uri, "ignoring update for a document no longer in the workspace");
            return;
        };
        match doc.apply_patch(&patch) {
            Ok(next) => *doc = next,
            Err(err) => warn!(%uri, %err, "rejected document patch"),
        }
    }

    fn close(&self, uri: &DocumentUri) {
        self.lock().retain(|doc| doc.uri() != uri);
    }
}
