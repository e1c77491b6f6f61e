//! Terminal documents: the UI's persisted description of a session's intent and status.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::services::DocumentStore;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentUri(pub String);

impl DocumentUri {
    pub fn new() -> Self {
        Self(format!("/docs/{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DocumentUri {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentUri {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// `/clusters/<root>` or `/clusters/<root>/leaves/<leaf>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterUri(String);

impl ClusterUri {
    pub fn new(root_cluster_id: &str, leaf_cluster_id: Option<&str>) -> Self {
        match leaf_cluster_id {
            Some(leaf) => Self(format!("/clusters/{root_cluster_id}/leaves/{leaf}")),
            None => Self(format!("/clusters/{root_cluster_id}")),
        }
    }

    pub fn server_uri(&self, server_id: &str) -> String {
        format!("{}/servers/{server_id}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Connecting,
    Connected,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellDocument {
    pub uri: DocumentUri,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cluster_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_cluster_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Runs once in the first process spawned for this document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_command: Option<String>,
    /// Carried for the UI; shells are not status-tracked by the session core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DocumentStatus>,
    #[serde(default)]
    pub title: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginHostDocument {
    pub uri: DocumentUri,
    /// Unparsed `login@host` or bare host as typed by the user.
    pub login_host: String,
    pub root_cluster_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_cluster_id: Option<String>,
    pub status: DocumentStatus,
    #[serde(default)]
    pub title: String,
}

impl LoginHostDocument {
    pub fn cluster_uri(&self) -> ClusterUri {
        ClusterUri::new(&self.root_cluster_id, self.leaf_cluster_id.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshDocument {
    pub uri: DocumentUri,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    pub server_id: String,
    pub server_uri: String,
    pub root_cluster_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_cluster_id: Option<String>,
    #[serde(default)]
    pub title: String,
    pub status: DocumentStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeDocument {
    pub uri: DocumentUri,
    pub root_cluster_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_cluster_id: Option<String>,
    pub kube_id: String,
    pub kube_uri: String,
    pub kube_config_relative_path: String,
    #[serde(default)]
    pub title: String,
    pub status: DocumentStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Document {
    #[serde(rename = "doc.shell")]
    Shell(ShellDocument),
    #[serde(rename = "doc.ssh.loginHost")]
    SshLoginHost(LoginHostDocument),
    #[serde(rename = "doc.ssh.resolved")]
    Ssh(SshDocument),
    #[serde(rename = "doc.kube")]
    Kube(KubeDocument),
}

impl Document {
    pub fn uri(&self) -> &DocumentUri {
        match self {
            Document::Shell(doc) => &doc.uri,
            Document::SshLoginHost(doc) => &doc.uri,
            Document::Ssh(doc) => &doc.uri,
            Document::Kube(doc) => &doc.uri,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Document::Shell(_) => "doc.shell",
            Document::SshLoginHost(_) => "doc.ssh.loginHost",
            Document::Ssh(_) => "doc.ssh.resolved",
            Document::Kube(_) => "doc.kube",
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Document::Shell(doc) => &doc.title,
            Document::SshLoginHost(doc) => &doc.title,
            Document::Ssh(doc) => &doc.title,
            Document::Kube(doc) => &doc.title,
        }
    }

    /// Plain shells are exempt from status tracking.
    pub fn tracks_status(&self) -> bool {
        !matches!(self, Document::Shell(_))
    }

    pub fn status(&self) -> Option<DocumentStatus> {
        match self {
            Document::Shell(doc) => doc.status,
            Document::SshLoginHost(doc) => Some(doc.status),
            Document::Ssh(doc) => Some(doc.status),
            Document::Kube(doc) => Some(doc.status),
        }
    }

    pub fn init_command(&self) -> Option<&str> {
        match self {
            Document::Shell(doc) => doc.init_command.as_deref(),
            _ => None,
        }
    }

    /// Returns the document with `patch` merged into its serialized form.
    ///
    /// A patch may rewrite `kind`, which is how a login-host document becomes a resolved one.
    pub fn apply_patch(&self, patch: &DocumentPatch) -> Result<Document, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        patch.apply_to(&mut value);
        serde_json::from_value(value)
    }
}

/// A JSON merge patch (RFC 7396) over a serialized [`Document`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DocumentPatch(Map<String, Value>);

impl DocumentPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn remove(mut self, field: &str) -> Self {
        self.0.insert(field.to_string(), Value::Null);
        self
    }

    pub fn status(status: DocumentStatus) -> Self {
        let value = serde_json::to_value(status).unwrap_or(Value::Null);
        Self::new().set("status", value)
    }

    pub fn cwd_and_title(cwd: Option<String>, title: String) -> Self {
        let patch = Self::new().set("title", title);
        match cwd {
            Some(cwd) => patch.set("cwd", cwd),
            None => patch,
        }
    }

    pub fn clear_init_command() -> Self {
        Self::new().remove("initCommand")
    }

    /// Turns a login-host document into `doc`, dropping the unparsed `loginHost`.
    pub fn resolved(doc: &SshDocument) -> Self {
        let patch = Self::new()
            .set("kind", "doc.ssh.resolved")
            .set("serverId", doc.server_id.clone())
            .set("serverUri", doc.server_uri.clone())
            .set("title", doc.title.clone())
            .remove("loginHost");
        match &doc.login {
            Some(login) => patch.set("login", login.clone()),
            None => patch.remove("login"),
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn apply_to(&self, target: &mut Value) {
        merge(target, &self.0);
    }
}

fn merge(target: &mut Value, patch: &Map<String, Value>) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return;
    };
    for (key, value) in patch {
        match value {
            Value::Null => {
                map.remove(key);
            }
            Value::Object(nested) => {
                merge(map.entry(key.clone()).or_insert(Value::Null), nested);
            }
            other => {
                map.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Write-through handle on the document a session works on.
///
/// Every update lands on the session's local copy and is forwarded to the store, so
/// later steps of the same attempt read what earlier steps wrote without a store round trip.
#[derive(Clone)]
pub struct SessionDocument {
    uri: DocumentUri,
    local: Arc<Mutex<Document>>,
    store: Arc<dyn DocumentStore>,
}

impl SessionDocument {
    pub fn new(document: Document, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            uri: document.uri().clone(),
            local: Arc::new(Mutex::new(document)),
            store,
        }
    }

    pub fn uri(&self) -> &DocumentUri {
        &self.uri
    }

    pub fn snapshot(&self) -> Document {
        self.lock().clone()
    }

    pub fn update(&self, patch: DocumentPatch) {
        {
            let mut local = self.lock();
            match local.apply_patch(&patch) {
                Ok(next) => *local = next,
                Err(err) => warn!(uri = %self.uri, %err, "document patch did not apply to the session copy"),
            }
        }
        self.store.update(&self.uri, patch);
    }

    /// No-op for documents that do not track status.
    pub fn set_status(&self, status: DocumentStatus) {
        if self.lock().tracks_status() {
            self.update(DocumentPatch::status(status));
        }
    }

    pub fn close(&self) {
        self.store.close(&self.uri);
    }

    fn lock(&self) -> MutexGuard<'_, Document> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
