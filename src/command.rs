//! Builds the concrete command for a launchable document.

use serde::{Deserialize, Serialize};

use crate::document::{ClusterUri, Document, KubeDocument, ShellDocument, SshDocument};
use crate::error::UnresolvedDocument;
use crate::services::Protocol;

/// The root cluster a session runs against, as known by the owning UI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterContext {
    pub proxy_host: String,
    pub cluster_name: String,
}

/// A document whose target is concrete enough to build a command from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LaunchableDocument {
    Shell(ShellDocument),
    Ssh(SshDocument),
    Kube(KubeDocument),
}

impl TryFrom<Document> for LaunchableDocument {
    type Error = UnresolvedDocument;

    fn try_from(document: Document) -> Result<Self, Self::Error> {
        match document {
            Document::Shell(doc) => Ok(LaunchableDocument::Shell(doc)),
            Document::Ssh(doc) => Ok(LaunchableDocument::Ssh(doc)),
            Document::Kube(doc) => Ok(LaunchableDocument::Kube(doc)),
            Document::SshLoginHost(doc) => Err(UnresolvedDocument(doc)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshLoginCommand {
    pub proxy_host: String,
    pub cluster_name: String,
    pub login: Option<String>,
    pub server_id: String,
    pub root_cluster_id: String,
    pub leaf_cluster_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubeLoginCommand {
    pub kube_id: String,
    pub kube_config_relative_path: String,
    pub root_cluster_id: String,
    pub leaf_cluster_id: Option<String>,
    pub proxy_host: String,
    pub cluster_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellCommand {
    pub proxy_host: String,
    pub cluster_name: String,
    pub cwd: Option<String>,
    pub init_command: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    SshLogin(SshLoginCommand),
    KubeLogin(KubeLoginCommand),
    Shell(ShellCommand),
}

impl Command {
    pub fn cluster_name(&self) -> &str {
        match self {
            Command::SshLogin(cmd) => &cmd.cluster_name,
            Command::KubeLogin(cmd) => &cmd.cluster_name,
            Command::Shell(cmd) => &cmd.cluster_name,
        }
    }

    pub fn init_command(&self) -> Option<&str> {
        match self {
            Command::Shell(cmd) => cmd.init_command.as_deref(),
            _ => None,
        }
    }

    /// Protocol usage to report for this command; shells report none.
    pub fn protocol_use(&self) -> Option<(ClusterUri, Protocol)> {
        match self {
            Command::SshLogin(cmd) => Some((
                ClusterUri::new(&cmd.root_cluster_id, cmd.leaf_cluster_id.as_deref()),
                Protocol::Ssh,
            )),
            Command::KubeLogin(cmd) => Some((
                ClusterUri::new(&cmd.root_cluster_id, cmd.leaf_cluster_id.as_deref()),
                Protocol::Kube,
            )),
            Command::Shell(_) => None,
        }
    }
}

pub fn build_command(document: &LaunchableDocument, cluster: &ClusterContext) -> Command {
    let ClusterContext {
        proxy_host,
        cluster_name,
    } = cluster.clone();

    match document {
        LaunchableDocument::Ssh(doc) => Command::SshLogin(SshLoginCommand {
            proxy_host,
            cluster_name,
            login: doc.login.clone(),
            server_id: doc.server_id.clone(),
            root_cluster_id: doc.root_cluster_id.clone(),
            leaf_cluster_id: doc.leaf_cluster_id.clone(),
        }),
        LaunchableDocument::Kube(doc) => Command::KubeLogin(KubeLoginCommand {
            kube_id: doc.kube_id.clone(),
            kube_config_relative_path: doc.kube_config_relative_path.clone(),
            root_cluster_id: doc.root_cluster_id.clone(),
            leaf_cluster_id: doc.leaf_cluster_id.clone(),
            proxy_host,
            cluster_name,
        }),
        LaunchableDocument::Shell(doc) => Command::Shell(ShellCommand {
            proxy_host,
            cluster_name,
            cwd: doc.cwd.clone(),
            init_command: doc.init_command.clone(),
        }),
    }
}
