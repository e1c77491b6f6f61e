//! Terminal session orchestration for OpsPad workspace documents.
//!
//! A [`TerminalSession`] takes a shell, SSH or Kubernetes document, resolves an
//! unresolved `login@host` target against the cluster, builds the launch command,
//! starts a PTY process and keeps the document's status in step with it.

mod arch;
pub mod command;
pub mod config;
pub mod db;
pub mod document;
pub mod error;
pub mod resolver;
pub mod retry;
pub mod services;
pub mod session;
pub mod terminal;

pub use crate::command::{build_command, ClusterContext, Command, LaunchableDocument};
pub use crate::config::SessionConfig;
pub use crate::db::Db;
pub use crate::document::{
    ClusterUri, Document, DocumentPatch, DocumentStatus, DocumentUri, SessionDocument,
};
pub use crate::error::{LookupError, SessionError, StoreError, UnresolvedDocument};
pub use crate::resolver::{parse_login_host, HostResolver};
pub use crate::retry::{NoRetry, Relogin, ReloginOnExpiry, RetryWithRelogin};
pub use crate::services::{
    DocumentStore, InMemoryDocumentStore, Notification, NotificationSink, Protocol,
    ResourceLookup, Server, SessionServices, UsageSink,
};
pub use crate::session::{Attempt, AttemptStatus, LaunchInfo, TerminalSession};
pub use crate::terminal::session_manager::{
    CreatedProcess, CreationStatus, ProcessEvent, ProcessFactory, PtyProcess,
};
pub use crate::terminal::{PortablePtyProcessFactory, ProcessSession, TerminalError, TerminalManager};
