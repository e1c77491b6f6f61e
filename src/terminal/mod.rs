mod portable_pty_backend;
pub mod session_manager;

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::document::{DocumentPatch, DocumentStatus, SessionDocument};
use crate::services::{Notification, NotificationSink, UsageSink};
use crate::terminal::session_manager::{
    CreatedProcess, CreationStatus, ProcessEvent, ProcessFactory, PtyProcess,
};

pub use crate::terminal::portable_pty_backend::{PortablePtyProcess, PortablePtyProcessFactory, SpawnSpec};

/// Title segment used when a shell's working directory is unknown.
pub const DEFAULT_CWD_LABEL: &str = "Terminal";

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("{0}")]
    ProgramNotFound(String),
    #[error("terminal backend error: {0}")]
    Backend(String),
}

/// A launched process together with the task wiring its events to the document.
///
/// Dropping it stops the wiring and terminates the process.
pub struct ProcessSession {
    process: Arc<dyn PtyProcess>,
    wiring: JoinHandle<()>,
    /// Shared with the wiring task; once set it makes no further document writes.
    retired: Arc<AtomicBool>,
}

impl ProcessSession {
    pub fn process_id(&self) -> &str {
        self.process.id()
    }

    pub fn dispose(self) {}
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        // Abort does not wait for a handler already running on another worker.
        self.retired.store(true, Ordering::SeqCst);
        self.wiring.abort();
        if let Err(err) = self.process.dispose() {
            warn!(process = self.process.id(), %err, "failed to dispose terminal process");
        }
    }
}

/// Spawns processes for built commands and keeps their documents in step with them.
pub struct TerminalManager {
    factory: Arc<dyn ProcessFactory>,
    notifications: Arc<dyn NotificationSink>,
    usage: Arc<dyn UsageSink>,
}

impl TerminalManager {
    pub fn new(
        factory: Arc<dyn ProcessFactory>,
        notifications: Arc<dyn NotificationSink>,
        usage: Arc<dyn UsageSink>,
    ) -> Self {
        Self {
            factory,
            notifications,
            usage,
        }
    }

    pub async fn launch(
        &self,
        command: &Command,
        document: &SessionDocument,
    ) -> Result<ProcessSession, TerminalError> {
        if let Some((cluster_uri, protocol)) = command.protocol_use() {
            self.usage.capture_protocol_use(&cluster_uri, protocol);
        }

        let CreatedProcess {
            process,
            events,
            creation_status,
        } = self.factory.create_process(command).await?;

        let wiring = EventWiring::new(command, document.clone(), Arc::clone(&process));
        let retired = Arc::clone(&wiring.retired);
        let session = ProcessSession {
            process,
            wiring: tokio::spawn(wiring.run(events)),
            retired,
        };

        if creation_status == CreationStatus::ShellEnvResolutionTimedOut {
            warn!(uri = %document.uri(), "shell environment probe timed out, launching with partial environment");
            self.notifications.notify_warning(Notification {
                title: "Could not source environment variables for shell session".to_string(),
                description: "Reading the environment of your login shell took too long. \
                    The session was started without it, so some variables may be missing."
                    .to_string(),
            });
        }

        info!(uri = %document.uri(), process = session.process_id(), "terminal process launched");
        Ok(session)
    }
}

/// Per-handle event state. The gates live here so each new handle starts fresh.
struct EventWiring {
    document: SessionDocument,
    process: Arc<dyn PtyProcess>,
    /// Set for shell commands, whose title follows the live working directory.
    shell_cluster_name: Option<String>,
    clears_init_command: bool,
    opened: bool,
    connected: bool,
    retired: Arc<AtomicBool>,
}

impl EventWiring {
    fn new(command: &Command, document: SessionDocument, process: Arc<dyn PtyProcess>) -> Self {
        let shell_cluster_name = match command {
            Command::Shell(cmd) => Some(cmd.cluster_name.clone()),
            _ => None,
        };
        Self {
            document,
            process,
            shell_cluster_name,
            clears_init_command: command.init_command().is_some(),
            opened: false,
            connected: false,
            retired: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ProcessEvent>) {
        while let Some(event) = events.recv().await {
            if self.handle(event).await.is_break() {
                break;
            }
        }
        debug!(uri = %self.document.uri(), process = self.process.id(), "terminal event stream ended");
    }

    async fn handle(&mut self, event: ProcessEvent) -> ControlFlow<()> {
        if self.is_retired() {
            debug!(uri = %self.document.uri(), process = self.process.id(), "ignoring event from a retired process");
            return ControlFlow::Break(());
        }
        match event {
            ProcessEvent::Open => {
                if !self.opened {
                    self.opened = true;
                    self.on_open().await;
                }
            }
            ProcessEvent::Data(_) => {
                if !self.connected {
                    self.connected = true;
                    self.document.set_status(DocumentStatus::Connected);
                }
            }
            ProcessEvent::Exit { exit_code } => {
                if exit_code == 0 {
                    info!(uri = %self.document.uri(), "terminal process exited cleanly, closing document");
                    self.document.close();
                } else {
                    // Left open so a failed connection stays visible.
                    info!(uri = %self.document.uri(), exit_code, "terminal process exited with an error");
                }
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_open(&self) {
        if let Some(cluster_name) = &self.shell_cluster_name {
            let cwd = match self.process.cwd().await {
                Ok(cwd) => cwd,
                Err(err) => {
                    debug!(process = self.process.id(), %err, "could not read working directory");
                    None
                }
            };
            // The handle may have been retired while the cwd was read.
            if self.is_retired() {
                return;
            }
            let title = format!("{} · {cluster_name}", cwd.as_deref().unwrap_or(DEFAULT_CWD_LABEL));
            self.document.update(DocumentPatch::cwd_and_title(cwd, title));
        }

        if self.clears_init_command {
            self.document.update(DocumentPatch::clear_init_command());
        }
    }
}
