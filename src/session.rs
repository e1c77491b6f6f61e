//! Drives one terminal document from intent to a running process.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::{build_command, ClusterContext, Command, LaunchableDocument};
use crate::document::{Document, DocumentStatus, SessionDocument};
use crate::error::{SessionError, UnresolvedDocument};
use crate::resolver::HostResolver;
use crate::services::SessionServices;
use crate::terminal::{ProcessSession, TerminalManager};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchInfo {
    pub process_id: String,
    pub command: Command,
}

#[derive(Clone, Debug)]
pub enum AttemptStatus {
    Idle,
    Running,
    Success(LaunchInfo),
    Error(Arc<SessionError>),
}

/// One run of the session start state machine.
#[derive(Clone, Debug)]
pub struct Attempt {
    pub id: Uuid,
    pub status: AttemptStatus,
}

impl Attempt {
    fn new(status: AttemptStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            status,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, AttemptStatus::Running)
    }

    pub fn launch_info(&self) -> Option<&LaunchInfo> {
        match &self.status {
            AttemptStatus::Success(info) => Some(info),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&SessionError> {
        match &self.status {
            AttemptStatus::Error(err) => Some(err),
            _ => None,
        }
    }
}

struct SessionState {
    /// Bumped whenever a newer attempt (or teardown) supersedes the current one.
    generation: u64,
    attempt: Attempt,
    process: Option<ProcessSession>,
}

impl SessionState {
    /// Starts a fresh attempt and hands back the process it replaces.
    fn begin_attempt(&mut self) -> (u64, Option<ProcessSession>) {
        self.generation += 1;
        self.attempt = Attempt::new(AttemptStatus::Running);
        (self.generation, self.process.take())
    }
}

/// An attempt that has been marked running but has not settled yet.
///
/// If its future is dropped before settling, the attempt goes back to idle so a later
/// `start` can begin a new one.
struct PendingAttempt<'a> {
    session: &'a TerminalSession,
    generation: u64,
}

impl PendingAttempt<'_> {
    async fn run(self) -> Attempt {
        self.session.run_attempt(self.generation).await
    }
}

impl Drop for PendingAttempt<'_> {
    fn drop(&mut self) {
        let mut state = self.session.lock_state();
        if state.generation == self.generation && state.attempt.is_running() {
            debug!(uri = %self.session.document.uri(), "attempt dropped before it settled");
            state.attempt = Attempt::new(AttemptStatus::Idle);
        }
    }
}

/// Session orchestrator for a single terminal document.
///
/// At most one attempt is current. A reconnect supersedes whatever attempt is in flight;
/// the superseded attempt notices at its next suspension point and stops without
/// launching or writing status.
pub struct TerminalSession {
    document: SessionDocument,
    cluster: ClusterContext,
    resolver: HostResolver,
    terminal: TerminalManager,
    state: Mutex<SessionState>,
    /// Serializes resolution so a document is resolved at most once.
    resolution: tokio::sync::Mutex<()>,
}

impl TerminalSession {
    pub fn new(document: Document, cluster: ClusterContext, services: SessionServices) -> Self {
        let SessionServices {
            store,
            lookup,
            retry,
            processes,
            notifications,
            usage,
        } = services;

        Self {
            document: SessionDocument::new(document, store),
            cluster,
            resolver: HostResolver::new(lookup, retry),
            terminal: TerminalManager::new(processes, notifications, usage),
            state: Mutex::new(SessionState {
                generation: 0,
                attempt: Attempt::new(AttemptStatus::Idle),
                process: None,
            }),
            resolution: tokio::sync::Mutex::new(()),
        }
    }

    pub fn document(&self) -> &SessionDocument {
        &self.document
    }

    pub fn attempt(&self) -> Attempt {
        self.lock_state().attempt.clone()
    }

    /// Starts an attempt unless one is already running, in which case the running
    /// attempt is returned as-is.
    pub fn start(&self) -> impl Future<Output = Attempt> + Send + '_ {
        let begun = {
            let mut state = self.lock_state();
            if state.attempt.is_running() {
                None
            } else {
                Some(state.begin_attempt())
            }
        };
        let pending = begun.map(|(generation, previous)| {
            drop(previous);
            PendingAttempt {
                session: self,
                generation,
            }
        });

        async move {
            match pending {
                Some(pending) => pending.run().await,
                None => {
                    debug!(uri = %self.document.uri(), "session start ignored, an attempt is already running");
                    self.attempt()
                }
            }
        }
    }

    /// Marks the document `connecting` and disposes the current process before returning;
    /// the new attempt runs when the returned future is polled.
    pub fn reconnect(&self) -> impl Future<Output = Attempt> + Send + '_ {
        self.document.set_status(DocumentStatus::Connecting);
        let (generation, previous) = self.lock_state().begin_attempt();
        if let Some(previous) = previous {
            debug!(uri = %self.document.uri(), process = previous.process_id(), "disposing superseded process");
            previous.dispose();
        }

        let pending = PendingAttempt {
            session: self,
            generation,
        };
        pending.run()
    }

    /// Releases the process held by the last successful attempt and retires any attempt in flight.
    pub fn teardown(&self) {
        let process = {
            let mut state = self.lock_state();
            state.generation += 1;
            state.process.take()
        };
        if let Some(process) = process {
            info!(uri = %self.document.uri(), process = process.process_id(), "tearing down terminal session");
            process.dispose();
        }
    }

    async fn run_attempt(&self, generation: u64) -> Attempt {
        let outcome = self.establish(generation).await;

        let (attempt, stale_process, failed) = {
            let mut state = self.lock_state();
            let current = state.generation == generation;
            match outcome {
                Ok((process, command)) if current => {
                    state.attempt.status = AttemptStatus::Success(LaunchInfo {
                        process_id: process.process_id().to_string(),
                        command,
                    });
                    state.process = Some(process);
                    (state.attempt.clone(), None, false)
                }
                Ok((process, _)) => (Self::superseded(), Some(process), false),
                Err(err) if current && !err.is_superseded() => {
                    state.attempt.status = AttemptStatus::Error(Arc::new(err));
                    (state.attempt.clone(), None, true)
                }
                Err(_) => (Self::superseded(), None, false),
            }
        };

        drop(stale_process);
        if failed {
            if let Some(err) = attempt.error() {
                warn!(uri = %self.document.uri(), %err, "terminal session failed to start");
            }
            self.document.set_status(DocumentStatus::Error);
        }
        attempt
    }

    async fn establish(&self, generation: u64) -> Result<(ProcessSession, Command), SessionError> {
        let launchable = self.resolve_target(generation).await?;
        self.ensure_current(generation)?;

        let command = build_command(&launchable, &self.cluster);
        let process = self.terminal.launch(&command, &self.document).await?;
        // A stale process is released by the guard when this returns early.
        self.ensure_current(generation)?;
        Ok((process, command))
    }

    async fn resolve_target(&self, generation: u64) -> Result<LaunchableDocument, SessionError> {
        if let Ok(launchable) = LaunchableDocument::try_from(self.document.snapshot()) {
            return Ok(launchable);
        }

        let _resolving = self.resolution.lock().await;
        // Another attempt may have finished resolving while this one waited.
        let pending = match LaunchableDocument::try_from(self.document.snapshot()) {
            Ok(launchable) => return Ok(launchable),
            Err(UnresolvedDocument(pending)) => pending,
        };
        self.ensure_current(generation)?;

        let resolved = self.resolver.resolve(&self.document, pending).await?;
        Ok(LaunchableDocument::Ssh(resolved))
    }

    fn ensure_current(&self, generation: u64) -> Result<(), SessionError> {
        if self.lock_state().generation == generation {
            Ok(())
        } else {
            Err(SessionError::Superseded)
        }
    }

    fn superseded() -> Attempt {
        Attempt::new(AttemptStatus::Error(Arc::new(SessionError::Superseded)))
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
