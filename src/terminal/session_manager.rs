use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::command::Command;
use crate::terminal::TerminalError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The process is attached and ready for input.
    Open,
    Data(Vec<u8>),
    Exit { exit_code: i32 },
}

/// Whether the environment captured before launch is complete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CreationStatus {
    #[default]
    Ok,
    ShellEnvResolutionTimedOut,
}

pub struct CreatedProcess {
    pub process: Arc<dyn PtyProcess>,
    /// Open/data/exit events, in the order the process produced them.
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
    pub creation_status: CreationStatus,
}

#[async_trait]
pub trait ProcessFactory: Send + Sync {
    async fn create_process(&self, command: &Command) -> Result<CreatedProcess, TerminalError>;
}

#[async_trait]
pub trait PtyProcess: Send + Sync {
    fn id(&self) -> &str;

    /// Live working directory, when the platform exposes it.
    async fn cwd(&self) -> Result<Option<String>, TerminalError>;

    fn write(&self, data: &[u8]) -> Result<(), TerminalError>;

    fn resize(&self, cols: u16, rows: u16) -> Result<(), TerminalError>;

    /// Terminates the process. Calling it again is a no-op.
    fn dispose(&self) -> Result<(), TerminalError>;
}
