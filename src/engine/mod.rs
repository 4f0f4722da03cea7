//! Boundary to the runtime engine that actually executes project code.
//!
//! An engine boots isolated runtime instances. Each instance accepts a file
//! snapshot, exposes filesystem primitives, spawns processes and raises a
//! [`ReadySignal`] when a served port becomes reachable. Processes are
//! surfaced as [`ProcessChannel`]s: an input stream, an output stream and an
//! exit signal.

pub mod local;
pub mod memory;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::{CommandSpec, TermSize};
use crate::error::EngineError;
use crate::files::ProjectFileSet;

static PROCESS_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

const INPUT_BUFFER: usize = 64;
const OUTPUT_BUFFER: usize = 256;

/// Boots runtime instances.
#[async_trait]
pub trait RuntimeEngine: Send + Sync {
    async fn boot(&self) -> Result<Arc<dyn RuntimeHandle>, EngineError>;
}

/// One booted runtime instance.
#[async_trait]
pub trait RuntimeHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Replace the instance filesystem with `files`.
    async fn mount(&self, files: &ProjectFileSet) -> Result<(), EngineError>;

    async fn spawn(&self, request: SpawnRequest) -> Result<ProcessChannel, EngineError>;

    /// Subscribe to ready signals. Subscribe before spawning the server.
    fn subscribe_ready(&self) -> broadcast::Receiver<ReadySignal>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), EngineError>;

    /// Create a directory and its parents.
    async fn mkdir(&self, path: &str) -> Result<(), EngineError>;

    /// Remove a file or a directory tree.
    async fn remove(&self, path: &str) -> Result<(), EngineError>;

    /// Release the instance. Processes still running are killed.
    async fn teardown(&self);
}

/// Notification that a served port is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadySignal {
    pub port: u16,
    pub url: String,
}

/// What to spawn inside a runtime instance.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    /// Set for interactive shells.
    pub terminal: Option<TermSize>,
}

impl SpawnRequest {
    pub fn task(spec: &CommandSpec) -> Self {
        Self {
            command: spec.program.clone(),
            args: spec.args.clone(),
            terminal: None,
        }
    }

    pub fn shell(spec: &CommandSpec, size: TermSize) -> Self {
        Self {
            command: spec.program.clone(),
            args: spec.args.clone(),
            terminal: Some(size),
        }
    }

    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Code(i32),
    Signal(i32),
    Killed,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Code(0))
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessExit::Code(code) => write!(f, "exit code {code}"),
            ProcessExit::Signal(sig) => write!(f, "signal {sig}"),
            ProcessExit::Killed => f.write_str("killed"),
        }
    }
}

/// Engine-wide process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl ProcessId {
    fn next() -> Self {
        Self(PROCESS_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

/// Size-hint callback for processes attached to a terminal.
pub type Resizer = Arc<dyn Fn(TermSize) -> bool + Send + Sync>;

/// A spawned process: input, output and exit signal.
pub struct ProcessChannel {
    handle: ProcessHandle,
    output: mpsc::Receiver<Vec<u8>>,
}

/// Engine side of a [`ProcessChannel`].
pub struct ProcessEnds {
    pub input: mpsc::Receiver<Vec<u8>>,
    pub output: mpsc::Sender<Vec<u8>>,
    pub exit: watch::Sender<Option<ProcessExit>>,
    /// Cancelled when the owner asks for the process to terminate.
    pub kill: CancellationToken,
}

impl ProcessChannel {
    /// Create a connected channel/ends pair for an engine to drive.
    pub fn pipe(command: impl Into<String>, resizer: Option<Resizer>) -> (Self, ProcessEnds) {
        let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_BUFFER);
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let handle = ProcessHandle {
            id: ProcessId::next(),
            command: Arc::from(command.into()),
            input: input_tx,
            exit: exit_rx,
            kill: kill.clone(),
            resizer,
        };
        let ends = ProcessEnds {
            input: input_rx,
            output: output_tx,
            exit: exit_tx,
            kill,
        };
        (Self { handle, output: output_rx }, ends)
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Separate the control handle from the output stream.
    pub fn split(self) -> (ProcessHandle, mpsc::Receiver<Vec<u8>>) {
        (self.handle, self.output)
    }
}

/// Cloneable control side of a process: write input, resize, wait, kill.
#[derive(Clone)]
pub struct ProcessHandle {
    id: ProcessId,
    command: Arc<str>,
    input: mpsc::Sender<Vec<u8>>,
    exit: watch::Receiver<Option<ProcessExit>>,
    kill: CancellationToken,
    resizer: Option<Resizer>,
}

impl ProcessHandle {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub async fn write(&self, bytes: Vec<u8>) -> Result<(), EngineError> {
        self.input
            .send(bytes)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Forward a size hint. Returns false when the process has no terminal.
    pub fn resize(&self, size: TermSize) -> bool {
        match &self.resizer {
            Some(resize) => resize(size),
            None => false,
        }
    }

    /// Exit status if the process has already ended.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit_status().is_none()
    }

    pub async fn wait(&self) -> ProcessExit {
        let mut exit = self.exit.clone();
        let status = match exit.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or(ProcessExit::Killed),
            Err(_) => ProcessExit::Killed,
        };
        status
    }

    /// Ask the engine to stop the process without waiting.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Stop the process and wait for it to exit.
    pub async fn terminate(&self) -> ProcessExit {
        self.kill();
        self.wait().await
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("exit", &self.exit_status())
            .finish()
    }
}
