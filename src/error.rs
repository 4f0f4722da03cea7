//! Error types for every boundary of the crate.

use std::time::Duration;

use thiserror::Error;

use crate::terminal::TerminalId;

/// Failures reported by a runtime engine (boot, filesystem, process spawn).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("sandboxing is not available on this host: {0}")]
    Unsupported(String),
    #[error("spawn {command}: {reason}")]
    Spawn { command: String, reason: String },
    #[error("{op} {path}: {source}")]
    Fs {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process channel closed")]
    ChannelClosed,
    #[error("runtime has been torn down")]
    TornDown,
    #[error("{0}")]
    Other(String),
}

/// Errors surfaced by the sandbox runtime manager.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    #[error("sandbox unavailable: {0}")]
    Boot(String),
    #[error("dependency install failed: {0}")]
    Install(String),
    #[error("preview server failed: {0}")]
    Serve(String),
    #[error("no ready signal within {0:?}")]
    ReadyTimeout(Duration),
    #[error("runtime filesystem: {0}")]
    Io(String),
    #[error("invalid path {0:?}")]
    InvalidPath(String),
    #[error("file already exists: {0}")]
    FileExists(String),
    #[error("no such file: {0}")]
    FileNotFound(String),
    #[error("sandbox runtime is not available")]
    RuntimeUnavailable,
    #[error("sandbox already started")]
    AlreadyStarted,
    #[error("sandbox disposed")]
    Disposed,
}

impl SandboxError {
    /// Whether the error is fatal for the client session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SandboxError::Boot(_))
    }
}

impl From<EngineError> for SandboxError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unsupported(reason) => SandboxError::Boot(reason),
            EngineError::TornDown => SandboxError::Disposed,
            other => SandboxError::Io(other.to_string()),
        }
    }
}

/// Terminal operations rejected locally.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("no runtime is serving")]
    RuntimeUnavailable,
    #[error("unknown terminal {0}")]
    UnknownTerminal(TerminalId),
    #[error("cannot close the last terminal")]
    LastTerminal,
    #[error("spawn shell: {0}")]
    Spawn(#[from] SandboxError),
    #[error("terminal {0} has exited")]
    Closed(TerminalId),
}

/// Presence service and presence client errors.
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("session is not in room {0}")]
    NotInRoom(String),
    #[error("connect: {0}")]
    Connect(String),
    #[error("presence connection closed")]
    Closed,
    #[error("protocol: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// Project store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid path {0:?} in stored project")]
    InvalidPath(String),
}

/// Code-generation collaborator errors.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("prompt is required")]
    EmptyPrompt,
    #[error("code generation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("code generation returned {status}: {message}")]
    Status { status: u16, message: String },
}
