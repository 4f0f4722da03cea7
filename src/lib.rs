//! devroom - collaborative project rooms backed by a sandboxed install/serve
//! runtime with multiplexed shells.

pub mod client;
pub mod codegen;
pub mod config;
pub mod engine;
pub mod error;
pub mod files;
pub mod presence;
pub mod runtime;
pub mod state;
pub mod store;
pub mod sync;
pub mod terminal;
pub mod workspace;
pub mod ws_server;

pub use error::{PresenceError, SandboxError, TerminalError};
pub use files::ProjectFileSet;
pub use runtime::{SandboxManager, SandboxState};
pub use workspace::Workspace;
