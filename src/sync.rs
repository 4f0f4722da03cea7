//! File synchronization bridge between the editor, the private runtime and
//! the collaborators of a project room.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{PresenceError, SandboxError};
use crate::files::{normalize_path, SharedFiles};
use crate::runtime::SandboxManager;

const UPDATE_BUFFER: usize = 256;

/// Client side of the presence service, as seen by one session.
#[async_trait]
pub trait PresenceLink: Send + Sync {
    /// Join a room. The membership count arrives as a `joined` event.
    async fn join(&self, project_id: &str) -> Result<(), PresenceError>;

    async fn leave(&self, project_id: &str) -> Result<(), PresenceError>;

    async fn publish_file_change(
        &self,
        project_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), PresenceError>;

    async fn publish_terminal_data(&self, project_id: &str, data: &str)
        -> Result<(), PresenceError>;
}

/// Link used when no presence service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineLink;

#[async_trait]
impl PresenceLink for OfflineLink {
    async fn join(&self, _project_id: &str) -> Result<(), PresenceError> {
        Ok(())
    }

    async fn leave(&self, _project_id: &str) -> Result<(), PresenceError> {
        Ok(())
    }

    async fn publish_file_change(
        &self,
        _project_id: &str,
        _path: &str,
        _content: &str,
    ) -> Result<(), PresenceError> {
        Ok(())
    }

    async fn publish_terminal_data(
        &self,
        _project_id: &str,
        _data: &str,
    ) -> Result<(), PresenceError> {
        Ok(())
    }
}

/// A file changed by a collaborator, for open editor views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpdate {
    pub path: String,
    pub content: String,
}

/// Result of the two independent effects of a local edit.
#[derive(Debug)]
pub struct LocalEditOutcome {
    pub runtime: Result<(), SandboxError>,
    pub presence: Result<(), PresenceError>,
}

impl LocalEditOutcome {
    pub fn is_complete(&self) -> bool {
        self.runtime.is_ok() && self.presence.is_ok()
    }
}

/// Routes edits between the file set, the runtime and the room.
pub struct FileSyncBridge {
    project_id: String,
    files: SharedFiles,
    sandbox: SandboxManager,
    link: Arc<dyn PresenceLink>,
    updates: broadcast::Sender<FileUpdate>,
}

impl FileSyncBridge {
    pub fn new(
        project_id: impl Into<String>,
        sandbox: SandboxManager,
        link: Arc<dyn PresenceLink>,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            project_id: project_id.into(),
            files: sandbox.files().clone(),
            sandbox,
            link,
            updates,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Remote updates for editor views.
    pub fn subscribe(&self) -> broadcast::Receiver<FileUpdate> {
        self.updates.subscribe()
    }

    /// Apply an edit made in this client.
    ///
    /// The file set is updated first. The runtime write and the room publish
    /// then run concurrently and fail independently.
    pub async fn on_local_edit(
        &self,
        path: &str,
        content: &str,
    ) -> Result<LocalEditOutcome, SandboxError> {
        let path = normalize_path(path)?;
        self.files.write().await.insert(&path, content)?;

        let (runtime, presence) = tokio::join!(
            self.sandbox.write_file(&path, content),
            self.link
                .publish_file_change(&self.project_id, &path, content),
        );
        if let Err(err) = &runtime {
            warn!(%path, error = %err, "runtime write failed");
        }
        if let Err(err) = &presence {
            warn!(%path, project_id = %self.project_id, error = %err, "file change not published");
        }
        debug!(%path, bytes = content.len(), "local edit synced");
        Ok(LocalEditOutcome { runtime, presence })
    }

    /// Apply a collaborator's edit. Never touches the local runtime.
    pub async fn on_remote_file_update(
        &self,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        let path = normalize_path(path)?;
        self.files.write().await.insert(&path, content)?;
        debug!(%path, bytes = content.len(), "remote edit applied");
        let _ = self.updates.send(FileUpdate {
            path,
            content: content.to_string(),
        });
        Ok(())
    }
}
