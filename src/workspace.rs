//! One client's IDE session on a project.
//!
//! A workspace joins the project room, runs the sandbox pipeline, keeps at
//! least one terminal open once the runtime is serving and routes edits
//! through the sync bridge. Tearing it down disposes the runtime, closes
//! every terminal and leaves the room, in that order.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codegen::GenerateResponse;
use crate::config::WorkspaceConfig;
use crate::engine::{ReadySignal, RuntimeEngine};
use crate::error::{SandboxError, StoreError, TerminalError};
use crate::files::{ProjectFileSet, SharedFiles};
use crate::presence::ServerEvent;
use crate::runtime::{BulkChangeReport, SandboxManager, SandboxState};
use crate::store::ProjectStore;
use crate::sync::{FileSyncBridge, LocalEditOutcome, PresenceLink};
use crate::terminal::{TerminalId, TerminalMux};

const FIRST_TERMINAL: &str = "Terminal 1";
const SHARED_OUTPUT_BUFFER: usize = 256;

pub struct Workspace {
    project_id: String,
    sandbox: SandboxManager,
    terminals: TerminalMux,
    sync: FileSyncBridge,
    link: Arc<dyn PresenceLink>,
    user_count: AtomicUsize,
    shared_output: broadcast::Sender<String>,
    pump: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl Workspace {
    /// Join the room and bring the runtime up for `files`.
    ///
    /// Returns once the runtime is serving (with the first terminal open) or
    /// the pipeline has failed. A boot failure is fatal: the workspace is
    /// torn down and the error returned. Other failures leave the workspace
    /// open so the pipeline can be restarted.
    pub async fn open(
        engine: Arc<dyn RuntimeEngine>,
        project_id: impl Into<String>,
        files: ProjectFileSet,
        link: Arc<dyn PresenceLink>,
        config: WorkspaceConfig,
    ) -> Result<Arc<Self>, SandboxError> {
        let project_id = project_id.into();
        let sandbox = SandboxManager::new(engine, config.pipeline, SharedFiles::default());
        let terminals = TerminalMux::new(sandbox.clone(), config.terminal);
        terminals.set_mirror(Arc::clone(&link), project_id.clone());
        let sync = FileSyncBridge::new(project_id.clone(), sandbox.clone(), Arc::clone(&link));
        let (shared_output, _) = broadcast::channel(SHARED_OUTPUT_BUFFER);

        let workspace = Arc::new(Self {
            project_id,
            sandbox,
            terminals,
            sync,
            link,
            user_count: AtomicUsize::new(0),
            shared_output,
            pump: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        });

        if let Err(err) = workspace.link.join(&workspace.project_id).await {
            warn!(project_id = %workspace.project_id, error = %err, "could not join project room");
        }
        info!(project_id = %workspace.project_id, files = files.len(), "opening workspace");

        if let Err(err) = workspace.launch(files).await {
            if err.is_fatal() {
                workspace.teardown().await;
                return Err(err);
            }
            warn!(error = %err, "workspace opened without a running preview");
        }
        Ok(workspace)
    }

    /// Start the pipeline and open the first terminal once serving.
    async fn launch(&self, files: ProjectFileSet) -> Result<(), SandboxError> {
        let mut state = self.sandbox.subscribe_state();
        let sandbox = self.sandbox.clone();
        let mut pipeline = tokio::spawn(async move { sandbox.start(files).await });

        // The pipeline keeps running towards Ready after the serve step starts.
        tokio::select! {
            finished = &mut pipeline => match finished {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(SandboxError::Disposed),
            },
            serving = async { state.wait_for(|s| s.is_serving()).await.is_ok() } => {
                if !serving {
                    return Err(SandboxError::Disposed);
                }
            }
        }

        if self.terminals.is_empty().await {
            self.terminals
                .open(FIRST_TERMINAL, None)
                .await
                .map_err(|err| match err {
                    TerminalError::Spawn(err) => err,
                    _ => SandboxError::RuntimeUnavailable,
                })?;
        }
        Ok(())
    }

    /// Wait until the preview is reachable.
    pub async fn wait_ready(&self) -> Result<ReadySignal, SandboxError> {
        let mut state = self.sandbox.subscribe_state();
        let reached = state
            .wait_for(|s| {
                matches!(
                    s,
                    SandboxState::Ready | SandboxState::Failed | SandboxState::Disposed
                )
            })
            .await
            .map(|s| *s)
            .unwrap_or(SandboxState::Disposed);
        match reached {
            SandboxState::Ready => self.sandbox.preview().ok_or(SandboxError::Disposed),
            SandboxState::Failed => Err(self.sandbox.failure().unwrap_or(SandboxError::Disposed)),
            _ => Err(SandboxError::Disposed),
        }
    }

    /// Dispose the runtime and run the pipeline again on the current files.
    pub async fn restart_runtime(&self) -> Result<ReadySignal, SandboxError> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(SandboxError::Disposed);
        }
        info!(project_id = %self.project_id, "restarting runtime");
        self.terminals.shutdown().await;
        self.sandbox.dispose().await;
        let files = self.sandbox.files().read().await.clone();
        self.launch(files).await?;
        self.wait_ready().await
    }

    /// Route events from the presence service into this workspace.
    pub fn spawn_event_pump(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
        let workspace: Weak<Self> = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(workspace) = workspace.upgrade() else {
                    break;
                };
                workspace.handle_server_event(event).await;
            }
            debug!("presence event stream ended");
        });
        let previous = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(pump);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { session_id } => debug!(%session_id, "presence connected"),
            ServerEvent::Joined {
                project_id,
                user_count,
                ..
            } => {
                self.user_count.store(user_count, Ordering::Release);
                info!(%project_id, user_count, "joined project room");
            }
            ServerEvent::UserJoined {
                session_id,
                user_count,
            } => {
                self.user_count.store(user_count, Ordering::Release);
                info!(%session_id, user_count, "collaborator joined");
            }
            ServerEvent::UserLeft {
                session_id,
                user_count,
            } => {
                self.user_count.store(user_count, Ordering::Release);
                info!(%session_id, user_count, "collaborator left");
            }
            ServerEvent::FileUpdated { path, content } => {
                if let Err(err) = self.sync.on_remote_file_update(&path, &content).await {
                    warn!(%path, error = %err, "ignoring remote file update");
                }
            }
            ServerEvent::TerminalOutput(data) => {
                let _ = self.shared_output.send(data);
            }
            ServerEvent::Error { message } => warn!(%message, "presence service error"),
        }
    }

    /// An edit typed in this client's editor.
    pub async fn edit(&self, path: &str, content: &str) -> Result<LocalEditOutcome, SandboxError> {
        self.sync.on_local_edit(path, content).await
    }

    /// Create a file and tell the room about it.
    pub async fn create_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.sandbox.create_file(path, content).await?;
        self.publish(path, content).await;
        Ok(())
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), SandboxError> {
        self.sandbox.delete_file(path).await
    }

    /// Feed generated files into the runtime and share them with the room.
    pub async fn apply_generated(
        &self,
        generated: GenerateResponse,
    ) -> Result<BulkChangeReport, SandboxError> {
        let change = generated.into_change();
        if change.is_empty() {
            return Ok(BulkChangeReport::default());
        }
        let report = self.sandbox.apply_bulk_change(change.clone()).await?;
        for (path, content) in change.iter() {
            self.publish(path, content).await;
        }
        Ok(report)
    }

    async fn publish(&self, path: &str, content: &str) {
        if let Err(err) = self
            .link
            .publish_file_change(&self.project_id, path, content)
            .await
        {
            warn!(%path, error = %err, "file change not published");
        }
    }

    /// Persist the current file set.
    pub async fn save(&self, store: &dyn ProjectStore) -> Result<(), StoreError> {
        let files = self.sandbox.files().read().await.clone();
        store.upsert_files(&self.project_id, &files).await
    }

    /// Open another terminal.
    pub async fn open_terminal(&self, name: impl Into<String>) -> Result<TerminalId, TerminalError> {
        self.terminals.open(name, None).await
    }

    /// Dispose the runtime, close every terminal and leave the room. Idempotent.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sandbox.dispose().await;
        self.terminals.shutdown().await;
        self.terminals.clear_mirror();
        if let Err(err) = self.link.leave(&self.project_id).await {
            debug!(project_id = %self.project_id, error = %err, "leave failed");
        }
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }
        info!(project_id = %self.project_id, "workspace torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn sandbox(&self) -> &SandboxManager {
        &self.sandbox
    }

    pub fn terminals(&self) -> &TerminalMux {
        &self.terminals
    }

    pub fn sync(&self) -> &FileSyncBridge {
        &self.sync
    }

    pub fn files(&self) -> &SharedFiles {
        self.sandbox.files()
    }

    pub fn preview_url(&self) -> Option<String> {
        self.sandbox.preview_url()
    }

    /// Collaborators in the room, including this client.
    pub fn user_count(&self) -> usize {
        self.user_count.load(Ordering::Acquire)
    }

    /// Output of terminals shared by collaborators.
    pub fn subscribe_shared_terminals(&self) -> broadcast::Receiver<String> {
        self.shared_output.subscribe()
    }
}
