//! Terminal multiplexer: several interactive shells on one runtime instance.
//!
//! Each terminal owns one shell process. Its output is drained continuously
//! into a bounded scrollback and a broadcast channel, so a terminal that is
//! not being displayed keeps accumulating output and a display attaching
//! late replays the scrollback before live output.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{TermSize, TerminalConfig};
use crate::engine::{ProcessHandle, SpawnRequest};
use crate::error::{SandboxError, TerminalError};
use crate::runtime::SandboxManager;
use crate::sync::PresenceLink;

const LIVE_BUFFER: usize = 1024;

/// Identifier of a terminal within one multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TerminalId(u64);

impl std::fmt::Display for TerminalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "term-{}", self.0)
    }
}

struct Backlog {
    chunks: VecDeque<Vec<u8>>,
    total_bytes: usize,
    limit: usize,
}

impl Backlog {
    fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            limit,
        }
    }

    /// Append output, keeping only the newest `limit` bytes.
    fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if data.len() >= self.limit {
            self.chunks.clear();
            self.chunks.push_back(data[data.len() - self.limit..].to_vec());
            self.total_bytes = self.limit;
            return;
        }
        self.chunks.push_back(data.to_vec());
        self.total_bytes += data.len();
        while self.total_bytes > self.limit {
            let excess = self.total_bytes - self.limit;
            let Some(front) = self.chunks.front_mut() else {
                self.total_bytes = 0;
                break;
            };
            if front.len() <= excess {
                self.total_bytes -= front.len();
                self.chunks.pop_front();
            } else {
                front.drain(..excess);
                self.total_bytes -= excess;
            }
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        self.chunks.iter().flatten().copied().collect()
    }
}

/// Room a multiplexer mirrors shared terminals into.
#[derive(Clone)]
struct Mirror {
    link: Arc<dyn PresenceLink>,
    project_id: String,
}

struct TerminalSession {
    id: TerminalId,
    name: String,
    size: Mutex<TermSize>,
    process: ProcessHandle,
    /// Scrollback and live output are updated under the same lock.
    backlog: Arc<Mutex<Backlog>>,
    live: broadcast::Sender<Vec<u8>>,
    shared: Arc<AtomicBool>,
    drain: JoinHandle<()>,
}

impl TerminalSession {
    fn backlog(&self) -> MutexGuard<'_, Backlog> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn size(&self) -> TermSize {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What a display receives when it binds to a terminal.
pub struct TerminalAttach {
    /// Output produced before the attach, oldest first.
    pub scrollback: Vec<u8>,
    /// Output produced after the attach.
    pub live: broadcast::Receiver<Vec<u8>>,
}

/// Listing entry for a terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalInfo {
    pub id: TerminalId,
    pub name: String,
    pub rows: u16,
    pub cols: u16,
    pub active: bool,
    pub running: bool,
    pub shared: bool,
}

/// Creates, routes and destroys interactive shells.
pub struct TerminalMux {
    sandbox: SandboxManager,
    config: TerminalConfig,
    next_id: AtomicU64,
    sessions: RwLock<IndexMap<TerminalId, Arc<TerminalSession>>>,
    active: Mutex<Option<TerminalId>>,
    mirror: Arc<Mutex<Option<Mirror>>>,
}

impl TerminalMux {
    pub fn new(sandbox: SandboxManager, config: TerminalConfig) -> Self {
        Self {
            sandbox,
            config,
            next_id: AtomicU64::new(1),
            sessions: RwLock::new(IndexMap::new()),
            active: Mutex::new(None),
            mirror: Arc::new(Mutex::new(None)),
        }
    }

    /// Publish output of shared terminals into `project_id` through `link`.
    pub fn set_mirror(&self, link: Arc<dyn PresenceLink>, project_id: impl Into<String>) {
        *self.mirror.lock().unwrap_or_else(PoisonError::into_inner) = Some(Mirror {
            link,
            project_id: project_id.into(),
        });
    }

    pub fn clear_mirror(&self) {
        *self.mirror.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Open a new shell. `size` defaults to the configured size.
    pub async fn open(
        &self,
        name: impl Into<String>,
        size: Option<TermSize>,
    ) -> Result<TerminalId, TerminalError> {
        if !self.sandbox.state().is_serving() {
            return Err(TerminalError::RuntimeUnavailable);
        }
        let size = size.unwrap_or(self.config.size);
        let channel = self
            .sandbox
            .spawn(SpawnRequest::shell(&self.config.shell, size))
            .await
            .map_err(|err| match err {
                SandboxError::RuntimeUnavailable | SandboxError::Disposed => {
                    TerminalError::RuntimeUnavailable
                }
                other => TerminalError::Spawn(other),
            })?;
        let (process, output) = channel.split();

        let id = TerminalId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        let backlog = Arc::new(Mutex::new(Backlog::new(self.config.scrollback_bytes)));
        let (live, _) = broadcast::channel(LIVE_BUFFER);
        let shared = Arc::new(AtomicBool::new(false));
        let drain = tokio::spawn(drain_output(
            id,
            output,
            Arc::clone(&backlog),
            live.clone(),
            Arc::clone(&shared),
            Arc::clone(&self.mirror),
        ));

        let session = Arc::new(TerminalSession {
            id,
            name: name.clone(),
            size: Mutex::new(size),
            process,
            backlog,
            live,
            shared,
            drain,
        });
        self.sessions.write().await.insert(id, session);
        {
            let mut active = self.active_guard();
            if active.is_none() {
                *active = Some(id);
            }
        }
        info!(terminal = %id, %name, rows = size.rows, cols = size.cols, "terminal opened");
        Ok(id)
    }

    async fn get(&self, id: TerminalId) -> Result<Arc<TerminalSession>, TerminalError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(TerminalError::UnknownTerminal(id))
    }

    /// Forward keystrokes to the terminal's shell.
    pub async fn write(&self, id: TerminalId, bytes: impl Into<Vec<u8>>) -> Result<(), TerminalError> {
        let session = self.get(id).await?;
        session
            .process
            .write(bytes.into())
            .await
            .map_err(|_| TerminalError::Closed(id))
    }

    /// Size hint for the shell. Ignored when the process has no terminal.
    pub async fn resize(&self, id: TerminalId, size: TermSize) -> Result<(), TerminalError> {
        let session = self.get(id).await?;
        *session.size.lock().unwrap_or_else(PoisonError::into_inner) = size;
        if !session.process.resize(size) {
            debug!(terminal = %id, "resize not supported");
        }
        Ok(())
    }

    /// Terminate the shell and forget the terminal. The last one stays.
    pub async fn close(&self, id: TerminalId) -> Result<(), TerminalError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            if !sessions.contains_key(&id) {
                return Err(TerminalError::UnknownTerminal(id));
            }
            if sessions.len() == 1 {
                return Err(TerminalError::LastTerminal);
            }
            let session = sessions.shift_remove(&id);
            let mut active = self.active_guard();
            if *active == Some(id) {
                *active = sessions.keys().next().copied();
            }
            session
        };
        if let Some(session) = session {
            let exit = session.process.terminate().await;
            info!(terminal = %id, %exit, "terminal closed");
        }
        Ok(())
    }

    /// Bind a display to a terminal: scrollback so far, then live output.
    pub async fn attach(&self, id: TerminalId) -> Result<TerminalAttach, TerminalError> {
        let session = self.get(id).await?;
        let backlog = session.backlog();
        Ok(TerminalAttach {
            scrollback: backlog.snapshot(),
            live: session.live.subscribe(),
        })
    }

    /// Switch the visible terminal. Presentation only.
    pub async fn set_active(&self, id: TerminalId) -> Result<(), TerminalError> {
        self.get(id).await?;
        *self.active_guard() = Some(id);
        Ok(())
    }

    pub fn active(&self) -> Option<TerminalId> {
        *self.active_guard()
    }

    /// Mirror this terminal's output to the collaborators in the room.
    pub async fn set_shared(&self, id: TerminalId, shared: bool) -> Result<(), TerminalError> {
        let session = self.get(id).await?;
        session.shared.store(shared, Ordering::Release);
        Ok(())
    }

    pub async fn list(&self) -> Vec<TerminalInfo> {
        let active = self.active();
        self.sessions
            .read()
            .await
            .values()
            .map(|s| {
                let size = s.size();
                TerminalInfo {
                    id: s.id,
                    name: s.name.clone(),
                    rows: size.rows,
                    cols: size.cols,
                    active: active == Some(s.id),
                    running: s.process.is_running(),
                    shared: s.shared.load(Ordering::Acquire),
                }
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Close every terminal, including the last one. Used on teardown.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain(..).map(|(_, s)| s).collect()
        };
        *self.active_guard() = None;
        for session in &sessions {
            session.process.terminate().await;
            session.drain.abort();
        }
        if !sessions.is_empty() {
            info!(terminals = sessions.len(), "terminals shut down");
        }
    }

    fn active_guard(&self) -> MutexGuard<'_, Option<TerminalId>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn drain_output(
    id: TerminalId,
    mut output: mpsc::Receiver<Vec<u8>>,
    backlog: Arc<Mutex<Backlog>>,
    live: broadcast::Sender<Vec<u8>>,
    shared: Arc<AtomicBool>,
    mirror: Arc<Mutex<Option<Mirror>>>,
) {
    while let Some(chunk) = output.recv().await {
        {
            let mut backlog = backlog.lock().unwrap_or_else(PoisonError::into_inner);
            backlog.push(&chunk);
            let _ = live.send(chunk.clone());
        }
        if !shared.load(Ordering::Acquire) {
            continue;
        }
        let mirror = mirror
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(Mirror { link, project_id }) = mirror {
            let data = String::from_utf8_lossy(&chunk);
            if let Err(err) = link.publish_terminal_data(&project_id, &data).await {
                warn!(terminal = %id, error = %err, "terminal mirror failed");
            }
        }
    }
    debug!(terminal = %id, "terminal output closed");
}
