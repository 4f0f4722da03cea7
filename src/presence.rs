//! Presence/broadcast service: project rooms and the events exchanged in them.
//!
//! The room table lives in a [`RoomRegistry`] owned by the server. Every
//! mutation happens under its write lock, and broadcasts triggered by a
//! mutation are queued before the lock is released, so the `userCount`
//! reported to a room always matches its membership at that moment.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::PresenceError;
use crate::sync::PresenceLink;

pub type SessionId = Uuid;

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinProject(String),
    LeaveProject(String),
    #[serde(rename_all = "camelCase")]
    FileChange {
        project_id: String,
        path: String,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    TerminalInput { project_id: String, data: String },
}

/// Events sent by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Connected { session_id: SessionId },
    /// Acknowledges a join to the joiner.
    #[serde(rename_all = "camelCase")]
    Joined {
        project_id: String,
        session_id: SessionId,
        user_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        session_id: SessionId,
        user_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft {
        session_id: SessionId,
        user_count: usize,
    },
    FileUpdated { path: String, content: String },
    TerminalOutput(String),
    Error { message: String },
}

/// Room listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomInfo {
    pub project_id: String,
    pub user_count: usize,
    pub age_secs: u64,
}

struct Room {
    members: HashSet<SessionId>,
    created_at: Instant,
}

struct Member {
    tx: mpsc::UnboundedSender<ServerEvent>,
    /// The single room this session is in.
    room: Option<String>,
    connected_at: Instant,
}

#[derive(Default)]
struct Registry {
    rooms: HashMap<String, Room>,
    sessions: HashMap<SessionId, Member>,
}

impl Registry {
    fn send_to(&self, session: SessionId, event: ServerEvent) {
        if let Some(member) = self.sessions.get(&session) {
            let _ = member.tx.send(event);
        }
    }

    /// Queue `event` for every member of the room but `except`.
    fn broadcast(&self, project_id: &str, except: Option<SessionId>, event: ServerEvent) -> usize {
        let Some(room) = self.rooms.get(project_id) else {
            return 0;
        };
        room.members
            .iter()
            .filter(|id| Some(**id) != except)
            .filter_map(|id| self.sessions.get(id))
            .filter(|member| member.tx.send(event.clone()).is_ok())
            .count()
    }

    fn room_of(&self, session: SessionId) -> Result<Option<&str>, PresenceError> {
        self.sessions
            .get(&session)
            .map(|m| m.room.as_deref())
            .ok_or_else(|| PresenceError::UnknownSession(session.to_string()))
    }

    /// Remove the session from the room. Returns the remaining count.
    fn leave_room(&mut self, session: SessionId, project_id: &str) -> Option<usize> {
        let room = self.rooms.get_mut(project_id)?;
        if !room.members.remove(&session) {
            return None;
        }
        let remaining = room.members.len();
        if let Some(member) = self.sessions.get_mut(&session) {
            if member.room.as_deref() == Some(project_id) {
                member.room = None;
            }
        }
        if remaining == 0 {
            self.rooms.remove(project_id);
            info!(%project_id, "room closed");
        } else {
            self.broadcast(
                project_id,
                None,
                ServerEvent::UserLeft {
                    session_id: session,
                    user_count: remaining,
                },
            );
        }
        info!(%project_id, session_id = %session, user_count = remaining, "user left");
        Some(remaining)
    }

    fn ensure_member(&self, session: SessionId, project_id: &str) -> Result<(), PresenceError> {
        match self.room_of(session)? {
            Some(room) if room == project_id => Ok(()),
            _ => Err(PresenceError::NotInRoom(project_id.to_string())),
        }
    }
}

/// The presence service's room table.
#[derive(Default)]
pub struct RoomRegistry {
    inner: RwLock<Registry>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection. The receiver yields the events for it,
    /// starting with `connected`.
    pub async fn connect(&self) -> (SessionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ServerEvent::Connected { session_id });
        self.inner.write().await.sessions.insert(
            session_id,
            Member {
                tx,
                room: None,
                connected_at: Instant::now(),
            },
        );
        info!(%session_id, "session connected");
        (session_id, rx)
    }

    /// Add the session to a room, leaving its current room first.
    ///
    /// Peers get `user-joined`; the joiner gets `joined`. Joining the room
    /// the session is already in changes nothing.
    pub async fn join(&self, session: SessionId, project_id: &str) -> Result<usize, PresenceError> {
        let mut registry = self.inner.write().await;
        let current = registry.room_of(session)?.map(str::to_string);
        if current.as_deref() == Some(project_id) {
            let user_count = registry
                .rooms
                .get(project_id)
                .map_or(0, |r| r.members.len());
            registry.send_to(
                session,
                ServerEvent::Joined {
                    project_id: project_id.to_string(),
                    session_id: session,
                    user_count,
                },
            );
            return Ok(user_count);
        }
        if let Some(previous) = current {
            registry.leave_room(session, &previous);
        }

        let room = registry
            .rooms
            .entry(project_id.to_string())
            .or_insert_with(|| Room {
                members: HashSet::new(),
                created_at: Instant::now(),
            });
        room.members.insert(session);
        let user_count = room.members.len();
        if let Some(member) = registry.sessions.get_mut(&session) {
            member.room = Some(project_id.to_string());
        }

        registry.broadcast(
            project_id,
            Some(session),
            ServerEvent::UserJoined {
                session_id: session,
                user_count,
            },
        );
        registry.send_to(
            session,
            ServerEvent::Joined {
                project_id: project_id.to_string(),
                session_id: session,
                user_count,
            },
        );
        info!(%project_id, session_id = %session, user_count, "user joined");
        Ok(user_count)
    }

    pub async fn leave(&self, session: SessionId, project_id: &str) -> Result<usize, PresenceError> {
        let mut registry = self.inner.write().await;
        registry.room_of(session)?;
        registry
            .leave_room(session, project_id)
            .ok_or_else(|| PresenceError::NotInRoom(project_id.to_string()))
    }

    /// Forget a connection, leaving its room exactly like `leave`.
    pub async fn disconnect(&self, session: SessionId) -> bool {
        let mut registry = self.inner.write().await;
        let room = match registry.sessions.get(&session) {
            Some(member) => member.room.clone(),
            None => return false,
        };
        if let Some(project_id) = room {
            registry.leave_room(session, &project_id);
        }
        if let Some(member) = registry.sessions.remove(&session) {
            info!(
                session_id = %session,
                connected_secs = member.connected_at.elapsed().as_secs(),
                "session disconnected"
            );
        }
        true
    }

    /// Forward a file change to the other members. Returns how many got it.
    pub async fn publish_file_change(
        &self,
        session: SessionId,
        project_id: &str,
        path: &str,
        content: &str,
    ) -> Result<usize, PresenceError> {
        let registry = self.inner.read().await;
        registry.ensure_member(session, project_id)?;
        let delivered = registry.broadcast(
            project_id,
            Some(session),
            ServerEvent::FileUpdated {
                path: path.to_string(),
                content: content.to_string(),
            },
        );
        debug!(%project_id, %path, delivered, "file change forwarded");
        Ok(delivered)
    }

    /// Forward terminal output to the other members.
    pub async fn publish_terminal_data(
        &self,
        session: SessionId,
        project_id: &str,
        data: &str,
    ) -> Result<usize, PresenceError> {
        let registry = self.inner.read().await;
        registry.ensure_member(session, project_id)?;
        Ok(registry.broadcast(
            project_id,
            Some(session),
            ServerEvent::TerminalOutput(data.to_string()),
        ))
    }

    /// Queue an error event for one session.
    pub async fn notify_error(&self, session: SessionId, message: impl Into<String>) {
        self.inner.read().await.send_to(
            session,
            ServerEvent::Error {
                message: message.into(),
            },
        );
    }

    pub async fn room_of(&self, session: SessionId) -> Option<String> {
        let registry = self.inner.read().await;
        registry.sessions.get(&session)?.room.clone()
    }

    pub async fn room_size(&self, project_id: &str) -> Option<usize> {
        self.inner
            .read()
            .await
            .rooms
            .get(project_id)
            .map(|r| r.members.len())
    }

    pub async fn rooms(&self) -> Vec<RoomInfo> {
        let registry = self.inner.read().await;
        let now = Instant::now();
        let mut rooms: Vec<RoomInfo> = registry
            .rooms
            .iter()
            .map(|(id, room)| RoomInfo {
                project_id: id.clone(),
                user_count: room.members.len(),
                age_secs: now.duration_since(room.created_at).as_secs(),
            })
            .collect();
        rooms.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        rooms
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Disconnect sessions whose connection task has gone away.
    pub async fn reap_closed(&self) -> usize {
        let closed: Vec<SessionId> = {
            let registry = self.inner.read().await;
            registry
                .sessions
                .iter()
                .filter(|(_, m)| m.tx.is_closed())
                .map(|(id, _)| *id)
                .collect()
        };
        let mut reaped = 0;
        for session in closed {
            if self.disconnect(session).await {
                info!(session_id = %session, "reaped dead session");
                reaped += 1;
            }
        }
        reaped
    }

    /// Drop every room and session. Open connections see their stream end.
    pub async fn shutdown(&self) {
        let mut registry = self.inner.write().await;
        let sessions = registry.sessions.len();
        registry.rooms.clear();
        registry.sessions.clear();
        info!(sessions, "room registry shut down");
    }

    /// In-process presence link acting as `session`.
    pub fn link(self: &Arc<Self>, session: SessionId) -> LocalLink {
        LocalLink {
            registry: Arc::clone(self),
            session,
        }
    }
}

/// [`PresenceLink`] bound to a session of an in-process registry.
#[derive(Clone)]
pub struct LocalLink {
    registry: Arc<RoomRegistry>,
    session: SessionId,
}

impl LocalLink {
    pub fn session_id(&self) -> SessionId {
        self.session
    }
}

#[async_trait]
impl PresenceLink for LocalLink {
    async fn join(&self, project_id: &str) -> Result<(), PresenceError> {
        self.registry.join(self.session, project_id).await.map(|_| ())
    }

    async fn leave(&self, project_id: &str) -> Result<(), PresenceError> {
        self.registry.leave(self.session, project_id).await.map(|_| ())
    }

    async fn publish_file_change(
        &self,
        project_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), PresenceError> {
        self.registry
            .publish_file_change(self.session, project_id, path, content)
            .await
            .map(|_| ())
    }

    async fn publish_terminal_data(
        &self,
        project_id: &str,
        data: &str,
    ) -> Result<(), PresenceError> {
        self.registry
            .publish_terminal_data(self.session, project_id, data)
            .await
            .map(|_| ())
    }
}
