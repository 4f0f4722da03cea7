//! Shared state of the presence server.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::presence::RoomRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new()),
            config: Arc::new(config),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}
