use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::nickname::MeshMode;
use std::env;

/// Service identifier shared by every device in the mesh
pub const DEFAULT_SERVICE_ID: &str = "com.servify.resqmesh.SERVICE_ID";

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Service id advertised and discovered (default: com.servify.resqmesh.SERVICE_ID)
    pub service_id: String,
    /// Confirmed nickname; a generated one is used when unset or blank
    pub nickname: Option<String>,
    /// Mode chosen at onboarding (default: festival)
    pub mode: MeshMode,
    /// Events buffered per subscriber before lagging (default: 100)
    pub event_channel_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            service_id: DEFAULT_SERVICE_ID.to_string(),
            nickname: None,
            mode: MeshMode::default(),
            event_channel_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl MeshConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(MeshConfig {
            service_id: env::var("RESQ_SERVICE_ID")
                .unwrap_or_else(|_| DEFAULT_SERVICE_ID.to_string()),
            nickname: env::var("RESQ_NICKNAME")
                .ok()
                .filter(|name| !name.trim().is_empty()),
            mode: env::var("RESQ_MODE")
                .unwrap_or_else(|_| "festival".to_string())
                .parse()?,
            event_channel_capacity: env::var("RESQ_EVENT_CHANNEL_CAPACITY")
                .unwrap_or_else(|_| DEFAULT_EVENT_CAPACITY.to_string())
                .parse()?,
        })
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }
}
