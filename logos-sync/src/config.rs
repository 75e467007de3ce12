use std::time::Duration;

/// Sync session configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Presence publish interval (one frame)
    pub frame_interval: Duration,
    /// Awareness field that carries the presence record
    pub presence_field: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(16),
            presence_field: "presence".to_string(),
        }
    }
}
