use serde::{Deserialize, Serialize};

/// Channel manager configuration.
///
/// Limits are hard: exceeding one fails the operation instead of truncating.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ManagerConfig {
    /// Maximum number of simultaneously registered plugins
    pub max_plugins: usize,

    /// Maximum number of simultaneously open channels, static and dynamic
    pub max_open_channels: usize,

    /// Maximum length of a static channel name
    pub max_static_name_length: usize,

    /// Maximum length of a dynamic channel name
    pub max_dynamic_name_length: usize,

    /// Bound of the shared event queue and of each per-channel inbox
    ///
    /// Absent means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,

    /// Register the built-in dynamic channel bridge at pre-connect
    pub dynamic_channels: bool,

    /// Payload bytes carried by each dynamic channel data PDU
    pub dynamic_chunk_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_plugins: 30,
            max_open_channels: 30,
            max_static_name_length: vchan_proto::svc::CHANNEL_NAME_LEN,
            max_dynamic_name_length: 255,
            queue_capacity: None,
            dynamic_channels: true,
            dynamic_chunk_size: 1590,
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    #[must_use]
    pub fn without_dynamic_channels(mut self) -> Self {
        self.dynamic_channels = false;
        self
    }
}
