//! Store configuration.
//!
//! `StoreConfig` is plain data so applications can load it alongside the
//! rest of their settings. Missing fields take their defaults.
//!
//! ```ignore
//! let config: StoreConfig = serde_json::from_str(r#"{ "history_capacity": 200 }"#)?;
//! let store = Store::builder(State::default(), reduce)
//!     .with_config(config)
//!     .build()?;
//! ```

use serde::{Deserialize, Serialize};

use crate::history::DEFAULT_HISTORY_CAPACITY;

/// Default capacity of the state and error broadcast channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default name of the per-store serial context.
pub const DEFAULT_CONTEXT_NAME: &str = "dataflow-default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of state snapshots kept in the history log.
    pub history_capacity: usize,
    /// Buffered states per subscriber before it starts skipping.
    pub state_channel_capacity: usize,
    /// Buffered failures per subscriber before it starts skipping.
    pub error_channel_capacity: usize,
    /// Thread name of the default serial context.
    pub default_context_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            state_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            error_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            default_context_name: DEFAULT_CONTEXT_NAME.to_string(),
        }
    }
}

impl StoreConfig {
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_state_channel_capacity(mut self, capacity: usize) -> Self {
        self.state_channel_capacity = capacity;
        self
    }

    pub fn with_error_channel_capacity(mut self, capacity: usize) -> Self {
        self.error_channel_capacity = capacity;
        self
    }

    pub fn with_default_context_name(mut self, name: impl Into<String>) -> Self {
        self.default_context_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.history_capacity, 50);
        assert_eq!(config.state_channel_capacity, 1024);
        assert_eq!(config.error_channel_capacity, 1024);
        assert_eq!(config.default_context_name, "dataflow-default");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: StoreConfig =
            serde_json::from_str(r#"{ "history_capacity": 200 }"#).unwrap();

        assert_eq!(config.history_capacity, 200);
        assert_eq!(config.state_channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.default_context_name, DEFAULT_CONTEXT_NAME);
    }

    #[test]
    fn test_serializes_all_fields() {
        let config = StoreConfig::default().with_default_context_name("checkout");
        let value = serde_json::to_value(&config).unwrap();

        assert_eq!(value["default_context_name"], "checkout");
        assert_eq!(value["error_channel_capacity"], 1024);
    }

    #[test]
    fn test_builder_methods() {
        let config = StoreConfig::default()
            .with_history_capacity(10)
            .with_state_channel_capacity(16)
            .with_error_channel_capacity(8);

        assert_eq!(config.history_capacity, 10);
        assert_eq!(config.state_channel_capacity, 16);
        assert_eq!(config.error_channel_capacity, 8);
    }
}
