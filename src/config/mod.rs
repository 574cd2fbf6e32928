pub mod schema;

pub use schema::{
    AgentRuntimeConfig, BusConfig, Config, DeadlockConfig, InboxOverflowPolicy,
    ObservabilityConfig,
};

/// JSON Schema for `swarm.toml`, for editor tooling and config validation.
pub fn config_json_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(Config)).unwrap_or(serde_json::Value::Null)
}
