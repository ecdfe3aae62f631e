//! Loading of the `PusherConfig.json` file and the environment inputs.

use serde::Deserialize;
use tokio::fs;

/// Environment variable holding the comma separated list of domain substrings
/// that skip the embeddable-URL probe.
pub const EMBEDDABLE_ALLOWLIST_ENV: &str = "EMBEDDABLE_ALLOWED_DOMAINS";

/// The full configuration of one pusher process.
#[derive(Clone, Debug, Deserialize)]
pub struct PusherConfig {
    /// Address the front WebSocket listener binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// One WebSocket base URL per back-end process, in stable order. The
    /// room/space hash indexes into this list.
    pub back_endpoints: Vec<String>,
    /// Base URL of the admin REST service.
    pub admin_api_url: String,
    /// Bearer token for the admin REST service.
    #[serde(default)]
    pub admin_api_token: String,
    /// Flush a client batch as soon as it holds this many sub-messages.
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,
    /// Flush interval for client batches in milliseconds.
    #[serde(default = "default_batch_flush_ms")]
    pub batch_flush_ms: u64,
    /// Relay a kick-off for a space unknown locally to its back anyway.
    #[serde(default = "default_true")]
    pub forward_unknown_kick: bool,
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".into()
}

fn default_batch_max_size() -> usize {
    64
}

fn default_batch_flush_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

/// Reads and validates the configuration file.
pub async fn load_config(path: &str) -> Result<PusherConfig, String> {
    let json_content = fs::read_to_string(path)
        .await
        .map_err(|e| format!("Failed to read file: {}", e))?;
    let config: PusherConfig =
        serde_json::from_str(&json_content).map_err(|e| format!("Failed to parse JSON: {}", e))?;
    if config.back_endpoints.is_empty() {
        return Err("At least one back endpoint must be configured.".into());
    }
    Ok(config)
}

/// The allow-list is the only environment input the core reads.
pub fn embeddable_allowlist_from_env() -> Vec<String> {
    std::env::var(EMBEDDABLE_ALLOWLIST_ENV)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: PusherConfig = serde_json::from_str(
            r#"{
                "back_endpoints": ["ws://back-0:50051"],
                "admin_api_url": "http://admin.example"
            }"#,
        )
        .unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:8080");
        assert_eq!(config.batch_max_size, 64);
        assert_eq!(config.batch_flush_ms, 100);
        assert!(config.forward_unknown_kick);
    }
}
