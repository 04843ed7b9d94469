// Copyright 2025 Accord project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::Path;

use serde_derive::Deserialize;
use session::SessionConfig;

///
/// Client configuration, buildable programmatically or loadable from TOML. Every field has a
/// default so a config file only needs to state what it changes.
///
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Gateway endpoint, e.g. `wss://gateway.example.test/?v=9&encoding=json`.
    pub base_url: String,
    /// Bot token, if the layer above needs one. The core never interprets it.
    pub token: Option<String>,
    /// Reconnect attempts before the session gives up and stays disconnected.
    pub reconnect_threshold: u32,
    /// Poll cadence for the I/O loop, in milliseconds.
    pub refresh_rate_ms: u64,
    /// Worker threads servicing event callbacks.
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            base_url: String::new(),
            token: None,
            reconnect_threshold: 5,
            refresh_rate_ms: 100,
            workers: 10,
        }
    }
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Config, String> {
        toml::from_str(raw).map_err(|e| format!("Invalid config: {e}"))
    }

    pub fn from_toml_file(path: &Path) -> Result<Config, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Couldn't read config file {}: {e}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub(crate) fn session_config(&self) -> SessionConfig {
        SessionConfig {
            base_url: self.base_url.clone(),
            reconnect_threshold: self.reconnect_threshold,
            refresh_rate_ms: self.refresh_rate_ms,
            workers: self.workers,
        }
    }
}
