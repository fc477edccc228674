//! Engine configuration.
//!
//! Reads `boardsync.toml`. Every field is optional and falls back to the
//! defaults below. Layering is file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [transport]
//! endpoint = "ws://127.0.0.1:4000/realtime"
//! connect_timeout_ms = 10000
//!
//! [connection]
//! emit_buffer = 50
//!
//! [registry]
//! max_namespaces = 8
//!
//! [reconnect]
//! base_delay_ms = 500
//! max_delay_ms = 2000
//! auxiliary_max_retries = 3
//!
//! [reconcile]
//! optimistic_timeout_ms = 10000
//! orphan_max_retries = 3
//! orphan_backoff_ms = 200
//!
//! [notify]
//! window_ms = 3000
//! max_records = 500
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::Namespace;

/// Environment variable that overrides `transport.endpoint`.
pub const ENDPOINT_ENV: &str = "BOARDSYNC_ENDPOINT";

/// Default config file name.
pub const CONFIG_FILE: &str = "boardsync.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    /// Base URL; each namespace connects to `<endpoint>/<namespace>`
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Upper bound for transport open plus credential handshake
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:4000/realtime".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSection {
    /// Messages held while not authenticated
    #[serde(default = "default_emit_buffer")]
    pub emit_buffer: usize,
}

fn default_emit_buffer() -> usize {
    50
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            emit_buffer: default_emit_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_max_namespaces")]
    pub max_namespaces: usize,
}

fn default_max_namespaces() -> usize {
    8
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            max_namespaces: default_max_namespaces(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Retry budget for `ai` and `system`
    #[serde(default = "default_auxiliary_max_retries")]
    pub auxiliary_max_retries: u32,
    /// Retry budget for every other namespace; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_max_retries: Option<u32>,
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_auxiliary_max_retries() -> u32 {
    3
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            auxiliary_max_retries: default_auxiliary_max_retries(),
            critical_max_retries: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSection {
    #[serde(default = "default_optimistic_timeout_ms")]
    pub optimistic_timeout_ms: u64,
    #[serde(default = "default_orphan_max_retries")]
    pub orphan_max_retries: u32,
    #[serde(default = "default_orphan_backoff_ms")]
    pub orphan_backoff_ms: u64,
    #[serde(default = "default_orphan_buffer")]
    pub orphan_buffer: usize,
    /// How often the dispatcher checks timers
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_optimistic_timeout_ms() -> u64 {
    10_000
}

fn default_orphan_max_retries() -> u32 {
    3
}

fn default_orphan_backoff_ms() -> u64 {
    200
}

fn default_orphan_buffer() -> usize {
    1_000
}

fn default_tick_interval_ms() -> u64 {
    100
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            optimistic_timeout_ms: default_optimistic_timeout_ms(),
            orphan_max_retries: default_orphan_max_retries(),
            orphan_backoff_ms: default_orphan_backoff_ms(),
            orphan_buffer: default_orphan_buffer(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySection {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

fn default_window_ms() -> u64 {
    3_000
}

fn default_max_records() -> usize {
    500
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_records: default_max_records(),
        }
    }
}

/// Root of `boardsync.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub reconcile: ReconcileSection,
    #[serde(default)]
    pub notify: NotifySection,
}

impl SyncConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse boardsync.toml")
    }

    /// Load from `path` if it exists, defaults otherwise. Environment
    /// overrides are applied either way.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize boardsync.toml")
    }

    /// Apply environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV)
            && !endpoint.trim().is_empty()
        {
            self.transport.endpoint = endpoint;
        }
    }

    /// Reject settings that would disable a hard cap or invert the backoff range.
    pub fn validate(&self) -> Result<()> {
        if self.transport.endpoint.trim().is_empty() {
            anyhow::bail!("transport.endpoint must not be empty");
        }
        if self.connection.emit_buffer == 0 {
            anyhow::bail!("connection.emit_buffer must be at least 1");
        }
        if self.registry.max_namespaces == 0 {
            anyhow::bail!("registry.max_namespaces must be at least 1");
        }
        if self.reconnect.base_delay_ms == 0 {
            anyhow::bail!("reconnect.base_delay_ms must be at least 1");
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            anyhow::bail!(
                "reconnect.base_delay_ms ({}) exceeds reconnect.max_delay_ms ({})",
                self.reconnect.base_delay_ms,
                self.reconnect.max_delay_ms
            );
        }
        if self.reconcile.orphan_buffer == 0 {
            anyhow::bail!("reconcile.orphan_buffer must be at least 1");
        }
        if self.notify.max_records == 0 {
            anyhow::bail!("notify.max_records must be at least 1");
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.connect_timeout_ms)
    }

    pub fn optimistic_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile.optimistic_timeout_ms)
    }

    pub fn orphan_backoff(&self) -> Duration {
        Duration::from_millis(self.reconcile.orphan_backoff_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile.tick_interval_ms.max(1))
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.notify.window_ms)
    }

    /// Retry budget for a namespace; `None` means retry while the context is active.
    pub fn retry_budget(&self, namespace: Namespace) -> Option<u32> {
        if namespace.is_auxiliary() {
            Some(self.reconnect.auxiliary_max_retries)
        } else {
            self.reconnect.critical_max_retries
        }
    }
}
