use std::{
    fs::File,
    io::Read,
    path::Path,
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::channel::{MultiChannelOptions, DEFAULT_GRACE_WINDOW, DEFAULT_INBOUND_QUEUE_LEN};

mod ctrl_listeners;
pub use ctrl_listeners::*;

/// Default capacity of each reconnect subscriber queue.
pub const DEFAULT_RECONNECT_QUEUE_LEN: usize = 16;

/// Router node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Identity of this router, used to reject links addressed to itself.
    pub id: String,

    #[serde(default)]
    pub ctrl: CtrlConfig,

    #[serde(default, rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Control channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtrlConfig {
    /// How long a control channel without members waits for a rebind before it is torn down.
    #[serde(default = "default_grace_window_ms", rename = "grace-window-ms")]
    pub grace_window_ms: u64,

    #[serde(default = "default_inbound_queue_len", rename = "inbound-queue-len")]
    pub inbound_queue_len: usize,

    #[serde(default = "default_reconnect_queue_len", rename = "reconnect-queue-len")]
    pub reconnect_queue_len: usize,

    /// Addresses this router accepts control channel connections on.
    #[serde(default)]
    pub listeners: CtrlChanListeners,
}

impl Default for CtrlConfig {
    fn default() -> Self {
        Self {
            grace_window_ms: default_grace_window_ms(),
            inbound_queue_len: default_inbound_queue_len(),
            reconnect_queue_len: default_reconnect_queue_len(),
            listeners: CtrlChanListeners::default(),
        }
    }
}

fn default_grace_window_ms() -> u64 {
    DEFAULT_GRACE_WINDOW.as_millis() as u64
}

fn default_inbound_queue_len() -> usize {
    DEFAULT_INBOUND_QUEUE_LEN
}

fn default_reconnect_queue_len() -> usize {
    DEFAULT_RECONNECT_QUEUE_LEN
}

impl RouterConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ctrl: CtrlConfig::default(),
            log_level: None,
        }
    }

    /// Reads the configuration from a `.toml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut content = String::new();
        File::open(path)
            .with_context(|| format!("failed to open config file {}", path.display()))?
            .read_to_string(&mut content)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        tracing::debug!(path = %path.display(), "Reading configuration file");
        let config: RouterConfig = match ext {
            "toml" => toml::from_str(&content)
                .with_context(|| format!("invalid TOML config {}", path.display()))?,
            "json" => serde_json::from_str(&content)
                .with_context(|| format!("invalid JSON config {}", path.display()))?,
            other => anyhow::bail!("unsupported config file extension {other:?}"),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.id.trim().is_empty(), "router id must not be empty");
        anyhow::ensure!(
            self.ctrl.inbound_queue_len > 0,
            "inbound-queue-len must be greater than zero"
        );
        anyhow::ensure!(
            self.ctrl.reconnect_queue_len > 0,
            "reconnect-queue-len must be greater than zero"
        );
        self.log_level()?;
        Ok(())
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.ctrl.grace_window_ms)
    }

    pub fn channel_options(&self) -> MultiChannelOptions {
        MultiChannelOptions {
            grace_window: self.grace_window(),
            inbound_queue_len: self.ctrl.inbound_queue_len,
        }
    }

    pub fn log_level(&self) -> anyhow::Result<Option<LevelFilter>> {
        self.log_level
            .as_deref()
            .map(|level| {
                LevelFilter::from_str(level)
                    .map_err(|_| anyhow::anyhow!("invalid log level {level:?}"))
            })
            .transpose()
    }
}
