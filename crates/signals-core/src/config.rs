//! signals.toml configuration parser.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::KeyFormat;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    pub storage: StorageConfig,
    pub encoding: EncodingConfig,
    pub forced_encoding: ForcedEncodingConfig,
    pub eviction: EvictionConfig,
    pub sandbox: SandboxConfig,
    pub fetch: FetchConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `signals.redb`.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/signals"),
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("signals.redb")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    /// Whether the periodic encoding job runs at all.
    pub enabled: bool,
    pub job_period_secs: u64,
    /// Wall-clock limit for a single advertiser's script run.
    pub script_timeout_ms: u64,
    pub max_payload_size_bytes: usize,
    /// Consecutive failures after which an advertiser is no longer encoded.
    pub max_failed_encodings: u32,
    /// Encoders older than this are re-downloaded by the periodic job.
    pub encoder_refresh_window_secs: u64,
    pub argument_format: KeyFormat,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            job_period_secs: 60 * 60,
            script_timeout_ms: 5_000,
            max_payload_size_bytes: 1_536,
            max_failed_encodings: 3,
            encoder_refresh_window_secs: 24 * 60 * 60,
            argument_format: KeyFormat::Hex,
        }
    }
}

impl EncodingConfig {
    pub fn job_period(&self) -> Duration {
        Duration::from_secs(self.job_period_secs)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }

    pub fn encoder_refresh_window(&self) -> Duration {
        Duration::from_secs(self.encoder_refresh_window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForcedEncodingConfig {
    pub enabled: bool,
    /// A payload younger than this suppresses forced re-encoding.
    pub cooldown_secs: u64,
}

impl Default for ForcedEncodingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_secs: 4 * 60 * 60,
        }
    }
}

impl ForcedEncodingConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Target size (key + value bytes) an advertiser is trimmed down to.
    pub max_size_per_buyer_bytes: usize,
    /// Eviction only starts once this ceiling is crossed.
    pub max_oversubscription_per_buyer_bytes: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_size_per_buyer_bytes: 10 * 1024,
            max_oversubscription_per_buyer_bytes: 15 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// JavaScript interpreter executable.
    pub command: String,
    pub args: Vec<String>,
    /// Heap cap for a single script run. `None` leaves the interpreter default.
    pub max_heap_size_bytes: Option<u64>,
    /// Forward `console.*` output of encoder scripts to the log.
    pub console_messages_in_logs: bool,
    /// Node flag enabling its permission model with no grants. Node 20 spells
    /// it `--experimental-permission`. `None` runs node unrestricted.
    pub permission_flag: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: "node".to_string(),
            args: Vec::new(),
            max_heap_size_bytes: Some(10 * 1024 * 1024),
            console_messages_in_logs: false,
            permission_flag: Some("--permission".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_ms: u64,
    /// Response header carrying the encoder version.
    pub version_header: String,
    /// Version recorded when the header is missing or unparsable.
    pub fallback_version: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            version_header: "x_encoder_version".to_string(),
            fallback_version: 0,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl SignalsConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SignalsConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
