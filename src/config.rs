use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.toml";
const LEDGER_FILE: &str = "uploading.toml";

/// Engine-wide settings, read from TOML.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub min_block_size: u64,
    pub parallelism: usize,
    pub max_retry: u32,
    /// Bytes per second across all workers of a file, 0 for unlimited.
    pub max_rate: u64,
    pub retry_backoff_unit_ms: u64,
    pub progress_interval_ms: u64,
    pub ledger_flush_interval_ms: u64,
    pub replay_capacity: usize,
    pub ledger_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_block_size: MIN_BLOCK_SIZE,
            parallelism: DEFAULT_PARALLELISM,
            max_retry: DEFAULT_MAX_RETRY,
            max_rate: 0,
            retry_backoff_unit_ms: DEFAULT_RETRY_BACKOFF_UNIT_MS,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            ledger_flush_interval_ms: DEFAULT_LEDGER_FLUSH_INTERVAL_MS,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            ledger_path: None,
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "pcsup")
}

impl EngineConfig {
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    pub fn data_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Reads `path`, or the default location when `path` is `None`. Only an
    /// explicitly given file has to exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(content) => {
                log::debug!("Loaded config from {}", path.display());
                Ok(toml::from_str(&content)?)
            }
            Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn ledger_path(&self) -> Option<PathBuf> {
        self.ledger_path
            .clone()
            .or_else(|| Self::data_dir().map(|dir| dir.join(LEDGER_FILE)))
    }

    pub fn retry_backoff_unit(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_unit_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn ledger_flush_interval(&self) -> Duration {
        Duration::from_millis(self.ledger_flush_interval_ms)
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            parallelism: self.parallelism,
            max_retry: self.max_retry,
            disable_dedup: false,
            disable_splitting: false,
            max_rate: self.max_rate,
        }
    }
}

/// Per-batch options given to `enqueue_transfer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    pub parallelism: usize,
    pub max_retry: u32,
    pub disable_dedup: bool,
    pub disable_splitting: bool,
    pub max_rate: u64,
}

impl Default for TransferOptions {
    fn default() -> Self {
        EngineConfig::default().transfer_options()
    }
}

/// Parses a human rate such as `2MB/s`, `2mb`, `512k` or `1.5m` into bytes
/// per second. Units are binary; a bare number is bytes.
pub fn parse_rate(input: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::Rate(input.to_string());

    let text = input.trim().to_ascii_lowercase();
    let text = text.strip_suffix("/s").unwrap_or(&text).trim_end();
    let text = text.strip_suffix('b').unwrap_or(text);

    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().map_err(|_| invalid())?;

    let scale = match unit.trim() {
        "" => 1,
        "k" | "ki" => KIB,
        "m" | "mi" => MIB,
        "g" | "gi" => GIB,
        _ => return Err(invalid()),
    };

    if !number.is_finite() || number < 0.0 {
        return Err(invalid());
    }
    Ok((number * scale as f64) as u64)
}
