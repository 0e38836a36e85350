//! Daemon configuration.
//!
//! Loaded once at startup from a JSON file, then overridden field by field
//! from CLI flags / environment variables:
//!
//! ```json
//! {
//!   "storage": { "region": "oss-cn-hangzhou", "accessKeyId": "...",
//!                "accessKeySecret": "...", "bucket": "notes" },
//!   "root": "freeeditor",
//!   "concurrency": 8,
//!   "intervalSecs": 300
//! }
//! ```
//!
//! `localBucket` (a directory) takes precedence over `storage`.

use anyhow::{Context, Result, anyhow};
use clap::Args;
use notes_sync::{ConfigError, StorageConfig, SyncOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
    /// Directory used as the bucket instead of OSS
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_bucket: Option<PathBuf>,
    #[serde(flatten)]
    pub sync: SyncOptions,
    /// Seconds between syncs in `run` mode
    pub interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            storage: None,
            local_bucket: None,
            sync: SyncOptions::default(),
            interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }
}

/// Where remote objects live.
#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    Local(PathBuf),
    Oss(StorageConfig),
}

/// Per-field overrides, from flags or `NOTES_*` environment variables.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// OSS region, e.g. oss-cn-hangzhou
    #[arg(long, env = "NOTES_OSS_REGION", global = true)]
    pub region: Option<String>,

    #[arg(long, env = "NOTES_OSS_ACCESS_KEY_ID", global = true)]
    pub access_key_id: Option<String>,

    #[arg(long, env = "NOTES_OSS_ACCESS_KEY_SECRET", hide_env_values = true, global = true)]
    pub access_key_secret: Option<String>,

    #[arg(long, env = "NOTES_OSS_BUCKET", global = true)]
    pub bucket: Option<String>,

    /// API endpoint host (defaults to {region}.aliyuncs.com)
    #[arg(long, env = "NOTES_OSS_ENDPOINT", global = true)]
    pub endpoint: Option<String>,

    /// Base URL for public image links
    #[arg(long, env = "NOTES_PUBLIC_BASE_URL", global = true)]
    pub public_base_url: Option<String>,

    /// Use a local directory as the bucket
    #[arg(long, env = "NOTES_LOCAL_BUCKET", global = true)]
    pub local_bucket: Option<PathBuf>,

    /// Key prefix for every remote object
    #[arg(long, env = "NOTES_ROOT", global = true)]
    pub root: Option<String>,

    /// Maximum concurrent transfers per sync
    #[arg(long, env = "NOTES_CONCURRENCY", global = true)]
    pub concurrency: Option<usize>,

    /// Seconds between syncs in `run` mode
    #[arg(long, env = "NOTES_INTERVAL_SECS", global = true)]
    pub interval_secs: Option<u64>,
}

impl DaemonConfig {
    /// Read a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Config file if one was given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        let storage_fields = [
            &overrides.region,
            &overrides.access_key_id,
            &overrides.access_key_secret,
            &overrides.bucket,
            &overrides.endpoint,
            &overrides.public_base_url,
        ];
        if storage_fields.iter().any(|field| field.is_some()) {
            let storage = self.storage.get_or_insert_with(StorageConfig::default);
            set(&mut storage.region, &overrides.region);
            set(&mut storage.access_key_id, &overrides.access_key_id);
            set(&mut storage.access_key_secret, &overrides.access_key_secret);
            set(&mut storage.bucket, &overrides.bucket);
            if overrides.endpoint.is_some() {
                storage.endpoint = overrides.endpoint.clone();
            }
            if overrides.public_base_url.is_some() {
                storage.public_base_url = overrides.public_base_url.clone();
            }
        }

        if overrides.local_bucket.is_some() {
            self.local_bucket = overrides.local_bucket.clone();
        }
        set(&mut self.sync.root, &overrides.root);
        if let Some(concurrency) = overrides.concurrency {
            self.sync.concurrency = concurrency;
        }
        if let Some(interval) = overrides.interval_secs {
            self.interval_secs = interval;
        }
    }

    /// Validate everything and pick the backend.
    pub fn backend(&self) -> Result<Backend> {
        self.sync.validate()?;
        if let Some(dir) = &self.local_bucket {
            return Ok(Backend::Local(dir.clone()));
        }
        let storage = self
            .storage
            .as_ref()
            .ok_or(ConfigError::Missing)
            .context("Set a local bucket or OSS credentials")?;
        storage.validate()?;
        Ok(Backend::Oss(storage.clone()))
    }

    pub fn interval(&self) -> Result<Duration> {
        if self.interval_secs == 0 {
            return Err(anyhow!("Sync interval must be at least one second"));
        }
        Ok(Duration::from_secs(self.interval_secs))
    }
}

fn set(target: &mut String, value: &Option<String>) {
    if let Some(value) = value {
        *target = value.clone();
    }
}
