//! Storage credentials and sync tuning.
//!
//! Configuration is loaded once by the host application and injected into
//! the storage client and [`crate::Reconciler`]; nothing in this crate reads
//! configuration on its own.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::tombstones::DEFAULT_TOMBSTONE_LIMIT;

/// Default object key prefix shared by every remote object.
pub const DEFAULT_ROOT: &str = "freeeditor";

/// Default number of concurrent content transfers during a sync.
pub const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Object storage is not configured")]
    Missing,

    #[error("Incomplete storage configuration: {0} is empty")]
    Incomplete(&'static str),

    #[error("Invalid option: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Object storage credentials.
///
/// Same shape as the editor's image-bed settings, so a settings export can be
/// used directly.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    pub region: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub bucket: String,
    /// Override for the API endpoint host (defaults to `{region}.aliyuncs.com`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Base URL used when building public image links
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,
}

impl StorageConfig {
    /// Check that every credential field is present.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("region", &self.region),
            ("accessKeyId", &self.access_key_id),
            ("accessKeySecret", &self.access_key_secret),
            ("bucket", &self.bucket),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(ConfigError::Incomplete(name));
            }
        }
        Ok(())
    }

    /// API host for bucket-scoped requests.
    pub fn endpoint_host(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string(),
            None => format!("{}.aliyuncs.com", self.region),
        }
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("public_base_url", &self.public_base_url)
            .finish()
    }
}

/// Tuning for the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    /// Key prefix for every remote object
    pub root: String,
    /// Maximum in-flight content downloads/uploads
    pub concurrency: usize,
    /// Maximum retained tombstones per kind
    pub tombstone_limit: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            tombstone_limit: DEFAULT_TOMBSTONE_LIMIT,
        }
    }
}

impl SyncOptions {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.root.trim_matches('/').is_empty() {
            return Err(ConfigError::Invalid("root prefix must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> StorageConfig {
        StorageConfig {
            region: "oss-cn-hangzhou".into(),
            access_key_id: "id".into(),
            access_key_secret: "secret".into(),
            bucket: "notes".into(),
            endpoint: None,
            public_base_url: None,
        }
    }

    #[test]
    fn test_validate_reports_first_missing_field() {
        assert!(complete().validate().is_ok());

        let mut config = complete();
        config.access_key_secret = "  ".into();
        assert_eq!(
            config.validate(),
            Err(ConfigError::Incomplete("accessKeySecret"))
        );
    }

    #[test]
    fn test_debug_redacts_secret() {
        let printed = format!("{:?}", complete());
        assert!(!printed.contains("\"secret\""));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_endpoint_host() {
        let mut config = complete();
        assert_eq!(config.endpoint_host(), "oss-cn-hangzhou.aliyuncs.com");

        config.endpoint = Some("https://minio.local:9000/".into());
        assert_eq!(config.endpoint_host(), "minio.local:9000");
    }

    #[test]
    fn test_parses_image_bed_settings() {
        let json = r#"{"region":"oss-cn-beijing","accessKeyId":"a","accessKeySecret":"b","bucket":"c"}"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.bucket, "c");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_options_validation() {
        assert!(SyncOptions::default().validate().is_ok());
        let options = SyncOptions {
            concurrency: 0,
            ..SyncOptions::default()
        };
        assert!(options.validate().is_err());
    }
}
