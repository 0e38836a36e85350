//! Image hosting: upload pasted images and hand back a public link.

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, StorageConfig};
use crate::layout::RemoteLayout;
use crate::store::{ObjectStore, StoreError};

const SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 6;
const DEFAULT_EXTENSION: &str = "png";

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Image is empty: {0}")]
    Empty(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, MediaError>;

/// Lowercased extension of `file_name`, `png` when there is none.
pub fn extension(file_name: &str) -> String {
    let base = file_name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(file_name);
    match base.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            ext.to_ascii_lowercase()
        }
        _ => DEFAULT_EXTENSION.to_string(),
    }
}

/// Six random lowercase base-36 characters.
pub fn random_suffix() -> String {
    let mut rng = rand::rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

/// Key an image named `file_name` is stored under.
pub fn image_key(layout: &RemoteLayout, now: DateTime<Utc>, suffix: &str, file_name: &str) -> String {
    layout.image_key(now, suffix, &extension(file_name))
}

/// Public link for an object, without any signature.
pub fn public_url(config: &StorageConfig, key: &str) -> String {
    match &config.public_base_url {
        Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
        None => format!(
            "https://{}.{}.aliyuncs.com/{}",
            config.bucket, config.region, key
        ),
    }
}

/// Upload an image and return the key it was stored under.
pub async fn upload_image<S: ObjectStore + ?Sized>(
    store: &S,
    layout: &RemoteLayout,
    file_name: &str,
    bytes: &[u8],
) -> Result<String> {
    if bytes.is_empty() {
        return Err(MediaError::Empty(file_name.to_string()));
    }

    let key = image_key(layout, Utc::now(), &random_suffix(), file_name);
    store.put(&key, bytes).await?;
    info!("Uploaded image {} as {}", file_name, key);
    Ok(key)
}

/// Upload an image to the configured bucket and return its public URL.
pub async fn upload_image_url<S: ObjectStore + ?Sized>(
    store: &S,
    layout: &RemoteLayout,
    config: &StorageConfig,
    file_name: &str,
    bytes: &[u8],
) -> Result<String> {
    config.validate()?;
    let key = upload_image(store, layout, file_name, bytes).await?;
    Ok(public_url(config, &key))
}
