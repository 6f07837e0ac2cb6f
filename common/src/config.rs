use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Transfer granularity of the upload engine.
pub const UPLOAD_CHUNK: usize = 512 * 1024;

/// Alignment of backend reads.
pub const DOWNLOAD_CHUNK: u64 = 1024 * 1024;

/// Object storage selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Amazon S3 or an S3 compatible endpoint
    S3 {
        bucket: String,
        region: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_key_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret_access_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// Google Cloud Storage
    Gcs {
        bucket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_account_path: Option<String>,
    },

    /// Azure Blob Storage
    Azure {
        container: String,
        account: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_key: Option<String>,
    },

    /// Local directory
    Local { root_path: String },

    /// Process memory (for testing)
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub name: String,
    #[serde(default)]
    pub bot: bool,
    #[serde(default = "default_max_parts")]
    pub max_parts_per_blob: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub store: StoreConfig,
    pub identities: Vec<IdentityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_flood_wait_secs")]
    pub max_flood_wait_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_flood_wait_secs: default_max_flood_wait_secs(),
        }
    }
}

/// Where entries are persisted. Chosen once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    Memory,
    Rocks { path: String },
    Document { store: StoreConfig },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub upload_inline_threshold: u64,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: u64,
    pub default_channel: String,
    #[serde(default)]
    pub retry: RetryConfig,
    pub backend: BackendConfig,
    pub metadata: MetadataConfig,
}

fn default_chunk_size() -> usize {
    UPLOAD_CHUNK
}

fn default_read_chunk_size() -> u64 {
    DOWNLOAD_CHUNK
}

fn default_max_parts() -> u32 {
    4000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_max_flood_wait_secs() -> u64 {
    300
}

impl CoreConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let cfg: CoreConfig =
            toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size % 1024 != 0 || UPLOAD_CHUNK % self.chunk_size != 0
        {
            return Err(Error::Config(format!(
                "chunk_size {} must be a multiple of 1024 dividing {}",
                self.chunk_size, UPLOAD_CHUNK
            )));
        }
        if self.upload_inline_threshold % self.chunk_size as u64 != 0 {
            return Err(Error::Config(format!(
                "upload_inline_threshold {} must be a multiple of chunk_size {}",
                self.upload_inline_threshold, self.chunk_size
            )));
        }
        if self.read_chunk_size == 0
            || self.read_chunk_size % 4096 != 0
            || DOWNLOAD_CHUNK % self.read_chunk_size != 0
        {
            return Err(Error::Config(format!(
                "read_chunk_size {} must be a multiple of 4096 dividing {}",
                self.read_chunk_size, DOWNLOAD_CHUNK
            )));
        }
        if self.default_channel.is_empty() {
            return Err(Error::Config("default_channel is required".to_string()));
        }
        if self.backend.identities.is_empty() {
            return Err(Error::Config("at least one backend identity is required".to_string()));
        }
        if let Some(id) = self.backend.identities.iter().find(|i| i.max_parts_per_blob == 0) {
            return Err(Error::Config(format!(
                "identity {} must allow at least one part per blob",
                id.name
            )));
        }
        Ok(())
    }
}
