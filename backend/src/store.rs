//! Object store construction from configuration.
//!
//! Used for the message backend itself and for the document metadata backing.

use common::{Error, Result, StoreConfig};
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use std::sync::Arc;

pub struct UnifiedStore;

fn build_err(kind: &str, e: object_store::Error) -> Error {
    Error::Config(format!("cannot open {} store: {}", kind, e))
}

impl UnifiedStore {
    pub fn from_config(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
        tracing::info!("opening {} object store", Self::describe(config));
        let store: Arc<dyn ObjectStore> = match config {
            StoreConfig::S3 {
                bucket,
                region,
                access_key_id,
                secret_access_key,
                endpoint,
            } => {
                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_region(region);
                if let Some(id) = access_key_id {
                    builder = builder.with_access_key_id(id);
                }
                if let Some(secret) = secret_access_key {
                    builder = builder.with_secret_access_key(secret);
                }
                // custom endpoints (MinIO and friends) want path-style requests
                if let Some(endpoint) = endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"))
                        .with_virtual_hosted_style_request(false);
                }
                Arc::new(builder.build().map_err(|e| build_err("s3", e))?)
            }
            StoreConfig::Gcs {
                bucket,
                service_account_path,
            } => {
                let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(bucket);
                if let Some(path) = service_account_path {
                    builder = builder.with_service_account_path(path);
                }
                Arc::new(builder.build().map_err(|e| build_err("gcs", e))?)
            }
            StoreConfig::Azure {
                container,
                account,
                access_key,
            } => {
                let mut builder = MicrosoftAzureBuilder::new()
                    .with_container_name(container)
                    .with_account(account);
                if let Some(key) = access_key {
                    builder = builder.with_access_key(key);
                }
                Arc::new(builder.build().map_err(|e| build_err("azure", e))?)
            }
            StoreConfig::Local { root_path } => {
                std::fs::create_dir_all(root_path)?;
                Arc::new(
                    LocalFileSystem::new_with_prefix(root_path)
                        .map_err(|e| build_err("local", e))?,
                )
            }
            StoreConfig::Memory => Arc::new(InMemory::new()),
        };
        Ok(store)
    }

    /// Short human readable location, for logs
    pub fn describe(config: &StoreConfig) -> String {
        match config {
            StoreConfig::S3 { bucket, .. } => format!("s3://{}", bucket),
            StoreConfig::Gcs { bucket, .. } => format!("gs://{}", bucket),
            StoreConfig::Azure {
                account, container, ..
            } => format!("azure://{}/{}", account, container),
            StoreConfig::Local { root_path } => format!("local:{}", root_path),
            StoreConfig::Memory => "memory".to_string(),
        }
    }
}
