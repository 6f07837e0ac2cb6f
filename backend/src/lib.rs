//! Backend layer
//!
//! File bytes live on a message-oriented backend: blobs are assembled from
//! fixed-size chunks and posted as messages into channels. This crate holds
//! the per-identity client contract, an implementation over `object_store`
//! and the pool that rotates identities and retries transient failures.

use async_trait::async_trait;
use bytes::Bytes;
use common::Result;

pub mod object_backend;
pub mod pool;
pub mod retry;
pub mod store;

pub use object_backend::ObjectStoreBackend;
pub use pool::{BackendSession, ClientPool, Purpose};
pub use retry::RetryPolicy;
pub use store::UnifiedStore;

/// What an identity learns about itself at login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityInfo {
    pub name: String,
    /// Bots cannot upload blobs.
    pub bot: bool,
    pub max_parts_per_blob: u32,
}

/// A channel resolved against the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelRef {
    pub name: String,
}

/// Readable object behind a posted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub location: String,
    pub size: u64,
}

/// A message carrying one blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedMessage {
    pub message_id: i64,
    pub file_id: String,
    pub object: ObjectRef,
}

/// Handle of a blob whose chunks are still being written.
#[derive(Debug, Clone)]
pub struct BlobUpload {
    pub id: String,
    pub filename: String,
    pub mime: String,
}

impl BlobUpload {
    pub fn new(filename: impl Into<String>, mime: impl Into<String>) -> Self {
        Self {
            id: common::utils::new_object_id(),
            filename: filename.into(),
            mime: mime.into(),
        }
    }
}

/// Operations one authenticated backend identity offers
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Log in and report the identity's limits
    async fn connect(&self) -> Result<IdentityInfo>;

    async fn resolve_channel(&self, channel: &str) -> Result<ChannelRef>;

    /// Write chunk `part_index` of an in-progress blob. The last chunk of a
    /// blob carries the blob's total part count.
    async fn save_chunk(
        &self,
        upload: &BlobUpload,
        part_index: u32,
        declared_total: Option<u32>,
        data: Bytes,
    ) -> Result<()>;

    /// Turn the written chunks into a durable message in `channel`
    async fn finalize_blob(
        &self,
        channel: &ChannelRef,
        upload: &BlobUpload,
        total_parts: u32,
    ) -> Result<PostedMessage>;

    async fn get_message(&self, channel: &ChannelRef, message_id: i64)
        -> Result<Option<PostedMessage>>;

    /// Read `limit` bytes at `offset`. Both must respect the backend's read alignment.
    async fn read_chunk(&self, object: &ObjectRef, offset: u64, limit: u64) -> Result<Bytes>;

    /// Post a copy of a message into another channel
    async fn forward_message(
        &self,
        from: &ChannelRef,
        to: &ChannelRef,
        message_id: i64,
    ) -> Result<PostedMessage>;

    /// Returns how many messages were deleted
    async fn delete_message(&self, channel: &ChannelRef, message_id: i64) -> Result<u32>;

    /// Switch to another endpoint after the backend redirected a call
    async fn redirect(&self, target: &str) -> Result<()> {
        tracing::debug!("ignoring redirect to {}", target);
        Ok(())
    }
}
