//! Virtual File System layer
//!
//! This crate provides the hierarchical file store on top of the metadata
//! service and the backend pool:
//! - path resolution and channel inheritance
//! - the upload engine (inline small files, chunked blobs for the rest)
//! - the range-addressable download engine
//! - create, list, delete, move and copy orchestration
//! - mirroring a local directory tree into a folder

use async_trait::async_trait;
use bytes::Bytes;
use common::{Entry, Result};
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

pub mod download;
pub mod range;
pub mod sync;
pub mod upload;
pub mod virtual_fs;

#[cfg(test)]
mod testkit;

pub use range::ByteRange;
pub use sync::{sync_dir, SyncOptions, SyncReport};
pub use virtual_fs::{TransferSettings, VirtualFs, WriteOutcome};

/// Stream of file bytes, in order
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Path based filesystem operations
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// List the immediate children of a folder
    async fn list(&self, path: &str) -> Result<Vec<Entry>>;

    /// Resolve a path to its entry
    async fn stat(&self, path: &str) -> Result<Entry>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create a folder; the parent must exist
    async fn mkdir(&self, path: &str) -> Result<Entry>;

    /// Create a folder and any missing ancestors
    async fn mkdir_all(&self, path: &str) -> Result<Entry>;

    /// Create an empty file
    async fn create(&self, path: &str, mime: &str) -> Result<Entry>;

    /// Create a file from a byte stream
    async fn write(
        &self,
        path: &str,
        mime: &str,
        source: ByteStream,
        abort: CancellationToken,
    ) -> Result<WriteOutcome>;

    /// Read a file, or a range of it
    async fn read(
        &self,
        path: &str,
        range: Option<ByteRange>,
        abort: CancellationToken,
    ) -> Result<ByteStream>;

    /// Remove a file or folder. Non-empty folders need `recursive`.
    async fn remove(&self, path: &str, recursive: bool) -> Result<()>;

    /// Move or rename
    async fn rename(&self, src: &str, dst: &str) -> Result<Entry>;

    async fn copy(&self, src: &str, dst: &str) -> Result<Entry>;
}
