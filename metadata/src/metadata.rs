//! Metadata storage trait
//!
//! This module defines the interface every metadata backing implements.
//! Validation, events and transactions live above it in the service.

use async_trait::async_trait;
use common::{Entry, Result};

/// One change inside an atomic batch
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Put(Entry),
    Delete(String),
}

/// Trait for metadata storage operations
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Get an entry by id
    async fn get(&self, id: &str) -> Result<Option<Entry>>;

    /// List the immediate children of a folder
    async fn list_children(&self, parent_id: &str) -> Result<Vec<Entry>>;

    /// Apply a batch. Atomic where the backing supports it.
    async fn apply(&self, batch: Vec<Mutation>) -> Result<()>;
}
