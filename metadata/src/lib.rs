//! Metadata management layer
//!
//! Entries are kept in a flat id-keyed store; the parent relation is an id
//! reference resolved on demand. Three backings implement [`MetadataStore`]:
//! - in-memory, for tests and development
//! - RocksDB, an embedded single-file store for one writer process
//! - a document store over object storage, consistent server side
//!
//! [`MetadataService`] wraps the chosen backing with transactional writes,
//! sibling-name uniqueness and the change notification bus.

pub mod document;
pub mod events;
pub mod mem_store;
pub mod metadata;
pub mod rocks;
pub mod service;
pub mod utils;

pub use document::DocumentMetadataStore;
pub use events::{ChangeBus, EntryEvent};
pub use mem_store::InMemoryMetadataStore;
pub use metadata::{MetadataStore, Mutation};
pub use rocks::RocksMetadataStore;
pub use service::{MetadataService, Transaction};
