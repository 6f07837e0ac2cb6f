use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use common::{Entry, Error, Result};
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::metadata::{MetadataStore, Mutation};
use crate::utils::{kv_child_prefix, kv_key_child, kv_key_entry};

/// RocksDB-backed metadata store for single-node deployments.
#[derive(Clone)]
pub struct RocksMetadataStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksMetadataStore {
    /// Open or create the RocksDB instance located at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path).map_err(map_rocks_err)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn get_entry(&self, id: &str) -> Result<Option<Entry>> {
        let value = self.db.get(kv_key_entry(id)).map_err(map_rocks_err)?;
        value.map(|bytes| decode_value::<Entry>(&bytes)).transpose()
    }

    fn list_children_of(&self, parent_id: &str) -> Result<Vec<Entry>> {
        let prefix = kv_child_prefix(parent_id);
        let mut children = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(&prefix, Direction::Forward));
        for kv in iter {
            let (raw_key, _) = kv.map_err(map_rocks_err)?;
            if !raw_key.starts_with(&prefix) {
                break;
            }
            let id = String::from_utf8_lossy(&raw_key[prefix.len()..]).into_owned();
            if let Some(entry) = self.get_entry(&id)? {
                children.push(entry);
            }
        }
        Ok(children)
    }

    fn apply_batch(&self, batch: Vec<Mutation>) -> Result<()> {
        let mut wb = WriteBatch::default();
        for mutation in batch {
            match mutation {
                Mutation::Put(entry) => {
                    if let Some(old_parent) = self
                        .get_entry(&entry.id)?
                        .and_then(|old| old.parent_id)
                    {
                        if entry.parent_id.as_deref() != Some(old_parent.as_str()) {
                            wb.delete(kv_key_child(&old_parent, &entry.id));
                        }
                    }
                    if let Some(parent) = &entry.parent_id {
                        wb.put(kv_key_child(parent, &entry.id), b"");
                    }
                    wb.put(kv_key_entry(&entry.id), encode_value(&entry)?);
                }
                Mutation::Delete(id) => {
                    if let Some(parent) = self.get_entry(&id)?.and_then(|old| old.parent_id) {
                        wb.delete(kv_key_child(&parent, &id));
                    }
                    wb.delete(kv_key_entry(&id));
                }
            }
        }
        self.db.write(wb).map_err(map_rocks_err)
    }
}

#[async_trait]
impl MetadataStore for RocksMetadataStore {
    async fn get(&self, id: &str) -> Result<Option<Entry>> {
        self.get_entry(id)
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<Entry>> {
        self.list_children_of(parent_id)
    }

    async fn apply(&self, batch: Vec<Mutation>) -> Result<()> {
        self.apply_batch(batch)
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

fn map_rocks_err(err: rocksdb::Error) -> Error {
    Error::Metadata(format!("RocksDB error: {}", err))
}
