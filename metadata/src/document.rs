//! Document store backing over object storage.
//!
//! Each entry is one JSON document at `entries/{id}.json`; an empty marker
//! object at `children/{parent}/{id}` indexes it under its parent. Writes in
//! a batch are issued one by one, consistency is the store's business.

use async_trait::async_trait;
use bytes::Bytes;
use common::{Entry, Error, Result};
use futures::stream::TryStreamExt;
use object_store::{path::Path as ObjectPath, ObjectMeta, ObjectStore};
use std::sync::Arc;

use crate::metadata::{MetadataStore, Mutation};
use crate::utils::{doc_child_path, doc_child_prefix, doc_entry_path};

#[derive(Clone)]
pub struct DocumentMetadataStore {
    store: Arc<dyn ObjectStore>,
}

fn map_store_err(e: object_store::Error) -> Error {
    Error::Metadata(format!("document store error: {}", e))
}

impl DocumentMetadataStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    async fn load(&self, id: &str) -> Result<Option<Entry>> {
        let path = ObjectPath::from(doc_entry_path(id));
        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(map_store_err(e)),
        };
        let body = result.bytes().await.map_err(map_store_err)?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn delete_quiet(&self, path: &str) -> Result<()> {
        match self.store.delete(&ObjectPath::from(path)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_store_err(e)),
        }
    }

    async fn put_entry(&self, entry: &Entry) -> Result<()> {
        let old_parent = self.load(&entry.id).await?.and_then(|old| old.parent_id);

        let body = Bytes::from(serde_json::to_vec(entry)?);
        self.store
            .put(&ObjectPath::from(doc_entry_path(&entry.id)), body.into())
            .await
            .map_err(map_store_err)?;

        if let Some(parent) = &entry.parent_id {
            self.store
                .put(
                    &ObjectPath::from(doc_child_path(parent, &entry.id)),
                    Bytes::new().into(),
                )
                .await
                .map_err(map_store_err)?;
        }
        if let Some(old_parent) = old_parent {
            if entry.parent_id.as_deref() != Some(old_parent.as_str()) {
                self.delete_quiet(&doc_child_path(&old_parent, &entry.id)).await?;
            }
        }
        Ok(())
    }

    async fn delete_entry(&self, id: &str) -> Result<()> {
        if let Some(parent) = self.load(id).await?.and_then(|old| old.parent_id) {
            self.delete_quiet(&doc_child_path(&parent, id)).await?;
        }
        self.delete_quiet(&doc_entry_path(id)).await
    }
}

#[async_trait]
impl MetadataStore for DocumentMetadataStore {
    async fn get(&self, id: &str) -> Result<Option<Entry>> {
        self.load(id).await
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<Entry>> {
        let prefix = ObjectPath::from(doc_child_prefix(parent_id));
        let markers: Vec<ObjectMeta> = self
            .store
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(map_store_err)?;

        let mut children = Vec::with_capacity(markers.len());
        for marker in markers {
            let Some(id) = marker.location.filename() else {
                continue;
            };
            match self.load(id).await? {
                Some(entry) => children.push(entry),
                None => tracing::warn!("dangling child marker {}", marker.location),
            }
        }
        Ok(children)
    }

    async fn apply(&self, batch: Vec<Mutation>) -> Result<()> {
        for mutation in batch {
            match mutation {
                Mutation::Put(entry) => self.put_entry(&entry).await?,
                Mutation::Delete(id) => self.delete_entry(&id).await?,
            }
        }
        Ok(())
    }
}
