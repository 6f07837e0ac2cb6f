//! Simple in-memory metadata store for testing and development

use crate::metadata::{MetadataStore, Mutation};
use async_trait::async_trait;
use common::{Entry, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory metadata store
#[derive(Clone, Default)]
pub struct InMemoryMetadataStore {
    data: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get(&self, id: &str) -> Result<Option<Entry>> {
        let data = self.data.read().await;
        Ok(data.get(id).cloned())
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<Entry>> {
        let data = self.data.read().await;
        let children: Vec<Entry> = data
            .values()
            .filter(|e| e.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        Ok(children)
    }

    async fn apply(&self, batch: Vec<Mutation>) -> Result<()> {
        let mut data = self.data.write().await;
        for mutation in batch {
            match mutation {
                Mutation::Put(entry) => {
                    data.insert(entry.id.clone(), entry);
                }
                Mutation::Delete(id) => {
                    data.remove(&id);
                }
            }
        }
        Ok(())
    }
}
