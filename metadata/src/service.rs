//! Transactional access to the entry tree.
//!
//! Every structural write goes through a [`Transaction`]. Reads inside a
//! transaction see its own staged writes. Helpers that write on behalf of a
//! larger operation take the caller's `&mut Transaction` and so join it
//! instead of opening their own; the outermost caller commits once.

use common::{Entry, Error, MetadataConfig, Result, ROOT_ID};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::document::DocumentMetadataStore;
use crate::events::{ChangeBus, EntryEvent};
use crate::mem_store::InMemoryMetadataStore;
use crate::metadata::{MetadataStore, Mutation};
use crate::rocks::RocksMetadataStore;

pub struct MetadataService {
    store: Arc<dyn MetadataStore>,
    bus: ChangeBus,
    commit_lock: Mutex<()>,
}

impl MetadataService {
    /// Wrap a backing, creating the root entry on first use
    pub async fn new(store: Arc<dyn MetadataStore>) -> Result<Self> {
        if store.get(ROOT_ID).await?.is_none() {
            tracing::info!("initializing empty metadata store");
            store.apply(vec![Mutation::Put(Entry::root())]).await?;
        }
        Ok(Self {
            store,
            bus: ChangeBus::default(),
            commit_lock: Mutex::new(()),
        })
    }

    pub async fn from_config(config: &MetadataConfig) -> Result<Self> {
        let store: Arc<dyn MetadataStore> = match config {
            MetadataConfig::Memory => Arc::new(InMemoryMetadataStore::new()),
            MetadataConfig::Rocks { path } => {
                tracing::info!("opening metadata at {}", path);
                Arc::new(RocksMetadataStore::open(path)?)
            }
            MetadataConfig::Document { store } => {
                let objects = backend::UnifiedStore::from_config(store)?;
                Arc::new(DocumentMetadataStore::new(objects))
            }
        };
        Self::new(store).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntryEvent> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            service: self,
            staged: BTreeMap::new(),
            originals: HashMap::new(),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Entry>> {
        self.store.get(id).await
    }

    pub async fn require(&self, id: &str) -> Result<Entry> {
        self.begin().require(id).await
    }

    pub async fn children(&self, parent_id: &str) -> Result<Vec<Entry>> {
        self.begin().children(parent_id).await
    }

    pub async fn find_child(&self, parent_id: &str, name: &str) -> Result<Option<Entry>> {
        self.begin().find_child(parent_id, name).await
    }

    /// Store one entry in its own transaction
    pub async fn put(&self, entry: Entry) -> Result<()> {
        let mut txn = self.begin();
        txn.put(entry).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Remove one entry in its own transaction
    pub async fn remove(&self, id: &str) -> Result<Entry> {
        let mut txn = self.begin();
        let removed = txn.remove(id).await?;
        txn.commit().await?;
        Ok(removed)
    }
}

pub struct Transaction<'a> {
    service: &'a MetadataService,
    /// `None` marks a deletion
    staged: BTreeMap<String, Option<Entry>>,
    /// Committed state of every staged id, for events
    originals: HashMap<String, Option<Entry>>,
}

impl<'a> Transaction<'a> {
    pub async fn get(&self, id: &str) -> Result<Option<Entry>> {
        match self.staged.get(id) {
            Some(staged) => Ok(staged.clone()),
            None => self.service.store.get(id).await,
        }
    }

    pub async fn require(&self, id: &str) -> Result<Entry> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("entry {}", id)))
    }

    /// Immediate children, sorted by name
    pub async fn children(&self, parent_id: &str) -> Result<Vec<Entry>> {
        let mut children: Vec<Entry> = self
            .service
            .store
            .list_children(parent_id)
            .await?
            .into_iter()
            .filter(|child| !self.staged.contains_key(&child.id))
            .collect();
        children.extend(
            self.staged
                .values()
                .flatten()
                .filter(|e| e.parent_id.as_deref() == Some(parent_id))
                .cloned(),
        );
        children.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(children)
    }

    /// Case-insensitive lookup of a child by name
    pub async fn find_child(&self, parent_id: &str, name: &str) -> Result<Option<Entry>> {
        self.check_exist(parent_id, name, None).await
    }

    /// A sibling named `name` (ignoring case) other than `exclude_id`
    pub async fn check_exist(
        &self,
        parent_id: &str,
        name: &str,
        exclude_id: Option<&str>,
    ) -> Result<Option<Entry>> {
        let wanted = name.to_lowercase();
        Ok(self
            .children(parent_id)
            .await?
            .into_iter()
            .find(|c| Some(c.id.as_str()) != exclude_id && c.filename.to_lowercase() == wanted))
    }

    /// Fail with AlreadyExists if `entry` would collide with a sibling
    pub async fn ensure_unique(&self, entry: &Entry) -> Result<()> {
        let Some(parent) = &entry.parent_id else {
            return Ok(());
        };
        match self.check_exist(parent, &entry.filename, Some(&entry.id)).await? {
            Some(existing) => Err(Error::AlreadyExists(format!(
                "{} already exists in {} as {}",
                entry.filename, parent, existing.id
            ))),
            None => Ok(()),
        }
    }

    async fn remember(&mut self, id: &str) -> Result<()> {
        if !self.originals.contains_key(id) {
            let committed = self.service.store.get(id).await?;
            self.originals.insert(id.to_string(), committed);
        }
        Ok(())
    }

    /// Stage a create or update
    pub async fn put(&mut self, entry: Entry) -> Result<()> {
        if entry.is_root() && entry.parent_id.is_some() {
            return Err(Error::InvalidOperation("root cannot have a parent".to_string()));
        }
        if !entry.is_root() && entry.parent_id.is_none() {
            return Err(Error::InvalidOperation(format!(
                "entry {} has no parent",
                entry.id
            )));
        }
        self.remember(&entry.id).await?;
        self.staged.insert(entry.id.clone(), Some(entry));
        Ok(())
    }

    /// Stage a deletion and return the entry being removed
    pub async fn remove(&mut self, id: &str) -> Result<Entry> {
        if id == ROOT_ID {
            return Err(Error::InvalidOperation("cannot delete the root".to_string()));
        }
        let entry = self.require(id).await?;
        self.remember(id).await?;
        self.staged.insert(id.to_string(), None);
        Ok(entry)
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Bump mtime on every ancestor of every touched entry.
    async fn bump_ancestors(&mut self) -> Result<()> {
        let mut parents: Vec<String> = Vec::new();
        for (id, staged) in &self.staged {
            if let Some(parent) = staged.as_ref().and_then(|e| e.parent_id.clone()) {
                parents.push(parent);
            }
            if let Some(parent) = self
                .originals
                .get(id)
                .and_then(|o| o.as_ref())
                .and_then(|e| e.parent_id.clone())
            {
                parents.push(parent);
            }
        }

        let now = common::utils::now();
        let mut visited = HashSet::new();
        for start in parents {
            let mut cursor = Some(start);
            while let Some(id) = cursor {
                if !visited.insert(id.clone()) {
                    break;
                }
                let Some(mut ancestor) = self.get(&id).await? else {
                    break;
                };
                ancestor.mtime = now;
                cursor = ancestor.parent_id.clone();
                self.put(ancestor).await?;
            }
        }
        Ok(())
    }

    /// Apply every staged write and publish the resulting events
    pub async fn commit(mut self) -> Result<Vec<EntryEvent>> {
        if self.staged.is_empty() {
            return Ok(Vec::new());
        }
        let service = self.service;
        let _guard = service.commit_lock.lock().await;

        for entry in self.staged.values().flatten() {
            self.ensure_unique(entry).await?;
        }
        self.bump_ancestors().await?;

        let mut batch = Vec::with_capacity(self.staged.len());
        let mut events = Vec::with_capacity(self.staged.len());
        for (id, staged) in std::mem::take(&mut self.staged) {
            let original = self.originals.remove(&id).flatten();
            match (original, staged) {
                (None, Some(new)) => {
                    events.push(EntryEvent::Created(new.clone()));
                    batch.push(Mutation::Put(new));
                }
                (Some(old), Some(new)) => {
                    events.push(EntryEvent::Changed {
                        new: new.clone(),
                        old,
                    });
                    batch.push(Mutation::Put(new));
                }
                (Some(old), None) => {
                    events.push(EntryEvent::Deleted(old));
                    batch.push(Mutation::Delete(id));
                }
                (None, None) => {}
            }
        }

        service.store.apply(batch).await?;
        tracing::debug!("committed {} metadata changes", events.len());
        for event in &events {
            service.bus.publish(event.clone());
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Part, FOLDER_TYPE};

    async fn service() -> MetadataService {
        MetadataService::new(Arc::new(InMemoryMetadataStore::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_root_is_created_once() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let svc = MetadataService::new(store.clone()).await.unwrap();
        let root = svc.require(ROOT_ID).await.unwrap();
        assert_eq!(root.kind, FOLDER_TYPE);

        let again = MetadataService::new(store).await.unwrap();
        assert_eq!(again.require(ROOT_ID).await.unwrap(), root);
    }

    #[tokio::test]
    async fn test_sibling_names_are_unique_ignoring_case() {
        let svc = service().await;
        svc.put(Entry::new_folder(ROOT_ID, "A")).await.unwrap();

        let err = svc.put(Entry::new_folder(ROOT_ID, "a")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        // a file cannot take a folder's name either
        let file = Entry::new_file(ROOT_ID, "A", "text/plain", "archive");
        assert!(matches!(svc.put(file).await, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_staged_entries_collide_within_a_transaction() {
        let svc = service().await;
        let mut txn = svc.begin();
        txn.put(Entry::new_folder(ROOT_ID, "docs")).await.unwrap();
        txn.put(Entry::new_folder(ROOT_ID, "DOCS")).await.unwrap();
        assert!(matches!(txn.commit().await, Err(Error::AlreadyExists(_))));
        assert!(svc.children(ROOT_ID).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transaction_reads_its_own_writes() {
        let svc = service().await;
        let mut txn = svc.begin();
        let folder = Entry::new_folder(ROOT_ID, "docs");
        let child = Entry::new_folder(&folder.id, "inner");
        txn.put(folder.clone()).await.unwrap();
        txn.put(child.clone()).await.unwrap();

        assert_eq!(txn.children(&folder.id).await.unwrap(), vec![child.clone()]);
        assert!(svc.get(&folder.id).await.unwrap().is_none());

        txn.commit().await.unwrap();
        assert!(svc.get(&child.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_events_are_published_per_entry() {
        let svc = service().await;
        let mut events = svc.subscribe();

        let folder = Entry::new_folder(ROOT_ID, "docs");
        svc.put(folder.clone()).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push((event.label(), event.entry().id.clone()));
        }
        assert!(seen.contains(&("created", folder.id.clone())));
        assert!(seen.contains(&("changed", ROOT_ID.to_string())));

        let mut renamed = folder.clone();
        renamed.filename = "papers".to_string();
        svc.put(renamed).await.unwrap();
        let changed = loop {
            let event = events.try_recv().unwrap();
            if event.entry().id == folder.id {
                break event;
            }
        };
        assert_eq!(changed.previous().unwrap().filename, "docs");

        svc.remove(&folder.id).await.unwrap();
        let deleted = loop {
            let event = events.try_recv().unwrap();
            if event.entry().id == folder.id {
                break event;
            }
        };
        assert!(matches!(deleted, EntryEvent::Deleted(_)));
    }

    #[tokio::test]
    async fn test_mtime_bubbles_to_every_ancestor() {
        let svc = service().await;
        let a = Entry::new_folder(ROOT_ID, "a");
        let b = Entry::new_folder(&a.id, "b");
        svc.put(a.clone()).await.unwrap();
        svc.put(b.clone()).await.unwrap();
        let before = svc.require(ROOT_ID).await.unwrap().mtime;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut file = Entry::new_file(&b.id, "f.bin", "application/octet-stream", "archive");
        file.parts.push(Part {
            message_id: 1,
            original_filename: "f.bin".into(),
            hash: None,
            file_id: "x".into(),
            size: 3,
            index: 0,
            channel: None,
        });
        svc.put(file).await.unwrap();

        let root = svc.require(ROOT_ID).await.unwrap();
        let a_now = svc.require(&a.id).await.unwrap();
        let b_now = svc.require(&b.id).await.unwrap();
        assert!(root.mtime > before);
        assert_eq!(a_now.mtime, b_now.mtime);
        assert_eq!(root.mtime, b_now.mtime);
    }

    #[tokio::test]
    async fn test_root_cannot_be_removed() {
        let svc = service().await;
        assert!(matches!(
            svc.remove(ROOT_ID).await,
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(svc.remove("missing").await, Err(Error::NotFound(_))));
    }
}
