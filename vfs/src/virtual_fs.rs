//! Virtual filesystem over the metadata service and the backend pool.
//!
//! Entries are addressed either by id or by slash path. Path resolution
//! walks the tree one case-insensitive sibling lookup at a time. Structural
//! changes go through metadata transactions; backend side effects (uploads,
//! forwards, deletions) are not transactional and are never rolled back.

use async_trait::async_trait;
use backend::{
    BackendClient, BackendSession, ClientPool, ObjectStoreBackend, Purpose, RetryPolicy,
};
use common::utils::{new_entry_id, now};
use common::{
    sanitize_filename, split_parent, split_path, CoreConfig, Entry, EntryState, Error, Part,
    Result, ROOT_ID,
};
use futures::StreamExt;
use metadata::{MetadataService, Transaction};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::download::{inline_stream, Downloader};
use crate::range::ByteRange;
use crate::upload::{PartSink, UploadOutcome, Uploader};
use crate::{ByteStream, FileSystem};

/// Transfer knobs taken from the core configuration
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub inline_threshold: u64,
    pub read_chunk_size: u64,
    pub default_channel: String,
}

impl From<&CoreConfig> for TransferSettings {
    fn from(config: &CoreConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            inline_threshold: config.upload_inline_threshold,
            read_chunk_size: config.read_chunk_size,
            default_channel: config.default_channel.clone(),
        }
    }
}

/// Result of creating a file from a stream
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Created(Entry),
    /// Cancelled through the abort token; the temporary entry is gone
    Aborted,
}

pub struct VirtualFs {
    metadata: Arc<MetadataService>,
    pool: Arc<ClientPool>,
    settings: TransferSettings,
}

/// Appends every sealed part to the entry under construction
struct AppendToEntry<'a> {
    metadata: &'a MetadataService,
    entry_id: String,
}

#[async_trait]
impl<'a> PartSink for AppendToEntry<'a> {
    async fn part_sealed(&self, part: Part) -> Result<()> {
        let mut txn = self.metadata.begin();
        let mut entry = txn.require(&self.entry_id).await?;
        entry.parts.push(part);
        entry.touch();
        txn.put(entry).await?;
        txn.commit().await?;
        Ok(())
    }
}

impl VirtualFs {
    pub fn new(
        metadata: Arc<MetadataService>,
        pool: Arc<ClientPool>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            metadata,
            pool,
            settings,
        }
    }

    /// Log every configured identity in and open the metadata backing
    pub async fn from_config(config: &CoreConfig) -> Result<Self> {
        config.validate()?;
        let clients = ObjectStoreBackend::from_config(&config.backend, config.read_chunk_size)?;
        let pool = ClientPool::with_clients(
            clients
                .into_iter()
                .map(|client| Arc::new(client) as Arc<dyn BackendClient>),
            RetryPolicy::from(&config.retry),
        )
        .await?;
        let metadata = MetadataService::from_config(&config.metadata).await?;
        tracing::info!(
            "virtual filesystem ready with {} identities, default channel {}",
            pool.len(),
            config.default_channel
        );
        Ok(Self::new(
            Arc::new(metadata),
            Arc::new(pool),
            TransferSettings::from(config),
        ))
    }

    pub fn metadata(&self) -> &Arc<MetadataService> {
        &self.metadata
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Resolve a slash path to its entry
    pub async fn resolve(&self, path: &str) -> Result<Entry> {
        let mut current = self.metadata.require(ROOT_ID).await?;
        for name in split_path(path)? {
            if !current.is_folder() {
                return Err(Error::NotFound(format!("{}: {} is not a folder", path, current.filename)));
            }
            current = self
                .metadata
                .find_child(&current.id, &name)
                .await?
                .ok_or_else(|| Error::NotFound(path.to_string()))?;
        }
        Ok(current)
    }

    pub async fn entry(&self, id: &str) -> Result<Entry> {
        self.metadata.require(id).await
    }

    /// The folder followed by its immediate children
    pub async fn list_by_id(&self, id: &str) -> Result<Vec<Entry>> {
        let folder = self.require_folder(id).await?;
        let mut listing = vec![folder];
        listing.extend(self.metadata.children(id).await?);
        Ok(listing)
    }

    async fn require_folder(&self, id: &str) -> Result<Entry> {
        let entry = self.metadata.require(id).await?;
        if !entry.is_folder() {
            return Err(Error::InvalidOperation(format!(
                "{} ({}) is not a folder",
                entry.filename, entry.id
            )));
        }
        Ok(entry)
    }

    /// Channel for new files under `folder_id`: the nearest ancestor channel
    /// below the root, else the configured default.
    pub async fn effective_channel(&self, txn: &Transaction<'_>, folder_id: &str) -> Result<String> {
        let mut cursor = Some(folder_id.to_string());
        while let Some(id) = cursor {
            if id == ROOT_ID {
                break;
            }
            let entry = txn.require(&id).await?;
            if let Some(channel) = entry.channel.as_deref().filter(|c| !c.is_empty()) {
                return Ok(channel.to_string());
            }
            cursor = entry.parent_id;
        }
        Ok(self.settings.default_channel.clone())
    }

    /// Channel the entry's parts live in, unless a part says otherwise
    async fn channel_of(&self, entry: &Entry) -> Result<String> {
        match entry.channel.as_deref().filter(|c| !c.is_empty()) {
            Some(channel) => Ok(channel.to_string()),
            None => {
                let parent = entry.parent_id.as_deref().unwrap_or(ROOT_ID);
                self.effective_channel(&self.metadata.begin(), parent).await
            }
        }
    }

    pub async fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
        channel: Option<&str>,
    ) -> Result<Entry> {
        let mut txn = self.metadata.begin();
        let folder = self.create_folder_in(&mut txn, parent_id, name, channel).await?;
        txn.commit().await?;
        tracing::info!("created folder {} ({})", folder.filename, folder.id);
        Ok(folder)
    }

    async fn create_folder_in(
        &self,
        txn: &mut Transaction<'_>,
        parent_id: &str,
        name: &str,
        channel: Option<&str>,
    ) -> Result<Entry> {
        let parent = txn.require(parent_id).await?;
        if !parent.is_folder() {
            return Err(Error::InvalidOperation(format!("{} is not a folder", parent.filename)));
        }
        let mut folder = Entry::new_folder(parent_id, name);
        if let Some(existing) = txn.check_exist(parent_id, &folder.filename, None).await? {
            return Err(Error::AlreadyExists(format!(
                "{} already exists as {}",
                folder.filename, existing.id
            )));
        }
        folder.channel = channel.map(str::to_string);
        txn.put(folder.clone()).await?;
        Ok(folder)
    }

    /// Create every missing folder along `path` in one transaction
    pub async fn create_folder_all(&self, path: &str) -> Result<Entry> {
        let mut txn = self.metadata.begin();
        let mut current = txn.require(ROOT_ID).await?;
        for name in split_path(path)? {
            current = match txn.find_child(&current.id, &name).await? {
                Some(existing) if existing.is_folder() => existing,
                Some(existing) => {
                    return Err(Error::AlreadyExists(format!(
                        "{} exists and is not a folder",
                        existing.filename
                    )))
                }
                None => self.create_folder_in(&mut txn, &current.id, &name, None).await?,
            };
        }
        txn.commit().await?;
        Ok(current)
    }

    /// Create an empty file in the folder's effective channel
    pub async fn create_file(&self, parent_id: &str, name: &str, mime: &str) -> Result<Entry> {
        let mut txn = self.metadata.begin();
        self.require_folder(parent_id).await?;
        let channel = self.effective_channel(&txn, parent_id).await?;
        let file = Entry::new_file(parent_id, name, mime, &channel);
        txn.ensure_unique(&file).await?;
        txn.put(file.clone()).await?;
        txn.commit().await?;
        Ok(file)
    }

    /// Upload `source` into a new file.
    ///
    /// The file exists as TEMP while the upload runs and gains a part each
    /// time a blob is sealed. An aborted upload removes it; a failed one
    /// leaves it behind to be replaced by the next write of the same name.
    pub async fn create_with_content(
        &self,
        parent_id: &str,
        name: &str,
        mime: &str,
        source: ByteStream,
        abort: CancellationToken,
    ) -> Result<WriteOutcome> {
        let session = self.pool.next_session(Purpose::Upload)?;
        self.require_folder(parent_id).await?;
        let channel_name = self.effective_channel(&self.metadata.begin(), parent_id).await?;
        let channel = session.resolve_channel(&channel_name).await?;

        let mut file = Entry::new_file(parent_id, name, mime, &channel_name);
        file.state = EntryState::Temp;
        let mut txn = self.metadata.begin();
        if let Some(existing) = txn.check_exist(parent_id, &file.filename, None).await? {
            if !existing.is_temp() {
                return Err(Error::AlreadyExists(format!(
                    "{} already exists as {}",
                    file.filename, existing.id
                )));
            }
            tracing::info!("replacing stale temporary entry {}", existing.id);
            txn.remove(&existing.id).await?;
        }
        txn.put(file.clone()).await?;
        txn.commit().await?;

        let sink = AppendToEntry {
            metadata: &self.metadata,
            entry_id: file.id.clone(),
        };
        let outcome = Uploader::new(
            session,
            channel,
            &file.filename,
            mime,
            self.settings.chunk_size,
            self.settings.inline_threshold,
            abort,
            &sink,
        )
        .run(source)
        .await?;

        let content = match outcome {
            UploadOutcome::Aborted => {
                self.metadata.remove(&file.id).await?;
                return Ok(WriteOutcome::Aborted);
            }
            UploadOutcome::Inline(content) => Some(content),
            UploadOutcome::Stored { .. } => None,
        };

        let mut txn = self.metadata.begin();
        let mut file = txn.require(&file.id).await?;
        file.state = EntryState::Active;
        file.content = content;
        file.touch();
        txn.put(file.clone()).await?;
        txn.commit().await?;
        tracing::info!(
            "stored {} ({}, {} bytes, {} parts)",
            file.filename,
            file.id,
            file.size(),
            file.parts.len()
        );
        Ok(WriteOutcome::Created(file))
    }

    /// Stream a file, or the requested range of it
    pub async fn read_entry(
        &self,
        entry: &Entry,
        range: Option<ByteRange>,
        abort: CancellationToken,
    ) -> Result<ByteStream> {
        if entry.is_folder() {
            return Err(Error::InvalidOperation(format!("{} is a folder", entry.filename)));
        }
        let total = entry.size();
        let range = match range {
            Some(range) => {
                range.check(total)?;
                range
            }
            None if total == 0 => return Ok(futures::stream::empty().boxed()),
            None => ByteRange::full(total)?,
        };

        if entry.is_inline() {
            let content = entry.content.clone().unwrap_or_default();
            return Ok(inline_stream(content, range));
        }
        let session = self.pool.next_session(Purpose::Download)?;
        let channel = self.channel_of(entry).await?;
        Ok(Downloader::new(
            session,
            channel,
            entry.parts.clone(),
            range,
            self.settings.read_chunk_size,
            abort,
        )
        .into_stream())
    }

    /// Delete an entry. Folders with children need `recursive`.
    pub async fn delete_entry(&self, id: &str, recursive: bool) -> Result<()> {
        if id == ROOT_ID {
            return Err(Error::InvalidOperation("cannot delete the root".to_string()));
        }
        let target = self.metadata.require(id).await?;

        let mut doomed = Vec::new();
        let mut pending = vec![target];
        while let Some(entry) = pending.pop() {
            if entry.is_folder() {
                let children = self.metadata.children(&entry.id).await?;
                if !children.is_empty() && !recursive {
                    return Err(Error::InvalidOperation(format!(
                        "folder {} is not empty",
                        entry.filename
                    )));
                }
                pending.extend(children);
            }
            doomed.push(entry);
        }

        let session = self.pool.next_session(Purpose::Manage)?;
        for entry in doomed.iter().rev() {
            self.delete_parts(&session, entry).await?;
        }

        let mut txn = self.metadata.begin();
        for entry in doomed.iter().rev() {
            txn.remove(&entry.id).await?;
        }
        txn.commit().await?;
        tracing::info!("deleted {} entries under {}", doomed.len(), id);
        Ok(())
    }

    /// Delete the messages behind a file after checking each one is still
    /// the object the part refers to.
    async fn delete_parts(&self, session: &BackendSession, entry: &Entry) -> Result<()> {
        if entry.is_folder() || entry.parts.is_empty() {
            return Ok(());
        }
        let entry_channel = self.channel_of(entry).await?;
        for part in &entry.parts {
            let channel = session.resolve_channel(part.channel_or(&entry_channel)).await?;
            let message = session
                .get_message(&channel, part.message_id)
                .await?
                .ok_or_else(|| {
                    Error::InvalidOperation(format!(
                        "cannot retrieve message {} of {}",
                        part.message_id, entry.filename
                    ))
                })?;
            if message.file_id != part.file_id {
                return Err(Error::InvalidOperation(format!(
                    "File mismatch on message {} of {}",
                    part.message_id, entry.filename
                )));
            }
            let deleted = session.delete_message(&channel, part.message_id).await?;
            if deleted != 1 {
                return Err(Error::InvalidOperation(format!(
                    "deleting message {} removed {} messages",
                    part.message_id, deleted
                )));
            }
        }
        tracing::info!(
            "deleted {} messages of {} from {}",
            entry.parts.len(),
            entry.filename,
            entry_channel
        );
        Ok(())
    }

    /// Fail if `folder_id` is `id` or lies below it
    async fn ensure_outside(&self, id: &str, folder_id: &str) -> Result<()> {
        let mut cursor = Some(folder_id.to_string());
        while let Some(current) = cursor {
            if current == id {
                return Err(Error::InvalidOperation(format!(
                    "cannot place {} inside itself",
                    id
                )));
            }
            cursor = self.metadata.require(&current).await?.parent_id;
        }
        Ok(())
    }

    /// Move and/or rename. Parts of a file moving to another channel are
    /// forwarded there one by one and the originals deleted.
    pub async fn move_entry(
        &self,
        id: &str,
        new_parent_id: &str,
        new_name: Option<&str>,
    ) -> Result<Entry> {
        if id == ROOT_ID {
            return Err(Error::InvalidOperation("cannot move the root".to_string()));
        }
        let mut entry = self.metadata.require(id).await?;
        self.require_folder(new_parent_id).await?;
        self.ensure_outside(id, new_parent_id).await?;

        let name = new_name
            .map(sanitize_filename)
            .unwrap_or_else(|| entry.filename.clone());
        if let Some(existing) = self
            .metadata
            .begin()
            .check_exist(new_parent_id, &name, Some(id))
            .await?
        {
            return Err(Error::AlreadyExists(format!(
                "{} already exists as {}",
                name, existing.id
            )));
        }

        if !entry.is_folder() {
            let dest = self
                .effective_channel(&self.metadata.begin(), new_parent_id)
                .await?;
            let source = self.channel_of(&entry).await?;
            if !entry.parts.is_empty() && entry.parts.iter().any(|p| p.channel_or(&source) != dest) {
                self.migrate_parts(&mut entry, &source, &dest).await?;
            }
            entry.channel = Some(dest);
            for part in &mut entry.parts {
                part.channel = None;
            }
        }

        let mut txn = self.metadata.begin();
        let mut moved = txn.require(id).await?;
        moved.parent_id = Some(new_parent_id.to_string());
        moved.filename = name;
        moved.channel = entry.channel;
        moved.parts = entry.parts;
        moved.touch();
        txn.put(moved.clone()).await?;
        txn.commit().await?;
        tracing::info!("moved {} to {}/{}", id, new_parent_id, moved.filename);
        Ok(moved)
    }

    /// Forward each part not yet in `dest`, then delete its original.
    /// Progress is saved after every part, so an interrupted migration leaves
    /// parts recorded in whichever channel currently holds them.
    async fn migrate_parts(&self, entry: &mut Entry, source: &str, dest: &str) -> Result<()> {
        let session = self.pool.next_session(Purpose::Manage)?;
        let to = session.resolve_channel(dest).await?;
        for i in 0..entry.parts.len() {
            let current = entry.parts[i].channel_or(source).to_string();
            if current == dest {
                continue;
            }
            let from = session.resolve_channel(&current).await?;
            let old_id = entry.parts[i].message_id;
            let posted = session.forward_message(&from, &to, old_id).await?;

            let part = &mut entry.parts[i];
            part.message_id = posted.message_id;
            part.file_id = posted.file_id;
            part.channel = Some(dest.to_string());
            self.metadata.put(entry.clone()).await?;

            let deleted = session.delete_message(&from, old_id).await?;
            if deleted != 1 {
                tracing::warn!(
                    "message {} in {} was forwarded but {} messages were deleted",
                    old_id,
                    current,
                    deleted
                );
            }
        }
        tracing::info!(
            "migrated {} parts of {} from {} to {}",
            entry.parts.len(),
            entry.filename,
            source,
            dest
        );
        Ok(())
    }

    /// Copy an entry, and a folder's whole subtree, under `new_parent_id`.
    /// Stored parts are forwarded so the source keeps its own messages.
    pub async fn copy_entry(
        &self,
        id: &str,
        new_parent_id: &str,
        new_name: Option<&str>,
    ) -> Result<Entry> {
        if id == ROOT_ID {
            return Err(Error::InvalidOperation("cannot copy the root".to_string()));
        }
        let source = self.metadata.require(id).await?;
        self.require_folder(new_parent_id).await?;
        if source.is_folder() {
            self.ensure_outside(id, new_parent_id).await?;
        }
        let name = new_name
            .map(sanitize_filename)
            .unwrap_or_else(|| source.filename.clone());

        let session = self.pool.next_session(Purpose::Manage)?;
        let mut queue = VecDeque::from([(source, new_parent_id.to_string(), name)]);
        let mut top: Option<Entry> = None;
        while let Some((original, parent_id, name)) = queue.pop_front() {
            let copy = self.copy_one(&session, &original, &parent_id, &name).await?;
            if original.is_folder() {
                for child in self.metadata.children(&original.id).await? {
                    let child_name = child.filename.clone();
                    queue.push_back((child, copy.id.clone(), child_name));
                }
            }
            top.get_or_insert(copy);
        }
        let top = top.ok_or_else(|| Error::NotFound(id.to_string()))?;
        tracing::info!("copied {} to {} ({})", id, top.filename, top.id);
        Ok(top)
    }

    async fn copy_one(
        &self,
        session: &BackendSession,
        original: &Entry,
        parent_id: &str,
        name: &str,
    ) -> Result<Entry> {
        let mut txn = self.metadata.begin();
        if let Some(existing) = txn.check_exist(parent_id, name, None).await? {
            return Err(Error::AlreadyExists(format!(
                "{} already exists as {}",
                name, existing.id
            )));
        }

        let stamp = now();
        let mut copy = Entry {
            id: new_entry_id(),
            filename: name.to_string(),
            parent_id: Some(parent_id.to_string()),
            ctime: stamp,
            mtime: stamp,
            ..original.clone()
        };

        if !original.is_folder() {
            let dest = self.effective_channel(&txn, parent_id).await?;
            if !original.parts.is_empty() {
                let source = self.channel_of(original).await?;
                let to = session.resolve_channel(&dest).await?;
                for part in &mut copy.parts {
                    let from = session.resolve_channel(part.channel_or(&source)).await?;
                    let posted = session.forward_message(&from, &to, part.message_id).await?;
                    part.message_id = posted.message_id;
                    part.file_id = posted.file_id;
                    part.channel = None;
                }
            }
            copy.channel = Some(dest);
        }

        txn.put(copy.clone()).await?;
        txn.commit().await?;
        Ok(copy)
    }

    /// Deepest existing folder along `path` and the names missing below it
    async fn existing_prefix(&self, path: &str) -> Result<(Entry, Vec<String>)> {
        let mut current = self.metadata.require(ROOT_ID).await?;
        let mut names = split_path(path)?.into_iter();
        while let Some(name) = names.next() {
            match self.metadata.find_child(&current.id, &name).await? {
                Some(child) if child.is_folder() => current = child,
                Some(child) => {
                    return Err(Error::AlreadyExists(format!(
                        "{} exists and is not a folder",
                        child.filename
                    )))
                }
                None => {
                    let mut missing = vec![name];
                    missing.extend(names);
                    return Ok((current, missing));
                }
            }
        }
        Ok((current, Vec::new()))
    }

    /// Folder and name that `entry` lands on at `path`. Missing folders on
    /// the way are created, but only once the move or copy is known to be
    /// acceptable.
    async fn destination_of(
        &self,
        entry: &Entry,
        path: &str,
        moving: bool,
    ) -> Result<(Entry, String)> {
        if entry.id == ROOT_ID {
            return Err(Error::InvalidOperation("cannot move or copy the root".to_string()));
        }
        let (parent, name) = split_parent(path)?;
        let (nearest, missing) = self.existing_prefix(&parent).await?;
        if entry.is_folder() {
            self.ensure_outside(&entry.id, &nearest.id).await?;
        }
        if !missing.is_empty() {
            let folder = self.create_folder_all(&parent).await?;
            return Ok((folder, name));
        }

        let exclude = moving.then_some(entry.id.as_str());
        let filename = sanitize_filename(&name);
        if let Some(existing) = self
            .metadata
            .begin()
            .check_exist(&nearest.id, &filename, exclude)
            .await?
        {
            return Err(Error::AlreadyExists(format!(
                "{} already exists as {}",
                filename, existing.id
            )));
        }
        Ok((nearest, name))
    }
}

#[async_trait]
impl FileSystem for VirtualFs {
    async fn list(&self, path: &str) -> Result<Vec<Entry>> {
        let folder = self.resolve(path).await?;
        let mut listing = self.list_by_id(&folder.id).await?;
        listing.remove(0);
        Ok(listing)
    }

    async fn stat(&self, path: &str) -> Result<Entry> {
        self.resolve(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.resolve(path).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn mkdir(&self, path: &str) -> Result<Entry> {
        let (parent, name) = split_parent(path)?;
        let parent = self.resolve(&parent).await?;
        self.create_folder(&parent.id, &name, None).await
    }

    async fn mkdir_all(&self, path: &str) -> Result<Entry> {
        self.create_folder_all(path).await
    }

    async fn create(&self, path: &str, mime: &str) -> Result<Entry> {
        let (parent, name) = split_parent(path)?;
        let parent = self.resolve(&parent).await?;
        self.create_file(&parent.id, &name, mime).await
    }

    async fn write(
        &self,
        path: &str,
        mime: &str,
        source: ByteStream,
        abort: CancellationToken,
    ) -> Result<WriteOutcome> {
        let (parent, name) = split_parent(path)?;
        let parent = self.resolve(&parent).await?;
        self.create_with_content(&parent.id, &name, mime, source, abort)
            .await
    }

    async fn read(
        &self,
        path: &str,
        range: Option<ByteRange>,
        abort: CancellationToken,
    ) -> Result<ByteStream> {
        let entry = self.resolve(path).await?;
        self.read_entry(&entry, range, abort).await
    }

    async fn remove(&self, path: &str, recursive: bool) -> Result<()> {
        let entry = self.resolve(path).await?;
        self.delete_entry(&entry.id, recursive).await
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<Entry> {
        let entry = self.resolve(src).await?;
        let (parent, name) = self.destination_of(&entry, dst, true).await?;
        self.move_entry(&entry.id, &parent.id, Some(&name)).await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<Entry> {
        let entry = self.resolve(src).await?;
        let (parent, name) = self.destination_of(&entry, dst, false).await?;
        self.copy_entry(&entry.id, &parent.id, Some(&name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{chunked, collect, harness, harness_with, payload, Harness};
    use bytes::Bytes;
    use futures::stream;
    use metadata::{EntryEvent, RocksMetadataStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const MIME: &str = "application/octet-stream";

    async fn put(h: &Harness, path: &str, data: &[u8]) -> Entry {
        match h
            .fs
            .write(path, MIME, chunked(data, 700), CancellationToken::new())
            .await
            .unwrap()
        {
            WriteOutcome::Created(entry) => entry,
            WriteOutcome::Aborted => panic!("unexpected abort"),
        }
    }

    async fn get(h: &Harness, path: &str, range: Option<ByteRange>) -> Vec<u8> {
        collect(h.fs.read(path, range, CancellationToken::new()).await.unwrap()).await
    }

    async fn message_exists(h: &Harness, channel: &str, message_id: i64) -> bool {
        let session = h.pool.next_session(Purpose::Manage).unwrap();
        let channel = session.resolve_channel(channel).await.unwrap();
        session.get_message(&channel, message_id).await.unwrap().is_some()
    }

    #[tokio::test]
    async fn test_round_trip_across_blobs() {
        let h = harness().await;
        h.fs.mkdir("/docs").await.unwrap();
        let data = payload(10_000);
        let entry = put(&h, "/docs/a.bin", &data).await;

        assert_eq!(entry.state, EntryState::Active);
        assert_eq!(entry.channel.as_deref(), Some("archive"));
        assert!(entry.parts.len() >= 2);
        assert!(entry.content.is_none());
        assert_eq!(entry.size(), 10_000);
        assert_eq!(get(&h, "/docs/a.bin", None).await, data);
    }

    #[tokio::test]
    async fn test_sampled_ranges() {
        let h = harness().await;
        let data = payload(13_000);
        put(&h, "/a.bin", &data).await;

        for (start, end) in [(0, 0), (1, 4095), (4095, 4097), (3000, 9000), (8191, 8192), (12_999, 12_999)] {
            let range = ByteRange::resolve(Some(start), Some(end), 13_000).unwrap();
            let out = get(&h, "/a.bin", Some(range)).await;
            assert_eq!(out, &data[start as usize..=end as usize], "range {}-{}", start, end);
        }

        let err = h
            .fs
            .read("/a.bin", Some(ByteRange { start: 10, end: 13_000 }), CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidRange { .. }));
    }

    #[tokio::test]
    async fn test_small_file_is_inline() {
        let h = harness().await;
        let data = payload(1500);
        let entry = put(&h, "/note.txt", &data).await;
        assert!(entry.parts.is_empty());
        assert_eq!(entry.content.as_deref(), Some(&data[..]));
        assert_eq!(h.recorder.saves(), 0);

        h.recorder.reset();
        assert_eq!(get(&h, "/note.txt", None).await, data);
        let range = ByteRange::resolve(Some(100), Some(199), 1500).unwrap();
        assert_eq!(get(&h, "/note.txt", Some(range)).await, &data[100..200]);
        assert_eq!(h.recorder.reads(), 0);
        assert!(h.recorder.looked_up().is_empty());
    }

    #[tokio::test]
    async fn test_empty_stream_is_an_empty_file() {
        let h = harness().await;
        let entry = put(&h, "/empty", &[]).await;
        assert_eq!(entry.size(), 0);
        assert_eq!(entry.content.as_deref(), Some(&b""[..]));
        assert!(get(&h, "/empty", None).await.is_empty());
    }

    #[tokio::test]
    async fn test_sibling_names_ignore_case() {
        let h = harness().await;
        h.fs.mkdir("/A").await.unwrap();
        assert!(matches!(h.fs.mkdir("/A").await, Err(Error::AlreadyExists(_))));
        assert!(matches!(h.fs.mkdir("/a").await, Err(Error::AlreadyExists(_))));
        assert!(matches!(h.fs.create("/a", MIME).await, Err(Error::AlreadyExists(_))));

        let err = h
            .fs
            .write("/a", MIME, chunked(b"x", 1), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(h.fs.list("/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recursive_delete() {
        let h = harness().await;
        let inner = h.fs.mkdir_all("/x/y").await.unwrap();
        let big = put(&h, "/x/y/f.bin", &payload(5000)).await;
        put(&h, "/x/small", b"tiny").await;

        let err = h.fs.remove("/x", false).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert!(h.fs.exists("/x/y/f.bin").await.unwrap());
        assert!(message_exists(&h, "archive", big.parts[0].message_id).await);

        h.fs.remove("/x", true).await.unwrap();
        assert!(!h.fs.exists("/x").await.unwrap());
        assert!(h.metadata.get(&inner.id).await.unwrap().is_none());
        assert!(h.metadata.get(&big.id).await.unwrap().is_none());
        for part in &big.parts {
            assert!(!message_exists(&h, "archive", part.message_id).await);
        }
    }

    #[tokio::test]
    async fn test_empty_folder_needs_no_flag() {
        let h = harness().await;
        h.fs.mkdir("/e").await.unwrap();
        h.fs.remove("/e", false).await.unwrap();
        assert!(!h.fs.exists("/e").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_checks_file_ids() {
        let h = harness().await;
        let mut entry = put(&h, "/f.bin", &payload(10_000)).await;
        assert_eq!(entry.parts.len(), 3);
        entry.parts[1].file_id = "tampered".to_string();
        h.metadata.put(entry.clone()).await.unwrap();

        let err = h.fs.remove("/f.bin", false).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(ref m) if m.contains("File mismatch")));
        assert!(h.fs.exists("/f.bin").await.unwrap());
        assert!(!message_exists(&h, "archive", entry.parts[0].message_id).await);
        assert!(message_exists(&h, "archive", entry.parts[2].message_id).await);
    }

    #[tokio::test]
    async fn test_root_is_protected() {
        let h = harness().await;
        h.fs.mkdir("/d").await.unwrap();
        assert!(matches!(h.fs.remove("/", true).await, Err(Error::InvalidOperation(_))));
        let d = h.fs.stat("/d").await.unwrap();
        assert!(matches!(
            h.fs.move_entry(ROOT_ID, &d.id, None).await,
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            h.fs.copy_entry(ROOT_ID, &d.id, None).await,
            Err(Error::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_move_within_channel_keeps_messages() {
        let h = harness().await;
        h.fs.mkdir("/a").await.unwrap();
        h.fs.mkdir("/b").await.unwrap();
        let data = payload(5000);
        let before = put(&h, "/a/f.bin", &data).await;

        let moved = h.fs.rename("/a/f.bin", "/b/g.bin").await.unwrap();
        assert_eq!(moved.id, before.id);
        assert_eq!(moved.filename, "g.bin");
        assert_eq!(moved.parts, before.parts);
        assert_eq!(h.recorder.forwards(), 0);
        assert!(!h.fs.exists("/a/f.bin").await.unwrap());
        assert_eq!(get(&h, "/b/g.bin", None).await, data);
    }

    #[tokio::test]
    async fn test_move_across_channels_forwards_parts() {
        let h = harness().await;
        h.fs.create_folder(ROOT_ID, "vault", Some("vault")).await.unwrap();
        let data = payload(9000);
        let before = put(&h, "/f.bin", &data).await;

        let moved = h.fs.rename("/f.bin", "/vault/f.bin").await.unwrap();
        assert_eq!(h.recorder.forwards(), before.parts.len());
        assert_eq!(moved.channel.as_deref(), Some("vault"));
        assert!(moved.parts.iter().all(|p| p.channel.is_none()));
        let indexes: Vec<u32> = moved.parts.iter().map(|p| p.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        for part in &before.parts {
            assert!(!message_exists(&h, "archive", part.message_id).await);
        }
        assert_eq!(get(&h, "/vault/f.bin", None).await, data);
    }

    #[tokio::test]
    async fn test_move_into_own_subtree_fails() {
        let h = harness().await;
        h.fs.mkdir_all("/a/b").await.unwrap();
        let err = h.fs.rename("/a", "/a/b/a").await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        let err = h.fs.rename("/a", "/a/a").await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert!(h.fs.exists("/a/b").await.unwrap());
    }

    #[tokio::test]
    async fn test_move_creates_missing_parents() {
        let h = harness().await;
        put(&h, "/f", b"hello").await;
        h.fs.rename("/f", "/deep/er/f").await.unwrap();
        assert!(h.fs.stat("/deep/er").await.unwrap().is_folder());
        assert_eq!(get(&h, "/deep/er/f", None).await, b"hello");
    }

    #[tokio::test]
    async fn test_rejected_move_leaves_no_new_folders() {
        let h = harness().await;
        h.fs.mkdir_all("/a/b").await.unwrap();

        let err = h.fs.rename("/a", "/a/b/c/d/a").await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert!(!h.fs.exists("/a/b/c").await.unwrap());

        let err = h.fs.copy("/a", "/a/x/a").await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert!(!h.fs.exists("/a/x").await.unwrap());

        let err = h.fs.rename("/missing", "/y/z").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!h.fs.exists("/y").await.unwrap());
    }

    #[tokio::test]
    async fn test_interrupted_migration_keeps_file_readable() {
        let h = harness().await;
        h.fs.create_folder(ROOT_ID, "vault", Some("vault")).await.unwrap();
        let data = payload(9000);
        let before = put(&h, "/f.bin", &data).await;
        assert_eq!(before.parts.len(), 3);

        h.recorder.break_forward(2);
        let err = h.fs.rename("/f.bin", "/vault/f.bin").await.unwrap_err();
        assert!(matches!(err, Error::BackendFatal(_)));

        // the move itself never landed, but part 0 already lives in the vault
        assert!(!h.fs.exists("/vault/f.bin").await.unwrap());
        let stored = h.fs.stat("/f.bin").await.unwrap();
        assert_eq!(stored.channel.as_deref(), Some("archive"));
        assert_eq!(stored.parts[0].channel.as_deref(), Some("vault"));
        assert!(message_exists(&h, "vault", stored.parts[0].message_id).await);
        assert!(!message_exists(&h, "archive", before.parts[0].message_id).await);
        for part in &stored.parts[1..] {
            assert_eq!(part.channel_or("archive"), "archive");
            assert!(message_exists(&h, "archive", part.message_id).await);
        }
        assert_eq!(get(&h, "/f.bin", None).await, data);

        // retrying finishes the remaining parts
        let moved = h.fs.rename("/f.bin", "/vault/f.bin").await.unwrap();
        assert!(moved.parts.iter().all(|p| p.channel.is_none()));
        assert_eq!(get(&h, "/vault/f.bin", None).await, data);
    }

    #[tokio::test]
    async fn test_rename_onto_existing_sibling_fails() {
        let h = harness().await;
        put(&h, "/one", b"1").await;
        put(&h, "/two", b"2").await;
        let err = h.fs.rename("/one", "/TWO").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        // changing only the case of its own name is fine
        h.fs.rename("/one", "/ONE").await.unwrap();
        assert_eq!(h.fs.stat("/one").await.unwrap().filename, "ONE");
    }

    #[tokio::test]
    async fn test_copy_folder_tree() {
        let h = harness().await;
        h.fs.mkdir("/src").await.unwrap();
        let big_data = payload(5000);
        let big = put(&h, "/src/big", &big_data).await;
        h.fs.mkdir("/src/sub").await.unwrap();
        put(&h, "/src/sub/small", b"small").await;

        let copy = h.fs.copy("/src", "/dst").await.unwrap();
        assert_ne!(copy.id, h.fs.stat("/src").await.unwrap().id);
        assert_eq!(h.recorder.forwards(), big.parts.len());

        let copied = h.fs.stat("/dst/big").await.unwrap();
        assert_ne!(copied.id, big.id);
        assert_ne!(copied.parts[0].message_id, big.parts[0].message_id);
        assert_eq!(get(&h, "/dst/big", None).await, big_data);
        assert_eq!(get(&h, "/src/big", None).await, big_data);
        assert_eq!(get(&h, "/dst/sub/small", None).await, b"small");

        let err = h.fs.copy("/src", "/src/sub/again").await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_stale_temp_entry_is_replaced() {
        let h = harness().await;
        let mut stale = Entry::new_file(ROOT_ID, "f.bin", MIME, "archive");
        stale.state = EntryState::Temp;
        h.metadata.put(stale.clone()).await.unwrap();

        let entry = put(&h, "/F.bin", b"fresh").await;
        assert_ne!(entry.id, stale.id);
        assert!(h.metadata.get(&stale.id).await.unwrap().is_none());
        let listing = h.fs.list("/").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].state, EntryState::Active);

        let err = h
            .fs
            .write("/f.bin", MIME, chunked(b"again", 5), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_abort_removes_temp_entry() {
        let h = harness().await;
        let abort = CancellationToken::new();
        let saves_at_abort = Arc::new(AtomicUsize::new(usize::MAX));
        let source = {
            let abort = abort.clone();
            let recorder = h.recorder.clone();
            let saves_at_abort = saves_at_abort.clone();
            stream::iter(0..40u8)
                .map(move |i| {
                    if i == 12 {
                        saves_at_abort.store(recorder.saves(), Ordering::SeqCst);
                        abort.cancel();
                    }
                    Ok(Bytes::from(vec![i; 512]))
                })
                .boxed()
        };

        let outcome = h.fs.write("/f.bin", MIME, source, abort).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Aborted);
        assert_eq!(h.recorder.saves(), saves_at_abort.load(Ordering::SeqCst));
        assert!(!h.fs.exists("/f.bin").await.unwrap());
        assert!(h.fs.list("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_during_flood_wait_removes_temp_entry() {
        let h = harness().await;
        h.recorder.flood_on_save(2, Duration::from_secs(60));
        let abort = CancellationToken::new();
        {
            let abort = abort.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                abort.cancel();
            });
        }

        let outcome = h
            .fs
            .write("/f.bin", MIME, chunked(&payload(10_000), 700), abort)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Aborted);
        assert_eq!(h.recorder.saves(), 2);
        assert!(!h.fs.exists("/f.bin").await.unwrap());
    }

    #[tokio::test]
    async fn test_channel_is_inherited() {
        let h = harness().await;
        h.fs.create_folder(ROOT_ID, "media", Some("media")).await.unwrap();
        h.fs.mkdir_all("/media/x/y").await.unwrap();
        let nested = h.fs.create("/media/x/y/f", MIME).await.unwrap();
        assert_eq!(nested.channel.as_deref(), Some("media"));
        let top = h.fs.create("/other", MIME).await.unwrap();
        assert_eq!(top.channel.as_deref(), Some("archive"));

        let stored = put(&h, "/media/x/movie", &payload(5000)).await;
        assert_eq!(stored.channel.as_deref(), Some("media"));
        assert!(message_exists(&h, "media", stored.parts[0].message_id).await);

        // an entry without its own channel reads from the inherited one
        let mut bare = stored.clone();
        bare.channel = None;
        h.metadata.put(bare).await.unwrap();
        assert_eq!(get(&h, "/media/x/movie", None).await, payload(5000));
    }

    #[tokio::test]
    async fn test_list_by_id() {
        let h = harness().await;
        let d = h.fs.mkdir("/d").await.unwrap();
        h.fs.create("/d/b", MIME).await.unwrap();
        let a = h.fs.create("/d/a", MIME).await.unwrap();

        let listing = h.fs.list_by_id(&d.id).await.unwrap();
        let names: Vec<&str> = listing.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["d", "a", "b"]);
        assert!(matches!(
            h.fs.list_by_id(&a.id).await,
            Err(Error::InvalidOperation(_))
        ));
        assert_eq!(h.fs.entry(&a.id).await.unwrap(), a);
    }

    #[tokio::test]
    async fn test_writes_publish_events() {
        let h = harness().await;
        let mut rx = h.metadata.subscribe();
        let folder = h.fs.mkdir("/e").await.unwrap();
        h.fs.remove("/e", false).await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, EntryEvent::Created(entry) if entry.id == folder.id)));
        assert!(events
            .iter()
            .any(|e| matches!(e, EntryEvent::Changed { new, .. } if new.id == ROOT_ID)));
        assert!(events
            .iter()
            .any(|e| matches!(e, EntryEvent::Deleted(entry) if entry.id == folder.id)));
    }

    #[tokio::test]
    async fn test_rocks_backed_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksMetadataStore::open(dir.path().join("meta")).unwrap();
        let h = harness_with(Arc::new(store)).await;

        let data = payload(6000);
        h.fs.mkdir("/r").await.unwrap();
        put(&h, "/r/x.bin", &data).await;
        assert_eq!(get(&h, "/r/x.bin", None).await, data);
        let names: Vec<String> = h
            .fs
            .list("/r")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.filename)
            .collect();
        assert_eq!(names, vec!["x.bin"]);
    }
}
