//! Message backend emulated on object storage.
//!
//! Channels are top-level prefixes and every message is a single object at
//! `{channel}/{message_id:012}/{file_id}`. Chunks of an unfinished blob are
//! staged under `_staging/{upload_id}/` and stitched together by a multipart
//! write when the blob is finalized.

use async_trait::async_trait;
use bytes::Bytes;
use common::{BackendConfig, Error, IdentityConfig, Result};
use futures::stream::TryStreamExt;
use object_store::{path::Path as ObjectPath, ObjectMeta, ObjectStore, WriteMultipart};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::store::UnifiedStore;
use crate::{BackendClient, BlobUpload, ChannelRef, IdentityInfo, ObjectRef, PostedMessage};

const STAGING_PREFIX: &str = "_staging";

/// State shared by every identity built over the same store.
struct Shared {
    store: Arc<dyn ObjectStore>,
    read_chunk_size: u64,
    next_message_ids: Mutex<HashMap<String, i64>>,
    declared_totals: Mutex<HashMap<String, u32>>,
}

impl Shared {
    fn new(store: Arc<dyn ObjectStore>, read_chunk_size: u64) -> Self {
        Self {
            store,
            read_chunk_size,
            next_message_ids: Mutex::new(HashMap::new()),
            declared_totals: Mutex::new(HashMap::new()),
        }
    }
}

#[derive(Clone)]
pub struct ObjectStoreBackend {
    identity: IdentityConfig,
    shared: Arc<Shared>,
}

fn map_store_err(op: &str, e: object_store::Error) -> Error {
    Error::BackendFatal(format!("{} failed: {}", op, e))
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, identity: IdentityConfig, read_chunk_size: u64) -> Self {
        Self {
            identity,
            shared: Arc::new(Shared::new(store, read_chunk_size)),
        }
    }

    /// One client per identity, all sharing the store and its message counters
    pub fn for_identities(
        store: Arc<dyn ObjectStore>,
        identities: &[IdentityConfig],
        read_chunk_size: u64,
    ) -> Vec<Self> {
        let shared = Arc::new(Shared::new(store, read_chunk_size));
        identities
            .iter()
            .map(|identity| Self {
                identity: identity.clone(),
                shared: shared.clone(),
            })
            .collect()
    }

    pub fn from_config(config: &BackendConfig, read_chunk_size: u64) -> Result<Vec<Self>> {
        let store = UnifiedStore::from_config(&config.store)?;
        Ok(Self::for_identities(store, &config.identities, read_chunk_size))
    }

    fn staged_path(upload: &BlobUpload, part_index: u32) -> ObjectPath {
        ObjectPath::from(format!("{}/{}/{:08}", STAGING_PREFIX, upload.id, part_index))
    }

    fn message_prefix(channel: &str, message_id: i64) -> ObjectPath {
        ObjectPath::from(format!("{}/{:012}", channel, message_id))
    }

    fn message_path(channel: &str, message_id: i64, file_id: &str) -> ObjectPath {
        ObjectPath::from(format!("{}/{:012}/{}", channel, message_id, file_id))
    }

    async fn next_message_id(&self, channel: &str) -> Result<i64> {
        let mut ids = self.shared.next_message_ids.lock().await;
        let next = match ids.get(channel) {
            Some(next) => *next,
            None => self.highest_message_id(channel).await? + 1,
        };
        ids.insert(channel.to_string(), next + 1);
        Ok(next)
    }

    async fn highest_message_id(&self, channel: &str) -> Result<i64> {
        let listing = self
            .shared
            .store
            .list_with_delimiter(Some(&ObjectPath::from(channel)))
            .await
            .map_err(|e| map_store_err("list channel", e))?;
        Ok(listing
            .common_prefixes
            .iter()
            .filter_map(|p| p.filename().and_then(|name| name.parse::<i64>().ok()))
            .max()
            .unwrap_or(0))
    }

    async fn find_message(&self, channel: &str, message_id: i64) -> Result<Option<ObjectMeta>> {
        let prefix = Self::message_prefix(channel, message_id);
        let found: Vec<ObjectMeta> = self
            .shared
            .store
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(|e| map_store_err("lookup message", e))?;
        Ok(found.into_iter().next())
    }

    fn to_posted(message_id: i64, meta: &ObjectMeta) -> Result<PostedMessage> {
        let file_id = meta
            .location
            .filename()
            .ok_or_else(|| Error::BackendFatal(format!("malformed message at {}", meta.location)))?
            .to_string();
        Ok(PostedMessage {
            message_id,
            file_id,
            object: ObjectRef {
                location: meta.location.to_string(),
                size: meta.size,
            },
        })
    }
}

#[async_trait]
impl BackendClient for ObjectStoreBackend {
    async fn connect(&self) -> Result<IdentityInfo> {
        tracing::info!(
            "identity {} ready, {} parts per blob",
            self.identity.name,
            self.identity.max_parts_per_blob
        );
        Ok(IdentityInfo {
            name: self.identity.name.clone(),
            bot: self.identity.bot,
            max_parts_per_blob: self.identity.max_parts_per_blob,
        })
    }

    async fn resolve_channel(&self, channel: &str) -> Result<ChannelRef> {
        if channel.is_empty() || channel.contains('/') || channel.starts_with('_') {
            return Err(Error::BackendFatal(format!("invalid channel {:?}", channel)));
        }
        Ok(ChannelRef {
            name: channel.to_string(),
        })
    }

    async fn save_chunk(
        &self,
        upload: &BlobUpload,
        part_index: u32,
        declared_total: Option<u32>,
        data: Bytes,
    ) -> Result<()> {
        let path = Self::staged_path(upload, part_index);
        self.shared
            .store
            .put(&path, data.into())
            .await
            .map_err(|e| map_store_err("save chunk", e))?;
        if let Some(total) = declared_total {
            self.shared
                .declared_totals
                .lock()
                .await
                .insert(upload.id.clone(), total);
        }
        Ok(())
    }

    async fn finalize_blob(
        &self,
        channel: &ChannelRef,
        upload: &BlobUpload,
        total_parts: u32,
    ) -> Result<PostedMessage> {
        let declared = self.shared.declared_totals.lock().await.remove(&upload.id);
        if declared != Some(total_parts) {
            return Err(Error::BackendFatal(format!(
                "blob {} finalized with {} parts but declared {:?}",
                upload.id, total_parts, declared
            )));
        }

        let message_id = self.next_message_id(&channel.name).await?;
        let file_id = common::utils::new_object_id();
        let target = Self::message_path(&channel.name, message_id, &file_id);

        let multipart = self
            .shared
            .store
            .put_multipart(&target)
            .await
            .map_err(|e| map_store_err("open blob", e))?;
        let mut writer = WriteMultipart::new(multipart);
        for index in 0..total_parts {
            let staged = Self::staged_path(upload, index);
            let chunk = self
                .shared
                .store
                .get(&staged)
                .await
                .map_err(|e| map_store_err("read staged chunk", e))?
                .bytes()
                .await
                .map_err(|e| map_store_err("read staged chunk", e))?;
            writer.write(&chunk);
        }
        writer
            .finish()
            .await
            .map_err(|e| map_store_err("seal blob", e))?;

        for index in 0..total_parts {
            if let Err(e) = self.shared.store.delete(&Self::staged_path(upload, index)).await {
                tracing::warn!("failed to drop staged chunk {} of {}: {}", index, upload.id, e);
            }
        }

        let meta = self
            .shared
            .store
            .head(&target)
            .await
            .map_err(|e| map_store_err("stat blob", e))?;
        tracing::debug!(
            "posted {} as message {} in {} ({} bytes)",
            upload.filename,
            message_id,
            channel.name,
            meta.size
        );
        Self::to_posted(message_id, &meta)
    }

    async fn get_message(
        &self,
        channel: &ChannelRef,
        message_id: i64,
    ) -> Result<Option<PostedMessage>> {
        match self.find_message(&channel.name, message_id).await? {
            Some(meta) => Ok(Some(Self::to_posted(message_id, &meta)?)),
            None => Ok(None),
        }
    }

    async fn read_chunk(&self, object: &ObjectRef, offset: u64, limit: u64) -> Result<Bytes> {
        let block = self.shared.read_chunk_size;
        if offset % block != 0 || limit != block {
            return Err(Error::BackendFatal(format!(
                "unaligned read at {} of {} bytes, alignment is {}",
                offset, limit, block
            )));
        }
        if offset >= object.size {
            return Ok(Bytes::new());
        }
        let end = (offset + limit).min(object.size);
        self.shared
            .store
            .get_range(&ObjectPath::from(object.location.as_str()), offset..end)
            .await
            .map_err(|e| map_store_err("read chunk", e))
    }

    async fn forward_message(
        &self,
        from: &ChannelRef,
        to: &ChannelRef,
        message_id: i64,
    ) -> Result<PostedMessage> {
        let source = self
            .find_message(&from.name, message_id)
            .await?
            .ok_or_else(|| {
                Error::BackendFatal(format!("message {} not found in {}", message_id, from.name))
            })?;
        let posted = Self::to_posted(message_id, &source)?;

        let new_id = self.next_message_id(&to.name).await?;
        let target = Self::message_path(&to.name, new_id, &posted.file_id);
        self.shared
            .store
            .copy(&source.location, &target)
            .await
            .map_err(|e| map_store_err("forward message", e))?;

        Ok(PostedMessage {
            message_id: new_id,
            file_id: posted.file_id,
            object: ObjectRef {
                location: target.to_string(),
                size: posted.object.size,
            },
        })
    }

    async fn delete_message(&self, channel: &ChannelRef, message_id: i64) -> Result<u32> {
        match self.find_message(&channel.name, message_id).await? {
            Some(meta) => {
                self.shared
                    .store
                    .delete(&meta.location)
                    .await
                    .map_err(|e| map_store_err("delete message", e))?;
                Ok(1)
            }
            None => Ok(0),
        }
    }
}
