//! Backend identity pool
//!
//! Identities are registered once at startup (or later, the list is swapped
//! atomically) and handed out round-robin, one per transfer session. Every
//! call made through a session goes through the retry policy.

use arc_swap::ArcSwap;
use bytes::Bytes;
use common::{Error, Result};
use moka::future::Cache;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::retry::RetryPolicy;
use crate::{BackendClient, BlobUpload, ChannelRef, IdentityInfo, ObjectRef, PostedMessage};

/// What a session is for. Uploads cannot run on bot identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Upload,
    Download,
    Manage,
}

struct Member {
    client: Arc<dyn BackendClient>,
    info: IdentityInfo,
}

pub struct ClientPool {
    members: ArcSwap<Vec<Arc<Member>>>,
    cursor: AtomicUsize,
    retry: RetryPolicy,
    channels: Cache<(String, String), ChannelRef>,
}

impl ClientPool {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            members: ArcSwap::from_pointee(Vec::new()),
            cursor: AtomicUsize::new(0),
            retry,
            channels: Cache::new(1024),
        }
    }

    /// Build a pool and log every client in
    pub async fn with_clients<I>(clients: I, retry: RetryPolicy) -> Result<Self>
    where
        I: IntoIterator<Item = Arc<dyn BackendClient>>,
    {
        let pool = Self::new(retry);
        for client in clients {
            pool.register(client).await?;
        }
        Ok(pool)
    }

    /// Log a client in and add it to the rotation
    pub async fn register(&self, client: Arc<dyn BackendClient>) -> Result<IdentityInfo> {
        let info = client.connect().await?;
        tracing::info!(
            "registered identity {} (bot: {}, {} parts per blob)",
            info.name,
            info.bot,
            info.max_parts_per_blob
        );
        let member = Arc::new(Member {
            client,
            info: info.clone(),
        });
        self.members.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(member.clone());
            next
        });
        Ok(info)
    }

    pub fn len(&self) -> usize {
        self.members.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pick the next identity in rotation
    pub fn next_session(&self, purpose: Purpose) -> Result<BackendSession> {
        let members = self.members.load();
        if members.is_empty() {
            return Err(Error::BackendFatal("no backend identity registered".to_string()));
        }
        for _ in 0..members.len() {
            let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % members.len();
            let member = &members[slot];
            if purpose == Purpose::Upload && member.info.bot {
                continue;
            }
            tracing::debug!("{:?} session on identity {}", purpose, member.info.name);
            return Ok(BackendSession {
                member: member.clone(),
                slot,
                retry: self.retry.clone(),
                channels: self.channels.clone(),
                abort: CancellationToken::new(),
            });
        }
        Err(Error::InvalidOperation(
            "no registered identity is allowed to upload".to_string(),
        ))
    }
}

/// One identity bound to one transfer or management operation
pub struct BackendSession {
    member: Arc<Member>,
    slot: usize,
    retry: RetryPolicy,
    channels: Cache<(String, String), ChannelRef>,
    abort: CancellationToken,
}

impl BackendSession {
    /// Stop retrying, and making calls, once `abort` fires
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    pub fn identity(&self) -> &IdentityInfo {
        &self.member.info
    }

    /// Position of the identity in the pool
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn max_parts_per_blob(&self) -> u32 {
        self.member.info.max_parts_per_blob
    }

    fn client(&self) -> &dyn BackendClient {
        self.member.client.as_ref()
    }

    pub async fn resolve_channel(&self, channel: &str) -> Result<ChannelRef> {
        let key = (self.member.info.name.clone(), channel.to_string());
        if let Some(resolved) = self.channels.get(&key).await {
            return Ok(resolved);
        }
        let client = self.client();
        let resolved = self
            .retry
            .run("resolve_channel", client, &self.abort, || client.resolve_channel(channel))
            .await?;
        self.channels.insert(key, resolved.clone()).await;
        Ok(resolved)
    }

    pub async fn save_chunk(
        &self,
        upload: &BlobUpload,
        part_index: u32,
        declared_total: Option<u32>,
        data: Bytes,
    ) -> Result<()> {
        let client = self.client();
        self.retry
            .run("save_chunk", client, &self.abort, || {
                client.save_chunk(upload, part_index, declared_total, data.clone())
            })
            .await
    }

    pub async fn finalize_blob(
        &self,
        channel: &ChannelRef,
        upload: &BlobUpload,
        total_parts: u32,
    ) -> Result<PostedMessage> {
        let client = self.client();
        self.retry
            .run("finalize_blob", client, &self.abort, || {
                client.finalize_blob(channel, upload, total_parts)
            })
            .await
    }

    pub async fn get_message(
        &self,
        channel: &ChannelRef,
        message_id: i64,
    ) -> Result<Option<PostedMessage>> {
        let client = self.client();
        self.retry
            .run("get_message", client, &self.abort, || client.get_message(channel, message_id))
            .await
    }

    pub async fn read_chunk(&self, object: &ObjectRef, offset: u64, limit: u64) -> Result<Bytes> {
        let client = self.client();
        self.retry
            .run("read_chunk", client, &self.abort, || client.read_chunk(object, offset, limit))
            .await
    }

    pub async fn forward_message(
        &self,
        from: &ChannelRef,
        to: &ChannelRef,
        message_id: i64,
    ) -> Result<PostedMessage> {
        let client = self.client();
        self.retry
            .run("forward_message", client, &self.abort, || {
                client.forward_message(from, to, message_id)
            })
            .await
    }

    pub async fn delete_message(&self, channel: &ChannelRef, message_id: i64) -> Result<u32> {
        let client = self.client();
        self.retry
            .run("delete_message", client, &self.abort, || {
                client.delete_message(channel, message_id)
            })
            .await
    }
}
