//! Shared fixtures for the engine and filesystem tests.

use async_trait::async_trait;
use backend::{
    BackendClient, BlobUpload, ChannelRef, ClientPool, IdentityInfo, ObjectRef,
    ObjectStoreBackend, PostedMessage, RetryPolicy,
};
use bytes::Bytes;
use common::{Error, IdentityConfig, Part, Result, Transient};
use futures::stream::{self, StreamExt, TryStreamExt};
use metadata::{InMemoryMetadataStore, MetadataService, MetadataStore};
use object_store::memory::InMemory;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::upload::PartSink;
use crate::virtual_fs::{TransferSettings, VirtualFs};
use crate::ByteStream;

/// Object store backend that counts the calls made through it.
pub struct Recorder {
    inner: ObjectStoreBackend,
    saves: AtomicUsize,
    reads: AtomicUsize,
    forwards: AtomicUsize,
    lookups: Mutex<Vec<i64>>,
    save_flood: Mutex<Option<(usize, Duration)>>,
    read_flood: Mutex<Option<(usize, Duration)>>,
    broken_forward: Mutex<Option<usize>>,
}

/// Fail once with a flood wait when `count` reaches the armed call number
fn flood(armed: &Mutex<Option<(usize, Duration)>>, count: usize) -> Result<()> {
    let mut armed = armed.lock().unwrap();
    match *armed {
        Some((at, wait)) if at == count => {
            *armed = None;
            Err(Error::BackendTransient(Transient::FloodWait(wait)))
        }
        _ => Ok(()),
    }
}

impl Recorder {
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn forwards(&self) -> usize {
        self.forwards.load(Ordering::SeqCst)
    }

    /// Message ids passed to `get_message`, in call order
    pub fn looked_up(&self) -> Vec<i64> {
        self.lookups.lock().unwrap().clone()
    }

    /// The `nth` save attempt (1-based, counted from the last reset) answers with a flood wait
    pub fn flood_on_save(&self, nth: usize, wait: Duration) {
        *self.save_flood.lock().unwrap() = Some((nth, wait));
    }

    pub fn flood_on_read(&self, nth: usize, wait: Duration) {
        *self.read_flood.lock().unwrap() = Some((nth, wait));
    }

    /// The `nth` forward (1-based) fails for good
    pub fn break_forward(&self, nth: usize) {
        *self.broken_forward.lock().unwrap() = Some(nth);
    }

    pub fn reset(&self) {
        self.saves.store(0, Ordering::SeqCst);
        self.reads.store(0, Ordering::SeqCst);
        self.forwards.store(0, Ordering::SeqCst);
        self.lookups.lock().unwrap().clear();
    }
}

#[async_trait]
impl BackendClient for Recorder {
    async fn connect(&self) -> Result<IdentityInfo> {
        self.inner.connect().await
    }

    async fn resolve_channel(&self, channel: &str) -> Result<ChannelRef> {
        self.inner.resolve_channel(channel).await
    }

    async fn save_chunk(
        &self,
        upload: &BlobUpload,
        part_index: u32,
        declared_total: Option<u32>,
        data: Bytes,
    ) -> Result<()> {
        let count = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        flood(&self.save_flood, count)?;
        self.inner.save_chunk(upload, part_index, declared_total, data).await
    }

    async fn finalize_blob(
        &self,
        channel: &ChannelRef,
        upload: &BlobUpload,
        total_parts: u32,
    ) -> Result<PostedMessage> {
        self.inner.finalize_blob(channel, upload, total_parts).await
    }

    async fn get_message(&self, channel: &ChannelRef, message_id: i64) -> Result<Option<PostedMessage>> {
        self.lookups.lock().unwrap().push(message_id);
        self.inner.get_message(channel, message_id).await
    }

    async fn read_chunk(&self, object: &ObjectRef, offset: u64, limit: u64) -> Result<Bytes> {
        let count = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        flood(&self.read_flood, count)?;
        self.inner.read_chunk(object, offset, limit).await
    }

    async fn forward_message(&self, from: &ChannelRef, to: &ChannelRef, message_id: i64) -> Result<PostedMessage> {
        let count = self.forwards.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.broken_forward.lock().unwrap() == Some(count) {
            return Err(Error::BackendFatal(format!("forward of message {} refused", message_id)));
        }
        self.inner.forward_message(from, to, message_id).await
    }

    async fn delete_message(&self, channel: &ChannelRef, message_id: i64) -> Result<u32> {
        self.inner.delete_message(channel, message_id).await
    }
}

pub struct Harness {
    pub fs: VirtualFs,
    pub pool: Arc<ClientPool>,
    pub metadata: Arc<MetadataService>,
    pub recorder: Arc<Recorder>,
}

/// 1 KiB chunks, 2 KiB inline threshold, 4 KiB reads, 4 chunks per blob
pub fn settings() -> TransferSettings {
    TransferSettings {
        chunk_size: 1024,
        inline_threshold: 2048,
        read_chunk_size: 4096,
        default_channel: "archive".to_string(),
    }
}

pub async fn harness() -> Harness {
    harness_with(Arc::new(InMemoryMetadataStore::new())).await
}

pub async fn harness_with(store: Arc<dyn MetadataStore>) -> Harness {
    let identity = IdentityConfig {
        name: "tester".to_string(),
        bot: false,
        max_parts_per_blob: 4,
    };
    let recorder = Arc::new(Recorder {
        inner: ObjectStoreBackend::new(Arc::new(InMemory::new()), identity, 4096),
        saves: AtomicUsize::new(0),
        reads: AtomicUsize::new(0),
        forwards: AtomicUsize::new(0),
        lookups: Mutex::new(Vec::new()),
        save_flood: Mutex::new(None),
        read_flood: Mutex::new(None),
        broken_forward: Mutex::new(None),
    });
    let pool = Arc::new(
        ClientPool::with_clients(
            [recorder.clone() as Arc<dyn BackendClient>],
            RetryPolicy::default(),
        )
        .await
        .unwrap(),
    );
    let metadata = Arc::new(MetadataService::new(store).await.unwrap());
    let fs = VirtualFs::new(metadata.clone(), pool.clone(), settings());
    Harness {
        fs,
        pool,
        metadata,
        recorder,
    }
}

/// Deterministic bytes that differ between neighbouring offsets
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Feed `data` as a stream of `piece`-sized buffers
pub fn chunked(data: &[u8], piece: usize) -> ByteStream {
    let pieces: Vec<Result<Bytes>> = data
        .chunks(piece)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(pieces).boxed()
}

pub async fn collect(stream: ByteStream) -> Vec<u8> {
    let pieces: Vec<Bytes> = stream.try_collect().await.unwrap();
    pieces.concat()
}

#[derive(Default)]
pub struct CollectParts {
    parts: Mutex<Vec<Part>>,
}

impl CollectParts {
    pub fn parts(&self) -> Vec<Part> {
        self.parts.lock().unwrap().clone()
    }
}

#[async_trait]
impl PartSink for CollectParts {
    async fn part_sealed(&self, part: Part) -> Result<()> {
        self.parts.lock().unwrap().push(part);
        Ok(())
    }
}
