//! Upload engine
//!
//! Small files are kept in memory and end up inline in metadata. Once the
//! inline threshold is crossed, bytes go out in `chunk_size` slices, one
//! write in flight at a time, grouped into blobs of at most the identity's
//! parts-per-blob limit. Every sealed blob is reported as a [`Part`].
//!
//! The last full chunk is always held back until the engine knows whether
//! more input follows, so the chunk that seals a blob can declare the
//! blob's part count.

use async_trait::async_trait;
use backend::{BackendSession, BlobUpload, ChannelRef};
use bytes::{Bytes, BytesMut};
use common::{Error, Part, Result};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::ByteStream;

/// Receives parts as their blobs are sealed
#[async_trait]
pub trait PartSink: Send + Sync {
    async fn part_sealed(&self, part: Part) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    /// Never crossed the inline threshold
    Inline(Bytes),
    /// Stored on the backend as `parts` blobs
    Stored { parts: u32, size: u64 },
    /// The abort token fired; no backend call was made after that
    Aborted,
}

/// The blob currently receiving chunks
struct Portion {
    upload: BlobUpload,
    parts_written: u32,
    size: u64,
}

pub struct Uploader<'a> {
    session: BackendSession,
    channel: ChannelRef,
    filename: String,
    mime: String,
    chunk_size: usize,
    inline_threshold: u64,
    max_parts: u32,
    abort: CancellationToken,
    sink: &'a dyn PartSink,

    buffer: BytesMut,
    spilled: bool,
    total: u64,
    portion: Option<Portion>,
    sealed: u32,
}

/// `name` for a file that fits in one blob, `name.001`, `name.002`, ... otherwise
pub fn portion_name(filename: &str, index: u32, is_last: bool) -> String {
    if index == 0 && is_last {
        filename.to_string()
    } else {
        format!("{}.{:03}", filename, index + 1)
    }
}

impl<'a> Uploader<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: BackendSession,
        channel: ChannelRef,
        filename: &str,
        mime: &str,
        chunk_size: usize,
        inline_threshold: u64,
        abort: CancellationToken,
        sink: &'a dyn PartSink,
    ) -> Self {
        let max_parts = session.max_parts_per_blob().max(1);
        Self {
            session: session.with_abort(abort.clone()),
            channel,
            filename: filename.to_string(),
            mime: mime.to_string(),
            chunk_size,
            inline_threshold,
            max_parts,
            abort,
            sink,
            buffer: BytesMut::new(),
            spilled: false,
            total: 0,
            portion: None,
            sealed: 0,
        }
    }

    pub async fn run(mut self, mut source: ByteStream) -> Result<UploadOutcome> {
        while let Some(data) = source.next().await {
            if self.abort.is_cancelled() {
                return Ok(self.aborted());
            }
            let data = data?;
            self.total += data.len() as u64;
            self.buffer.extend_from_slice(&data);

            if !self.spilled {
                if self.total <= self.inline_threshold {
                    continue;
                }
                tracing::debug!(
                    "{} passed the inline threshold of {} bytes",
                    self.filename,
                    self.inline_threshold
                );
                self.spilled = true;
            }

            while self.buffer.len() > self.chunk_size {
                let chunk = self.buffer.split_to(self.chunk_size).freeze();
                if !self.dispatch(chunk, false).await? {
                    return Ok(self.aborted());
                }
            }
        }

        if self.abort.is_cancelled() {
            return Ok(self.aborted());
        }
        if !self.spilled {
            return Ok(UploadOutcome::Inline(self.buffer.freeze()));
        }

        let last = self.buffer.split().freeze();
        if !self.dispatch(last, true).await? {
            return Ok(self.aborted());
        }
        tracing::info!(
            "uploaded {} ({} bytes in {} blobs)",
            self.filename,
            self.total,
            self.sealed
        );
        Ok(UploadOutcome::Stored {
            parts: self.sealed,
            size: self.total,
        })
    }

    fn aborted(&self) -> UploadOutcome {
        tracing::info!(
            "upload of {} aborted after {} bytes, {} blobs sealed",
            self.filename,
            self.total,
            self.sealed
        );
        UploadOutcome::Aborted
    }

    /// Write one chunk. Returns false when aborted.
    async fn dispatch(&mut self, chunk: Bytes, is_last: bool) -> Result<bool> {
        if self.abort.is_cancelled() {
            return Ok(false);
        }

        let portion = self.portion.get_or_insert_with(|| Portion {
            upload: BlobUpload::new(self.filename.clone(), self.mime.clone()),
            parts_written: 0,
            size: 0,
        });
        let index = portion.parts_written;
        let seal = is_last || index + 1 == self.max_parts;
        let declared = seal.then_some(index + 1);
        let len = chunk.len() as u64;

        tracing::debug!(
            "chunk {} of blob {} ({} bytes)",
            index,
            portion.upload.id,
            len
        );
        match self
            .session
            .save_chunk(&portion.upload, index, declared, chunk)
            .await
        {
            Err(Error::Aborted) => return Ok(false),
            other => other?,
        }
        portion.parts_written += 1;
        portion.size += len;

        if seal {
            return self.seal(is_last).await;
        }
        Ok(true)
    }

    async fn seal(&mut self, is_last: bool) -> Result<bool> {
        if self.abort.is_cancelled() {
            return Ok(false);
        }
        let Some(mut portion) = self.portion.take() else {
            return Ok(true);
        };

        let index = self.sealed;
        portion.upload.filename = portion_name(&self.filename, index, is_last);
        let posted = match self
            .session
            .finalize_blob(&self.channel, &portion.upload, portion.parts_written)
            .await
        {
            Err(Error::Aborted) => return Ok(false),
            other => other?,
        };

        let part = Part {
            message_id: posted.message_id,
            original_filename: portion.upload.filename.clone(),
            hash: None,
            file_id: posted.file_id,
            size: portion.size,
            index,
            channel: None,
        };
        tracing::info!(
            "sealed {} as message {} in {} ({} chunks, {} bytes)",
            part.original_filename,
            part.message_id,
            self.channel.name,
            portion.parts_written,
            part.size
        );
        self.sink.part_sealed(part).await?;
        self.sealed += 1;
        Ok(true)
    }
}
