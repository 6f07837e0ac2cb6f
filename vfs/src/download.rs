//! Download engine
//!
//! Serves a byte range of a file stored as parts. The backend only answers
//! reads aligned to its read block, so each segment is fetched block by
//! block from the aligned offset below its start and trimmed at both ends.

use async_stream::try_stream;
use backend::{BackendSession, ChannelRef};
use bytes::Bytes;
use common::{Error, Part, Result};
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::range::{plan_segments, ByteRange};
use crate::ByteStream;

pub struct Downloader {
    session: BackendSession,
    entry_channel: String,
    parts: Vec<Part>,
    range: ByteRange,
    read_block: u64,
    abort: CancellationToken,
}

impl Downloader {
    pub fn new(
        session: BackendSession,
        entry_channel: String,
        parts: Vec<Part>,
        range: ByteRange,
        read_block: u64,
        abort: CancellationToken,
    ) -> Self {
        Self {
            session: session.with_abort(abort.clone()),
            entry_channel,
            parts,
            range,
            read_block,
            abort,
        }
    }

    /// Stream the range. Ends early, without an error, once aborted.
    pub fn into_stream(self) -> ByteStream {
        try_stream! {
            let sizes: Vec<u64> = self.parts.iter().map(|p| p.size).collect();
            let plan = plan_segments(&sizes, self.range);
            let block = self.read_block;
            let mut resolved: Option<ChannelRef> = None;

            'segments: for segment in plan {
                if self.abort.is_cancelled() {
                    break;
                }
                let part = &self.parts[segment.part];
                let channel_name = part.channel_or(&self.entry_channel);
                let channel = match resolved.take() {
                    Some(channel) if channel.name == channel_name => channel,
                    _ => match self.session.resolve_channel(channel_name).await {
                        Err(Error::Aborted) => break,
                        other => other?,
                    },
                };
                resolved = Some(channel.clone());

                let message = match self.session.get_message(&channel, part.message_id).await {
                    Err(Error::Aborted) => break,
                    other => other?,
                };
                let message = message.ok_or_else(|| Error::NotFound(format!(
                    "message {} of {} in {}",
                    part.message_id, part.original_filename, channel.name
                )))?;
                if message.file_id != part.file_id {
                    Err(Error::InvalidOperation(format!(
                        "message {} no longer holds {}",
                        part.message_id, part.original_filename
                    )))?;
                }

                let mut offset = segment.start / block * block;
                while offset < segment.end {
                    let data = match self.session.read_chunk(&message.object, offset, block).await {
                        Err(Error::Aborted) => break 'segments,
                        other => other?,
                    };
                    let wanted = (segment.end - offset).min(block) as usize;
                    if data.len() < wanted {
                        Err(Error::BackendFatal(format!(
                            "short read of {} at {}: {} of {} bytes",
                            part.original_filename, offset, data.len(), wanted
                        )))?;
                    }
                    let head = segment.start.saturating_sub(offset) as usize;
                    yield data.slice(head..wanted);
                    offset += block;

                    if self.abort.is_cancelled() {
                        tracing::debug!("download aborted at offset {} of part {}", offset, part.index);
                        break 'segments;
                    }
                }
            }
        }
        .boxed()
    }
}

/// Drain a byte stream into `sink`, returning the number of bytes written
pub async fn write_stream<W>(mut stream: ByteStream, sink: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    while let Some(data) = stream.next().await {
        let data = data?;
        sink.write_all(&data).await?;
        written += data.len() as u64;
    }
    sink.flush().await?;
    Ok(written)
}

/// Serve a range of inline content without touching the backend
pub fn inline_stream(content: Bytes, range: ByteRange) -> ByteStream {
    let slice = content.slice(range.start as usize..=range.end as usize);
    futures::stream::once(async move { Ok(slice) }).boxed()
}
