use anyhow::bail;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::time::Instant;

use crate::cluster_message::ClusterMessage;
use crate::config::TransportConfig;
use crate::frame::{FrameHeader, MAX_CHUNK_SIZE};
use crate::identity::{ClusterIdentity, MessageId};
use crate::sending_message::RetryDecision;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ReceiveStatus {
    WaitingForChunks,
    SuccessfullyReceived,
}

/// Result of storing one inbound chunk.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ChunkOutcome {
    /// the index was already present - nothing changed
    Duplicate,
    /// stored, more chunks outstanding
    Stored,
    /// stored, and this chunk completed the message (fires at most once)
    Completed,
}

/// Result of the at-most-once processing step after completion.
pub enum ProcessOutcome {
    /// first completion: hand the decoded message to the dispatcher
    Dispatch(ClusterMessage),
    /// already handed over earlier - at most re-acknowledge
    AlreadyProcessed,
    /// the payload does not decode; the failure is remembered and never retried
    DecodeFailed,
}

/// Receive-side state of one in-flight inbound message, created when the first chunk
///  (or receipt request) for an unknown message id arrives.
///
/// The payload buffer is pre-sized from the header's declared total size; chunks are
///  written by index, so arrival order does not matter and re-deliveries are idempotent.
pub struct ReceivingMessage {
    id: MessageId,
    destination: Option<ClusterIdentity>,
    total_size: u32,
    chunk_size: u16,
    inner: Mutex<ReceivingInner>,
}

struct ReceivingInner {
    bytes: Vec<u8>,
    chunks: FxHashSet<u32>,
    message: Option<ClusterMessage>,
    decode_failed: bool,
    message_processed: bool,
    status: ReceiveStatus,
    wait_till: Instant,
    wait_repeated_count: u32,
}

impl ReceivingMessage {
    pub fn new(header: &FrameHeader, config: &TransportConfig) -> anyhow::Result<ReceivingMessage> {
        if header.chunk_size == 0 || header.chunk_size > MAX_CHUNK_SIZE {
            bail!("chunk size {} out of range", header.chunk_size);
        }
        if header.total_size == 0 {
            bail!("empty message");
        }
        if header.total_size > config.max_message_size {
            bail!(
                "declared message size {} exceeds the maximum of {}",
                header.total_size,
                config.max_message_size
            );
        }

        Ok(ReceivingMessage {
            id: header.id,
            destination: header.destination,
            total_size: header.total_size,
            chunk_size: header.chunk_size,
            inner: Mutex::new(ReceivingInner {
                bytes: vec![0; header.total_size as usize],
                chunks: FxHashSet::default(),
                message: None,
                decode_failed: false,
                message_processed: false,
                status: ReceiveStatus::WaitingForChunks,
                wait_till: Instant::now() + config.waiting_for_all_chunks_timeout,
                wait_repeated_count: 0,
            }),
        })
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn destination(&self) -> Option<ClusterIdentity> {
        self.destination
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_size.div_ceil(self.chunk_size as u32)
    }

    pub fn status(&self) -> ReceiveStatus {
        self.inner.lock().status
    }

    pub fn wait_till(&self) -> Instant {
        self.inner.lock().wait_till
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().chunks.len() as u32 == self.total_chunks()
    }

    pub(crate) fn header(&self) -> FrameHeader {
        FrameHeader {
            id: self.id,
            destination: self.destination,
            total_size: self.total_size,
            chunk_size: self.chunk_size,
        }
    }

    /// Store one chunk. The index set only ever grows, and a chunk is written at most
    ///  once, so replays neither change the buffer nor re-trigger completion.
    pub(crate) fn apply_chunk(
        &self,
        index: u32,
        data: &[u8],
        config: &TransportConfig,
    ) -> anyhow::Result<ChunkOutcome> {
        if index >= self.total_chunks() {
            bail!("chunk index {} out of range (total {})", index, self.total_chunks());
        }

        let offset = index as usize * self.chunk_size as usize;
        let expected_len = (self.chunk_size as usize).min(self.total_size as usize - offset);
        if data.len() != expected_len {
            bail!(
                "chunk {} carries {} bytes, expected {}",
                index,
                data.len(),
                expected_len
            );
        }

        let mut inner = self.inner.lock();
        if !inner.chunks.insert(index) {
            return Ok(ChunkOutcome::Duplicate);
        }
        inner.bytes[offset..offset + expected_len].copy_from_slice(data);

        if inner.chunks.len() as u32 == self.total_chunks()
            && inner.status == ReceiveStatus::WaitingForChunks
        {
            inner.status = ReceiveStatus::SuccessfullyReceived;
            inner.wait_till = Instant::now() + config.waiting_after_complete_timeout;
            return Ok(ChunkOutcome::Completed);
        }
        Ok(ChunkOutcome::Stored)
    }

    /// ascending indices of all chunks that have not arrived yet - all of them while
    ///  nothing has arrived
    pub fn missing_indices(&self) -> Vec<u32> {
        let inner = self.inner.lock();
        (0..self.total_chunks())
            .filter(|index| !inner.chunks.contains(index))
            .collect()
    }

    /// [missing_indices](Self::missing_indices) split into windows that fit a single
    ///  nack frame each
    pub fn missing_index_windows(&self, window_size: usize) -> Vec<Vec<u32>> {
        self.missing_indices()
            .chunks(window_size)
            .map(|window| window.to_vec())
            .collect()
    }

    /// The at-most-once handover to the upstream dispatcher: decodes the payload lazily
    ///  (at most once, failure included) and flips the processed latch exactly once.
    ///  The caller dispatches outside the lock.
    pub(crate) fn process_once(&self) -> ProcessOutcome {
        let mut inner = self.inner.lock();

        if inner.message_processed {
            return ProcessOutcome::AlreadyProcessed;
        }
        if inner.decode_failed {
            return ProcessOutcome::DecodeFailed;
        }

        if inner.message.is_none() {
            let decoded = ClusterMessage::try_deser(&mut inner.bytes.as_slice());
            match decoded {
                Ok(message) => inner.message = Some(message),
                Err(_) => {
                    inner.decode_failed = true;
                    return ProcessOutcome::DecodeFailed;
                }
            }
        }

        inner.message_processed = true;
        ProcessOutcome::Dispatch(
            inner
                .message
                .clone()
                .expect("message was just decoded"),
        )
    }

    /// Decision when the completion deadline expires.
    pub(crate) fn retry_chunks(&self, config: &TransportConfig) -> RetryDecision {
        let mut inner = self.inner.lock();
        if inner.status != ReceiveStatus::WaitingForChunks {
            return RetryDecision::Cancelled;
        }

        if inner.wait_repeated_count < config.max_chunk_waits {
            inner.wait_repeated_count += 1;
            inner.wait_till = Instant::now() + config.waiting_for_all_chunks_timeout;
            RetryDecision::Retry
        } else {
            RetryDecision::GiveUp
        }
    }
}
