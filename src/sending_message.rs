use anyhow::bail;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::TransportConfig;
use crate::frame::{Frame, FrameBody, FrameHeader};
use crate::identity::{ClusterIdentity, MessageId};

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum SendStatus {
    NotSent,
    WaitingForReceipt,
    SuccessfullySent,
}

/// What a waiting-processor should do with a message whose deadline expired.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum RetryDecision {
    /// the message reached a terminal state while queued - nothing to do
    Cancelled,
    /// the deadline was re-armed, ask the peer again and re-enqueue
    Retry,
    /// the retry cap is reached, discard the in-flight state
    GiveUp,
}

/// Send-side state of one in-flight outbound message.
///
/// The identity, payload and chunking geometry are immutable; status and timer fields
///  are guarded by the message's own lock. There are no transactions across messages -
///  one message is the unit of atomicity.
pub struct SendingMessage {
    id: MessageId,
    destination: Option<ClusterIdentity>,
    payload: Bytes,
    chunk_size: u16,
    inner: Mutex<SendingInner>,
}

struct SendingInner {
    status: SendStatus,
    wait_till: Instant,
    wait_repeated_count: u32,
}

impl SendingMessage {
    /// `destination == None` means broadcast. The payload must be non-empty: an encoded
    ///  [ClusterMessage](crate::cluster_message::ClusterMessage) never is, and a
    ///  zero-chunk message could not be completed on the receiving side.
    pub fn new(
        self_id: ClusterIdentity,
        destination: Option<ClusterIdentity>,
        payload: Bytes,
        config: &TransportConfig,
    ) -> anyhow::Result<SendingMessage> {
        if payload.is_empty() {
            bail!("refusing to send an empty message");
        }
        if payload.len() > config.max_message_size as usize {
            bail!(
                "message of {} bytes exceeds the maximum message size of {}",
                payload.len(),
                config.max_message_size
            );
        }

        Ok(SendingMessage {
            id: MessageId::mint(self_id),
            destination,
            payload,
            chunk_size: config.sending_chunk_size,
            inner: Mutex::new(SendingInner {
                status: SendStatus::NotSent,
                wait_till: Instant::now(),
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

    pub fn total_size(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_size().div_ceil(self.chunk_size as u32)
    }

    pub fn status(&self) -> SendStatus {
        self.inner.lock().status
    }

    pub fn wait_till(&self) -> Instant {
        self.inner.lock().wait_till
    }

    pub(crate) fn header(&self) -> FrameHeader {
        FrameHeader {
            id: self.id,
            destination: self.destination,
            total_size: self.total_size(),
            chunk_size: self.chunk_size,
        }
    }

    /// the chunk's slice of the payload; `None` for an out-of-range index (e.g. from a
    ///  bogus re-send request)
    pub(crate) fn chunk_frame(&self, index: u32) -> Option<Frame> {
        if index >= self.total_chunks() {
            return None;
        }

        let start = index as usize * self.chunk_size as usize;
        let end = (start + self.chunk_size as usize).min(self.payload.len());

        Some(Frame::new(
            self.header(),
            FrameBody::Chunk {
                index,
                data: self.payload.slice(start..end),
            },
        ))
    }

    /// Transition after the initial transmission of all chunks. Broadcast messages are
    ///  never acknowledged, so they complete right away and only wait out the retention
    ///  delay; unicast messages start the receipt timer.
    ///
    /// Only the sender worker performs this transition.
    pub(crate) fn mark_sent_and_wait(&self, config: &TransportConfig) -> SendStatus {
        let mut inner = self.inner.lock();
        if inner.status != SendStatus::NotSent {
            return inner.status;
        }

        match self.destination {
            None => {
                inner.status = SendStatus::SuccessfullySent;
                inner.wait_till = Instant::now() + config.waiting_after_receipt_timeout;
            }
            Some(_) => {
                inner.status = SendStatus::WaitingForReceipt;
                inner.wait_till = Instant::now() + config.waiting_for_receipt_timeout;
            }
        }
        inner.status
    }

    /// Receipt arrived: transition to the terminal state and arm the retention timer.
    ///  Returns false if the message was already complete (duplicate receipt).
    pub(crate) fn mark_received(&self, config: &TransportConfig) -> bool {
        let mut inner = self.inner.lock();
        if inner.status == SendStatus::SuccessfullySent {
            return false;
        }

        inner.status = SendStatus::SuccessfullySent;
        inner.wait_till = Instant::now() + config.waiting_after_receipt_timeout;
        true
    }

    /// Decision when the receipt deadline expires.
    pub(crate) fn retry_receipt(&self, config: &TransportConfig) -> RetryDecision {
        let mut inner = self.inner.lock();
        if inner.status != SendStatus::WaitingForReceipt {
            return RetryDecision::Cancelled;
        }

        if inner.wait_repeated_count < config.max_receipt_waits {
            inner.wait_repeated_count += 1;
            inner.wait_till = Instant::now() + config.waiting_for_receipt_timeout;
            RetryDecision::Retry
        } else {
            RetryDecision::GiveUp
        }
    }
}
