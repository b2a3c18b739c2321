use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep_until, timeout};
use tracing::{debug, trace};

use crate::frame::{Frame, FrameBody};
use crate::identity::MessageId;
use crate::receiving_message::ReceiveStatus;
use crate::sending_message::{RetryDecision, SendStatus};
use crate::transport::TransportInner;

/// Pop the next queue entry, or `None` after the poll timeout so the caller can
///  re-check the done flag. The queues never close while the transport lives, so a
///  closed queue reads as shutdown too.
async fn poll(
    inner: &TransportInner,
    queue: &mut UnboundedReceiver<MessageId>,
) -> Option<MessageId> {
    match timeout(inner.config.poll_timeout, queue.recv()).await {
        Err(_elapsed) => None,
        Ok(entry) => entry,
    }
}

/// The Sender: transmits every chunk of a newly enqueued message once, then arms the
///  receipt timer (or, for broadcast, the retention timer).
pub(crate) async fn sender_loop(inner: Arc<TransportInner>, mut queue: UnboundedReceiver<MessageId>) {
    while !inner.is_done() {
        let Some(id) = poll(&inner, &mut queue).await else {
            continue;
        };
        let Some(msg) = inner.sent.get(&id).map(|e| e.value().clone()) else {
            continue;
        };
        if msg.status() != SendStatus::NotSent {
            continue;
        }

        trace!("transmitting all {} chunks of {:?}", msg.total_chunks(), id);
        inner.transmit_chunks(&msg, 0..msg.total_chunks()).await;

        match msg.mark_sent_and_wait(&inner.config) {
            SendStatus::SuccessfullySent => {
                let _ = inner.queues.sent_completed.send(id);
            }
            SendStatus::WaitingForReceipt => {
                let _ = inner.queues.sent_waiting.send(id);
            }
            SendStatus::NotSent => {}
        }
    }
    debug!("sender loop terminated");
}

/// Wakes on each unicast message's receipt deadline and asks the receiver to
///  acknowledge, up to the retry cap. At the cap the message is deemed lost.
pub(crate) async fn sent_waiting_loop(
    inner: Arc<TransportInner>,
    mut queue: UnboundedReceiver<MessageId>,
) {
    while !inner.is_done() {
        let Some(id) = poll(&inner, &mut queue).await else {
            continue;
        };
        let Some(msg) = inner.sent.get(&id).map(|e| e.value().clone()) else {
            continue;
        };

        // snapshot before sleeping: a receipt during the sleep re-arms the timer with
        //  the (much later) retention deadline
        let deadline = msg.wait_till();
        if msg.status() != SendStatus::WaitingForReceipt {
            continue;
        }
        sleep_until(deadline).await;

        match msg.retry_receipt(&inner.config) {
            RetryDecision::Cancelled => {}
            RetryDecision::Retry => {
                debug!("no receipt for {:?} yet - requesting one", id);
                let frame = Frame::new(msg.header(), FrameBody::ReceiptRequest);
                inner.send_frame_routed(msg.destination(), &frame).await;
                let _ = inner.queues.sent_waiting.send(id);
            }
            RetryDecision::GiveUp => {
                debug!(
                    "no receipt for {:?} after {} requests - the message is deemed lost",
                    id, inner.config.max_receipt_waits
                );
                inner.sent.remove(&id);
            }
        }
    }
    debug!("sent-waiting loop terminated");
}

/// Removes acknowledged outbound messages once their retention delay expired.
pub(crate) async fn sent_completed_loop(
    inner: Arc<TransportInner>,
    mut queue: UnboundedReceiver<MessageId>,
) {
    while !inner.is_done() {
        let Some(id) = poll(&inner, &mut queue).await else {
            continue;
        };
        let Some(msg) = inner.sent.get(&id).map(|e| e.value().clone()) else {
            continue;
        };
        if msg.status() != SendStatus::SuccessfullySent {
            continue;
        }

        sleep_until(msg.wait_till()).await;
        trace!("retention of {:?} expired - removing the send state", id);
        inner.sent.remove(&id);
    }
    debug!("sent-completed loop terminated");
}

/// Wakes on each inbound message's completion deadline and requests the missing
///  chunks from the sender, up to the retry cap. At the cap the partial state is
///  discarded.
pub(crate) async fn received_waiting_loop(
    inner: Arc<TransportInner>,
    mut queue: UnboundedReceiver<MessageId>,
) {
    while !inner.is_done() {
        let Some(id) = poll(&inner, &mut queue).await else {
            continue;
        };
        let Some(msg) = inner.received.get(&id).map(|e| e.value().clone()) else {
            continue;
        };

        let deadline = msg.wait_till();
        if msg.status() != ReceiveStatus::WaitingForChunks {
            continue;
        }
        sleep_until(deadline).await;

        match msg.retry_chunks(&inner.config) {
            RetryDecision::Cancelled => {}
            RetryDecision::Retry => {
                // missing chunks can only be requested from a known address, unicast
                match inner.address_map.preferred_address(&id.cluster) {
                    Some(address) => {
                        let windows = msg.missing_index_windows(inner.config.max_missing_list);
                        debug!(
                            "message {:?} is still incomplete - requesting {} missing chunk(s)",
                            id,
                            windows.iter().map(|w| w.len()).sum::<usize>()
                        );
                        for window in windows {
                            let frame =
                                Frame::new(msg.header(), FrameBody::ChunksNeeded { indices: window });
                            inner.send_frame_to(address, &frame).await;
                        }
                    }
                    None => {
                        debug!("no known address for {:?} - cannot request missing chunks", id.cluster);
                    }
                }
                let _ = inner.queues.received_waiting.send(id);
            }
            RetryDecision::GiveUp => {
                debug!(
                    "message {:?} is still incomplete after {} requests - abandoning it",
                    id, inner.config.max_chunk_waits
                );
                inner.received.remove(&id);
            }
        }
    }
    debug!("received-waiting loop terminated");
}

/// Removes completely received messages once their retention delay expired, ending
///  the deduplication window for their message id.
pub(crate) async fn received_completed_loop(
    inner: Arc<TransportInner>,
    mut queue: UnboundedReceiver<MessageId>,
) {
    while !inner.is_done() {
        let Some(id) = poll(&inner, &mut queue).await else {
            continue;
        };
        let Some(msg) = inner.received.get(&id).map(|e| e.value().clone()) else {
            continue;
        };
        if msg.status() != ReceiveStatus::SuccessfullyReceived {
            continue;
        }

        sleep_until(msg.wait_till()).await;
        trace!("retention of {:?} expired - removing the receive state", id);
        inner.received.remove(&id);
    }
    debug!("received-completed loop terminated");
}
