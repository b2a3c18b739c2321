use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::frame::{Frame, FrameBody, FrameHeader, MAX_PACKET_SIZE};
use crate::receiving_message::{ChunkOutcome, ProcessOutcome, ReceivingMessage};
use crate::transport::TransportInner;

/// One receiver task runs per bound socket. It is the protocol's demultiplexer: frames
///  about inbound messages (chunks, receipt requests) mutate receive-side state, frames
///  about outbound messages (receipts, re-send requests) mutate send-side state.
pub(crate) async fn receiver_loop(inner: Arc<TransportInner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        if inner.is_done() {
            break;
        }
        match socket.recv_from(&mut buf).await {
            Ok((len, source)) => {
                trace!("received {} byte datagram from {}", len, source);
                handle_datagram(&inner, &buf[..len], source).await;
            }
            Err(e) => {
                if inner.is_done() {
                    break;
                }
                warn!("socket error while receiving: {}", e);
            }
        }
    }
    debug!("receiver loop terminated");
}

pub(crate) async fn handle_datagram(inner: &Arc<TransportInner>, data: &[u8], source: SocketAddr) {
    let frame = match Frame::try_deser(&mut &*data) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("dropping unparsable datagram from {}: {}", source, e);
            return;
        }
    };

    match frame.body {
        FrameBody::Chunk { index, data } => {
            on_chunk(inner, frame.header, index, data, source).await
        }
        FrameBody::ReceiptRequest => on_receipt_request(inner, frame.header, source).await,
        FrameBody::NoLongerExists => on_no_longer_exists(inner, frame.header, source),
        FrameBody::Receipt { error_code } => {
            on_receipt(inner, frame.header, error_code, source).await
        }
        FrameBody::ChunksNeeded { indices } => {
            on_chunks_needed(inner, frame.header, indices, source).await
        }
        FrameBody::ChunkRangesNeeded { ranges } => {
            on_chunk_ranges_needed(inner, frame.header, ranges, source).await
        }
    }
}

/// whether an inbound message frame concerns this node at all
fn addressed_to_us(inner: &TransportInner, header: &FrameHeader) -> bool {
    match header.destination {
        None => true,
        Some(destination) => destination == inner.cluster_id,
    }
}

/// Get or create the receive-side state for a message id, arming the completion timer
///  on creation. `None` if the header does not describe a receivable message.
fn get_or_create_receiving(
    inner: &Arc<TransportInner>,
    header: &FrameHeader,
    source: SocketAddr,
) -> Option<Arc<ReceivingMessage>> {
    use dashmap::mapref::entry::Entry;

    match inner.received.entry(header.id) {
        Entry::Occupied(e) => Some(e.get().clone()),
        Entry::Vacant(e) => match ReceivingMessage::new(header, &inner.config) {
            Ok(msg) => {
                debug!(
                    "new inbound message {:?} ({} bytes in {} chunks) from {:?}",
                    header.id,
                    header.total_size,
                    msg.total_chunks(),
                    header.id.cluster
                );
                let msg = Arc::new(msg);
                e.insert(msg.clone());
                let _ = inner.queues.received_waiting.send(header.id);
                Some(msg)
            }
            Err(err) => {
                warn!("rejecting inbound message {:?} from {}: {}", header.id, source, err);
                None
            }
        },
    }
}

async fn on_chunk(
    inner: &Arc<TransportInner>,
    header: FrameHeader,
    index: u32,
    data: Bytes,
    source: SocketAddr,
) {
    inner.address_map.record(header.id.cluster, source);
    if !addressed_to_us(inner, &header) {
        trace!("chunk for {:?} is not addressed to this node - ignoring", header.destination);
        return;
    }

    let Some(msg) = get_or_create_receiving(inner, &header, source) else {
        return;
    };

    match msg.apply_chunk(index, &data, &inner.config) {
        Ok(ChunkOutcome::Completed) => {
            debug!("message {:?} is complete", header.id);
            process_and_ack(inner, &msg, source).await;
            let _ = inner.queues.received_completed.send(header.id);
        }
        Ok(_) => {}
        Err(e) => warn!("dropping chunk {} of {:?} from {}: {}", index, header.id, source, e),
    }
}

async fn on_receipt_request(inner: &Arc<TransportInner>, header: FrameHeader, source: SocketAddr) {
    inner.address_map.record(header.id.cluster, source);
    if !addressed_to_us(inner, &header) {
        trace!("receipt request for {:?} is not addressed to this node - ignoring", header.destination);
        return;
    }

    let Some(msg) = get_or_create_receiving(inner, &header, source) else {
        return;
    };

    // only the unicast addressee acknowledges; a broadcast receipt request can at most
    //  have created the receive state above
    if header.destination != Some(inner.cluster_id) {
        trace!("not answering receipt request for broadcast message {:?}", header.id);
        return;
    }

    if msg.is_complete() {
        process_and_ack(inner, &msg, source).await;
    } else {
        trace!("receipt requested for incomplete message {:?} - requesting missing chunks", header.id);
        for window in msg.missing_index_windows(inner.config.max_missing_list) {
            let frame = Frame::new(msg.header(), FrameBody::ChunksNeeded { indices: window });
            inner.send_frame_to(source, &frame).await;
        }
    }
}

fn on_no_longer_exists(inner: &Arc<TransportInner>, header: FrameHeader, source: SocketAddr) {
    inner.address_map.record(header.id.cluster, source);
    // advisory only: the sender has forgotten the message, so re-send requests are
    //  pointless. The receive-side timers will reap the partial state on their own.
    debug!(
        "{} reports that message {:?} no longer exists on the sending side",
        source, header.id
    );
}

/// The at-most-once handover of a complete message, plus the acknowledgement the
///  protocol owes for unicast messages. Broadcast messages are never acknowledged.
async fn process_and_ack(inner: &Arc<TransportInner>, msg: &Arc<ReceivingMessage>, source: SocketAddr) {
    match msg.process_once() {
        ProcessOutcome::Dispatch(message) => {
            debug!("dispatching message {:?} from {}", msg.id(), source);
            inner.dispatcher.process_message(source, message).await;
            if msg.destination().is_some() {
                send_receipt(inner, msg, 0, source).await;
            }
        }
        ProcessOutcome::AlreadyProcessed => {
            if msg.destination().is_some() {
                send_receipt(inner, msg, 0, source).await;
            }
        }
        ProcessOutcome::DecodeFailed => {
            warn!("payload of {:?} does not decode to a cluster message", msg.id());
            if msg.destination().is_some() {
                send_receipt(inner, msg, 1, source).await;
            }
        }
    }
}

async fn send_receipt(
    inner: &Arc<TransportInner>,
    msg: &Arc<ReceivingMessage>,
    error_code: u16,
    source: SocketAddr,
) {
    let frame = Frame::new(msg.header(), FrameBody::Receipt { error_code });
    inner.send_frame_to(source, &frame).await;
}

async fn on_receipt(
    inner: &Arc<TransportInner>,
    header: FrameHeader,
    error_code: u16,
    source: SocketAddr,
) {
    let Some(msg) = inner.sent.get(&header.id).map(|e| e.value().clone()) else {
        reply_no_longer_exists(inner, &header, source).await;
        return;
    };

    if error_code != 0 {
        warn!(
            "{} acknowledged message {:?} with error code {} - it was delivered but not processed",
            source, header.id, error_code
        );
    }

    if msg.mark_received(&inner.config) {
        debug!("message {:?} acknowledged by {}", header.id, source);
        let _ = inner.queues.sent_completed.send(header.id);
    }
}

async fn on_chunks_needed(
    inner: &Arc<TransportInner>,
    header: FrameHeader,
    indices: Vec<u32>,
    source: SocketAddr,
) {
    let Some(msg) = inner.sent.get(&header.id).map(|e| e.value().clone()) else {
        reply_no_longer_exists(inner, &header, source).await;
        return;
    };

    debug!("{} requests {} chunk(s) of {:?}", source, indices.len(), header.id);
    inner.transmit_chunks(&msg, indices.into_iter()).await;
}

async fn on_chunk_ranges_needed(
    inner: &Arc<TransportInner>,
    header: FrameHeader,
    ranges: Vec<(u32, u32)>,
    source: SocketAddr,
) {
    let Some(msg) = inner.sent.get(&header.id).map(|e| e.value().clone()) else {
        reply_no_longer_exists(inner, &header, source).await;
        return;
    };

    let total_chunks = msg.total_chunks();
    let mut indices = Vec::new();
    for (lo, hi) in ranges {
        // ranges are inclusive on both ends
        if lo > hi || hi >= total_chunks {
            warn!("{} requests invalid chunk range ({}, {}) of {:?}", source, lo, hi, header.id);
            continue;
        }
        indices.extend(lo..=hi);
    }

    debug!("{} requests {} chunk(s) of {:?} by range", source, indices.len(), header.id);
    inner.transmit_chunks(&msg, indices.into_iter()).await;
}

/// Educate a peer asking about a message this node has no send-side state for.
async fn reply_no_longer_exists(
    inner: &Arc<TransportInner>,
    header: &FrameHeader,
    source: SocketAddr,
) {
    debug!("{} asked about unknown message {:?} - replying that it no longer exists", source, header.id);
    let frame = Frame::new(*header, FrameBody::NoLongerExists);
    inner.send_frame_to(source, &frame).await;
}
