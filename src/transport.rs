use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::address_map::AddressMap;
use crate::cluster_message::ClusterMessage;
use crate::config::{TransportConfig, BROADCAST_PORT};
use crate::dispatcher::MessageDispatcher;
use crate::frame::Frame;
use crate::identity::{ClusterIdentity, MessageId};
use crate::interfaces::SocketTable;
use crate::receiver::receiver_loop;
use crate::receiving_message::ReceivingMessage;
use crate::sending_message::SendingMessage;
#[cfg(test)]
use crate::sending_message::SendStatus;
use crate::workers::{
    received_completed_loop, received_waiting_loop, sender_loop, sent_completed_loop,
    sent_waiting_loop,
};

/// The send halves of the worker queues. Receiver tasks and workers push message ids
///  here; the matching receive halves live in the worker loops.
pub(crate) struct QueueSenders {
    pub(crate) send: UnboundedSender<MessageId>,
    pub(crate) sent_waiting: UnboundedSender<MessageId>,
    pub(crate) sent_completed: UnboundedSender<MessageId>,
    pub(crate) received_waiting: UnboundedSender<MessageId>,
    pub(crate) received_completed: UnboundedSender<MessageId>,
}

struct QueueReceivers {
    send: UnboundedReceiver<MessageId>,
    sent_waiting: UnboundedReceiver<MessageId>,
    sent_completed: UnboundedReceiver<MessageId>,
    received_waiting: UnboundedReceiver<MessageId>,
    received_completed: UnboundedReceiver<MessageId>,
}

/// Everything the receiver tasks and workers share. [ClusterTransport] is the thin
///  API wrapper around an `Arc` of this.
pub(crate) struct TransportInner {
    app_name: String,
    group_name: String,
    pub(crate) cluster_id: ClusterIdentity,
    pub(crate) config: TransportConfig,
    pub(crate) sockets: SocketTable,
    pub(crate) dispatcher: Arc<dyn MessageDispatcher>,
    pub(crate) address_map: AddressMap,
    pub(crate) sent: DashMap<MessageId, Arc<SendingMessage>>,
    pub(crate) received: DashMap<MessageId, Arc<ReceivingMessage>>,
    pub(crate) queues: QueueSenders,
    queue_receivers: Mutex<Option<QueueReceivers>>,
    done: AtomicBool,
}

impl TransportInner {
    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// The preferred address of a cluster member together with the socket that can
    ///  reach it, or `None` if either is unknown.
    pub(crate) fn destination_for(
        &self,
        id: ClusterIdentity,
    ) -> Option<(SocketAddr, Arc<UdpSocket>)> {
        let address = self.address_map.preferred_address(&id)?;
        let interface = self.sockets.socket_for_target(address.ip())?;
        Some((address, interface.unicast.clone()))
    }

    /// Unicast a frame to a known peer address, picking the interface that shares its
    ///  network. Send failures are logged, not propagated - the protocol's timers take
    ///  care of retries.
    pub(crate) async fn send_frame_to(&self, target: SocketAddr, frame: &Frame) {
        let Some(interface) = self.sockets.socket_for_target(target.ip()) else {
            debug!("no interface shares a network with {} - dropping {:?} frame", target, frame.frame_type());
            return;
        };

        let mut buf = BytesMut::new();
        frame.ser(&mut buf);

        trace!("sending {:?} frame to {}", frame.frame_type(), target);
        if let Err(e) = interface.unicast.send_to(&buf, target).await {
            error!("error sending to {}: {}", target, e);
        }
    }

    /// Emit a frame on every interface's broadcast address.
    pub(crate) async fn broadcast_frame(&self, frame: &Frame) {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);

        for interface in &self.sockets.interfaces {
            let target = SocketAddr::from((interface.broadcast_addr, BROADCAST_PORT));
            trace!("broadcasting {:?} frame to {}", frame.frame_type(), target);
            if let Err(e) = interface.unicast.send_to(&buf, target).await {
                error!("error broadcasting to {}: {}", target, e);
            }
        }
    }

    /// The routing used for a message's chunks and receipt requests: unicast when the
    ///  destination resolves to an address, broadcast on every interface otherwise.
    pub(crate) async fn send_frame_routed(
        &self,
        destination: Option<ClusterIdentity>,
        frame: &Frame,
    ) {
        match destination.and_then(|id| self.destination_for(id)) {
            Some((address, socket)) => {
                let mut buf = BytesMut::new();
                frame.ser(&mut buf);

                trace!("sending {:?} frame to {}", frame.frame_type(), address);
                if let Err(e) = socket.send_to(&buf, address).await {
                    error!("error sending to {}: {}", address, e);
                }
            }
            None => self.broadcast_frame(frame).await,
        }
    }

    /// (Re-)transmit the given chunks of an outbound message over its route.
    pub(crate) async fn transmit_chunks(
        &self,
        msg: &SendingMessage,
        indices: impl Iterator<Item = u32>,
    ) {
        for index in indices {
            match msg.chunk_frame(index) {
                Some(frame) => self.send_frame_routed(msg.destination(), &frame).await,
                None => warn!(
                    "chunk {} of {:?} requested but the message only has {}",
                    index,
                    msg.id(),
                    msg.total_chunks()
                ),
            }
        }
    }
}

/// Reliable chunked messaging between the members of one cluster, identified by
///  `(app_name, group_name)`.
///
/// One instance per cluster exists per process (see [get_cluster]). All methods are
///  cheap and non-blocking; the actual protocol work happens on the spawned receiver
///  and worker tasks.
pub struct ClusterTransport {
    inner: Arc<TransportInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ClusterTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ClusterTransport{{{}/{}, {:?}}}",
            self.inner.app_name, self.inner.group_name, self.inner.cluster_id
        )
    }
}

impl ClusterTransport {
    /// Bind sockets on all usable interfaces and assemble a transport. The instance is
    ///  inert until [startup](Self::startup) is called.
    pub async fn new(
        app_name: &str,
        group_name: &str,
        dispatcher: Arc<dyn MessageDispatcher>,
        config: TransportConfig,
    ) -> anyhow::Result<ClusterTransport> {
        config.validate()?;
        let sockets = SocketTable::discover().await?;
        Ok(Self::with_socket_table(
            app_name, group_name, dispatcher, config, sockets,
        ))
    }

    pub(crate) fn with_socket_table(
        app_name: &str,
        group_name: &str,
        dispatcher: Arc<dyn MessageDispatcher>,
        config: TransportConfig,
        sockets: SocketTable,
    ) -> ClusterTransport {
        let (send_tx, send_rx) = unbounded_channel();
        let (sent_waiting_tx, sent_waiting_rx) = unbounded_channel();
        let (sent_completed_tx, sent_completed_rx) = unbounded_channel();
        let (received_waiting_tx, received_waiting_rx) = unbounded_channel();
        let (received_completed_tx, received_completed_rx) = unbounded_channel();

        ClusterTransport {
            inner: Arc::new(TransportInner {
                app_name: app_name.to_string(),
                group_name: group_name.to_string(),
                cluster_id: ClusterIdentity::mint(),
                config,
                sockets,
                dispatcher,
                address_map: AddressMap::new(),
                sent: DashMap::new(),
                received: DashMap::new(),
                queues: QueueSenders {
                    send: send_tx,
                    sent_waiting: sent_waiting_tx,
                    sent_completed: sent_completed_tx,
                    received_waiting: received_waiting_tx,
                    received_completed: received_completed_tx,
                },
                queue_receivers: Mutex::new(Some(QueueReceivers {
                    send: send_rx,
                    sent_waiting: sent_waiting_rx,
                    sent_completed: sent_completed_rx,
                    received_waiting: received_waiting_rx,
                    received_completed: received_completed_rx,
                })),
                done: AtomicBool::new(false),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn cluster_id(&self) -> ClusterIdentity {
        self.inner.cluster_id
    }

    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    pub fn group_name(&self) -> &str {
        &self.inner.group_name
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_done()
    }

    /// Spawn one receiver task per socket plus the five protocol workers. Idempotent.
    pub fn startup(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            warn!("{:?} is already started", self);
            return;
        }

        info!(
            "starting {:?} on {} interface(s)",
            self,
            self.inner.sockets.interfaces.len()
        );
        self.spawn_receivers_into(&mut workers);
        self.spawn_workers_into(&mut workers);
    }

    /// Set the done flag and tear down all tasks. In-flight messages and retries are
    ///  dropped - no graceful drain.
    pub fn shutdown(&self) {
        if self.inner.done.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("shutting down {:?}", self);
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            handle.abort();
        }
    }

    /// Hand a message to the transport: unicast to `destination`, or broadcast to the
    ///  whole group when `destination` is `None`. Returns the freshly minted message id
    ///  once the message is queued; actual transmission is asynchronous and delivery is
    ///  at-least-once with receiver-side deduplication.
    pub fn send(
        &self,
        destination: Option<ClusterIdentity>,
        message: &ClusterMessage,
    ) -> anyhow::Result<MessageId> {
        if self.inner.is_done() {
            bail!("transport is shut down");
        }

        let msg = SendingMessage::new(
            self.inner.cluster_id,
            destination,
            message.to_bytes(),
            &self.inner.config,
        )?;
        let id = msg.id();

        debug!(
            "enqueueing message {:?} ({} bytes in {} chunks) for {:?}",
            id,
            msg.total_size(),
            msg.total_chunks(),
            destination
        );
        self.inner.sent.insert(id, Arc::new(msg));
        if self.inner.queues.send.send(id).is_err() {
            self.inner.sent.remove(&id);
            bail!("transport is shut down");
        }
        Ok(id)
    }

    pub fn send_all(&self, message: &ClusterMessage) -> anyhow::Result<MessageId> {
        self.send(None, message)
    }

    pub fn send_to_actor(
        &self,
        destination: ClusterIdentity,
        actor: MessageId,
        payload: Bytes,
    ) -> anyhow::Result<MessageId> {
        self.send(
            Some(destination),
            &ClusterMessage::ActorMessage { actor, payload },
        )
    }

    pub fn send_all_by_class_name(
        &self,
        class_name: &str,
        payload: Bytes,
    ) -> anyhow::Result<MessageId> {
        self.send_all(&ClusterMessage::ActorMessageByClass {
            class_name: class_name.to_string(),
            payload,
        })
    }

    pub fn send_all_by_actor_id(&self, actor_id: &str, payload: Bytes) -> anyhow::Result<MessageId> {
        self.send_all(&ClusterMessage::ActorMessageById {
            actor_id: actor_id.to_string(),
            payload,
        })
    }

    pub fn send_stop_all(&self) -> anyhow::Result<MessageId> {
        self.send_all(&ClusterMessage::Stop)
    }

    pub fn send_status_request(&self) -> anyhow::Result<MessageId> {
        self.send_all(&ClusterMessage::StatusRequest)
    }

    fn spawn_receivers_into(&self, workers: &mut Vec<JoinHandle<()>>) {
        for interface in &self.inner.sockets.interfaces {
            workers.push(tokio::spawn(receiver_loop(
                self.inner.clone(),
                interface.unicast.clone(),
            )));
            workers.push(tokio::spawn(receiver_loop(
                self.inner.clone(),
                interface.broadcast.clone(),
            )));
        }
    }

    fn spawn_workers_into(&self, workers: &mut Vec<JoinHandle<()>>) {
        let Some(queues) = self.inner.queue_receivers.lock().take() else {
            warn!("{:?}: workers are already running", self);
            return;
        };

        workers.push(tokio::spawn(sender_loop(self.inner.clone(), queues.send)));
        workers.push(tokio::spawn(sent_waiting_loop(
            self.inner.clone(),
            queues.sent_waiting,
        )));
        workers.push(tokio::spawn(sent_completed_loop(
            self.inner.clone(),
            queues.sent_completed,
        )));
        workers.push(tokio::spawn(received_waiting_loop(
            self.inner.clone(),
            queues.received_waiting,
        )));
        workers.push(tokio::spawn(received_completed_loop(
            self.inner.clone(),
            queues.received_completed,
        )));
    }

    #[cfg(test)]
    pub(crate) fn spawn_workers_only(&self) {
        let mut workers = self.workers.lock();
        self.spawn_workers_into(&mut workers);
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<TransportInner> {
        &self.inner
    }
}

impl Drop for ClusterTransport {
    fn drop(&mut self) {
        self.inner.done.store(true, Ordering::Release);
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
    }
}

type RegistryKey = (String, String);

static CLUSTERS: OnceLock<tokio::sync::Mutex<FxHashMap<RegistryKey, Arc<ClusterTransport>>>> =
    OnceLock::new();

/// The process-wide transport registry: returns the running instance for
///  `(app_name, group_name)`, lazily creating and starting one if there is none (or if
///  the recorded one was shut down).
pub async fn get_cluster(
    app_name: &str,
    group_name: &str,
    dispatcher: Arc<dyn MessageDispatcher>,
) -> anyhow::Result<Arc<ClusterTransport>> {
    let registry = CLUSTERS.get_or_init(Default::default);
    let mut clusters = registry.lock().await;

    let key = (app_name.to_string(), group_name.to_string());
    if let Some(existing) = clusters.get(&key) {
        if !existing.is_shut_down() {
            return Ok(existing.clone());
        }
        debug!("transport {}/{} was shut down - replacing it", app_name, group_name);
    }

    let transport = Arc::new(
        ClusterTransport::new(app_name, group_name, dispatcher, TransportConfig::default())
            .await?,
    );
    transport.startup();
    clusters.insert(key, transport.clone());
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::MockMessageDispatcher;
    use crate::frame::{Frame, FrameBody, FrameHeader, MAX_PACKET_SIZE};
    use crate::interfaces::{InterfaceSocket, SocketTable};
    use crate::receiver::handle_datagram;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::runtime::{Builder, Runtime};
    use tokio::time::timeout;

    fn rt() -> Runtime {
        Builder::new_current_thread().enable_all().build().unwrap()
    }

    /// nominal protocol behavior with shrunk timers so tests finish quickly
    fn test_config() -> TransportConfig {
        TransportConfig {
            sending_chunk_size: 1024,
            poll_timeout: Duration::from_millis(20),
            waiting_for_receipt_timeout: Duration::from_millis(100),
            waiting_after_receipt_timeout: Duration::from_millis(300),
            waiting_for_all_chunks_timeout: Duration::from_millis(100),
            waiting_after_complete_timeout: Duration::from_millis(300),
            ..TransportConfig::default()
        }
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        messages: Mutex<Vec<(SocketAddr, ClusterMessage)>>,
    }

    impl RecordingDispatcher {
        fn count(&self) -> usize {
            self.messages.lock().len()
        }
    }

    #[async_trait]
    impl MessageDispatcher for RecordingDispatcher {
        async fn process_message(&self, source: SocketAddr, message: ClusterMessage) {
            self.messages.lock().push((source, message));
        }
    }

    /// a single-interface socket table on loopback with ephemeral ports, standing in
    ///  for the discovered one
    async fn loopback_table() -> SocketTable {
        let unicast = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        unicast.set_broadcast(true).unwrap();
        let broadcast = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

        SocketTable {
            interfaces: vec![InterfaceSocket {
                interface_addr: Ipv4Addr::LOCALHOST,
                netmask: Ipv4Addr::new(255, 0, 0, 0),
                broadcast_addr: Ipv4Addr::new(127, 255, 255, 255),
                unicast: Arc::new(unicast),
                broadcast: Arc::new(broadcast),
            }],
        }
    }

    async fn test_node(dispatcher: Arc<dyn MessageDispatcher>) -> ClusterTransport {
        ClusterTransport::with_socket_table("app", "group", dispatcher, test_config(), loopback_table().await)
    }

    fn unicast_socket(transport: &ClusterTransport) -> Arc<UdpSocket> {
        transport.inner().sockets.interfaces[0].unicast.clone()
    }

    fn unicast_addr(transport: &ClusterTransport) -> SocketAddr {
        transport.inner().sockets.interfaces[0].unicast_addr()
    }

    async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting until {}", what);
    }

    fn ser_frame(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        buf
    }

    #[test]
    fn test_unicast_round_trip_with_cleanup() {
        rt().block_on(async {
            let dispatcher_a = Arc::new(RecordingDispatcher::default());
            let dispatcher_b = Arc::new(RecordingDispatcher::default());
            let a = test_node(dispatcher_a.clone()).await;
            let b = test_node(dispatcher_b.clone()).await;
            a.startup();
            b.startup();

            a.inner().address_map.record(b.cluster_id(), unicast_addr(&b));

            let actor = MessageId::mint(b.cluster_id());
            let payload = Bytes::from(vec![7u8; 3000]);
            let id = a.send_to_actor(b.cluster_id(), actor, payload.clone()).unwrap();
            let sending = a.inner().sent.get(&id).map(|e| e.value().clone()).unwrap();
            assert_eq!(sending.total_chunks(), 3);

            wait_until("the receiver processes the message", || dispatcher_b.count() == 1).await;
            wait_until("the sender sees the receipt", || {
                sending.status() == SendStatus::SuccessfullySent
            })
            .await;

            assert_eq!(
                dispatcher_b.messages.lock()[0].1,
                ClusterMessage::ActorMessage { actor, payload }
            );

            // retention expires on both sides and the in-flight state is removed
            wait_until("the sender cleans up", || !a.inner().sent.contains_key(&id)).await;
            wait_until("the receiver cleans up", || !b.inner().received.contains_key(&id)).await;

            // and no duplicate delivery happened along the way
            assert_eq!(dispatcher_b.count(), 1);
            assert_eq!(dispatcher_a.count(), 0);

            a.shutdown();
            b.shutdown();
        });
    }

    #[test]
    fn test_missing_chunk_is_requested_and_resent() {
        rt().block_on(async {
            let dispatcher_a = Arc::new(RecordingDispatcher::default());
            let dispatcher_b = Arc::new(RecordingDispatcher::default());
            let a = test_node(dispatcher_a.clone()).await;
            let b = test_node(dispatcher_b.clone()).await;
            a.startup();
            // no receiver tasks for the test node: the test feeds its datagrams by hand
            b.spawn_workers_only();

            let b_socket = unicast_socket(&b);
            a.inner().address_map.record(b.cluster_id(), unicast_addr(&b));

            let message = ClusterMessage::ActorMessageByClass {
                class_name: "WorkerActor".to_string(),
                payload: Bytes::from(vec![3u8; 3000]),
            };
            let id = a.send(Some(b.cluster_id()), &message).unwrap();
            let sending = a.inner().sent.get(&id).map(|e| e.value().clone()).unwrap();

            let mut chunk_dropped = false;
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            let deadline = std::time::Instant::now() + Duration::from_secs(5);

            while dispatcher_b.count() == 0 || sending.status() != SendStatus::SuccessfullySent {
                assert!(std::time::Instant::now() < deadline, "renegotiation timed out");

                let Ok(Ok((len, source))) =
                    timeout(Duration::from_millis(50), b_socket.recv_from(&mut buf)).await
                else {
                    continue;
                };

                let frame = Frame::try_deser(&mut &buf[..len]).unwrap();
                if !chunk_dropped && matches!(frame.body, FrameBody::Chunk { index: 1, .. }) {
                    // lose the middle chunk on its first transmission
                    chunk_dropped = true;
                    continue;
                }
                handle_datagram(b.inner(), &buf[..len], source).await;
            }

            assert!(chunk_dropped);
            assert_eq!(dispatcher_b.count(), 1);
            assert_eq!(dispatcher_b.messages.lock()[0].1, message);

            a.shutdown();
            b.shutdown();
        });
    }

    #[test]
    fn test_lost_receipt_is_requested_again() {
        rt().block_on(async {
            let dispatcher_a = Arc::new(RecordingDispatcher::default());
            let dispatcher_b = Arc::new(RecordingDispatcher::default());
            let a = test_node(dispatcher_a.clone()).await;
            let b = test_node(dispatcher_b.clone()).await;
            a.spawn_workers_only();
            b.startup();

            let a_socket = unicast_socket(&a);
            a.inner().address_map.record(b.cluster_id(), unicast_addr(&b));

            let id = a
                .send(Some(b.cluster_id()), &ClusterMessage::StatusRequest)
                .unwrap();
            let sending = a.inner().sent.get(&id).map(|e| e.value().clone()).unwrap();

            let mut receipts_dropped = 0;
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            let deadline = std::time::Instant::now() + Duration::from_secs(5);

            while sending.status() != SendStatus::SuccessfullySent {
                assert!(std::time::Instant::now() < deadline, "receipt recovery timed out");

                let Ok(Ok((len, source))) =
                    timeout(Duration::from_millis(50), a_socket.recv_from(&mut buf)).await
                else {
                    continue;
                };

                let frame = Frame::try_deser(&mut &buf[..len]).unwrap();
                if receipts_dropped == 0 && matches!(frame.body, FrameBody::Receipt { .. }) {
                    receipts_dropped += 1;
                    continue;
                }
                handle_datagram(a.inner(), &buf[..len], source).await;
            }

            assert_eq!(receipts_dropped, 1);
            // the repeated receipt request must not lead to a second delivery
            assert_eq!(dispatcher_b.count(), 1);

            a.shutdown();
            b.shutdown();
        });
    }

    #[test]
    fn test_nack_for_unknown_message_yields_no_longer_exists() {
        rt().block_on(async {
            let a = test_node(Arc::new(RecordingDispatcher::default())).await;

            let probe = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            let probe_addr = probe.local_addr().unwrap();

            let header = FrameHeader {
                id: MessageId::mint(ClusterIdentity::mint()),
                destination: Some(a.cluster_id()),
                total_size: 100,
                chunk_size: 10,
            };
            let nack = Frame::new(header, FrameBody::ChunksNeeded { indices: vec![0, 1] });

            handle_datagram(a.inner(), &ser_frame(&nack), probe_addr).await;

            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            let (len, _) = timeout(Duration::from_secs(1), probe.recv_from(&mut buf))
                .await
                .expect("expected a reply")
                .unwrap();

            let reply = Frame::try_deser(&mut &buf[..len]).unwrap();
            assert_eq!(reply.body, FrameBody::NoLongerExists);
            assert_eq!(reply.header.id, header.id);

            // exactly one reply per request
            assert!(timeout(Duration::from_millis(100), probe.recv_from(&mut buf))
                .await
                .is_err());
        });
    }

    #[test]
    fn test_broadcast_completes_without_receipts() {
        rt().block_on(async {
            let dispatcher = Arc::new(RecordingDispatcher::default());
            let a = test_node(dispatcher.clone()).await;
            a.spawn_workers_only();

            let id = a
                .send_all_by_class_name("WorkerActor", Bytes::from_static(&[1, 2, 3]))
                .unwrap();
            let sending = a.inner().sent.get(&id).map(|e| e.value().clone()).unwrap();

            // no receipt is expected: the sender worker completes the message right away
            wait_until("the broadcast is marked sent", || {
                sending.status() == SendStatus::SuccessfullySent
            })
            .await;
            wait_until("the retention expires", || !a.inner().sent.contains_key(&id)).await;

            a.shutdown();
        });
    }

    #[test]
    fn test_broadcast_chunk_is_processed_once_and_never_acknowledged() {
        rt().block_on(async {
            let mut mock = MockMessageDispatcher::new();
            mock.expect_process_message()
                .times(1)
                .returning(|_, _| ());
            let b = test_node(Arc::new(mock)).await;

            let probe = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            let probe_addr = probe.local_addr().unwrap();

            let payload = ClusterMessage::Stop.to_bytes();
            let frame = Frame::new(
                FrameHeader {
                    id: MessageId::mint(ClusterIdentity::mint()),
                    destination: None,
                    total_size: payload.len() as u32,
                    chunk_size: 1024,
                },
                FrameBody::Chunk { index: 0, data: payload },
            );
            let buf = ser_frame(&frame);

            handle_datagram(b.inner(), &buf, probe_addr).await;
            // a replayed chunk must not be processed again
            handle_datagram(b.inner(), &buf, probe_addr).await;

            // and no receipt goes back for a broadcast message
            let mut recv_buf = vec![0u8; MAX_PACKET_SIZE];
            assert!(
                timeout(Duration::from_millis(100), probe.recv_from(&mut recv_buf))
                    .await
                    .is_err()
            );
        });
    }

    #[test]
    fn test_sender_gives_up_after_receipt_requests_go_unanswered() {
        rt().block_on(async {
            let a = test_node(Arc::new(RecordingDispatcher::default())).await;
            a.spawn_workers_only();

            // a peer that receives but never answers
            let black_hole = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            let peer = ClusterIdentity::mint();
            a.inner()
                .address_map
                .record(peer, black_hole.local_addr().unwrap());

            let id = a.send(Some(peer), &ClusterMessage::Stop).unwrap();

            wait_until("the message is given up as lost", || {
                !a.inner().sent.contains_key(&id)
            })
            .await;

            // the peer saw the chunk plus exactly the capped number of receipt requests
            let mut receipt_requests = 0;
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            while let Ok(Ok((len, _))) =
                timeout(Duration::from_millis(150), black_hole.recv_from(&mut buf)).await
            {
                let frame = Frame::try_deser(&mut &buf[..len]).unwrap();
                if frame.body == FrameBody::ReceiptRequest {
                    receipt_requests += 1;
                }
            }
            assert_eq!(receipt_requests, test_config().max_receipt_waits);

            a.shutdown();
        });
    }

    #[test]
    fn test_receiver_abandons_incomplete_message() {
        rt().block_on(async {
            let dispatcher = Arc::new(RecordingDispatcher::default());
            let b = test_node(dispatcher.clone()).await;
            b.spawn_workers_only();

            let probe = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            let probe_addr = probe.local_addr().unwrap();

            // first chunk of a two-chunk message; the second chunk never arrives
            let header = FrameHeader {
                id: MessageId::mint(ClusterIdentity::mint()),
                destination: Some(b.cluster_id()),
                total_size: 16,
                chunk_size: 8,
            };
            let chunk = Frame::new(
                header,
                FrameBody::Chunk { index: 0, data: Bytes::from_static(&[0u8; 8]) },
            );
            handle_datagram(b.inner(), &ser_frame(&chunk), probe_addr).await;
            assert!(b.inner().received.contains_key(&header.id));

            wait_until("the partial message is abandoned", || {
                !b.inner().received.contains_key(&header.id)
            })
            .await;
            assert_eq!(dispatcher.count(), 0);

            // the sender was asked for the missing chunk up to the cap
            let mut nacks = 0;
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            while let Ok(Ok((len, _))) =
                timeout(Duration::from_millis(150), probe.recv_from(&mut buf)).await
            {
                let frame = Frame::try_deser(&mut &buf[..len]).unwrap();
                assert_eq!(frame.body, FrameBody::ChunksNeeded { indices: vec![1] });
                nacks += 1;
            }
            assert_eq!(nacks, test_config().max_chunk_waits);

            b.shutdown();
        });
    }

    #[test]
    fn test_send_after_shutdown_is_rejected() {
        rt().block_on(async {
            let a = test_node(Arc::new(RecordingDispatcher::default())).await;
            a.startup();
            a.shutdown();

            assert!(a.send_stop_all().is_err());
        });
    }

    #[test]
    fn test_get_cluster_is_a_per_name_singleton() {
        rt().block_on(async {
            let dispatcher: Arc<dyn MessageDispatcher> = Arc::new(RecordingDispatcher::default());

            // environments without a usable non-loopback interface cannot run this test
            let Ok(first) = get_cluster("app", "registry-test", dispatcher.clone()).await else {
                return;
            };
            let second = get_cluster("app", "registry-test", dispatcher.clone()).await.unwrap();
            assert!(Arc::ptr_eq(&first, &second));

            let other = get_cluster("app", "registry-test-2", dispatcher.clone()).await.unwrap();
            assert!(!Arc::ptr_eq(&first, &other));

            // a shut-down instance is replaced on the next lookup
            first.shutdown();
            let third = get_cluster("app", "registry-test", dispatcher.clone()).await.unwrap();
            assert!(!Arc::ptr_eq(&first, &third));

            other.shutdown();
            third.shutdown();
        });
    }
}
