use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use crate::buffer_pool::BufferPool;
use crate::config::TransportConfig;
use crate::diagnostics::DiagnosticSender;
use crate::member::MemberId;
use crate::membership::MemberDirectory;
use crate::message::IncomingMessage;
use crate::message_dispatcher::MessageDispatcher;
use crate::packet::{AckPacket, DiagnosticPacket, MessagePacket, MessagePacketKind, Packet, PacketRef, FIRST_MESSAGE_ID};
use crate::packet_codec::PacketCodec;
use crate::peer_state::PeerState;
use crate::queues::ack_queue::{AckMarkers, AckQueue};
use crate::queues::confirmation_queue::ConfirmationQueue;
use crate::queues::engine_queue::EngineQueue;
use crate::stats::ReceiverStats;
use crate::trint::{from_trint, Trint};
use crate::windowed_array::WindowedArray;

const GARBAGE_WARNING_INTERVAL: Duration = Duration::from_secs(10);

pub enum ReceiverEvent {
    Datagram {
        buf: BytesMut,
        from: SocketAddr,
    },
    MemberLeft(MemberId),
}

/// The entry point for received datagrams. Listeners take a pooled buffer, fill it and submit
///  it; the receiver returns the buffer to the pool.
#[derive(Clone)]
pub struct DatagramSink {
    ingress: Arc<EngineQueue<ReceiverEvent>>,
    pool: Arc<BufferPool>,
}

impl DatagramSink {
    pub fn new(ingress: Arc<EngineQueue<ReceiverEvent>>, pool: Arc<BufferPool>) -> DatagramSink {
        DatagramSink {
            ingress,
            pool,
        }
    }

    pub fn buffer(&self) -> BytesMut {
        self.pool.get_from_pool()
    }

    pub fn submit(&self, buf: BytesMut, from: SocketAddr) {
        self.ingress.add(ReceiverEvent::Datagram { buf, from });
    }

    /// returns a buffer that was taken but not submitted
    pub fn release(&self, buf: BytesMut) {
        self.pool.return_to_pool(buf);
    }

    /// copies a datagram into a pooled buffer and submits it
    pub fn submit_slice(&self, datagram: &[u8], from: SocketAddr) {
        let mut buf = self.buffer();
        buf.extend_from_slice(datagram);
        self.submit(buf, from);
    }
}

enum PileEntry {
    /// sequels that arrived before the message's first packet
    Sequels(BTreeMap<u32, Bytes>),
    /// the message is being assembled in the incoming window at this to-message id
    Assigned(u64),
    /// the message was delivered, later copies of its packets are duplicates
    Delivered,
}

struct Piled {
    entry: PileEntry,
    since: Instant,
}

/// Reassembly state for messages from a single peer
struct InboundPeer {
    /// incoming messages keyed by their position in the sequence of messages from the peer to
    ///  this node
    incoming: WindowedArray<IncomingMessage>,
    /// per sender message id, for multi-packet messages
    pile: FxHashMap<u64, Piled>,
    newest_from: Option<PacketRef>,
    contiguous_from: Option<PacketRef>,
}

impl InboundPeer {
    fn new() -> InboundPeer {
        InboundPeer {
            incoming: WindowedArray::new(FIRST_MESSAGE_ID),
            pile: FxHashMap::default(),
            newest_from: None,
            contiguous_from: None,
        }
    }

    fn markers(&self) -> AckMarkers {
        AckMarkers {
            newest_from: self.newest_from,
            contiguous_from: self.contiguous_from,
        }
    }

    fn note_newest(&mut self, packet: PacketRef) {
        if self.newest_from.map_or(true, |n| packet > n) {
            self.newest_from = Some(packet);
        }
    }

    fn advance_contiguous(&mut self, packet: PacketRef) {
        if self.contiguous_from.map_or(true, |c| packet > c) {
            self.contiguous_from = Some(packet);
        }
    }

    /// `true` if the peer sent packets to this node that did not arrive (yet)
    fn has_gap(&self) -> bool {
        match (self.newest_from, self.contiguous_from) {
            (Some(newest), Some(contiguous)) => newest > contiguous,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Returns `false` if the packet was received before
    fn on_directed(&mut self, from: MemberId, from_message_id: u64, part_count: u32, to_trint: Trint, payload: Bytes, now: Instant) -> bool {
        let first_index = self.incoming.first_index();
        let Some(to_id) = from_trint(to_trint, first_index) else {
            return false;
        };
        if to_id < first_index {
            return false;
        }
        if let Some(existing) = self.incoming.get_mut(to_id) {
            return existing.set_part(0, payload);
        }

        let mut message = IncomingMessage::new(from, from_message_id, part_count);
        message.set_part(0, payload);

        if part_count > 1 {
            match self.pile.remove(&from_message_id) {
                Some(Piled { entry: PileEntry::Sequels(parts), .. }) => {
                    trace!("message {} from {}: adding {} piled sequels", from_message_id, from, parts.len());
                    for (part_index, part) in parts {
                        message.set_part(part_index, part);
                    }
                }
                Some(other) => {
                    self.pile.insert(from_message_id, other);
                    return false;
                }
                None => {}
            }
            self.pile.insert(from_message_id, Piled { entry: PileEntry::Assigned(to_id), since: now });
        }

        match self.incoming.set(to_id, message) {
            Ok(_) => true,
            Err(e) => {
                warn!("dropping message {} from {}: {}", from_message_id, from, e);
                false
            }
        }
    }

    /// Returns `false` if the packet was received before
    fn on_sequel(&mut self, from_message_id: u64, part_index: u32, payload: Bytes, now: Instant) -> bool {
        match self.pile.get_mut(&from_message_id) {
            Some(Piled { entry: PileEntry::Assigned(to_id), .. }) => {
                let to_id = *to_id;
                self.incoming.get_mut(to_id)
                    .map_or(false, |message| message.set_part(part_index, payload))
            }
            Some(Piled { entry: PileEntry::Sequels(parts), .. }) => {
                if parts.contains_key(&part_index) {
                    return false;
                }
                parts.insert(part_index, payload);
                true
            }
            Some(Piled { entry: PileEntry::Delivered, .. }) => false,
            None => {
                let mut parts = BTreeMap::new();
                parts.insert(part_index, payload);
                self.pile.insert(from_message_id, Piled { entry: PileEntry::Sequels(parts), since: now });
                true
            }
        }
    }

    /// Removes the complete messages at the front of the incoming window, advancing the
    ///  contiguous marker
    fn take_ready(&mut self, now: Instant) -> Vec<IncomingMessage> {
        let mut ready = Vec::new();
        loop {
            let first_index = self.incoming.first_index();
            let Some(message) = self.incoming.get(first_index) else {
                break;
            };

            if !message.is_complete() {
                if let Some(first_missing) = message.first_missing() {
                    if first_missing > 0 {
                        let received = PacketRef::new(message.message_id(), first_missing - 1);
                        self.advance_contiguous(received);
                    }
                }
                break;
            }

            let Some(message) = self.incoming.remove(first_index) else {
                break;
            };
            self.advance_contiguous(PacketRef::new(message.message_id(), message.part_count() - 1));
            if let Some(piled) = self.pile.get_mut(&message.message_id()) {
                piled.entry = PileEntry::Delivered;
                piled.since = now;
            }
            ready.push(message);
        }
        ready
    }

    /// Forgets piled sequels and delivered markers that are older than the sender would resend
    fn prune_pile(&mut self, now: Instant, max_age: Duration) {
        self.pile.retain(|_, piled| {
            matches!(piled.entry, PileEntry::Assigned(_)) || now.duration_since(piled.since) < max_age
        });
    }
}

#[derive(Default)]
struct GarbageTracker {
    count: u64,
    last_warning: Option<Instant>,
}

impl GarbageTracker {
    fn on_garbage(&mut self, from: SocketAddr, now: Instant) {
        self.count += 1;

        let elapsed = self.last_warning.map(|t| now.duration_since(t));
        if elapsed.map_or(true, |e| e >= GARBAGE_WARNING_INTERVAL) {
            let rate = self.count as f64 / elapsed.unwrap_or(Duration::ZERO).as_secs_f64().max(1.0);
            warn!("received {} datagrams that are not protocol traffic ({:.1}/s), most recently from {:?}", self.count, rate, from);
            self.count = 0;
            self.last_warning = Some(now);
        }
    }
}

/// The receiver engine: decodes datagrams, reassembles messages and delivers them in order per
///  sender, and collects acks for the publisher to send. Acks from peers are handed over to the
///  publisher.
pub struct Receiver {
    self_id: MemberId,
    config: Arc<TransportConfig>,
    directory: Arc<dyn MemberDirectory>,
    dispatcher: Arc<dyn MessageDispatcher>,
    ingress: Arc<EngineQueue<ReceiverEvent>>,
    ack_queue: Arc<AckQueue>,
    confirmations: Arc<ConfirmationQueue>,
    pool: Arc<BufferPool>,
    diagnostics: Arc<DiagnosticSender>,
    stats: Arc<ReceiverStats>,

    peers: FxHashMap<MemberId, InboundPeer>,
    garbage: GarbageTracker,
    last_pile_prune: Option<Instant>,
}

impl Receiver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: MemberId,
        config: Arc<TransportConfig>,
        directory: Arc<dyn MemberDirectory>,
        dispatcher: Arc<dyn MessageDispatcher>,
        ingress: Arc<EngineQueue<ReceiverEvent>>,
        ack_queue: Arc<AckQueue>,
        confirmations: Arc<ConfirmationQueue>,
        pool: Arc<BufferPool>,
        diagnostics: Arc<DiagnosticSender>,
        stats: Arc<ReceiverStats>,
    ) -> Receiver {
        Receiver {
            self_id,
            config,
            directory,
            dispatcher,
            ingress,
            ack_queue,
            confirmations,
            pool,
            diagnostics,
            stats,
            peers: FxHashMap::default(),
            garbage: GarbageTracker::default(),
            last_pile_prune: None,
        }
    }

    pub async fn run(mut self) {
        info!("starting receiver loop");
        loop {
            while let Some(event) = self.ingress.poll() {
                let start = Instant::now();
                self.on_event(event, start).await;
                self.stats.busy_time.add(start.elapsed());
            }
            self.ingress.wakeup().wait_until(None).await;
        }
    }

    pub async fn on_event(&mut self, event: ReceiverEvent, now: Instant) {
        match event {
            ReceiverEvent::Datagram { buf, from } => {
                let correlation_id = Uuid::new_v4();
                let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
                self.on_datagram(buf, from, now)
                    .instrument(span)
                    .await;
            }
            ReceiverEvent::MemberLeft(member) => self.on_member_left(member),
        }
        self.prune_piles(now);
    }

    async fn on_datagram(&mut self, buf: BytesMut, from: SocketAddr, now: Instant) {
        trace!("received datagram of {} bytes from {:?}", buf.len(), from);
        self.stats.datagrams_received.inc();

        if !PacketCodec::is_protocol_datagram(&buf) {
            self.stats.garbage_received.inc();
            self.garbage.on_garbage(from, now);
            self.pool.return_to_pool(buf);
            return;
        }

        let decoded = PacketCodec::decode_datagram(&buf);
        self.pool.return_to_pool(buf);

        let packets = match decoded {
            Ok(packets) => packets,
            Err(e) => {
                warn!("received corrupt datagram from {:?}, dropping: {}", from, e);
                self.stats.corrupt_received.inc();
                return;
            }
        };

        for packet in packets {
            self.on_packet(packet, now).await;
        }
    }

    async fn on_packet(&mut self, packet: Packet, now: Instant) {
        let from_id = packet.from_id();
        if from_id == self.self_id {
            trace!("ignoring packet from self");
            return;
        }
        let Some(peer) = self.directory.lookup(from_id) else {
            debug!("dropping {:?} packet from unknown member {}", packet.packet_type(), from_id);
            return;
        };
        peer.record_incoming(now);

        match packet {
            Packet::Message(packet) => self.on_message_packet(&peer, packet, now).await,
            Packet::Ack(ack) => self.on_ack(&peer, ack, now),
            Packet::Diagnostic(probe) => self.on_diagnostic(&peer, probe).await,
        }
    }

    /// The number of entries per ack to a peer: as many as fit into a packet both sides are
    ///  happy with, but no more than the peer asked for
    fn max_ack_entries(&self, peer: &PeerState) -> usize {
        let packet_length = peer.preferred_packet_length()
            .map_or(self.config.preferred_packet_length, |l| l.min(self.config.preferred_packet_length));
        let mut result = PacketCodec::max_ack_entries(packet_length);
        let preferred = peer.preferred_ack_size();
        if preferred > 0 {
            result = result.min(preferred);
        }
        result.max(1)
    }

    async fn on_message_packet(&mut self, peer: &PeerState, packet: MessagePacket, now: Instant) {
        let self_id = self.self_id;

        if packet.kind == MessagePacketKind::Broadcast {
            let mut message = IncomingMessage::new(peer.id(), 0, 1);
            message.set_part(0, packet.payload);
            self.deliver(message).await;
            return;
        }
        if !packet.is_addressed_to(self_id) {
            trace!("dropping packet from {} that is not addressed to this node", peer.id());
            return;
        }
        let Some(packet_ref) = packet.packet_ref() else {
            return;
        };

        self.stats.packets_received.inc();
        peer.stats().packets_received.fetch_add(1, Ordering::Relaxed);

        // duplicates are confirmed as well: the ack for the original may have been lost
        let max_ack_entries = self.max_ack_entries(peer);
        self.ack_queue.confirm(peer.id(), packet_ref, max_ack_entries, now);

        let inbound = self.peers.entry(peer.id()).or_insert_with(InboundPeer::new);
        inbound.note_newest(packet_ref);

        let is_new = match packet.kind {
            MessagePacketKind::Directed { from_message_id, part_count, destinations } => {
                match destinations.iter().find(|(m, _)| *m == self_id) {
                    Some(&(_, to_trint)) => inbound.on_directed(peer.id(), from_message_id, part_count, to_trint, packet.payload, now),
                    None => false,
                }
            }
            MessagePacketKind::Sequel { from_message_id, part_index, .. } => inbound.on_sequel(from_message_id, part_index, packet.payload, now),
            MessagePacketKind::Broadcast => false,
        };
        if !is_new {
            trace!("packet {} from {} is a duplicate", packet_ref, peer.id());
            self.stats.packets_repeated.inc();
            peer.stats().packets_repeated.fetch_add(1, Ordering::Relaxed);
        }

        let ready = inbound.take_ready(now);
        let markers = inbound.markers();
        let has_gap = inbound.has_gap();

        self.ack_queue.update_markers(peer.id(), markers);
        if has_gap && self.config.nack_enabled {
            self.ack_queue.schedule_nack(peer.id(), now);
        }

        for message in ready {
            self.deliver(message).await;
        }
    }

    async fn deliver(&self, message: IncomingMessage) {
        trace!("delivering message {} from {}", message.message_id(), message.from());
        self.stats.messages_received.inc();
        self.dispatcher.on_message(message).await;
    }

    fn on_ack(&mut self, peer: &PeerState, ack: AckPacket, now: Instant) {
        if ack.to_id != self.self_id {
            debug!("dropping ack from {} for member {}", peer.id(), ack.to_id);
            return;
        }
        self.stats.acks_received.inc();
        peer.set_preferred_ack_size(ack.preferred_ack_size as usize);

        // packets the peer sent that never arrived here
        if let Some(newest_to) = ack.newest_to {
            let inbound = self.peers.entry(peer.id()).or_insert_with(InboundPeer::new);
            inbound.note_newest(newest_to);
            if inbound.has_gap() && self.config.nack_enabled {
                self.ack_queue.update_markers(peer.id(), inbound.markers());
                self.ack_queue.schedule_nack(peer.id(), now);
            }
        }

        self.confirmations.add(ack, now);
    }

    async fn on_diagnostic(&self, peer: &PeerState, probe: DiagnosticPacket) {
        if probe.to_id != self.self_id {
            return;
        }
        debug!("received diagnostic packet from {} with ttl {}", peer.id(), probe.time_to_live);
        self.diagnostics.bounce(peer, &probe).await;
    }

    fn on_member_left(&mut self, member: MemberId) {
        debug!("dropping receive state for departed member {}", member);
        self.peers.remove(&member);
        self.ack_queue.forget(member);
    }

    fn prune_piles(&mut self, now: Instant) {
        let interval = self.config.resend_timeout;
        let last = *self.last_pile_prune.get_or_insert(now);
        if now.duration_since(last) < interval {
            return;
        }
        for peer in self.peers.values_mut() {
            peer.prune_pile(now, 2 * interval);
        }
        self.last_pile_prune = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use rstest::rstest;
    use super::*;
    use crate::config::FlowControlConfig;
    use crate::membership::Members;
    use crate::queues::wakeup::Wakeup;
    use crate::test_util::{test_addr, CollectingDispatcher, RecordingSocket};

    fn m(id: u16) -> MemberId {
        MemberId::from_raw(id)
    }

    struct Fixture {
        receiver: Receiver,
        dispatcher: Arc<CollectingDispatcher>,
        ack_queue: Arc<AckQueue>,
        confirmations: Arc<ConfirmationQueue>,
        socket: Arc<RecordingSocket>,
        pool: Arc<BufferPool>,
        members: Arc<Members>,
        stats: Arc<ReceiverStats>,
    }

    impl Fixture {
        fn new() -> Fixture {
            let config = Arc::new(TransportConfig::default_ipv4());
            let members = Arc::new(Members::new());
            members.add(PeerState::new(m(2), test_addr(2), &config.flow_control));
            members.add(PeerState::new(m(3), test_addr(3), &config.flow_control));

            let publisher_wakeup = Arc::new(Wakeup::new());
            let dispatcher = Arc::new(CollectingDispatcher::new());
            let ack_queue = Arc::new(AckQueue::new(config.ack_delay, config.nack_delay, publisher_wakeup.clone()));
            let confirmations = Arc::new(ConfirmationQueue::new(publisher_wakeup));
            let socket = Arc::new(RecordingSocket::new(test_addr(1)));
            let pool = Arc::new(BufferPool::new(config.max_packet_length, 16));
            let stats = Arc::new(ReceiverStats::default());

            let receiver = Receiver::new(
                m(1),
                config,
                members.clone(),
                dispatcher.clone(),
                Arc::new(EngineQueue::new(Arc::new(Wakeup::new()))),
                ack_queue.clone(),
                confirmations.clone(),
                pool.clone(),
                Arc::new(DiagnosticSender::new(m(1), socket.clone(), pool.clone())),
                stats.clone(),
            );
            Fixture { receiver, dispatcher, ack_queue, confirmations, socket, pool, members, stats }
        }

        async fn receive(&mut self, packets: Vec<Packet>) {
            let mut buf = self.pool.get_from_pool();
            PacketCodec::put_datagram_header(&mut buf);
            for packet in &packets {
                PacketCodec::ser(packet, &mut buf);
            }
            self.receive_raw(buf).await;
        }

        async fn receive_raw(&mut self, buf: BytesMut) {
            self.receiver.on_event(ReceiverEvent::Datagram { buf, from: test_addr(2) }, Instant::now()).await;
        }

        fn delivered(&self) -> Vec<(MemberId, Bytes)> {
            self.dispatcher.received()
        }
    }

    fn directed(from_message_id: u64, to_trint: Trint, part_count: u32, payload: &'static [u8]) -> Packet {
        Packet::Message(MessagePacket {
            from_id: m(2),
            kind: MessagePacketKind::Directed { from_message_id, part_count, destinations: vec![(m(1), to_trint)] },
            payload: Bytes::from_static(payload),
        })
    }

    fn sequel(from_message_id: u64, part_index: u32, payload: &'static [u8]) -> Packet {
        Packet::Message(MessagePacket {
            from_id: m(2),
            kind: MessagePacketKind::Sequel { from_message_id, part_index, destinations: [m(1)].into_iter().collect() },
            payload: Bytes::from_static(payload),
        })
    }

    fn ack_from_2(newest_to: Option<PacketRef>) -> Packet {
        Packet::Ack(AckPacket {
            from_id: m(2),
            to_id: m(1),
            is_request: false,
            entries: vec![],
            newest_from: None,
            contiguous_from: None,
            newest_to,
            preferred_ack_size: 17,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_packet_message() {
        let mut f = Fixture::new();
        f.receive(vec![directed(5, 1, 1, b"hello")]).await;

        assert_eq!(f.delivered(), vec![(m(2), Bytes::from_static(b"hello"))]);
        assert_eq!(f.ack_queue.markers(m(2)), AckMarkers {
            newest_from: Some(PacketRef::new(5, 0)),
            contiguous_from: Some(PacketRef::new(5, 0)),
        });

        let (ack, _) = f.ack_queue.remove_ripe(Instant::now() + Duration::from_secs(1)).unwrap();
        assert_eq!(ack.to, m(2));
        assert_eq!(ack.entries, vec![PacketRef::new(5, 0)]);
        assert!(!ack.is_request);
        assert_eq!(f.pool.num_in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_part_count() {
        let mut f = Fixture::new();
        f.receive(vec![directed(5, 1, u32::MAX, b"x")]).await;
        f.receive(vec![sequel(5, u32::MAX - 1, b"y")]).await;

        assert!(f.delivered().is_empty());
        assert_eq!(f.pool.num_in_use(), 0);

        let (ack, _) = f.ack_queue.remove_ripe(Instant::now() + Duration::from_secs(1)).unwrap();
        assert_eq!(ack.entries, vec![PacketRef::new(5, 0), PacketRef::new(5, u32::MAX - 1)]);
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2])]
    #[case::reversed(vec![2, 1, 0])]
    #[case::header_in_the_middle(vec![1, 0, 2])]
    #[case::duplicates_before_header(vec![2, 2, 1, 1, 0])]
    #[case::duplicates_after_completion(vec![0, 1, 2, 2, 0, 1])]
    #[case::duplicate_headers(vec![0, 0, 2, 1])]
    #[tokio::test(start_paused = true)]
    async fn test_multi_packet_message_delivered_once(#[case] order: Vec<u32>) {
        let mut f = Fixture::new();
        for part in &order {
            let packet = match part {
                0 => directed(10, 1, 3, b"ab"),
                1 => sequel(10, 1, b"cd"),
                _ => sequel(10, 2, b"e"),
            };
            f.receive(vec![packet]).await;
        }

        assert_eq!(f.delivered(), vec![(m(2), Bytes::from_static(b"abcde"))]);
        assert_eq!(f.stats.packets_received.get(), order.len() as u64);
        assert_eq!(f.stats.packets_repeated.get(), order.len() as u64 - 3);
        assert_eq!(f.ack_queue.markers(m(2)).contiguous_from, Some(PacketRef::new(10, 2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_are_delivered_in_order() {
        let mut f = Fixture::new();
        f.receive(vec![directed(7, 2, 1, b"second")]).await;
        assert!(f.delivered().is_empty());

        // the gap is reported right away
        let (ack, markers) = f.ack_queue.remove_ripe(Instant::now() + Duration::from_millis(1)).unwrap();
        assert!(ack.is_request);
        assert_eq!(markers.newest_from, Some(PacketRef::new(7, 0)));
        assert_eq!(markers.contiguous_from, None);

        f.receive(vec![directed(5, 1, 1, b"first")]).await;
        assert_eq!(f.delivered(), vec![
            (m(2), Bytes::from_static(b"first")),
            (m(2), Bytes::from_static(b"second")),
        ]);
        assert_eq!(f.ack_queue.markers(m(2)).contiguous_from, Some(PacketRef::new(7, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contiguous_marker_in_partial_message() {
        let mut f = Fixture::new();
        f.receive(vec![directed(10, 1, 4, b"a"), sequel(10, 1, b"b"), sequel(10, 3, b"d")]).await;

        assert!(f.delivered().is_empty());
        assert_eq!(f.ack_queue.markers(m(2)), AckMarkers {
            newest_from: Some(PacketRef::new(10, 3)),
            contiguous_from: Some(PacketRef::new(10, 1)),
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_after_delivery_is_confirmed_again() {
        let mut f = Fixture::new();
        f.receive(vec![directed(5, 1, 1, b"x")]).await;
        f.receive(vec![directed(5, 1, 1, b"x")]).await;

        assert_eq!(f.delivered().len(), 1);
        assert_eq!(f.stats.packets_repeated.get(), 1);

        let (ack, _) = f.ack_queue.remove_ripe(Instant::now() + Duration::from_secs(1)).unwrap();
        assert!(!ack.is_request);
        assert_eq!(ack.entries, vec![PacketRef::new(5, 0), PacketRef::new(5, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_sequel_of_delivered_message() {
        let mut f = Fixture::new();
        f.receive(vec![directed(10, 1, 2, b"a"), sequel(10, 1, b"b")]).await;
        f.receive(vec![sequel(10, 1, b"b")]).await;

        assert_eq!(f.delivered().len(), 1);
        assert_eq!(f.stats.packets_repeated.get(), 1);
        let inbound = f.receiver.peers.get(&m(2)).unwrap();
        assert!(matches!(inbound.pile.get(&10).unwrap().entry, PileEntry::Delivered));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pile_is_pruned() {
        let mut f = Fixture::new();
        f.receive(vec![sequel(10, 1, b"b")]).await;
        assert_eq!(f.receiver.peers.get(&m(2)).unwrap().pile.len(), 1);

        tokio::time::advance(Duration::from_secs(25)).await;
        f.receiver.on_event(ReceiverEvent::MemberLeft(m(3)), Instant::now()).await;
        assert_eq!(f.receiver.peers.get(&m(2)).unwrap().pile.len(), 1);

        tokio::time::advance(Duration::from_secs(20)).await;
        f.receiver.on_event(ReceiverEvent::MemberLeft(m(3)), Instant::now()).await;
        assert!(f.receiver.peers.get(&m(2)).unwrap().pile.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_packet_for_other_member_is_ignored() {
        let mut f = Fixture::new();
        f.receive(vec![Packet::Message(MessagePacket {
            from_id: m(2),
            kind: MessagePacketKind::Directed { from_message_id: 5, part_count: 1, destinations: vec![(m(3), 1)] },
            payload: Bytes::new(),
        })]).await;

        assert!(f.delivered().is_empty());
        assert_eq!(f.ack_queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_packet_from_unknown_member_is_ignored() {
        let mut f = Fixture::new();
        f.receive(vec![Packet::Message(MessagePacket {
            from_id: m(9),
            kind: MessagePacketKind::Directed { from_message_id: 5, part_count: 1, destinations: vec![(m(1), 1)] },
            payload: Bytes::new(),
        })]).await;

        assert!(f.delivered().is_empty());
        assert_eq!(f.ack_queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast() {
        let mut f = Fixture::new();
        f.receive(vec![Packet::Message(MessagePacket {
            from_id: m(3),
            kind: MessagePacketKind::Broadcast,
            payload: Bytes::from_static(b"all"),
        })]).await;

        assert_eq!(f.delivered(), vec![(m(3), Bytes::from_static(b"all"))]);
        assert_eq!(f.ack_queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_is_forwarded() {
        let mut f = Fixture::new();
        f.receive(vec![ack_from_2(None)]).await;

        assert_eq!(f.confirmations.len(), 1);
        assert_eq!(f.members.lookup(m(2)).unwrap().preferred_ack_size(), 17);
        assert_eq!(f.ack_queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_reveals_lost_packets() {
        let mut f = Fixture::new();
        f.receive(vec![ack_from_2(Some(PacketRef::new(3, 0)))]).await;

        let (ack, markers) = f.ack_queue.remove_ripe(Instant::now() + Duration::from_millis(1)).unwrap();
        assert!(ack.is_request);
        assert!(ack.entries.is_empty());
        assert_eq!(markers.newest_from, Some(PacketRef::new(3, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_for_other_member_is_dropped() {
        let mut f = Fixture::new();
        f.receive(vec![Packet::Ack(AckPacket {
            from_id: m(2),
            to_id: m(3),
            is_request: false,
            entries: vec![],
            newest_from: None,
            contiguous_from: None,
            newest_to: None,
            preferred_ack_size: 0,
        })]).await;

        assert_eq!(f.confirmations.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_and_corrupt_datagrams() {
        let mut f = Fixture::new();

        let mut garbage = f.pool.get_from_pool();
        garbage.put_slice(b"GET / HTTP/1.1");
        f.receive_raw(garbage).await;

        let mut corrupt = f.pool.get_from_pool();
        PacketCodec::put_datagram_header(&mut corrupt);
        corrupt.put_slice(&[1, 50, 0]);
        f.receive_raw(corrupt).await;

        assert_eq!(f.stats.garbage_received.get(), 1);
        assert_eq!(f.stats.corrupt_received.get(), 1);
        assert_eq!(f.stats.datagrams_received.get(), 2);
        assert_eq!(f.pool.num_in_use(), 0);
        assert!(f.delivered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_left() {
        let mut f = Fixture::new();
        f.receive(vec![directed(10, 1, 2, b"a")]).await;
        assert_eq!(f.ack_queue.len(), 1);

        f.receiver.on_event(ReceiverEvent::MemberLeft(m(2)), Instant::now()).await;
        assert!(f.receiver.peers.is_empty());
        assert_eq!(f.ack_queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_diagnostic_is_bounced() {
        let mut f = Fixture::new();
        f.receive(vec![Packet::Diagnostic(DiagnosticPacket {
            from_id: m(2),
            to_id: m(1),
            time_to_live: 2,
            to_preferred_address: false,
        })]).await;

        let sent = f.socket.sent_packets();
        assert_eq!(sent, vec![(test_addr(2), Packet::Diagnostic(DiagnosticPacket {
            from_id: m(1),
            to_id: m(2),
            time_to_live: 1,
            to_preferred_address: false,
        }))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_ack_entries() {
        let f = Fixture::new();
        let peer = PeerState::new(m(4), test_addr(4), &FlowControlConfig::default())
            .with_preferred_packet_length(200);
        assert_eq!(f.receiver.max_ack_entries(&peer), PacketCodec::max_ack_entries(200));

        peer.set_preferred_ack_size(3);
        assert_eq!(f.receiver.max_ack_entries(&peer), 3);
    }
}
