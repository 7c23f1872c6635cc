//! The publisher engine. It packetizes submitted messages, addresses and sends the packets, and
//!  holds on to every packet until all its destinations acknowledged it or were given up on.
//!
//! The publisher's task owns all sender-side state. Other tasks hand work to it through the
//!  queues in [PublisherInbox], which share a single wakeup.

mod addressing;
mod confirmation;
mod resend;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::config::TransportConfig;
use crate::diagnostics::DiagnosticSender;
use crate::member::{MemberId, MemberSet};
use crate::membership::{MemberDirectory, PeerHealthListener};
use crate::message::{Destinations, OutboundMessage, OutgoingMessage, OutgoingMessages, OutgoingPacket};
use crate::packet::{AckPacket, MessagePacket, MessagePacketKind, Packet, PacketRef, PacketType, TrintPacketRef, FEW_MEMBERS_LIMIT, FIRST_MESSAGE_ID};
use crate::packet_codec::PacketCodec;
use crate::peer_state::{Deferral, DeliveryState, PeerState};
use crate::queues::ack_queue::{AckMarkers, AckQueue, PendingAck};
use crate::queues::bundling_queue::PacketBundle;
use crate::queues::confirmation_queue::ConfirmationQueue;
use crate::queues::engine_queue::EngineQueue;
use crate::queues::resend_queue::ResendQueue;
use crate::queues::wakeup::Wakeup;
use crate::safe_converter::PrecheckedCast;
use crate::speaker::Speaker;
use crate::stats::PublisherStats;
use crate::trint::{to_trint, MAX_TRINT_DISTANCE};
use addressing::{choose_route, MulticastBypass};

/// The speaker's volume threshold is re-tuned after this many packets even if the publisher
///  never runs out of work
const TUNING_INTERVAL_PACKETS: usize = 30_000;

/// the number of packets per peer that are remembered for early loss detection
const RECENT_PACKETS_CAPACITY: usize = 4096;

/// The queues through which other tasks hand work to the publisher
#[derive(Clone)]
pub struct PublisherInbox {
    pub wakeup: Arc<Wakeup>,
    pub submissions: Arc<EngineQueue<OutboundMessage>>,
    pub departures: Arc<EngineQueue<MemberId>>,
    pub confirmations: Arc<ConfirmationQueue>,
    pub acks: Arc<AckQueue>,
    /// the number of packets the publisher holds, for blocking submitters in a traffic jam
    pub in_flight: Arc<AtomicUsize>,
}

impl PublisherInbox {
    pub fn new(config: &TransportConfig) -> PublisherInbox {
        let wakeup = Arc::new(Wakeup::new());
        PublisherInbox {
            submissions: Arc::new(EngineQueue::new(wakeup.clone())),
            departures: Arc::new(EngineQueue::new(wakeup.clone())),
            confirmations: Arc::new(ConfirmationQueue::new(wakeup.clone())),
            acks: Arc::new(AckQueue::new(config.ack_delay, config.nack_delay, wakeup.clone())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            wakeup,
        }
    }

    /// packets held by the publisher plus messages waiting for it
    pub fn backlog(&self) -> usize {
        self.in_flight.load(Ordering::Acquire) + self.submissions.len()
    }
}

/// Sender-side state for a single peer
struct OutboundPeer {
    peer: Arc<PeerState>,
    next_to_message_id: u64,
    /// packets in the order they were sent to the peer
    recent: VecDeque<PacketRef>,
    newest_to: Option<PacketRef>,
}

impl OutboundPeer {
    fn new(peer: Arc<PeerState>) -> OutboundPeer {
        OutboundPeer {
            peer,
            next_to_message_id: FIRST_MESSAGE_ID,
            recent: VecDeque::new(),
            newest_to: None,
        }
    }

    fn take_to_message_id(&mut self) -> u64 {
        let result = self.next_to_message_id;
        self.next_to_message_id += 1;
        result
    }

    fn on_sent(&mut self, packet: PacketRef) {
        if self.newest_to.map_or(true, |n| packet > n) {
            self.newest_to = Some(packet);
        }
        self.recent.push_back(packet);
        if self.recent.len() > RECENT_PACKETS_CAPACITY {
            self.recent.pop_front();
        }
    }
}

pub struct Publisher {
    self_id: MemberId,
    config: Arc<TransportConfig>,
    inbox: PublisherInbox,
    directory: Arc<dyn MemberDirectory>,
    health: Arc<dyn PeerHealthListener>,
    speaker: Speaker,
    diagnostics: Arc<DiagnosticSender>,
    stats: Arc<PublisherStats>,

    outgoing: OutgoingMessages,
    resend_queue: ResendQueue,
    /// previously deferred packets that may be sent now, oldest first
    ready_queue: VecDeque<PacketRef>,
    peers: FxHashMap<MemberId, OutboundPeer>,
    multicast_bypass: MulticastBypass,
    preferred_ack_size: u16,
    packets_since_tuning: usize,
}

impl Publisher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: MemberId,
        config: Arc<TransportConfig>,
        inbox: PublisherInbox,
        directory: Arc<dyn MemberDirectory>,
        health: Arc<dyn PeerHealthListener>,
        speaker: Speaker,
        diagnostics: Arc<DiagnosticSender>,
        stats: Arc<PublisherStats>,
    ) -> Publisher {
        let preferred_ack_size = PacketCodec::max_ack_entries(config.preferred_packet_length)
            .min(u16::MAX as usize) as u16;

        Publisher {
            self_id,
            resend_queue: ResendQueue::new(config.resend_delay, config.resend_timeout),
            multicast_bypass: MulticastBypass::new(config.flow_control.success_goal),
            config,
            inbox,
            directory,
            health,
            speaker,
            diagnostics,
            stats,
            outgoing: OutgoingMessages::new(FIRST_MESSAGE_ID),
            ready_queue: VecDeque::new(),
            peers: FxHashMap::default(),
            preferred_ack_size,
            packets_since_tuning: 0,
        }
    }

    /// The publisher's main loop. It returns only on an internal error, which leaves the
    ///  publisher's state unreliable.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("starting publisher loop");
        loop {
            let deadline = self.next_deadline()?;
            self.inbox.wakeup.wait_until(deadline).await;

            let start = Instant::now();
            self.do_work().await?;
            self.stats.busy_time.add(start.elapsed());
        }
    }

    fn next_deadline(&mut self) -> anyhow::Result<Option<Instant>> {
        let ack_deadline = self.inbox.acks.next_deadline();
        let resend_deadline = match self.resend_queue.peek(&mut self.outgoing)? {
            Some(r) => self.outgoing.packet(r).and_then(|p| p.resend_scheduled),
            None => None,
        };
        Ok([ack_deadline, resend_deadline].into_iter().flatten().min())
    }

    /// Processes everything that is due, returning when there is nothing left to do
    async fn do_work(&mut self) -> anyhow::Result<()> {
        loop {
            let now = Instant::now();
            self.handle_departures();
            self.handle_confirmations(now);

            let mut did_work = false;

            if let Some((ack, markers)) = self.inbox.acks.remove_ripe(now) {
                self.send_ack(ack, markers).await;
                did_work = true;
            }

            // the sender's window must stay within trint distance for acks to resolve
            if (self.outgoing.window_size() as u64) < MAX_TRINT_DISTANCE {
                if let Some(message) = self.inbox.submissions.poll() {
                    self.publish(message, now).await?;
                    did_work = true;
                }
            }

            if self.resend_next(now).await? {
                did_work = true;
            }

            if let Some(r) = self.ready_queue.pop_front() {
                self.send_ready(r, now).await?;
                did_work = true;
            }

            if !did_work {
                self.speaker.tune_volume_threshold(0);
                self.speaker.flush();
                self.packets_since_tuning = 0;
                return Ok(());
            }

            if self.packets_since_tuning >= TUNING_INTERVAL_PACKETS {
                self.speaker.tune_volume_threshold(self.inbox.submissions.len());
                self.speaker.flush();
                self.packets_since_tuning = 0;
            }
        }
    }

    fn outbound(&mut self, peer: &Arc<PeerState>) -> &mut OutboundPeer {
        self.peers.entry(peer.id())
            .or_insert_with(|| OutboundPeer::new(peer.clone()))
    }

    /// the peer if it is a live cluster member
    fn live_peer(&self, member: MemberId) -> Option<Arc<PeerState>> {
        self.directory.lookup(member)
            .filter(|p| p.is_alive())
    }

    async fn publish(&mut self, message: OutboundMessage, now: Instant) -> anyhow::Result<()> {
        match message.destinations {
            Destinations::Broadcast => {
                self.send_broadcast(message.payload).await;
                Ok(())
            }
            Destinations::Members(members) => self.send_message(members, message.payload, message.deferrable, now).await,
        }
    }

    async fn send_broadcast(&mut self, payload: Bytes) {
        let packet = Packet::Message(MessagePacket {
            from_id: self.self_id,
            kind: MessagePacketKind::Broadcast,
            payload,
        });
        let encoded = PacketCodec::encode(&packet);
        if encoded.len() + PacketCodec::DATAGRAM_HEADER_LEN > self.config.max_packet_length {
            warn!("dropping broadcast of {} bytes: broadcasts must fit into a single packet", encoded.len());
            self.stats.dropped.inc();
            return;
        }

        let addresses = match self.config.multicast_addr {
            Some(group) => vec![group],
            None => self.directory.peers()
                .iter()
                .filter(|p| p.is_alive())
                .map(|p| p.send_address())
                .collect(),
        };
        if addresses.is_empty() {
            debug!("no peers to broadcast to");
            return;
        }

        self.stats.messages_sent.inc();
        self.speaker.add(PacketBundle::new(addresses, encoded)).await;
    }

    async fn send_message(&mut self, requested: MemberSet, payload: Bytes, deferrable: bool, now: Instant) -> anyhow::Result<()> {
        let mut destinations = MemberSet::new();
        let mut peers = Vec::new();
        for member in requested.iter() {
            if member == self.self_id {
                continue;
            }
            match self.live_peer(member) {
                Some(peer) => {
                    destinations.insert(member);
                    peers.push(peer);
                }
                None => debug!("message destination {} is not a live cluster member", member),
            }
        }

        if peers.is_empty() {
            debug!("dropping message without live destinations");
            self.stats.dropped.inc();
            for member in requested.iter().filter(|m| *m != self.self_id) {
                self.health.on_peer_undeliverable(member);
            }
            return Ok(());
        }

        let packet_length = peers.iter()
            .filter_map(|p| p.preferred_packet_length())
            .fold(self.config.preferred_packet_length, usize::min);

        let (directed_type, sequel_type) = match destinations.len() {
            1 => (PacketType::DirectedOne, PacketType::SequelOne),
            n if n <= FEW_MEMBERS_LIMIT => (PacketType::DirectedFew, PacketType::SequelFew),
            _ => (PacketType::DirectedMany, PacketType::SequelMany),
        };
        let available = packet_length.saturating_sub(PacketCodec::DATAGRAM_HEADER_LEN);
        let first_capacity = available.saturating_sub(PacketCodec::message_overhead(directed_type, &destinations));
        let sequel_capacity = available.saturating_sub(PacketCodec::message_overhead(sequel_type, &destinations));
        if first_capacity == 0 || sequel_capacity == 0 {
            warn!("dropping message: packet headers for {} destinations do not fit into {} bytes", destinations.len(), packet_length);
            self.stats.dropped.inc();
            return Ok(());
        }

        let parts = split_payload(&payload, first_capacity, sequel_capacity);
        let part_count: u32 = parts.len().prechecked_cast();
        let message_id = self.outgoing.next_index();

        let mut to_ids = Vec::with_capacity(peers.len());
        for peer in &peers {
            let to_id = self.outbound(peer).take_to_message_id();
            to_ids.push((peer.id(), to_trint(to_id)));
        }
        to_ids.sort_by_key(|(m, _)| *m);

        let packets = parts.into_iter()
            .enumerate()
            .map(|(part_index, part)| {
                let kind = if part_index == 0 {
                    MessagePacketKind::Directed { from_message_id: message_id, part_count, destinations: to_ids.clone() }
                }
                else {
                    MessagePacketKind::Sequel { from_message_id: message_id, part_index: part_index.prechecked_cast(), destinations: destinations.clone() }
                };
                let packet = MessagePacket { from_id: self.self_id, kind, payload: part };
                OutgoingPacket::new(packet, destinations.clone(), deferrable)
            })
            .collect::<Vec<_>>();

        let added_id = self.outgoing.add(OutgoingMessage::new(packets))?;
        if added_id != message_id {
            bail!("message id {} does not match the outgoing window's index {}", message_id, added_id);
        }
        trace!("message {} to {:?} has {} packets", message_id, destinations, part_count);

        self.inbox.in_flight.fetch_add(part_count as usize, Ordering::AcqRel);
        self.stats.messages_sent.inc();

        for part_index in 0..part_count {
            self.send_new_packet(PacketRef::new(message_id, part_index), now).await?;
        }
        Ok(())
    }

    /// First send of a packet, subject to flow control for unipoint packets
    async fn send_new_packet(&mut self, r: PacketRef, now: Instant) -> anyhow::Result<()> {
        let Some(packet) = self.outgoing.packet(r) else {
            bail!("orphaned packet {}", r);
        };
        if !packet.deferrable {
            return self.transmit(r, now, false).await;
        }
        let Some(destination) = packet.single_destination() else {
            return self.transmit(r, now, false).await;
        };
        let Some(peer) = self.live_peer(destination) else {
            return self.transmit(r, now, false).await;
        };

        let Some(packet) = self.outgoing.packet_mut(r) else {
            bail!("orphaned packet {}", r);
        };
        let deferral = peer.flow().defer(r, &mut packet.delivery_state);
        match deferral {
            Deferral::SendNow => self.transmit(r, now, false).await?,
            Deferral::Deferred => trace!("deferring packet {} to {}", r, destination),
            Deferral::ReadyQueue => self.ready_queue.push_back(r),
        }
        Ok(())
    }

    /// Sends a packet from the ready queue if flow control permits
    async fn send_ready(&mut self, r: PacketRef, now: Instant) -> anyhow::Result<()> {
        let Some(packet) = self.outgoing.packet(r) else {
            return Ok(());
        };
        let Some(destination) = packet.single_destination() else {
            return Ok(());
        };

        let Some(peer) = self.live_peer(destination) else {
            debug!("destination {} of deferred packet {} departed", destination, r);
            if let Some(packet) = self.outgoing.packet_mut(r) {
                packet.register_ack(destination);
                if packet.sent_count == 0 {
                    self.retire_packet(r)?;
                }
            }
            return Ok(());
        };

        let Some(packet) = self.outgoing.packet_mut(r) else {
            return Ok(());
        };
        if packet.sent_count > 0 {
            // sent in the meantime, the resend queue takes care of it
            return Ok(());
        }
        let deferral = peer.flow().defer(r, &mut packet.delivery_state);
        match deferral {
            Deferral::SendNow => self.transmit(r, now, false).await?,
            Deferral::Deferred => trace!("deferring packet {} to {} again", r, destination),
            Deferral::ReadyQueue => self.ready_queue.push_back(r),
        }
        Ok(())
    }

    /// Sends a packet to its unacknowledged destinations and schedules its resend
    async fn transmit(&mut self, r: PacketRef, now: Instant, is_resend: bool) -> anyhow::Result<()> {
        let cluster_size = self.directory.cluster_size();
        let Some(packet) = self.outgoing.packet_mut(r) else {
            bail!("orphaned packet {}", r);
        };

        let destinations = packet.remaining.iter()
            .filter_map(|m| self.directory.lookup(m))
            .collect::<Vec<_>>();
        if destinations.is_empty() {
            // all destinations departed, the resend check retires the packet
            self.resend_queue.add(r, packet, now);
            return Ok(());
        }

        let route = choose_route(
            &destinations,
            cluster_size,
            self.config.multicast_addr,
            self.config.multicast_threshold,
            &mut self.multicast_bypass,
            is_resend,
        );
        let is_multicast = route.is_multicast();
        let encoded = PacketCodec::encode(&Packet::Message(packet.packet.clone()));

        packet.sent_count += 1;
        packet.sent_time = Some(now);
        if packet.deferrable && !packet.multipoint {
            if let Some(peer) = destinations.first() {
                peer.flow().transition(&mut packet.delivery_state, DeliveryState::Outstanding);
            }
        }
        self.resend_queue.add(r, packet, now);

        for peer in &destinations {
            peer.record_outgoing(now);
            if is_resend {
                peer.stats().packets_resent.fetch_add(1, Ordering::Relaxed);
            }
            else {
                peer.stats().packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            self.outbound(peer).on_sent(r);
        }

        if is_resend {
            self.stats.packets_resent.inc();
        }
        else {
            self.stats.packets_sent.inc();
        }
        if is_multicast {
            self.stats.packets_multicast.inc();
        }
        self.packets_since_tuning += 1;

        let addresses = route.addresses();
        if addresses.is_empty() {
            return Ok(());
        }
        trace!("{} packet {} to {:?}", if is_resend { "resending" } else { "sending" }, r, addresses);

        let bundle = PacketBundle::new(addresses, encoded);
        if is_resend {
            self.speaker.send_now(bundle).await;
        }
        else {
            self.speaker.add(bundle).await;
        }
        Ok(())
    }

    /// Releases a packet, and its message once all packets are released
    fn retire_packet(&mut self, r: PacketRef) -> anyhow::Result<()> {
        let Some(message) = self.outgoing.get_mut(r.message_id) else {
            bail!("orphaned packet {}: message is not in the outgoing window", r);
        };
        let Some(packet) = message.retire_packet(r.part_index) else {
            return Ok(());
        };
        let is_done = message.is_done();

        self.resend_queue.on_retired(r, &packet);
        self.inbox.in_flight.fetch_sub(1, Ordering::AcqRel);
        trace!("retired packet {}", r);

        if is_done {
            self.outgoing.remove(r.message_id);
        }
        Ok(())
    }

    async fn send_ack(&mut self, ack: PendingAck, markers: AckMarkers) {
        let Some(peer) = self.live_peer(ack.to) else {
            trace!("dropping ack for departed peer {}", ack.to);
            return;
        };

        let packet = AckPacket {
            from_id: self.self_id,
            to_id: ack.to,
            is_request: ack.is_request,
            entries: ack.entries.iter()
                .map(|r| TrintPacketRef { message_trint: to_trint(r.message_id), part_index: r.part_index })
                .collect(),
            newest_from: markers.newest_from,
            contiguous_from: markers.contiguous_from,
            newest_to: self.peers.get(&ack.to).and_then(|p| p.newest_to),
            preferred_ack_size: self.preferred_ack_size,
        };
        trace!("sending {:?} with {} entries to {}", packet.packet_type(), packet.entries.len(), ack.to);

        if packet.is_request {
            self.stats.nacks_sent.inc();
        }
        else {
            self.stats.acks_sent.inc();
        }

        let encoded = PacketCodec::encode(&Packet::Ack(packet));
        self.speaker.add(PacketBundle::new(vec![peer.send_address()], encoded)).await;
    }

    /// Packets that were deferred for a departed peer go to the ready queue, which drops the
    ///  peer from their destinations
    fn handle_departures(&mut self) {
        for member in self.inbox.departures.drain() {
            let Some(outbound) = self.peers.remove(&member) else {
                continue;
            };
            let deferred = outbound.peer.flow().take_all_deferred();
            debug!("peer {} departed, {} deferred packets", member, deferred.len());
            self.ready_queue.extend(deferred);
        }
    }
}

/// Splits a payload into packet-sized parts. The first part has room for the directed
///  packet's larger header.
fn split_payload(payload: &Bytes, first_capacity: usize, sequel_capacity: usize) -> Vec<Bytes> {
    let first_len = payload.len().min(first_capacity);
    let mut result = vec![payload.slice(..first_len)];

    let mut offset = first_len;
    while offset < payload.len() {
        let end = (offset + sequel_capacity).min(payload.len());
        result.push(payload.slice(offset..end));
        offset = end;
    }
    result
}
