use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info};
use crate::config::FlowControlConfig;
use crate::member::MemberId;
use crate::packet::PacketRef;

/// Where a packet stands with regard to a single destination's flow control
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeliveryState {
    Unsent,
    /// sent, waiting for an ack
    Outstanding,
    /// held back because the destination has too many outstanding packets
    Deferred,
    /// the resend delay passed without an ack
    Lost,
    Confirmed,
}

#[derive(Debug, Eq, PartialEq)]
pub enum Deferral {
    SendNow,
    /// parked in the peer's deferred set until outstanding packets are acknowledged
    Deferred,
    /// The packet may be sent, but only after previously deferred packets. The caller puts it
    ///  at the end of its ready queue.
    ReadyQueue,
}

/// Adaptive limit for the number of unacknowledged packets in flight to a single peer.
///
/// The limit grows while the peer acknowledges reliably and the limit is actually used, and
///  shrinks when packets get lost. A peer that loses many packets in sequence is paused, i.e.
///  gets one packet at a time until it acknowledges again.
pub struct FlowControl {
    enabled: bool,
    min_outstanding: u32,
    max_outstanding: u32,
    aggression: u32,
    success_goal: u32,
    lost_packet_threshold: u32,

    threshold: u32,
    outstanding: u32,
    high_mark: u32,
    deferred_count: u32,
    seq_acks: u32,
    seq_lost: u32,
    paused: bool,
    pause_count: u64,
    deferred: BTreeSet<PacketRef>,
}

impl FlowControl {
    pub fn new(config: &FlowControlConfig) -> FlowControl {
        FlowControl {
            enabled: config.enabled,
            min_outstanding: config.min_outstanding,
            max_outstanding: config.max_outstanding,
            aggression: config.aggression.max(1),
            success_goal: config.success_goal,
            lost_packet_threshold: config.lost_packet_threshold,
            threshold: config.min_outstanding,
            outstanding: 0,
            high_mark: 0,
            deferred_count: 0,
            seq_acks: 0,
            seq_lost: 0,
            paused: false,
            pause_count: 0,
            deferred: BTreeSet::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// the current limit for outstanding packets, taking pausing into account
    pub fn effective_threshold(&self) -> u32 {
        if self.paused { 1 } else { self.threshold }
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub fn deferred_count(&self) -> u32 {
        self.deferred_count
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause_count(&self) -> u64 {
        self.pause_count
    }

    fn is_adjustable(&self) -> bool {
        self.enabled && self.min_outstanding < self.max_outstanding
    }

    /// Changes a packet's delivery state, keeping the counters in sync
    pub fn transition(&mut self, state: &mut DeliveryState, new_state: DeliveryState) {
        if *state == new_state {
            return;
        }
        match *state {
            DeliveryState::Outstanding => self.outstanding = self.outstanding.saturating_sub(1),
            DeliveryState::Deferred => self.deferred_count = self.deferred_count.saturating_sub(1),
            _ => {}
        }
        match new_state {
            DeliveryState::Outstanding => {
                self.outstanding += 1;
                self.high_mark = self.high_mark.max(self.outstanding);
            }
            DeliveryState::Deferred => self.deferred_count += 1,
            _ => {}
        }
        *state = new_state;
    }

    /// Decides whether a packet for this peer can be sent right away
    pub fn defer(&mut self, packet: PacketRef, state: &mut DeliveryState) -> Deferral {
        if !self.enabled || *state == DeliveryState::Confirmed {
            return Deferral::SendNow;
        }

        let is_full = self.outstanding >= self.effective_threshold();
        if *state == DeliveryState::Deferred {
            // coming from the ready queue
            if is_full {
                self.deferred.insert(packet);
                return Deferral::Deferred;
            }
            return Deferral::SendNow;
        }

        if is_full {
            self.transition(state, DeliveryState::Deferred);
            self.deferred.insert(packet);
            return Deferral::Deferred;
        }
        if self.deferred_count > 0 {
            self.transition(state, DeliveryState::Deferred);
            if self.deferred.is_empty() {
                return Deferral::ReadyQueue;
            }
            self.deferred.insert(packet);
            return Deferral::Deferred;
        }
        Deferral::SendNow
    }

    /// Removes deferred packets from the deferred set, as many as there is room for below the
    ///  threshold. Packets that are no longer unacknowledged don't take up room.
    pub fn take_drainable(&mut self, is_unacked: impl Fn(PacketRef) -> bool) -> Vec<PacketRef> {
        let mut spots = self.effective_threshold().saturating_sub(self.outstanding);
        let mut result = Vec::new();
        while spots > 0 {
            let Some(packet) = self.deferred.pop_first() else {
                break;
            };
            if is_unacked(packet) {
                spots -= 1;
            }
            result.push(packet);
        }
        result
    }

    /// all deferred packets, e.g. when the peer left the cluster
    pub fn take_all_deferred(&mut self) -> Vec<PacketRef> {
        std::mem::take(&mut self.deferred).into_iter().collect()
    }

    /// Registers a lost packet, returning `true` if this caused the peer to be paused.
    ///
    /// `timed_out` is false for packets that were resent early because of a negative ack, and
    ///  `on_schedule` is false if the publisher is running behind its resend schedule (which
    ///  makes losses its own fault rather than the peer's).
    pub fn on_lost(&mut self, timed_out: bool, on_schedule: bool) -> bool {
        self.seq_lost += 1;
        if timed_out
            && self.lost_packet_threshold > 0
            && self.seq_lost > self.lost_packet_threshold
            && !self.paused
            && on_schedule
        {
            self.paused = true;
            self.pause_count += 1;
            return true;
        }
        false
    }

    /// Registers newly acknowledged packets, adapting the threshold
    pub fn on_confirmed(&mut self, new_acks: u32) {
        let old_acks = self.seq_acks;
        let old_lost = self.seq_lost;

        if old_lost > 0 {
            self.paused = false;
            self.seq_lost = 0;
            self.seq_acks = new_acks;
        }
        else {
            self.seq_acks = self.seq_acks.saturating_add(new_acks);
        }

        if !self.is_adjustable() {
            return;
        }

        let effective = if old_lost == 0 { old_acks } else { old_acks / old_lost };
        let near_cap = self.high_mark > self.threshold - self.threshold / 4;
        let step = (self.threshold / self.aggression).max(1);

        if effective < self.success_goal && old_lost > 0 {
            self.threshold = self.threshold.saturating_sub(step).max(self.min_outstanding);
        }
        else if effective > self.success_goal && near_cap {
            self.high_mark = self.outstanding;
            self.threshold = (self.threshold + step).min(self.max_outstanding);
        }
    }
}

impl Debug for FlowControl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FlowControl{{threshold={}, outstanding={}, deferred={}, paused={}}}",
               self.threshold, self.outstanding, self.deferred_count, self.paused)
    }
}


#[derive(Default)]
pub struct PeerActivity {
    pub last_incoming: Option<Instant>,
    pub last_outgoing: Option<Instant>,
    pub last_heuristic_death: Option<Instant>,
}

#[derive(Default)]
pub struct PeerStats {
    pub packets_sent: AtomicU64,
    pub packets_resent: AtomicU64,
    pub packets_received: AtomicU64,
    pub packets_repeated: AtomicU64,
}

impl PeerStats {
    pub fn sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }
    pub fn resent(&self) -> u64 {
        self.packets_resent.load(Ordering::Relaxed)
    }
    pub fn received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }
    pub fn repeated(&self) -> u64 {
        self.packets_repeated.load(Ordering::Relaxed)
    }
}

/// Everything the transport knows about another cluster member, shared between the engines
pub struct PeerState {
    id: MemberId,
    address: SocketAddr,
    preferred_address: Option<SocketAddr>,
    preferred_packet_length: Option<usize>,
    alive: AtomicBool,
    flow: Mutex<FlowControl>,
    preferred_ack_size: AtomicUsize,
    activity: Mutex<PeerActivity>,
    stats: PeerStats,
}

impl Debug for PeerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer{{{}@{}}}", self.id, self.address)
    }
}

impl PeerState {
    pub fn new(id: MemberId, address: SocketAddr, flow_control: &FlowControlConfig) -> PeerState {
        PeerState {
            id,
            address,
            preferred_address: None,
            preferred_packet_length: None,
            alive: AtomicBool::new(true),
            flow: Mutex::new(FlowControl::new(flow_control)),
            preferred_ack_size: AtomicUsize::new(0),
            activity: Mutex::new(PeerActivity::default()),
            stats: PeerStats::default(),
        }
    }

    /// A separate address that the peer prefers for incoming packets, e.g. a dedicated port.
    ///  Regular traffic goes there, while the advertised address remains a fallback for
    ///  diagnostics.
    pub fn with_preferred_address(mut self, preferred_address: SocketAddr) -> PeerState {
        self.preferred_address = Some(preferred_address);
        self
    }

    pub fn with_preferred_packet_length(mut self, preferred_packet_length: usize) -> PeerState {
        self.preferred_packet_length = Some(preferred_packet_length);
        self
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn preferred_address(&self) -> Option<SocketAddr> {
        self.preferred_address
    }

    /// the address that regular packets are sent to
    pub fn send_address(&self) -> SocketAddr {
        self.preferred_address.unwrap_or(self.address)
    }

    pub fn preferred_packet_length(&self) -> Option<usize> {
        self.preferred_packet_length
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn mark_departed(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            info!("peer {:?} departed", self);
        }
    }

    pub fn flow(&self) -> MutexGuard<'_, FlowControl> {
        self.flow.lock().unwrap()
    }

    /// The number of entries the peer would like per ack, or 0 if it has no preference
    pub fn preferred_ack_size(&self) -> usize {
        self.preferred_ack_size.load(Ordering::Relaxed)
    }

    pub fn set_preferred_ack_size(&self, size: usize) {
        self.preferred_ack_size.store(size, Ordering::Relaxed);
    }

    pub fn activity(&self) -> MutexGuard<'_, PeerActivity> {
        self.activity.lock().unwrap()
    }

    pub fn record_incoming(&self, now: Instant) {
        self.activity().last_incoming = Some(now);
    }

    pub fn record_outgoing(&self, now: Instant) {
        self.activity().last_outgoing = Some(now);
    }

    pub fn record_heuristic_death(&self, now: Instant) {
        debug!("peer {:?} is not acknowledging packets", self);
        self.activity().last_heuristic_death = Some(now);
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }
}
