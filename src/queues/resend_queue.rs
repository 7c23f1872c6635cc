use std::collections::VecDeque;
use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::time::{Duration, Instant};
use tracing::trace;
use crate::member::{MemberId, MemberSet};
use crate::message::{OutgoingMessages, OutgoingPacket};
use crate::packet::PacketRef;

/// Sent packets waiting for their resend time, owned by the publisher.
///
/// Packets are resent in the order they were scheduled. Packets that are known to be lost
///  (through early loss detection) are pulled forward into a separate urgent queue instead of
///  being moved: their regular entry stays where it is and is skipped when it comes up, which
///  is tracked by the packet's `pending_resend_skips` counter.
pub struct ResendQueue {
    resend_delay: Duration,
    resend_timeout: Duration,
    urgent: VecDeque<PacketRef>,
    scheduled: VecDeque<PacketRef>,
    /// skip counters of packets that were retired while they still had stale entries
    stale: FxHashMap<PacketRef, u32>,
    diagnostic_members: MemberSet,
    diagnostic_round_start: Option<Instant>,
}

impl ResendQueue {
    pub fn new(resend_delay: Duration, resend_timeout: Duration) -> ResendQueue {
        ResendQueue {
            resend_delay,
            resend_timeout,
            urgent: VecDeque::new(),
            scheduled: VecDeque::new(),
            stale: FxHashMap::default(),
            diagnostic_members: MemberSet::new(),
            diagnostic_round_start: None,
        }
    }

    pub fn resend_timeout(&self) -> Duration {
        self.resend_timeout
    }

    pub fn len(&self) -> usize {
        self.urgent.len() + self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urgent.is_empty() && self.scheduled.is_empty()
    }

    fn start_timeout(&self, packet: &mut OutgoingPacket, now: Instant) {
        if packet.resend_timeout.is_none() {
            packet.resend_timeout = Some(now + self.resend_timeout);
        }
    }

    /// Schedules a packet that was just sent for resending after the resend delay
    pub fn add(&mut self, r: PacketRef, packet: &mut OutgoingPacket, now: Instant) {
        if packet.nack_in_progress {
            self.add_head(r, packet, now);
            return;
        }
        self.start_timeout(packet, now);
        packet.resend_scheduled = Some(now + self.resend_delay);
        self.scheduled.push_back(r);
    }

    /// Schedules a packet for immediate processing, after other immediate packets
    pub fn add_head(&mut self, r: PacketRef, packet: &mut OutgoingPacket, now: Instant) {
        self.start_timeout(packet, now);
        packet.resend_scheduled = Some(now);
        self.urgent.push_back(r);
    }

    /// Pulls packets forward for an early resend. Packets that are already waiting for an
    ///  early resend are left alone.
    pub fn add_all_head(&mut self, lost: &[PacketRef], messages: &mut OutgoingMessages, now: Instant) {
        for &r in lost {
            let Some(packet) = messages.packet_mut(r) else {
                continue;
            };
            if packet.nack_in_progress {
                continue;
            }
            trace!("packet {} is lost: resending early", r);
            packet.nack_in_progress = true;
            packet.resend_scheduled = Some(now);
            self.urgent.push_back(r);
        }
    }

    fn front(&self) -> Option<PacketRef> {
        self.urgent.front()
            .or_else(|| self.scheduled.front())
            .copied()
    }

    /// Removes the entry returned by the last call to `peek()`
    pub fn pop(&mut self) -> Option<PacketRef> {
        if self.urgent.is_empty() {
            self.scheduled.pop_front()
        }
        else {
            self.urgent.pop_front()
        }
    }

    /// The packet at the head of the queue, discarding stale entries. A queue entry for a
    ///  packet that the publisher does not hold is a bug and fails.
    pub fn peek(&mut self, messages: &mut OutgoingMessages) -> anyhow::Result<Option<PacketRef>> {
        loop {
            let Some(r) = self.front() else {
                return Ok(None);
            };

            if let Some(skips) = self.stale.get_mut(&r) {
                *skips -= 1;
                if *skips == 0 {
                    self.stale.remove(&r);
                }
                self.pop();
                continue;
            }

            let Some(packet) = messages.packet_mut(r) else {
                bail!("orphaned packet {} in resend queue", r);
            };

            if packet.nack_in_progress {
                // this entry is used for the early resend, the other one becomes stale
                packet.nack_in_progress = false;
                packet.pending_resend_skips += 1;
            }
            else if packet.pending_resend_skips > 0 {
                packet.pending_resend_skips -= 1;
                self.pop();
                continue;
            }
            return Ok(Some(r));
        }
    }

    /// Must be called when a packet is retired, to keep track of its remaining stale entries
    pub fn on_retired(&mut self, r: PacketRef, packet: &OutgoingPacket) {
        let num_stale = packet.pending_resend_skips + if packet.nack_in_progress { 1 } else { 0 };
        if num_stale > 0 {
            self.stale.insert(r, num_stale);
        }
    }

    /// Diagnostic probes go to each member at most once per resend interval. Returns `true`
    ///  if a probe to the member is due.
    pub fn claim_diagnostic(&mut self, member: MemberId, now: Instant) -> bool {
        let round_over = self.diagnostic_round_start
            .map_or(true, |start| now.duration_since(start) >= self.resend_delay);
        if round_over {
            self.diagnostic_members.clear();
            self.diagnostic_round_start = Some(now);
        }
        self.diagnostic_members.insert(member)
    }
}
