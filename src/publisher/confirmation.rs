use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::packet::{AckPacket, PacketRef};
use crate::peer_state::{DeliveryState, PeerState};
use crate::trint::{from_trint, Trint};
use super::Publisher;

impl Publisher {
    pub(super) fn handle_confirmations(&mut self, now: Instant) {
        for confirmation in self.inbox.confirmations.drain() {
            self.on_ack(confirmation.ack, now);
        }
    }

    fn on_ack(&mut self, ack: AckPacket, now: Instant) {
        let from = ack.from_id;
        let Some(outbound) = self.peers.get(&from) else {
            debug!("ack from {} which has no outbound state: ignoring", from);
            return;
        };
        let peer = outbound.peer.clone();

        let base = self.outgoing.first_index();
        let mut resolved: FxHashMap<Trint, Option<u64>> = FxHashMap::default();
        let mut num_new_acks = 0u32;

        for entry in &ack.entries {
            let message_id = *resolved.entry(entry.message_trint)
                .or_insert_with(|| from_trint(entry.message_trint, base));
            let Some(message_id) = message_id else {
                self.stats.packets_resent_excess.inc();
                continue;
            };
            let r = PacketRef::new(message_id, entry.part_index);

            let Some(packet) = self.outgoing.packet_mut(r) else {
                // acknowledged and retired before
                self.stats.packets_resent_excess.inc();
                continue;
            };
            if !packet.register_ack(from) {
                self.stats.packets_resent_excess.inc();
                continue;
            }
            trace!("packet {} acknowledged by {}", r, from);
            num_new_acks += 1;
            if packet.deferrable {
                peer.flow().transition(&mut packet.delivery_state, DeliveryState::Confirmed);
            }
        }

        if num_new_acks > 0 {
            peer.flow().on_confirmed(num_new_acks);
            self.drain_deferred(&peer);
        }

        self.detect_early_loss(&ack, now);
    }

    /// Moves as many of a peer's deferred packets to the ready queue as its flow control has
    ///  room for
    pub(super) fn drain_deferred(&mut self, peer: &PeerState) {
        let member = peer.id();
        let outgoing = &self.outgoing;
        let drainable = peer.flow()
            .take_drainable(|r| outgoing.packet(r).map_or(false, |p| p.is_addressed_to(member)));
        if !drainable.is_empty() {
            trace!("{} deferred packets to {} are ready", drainable.len(), member);
            self.ready_queue.extend(drainable);
        }
    }

    /// Everything the peer received up to the ack's contiguous marker is done with. Packets
    ///  that were sent to the peer before its newest received packet and are still
    ///  unacknowledged are lost, and are resent without waiting for the resend delay.
    fn detect_early_loss(&mut self, ack: &AckPacket, now: Instant) {
        let from = ack.from_id;
        let base = self.outgoing.first_index();
        let Some(outbound) = self.peers.get_mut(&from) else {
            return;
        };

        if let Some(contiguous) = ack.contiguous_from {
            while outbound.recent.front().map_or(false, |r| *r <= contiguous) {
                outbound.recent.pop_front();
            }
        }

        if !self.config.nack_enabled {
            return;
        }

        let marker = ack.newest_from
            .or_else(|| ack.entries.last()
                .and_then(|e| e.resolve(base)));
        let Some(marker) = marker else {
            return;
        };
        let Some(marker_pos) = outbound.recent.iter().rposition(|r| *r == marker) else {
            return;
        };

        let outgoing = &self.outgoing;
        let lost = outbound.recent.drain(..=marker_pos)
            .filter(|r| *r != marker)
            .filter(|r| outgoing.packet(*r).map_or(false, |p| p.sent_count > 0 && p.is_addressed_to(from)))
            .collect::<Vec<_>>();

        if !lost.is_empty() {
            debug!("{} packets to {} were overtaken by later packets: resending them early", lost.len(), from);
            self.resend_queue.add_all_head(&lost, &mut self.outgoing, now);
        }
    }
}
