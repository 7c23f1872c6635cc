use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use crate::member::MemberId;
use crate::packet::PacketRef;
use crate::peer_state::DeliveryState;
use super::Publisher;

/// progress towards the give-up deadline at which a silent peer's heuristic death is stamped
const HEURISTIC_DEATH_PERCENT: u32 = 50;
/// progress towards the give-up deadline from which a silent peer is reported as slow
const SLOW_PEER_PERCENT: u32 = 75;

impl Publisher {
    /// Processes the resend queue's head if it is due. Returns `true` if there was something
    ///  to do.
    ///
    /// This is also where packets are retired: a packet that all destinations acknowledged
    ///  stays in the resend queue until its resend time comes up, so the queue never refers to
    ///  a packet that is gone.
    pub(super) async fn resend_next(&mut self, now: Instant) -> anyhow::Result<bool> {
        let Some(r) = self.resend_queue.peek(&mut self.outgoing)? else {
            return Ok(false);
        };
        let Some(packet) = self.outgoing.packet_mut(r) else {
            return Ok(false);
        };
        let Some(scheduled) = packet.resend_scheduled else {
            return Ok(false);
        };
        if scheduled > now {
            return Ok(false);
        }
        self.resend_queue.pop();

        let flow_peer = packet.single_destination()
            .filter(|_| packet.deferrable)
            .and_then(|m| self.directory.lookup(m));

        self.resend_packet(r, scheduled, now).await?;

        // a timed out or abandoned packet frees a slot for packets deferred behind it
        if let Some(peer) = flow_peer {
            self.drain_deferred(&peer);
        }
        Ok(true)
    }

    async fn resend_packet(&mut self, r: PacketRef, scheduled: Instant, now: Instant) -> anyhow::Result<()> {
        let Some(packet) = self.outgoing.packet_mut(r) else {
            return Ok(());
        };

        let departed = packet.remaining.iter()
            .filter(|m| !self.directory.lookup(*m).map_or(false, |p| p.is_alive()))
            .collect::<Vec<_>>();
        for member in departed {
            trace!("dropping departed member {} from destinations of packet {}", member, r);
            packet.remaining.remove(member);
            if packet.deferrable {
                if let Some(peer) = self.directory.lookup(member) {
                    peer.flow().transition(&mut packet.delivery_state, DeliveryState::Confirmed);
                }
            }
        }

        if !packet.is_resend_necessary() {
            return self.retire_packet(r);
        }

        let resend_timeout = self.resend_queue.resend_timeout();
        let timeout = packet.resend_timeout.unwrap_or(now);
        let remaining = packet.remaining.iter().collect::<Vec<_>>();

        if now >= timeout {
            warn!("packet {} timed out, giving up on {:?}", r, packet.remaining);
            if packet.deferrable {
                if let Some(peer) = remaining.first().and_then(|m| self.directory.lookup(*m)) {
                    peer.flow().transition(&mut packet.delivery_state, DeliveryState::Confirmed);
                }
            }
            for &member in &remaining {
                self.health.on_peer_undeliverable(member);
            }
            self.stats.dropped.inc();
            return self.retire_packet(r);
        }

        let progress = timeout_progress(timeout.duration_since(now), resend_timeout, self.config.resend_delay);
        self.check_peer_health(&remaining, progress, timeout.duration_since(now), now).await;

        let Some(packet) = self.outgoing.packet_mut(r) else {
            return Ok(());
        };
        let timed_out = packet.sent_time
            .map_or(true, |sent| scheduled >= sent + self.config.resend_delay);
        if !timed_out {
            self.stats.packets_resent_early.inc();
        }

        if packet.deferrable {
            if let Some(peer) = remaining.first().and_then(|m| self.directory.lookup(*m)) {
                let on_schedule = now.duration_since(scheduled) < self.config.resend_delay;
                let mut flow = peer.flow();
                flow.transition(&mut packet.delivery_state, DeliveryState::Lost);
                if flow.on_lost(timed_out, on_schedule) {
                    debug!("pausing traffic to {} after repeated losses", peer.id());
                }
            }
        }

        self.transmit(r, now, true).await
    }

    /// Escalates for destinations that stay silent as a packet approaches its timeout:
    ///  * from [HEURISTIC_DEATH_PERCENT] of the way to the give-up deadline, each resend stamps
    ///    the peer's heuristic death for the membership layer
    ///  * from [SLOW_PEER_PERCENT], each resend reports the peer as slow
    ///  * within the diagnostic window before the deadline, the peer is probed once per window
    async fn check_peer_health(&mut self, remaining: &[MemberId], progress: u32, time_left: Duration, now: Instant) {
        let peers = remaining.iter()
            .filter_map(|m| self.directory.lookup(*m))
            .collect::<Vec<_>>();

        if progress >= HEURISTIC_DEATH_PERCENT {
            for peer in &peers {
                peer.record_heuristic_death(now);
            }
        }
        if progress >= SLOW_PEER_PERCENT {
            for peer in &peers {
                self.health.on_peer_slow(peer.id());
            }
        }
        if time_left < self.config.diagnostic_window {
            for peer in &peers {
                if self.resend_queue.claim_diagnostic(peer.id(), now) {
                    let num_sent = self.diagnostics.probe(peer, self.config.diagnostic_ttl).await;
                    self.stats.diagnostics_sent.add(num_sent as u64);
                }
            }
        }
    }
}

/// How far a packet got from its first resend deadline towards its give-up deadline, in percent
fn timeout_progress(time_left: Duration, resend_timeout: Duration, resend_delay: Duration) -> u32 {
    let span = resend_timeout.saturating_sub(resend_delay);
    if span.is_zero() {
        return 100;
    }
    let elapsed = resend_timeout
        .saturating_sub(time_left)
        .saturating_sub(resend_delay);
    (elapsed.as_micros() * 100 / span.as_micros()).min(100) as u32
}
