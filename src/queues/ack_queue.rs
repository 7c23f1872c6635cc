use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use rustc_hash::FxHashMap;
use tokio::time::{Duration, Instant};
use tracing::trace;
use crate::member::MemberId;
use crate::packet::PacketRef;
use crate::queues::wakeup::Wakeup;

/// Per-peer markers that go into every ack to that peer
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AckMarkers {
    /// the newest packet from the peer that we know of, received or not
    pub newest_from: Option<PacketRef>,
    /// all packets from the peer up to and including this one were received
    pub contiguous_from: Option<PacketRef>,
}

/// Packets received from a peer and not acknowledged yet
#[derive(Debug)]
pub struct PendingAck {
    pub to: MemberId,
    pub entries: Vec<PacketRef>,
    pub scheduled: Instant,
    /// sent early to request resends
    pub is_request: bool,
}

#[derive(Default)]
struct AckQueueInner {
    /// per peer, the pending ack that new confirmations are added to
    open: FxHashMap<MemberId, u64>,
    pending: FxHashMap<u64, PendingAck>,
    schedule: BTreeSet<(Instant, u64)>,
    markers: FxHashMap<MemberId, AckMarkers>,
    next_id: u64,
}

impl AckQueueInner {
    fn open_ack(&mut self, to: MemberId, scheduled: Instant, is_request: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, PendingAck {
            to,
            entries: Vec::new(),
            scheduled,
            is_request,
        });
        self.schedule.insert((scheduled, id));
        self.open.insert(to, id);
        id
    }

    fn reschedule(&mut self, id: u64, scheduled: Instant) {
        if let Some(ack) = self.pending.get_mut(&id) {
            self.schedule.remove(&(ack.scheduled, id));
            ack.scheduled = scheduled;
            self.schedule.insert((scheduled, id));
        }
    }
}

/// Acks waiting to be sent, filled by the receiver and drained by the publisher.
///
/// Received packets are collected per peer for a short delay so that several packets share
///  a single ack. An ack is sent early when it is full, or when the receiver detects a gap and
///  requests a resend.
pub struct AckQueue {
    ack_delay: Duration,
    nack_delay: Duration,
    inner: Mutex<AckQueueInner>,
    publisher_wakeup: Arc<Wakeup>,
}

impl AckQueue {
    pub fn new(ack_delay: Duration, nack_delay: Duration, publisher_wakeup: Arc<Wakeup>) -> AckQueue {
        AckQueue {
            ack_delay,
            nack_delay,
            inner: Mutex::new(AckQueueInner::default()),
            publisher_wakeup,
        }
    }

    /// Adds a received packet to the pending ack for its sender. Returns `true` if this filled
    ///  the ack, scheduling it for immediate sending.
    pub fn confirm(&self, from: MemberId, packet: PacketRef, max_entries: usize, now: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let id = match inner.open.get(&from).copied() {
            Some(id) => id,
            None => inner.open_ack(from, now + self.ack_delay, false),
        };

        let num_entries = match inner.pending.get_mut(&id) {
            Some(ack) => {
                ack.entries.push(packet);
                ack.entries.len()
            }
            None => return false,
        };

        let is_full = num_entries >= max_entries.max(1);
        if is_full {
            trace!("ack for {} is full with {} entries", from, num_entries);
            inner.open.remove(&from);
            inner.reschedule(id, now);
        }
        drop(inner);

        self.publisher_wakeup.signal();
        is_full
    }

    /// Schedules an ack to be sent soon to request resends from a peer. Returns `false` if an
    ///  ack for the peer is already due at least as soon.
    pub fn schedule_nack(&self, to: MemberId, now: Instant) -> bool {
        let send_at = now + self.nack_delay;

        let mut inner = self.inner.lock().unwrap();
        match inner.open.get(&to).copied() {
            Some(id) => {
                let Some(ack) = inner.pending.get_mut(&id) else {
                    return false;
                };
                if ack.scheduled <= send_at {
                    return false;
                }
                ack.is_request = true;
                inner.reschedule(id, send_at);
            }
            None => {
                inner.open_ack(to, send_at, true);
            }
        }
        drop(inner);

        trace!("scheduled nack for {}", to);
        self.publisher_wakeup.signal();
        true
    }

    pub fn update_markers(&self, peer: MemberId, markers: AckMarkers) {
        self.inner.lock().unwrap()
            .markers
            .insert(peer, markers);
    }

    pub fn markers(&self, peer: MemberId) -> AckMarkers {
        self.inner.lock().unwrap()
            .markers
            .get(&peer)
            .copied()
            .unwrap_or_default()
    }

    /// Removes the next ack that is due, together with the current markers for its peer
    pub fn remove_ripe(&self, now: Instant) -> Option<(PendingAck, AckMarkers)> {
        let mut inner = self.inner.lock().unwrap();
        let &(scheduled, id) = inner.schedule.first()?;
        if scheduled > now {
            return None;
        }
        inner.schedule.remove(&(scheduled, id));

        let ack = inner.pending.remove(&id)?;
        if inner.open.get(&ack.to) == Some(&id) {
            inner.open.remove(&ack.to);
        }
        let markers = inner.markers.get(&ack.to).copied().unwrap_or_default();
        Some((ack, markers))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.lock().unwrap()
            .schedule
            .first()
            .map(|(scheduled, _)| *scheduled)
    }

    /// Drops all state for a peer that left the cluster
    pub fn forget(&self, peer: MemberId) {
        let mut inner = self.inner.lock().unwrap();
        let ids = inner.pending.iter()
            .filter(|(_, ack)| ack.to == peer)
            .map(|(&id, ack)| (ack.scheduled, id))
            .collect::<Vec<_>>();
        for key in ids {
            inner.schedule.remove(&key);
            inner.pending.remove(&key.1);
        }
        inner.open.remove(&peer);
        inner.markers.remove(&peer);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACK_DELAY: Duration = Duration::from_millis(10);
    const NACK_DELAY: Duration = Duration::from_millis(1);

    fn queue() -> AckQueue {
        AckQueue::new(ACK_DELAY, NACK_DELAY, Arc::new(Wakeup::new()))
    }

    fn m(id: u16) -> MemberId {
        MemberId::from_raw(id)
    }

    fn r(id: u64) -> PacketRef {
        PacketRef::new(id, 0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_batches_per_peer() {
        let queue = queue();
        let now = Instant::now();

        assert!(!queue.confirm(m(2), r(1), 10, now));
        assert!(!queue.confirm(m(2), r(2), 10, now));
        assert!(!queue.confirm(m(3), r(7), 10, now));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next_deadline(), Some(now + ACK_DELAY));

        assert!(queue.remove_ripe(now).is_none());

        let (ack, _) = queue.remove_ripe(now + ACK_DELAY).unwrap();
        assert_eq!(ack.to, m(2));
        assert_eq!(ack.entries, vec![r(1), r(2)]);
        assert!(!ack.is_request);

        let (ack, _) = queue.remove_ripe(now + ACK_DELAY).unwrap();
        assert_eq!(ack.to, m(3));
        assert!(queue.remove_ripe(now + ACK_DELAY).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_ack_is_flushed() {
        let queue = queue();
        let now = Instant::now();

        assert!(!queue.confirm(m(2), r(1), 2, now));
        assert!(queue.confirm(m(2), r(2), 2, now));
        assert!(!queue.confirm(m(2), r(3), 2, now));

        let (ack, _) = queue.remove_ripe(now).unwrap();
        assert_eq!(ack.entries, vec![r(1), r(2)]);
        assert!(queue.remove_ripe(now).is_none());

        let (ack, _) = queue.remove_ripe(now + ACK_DELAY).unwrap();
        assert_eq!(ack.entries, vec![r(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_reschedules_open_ack() {
        let queue = queue();
        let now = Instant::now();

        queue.confirm(m(2), r(1), 10, now);
        assert!(queue.schedule_nack(m(2), now));
        assert!(!queue.schedule_nack(m(2), now));

        let (ack, _) = queue.remove_ripe(now + NACK_DELAY).unwrap();
        assert!(ack.is_request);
        assert_eq!(ack.entries, vec![r(1)]);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_without_pending_ack() {
        let queue = queue();
        let now = Instant::now();

        assert!(queue.schedule_nack(m(2), now));
        queue.confirm(m(2), r(5), 10, now);

        let (ack, _) = queue.remove_ripe(now + NACK_DELAY).unwrap();
        assert!(ack.is_request);
        assert_eq!(ack.entries, vec![r(5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_markers_are_taken_at_removal() {
        let queue = queue();
        let now = Instant::now();

        queue.confirm(m(2), r(1), 10, now);
        queue.update_markers(m(2), AckMarkers { newest_from: Some(r(3)), contiguous_from: Some(r(1)) });

        let (_, markers) = queue.remove_ripe(now + ACK_DELAY).unwrap();
        assert_eq!(markers.newest_from, Some(r(3)));
        assert_eq!(markers.contiguous_from, Some(r(1)));
        assert_eq!(queue.markers(m(3)), AckMarkers::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget() {
        let queue = queue();
        let now = Instant::now();

        queue.confirm(m(2), r(1), 1, now);
        queue.confirm(m(2), r(2), 10, now);
        queue.confirm(m(3), r(2), 10, now);
        queue.forget(m(2));

        assert_eq!(queue.len(), 1);
        let (ack, _) = queue.remove_ripe(now + ACK_DELAY).unwrap();
        assert_eq!(ack.to, m(3));
    }
}
