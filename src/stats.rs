use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Duration;

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.set(0);
    }
}

/// accumulated time spent working rather than waiting, in microseconds
#[derive(Default)]
pub struct BusyTime(AtomicU64);

impl BusyTime {
    pub fn add(&self, duration: Duration) {
        self.0.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn get(&self) -> Duration {
        Duration::from_micros(self.0.load(Ordering::Relaxed))
    }

    fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct PublisherStats {
    pub messages_sent: Counter,
    pub packets_sent: Counter,
    pub packets_resent: Counter,
    /// resends triggered by negative acks or early loss detection
    pub packets_resent_early: Counter,
    /// acks for packets that had been acknowledged before, i.e. resends that were not necessary
    pub packets_resent_excess: Counter,
    pub packets_multicast: Counter,
    pub nacks_sent: Counter,
    pub acks_sent: Counter,
    pub diagnostics_sent: Counter,
    /// messages or packets given up on because no destinations were left
    pub dropped: Counter,
    pub busy_time: BusyTime,
}

impl PublisherStats {
    pub fn reset(&self) {
        for counter in [
            &self.messages_sent, &self.packets_sent, &self.packets_resent, &self.packets_resent_early,
            &self.packets_resent_excess, &self.packets_multicast, &self.nacks_sent, &self.acks_sent,
            &self.diagnostics_sent, &self.dropped,
        ] {
            counter.reset();
        }
        self.busy_time.reset();
    }
}

impl Display for PublisherStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Publisher: messages={} sent={} resent={} (early={}, excess={}) multicast={} acks={} nacks={} diagnostics={} dropped={} busy={:?}",
               self.messages_sent.get(),
               self.packets_sent.get(),
               self.packets_resent.get(),
               self.packets_resent_early.get(),
               self.packets_resent_excess.get(),
               self.packets_multicast.get(),
               self.acks_sent.get(),
               self.nacks_sent.get(),
               self.diagnostics_sent.get(),
               self.dropped.get(),
               self.busy_time.get(),
        )
    }
}

#[derive(Default)]
pub struct ReceiverStats {
    pub datagrams_received: Counter,
    pub packets_received: Counter,
    pub packets_repeated: Counter,
    pub messages_received: Counter,
    pub acks_received: Counter,
    pub garbage_received: Counter,
    pub corrupt_received: Counter,
    pub busy_time: BusyTime,
}

impl ReceiverStats {
    pub fn reset(&self) {
        for counter in [
            &self.datagrams_received, &self.packets_received, &self.packets_repeated, &self.messages_received,
            &self.acks_received, &self.garbage_received, &self.corrupt_received,
        ] {
            counter.reset();
        }
        self.busy_time.reset();
    }
}

impl Display for ReceiverStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Receiver: datagrams={} packets={} repeated={} messages={} acks={} garbage={} corrupt={} busy={:?}",
               self.datagrams_received.get(),
               self.packets_received.get(),
               self.packets_repeated.get(),
               self.messages_received.get(),
               self.acks_received.get(),
               self.garbage_received.get(),
               self.corrupt_received.get(),
               self.busy_time.get(),
        )
    }
}

#[derive(Default)]
pub struct SpeakerStats {
    pub datagrams_sent: Counter,
    pub datagrams_sent_sync: Counter,
    pub packets_sent: Counter,
    pub clogged: Counter,
    pub volume_threshold: Counter,
    pub busy_time: BusyTime,
}

impl SpeakerStats {
    /// resets the counters, the volume threshold is a gauge and stays
    pub fn reset(&self) {
        for counter in [&self.datagrams_sent, &self.datagrams_sent_sync, &self.packets_sent, &self.clogged] {
            counter.reset();
        }
        self.busy_time.reset();
    }
}

impl Display for SpeakerStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Speaker: datagrams={} (sync={}) packets={} clogged={} volume-threshold={} busy={:?}",
               self.datagrams_sent.get(),
               self.datagrams_sent_sync.get(),
               self.packets_sent.get(),
               self.clogged.get(),
               self.volume_threshold.get(),
               self.busy_time.get(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset() {
        let stats = PublisherStats::default();
        stats.packets_sent.add(3);
        stats.packets_resent.inc();
        stats.busy_time.add(Duration::from_millis(2));
        assert!(stats.to_string().contains("sent=3 resent=1"));

        stats.reset();
        assert_eq!(stats.packets_sent.get(), 0);
        assert_eq!(stats.packets_resent.get(), 0);
        assert_eq!(stats.busy_time.get(), Duration::ZERO);
    }

    #[test]
    fn test_speaker_reset_keeps_gauge() {
        let stats = SpeakerStats::default();
        stats.volume_threshold.set(17);
        stats.datagrams_sent.inc();
        stats.reset();

        assert_eq!(stats.datagrams_sent.get(), 0);
        assert_eq!(stats.volume_threshold.get(), 17);
    }
}
