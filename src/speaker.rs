use std::sync::Arc;
use bytes::BufMut;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, trace, warn};
use crate::buffer_pool::BufferPool;
use crate::config::TransportConfig;
use crate::packet_codec::PacketCodec;
use crate::queues::bundling_queue::{BundlingQueue, PacketBundle};
use crate::send_socket::SendSocket;
use crate::stats::SpeakerStats;

const CLOGGED_WARNING_INTERVAL: Duration = Duration::from_secs(10);
const MAX_PENDING_FLUSH_COUNT: usize = 1024;

/// The last stage of sending, used by the publisher. Each bundle of packets is either sent right
///  away on the publisher's task, or handed over to the speaker task through a bundling queue.
///
/// Sending inline is cheap as long as there is little traffic. The publisher sends up to
///  `volume_threshold` addresses inline between two flushes, and everything beyond that goes to
///  the speaker task so that one slow socket write does not hold up the publisher. Once the
///  limit was hit, a few of the following intervals go through the speaker as well.
pub struct Speaker {
    queue: Arc<BundlingQueue>,
    socket: Arc<dyn SendSocket>,
    pool: Arc<BufferPool>,
    stats: Arc<SpeakerStats>,

    enabled: bool,
    tunable: bool,
    batch_size: usize,
    clogged_count: usize,
    clogged_delay: Duration,

    volume_threshold: usize,
    sync_send_count: usize,
    pending_flush_count: usize,
    last_clogged_warning: Option<Instant>,
}

impl Speaker {
    pub fn new(
        config: &TransportConfig,
        queue: Arc<BundlingQueue>,
        socket: Arc<dyn SendSocket>,
        pool: Arc<BufferPool>,
        stats: Arc<SpeakerStats>,
    ) -> Speaker {
        let volume_threshold = config.volume_threshold.max(1);
        stats.volume_threshold.set(volume_threshold as u64);

        Speaker {
            queue,
            socket,
            pool,
            stats,
            enabled: config.speaker_enabled,
            tunable: config.volume_tunable,
            batch_size: config.speaker_batch_size.max(1),
            clogged_count: config.clogged_count,
            clogged_delay: config.clogged_delay,
            volume_threshold,
            sync_send_count: 0,
            pending_flush_count: 0,
            last_clogged_warning: None,
        }
    }

    pub fn volume_threshold(&self) -> usize {
        self.volume_threshold
    }

    fn is_sync_send(&self) -> bool {
        !self.enabled || (
            self.pending_flush_count == 0
                && self.sync_send_count <= self.volume_threshold
                && self.queue.is_empty()
        )
    }

    /// Sends a bundle, either right away or through the speaker task
    pub async fn add(&mut self, bundle: PacketBundle) {
        if self.is_sync_send() {
            self.send_now(bundle).await;
            return;
        }

        self.wait_while_clogged().await;

        let queue_len = self.queue.push(bundle);
        if queue_len >= self.batch_size {
            self.queue.wakeup().signal();
        }
    }

    /// Sends a bundle on the caller's task, bypassing the queue
    pub async fn send_now(&mut self, bundle: PacketBundle) {
        self.sync_send_count += bundle.addresses.len();
        self.stats.datagrams_sent_sync.add(bundle.addresses.len() as u64);
        send_bundle(self.socket.as_ref(), &self.pool, &self.stats, &bundle).await;
    }

    async fn wait_while_clogged(&mut self) {
        if self.clogged_count == 0 {
            return;
        }
        while self.queue.len() > self.clogged_count {
            self.stats.clogged.inc();
            let now = Instant::now();
            if self.last_clogged_warning.map_or(true, |t| now.duration_since(t) >= CLOGGED_WARNING_INTERVAL) {
                warn!("speaker is clogged with {} queued packets - pausing the publisher", self.queue.len());
                self.last_clogged_warning = Some(now);
            }
            self.queue.wakeup().signal();
            sleep(self.clogged_delay).await;
        }
    }

    /// Called by the publisher when it runs out of work: hands everything queued so far to the
    ///  speaker task and starts a new interval for counting inline sends.
    pub fn flush(&mut self) {
        if self.sync_send_count <= self.volume_threshold {
            self.pending_flush_count = self.pending_flush_count.saturating_sub(1);
        }
        else {
            self.pending_flush_count = (self.pending_flush_count + 1).min(MAX_PENDING_FLUSH_COUNT);
        }
        self.sync_send_count = 0;

        if !self.queue.is_empty() {
            self.queue.wakeup().signal();
        }
    }

    /// Adapts the volume threshold to the publisher's backlog: inline sending backs off while
    ///  work piles up, and grows again while it is used to capacity without a backlog.
    pub fn tune_volume_threshold(&mut self, backlog: usize) {
        if !self.tunable {
            return;
        }

        let old = self.volume_threshold;
        if backlog > 0 && self.volume_threshold > 1 {
            let decrement = (backlog << 4).min(self.volume_threshold >> 2).max(1);
            self.volume_threshold = self.volume_threshold.saturating_sub(decrement).max(1);
        }
        else if backlog == 0 && self.sync_send_count >= self.volume_threshold {
            self.volume_threshold = self.volume_threshold.saturating_add(self.volume_threshold.max(1));
        }

        if old != self.volume_threshold {
            debug!("speaker volume threshold changed from {} to {}", old, self.volume_threshold);
            self.stats.volume_threshold.set(self.volume_threshold as u64);
        }
    }
}

async fn send_bundle(socket: &dyn SendSocket, pool: &BufferPool, stats: &SpeakerStats, bundle: &PacketBundle) {
    let mut buf = pool.get_from_pool();
    PacketCodec::put_datagram_header(&mut buf);
    for packet in &bundle.packets {
        buf.put_slice(packet);
    }

    for &to in &bundle.addresses {
        trace!("sending datagram with {} packets to {:?}", bundle.num_packets(), to);
        socket.do_send_packet(to, &buf).await;
    }
    pool.return_to_pool(buf);

    stats.datagrams_sent.add(bundle.addresses.len() as u64);
    stats.packets_sent.add((bundle.num_packets() * bundle.addresses.len()) as u64);
}

/// The speaker task: sends whatever the publisher queued, bundling packets for the same
///  addresses into datagrams of up to `max_packet_length` bytes.
pub async fn run_speaker(
    queue: Arc<BundlingQueue>,
    socket: Arc<dyn SendSocket>,
    pool: Arc<BufferPool>,
    stats: Arc<SpeakerStats>,
    max_packet_length: usize,
) {
    info!("starting speaker loop");
    let max_bundle_len = max_packet_length.saturating_sub(PacketCodec::DATAGRAM_HEADER_LEN);

    loop {
        queue.wakeup().wait_until(None).await;

        let start = Instant::now();
        while let Some(bundle) = queue.pop_bundled(max_bundle_len) {
            send_bundle(socket.as_ref(), &pool, &stats, &bundle).await;
        }
        stats.busy_time.add(start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use bytes::Bytes;
    use mockall::predicate::eq;
    use super::*;
    use crate::queues::wakeup::Wakeup;
    use crate::send_socket::MockSendSocket;
    use crate::test_util::RecordingSocket;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn config(volume_threshold: usize) -> TransportConfig {
        let mut config = TransportConfig::default_ipv4();
        config.volume_threshold = volume_threshold;
        config.speaker_batch_size = 100;
        config
    }

    fn speaker(config: &TransportConfig, socket: Arc<dyn SendSocket>) -> (Speaker, Arc<BundlingQueue>) {
        let queue = Arc::new(BundlingQueue::new(Arc::new(Wakeup::new())));
        let speaker = Speaker::new(
            config,
            queue.clone(),
            socket,
            Arc::new(BufferPool::new(config.max_packet_length, 10)),
            Arc::new(SpeakerStats::default()),
        );
        (speaker, queue)
    }

    fn datagram(payloads: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        PacketCodec::put_datagram_header(&mut buf);
        for p in payloads {
            buf.extend_from_slice(p);
        }
        buf
    }

    #[tokio::test]
    async fn test_sync_send_when_idle() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet()
            .once()
            .with(eq(addr(9)), eq(datagram(&[b"abc"])))
            .return_const(());

        let (mut speaker, queue) = speaker(&config(4), Arc::new(send_socket));
        speaker.add(PacketBundle::new(vec![addr(9)], Bytes::from_static(b"abc"))).await;

        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_async_after_volume_threshold() {
        let socket = Arc::new(RecordingSocket::new(addr(1)));
        let (mut speaker, queue) = speaker(&config(1), socket.clone());

        speaker.add(PacketBundle::new(vec![addr(9)], Bytes::from_static(b"a"))).await;
        speaker.add(PacketBundle::new(vec![addr(9)], Bytes::from_static(b"b"))).await;
        speaker.add(PacketBundle::new(vec![addr(9)], Bytes::from_static(b"c"))).await;

        assert_eq!(socket.sent().len(), 2);
        assert_eq!(queue.len(), 1);

        // queued packets keep later ones from overtaking them
        speaker.add(PacketBundle::new(vec![addr(9)], Bytes::from_static(b"d"))).await;
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_speaker_sends_everything_inline() {
        let socket = Arc::new(RecordingSocket::new(addr(1)));
        let mut config = config(1);
        config.speaker_enabled = false;
        let (mut speaker, queue) = speaker(&config, socket.clone());

        for _ in 0..5 {
            speaker.add(PacketBundle::new(vec![addr(9), addr(10)], Bytes::from_static(b"x"))).await;
        }
        assert_eq!(socket.sent().len(), 10);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_flush_after_overload_keeps_async() {
        let socket = Arc::new(RecordingSocket::new(addr(1)));
        let (mut speaker, queue) = speaker(&config(1), socket.clone());

        for _ in 0..3 {
            speaker.add(PacketBundle::new(vec![addr(9)], Bytes::from_static(b"x"))).await;
        }
        speaker.flush();
        while queue.pop_bundled(1000).is_some() {}

        speaker.add(PacketBundle::new(vec![addr(9)], Bytes::from_static(b"y"))).await;
        assert_eq!(queue.len(), 1);

        speaker.flush();
        while queue.pop_bundled(1000).is_some() {}
        speaker.add(PacketBundle::new(vec![addr(9)], Bytes::from_static(b"z"))).await;
        assert!(queue.is_empty());
    }

    #[rstest::rstest]
    #[case::backlog_shrinks(64, 0, 1, 48)]
    #[case::big_backlog_shrinks_by_quarter(64, 0, 100, 48)]
    #[case::small_backlog(2, 0, 1, 1)]
    #[case::minimum(1, 0, 5, 1)]
    #[case::used_to_capacity_grows(8, 8, 0, 16)]
    #[case::not_used_to_capacity(8, 3, 0, 8)]
    fn test_tune_volume_threshold(#[case] initial: usize, #[case] sync_sends: usize, #[case] backlog: usize, #[case] expected: usize) {
        let (mut speaker, _) = speaker(&config(initial), Arc::new(MockSendSocket::new()));
        speaker.sync_send_count = sync_sends;

        speaker.tune_volume_threshold(backlog);
        assert_eq!(speaker.volume_threshold(), expected);
        assert_eq!(speaker.stats.volume_threshold.get(), expected as u64);
    }

    #[test]
    fn test_not_tunable() {
        let mut config = config(8);
        config.volume_tunable = false;
        let (mut speaker, _) = speaker(&config, Arc::new(MockSendSocket::new()));

        speaker.tune_volume_threshold(100);
        assert_eq!(speaker.volume_threshold(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaker_task_bundles() {
        let socket = Arc::new(RecordingSocket::new(addr(1)));
        let queue = Arc::new(BundlingQueue::new(Arc::new(Wakeup::new())));
        queue.push(PacketBundle::new(vec![addr(9)], Bytes::from_static(b"ab")));
        queue.push(PacketBundle::new(vec![addr(9)], Bytes::from_static(b"cd")));
        queue.push(PacketBundle::new(vec![addr(8)], Bytes::from_static(b"ef")));
        queue.wakeup().signal();

        let stats = Arc::new(SpeakerStats::default());
        let handle = tokio::spawn(run_speaker(
            queue.clone(),
            socket.clone(),
            Arc::new(BufferPool::new(100, 10)),
            stats.clone(),
            100,
        ));
        tokio::time::sleep(Duration::from_millis(1)).await;
        handle.abort();

        assert_eq!(socket.sent(), vec![
            (addr(9), datagram(&[b"ab", b"cd"])),
            (addr(8), datagram(&[b"ef"])),
        ]);
        assert_eq!(stats.datagrams_sent.get(), 2);
        assert_eq!(stats.packets_sent.get(), 3);
        assert!(queue.is_empty());
    }
}
