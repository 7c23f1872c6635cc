//! The transport's public face: it wires up the publisher, receiver and speaker engines and
//!  the socket listeners, and accepts messages for sending.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};
use crate::buffer_pool::BufferPool;
use crate::config::TransportConfig;
use crate::diagnostics::DiagnosticSender;
use crate::member::{MemberId, MemberSet};
use crate::membership::{MemberDirectory, PeerHealthListener};
use crate::message::{Destinations, OutboundMessage};
use crate::message_dispatcher::MessageDispatcher;
use crate::publisher::{Publisher, PublisherInbox};
use crate::queues::bundling_queue::BundlingQueue;
use crate::queues::engine_queue::EngineQueue;
use crate::queues::wakeup::Wakeup;
use crate::receiver::{DatagramSink, Receiver, ReceiverEvent};
use crate::send_socket::SendSocket;
use crate::speaker::{run_speaker, Speaker};
use crate::stats::{PublisherStats, ReceiverStats, SpeakerStats};

const TRAFFIC_JAM_WARNING_INTERVAL: Duration = Duration::from_secs(10);

/// A submission could not be handed to the publisher in time because too many packets are
///  waiting to be acknowledged
#[derive(Debug)]
pub struct SubmitTimeout {
    pub backlog: usize,
    pub waited: Duration,
}

impl Display for SubmitTimeout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "timed out after {:?} waiting for a backlog of {} packets to drain", self.waited, self.backlog)
    }
}

impl std::error::Error for SubmitTimeout {}

pub struct ClusterTransport {
    self_id: MemberId,
    config: Arc<TransportConfig>,
    local_addr: SocketAddr,
    inbox: PublisherInbox,
    receiver_ingress: Arc<EngineQueue<ReceiverEvent>>,
    sink: DatagramSink,

    publisher_stats: Arc<PublisherStats>,
    receiver_stats: Arc<ReceiverStats>,
    speaker_stats: Arc<SpeakerStats>,

    tasks: Vec<JoinHandle<()>>,
    last_traffic_jam_warning: Mutex<Option<Instant>>,
}

impl ClusterTransport {
    /// Binds UDP sockets for the configured addresses and starts the transport on them
    pub async fn bind(
        config: TransportConfig,
        self_id: MemberId,
        directory: Arc<dyn MemberDirectory>,
        dispatcher: Arc<dyn MessageDispatcher>,
        health: Arc<dyn PeerHealthListener>,
    ) -> anyhow::Result<ClusterTransport> {
        config.validate()?;

        //TODO "don't fragment" flag
        let socket = Arc::new(UdpSocket::bind(config.unicast_addr).await?);
        info!("bound unicast socket to {:?}", socket.local_addr()?);

        let multicast_socket = match config.multicast_addr {
            Some(group) => Some(Arc::new(join_multicast(group).await?)),
            None => None,
        };

        let max_packet_length = config.max_packet_length;
        let mut transport = Self::start_with(config, self_id, directory, dispatcher, health, Arc::new(socket.clone()))?;
        transport.spawn_listener(socket, max_packet_length);
        if let Some(multicast_socket) = multicast_socket {
            transport.spawn_listener(multicast_socket, max_packet_length);
        }
        Ok(transport)
    }

    /// Starts the engines with a given socket for sending. Received datagrams are expected at
    ///  [ClusterTransport::datagram_sink].
    pub fn start_with(
        config: TransportConfig,
        self_id: MemberId,
        directory: Arc<dyn MemberDirectory>,
        dispatcher: Arc<dyn MessageDispatcher>,
        health: Arc<dyn PeerHealthListener>,
        socket: Arc<dyn SendSocket>,
    ) -> anyhow::Result<ClusterTransport> {
        config.validate()?;
        let config = Arc::new(config);
        let local_addr = socket.local_addr()?;
        info!("starting cluster transport for {} at {:?}", self_id, local_addr);

        let pool = Arc::new(BufferPool::new(config.max_packet_length, config.buffer_pool_size));
        let publisher_stats = Arc::new(PublisherStats::default());
        let receiver_stats = Arc::new(ReceiverStats::default());
        let speaker_stats = Arc::new(SpeakerStats::default());

        let inbox = PublisherInbox::new(&config);
        let receiver_ingress = Arc::new(EngineQueue::new(Arc::new(Wakeup::new())));
        let sink = DatagramSink::new(receiver_ingress.clone(), pool.clone());
        let diagnostics = Arc::new(DiagnosticSender::new(self_id, socket.clone(), pool.clone()));

        let bundling_queue = Arc::new(BundlingQueue::new(Arc::new(Wakeup::new())));
        let speaker = Speaker::new(&config, bundling_queue.clone(), socket.clone(), pool.clone(), speaker_stats.clone());

        let publisher = Publisher::new(
            self_id,
            config.clone(),
            inbox.clone(),
            directory.clone(),
            health,
            speaker,
            diagnostics.clone(),
            publisher_stats.clone(),
        );
        let receiver = Receiver::new(
            self_id,
            config.clone(),
            directory,
            dispatcher,
            receiver_ingress.clone(),
            inbox.acks.clone(),
            inbox.confirmations.clone(),
            pool.clone(),
            diagnostics,
            receiver_stats.clone(),
        );

        let mut tasks = vec![
            spawn_engine("publisher", publisher.run()),
            tokio::spawn(receiver.run()),
        ];
        if config.speaker_enabled {
            tasks.push(tokio::spawn(run_speaker(bundling_queue, socket, pool, speaker_stats.clone(), config.max_packet_length)));
        }

        Ok(ClusterTransport {
            self_id,
            config,
            local_addr,
            inbox,
            receiver_ingress,
            sink,
            publisher_stats,
            receiver_stats,
            speaker_stats,
            tasks,
            last_traffic_jam_warning: Mutex::new(None),
        })
    }

    fn spawn_listener(&mut self, socket: Arc<UdpSocket>, max_packet_length: usize) {
        let sink = self.sink.clone();
        self.tasks.push(tokio::spawn(listen(socket, sink, max_packet_length)));
    }

    pub fn self_id(&self) -> MemberId {
        self.self_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// the entry point for datagrams received by listeners outside the transport
    pub fn datagram_sink(&self) -> DatagramSink {
        self.sink.clone()
    }

    /// Sends a message reliably to the given members, waiting for as long as it takes if the
    ///  transport is in a traffic jam
    pub async fn submit(&self, destinations: MemberSet, payload: Bytes) -> anyhow::Result<()> {
        self.submit_message(OutboundMessage {
            destinations: Destinations::Members(destinations),
            payload,
            deferrable: true,
        }, None).await
    }

    /// Like [ClusterTransport::submit], but fails with [SubmitTimeout] if the traffic jam does
    ///  not clear up in time
    pub async fn submit_with_timeout(&self, destinations: MemberSet, payload: Bytes, timeout: Duration) -> anyhow::Result<()> {
        self.submit_message(OutboundMessage {
            destinations: Destinations::Members(destinations),
            payload,
            deferrable: true,
        }, Some(timeout)).await
    }

    /// Sends a single-packet message to all cluster members without acknowledgement
    pub async fn broadcast(&self, payload: Bytes) -> anyhow::Result<()> {
        self.submit_message(OutboundMessage {
            destinations: Destinations::Broadcast,
            payload,
            deferrable: false,
        }, None).await
    }

    pub async fn submit_message(&self, message: OutboundMessage, timeout: Option<Duration>) -> anyhow::Result<()> {
        self.wait_for_traffic_jam(timeout).await?;
        self.inbox.submissions.add(message);
        Ok(())
    }

    async fn wait_for_traffic_jam(&self, timeout: Option<Duration>) -> anyhow::Result<()> {
        let start = Instant::now();
        loop {
            let backlog = self.inbox.backlog();
            if backlog < self.config.traffic_jam_count {
                return Ok(());
            }

            let waited = start.elapsed();
            if let Some(timeout) = timeout {
                if waited >= timeout {
                    debug!("giving up on submission after {:?} in a traffic jam", waited);
                    return Err(SubmitTimeout { backlog, waited }.into());
                }
            }
            self.warn_traffic_jam(backlog);
            sleep(self.config.traffic_jam_delay).await;
        }
    }

    fn warn_traffic_jam(&self, backlog: usize) {
        let now = Instant::now();
        let mut last = self.last_traffic_jam_warning.lock().unwrap();
        if last.map_or(true, |t| now.duration_since(t) >= TRAFFIC_JAM_WARNING_INTERVAL) {
            warn!("traffic jam: {} packets are waiting to be acknowledged - blocking submissions", backlog);
            *last = Some(now);
        }
    }

    /// Must be called after the member was removed from the member directory. Packets to the
    ///  member are dropped, and state for messages from the member is discarded.
    pub fn on_member_left(&self, member: MemberId) {
        info!("member {} left the cluster", member);
        self.inbox.departures.add(member);
        self.receiver_ingress.add(ReceiverEvent::MemberLeft(member));
    }

    /// packets held by the publisher plus messages waiting for it
    pub fn backlog(&self) -> usize {
        self.inbox.backlog()
    }

    pub fn publisher_stats(&self) -> &PublisherStats {
        &self.publisher_stats
    }

    pub fn receiver_stats(&self) -> &ReceiverStats {
        &self.receiver_stats
    }

    pub fn speaker_stats(&self) -> &SpeakerStats {
        &self.speaker_stats
    }

    pub fn reset_stats(&self) {
        self.publisher_stats.reset();
        self.receiver_stats.reset();
        self.speaker_stats.reset();
    }

    /// Stops all tasks. Messages that were not sent or acknowledged yet are lost.
    pub fn shutdown(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        info!("shutting down cluster transport for {}", self.self_id);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ClusterTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_engine(name: &'static str, engine: impl Future<Output = anyhow::Result<()>> + Send + 'static) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = engine.await {
            error!("{} stopped on an internal error: {:#}", name, e);
        }
    })
}

async fn join_multicast(group: SocketAddr) -> anyhow::Result<UdpSocket> {
    let socket = match group.ip() {
        IpAddr::V4(ip) => {
            let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port()))).await?;
            socket.join_multicast_v4(ip, Ipv4Addr::UNSPECIFIED)?;
            socket
        }
        IpAddr::V6(ip) => {
            let socket = UdpSocket::bind(SocketAddr::from((Ipv6Addr::UNSPECIFIED, group.port()))).await?;
            socket.join_multicast_v6(&ip, 0)?;
            socket
        }
    };
    info!("joined multicast group {:?}", group);
    Ok(socket)
}

/// Pause between receive attempts while a socket keeps failing, doubling up to a limit
struct ErrorBackoff {
    next: Duration,
}

impl ErrorBackoff {
    const MIN: Duration = Duration::from_millis(1);
    const MAX: Duration = Duration::from_secs(1);

    fn new() -> ErrorBackoff {
        ErrorBackoff { next: Self::MIN }
    }

    fn on_success(&mut self) {
        self.next = Self::MIN;
    }

    fn on_error(&mut self) -> Duration {
        let result = self.next;
        self.next = (self.next * 2).min(Self::MAX);
        result
    }
}

/// Receives datagrams into pooled buffers and hands them to the receiver
async fn listen(socket: Arc<UdpSocket>, sink: DatagramSink, max_packet_length: usize) {
    info!("starting listener on {:?}", socket.local_addr());
    let mut backoff = ErrorBackoff::new();
    loop {
        let mut buf = sink.buffer();
        buf.resize(max_packet_length, 0);
        match socket.recv_from(&mut buf).await {
            Ok((num_read, from)) => {
                backoff.on_success();
                buf.truncate(num_read);
                sink.submit(buf, from);
            }
            Err(e) => {
                sink.release(buf);
                let pause = backoff.on_error();
                error!("socket error, pausing the listener for {:?}: {}", pause, e);
                sleep(pause).await;
            }
        }
    }
}
