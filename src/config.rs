use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// The address of the unicast socket that peers send to. Port 0 lets the operating system
    ///  pick a port, which is mostly useful for tests.
    pub unicast_addr: SocketAddr,

    /// The multicast group used for packets addressed to a large share of the cluster, and for
    ///  broadcasts. If this is `None`, all traffic goes through unicast sockets.
    pub multicast_addr: Option<SocketAddr>,

    /// This is the UDP payload size that the publisher aims for when packetizing messages. It
    ///  is the default for peers that do not advertise a preferred length of their own.
    ///
    /// The transport never fragments at the IP level, so this length (plus IP and UDP headers)
    ///  must fit through every route between nodes. With full Ethernet frames and no optional
    ///  IP headers, this is `1500 - 40 - 8 = 1452` for IPV6.
    pub preferred_packet_length: usize,

    /// The largest datagram the transport ever builds or expects to receive. This determines
    ///  the size of pooled buffers.
    pub max_packet_length: usize,

    /// This is the number of receive / send buffers that are pooled at a given time - buffers
    ///  in excess of this number are discarded when they are returned.
    pub buffer_pool_size: usize,

    /// The delay after sending a packet before it is resent if no ack arrived.
    pub resend_delay: Duration,
    /// The time after which a packet is given up on, and its remaining destinations are
    ///  reported as undeliverable.
    pub resend_timeout: Duration,

    /// The time a received packet may wait for its ack to be sent, giving other packets the
    ///  chance to share the ack.
    pub ack_delay: Duration,

    /// Negative acks: detect gaps early and request resends instead of waiting for
    ///  `resend_delay` to pass.
    pub nack_enabled: bool,
    pub nack_delay: Duration,

    /// A packet for more than this fraction of the other cluster members is sent through the
    ///  multicast group instead of per-peer unicast.
    pub multicast_threshold: f64,

    /// If a packet remains unacknowledged this close to its timeout, diagnostic probes are sent
    ///  to the silent members.
    pub diagnostic_window: Duration,
    pub diagnostic_ttl: u8,

    /// Submitting callers are blocked while this many packets are in flight.
    pub traffic_jam_count: usize,
    /// The sleep interval of a blocked submitter before it re-checks the backlog.
    pub traffic_jam_delay: Duration,

    /// The speaker queue length at which the publisher stops adding to it and waits.
    pub clogged_count: usize,
    pub clogged_delay: Duration,

    /// The number of packets that the publisher sends inline (without handing them over to
    ///  the speaker task) between two flushes. If `volume_tunable` is set, this number is
    ///  adjusted based on the observed backlog.
    pub volume_threshold: usize,
    pub volume_tunable: bool,

    /// If this is false, the publisher sends all packets itself.
    pub speaker_enabled: bool,
    /// The speaker is woken up once this many packets are waiting for it.
    pub speaker_batch_size: usize,

    pub flow_control: FlowControlConfig,
}

impl TransportConfig {
    /// IP V4 with end-to-end full Ethernet MTU - without optional headers - and no multicast
    pub fn default_ipv4() -> TransportConfig {
        TransportConfig {
            unicast_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            multicast_addr: None,
            preferred_packet_length: 1452,
            max_packet_length: 1468,
            buffer_pool_size: 4096,
            resend_delay: Duration::from_millis(400),
            resend_timeout: Duration::from_secs(20),
            ack_delay: Duration::from_millis(10),
            nack_enabled: true,
            nack_delay: Duration::from_millis(1),
            multicast_threshold: 0.25,
            diagnostic_window: Duration::from_secs(2),
            diagnostic_ttl: 2,
            traffic_jam_count: 8192,
            traffic_jam_delay: Duration::from_millis(10),
            clogged_count: 1024,
            clogged_delay: Duration::from_millis(10),
            volume_threshold: 64,
            volume_tunable: true,
            speaker_enabled: true,
            speaker_batch_size: 8,
            flow_control: FlowControlConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.preferred_packet_length < 64 || self.max_packet_length < 64 {
            bail!("packet length is too small");
        }
        if self.preferred_packet_length > self.max_packet_length {
            bail!("preferred packet length {} exceeds max packet length {}", self.preferred_packet_length, self.max_packet_length);
        }
        if self.max_packet_length > 65507 {
            bail!("max packet length {} does not fit into a UDP datagram", self.max_packet_length);
        }
        if self.resend_delay < Duration::from_millis(1) {
            bail!("resend delay must be at least 1ms");
        }
        if self.resend_timeout < Duration::from_millis(10) {
            bail!("resend timeout must be at least 10ms");
        }
        if self.resend_timeout <= self.resend_delay {
            bail!("resend timeout must be greater than resend delay");
        }
        if !(0.0..=1.0).contains(&self.multicast_threshold) {
            bail!("multicast threshold must be between 0 and 1");
        }
        if self.speaker_batch_size == 0 {
            bail!("speaker batch size must be positive");
        }
        if let Some(addr) = &self.multicast_addr {
            if !addr.ip().is_multicast() {
                bail!("{} is not a multicast address", addr);
            }
        }
        self.flow_control.validate()
    }
}

/// Per-peer flow control: the publisher limits the number of unacknowledged packets in
///  flight to a peer, adapting the limit to how well the peer keeps up.
#[derive(Clone, Debug)]
pub struct FlowControlConfig {
    pub enabled: bool,
    /// bounds for the adaptive limit of outstanding packets per peer
    pub min_outstanding: u32,
    pub max_outstanding: u32,
    /// The threshold is changed by `1/aggression` of its value per adjustment
    pub aggression: u32,
    /// The number of acks per lost packet that the publisher aims for. This is also the
    ///  number of sends that avoid multicast after a multicast packet had to be resent.
    pub success_goal: u32,
    /// A peer that loses more than this many packets in sequence is paused, i.e. allowed
    ///  one outstanding packet until it acknowledges again.
    pub lost_packet_threshold: u32,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        FlowControlConfig {
            enabled: true,
            min_outstanding: 64,
            max_outstanding: 4096,
            aggression: 20,
            success_goal: 200,
            lost_packet_threshold: 16,
        }
    }
}

impl FlowControlConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_outstanding < 1 {
            bail!("flow control needs to allow at least one outstanding packet");
        }
        if self.min_outstanding > self.max_outstanding {
            bail!("min outstanding {} is greater than max outstanding {}", self.min_outstanding, self.max_outstanding);
        }
        if self.aggression == 0 {
            bail!("flow control aggression must be positive");
        }
        Ok(())
    }
}
