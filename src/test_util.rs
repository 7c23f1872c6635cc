//! Test doubles for the transport's boundaries: sockets that record or loop back datagrams, and
//!  a dispatcher that collects delivered messages.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::{sleep, Duration, Instant};
use crate::member::MemberId;
use crate::message::IncomingMessage;
use crate::message_dispatcher::MessageDispatcher;
use crate::packet::Packet;
use crate::packet_codec::PacketCodec;
use crate::receiver::DatagramSink;
use crate::send_socket::SendSocket;

/// convenience method for test code: the same number always gives the same address, and
///  different numbers give different addresses
pub fn test_addr(number: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 10_000 + number))
}

fn decode_all(datagram: &[u8]) -> Vec<Packet> {
    PacketCodec::decode_datagram(datagram).unwrap_or_default()
}

/// A socket that keeps every datagram sent through it
pub struct RecordingSocket {
    local_addr: SocketAddr,
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl RecordingSocket {
    pub fn new(local_addr: SocketAddr) -> RecordingSocket {
        RecordingSocket {
            local_addr,
            sent: Default::default(),
        }
    }

    pub fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    /// the decoded packets of all sent datagrams, in the order they were sent
    pub fn sent_packets(&self) -> Vec<(SocketAddr, Packet)> {
        self.sent.lock().unwrap()
            .iter()
            .flat_map(|(to, datagram)| decode_all(datagram).into_iter().map(move |p| (*to, p)))
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl SendSocket for RecordingSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        self.sent.lock().unwrap().push((to, packet_buf.to_vec()));
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

/// Collects delivered messages as (sender, payload)
#[derive(Default)]
pub struct CollectingDispatcher {
    received: Mutex<Vec<(MemberId, Bytes)>>,
}

impl CollectingDispatcher {
    pub fn new() -> CollectingDispatcher {
        CollectingDispatcher::default()
    }

    pub fn received(&self) -> Vec<(MemberId, Bytes)> {
        self.received.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until at least `n` messages arrived. Returns `false` on timeout.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.len() < n {
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(1)).await;
        }
        true
    }
}

#[async_trait]
impl MessageDispatcher for CollectingDispatcher {
    async fn on_message(&self, message: IncomingMessage) {
        let payload = message.payload();
        self.received.lock().unwrap().push((message.from(), payload));
    }
}

type DeliveryFilter = Box<dyn FnMut(SocketAddr, SocketAddr, &[u8]) -> bool + Send>;

/// An in-memory network connecting transports in a single process. Datagrams sent to a
///  registered address go to that address's sink, datagrams sent to the multicast group go to
///  every sink except the sender's.
pub struct LoopbackNetwork {
    multicast_group: Option<SocketAddr>,
    sinks: Mutex<FxHashMap<SocketAddr, DatagramSink>>,
    filter: Mutex<Option<DeliveryFilter>>,
    sent: Mutex<Vec<(SocketAddr, SocketAddr, Vec<u8>)>>,
}

impl LoopbackNetwork {
    pub fn new(multicast_group: Option<SocketAddr>) -> Arc<LoopbackNetwork> {
        Arc::new(LoopbackNetwork {
            multicast_group,
            sinks: Default::default(),
            filter: Default::default(),
            sent: Default::default(),
        })
    }

    pub fn socket(self: &Arc<Self>, local_addr: SocketAddr) -> Arc<LoopbackSocket> {
        Arc::new(LoopbackSocket {
            network: self.clone(),
            local_addr,
        })
    }

    pub fn register(&self, addr: SocketAddr, sink: DatagramSink) {
        self.sinks.lock().unwrap().insert(addr, sink);
    }

    /// Installs a filter that is called with (from, to, datagram) for every datagram, and
    ///  drops the datagram if it returns `false`
    pub fn set_filter(&self, filter: impl FnMut(SocketAddr, SocketAddr, &[u8]) -> bool + Send + 'static) {
        *self.filter.lock().unwrap() = Some(Box::new(filter));
    }

    /// every datagram sent as (from, to, packet), including dropped ones
    pub fn sent_packets(&self) -> Vec<(SocketAddr, SocketAddr, Packet)> {
        self.sent.lock().unwrap()
            .iter()
            .flat_map(|(from, to, datagram)| decode_all(datagram).into_iter().map(move |p| (*from, *to, p)))
            .collect()
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, datagram: &[u8]) {
        self.sent.lock().unwrap().push((from, to, datagram.to_vec()));

        if let Some(filter) = self.filter.lock().unwrap().as_mut() {
            if !filter(from, to, datagram) {
                return;
            }
        }

        let sinks = self.sinks.lock().unwrap();
        if Some(to) == self.multicast_group {
            for (addr, sink) in sinks.iter() {
                if *addr != from {
                    sink.submit_slice(datagram, from);
                }
            }
        }
        else if let Some(sink) = sinks.get(&to) {
            sink.submit_slice(datagram, from);
        }
    }
}

pub struct LoopbackSocket {
    network: Arc<LoopbackNetwork>,
    local_addr: SocketAddr,
}

#[async_trait]
impl SendSocket for LoopbackSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        self.network.deliver(self.local_addr, to, packet_buf);
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}
