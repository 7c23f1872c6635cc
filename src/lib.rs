//! Reliable, ordered message delivery between the members of a cluster over UDP.
//!
//! Messages are split into packets that fit into a datagram, sent by unicast or multicast, and
//!  resent until each destination acknowledged them. Receivers reassemble messages and deliver
//!  them in the order they were sent by each sender. Per-peer flow control keeps slow peers
//!  from being flooded.
//!
//! Three engines run as tokio tasks: the [publisher::Publisher] owns all sender-side state, the
//!  [receiver::Receiver] all receiver-side state, and the speaker task takes over socket writes
//!  under load. [transport::ClusterTransport] wires them up.

pub mod atomic_map;
pub mod buffer_pool;
pub mod config;
pub mod diagnostics;
pub mod member;
pub mod membership;
pub mod message;
pub mod message_dispatcher;
pub mod packet;
pub mod packet_codec;
pub mod peer_state;
pub mod publisher;
pub mod queues;
pub mod receiver;
pub mod safe_converter;
pub mod send_socket;
pub mod speaker;
pub mod stats;
pub mod test_util;
pub mod transport;
pub mod trint;
pub mod windowed_array;
