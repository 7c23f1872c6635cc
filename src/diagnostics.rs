use std::sync::Arc;
use tracing::debug;
use crate::buffer_pool::BufferPool;
use crate::member::MemberId;
use crate::packet::{DiagnosticPacket, Packet};
use crate::packet_codec::PacketCodec;
use crate::peer_state::PeerState;
use crate::send_socket::SendSocket;

/// Sends diagnostic probes. These are small unacknowledged packets that bypass all queues, and
///  that the receiving side bounces back until their time to live is used up. They exercise the
///  network path to a peer that stopped acknowledging, so that a working path and a dead peer
///  can be told apart from the outside.
pub struct DiagnosticSender {
    self_id: MemberId,
    socket: Arc<dyn SendSocket>,
    pool: Arc<BufferPool>,
}

impl DiagnosticSender {
    pub fn new(self_id: MemberId, socket: Arc<dyn SendSocket>, pool: Arc<BufferPool>) -> DiagnosticSender {
        DiagnosticSender {
            self_id,
            socket,
            pool,
        }
    }

    /// Sends a probe to the peer's regular address, and a second one to its advertised address
    ///  if the peer has a separate preferred address. Returns the number of probes sent.
    pub async fn probe(&self, peer: &PeerState, time_to_live: u8) -> usize {
        if peer.preferred_address().is_some() {
            self.send(peer, time_to_live, true).await;
            self.send(peer, time_to_live, false).await;
            2
        }
        else {
            self.send(peer, time_to_live, false).await;
            1
        }
    }

    /// Answers a received probe through the same kind of address it was sent to
    pub async fn bounce(&self, peer: &PeerState, probe: &DiagnosticPacket) {
        if probe.time_to_live == 0 {
            return;
        }
        self.send(peer, probe.time_to_live - 1, probe.to_preferred_address).await;
    }

    async fn send(&self, peer: &PeerState, time_to_live: u8, to_preferred_address: bool) {
        let to = match (to_preferred_address, peer.preferred_address()) {
            (true, Some(preferred)) => preferred,
            _ => peer.address(),
        };
        debug!("sending diagnostic packet to {:?} at {:?} with ttl {}", peer.id(), to, time_to_live);

        let packet = Packet::Diagnostic(DiagnosticPacket {
            from_id: self.self_id,
            to_id: peer.id(),
            time_to_live,
            to_preferred_address,
        });

        let mut buf = self.pool.get_from_pool();
        PacketCodec::put_datagram_header(&mut buf);
        PacketCodec::ser(&packet, &mut buf);
        self.socket.do_send_packet(to, &buf).await;
        self.pool.return_to_pool(buf);
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use bytes::BufMut;
    use mockall::predicate::eq;
    use super::*;
    use crate::config::FlowControlConfig;
    use crate::send_socket::MockSendSocket;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn m(id: u16) -> MemberId {
        MemberId::from_raw(id)
    }

    fn encode_probe(from_id: MemberId, to_id: MemberId, time_to_live: u8, to_preferred_address: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        PacketCodec::put_datagram_header(&mut buf);
        buf.put_slice(&PacketCodec::encode(&Packet::Diagnostic(DiagnosticPacket {
            from_id,
            to_id,
            time_to_live,
            to_preferred_address,
        })));
        buf
    }

    fn sender(socket: MockSendSocket) -> DiagnosticSender {
        DiagnosticSender::new(m(1), Arc::new(socket), Arc::new(BufferPool::new(100, 4)))
    }

    #[tokio::test]
    async fn test_probe_without_preferred_address() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .once()
            .with(eq(addr(2)), eq(encode_probe(m(1), m(2), 2, false)))
            .return_const(());

        let peer = PeerState::new(m(2), addr(2), &FlowControlConfig::default());
        assert_eq!(sender(socket).probe(&peer, 2).await, 1);
    }

    #[tokio::test]
    async fn test_probe_with_preferred_address() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .once()
            .with(eq(addr(22)), eq(encode_probe(m(1), m(2), 2, true)))
            .return_const(());
        socket.expect_do_send_packet()
            .once()
            .with(eq(addr(2)), eq(encode_probe(m(1), m(2), 2, false)))
            .return_const(());

        let peer = PeerState::new(m(2), addr(2), &FlowControlConfig::default())
            .with_preferred_address(addr(22));
        assert_eq!(sender(socket).probe(&peer, 2).await, 2);
    }

    #[rstest::rstest]
    #[case::preferred(true, 22, 3, Some(2))]
    #[case::advertised(false, 2, 1, Some(0))]
    #[case::expired(true, 22, 0, None)]
    #[tokio::test]
    async fn test_bounce(#[case] to_preferred: bool, #[case] expected_port: u16, #[case] ttl: u8, #[case] expected_ttl: Option<u8>) {
        let mut socket = MockSendSocket::new();
        if let Some(expected_ttl) = expected_ttl {
            socket.expect_do_send_packet()
                .once()
                .with(eq(addr(expected_port)), eq(encode_probe(m(1), m(2), expected_ttl, to_preferred)))
                .return_const(());
        }

        let peer = PeerState::new(m(2), addr(2), &FlowControlConfig::default())
            .with_preferred_address(addr(22));
        let probe = DiagnosticPacket {
            from_id: m(2),
            to_id: m(1),
            time_to_live: ttl,
            to_preferred_address: to_preferred,
        };
        sender(socket).bounce(&peer, &probe).await;
    }
}
