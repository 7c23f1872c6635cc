use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use crate::member::{MemberId, MemberSet};
use crate::packet::{MessagePacket, PacketRef};
use crate::peer_state::DeliveryState;
use crate::windowed_array::WindowedArray;

#[derive(Clone, Debug)]
pub enum Destinations {
    Members(MemberSet),
    /// every current cluster member, unreliably
    Broadcast,
}

/// A message submitted for sending, waiting for the publisher
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub destinations: Destinations,
    pub payload: Bytes,
    /// Whether packets of this message are subject to per-peer flow control. This is meant to
    ///  be switched off for urgent control traffic.
    pub deferrable: bool,
}

/// Sender-side bookkeeping for a packet that must be acknowledged
#[derive(Debug)]
pub struct OutgoingPacket {
    /// the packet as it is sent and resent
    pub packet: MessagePacket,
    /// destinations that have not acknowledged the packet yet
    pub remaining: MemberSet,
    pub multipoint: bool,
    pub deferrable: bool,
    /// flow control state, only meaningful for deferrable unipoint packets
    pub delivery_state: DeliveryState,
    pub sent_count: u32,
    pub sent_time: Option<Instant>,
    pub resend_scheduled: Option<Instant>,
    pub resend_timeout: Option<Instant>,
    /// The number of stale resend queue entries that refer to this packet. These are created
    ///  when a packet is pulled to the front of the queue for an early resend.
    pub pending_resend_skips: u32,
    /// set while the packet waits at the front of the resend queue for an early resend
    pub nack_in_progress: bool,
}

impl OutgoingPacket {
    pub fn new(packet: MessagePacket, destinations: MemberSet, deferrable: bool) -> OutgoingPacket {
        let multipoint = destinations.len() > 1;
        OutgoingPacket {
            packet,
            remaining: destinations,
            multipoint,
            deferrable: deferrable && !multipoint,
            delivery_state: DeliveryState::Unsent,
            sent_count: 0,
            sent_time: None,
            resend_scheduled: None,
            resend_timeout: None,
            pending_resend_skips: 0,
            nack_in_progress: false,
        }
    }

    pub fn is_addressed_to(&self, member: MemberId) -> bool {
        self.remaining.contains(member)
    }

    /// Registers an ack from a member, returning `true` if it was new
    pub fn register_ack(&mut self, member: MemberId) -> bool {
        self.remaining.remove(member)
    }

    pub fn is_resend_necessary(&self) -> bool {
        !self.remaining.is_empty()
    }

    /// the only destination of a unipoint packet that has not acknowledged yet
    pub fn single_destination(&self) -> Option<MemberId> {
        if self.multipoint {
            return None;
        }
        self.remaining.first()
    }
}

/// Sender-side bookkeeping for a message, held until all its packets are acknowledged by all
///  destinations (or given up on)
#[derive(Debug)]
pub struct OutgoingMessage {
    packets: Vec<Option<OutgoingPacket>>,
    num_remaining: usize,
}

impl OutgoingMessage {
    pub fn new(packets: Vec<OutgoingPacket>) -> OutgoingMessage {
        let num_remaining = packets.len();
        OutgoingMessage {
            packets: packets.into_iter().map(Some).collect(),
            num_remaining,
        }
    }

    pub fn part_count(&self) -> usize {
        self.packets.len()
    }

    pub fn packet(&self, part_index: u32) -> Option<&OutgoingPacket> {
        self.packets.get(part_index as usize)?.as_ref()
    }

    pub fn packet_mut(&mut self, part_index: u32) -> Option<&mut OutgoingPacket> {
        self.packets.get_mut(part_index as usize)?.as_mut()
    }

    /// Releases a packet, returning it if it was still held
    pub fn retire_packet(&mut self, part_index: u32) -> Option<OutgoingPacket> {
        let retired = self.packets.get_mut(part_index as usize)?.take();
        if retired.is_some() {
            self.num_remaining -= 1;
        }
        retired
    }

    /// `true` once all packets are retired
    pub fn is_done(&self) -> bool {
        self.num_remaining == 0
    }
}

/// all messages the publisher holds on to, keyed by message id
pub type OutgoingMessages = WindowedArray<OutgoingMessage>;

impl WindowedArray<OutgoingMessage> {
    pub fn packet(&self, packet: PacketRef) -> Option<&OutgoingPacket> {
        self.get(packet.message_id)?.packet(packet.part_index)
    }

    pub fn packet_mut(&mut self, packet: PacketRef) -> Option<&mut OutgoingPacket> {
        self.get_mut(packet.message_id)?.packet_mut(packet.part_index)
    }
}

/// A message that arrives in packets, possibly out of order, and is handed to the application
///  once it is complete.
///
/// The part count comes from the wire, so parts are stored sparsely: memory grows with the
///  parts that actually arrived.
#[derive(Debug)]
pub struct IncomingMessage {
    from: MemberId,
    message_id: u64,
    part_count: u32,
    parts: BTreeMap<u32, Bytes>,
}

impl IncomingMessage {
    pub fn new(from: MemberId, message_id: u64, part_count: u32) -> IncomingMessage {
        IncomingMessage {
            from,
            message_id,
            part_count,
            parts: BTreeMap::new(),
        }
    }

    pub fn from(&self) -> MemberId {
        self.from
    }

    /// the message id in the sender's id space
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    pub fn part_count(&self) -> u32 {
        self.part_count
    }

    /// Stores a part, returning `false` if it is out of range or was stored before
    pub fn set_part(&mut self, part_index: u32, payload: Bytes) -> bool {
        if part_index >= self.part_count {
            return false;
        }
        match self.parts.entry(part_index) {
            Entry::Vacant(e) => {
                e.insert(payload);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.parts.len() as u64 == self.part_count as u64
    }

    pub fn first_missing(&self) -> Option<u32> {
        let mut expected = 0;
        for &part_index in self.parts.keys() {
            if part_index != expected {
                break;
            }
            expected += 1;
        }
        (expected < self.part_count).then_some(expected)
    }

    /// the message's payload, one byte range per packet
    pub fn parts(&self) -> impl Iterator<Item = &Bytes> + '_ {
        self.parts.values()
    }

    /// the message's payload as a single buffer
    pub fn payload(&self) -> Bytes {
        if self.parts.len() == 1 {
            if let Some(part) = self.parts.values().next() {
                return part.clone();
            }
        }

        let mut buf = BytesMut::with_capacity(self.parts().map(|p| p.len()).sum());
        for part in self.parts() {
            buf.extend_from_slice(part);
        }
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MessagePacketKind;

    fn m(id: u16) -> MemberId {
        MemberId::from_raw(id)
    }

    fn outgoing(destinations: &[u16], deferrable: bool) -> OutgoingPacket {
        let destinations: MemberSet = destinations.iter().map(|&id| m(id)).collect();
        let packet = MessagePacket {
            from_id: m(1),
            kind: MessagePacketKind::Sequel { from_message_id: 1, part_index: 1, destinations: destinations.clone() },
            payload: Bytes::new(),
        };
        OutgoingPacket::new(packet, destinations, deferrable)
    }

    #[test]
    fn test_outgoing_packet_acks() {
        let mut packet = outgoing(&[2, 3], true);
        assert!(packet.multipoint);
        assert!(!packet.deferrable);
        assert_eq!(packet.single_destination(), None);

        assert!(packet.register_ack(m(2)));
        assert!(!packet.register_ack(m(2)));
        assert!(packet.is_resend_necessary());
        assert!(packet.is_addressed_to(m(3)));
        assert!(packet.register_ack(m(3)));
        assert!(!packet.is_resend_necessary());
    }

    #[test]
    fn test_outgoing_unipoint() {
        let packet = outgoing(&[2], true);
        assert!(!packet.multipoint);
        assert!(packet.deferrable);
        assert_eq!(packet.single_destination(), Some(m(2)));
    }

    #[test]
    fn test_outgoing_message_retire() {
        let mut msg = OutgoingMessage::new(vec![outgoing(&[2], true), outgoing(&[2], true)]);
        assert_eq!(msg.part_count(), 2);

        assert!(msg.retire_packet(1).is_some());
        assert!(msg.retire_packet(1).is_none());
        assert!(msg.packet(1).is_none());
        assert!(!msg.is_done());

        assert!(msg.retire_packet(0).is_some());
        assert!(msg.is_done());
        assert!(msg.retire_packet(5).is_none());
    }

    #[test]
    fn test_incoming_message() {
        let mut msg = IncomingMessage::new(m(2), 17, 3);
        assert_eq!(msg.first_missing(), Some(0));

        assert!(msg.set_part(2, Bytes::from_static(b"c")));
        assert!(!msg.set_part(2, Bytes::from_static(b"x")));
        assert!(!msg.set_part(3, Bytes::from_static(b"x")));
        assert!(msg.set_part(0, Bytes::from_static(b"ab")));
        assert_eq!(msg.first_missing(), Some(1));
        assert!(!msg.is_complete());

        assert!(msg.set_part(1, Bytes::new()));
        assert!(msg.is_complete());
        assert_eq!(msg.first_missing(), None);
        assert_eq!(msg.payload(), Bytes::from_static(b"abc"));
        assert_eq!(msg.parts().count(), 3);
    }

    #[test]
    fn test_incoming_message_with_huge_part_count() {
        let mut msg = IncomingMessage::new(m(2), 17, u32::MAX);
        assert!(msg.set_part(0, Bytes::from_static(b"a")));
        assert!(msg.set_part(u32::MAX - 1, Bytes::from_static(b"z")));
        assert!(!msg.set_part(u32::MAX, Bytes::from_static(b"x")));

        assert_eq!(msg.part_count(), u32::MAX);
        assert_eq!(msg.first_missing(), Some(1));
        assert!(!msg.is_complete());
    }
}
