use std::fmt::{Debug, Display, Formatter};
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::member::{MemberId, MemberSet};
use crate::trint::{from_trint, Trint};

/// Packets addressed to up to this many members list them explicitly, packets for more
///  members use a bitmap
pub const FEW_MEMBERS_LIMIT: usize = 32;

// the number of listed members goes into a single byte
const _: () = assert!(FEW_MEMBERS_LIMIT <= u8::MAX as usize);

/// The first message id a publisher assigns; 0 means 'no message'
pub const FIRST_MESSAGE_ID: u64 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    DirectedOne = 1,
    DirectedFew = 2,
    DirectedMany = 3,
    SequelOne = 4,
    SequelFew = 5,
    SequelMany = 6,
    Broadcast = 7,
    Ack = 8,
    /// an ack that is sent early because the sender detected a gap, asking for resends
    Request = 9,
    Diagnostic = 10,
}

impl PacketType {
    pub fn is_directed(&self) -> bool {
        matches!(self, PacketType::DirectedOne | PacketType::DirectedFew | PacketType::DirectedMany)
    }

    pub fn is_sequel(&self) -> bool {
        matches!(self, PacketType::SequelOne | PacketType::SequelFew | PacketType::SequelMany)
    }

    /// packets that the receiver confirms, and the sender resends until they are confirmed
    pub fn is_confirmation_required(&self) -> bool {
        self.is_directed() || self.is_sequel()
    }
}

/// Identifies a packet by its sender-side message id and its index in that message
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PacketRef {
    pub message_id: u64,
    pub part_index: u32,
}

impl PacketRef {
    pub fn new(message_id: u64, part_index: u32) -> PacketRef {
        PacketRef { message_id, part_index }
    }
}

impl Debug for PacketRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.message_id, self.part_index)
    }
}
impl Display for PacketRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.message_id, self.part_index)
    }
}

/// A packet reference with the message id truncated to a trint
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TrintPacketRef {
    pub message_trint: Trint,
    pub part_index: u32,
}

impl TrintPacketRef {
    pub fn resolve(&self, base: u64) -> Option<PacketRef> {
        from_trint(self.message_trint, base)
            .map(|message_id| PacketRef::new(message_id, self.part_index))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MessagePacketKind {
    /// The first packet of a message. It carries the part count and, for each destination,
    ///  the message's position in the sequence of messages from this sender to that
    ///  destination.
    Directed {
        from_message_id: u64,
        part_count: u32,
        /// destination member and its to-message id as a trint, ordered by member id
        destinations: Vec<(MemberId, Trint)>,
    },
    /// a follow-up packet of a multi-packet message
    Sequel {
        from_message_id: u64,
        part_index: u32,
        destinations: MemberSet,
    },
    /// an unreliable single-packet message to the whole cluster
    Broadcast,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessagePacket {
    pub from_id: MemberId,
    pub kind: MessagePacketKind,
    pub payload: Bytes,
}

impl MessagePacket {
    pub fn packet_type(&self) -> PacketType {
        match &self.kind {
            MessagePacketKind::Directed { destinations, .. } => match destinations.len() {
                1 => PacketType::DirectedOne,
                n if n <= FEW_MEMBERS_LIMIT => PacketType::DirectedFew,
                _ => PacketType::DirectedMany,
            },
            MessagePacketKind::Sequel { destinations, .. } => match destinations.len() {
                1 => PacketType::SequelOne,
                n if n <= FEW_MEMBERS_LIMIT => PacketType::SequelFew,
                _ => PacketType::SequelMany,
            },
            MessagePacketKind::Broadcast => PacketType::Broadcast,
        }
    }

    /// The sender-side packet reference. Broadcasts are not tracked, so they have none.
    pub fn packet_ref(&self) -> Option<PacketRef> {
        match &self.kind {
            MessagePacketKind::Directed { from_message_id, .. } => Some(PacketRef::new(*from_message_id, 0)),
            MessagePacketKind::Sequel { from_message_id, part_index, .. } => Some(PacketRef::new(*from_message_id, *part_index)),
            MessagePacketKind::Broadcast => None,
        }
    }

    pub fn is_addressed_to(&self, member: MemberId) -> bool {
        match &self.kind {
            MessagePacketKind::Directed { destinations, .. } => destinations.iter().any(|(m, _)| *m == member),
            MessagePacketKind::Sequel { destinations, .. } => destinations.contains(member),
            MessagePacketKind::Broadcast => true,
        }
    }

    pub fn destination_count(&self) -> usize {
        match &self.kind {
            MessagePacketKind::Directed { destinations, .. } => destinations.len(),
            MessagePacketKind::Sequel { destinations, .. } => destinations.len(),
            MessagePacketKind::Broadcast => 0,
        }
    }
}

/// Acknowledges received packets, and carries markers that let the recipient detect lost
///  packets before their resend timeout.
///
/// 'from' and 'to' in the marker names are from the point of view of the ack's sender.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AckPacket {
    pub from_id: MemberId,
    pub to_id: MemberId,
    /// `true` if this ack was sent early because the sender detected a gap
    pub is_request: bool,
    /// confirmed packets, message ids relative to the recipient's outgoing window
    pub entries: Vec<TrintPacketRef>,
    /// the newest packet from the recipient that the sender knows of, received or not
    pub newest_from: Option<PacketRef>,
    /// all packets from the recipient up to and including this one were received
    pub contiguous_from: Option<PacketRef>,
    /// the newest packet that the sender sent to the recipient
    pub newest_to: Option<PacketRef>,
    /// The number of entries per ack the sender would like to receive. 0 means no preference.
    pub preferred_ack_size: u16,
}

impl AckPacket {
    pub fn packet_type(&self) -> PacketType {
        if self.is_request {
            PacketType::Request
        }
        else {
            PacketType::Ack
        }
    }
}

/// Probe that is bounced between members to check reachability of a member that stopped
///  acknowledging packets
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiagnosticPacket {
    pub from_id: MemberId,
    pub to_id: MemberId,
    pub time_to_live: u8,
    /// whether the probe was sent to the member's preferred address rather than its
    ///  advertised address
    pub to_preferred_address: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Packet {
    Message(MessagePacket),
    Ack(AckPacket),
    Diagnostic(DiagnosticPacket),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Message(p) => p.packet_type(),
            Packet::Ack(p) => p.packet_type(),
            Packet::Diagnostic(_) => PacketType::Diagnostic,
        }
    }

    pub fn from_id(&self) -> MemberId {
        match self {
            Packet::Message(p) => p.from_id,
            Packet::Ack(p) => p.from_id,
            Packet::Diagnostic(p) => p.from_id,
        }
    }
}
