//! Wire format of datagrams and the packets inside them.
//!
//! All fixed-width numbers are in network byte order (BE). Datagrams start with a header that
//!  identifies them as belonging to this protocol, followed by one or more self-delimiting
//!  packets:
//!
//! ```ascii
//! 0: magic (u32) - datagrams without it are not protocol traffic
//! 4: protocol version (u8)
//! 5: (repeated) packet:
//!    0: packet type (u8)
//!    1: body length (varint usize)
//!    *: body
//! ```
//!
//! Message packet bodies:
//! ```ascii
//! 0: sender's member id (u16)
//! directed:  from message id (varint u64), part count (varint u32), destinations, payload
//! sequel:    from message id (varint u64), part index (varint u32), destinations, payload
//! broadcast: payload
//! ```
//!
//! Destinations of a directed packet are (member id u16, to-message trint u16) pairs:
//!  a single pair for ONE, a count (u8) followed by pairs for FEW, and a member bitmap followed
//!  by trints in member order for MANY. Sequel destinations are the same without the trints.
//!  A member bitmap is its length in bytes (varint) followed by bytes with bit `i % 8` of byte
//!  `i / 8` set for member `i`.
//!
//! Ack / request body:
//! ```ascii
//! 0: from member id (u16)
//! 2: to member id (u16)
//! 4: flags (u8) - which of the optional markers are present
//! 5: preferred ack size (u16)
//! 7: newest-from marker (optional): message id (varint u64), part index (varint u32)
//! *: contiguous-from marker (optional), same encoding
//! *: newest-to marker (optional), same encoding
//! *: number of entries (varint usize)
//! *: (repeated) message trint (u16), part index (varint u32)
//! ```
//!
//! Diagnostic body:
//! ```ascii
//! 0: from member id (u16)
//! 2: to member id (u16)
//! 4: time to live (u8)
//! 5: flags (u8)
//! ```

use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::TryFromPrimitive;
use crate::member::{MemberId, MemberSet};
use crate::packet::{AckPacket, DiagnosticPacket, MessagePacket, MessagePacketKind, Packet, PacketRef, PacketType, TrintPacketRef};
use crate::safe_converter::PrecheckedCast;

const MAGIC: u32 = 0x4354_5250;
const PROTOCOL_VERSION: u8 = 1;

/// upper bound for the encoded length of any body length this protocol produces
const MAX_BODY_LEN_VARINT: usize = 3;
const MAX_U64_VARINT: usize = 10;
const MAX_U32_VARINT: usize = 5;

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    struct AckFlags: u8 {
        const NEWEST_FROM     = 0b0000_0001;
        const CONTIGUOUS_FROM = 0b0000_0010;
        const NEWEST_TO       = 0b0000_0100;
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    struct DiagnosticFlags: u8 {
        const PREFERRED_ADDRESS = 0b0000_0001;
    }
}

pub struct PacketCodec;

impl PacketCodec {
    pub const DATAGRAM_HEADER_LEN: usize = 5;

    /// Upper bound for the overhead of an ack packet without entries
    pub const ACK_FIXED_LEN: usize = 1 + MAX_BODY_LEN_VARINT + 7 + 3 * (MAX_U64_VARINT + MAX_U32_VARINT) + MAX_BODY_LEN_VARINT;
    /// Upper bound for the encoded length of a single ack entry
    pub const ACK_ENTRY_LEN: usize = 2 + MAX_U32_VARINT;

    pub fn put_datagram_header(buf: &mut impl BufMut) {
        buf.put_u32(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
    }

    /// Checks whether a datagram starts with this protocol's header. Datagrams that don't are
    ///  garbage from some other application, while datagrams that do but fail to decode are
    ///  corrupt.
    pub fn is_protocol_datagram(buf: &[u8]) -> bool {
        let mut buf = buf;
        matches!(buf.try_get_u32(), Ok(MAGIC))
    }

    /// The number of ack entries that fit into a datagram of the given length
    pub fn max_ack_entries(packet_length: usize) -> usize {
        packet_length.saturating_sub(Self::DATAGRAM_HEADER_LEN + Self::ACK_FIXED_LEN) / Self::ACK_ENTRY_LEN
    }

    /// Upper bound for the length of a message packet without its payload
    pub fn message_overhead(packet_type: PacketType, destinations: &MemberSet) -> usize {
        let n = destinations.len();
        let bitmap_len = destinations.max().map_or(0, |m| m.to_raw() as usize / 8 + 1) + MAX_BODY_LEN_VARINT;
        let dest_len = match packet_type {
            PacketType::DirectedOne => 4,
            PacketType::DirectedFew => 1 + 4*n,
            PacketType::DirectedMany => bitmap_len + 2*n,
            PacketType::SequelOne => 2,
            PacketType::SequelFew => 1 + 2*n,
            PacketType::SequelMany => bitmap_len,
            _ => 0,
        };
        1 + MAX_BODY_LEN_VARINT + 2 + MAX_U64_VARINT + MAX_U32_VARINT + dest_len
    }

    /// Serializes a single packet, appending it to a buffer
    pub fn ser(packet: &Packet, buf: &mut impl BufMut) {
        let mut body = BytesMut::with_capacity(64);
        let payload: &[u8] = match packet {
            Packet::Message(p) => {
                Self::ser_message_header(p, &mut body);
                &p.payload
            }
            Packet::Ack(p) => {
                Self::ser_ack(p, &mut body);
                &[]
            }
            Packet::Diagnostic(p) => {
                Self::ser_diagnostic(p, &mut body);
                &[]
            }
        };

        buf.put_u8(packet.packet_type().into());
        buf.put_usize_varint(body.len() + payload.len());
        buf.put_slice(&body);
        buf.put_slice(payload);
    }

    pub fn encode(packet: &Packet) -> Bytes {
        let mut buf = BytesMut::new();
        Self::ser(packet, &mut buf);
        buf.freeze()
    }

    /// Decodes all packets in a datagram, including the datagram header. Payloads are copied,
    ///  so the buffer can be reused right away.
    pub fn decode_datagram(buf: &[u8]) -> anyhow::Result<Vec<Packet>> {
        let mut buf = buf;
        if buf.try_get_u32()? != MAGIC {
            bail!("not a protocol datagram");
        }
        let version = buf.try_get_u8()?;
        if version != PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", version);
        }

        let mut result = Vec::new();
        while buf.has_remaining() {
            result.push(Self::deser(&mut buf)?);
        }
        if result.is_empty() {
            bail!("datagram contains no packets");
        }
        Ok(result)
    }

    /// Deserializes a single packet, advancing the buffer past it
    pub fn deser(buf: &mut &[u8]) -> anyhow::Result<Packet> {
        let packet_type = PacketType::try_from_primitive(buf.try_get_u8()?)?;
        let body_len = buf.try_get_usize_varint()?;
        if body_len > buf.len() {
            bail!("packet body length {} exceeds remaining {} bytes", body_len, buf.len());
        }
        let remaining: &[u8] = *buf;
        let (mut body, rest) = remaining.split_at(body_len);
        *buf = rest;

        let packet = match packet_type {
            PacketType::Ack | PacketType::Request => Packet::Ack(Self::deser_ack(packet_type == PacketType::Request, &mut body)?),
            PacketType::Diagnostic => Packet::Diagnostic(Self::deser_diagnostic(&mut body)?),
            _ => return Ok(Packet::Message(Self::deser_message(packet_type, body)?)),
        };
        if body.has_remaining() {
            bail!("{} bytes of trailing data in {:?} packet", body.remaining(), packet_type);
        }
        Ok(packet)
    }

    fn ser_message_header(packet: &MessagePacket, buf: &mut BytesMut) {
        buf.put_u16(packet.from_id.to_raw());

        let packet_type = packet.packet_type();
        match &packet.kind {
            MessagePacketKind::Directed { from_message_id, part_count, destinations } => {
                buf.put_u64_varint(*from_message_id);
                buf.put_u32_varint(*part_count);
                match packet_type {
                    PacketType::DirectedOne | PacketType::DirectedFew => {
                        if packet_type == PacketType::DirectedFew {
                            buf.put_u8(destinations.len().prechecked_cast());
                        }
                        for (member, trint) in destinations {
                            buf.put_u16(member.to_raw());
                            buf.put_u16(*trint);
                        }
                    }
                    _ => {
                        Self::ser_bitmap(destinations.iter().map(|(m, _)| *m), buf);
                        for (_, trint) in destinations {
                            buf.put_u16(*trint);
                        }
                    }
                }
            }
            MessagePacketKind::Sequel { from_message_id, part_index, destinations } => {
                buf.put_u64_varint(*from_message_id);
                buf.put_u32_varint(*part_index);
                match packet_type {
                    PacketType::SequelOne | PacketType::SequelFew => {
                        if packet_type == PacketType::SequelFew {
                            buf.put_u8(destinations.len().prechecked_cast());
                        }
                        for member in destinations.iter() {
                            buf.put_u16(member.to_raw());
                        }
                    }
                    _ => Self::ser_bitmap(destinations.iter(), buf),
                }
            }
            MessagePacketKind::Broadcast => {}
        }
    }

    fn deser_message(packet_type: PacketType, mut buf: &[u8]) -> anyhow::Result<MessagePacket> {
        let from_id = MemberId::from_raw(buf.try_get_u16()?);

        let kind = match packet_type {
            PacketType::DirectedOne | PacketType::DirectedFew | PacketType::DirectedMany => {
                let from_message_id = buf.try_get_u64_varint()?;
                let part_count = buf.try_get_u32_varint()?;
                if part_count == 0 {
                    bail!("message with zero parts");
                }
                let destinations = match packet_type {
                    PacketType::DirectedMany => {
                        let members = Self::deser_bitmap(&mut buf)?;
                        let mut destinations = Vec::with_capacity(members.len());
                        for member in members.iter() {
                            destinations.push((member, buf.try_get_u16()?));
                        }
                        destinations
                    }
                    _ => {
                        let n = if packet_type == PacketType::DirectedFew { buf.try_get_u8()? as usize } else { 1 };
                        let mut destinations = Vec::with_capacity(n);
                        for _ in 0..n {
                            destinations.push((MemberId::from_raw(buf.try_get_u16()?), buf.try_get_u16()?));
                        }
                        destinations
                    }
                };
                MessagePacketKind::Directed { from_message_id, part_count, destinations }
            }
            PacketType::SequelOne | PacketType::SequelFew | PacketType::SequelMany => {
                let from_message_id = buf.try_get_u64_varint()?;
                let part_index = buf.try_get_u32_varint()?;
                if part_index == 0 {
                    bail!("sequel packet with part index 0");
                }
                let destinations = match packet_type {
                    PacketType::SequelMany => Self::deser_bitmap(&mut buf)?,
                    _ => {
                        let n = if packet_type == PacketType::SequelFew { buf.try_get_u8()? as usize } else { 1 };
                        let mut destinations = MemberSet::new();
                        for _ in 0..n {
                            destinations.insert(MemberId::from_raw(buf.try_get_u16()?));
                        }
                        destinations
                    }
                };
                MessagePacketKind::Sequel { from_message_id, part_index, destinations }
            }
            PacketType::Broadcast => MessagePacketKind::Broadcast,
            other => return Err(anyhow!("{:?} is not a message packet type", other)),
        };

        Ok(MessagePacket {
            from_id,
            kind,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    fn ser_bitmap(members: impl Iterator<Item=MemberId> + Clone, buf: &mut BytesMut) {
        let len = members.clone()
            .map(|m| m.to_raw() as usize / 8 + 1)
            .max()
            .unwrap_or(0);
        buf.put_usize_varint(len);

        let offset = buf.len();
        buf.put_bytes(0, len);
        for m in members {
            let raw = m.to_raw() as usize;
            buf[offset + raw / 8] |= 1 << (raw % 8);
        }
    }

    fn deser_bitmap(buf: &mut &[u8]) -> anyhow::Result<MemberSet> {
        let len = buf.try_get_usize_varint()?;
        if len > buf.len() || len > (u16::MAX as usize) / 8 + 1 {
            bail!("invalid member bitmap length {}", len);
        }

        let mut result = MemberSet::new();
        for byte_index in 0..len {
            let b = buf.try_get_u8()?;
            for bit in 0..8 {
                if b & (1 << bit) != 0 {
                    result.insert(MemberId::from_raw((byte_index * 8 + bit).prechecked_cast()));
                }
            }
        }
        Ok(result)
    }

    fn ser_ack(packet: &AckPacket, buf: &mut BytesMut) {
        buf.put_u16(packet.from_id.to_raw());
        buf.put_u16(packet.to_id.to_raw());

        let mut flags = AckFlags::empty();
        flags.set(AckFlags::NEWEST_FROM, packet.newest_from.is_some());
        flags.set(AckFlags::CONTIGUOUS_FROM, packet.contiguous_from.is_some());
        flags.set(AckFlags::NEWEST_TO, packet.newest_to.is_some());
        buf.put_u8(flags.bits());

        buf.put_u16(packet.preferred_ack_size);

        for marker in [packet.newest_from, packet.contiguous_from, packet.newest_to].into_iter().flatten() {
            buf.put_u64_varint(marker.message_id);
            buf.put_u32_varint(marker.part_index);
        }

        buf.put_usize_varint(packet.entries.len());
        for entry in &packet.entries {
            buf.put_u16(entry.message_trint);
            buf.put_u32_varint(entry.part_index);
        }
    }

    fn deser_ack(is_request: bool, buf: &mut &[u8]) -> anyhow::Result<AckPacket> {
        let from_id = MemberId::from_raw(buf.try_get_u16()?);
        let to_id = MemberId::from_raw(buf.try_get_u16()?);
        let flags = AckFlags::from_bits(buf.try_get_u8()?)
            .ok_or_else(|| anyhow!("invalid ack flags"))?;
        let preferred_ack_size = buf.try_get_u16()?;

        let mut get_marker = |flag: AckFlags| -> anyhow::Result<Option<PacketRef>> {
            if flags.contains(flag) {
                Ok(Some(PacketRef::new(buf.try_get_u64_varint()?, buf.try_get_u32_varint()?)))
            }
            else {
                Ok(None)
            }
        };
        let newest_from = get_marker(AckFlags::NEWEST_FROM)?;
        let contiguous_from = get_marker(AckFlags::CONTIGUOUS_FROM)?;
        let newest_to = get_marker(AckFlags::NEWEST_TO)?;

        let num_entries = buf.try_get_usize_varint()?;
        if num_entries > buf.len() / 3 {
            bail!("ack with {} entries exceeds packet length", num_entries);
        }
        let mut entries = Vec::with_capacity(num_entries);
        for _ in 0..num_entries {
            entries.push(TrintPacketRef {
                message_trint: buf.try_get_u16()?,
                part_index: buf.try_get_u32_varint()?,
            });
        }

        Ok(AckPacket {
            from_id,
            to_id,
            is_request,
            entries,
            newest_from,
            contiguous_from,
            newest_to,
            preferred_ack_size,
        })
    }

    fn ser_diagnostic(packet: &DiagnosticPacket, buf: &mut BytesMut) {
        buf.put_u16(packet.from_id.to_raw());
        buf.put_u16(packet.to_id.to_raw());
        buf.put_u8(packet.time_to_live);

        let mut flags = DiagnosticFlags::empty();
        flags.set(DiagnosticFlags::PREFERRED_ADDRESS, packet.to_preferred_address);
        buf.put_u8(flags.bits());
    }

    fn deser_diagnostic(buf: &mut &[u8]) -> anyhow::Result<DiagnosticPacket> {
        let from_id = MemberId::from_raw(buf.try_get_u16()?);
        let to_id = MemberId::from_raw(buf.try_get_u16()?);
        let time_to_live = buf.try_get_u8()?;
        let flags = DiagnosticFlags::from_bits(buf.try_get_u8()?)
            .ok_or_else(|| anyhow!("invalid diagnostic flags"))?;

        Ok(DiagnosticPacket {
            from_id,
            to_id,
            time_to_live,
            to_preferred_address: flags.contains(DiagnosticFlags::PREFERRED_ADDRESS),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn m(id: u16) -> MemberId {
        MemberId::from_raw(id)
    }

    fn directed(destinations: Vec<(MemberId, u16)>) -> Packet {
        Packet::Message(MessagePacket {
            from_id: m(1),
            kind: MessagePacketKind::Directed {
                from_message_id: 300,
                part_count: 3,
                destinations,
            },
            payload: Bytes::from_static(b"hello"),
        })
    }

    fn sequel(destinations: &[u16]) -> Packet {
        Packet::Message(MessagePacket {
            from_id: m(1),
            kind: MessagePacketKind::Sequel {
                from_message_id: 1 << 40,
                part_index: 2,
                destinations: destinations.iter().map(|&id| m(id)).collect(),
            },
            payload: Bytes::from_static(b"world"),
        })
    }

    fn datagram(packets: &[Packet]) -> BytesMut {
        let mut buf = BytesMut::new();
        PacketCodec::put_datagram_header(&mut buf);
        for p in packets {
            PacketCodec::ser(p, &mut buf);
        }
        buf
    }

    #[rstest]
    #[case::directed_one(directed(vec![(m(2), 7)]))]
    #[case::directed_few(directed(vec![(m(2), 7), (m(3), 65535), (m(9), 0)]))]
    #[case::directed_few_at_limit(directed((2..34).map(|id| (m(id), id * 3)).collect()))]
    #[case::directed_many(directed((2..60).map(|id| (m(id), id * 3)).collect()))]
    #[case::sequel_one(sequel(&[2]))]
    #[case::sequel_few(sequel(&[2, 4, 1000]))]
    #[case::sequel_few_at_limit(sequel(&(2..34).collect::<Vec<_>>()))]
    #[case::sequel_many(sequel(&(2..100).collect::<Vec<_>>()))]
    #[case::broadcast(Packet::Message(MessagePacket { from_id: m(4), kind: MessagePacketKind::Broadcast, payload: Bytes::from_static(b"all") }))]
    #[case::ack_empty(Packet::Ack(AckPacket { from_id: m(2), to_id: m(1), is_request: false, entries: vec![], newest_from: None, contiguous_from: None, newest_to: None, preferred_ack_size: 0 }))]
    #[case::ack(Packet::Ack(AckPacket {
        from_id: m(2),
        to_id: m(1),
        is_request: false,
        entries: vec![TrintPacketRef { message_trint: 3, part_index: 0 }, TrintPacketRef { message_trint: 3, part_index: 1000 }],
        newest_from: Some(PacketRef::new(5, 1)),
        contiguous_from: None,
        newest_to: Some(PacketRef::new(1 << 33, 0)),
        preferred_ack_size: 180,
    }))]
    #[case::request(Packet::Ack(AckPacket { from_id: m(2), to_id: m(1), is_request: true, entries: vec![], newest_from: Some(PacketRef::new(9, 0)), contiguous_from: Some(PacketRef::new(7, 2)), newest_to: None, preferred_ack_size: 1 }))]
    #[case::diagnostic(Packet::Diagnostic(DiagnosticPacket { from_id: m(1), to_id: m(2), time_to_live: 2, to_preferred_address: true }))]
    fn test_ser_deser(#[case] packet: Packet) {
        let buf = datagram(&[packet.clone()]);
        assert!(PacketCodec::is_protocol_datagram(&buf));
        assert_eq!(PacketCodec::decode_datagram(&buf).unwrap(), vec![packet]);
    }

    #[test]
    fn test_bundled_packets() {
        let packets = vec![
            directed(vec![(m(2), 7)]),
            sequel(&[2]),
            Packet::Diagnostic(DiagnosticPacket { from_id: m(1), to_id: m(2), time_to_live: 0, to_preferred_address: false }),
        ];
        let buf = datagram(&packets);
        assert_eq!(PacketCodec::decode_datagram(&buf).unwrap(), packets);
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::short(b"CT")]
    #[case::other_protocol(b"GET / HTTP/1.1")]
    fn test_garbage(#[case] buf: &[u8]) {
        assert!(!PacketCodec::is_protocol_datagram(buf));
        assert!(PacketCodec::decode_datagram(buf).is_err());
    }

    #[rstest]
    #[case::no_packets(0)]
    #[case::truncated_type(6)]
    #[case::truncated_body(10)]
    fn test_truncated(#[case] len: usize) {
        let buf = datagram(&[directed(vec![(m(2), 7)])]);
        let buf = if len == 0 { &buf[..5] } else { &buf[..len] };
        assert!(PacketCodec::is_protocol_datagram(buf));
        assert!(PacketCodec::decode_datagram(buf).is_err());
    }

    #[test]
    fn test_wrong_version() {
        let mut buf = datagram(&[directed(vec![(m(2), 7)])]);
        buf[4] = 99;
        assert!(PacketCodec::decode_datagram(&buf).is_err());
    }

    #[test]
    fn test_unknown_packet_type() {
        let mut buf = datagram(&[directed(vec![(m(2), 7)])]);
        buf[5] = 200;
        assert!(PacketCodec::decode_datagram(&buf).is_err());
    }

    #[rstest]
    #[case::one(vec![5])]
    #[case::few(vec![5, 6, 7])]
    #[case::many((1..200).collect())]
    fn test_message_overhead_is_upper_bound(#[case] ids: Vec<u16>) {
        let members: MemberSet = ids.iter().map(|&id| m(id)).collect();
        let packet = MessagePacket {
            from_id: m(1),
            kind: MessagePacketKind::Sequel { from_message_id: u64::MAX, part_index: u32::MAX, destinations: members.clone() },
            payload: Bytes::new(),
        };
        let encoded = PacketCodec::encode(&Packet::Message(packet.clone()));
        assert!(encoded.len() <= PacketCodec::message_overhead(packet.packet_type(), &members));

        let packet = MessagePacket {
            from_id: m(1),
            kind: MessagePacketKind::Directed { from_message_id: u64::MAX, part_count: u32::MAX, destinations: members.iter().map(|m| (m, 1)).collect() },
            payload: Bytes::new(),
        };
        let encoded = PacketCodec::encode(&Packet::Message(packet.clone()));
        assert!(encoded.len() <= PacketCodec::message_overhead(packet.packet_type(), &members));
    }

    #[test]
    fn test_max_ack_entries_fit() {
        let n = PacketCodec::max_ack_entries(1452);
        assert!(n > 100);

        let ack = Packet::Ack(AckPacket {
            from_id: m(2),
            to_id: m(1),
            is_request: false,
            entries: (0..n).map(|i| TrintPacketRef { message_trint: i as u16, part_index: u32::MAX }).collect(),
            newest_from: Some(PacketRef::new(u64::MAX, u32::MAX)),
            contiguous_from: Some(PacketRef::new(u64::MAX, u32::MAX)),
            newest_to: Some(PacketRef::new(u64::MAX, u32::MAX)),
            preferred_ack_size: 0,
        });
        assert!(PacketCodec::encode(&ack).len() + PacketCodec::DATAGRAM_HEADER_LEN <= 1452);
    }
}
