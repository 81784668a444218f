use crate::{
    constants::{PACKET_HEADER_LEN, PACKET_MAGIC},
    error::ProtoError,
};

/// Logical packet type carried in the header's `Type` field.
///
/// On the wire this is a single `u32`: the low 16 bits hold the type
/// (0 = data, 1 = command, 2 = reply, 3 = ack) and, for replies, the high
/// 16 bits hold the replying client's assigned ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Regular data frame.
    Data,
    /// Host CMD frame that every connected client must answer.
    Command,
    /// Client reply to a CMD frame, tagged with the client's AID.
    Reply { aid: u16 },
    /// Host acknowledgement frame.
    Ack,
}

impl PacketKind {
    pub const fn to_raw(self) -> u32 {
        match self {
            PacketKind::Data => 0,
            PacketKind::Command => 1,
            PacketKind::Reply { aid } => 2 | ((aid as u32) << 16),
            PacketKind::Ack => 3,
        }
    }

    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw & 0xFFFF {
            0 => Some(PacketKind::Data),
            1 => Some(PacketKind::Command),
            2 => Some(PacketKind::Reply {
                aid: (raw >> 16) as u16,
            }),
            3 => Some(PacketKind::Ack),
            _ => None,
        }
    }

    /// Replies travel on their own queue/channel so they never wait behind
    /// regular traffic.
    pub const fn is_reply(self) -> bool {
        matches!(self, PacketKind::Reply { .. })
    }
}

/// Gameplay packet header (wire format).
///
/// Encoding rules:
/// - Fixed size: exactly `PACKET_HEADER_LEN` bytes.
/// - Integer fields are little-endian.
///
/// Offsets (bytes):
/// - 0..4   magic (`PACKET_MAGIC`)
/// - 4..8   sender_id (u32 LE)
/// - 8..12  type (u32 LE, see [`PacketKind`])
/// - 12..16 length (u32 LE)
/// - 16..24 timestamp (u64 LE)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Instance/player ID of the sender.
    pub sender_id: u32,
    pub kind: PacketKind,
    /// Payload length in bytes following the header.
    pub length: u32,
    /// Caller-supplied logical frame counter.
    pub timestamp: u64,
}

impl PacketHeader {
    pub const LEN: usize = PACKET_HEADER_LEN;

    pub fn new(sender_id: u32, kind: PacketKind, length: u32, timestamp: u64) -> Self {
        Self {
            sender_id,
            kind,
            length,
            timestamp,
        }
    }

    pub fn encode(&self) -> [u8; PACKET_HEADER_LEN] {
        let mut out = [0u8; PACKET_HEADER_LEN];
        out[0..4].copy_from_slice(&PACKET_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.sender_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.kind.to_raw().to_le_bytes());
        out[12..16].copy_from_slice(&self.length.to_le_bytes());
        out[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    /// Decode a header from the first `PACKET_HEADER_LEN` bytes of `buf`.
    ///
    /// The magic is checked before anything else so a desynchronized reader
    /// never trusts `length`. An unknown type still reports the length so the
    /// caller can skip the payload.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < PACKET_HEADER_LEN {
            return Err(ProtoError::TooShort);
        }

        let magic = read_u32_le(buf, 0)?;
        if magic != PACKET_MAGIC {
            return Err(ProtoError::BadMagic(magic));
        }

        let sender_id = read_u32_le(buf, 4)?;
        let raw_type = read_u32_le(buf, 8)?;
        let length = read_u32_le(buf, 12)?;
        let timestamp = read_u64_le(buf, 16)?;

        let kind = PacketKind::from_raw(raw_type).ok_or(ProtoError::UnknownPacketType {
            raw: raw_type,
            len: length,
        })?;

        Ok(Self {
            sender_id,
            kind,
            length,
            timestamp,
        })
    }

    /// Encode `[Header][Payload]` into one buffer (one datagram / message).
    pub fn encode_packet(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_HEADER_LEN + payload.len());
        out.extend_from_slice(&self.encode());
        out.extend_from_slice(payload);
        out
    }
}

/// Decode a buffer holding a whole `[Header][Payload]` packet.
///
/// Trailing bytes past `length` are ignored; a buffer shorter than the
/// declared length is rejected.
pub fn decode_packet(buf: &[u8]) -> Result<(PacketHeader, &[u8]), ProtoError> {
    let header = PacketHeader::decode(buf)?;
    let body = &buf[PACKET_HEADER_LEN..];
    let len = header.length as usize;
    if body.len() < len {
        return Err(ProtoError::LengthMismatch {
            expected: len,
            actual: body.len(),
        });
    }
    Ok((header, &body[..len]))
}

pub(crate) fn read_u32_le(buf: &[u8], start: usize) -> Result<u32, ProtoError> {
    let bytes: [u8; 4] = buf
        .get(start..start + 4)
        .ok_or(ProtoError::TooShort)?
        .try_into()
        .map_err(|_| ProtoError::TooShort)?;
    Ok(u32::from_le_bytes(bytes))
}

pub(crate) fn read_u16_le(buf: &[u8], start: usize) -> Result<u16, ProtoError> {
    let bytes: [u8; 2] = buf
        .get(start..start + 2)
        .ok_or(ProtoError::TooShort)?
        .try_into()
        .map_err(|_| ProtoError::TooShort)?;
    Ok(u16::from_le_bytes(bytes))
}

fn read_u64_le(buf: &[u8], start: usize) -> Result<u64, ProtoError> {
    let bytes: [u8; 8] = buf
        .get(start..start + 8)
        .ok_or(ProtoError::TooShort)?
        .try_into()
        .map_err(|_| ProtoError::TooShort)?;
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_len_is_locked() {
        assert_eq!(PacketHeader::LEN, 24);
    }

    #[test]
    fn header_encode_offsets_are_locked() {
        let h = PacketHeader::new(3, PacketKind::Reply { aid: 5 }, 0x1234, 0x0102_0304_0506_0708);
        let buf = h.encode();

        assert_eq!(&buf[0..4], b"NIFI");
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), 3);
        assert_eq!(
            u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            2 | (5 << 16)
        );
        assert_eq!(u32::from_le_bytes(buf[12..16].try_into().unwrap()), 0x1234);
        assert_eq!(
            u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            0x0102_0304_0506_0708
        );
    }

    #[test]
    fn bad_magic_is_rejected_before_length() {
        let mut buf = PacketHeader::new(1, PacketKind::Data, 8, 0).encode();
        buf[0] ^= 0xFF;
        assert!(matches!(
            PacketHeader::decode(&buf),
            Err(ProtoError::BadMagic(_))
        ));
    }

    #[test]
    fn unknown_type_reports_length() {
        let mut buf = PacketHeader::new(1, PacketKind::Data, 77, 0).encode();
        buf[8..12].copy_from_slice(&9u32.to_le_bytes());
        assert_eq!(
            PacketHeader::decode(&buf),
            Err(ProtoError::UnknownPacketType { raw: 9, len: 77 })
        );
    }

    #[test]
    fn packet_kind_raw_values() {
        assert_eq!(PacketKind::Data.to_raw(), 0);
        assert_eq!(PacketKind::Command.to_raw(), 1);
        assert_eq!(PacketKind::Ack.to_raw(), 3);
        assert_eq!(
            PacketKind::from_raw(0x0003_0002),
            Some(PacketKind::Reply { aid: 3 })
        );
        assert_eq!(PacketKind::from_raw(4), None);
    }

    #[test]
    fn short_packet_body_is_rejected() {
        let h = PacketHeader::new(0, PacketKind::Command, 4, 10);
        let mut pkt = h.encode_packet(&[1, 2, 3, 4]);
        pkt.pop();
        assert!(matches!(
            decode_packet(&pkt),
            Err(ProtoError::LengthMismatch { .. })
        ));
    }

    proptest! {
        #[test]
        fn packet_round_trip(
            sender in 0u32..16,
            kind in 0u32..4,
            aid in 1u16..16,
            timestamp in any::<u64>(),
            payload in proptest::collection::vec(any::<u8>(), 0..crate::constants::MAX_FRAME_SIZE),
        ) {
            let kind = match kind {
                0 => PacketKind::Data,
                1 => PacketKind::Command,
                2 => PacketKind::Reply { aid },
                _ => PacketKind::Ack,
            };
            let header = PacketHeader::new(sender, kind, payload.len() as u32, timestamp);
            let bytes = header.encode_packet(&payload);

            let (decoded, body) = decode_packet(&bytes).unwrap();
            prop_assert_eq!(decoded, header);
            prop_assert_eq!(body, &payload[..]);
        }
    }
}
