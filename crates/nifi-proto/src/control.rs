//! LAN control-channel messages.
//!
//! Every message starts with a one-byte opcode. Handshake messages carry the
//! LAN magic and protocol version so mismatched peers can be dropped early.
//! Layouts are fixed; integers are little-endian.

use std::net::Ipv4Addr;

use strum::FromRepr;

use crate::{
    constants::{LAN_MAGIC, MAX_PLAYERS, PLAYER_NAME_LEN},
    error::ProtoError,
    header::{read_u16_le, read_u32_le},
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum Opcode {
    /// host -> client: assign an ID to a new client.
    ClientInit = 1,
    /// client -> host: the client's player record.
    PlayerInfo = 2,
    /// host -> clients: the full player table.
    PlayerList = 3,
    /// both: sender entered the lockstep exchange.
    PlayerConnect = 4,
    /// both: sender left the lockstep exchange.
    PlayerDisconnect = 5,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromRepr)]
pub enum PlayerStatus {
    /// Empty slot.
    #[default]
    None = 0,
    Client = 1,
    Host = 2,
    /// Slot assigned, identity exchange still pending.
    Connecting = 3,
    Disconnected = 4,
}

/// One entry of the player table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub id: u32,
    pub name: String,
    pub status: PlayerStatus,
    pub address: Ipv4Addr,
    /// Port of the player's session endpoint, used for direct peer connections.
    pub port: u16,
    pub is_local: bool,
    /// Round-trip time in milliseconds.
    pub ping: u32,
}

impl Default for PlayerRecord {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            status: PlayerStatus::None,
            address: Ipv4Addr::UNSPECIFIED,
            port: 0,
            is_local: false,
            ping: 0,
        }
    }
}

impl PlayerRecord {
    /// Encoded size in bytes.
    ///
    /// Offsets:
    /// - 0..4   id (u32)
    /// - 4..36  name (NUL-terminated, at most 31 bytes of text)
    /// - 36..40 status (u32)
    /// - 40..44 address (IPv4 as u32)
    /// - 44..46 port (u16)
    /// - 46     is_local
    /// - 47     reserved
    /// - 48..52 ping (u32)
    pub const LEN: usize = 52;

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&encode_name::<PLAYER_NAME_LEN>(&self.name));
        out.extend_from_slice(&(self.status as u32).to_le_bytes());
        out.extend_from_slice(&u32::from(self.address).to_le_bytes());
        out.extend_from_slice(&self.port.to_le_bytes());
        out.push(u8::from(self.is_local));
        out.push(0);
        out.extend_from_slice(&self.ping.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < Self::LEN {
            return Err(ProtoError::TooShort);
        }
        let status = read_u32_le(buf, 36)?;
        Ok(Self {
            id: read_u32_le(buf, 0)?,
            name: decode_name(&buf[4..4 + PLAYER_NAME_LEN]),
            status: PlayerStatus::from_repr(status).ok_or(ProtoError::OutOfRange("status"))?,
            address: Ipv4Addr::from(read_u32_le(buf, 40)?),
            port: read_u16_le(buf, 44)?,
            is_local: buf[46] != 0,
            ping: read_u32_le(buf, 48)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    ClientInit {
        version: u32,
        assigned_id: u8,
        max_players: u8,
    },
    PlayerInfo {
        version: u32,
        player: PlayerRecord,
    },
    /// `players` always holds `MAX_PLAYERS` entries, empty slots included.
    PlayerList {
        num_players: u8,
        players: Vec<PlayerRecord>,
    },
    PlayerConnect,
    PlayerDisconnect,
}

impl ControlMessage {
    pub const CLIENT_INIT_LEN: usize = 11;
    pub const PLAYER_INFO_LEN: usize = 9 + PlayerRecord::LEN;
    pub const PLAYER_LIST_LEN: usize = 2 + PlayerRecord::LEN * MAX_PLAYERS;

    pub fn opcode(&self) -> Opcode {
        match self {
            ControlMessage::ClientInit { .. } => Opcode::ClientInit,
            ControlMessage::PlayerInfo { .. } => Opcode::PlayerInfo,
            ControlMessage::PlayerList { .. } => Opcode::PlayerList,
            ControlMessage::PlayerConnect => Opcode::PlayerConnect,
            ControlMessage::PlayerDisconnect => Opcode::PlayerDisconnect,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.opcode() as u8];
        match self {
            ControlMessage::ClientInit {
                version,
                assigned_id,
                max_players,
            } => {
                out.extend_from_slice(&LAN_MAGIC.to_le_bytes());
                out.extend_from_slice(&version.to_le_bytes());
                out.push(*assigned_id);
                out.push(*max_players);
            }
            ControlMessage::PlayerInfo { version, player } => {
                out.extend_from_slice(&LAN_MAGIC.to_le_bytes());
                out.extend_from_slice(&version.to_le_bytes());
                player.encode_into(&mut out);
            }
            ControlMessage::PlayerList {
                num_players,
                players,
            } => {
                out.push(*num_players);
                let empty = PlayerRecord::default();
                for i in 0..MAX_PLAYERS {
                    players.get(i).unwrap_or(&empty).encode_into(&mut out);
                }
            }
            ControlMessage::PlayerConnect | ControlMessage::PlayerDisconnect => {}
        }
        out
    }

    /// Decode one control message. Lengths must match exactly; handshake
    /// messages with a foreign magic are rejected with `BadMagic`.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let (&op, body) = buf.split_first().ok_or(ProtoError::Empty)?;
        let opcode = Opcode::from_repr(op).ok_or(ProtoError::UnknownOpcode(op))?;

        let expected = match opcode {
            Opcode::ClientInit => Self::CLIENT_INIT_LEN,
            Opcode::PlayerInfo => Self::PLAYER_INFO_LEN,
            Opcode::PlayerList => Self::PLAYER_LIST_LEN,
            Opcode::PlayerConnect | Opcode::PlayerDisconnect => 1,
        };
        if buf.len() != expected {
            return Err(ProtoError::LengthMismatch {
                expected,
                actual: buf.len(),
            });
        }

        match opcode {
            Opcode::ClientInit => {
                let version = read_handshake_prefix(body)?;
                Ok(ControlMessage::ClientInit {
                    version,
                    assigned_id: body[8],
                    max_players: body[9],
                })
            }
            Opcode::PlayerInfo => {
                let version = read_handshake_prefix(body)?;
                Ok(ControlMessage::PlayerInfo {
                    version,
                    player: PlayerRecord::decode(&body[8..])?,
                })
            }
            Opcode::PlayerList => {
                let num_players = body[0];
                if num_players as usize > MAX_PLAYERS {
                    return Err(ProtoError::OutOfRange("num_players"));
                }
                let players = body[1..]
                    .chunks_exact(PlayerRecord::LEN)
                    .map(PlayerRecord::decode)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ControlMessage::PlayerList {
                    num_players,
                    players,
                })
            }
            Opcode::PlayerConnect => Ok(ControlMessage::PlayerConnect),
            Opcode::PlayerDisconnect => Ok(ControlMessage::PlayerDisconnect),
        }
    }
}

fn read_handshake_prefix(body: &[u8]) -> Result<u32, ProtoError> {
    let magic = read_u32_le(body, 0)?;
    if magic != LAN_MAGIC {
        return Err(ProtoError::BadMagic(magic));
    }
    read_u32_le(body, 4)
}

/// Encode `name` as a fixed NUL-terminated field, truncating on a char
/// boundary so at least one NUL remains.
pub(crate) fn encode_name<const N: usize>(name: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let mut end = name.len().min(N - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    out[..end].copy_from_slice(&name.as_bytes()[..end]);
    out
}

pub(crate) fn decode_name(field: &[u8]) -> String {
    let end = field
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(field.len().saturating_sub(1));
    String::from_utf8_lossy(&field[..end]).into_owned()
}
