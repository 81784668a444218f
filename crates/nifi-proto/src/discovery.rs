use crate::{
    constants::{DISCOVERY_MAGIC, MAX_PLAYERS, SESSION_NAME_LEN},
    control::{decode_name, encode_name},
    error::ProtoError,
    header::read_u32_le,
};

/// Beacon status: session is waiting in the lobby.
pub const STATUS_IDLE: u8 = 0;
/// Beacon status: the host has entered the lockstep exchange.
pub const STATUS_PLAYING: u8 = 1;

/// Session advertisement broadcast by a host.
///
/// Offsets (bytes, little-endian):
/// - 0..4   magic (`DISCOVERY_MAGIC`)
/// - 4..8   version
/// - 8..12  tick (sender's millisecond clock)
/// - 12..76 session name (NUL-terminated)
/// - 76     num_players
/// - 77     max_players
/// - 78     status
/// - 79     padding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryBeacon {
    pub version: u32,
    pub tick: u32,
    pub session_name: String,
    pub num_players: u8,
    pub max_players: u8,
    pub status: u8,
}

impl DiscoveryBeacon {
    pub const LEN: usize = 80;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&DISCOVERY_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.tick.to_le_bytes());
        out[12..12 + SESSION_NAME_LEN]
            .copy_from_slice(&encode_name::<SESSION_NAME_LEN>(&self.session_name));
        out[76] = self.num_players;
        out[77] = self.max_players;
        out[78] = self.status;
        out
    }

    /// Decode a datagram. Short datagrams and foreign magic are rejected;
    /// semantic checks live in [`DiscoveryBeacon::validate`].
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < Self::LEN {
            return Err(ProtoError::TooShort);
        }
        let magic = read_u32_le(buf, 0)?;
        if magic != DISCOVERY_MAGIC {
            return Err(ProtoError::BadMagic(magic));
        }
        Ok(Self {
            version: read_u32_le(buf, 4)?,
            tick: read_u32_le(buf, 8)?,
            session_name: decode_name(&buf[12..12 + SESSION_NAME_LEN]),
            num_players: buf[76],
            max_players: buf[77],
            status: buf[78],
        })
    }

    pub fn validate(&self, version: u32) -> Result<(), ProtoError> {
        if self.version != version {
            return Err(ProtoError::UnsupportedVersion(self.version));
        }
        if self.max_players as usize > MAX_PLAYERS {
            return Err(ProtoError::OutOfRange("max_players"));
        }
        if self.num_players > self.max_players {
            return Err(ProtoError::OutOfRange("num_players"));
        }
        Ok(())
    }
}
