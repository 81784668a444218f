/// Magic value at the start of every gameplay packet header ("NIFI").
/// A mismatch on dequeue means the reader lost framing.
pub const PACKET_MAGIC: u32 = 0x4946_494E;

/// Magic value of LAN control handshake messages ("LANP").
pub const LAN_MAGIC: u32 = 0x504E_414C;

/// Magic value of discovery beacons ("LAND").
pub const DISCOVERY_MAGIC: u32 = 0x444E_414C;

/// LAN protocol version.
/// Bump this only for breaking changes to control messages or beacons.
pub const PROTOCOL_VERSION: u32 = 1;

/// UDP port discovery beacons are broadcast to.
pub const DISCOVERY_PORT: u16 = 7063;

/// Port the LAN session endpoint listens on.
pub const GAME_PORT: u16 = 7064;

/// Maximum number of instances / players in one session.
pub const MAX_PLAYERS: usize = 16;

/// Fixed gameplay header length in bytes (wire format).
pub const PACKET_HEADER_LEN: usize = 24;

/// Largest payload a sender may enqueue (one 802.11 frame plus metadata).
pub const MAX_FRAME_SIZE: usize = 0x948;

/// Received gameplay payloads are clamped to this many bytes.
pub const MAX_RECV_PAYLOAD: usize = 2048;

/// Size of one per-AID slot in the reply collection buffer.
pub const REPLY_SLOT_SIZE: usize = 1024;

/// Length of the NUL-terminated player name field.
pub const PLAYER_NAME_LEN: usize = 32;

/// Length of the NUL-terminated session name field in beacons.
pub const SESSION_NAME_LEN: usize = 64;
