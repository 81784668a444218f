//! Wire formats for DS local-wireless multiplayer exchange.
//!
//! - [`header`]: gameplay packet header shared by both transports
//! - [`control`]: LAN control-channel messages (handshake, player table)
//! - [`discovery`]: LAN session beacons

pub mod channel;
pub mod constants;
pub mod control;
pub mod discovery;
pub mod error;
pub mod header;
