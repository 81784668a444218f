//! The multiplayer transport interface shared by the shared-memory and LAN
//! implementations.
//!
//! One instance acts as host: it sends a CMD frame with [`MpTransport::send_cmd`]
//! and collects client answers with [`MpTransport::recv_replies`]. Clients
//! wait for CMD frames with [`MpTransport::recv_host_packet`] and answer with
//! [`MpTransport::send_reply`].
//!
//! Only one instance per session may act as host at a time. Nothing here
//! arbitrates between two self-declared hosts; the session setup layer must
//! guarantee it.

use nifi_proto::header::PacketKind;

use crate::error::MpError;
use crate::membership::InstanceId;

/// A frame copied out of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Number of payload bytes written to the caller's buffer.
    pub len: usize,
    pub timestamp: u64,
    pub kind: PacketKind,
}

/// Outcome of [`MpTransport::recv_host_packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRecv {
    Frame(Received),
    /// Nothing arrived before the receive timeout.
    Timeout,
    /// The instance that last sent us a CMD frame has left the session.
    HostGone,
}

pub trait MpTransport: Send + Sync {
    /// Per-frame housekeeping (event servicing, ping refresh).
    fn process(&self) {}

    /// `inst` enters the exchange and starts seeing new traffic.
    fn begin(&self, inst: InstanceId);

    /// `inst` leaves the exchange.
    fn end(&self, inst: InstanceId);

    fn send_packet(&self, inst: InstanceId, data: &[u8], timestamp: u64)
    -> Result<usize, MpError>;

    /// Non-blocking receive of the next frame not sent by `inst`.
    fn recv_packet(&self, inst: InstanceId, buf: &mut [u8]) -> Option<Received>;

    fn send_cmd(&self, inst: InstanceId, data: &[u8], timestamp: u64) -> Result<usize, MpError>;

    fn send_reply(
        &self,
        inst: InstanceId,
        data: &[u8],
        timestamp: u64,
        aid: u16,
    ) -> Result<usize, MpError>;

    fn send_ack(&self, inst: InstanceId, data: &[u8], timestamp: u64) -> Result<usize, MpError>;

    /// Blocking receive (up to the receive timeout) used by clients waiting
    /// for the host's next frame.
    fn recv_host_packet(&self, inst: InstanceId, buf: &mut [u8]) -> HostRecv;

    /// Collect replies to the last CMD frame into `buf`, one
    /// `REPLY_SLOT_SIZE` slot per AID starting at AID 1. Returns the bitmask of
    /// AIDs that replied, which may be partial.
    fn recv_replies(&self, inst: InstanceId, buf: &mut [u8], timestamp: u64, aid_mask: u16)
    -> u16;
}
