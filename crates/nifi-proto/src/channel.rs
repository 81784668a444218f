/// Logical channels multiplexed over one peer connection.
///
/// - `Control`: handshake and membership messages (reliable, ordered).
/// - `Mp`: gameplay frames (unsequenced; reliable fallback for frames that
///   exceed the datagram size).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr)]
pub enum ChannelKind {
    Control = 0,
    Mp = 1,
}
