//! Multiplayer packet exchange between DS emulator instances.
//!
//! Two transports implement [`MpTransport`]:
//! - [`LocalMp`]: instances in the same process share two rings guarded by
//!   one lock, with per-instance semaphores for wake-ups.
//! - [`LanTransport`]: one instance per machine, peers meshed over QUIC, with
//!   broadcast discovery of hosted sessions.
//!
//! Both move the same 24-byte-header frames (see [`nifi_proto::header`]) and
//! follow the same lockstep rules: the host sends a CMD frame, clients answer
//! with replies tagged by association ID, and the host collects whatever
//! arrived within the receive timeout.

pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod fifo;
pub mod lan;
pub mod local;
pub mod membership;
pub mod replies;
pub mod sync;
pub mod transport;

pub use config::{ConfigStore, LanSettings, MemoryConfigStore, MpSettings, TomlConfigStore};
pub use error::{LanError, MpError};
pub use events::{EventHub, LanEvent};
pub use lan::{LanTransport, PollMode};
pub use local::LocalMp;
pub use membership::{ConnectedMask, InstanceId};
pub use transport::{HostRecv, MpTransport, Received};
