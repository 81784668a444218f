//! Host-side reply collection for one CMD cycle.
//!
//! Replies are matched to the current cycle only through the timestamp
//! window: anything older than `timestamp - stale_window` belongs to an
//! earlier command and is dropped.

use nifi_proto::constants::REPLY_SLOT_SIZE;

use crate::membership::InstanceId;

/// Default staleness window, in timestamp units (emulated frames).
pub const DEFAULT_STALE_WINDOW: u64 = 32;

pub fn is_stale(reply_timestamp: u64, cycle_timestamp: u64, window: u64) -> bool {
    reply_timestamp < cycle_timestamp.saturating_sub(window)
}

/// Byte range of `aid`'s slot in the caller's reply buffer, if it fits.
pub fn reply_slot(aid: u16, buf_len: usize) -> Option<std::ops::Range<usize>> {
    if aid == 0 {
        return None;
    }
    let start = (aid as usize - 1) * REPLY_SLOT_SIZE;
    let end = start + REPLY_SLOT_SIZE;
    (end <= buf_len).then_some(start..end)
}

#[derive(Debug, Clone, Copy)]
pub struct ReplyCollector {
    /// Bits of instances whose reply was seen this cycle, plus our own.
    seen: u16,
    /// AIDs that delivered a payload.
    aids: u16,
    aid_mask: u16,
}

impl ReplyCollector {
    pub fn new(host: InstanceId, aid_mask: u16) -> Self {
        Self {
            seen: host.bit(),
            aids: 0,
            aid_mask,
        }
    }

    /// Nobody but the host is connected, so there is nothing to wait for.
    pub fn is_alone(&self, connected: u16) -> bool {
        self.seen & connected == connected
    }

    pub fn record_aid(&mut self, aid: u16) {
        if aid < 16 {
            self.aids |= 1 << aid;
        }
    }

    pub fn record_sender(&mut self, sender: u32) {
        if sender < 16 {
            self.seen |= 1 << sender;
        }
    }

    /// Every connected instance answered, or every expected AID did.
    pub fn is_complete(&self, connected: u16) -> bool {
        self.seen & connected == connected || self.aids & self.aid_mask == self.aid_mask
    }

    pub fn aids(&self) -> u16 {
        self.aids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_window() {
        assert!(!is_stale(100, 100, 32));
        assert!(!is_stale(68, 100, 32));
        assert!(is_stale(67, 100, 32));
        // Early frames never underflow into "everything is stale".
        assert!(!is_stale(0, 10, 32));
    }

    #[test]
    fn slots_are_aid_indexed() {
        assert_eq!(reply_slot(1, 15 * 1024), Some(0..1024));
        assert_eq!(reply_slot(3, 15 * 1024), Some(2048..3072));
        assert_eq!(reply_slot(0, 15 * 1024), None);
        assert_eq!(reply_slot(16, 15 * 1024), None);
    }

    #[test]
    fn completes_when_all_connected_seen() {
        let host = InstanceId::new(0).unwrap();
        let mut c = ReplyCollector::new(host, 0xFFFE);
        let connected = 0b0111;
        assert!(!c.is_complete(connected));
        c.record_sender(1);
        c.record_aid(1);
        assert!(!c.is_complete(connected));
        c.record_sender(2);
        c.record_aid(2);
        assert!(c.is_complete(connected));
        assert_eq!(c.aids(), 0b0110);
    }

    #[test]
    fn completes_when_expected_aids_seen() {
        let host = InstanceId::new(0).unwrap();
        let mut c = ReplyCollector::new(host, 0b0010);
        c.record_sender(1);
        c.record_aid(1);
        assert!(c.is_complete(0b1111));
    }

    #[test]
    fn alone_host_has_nothing_to_wait_for() {
        let host = InstanceId::new(2).unwrap();
        let c = ReplyCollector::new(host, 0xFFFF);
        assert!(c.is_alone(0b0100));
        assert!(!c.is_alone(0b0101));
    }
}
