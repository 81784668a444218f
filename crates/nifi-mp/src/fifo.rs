//! Fixed-capacity broadcast byte ring.
//!
//! One shared write position and one read position per instance: every
//! instance reads the same stream at its own pace. Writes and reads that
//! cross the end of the buffer are split into a tail copy and a head copy.
//!
//! Nothing stops a writer from lapping a slow reader. The lapped reader finds
//! garbage where it expects a header, fails the magic check, and resyncs to
//! the write position.

use nifi_proto::{constants::MAX_PLAYERS, error::ProtoError, header::PacketHeader};

use crate::membership::InstanceId;

#[derive(Debug)]
pub struct Fifo {
    data: Box<[u8]>,
    write: usize,
    read: [usize; MAX_PLAYERS],
}

impl Fifo {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > PacketHeader::LEN, "fifo capacity too small");
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            write: 0,
            read: [0; MAX_PLAYERS],
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn write_offset(&self) -> usize {
        self.write
    }

    pub fn read_offset(&self, inst: InstanceId) -> usize {
        self.read[inst.index()]
    }

    /// Snap `inst`'s reader to the current write position, discarding backlog.
    pub fn sync_reader(&mut self, inst: InstanceId) {
        self.read[inst.index()] = self.write;
    }

    pub fn write(&mut self, buf: &[u8]) {
        self.write = copy_in(&mut self.data, self.write, buf);
    }

    pub fn read(&mut self, inst: InstanceId, out: &mut [u8]) {
        let offset = self.read[inst.index()];
        self.read[inst.index()] = copy_out(&self.data, offset, out);
    }

    pub fn skip(&mut self, inst: InstanceId, len: usize) {
        let cap = self.capacity();
        let r = &mut self.read[inst.index()];
        *r = (*r + len % cap) % cap;
    }

    pub fn read_header(&mut self, inst: InstanceId) -> Result<PacketHeader, ProtoError> {
        let mut raw = [0u8; PacketHeader::LEN];
        self.read(inst, &mut raw);
        PacketHeader::decode(&raw)
    }

    /// Read a `len`-byte payload, keeping as much as fits in `out` and
    /// skipping the rest. Returns the number of bytes kept.
    pub fn read_payload(&mut self, inst: InstanceId, len: usize, out: &mut [u8]) -> usize {
        let kept = len.min(out.len());
        self.read(inst, &mut out[..kept]);
        self.skip(inst, len - kept);
        kept
    }
}

fn copy_in(data: &mut [u8], offset: usize, buf: &[u8]) -> usize {
    let cap = data.len();
    let len = buf.len();
    if offset + len >= cap {
        let first = cap - offset;
        data[offset..].copy_from_slice(&buf[..first]);
        let rest = (len - first).min(cap);
        data[..rest].copy_from_slice(&buf[first..first + rest]);
        rest % cap
    } else {
        data[offset..offset + len].copy_from_slice(buf);
        offset + len
    }
}

fn copy_out(data: &[u8], offset: usize, out: &mut [u8]) -> usize {
    let cap = data.len();
    let len = out.len();
    if offset + len >= cap {
        let first = cap - offset;
        out[..first].copy_from_slice(&data[offset..]);
        let rest = (len - first).min(cap);
        out[first..first + rest].copy_from_slice(&data[..rest]);
        rest % cap
    } else {
        out.copy_from_slice(&data[offset..offset + len]);
        offset + len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nifi_proto::header::PacketKind;
    use proptest::prelude::*;

    fn inst(i: usize) -> InstanceId {
        InstanceId::new(i).unwrap()
    }

    #[test]
    fn readers_progress_independently() {
        let mut fifo = Fifo::new(64);
        fifo.write(b"hello");

        let mut a = [0u8; 5];
        fifo.read(inst(0), &mut a);
        assert_eq!(&a, b"hello");
        assert_eq!(fifo.read_offset(inst(0)), 5);
        assert_eq!(fifo.read_offset(inst(1)), 0);

        let mut b = [0u8; 5];
        fifo.read(inst(1), &mut b);
        assert_eq!(&b, b"hello");
    }

    #[test]
    fn write_ending_exactly_at_capacity_wraps_to_zero() {
        let mut fifo = Fifo::new(32);
        fifo.write(&[7u8; 32]);
        assert_eq!(fifo.write_offset(), 0);

        let mut out = [0u8; 32];
        fifo.read(inst(0), &mut out);
        assert_eq!(out, [7u8; 32]);
        assert_eq!(fifo.read_offset(inst(0)), 0);
    }

    #[test]
    fn sync_reader_discards_backlog() {
        let mut fifo = Fifo::new(64);
        fifo.write(b"stale");
        fifo.sync_reader(inst(2));
        assert_eq!(fifo.read_offset(inst(2)), fifo.write_offset());
    }

    #[test]
    fn lapped_reader_sees_bad_magic() {
        let mut fifo = Fifo::new(48);
        let header = PacketHeader::new(1, PacketKind::Data, 0, 0);
        fifo.write(&header.encode());
        // Overwrite the header before reader 0 gets to it.
        fifo.write(&[0xAAu8; 48]);
        assert!(matches!(
            fifo.read_header(inst(0)),
            Err(ProtoError::BadMagic(_))
        ));
    }

    #[test]
    fn read_payload_truncates_and_skips() {
        let mut fifo = Fifo::new(64);
        fifo.write(b"abcdefgh");
        fifo.write(b"Z");

        let mut out = [0u8; 4];
        assert_eq!(fifo.read_payload(inst(0), 8, &mut out), 4);
        assert_eq!(&out, b"abcd");

        let mut next = [0u8; 1];
        fifo.read(inst(0), &mut next);
        assert_eq!(&next, b"Z");
    }

    proptest! {
        #[test]
        fn wraparound_preserves_bytes(
            start in 0usize..256,
            payload in proptest::collection::vec(any::<u8>(), 1..=256),
        ) {
            let mut fifo = Fifo::new(256);
            // Move both positions to `start`.
            fifo.write(&vec![0u8; start]);
            fifo.sync_reader(inst(0));

            fifo.write(&payload);
            let mut out = vec![0u8; payload.len()];
            fifo.read(inst(0), &mut out);

            prop_assert_eq!(out, payload);
            prop_assert_eq!(fifo.read_offset(inst(0)), fifo.write_offset());
        }
    }
}
