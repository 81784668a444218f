use bytes::{Buf, Bytes, BytesMut};

/// Frames larger than this are treated as a protocol violation.
pub const MAX_STREAM_FRAME: usize = 64 * 1024;

const LEN_PREFIX: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stream frame too large ({0} bytes)")]
pub struct FrameTooLarge(pub usize);

/// Prefix `msg` with its little-endian `u32` length.
pub fn encode_frame(msg: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(LEN_PREFIX + msg.len());
    out.extend_from_slice(&(msg.len() as u32).to_le_bytes());
    out.extend_from_slice(msg);
    out.freeze()
}

/// Reassembles `[u32 len][message]` frames from a byte stream.
///
/// Typical usage:
/// - `framer.buf_mut().reserve(n)`
/// - `stream.read_buf(framer.buf_mut()).await?`
/// - `framer.drain_frames()?`
pub struct StreamFramer {
    buf: BytesMut,
}

impl StreamFramer {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(initial_capacity),
        }
    }

    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Split off every complete frame, keeping any partial tail buffered.
    pub fn drain_frames(&mut self) -> Result<Vec<Bytes>, FrameTooLarge> {
        let mut out = Vec::new();
        while self.buf.len() >= LEN_PREFIX {
            let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if len > MAX_STREAM_FRAME {
                return Err(FrameTooLarge(len));
            }
            if self.buf.len() < LEN_PREFIX + len {
                break;
            }
            self.buf.advance(LEN_PREFIX);
            out.push(self.buf.split_to(len).freeze());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_split_frames() {
        let mut framer = StreamFramer::new(64);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_frame(b"\x04"));
        wire.extend_from_slice(&encode_frame(b"hello"));

        framer.buf_mut().extend_from_slice(&wire[..7]);
        let first = framer.drain_frames().unwrap();
        assert_eq!(first, vec![Bytes::from_static(b"\x04")]);

        framer.buf_mut().extend_from_slice(&wire[7..]);
        let second = framer.drain_frames().unwrap();
        assert_eq!(second, vec![Bytes::from_static(b"hello")]);
    }

    #[test]
    fn rejects_oversized_length() {
        let mut framer = StreamFramer::new(8);
        framer
            .buf_mut()
            .extend_from_slice(&(MAX_STREAM_FRAME as u32 + 1).to_le_bytes());
        assert!(framer.drain_frames().is_err());
    }
}
