//! Same-machine transport: several emulator instances exchanging frames
//! through two broadcast byte rings.
//!
//! A [`LocalMp`] is the session context. Create one per session, hand an
//! `Arc` to every instance thread and drop it when the session ends.
//!
//! All ring and status-block state sits behind one mutex. Semaphores are
//! waited on and posted outside it.

use nifi_proto::{
    constants::MAX_PLAYERS,
    error::ProtoError,
    header::{PacketHeader, PacketKind},
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::MpSettings;
use crate::error::MpError;
use crate::fifo::Fifo;
use crate::membership::{ConnectedMask, InstanceId};
use crate::replies::{ReplyCollector, is_stale, reply_slot};
use crate::sync::SemaphorePool;
use crate::transport::{HostRecv, MpTransport, Received};

#[derive(Debug)]
struct QueueState {
    connected: ConnectedMask,
    /// Instance that sent the latest CMD frame.
    host: Option<InstanceId>,
    /// Instances that replied since the latest CMD frame.
    replied: u16,
    packets: Fifo,
    replies: Fifo,
    /// Per instance: who sent the last CMD frame it received.
    last_host: [Option<InstanceId>; MAX_PLAYERS],
}

/// Outcome of pulling one header off a ring.
enum Dequeue {
    Packet(PacketHeader),
    /// Unusable entry whose payload was already skipped.
    Skipped,
    Desync,
}

impl QueueState {
    fn next_header(fifo: &mut Fifo, inst: InstanceId) -> Dequeue {
        match fifo.read_header(inst) {
            Ok(header) => Dequeue::Packet(header),
            Err(ProtoError::UnknownPacketType { raw, len }) => {
                debug!(%inst, raw, len, "skipping packet of unknown type");
                fifo.skip(inst, len as usize);
                Dequeue::Skipped
            }
            Err(_) => Dequeue::Desync,
        }
    }
}

#[derive(Debug)]
pub struct LocalMp {
    state: Mutex<QueueState>,
    sems: SemaphorePool,
    settings: MpSettings,
}

impl Default for LocalMp {
    fn default() -> Self {
        Self::new(MpSettings::default())
    }
}

impl LocalMp {
    pub fn new(settings: MpSettings) -> Self {
        info!(
            packet_queue = settings.packet_queue_size,
            reply_queue = settings.reply_queue_size,
            "local MP session created"
        );
        Self {
            state: Mutex::new(QueueState {
                connected: ConnectedMask::EMPTY,
                host: None,
                replied: 0,
                packets: Fifo::new(settings.packet_queue_size),
                replies: Fifo::new(settings.reply_queue_size),
                last_host: [None; MAX_PLAYERS],
            }),
            sems: SemaphorePool::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &MpSettings {
        &self.settings
    }

    pub fn connected(&self) -> ConnectedMask {
        self.state.lock().connected
    }

    /// Instances that replied since the latest CMD frame.
    pub fn replied_mask(&self) -> u16 {
        self.state.lock().replied
    }

    pub fn host(&self) -> Option<InstanceId> {
        self.state.lock().host
    }

    fn send_generic(
        &self,
        inst: InstanceId,
        kind: PacketKind,
        data: &[u8],
        timestamp: u64,
    ) -> Result<usize, MpError> {
        let max = self.settings.max_frame_size;
        if data.len() > max {
            warn!(%inst, len = data.len(), max, "attempting to send frame too big");
            return Err(MpError::FrameTooLarge {
                len: data.len(),
                max,
            });
        }

        let header = PacketHeader::new(inst.index() as u32, kind, data.len() as u32, timestamp);

        let (recipients, reply_host) = {
            let mut st = self.state.lock();
            let recipients = st.connected;
            let fifo = if kind.is_reply() {
                &mut st.replies
            } else {
                &mut st.packets
            };
            fifo.write(&header.encode());
            fifo.write(data);

            match kind {
                PacketKind::Command => {
                    st.host = Some(inst);
                    st.replied = 0;
                    st.replies.sync_reader(inst);
                    self.sems.reply(inst).reset();
                }
                PacketKind::Reply { .. } => st.replied |= inst.bit(),
                _ => {}
            }
            (recipients, st.host)
        };

        if kind.is_reply() {
            if let Some(host) = reply_host {
                self.sems.reply(host).post();
            }
        } else {
            for target in recipients.iter() {
                self.sems.frame(target).post();
            }
        }

        Ok(data.len())
    }

    fn recv_generic(&self, inst: InstanceId, buf: &mut [u8], block: bool) -> Option<Received> {
        let timeout = if block {
            self.settings.recv_timeout()
        } else {
            std::time::Duration::ZERO
        };

        loop {
            if !self.sems.frame(inst).try_wait(timeout) {
                return None;
            }

            let mut st = self.state.lock();
            let header = match QueueState::next_header(&mut st.packets, inst) {
                Dequeue::Packet(header) => header,
                Dequeue::Skipped => continue,
                Dequeue::Desync => {
                    warn!(%inst, "packet FIFO overflow");
                    st.packets.sync_reader(inst);
                    self.sems.frame(inst).reset();
                    return None;
                }
            };

            if header.sender_id == inst.index() as u32 {
                st.packets.skip(inst, header.length as usize);
                continue;
            }

            let len = st.packets.read_payload(inst, header.length as usize, buf);
            if header.kind == PacketKind::Command {
                st.last_host[inst.index()] = InstanceId::new(header.sender_id as usize);
            }

            return Some(Received {
                len,
                timestamp: header.timestamp,
                kind: header.kind,
            });
        }
    }
}

impl MpTransport for LocalMp {
    fn begin(&self, inst: InstanceId) {
        let mut st = self.state.lock();
        st.connected.insert(inst);
        st.packets.sync_reader(inst);
        st.replies.sync_reader(inst);
        st.last_host[inst.index()] = None;
        self.sems.frame(inst).reset();
        self.sems.reply(inst).reset();
        debug!(%inst, connected = st.connected.bits(), "instance joined");
    }

    fn end(&self, inst: InstanceId) {
        let mut st = self.state.lock();
        st.connected.remove(inst);
        debug!(%inst, connected = st.connected.bits(), "instance left");
    }

    fn send_packet(&self, inst: InstanceId, data: &[u8], timestamp: u64) -> Result<usize, MpError> {
        self.send_generic(inst, PacketKind::Data, data, timestamp)
    }

    fn recv_packet(&self, inst: InstanceId, buf: &mut [u8]) -> Option<Received> {
        self.recv_generic(inst, buf, false)
    }

    fn send_cmd(&self, inst: InstanceId, data: &[u8], timestamp: u64) -> Result<usize, MpError> {
        self.send_generic(inst, PacketKind::Command, data, timestamp)
    }

    fn send_reply(
        &self,
        inst: InstanceId,
        data: &[u8],
        timestamp: u64,
        aid: u16,
    ) -> Result<usize, MpError> {
        self.send_generic(inst, PacketKind::Reply { aid }, data, timestamp)
    }

    fn send_ack(&self, inst: InstanceId, data: &[u8], timestamp: u64) -> Result<usize, MpError> {
        self.send_generic(inst, PacketKind::Ack, data, timestamp)
    }

    fn recv_host_packet(&self, inst: InstanceId, buf: &mut [u8]) -> HostRecv {
        {
            let st = self.state.lock();
            if let Some(host) = st.last_host[inst.index()] {
                if !st.connected.contains(host) {
                    return HostRecv::HostGone;
                }
            }
        }

        match self.recv_generic(inst, buf, true) {
            Some(frame) => HostRecv::Frame(frame),
            None => HostRecv::Timeout,
        }
    }

    fn recv_replies(&self, inst: InstanceId, buf: &mut [u8], timestamp: u64, aid_mask: u16) -> u16 {
        let connected = self.state.lock().connected.bits();
        let mut collector = ReplyCollector::new(inst, aid_mask);
        if collector.is_alone(connected) {
            return 0;
        }

        let timeout = self.settings.recv_timeout();
        let window = self.settings.stale_reply_window;

        loop {
            if !self.sems.reply(inst).try_wait(timeout) {
                return collector.aids();
            }

            let mut st = self.state.lock();
            let header = match QueueState::next_header(&mut st.replies, inst) {
                Dequeue::Packet(header) => header,
                Dequeue::Skipped => continue,
                Dequeue::Desync => {
                    warn!(%inst, "reply FIFO overflow");
                    st.replies.sync_reader(inst);
                    self.sems.reply(inst).reset();
                    return 0;
                }
            };

            let len = header.length as usize;
            let aid = match header.kind {
                PacketKind::Reply { aid }
                    if header.sender_id != inst.index() as u32
                        && !is_stale(header.timestamp, timestamp, window) =>
                {
                    aid
                }
                _ => {
                    st.replies.skip(inst, len);
                    continue;
                }
            };

            if len > 0 {
                match reply_slot(aid, buf.len()) {
                    Some(slot) => {
                        st.replies.read_payload(inst, len, &mut buf[slot]);
                        collector.record_aid(aid);
                    }
                    None => {
                        debug!(%inst, aid, "reply AID has no slot in buffer");
                        st.replies.skip(inst, len);
                    }
                }
            }

            collector.record_sender(header.sender_id);
            if collector.is_complete(connected) {
                return collector.aids();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(i: usize) -> InstanceId {
        InstanceId::new(i).unwrap()
    }

    fn quick() -> LocalMp {
        LocalMp::new(MpSettings {
            recv_timeout_ms: 10,
            ..MpSettings::default()
        })
    }

    #[test]
    fn broadcast_skips_own_echo() {
        let mp = quick();
        mp.begin(inst(0));
        mp.begin(inst(1));

        mp.send_packet(inst(0), b"from zero", 1).unwrap();
        mp.send_packet(inst(1), b"from one", 2).unwrap();

        let mut buf = [0u8; 64];
        let got = mp.recv_packet(inst(1), &mut buf).unwrap();
        assert_eq!(&buf[..got.len], b"from zero");
        assert_eq!(got.timestamp, 1);
        assert!(mp.recv_packet(inst(1), &mut buf).is_none());
    }

    #[test]
    fn oversized_send_is_rejected_without_write() {
        let mp = quick();
        mp.begin(inst(0));
        mp.begin(inst(1));

        let big = vec![0u8; mp.settings().max_frame_size + 1];
        assert!(matches!(
            mp.send_packet(inst(0), &big, 0),
            Err(MpError::FrameTooLarge { .. })
        ));
        let mut buf = [0u8; 16];
        assert!(mp.recv_packet(inst(1), &mut buf).is_none());
    }

    #[test]
    fn cmd_records_host_and_clears_replied() {
        let mp = quick();
        mp.begin(inst(0));
        mp.begin(inst(1));

        mp.send_reply(inst(1), b"r", 0, 1).unwrap();
        assert_eq!(mp.replied_mask(), 0b10);

        mp.send_cmd(inst(0), b"c", 1).unwrap();
        assert_eq!(mp.host(), Some(inst(0)));
        assert_eq!(mp.replied_mask(), 0);
    }

    #[test]
    fn alone_host_returns_immediately() {
        let mp = quick();
        mp.begin(inst(0));
        mp.send_cmd(inst(0), b"c", 5).unwrap();

        let mut buf = vec![0u8; 15 * 1024];
        assert_eq!(mp.recv_replies(inst(0), &mut buf, 5, 0xFFFE), 0);
    }
}
