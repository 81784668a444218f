//! The session's player table.
//!
//! The host owns the authoritative table and broadcasts it on every change;
//! clients replace theirs wholesale with each broadcast.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use nifi_proto::constants::MAX_PLAYERS;
use nifi_proto::control::{ControlMessage, PlayerRecord, PlayerStatus};

use crate::error::LanError;

#[derive(Debug, Clone)]
pub struct PlayerTable {
    players: [PlayerRecord; MAX_PLAYERS],
    num_players: u8,
    max_players: u8,
    /// Our own record. Its ID is only meaningful once the host assigned it.
    me: PlayerRecord,
    /// Address the host is reached at, as seen from this instance.
    host_addr: Ipv4Addr,
}

impl Default for PlayerTable {
    fn default() -> Self {
        Self {
            players: std::array::from_fn(|_| PlayerRecord::default()),
            num_players: 0,
            max_players: 0,
            me: PlayerRecord::default(),
            host_addr: Ipv4Addr::LOCALHOST,
        }
    }
}

impl PlayerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh table for a hosted session: we are player 0.
    pub fn start_host(&mut self, name: &str, max_players: u8, port: u16) {
        *self = Self::default();
        let host = PlayerRecord {
            id: 0,
            name: clamp_name(name),
            status: PlayerStatus::Host,
            address: Ipv4Addr::LOCALHOST,
            port,
            ..PlayerRecord::default()
        };
        self.players[0] = host.clone();
        self.me = host;
        self.num_players = 1;
        self.max_players = max_players;
    }

    /// Fresh table for a client that is still waiting for its ID.
    pub fn start_client(&mut self, name: &str, host_addr: Ipv4Addr) {
        *self = Self::default();
        self.me = PlayerRecord {
            name: clamp_name(name),
            status: PlayerStatus::Connecting,
            ..PlayerRecord::default()
        };
        self.host_addr = host_addr;
    }

    /// Record the ID and player limit handed out by the host.
    pub fn accept_init(&mut self, assigned_id: u8, max_players: u8) -> PlayerRecord {
        self.me.id = assigned_id as u32;
        self.me.status = PlayerStatus::Client;
        self.max_players = max_players;
        self.me.clone()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn my_id(&self) -> u8 {
        self.me.id as u8
    }

    pub fn num_players(&self) -> u8 {
        self.num_players
    }

    pub fn max_players(&self) -> u8 {
        self.max_players
    }

    pub fn get(&self, id: u8) -> Option<&PlayerRecord> {
        self.players
            .get(id as usize)
            .filter(|p| p.status != PlayerStatus::None)
    }

    /// Host side: reserve the first free slot for a connecting peer.
    pub fn assign_slot(&mut self, addr: SocketAddrV4) -> Result<u8, LanError> {
        if self.num_players >= self.max_players || self.num_players as usize >= MAX_PLAYERS {
            return Err(LanError::SessionFull);
        }
        let id = (0..self.max_players as usize)
            .find(|&i| self.players[i].status == PlayerStatus::None)
            .ok_or(LanError::SessionFull)?;

        self.players[id] = PlayerRecord {
            id: id as u32,
            status: PlayerStatus::Connecting,
            address: *addr.ip(),
            port: addr.port(),
            ..PlayerRecord::default()
        };
        self.num_players += 1;
        Ok(id as u8)
    }

    /// Host side: merge the identity a client sent for slot `id`.
    ///
    /// The client's version and claimed ID must match; its address comes
    /// from the connection, not from the record.
    pub fn admit(
        &mut self,
        id: u8,
        version: u32,
        ours: u32,
        info: &PlayerRecord,
    ) -> Result<(), LanError> {
        if version != ours {
            return Err(LanError::VersionMismatch {
                ours,
                theirs: version,
            });
        }
        if info.id != id as u32 {
            return Err(LanError::Refused);
        }
        let slot = self
            .players
            .get_mut(id as usize)
            .filter(|p| p.status == PlayerStatus::Connecting)
            .ok_or(LanError::Refused)?;

        slot.name = clamp_name(&info.name);
        slot.status = PlayerStatus::Client;
        slot.is_local = false;
        slot.ping = 0;
        Ok(())
    }

    /// Host side: free a slot whose peer went away.
    pub fn remove(&mut self, id: u8) -> bool {
        match self.players.get_mut(id as usize) {
            Some(slot) if slot.status != PlayerStatus::None => {
                *slot = PlayerRecord::default();
                self.num_players = self.num_players.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    /// Client side: the connection to `id` dropped.
    pub fn mark_disconnected(&mut self, id: u8) {
        if let Some(slot) = self.players.get_mut(id as usize) {
            if slot.status != PlayerStatus::None {
                slot.status = PlayerStatus::Disconnected;
            }
        }
    }

    pub fn set_ping(&mut self, id: u8, ping_ms: u32) {
        if let Some(slot) = self.players.get_mut(id as usize) {
            slot.ping = ping_ms;
        }
    }

    /// Host side: the broadcast form of the table.
    pub fn list_message(&self) -> ControlMessage {
        ControlMessage::PlayerList {
            num_players: self.num_players,
            players: self.players.to_vec(),
        }
    }

    /// Client side: replace the table with the host's broadcast.
    pub fn apply_list(&mut self, num_players: u8, players: &[PlayerRecord]) {
        self.num_players = num_players;
        for (slot, record) in self.players.iter_mut().zip(players) {
            *slot = record.clone();
        }
    }

    /// Client whose session endpoint is at `addr`, other than us.
    pub fn find_client(&self, addr: SocketAddr) -> Option<u8> {
        let SocketAddr::V4(addr) = addr else {
            return None;
        };
        self.players
            .iter()
            .enumerate()
            .find(|(i, p)| {
                *i != self.me.id as usize
                    && p.status == PlayerStatus::Client
                    && p.address == *addr.ip()
                    && p.port == addr.port()
            })
            .map(|(i, _)| i as u8)
    }

    /// Clients we are responsible for dialing: those with a lower ID than
    /// ours. Higher IDs dial us.
    pub fn clients_to_dial(&self) -> Vec<(u8, SocketAddr)> {
        let my_id = self.me.id as usize;
        self.players
            .iter()
            .enumerate()
            .take(my_id)
            .filter(|(_, p)| p.status == PlayerStatus::Client)
            .map(|(i, p)| (i as u8, SocketAddr::V4(SocketAddrV4::new(p.address, p.port))))
            .collect()
    }

    /// Players for display, with addresses fixed up: ours reads as
    /// localhost, the host's as the address we reached it at.
    pub fn snapshot(&self) -> Vec<PlayerRecord> {
        self.players
            .iter()
            .filter(|p| p.status != PlayerStatus::None)
            .map(|p| {
                let mut p = p.clone();
                if p.id == self.me.id {
                    p.is_local = true;
                    p.address = Ipv4Addr::LOCALHOST;
                } else {
                    p.is_local = false;
                    if p.status == PlayerStatus::Host {
                        p.address = self.host_addr;
                    }
                }
                p
            })
            .collect()
    }
}

fn clamp_name(name: &str) -> String {
    let mut end = name.len().min(nifi_proto::constants::PLAYER_NAME_LEN - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    fn hosted(max: u8) -> PlayerTable {
        let mut t = PlayerTable::new();
        t.start_host("Host", max, 7064);
        t
    }

    fn info(id: u8, name: &str) -> PlayerRecord {
        PlayerRecord {
            id: id as u32,
            name: name.to_string(),
            status: PlayerStatus::Client,
            ..PlayerRecord::default()
        }
    }

    #[test]
    fn slots_fill_in_order_and_reuse_holes() {
        let mut t = hosted(4);
        assert_eq!(t.assign_slot(addr(2, 5000)).unwrap(), 1);
        assert_eq!(t.assign_slot(addr(3, 5000)).unwrap(), 2);
        assert!(t.remove(1));
        assert_eq!(t.assign_slot(addr(4, 5000)).unwrap(), 1);
        assert_eq!(t.num_players(), 3);
    }

    #[test]
    fn full_session_refuses() {
        let mut t = hosted(2);
        t.assign_slot(addr(2, 5000)).unwrap();
        assert!(matches!(
            t.assign_slot(addr(3, 5000)),
            Err(LanError::SessionFull)
        ));
    }

    #[test]
    fn admit_checks_version_and_id() {
        let mut t = hosted(4);
        let id = t.assign_slot(addr(2, 5000)).unwrap();

        assert!(matches!(
            t.admit(id, 2, 1, &info(id, "Lucas")),
            Err(LanError::VersionMismatch { ours: 1, theirs: 2 })
        ));
        assert!(matches!(
            t.admit(id, 1, 1, &info(id + 1, "Lucas")),
            Err(LanError::Refused)
        ));

        t.admit(id, 1, 1, &info(id, "Lucas")).unwrap();
        let p = t.get(id).unwrap();
        assert_eq!(p.name, "Lucas");
        assert_eq!(p.status, PlayerStatus::Client);
        assert_eq!(p.address, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn client_dials_lower_ids_only() {
        let mut host = hosted(4);
        for (last, name) in [(2, "a"), (3, "b"), (4, "c")] {
            let id = host.assign_slot(addr(last, 6000)).unwrap();
            host.admit(id, 1, 1, &info(id, name)).unwrap();
        }
        let ControlMessage::PlayerList {
            num_players,
            players,
        } = host.list_message()
        else {
            unreachable!()
        };

        let mut client = PlayerTable::new();
        client.start_client("b", Ipv4Addr::new(10, 0, 0, 1));
        client.accept_init(2, 4);
        client.apply_list(num_players, &players);

        let dial = client.clients_to_dial();
        assert_eq!(
            dial,
            vec![(1, SocketAddr::V4(addr(2, 6000)))],
            "host and higher IDs are never dialed"
        );
        assert_eq!(client.find_client(SocketAddr::V4(addr(4, 6000))), Some(3));
        assert_eq!(client.find_client(SocketAddr::V4(addr(4, 6001))), None);
    }

    #[test]
    fn snapshot_fixes_up_addresses() {
        let mut host = hosted(4);
        let id = host.assign_slot(addr(2, 6000)).unwrap();
        host.admit(id, 1, 1, &info(id, "Lucas")).unwrap();
        let ControlMessage::PlayerList {
            num_players,
            players,
        } = host.list_message()
        else {
            unreachable!()
        };

        let mut client = PlayerTable::new();
        client.start_client("Lucas", Ipv4Addr::new(192, 168, 0, 9));
        client.accept_init(id, 4);
        client.apply_list(num_players, &players);

        let list = client.snapshot();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].address, Ipv4Addr::new(192, 168, 0, 9));
        assert!(!list[0].is_local);
        assert_eq!(list[1].address, Ipv4Addr::LOCALHOST);
        assert!(list[1].is_local);
    }

    #[test]
    fn names_are_clamped() {
        let mut t = PlayerTable::new();
        t.start_host(&"x".repeat(40), 2, 7064);
        assert_eq!(t.get(0).unwrap().name.len(), 31);
    }
}
