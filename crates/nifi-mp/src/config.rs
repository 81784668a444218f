//! Transport settings and the configuration-store seam.
//!
//! The frontend owns persistence; transports only see [`ConfigStore`], read
//! named values from it and ask it to save. [`TomlConfigStore`] keeps the
//! table in a TOML file.

use std::collections::BTreeMap;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nifi_proto::constants::{
    DISCOVERY_PORT, GAME_PORT, MAX_FRAME_SIZE, MAX_PLAYERS, PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};

use crate::replies::DEFAULT_STALE_WINDOW;

pub const KEY_PLAYER_NAME: &str = "LAN.PlayerName";
pub const KEY_MAX_PLAYERS: &str = "LAN.MaxPlayers";
pub const KEY_RECV_TIMEOUT: &str = "MP.RecvTimeout";

/// Default discovery freshness window.
pub const DEFAULT_DISCOVERY_STALE_MS: u32 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

/// Read/write access to the frontend's settings table.
pub trait ConfigStore {
    fn get(&self, key: &str) -> Option<ConfigValue>;
    fn set(&mut self, key: &str, value: ConfigValue);
    fn save(&mut self) -> io::Result<()>;

    fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            ConfigValue::Int(v) => Some(v),
            _ => None,
        }
    }

    fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            ConfigValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// In-memory store; `save` only counts calls.
#[derive(Debug, Default, Clone)]
pub struct MemoryConfigStore {
    values: BTreeMap<String, ConfigValue>,
    saves: usize,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        self.saves
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> Option<ConfigValue> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: ConfigValue) {
        self.values.insert(key.to_string(), value);
    }

    fn save(&mut self) -> io::Result<()> {
        self.saves += 1;
        Ok(())
    }
}

/// Settings table persisted as a flat TOML file, one key per setting.
#[derive(Debug, Clone)]
pub struct TomlConfigStore {
    path: PathBuf,
    values: BTreeMap<String, ConfigValue>,
}

impl TomlConfigStore {
    /// Load the table from `path`. A missing file reads as an empty table.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for TomlConfigStore {
    fn get(&self, key: &str) -> Option<ConfigValue> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: ConfigValue) {
        self.values.insert(key.to_string(), value);
    }

    fn save(&mut self) -> io::Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(&self.values).map_err(io::Error::other)?;
        std::fs::write(&self.path, content)
    }
}

/// Settings shared by both transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpSettings {
    /// How long blocking receives wait for data.
    pub recv_timeout_ms: u64,
    /// Replies older than `timestamp - stale_reply_window` are dropped.
    pub stale_reply_window: u64,
    pub packet_queue_size: usize,
    pub reply_queue_size: usize,
    pub max_frame_size: usize,
}

impl Default for MpSettings {
    fn default() -> Self {
        Self {
            recv_timeout_ms: 25,
            stale_reply_window: DEFAULT_STALE_WINDOW,
            packet_queue_size: 0x10000,
            reply_queue_size: 0x10000,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl MpSettings {
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn load(store: &dyn ConfigStore) -> Self {
        let mut settings = Self::default();
        if let Some(ms) = store.get_int(KEY_RECV_TIMEOUT).filter(|ms| *ms > 0) {
            settings.recv_timeout_ms = ms as u64;
        }
        settings
    }
}

/// Settings of the LAN transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanSettings {
    pub player_name: String,
    pub max_players: u8,
    /// Address the session endpoint binds to.
    pub bind_addr: Ipv4Addr,
    /// Port a host listens on.
    pub game_port: u16,
    /// Port a client's endpoint binds to (0 = ephemeral).
    pub client_port: u16,
    pub discovery_port: u16,
    /// Where host beacons are sent.
    pub broadcast_addr: Ipv4Addr,
    pub discovery_interval_ms: u64,
    /// Discovery entries not refreshed for this long are dropped.
    pub discovery_stale_ms: u32,
    pub connect_timeout_ms: u64,
    /// Buffered gameplay frames older than this are discarded.
    pub rx_lifetime_ms: u64,
    /// Version advertised in handshakes and beacons.
    pub protocol_version: u32,
    pub mp: MpSettings,
}

impl Default for LanSettings {
    fn default() -> Self {
        Self {
            player_name: "Player".to_string(),
            max_players: MAX_PLAYERS as u8,
            bind_addr: Ipv4Addr::UNSPECIFIED,
            game_port: GAME_PORT,
            client_port: 0,
            discovery_port: DISCOVERY_PORT,
            broadcast_addr: Ipv4Addr::BROADCAST,
            discovery_interval_ms: 1000,
            discovery_stale_ms: DEFAULT_DISCOVERY_STALE_MS,
            connect_timeout_ms: 5000,
            rx_lifetime_ms: 16,
            protocol_version: PROTOCOL_VERSION,
            mp: MpSettings::default(),
        }
    }
}

impl LanSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn rx_lifetime(&self) -> Duration {
        Duration::from_millis(self.rx_lifetime_ms)
    }

    pub fn load(store: &dyn ConfigStore) -> Self {
        let mut settings = Self {
            mp: MpSettings::load(store),
            ..Self::default()
        };
        if let Some(name) = store.get_string(KEY_PLAYER_NAME).filter(|n| !n.is_empty()) {
            settings.player_name = name;
        }
        if let Some(n) = store
            .get_int(KEY_MAX_PLAYERS)
            .filter(|n| (1..=MAX_PLAYERS as i64).contains(n))
        {
            settings.max_players = n as u8;
        }
        settings
    }

    /// Write the user-facing values back and persist them.
    pub fn store(&self, store: &mut dyn ConfigStore) -> io::Result<()> {
        store.set(KEY_PLAYER_NAME, ConfigValue::Str(self.player_name.clone()));
        store.set(KEY_MAX_PLAYERS, ConfigValue::Int(self.max_players as i64));
        store.set(
            KEY_RECV_TIMEOUT,
            ConfigValue::Int(self.mp.recv_timeout_ms as i64),
        );
        store.save()
    }
}
