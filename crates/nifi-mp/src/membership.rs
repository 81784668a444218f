//! Instance identity and the connected-instance bitmask.

use std::fmt;

use nifi_proto::constants::MAX_PLAYERS;

/// Index of one emulator instance within a session, always `< 16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u8);

impl InstanceId {
    pub const fn new(id: usize) -> Option<Self> {
        if id < MAX_PLAYERS {
            Some(Self(id as u8))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn bit(self) -> u16 {
        1 << self.0
    }

    pub fn all() -> impl Iterator<Item = InstanceId> {
        (0..MAX_PLAYERS as u8).map(InstanceId)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 16-bit set of instances currently taking part in the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectedMask(u16);

impl ConnectedMask {
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub fn insert(&mut self, inst: InstanceId) {
        self.0 |= inst.bit();
    }

    pub fn remove(&mut self, inst: InstanceId) {
        self.0 &= !inst.bit();
    }

    pub const fn contains(self, inst: InstanceId) -> bool {
        self.0 & inst.bit() != 0
    }

    /// True when every member of `self` is also in `other`.
    pub const fn is_subset_of(self, other: u16) -> bool {
        self.0 & other == self.0
    }

    pub fn iter(self) -> impl Iterator<Item = InstanceId> {
        InstanceId::all().filter(move |i| self.contains(*i))
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}
