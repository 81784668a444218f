//! Counting semaphore built on `parking_lot`.
//!
//! The pool holds one "frame available" semaphore per instance (0-15) and one
//! "reply available" semaphore per instance (16-31).

use std::time::{Duration, Instant};

use nifi_proto::constants::MAX_PLAYERS;
use parking_lot::{Condvar, Mutex};

use crate::membership::InstanceId;

#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_add(1);
        self.cond.notify_one();
    }

    /// Decrement, waiting up to `timeout`. A zero timeout only polls.
    pub fn try_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Drop all pending posts.
    pub fn reset(&self) {
        *self.count.lock() = 0;
    }

    pub fn count(&self) -> u32 {
        *self.count.lock()
    }
}

#[derive(Debug)]
pub struct SemaphorePool {
    sems: Vec<Semaphore>,
}

impl Default for SemaphorePool {
    fn default() -> Self {
        Self::new()
    }
}

impl SemaphorePool {
    pub fn new() -> Self {
        Self {
            sems: (0..MAX_PLAYERS * 2).map(|_| Semaphore::new()).collect(),
        }
    }

    /// Posted when `inst` has a new regular/CMD frame to read.
    pub fn frame(&self, inst: InstanceId) -> &Semaphore {
        &self.sems[inst.index()]
    }

    /// Posted when `inst` (as host) has a new reply to read.
    pub fn reply(&self, inst: InstanceId) -> &Semaphore {
        &self.sems[MAX_PLAYERS + inst.index()]
    }
}
