//! Per-zone port id allocator.
//!
//! A fixed array free list: slot 0 is the list head and doubles as the
//! "exhausted" sentinel, so usable ids are `1..MAX_PORTS`.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, PoisonError};

/// Port identifier within one zone
pub type PortId = u32;

/// Slots in the pool, including the sentinel
pub const MAX_PORTS: usize = 128;

#[derive(Debug)]
pub struct PortPool {
    next: Mutex<[PortId; MAX_PORTS]>,
    allocated: AtomicI32,
}

impl PortPool {
    pub fn new() -> Self {
        let pool = Self {
            next: Mutex::new([0; MAX_PORTS]),
            allocated: AtomicI32::new(0),
        };
        for id in (1..MAX_PORTS as PortId).rev() {
            pool.free(id);
        }
        pool
    }

    /// Pop a free id; 0 when the pool is exhausted.
    pub fn alloc(&self) -> PortId {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let id = next[0];
        next[0] = next[id as usize];
        next[id as usize] = 0;
        id
    }

    /// Return `id` to the pool. Freeing the sentinel is a no-op.
    pub fn free(&self, id: PortId) {
        if id == 0 || id as usize >= MAX_PORTS {
            return;
        }
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        next[id as usize] = next[0];
        next[0] = id;
    }

    /// Count one more port holding the zone alive
    pub fn inc(&self) {
        self.allocated.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec(&self) {
        let n = self.allocated.fetch_sub(1, Ordering::SeqCst) - 1;
        if n < 0 {
            panic!("port count of zone dropped below zero");
        }
    }

    /// Ports counted toward the zone's liveness
    pub fn count(&self) -> usize {
        self.allocated.load(Ordering::SeqCst).max(0) as usize
    }
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new()
    }
}
