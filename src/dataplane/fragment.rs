//! IPv4 fragment reassembly
//!
//! Fragments are kept as an ordered list of non-overlapping byte ranges of
//! the IP payload. Completion hands back the buffers in order, unchanged;
//! nothing is copied into a contiguous datagram.

use crate::packet::PacketBuf;
use crate::timer::{TimerHandle, TimerWheel};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::debug;

/// Queues not completed within this window are discarded
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

const LAST_IN: u8 = 1 << 0;
const COMPLETE: u8 = 1 << 1;

/// Identifies the datagram a fragment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragKey {
    pub proto: u8,
    pub id: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

#[derive(Debug)]
struct Fragment {
    offset: u16,
    len: u16,
    buf: PacketBuf,
}

impl Fragment {
    fn end(&self) -> u16 {
        self.offset + self.len
    }
}

/// Fragments of one datagram
#[derive(Debug, Default)]
pub struct FragmentQueue {
    frags: Vec<Fragment>,
    /// Bytes received so far
    meat: u16,
    /// Known or provisional datagram payload length
    q_len: u16,
    flags: u8,
}

impl FragmentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.flags & COMPLETE != 0
    }

    /// Bytes received so far
    pub fn received(&self) -> u16 {
        self.meat
    }

    /// Insert one fragment covering `offset..offset+len` of the IP payload.
    ///
    /// Returns `(accepted, complete)`. `accepted` is false when the fragment
    /// overlaps one already queued or arrives after completion; the buffer is
    /// dropped in that case.
    pub fn process(&mut self, offset: u16, len: u16, more: bool, buf: PacketBuf) -> (bool, bool) {
        if self.is_complete() {
            return (false, false);
        }
        let Some(end) = offset.checked_add(len) else {
            return (false, false);
        };
        let frag = Fragment { offset, len, buf };

        if self.frags.is_empty() {
            self.frags.push(frag);
            self.meat = len;
            self.q_len = end;
            if !more {
                self.flags |= LAST_IN;
            }
            return (true, false);
        }

        if !more {
            if self.flags & LAST_IN != 0 {
                return (false, false);
            }
            if self.frags.last().is_some_and(|tail| tail.end() > offset) {
                return (false, false);
            }
            self.flags |= LAST_IN;
            self.frags.push(frag);
            self.meat += len;
            self.q_len = end;
            return (true, self.check_complete());
        }

        if self.flags & LAST_IN != 0 && end > self.q_len {
            return (false, false);
        }
        let at = match self.frags.iter().rposition(|f| offset >= f.end()) {
            Some(prev) => prev + 1,
            None => 0,
        };
        if self.frags.get(at).is_some_and(|next| end > next.offset) {
            return (false, false);
        }
        self.frags.insert(at, frag);
        self.q_len = self.q_len.max(end);
        self.meat += len;
        (true, self.check_complete())
    }

    fn check_complete(&mut self) -> bool {
        if self.flags & LAST_IN != 0 && self.meat == self.q_len {
            self.flags |= COMPLETE;
            return true;
        }
        false
    }

    /// The fragment buffers in offset order, head first.
    ///
    /// # Panics
    /// If the queue is not complete.
    pub fn completed(self) -> Vec<PacketBuf> {
        assert!(self.is_complete(), "fragment queue is not complete");
        self.frags.into_iter().map(|f| f.buf).collect()
    }
}

/// Outcome of feeding a fragment to a [`FragmentTable`]
#[derive(Debug)]
pub enum Reassembly {
    /// Held until the rest arrives
    Pending,
    /// Overlap or corruption; the queue was discarded
    Rejected,
    /// All fragments present, head first
    Complete(Vec<PacketBuf>),
}

#[derive(Debug)]
struct PendingQueue {
    serial: u64,
    queue: FragmentQueue,
    timer: TimerHandle,
}

/// Reassembly queues of one zone
#[derive(Debug)]
pub struct FragmentTable {
    queues: Mutex<HashMap<FragKey, PendingQueue>>,
    timers: Arc<TimerWheel>,
    serial: AtomicU64,
}

impl FragmentTable {
    pub fn new(timers: Arc<TimerWheel>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            timers,
            serial: AtomicU64::new(0),
        }
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<FragKey, PendingQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of datagrams being reassembled
    pub fn len(&self) -> usize {
        self.queues().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues().is_empty()
    }

    pub fn process(
        self: &Arc<Self>,
        key: FragKey,
        offset: u16,
        len: u16,
        more: bool,
        buf: PacketBuf,
    ) -> Reassembly {
        let mut queues = self.queues();
        let pending = queues
            .entry(key)
            .or_insert_with(|| self.new_pending(key));

        match pending.queue.process(offset, len, more, buf) {
            (false, _) => {
                if let Some(pending) = queues.remove(&key) {
                    self.timers.cancel(pending.timer);
                }
                debug!(?key, offset, len, "overlapping fragment, queue discarded");
                Reassembly::Rejected
            }
            (true, false) => Reassembly::Pending,
            (true, true) => match queues.remove(&key) {
                Some(pending) => {
                    self.timers.cancel(pending.timer);
                    Reassembly::Complete(pending.queue.completed())
                }
                None => Reassembly::Rejected,
            },
        }
    }

    fn new_pending(self: &Arc<Self>, key: FragKey) -> PendingQueue {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let table: Weak<Self> = Arc::downgrade(self);
        let timer = self.timers.schedule(REASSEMBLY_TIMEOUT, move || {
            if let Some(table) = table.upgrade() {
                table.expire(key, serial);
            }
        });
        PendingQueue {
            serial,
            queue: FragmentQueue::new(),
            timer,
        }
    }

    fn expire(&self, key: FragKey, serial: u64) {
        let mut queues = self.queues();
        if queues.get(&key).is_some_and(|p| p.serial == serial) {
            if let Some(pending) = queues.remove(&key) {
                debug!(?key, received = pending.queue.received(), "reassembly timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::DEFAULT_TICK;
    use proptest::prelude::*;

    fn chunk(offset: u16, len: u16) -> PacketBuf {
        let bytes: Vec<u8> = (offset..offset + len).map(|b| b as u8).collect();
        PacketBuf::from_bytes(&bytes)
    }

    fn key() -> FragKey {
        FragKey {
            proto: 17,
            id: 0x1234,
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
        }
    }

    #[test]
    fn test_in_order_completion() {
        let mut q = FragmentQueue::new();
        assert_eq!(q.process(0, 16, true, chunk(0, 16)), (true, false));
        assert_eq!(q.process(16, 16, true, chunk(16, 16)), (true, false));
        assert_eq!(q.process(32, 5, false, chunk(32, 5)), (true, true));
        let bufs = q.completed();
        let joined: Vec<u8> = bufs.iter().flat_map(|b| b.data().to_vec()).collect();
        assert_eq!(joined, (0..37u16).map(|b| b as u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_tail_before_middle() {
        let mut q = FragmentQueue::new();
        assert_eq!(q.process(0, 8, true, chunk(0, 8)), (true, false));
        assert_eq!(q.process(24, 8, false, chunk(24, 8)), (true, false));
        assert_eq!(q.process(16, 8, true, chunk(16, 8)), (true, false));
        assert_eq!(q.process(8, 8, true, chunk(8, 8)), (true, true));
    }

    #[test]
    fn test_overlap_rejected() {
        let mut q = FragmentQueue::new();
        q.process(0, 16, true, chunk(0, 16));
        assert_eq!(q.process(8, 16, true, chunk(8, 16)), (false, false));
        assert_eq!(q.received(), 16);
    }

    #[test]
    fn test_tail_overlapping_tail_rejected() {
        let mut q = FragmentQueue::new();
        q.process(0, 16, true, chunk(0, 16));
        assert_eq!(q.process(8, 8, false, chunk(8, 8)), (false, false));
    }

    #[test]
    fn test_second_tail_rejected() {
        let mut q = FragmentQueue::new();
        q.process(0, 8, true, chunk(0, 8));
        q.process(16, 8, false, chunk(16, 8));
        assert_eq!(q.process(24, 8, false, chunk(24, 8)), (false, false));
        assert_eq!(q.process(24, 8, true, chunk(24, 8)), (false, false));
    }

    #[test]
    fn test_after_complete_rejected() {
        let mut q = FragmentQueue::new();
        q.process(0, 8, true, chunk(0, 8));
        q.process(8, 8, false, chunk(8, 8));
        assert!(q.is_complete());
        assert_eq!(q.process(16, 8, true, chunk(16, 8)), (false, false));
    }

    #[test]
    #[should_panic(expected = "not complete")]
    fn test_completed_before_complete_panics() {
        let mut q = FragmentQueue::new();
        q.process(0, 8, true, chunk(0, 8));
        let _ = q.completed();
    }

    #[test]
    fn test_table_rejection_evicts_queue() {
        let table = Arc::new(FragmentTable::new(Arc::new(TimerWheel::new(DEFAULT_TICK))));
        assert!(matches!(
            table.process(key(), 0, 16, true, chunk(0, 16)),
            Reassembly::Pending
        ));
        assert_eq!(table.len(), 1);
        assert!(matches!(
            table.process(key(), 8, 8, true, chunk(8, 8)),
            Reassembly::Rejected
        ));
        assert!(table.is_empty());
        assert_eq!(table.timers.pending(), 0);
    }

    #[test]
    fn test_table_completion_removes_queue() {
        let table = Arc::new(FragmentTable::new(Arc::new(TimerWheel::new(DEFAULT_TICK))));
        table.process(key(), 0, 8, true, chunk(0, 8));
        match table.process(key(), 8, 8, false, chunk(8, 8)) {
            Reassembly::Complete(bufs) => assert_eq!(bufs.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(table.is_empty());
        assert_eq!(table.timers.pending(), 0);
    }

    #[test]
    fn test_table_times_out_stale_queue() {
        let timers = Arc::new(TimerWheel::new(DEFAULT_TICK));
        let table = Arc::new(FragmentTable::new(timers.clone()));
        table.process(key(), 0, 8, true, chunk(0, 8));
        let ticks = REASSEMBLY_TIMEOUT.as_millis() / DEFAULT_TICK.as_millis();
        for _ in 0..ticks {
            timers.advance();
        }
        assert!(table.is_empty());
    }

    proptest! {
        #[test]
        fn prop_any_arrival_order_reassembles_same_bytes(
            sizes in proptest::collection::vec(1u16..8, 2..8),
            seed in any::<u64>(),
        ) {
            let mut pieces = Vec::new();
            let mut offset = 0u16;
            for (i, units) in sizes.iter().enumerate() {
                let len = units * 8;
                let more = i + 1 < sizes.len();
                pieces.push((offset, len, more));
                offset += len;
            }
            let total = offset;

            let mut shuffled = pieces.clone();
            let mut state = seed;
            for i in (1..shuffled.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (state >> 33) as usize % (i + 1);
                shuffled.swap(i, j);
            }

            let mut q = FragmentQueue::new();
            let mut done = false;
            for (n, &(off, len, more)) in shuffled.iter().enumerate() {
                let (accepted, complete) = q.process(off, len, more, chunk(off, len));
                prop_assert!(accepted);
                prop_assert_eq!(complete, n + 1 == shuffled.len());
                done = complete;
            }
            prop_assert!(done);
            let joined: Vec<u8> = q.completed().iter().flat_map(|b| b.data().to_vec()).collect();
            prop_assert_eq!(joined, (0..total).map(|b| b as u8).collect::<Vec<_>>());
        }

        #[test]
        fn prop_overlap_always_rejected(
            a_off in 0u16..64, a_len in 1u16..32,
            b_off in 0u16..64, b_len in 1u16..32,
        ) {
            prop_assume!(a_off < b_off + b_len && b_off < a_off + a_len);
            let mut q = FragmentQueue::new();
            prop_assert_eq!(q.process(a_off, a_len, true, chunk(a_off, a_len)), (true, false));
            let (accepted, _) = q.process(b_off, b_len, true, chunk(b_off, b_len));
            prop_assert!(!accepted);
        }
    }
}
