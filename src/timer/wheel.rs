//! Hierarchical timing wheel.
//!
//! Five levels of buckets: a 256-slot ring at tick resolution and four
//! 64-slot rings, each covering 64 times the span of the level below. Timers
//! far in the future sit in a coarse ring and are cascaded down as the clock
//! reaches them, so scheduling and cancelling are O(1) and each tick touches
//! at most one bucket per level.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

const TVR_BITS: u32 = 8;
const TVN_BITS: u32 = 6;
const TVR_SIZE: usize = 1 << TVR_BITS;
const TVN_SIZE: usize = 1 << TVN_BITS;
const TVR_MASK: u64 = TVR_SIZE as u64 - 1;
const TVN_MASK: u64 = TVN_SIZE as u64 - 1;
const LEVELS: usize = 5;

/// Largest delay the top level can hold, in ticks
const MAX_TIMEOUT: u64 = 0xffff_ffff;

/// Default wheel resolution
pub const DEFAULT_TICK: Duration = Duration::from_millis(200);

/// Callback run when a timer fires
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Opaque handle returned by [`TimerWheel::schedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct TimerEntry {
    expires: u64,
    period: u64,
    callback: TimerCallback,
    slot: (usize, usize),
}

struct WheelState {
    jiffies: u64,
    next_id: u64,
    levels: [Vec<BTreeSet<u64>>; LEVELS],
    timers: HashMap<u64, TimerEntry>,
}

impl WheelState {
    fn new() -> Self {
        Self {
            jiffies: 0,
            next_id: 1,
            levels: [
                vec![BTreeSet::new(); TVR_SIZE],
                vec![BTreeSet::new(); TVN_SIZE],
                vec![BTreeSet::new(); TVN_SIZE],
                vec![BTreeSet::new(); TVN_SIZE],
                vec![BTreeSet::new(); TVN_SIZE],
            ],
            timers: HashMap::new(),
        }
    }

    /// Bucket for an absolute expiry, relative to the current clock.
    fn slot_for(&self, expires: u64) -> (usize, usize) {
        let idx = expires.saturating_sub(self.jiffies);
        if idx < TVR_SIZE as u64 {
            return (0, (expires & TVR_MASK) as usize);
        }
        for level in 1..LEVELS - 1 {
            let span_bits = TVR_BITS + level as u32 * TVN_BITS;
            if idx < 1 << span_bits {
                let shift = TVR_BITS + (level as u32 - 1) * TVN_BITS;
                return (level, ((expires >> shift) & TVN_MASK) as usize);
            }
        }
        let expires = self.jiffies + idx.min(MAX_TIMEOUT);
        let shift = TVR_BITS + 3 * TVN_BITS;
        (LEVELS - 1, ((expires >> shift) & TVN_MASK) as usize)
    }

    fn place(&mut self, id: u64) {
        let Some(expires) = self.timers.get(&id).map(|t| t.expires) else {
            return;
        };
        let slot = self.slot_for(expires);
        self.levels[slot.0][slot.1].insert(id);
        if let Some(entry) = self.timers.get_mut(&id) {
            entry.slot = slot;
        }
    }

    fn unplace(&mut self, id: u64) -> Option<TimerEntry> {
        let entry = self.timers.remove(&id)?;
        self.levels[entry.slot.0][entry.slot.1].remove(&id);
        Some(entry)
    }

    /// Re-file every timer of one coarse bucket; returns the bucket index.
    fn cascade(&mut self, level: usize) -> usize {
        let shift = TVR_BITS + (level as u32 - 1) * TVN_BITS;
        let index = ((self.jiffies >> shift) & TVN_MASK) as usize;
        let ids = std::mem::take(&mut self.levels[level][index]);
        for id in ids {
            self.place(id);
        }
        index
    }
}

/// Tick-driven timer scheduler shared by conntrack and fragment reassembly
pub struct TimerWheel {
    tick: Duration,
    state: Mutex<WheelState>,
}

impl TimerWheel {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick: tick.max(Duration::from_millis(1)),
            state: Mutex::new(WheelState::new()),
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    fn lock(&self) -> MutexGuard<'_, WheelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delay in ticks, at least one.
    fn ticks(&self, delay: Duration) -> u64 {
        let ticks = delay.as_millis() / self.tick.as_millis();
        (ticks as u64).max(1)
    }

    /// Run `callback` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(self.ticks(delay), 0, Arc::new(callback))
    }

    /// Run `callback` after `delay` and then every `period`.
    pub fn schedule_periodic<F>(&self, delay: Duration, period: Duration, callback: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(self.ticks(delay), self.ticks(period), Arc::new(callback))
    }

    fn insert(&self, ticks: u64, period: u64, callback: TimerCallback) -> TimerHandle {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let expires = state.jiffies + ticks;
        state.timers.insert(
            id,
            TimerEntry {
                expires,
                period,
                callback,
                slot: (0, 0),
            },
        );
        state.place(id);
        TimerHandle(id)
    }

    /// Stop a pending timer. False once it has fired or was already cancelled.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        self.lock().unplace(handle.0).is_some()
    }

    /// Re-arm a pending timer `delay` from now. False if it is no longer pending.
    pub fn reset(&self, handle: TimerHandle, delay: Duration) -> bool {
        let ticks = self.ticks(delay);
        let mut state = self.lock();
        let Some(mut entry) = state.unplace(handle.0) else {
            return false;
        };
        entry.expires = state.jiffies + ticks;
        state.timers.insert(handle.0, entry);
        state.place(handle.0);
        true
    }

    /// True while the timer can still be cancelled
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.lock().timers.contains_key(&handle.0)
    }

    /// Number of registered timers
    pub fn pending(&self) -> usize {
        self.lock().timers.len()
    }

    /// Current clock in ticks
    pub fn jiffies(&self) -> u64 {
        self.lock().jiffies
    }

    /// Advance the clock one tick and run everything due. Returns the number
    /// of callbacks invoked.
    pub fn advance(&self) -> usize {
        let due = {
            let mut state = self.lock();
            state.jiffies += 1;
            let index = (state.jiffies & TVR_MASK) as usize;
            if index == 0 {
                for level in 1..LEVELS {
                    if state.cascade(level) != 0 {
                        break;
                    }
                }
            }

            let ids = std::mem::take(&mut state.levels[0][index]);
            let mut due = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(entry) = state.timers.get(&id) else {
                    continue;
                };
                let callback = entry.callback.clone();
                if entry.period > 0 {
                    let expires = state.jiffies + entry.period;
                    if let Some(entry) = state.timers.get_mut(&id) {
                        entry.expires = expires;
                    }
                    state.place(id);
                } else {
                    state.timers.remove(&id);
                }
                due.push(callback);
            }
            due
        };

        if !due.is_empty() {
            trace!(count = due.len(), "timers fired");
        }
        for callback in &due {
            callback();
        }
        due.len()
    }

    /// Drive the wheel from a tokio interval, one `advance` per tick.
    pub fn spawn_driver(self: &Arc<Self>) -> JoinHandle<()> {
        let wheel = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(wheel.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                wheel.advance();
            }
        })
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new(DEFAULT_TICK)
    }
}

impl fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("TimerWheel")
            .field("tick", &self.tick)
            .field("jiffies", &state.jiffies)
            .field("pending", &state.timers.len())
            .finish()
    }
}
