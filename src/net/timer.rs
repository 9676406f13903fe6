//! Stack clock and timer wheel
//!
//! Time is a microsecond counter advanced by the scheduler's periodic tick.
//! Timers live in a flat hashed wheel; owners keep the returned [`TimerId`]
//! instead of a pointer back into the wheel.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use core::ops::{Add, Sub};
use core::time::Duration;

fn duration_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// A point on the stack clock, in microseconds since the stack was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant(u64);

impl Instant {
    pub const ZERO: Instant = Instant(0);

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1000))
    }

    pub const fn micros(&self) -> u64 {
        self.0
    }

    /// Whole milliseconds, rounded down
    pub const fn millis(&self) -> u64 {
        self.0 / 1000
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future
    pub fn saturating_since(&self, earlier: Instant) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_add(duration_micros(rhs)))
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        self.saturating_since(rhs)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}ms", self.0 / 1000, self.0 % 1000)
    }
}

/// Handle to a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
struct TimerEntry<K> {
    id: TimerId,
    key: K,
    deadline: Instant,
}

/// Hashed timer wheel
///
/// Each slot covers one tick; a timer further out than one revolution stays
/// in its slot until its deadline is actually reached.
pub struct TimerWheel<K> {
    slots: Vec<Vec<TimerEntry<K>>>,
    /// Slot of every live timer, for O(slot) cancellation
    index: BTreeMap<TimerId, usize>,
    tick_us: u64,
    /// Last tick number that has been processed
    cursor: u64,
    next_id: u64,
}

impl<K: Copy> TimerWheel<K> {
    /// Number of slots in one revolution
    pub const SLOTS: usize = 256;

    pub fn new(tick: Duration) -> Self {
        let mut slots = Vec::with_capacity(Self::SLOTS);
        slots.resize_with(Self::SLOTS, Vec::new);
        Self {
            slots,
            index: BTreeMap::new(),
            tick_us: duration_micros(tick).max(1),
            cursor: 0,
            next_id: 0,
        }
    }

    fn tick_of(&self, at: Instant) -> u64 {
        at.micros().div_ceil(self.tick_us)
    }

    /// Schedule `key` to fire at `deadline`
    pub fn schedule(&mut self, key: K, deadline: Instant) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;

        // Never place a timer behind the cursor; it would wait a full revolution
        let tick = self.tick_of(deadline).max(self.cursor + 1);
        let slot = (tick % Self::SLOTS as u64) as usize;
        self.slots[slot].push(TimerEntry { id, key, deadline });
        self.index.insert(id, slot);
        id
    }

    /// Cancel a timer; returns false if it already fired or was cancelled
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.index.remove(&id) {
            Some(slot) => {
                self.slots[slot].retain(|entry| entry.id != id);
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Advance to `now` and return every expired timer in deadline order
    pub fn advance(&mut self, now: Instant) -> Vec<(TimerId, K)> {
        let target = now.micros() / self.tick_us;
        let mut expired = Vec::new();

        // Visiting more than one revolution would only revisit the same slots
        let first = if target.saturating_sub(self.cursor) > Self::SLOTS as u64 {
            target - Self::SLOTS as u64 + 1
        } else {
            self.cursor + 1
        };

        for tick in first..=target {
            let slot = (tick % Self::SLOTS as u64) as usize;
            let entries = &mut self.slots[slot];
            let mut i = 0;
            while i < entries.len() {
                if entries[i].deadline <= now {
                    let entry = entries.swap_remove(i);
                    self.index.remove(&entry.id);
                    expired.push(entry);
                } else {
                    i += 1;
                }
            }
        }
        if target > self.cursor {
            self.cursor = target;
        }

        expired.sort_by_key(|entry| (entry.deadline, entry.id));
        expired.into_iter().map(|entry| (entry.id, entry.key)).collect()
    }
}
