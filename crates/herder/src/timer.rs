//! Deadlines the Herder is waiting on.
//!
//! The Herder owns no tasks. It records deadlines here and whoever drives
//! it calls [`crate::Herder::fire_due_timers`] when
//! [`TimerQueue::next_deadline`] passes. Each kind holds at most one
//! deadline; scheduling again replaces it.
//!
//! Every schedule bumps a generation counter. A caller that snapshotted the
//! due timers must [`TimerQueue::claim`] each one before acting on it, so a
//! timer rescheduled or cancelled while earlier ones fired is never run
//! with stale data.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use lumen_scp::TimerKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HerderTimer {
    /// Start the next consensus round.
    Trigger,
    /// SCP nomination round timeout.
    Nomination,
    /// SCP ballot round timeout.
    Ballot,
    /// Re-send the latest local envelopes.
    Rebroadcast,
    /// No externalize within the stuck timeout: consensus was lost.
    Tracking,
}

impl From<TimerKind> for HerderTimer {
    fn from(kind: TimerKind) -> Self {
        match kind {
            TimerKind::Nomination => HerderTimer::Nomination,
            TimerKind::Ballot => HerderTimer::Ballot,
        }
    }
}

impl fmt::Display for HerderTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HerderTimer::Trigger => "trigger",
            HerderTimer::Nomination => "nomination",
            HerderTimer::Ballot => "ballot",
            HerderTimer::Rebroadcast => "rebroadcast",
            HerderTimer::Tracking => "tracking",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredTimer {
    pub timer: HerderTimer,
    pub slot_index: u64,
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    deadline: Instant,
    slot_index: u64,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: HashMap<HerderTimer, Entry>,
    generation: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, timer: HerderTimer, slot_index: u64, deadline: Instant) {
        self.generation += 1;
        self.entries.insert(
            timer,
            Entry {
                deadline,
                slot_index,
                generation: self.generation,
            },
        );
    }

    pub fn cancel(&mut self, timer: HerderTimer) {
        self.entries.remove(&timer);
    }

    pub fn is_scheduled(&self, timer: HerderTimer) -> bool {
        self.entries.contains_key(&timer)
    }

    pub fn deadline(&self, timer: HerderTimer) -> Option<Instant> {
        self.entries.get(&timer).map(|entry| entry.deadline)
    }

    /// Timers whose deadline is at or before `now`, earliest first.
    pub fn due(&self, now: Instant) -> Vec<FiredTimer> {
        let mut due: Vec<(Instant, FiredTimer)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(timer, entry)| {
                (
                    entry.deadline,
                    FiredTimer {
                        timer: *timer,
                        slot_index: entry.slot_index,
                        generation: entry.generation,
                    },
                )
            })
            .collect();
        due.sort_by_key(|(deadline, fired)| (*deadline, fired.timer));
        due.into_iter().map(|(_, fired)| fired).collect()
    }

    /// Remove `fired` if it is still the scheduled instance of its timer.
    pub fn claim(&mut self, fired: &FiredTimer) -> bool {
        match self.entries.get(&fired.timer) {
            Some(entry) if entry.generation == fired.generation => {
                self.entries.remove(&fired.timer);
                true
            }
            _ => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }
}
