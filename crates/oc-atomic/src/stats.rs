//! Process-wide commit counters

use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Counters {
    pub single_attempts: AtomicU64,
    pub single_commits: AtomicU64,
    pub htm_attempts: AtomicU64,
    pub htm_commits: AtomicU64,
    pub htm_aborts: AtomicU64,
    pub helping_attempts: AtomicU64,
    pub helping_commits: AtomicU64,
    pub helps: AtomicU64,
    pub forced_aborts: AtomicU64,
    pub completions: AtomicU64,
    pub pool_waits: AtomicU64,
}

impl Counters {
    const fn new() -> Self {
        Self {
            single_attempts: AtomicU64::new(0),
            single_commits: AtomicU64::new(0),
            htm_attempts: AtomicU64::new(0),
            htm_commits: AtomicU64::new(0),
            htm_aborts: AtomicU64::new(0),
            helping_attempts: AtomicU64::new(0),
            helping_commits: AtomicU64::new(0),
            helps: AtomicU64::new(0),
            forced_aborts: AtomicU64::new(0),
            completions: AtomicU64::new(0),
            pool_waits: AtomicU64::new(0),
        }
    }

    fn all(&self) -> [&AtomicU64; 11] {
        [
            &self.single_attempts,
            &self.single_commits,
            &self.htm_attempts,
            &self.htm_commits,
            &self.htm_aborts,
            &self.helping_attempts,
            &self.helping_commits,
            &self.helps,
            &self.forced_aborts,
            &self.completions,
            &self.pool_waits,
        ]
    }
}

pub(crate) static COUNTERS: Counters = Counters::new();

#[inline(always)]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of the commit counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    /// Single-cell commits attempted
    pub single_attempts: u64,
    /// Single-cell commits that succeeded
    pub single_commits: u64,
    /// Multi-cell commits that tried the hardware path
    pub htm_attempts: u64,
    /// Multi-cell commits applied by a hardware transaction
    pub htm_commits: u64,
    /// Aborted hardware transactions, including retried ones
    pub htm_aborts: u64,
    /// Multi-cell commits that went through a pool slot
    pub helping_attempts: u64,
    /// Slot-based commits that succeeded
    pub helping_commits: u64,
    /// Foreign transactions this process stepped in for
    pub helps: u64,
    /// Foreign transactions forced from undefined to failed
    pub forced_aborts: u64,
    /// Succeeded foreign transactions swept on their owner's behalf
    pub completions: u64,
    /// Slot allocations that found the pool exhausted
    pub pool_waits: u64,
}

impl CommitStats {
    /// Total successful commits across strategies (empty commits excluded)
    pub fn commits(&self) -> u64 {
        self.single_commits + self.htm_commits + self.helping_commits
    }
}

/// Read the current counters
pub fn stats() -> CommitStats {
    let c = &COUNTERS;
    let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
    CommitStats {
        single_attempts: load(&c.single_attempts),
        single_commits: load(&c.single_commits),
        htm_attempts: load(&c.htm_attempts),
        htm_commits: load(&c.htm_commits),
        htm_aborts: load(&c.htm_aborts),
        helping_attempts: load(&c.helping_attempts),
        helping_commits: load(&c.helping_commits),
        helps: load(&c.helps),
        forced_aborts: load(&c.forced_aborts),
        completions: load(&c.completions),
        pool_waits: load(&c.pool_waits),
    }
}

/// Zero every counter
pub fn reset_stats() {
    for counter in COUNTERS.all() {
        counter.store(0, Ordering::Relaxed);
    }
}
