//! Commit protocol
//!
//! A commit is dispatched on the number of participants:
//!
//! - one cell: a single double-word CAS on `(old, unclaimed)`;
//! - two or more cells with RTM available: one hardware transaction,
//!   falling back to the slot protocol when it cannot finish;
//! - otherwise the slot protocol. The committing thread claims a pool
//!   slot, publishes its participants there and installs the slot id as
//!   owner tag on every cell. Flipping the slot status from `Undefined`
//!   to `Succeeded` is the linearization point; a final sweep writes the
//!   new (or restores the old) values and clears the owner tags.
//!
//! A thread that finds a cell claimed by another slot never waits for
//! it: it forces that slot to `Failed` if it is still undecided, or
//! finishes its sweep if it already succeeded.

use crate::cell::{AtomicCell, NO_OWNER};
use crate::htm::{self, HtmOutcome};
use crate::pool::{pool, Slot, SlotId, SlotPool, Status};
use crate::runtime::{self, Capabilities};
use crate::stats::{self, COUNTERS};
use crate::transaction::Participant;
use crossbeam::utils::Backoff;

/// Execution strategy for one commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Nothing to apply
    Empty,
    /// Plain double-word compare-and-swap
    Single,
    /// Hardware transaction, falling back to `Helping`
    Hardware,
    /// Slot-based multi-word compare-and-swap
    Helping,
}

impl Strategy {
    pub fn select(participants: usize, htm_enabled: bool) -> Self {
        match participants {
            0 => Self::Empty,
            1 => Self::Single,
            _ if htm_enabled => Self::Hardware,
            _ => Self::Helping,
        }
    }
}

pub(crate) fn commit(participants: &[Participant<'_>]) -> bool {
    let caps = runtime::capabilities();

    match Strategy::select(participants.len(), caps.htm_enabled) {
        Strategy::Empty => true,
        Strategy::Single => commit_single(&participants[0]),
        Strategy::Hardware => match htm::commit(participants, caps.htm_retries) {
            HtmOutcome::Committed => true,
            HtmOutcome::Mismatch => false,
            HtmOutcome::Fallback => commit_helping(participants, &caps),
        },
        Strategy::Helping => commit_helping(participants, &caps),
    }
}

fn commit_single(p: &Participant<'_>) -> bool {
    stats::bump(&COUNTERS.single_attempts);
    let cell = p.cell();

    loop {
        let (value, owner) = cell.load_pair();
        if owner != NO_OWNER {
            help(pool(), owner);
            continue;
        }
        if value != p.old() {
            return false;
        }
        if cell
            .compare_exchange((p.old(), NO_OWNER), (p.new_value(), NO_OWNER))
            .is_ok()
        {
            stats::bump(&COUNTERS.single_commits);
            return true;
        }
    }
}

fn commit_helping(participants: &[Participant<'_>], caps: &Capabilities) -> bool {
    stats::bump(&COUNTERS.helping_attempts);
    let pool = pool();
    let id = pool.allocate(caps.pool_spin_limit);
    let slot = pool.slot(id);
    slot.publish(participants);

    let tag = slot.tag();
    install(pool, slot, tag, participants);

    let status = match slot.resolve(Status::Succeeded) {
        Ok(status) | Err(status) => status,
    };

    // SAFETY: we hold the allocator's reference and every cell is borrowed
    // by the caller until we return
    unsafe { sweep(slot, tag, status) };

    // Helpers may still dereference our cells; they must be gone before
    // the caller's borrows end.
    pool.release(id);

    tracing::trace!("slot {} commit finished as {:?}", id.index(), status);

    let succeeded = status == Status::Succeeded;
    if succeeded {
        stats::bump(&COUNTERS.helping_commits);
    }
    succeeded
}

/// Claim every participant's cell for the slot's transaction, in order.
///
/// Stops early once the slot is decided, which happens when a captured
/// value is stale or another thread aborted us.
fn install(pool: &SlotPool, slot: &Slot, tag: u64, participants: &[Participant<'_>]) {
    for p in participants {
        loop {
            if slot.status() != Status::Undefined {
                return;
            }

            match p.cell().compare_exchange((p.old(), NO_OWNER), (p.old(), tag)) {
                Ok(()) => break,
                Err((value, NO_OWNER)) => {
                    if value != p.old() {
                        let _ = slot.resolve(Status::Failed);
                        return;
                    }
                }
                Err((_, owner)) => help(pool, owner),
            }
        }
    }
}

/// Drive the transaction owning a cell to completion.
///
/// An undecided transaction gets a short, bounded grace period and is then
/// forced to `Failed`; a decided one gets its sweep performed here. Returns
/// without doing anything if the tagged transaction already released its
/// slot, in which case the caller simply rereads the cell.
pub(crate) fn help(pool: &SlotPool, tag: u64) {
    let Some(id) = SlotId::from_tag(tag) else {
        debug_assert!(false, "invalid owner tag {}", tag);
        return;
    };

    if !pool.try_ref(id) {
        return;
    }

    let slot = pool.slot(id);
    if slot.tag() != tag {
        // Slot reused by another transaction since the cell was read
        pool.unref(id);
        return;
    }

    stats::bump(&COUNTERS.helps);

    let backoff = Backoff::new();
    while slot.status() == Status::Undefined && !backoff.is_completed() {
        backoff.snooze();
    }

    let status = match slot.resolve(Status::Failed) {
        Ok(status) => {
            stats::bump(&COUNTERS.forced_aborts);
            tracing::trace!("aborted undecided transaction in slot {}", id.index());
            status
        }
        Err(status) => {
            if status == Status::Succeeded {
                stats::bump(&COUNTERS.completions);
            }
            status
        }
    };

    // SAFETY: our reference keeps the slot's owner inside `commit`, which
    // keeps its cells borrowed
    unsafe { sweep(slot, tag, status) };

    pool.unref(id);
}

/// Release every cell still tagged with `tag`, writing the new value if
/// the transaction succeeded and restoring the old one otherwise.
///
/// # Safety
/// The caller must hold a reference on the slot, `tag` must be its current
/// owner tag and `status` must be terminal.
unsafe fn sweep(slot: &Slot, tag: u64, status: Status) {
    debug_assert_ne!(status, Status::Undefined);
    let succeeded = status == Status::Succeeded;

    for entry in slot.entries() {
        let cell: &AtomicCell = &*entry.cell;
        let value = if succeeded { entry.new } else { entry.old };
        let _ = cell.compare_exchange((entry.old, tag), (value, NO_OWNER));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// A slot-based transaction that claimed its cells and then stalled
    struct FrozenTransaction {
        id: SlotId,
    }

    impl FrozenTransaction {
        fn claim(participants: &[Participant<'_>]) -> Self {
            let pool = pool();
            let id = pool.allocate(0);
            let tag = pool.slot(id).tag();
            pool.slot(id).publish(participants);
            for p in participants {
                assert!(p
                    .cell()
                    .compare_exchange((p.old(), NO_OWNER), (p.old(), tag))
                    .is_ok());
            }
            Self { id }
        }

        fn claim_and_succeed(participants: &[Participant<'_>]) -> Self {
            let frozen = Self::claim(participants);
            assert_eq!(
                pool().slot(frozen.id).resolve(Status::Succeeded),
                Ok(Status::Succeeded)
            );
            frozen
        }

        /// Resume the stalled owner: decide, sweep, release
        fn thaw(self) -> Status {
            let pool = pool();
            let slot = pool.slot(self.id);
            let status = match slot.resolve(Status::Succeeded) {
                Ok(status) | Err(status) => status,
            };
            unsafe { sweep(slot, slot.tag(), status) };
            pool.release(self.id);
            status
        }
    }

    #[test]
    fn test_strategy_select() {
        assert_eq!(Strategy::select(0, true), Strategy::Empty);
        assert_eq!(Strategy::select(1, true), Strategy::Single);
        assert_eq!(Strategy::select(2, true), Strategy::Hardware);
        assert_eq!(Strategy::select(2, false), Strategy::Helping);
        assert_eq!(Strategy::select(10, false), Strategy::Helping);
    }

    #[test]
    fn test_helping_commit_applies_all() {
        let cells: Vec<_> = (0..4).map(AtomicCell::new).collect();
        let mut tx = Transaction::new();
        for cell in &cells {
            let p = tx.load(cell);
            let old = p.old();
            p.set(old + 100);
        }

        assert!(commit_helping(tx.participants(), &runtime::capabilities()));
        for (i, cell) in cells.iter().enumerate() {
            assert_eq!(cell.load_pair(), (i as u64 + 100, NO_OWNER));
        }
    }

    #[test]
    fn test_helping_commit_stale_value_changes_nothing() {
        let a = AtomicCell::new(1);
        let b = AtomicCell::new(2);
        let c = AtomicCell::new(3);
        let mut tx = Transaction::new();
        tx.load(&a).set(10);
        tx.load(&b).set(20);
        tx.load(&c).set(30);

        assert!(c.compare_exchange((3, 0), (4, 0)).is_ok());

        assert!(!commit_helping(tx.participants(), &runtime::capabilities()));
        assert_eq!(a.load_pair(), (1, NO_OWNER));
        assert_eq!(b.load_pair(), (2, NO_OWNER));
        assert_eq!(c.load_pair(), (4, NO_OWNER));
    }

    #[test]
    fn test_reloaded_cell_written_once() {
        let a = AtomicCell::new(5);
        let b = AtomicCell::new(6);
        let mut tx = Transaction::new();
        tx.load(&a).set(50);
        tx.load(&b).set(60);
        tx.load(&a).set(51);
        assert_eq!(tx.len(), 2);

        assert!(commit_helping(tx.participants(), &runtime::capabilities()));
        assert_eq!(a.load_pair(), (51, NO_OWNER));
        assert_eq!(b.load_pair(), (60, NO_OWNER));

        // Same result whichever strategy the runtime picks
        let c = AtomicCell::new(5);
        let d = AtomicCell::new(6);
        let mut tx = Transaction::new();
        tx.load(&c).set(50);
        tx.load(&d).set(60);
        tx.load(&c).set(51);
        assert!(tx.commit());
        assert_eq!(c.load_pair(), (51, NO_OWNER));
        assert_eq!(d.load_pair(), (60, NO_OWNER));
    }

    #[test]
    fn test_single_commit_aborts_frozen_owner() {
        let a = AtomicCell::new(1);
        let b = AtomicCell::new(2);

        let mut stalled = Transaction::new();
        stalled.load(&a).set(100);
        stalled.load(&b).set(200);
        let frozen = FrozenTransaction::claim(stalled.participants());
        assert!(a.is_claimed());

        let mut tx = Transaction::new();
        tx.load(&a).set(11);
        assert!(tx.commit());
        assert_eq!(a.load_pair(), (11, NO_OWNER));
        // The stalled transaction was aborted and released its other cell too
        assert_eq!(b.load_pair(), (2, NO_OWNER));

        assert_eq!(frozen.thaw(), Status::Failed);
        assert_eq!(a.load(), 11);
        assert_eq!(b.load(), 2);
    }

    #[test]
    fn test_multi_cell_commit_aborts_frozen_owner() {
        let a = AtomicCell::new(1);
        let b = AtomicCell::new(2);
        let c = AtomicCell::new(3);

        let mut stalled = Transaction::new();
        stalled.load(&a).set(100);
        stalled.load(&b).set(200);
        let frozen = FrozenTransaction::claim(stalled.participants());

        // Whichever strategy the runtime picks, the claimed cells get
        // released and the commit goes through
        let mut tx = Transaction::new();
        tx.load(&b).set(22);
        tx.load(&c).set(33);
        assert!(commit(tx.participants()));

        assert_eq!(a.load_pair(), (1, NO_OWNER));
        assert_eq!(b.load_pair(), (22, NO_OWNER));
        assert_eq!(c.load_pair(), (33, NO_OWNER));
        assert_eq!(frozen.thaw(), Status::Failed);
    }

    #[test]
    fn test_helping_commit_completes_succeeded_owner() {
        let a = AtomicCell::new(1);
        let b = AtomicCell::new(2);
        let c = AtomicCell::new(3);

        let mut stalled = Transaction::new();
        stalled.load(&a).set(10);
        stalled.load(&b).set(20);
        let frozen = FrozenTransaction::claim_and_succeed(stalled.participants());

        // Captured before the stalled transaction's writes land
        let mut tx = Transaction::new();
        tx.load(&b).set(0);
        tx.load(&c).set(0);
        assert!(!commit_helping(tx.participants(), &runtime::capabilities()));

        // Our failed attempt finished the stalled transaction's sweep
        assert_eq!(a.load_pair(), (10, NO_OWNER));
        assert_eq!(b.load_pair(), (20, NO_OWNER));

        tx.cancel();
        tx.load(&b).set(21);
        tx.load(&c).set(31);
        assert!(commit_helping(tx.participants(), &runtime::capabilities()));
        assert_eq!(b.load(), 21);
        assert_eq!(c.load(), 31);

        assert_eq!(frozen.thaw(), Status::Succeeded);
        assert_eq!(a.load(), 10);
    }

    #[test]
    fn test_frozen_owner_does_not_block_other_thread() {
        let cells = Arc::new([AtomicCell::new(7), AtomicCell::new(8)]);

        let mut stalled = Transaction::new();
        stalled.load(&cells[0]).set(70);
        stalled.load(&cells[1]).set(80);
        let frozen = FrozenTransaction::claim(stalled.participants());

        let done = Arc::new(AtomicBool::new(false));
        let worker = {
            let cells = Arc::clone(&cells);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                crate::retry::transaction(|tx| {
                    let a = tx.load(&cells[0]);
                    let value = a.old();
                    a.set(value + 1);
                    let b = tx.load(&cells[1]);
                    let value = b.old();
                    b.set(value + 1);
                });
                done.store(true, Ordering::Release);
            })
        };

        // The worker finishes while the owner is still frozen
        let mut waited = 0;
        while !done.load(Ordering::Acquire) && waited < 5000 {
            thread::sleep(Duration::from_millis(1));
            waited += 1;
        }
        assert!(done.load(Ordering::Acquire));
        worker.join().unwrap();

        assert_eq!(cells[0].load_pair(), (8, NO_OWNER));
        assert_eq!(cells[1].load_pair(), (9, NO_OWNER));
        assert_eq!(frozen.thaw(), Status::Failed);
    }
}
