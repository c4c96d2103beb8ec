//! Slot pool for slow-path transaction bookkeeping
//!
//! A fixed array of [`SLOT_COUNT`] slots addressed by index, plus one
//! allocation bit per slot. Each slot carries a packed state word: the
//! low two bits hold the transaction [`Status`], the rest is a reference
//! count. A slot's bit stays set while its reference count is non-zero.
//!
//! The owner tag written into cells is the slot index combined with a
//! generation that changes on every allocation, so a stale tag never
//! matches a later transaction reusing the same slot.

use crate::cell::AtomicCell;
use crate::stats::{self, COUNTERS};
use crate::transaction::{Participant, MAX_PARTICIPANTS};
use crossbeam::utils::{Backoff, CachePadded};
use once_cell::sync::Lazy;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Number of slots, including the reserved slot 0
pub const SLOT_COUNT: usize = 4096;

const BITMAP_WORDS: usize = SLOT_COUNT / 64;

const INDEX_BITS: u32 = 12;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const _: () = assert!(SLOT_COUNT == 1 << INDEX_BITS);

const STATUS_MASK: u64 = 0b11;
const REF_ONE: u64 = 1 << 2;

static POOL: Lazy<SlotPool> = Lazy::new(SlotPool::new);

/// The process-wide slot pool
pub(crate) fn pool() -> &'static SlotPool {
    &POOL
}

/// Outcome of a slot's transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Undefined = 0,
    Failed = 1,
    Succeeded = 2,
}

impl Status {
    fn from_state(state: u64) -> Self {
        match state & STATUS_MASK {
            0 => Self::Undefined,
            1 => Self::Failed,
            _ => Self::Succeeded,
        }
    }
}

/// Index of a slot in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotId(u32);

impl SlotId {
    /// Slot index named by an owner tag. Slot 0 means "no transaction".
    pub(crate) fn from_tag(tag: u64) -> Option<Self> {
        match tag & INDEX_MASK {
            0 => None,
            index => Some(Self(index as u32)),
        }
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Published copy of one participant
struct SlotEntry {
    cell: AtomicPtr<AtomicCell>,
    old: AtomicU64,
    new: AtomicU64,
}

impl SlotEntry {
    const fn new() -> Self {
        Self {
            cell: AtomicPtr::new(std::ptr::null_mut()),
            old: AtomicU64::new(0),
            new: AtomicU64::new(0),
        }
    }
}

/// Snapshot of a published participant
#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    pub cell: *const AtomicCell,
    pub old: u64,
    pub new: u64,
}

/// Transaction-shaped bookkeeping slot
#[repr(C, align(64))]
pub(crate) struct Slot {
    state: AtomicU64,
    tag: AtomicU64,
    len: AtomicUsize,
    entries: [SlotEntry; MAX_PARTICIPANTS],
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            tag: AtomicU64::new(0),
            len: AtomicUsize::new(0),
            entries: [const { SlotEntry::new() }; MAX_PARTICIPANTS],
        }
    }

    #[inline]
    pub(crate) fn status(&self) -> Status {
        Status::from_state(self.state.load(Ordering::Acquire))
    }

    /// Owner tag of the slot's current transaction
    #[inline]
    pub(crate) fn tag(&self) -> u64 {
        self.tag.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn refs(&self) -> u64 {
        self.state.load(Ordering::Acquire) >> 2
    }

    /// Move the status from `Undefined` to `to`.
    ///
    /// Returns `Ok(to)` if this call made the transition, or `Err(status)`
    /// with the terminal status someone else already set.
    pub(crate) fn resolve(&self, to: Status) -> Result<Status, Status> {
        debug_assert_ne!(to, Status::Undefined);
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let status = Status::from_state(current);
            if status != Status::Undefined {
                return Err(status);
            }
            match self.state.compare_exchange_weak(
                current,
                (current & !STATUS_MASK) | to as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(to),
                Err(actual) => current = actual,
            }
        }
    }

    /// Copy the participant list into the slot and publish its length.
    pub(crate) fn publish(&self, participants: &[Participant<'_>]) {
        debug_assert!(participants.len() <= MAX_PARTICIPANTS);
        for (entry, p) in self.entries.iter().zip(participants) {
            entry
                .cell
                .store(p.cell() as *const AtomicCell as *mut AtomicCell, Ordering::Relaxed);
            entry.old.store(p.old(), Ordering::Relaxed);
            entry.new.store(p.new_value(), Ordering::Relaxed);
        }
        self.len.store(participants.len(), Ordering::Release);
    }

    /// Read back the published participants.
    ///
    /// Only meaningful while the caller holds a reference on the slot.
    pub(crate) fn entries(&self) -> impl Iterator<Item = Entry> + '_ {
        let len = self.len.load(Ordering::Acquire);
        self.entries[..len].iter().map(|entry| Entry {
            cell: entry.cell.load(Ordering::Relaxed),
            old: entry.old.load(Ordering::Relaxed),
            new: entry.new.load(Ordering::Relaxed),
        })
    }

    fn activate(&self, id: SlotId) {
        debug_assert_eq!(self.refs(), 0);
        let generation = (self.tag.load(Ordering::Relaxed) >> INDEX_BITS) + 1;
        self.tag
            .store((generation << INDEX_BITS) | id.index() as u64, Ordering::Relaxed);
        self.len.store(0, Ordering::Relaxed);
        self.state
            .store(REF_ONE | Status::Undefined as u64, Ordering::Release);
    }
}

/// Fixed-size pool of slots with a bitmap allocator
pub(crate) struct SlotPool {
    slots: Box<[Slot]>,
    bitmap: Box<[CachePadded<AtomicU64>]>,
    exhausted: AtomicBool,
}

impl SlotPool {
    pub(crate) fn new() -> Self {
        let slots = (0..SLOT_COUNT)
            .map(|_| Slot::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        // Slot 0 is the "no transaction" sentinel and is never handed out
        let bitmap = (0..BITMAP_WORDS)
            .map(|word| CachePadded::new(AtomicU64::new(u64::from(word == 0))))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            bitmap,
            exhausted: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn slot(&self, id: SlotId) -> &Slot {
        &self.slots[id.index()]
    }

    /// Claim a free slot.
    ///
    /// The returned slot holds exactly one reference (the caller's) and
    /// status `Undefined`. Spins while the pool is exhausted; after
    /// `spin_limit` fruitless scans it yields the thread between scans.
    pub(crate) fn allocate(&self, spin_limit: u32) -> SlotId {
        let backoff = Backoff::new();
        let mut scans = 0u32;

        loop {
            let start = next_random() as usize % BITMAP_WORDS;

            for i in 0..BITMAP_WORDS {
                let word_index = (start + i) % BITMAP_WORDS;
                let word = &self.bitmap[word_index];
                let mut bits = word.load(Ordering::Relaxed);

                while bits != u64::MAX {
                    let bit = (!bits).trailing_zeros() as usize;
                    let mask = 1u64 << bit;
                    let previous = word.fetch_or(mask, Ordering::AcqRel);

                    if previous & mask == 0 {
                        let id = SlotId((word_index * 64 + bit) as u32);
                        self.slot(id).activate(id);
                        if scans > 0 && self.exhausted.swap(false, Ordering::Relaxed) {
                            tracing::debug!("slot pool recovered after {} scans", scans);
                        }
                        return id;
                    }

                    bits = previous | mask;
                }
            }

            scans += 1;
            if scans == 1 {
                stats::bump(&COUNTERS.pool_waits);
                if !self.exhausted.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        "all {} transaction slots in use, waiting for one to be released",
                        SLOT_COUNT - 1
                    );
                }
            }

            if scans <= spin_limit {
                backoff.spin();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Take a reference on a slot that is still alive.
    ///
    /// Fails if the reference count is already zero.
    pub(crate) fn try_ref(&self, id: SlotId) -> bool {
        let state = &self.slot(id).state;
        let mut current = state.load(Ordering::Acquire);
        loop {
            if current >> 2 == 0 {
                return false;
            }
            match state.compare_exchange_weak(
                current,
                current + REF_ONE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a reference; the last one returns the slot to the allocator.
    pub(crate) fn unref(&self, id: SlotId) {
        let previous = self.slot(id).state.fetch_sub(REF_ONE, Ordering::AcqRel);
        debug_assert!(previous >> 2 > 0, "slot {} released too often", id.index());

        if previous >> 2 == 1 {
            self.recycle(id);
        }
    }

    /// Drop the owner's reference once no helper holds one.
    ///
    /// The last reference goes from one to zero in a single CAS, so a
    /// helper can never take a reference after the owner stopped waiting.
    /// Blocks for as long as some helper keeps its reference.
    pub(crate) fn release(&self, id: SlotId) {
        let state = &self.slot(id).state;
        let backoff = Backoff::new();
        let mut current = state.load(Ordering::Acquire);

        loop {
            debug_assert!(current >> 2 > 0, "slot {} released too often", id.index());
            if current >> 2 != 1 {
                backoff.snooze();
                current = state.load(Ordering::Acquire);
                continue;
            }

            match state.compare_exchange_weak(
                current,
                current - REF_ONE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.recycle(id);
    }

    // Nobody can revive a slot at zero references, so the bit can be
    // cleared separately.
    fn recycle(&self, id: SlotId) {
        self.slot(id).len.store(0, Ordering::Relaxed);
        let mask = 1u64 << (id.index() % 64);
        self.bitmap[id.index() / 64].fetch_and(!mask, Ordering::Release);
    }

    /// Whether the slot's allocation bit is set
    #[cfg(test)]
    fn is_allocated(&self, id: SlotId) -> bool {
        let mask = 1u64 << (id.index() % 64);
        self.bitmap[id.index() / 64].load(Ordering::Acquire) & mask != 0
    }
}

thread_local! {
    static RNG: Cell<u32> = Cell::new(seed());
}

fn seed() -> u32 {
    static NEXT_SEED: AtomicU32 = AtomicU32::new(0x2545_f491);
    NEXT_SEED.fetch_add(0x9e37_79b9, Ordering::Relaxed) | 1
}

/// Per-thread xorshift32 used to spread allocation start points
fn next_random() -> u32 {
    RNG.with(|rng| {
        let mut x = rng.get();
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        rng.set(x);
        x
    })
}
