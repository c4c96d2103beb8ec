//! Shared cell: a 64-bit value paired with a 64-bit owner tag

use portable_atomic::{AtomicU128, Ordering};
use std::fmt;

/// Owner tag of a cell no transaction is coordinating
pub const NO_OWNER: u64 = 0;

/// A 128-bit aligned, atomically updatable 64-bit value.
///
/// The low word holds the value, the high word holds the id of the pool
/// slot currently coordinating a pending multi-cell update (or
/// [`NO_OWNER`]). Both words only ever change together through
/// [`AtomicCell::compare_exchange`].
#[repr(C, align(16))]
pub struct AtomicCell {
    raw: AtomicU128,
}

#[inline(always)]
const fn pack(value: u64, owner: u64) -> u128 {
    ((owner as u128) << 64) | value as u128
}

#[inline(always)]
const fn unpack(raw: u128) -> (u64, u64) {
    (raw as u64, (raw >> 64) as u64)
}

impl AtomicCell {
    /// Create an unclaimed cell holding `value`
    pub const fn new(value: u64) -> Self {
        Self {
            raw: AtomicU128::new(pack(value, NO_OWNER)),
        }
    }

    /// Read the value word
    #[inline]
    pub fn load(&self) -> u64 {
        self.load_pair().0
    }

    /// Read `(value, owner)` as one snapshot
    #[inline]
    pub fn load_pair(&self) -> (u64, u64) {
        unpack(self.raw.load(Ordering::SeqCst))
    }

    /// Check whether a pending multi-cell update owns this cell
    #[inline]
    pub fn is_claimed(&self) -> bool {
        self.load_pair().1 != NO_OWNER
    }

    /// Double-word compare-and-swap.
    ///
    /// Replaces `(value, owner)` with `new` iff both words equal `expected`.
    /// On failure returns the pair that was observed instead.
    #[inline]
    pub fn compare_exchange(&self, expected: (u64, u64), new: (u64, u64)) -> Result<(), (u64, u64)> {
        self.raw
            .compare_exchange(
                pack(expected.0, expected.1),
                pack(new.0, new.1),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(unpack)
    }

    /// Unconditional write of an unclaimed value.
    ///
    /// Only sound inside a hardware transaction that already verified the
    /// expected pair, where the read and this write commit together.
    #[inline(always)]
    pub(crate) fn store_unclaimed(&self, value: u64) {
        self.raw.store(pack(value, NO_OWNER), Ordering::SeqCst);
    }

    /// Whether the double-word primitive is lock-free on this machine
    pub fn is_lock_free() -> bool {
        AtomicU128::is_lock_free()
    }
}

impl Default for AtomicCell {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for AtomicCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (value, owner) = self.load_pair();
        f.debug_struct("AtomicCell")
            .field("value", &format_args!("0x{:x}", value))
            .field("owner", &owner)
            .finish()
    }
}
