//! Restricted hardware transactional memory fast path
//!
//! On x86_64 CPUs that report RTM, a multi-cell commit first tries to
//! verify and write every cell inside one hardware transaction. A cell
//! claimed by a slot-based transaction is helped from outside and the
//! hardware path retried. Once the retries run out, or the abort is not
//! retryable, the caller falls back to the slot-based protocol.

use crate::cell::NO_OWNER;
#[cfg(target_arch = "x86_64")]
use crate::commit;
#[cfg(target_arch = "x86_64")]
use crate::pool::pool;
use crate::stats::{self, COUNTERS};
use crate::transaction::Participant;

/// Result of a hardware attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HtmOutcome {
    /// Every cell was verified and written
    Committed,
    /// Some cell no longer holds its captured value
    Mismatch,
    /// Use the slot-based protocol instead
    Fallback,
}

/// Whether the CPU reports restricted transactional memory
pub fn rtm_supported() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::{__cpuid, __cpuid_count};

        // SAFETY: cpuid is available on every x86_64 CPU
        #[allow(unused_unsafe)]
        let max_leaf = unsafe { __cpuid(0) }.eax;
        if max_leaf < 7 {
            return false;
        }
        #[allow(unused_unsafe)]
        let features = unsafe { __cpuid_count(7, 0) };
        features.ebx & (1 << 11) != 0
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

#[cfg(target_arch = "x86_64")]
mod rtm {
    use std::arch::asm;

    pub const STARTED: u32 = !0;
    pub const ABORT_EXPLICIT: u32 = 1 << 0;
    pub const ABORT_RETRY: u32 = 1 << 1;
    pub const ABORT_CONFLICT: u32 = 1 << 2;

    pub const CODE_MISMATCH: u32 = 0x01;
    pub const CODE_BUSY: u32 = 0x02;

    #[inline(always)]
    pub fn abort_code(status: u32) -> u32 {
        status >> 24
    }

    /// Begin a transaction. Returns `STARTED` inside it, or the abort
    /// status once it has been rolled back.
    #[inline(always)]
    pub unsafe fn begin() -> u32 {
        let status: u32;
        asm!(
            "mov eax, -1",
            "xbegin 2f",
            "2:",
            out("eax") status,
            options(nostack),
        );
        status
    }

    #[inline(always)]
    pub unsafe fn end() {
        asm!("xend", options(nostack));
    }

    #[inline(always)]
    pub unsafe fn abort_mismatch() {
        asm!("xabort 0x01", options(nostack));
    }

    #[inline(always)]
    pub unsafe fn abort_busy() {
        asm!("xabort 0x02", options(nostack));
    }
}

/// One hardware transaction over every participant.
///
/// # Safety
/// The CPU must support RTM.
#[cfg(target_arch = "x86_64")]
unsafe fn attempt(participants: &[Participant<'_>]) -> u32 {
    let status = rtm::begin();
    if status != rtm::STARTED {
        return status;
    }

    for p in participants {
        let (value, owner) = p.cell().load_pair();
        if owner != NO_OWNER {
            rtm::abort_busy();
            return 0;
        }
        if value != p.old() {
            rtm::abort_mismatch();
            return 0;
        }
    }

    for p in participants {
        p.cell().store_unclaimed(p.new_value());
    }

    rtm::end();
    rtm::STARTED
}

/// Try to commit `participants` with hardware transactions.
///
/// Transient aborts are retried up to `retries` times. So are aborts on a
/// cell claimed by a slot-based transaction, after helping that
/// transaction along from outside the hardware transaction.
#[cfg(target_arch = "x86_64")]
pub(crate) fn commit(participants: &[Participant<'_>], retries: u32) -> HtmOutcome {
    stats::bump(&COUNTERS.htm_attempts);
    let mut attempts = 0;

    loop {
        // SAFETY: the runtime only enables this path when RTM was detected
        let status = unsafe { attempt(participants) };
        if status == rtm::STARTED {
            stats::bump(&COUNTERS.htm_commits);
            return HtmOutcome::Committed;
        }

        stats::bump(&COUNTERS.htm_aborts);

        let retryable = if status & rtm::ABORT_EXPLICIT != 0 {
            match rtm::abort_code(status) {
                rtm::CODE_MISMATCH => return HtmOutcome::Mismatch,
                rtm::CODE_BUSY => {
                    help_claimed(participants);
                    true
                }
                _ => false,
            }
        } else {
            status & (rtm::ABORT_RETRY | rtm::ABORT_CONFLICT) != 0
        };

        if retryable && attempts < retries {
            attempts += 1;
            std::hint::spin_loop();
            continue;
        }

        tracing::trace!(
            "hardware transaction gave up after {} retries (status 0x{:x})",
            attempts,
            status
        );
        return HtmOutcome::Fallback;
    }
}

/// Help every slot-based transaction still holding one of our cells
#[cfg(target_arch = "x86_64")]
fn help_claimed(participants: &[Participant<'_>]) {
    for p in participants {
        let (_, owner) = p.cell().load_pair();
        if owner != NO_OWNER {
            commit::help(pool(), owner);
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub(crate) fn commit(_participants: &[Participant<'_>], _retries: u32) -> HtmOutcome {
    HtmOutcome::Fallback
}
