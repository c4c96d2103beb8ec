//! Retry wrappers around a transaction body

use crate::transaction::Transaction;
use crossbeam::utils::Backoff;

/// Run `body` until its transaction commits and return the body's result.
///
/// Each attempt starts from an empty record, so the body must reload every
/// cell it needs. Failed attempts back off before retrying.
///
/// ```
/// use oc_atomic::{transaction, AtomicCell};
///
/// let from = AtomicCell::new(100);
/// let to = AtomicCell::new(0);
///
/// let moved = transaction(|tx| {
///     let src = tx.load(&from);
///     let amount = src.old() / 2;
///     src.set(src.old() - amount);
///     let dst = tx.load(&to);
///     dst.set(dst.old() + amount);
///     amount
/// });
///
/// assert_eq!(moved, 50);
/// assert_eq!(from.load() + to.load(), 100);
/// ```
pub fn transaction<'a, R, F>(mut body: F) -> R
where
    F: FnMut(&mut Transaction<'a>) -> R,
{
    let mut tx = Transaction::new();
    let backoff = Backoff::new();

    loop {
        tx.cancel();
        let result = body(&mut tx);
        if tx.commit() {
            return result;
        }
        backoff.snooze();
    }
}

/// Like [`transaction`], but the body may decline to commit.
///
/// Returning `None` from the body abandons the attempt without touching
/// any cell and returns `None`.
pub fn try_transaction<'a, R, F>(mut body: F) -> Option<R>
where
    F: FnMut(&mut Transaction<'a>) -> Option<R>,
{
    let mut tx = Transaction::new();
    let backoff = Backoff::new();

    loop {
        tx.cancel();
        let result = body(&mut tx)?;
        if tx.commit() {
            return Some(result);
        }
        backoff.snooze();
    }
}
