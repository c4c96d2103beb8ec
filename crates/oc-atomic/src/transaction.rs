//! Transaction record: the caller-facing builder for a multi-cell update

use crate::cell::AtomicCell;
use crate::commit;
use oc_core::error::AtomicError;

/// Maximum number of cells in one transaction
pub const MAX_PARTICIPANTS: usize = 10;

/// One cell's captured and desired value inside a transaction
#[derive(Debug)]
pub struct Participant<'a> {
    cell: &'a AtomicCell,
    old: u64,
    new: u64,
}

impl<'a> Participant<'a> {
    /// The cell this participant updates
    #[inline]
    pub fn cell(&self) -> &'a AtomicCell {
        self.cell
    }

    /// Value observed when the cell was loaded
    #[inline]
    pub fn old(&self) -> u64 {
        self.old
    }

    /// Value written on a successful commit
    #[inline]
    pub fn new_value(&self) -> u64 {
        self.new
    }

    /// Set the value to write on commit
    #[inline]
    pub fn set(&mut self, value: u64) {
        self.new = value;
    }

    #[inline]
    pub fn is_modified(&self) -> bool {
        self.old != self.new
    }
}

/// An ordered set of cells to update together.
///
/// Build it with [`Transaction::load`], set the new values, then call
/// [`Transaction::commit`]. A record that was never committed holds no
/// shared resources and can be dropped or [`cancel`](Transaction::cancel)ed
/// freely.
#[derive(Debug)]
pub struct Transaction<'a> {
    participants: Vec<Participant<'a>>,
}

impl<'a> Transaction<'a> {
    pub fn new() -> Self {
        Self {
            participants: Vec::with_capacity(MAX_PARTICIPANTS),
        }
    }

    /// Add `cell`, capturing its current value as both old and new.
    ///
    /// Loading a cell the transaction already holds returns its existing
    /// participant unchanged, so each cell is written at most once and the
    /// last [`Participant::set`] wins.
    ///
    /// # Panics
    /// Panics if the transaction already holds [`MAX_PARTICIPANTS`] cells.
    pub fn load(&mut self, cell: &'a AtomicCell) -> &mut Participant<'a> {
        match self.try_load(cell) {
            Ok(participant) => participant,
            Err(err) => panic!("{}", err),
        }
    }

    /// Fallible variant of [`Transaction::load`]
    pub fn try_load(&mut self, cell: &'a AtomicCell) -> Result<&mut Participant<'a>, AtomicError> {
        if let Some(index) = self
            .participants
            .iter()
            .position(|p| std::ptr::eq(p.cell, cell))
        {
            return Ok(&mut self.participants[index]);
        }

        let index = self.participants.len();
        if index >= MAX_PARTICIPANTS {
            return Err(AtomicError::CapacityExceeded {
                capacity: MAX_PARTICIPANTS,
            });
        }

        let value = cell.load();
        self.participants.push(Participant {
            cell,
            old: value,
            new: value,
        });
        Ok(&mut self.participants[index])
    }

    /// Forget every participant so the record can be reused
    pub fn cancel(&mut self) {
        self.participants.clear();
    }

    /// Apply every participant's new value atomically.
    ///
    /// Returns `false` without changing any cell if some cell no longer
    /// holds its captured value; reload and try again in that case.
    pub fn commit(&mut self) -> bool {
        commit::commit(&self.participants)
    }

    pub fn participants(&self) -> &[Participant<'a>] {
        &self.participants
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

impl Default for Transaction<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_captures_value() {
        let cell = AtomicCell::new(7);
        let mut tx = Transaction::new();

        let p = tx.load(&cell);
        assert_eq!(p.old(), 7);
        assert_eq!(p.new_value(), 7);
        assert!(!p.is_modified());

        p.set(8);
        assert!(p.is_modified());
        assert_eq!(tx.len(), 1);
        // Nothing is written before commit
        assert_eq!(cell.load(), 7);
    }

    #[test]
    fn test_reload_returns_same_participant() {
        let a = AtomicCell::new(5);
        let b = AtomicCell::new(6);
        let mut tx = Transaction::new();

        tx.load(&a).set(50);
        tx.load(&b).set(60);
        let again = tx.load(&a);
        assert_eq!(again.old(), 5);
        assert_eq!(again.new_value(), 50);
        again.set(51);

        assert_eq!(tx.len(), 2);
        assert!(tx.commit());
        assert_eq!(a.load(), 51);
        assert_eq!(b.load(), 60);
    }

    #[test]
    fn test_reload_does_not_count_against_capacity() {
        let cells: Vec<_> = (0..MAX_PARTICIPANTS as u64).map(AtomicCell::new).collect();
        let mut tx = Transaction::new();

        for cell in &cells {
            tx.try_load(cell).unwrap();
        }
        assert!(tx.try_load(&cells[0]).is_ok());
        assert_eq!(tx.len(), MAX_PARTICIPANTS);
    }

    #[test]
    fn test_capacity_exceeded() {
        let cells: Vec<_> = (0..=MAX_PARTICIPANTS as u64).map(AtomicCell::new).collect();
        let mut tx = Transaction::new();

        for cell in &cells[..MAX_PARTICIPANTS] {
            tx.try_load(cell).unwrap();
        }

        assert_eq!(
            tx.try_load(&cells[MAX_PARTICIPANTS]).unwrap_err(),
            AtomicError::CapacityExceeded {
                capacity: MAX_PARTICIPANTS
            }
        );
        assert_eq!(tx.len(), MAX_PARTICIPANTS);
    }

    #[test]
    #[should_panic(expected = "capacity exceeded")]
    fn test_load_panics_over_capacity() {
        let cells: Vec<_> = (0..=MAX_PARTICIPANTS as u64).map(AtomicCell::new).collect();
        let mut tx = Transaction::new();
        for cell in &cells {
            tx.load(cell);
        }
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let a = AtomicCell::new(1);
        let b = AtomicCell::new(2);
        let mut tx = Transaction::new();

        tx.load(&a).set(10);
        tx.cancel();
        tx.cancel();
        assert!(tx.is_empty());

        tx.load(&b).set(20);
        assert!(tx.commit());
        assert_eq!(a.load(), 1);
        assert_eq!(b.load(), 20);
    }

    #[test]
    fn test_empty_commit() {
        let mut tx = Transaction::default();
        assert!(tx.commit());
    }
}
