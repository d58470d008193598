//! Single-assignment result cells.

use crate::types::value::Exit;

/// Holds the outcome of one node of a parallel tree.
///
/// A cell is written at most once; later writes are rejected. Cells live
/// inside the evaluator state and are only read or written while holding
/// the evaluator lock, which provides the acquire/release ordering between
/// the writing and reading threads.
#[derive(Debug, Default)]
pub(crate) enum ResultCell {
    #[default]
    Empty,
    Filled(Exit),
}

impl ResultCell {
    pub(crate) const fn is_filled(&self) -> bool {
        matches!(self, Self::Filled(_))
    }

    pub(crate) const fn get(&self) -> Option<&Exit> {
        match self {
            Self::Empty => None,
            Self::Filled(exit) => Some(exit),
        }
    }

    /// Stores `exit` if the cell is empty. Returns false if it was already
    /// filled, leaving the earlier outcome in place.
    pub(crate) fn set(&mut self, exit: Exit) -> bool {
        if self.is_filled() {
            return false;
        }
        *self = Self::Filled(exit);
        true
    }

    #[cfg(test)]
    pub(crate) fn is_success(&self) -> bool {
        matches!(self, Self::Filled(Ok(_)))
    }

    #[cfg(test)]
    pub(crate) fn is_failure(&self) -> bool {
        matches!(self, Self::Filled(Err(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::value::{erase, unerase};

    #[test]
    fn starts_empty() {
        let cell = ResultCell::default();
        assert!(!cell.is_filled());
        assert!(cell.get().is_none());
    }

    #[test]
    fn first_write_wins() {
        let mut cell = ResultCell::default();
        assert!(cell.set(Ok(erase(1_u8))));
        assert!(!cell.set(Err(Error::failure("second"))));
        assert!(cell.is_success());
        assert!(!cell.is_failure());
        let value = cell.get().expect("filled").clone().expect("ok");
        assert_eq!(unerase::<u8>(value).expect("u8"), 1);
    }

    #[test]
    fn failure_is_recorded() {
        let mut cell = ResultCell::Empty;
        cell.set(Err(Error::failure("x")));
        assert!(cell.is_failure());
    }
}
