//! Bounded undo/redo log of inverse mutations.

use crate::mutation::Mutation;
use std::collections::VecDeque;

/// One undoable step: what was applied and what reverts it.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub forward: Vec<Mutation>,
    pub inverse: Vec<Mutation>,
}

/// Undo and redo stacks. The oldest undo entry is dropped once `depth` is
/// exceeded.
#[derive(Debug, Clone)]
pub struct History {
    undo: VecDeque<HistoryEntry>,
    redo: Vec<HistoryEntry>,
    depth: usize,
}

impl History {
    pub fn new(depth: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            depth,
        }
    }

    /// Record a new step. Any redo entries become unreachable and are dropped.
    pub fn record(&mut self, entry: HistoryEntry) {
        self.redo.clear();
        self.push_undo(entry);
    }

    fn push_undo(&mut self, entry: HistoryEntry) {
        if self.depth == 0 {
            return;
        }
        self.undo.push_back(entry);
        while self.undo.len() > self.depth {
            self.undo.pop_front();
        }
    }

    pub fn take_undo(&mut self) -> Option<HistoryEntry> {
        self.undo.pop_back()
    }

    pub fn take_redo(&mut self) -> Option<HistoryEntry> {
        self.redo.pop()
    }

    /// Put an entry back after it was undone, so it can be redone.
    pub fn undone(&mut self, entry: HistoryEntry) {
        self.redo.push(entry);
    }

    /// Put an entry back after it was redone, keeping the rest of the redo stack.
    pub fn redone(&mut self, entry: HistoryEntry) {
        self.push_undo(entry);
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn clear(&mut self) {
        if self.can_undo() || self.can_redo() {
            log::debug!("Undo history cleared");
        }
        self.undo.clear();
        self.redo.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64) -> HistoryEntry {
        HistoryEntry {
            forward: vec![Mutation::DeleteNode { id }],
            inverse: vec![Mutation::PopBranch],
        }
    }

    #[test]
    fn test_depth_drops_oldest() {
        let mut history = History::new(2);
        history.record(entry(1));
        history.record(entry(2));
        history.record(entry(3));
        assert_eq!(history.undo_len(), 2);
        assert_eq!(history.take_undo(), Some(entry(3)));
        assert_eq!(history.take_undo(), Some(entry(2)));
        assert_eq!(history.take_undo(), None);
    }

    #[test]
    fn test_record_clears_redo() {
        let mut history = History::new(10);
        history.record(entry(1));
        let undone = history.take_undo().unwrap();
        history.undone(undone);
        assert!(history.can_redo());
        history.record(entry(2));
        assert!(!history.can_redo());
    }

    #[test]
    fn test_redo_keeps_remaining_redo_entries() {
        let mut history = History::new(10);
        history.record(entry(1));
        history.record(entry(2));
        for _ in 0..2 {
            let e = history.take_undo().unwrap();
            history.undone(e);
        }
        let e = history.take_redo().unwrap();
        assert_eq!(e, entry(1));
        history.redone(e);
        assert!(history.can_redo());
        assert!(history.can_undo());
    }

    #[test]
    fn test_zero_depth_records_nothing() {
        let mut history = History::new(0);
        history.record(entry(1));
        assert!(!history.can_undo());
    }
}
