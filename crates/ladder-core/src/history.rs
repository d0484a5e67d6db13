//! Linear undo/redo over whole-tree snapshots.
//!
//! Snapshots are [`Forest`] values, so keeping twenty of them costs only the
//! nodes that differ between them. Both stacks are bounded; pushing past the
//! bound evicts the oldest entry.

use std::collections::VecDeque;

use crate::model::Forest;

/// Default number of snapshots kept on each stack.
pub const DEFAULT_CAPACITY: usize = 20;

/// Bounded undo and redo stacks. The back of each deque is the top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryStack {
    undo: VecDeque<Forest>,
    redo: VecDeque<Forest>,
    capacity: usize,
}

impl Default for HistoryStack {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl HistoryStack {
    /// Empty stacks holding at most `capacity` snapshots each (at least 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Rebuild from persisted stacks, oldest first. Excess entries are
    /// dropped from the oldest end.
    #[must_use]
    pub fn from_parts(capacity: usize, undo: Vec<Forest>, redo: Vec<Forest>) -> Self {
        let mut stack = Self::new(capacity);
        for snapshot in undo {
            push_bounded(&mut stack.undo, snapshot, stack.capacity);
        }
        for snapshot in redo {
            push_bounded(&mut stack.redo, snapshot, stack.capacity);
        }
        stack
    }

    /// Push `previous` onto the undo stack when it differs from `next`.
    /// A push clears the redo stack. Returns whether anything was recorded.
    pub fn record_if_changed(&mut self, previous: &Forest, next: &Forest) -> bool {
        if previous == next {
            return false;
        }
        push_bounded(&mut self.undo, previous.clone(), self.capacity);
        self.redo.clear();
        true
    }

    /// Pop the undo top, pushing `current` onto redo. `None` when there is
    /// nothing to undo; the stacks are then unchanged.
    pub fn undo(&mut self, current: &Forest) -> Option<Forest> {
        let previous = self.undo.pop_back()?;
        push_bounded(&mut self.redo, current.clone(), self.capacity);
        Some(previous)
    }

    /// Pop the redo top, pushing `current` onto undo.
    pub fn redo(&mut self, current: &Forest) -> Option<Forest> {
        let next = self.redo.pop_back()?;
        push_bounded(&mut self.undo, current.clone(), self.capacity);
        Some(next)
    }

    /// Drop undo snapshots equal to `current` from the top. Returns how
    /// many were dropped.
    pub fn drop_stale_undo(&mut self, current: &Forest) -> usize {
        drop_stale(&mut self.undo, current)
    }

    /// Drop redo snapshots equal to `current` from the top.
    pub fn drop_stale_redo(&mut self, current: &Forest) -> usize {
        drop_stale(&mut self.redo, current)
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    #[must_use]
    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    #[must_use]
    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Undo snapshots, oldest first.
    pub fn undo_entries(&self) -> impl Iterator<Item = &Forest> {
        self.undo.iter()
    }

    /// Redo snapshots, oldest first.
    pub fn redo_entries(&self) -> impl Iterator<Item = &Forest> {
        self.redo.iter()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}

fn drop_stale(stack: &mut VecDeque<Forest>, current: &Forest) -> usize {
    let mut dropped = 0;
    while stack.back() == Some(current) {
        stack.pop_back();
        dropped += 1;
    }
    dropped
}

fn push_bounded(stack: &mut VecDeque<Forest>, snapshot: Forest, capacity: usize) {
    stack.push_back(snapshot);
    while stack.len() > capacity {
        stack.pop_front();
    }
}
