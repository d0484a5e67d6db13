//! Completion counts per level and per node.

use std::fmt;

use crate::model::{Forest, Level, Task};
use crate::tree;

/// Completion counts for a set of tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    /// Percentage done, rounded, in `0..=100`. An empty set is 0%.
    #[must_use]
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let pct = (self.completed.min(self.total) * 100 + self.total / 2) / self.total;
        u8::try_from(pct).unwrap_or(100)
    }

    /// Every task in the set is completed (vacuously false for an empty set).
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }

    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.total.saturating_sub(self.completed)
    }

    fn count(&mut self, task: &Task) {
        self.total += 1;
        if task.completed {
            self.completed += 1;
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({}%)", self.completed, self.total, self.percent())
    }
}

/// Progress of every level across the whole tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LevelSummary {
    pub goals: Progress,
    pub metrics: Progress,
    pub actions: Progress,
}

impl LevelSummary {
    #[must_use]
    pub fn of(tree: &Forest) -> Self {
        let mut summary = Self::default();
        for task in tree::flatten(tree) {
            summary.get_mut(task.level).count(task);
        }
        summary
    }

    #[must_use]
    pub const fn get(&self, level: Level) -> Progress {
        match level {
            Level::Goal => self.goals,
            Level::Metric => self.metrics,
            Level::Action => self.actions,
        }
    }

    const fn get_mut(&mut self, level: Level) -> &mut Progress {
        match level {
            Level::Goal => &mut self.goals,
            Level::Metric => &mut self.metrics,
            Level::Action => &mut self.actions,
        }
    }
}

/// Progress of a node's direct children. `None` for leaves.
#[must_use]
pub fn child_progress(task: &Task) -> Option<Progress> {
    if task.is_leaf() {
        return None;
    }
    let mut progress = Progress::default();
    for child in &task.children {
        progress.count(child);
    }
    Some(progress)
}
