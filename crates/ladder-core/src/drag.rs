//! Drop legality and placement for drag-and-drop moves.
//!
//! Given a dragged node `A` and a hover target `B`:
//!
//! - `B` inside `A`'s subtree (including `A` itself) is rejected.
//! - Same level: `A` becomes a sibling of `B`, taking `B`'s position.
//! - `B` exactly one level above `A`: `A` becomes `B`'s last child.
//! - Anything else is rejected.
//!
//! [`resolve_drop`] removes `A` first and computes the destination index
//! against the tree with `A` already gone, so moving a node further down its
//! own sibling list lands it where `B` was rather than one slot early.

use chrono::{DateTime, Utc};

use crate::error::ErrorCode;
use crate::model::{Forest, Level, TaskId};
use crate::tree;

/// Why a drop is not allowed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DropRejection {
    #[error("a task cannot be dropped onto itself")]
    SelfDrop,
    #[error("dragged task '{0}' does not exist")]
    UnknownSource(TaskId),
    #[error("drop target '{0}' does not exist")]
    UnknownTarget(TaskId),
    #[error("'{target}' is inside the subtree of '{dragged}'")]
    Cycle { dragged: TaskId, target: TaskId },
    #[error("a {dragged} cannot be dropped onto a {target}")]
    LevelGap { dragged: Level, target: Level },
}

impl DropRejection {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Cycle { .. } => ErrorCode::CycleDetected,
            Self::UnknownSource(_) => ErrorCode::TaskNotFound,
            Self::SelfDrop | Self::UnknownTarget(_) | Self::LevelGap { .. } => ErrorCode::IllegalDrop,
        }
    }
}

/// Where a legal drop puts the dragged node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Sibling of the target, under the target's parent (root when `None`).
    Sibling { parent_id: Option<TaskId> },
    /// Last child of the target.
    LastChild { parent_id: TaskId },
}

/// Decide whether dropping `source` onto `target` is legal.
///
/// # Errors
///
/// Returns the [`DropRejection`] describing the first rule the drop breaks.
pub fn check_drop(tree: &Forest, source: &str, target: &str) -> Result<Placement, DropRejection> {
    if source == target {
        return Err(DropRejection::SelfDrop);
    }
    let dragged = tree::find(tree, source).ok_or_else(|| DropRejection::UnknownSource(source.to_string()))?;
    let over = tree::find(tree, target).ok_or_else(|| DropRejection::UnknownTarget(target.to_string()))?;

    if tree::is_descendant(tree, source, target) {
        return Err(DropRejection::Cycle {
            dragged: source.to_string(),
            target: target.to_string(),
        });
    }

    if dragged.level == over.level {
        return Ok(Placement::Sibling {
            parent_id: over.parent_id.clone(),
        });
    }
    if tree::level_below(over.level) == Some(dragged.level) {
        return Ok(Placement::LastChild {
            parent_id: over.id.clone(),
        });
    }
    Err(DropRejection::LevelGap {
        dragged: dragged.level,
        target: over.level,
    })
}

/// Whether the drop is legal, for hover feedback.
#[must_use]
pub fn can_drop(tree: &Forest, source: &str, target: &str) -> bool {
    check_drop(tree, source, target).is_ok()
}

/// Apply a drop: move `source` (with its subtree) as dictated by
/// [`check_drop`], stamping the moved node and every ancestor whose children
/// changed with `now`.
///
/// # Errors
///
/// Returns the rejection when the drop is illegal; the input is untouched.
pub fn resolve_drop(
    tree: &Forest,
    source: &str,
    target: &str,
    now: DateTime<Utc>,
) -> Result<Forest, DropRejection> {
    let placement = check_drop(tree, source, target)?;
    let before = tree::locate(tree, source).ok_or_else(|| DropRejection::UnknownSource(source.to_string()))?;

    let (without, removed) = tree::remove(tree, source, Some(now));
    let mut moved = removed.ok_or_else(|| DropRejection::UnknownSource(source.to_string()))?;
    moved.updated_at = Some(now);

    let (parent_id, index) = match placement {
        Placement::Sibling { parent_id } => {
            let target_at = tree::locate(&without, target)
                .ok_or_else(|| DropRejection::UnknownTarget(target.to_string()))?;
            let shifted = before.parent_id == target_at.parent_id && before.index <= target_at.index;
            let index = if shifted { target_at.index + 1 } else { target_at.index };
            (parent_id, index)
        }
        Placement::LastChild { parent_id } => (Some(parent_id), usize::MAX),
    };

    let out = tree::insert(&without, moved, parent_id.as_deref(), index, Some(now))
        .map_err(|_| DropRejection::UnknownTarget(target.to_string()))?;
    tracing::debug!(task_id = %source, target = %target, "task moved");
    Ok(out)
}

/// Hover state of the drag in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hover {
    pub target: TaskId,
    pub droppable: bool,
}

/// Transient state of one interactive drag: what is being dragged and what
/// it hovers over. Ending or cancelling always clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DragSession {
    active: Option<TaskId>,
    hover: Option<Hover>,
}

impl DragSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin dragging `id`, replacing any previous drag.
    pub fn start(&mut self, id: impl Into<TaskId>) {
        self.active = Some(id.into());
        self.hover = None;
    }

    /// Update the hover target (`None` when over empty space) and report
    /// whether it is a legal drop.
    pub fn over(&mut self, tree: &Forest, target: Option<&str>) -> bool {
        let (Some(active), Some(target)) = (self.active.as_deref(), target) else {
            self.hover = None;
            return false;
        };
        let droppable = can_drop(tree, active, target);
        self.hover = Some(Hover {
            target: target.to_string(),
            droppable,
        });
        droppable
    }

    /// Finish the drag over `target`. Returns the resulting tree, or the
    /// input unchanged when there is no active drag, no target, or the drop
    /// is illegal.
    pub fn end(&mut self, tree: &Forest, target: Option<&str>, now: DateTime<Utc>) -> Forest {
        let active = self.active.take();
        self.hover = None;
        let (Some(active), Some(target)) = (active, target) else {
            return tree.clone();
        };
        match resolve_drop(tree, &active, target, now) {
            Ok(out) => out,
            Err(rejection) => {
                tracing::debug!(task_id = %active, target = %target, %rejection, "drop ignored");
                tree.clone()
            }
        }
    }

    /// Abandon the drag.
    pub fn cancel(&mut self) {
        self.active = None;
        self.hover = None;
    }

    #[must_use]
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    #[must_use]
    pub const fn hover(&self) -> Option<&Hover> {
        self.hover.as_ref()
    }

    #[must_use]
    pub const fn is_dragging(&self) -> bool {
        self.active.is_some()
    }
}
