//! Pure operations over the three-level task forest.
//!
//! Nothing here performs I/O or mutates its input. Every operation returns a
//! new [`Forest`] that shares all untouched subtrees with the old one; only
//! the nodes on the path from a root to the changed node are rebuilt.
//!
//! # Stamping
//!
//! `stamp` arguments control whether ancestors whose `children` changed get
//! their `updated_at` set. [`update_node`] never stamps ancestors;
//! [`update_node_on_path`], [`insert`] and [`remove`] do when given a stamp.
//!
//! # Failure
//!
//! A failed precondition (unknown parent, unknown id, level mismatch) is
//! reported as a [`TreeError`]; the caller still holds the untouched input.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::error::ErrorCode;
use crate::model::{Forest, Level, Task, TaskId, TaskRecord};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Structural-precondition failures of tree operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("task not found: '{0}'")]
    TaskNotFound(TaskId),
    #[error("parent task not found: '{0}'")]
    ParentNotFound(TaskId),
    #[error("task id already in use: '{0}'")]
    DuplicateId(TaskId),
    #[error("a {level} needs a parent reference")]
    MissingParent { level: Level },
    #[error("a {child} cannot be placed under a {parent}")]
    LevelMismatch { child: Level, parent: Level },
    #[error("title must not be blank")]
    EmptyTitle,
}

impl TreeError {
    /// Machine-readable code for this failure.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::TaskNotFound(_) => ErrorCode::TaskNotFound,
            Self::ParentNotFound(_) => ErrorCode::ParentNotFound,
            Self::DuplicateId(_) => ErrorCode::DuplicateId,
            Self::MissingParent { .. } => ErrorCode::MissingParent,
            Self::LevelMismatch { .. } => ErrorCode::LevelMismatch,
            Self::EmptyTitle => ErrorCode::EmptyTitle,
        }
    }
}

/// Where a node sits: its parent (or root) and its index among siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub parent_id: Option<TaskId>,
    pub index: usize,
}

/// A broken tree-shape invariant, reported by [`check_shape`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeViolation {
    #[error("root '{id}' is a {level}, not a goal")]
    RootNotGoal { id: TaskId, level: Level },
    #[error("'{id}' ({child}) sits under '{parent_id}' ({parent})")]
    LevelGap {
        id: TaskId,
        child: Level,
        parent_id: TaskId,
        parent: Level,
    },
    #[error("'{id}' has parentId {recorded:?}, expected {actual:?}")]
    ParentMismatch {
        id: TaskId,
        recorded: Option<TaskId>,
        actual: Option<TaskId>,
    },
    #[error("sibling orders under {parent_id:?} are {orders:?}")]
    SparseOrder {
        parent_id: Option<TaskId>,
        orders: Vec<usize>,
    },
    #[error("id '{0}' appears more than once")]
    DuplicateId(TaskId),
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// The level a child of `level` must have.
#[must_use]
pub const fn level_below(level: Level) -> Option<Level> {
    level.below()
}

/// Depth-first search; first match wins.
#[must_use]
pub fn find<'a>(tree: &'a Forest, id: &str) -> Option<&'a Task> {
    for task in tree {
        if task.id == id {
            return Some(task);
        }
        if let Some(found) = find(&task.children, id) {
            return Some(found);
        }
    }
    None
}

/// The direct parent of `id`, or `None` when `id` is a root or absent.
#[must_use]
pub fn find_parent<'a>(tree: &'a Forest, id: &str) -> Option<&'a Task> {
    for task in tree {
        if task.children.iter().any(|child| child.id == id) {
            return Some(task);
        }
        if let Some(found) = find_parent(&task.children, id) {
            return Some(found);
        }
    }
    None
}

/// Parent and sibling index of `id`.
#[must_use]
pub fn locate(tree: &Forest, id: &str) -> Option<Location> {
    fn walk(list: &Forest, parent: Option<&Task>, id: &str) -> Option<Location> {
        for (index, task) in list.iter().enumerate() {
            if task.id == id {
                return Some(Location {
                    parent_id: parent.map(|p| p.id.clone()),
                    index,
                });
            }
            if let Some(found) = walk(&task.children, Some(task), id) {
                return Some(found);
            }
        }
        None
    }
    walk(tree, None, id)
}

/// True iff `candidate_id` is inside the subtree rooted at `ancestor_id`.
///
/// The subtree includes its root, so a node counts as its own descendant;
/// this is what blocks dropping a node onto itself or anything below it.
#[must_use]
pub fn is_descendant(tree: &Forest, ancestor_id: &str, candidate_id: &str) -> bool {
    find(tree, ancestor_id).is_some_and(|ancestor| subtree_contains(ancestor, candidate_id))
}

fn subtree_contains(task: &Task, id: &str) -> bool {
    task.id == id || task.children.iter().any(|child| subtree_contains(child, id))
}

/// Every node in pre-order.
#[must_use]
pub fn flatten(tree: &Forest) -> Vec<&Task> {
    fn walk<'a>(list: &'a Forest, out: &mut Vec<&'a Task>) {
        for task in list {
            out.push(task);
            walk(&task.children, out);
        }
    }
    let mut out = Vec::new();
    walk(tree, &mut out);
    out
}

/// Flat records of every node in pre-order.
#[must_use]
pub fn to_records(tree: &Forest) -> Vec<TaskRecord> {
    flatten(tree).into_iter().map(Task::to_record).collect()
}

/// Ids of every node.
#[must_use]
pub fn all_ids(tree: &Forest) -> HashSet<TaskId> {
    flatten(tree).into_iter().map(|task| task.id.clone()).collect()
}

/// Total number of nodes.
#[must_use]
pub fn count(tree: &Forest) -> usize {
    tree.iter().map(|task| 1 + task.descendant_count()).sum()
}

/// Nodes a new task of `level` may be attached under, in pre-order.
///
/// Goals attach at the root, so they have no candidates.
#[must_use]
pub fn parent_candidates(tree: &Forest, level: Level) -> Vec<&Task> {
    let Some(parent_level) = level.above() else {
        return Vec::new();
    };
    flatten(tree)
        .into_iter()
        .filter(|task| task.level == parent_level)
        .collect()
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Reassign `order = index` for each element, recursively for every level
/// below. Nodes whose order is already right are shared, not rebuilt.
#[must_use]
pub fn reorder(list: &Forest) -> Forest {
    let mut out = list.clone();
    renumber(&mut out, true);
    out
}

fn renumber(list: &mut Forest, deep: bool) {
    for index in 0..list.len() {
        let stale = {
            let task = &list[index];
            task.order != index || (deep && !is_dense(&task.children))
        };
        if !stale {
            continue;
        }
        if let Some(task) = list.get_mut(index) {
            task.order = index;
            if deep {
                renumber(&mut task.children, true);
            }
        }
    }
}

fn is_dense(list: &Forest) -> bool {
    list.iter()
        .enumerate()
        .all(|(index, task)| task.order == index && is_dense(&task.children))
}

// ---------------------------------------------------------------------------
// Path rebuilding
// ---------------------------------------------------------------------------

/// Rebuild the path to `id`, applying `edit` to the matched node. Ancestors
/// on the path get `updated_at = stamp` when a stamp is given.
fn modify<F>(tree: &Forest, id: &str, stamp: Option<DateTime<Utc>>, edit: F) -> Option<Forest>
where
    F: FnOnce(&mut Task),
{
    let mut edit = Some(edit);
    modify_path(tree, id, stamp, &mut edit)
}

fn modify_path<F>(
    list: &Forest,
    id: &str,
    stamp: Option<DateTime<Utc>>,
    edit: &mut Option<F>,
) -> Option<Forest>
where
    F: FnOnce(&mut Task),
{
    for (index, task) in list.iter().enumerate() {
        if task.id == id {
            let mut updated = task.clone();
            if let Some(apply) = edit.take() {
                apply(&mut updated);
            }
            return Some(list.update(index, updated));
        }
        if let Some(children) = modify_path(&task.children, id, stamp, edit) {
            let mut parent = task.clone();
            parent.children = children;
            if let Some(at) = stamp {
                parent.updated_at = Some(at);
            }
            return Some(list.update(index, parent));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Structural mutations
// ---------------------------------------------------------------------------

/// Insert `task` at `index` among `parent_id`'s children (or at the root),
/// clamping the index to `[0, len]` and re-deriving sibling orders.
///
/// The inserted node's `parent_id` is rewritten to match its new place.
///
/// # Errors
///
/// [`TreeError::ParentNotFound`] when `parent_id` names no node.
pub fn insert(
    tree: &Forest,
    mut task: Task,
    parent_id: Option<&str>,
    index: usize,
    stamp: Option<DateTime<Utc>>,
) -> Result<Forest, TreeError> {
    task.parent_id = parent_id.map(str::to_string);
    let Some(parent_id) = parent_id else {
        let mut out = tree.clone();
        out.insert(index.min(out.len()), task);
        renumber(&mut out, true);
        return Ok(out);
    };

    modify(tree, parent_id, stamp, |parent| {
        let at = index.min(parent.children.len());
        parent.children.insert(at, task);
        renumber(&mut parent.children, true);
        if let Some(at) = stamp {
            parent.updated_at = Some(at);
        }
    })
    .ok_or_else(|| TreeError::ParentNotFound(parent_id.to_string()))
}

/// Excise `id` and its whole subtree.
///
/// Returns the new forest and the removed subtree, or the input and `None`
/// when `id` is absent. A parent left without children keeps an empty list.
#[must_use]
pub fn remove(tree: &Forest, id: &str, stamp: Option<DateTime<Utc>>) -> (Forest, Option<Task>) {
    if let Some(index) = tree.iter().position(|task| task.id == id) {
        let mut out = tree.clone();
        let removed = out.remove(index);
        renumber(&mut out, false);
        return (out, Some(removed));
    }

    let Some(parent_id) = find_parent(tree, id).map(|parent| parent.id.clone()) else {
        return (tree.clone(), None);
    };

    let mut removed = None;
    let out = modify(tree, &parent_id, stamp, |parent| {
        if let Some(index) = parent.children.iter().position(|child| child.id == id) {
            removed = Some(parent.children.remove(index));
            renumber(&mut parent.children, false);
        }
        if let Some(at) = stamp {
            parent.updated_at = Some(at);
        }
    });

    match (out, removed) {
        (Some(out), Some(removed)) => (out, Some(removed)),
        _ => (tree.clone(), None),
    }
}

/// Apply `transform` to exactly the node `id`, stamping only that node.
///
/// The node's id, level, and parent reference are kept whatever the
/// transform returns.
///
/// # Errors
///
/// [`TreeError::TaskNotFound`] when `id` is absent.
pub fn update_node<F>(tree: &Forest, id: &str, transform: F, at: DateTime<Utc>) -> Result<Forest, TreeError>
where
    F: FnOnce(&Task) -> Task,
{
    apply_transform(tree, id, transform, at, None)
}

/// Like [`update_node`], but every ancestor on the path is stamped too.
///
/// # Errors
///
/// [`TreeError::TaskNotFound`] when `id` is absent.
pub fn update_node_on_path<F>(
    tree: &Forest,
    id: &str,
    transform: F,
    at: DateTime<Utc>,
) -> Result<Forest, TreeError>
where
    F: FnOnce(&Task) -> Task,
{
    apply_transform(tree, id, transform, at, Some(at))
}

fn apply_transform<F>(
    tree: &Forest,
    id: &str,
    transform: F,
    at: DateTime<Utc>,
    stamp: Option<DateTime<Utc>>,
) -> Result<Forest, TreeError>
where
    F: FnOnce(&Task) -> Task,
{
    modify(tree, id, stamp, |node| {
        let mut next = transform(node);
        next.id.clone_from(&node.id);
        next.level = node.level;
        next.parent_id.clone_from(&node.parent_id);
        next.updated_at = Some(at);
        *node = next;
    })
    .ok_or_else(|| TreeError::TaskNotFound(id.to_string()))
}

/// Set `completed` and `updated_at` on `node` and every descendant.
#[must_use]
pub fn cascade_completion(node: &Task, completed: bool, at: DateTime<Utc>) -> Task {
    let mut next = node.clone();
    next.completed = completed;
    next.updated_at = Some(at);
    next.children = node
        .children
        .iter()
        .map(|child| cascade_completion(child, completed, at))
        .collect();
    next
}

// ---------------------------------------------------------------------------
// Mutations used by the engine
// ---------------------------------------------------------------------------

/// Append a new task: goals at the end of the root list, other levels as the
/// last child of their parent. Ancestors are stamped with `at`.
///
/// # Errors
///
/// [`TreeError::DuplicateId`], [`TreeError::MissingParent`],
/// [`TreeError::ParentNotFound`], or [`TreeError::LevelMismatch`].
pub fn add_task(tree: &Forest, task: Task, at: DateTime<Utc>) -> Result<Forest, TreeError> {
    if find(tree, &task.id).is_some() {
        return Err(TreeError::DuplicateId(task.id));
    }

    let Some(expected) = task.level.above() else {
        let end = tree.len();
        return insert(tree, task, None, end, Some(at));
    };

    let parent_id = task
        .parent_id
        .clone()
        .ok_or(TreeError::MissingParent { level: task.level })?;
    let parent = find(tree, &parent_id).ok_or_else(|| TreeError::ParentNotFound(parent_id.clone()))?;
    if parent.level != expected {
        return Err(TreeError::LevelMismatch {
            child: task.level,
            parent: parent.level,
        });
    }
    let end = parent.children.len();
    insert(tree, task, Some(&parent_id), end, Some(at))
}

/// Replace title and description of `id`; ancestors are stamped.
///
/// # Errors
///
/// [`TreeError::TaskNotFound`] when `id` is absent.
pub fn edit_task(
    tree: &Forest,
    id: &str,
    title: String,
    description: Option<String>,
    at: DateTime<Utc>,
) -> Result<Forest, TreeError> {
    update_node_on_path(
        tree,
        id,
        |task| Task {
            title,
            description,
            ..task.clone()
        },
        at,
    )
}

/// Flip `completed` on `id`, cascading to every descendant; ancestors are
/// stamped but their own `completed` is left alone.
///
/// # Errors
///
/// [`TreeError::TaskNotFound`] when `id` is absent.
pub fn toggle_completion(tree: &Forest, id: &str, at: DateTime<Utc>) -> Result<Forest, TreeError> {
    update_node_on_path(tree, id, |task| cascade_completion(task, !task.completed, at), at)
}

/// Remove `id` and its subtree; ancestors are stamped.
///
/// # Errors
///
/// [`TreeError::TaskNotFound`] when `id` is absent.
pub fn delete_task(tree: &Forest, id: &str, at: DateTime<Utc>) -> Result<Forest, TreeError> {
    match remove(tree, id, Some(at)) {
        (out, Some(_)) => Ok(out),
        (_, None) => Err(TreeError::TaskNotFound(id.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Flat reconstruction
// ---------------------------------------------------------------------------

/// Rebuild a forest from flat records.
///
/// - Duplicate ids keep their first occurrence.
/// - A record attaches under its `parent_id` when that id is present;
///   otherwise (absent, unresolvable, or self-referencing) it is a root.
/// - Siblings sort by `order` when present, by `created_at` otherwise;
///   ordered records come before unordered ones.
/// - Records caught in a parent cycle are never reached from a root; they
///   are appended as roots with `parent_id` cleared.
/// - Orders are re-derived densely.
///
/// `now` fills in a missing creation time.
#[must_use]
pub fn build_forest(records: Vec<TaskRecord>, now: DateTime<Utc>) -> Forest {
    let mut by_id: HashMap<TaskId, TaskRecord> = HashMap::new();
    let mut arrival: Vec<TaskId> = Vec::new();
    for record in records {
        if by_id.contains_key(&record.id) {
            tracing::debug!(task_id = %record.id, "duplicate record dropped");
            continue;
        }
        arrival.push(record.id.clone());
        by_id.insert(record.id.clone(), record);
    }

    let mut groups: HashMap<Option<TaskId>, Vec<TaskId>> = HashMap::new();
    for id in &arrival {
        let Some(record) = by_id.get(id) else { continue };
        let key = record
            .parent_id
            .as_ref()
            .filter(|parent| *parent != id && by_id.contains_key(*parent))
            .cloned();
        groups.entry(key).or_default().push(id.clone());
    }
    for siblings in groups.values_mut() {
        siblings.sort_by(|a, b| match (by_id.get(a), by_id.get(b)) {
            (Some(a), Some(b)) => sibling_order(a, b),
            _ => Ordering::Equal,
        });
    }

    let mut roots = attach(None, &mut groups, &mut by_id, now);

    if !by_id.is_empty() {
        let mut stranded: Vec<TaskRecord> = by_id.values().cloned().collect();
        stranded.sort_by(sibling_order);
        for record in stranded {
            let Some(mut record) = by_id.remove(&record.id) else {
                continue;
            };
            tracing::warn!(task_id = %record.id, "record caught in a parent cycle promoted to root");
            record.parent_id = None;
            let id = record.id.clone();
            let mut task = record.into_task(now);
            task.children = attach(Some(id), &mut groups, &mut by_id, now);
            roots.push_back(task);
        }
    }

    reorder(&roots)
}

fn attach(
    parent: Option<TaskId>,
    groups: &mut HashMap<Option<TaskId>, Vec<TaskId>>,
    by_id: &mut HashMap<TaskId, TaskRecord>,
    now: DateTime<Utc>,
) -> Forest {
    let ids = groups.remove(&parent).unwrap_or_default();
    let mut out = Forest::new();
    for id in ids {
        let Some(mut record) = by_id.remove(&id) else {
            continue;
        };
        record.parent_id.clone_from(&parent);
        let mut task = record.into_task(now);
        task.children = attach(Some(id), groups, by_id, now);
        out.push_back(task);
    }
    out
}

fn sibling_order(a: &TaskRecord, b: &TaskRecord) -> Ordering {
    match (a.order, b.order) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.created_at.cmp(&b.created_at)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.created_at.cmp(&b.created_at),
    }
}

// ---------------------------------------------------------------------------
// Invariant check
// ---------------------------------------------------------------------------

/// Every violated shape invariant: roots are goals, each child is exactly one
/// level below its parent, `parent_id` matches the actual parent, sibling
/// orders are `0..n`, and ids are unique.
#[must_use]
pub fn check_shape(tree: &Forest) -> Vec<ShapeViolation> {
    let mut violations = Vec::new();
    let mut seen = HashSet::new();
    check_list(tree, None, &mut seen, &mut violations);
    violations
}

fn check_list(
    list: &Forest,
    parent: Option<&Task>,
    seen: &mut HashSet<TaskId>,
    violations: &mut Vec<ShapeViolation>,
) {
    let orders: Vec<usize> = list.iter().map(|task| task.order).collect();
    if orders.iter().enumerate().any(|(index, order)| *order != index) {
        violations.push(ShapeViolation::SparseOrder {
            parent_id: parent.map(|p| p.id.clone()),
            orders,
        });
    }

    for task in list {
        if !seen.insert(task.id.clone()) {
            violations.push(ShapeViolation::DuplicateId(task.id.clone()));
        }
        let actual = parent.map(|p| p.id.clone());
        if task.parent_id != actual {
            violations.push(ShapeViolation::ParentMismatch {
                id: task.id.clone(),
                recorded: task.parent_id.clone(),
                actual,
            });
        }
        match parent {
            None if task.level != Level::Goal => violations.push(ShapeViolation::RootNotGoal {
                id: task.id.clone(),
                level: task.level,
            }),
            Some(p) if p.level.below() != Some(task.level) => {
                violations.push(ShapeViolation::LevelGap {
                    id: task.id.clone(),
                    child: task.level,
                    parent_id: p.id.clone(),
                    parent: p.level,
                });
            }
            _ => {}
        }
        check_list(&task.children, Some(task), seen, violations);
    }
}
