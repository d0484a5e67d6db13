use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Ordered forest of tasks.
///
/// Children are stored in a persistent vector, so cloning a task or a whole
/// tree shares every subtree; an edit rebuilds only the path from the root to
/// the touched node.
pub type Forest = im::Vector<Task>;

/// Opaque task identifier, stable for the node's lifetime.
pub type TaskId = String;

/// The three fixed hierarchy levels, ordered `Goal → Metric → Action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Long-term objective. Always a root.
    #[serde(alias = "kgi")]
    Goal,
    /// Mid-term measurable indicator under a goal.
    #[serde(alias = "kpi")]
    Metric,
    /// Short-term executable task under a metric. Never has children.
    #[serde(alias = "kai")]
    Action,
}

impl Level {
    /// Every level, top down.
    pub const ALL: [Self; 3] = [Self::Goal, Self::Metric, Self::Action];

    /// The level a child of this level must have.
    #[must_use]
    pub const fn below(self) -> Option<Self> {
        match self {
            Self::Goal => Some(Self::Metric),
            Self::Metric => Some(Self::Action),
            Self::Action => None,
        }
    }

    /// The level a parent of this level must have.
    #[must_use]
    pub const fn above(self) -> Option<Self> {
        match self {
            Self::Goal => None,
            Self::Metric => Some(Self::Goal),
            Self::Action => Some(Self::Metric),
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Goal => "goal",
            Self::Metric => "metric",
            Self::Action => "action",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "goal" | "kgi" => Ok(Self::Goal),
            "metric" | "kpi" => Ok(Self::Metric),
            "action" | "kai" => Ok(Self::Action),
            _ => Err(ParseLevelError { got: s.to_string() }),
        }
    }
}

/// Error returned when parsing a [`Level`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid level: '{got}' (expected goal, metric or action)")]
pub struct ParseLevelError {
    pub got: String,
}

/// A node in the three-level task tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub completed: bool,
    pub level: Level,
    /// Present iff `level` is not [`Level::Goal`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TaskId>,
    #[serde(default)]
    pub children: Forest,
    /// Dense zero-based position among siblings.
    #[serde(default)]
    pub order: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Whether this node has no children.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of nodes below this one.
    #[must_use]
    pub fn descendant_count(&self) -> usize {
        self.children
            .iter()
            .map(|child| 1 + child.descendant_count())
            .sum()
    }

    /// Flat form of this node (children dropped, order kept).
    #[must_use]
    pub fn to_record(&self) -> TaskRecord {
        TaskRecord {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            completed: self.completed,
            level: self.level,
            parent_id: self.parent_id.clone(),
            order: Some(self.order),
            created_at: Some(self.created_at),
            updated_at: self.updated_at,
        }
    }
}

/// One task as stored by the remote store: flat, carrying its own parent
/// reference instead of nested children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(default)]
    pub id: TaskId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub completed: bool,
    pub level: Level,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Nested form with no children yet. A missing creation time becomes `now`.
    #[must_use]
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            id: self.id,
            title: self.title,
            description: self.description,
            completed: self.completed,
            level: self.level,
            parent_id: self.parent_id,
            children: Forest::new(),
            order: self.order.unwrap_or_default(),
            created_at: self.created_at.unwrap_or(now),
            updated_at: self.updated_at,
        }
    }
}

/// Generate a fresh task id: `task-<millis base36>-<random base36>`.
#[must_use]
pub fn generate_id(now: DateTime<Utc>) -> TaskId {
    let millis = u64::try_from(now.timestamp_millis()).unwrap_or_default();
    let noise: u64 = rand::random();
    format!("task-{}-{}", base36(millis), base36(noise))
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_flow_is_strict() {
        assert_eq!(Level::Goal.below(), Some(Level::Metric));
        assert_eq!(Level::Metric.below(), Some(Level::Action));
        assert_eq!(Level::Action.below(), None);
        for level in Level::ALL {
            if let Some(child) = level.below() {
                assert_eq!(child.above(), Some(level));
            }
        }
    }

    #[test]
    fn level_parses_new_and_legacy_names() {
        assert_eq!("Goal".parse::<Level>(), Ok(Level::Goal));
        assert_eq!("kpi".parse::<Level>(), Ok(Level::Metric));
        assert_eq!(" action ".parse::<Level>(), Ok(Level::Action));
        assert!("epic".parse::<Level>().is_err());
    }

    #[test]
    fn level_serde_accepts_legacy_alias() {
        let level: Level = serde_json::from_str("\"kai\"").unwrap();
        assert_eq!(level, Level::Action);
        assert_eq!(serde_json::to_string(&Level::Metric).unwrap(), "\"metric\"");
    }

    #[test]
    fn task_serializes_camel_case_and_skips_absent_fields() {
        let task = Task {
            id: "g1".into(),
            title: "Launch".into(),
            description: None,
            completed: false,
            level: Level::Goal,
            parent_id: None,
            children: Forest::new(),
            order: 0,
            created_at: DateTime::from_timestamp_millis(0).unwrap(),
            updated_at: None,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("parentId").is_none());
        assert!(json.get("description").is_none());
        assert!(json.get("updatedAt").is_none());
    }

    #[test]
    fn record_round_trip_keeps_everything_but_children() {
        let now = DateTime::from_timestamp_millis(1_000).unwrap();
        let task = Task {
            id: "m1".into(),
            title: "Sign up 100 users".into(),
            description: Some("beta".into()),
            completed: true,
            level: Level::Metric,
            parent_id: Some("g1".into()),
            children: Forest::new(),
            order: 3,
            created_at: now,
            updated_at: Some(now),
        };
        assert_eq!(task.to_record().into_task(now), task);
    }

    #[test]
    fn generated_ids_are_prefixed_and_distinct() {
        let now = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let a = generate_id(now);
        let b = generate_id(now);
        assert!(a.starts_with("task-"));
        assert_ne!(a, b);
    }

    #[test]
    fn base36_encodes_small_values() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
    }
}
