//! User-supplied input for creating and editing tasks.
//!
//! Drafts are validated here (trimmed, non-blank titles) so the tree layer
//! only ever sees well-formed nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::task::{Forest, Level, Task, TaskId, generate_id};
use crate::tree::TreeError;

/// Request to create a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    /// Explicit id; generated when absent.
    #[serde(default)]
    pub id: Option<TaskId>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub level: Level,
    /// Required for every level below [`Level::Goal`].
    #[serde(default)]
    pub parent_id: Option<TaskId>,
}

impl NewTask {
    /// Draft a root goal.
    #[must_use]
    pub fn goal(title: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            description: None,
            level: Level::Goal,
            parent_id: None,
        }
    }

    /// Draft a child of `parent_id` at `level`.
    #[must_use]
    pub fn child(parent_id: impl Into<TaskId>, level: Level, title: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            description: None,
            level,
            parent_id: Some(parent_id.into()),
        }
    }

    /// Use a caller-chosen id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Validate and build the node, created at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::EmptyTitle`] when the trimmed title is blank and
    /// [`TreeError::MissingParent`] when a non-goal draft has no parent.
    pub fn into_task(self, now: DateTime<Utc>) -> Result<Task, TreeError> {
        let title = clean_title(&self.title)?;
        if self.level != Level::Goal && self.parent_id.is_none() {
            return Err(TreeError::MissingParent { level: self.level });
        }
        let parent_id = if self.level == Level::Goal {
            None
        } else {
            self.parent_id
        };

        Ok(Task {
            id: self
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| generate_id(now)),
            title,
            description: clean_description(self.description.as_deref()),
            completed: false,
            level: self.level,
            parent_id,
            children: Forest::new(),
            order: 0,
            created_at: now,
            updated_at: None,
        })
    }
}

/// Replacement title and description for an existing task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEdit {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl TaskEdit {
    #[must_use]
    pub fn new(title: impl Into<String>, description: Option<String>) -> Self {
        Self {
            title: title.into(),
            description,
        }
    }

    /// Trimmed `(title, description)`.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::EmptyTitle`] when the trimmed title is blank.
    pub fn cleaned(&self) -> Result<(String, Option<String>), TreeError> {
        Ok((
            clean_title(&self.title)?,
            clean_description(self.description.as_deref()),
        ))
    }
}

fn clean_title(raw: &str) -> Result<String, TreeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TreeError::EmptyTitle);
    }
    Ok(trimmed.to_string())
}

fn clean_description(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
