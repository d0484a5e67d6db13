use std::fmt;

/// Machine-readable error codes shared by every layer of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    NotLoaded,
    TaskNotFound,
    ParentNotFound,
    DuplicateId,
    MissingParent,
    LevelMismatch,
    CycleDetected,
    IllegalDrop,
    EmptyTitle,
    LocalStoreFailed,
    LocalStoreLocked,
    RemoteWriteFailed,
    MigrationFailed,
    SubscriptionFailed,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::NotLoaded => "E1002",
            Self::TaskNotFound => "E2001",
            Self::ParentNotFound => "E2002",
            Self::DuplicateId => "E2003",
            Self::MissingParent => "E2004",
            Self::LevelMismatch => "E2005",
            Self::CycleDetected => "E2006",
            Self::IllegalDrop => "E2007",
            Self::EmptyTitle => "E2008",
            Self::LocalStoreFailed => "E5001",
            Self::LocalStoreLocked => "E5002",
            Self::RemoteWriteFailed => "E6001",
            Self::MigrationFailed => "E6002",
            Self::SubscriptionFailed => "E6003",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::NotLoaded => "Session not loaded yet",
            Self::TaskNotFound => "Task not found",
            Self::ParentNotFound => "Parent task not found",
            Self::DuplicateId => "Task id already in use",
            Self::MissingParent => "Parent required for this level",
            Self::LevelMismatch => "Level does not fit under parent",
            Self::CycleDetected => "Move would create a cycle",
            Self::IllegalDrop => "Drop target not allowed",
            Self::EmptyTitle => "Title is empty",
            Self::LocalStoreFailed => "Local store write failed",
            Self::LocalStoreLocked => "Local store lock contention",
            Self::RemoteWriteFailed => "Remote write failed",
            Self::MigrationFailed => "Migration to remote store failed",
            Self::SubscriptionFailed => "Remote subscription failed",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to the presentation layer.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in the ladder config file and retry."),
            Self::NotLoaded => Some("Wait for the identity provider to finish loading."),
            Self::TaskNotFound | Self::ParentNotFound => None,
            Self::DuplicateId => Some("Let the engine generate the id."),
            Self::MissingParent => Some("Pick a parent one level up: goals hold metrics, metrics hold actions."),
            Self::LevelMismatch => Some("Goals hold metrics and metrics hold actions."),
            Self::CycleDetected => Some("A task cannot be moved inside its own subtree."),
            Self::IllegalDrop => Some("Drop onto a task of the same level or one level up."),
            Self::EmptyTitle => Some("Enter a non-blank title."),
            Self::LocalStoreFailed => Some("Check storage quota and write permissions."),
            Self::LocalStoreLocked => Some("Retry after the other process releases its lock."),
            Self::RemoteWriteFailed => Some("The change is kept locally; it is re-sent on the next edit."),
            Self::MigrationFailed => Some("Migration is retried on the next sign-in."),
            Self::SubscriptionFailed => Some("Sign out and back in to re-subscribe."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorCode;
    use std::collections::HashSet;

    const ALL: [ErrorCode; 16] = [
        ErrorCode::ConfigParseError,
        ErrorCode::NotLoaded,
        ErrorCode::TaskNotFound,
        ErrorCode::ParentNotFound,
        ErrorCode::DuplicateId,
        ErrorCode::MissingParent,
        ErrorCode::LevelMismatch,
        ErrorCode::CycleDetected,
        ErrorCode::IllegalDrop,
        ErrorCode::EmptyTitle,
        ErrorCode::LocalStoreFailed,
        ErrorCode::LocalStoreLocked,
        ErrorCode::RemoteWriteFailed,
        ErrorCode::MigrationFailed,
        ErrorCode::SubscriptionFailed,
        ErrorCode::InternalUnexpected,
    ];

    #[test]
    fn all_codes_are_unique() {
        let mut seen = HashSet::new();
        for code in ALL {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        for code in ALL {
            let text = code.code();
            assert_eq!(text.len(), 5);
            assert!(text.starts_with('E'));
            assert!(text.chars().skip(1).all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn display_matches_code() {
        assert_eq!(ErrorCode::CycleDetected.to_string(), "E2006");
    }
}
