use std::fmt;

/// Machine-readable error codes for operator-facing diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    ExportInvalid,
    ProjectUnavailable,
    SetupTimedOut,
    EmptyClassificationPath,
    ClassificationCreateFailed,
    LinkTypeUnknown,
    LinkDirectionMissing,
    LinkTargetNotMigrated,
    LinkNotFound,
    AttachmentNotMigrated,
    AttachmentRejected,
    FieldRejected,
    WorkItemNotFound,
    SaveFailed,
    JournalWriteFailed,
    LockContention,
    MigrationAborted,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::ExportInvalid => "E1002",
            Self::ProjectUnavailable => "E1101",
            Self::SetupTimedOut => "E1102",
            Self::EmptyClassificationPath => "E2001",
            Self::ClassificationCreateFailed => "E2002",
            Self::LinkTypeUnknown => "E3001",
            Self::LinkDirectionMissing => "E3002",
            Self::LinkTargetNotMigrated => "E3003",
            Self::LinkNotFound => "E3004",
            Self::AttachmentNotMigrated => "E4001",
            Self::AttachmentRejected => "E4002",
            Self::FieldRejected => "E5001",
            Self::WorkItemNotFound => "E5002",
            Self::SaveFailed => "E5003",
            Self::JournalWriteFailed => "E6001",
            Self::LockContention => "E6002",
            Self::MigrationAborted => "E9001",
            Self::InternalUnexpected => "E9002",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::ExportInvalid => "Revision export is invalid",
            Self::ProjectUnavailable => "Destination project unavailable",
            Self::SetupTimedOut => "Destination setup timed out",
            Self::EmptyClassificationPath => "Empty classification path",
            Self::ClassificationCreateFailed => "Classification node could not be created",
            Self::LinkTypeUnknown => "Link type does not exist in destination",
            Self::LinkDirectionMissing => "Link direction not provided",
            Self::LinkTargetNotMigrated => "Link target not yet migrated",
            Self::LinkNotFound => "Link to remove not found",
            Self::AttachmentNotMigrated => "Attachment not recorded as migrated",
            Self::AttachmentRejected => "Attachment rejected by destination",
            Self::FieldRejected => "Field value rejected",
            Self::WorkItemNotFound => "Destination work item not found",
            Self::SaveFailed => "Work item save failed",
            Self::JournalWriteFailed => "Journal read/write failed",
            Self::LockContention => "Lock contention",
            Self::MigrationAborted => "Migration aborted",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in the wiport config file and retry."),
            Self::ExportInvalid => {
                Some("Re-run the export; revision indexes must start at 0 and increase.")
            }
            Self::ProjectUnavailable => Some(
                "Create the project or set setup.create_project_if_missing = true in the config.",
            ),
            Self::SetupTimedOut => {
                Some("Raise setup.max_wait_ms or retry once the project exists.")
            }
            Self::EmptyClassificationPath | Self::LinkDirectionMissing => {
                Some("Fix the source export; the value is required.")
            }
            Self::ClassificationCreateFailed => {
                Some("Check permissions on the destination area/iteration trees.")
            }
            Self::LinkTypeUnknown => Some("Map the source link type to a destination link type."),
            Self::LinkTargetNotMigrated => Some(
                "Migrate the target item first, or set ignore_failed_links = true to downgrade.",
            ),
            Self::LinkNotFound | Self::AttachmentNotMigrated | Self::FieldRejected => None,
            Self::AttachmentRejected => Some("Check destination attachment size and type limits."),
            Self::WorkItemNotFound => {
                Some("The journal points at a destination item that no longer exists.")
            }
            Self::SaveFailed => {
                Some("Inspect the destination error; rerun resumes at this revision.")
            }
            Self::JournalWriteFailed => {
                Some("Check disk space and write permissions for the journal.")
            }
            Self::LockContention => Some("Another wiport run holds the journal lock; retry later."),
            Self::MigrationAborted => {
                Some("Resolve the destination failure; rerun resumes from the journal.")
            }
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

    const ALL: [ErrorCode; 19] = [
        ErrorCode::ConfigParseError,
        ErrorCode::ExportInvalid,
        ErrorCode::ProjectUnavailable,
        ErrorCode::SetupTimedOut,
        ErrorCode::EmptyClassificationPath,
        ErrorCode::ClassificationCreateFailed,
        ErrorCode::LinkTypeUnknown,
        ErrorCode::LinkDirectionMissing,
        ErrorCode::LinkTargetNotMigrated,
        ErrorCode::LinkNotFound,
        ErrorCode::AttachmentNotMigrated,
        ErrorCode::AttachmentRejected,
        ErrorCode::FieldRejected,
        ErrorCode::WorkItemNotFound,
        ErrorCode::SaveFailed,
        ErrorCode::JournalWriteFailed,
        ErrorCode::LockContention,
        ErrorCode::MigrationAborted,
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
    fn display_uses_stable_code() {
        assert_eq!(ErrorCode::MigrationAborted.to_string(), "E9001");
    }
}
