//! Table layout for the migration journal.
//!
//! - `journal_items` maps source origin ids to destination work item ids
//! - `journal_revisions` marks replayed `(origin id, revision index)` pairs
//! - `journal_attachments` maps source attachment ids to destination ids
//! - `journal_meta` tracks the schema version

/// Migration v1: mapping and completion tables plus metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS journal_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL
);

INSERT OR IGNORE INTO journal_meta (id, schema_version) VALUES (1, 0);

CREATE TABLE IF NOT EXISTS journal_items (
    origin_id TEXT PRIMARY KEY CHECK (length(trim(origin_id)) > 0),
    destination_id INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS journal_revisions (
    origin_id TEXT NOT NULL REFERENCES journal_items(origin_id),
    revision_index INTEGER NOT NULL CHECK (revision_index >= 0),
    destination_id INTEGER NOT NULL,
    PRIMARY KEY (origin_id, revision_index)
);

CREATE TABLE IF NOT EXISTS journal_attachments (
    origin_id TEXT PRIMARY KEY CHECK (length(trim(origin_id)) > 0),
    attachment_id INTEGER NOT NULL
);
";

/// Migration v2: record when each revision was replayed.
pub const MIGRATION_V2_SQL: &str = r"
ALTER TABLE journal_revisions ADD COLUMN processed_at_us INTEGER NOT NULL DEFAULT 0;

CREATE INDEX IF NOT EXISTS idx_journal_revisions_processed_at
    ON journal_revisions(processed_at_us);
";
