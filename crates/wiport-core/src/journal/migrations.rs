//! Versioned schema migrations for the journal database.

use super::{JournalError, schema};
use rusqlite::{Connection, types::Type};

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 2;

const MIGRATIONS: &[(u32, &str)] = &[(1, schema::MIGRATION_V1_SQL), (2, schema::MIGRATION_V2_SQL)];

/// Read `PRAGMA user_version` as a `u32`.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

/// Apply all pending migrations in ascending order, each in its own
/// transaction. Versions at or below `user_version` are skipped.
///
/// Returns the resulting version, always [`LATEST_SCHEMA_VERSION`].
pub fn migrate(conn: &mut Connection) -> Result<u32, JournalError> {
    let mut current = current_schema_version(conn)?;
    if current > LATEST_SCHEMA_VERSION {
        return Err(JournalError::SchemaTooNew {
            found: current,
            latest: LATEST_SCHEMA_VERSION,
        });
    }

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", i64::from(*version))?;
        tx.execute(
            "UPDATE journal_meta SET schema_version = ?1 WHERE id = 1",
            [i64::from(*version)],
        )?;
        tx.commit()?;
        current = *version;
    }

    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::{LATEST_SCHEMA_VERSION, current_schema_version, migrate};
    use crate::journal::{JournalError, schema};
    use rusqlite::{Connection, params};

    const REQUIRED_INDEXES: &[&str] = &["idx_journal_revisions_processed_at"];

    fn sqlite_object_exists(
        conn: &Connection,
        object_type: &str,
        object_name: &str,
    ) -> rusqlite::Result<bool> {
        conn.query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = ?1 AND name = ?2
            )",
            params![object_type, object_name],
            |row| row.get(0),
        )
    }

    #[test]
    fn migrate_empty_db_to_latest() -> Result<(), JournalError> {
        let mut conn = Connection::open_in_memory()?;

        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);
        assert_eq!(current_schema_version(&conn)?, LATEST_SCHEMA_VERSION);

        for table in [
            "journal_meta",
            "journal_items",
            "journal_revisions",
            "journal_attachments",
        ] {
            assert!(
                sqlite_object_exists(&conn, "table", table)?,
                "missing table {table}"
            );
        }
        for index in REQUIRED_INDEXES {
            assert!(
                sqlite_object_exists(&conn, "index", index)?,
                "missing expected index {index}"
            );
        }
        Ok(())
    }

    #[test]
    fn migrate_is_idempotent() -> Result<(), JournalError> {
        let mut conn = Connection::open_in_memory()?;

        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);
        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);

        let meta_rows: i64 =
            conn.query_row("SELECT COUNT(*) FROM journal_meta", [], |row| row.get(0))?;
        assert_eq!(meta_rows, 1);
        Ok(())
    }

    #[test]
    fn migrate_upgrades_v1_rows() -> Result<(), JournalError> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::MIGRATION_V1_SQL)?;
        conn.pragma_update(None, "user_version", 1_i64)?;
        conn.execute(
            "INSERT INTO journal_items (origin_id, destination_id) VALUES ('PRJ-1', 12)",
            [],
        )?;
        conn.execute(
            "INSERT INTO journal_revisions (origin_id, revision_index, destination_id)
             VALUES ('PRJ-1', 0, 12)",
            [],
        )?;

        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);

        let processed_at: i64 = conn.query_row(
            "SELECT processed_at_us FROM journal_revisions WHERE origin_id = 'PRJ-1'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(processed_at, 0);
        Ok(())
    }

    #[test]
    fn newer_schema_is_refused() -> Result<(), JournalError> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "user_version", 7_i64)?;

        let err = migrate(&mut conn).expect_err("schema from a newer release");
        assert!(matches!(err, JournalError::SchemaTooNew { found: 7, .. }));
        assert_eq!(current_schema_version(&conn)?, 7);
        Ok(())
    }
}
