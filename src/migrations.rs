//! Embedded SQL migrations for the practice database
//!
//! Migrations are compiled into the binary and applied in order. Applied
//! names are tracked in a `_migrations` table.

use rusqlite::Connection;
use tracing::{debug, info, warn};

const MIGRATIONS: &[(&str, &str)] = &[(
    "001_initial_schema.sql",
    include_str!("../migrations/001_initial_schema.sql"),
)];

/// Apply every migration not yet recorded, returning how many ran
pub fn run_migrations(conn: &Connection) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let applied = applied_migrations(conn)?;
    let mut applied_count = 0;

    for (name, sql) in MIGRATIONS {
        if applied.iter().any(|a| a == name) {
            debug!(migration = name, "Migration already applied");
            continue;
        }

        info!(migration = name, "Applying migration");

        match conn.execute_batch(sql) {
            Ok(()) => {
                conn.execute("INSERT INTO _migrations (name) VALUES (?1)", [name])?;
                applied_count += 1;
            }
            // objects created outside the tracker: record and move on
            Err(e) if e.to_string().contains("already exists") => {
                warn!(migration = name, error = %e, "Migration partially applied");
                conn.execute("INSERT OR IGNORE INTO _migrations (name) VALUES (?1)", [name])?;
                applied_count += 1;
            }
            Err(e) => return Err(e),
        }
    }

    if applied_count > 0 {
        info!(count = applied_count, "Applied new migrations");
    } else {
        debug!("Database schema is up to date");
    }

    Ok(applied_count)
}

/// Names of applied migrations, oldest first
pub fn applied_migrations(conn: &Connection) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT name FROM _migrations ORDER BY id")?;
    stmt.query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        let first = run_migrations(&conn).unwrap();
        let second = run_migrations(&conn).unwrap();

        assert_eq!(first, MIGRATIONS.len());
        assert_eq!(second, 0);
    }

    #[test]
    fn test_migrations_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for table in ["user_settings", "exercises", "attempts", "_migrations"] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn test_applied_migrations_tracked() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let applied = applied_migrations(&conn).unwrap();
        assert_eq!(applied, vec!["001_initial_schema.sql".to_string()]);
    }
}
