//! SQLite storage for user settings, exercises, and attempts
//!
//! The run pipeline only sees the narrow store traits below; `Storage`
//! implements all of them plus the management operations used by the CLI.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

use crate::error::Result;
use crate::migrations::run_migrations;
use crate::types::{AiMode, Attempt, AttemptSummary, Exercise};
use crate::vault::CredentialRecord;

/// Per-user AI configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: String,
    pub ai_mode: Option<AiMode>,
    pub local_stt_url: Option<String>,
    pub local_llm_url: Option<String>,
    /// Present only when both ciphertext and iv are stored
    pub credential: Option<CredentialRecord>,
}

impl UserSettings {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }
}

/// Attempt persistence, always scoped to the owning user for reads and updates
pub trait AttemptStore: Send + Sync {
    fn find_attempt(&self, id: &str, user_id: &str) -> Result<Option<Attempt>>;

    fn insert_attempt(&self, attempt: &Attempt) -> Result<()>;

    /// Overwrite the result columns of `(attempt.id, attempt.user_id)`; false if no row matched
    fn update_attempt(&self, attempt: &Attempt) -> Result<bool>;
}

pub trait ExerciseStore: Send + Sync {
    fn get_exercise(&self, id: &str) -> Result<Option<Exercise>>;
}

pub trait SettingsStore: Send + Sync {
    fn get_user_settings(&self, user_id: &str) -> Result<Option<UserSettings>>;
}

/// Everything the run pipeline reads and writes
pub trait PracticeStore: AttemptStore + ExerciseStore + SettingsStore {}

impl<T: AttemptStore + ExerciseStore + SettingsStore> PracticeStore for T {}

/// Storage backend using SQLite
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory database (useful for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        run_migrations(&conn)?;
        info!("Database schema initialized");
        Ok(())
    }

    // ========== Attempts ==========

    /// Create the empty shell for an explicitly started attempt
    pub fn start_attempt(&self, user_id: &str, exercise_id: &str) -> Result<Attempt> {
        let attempt = Attempt::start(user_id, exercise_id);
        self.insert_attempt(&attempt)?;
        info!(attempt_id = %attempt.id, user_id, exercise_id, "Attempt started");
        Ok(attempt)
    }

    /// Record where the caller stored the raw audio
    pub fn set_audio_ref(&self, id: &str, user_id: &str, audio_ref: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE attempts SET audio_ref = ?1 WHERE id = ?2 AND user_id = ?3",
            params![audio_ref, id, user_id],
        )?;
        Ok(changed > 0)
    }

    /// Stamp the completion time
    pub fn complete_attempt(&self, id: &str, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE attempts SET completed_at = ?1 WHERE id = ?2 AND user_id = ?3",
            params![Utc::now().to_rfc3339(), id, user_id],
        )?;
        Ok(changed > 0)
    }

    /// Attempts owned by `user_id`, newest first, optionally for one exercise
    pub fn list_attempts(&self, user_id: &str, exercise_id: Option<&str>) -> Result<Vec<AttemptSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, exercise_id, overall_score, overall_pass, completed_at, started_at
            FROM attempts
            WHERE user_id = ?1 AND (?2 IS NULL OR exercise_id = ?2)
            ORDER BY started_at DESC
            "#,
        )?;

        let summaries = stmt
            .query_map(params![user_id, exercise_id], |row| {
                let completed_at: Option<String> = row.get(4)?;
                let started_at: String = row.get(5)?;
                Ok(AttemptSummary {
                    id: row.get(0)?,
                    exercise_id: row.get(1)?,
                    overall_score: row.get(2)?,
                    overall_pass: row.get(3)?,
                    completed_at: parse_timestamp(completed_at.as_deref().unwrap_or(started_at.as_str())),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        debug!(user_id, count = summaries.len(), "Listed attempts");
        Ok(summaries)
    }

    // ========== Exercises ==========

    /// Insert or replace an exercise document
    pub fn save_exercise(&self, exercise: &Exercise) -> Result<()> {
        let document = serde_json::to_string(exercise)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO exercises (id, slug, title, document, is_published, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                slug = excluded.slug,
                title = excluded.title,
                document = excluded.document,
                is_published = excluded.is_published,
                updated_at = excluded.updated_at
            "#,
            params![
                exercise.id,
                exercise.slug,
                exercise.title,
                document,
                exercise.is_published,
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!(exercise_id = %exercise.id, "Saved exercise");
        Ok(())
    }

    // ========== User settings ==========

    /// Replace the whole settings row for a user
    pub fn save_user_settings(&self, settings: &UserSettings) -> Result<()> {
        write_settings(&self.conn.lock(), settings)
    }

    /// Read-modify-write on a user's settings row, creating it if absent
    ///
    /// The read and the upsert share one lock so concurrent partial updates
    /// for the same user cannot overwrite each other.
    fn update_settings(&self, user_id: &str, change: impl FnOnce(&mut UserSettings)) -> Result<()> {
        let conn = self.conn.lock();
        let mut settings =
            read_settings(&conn, user_id)?.unwrap_or_else(|| UserSettings::new(user_id));
        change(&mut settings);
        write_settings(&conn, &settings)
    }

    pub fn set_ai_mode(&self, user_id: &str, mode: Option<AiMode>) -> Result<()> {
        self.update_settings(user_id, |s| s.ai_mode = mode)
    }

    pub fn set_local_endpoints(
        &self,
        user_id: &str,
        stt_url: Option<String>,
        llm_url: Option<String>,
    ) -> Result<()> {
        self.update_settings(user_id, |s| {
            s.local_stt_url = stt_url;
            s.local_llm_url = llm_url;
        })
    }

    /// Store an already-encrypted vendor key; ciphertext and iv are written together
    pub fn set_credential(&self, user_id: &str, record: CredentialRecord) -> Result<()> {
        self.update_settings(user_id, |s| s.credential = Some(record))?;
        info!(user_id, "Stored encrypted credential");
        Ok(())
    }

    pub fn clear_credential(&self, user_id: &str) -> Result<()> {
        self.update_settings(user_id, |s| s.credential = None)?;
        info!(user_id, "Cleared stored credential");
        Ok(())
    }
}

impl AttemptStore for Storage {
    fn find_attempt(&self, id: &str, user_id: &str) -> Result<Option<Attempt>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
            SELECT id, user_id, exercise_id, started_at, completed_at, audio_ref,
                   transcript, evaluation, overall_score, overall_pass, model_info
            FROM attempts
            WHERE id = ?1 AND user_id = ?2
            "#,
            params![id, user_id],
            row_to_attempt,
        )
        .optional()
        .map_err(Into::into)
    }

    fn insert_attempt(&self, attempt: &Attempt) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO attempts (id, user_id, exercise_id, started_at, completed_at, audio_ref,
                                  transcript, evaluation, overall_score, overall_pass, model_info)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                attempt.id,
                attempt.user_id,
                attempt.exercise_id,
                attempt.started_at.to_rfc3339(),
                attempt.completed_at.map(|t| t.to_rfc3339()),
                attempt.audio_ref,
                attempt.transcript,
                attempt.evaluation.to_string(),
                attempt.overall_score,
                attempt.overall_pass,
                attempt.model_info.to_string(),
            ],
        )?;
        debug!(attempt_id = %attempt.id, "Inserted attempt");
        Ok(())
    }

    fn update_attempt(&self, attempt: &Attempt) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            UPDATE attempts SET
                completed_at = ?1,
                transcript = ?2,
                evaluation = ?3,
                overall_score = ?4,
                overall_pass = ?5,
                model_info = ?6
            WHERE id = ?7 AND user_id = ?8
            "#,
            params![
                attempt.completed_at.map(|t| t.to_rfc3339()),
                attempt.transcript,
                attempt.evaluation.to_string(),
                attempt.overall_score,
                attempt.overall_pass,
                attempt.model_info.to_string(),
                attempt.id,
                attempt.user_id,
            ],
        )?;
        debug!(attempt_id = %attempt.id, changed, "Updated attempt");
        Ok(changed > 0)
    }
}

impl ExerciseStore for Storage {
    fn get_exercise(&self, id: &str) -> Result<Option<Exercise>> {
        let conn = self.conn.lock();
        let document: Option<String> = conn
            .query_row(
                "SELECT document FROM exercises WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        document
            .map(|doc| serde_json::from_str::<Exercise>(&doc))
            .transpose()
            .map_err(Into::into)
    }
}

impl SettingsStore for Storage {
    fn get_user_settings(&self, user_id: &str) -> Result<Option<UserSettings>> {
        read_settings(&self.conn.lock(), user_id)
    }
}

fn read_settings(conn: &Connection, user_id: &str) -> Result<Option<UserSettings>> {
    conn.query_row(
        r#"
        SELECT user_id, ai_mode, local_stt_url, local_llm_url,
               openai_key_ciphertext, openai_key_iv, openai_key_kid
        FROM user_settings
        WHERE user_id = ?1
        "#,
        params![user_id],
        |row| {
            let ai_mode: Option<String> = row.get(1)?;
            Ok(UserSettings {
                user_id: row.get(0)?,
                ai_mode: ai_mode.as_deref().and_then(AiMode::parse),
                local_stt_url: non_empty(row.get(2)?),
                local_llm_url: non_empty(row.get(3)?),
                credential: CredentialRecord::from_parts(row.get(4)?, row.get(5)?, row.get(6)?),
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/// Replace the whole settings row for a user
fn write_settings(conn: &Connection, settings: &UserSettings) -> Result<()> {
    let credential = settings.credential.as_ref();
    conn.execute(
        r#"
        INSERT INTO user_settings (user_id, ai_mode, local_stt_url, local_llm_url,
                                   openai_key_ciphertext, openai_key_iv, openai_key_kid, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(user_id) DO UPDATE SET
            ai_mode = excluded.ai_mode,
            local_stt_url = excluded.local_stt_url,
            local_llm_url = excluded.local_llm_url,
            openai_key_ciphertext = excluded.openai_key_ciphertext,
            openai_key_iv = excluded.openai_key_iv,
            openai_key_kid = excluded.openai_key_kid,
            updated_at = excluded.updated_at
        "#,
        params![
            settings.user_id,
            settings.ai_mode.map(|m| m.as_str()),
            settings.local_stt_url,
            settings.local_llm_url,
            credential.map(|c| &c.ciphertext),
            credential.map(|c| &c.iv),
            credential.map(|c| &c.key_version),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_attempt(row: &Row<'_>) -> rusqlite::Result<Attempt> {
    let started_at: String = row.get(3)?;
    let completed_at: Option<String> = row.get(4)?;
    Ok(Attempt {
        id: row.get(0)?,
        user_id: row.get(1)?,
        exercise_id: row.get(2)?,
        started_at: parse_timestamp(&started_at),
        completed_at: completed_at.as_deref().map(parse_timestamp),
        audio_ref: row.get(5)?,
        transcript: row.get(6)?,
        evaluation: json_column(row, 7)?,
        overall_score: row.get(8)?,
        overall_pass: row.get(9)?,
        model_info: json_column(row, 10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exercise(id: &str) -> Exercise {
        serde_json::from_value(json!({
            "id": id,
            "slug": "reflect-feelings",
            "title": "Reflect feelings",
            "objectives": [{ "id": "o1", "label": "Reflect" }]
        }))
        .unwrap()
    }

    #[test]
    fn test_exercise_roundtrip_and_replace() {
        let storage = Storage::in_memory().unwrap();
        let mut ex = exercise("ex-1");
        storage.save_exercise(&ex).unwrap();

        ex.title = "Reflect feelings (revised)".to_string();
        storage.save_exercise(&ex).unwrap();

        let loaded = storage.get_exercise("ex-1").unwrap().unwrap();
        assert_eq!(loaded, ex);
        assert!(storage.get_exercise("missing").unwrap().is_none());
    }

    #[test]
    fn test_attempt_lookup_is_scoped_to_owner() {
        let storage = Storage::in_memory().unwrap();
        let attempt = storage.start_attempt("alice", "ex-1").unwrap();

        assert!(storage.find_attempt(&attempt.id, "alice").unwrap().is_some());
        assert!(storage.find_attempt(&attempt.id, "mallory").unwrap().is_none());
    }

    #[test]
    fn test_update_does_not_touch_other_users_rows() {
        let storage = Storage::in_memory().unwrap();
        let attempt = storage.start_attempt("alice", "ex-1").unwrap();

        let mut forged = attempt.clone();
        forged.user_id = "mallory".to_string();
        forged.transcript = "overwritten".to_string();
        assert!(!storage.update_attempt(&forged).unwrap());

        let stored = storage.find_attempt(&attempt.id, "alice").unwrap().unwrap();
        assert_eq!(stored.transcript, "");
    }

    #[test]
    fn test_update_writes_result_columns() {
        let storage = Storage::in_memory().unwrap();
        let mut attempt = storage.start_attempt("alice", "ex-1").unwrap();

        attempt.transcript = "It sounds lonely.".to_string();
        attempt.evaluation = json!({ "version": "1.0" });
        attempt.overall_score = 3.5;
        attempt.overall_pass = true;
        attempt.completed_at = Some(Utc::now());
        attempt.model_info = json!({ "provider": { "stt": { "kind": "local", "model": "m" }, "llm": null } });
        assert!(storage.update_attempt(&attempt).unwrap());

        let stored = storage.find_attempt(&attempt.id, "alice").unwrap().unwrap();
        assert_eq!(stored.transcript, "It sounds lonely.");
        assert_eq!(stored.overall_score, 3.5);
        assert!(stored.overall_pass);
        assert_eq!(stored.evaluation, json!({ "version": "1.0" }));
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn test_missing_settings_row_is_none() {
        let storage = Storage::in_memory().unwrap();
        assert!(storage.get_user_settings("nobody").unwrap().is_none());
    }

    #[test]
    fn test_settings_partial_updates_compose() {
        let storage = Storage::in_memory().unwrap();
        storage.set_ai_mode("u1", Some(AiMode::LocalOnly)).unwrap();
        storage
            .set_local_endpoints("u1", Some("http://gpu:7001".to_string()), None)
            .unwrap();

        let settings = storage.get_user_settings("u1").unwrap().unwrap();
        assert_eq!(settings.ai_mode, Some(AiMode::LocalOnly));
        assert_eq!(settings.local_stt_url.as_deref(), Some("http://gpu:7001"));
        assert!(settings.local_llm_url.is_none());
        assert!(settings.credential.is_none());
    }

    #[test]
    fn test_half_written_credential_reads_as_none() {
        let storage = Storage::in_memory().unwrap();
        storage.set_ai_mode("u1", None).unwrap();
        storage
            .conn
            .lock()
            .execute(
                "UPDATE user_settings SET openai_key_ciphertext = 'abc' WHERE user_id = 'u1'",
                [],
            )
            .unwrap();

        let settings = storage.get_user_settings("u1").unwrap().unwrap();
        assert!(settings.credential.is_none());
    }
}
