//! SQLite-backed experiment configuration and assignment storage.
use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use rusqlite::{ffi, params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use crate::{
    models::{Assignment, Experiment, ExperimentEvent, GuardrailState, NewAssignment, Variant},
    store::{AssignmentStore, Counter, ExperimentSource, InsertOutcome},
    Error, Result,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS experiments (
    key TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    default_variant TEXT,
    traffic_percentage REAL NOT NULL DEFAULT 100,
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE TABLE IF NOT EXISTS experiment_variants (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_key TEXT NOT NULL,
    variant TEXT NOT NULL,
    weight REAL NOT NULL DEFAULT 1,
    is_default INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}',
    UNIQUE (experiment_key, variant)
);
CREATE TABLE IF NOT EXISTS experiment_assignments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_key TEXT NOT NULL,
    user_id TEXT NOT NULL,
    variant TEXT NOT NULL,
    assigned_at TEXT NOT NULL,
    guardrail_state TEXT NOT NULL DEFAULT 'active',
    exposures INTEGER NOT NULL DEFAULT 0,
    conversions INTEGER NOT NULL DEFAULT 0,
    last_exposed_at TEXT,
    last_converted_at TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    UNIQUE (experiment_key, user_id)
);
CREATE TABLE IF NOT EXISTS experiment_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_key TEXT NOT NULL,
    user_id TEXT NOT NULL,
    variant TEXT NOT NULL,
    event TEXT NOT NULL,
    context TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
";

const ASSIGNMENT_COLUMNS: &str = "id, experiment_key, user_id, variant, assigned_at, \
     guardrail_state, exposures, conversions, last_exposed_at, last_converted_at, metadata";

/// `SqliteStore` keeps experiments, variants, assignments and events in a SQLite database.
///
/// Assignment uniqueness is enforced by a `UNIQUE (experiment_key, user_id)` constraint, so
/// several processes sharing one database file still create at most one row per pair.
pub struct SqliteStore {
    connection: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<SqliteStore> {
        SqliteStore::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<SqliteStore> {
        SqliteStore::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(connection: Connection) -> Result<SqliteStore> {
        connection.execute_batch(SCHEMA)?;
        Ok(SqliteStore {
            connection: Mutex::new(connection),
        })
    }

    /// Create or replace an experiment and its variants. Variant order is preserved.
    pub fn put_experiment(&self, experiment: &Experiment, variants: &[Variant]) -> Result<()> {
        let mut connection = self.lock();
        let tx = connection.transaction()?;
        tx.execute(
            "INSERT INTO experiments (key, status, default_variant, traffic_percentage, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                status = excluded.status,
                default_variant = excluded.default_variant,
                traffic_percentage = excluded.traffic_percentage,
                metadata = excluded.metadata",
            params![
                experiment.key,
                experiment.status.as_str(),
                experiment.default_variant,
                experiment.traffic_percentage,
                serde_json::to_string(&experiment.metadata)?,
            ],
        )?;
        tx.execute(
            "DELETE FROM experiment_variants WHERE experiment_key = ?1",
            params![experiment.key],
        )?;
        for variant in variants {
            tx.execute(
                "INSERT INTO experiment_variants (experiment_key, variant, weight, is_default, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    experiment.key,
                    variant.variant,
                    variant.weight,
                    variant.is_default,
                    serde_json::to_string(&variant.metadata)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Set the guardrail state of an existing assignment. Returns `false` if there is no such row.
    pub fn set_guardrail_state(
        &self,
        experiment_key: &str,
        user_id: &str,
        state: GuardrailState,
    ) -> Result<bool> {
        let changed = self.lock().execute(
            "UPDATE experiment_assignments SET guardrail_state = ?3
             WHERE experiment_key = ?1 AND user_id = ?2",
            params![experiment_key, user_id, state.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Events recorded for `experiment_key`, oldest first.
    pub fn events(&self, experiment_key: &str) -> Result<Vec<ExperimentEvent>> {
        let connection = self.lock();
        let mut statement = connection.prepare(
            "SELECT experiment_key, user_id, variant, event, context
             FROM experiment_events WHERE experiment_key = ?1 ORDER BY id",
        )?;
        let rows = statement
            .query_map(params![experiment_key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut events = Vec::with_capacity(rows.len());
        for (experiment_key, user_id, variant, event, context) in rows {
            events.push(ExperimentEvent {
                experiment_key,
                user_id,
                variant,
                event: parse_label(event)?,
                context: serde_json::from_str(&context)?,
            });
        }
        Ok(events)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // Err() is possible only if the lock is poisoned (a thread panicked while holding it).
        self.connection
            .lock()
            .expect("thread holding sqlite connection should not panic")
    }

    fn query_assignment(
        connection: &Connection,
        experiment_key: &str,
        user_id: &str,
    ) -> Result<Option<Assignment>> {
        let raw = connection
            .query_row(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM experiment_assignments
                     WHERE experiment_key = ?1 AND user_id = ?2"
                ),
                params![experiment_key, user_id],
                RawAssignment::from_row,
            )
            .optional()?;
        raw.map(RawAssignment::into_assignment).transpose()
    }
}

impl ExperimentSource for SqliteStore {
    fn fetch_experiment(&self, experiment_key: &str) -> Result<Option<Experiment>> {
        let raw = self
            .lock()
            .query_row(
                "SELECT status, default_variant, traffic_percentage, metadata
                 FROM experiments WHERE key = ?1",
                params![experiment_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((status, default_variant, traffic_percentage, metadata)) = raw else {
            return Ok(None);
        };
        let parse_error = |_: serde_json::Error| Error::ConfigurationParseError {
            experiment_key: experiment_key.to_owned(),
        };
        Ok(Some(Experiment {
            key: experiment_key.to_owned(),
            status: parse_label(status).map_err(parse_error)?,
            default_variant,
            traffic_percentage,
            metadata: serde_json::from_str(&metadata).map_err(parse_error)?,
        }))
    }

    fn fetch_variants(&self, experiment_key: &str) -> Result<Vec<Variant>> {
        let connection = self.lock();
        let mut statement = connection.prepare(
            "SELECT variant, weight, is_default, metadata
             FROM experiment_variants WHERE experiment_key = ?1 ORDER BY id",
        )?;
        let rows = statement
            .query_map(params![experiment_key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let parse_error = |_: serde_json::Error| Error::ConfigurationParseError {
            experiment_key: experiment_key.to_owned(),
        };
        let mut variants = Vec::with_capacity(rows.len());
        for (variant, weight, is_default, metadata) in rows {
            variants.push(Variant {
                experiment_key: experiment_key.to_owned(),
                variant,
                weight,
                is_default,
                metadata: serde_json::from_str(&metadata).map_err(parse_error)?,
            });
        }
        Ok(variants)
    }
}

impl AssignmentStore for SqliteStore {
    fn fetch_assignment(&self, experiment_key: &str, user_id: &str) -> Result<Option<Assignment>> {
        SqliteStore::query_assignment(&self.lock(), experiment_key, user_id)
    }

    fn insert_assignment(&self, assignment: NewAssignment) -> Result<InsertOutcome> {
        let connection = self.lock();
        let result = connection.execute(
            "INSERT INTO experiment_assignments
                (experiment_key, user_id, variant, assigned_at, guardrail_state, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                assignment.experiment_key,
                assignment.user_id,
                assignment.variant,
                assignment.assigned_at,
                GuardrailState::Active.as_str(),
                serde_json::to_string(&assignment.metadata)?,
            ],
        );
        match result {
            Ok(_) => {
                let id = connection.last_insert_rowid();
                Ok(InsertOutcome::Inserted(assignment.into_assignment(id)))
            }
            // Only the (experiment_key, user_id) uniqueness constraint means another resolver won.
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Ok(InsertOutcome::Conflict)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn increment_counter(
        &self,
        experiment_key: &str,
        user_id: &str,
        counter: Counter,
        at: DateTime<Utc>,
    ) -> Result<Option<Assignment>> {
        let sql = match counter {
            Counter::Exposures => {
                "UPDATE experiment_assignments
                 SET exposures = exposures + 1, last_exposed_at = ?3
                 WHERE experiment_key = ?1 AND user_id = ?2"
            }
            Counter::Conversions => {
                "UPDATE experiment_assignments
                 SET conversions = conversions + 1, last_converted_at = ?3
                 WHERE experiment_key = ?1 AND user_id = ?2"
            }
        };

        let connection = self.lock();
        let changed = connection.execute(sql, params![experiment_key, user_id, at])?;
        if changed == 0 {
            return Ok(None);
        }
        SqliteStore::query_assignment(&connection, experiment_key, user_id)
    }

    fn insert_event(&self, event: &ExperimentEvent) -> Result<()> {
        self.lock().execute(
            "INSERT INTO experiment_events (experiment_key, user_id, variant, event, context, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.experiment_key,
                event.user_id,
                event.variant,
                event.event.as_str(),
                serde_json::to_string(&event.context)?,
                Utc::now(),
            ],
        )?;
        Ok(())
    }
}

/// Column values of an assignment row, before JSON and label decoding.
struct RawAssignment {
    id: i64,
    experiment_key: String,
    user_id: String,
    variant: String,
    assigned_at: DateTime<Utc>,
    guardrail_state: String,
    exposures: i64,
    conversions: i64,
    last_exposed_at: Option<DateTime<Utc>>,
    last_converted_at: Option<DateTime<Utc>>,
    metadata: String,
}

impl RawAssignment {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<RawAssignment> {
        Ok(RawAssignment {
            id: row.get(0)?,
            experiment_key: row.get(1)?,
            user_id: row.get(2)?,
            variant: row.get(3)?,
            assigned_at: row.get(4)?,
            guardrail_state: row.get(5)?,
            exposures: row.get(6)?,
            conversions: row.get(7)?,
            last_exposed_at: row.get(8)?,
            last_converted_at: row.get(9)?,
            metadata: row.get(10)?,
        })
    }

    fn into_assignment(self) -> Result<Assignment> {
        Ok(Assignment {
            id: self.id,
            experiment_key: self.experiment_key,
            user_id: self.user_id,
            variant: self.variant,
            assigned_at: self.assigned_at,
            guardrail_state: parse_label(self.guardrail_state)?,
            exposures: self.exposures.max(0) as u64,
            conversions: self.conversions.max(0) as u64,
            last_exposed_at: self.last_exposed_at,
            last_converted_at: self.last_converted_at,
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }
}

/// Decode a lowercase enum label (`"running"`, `"disabled"`, ...) stored as text.
fn parse_label<T: DeserializeOwned>(label: String) -> serde_json::Result<T> {
    serde_json::from_value(serde_json::Value::String(label))
}
