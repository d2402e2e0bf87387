//! Storage seams used by [`ExperimentClient`](crate::ExperimentClient).
//!
//! [`ExperimentSource`] reads experiment configuration (experiment rows and their variants).
//! [`AssignmentStore`] persists assignments, their counters and the event log. Both are
//! implemented by [`SqliteStore`](crate::SqliteStore); [`ConfigurationStore`] and
//! [`InMemoryAssignmentStore`] cover the in-process cases.
//!
//! [`ConfigurationStore`]: crate::ConfigurationStore
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};

use crate::{
    models::{Assignment, Experiment, ExperimentEvent, NewAssignment, Variant},
    EventKind, Result,
};

/// An experiment together with its variants, in selection order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedExperiment {
    /// `None` if the experiment does not exist.
    pub experiment: Option<Experiment>,
    pub variants: Vec<Variant>,
}

pub trait ExperimentSource: Send + Sync {
    fn fetch_experiment(&self, experiment_key: &str) -> Result<Option<Experiment>>;

    fn fetch_variants(&self, experiment_key: &str) -> Result<Vec<Variant>>;

    /// Fetch the experiment row and its variants.
    ///
    /// The default implementation issues both reads concurrently. Sources that hold a consistent
    /// snapshot in memory should override it to read both from the same snapshot.
    fn load_experiment(&self, experiment_key: &str) -> Result<LoadedExperiment> {
        let (experiment, variants) = std::thread::scope(|scope| {
            let variants = scope.spawn(|| self.fetch_variants(experiment_key));
            let experiment = self.fetch_experiment(experiment_key);
            let variants = variants
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            (experiment, variants)
        });

        Ok(LoadedExperiment {
            experiment: experiment?,
            variants: variants?,
        })
    }
}

/// Result of an idempotent assignment insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(Assignment),
    /// A row for the same (experiment, user) pair already exists.
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Exposures,
    Conversions,
}

impl Counter {
    pub(crate) fn event_kind(self) -> EventKind {
        match self {
            Counter::Exposures => EventKind::Expose,
            Counter::Conversions => EventKind::Convert,
        }
    }

    /// Bump the counter on `assignment` and stamp the matching timestamp.
    pub(crate) fn apply(self, assignment: &mut Assignment, at: DateTime<Utc>) {
        match self {
            Counter::Exposures => {
                assignment.exposures += 1;
                assignment.last_exposed_at = Some(at);
            }
            Counter::Conversions => {
                assignment.conversions += 1;
                assignment.last_converted_at = Some(at);
            }
        }
    }
}

pub trait AssignmentStore: Send + Sync {
    fn fetch_assignment(&self, experiment_key: &str, user_id: &str) -> Result<Option<Assignment>>;

    /// Insert `assignment` unless a row for the same (experiment, user) pair exists, in which case
    /// [`InsertOutcome::Conflict`] is returned and nothing is written.
    fn insert_assignment(&self, assignment: NewAssignment) -> Result<InsertOutcome>;

    /// Increment `counter` by one and stamp its timestamp with `at`. Returns the updated row, or
    /// `None` if there is no assignment for the pair.
    fn increment_counter(
        &self,
        experiment_key: &str,
        user_id: &str,
        counter: Counter,
        at: DateTime<Utc>,
    ) -> Result<Option<Assignment>>;

    fn insert_event(&self, event: &ExperimentEvent) -> Result<()>;
}

impl<T: ExperimentSource + ?Sized> ExperimentSource for Arc<T> {
    fn fetch_experiment(&self, experiment_key: &str) -> Result<Option<Experiment>> {
        (**self).fetch_experiment(experiment_key)
    }

    fn fetch_variants(&self, experiment_key: &str) -> Result<Vec<Variant>> {
        (**self).fetch_variants(experiment_key)
    }

    fn load_experiment(&self, experiment_key: &str) -> Result<LoadedExperiment> {
        (**self).load_experiment(experiment_key)
    }
}

impl<T: AssignmentStore + ?Sized> AssignmentStore for Arc<T> {
    fn fetch_assignment(&self, experiment_key: &str, user_id: &str) -> Result<Option<Assignment>> {
        (**self).fetch_assignment(experiment_key, user_id)
    }

    fn insert_assignment(&self, assignment: NewAssignment) -> Result<InsertOutcome> {
        (**self).insert_assignment(assignment)
    }

    fn increment_counter(
        &self,
        experiment_key: &str,
        user_id: &str,
        counter: Counter,
        at: DateTime<Utc>,
    ) -> Result<Option<Assignment>> {
        (**self).increment_counter(experiment_key, user_id, counter, at)
    }

    fn insert_event(&self, event: &ExperimentEvent) -> Result<()> {
        (**self).insert_event(event)
    }
}

/// `InMemoryAssignmentStore` keeps assignments and events in process memory. Assignments are
/// unique per (experiment, user) pair, so concurrent first resolutions race the same way they do
/// against a database.
#[derive(Default)]
pub struct InMemoryAssignmentStore {
    tables: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    last_id: i64,
    assignments: HashMap<(String, String), Assignment>,
    events: Vec<ExperimentEvent>,
}

impl InMemoryAssignmentStore {
    pub fn new() -> Self {
        InMemoryAssignmentStore::default()
    }

    /// All assignments, ordered by id.
    pub fn assignments(&self) -> Vec<Assignment> {
        let mut assignments: Vec<Assignment> = self.lock().assignments.values().cloned().collect();
        assignments.sort_by_key(|assignment| assignment.id);
        assignments
    }

    /// All events in the order they were appended.
    pub fn events(&self) -> Vec<ExperimentEvent> {
        self.lock().events.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // Err() is possible only if the lock is poisoned (a thread panicked while holding it).
        // None of the critical sections below can panic.
        self.tables
            .lock()
            .expect("thread holding assignment store lock should not panic")
    }
}

impl AssignmentStore for InMemoryAssignmentStore {
    fn fetch_assignment(&self, experiment_key: &str, user_id: &str) -> Result<Option<Assignment>> {
        let key = (experiment_key.to_owned(), user_id.to_owned());
        Ok(self.lock().assignments.get(&key).cloned())
    }

    fn insert_assignment(&self, assignment: NewAssignment) -> Result<InsertOutcome> {
        let key = (
            assignment.experiment_key.clone(),
            assignment.user_id.clone(),
        );

        let mut tables = self.lock();
        if tables.assignments.contains_key(&key) {
            return Ok(InsertOutcome::Conflict);
        }
        tables.last_id += 1;
        let row = assignment.into_assignment(tables.last_id);
        tables.assignments.insert(key, row.clone());
        Ok(InsertOutcome::Inserted(row))
    }

    fn increment_counter(
        &self,
        experiment_key: &str,
        user_id: &str,
        counter: Counter,
        at: DateTime<Utc>,
    ) -> Result<Option<Assignment>> {
        let key = (experiment_key.to_owned(), user_id.to_owned());

        let mut tables = self.lock();
        Ok(tables.assignments.get_mut(&key).map(|assignment| {
            counter.apply(assignment, at);
            assignment.clone()
        }))
    }

    fn insert_event(&self, event: &ExperimentEvent) -> Result<()> {
        self.lock().events.push(event.clone());
        Ok(())
    }
}
