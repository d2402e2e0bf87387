use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    context::Context,
    models::{Assignment, EventKind, ExperimentEvent, GuardrailState, NewAssignment},
    selection::{pick_weighted_variant, resolve_default_variant},
    sharder::Sha256Sharder,
    store::{Counter, InsertOutcome, LoadedExperiment},
    ClientConfig, Error, Result,
};

/// Resolves and records experiment assignments.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// # Examples
/// ```
/// # use experiments::{AssignmentRequest, ClientConfig, ConfigurationStore};
/// # use experiments::InMemoryAssignmentStore;
/// let config = ClientConfig::new(ConfigurationStore::new(), InMemoryAssignmentStore::new());
/// let client = config.to_client();
/// let state = client.resolve_assignment(&AssignmentRequest::new("exp-42", "user-7")).unwrap();
/// assert!(state.holdout);
/// ```
pub struct ExperimentClient<'a> {
    config: ClientConfig<'a>,
}

/// Input of [`ExperimentClient::resolve_assignment`] and the recorders.
#[derive(Debug, Clone, Default)]
pub struct AssignmentRequest {
    pub experiment_key: String,
    pub user_id: String,
    /// Stored with emitted events and as the metadata of a newly created assignment.
    pub context: Context,
    /// Resolve without creating an assignment. Users without one are served as holdouts.
    pub skip_create: bool,
}

impl AssignmentRequest {
    pub fn new(experiment_key: impl Into<String>, user_id: impl Into<String>) -> Self {
        AssignmentRequest {
            experiment_key: experiment_key.into(),
            user_id: user_id.into(),
            context: Context::new(),
            skip_create: false,
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn with_skip_create(mut self, skip_create: bool) -> Self {
        self.skip_create = skip_create;
        self
    }
}

/// Resolved assignment of a user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssignmentState {
    pub experiment_key: String,
    pub user_id: String,
    pub variant: String,
    /// `None` for holdouts without a stored assignment.
    pub assigned_at: Option<DateTime<Utc>>,
    /// The user is not enrolled and is served the default behavior.
    pub holdout: bool,
    /// The assignment was created by this call.
    pub created: bool,
    pub exposures: u64,
    pub conversions: u64,
    pub last_exposed_at: Option<DateTime<Utc>>,
    pub last_converted_at: Option<DateTime<Utc>>,
}

impl AssignmentState {
    fn from_assignment(assignment: &Assignment, created: bool) -> Self {
        AssignmentState {
            experiment_key: assignment.experiment_key.clone(),
            user_id: assignment.user_id.clone(),
            variant: assignment.variant.clone(),
            assigned_at: Some(assignment.assigned_at),
            holdout: assignment.guardrail_state == GuardrailState::Disabled,
            created,
            exposures: assignment.exposures,
            conversions: assignment.conversions,
            last_exposed_at: assignment.last_exposed_at,
            last_converted_at: assignment.last_converted_at,
        }
    }

    fn holdout(request: &AssignmentRequest, variant: String) -> Self {
        AssignmentState {
            experiment_key: request.experiment_key.clone(),
            user_id: request.user_id.clone(),
            variant,
            assigned_at: None,
            holdout: true,
            created: false,
            exposures: 0,
            conversions: 0,
            last_exposed_at: None,
            last_converted_at: None,
        }
    }
}

impl<'a> ExperimentClient<'a> {
    /// Create a new `ExperimentClient` using the specified configuration.
    pub fn new(config: ClientConfig<'a>) -> Self {
        ExperimentClient { config }
    }

    /// Resolve the assignment of `request.user_id` in `request.experiment_key`, creating it on the
    /// first call for an eligible user.
    ///
    /// Errors are returned only for storage or configuration failures. A concurrent resolver
    /// winning the insert race is not an error: the row it created is returned instead.
    pub fn resolve_assignment(&self, request: &AssignmentRequest) -> Result<AssignmentState> {
        let experiment_key = request.experiment_key.as_str();
        let user_id = request.user_id.as_str();

        let LoadedExperiment {
            experiment,
            variants,
        } = self
            .config
            .source
            .load_experiment(experiment_key)
            .inspect_err(|err| {
                log::warn!(target: "experiments",
                           experiment_key,
                           user_id;
                           "error occurred while loading experiment configuration: {:?}", err);
            })?;

        let store = &self.config.store;
        if let Some(existing) = store.fetch_assignment(experiment_key, user_id)? {
            log::trace!(target: "experiments",
                        experiment_key,
                        user_id,
                        variant:display = existing.variant;
                        "found existing assignment");
            return Ok(AssignmentState::from_assignment(&existing, false));
        }

        let default_variant = resolve_default_variant(
            experiment.as_ref(),
            &variants,
            &self.config.fallback_variant,
        );

        let eligible = !request.skip_create
            && experiment.as_ref().is_some_and(|experiment| {
                experiment.is_running() && experiment.includes_user(user_id, &Sha256Sharder)
            });
        if !eligible {
            log::trace!(target: "experiments",
                        experiment_key,
                        user_id,
                        variant:display = default_variant;
                        "serving holdout");
            return Ok(AssignmentState::holdout(request, default_variant));
        }

        let variant = pick_weighted_variant(
            experiment_key,
            user_id,
            &variants,
            &default_variant,
            &Sha256Sharder,
        );

        let new_assignment = NewAssignment {
            experiment_key: experiment_key.to_owned(),
            user_id: user_id.to_owned(),
            variant,
            assigned_at: Utc::now(),
            metadata: request.context.as_map().clone(),
        };

        match store.insert_assignment(new_assignment)? {
            InsertOutcome::Inserted(assignment) => {
                log::trace!(target: "experiments",
                            experiment_key,
                            user_id,
                            variant:display = assignment.variant;
                            "created assignment");
                self.emit_event(EventKind::Assign, &assignment.variant, request);
                Ok(AssignmentState::from_assignment(&assignment, true))
            }
            InsertOutcome::Conflict => {
                // Another resolver inserted the row first. Its variant wins.
                log::debug!(target: "experiments",
                            experiment_key,
                            user_id;
                            "assignment insert conflicted, fetching existing row");
                let existing = store
                    .fetch_assignment(experiment_key, user_id)?
                    .ok_or_else(|| Error::AssignmentVanished {
                        experiment_key: experiment_key.to_owned(),
                        user_id: user_id.to_owned(),
                    })?;
                Ok(AssignmentState::from_assignment(&existing, false))
            }
        }
    }

    /// Record that the user has seen their variant.
    ///
    /// Holdouts are returned unchanged without touching counters or emitting events.
    pub fn record_exposure(&self, request: &AssignmentRequest) -> Result<AssignmentState> {
        self.record(request, Counter::Exposures)
    }

    /// Record that the user completed the action measured by the experiment.
    ///
    /// Holdouts are returned unchanged without touching counters or emitting events.
    pub fn record_conversion(&self, request: &AssignmentRequest) -> Result<AssignmentState> {
        self.record(request, Counter::Conversions)
    }

    fn record(&self, request: &AssignmentRequest, counter: Counter) -> Result<AssignmentState> {
        let state = self.resolve_assignment(request)?;
        if state.holdout {
            return Ok(state);
        }

        let updated = self.config.store.increment_counter(
            &request.experiment_key,
            &request.user_id,
            counter,
            Utc::now(),
        );
        self.emit_event(counter.event_kind(), &state.variant, request);

        match updated? {
            Some(assignment) => Ok(AssignmentState::from_assignment(&assignment, state.created)),
            None => {
                log::debug!(target: "experiments",
                            experiment_key = request.experiment_key.as_str(),
                            user_id = request.user_id.as_str();
                            "assignment disappeared before its counter could be updated");
                Ok(state)
            }
        }
    }

    /// Write `kind` to the event table and the analytics sink. Failures are logged and dropped.
    fn emit_event(&self, kind: EventKind, variant: &str, request: &AssignmentRequest) {
        let event = ExperimentEvent {
            experiment_key: request.experiment_key.clone(),
            user_id: request.user_id.clone(),
            variant: variant.to_owned(),
            event: kind,
            context: request.context.clone(),
        };

        if let Err(err) = self.config.store.insert_event(&event) {
            log::warn!(target: "experiments",
                       event:serde;
                       "failed to store experiment event: {:?}", err);
        }

        log::trace!(target: "experiments",
                    event:serde;
                    "logging experiment event");
        if let Err(err) = self
            .config
            .analytics_sink
            .log(kind.analytics_event_name(), &event)
        {
            log::warn!(target: "experiments",
                       event:serde;
                       "failed to send experiment event to analytics: {}", err);
        }
    }
}
