//! Deterministic experiment bucketing and idempotent variant assignment.
//!
//! # Overview
//!
//! The library revolves around an [`ExperimentClient`] that resolves which variant of an
//! experiment a user gets. Users are hashed into the unit interval twice: once to decide whether
//! they participate in the experiment at all (the traffic gate), and once to pick a variant by
//! relative weight. The two hashes use different seeds, so changing an experiment's rollout
//! percentage never moves an enrolled user to another variant.
//!
//! The first eligible resolution persists an [`Assignment`] through an [`AssignmentStore`]. The
//! store enforces one row per (experiment, user) pair; when two resolvers race, the loser reads
//! the winner's row instead of failing. Users that are not enrolled are *holdouts* and are served
//! the experiment's default variant without anything being written.
//!
//! Exposures and conversions are recorded with [`ExperimentClient::record_exposure`] and
//! [`ExperimentClient::record_conversion`].
//!
//! Experiment configuration comes from an [`ExperimentSource`]: either a [`SqliteStore`] or a
//! [`ConfigurationStore`] kept up to date by a [`PollerThread`].
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Only storage and configuration failures are
//! returned. Event logging (to the event table and to the [`AnalyticsSink`]) is best-effort:
//! failures are logged and otherwise ignored.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with target
//! `"experiments"`. Consider integrating a `log`-compatible logger implementation for better
//! visibility into assignment decisions.

#![warn(rustdoc::missing_crate_level_docs)]

mod analytics;
mod client;
mod config;
mod configuration;
mod configuration_store;
mod context;
mod error;
mod models;
mod poller;
mod selection;
mod sharder;
mod sqlite_store;
mod store;

pub use analytics::{AnalyticsSink, HttpAnalyticsSink, SinkError};
pub use client::{AssignmentRequest, AssignmentState, ExperimentClient};
pub use config::ClientConfig;
pub use configuration::{ExperimentConfiguration, ExperimentEntry, TryParse, VariantEntry};
pub use configuration_store::ConfigurationStore;
pub use context::Context;
pub use error::{Error, Result, StorageError};
pub use models::{
    Assignment, EventKind, Experiment, ExperimentEvent, ExperimentStatus, GuardrailState, Metadata,
    NewAssignment, Variant,
};
pub use poller::{PollerThread, PollerThreadConfig};
pub use selection::{
    pick_weighted_variant, resolve_default_variant, select_by_ratio, DEFAULT_FALLBACK_VARIANT,
};
pub use sharder::{hash_to_ratio, Sha256Sharder, Sharder};
pub use sqlite_store::SqliteStore;
pub use store::{
    AssignmentStore, Counter, ExperimentSource, InMemoryAssignmentStore, InsertOutcome,
    LoadedExperiment,
};
