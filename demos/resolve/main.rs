use std::sync::Arc;

use experiments::{
    AssignmentRequest, ClientConfig, Context, Experiment, ExperimentEvent, ExperimentStatus,
    Metadata, SinkError, SqliteStore, Variant,
};

pub fn main() -> experiments::Result<()> {
    env_logger::init();

    let path = std::env::var("EXPERIMENTS_DB").unwrap_or_else(|_| "experiments.sqlite3".to_owned());
    let store = Arc::new(SqliteStore::open(path)?);

    let variant = |name: &str, weight: f64, is_default: bool| Variant {
        experiment_key: "writing-feedback-v2".to_owned(),
        variant: name.to_owned(),
        weight,
        is_default,
        metadata: Metadata::new(),
    };
    store.put_experiment(
        &Experiment {
            key: "writing-feedback-v2".to_owned(),
            status: ExperimentStatus::Running,
            default_variant: None,
            traffic_percentage: 50.0,
            metadata: Metadata::new(),
        },
        &[variant("classic", 1.0, true), variant("rubric", 3.0, false)],
    )?;

    let print_event = |name: &str, event: &ExperimentEvent| -> Result<(), SinkError> {
        println!("analytics: {name} {} -> {}", event.user_id, event.variant);
        Ok(())
    };
    let mut config = ClientConfig::new(store.clone(), store.clone());
    config.analytics_sink(print_event);
    let client = config.to_client();

    for user in ["user-1", "user-2", "user-3", "user-4"] {
        let request = AssignmentRequest::new("writing-feedback-v2", user)
            .with_context(Context::capture([("page", "writing/task-2")]));
        let state = client.record_exposure(&request)?;
        println!(
            "{user}: variant={} holdout={} created={} exposures={}",
            state.variant, state.holdout, state.created, state.exposures
        );
    }

    Ok(())
}
