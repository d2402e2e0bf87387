use std::sync::Arc;

use experiments::{
    AssignmentRequest, ClientConfig, Context, EventKind, Experiment, ExperimentStatus, Metadata,
    SqliteStore, Variant,
};

fn seeded_store(status: ExperimentStatus, traffic_percentage: f64) -> Arc<SqliteStore> {
    let store = SqliteStore::open_in_memory().unwrap();
    let variant = |name: &str, is_default: bool| Variant {
        experiment_key: "exp-42".to_owned(),
        variant: name.to_owned(),
        weight: 1.0,
        is_default,
        metadata: Metadata::new(),
    };
    store
        .put_experiment(
            &Experiment {
                key: "exp-42".to_owned(),
                status,
                default_variant: None,
                traffic_percentage,
                metadata: Metadata::new(),
            },
            &[variant("control", true), variant("treatment", false)],
        )
        .unwrap();
    Arc::new(store)
}

#[test]
fn sqlite_backed_resolution() {
    let _ = env_logger::builder().is_test(true).try_init();

    let store = seeded_store(ExperimentStatus::Running, 100.0);
    let client = ClientConfig::new(store.clone(), store.clone()).to_client();
    let request = AssignmentRequest::new("exp-42", "user-7")
        .with_context(Context::capture([("page", "speaking/part-2")]));

    let first = client.resolve_assignment(&request).unwrap();
    assert!(first.created);
    assert!(!first.holdout);
    assert!(["control", "treatment"].contains(&first.variant.as_str()));

    let second = client.resolve_assignment(&request).unwrap();
    assert!(!second.created);
    assert_eq!(second.variant, first.variant);

    let converted = client.record_conversion(&request).unwrap();
    assert_eq!(converted.conversions, 1);
    assert!(converted.last_converted_at.is_some());

    let events = store.events("exp-42").unwrap();
    let kinds: Vec<EventKind> = events.iter().map(|event| event.event).collect();
    assert_eq!(kinds, [EventKind::Assign, EventKind::Convert]);
    assert!(events.iter().all(|event| event.variant == first.variant));
}

#[test]
fn sqlite_backed_holdout() {
    let store = seeded_store(ExperimentStatus::Completed, 100.0);
    let client = ClientConfig::new(store.clone(), store.clone()).to_client();

    let state = client
        .record_exposure(&AssignmentRequest::new("exp-42", "user-7"))
        .unwrap();
    assert!(state.holdout);
    assert!(!state.created);
    assert_eq!(state.variant, "control");
    assert!(store.events("exp-42").unwrap().is_empty());
}

#[test]
fn concurrent_first_visits_agree() {
    let store = seeded_store(ExperimentStatus::Running, 100.0);

    let variants: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                scope.spawn(move || {
                    ClientConfig::new(store.clone(), store)
                        .to_client()
                        .resolve_assignment(&AssignmentRequest::new("exp-42", "user-11"))
                        .unwrap()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .map(|state| state.variant)
            .collect()
    });

    assert!(variants.windows(2).all(|pair| pair[0] == pair[1]));
}
