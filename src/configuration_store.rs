use std::sync::{Arc, RwLock};

use crate::{
    configuration::ExperimentConfiguration,
    models::{Experiment, Variant},
    store::{ExperimentSource, LoadedExperiment},
    Result,
};

/// `ConfigurationStore` provides a Sync storage for experiment configuration that allows
/// concurrent access for readers and writers.
///
/// Configuration is replaced as a whole. Each resolution reads the experiment and its variants from
/// the same snapshot.
#[derive(Default)]
pub struct ConfigurationStore {
    configuration: RwLock<Option<Arc<ExperimentConfiguration>>>,
}

impl ConfigurationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_configuration(&self) -> Option<Arc<ExperimentConfiguration>> {
        // self.configuration.read() should always return Ok(). Err() is possible only if the lock
        // is poisoned (writer panicked while holding the lock), which should never happen. Still,
        // using .ok()? here to not crash the app.
        let configuration = self.configuration.read().ok()?;
        configuration.clone()
    }

    /// Set new configuration, returning the previous one.
    pub fn set_configuration(
        &self,
        configuration: ExperimentConfiguration,
    ) -> Option<Arc<ExperimentConfiguration>> {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Some(Arc::new(configuration));

        let mut configuration_slot = self.configuration.write().ok()?;
        std::mem::replace(&mut configuration_slot, new_value)
    }
}

impl ExperimentSource for ConfigurationStore {
    fn fetch_experiment(&self, experiment_key: &str) -> Result<Option<Experiment>> {
        Ok(self.load_experiment(experiment_key)?.experiment)
    }

    fn fetch_variants(&self, experiment_key: &str) -> Result<Vec<Variant>> {
        Ok(self.load_experiment(experiment_key)?.variants)
    }

    fn load_experiment(&self, experiment_key: &str) -> Result<LoadedExperiment> {
        let Some(configuration) = self.get_configuration() else {
            log::warn!(target: "experiments", experiment_key; "resolving an experiment before configuration has been fetched");
            // Treated the same as a missing experiment: users are served the fallback variant.
            return Ok(LoadedExperiment::default());
        };
        configuration.get_experiment(experiment_key)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use super::ConfigurationStore;
    use crate::{
        configuration::{ExperimentConfiguration, ExperimentEntry, TryParse},
        models::{ExperimentStatus, Metadata},
        store::ExperimentSource,
    };

    fn configuration(status: ExperimentStatus) -> ExperimentConfiguration {
        ExperimentConfiguration {
            experiments: HashMap::from([(
                "exp".to_owned(),
                TryParse::Parsed(ExperimentEntry {
                    status,
                    default_variant: None,
                    traffic_percentage: 100.0,
                    metadata: Metadata::new(),
                    variants: Vec::new(),
                }),
            )]),
        }
    }

    #[test]
    fn can_set_configuration_from_another_thread() {
        let store = Arc::new(ConfigurationStore::new());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set_configuration(ExperimentConfiguration::default());
            })
            .join();
        }

        assert!(store.get_configuration().is_some());
    }

    #[test]
    fn reads_as_empty_before_configuration_is_set() {
        let store = ConfigurationStore::new();
        let loaded = store.load_experiment("exp").unwrap();
        assert_eq!(loaded.experiment, None);
        assert!(loaded.variants.is_empty());
    }

    #[test]
    fn replaces_configuration_as_a_whole() {
        let store = ConfigurationStore::new();
        assert!(store
            .set_configuration(configuration(ExperimentStatus::Draft))
            .is_none());
        let previous = store.set_configuration(configuration(ExperimentStatus::Running));
        assert!(previous.is_some());

        let experiment = store.fetch_experiment("exp").unwrap().unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Running);
    }
}
