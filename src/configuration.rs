use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    models::{
        default_traffic_percentage, default_weight, Experiment, ExperimentStatus, Metadata, Variant,
    },
    store::LoadedExperiment,
    Error, Result,
};

/// Experiment configuration document, as served by the configuration endpoint.
///
/// ```json
/// { "experiments": { "exp-42": { "status": "running", "variants": [{ "variant": "control" }] } } }
/// ```
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ExperimentConfiguration {
    pub experiments: HashMap<String, TryParse<ExperimentEntry>>,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}
impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}
impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentEntry {
    pub status: ExperimentStatus,
    #[serde(default)]
    pub default_variant: Option<String>,
    #[serde(default = "default_traffic_percentage")]
    pub traffic_percentage: f64,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub variants: Vec<VariantEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantEntry {
    pub variant: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ExperimentConfiguration {
    /// Look up `experiment_key`. A missing experiment is not an error; an entry that failed to
    /// parse is.
    pub fn get_experiment(&self, experiment_key: &str) -> Result<LoadedExperiment> {
        match self.experiments.get(experiment_key) {
            None => Ok(LoadedExperiment::default()),
            Some(TryParse::Parsed(entry)) => Ok(entry.to_loaded(experiment_key)),
            Some(TryParse::ParseFailed(_)) => Err(Error::ConfigurationParseError {
                experiment_key: experiment_key.to_owned(),
            }),
        }
    }
}

impl ExperimentEntry {
    fn to_loaded(&self, experiment_key: &str) -> LoadedExperiment {
        LoadedExperiment {
            experiment: Some(Experiment {
                key: experiment_key.to_owned(),
                status: self.status,
                default_variant: self.default_variant.clone(),
                traffic_percentage: self.traffic_percentage,
                metadata: self.metadata.clone(),
            }),
            variants: self
                .variants
                .iter()
                .map(|entry| Variant {
                    experiment_key: experiment_key.to_owned(),
                    variant: entry.variant.clone(),
                    weight: entry.weight,
                    is_default: entry.is_default,
                    metadata: entry.metadata.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::BufReader};

    use super::{ExperimentConfiguration, TryParse};
    use crate::{models::ExperimentStatus, Error};

    fn load_fixture() -> ExperimentConfiguration {
        let f = File::open("tests/data/experiments-v1.json")
            .expect("Failed to open tests/data/experiments-v1.json");
        serde_json::from_reader(BufReader::new(f)).unwrap()
    }

    #[test]
    fn parse_experiments_v1() {
        let configuration = load_fixture();

        let loaded = configuration.get_experiment("exp-42").unwrap();
        let experiment = loaded.experiment.unwrap();
        assert_eq!(experiment.key, "exp-42");
        assert_eq!(experiment.status, ExperimentStatus::Running);
        assert_eq!(experiment.traffic_percentage, 100.0);

        let names: Vec<&str> = loaded.variants.iter().map(|v| v.variant.as_str()).collect();
        assert_eq!(names, ["control", "treatment"]);
        assert!(loaded.variants[0].is_default);
        assert!(loaded.variants.iter().all(|v| v.experiment_key == "exp-42"));
    }

    #[test]
    fn missing_experiment_is_empty() {
        let loaded = load_fixture().get_experiment("no-such-experiment").unwrap();
        assert_eq!(loaded.experiment, None);
        assert!(loaded.variants.is_empty());
    }

    #[test]
    fn malformed_experiment_is_an_error() {
        let configuration = load_fixture();
        assert!(matches!(
            configuration.experiments.get("broken-status"),
            Some(TryParse::ParseFailed(_))
        ));
        assert!(matches!(
            configuration.get_experiment("broken-status"),
            Err(Error::ConfigurationParseError { experiment_key }) if experiment_key == "broken-status"
        ));
    }

    #[test]
    fn parse_partially_if_unexpected() {
        let configuration: ExperimentConfiguration = serde_json::from_str(
            r#"
              {
                "experiments": {
                  "success": { "status": "paused" },
                  "fail_parsing": { "status": "NEW_STATUS", "variants": [] }
                }
              }
            "#,
        )
        .unwrap();
        assert!(matches!(
            configuration.experiments.get("success").unwrap(),
            TryParse::Parsed(_)
        ));
        assert!(matches!(
            configuration.experiments.get("fail_parsing").unwrap(),
            TryParse::ParseFailed(_)
        ));
    }
}
