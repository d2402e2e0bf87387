//! Deterministic hashing of seeds into the unit interval.
use sha2::{Digest, Sha256};

pub trait Sharder {
    /// Map `seed` to a ratio in `[0, 1]`. Must be deterministic.
    fn get_ratio(&self, seed: &str) -> f64;
}

/// The default (and only) sharder.
///
/// Takes the first 32 bits of the SHA-256 digest of the seed and divides them by `0xffffffff`.
pub struct Sha256Sharder;

impl Sharder for Sha256Sharder {
    fn get_ratio(&self, seed: &str) -> f64 {
        hash_to_ratio(seed)
    }
}

/// Hash `seed` into a ratio in `[0, 1]`.
pub fn hash_to_ratio(seed: &str) -> f64 {
    let hash = Sha256::digest(seed.as_bytes());
    let value = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
    f64::from(value) / f64::from(u32::MAX)
}

/// Seed used to choose a variant for a user.
pub(crate) fn variant_seed(experiment_key: &str, user_id: &str) -> String {
    format!("{experiment_key}:{user_id}:variant")
}

/// Seed used to decide whether a user participates in an experiment at all. Kept separate from
/// [`variant_seed`] so that changing the rollout percentage does not reshuffle variants.
pub(crate) fn traffic_seed(experiment_key: &str, user_id: &str) -> String {
    format!("{experiment_key}:{user_id}:traffic")
}

#[cfg(test)]
pub struct DeterministicSharder(pub std::collections::HashMap<String, f64>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn get_ratio(&self, seed: &str) -> f64 {
        self.0.get(seed).copied().unwrap_or(0.0)
    }
}
