use crate::{
    models::{Experiment, ExperimentStatus, Variant},
    sharder::{traffic_seed, variant_seed, Sharder},
};

/// Variant served when neither the variants nor the experiment name a default.
pub const DEFAULT_FALLBACK_VARIANT: &str = "control";

impl Experiment {
    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }

    /// Return `true` if `user_id` falls inside the experiment's rollout percentage.
    ///
    /// Uses the traffic seed, so the answer is independent of which variant the user would get.
    pub fn includes_user(&self, user_id: &str, sharder: &(impl Sharder + ?Sized)) -> bool {
        if self.traffic_percentage >= 100.0 {
            return true;
        }
        if !(self.traffic_percentage > 0.0) {
            return false;
        }
        let ratio = sharder.get_ratio(&traffic_seed(&self.key, user_id));
        ratio * 100.0 < self.traffic_percentage
    }
}

impl Variant {
    /// Weight used for selection. Negative (and NaN) weights count as zero.
    pub fn effective_weight(&self) -> f64 {
        self.weight.max(0.0)
    }
}

/// Deterministically pick a variant for `user_id`, returning `fallback` if there are no variants.
pub fn pick_weighted_variant(
    experiment_key: &str,
    user_id: &str,
    variants: &[Variant],
    fallback: &str,
    sharder: &(impl Sharder + ?Sized),
) -> String {
    if variants.is_empty() {
        return fallback.to_owned();
    }
    let ratio = sharder.get_ratio(&variant_seed(experiment_key, user_id));
    select_by_ratio(variants, ratio)
        .map(|variant| variant.variant.clone())
        .unwrap_or_else(|| fallback.to_owned())
}

/// Walk `variants` in order and return the first one whose cumulative normalized weight reaches
/// `ratio`.
///
/// If the total weight is not positive, `ratio` partitions the variants uniformly instead. Returns
/// `None` only for an empty slice.
pub fn select_by_ratio(variants: &[Variant], ratio: f64) -> Option<&Variant> {
    let last = variants.last()?;

    let total_weight: f64 = variants.iter().map(Variant::effective_weight).sum();
    if !(total_weight > 0.0) {
        // `as usize` saturates, so negative or NaN ratios land on the first variant.
        let index = ((ratio * variants.len() as f64).floor() as usize).min(variants.len() - 1);
        return variants.get(index);
    }

    let mut cumulative = 0.0;
    for variant in variants {
        cumulative += variant.effective_weight() / total_weight;
        if cumulative >= ratio {
            return Some(variant);
        }
    }

    // Floating-point drift may leave the cumulative sum just below `ratio`.
    Some(last)
}

/// Resolve the variant served to users that are not enrolled.
///
/// Priority: the variant flagged `is_default`, the experiment's `default_variant`, the first
/// variant, and finally `fallback`.
pub fn resolve_default_variant(
    experiment: Option<&Experiment>,
    variants: &[Variant],
    fallback: &str,
) -> String {
    variants
        .iter()
        .find(|variant| variant.is_default)
        .map(|variant| variant.variant.clone())
        .or_else(|| experiment.and_then(|experiment| experiment.default_variant.clone()))
        .or_else(|| variants.first().map(|variant| variant.variant.clone()))
        .unwrap_or_else(|| fallback.to_owned())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::{
        pick_weighted_variant, resolve_default_variant, select_by_ratio, DEFAULT_FALLBACK_VARIANT,
    };
    use crate::{
        models::{Experiment, ExperimentStatus, Metadata, Variant},
        sharder::{DeterministicSharder, Sha256Sharder},
    };

    fn variant(name: &str, weight: f64) -> Variant {
        Variant {
            experiment_key: "exp".to_owned(),
            variant: name.to_owned(),
            weight,
            is_default: false,
            metadata: Metadata::new(),
        }
    }

    fn experiment(traffic_percentage: f64) -> Experiment {
        Experiment {
            key: "exp-42".to_owned(),
            status: ExperimentStatus::Running,
            default_variant: None,
            traffic_percentage,
            metadata: Metadata::new(),
        }
    }

    fn picked(ratio: f64, variants: &[Variant]) -> &str {
        &select_by_ratio(variants, ratio).unwrap().variant
    }

    #[test]
    fn empty_variants_return_fallback() {
        assert_eq!(
            pick_weighted_variant("exp", "user", &[], "fallback", &Sha256Sharder),
            "fallback"
        );
        assert!(select_by_ratio(&[], 0.5).is_none());
    }

    #[test]
    fn walks_cumulative_weights_in_order() {
        let variants = [variant("a", 1.0), variant("b", 3.0)];
        assert_eq!(picked(0.0, &variants), "a");
        assert_eq!(picked(0.2, &variants), "a");
        // Exact boundary goes to the earlier variant.
        assert_eq!(picked(0.25, &variants), "a");
        assert_eq!(picked(0.26, &variants), "b");
        assert_eq!(picked(1.0, &variants), "b");
    }

    #[test]
    fn negative_weights_are_clamped() {
        let variants = [variant("a", -5.0), variant("b", 1.0), variant("c", 1.0)];
        // "a" contributes nothing, so "b" and "c" split the range evenly.
        assert_eq!(picked(0.1, &variants), "b");
        assert_eq!(picked(0.5, &variants), "b");
        assert_eq!(picked(0.6, &variants), "c");
    }

    #[test]
    fn degenerate_weights_partition_uniformly() {
        let zeros = [variant("a", 0.0), variant("b", 0.0), variant("c", 0.0)];
        assert_eq!(picked(0.0, &zeros), "a");
        assert_eq!(picked(0.4, &zeros), "b");
        assert_eq!(picked(0.9, &zeros), "c");
        // Ratio of exactly 1.0 is clamped to the last index.
        assert_eq!(picked(1.0, &zeros), "c");

        let negatives = [variant("a", -1.0), variant("b", -2.0)];
        assert_eq!(picked(0.3, &negatives), "a");
        assert_eq!(picked(0.7, &negatives), "b");
    }

    #[test]
    fn drift_falls_back_to_last_variant() {
        let variants = [variant("a", 1.0), variant("b", 1.0), variant("c", 1.0)];
        assert_eq!(picked(1.0 + f64::EPSILON, &variants), "c");
    }

    #[test]
    fn uses_variant_seed() {
        let sharder = DeterministicSharder(HashMap::from([
            ("exp:alice:variant".to_owned(), 0.9),
            ("exp:alice:traffic".to_owned(), 0.1),
        ]));
        let variants = [variant("a", 1.0), variant("b", 1.0)];

        assert_eq!(
            pick_weighted_variant("exp", "alice", &variants, "fallback", &sharder),
            "b"
        );
    }

    #[test]
    fn weights_shape_the_distribution() {
        let variants = [variant("A", 1.0), variant("B", 3.0)];
        let total = 10_000;
        let b_count = (0..total)
            .filter(|i| {
                let user = format!("user-{i}");
                pick_weighted_variant("exp-weights", &user, &variants, "A", &Sha256Sharder) == "B"
            })
            .count();

        let share = b_count as f64 / total as f64;
        assert!((0.72..0.78).contains(&share), "B share was {share}");
    }

    #[test]
    fn traffic_gate_bounds() {
        let ratios = HashMap::from([("exp-42:bob:traffic".to_owned(), 0.999)]);
        let sharder = DeterministicSharder(ratios);
        assert!(experiment(100.0).includes_user("bob", &sharder));
        assert!(!experiment(99.0).includes_user("bob", &sharder));
        assert!(!experiment(0.0).includes_user("bob", &sharder));
        assert!(!experiment(-10.0).includes_user("bob", &sharder));
    }

    #[test]
    fn traffic_gate_uses_traffic_seed() {
        // exp-42:user-7:traffic hashes to ~0.7935.
        assert!(!experiment(50.0).includes_user("user-7", &Sha256Sharder));
        assert!(experiment(80.0).includes_user("user-7", &Sha256Sharder));
    }

    #[test]
    fn default_variant_priority() {
        let mut flagged = variant("treatment", 1.0);
        flagged.is_default = true;
        let mut exp = experiment(100.0);
        exp.default_variant = Some("baseline".to_owned());

        let variants = [variant("first", 1.0), flagged];
        assert_eq!(
            resolve_default_variant(Some(&exp), &variants, DEFAULT_FALLBACK_VARIANT),
            "treatment"
        );

        let variants = [variant("first", 1.0), variant("second", 1.0)];
        assert_eq!(
            resolve_default_variant(Some(&exp), &variants, DEFAULT_FALLBACK_VARIANT),
            "baseline"
        );
        assert_eq!(
            resolve_default_variant(None, &variants, DEFAULT_FALLBACK_VARIANT),
            "first"
        );
        assert_eq!(
            resolve_default_variant(None, &[], DEFAULT_FALLBACK_VARIANT),
            "control"
        );
    }

    proptest! {
        #[test]
        fn selection_is_total(
            weights in proptest::collection::vec(-10.0f64..10.0, 1..8),
            ratio in 0.0f64..=1.0,
        ) {
            let variants: Vec<Variant> = weights
                .iter()
                .enumerate()
                .map(|(i, w)| variant(&format!("v{i}"), *w))
                .collect();
            prop_assert!(select_by_ratio(&variants, ratio).is_some());
        }

        #[test]
        fn pick_is_deterministic(user in "[a-z0-9-]{1,24}") {
            let variants = [variant("a", 2.0), variant("b", 1.0), variant("c", 0.5)];
            let first = pick_weighted_variant("exp", &user, &variants, "x", &Sha256Sharder);
            let second = pick_weighted_variant("exp", &user, &variants, "x", &Sha256Sharder);
            prop_assert_eq!(first, second);
        }
    }
}
