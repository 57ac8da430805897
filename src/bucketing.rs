//! Bucketing: deterministic assignment of contexts to rollout buckets.
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::{
    attribute_reference::Reference,
    context::{integral, Context, DEFAULT_KIND},
    error::{EvaluationError, Result},
    models::{RolloutKind, VariationOrRollout, WEIGHT_SCALE},
};

/// Largest value of 15 hex digits; the hash prefix is divided by it to land in `[0, 1)`.
const LONG_SCALE: f64 = 0xFFFFFFFFFFFFFFFu64 as f64;

/// Compute the bucket of `context` for a flag or segment with the given `key` and `salt`.
///
/// The bucket is derived from the value of `attribute` in the context of kind `context_kind`
/// (default `user`). Returns the bucket in `[0, 1)` and whether a context of that kind was present
/// at all. A missing context kind or an attribute that is neither a string nor an integer lands in
/// bucket `0`.
pub fn bucket_context(
    context: &Context,
    key: &str,
    attribute: &Reference,
    salt: &str,
    seed: Option<i64>,
    context_kind: Option<&str>,
) -> (f64, bool) {
    let kind = context_kind.unwrap_or(DEFAULT_KIND);
    if context.for_kind(kind).is_none() {
        return (0.0, false);
    }
    let Some(id) = context
        .value_for_kind(kind, attribute)
        .and_then(bucketable_string)
    else {
        return (0.0, true);
    };

    let input = match seed {
        Some(seed) => format!("{seed}.{id}"),
        None => format!("{key}.{salt}.{id}"),
    };
    let hash = Sha1::digest(input.as_bytes());
    // First 15 hex digits of the digest.
    let prefix = hash[..8]
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
        >> 4;
    (prefix as f64 / LONG_SCALE, true)
}

/// Only strings and integral numbers can be bucketed.
fn bucketable_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => integral(n).map(|i| i.to_string()),
        _ => None,
    }
}

/// Resolve a fixed variation or a rollout to a variation index.
///
/// Returns the index and whether the context is part of an experiment.
pub(crate) fn variation_index_for_context(
    variation_or_rollout: &VariationOrRollout,
    context: &Context,
    key: &str,
    salt: &str,
) -> Result<(i64, bool)> {
    if let Some(variation) = variation_or_rollout.variation {
        return Ok((variation, false));
    }
    let rollout = variation_or_rollout
        .rollout
        .as_ref()
        .ok_or(EvaluationError::MissingVariationOrRollout)?;
    let last = rollout
        .variations
        .last()
        .ok_or(EvaluationError::EmptyRollout)?;

    let is_experiment = rollout.kind == RolloutKind::Experiment;
    let attribute = match &rollout.bucket_by {
        Some(bucket_by) if !is_experiment => bucket_by.clone(),
        _ => Reference::new("key"),
    };
    if !attribute.is_valid() {
        return Err(EvaluationError::InvalidAttributeReference(
            attribute.to_string(),
        ));
    }

    let (bucket, context_found) = bucket_context(
        context,
        key,
        &attribute,
        salt,
        rollout.seed,
        rollout.context_kind.as_deref(),
    );

    let mut sum = 0.0;
    let chosen = rollout
        .variations
        .iter()
        .find(|weighted| {
            sum += weighted.weight / WEIGHT_SCALE;
            bucket < sum
        })
        // The bucket can reach the total when weights don't add up; use the last bucket then.
        .unwrap_or(last);

    Ok((
        chosen.variation,
        is_experiment && context_found && !chosen.untracked,
    ))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::{Rollout, WeightedVariation};

    fn context(value: Value) -> Context {
        Context::new(value).unwrap()
    }

    fn key() -> Reference {
        Reference::new("key")
    }

    #[test]
    fn bucket_regression_vectors() {
        for (user_key, expected) in [
            ("userKeyA", 0.42157587),
            ("userKeyB", 0.6708485),
            ("userKeyC", 0.10343106),
        ] {
            let (bucket, found) = bucket_context(
                &context(json!({"key": user_key})),
                "hashKey",
                &key(),
                "saltyA",
                None,
                None,
            );
            assert!(found);
            assert!((bucket - expected).abs() < 1e-7, "{user_key}: {bucket}");
        }
    }

    #[test]
    fn bucket_with_seed() {
        let (bucket, _) = bucket_context(
            &context(json!({"key": "userKeyA"})),
            "hashKey",
            &key(),
            "saltyA",
            Some(61),
            None,
        );
        assert!((bucket - 0.09801207).abs() < 1e-7, "{bucket}");
    }

    #[test]
    fn integer_attribute_buckets_like_its_string() {
        let by_int = bucket_context(
            &context(json!({"key": "u", "intAttr": 33333})),
            "hashKey",
            &Reference::new("intAttr"),
            "saltyA",
            None,
            None,
        );
        let by_string = bucket_context(
            &context(json!({"key": "u", "stringAttr": "33333"})),
            "hashKey",
            &Reference::new("stringAttr"),
            "saltyA",
            None,
            None,
        );
        assert_eq!(by_int, by_string);
        assert!((by_int.0 - 0.54771423).abs() < 1e-7);
    }

    #[test]
    fn float_and_other_attributes_bucket_to_zero() {
        for value in [json!(999.999), json!(true), json!(["a"]), json!({"a": 1})] {
            let (bucket, found) = bucket_context(
                &context(json!({"kind": "user", "key": "u", "attr": value})),
                "hashKey",
                &Reference::new("attr"),
                "saltyA",
                None,
                None,
            );
            assert_eq!(bucket, 0.0);
            assert!(found);
        }
    }

    #[test]
    fn missing_context_kind() {
        let (bucket, found) = bucket_context(
            &context(json!({"kind": "org", "key": "o"})),
            "hashKey",
            &key(),
            "saltyA",
            None,
            Some("user"),
        );
        assert_eq!(bucket, 0.0);
        assert!(!found);

        let (bucket, found) = bucket_context(
            &context(json!({"kind": "multi", "user": {"key": "userKeyA"}, "org": {"key": "o"}})),
            "hashKey",
            &key(),
            "saltyA",
            None,
            Some("org"),
        );
        assert!(bucket > 0.0);
        assert!(found);
    }

    fn rollout(kind: RolloutKind, weights: &[(i64, f64, bool)]) -> VariationOrRollout {
        Rollout {
            kind,
            variations: weights
                .iter()
                .map(|&(variation, weight, untracked)| WeightedVariation {
                    variation,
                    weight,
                    untracked,
                })
                .collect(),
            ..Rollout::default()
        }
        .into()
    }

    #[test]
    fn selects_bucket_by_cumulative_weight() {
        // userKeyA lands in 0.42157587.
        let context = context(json!({"key": "userKeyA"}));
        let vr = rollout(
            RolloutKind::Rollout,
            &[(0, 42157.0, false), (1, 1.0, false), (2, 57842.0, false)],
        );
        assert_eq!(
            variation_index_for_context(&vr, &context, "hashKey", "saltyA").unwrap(),
            (1, false)
        );
        let vr = rollout(
            RolloutKind::Rollout,
            &[(0, 42158.0, false), (1, 57842.0, false)],
        );
        assert_eq!(
            variation_index_for_context(&vr, &context, "hashKey", "saltyA").unwrap(),
            (0, false)
        );
    }

    #[test]
    fn last_bucket_wins_when_weights_fall_short() {
        let context = context(json!({"key": "userKeyA"}));
        let vr = rollout(RolloutKind::Rollout, &[(0, 10000.0, false), (1, 20000.0, false)]);
        assert_eq!(
            variation_index_for_context(&vr, &context, "hashKey", "saltyA").unwrap(),
            (1, false)
        );
    }

    #[test]
    fn experiment_flags() {
        let context = context(json!({"key": "userKeyA"}));
        let tracked = rollout(
            RolloutKind::Experiment,
            &[(0, 50000.0, false), (1, 50000.0, true)],
        );
        assert_eq!(
            variation_index_for_context(&tracked, &context, "hashKey", "saltyA").unwrap(),
            (0, true)
        );
        let untracked = rollout(
            RolloutKind::Experiment,
            &[(0, 10000.0, false), (1, 90000.0, true)],
        );
        assert_eq!(
            variation_index_for_context(&untracked, &context, "hashKey", "saltyA").unwrap(),
            (1, false)
        );
    }

    #[test]
    fn experiment_ignores_bucket_by() {
        let context = context(json!({"key": "userKeyA", "other": "userKeyC"}));
        let VariationOrRollout {
            rollout: Some(mut experiment),
            ..
        } = rollout(
            RolloutKind::Experiment,
            &[(0, 42000.0, false), (1, 58000.0, false)],
        )
        else {
            unreachable!()
        };
        experiment.bucket_by = Some(Reference::new("other"));
        // Bucketing by `other` (0.1034) would pick variation 0.
        assert_eq!(
            variation_index_for_context(&experiment.into(), &context, "hashKey", "saltyA")
                .unwrap(),
            (1, true)
        );
    }

    #[test]
    fn malformed_rollouts() {
        let context = context(json!({"key": "u"}));
        assert_eq!(
            variation_index_for_context(&VariationOrRollout::default(), &context, "k", "s"),
            Err(EvaluationError::MissingVariationOrRollout)
        );
        assert_eq!(
            variation_index_for_context(&rollout(RolloutKind::Rollout, &[]), &context, "k", "s"),
            Err(EvaluationError::EmptyRollout)
        );
    }
}
