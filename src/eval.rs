use std::collections::HashMap;

use async_recursion::async_recursion;
use serde_json::Value;

use crate::{
    attribute_reference::Reference,
    bucketing::{bucket_context, variation_index_for_context},
    context::{Context, DEFAULT_KIND},
    error::{EvaluationError, Result},
    events::{EventFactory, FeatureEvent},
    models::{Clause, Flag, Segment, SegmentRule, SegmentTarget, WEIGHT_SCALE},
    operators::Operator,
    queries::{BigSegmentMembership, Queries},
    reason::{BigSegmentsStatus, EvaluationDetail, Reason},
};

/// Evaluates flags against contexts, reading prerequisites, segments, and big segment membership
/// through `Q`.
///
/// The evaluator holds no mutable state: concurrent evaluations are independent.
#[derive(Debug, Clone)]
pub struct Evaluator<Q> {
    queries: Q,
}

/// Outcome of [`Evaluator::evaluate`].
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub detail: EvaluationDetail,
    /// Events for every prerequisite flag evaluated along the way, in evaluation order.
    pub events: Vec<FeatureEvent>,
    /// Cause of an `ERROR` reason. Meant for logging only.
    pub error: Option<EvaluationError>,
}

/// Mutable state of a single evaluation.
#[derive(Default)]
struct EvalState {
    events: Vec<FeatureEvent>,
    big_segments_status: Option<BigSegmentsStatus>,
    /// Big segment query results by context key. `None` means big segments are not configured.
    big_segments_membership: HashMap<String, Option<BigSegmentMembership>>,
    /// Segments currently being resolved, outermost first.
    segment_stack: Vec<String>,
}

impl EvalState {
    fn merge_status(&mut self, status: BigSegmentsStatus) {
        let merged = self
            .big_segments_status
            .map_or(status, |current| current.merge(status));
        if self.big_segments_status != Some(merged) {
            log::debug!(target: "flag_eval", status:serde = merged; "big segments status changed");
        }
        self.big_segments_status = Some(merged);
    }
}

impl<Q: Queries> Evaluator<Q> {
    pub fn new(queries: Q) -> Self {
        Self { queries }
    }

    pub fn queries(&self) -> &Q {
        &self.queries
    }

    /// Evaluate `flag` for the raw `context`.
    ///
    /// Never fails: an invalid context, a missing flag, or malformed data result in an `ERROR`
    /// reason, with the cause in [`Evaluation::error`].
    pub async fn evaluate(
        &self,
        flag: Option<&Flag>,
        context: &Value,
        event_factory: &EventFactory,
    ) -> Evaluation {
        match Context::new(context.clone()) {
            Ok(context) => self.evaluate_context(flag, &context, event_factory).await,
            Err(err) => {
                log::warn!(target: "flag_eval",
                           flag_key = flag.map_or("", |flag| flag.key.as_str()),
                           error:display = err;
                           "invalid evaluation context");
                failed(EvaluationError::InvalidContext(err))
            }
        }
    }

    /// Evaluate `flag` for an already validated context.
    pub async fn evaluate_context(
        &self,
        flag: Option<&Flag>,
        context: &Context,
        event_factory: &EventFactory,
    ) -> Evaluation {
        let Some(flag) = flag else {
            return failed(EvaluationError::FlagNotFound);
        };

        let mut state = EvalState::default();
        let mut visited = vec![flag.key.clone()];
        let result = self
            .evaluate_internal(flag, context, &mut state, event_factory, &mut visited)
            .await;

        let (mut detail, error) = match result {
            Ok(detail) => (detail, None),
            Err(err) => {
                log::warn!(target: "flag_eval",
                           flag_key:display = flag.key,
                           error:display = err;
                           "flag evaluation failed");
                (EvaluationDetail::error(err.error_kind()), Some(err))
            }
        };
        detail.reason.big_segments_status = state.big_segments_status;

        log::trace!(target: "flag_eval",
                    flag_key:display = flag.key,
                    context_key:display = context.canonical_key(),
                    detail:serde = detail;
                    "evaluated flag");

        Evaluation {
            detail,
            events: state.events,
            error,
        }
    }

    /// `visited` holds the keys of the flags on the current prerequisite path, `flag` included.
    #[async_recursion]
    async fn evaluate_internal(
        &self,
        flag: &Flag,
        context: &Context,
        state: &mut EvalState,
        event_factory: &EventFactory,
        visited: &mut Vec<String>,
    ) -> Result<EvaluationDetail> {
        if !flag.on {
            return off_result(flag, Reason::off());
        }

        if let Some(reason) = self
            .check_prerequisites(flag, context, state, event_factory, visited)
            .await?
        {
            return off_result(flag, reason);
        }

        if let Some(variation) = target_variation(flag, context) {
            return variation_detail(flag, variation, Reason::target_match());
        }

        for (index, rule) in flag.rules.iter().enumerate() {
            if self.clauses_match(&rule.clauses, context, state).await? {
                let (variation, in_experiment) = variation_index_for_context(
                    &rule.variation_or_rollout,
                    context,
                    &flag.key,
                    &flag.salt,
                )?;
                return variation_detail(
                    flag,
                    variation,
                    Reason::rule_match(index, rule.id.clone(), in_experiment),
                );
            }
        }

        let (variation, in_experiment) =
            variation_index_for_context(&flag.fallthrough, context, &flag.key, &flag.salt)?;
        variation_detail(flag, variation, Reason::fallthrough(in_experiment))
    }

    /// Return the failure reason of the first unsatisfied prerequisite, if any.
    async fn check_prerequisites(
        &self,
        flag: &Flag,
        context: &Context,
        state: &mut EvalState,
        event_factory: &EventFactory,
        visited: &mut Vec<String>,
    ) -> Result<Option<Reason>> {
        for prerequisite in &flag.prerequisites {
            if visited.contains(&prerequisite.key) {
                log::warn!(target: "flag_eval",
                           flag_key:display = flag.key,
                           prerequisite_key:display = prerequisite.key;
                           "circular prerequisite reference");
                return Err(EvaluationError::CircularPrerequisite(
                    prerequisite.key.clone(),
                ));
            }

            let Some(prerequisite_flag) = self.queries.get_flag(&prerequisite.key).await else {
                log::debug!(target: "flag_eval",
                            flag_key:display = flag.key,
                            prerequisite_key:display = prerequisite.key;
                            "prerequisite flag not found");
                return Ok(Some(Reason::prerequisite_failed(&prerequisite.key)));
            };

            visited.push(prerequisite.key.clone());
            let result = self
                .evaluate_internal(&prerequisite_flag, context, state, event_factory, visited)
                .await;
            visited.pop();

            let detail = match result {
                Ok(detail) => detail,
                Err(err @ EvaluationError::CircularPrerequisite(_)) => return Err(err),
                Err(err) => {
                    log::warn!(target: "flag_eval",
                               flag_key:display = prerequisite.key,
                               error:display = err;
                               "prerequisite evaluation failed");
                    EvaluationDetail::error(err.error_kind())
                }
            };

            state.events.push(event_factory.new_eval_event(
                &prerequisite_flag,
                context,
                &detail,
                Value::Null,
                Some(flag),
            ));

            let satisfied = prerequisite_flag.on
                && detail
                    .variation_index
                    .and_then(|index| i64::try_from(index).ok())
                    == Some(prerequisite.variation);
            if !satisfied {
                log::debug!(target: "flag_eval",
                            flag_key:display = flag.key,
                            prerequisite_key:display = prerequisite.key;
                            "prerequisite failed");
                return Ok(Some(Reason::prerequisite_failed(&prerequisite.key)));
            }
        }
        Ok(None)
    }

    /// Return `true` if all `clauses` match. Stops at the first clause that doesn't.
    async fn clauses_match(
        &self,
        clauses: &[Clause],
        context: &Context,
        state: &mut EvalState,
    ) -> Result<bool> {
        for clause in clauses {
            if !self.clause_matches(clause, context, state).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn clause_matches(
        &self,
        clause: &Clause,
        context: &Context,
        state: &mut EvalState,
    ) -> Result<bool> {
        if clause.op != Operator::SegmentMatch {
            return clause_matches_context(clause, context);
        }

        let mut matched = false;
        for segment_key in clause.values.iter().filter_map(Value::as_str) {
            if self.segment_matches(segment_key, context, state).await? {
                matched = true;
                break;
            }
        }
        Ok(matched != clause.negate)
    }

    #[async_recursion]
    async fn segment_matches(
        &self,
        segment_key: &str,
        context: &Context,
        state: &mut EvalState,
    ) -> Result<bool> {
        if state.segment_stack.iter().any(|key| key == segment_key) {
            log::warn!(target: "flag_eval", segment_key; "circular segment reference");
            return Err(EvaluationError::CircularSegment(segment_key.to_owned()));
        }

        let Some(segment) = self.queries.get_segment(segment_key).await else {
            return Ok(false);
        };

        state.segment_stack.push(segment_key.to_owned());
        let result = if segment.unbounded {
            self.big_segment_contains(&segment, context, state).await
        } else {
            self.segment_contains(&segment, context, state, true).await
        };
        state.segment_stack.pop();
        result
    }

    /// Membership of a regular segment. Big segments fall back here with `use_targets == false`
    /// when the membership store doesn't know the segment.
    async fn segment_contains(
        &self,
        segment: &Segment,
        context: &Context,
        state: &mut EvalState,
        use_targets: bool,
    ) -> Result<bool> {
        if use_targets {
            if targets_contain(&segment.included, &segment.included_contexts, context) {
                return Ok(true);
            }
            if targets_contain(&segment.excluded, &segment.excluded_contexts, context) {
                return Ok(false);
            }
        }

        for rule in &segment.rules {
            if self.segment_rule_matches(rule, segment, context, state).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn segment_rule_matches(
        &self,
        rule: &SegmentRule,
        segment: &Segment,
        context: &Context,
        state: &mut EvalState,
    ) -> Result<bool> {
        if !self.clauses_match(&rule.clauses, context, state).await? {
            return Ok(false);
        }
        let Some(weight) = rule.weight else {
            return Ok(true);
        };

        let attribute = rule
            .bucket_by
            .clone()
            .unwrap_or_else(|| Reference::new("key"));
        if !attribute.is_valid() {
            log::warn!(target: "flag_eval",
                       segment_key:display = segment.key,
                       attribute:display = attribute;
                       "invalid bucketBy reference in segment rule");
            return Err(EvaluationError::InvalidAttributeReference(
                attribute.to_string(),
            ));
        }

        let (bucket, _) = bucket_context(
            context,
            &segment.key,
            &attribute,
            &segment.salt,
            None,
            rule.rollout_context_kind.as_deref(),
        );
        Ok(bucket < weight / WEIGHT_SCALE)
    }

    async fn big_segment_contains(
        &self,
        segment: &Segment,
        context: &Context,
        state: &mut EvalState,
    ) -> Result<bool> {
        let Some(generation) = segment.generation else {
            log::debug!(target: "flag_eval",
                        segment_key:display = segment.key;
                        "big segment has no generation");
            state.merge_status(BigSegmentsStatus::NotConfigured);
            return Ok(false);
        };

        let kind = segment
            .unbounded_context_kind
            .as_deref()
            .unwrap_or(DEFAULT_KIND);
        let Some(context_key) = context.key_for_kind(kind) else {
            return Ok(false);
        };

        if !state.big_segments_membership.contains_key(context_key) {
            let membership = match self.queries.get_big_segments_membership(context_key).await {
                Some((membership, status)) => {
                    state.merge_status(status);
                    Some(membership)
                }
                None => {
                    state.merge_status(BigSegmentsStatus::NotConfigured);
                    None
                }
            };
            state
                .big_segments_membership
                .insert(context_key.to_owned(), membership);
        }

        let segment_ref = format!("{}.g{}", segment.key, generation);
        let included = state
            .big_segments_membership
            .get(context_key)
            .and_then(|membership| membership.as_ref()?.get(&segment_ref).copied());

        match included {
            Some(included) => Ok(included),
            None => self.segment_contains(segment, context, state, false).await,
        }
    }
}

fn failed(error: EvaluationError) -> Evaluation {
    Evaluation {
        detail: EvaluationDetail::error(error.error_kind()),
        events: Vec::new(),
        error: Some(error),
    }
}

fn variation_detail(flag: &Flag, index: i64, reason: Reason) -> Result<EvaluationDetail> {
    let (variation_index, value) = flag.variation(index).ok_or_else(|| {
        log::warn!(target: "flag_eval",
                   flag_key:display = flag.key,
                   index;
                   "variation index out of range");
        EvaluationError::InvalidVariationIndex { index }
    })?;
    Ok(EvaluationDetail {
        value: value.clone(),
        variation_index: Some(variation_index),
        reason,
    })
}

/// Serve the off variation, or no value if the flag doesn't define one.
fn off_result(flag: &Flag, reason: Reason) -> Result<EvaluationDetail> {
    match flag.off_variation {
        Some(index) => variation_detail(flag, index, reason),
        None => Ok(EvaluationDetail {
            value: Value::Null,
            variation_index: None,
            reason,
        }),
    }
}

/// Variation of the first target listing the context's key.
///
/// `contextTargets` are checked in order. Their `user` entries are placeholders for the legacy
/// `targets` entry with the same variation. Flags without `contextTargets` use `targets` alone.
fn target_variation(flag: &Flag, context: &Context) -> Option<i64> {
    if flag.context_targets.is_empty() {
        let key = context.key_for_kind(DEFAULT_KIND)?;
        return flag
            .targets
            .iter()
            .find(|target| target.values.iter().any(|value| value == key))
            .map(|target| target.variation);
    }

    flag.context_targets.iter().find_map(|target| {
        let kind = target.context_kind.as_deref().unwrap_or(DEFAULT_KIND);
        let key = context.key_for_kind(kind)?;
        let values = if kind == DEFAULT_KIND {
            flag.targets
                .iter()
                .find(|legacy| legacy.variation == target.variation)
                .map_or(&target.values, |legacy| &legacy.values)
        } else {
            &target.values
        };
        values
            .iter()
            .any(|value| value == key)
            .then_some(target.variation)
    })
}

/// Return `true` if the `user` key is in `user_keys` or the key of any listed kind is in its
/// target.
fn targets_contain(user_keys: &[String], targets: &[SegmentTarget], context: &Context) -> bool {
    let contains = |kind: &str, values: &[String]| {
        context
            .key_for_kind(kind)
            .is_some_and(|key| values.iter().any(|value| value == key))
    };
    contains(DEFAULT_KIND, user_keys)
        || targets.iter().any(|target| {
            contains(
                target.context_kind.as_deref().unwrap_or(DEFAULT_KIND),
                &target.values,
            )
        })
}

/// Match a non-segment clause against the context.
///
/// A missing context kind, a missing or `null` attribute, or an object attribute never match,
/// regardless of `negate`. The root reference (`""` or `"/"`) addresses nothing, so it never
/// matches either.
fn clause_matches_context(clause: &Clause, context: &Context) -> Result<bool> {
    let Some(attribute) = clause.attribute.as_ref().filter(|attribute| attribute.is_valid()) else {
        let attribute = clause
            .attribute
            .as_ref()
            .map(Reference::to_string)
            .unwrap_or_default();
        log::warn!(target: "flag_eval",
                   attribute:display = attribute,
                   op = clause.op.name();
                   "invalid attribute reference in clause");
        return Err(EvaluationError::InvalidAttributeReference(attribute));
    };

    if attribute.is_kind() {
        let matched = context
            .kinds()
            .into_iter()
            .any(|kind| matches_any(clause.op, &Value::String(kind), &clause.values));
        return Ok(matched != clause.negate);
    }

    let kind = clause.context_kind.as_deref().unwrap_or(DEFAULT_KIND);
    let matched = match context.value_for_kind(kind, attribute) {
        None | Some(Value::Null) | Some(Value::Object(_)) => return Ok(false),
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| matches_any(clause.op, item, &clause.values)),
        Some(value) => matches_any(clause.op, value, &clause.values),
    };
    Ok(matched != clause.negate)
}

fn matches_any(op: Operator, value: &Value, clause_values: &[Value]) -> bool {
    clause_values
        .iter()
        .any(|clause_value| op.apply(value, clause_value))
}
