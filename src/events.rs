use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    context::Context,
    models::Flag,
    reason::{EvaluationDetail, Reason, ReasonKind},
};

/// Analytics event describing one flag evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEvent {
    /// Always `"feature"`.
    pub kind: String,
    /// Milliseconds since the Unix epoch.
    pub creation_date: i64,
    pub key: String,
    pub version: u64,
    /// The evaluated context with private attributes redacted.
    pub context: Value,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    pub default: Value,
    /// Key of the flag this flag was evaluated as a prerequisite of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prereq_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub track_events: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<i64>,
}

/// Builds [`FeatureEvent`]s.
///
/// ```
/// # use flag_eval::EventFactory;
/// let factory = EventFactory::new()
///     .with_reasons(true)
///     .with_private_attributes(vec!["email".to_owned()]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct EventFactory {
    with_reasons: bool,
    private_attributes: Vec<String>,
    all_attributes_private: bool,
}

impl EventFactory {
    /// Create a factory that omits reasons and keeps all attributes.
    pub fn new() -> EventFactory {
        EventFactory::default()
    }

    /// Include the evaluation reason in every event, not only in experiment events.
    pub fn with_reasons(mut self, with_reasons: bool) -> EventFactory {
        self.with_reasons = with_reasons;
        self
    }

    /// Attribute references redacted from every context kind.
    pub fn with_private_attributes(mut self, private_attributes: Vec<String>) -> EventFactory {
        self.private_attributes = private_attributes;
        self
    }

    /// Redact every optional attribute.
    pub fn with_all_attributes_private(mut self, all_attributes_private: bool) -> EventFactory {
        self.all_attributes_private = all_attributes_private;
        self
    }

    pub fn new_eval_event(
        &self,
        flag: &Flag,
        context: &Context,
        detail: &EvaluationDetail,
        default_value: Value,
        prereq_of: Option<&Flag>,
    ) -> FeatureEvent {
        let experiment = is_experiment(flag, &detail.reason);
        FeatureEvent {
            kind: "feature".to_owned(),
            creation_date: Utc::now().timestamp_millis(),
            key: flag.key.clone(),
            version: flag.version,
            context: context.redacted(&self.private_attributes, self.all_attributes_private),
            value: detail.value.clone(),
            variation: detail.variation_index,
            default: default_value,
            prereq_of: prereq_of.map(|flag| flag.key.clone()),
            reason: (self.with_reasons || experiment).then(|| detail.reason.clone()),
            track_events: flag.track_events || experiment,
            debug_events_until_date: flag.debug_events_until_date,
        }
    }
}

/// An evaluation is part of an experiment if an experiment rollout assigned it, or it went to a
/// fallthrough or rule that tracks all evaluations.
pub fn is_experiment(flag: &Flag, reason: &Reason) -> bool {
    if reason.in_experiment {
        return true;
    }
    match &reason.kind {
        ReasonKind::Fallthrough => flag.track_events_fallthrough,
        ReasonKind::RuleMatch { rule_index, .. } => flag
            .rules
            .get(*rule_index)
            .is_some_and(|rule| rule.track_events),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn flag() -> Flag {
        serde_json::from_value(json!({
            "key": "flag",
            "version": 7,
            "on": true,
            "variations": [false, true],
            "rules": [
                {"variation": 1, "clauses": []},
                {"variation": 1, "clauses": [], "trackEvents": true},
            ],
            "trackEventsFallthrough": true,
            "debugEventsUntilDate": 1000,
        }))
        .unwrap()
    }

    fn detail(reason: Reason) -> EvaluationDetail {
        EvaluationDetail {
            value: json!(true),
            variation_index: Some(1),
            reason,
        }
    }

    #[test]
    fn experiment_detection() {
        let flag = flag();
        assert!(is_experiment(&flag, &Reason::fallthrough(false)));
        assert!(is_experiment(&flag, &Reason::rule_match(1, None, false)));
        assert!(!is_experiment(&flag, &Reason::rule_match(0, None, false)));
        assert!(is_experiment(&flag, &Reason::rule_match(0, None, true)));
        assert!(!is_experiment(&flag, &Reason::rule_match(9, None, false)));
        assert!(!is_experiment(&flag, &Reason::off()));
        assert!(!is_experiment(&flag, &Reason::target_match()));
    }

    #[test]
    fn builds_prerequisite_event() {
        let flag = flag();
        let parent: Flag = serde_json::from_value(json!({"key": "parent"})).unwrap();
        let context = Context::new(json!({"key": "u", "name": "Ann"})).unwrap();

        let event = EventFactory::new().new_eval_event(
            &flag,
            &context,
            &detail(Reason::target_match()),
            Value::Null,
            Some(&parent),
        );
        assert_eq!(event.kind, "feature");
        assert_eq!(event.key, "flag");
        assert_eq!(event.version, 7);
        assert_eq!(event.variation, Some(1));
        assert_eq!(event.prereq_of.as_deref(), Some("parent"));
        assert_eq!(event.reason, None);
        assert!(!event.track_events);
        assert_eq!(event.debug_events_until_date, Some(1000));
        assert_eq!(event.context, json!({"key": "u", "name": "Ann"}));
        assert!(event.creation_date > 0);
    }

    #[test]
    fn experiments_carry_reason_and_tracking() {
        let flag = flag();
        let context = Context::new(json!({"kind": "user", "key": "u"})).unwrap();
        let event = EventFactory::new().new_eval_event(
            &flag,
            &context,
            &detail(Reason::fallthrough(false)),
            json!(false),
            None,
        );
        assert_eq!(event.reason, Some(Reason::fallthrough(false)));
        assert!(event.track_events);

        let event = EventFactory::new().with_reasons(true).new_eval_event(
            &flag,
            &context,
            &detail(Reason::off()),
            json!(false),
            None,
        );
        assert_eq!(event.reason, Some(Reason::off()));
        assert!(!event.track_events);
    }

    #[test]
    fn redacts_private_attributes() {
        let flag = flag();
        let context = Context::new(json!({
            "kind": "user",
            "key": "u",
            "email": "a@b.c",
            "name": "Ann",
        }))
        .unwrap();
        let event = EventFactory::new()
            .with_private_attributes(vec!["email".to_owned()])
            .new_eval_event(&flag, &context, &detail(Reason::off()), json!(false), None);
        assert_eq!(
            event.context,
            json!({
                "kind": "user",
                "key": "u",
                "name": "Ann",
                "_meta": {"redactedAttributes": ["email"]},
            })
        );

        let serialized = serde_json::to_value(&event).unwrap();
        assert_eq!(serialized["kind"], "feature");
        assert_eq!(serialized["version"], 7);
        assert!(serialized.get("prereqOf").is_none());
        assert!(serialized.get("trackEvents").is_none());
    }
}
