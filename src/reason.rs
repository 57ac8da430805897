use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Health of the big segment store as seen by one evaluation.
///
/// Variants are declared in priority order: when several membership queries happen during one
/// evaluation, the greatest status wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    /// Membership data is available and up to date.
    Healthy,
    /// Membership data is available but may be out of date.
    Stale,
    /// Querying the store failed.
    StoreError,
    /// Big segments are referenced but no store is configured (or the segment lacks a
    /// generation).
    NotConfigured,
}

impl BigSegmentsStatus {
    /// Combine two statuses, keeping the higher-priority one.
    pub fn merge(self, other: BigSegmentsStatus) -> BigSegmentsStatus {
        self.max(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Context is missing or invalid.
    UserNotSpecified,
    FlagNotFound,
    /// Flag or segment data is inconsistent: bad variation index, missing or empty rollout,
    /// invalid attribute reference, or a circular prerequisite/segment reference.
    MalformedFlag,
}

/// Why an evaluation produced its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonKind {
    /// Flag is off.
    Off,
    /// No target or rule matched.
    Fallthrough,
    /// Context key is listed in a target.
    TargetMatch,
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        rule_index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<String>,
    },
    /// A prerequisite flag was missing, off, or served the wrong variation.
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed { prerequisite_key: String },
    #[serde(rename_all = "camelCase")]
    Error { error_kind: ErrorKind },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reason {
    #[serde(flatten)]
    pub kind: ReasonKind,
    /// The result was assigned by an experiment rollout and should be tracked.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub in_experiment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub big_segments_status: Option<BigSegmentsStatus>,
}

impl Reason {
    fn new(kind: ReasonKind) -> Reason {
        Reason {
            kind,
            in_experiment: false,
            big_segments_status: None,
        }
    }

    pub fn off() -> Reason {
        Reason::new(ReasonKind::Off)
    }

    pub fn fallthrough(in_experiment: bool) -> Reason {
        Reason {
            in_experiment,
            ..Reason::new(ReasonKind::Fallthrough)
        }
    }

    pub fn target_match() -> Reason {
        Reason::new(ReasonKind::TargetMatch)
    }

    pub fn rule_match(rule_index: usize, rule_id: Option<String>, in_experiment: bool) -> Reason {
        Reason {
            in_experiment,
            ..Reason::new(ReasonKind::RuleMatch {
                rule_index,
                rule_id,
            })
        }
    }

    pub fn prerequisite_failed(prerequisite_key: impl Into<String>) -> Reason {
        Reason::new(ReasonKind::PrerequisiteFailed {
            prerequisite_key: prerequisite_key.into(),
        })
    }

    pub fn error(error_kind: ErrorKind) -> Reason {
        Reason::new(ReasonKind::Error { error_kind })
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, ReasonKind::Error { .. })
    }
}

/// Result of a flag evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetail {
    /// Selected variation value, or `null` if none was selected.
    pub value: Value,
    pub variation_index: Option<usize>,
    pub reason: Reason,
}

impl EvaluationDetail {
    /// An error result: no value and no variation.
    pub fn error(error_kind: ErrorKind) -> EvaluationDetail {
        EvaluationDetail {
            value: Value::Null,
            variation_index: None,
            reason: Reason::error(error_kind),
        }
    }

    pub fn is_error(&self) -> bool {
        self.reason.is_error()
    }
}
