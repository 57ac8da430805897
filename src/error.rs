use crate::{context::ContextError, reason::ErrorKind};

/// Represents a result type for evaluation steps that may fail.
pub type Result<T> = std::result::Result<T, EvaluationError>;

/// Enum representing possible errors that can occur during flag evaluation.
///
/// Errors never escape [`Evaluator::evaluate`](crate::Evaluator::evaluate): they are turned into an
/// `ERROR` reason and returned alongside the result for logging.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EvaluationError {
    /// The evaluation context is missing or invalid.
    #[error("invalid evaluation context: {0}")]
    InvalidContext(#[source] ContextError),

    #[error("flag not found")]
    FlagNotFound,

    /// A target, rule, rollout, or off variation refers to a variation that does not exist.
    #[error("variation index {index} is out of range")]
    InvalidVariationIndex { index: i64 },

    /// A rule or the fallthrough has neither a variation nor a rollout.
    #[error("rule or fallthrough has neither a variation nor a rollout")]
    MissingVariationOrRollout,

    #[error("rollout has no variations")]
    EmptyRollout,

    #[error("invalid attribute reference {0:?}")]
    InvalidAttributeReference(String),

    #[error("prerequisite relationship to {0:?} caused a circular reference")]
    CircularPrerequisite(String),

    #[error("segment rule referencing segment {0:?} caused a circular reference")]
    CircularSegment(String),
}

impl EvaluationError {
    /// Error kind reported in the evaluation reason.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            EvaluationError::InvalidContext(_) => ErrorKind::UserNotSpecified,
            EvaluationError::FlagNotFound => ErrorKind::FlagNotFound,
            EvaluationError::InvalidVariationIndex { .. }
            | EvaluationError::MissingVariationOrRollout
            | EvaluationError::EmptyRollout
            | EvaluationError::InvalidAttributeReference(_)
            | EvaluationError::CircularPrerequisite(_)
            | EvaluationError::CircularSegment(_) => ErrorKind::MalformedFlag,
        }
    }
}
