//! A feature flag evaluation engine.
//!
//! # Overview
//!
//! An [`Evaluator`] decides which variation of a [`Flag`] an evaluation [`Context`] receives, and
//! why. Contexts are JSON objects describing a user or any other kind of entity, or several of them
//! at once (a multi-kind context). Evaluation walks the flag's prerequisites, targets, rules, and
//! fallthrough in order, and produces an [`EvaluationDetail`] carrying the value, the variation
//! index, and a [`Reason`].
//!
//! Prerequisite flags, segments, and big segment membership are read through the [`Queries`]
//! trait. [`InMemoryStore`] is a ready-made implementation backed by a [`DataSet`].
//!
//! Every prerequisite flag evaluated along the way yields a [`FeatureEvent`], built by the
//! [`EventFactory`] passed to the evaluation.
//!
//! ```
//! # use flag_eval::{DataSet, EventFactory, Evaluator, Flag, InMemoryStore};
//! # use serde_json::json;
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let flag: Flag = serde_json::from_value(json!({
//!     "key": "new-checkout",
//!     "on": true,
//!     "variations": [false, true],
//!     "fallthrough": {"variation": 0},
//!     "rules": [{
//!         "id": "beta",
//!         "variation": 1,
//!         "clauses": [{"attribute": "groups", "op": "in", "values": ["beta"]}],
//!     }],
//! }))?;
//!
//! let evaluator = Evaluator::new(InMemoryStore::with_data(DataSet::default()));
//! let result = evaluator
//!     .evaluate(
//!         Some(&flag),
//!         &json!({"kind": "user", "key": "u1", "groups": ["beta"]}),
//!         &EventFactory::new(),
//!     )
//!     .await;
//! assert_eq!(result.detail.value, json!(true));
//! # Ok::<(), serde_json::Error>(())
//! # }).unwrap();
//! ```
//!
//! # Error Handling
//!
//! Evaluation never fails. Invalid contexts, missing flags, and malformed flag data produce an
//! `ERROR` reason, and the cause is returned as an [`EvaluationError`] in
//! [`Evaluation::error`]. These errors usually indicate that flag data needs a developer's
//! attention and are worth logging, but they should not be treated as fatal.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with structured key-values
//! under the `flag_eval` target. Consider integrating a `log`-compatible logger implementation
//! for better visibility into malformed data and evaluation results.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod attribute_reference;
pub mod bucketing;
pub mod context;
pub mod error;
pub mod eval;
pub mod events;
pub mod models;
pub mod operators;
pub mod queries;
pub mod reason;
pub mod store;

pub use context::{Context, ContextError};
pub use error::{EvaluationError, Result};
pub use eval::{Evaluation, Evaluator};
pub use events::{EventFactory, FeatureEvent};
pub use models::{Flag, Segment};
pub use queries::{BigSegmentMembership, Queries};
pub use reason::{BigSegmentsStatus, ErrorKind, EvaluationDetail, Reason, ReasonKind};
pub use store::{DataSet, InMemoryStore};
