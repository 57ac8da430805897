//! Evaluation contexts.
//!
//! A context is a JSON object describing the entity a flag is evaluated for. It is either a
//! single-kind context (`{"kind": "org", "key": "acme", ...}`), a multi-kind context holding
//! several single-kind contexts under their kind names (`{"kind": "multi", "user": {...}, "org":
//! {...}}`), or a legacy user (an object without `kind`, implicitly of kind `user`).
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::attribute_reference::{clone_excluding, Reference};

/// Kind assumed for legacy contexts and for clauses, targets, and rollouts that omit a kind.
pub const DEFAULT_KIND: &str = "user";

const MULTI_KIND: &str = "multi";

/// Reasons a value is rejected as an evaluation context.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ContextError {
    /// Context is not a JSON object.
    #[error("context must be an object")]
    NotAnObject,

    /// Kind is not a string matching `^(\w|\.|-)+$`, or uses a reserved name.
    #[error("invalid context kind: {0}")]
    InvalidKind(String),

    /// Key is missing, empty, or not a string.
    #[error("context of kind {kind:?} has a missing or invalid key")]
    InvalidKey {
        /// Kind of the (sub-)context with the invalid key.
        kind: String,
    },
}

/// Return `true` if `context` is a valid evaluation context.
///
/// With `allow_legacy_key`, an object without `kind` is a legacy user and only needs a non-null
/// `key` of any type. Otherwise a missing `kind` means `user` and the key must be a non-empty
/// string.
pub fn check_context(context: &Value, allow_legacy_key: bool) -> bool {
    context
        .as_object()
        .is_some_and(|object| validate(object, allow_legacy_key).is_ok())
}

/// Kinds present in `context`: `["user"]` for a legacy context, the kind of a single-kind
/// context, or the sub-context names of a multi-kind context in the order they appear.
pub fn get_context_kinds(context: &Value) -> Vec<String> {
    let Some(object) = context.as_object() else {
        return Vec::new();
    };
    match object.get("kind") {
        None | Some(Value::Null) => vec![DEFAULT_KIND.to_owned()],
        Some(Value::String(kind)) if kind == MULTI_KIND => object
            .keys()
            .filter(|name| *name != "kind")
            .cloned()
            .collect(),
        Some(Value::String(kind)) => vec![kind.clone()],
        Some(_) => Vec::new(),
    }
}

/// Canonical key of `context`.
///
/// A user (or legacy) context's canonical key is its key. Any other single-kind context yields
/// `kind:key`, and a multi-kind context joins `kind:key` of every sub-context, sorted by kind,
/// with `:`. Keys are escaped (`%` as `%25`, `:` as `%3A`) whenever a kind prefix is used.
pub fn get_canonical_key(context: &Value) -> Option<String> {
    let object = context.as_object()?;
    match object.get("kind") {
        None | Some(Value::Null) => non_empty(object.get("key").and_then(stringify_key)?),
        Some(Value::String(kind)) if kind == DEFAULT_KIND => {
            non_empty(object.get("key")?.as_str()?.to_owned())
        }
        Some(Value::String(kind)) if kind == MULTI_KIND => {
            let mut kinds = object
                .iter()
                .filter(|(name, _)| *name != "kind")
                .collect::<Vec<_>>();
            kinds.sort_by(|a, b| a.0.cmp(b.0));
            let parts = kinds
                .into_iter()
                .map(|(kind, sub)| {
                    let key = sub.get("key")?.as_str()?;
                    Some(format!("{kind}:{}", encode_key(key)))
                })
                .collect::<Option<Vec<_>>>()?;
            Some(parts.join(":"))
        }
        Some(Value::String(kind)) => {
            let key = object.get("key")?.as_str().filter(|it| !it.is_empty())?;
            Some(format!("{kind}:{}", encode_key(key)))
        }
        Some(_) => None,
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn encode_key(key: &str) -> String {
    key.replace('%', "%25").replace(':', "%3A")
}

pub(crate) fn is_valid_kind(kind: &str) -> bool {
    !kind.is_empty()
        && kind != "kind"
        && kind
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn is_valid_key(key: Option<&Value>) -> bool {
    matches!(key, Some(Value::String(s)) if !s.is_empty())
}

fn validate(object: &Map<String, Value>, allow_legacy_key: bool) -> Result<(), ContextError> {
    let kind = match object.get("kind") {
        None | Some(Value::Null) if allow_legacy_key => {
            return match object.get("key") {
                None | Some(Value::Null) => Err(ContextError::InvalidKey {
                    kind: DEFAULT_KIND.to_owned(),
                }),
                Some(_) => Ok(()),
            };
        }
        None | Some(Value::Null) => DEFAULT_KIND,
        Some(Value::String(kind)) => kind.as_str(),
        Some(other) => return Err(ContextError::InvalidKind(other.to_string())),
    };

    if kind == MULTI_KIND {
        for (name, sub) in object.iter().filter(|(name, _)| *name != "kind") {
            if name == MULTI_KIND || !is_valid_kind(name) {
                return Err(ContextError::InvalidKind(name.clone()));
            }
            if !is_valid_key(sub.get("key")) {
                return Err(ContextError::InvalidKey { kind: name.clone() });
            }
        }
        return Ok(());
    }

    if !is_valid_kind(kind) {
        return Err(ContextError::InvalidKind(kind.to_owned()));
    }
    if !is_valid_key(object.get("key")) {
        return Err(ContextError::InvalidKey {
            kind: kind.to_owned(),
        });
    }
    Ok(())
}

/// Render a key-like scalar the way it is hashed and compared: strings as-is, integral numbers
/// without a fractional part, booleans as `true`/`false`.
pub(crate) fn stringify_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(match integral(n) {
            Some(i) => i.to_string(),
            None => n.to_string(),
        }),
        _ => None,
    }
}

/// Return the number as an integer if it has no fractional part.
pub(crate) fn integral(n: &serde_json::Number) -> Option<i64> {
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    let f = n.as_f64()?;
    let i = f as i64;
    (f.is_finite() && i as f64 == f).then_some(i)
}

/// A validated evaluation context.
///
/// Built from a JSON value with [`Context::new`]; a legacy context's key is coerced to a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Context {
    value: Value,
    legacy: bool,
}

static ANONYMOUS_DEFAULT: Value = Value::Bool(false);

impl Context {
    /// Validate `value` as a context (legacy contexts allowed).
    pub fn new(value: Value) -> Result<Context, ContextError> {
        let Value::Object(mut object) = value else {
            return Err(ContextError::NotAnObject);
        };
        validate(&object, true)?;

        let legacy = matches!(object.get("kind"), None | Some(Value::Null));
        if legacy {
            let key = object
                .get("key")
                .and_then(stringify_key)
                .unwrap_or_else(|| object.get("key").map(Value::to_string).unwrap_or_default());
            object.insert("key".to_owned(), Value::String(key));
        }

        Ok(Context {
            value: Value::Object(object),
            legacy,
        })
    }

    /// The normalized JSON form of the context.
    pub fn as_value(&self) -> &Value {
        &self.value
    }

    /// Return `true` for a kind-less (legacy user) context.
    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    pub fn is_multi(&self) -> bool {
        self.value.get("kind").and_then(Value::as_str) == Some(MULTI_KIND)
    }

    /// See [`get_context_kinds`].
    pub fn kinds(&self) -> Vec<String> {
        get_context_kinds(&self.value)
    }

    /// See [`get_canonical_key`].
    pub fn canonical_key(&self) -> String {
        get_canonical_key(&self.value).unwrap_or_default()
    }

    /// The single-kind context for `kind`, if present.
    pub fn for_kind(&self, kind: &str) -> Option<&Value> {
        if self.legacy {
            return (kind == DEFAULT_KIND).then_some(&self.value);
        }
        let own_kind = self.value.get("kind")?.as_str()?;
        if own_kind == MULTI_KIND {
            self.value.get(kind).filter(|_| kind != "kind")
        } else {
            (own_kind == kind).then_some(&self.value)
        }
    }

    /// Key of the single-kind context for `kind`, if present.
    pub fn key_for_kind(&self, kind: &str) -> Option<&str> {
        self.for_kind(kind)?.get("key")?.as_str()
    }

    /// Value of attribute `reference` in the single-kind context for `kind`.
    ///
    /// `anonymous` reads as `false` when absent. Legacy contexts fall back to their `custom`
    /// object for single-component references.
    pub fn value_for_kind(&self, kind: &str, reference: &Reference) -> Option<&Value> {
        let target = self.for_kind(kind)?;
        if let Some(value) = reference.get(target) {
            return Some(value);
        }
        match reference.components() {
            [name] if name == "anonymous" => Some(&ANONYMOUS_DEFAULT),
            [name] if self.legacy => target.get("custom")?.get(name),
            _ => None,
        }
    }

    /// Attributes marked private on the single-kind context for `kind`.
    pub fn private_attributes(&self, kind: &str) -> Vec<Reference> {
        let Some(target) = self.for_kind(kind) else {
            return Vec::new();
        };
        let mut result = target
            .get("_meta")
            .and_then(|meta| meta.get("privateAttributes"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(Reference::new)
            .collect::<Vec<_>>();
        if self.legacy {
            result.extend(
                target
                    .get("privateAttributeNames")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                    .map(Reference::from_literal),
            );
        }
        result
    }

    /// Copy of the context with private attributes removed.
    ///
    /// `global_private` applies to every kind on top of each context's own private attributes;
    /// `all_private` removes every optional top-level attribute. `kind`, `key`, `anonymous`, and
    /// `_meta` are never removed. Removed attributes are listed in `_meta.redactedAttributes`.
    pub fn redacted(&self, global_private: &[String], all_private: bool) -> Value {
        if self.is_multi() {
            let mut result = Map::new();
            result.insert("kind".to_owned(), Value::String(MULTI_KIND.to_owned()));
            for kind in self.kinds() {
                if let Some(sub) = self.for_kind(&kind) {
                    let sub =
                        self.redact_single(&kind, sub, global_private, all_private);
                    result.insert(kind, sub);
                }
            }
            Value::Object(result)
        } else {
            let kind = self
                .value
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_KIND)
                .to_owned();
            self.redact_single(&kind, &self.value, global_private, all_private)
        }
    }

    fn redact_single(
        &self,
        kind: &str,
        target: &Value,
        global_private: &[String],
        all_private: bool,
    ) -> Value {
        let mut references = if all_private {
            target
                .as_object()
                .into_iter()
                .flat_map(|object| object.keys())
                .map(|name| {
                    if name.starts_with('/') {
                        Reference::from_literal(name)
                    } else {
                        Reference::new(name.as_str())
                    }
                })
                .collect::<Vec<_>>()
        } else {
            global_private
                .iter()
                .map(|it| Reference::new(it.as_str()))
                .chain(self.private_attributes(kind))
                .collect()
        };
        references.retain(|reference| match reference.components() {
            [] => false,
            [name] => !matches!(name.as_str(), "kind" | "key" | "anonymous" | "_meta"),
            [first, ..] => !matches!(first.as_str(), "kind" | "key" | "_meta"),
        });
        let references = references
            .iter()
            .map(Reference::as_str)
            .collect::<Vec<_>>();

        let (mut cloned, excluded) = clone_excluding(target, &references);
        if let Some(object) = cloned.as_object_mut() {
            object.remove("_meta");
            object.remove("privateAttributeNames");
            if !excluded.is_empty() {
                let mut meta = Map::new();
                meta.insert(
                    "redactedAttributes".to_owned(),
                    Value::Array(excluded.into_iter().map(Value::String).collect()),
                );
                object.insert("_meta".to_owned(), Value::Object(meta));
            }
        }
        cloned
    }
}

impl TryFrom<Value> for Context {
    type Error = ContextError;

    fn try_from(value: Value) -> Result<Context, ContextError> {
        Context::new(value)
    }
}

impl From<Context> for Value {
    fn from(value: Context) -> Value {
        value.value
    }
}
