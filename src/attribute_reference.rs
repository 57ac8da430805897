//! Attribute references: addressing values inside a context.
//!
//! A string that does not start with `/` is a *literal* attribute name and addresses a single
//! top-level key, whatever characters it contains. A string that starts with `/` is a *reference*:
//! a path whose components are separated by `/`, with `~1` standing for `/` and `~0` standing for
//! `~` inside a component (the same escaping as JSON Pointer).
//!
//! ```
//! # use flag_eval::attribute_reference::Reference;
//! # use serde_json::json;
//! let context = json!({"kind": "user", "key": "u1", "address": {"city": "Oslo"}});
//! assert_eq!(Reference::new("/address/city").get(&context), Some(&json!("Oslo")));
//! assert_eq!(Reference::new("address").get(&context), Some(&json!({"city": "Oslo"})));
//! ```
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A parsed attribute reference or literal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Reference {
    raw: String,
    components: Vec<String>,
    valid: bool,
}

impl Reference {
    /// Parse `s` as a reference if it starts with `/`, or as a literal attribute name otherwise.
    pub fn new(s: impl Into<String>) -> Reference {
        let raw = s.into();
        let valid = is_valid_reference(&raw);
        let components = if let Some(path) = raw.strip_prefix('/') {
            if path.is_empty() {
                Vec::new()
            } else {
                path.split('/').map(unescape).collect()
            }
        } else if raw.is_empty() {
            Vec::new()
        } else {
            vec![raw.clone()]
        };
        Reference {
            raw,
            components,
            valid,
        }
    }

    /// Create a reference to the top-level attribute `name`, even if `name` starts with `/`.
    pub fn from_literal(name: &str) -> Reference {
        Reference::new(literal_to_reference(name))
    }

    /// The string this reference was built from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Path components after unescaping.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Return `true` if this addresses the context kind (`kind` or `/kind`).
    pub fn is_kind(&self) -> bool {
        self.components.len() == 1 && self.components[0] == "kind"
    }

    /// Look up the value addressed by this reference.
    ///
    /// Returns `None` for the root reference, when the key is absent, or when any intermediate
    /// value is not an object. Arrays and strings are never indexed.
    pub fn get<'a>(&self, target: &'a Value) -> Option<&'a Value> {
        if self.components.is_empty() {
            return None;
        }
        let mut current = target;
        for component in &self.components {
            current = current.as_object()?.get(component)?;
        }
        Some(current)
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Reference) -> bool {
        self.components == other.components
    }
}

impl Eq for Reference {}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<String> for Reference {
    fn from(value: String) -> Reference {
        Reference::new(value)
    }
}

impl From<&str> for Reference {
    fn from(value: &str) -> Reference {
        Reference::new(value)
    }
}

impl From<Reference> for String {
    fn from(value: Reference) -> String {
        value.raw
    }
}

fn unescape(component: &str) -> String {
    component.replace("~1", "/").replace("~0", "~")
}

/// Look up `reference` (a reference or a literal) inside `target`.
pub fn get<'a>(target: &'a Value, reference: &str) -> Option<&'a Value> {
    Reference::new(reference).get(target)
}

/// Return `true` if `a` and `b` address the same attribute. A literal and a single-component
/// reference to the same name compare equal.
pub fn compare(a: &str, b: &str) -> bool {
    Reference::new(a) == Reference::new(b)
}

/// Return `true` unless `reference` contains an empty component (`//`), an unescaped `~` inside a
/// path, or ends with `~`.
pub fn is_valid_reference(reference: &str) -> bool {
    if reference.contains("//") || reference.ends_with('~') {
        return false;
    }
    if reference.starts_with('/') {
        let mut chars = reference.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '~' && !matches!(chars.peek(), Some('0') | Some('1')) {
                return false;
            }
        }
    }
    true
}

/// Escape a literal attribute name into an equivalent single-component reference.
pub fn literal_to_reference(literal: &str) -> String {
    format!("/{}", literal.replace('~', "~0").replace('/', "~1"))
}

/// Deep-copy `target`, leaving out every subtree addressed by one of `references`.
///
/// Returns the copy along with the sorted list of references that actually removed something.
/// Excluding the root, excluding through arrays or `null`, and excluding absent paths are no-ops.
pub fn clone_excluding<S: AsRef<str>>(target: &Value, references: &[S]) -> (Value, Vec<String>) {
    let parsed = references
        .iter()
        .map(|it| Reference::new(it.as_ref()))
        .filter(|it| it.is_valid() && !it.components().is_empty())
        .collect::<Vec<_>>();

    let paths = parsed
        .iter()
        .enumerate()
        .map(|(index, reference)| (index, reference.components()))
        .collect::<Vec<_>>();

    let mut hits = vec![false; parsed.len()];
    let cloned = clone_filtered(target, &paths, &mut hits);

    let mut excluded = parsed
        .iter()
        .zip(hits)
        .filter(|(_, hit)| *hit)
        .map(|(reference, _)| reference.as_str().to_owned())
        .collect::<Vec<_>>();
    excluded.sort();
    excluded.dedup();

    (cloned, excluded)
}

/// `paths` holds the remaining (non-empty) components of each exclusion, tagged with its index in
/// `hits`.
fn clone_filtered(value: &Value, paths: &[(usize, &[String])], hits: &mut [bool]) -> Value {
    let Value::Object(object) = value else {
        return value.clone();
    };
    if paths.is_empty() {
        return value.clone();
    }

    let mut result = Map::with_capacity(object.len());
    for (key, child) in object {
        let mut removed = false;
        let mut nested = Vec::new();
        for (index, components) in paths {
            if components[0] != *key {
                continue;
            }
            if components.len() == 1 {
                hits[*index] = true;
                removed = true;
            } else {
                nested.push((*index, &components[1..]));
            }
        }
        if !removed {
            result.insert(key.clone(), clone_filtered(child, &nested, hits));
        }
    }
    Value::Object(result)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn literal_addresses_top_level_key() {
        let target = json!({"a/b": 1, "a": {"b": 2}});
        assert_eq!(get(&target, "a/b"), Some(&json!(1)));
        assert_eq!(get(&target, "/a/b"), Some(&json!(2)));
    }

    #[test]
    fn unescapes_components() {
        let target = json!({"a/b": {"c~d": true}});
        assert_eq!(get(&target, "/a~1b/c~0d"), Some(&json!(true)));
        assert_eq!(
            Reference::new("/a~1b/c~0d").components(),
            &["a/b".to_owned(), "c~d".to_owned()]
        );
    }

    #[test]
    fn root_is_never_addressable() {
        let target = json!({"": 1});
        assert_eq!(get(&target, ""), None);
        assert_eq!(get(&target, "/"), None);
    }

    #[test]
    fn does_not_index_arrays_or_strings() {
        let target = json!({"list": [1, 2, 3], "name": "abc", "obj": {"0": "zero"}});
        assert_eq!(get(&target, "/list/0"), None);
        assert_eq!(get(&target, "/name/0"), None);
        assert_eq!(get(&target, "/obj/0"), Some(&json!("zero")));
        assert_eq!(get(&target, "/missing/key"), None);
    }

    #[test]
    fn compare_literal_and_reference() {
        assert!(compare("name", "/name"));
        assert!(compare("/a~1b", "a/b"));
        assert!(!compare("/a/b", "a/b"));
        assert!(!compare("name", "/name/first"));
    }

    #[test]
    fn validates_references() {
        assert!(is_valid_reference("/a/b"));
        assert!(is_valid_reference("/a~0b/c~1d"));
        assert!(is_valid_reference("plain~name"));
        assert!(!is_valid_reference("/a//b"));
        assert!(!is_valid_reference("/a~2"));
        assert!(!is_valid_reference("/a~b"));
        assert!(!is_valid_reference("/a~"));
        assert!(!is_valid_reference("name~"));
    }

    #[test]
    fn literal_to_reference_round_trips() {
        let target = json!({"name": "x", "a~b": 1, "/slash": 2});
        for literal in ["name", "a~b"] {
            assert_eq!(
                get(&target, literal),
                get(&target, &literal_to_reference(literal))
            );
        }
        assert_eq!(literal_to_reference("/slash"), "/~1slash");
        assert_eq!(Reference::from_literal("/slash").get(&target), Some(&json!(2)));
    }

    #[test]
    fn clone_excluding_removes_subtrees() {
        let target = json!({
            "kind": "user",
            "key": "u1",
            "email": "a@b.c",
            "address": {"street": "Main", "city": "Oslo"},
        });
        let (cloned, excluded) = clone_excluding(&target, &["email", "/address/street"]);
        assert_eq!(
            cloned,
            json!({"kind": "user", "key": "u1", "address": {"city": "Oslo"}})
        );
        assert_eq!(excluded, vec!["/address/street".to_owned(), "email".to_owned()]);
    }

    #[test]
    fn clone_excluding_no_ops() {
        let target = json!({"list": [{"a": 1}], "nothing": null, "x": 1});
        let (cloned, excluded) =
            clone_excluding(&target, &["/", "", "/list/0", "/nothing/a", "/absent", "/x/y"]);
        assert_eq!(cloned, target);
        assert!(excluded.is_empty());
    }

    #[test]
    fn clone_excluding_clones_shared_shapes_independently() {
        let shared = json!({"secret": 1, "public": 2});
        let target = json!({"left": shared.clone(), "right": shared});
        let (cloned, excluded) = clone_excluding(&target, &["/left/secret"]);
        assert_eq!(
            cloned,
            json!({"left": {"public": 2}, "right": {"secret": 1, "public": 2}})
        );
        assert_eq!(excluded, vec!["/left/secret".to_owned()]);
    }
}
