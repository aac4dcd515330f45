// Structural diff module - compares two nested monitoring documents
//
// This module is responsible for:
// 1. Walking a reference document and a candidate document side by side
// 2. Classifying every key into one of four categories
// 3. Recursing into nested objects present on both sides
// 4. Skipping a set of ignored key names at every depth
//
// Documents are plain `serde_json` objects. `Value::Object` is a nested
// document, `Value::Array` is an opaque sequence, everything else is a scalar.

use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, HashSet};

/// A nested key-value document (a JSON object)
pub type Document = Map<String, Value>;

/// Key names excluded from comparison at any nesting depth
pub type IgnoreSet = HashSet<String>;

/// A key present on both sides with unequal values
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Difference {
    pub new: Value,
    pub reference: Value,
}

/// Categorized outcome of a structural comparison
///
/// Every category is skipped during serialization when empty, so a rendered
/// result never contains an empty mapping. Fields are declared in key order;
/// `templates::to_pretty_json` sorts every level regardless.
///
/// # Example Rendering (sorted)
/// ```json
/// {
///     "different": { "period": { "new": 60, "reference": 30 } },
///     "missing_from_new": { "disabled": false },
///     "modified": { "checks": { "missing_from_reference": { "ping": {} } } }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffResult {
    /// Keys on both sides whose values are unequal (or of incompatible shapes)
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub different: BTreeMap<String, Difference>,

    /// Keys in the reference that the candidate lacks
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub missing_from_new: BTreeMap<String, Value>,

    /// Keys left in the candidate after every reference key was matched
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub missing_from_reference: BTreeMap<String, Value>,

    /// Keys holding documents on both sides whose nested comparison is non-empty
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub modified: BTreeMap<String, DiffResult>,
}

impl DiffResult {
    /// True when no category holds an entry
    pub fn is_empty(&self) -> bool {
        self.different.is_empty()
            && self.missing_from_new.is_empty()
            && self.missing_from_reference.is_empty()
            && self.modified.is_empty()
    }
}

/// Compares a candidate document against a reference document
///
/// For each reference key:
/// - ignored names are skipped and never reported, on either side
/// - keys the candidate lacks go to `missing_from_new`
/// - keys holding documents on both sides are always compared recursively,
///   and the nested result lands in `modified` when non-empty
/// - any other pair is compared by value and lands in `different` when unequal
///
/// Whatever the candidate holds beyond the matched keys is its residue and
/// becomes `missing_from_reference`. Neither input is mutated; matched keys
/// are tracked in a local set.
///
/// # Arguments
/// * `reference` - The baseline document
/// * `candidate` - The document under test
/// * `ignored` - Key names to skip at every level
pub fn compare(reference: &Document, candidate: &Document, ignored: &IgnoreSet) -> DiffResult {
    let mut result = DiffResult::default();
    let mut consumed: HashSet<&str> = HashSet::with_capacity(reference.len());

    for (key, ref_value) in reference {
        if ignored.contains(key) {
            continue;
        }

        let Some(new_value) = candidate.get(key) else {
            result
                .missing_from_new
                .insert(key.clone(), ref_value.clone());
            continue;
        };
        consumed.insert(key.as_str());

        match (ref_value, new_value) {
            (Value::Object(ref_doc), Value::Object(new_doc)) => {
                let nested = compare(ref_doc, new_doc, ignored);
                if !nested.is_empty() {
                    result.modified.insert(key.clone(), nested);
                }
            }
            _ => {
                if !values_equal(ref_value, new_value) {
                    result.different.insert(
                        key.clone(),
                        Difference {
                            reference: ref_value.clone(),
                            new: new_value.clone(),
                        },
                    );
                }
            }
        }
    }

    result.missing_from_reference = candidate
        .iter()
        .filter(|(key, _)| !ignored.contains(key.as_str()) && !consumed.contains(key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    result
}

/// Value equality with loose number semantics
///
/// `1` equals `1.0`, and a boolean equals the number it counts as
/// (`true == 1`, `false == 0.0`). Strings never equal numbers.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => numbers_equal(l, r),
        (Value::Bool(b), Value::Number(n)) | (Value::Number(n), Value::Bool(b)) => {
            n.as_f64() == Some(if *b { 1.0 } else { 0.0 })
        }
        (Value::Array(l), Value::Array(r)) => {
            l.len() == r.len() && l.iter().zip(r).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(l), Value::Object(r)) => {
            l.len() == r.len()
                && l
                    .iter()
                    .all(|(key, a)| r.get(key).map_or(false, |b| values_equal(a, b)))
        }
        _ => left == right,
    }
}

fn numbers_equal(left: &Number, right: &Number) -> bool {
    if let (Some(l), Some(r)) = (left.as_i64(), right.as_i64()) {
        return l == r;
    }
    if let (Some(l), Some(r)) = (left.as_u64(), right.as_u64()) {
        return l == r;
    }
    if left.is_f64() || right.is_f64() {
        return match (left.as_f64(), right.as_f64()) {
            (Some(l), Some(r)) => l == r,
            _ => false,
        };
    }
    // a negative i64 against a u64 above i64::MAX
    false
}
