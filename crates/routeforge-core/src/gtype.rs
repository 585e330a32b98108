//! GType — structural schema validator (glossary).
//!
//! A `GType` describes the shape of a JSON value: object with typed
//! properties, arrays, primitives, unions. Grounded on the reference
//! gateway's trait-based `Rule` validator pattern (`validator/rules.rs`):
//! each shape variant is a small, independently testable check rather than
//! one recursive match with inline logic sprinkled everywhere, and failures
//! accumulate into a `Vec<ValidationIssue>` instead of failing fast the way
//! a reflective "Ajv-style" validator would.

use serde_json::Value;

/// A structural schema node.
#[derive(Debug, Clone)]
pub enum GType {
    /// Matches `null`.
    Null,
    /// Matches any boolean.
    Bool,
    /// Matches any number.
    Number,
    /// Matches any string.
    String,
    /// Matches an array whose every element matches `items`.
    Array(Box<GType>),
    /// Matches an object with the given named, typed properties.
    Object {
        /// Property name -> expected shape.
        properties: Vec<(String, GType)>,
        /// Property names that must be present.
        required: Vec<String>,
    },
    /// Matches if any of the listed shapes match (union).
    Union(Vec<GType>),
    /// Matches if every one of the listed shapes match (intersection).
    Intersection(Vec<GType>),
    /// Matches any value.
    Any,
}

/// A single structural mismatch, with a JSON-pointer-like path to the
/// offending value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Dot-separated path to the offending value (`"" ` for the root).
    pub path: String,
    /// Human-readable description of the mismatch.
    pub message: String,
}

/// Validate `value` against `schema`, returning every mismatch found (no
/// fail-fast — callers surface the full list as a single validation error).
#[must_use]
pub fn validate(schema: &GType, value: &Value) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    check(schema, value, "", &mut issues);
    issues
}

fn check(schema: &GType, value: &Value, path: &str, issues: &mut Vec<ValidationIssue>) {
    match schema {
        GType::Any => {}
        GType::Null => {
            if !value.is_null() {
                issues.push(mismatch(path, "expected null"));
            }
        }
        GType::Bool => {
            if !value.is_boolean() {
                issues.push(mismatch(path, "expected boolean"));
            }
        }
        GType::Number => {
            if !value.is_number() {
                issues.push(mismatch(path, "expected number"));
            }
        }
        GType::String => {
            if !value.is_string() {
                issues.push(mismatch(path, "expected string"));
            }
        }
        GType::Array(items) => match value.as_array() {
            Some(arr) => {
                for (i, item) in arr.iter().enumerate() {
                    check(items, item, &join(path, &i.to_string()), issues);
                }
            }
            None => issues.push(mismatch(path, "expected array")),
        },
        GType::Object { properties, required } => match value.as_object() {
            Some(obj) => {
                for name in required {
                    if !obj.contains_key(name) {
                        issues.push(mismatch(&join(path, name), "missing required property"));
                    }
                }
                for (name, prop_schema) in properties {
                    if let Some(v) = obj.get(name) {
                        check(prop_schema, v, &join(path, name), issues);
                    }
                }
            }
            None => issues.push(mismatch(path, "expected object")),
        },
        GType::Union(options) => {
            let all_failed = options.iter().all(|opt| !validate(opt, value).is_empty());
            if all_failed {
                issues.push(mismatch(path, "value matched none of the union members"));
            }
        }
        GType::Intersection(parts) => {
            for part in parts {
                check(part, value, path, issues);
            }
        }
    }
}

fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{path}.{segment}")
    }
}

fn mismatch(path: &str, message: &str) -> ValidationIssue {
    ValidationIssue {
        path: path.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_with_required_property_passes() {
        let schema = GType::Object {
            properties: vec![("name".to_string(), GType::String)],
            required: vec!["name".to_string()],
        };
        assert!(validate(&schema, &json!({ "name": "a" })).is_empty());
    }

    #[test]
    fn missing_required_property_reported_at_path() {
        let schema = GType::Object {
            properties: vec![("name".to_string(), GType::String)],
            required: vec!["name".to_string()],
        };
        let issues = validate(&schema, &json!({}));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "name");
    }

    #[test]
    fn array_items_validated_with_indexed_path() {
        let schema = GType::Array(Box::new(GType::Number));
        let issues = validate(&schema, &json!([1, "bad", 3]));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "1");
    }

    #[test]
    fn union_passes_if_any_branch_matches() {
        let schema = GType::Union(vec![GType::String, GType::Number]);
        assert!(validate(&schema, &json!(42)).is_empty());
        assert!(!validate(&schema, &json!(true)).is_empty());
    }
}
