// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Expected-output schemas for analysis and decision steps.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Type tag for a single declared output field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Free text.
    String,

    /// Whole number.
    Integer,

    /// Floating point number.
    Number,

    /// True/false flag.
    Boolean,

    /// Ordered list of values.
    Array,
}

impl FieldType {
    /// Default value substituted for a missing field.
    pub fn default_value(&self) -> Value {
        match self {
            Self::String => json!(""),
            Self::Integer => json!(0),
            Self::Number => json!(0.0),
            Self::Boolean => json!(false),
            Self::Array => json!([]),
        }
    }

    /// Coerce a raw model value into this type, falling back to the
    /// type default when the value cannot be interpreted.
    pub fn coerce(&self, value: &Value) -> Value {
        match self {
            Self::String => match value {
                Value::String(s) => json!(s),
                Value::Null => json!(""),
                other => json!(other.to_string()),
            },
            Self::Integer => match value {
                Value::Number(n) => json!(n.as_i64().unwrap_or(0)),
                Value::String(s) => json!(s.trim().parse::<i64>().unwrap_or(0)),
                Value::Bool(b) => json!(i64::from(*b)),
                _ => json!(0),
            },
            Self::Number => match value {
                Value::Number(n) => json!(n.as_f64().unwrap_or(0.0)),
                Value::String(s) => json!(s.trim().parse::<f64>().unwrap_or(0.0)),
                _ => json!(0.0),
            },
            Self::Boolean => match value {
                Value::Bool(b) => json!(b),
                Value::String(s) => {
                    let s = s.trim().to_ascii_lowercase();
                    json!(s == "true" || s == "yes" || s == "ja" || s == "1")
                }
                Value::Number(n) => json!(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
                _ => json!(false),
            },
            Self::Array => match value {
                Value::Array(a) => json!(a),
                Value::Null => json!([]),
                other => json!([other]),
            },
        }
    }
}

/// Field-name to type-tag schema declared by analysis/decision steps.
///
/// The map is ordered so prompt rendering and default objects are
/// deterministic across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFormat {
    /// Declared fields.
    pub fields: BTreeMap<String, FieldType>,
}

impl OutputFormat {
    /// Build a schema from `(name, type)` pairs.
    pub fn from_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, FieldType)>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Object with every field at its type default.
    pub fn default_object(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, ty)| (name.clone(), ty.default_value()))
            .collect();
        Value::Object(map)
    }

    /// Project a raw model response onto this schema.
    ///
    /// Unknown fields are dropped, declared fields are coerced, and
    /// missing fields default by type.
    pub fn project(&self, raw: &Value) -> Value {
        let map: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, ty)| {
                let coerced = match raw.get(name) {
                    Some(v) => ty.coerce(v),
                    None => ty.default_value(),
                };
                (name.clone(), coerced)
            })
            .collect();
        Value::Object(map)
    }

    /// Whether every field of a projected object is null or empty.
    ///
    /// Used by the empty-result salvage pass: `0` and `false` count as
    /// empty because the type defaults produce them.
    pub fn is_empty_result(&self, value: &Value) -> bool {
        if self.fields.is_empty() {
            return false;
        }

        self.fields.iter().all(|(name, ty)| {
            let field = value.get(name).unwrap_or(&Value::Null);
            match field {
                Value::Null => true,
                Value::String(s) => s.trim().is_empty(),
                Value::Array(a) => a.is_empty(),
                Value::Number(n) => n.as_f64() == Some(0.0) && *ty != FieldType::Boolean,
                Value::Bool(b) => !b,
                Value::Object(o) => o.is_empty(),
            }
        })
    }

    /// One-line JSON shape description for prompt composition, e.g.
    /// `{"job_title": string, "jobs": array}`.
    pub fn shape_description(&self) -> String {
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(name, ty)| {
                let tag = match ty {
                    FieldType::String => "string",
                    FieldType::Integer => "integer",
                    FieldType::Number => "number",
                    FieldType::Boolean => "boolean",
                    FieldType::Array => "array",
                };
                format!("\"{}\": {}", name, tag)
            })
            .collect();
        format!("{{{}}}", fields.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_schema() -> OutputFormat {
        OutputFormat::from_fields([
            ("job_title", FieldType::String),
            ("job_location", FieldType::String),
        ])
    }

    #[test]
    fn test_default_object() {
        let schema = OutputFormat::from_fields([
            ("count", FieldType::Integer),
            ("jobs", FieldType::Array),
            ("ok", FieldType::Boolean),
        ]);

        let defaults = schema.default_object();
        assert_eq!(defaults["count"], json!(0));
        assert_eq!(defaults["jobs"], json!([]));
        assert_eq!(defaults["ok"], json!(false));
    }

    #[test]
    fn test_project_coerces_and_fills() {
        let schema = OutputFormat::from_fields([
            ("count", FieldType::Integer),
            ("title", FieldType::String),
            ("score", FieldType::Number),
        ]);

        let raw = json!({"count": "4", "score": 0.75, "extra": "dropped"});
        let projected = schema.project(&raw);

        assert_eq!(projected["count"], json!(4));
        assert_eq!(projected["title"], json!(""));
        assert_eq!(projected["score"], json!(0.75));
        assert!(projected.get("extra").is_none());
    }

    #[test]
    fn test_empty_result_detection() {
        let schema = job_schema();

        assert!(schema.is_empty_result(&json!({"job_title": "", "job_location": ""})));
        assert!(schema.is_empty_result(&json!({"job_title": null})));
        assert!(!schema.is_empty_result(&json!({"job_title": "Engineer", "job_location": ""})));
    }

    #[test]
    fn test_shape_description_is_sorted() {
        let schema = OutputFormat::from_fields([
            ("zeta", FieldType::Array),
            ("alpha", FieldType::Boolean),
        ]);
        assert_eq!(schema.shape_description(), "{\"alpha\": boolean, \"zeta\": array}");
    }

    #[test]
    fn test_boolean_coercion_accepts_german_yes() {
        assert_eq!(FieldType::Boolean.coerce(&json!("ja")), json!(true));
        assert_eq!(FieldType::Boolean.coerce(&json!("nein")), json!(false));
    }
}
