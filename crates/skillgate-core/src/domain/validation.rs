//! Mechanically checkable descriptions of what a step's output must look like.
//!
//! Patterns are tagged by `kind` so they read naturally in skill definitions:
//!
//! ```toml
//! validation_pattern = { kind = "required_fields", fields = ["greeting", "name"] }
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationPattern {
    /// Output is not null, blank, or an empty collection.
    NonEmpty,
    /// Every dotted path resolves to a non-null value.
    RequiredFields { fields: Vec<String> },
    /// The value at `field` is numeric and within `[min, max]`.
    NumericRange {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// A regex matches the value at `field`, or the whole output.
    Matches {
        pattern: String,
        #[serde(default)]
        field: Option<String>,
    },
    /// The output's text contains `text`.
    Contains { text: String },
    AllOf { patterns: Vec<ValidationPattern> },
}

impl ValidationPattern {
    /// Reject patterns that can never be evaluated (bad regex, empty lists).
    pub fn check(&self) -> Result<(), String> {
        match self {
            ValidationPattern::NonEmpty => Ok(()),
            ValidationPattern::RequiredFields { fields } => {
                if fields.is_empty() || fields.iter().any(|f| f.trim().is_empty()) {
                    return Err("required_fields needs at least one non-empty field".into());
                }
                Ok(())
            }
            ValidationPattern::NumericRange { field, min, max } => {
                if field.trim().is_empty() {
                    return Err("numeric_range needs a field".into());
                }
                if let (Some(lo), Some(hi)) = (min, max) {
                    if lo > hi {
                        return Err(format!("numeric_range min {lo} exceeds max {hi}"));
                    }
                }
                if min.is_none() && max.is_none() {
                    return Err("numeric_range needs min or max".into());
                }
                Ok(())
            }
            ValidationPattern::Matches { pattern, .. } => Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| format!("bad regex {pattern:?}: {e}")),
            ValidationPattern::Contains { text } => {
                if text.is_empty() {
                    return Err("contains needs non-empty text".into());
                }
                Ok(())
            }
            ValidationPattern::AllOf { patterns } => {
                if patterns.is_empty() {
                    return Err("all_of needs at least one pattern".into());
                }
                patterns.iter().try_for_each(ValidationPattern::check)
            }
        }
    }

    /// `Ok(())` when `output` satisfies the pattern, otherwise the reason.
    pub fn evaluate(&self, output: &Value) -> Result<(), String> {
        match self {
            ValidationPattern::NonEmpty => {
                if is_blank(output) {
                    Err("output is empty".into())
                } else {
                    Ok(())
                }
            }
            ValidationPattern::RequiredFields { fields } => {
                let missing: Vec<&str> = fields
                    .iter()
                    .filter(|f| lookup(output, f).map(Value::is_null).unwrap_or(true))
                    .map(String::as_str)
                    .collect();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(format!("missing fields: {}", missing.join(", ")))
                }
            }
            ValidationPattern::NumericRange { field, min, max } => {
                let n = lookup(output, field)
                    .and_then(as_number)
                    .ok_or_else(|| format!("{field} is not numeric"))?;
                if min.map(|lo| n < lo).unwrap_or(false) || max.map(|hi| n > hi).unwrap_or(false) {
                    return Err(format!("{field}={n} out of range"));
                }
                Ok(())
            }
            ValidationPattern::Matches { pattern, field } => {
                let re = Regex::new(pattern).map_err(|e| e.to_string())?;
                let target = match field {
                    Some(path) => lookup(output, path).ok_or_else(|| format!("{path} missing"))?,
                    None => output,
                };
                if re.is_match(&as_text(target)) {
                    Ok(())
                } else {
                    Err(format!("no match for {pattern:?}"))
                }
            }
            ValidationPattern::Contains { text } => {
                if as_text(output).contains(text.as_str()) {
                    Ok(())
                } else {
                    Err(format!("output does not contain {text:?}"))
                }
            }
            ValidationPattern::AllOf { patterns } => {
                patterns.iter().try_for_each(|p| p.evaluate(output))
            }
        }
    }

    /// Short human-readable form for logs and CLI output.
    pub fn describe(&self) -> String {
        match self {
            ValidationPattern::NonEmpty => "non-empty output".into(),
            ValidationPattern::RequiredFields { fields } => {
                format!("required fields [{}]", fields.join(", "))
            }
            ValidationPattern::NumericRange { field, min, max } => {
                let lo = min.map(|v| v.to_string()).unwrap_or_else(|| "-inf".into());
                let hi = max.map(|v| v.to_string()).unwrap_or_else(|| "inf".into());
                format!("{field} in [{lo}, {hi}]")
            }
            ValidationPattern::Matches { pattern, field } => match field {
                Some(f) => format!("{f} matches /{pattern}/"),
                None => format!("matches /{pattern}/"),
            },
            ValidationPattern::Contains { text } => format!("contains {text:?}"),
            ValidationPattern::AllOf { patterns } => patterns
                .iter()
                .map(ValidationPattern::describe)
                .collect::<Vec<_>>()
                .join(" and "),
        }
    }
}

/// Resolve a dotted path; numeric segments index into arrays.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |cur, seg| match cur {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}
