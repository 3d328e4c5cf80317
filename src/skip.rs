//! `not_if` / `only_if` skip conditions.
//!
//! Both sections map a (resolved) key string to a list of regexes. Each
//! regex must match the key itself, anchored at the start, and gets a `$`
//! appended if it lacks one.
//!
//! Deferred entries are handled differently per position:
//! - deferred `not_if` keys and values never match
//! - deferred `only_if` keys are skipped entirely
//! - a deferred `only_if` value counts as a match for its key

use crate::errors::RunError;
use crate::variables::was_deferred;
use regex::Regex;
use serde_json::{Map, Value};

/// Reasons the run should be skipped. Empty means run it.
pub fn evaluate(config: &Map<String, Value>) -> Result<Vec<String>, RunError> {
    let mut reasons = Vec::new();

    for (key, values) in section(config, "not_if")?.into_iter().flatten() {
        if was_deferred(key) {
            continue;
        }
        for val in condition_values(key, values)? {
            if was_deferred(val) {
                continue;
            }
            let pattern = anchored(val);
            if matches(&pattern, key)? {
                reasons.push(format!(
                    "Skipping due to not_if match for key '{}' with '{}'",
                    key, pattern
                ));
            }
        }
    }

    for (key, values) in section(config, "only_if")?.into_iter().flatten() {
        if was_deferred(key) {
            continue;
        }
        let vals = condition_values(key, values)?;
        let mut matched = false;
        for val in &vals {
            if was_deferred(val) {
                matched = true;
                break;
            }
            if matches(&anchored(val), key)? {
                matched = true;
            }
        }
        if !matched {
            reasons.push(format!(
                "Skipping because only_if key '{}' failed to match any of '{}'",
                key,
                vals.join(", ")
            ));
        }
    }

    Ok(reasons)
}

fn section<'a>(
    config: &'a Map<String, Value>,
    name: &str,
) -> Result<Option<&'a Map<String, Value>>, RunError> {
    match config.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(RunError::config(format!(
            "'{}' must be a mapping of keys to lists of patterns, got {}",
            name, other
        ))),
    }
}

fn condition_values<'a>(key: &str, values: &'a Value) -> Result<Vec<&'a str>, RunError> {
    let bad = || RunError::config(format!("condition values for '{}' must be strings", key));
    match values {
        Value::String(s) => Ok(vec![s.as_str()]),
        Value::Array(items) => items.iter().map(|v| v.as_str().ok_or_else(bad)).collect(),
        _ => Err(bad()),
    }
}

fn anchored(val: &str) -> String {
    if val.ends_with('$') {
        val.to_string()
    } else {
        format!("{}$", val)
    }
}

fn matches(pattern: &str, key: &str) -> Result<bool, RunError> {
    let re = Regex::new(&format!("^(?:{})", pattern))
        .map_err(|e| RunError::config(format!("invalid skip pattern '{}': {}", pattern, e)))?;
    Ok(re.is_match(key))
}
