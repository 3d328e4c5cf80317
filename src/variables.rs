//! Variable sets and deferred value resolution.
//!
//! A variable is deferred when its value is only known inside the job's
//! allocation (node lists, core counts). Deferred variables are stored as
//! JSON `null`. Config strings that reference them are stored with the
//! `!deferred!` prefix until `resolve_deferred` replaces them.

use crate::errors::{RunError, StoreError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

pub const DEFERRED_PREFIX: &str = "!deferred!";

/// Set names searched, in order, for an unqualified `{{name}}` reference.
const LOOKUP_ORDER: &[&str] = &["var", "per", "pav", "sys", "sched"];

static VAR_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_]+)(?:\.([A-Za-z0-9_]+))?\s*\}\}").expect("valid regex")
});

/// True if `value` is a config string still waiting on deferred variables.
pub fn was_deferred(value: &str) -> bool {
    value.starts_with(DEFERRED_PREFIX)
}

/// Mark a config string as deferred.
pub fn defer(template: &str) -> String {
    format!("{}{}", DEFERRED_PREFIX, template)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableSet {
    sets: BTreeMap<String, BTreeMap<String, Option<String>>>,
}

impl VariableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, set: &str, name: &str, value: impl Into<String>) -> &mut Self {
        self.sets
            .entry(set.to_string())
            .or_default()
            .insert(name.to_string(), Some(value.into()));
        self
    }

    pub fn set_deferred(&mut self, set: &str, name: &str) -> &mut Self {
        self.sets
            .entry(set.to_string())
            .or_default()
            .insert(name.to_string(), None);
        self
    }

    /// Look up `set.name`. Deferred and missing variables are both `None`.
    pub fn get(&self, set: &str, name: &str) -> Option<&str> {
        self.sets.get(set)?.get(name)?.as_deref()
    }

    pub fn is_deferred(&self, set: &str, name: &str) -> bool {
        matches!(self.sets.get(set).and_then(|s| s.get(name)), Some(None))
    }

    /// Look up an unqualified name across the sets.
    pub fn find(&self, name: &str) -> Option<&str> {
        LOOKUP_ORDER
            .iter()
            .copied()
            .chain(
                self.sets
                    .keys()
                    .map(String::as_str)
                    .filter(|k| !LOOKUP_ORDER.contains(k)),
            )
            .find_map(|set| self.get(set, name))
    }

    /// All resolved variables of one set, as a JSON object.
    pub fn set_as_json(&self, set: &str) -> Value {
        let map: Map<String, Value> = self
            .sets
            .get(set)
            .map(|vars| {
                vars.iter()
                    .map(|(k, v)| (k.clone(), v.clone().map(Value::String).unwrap_or(Value::Null)))
                    .collect()
            })
            .unwrap_or_default();
        Value::Object(map)
    }

    /// Fill deferred variables from `new_vars`. Variables that already have a
    /// value keep it.
    pub fn undefer(&mut self, new_vars: &VariableSet) {
        for (set, vars) in self.sets.iter_mut() {
            for (name, value) in vars.iter_mut() {
                if value.is_none()
                    && let Some(resolved) = new_vars.get(set, name)
                {
                    *value = Some(resolved.to_string());
                }
            }
        }
    }

    pub fn deferred(&self) -> Vec<String> {
        self.sets
            .iter()
            .flat_map(|(set, vars)| {
                vars.iter()
                    .filter(|(_, v)| v.is_none())
                    .map(move |(name, _)| format!("{}.{}", set, name))
            })
            .collect()
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| StoreError::Config(format!("could not serialize variables: {}", e)))?;
        std::fs::write(path, json).map_err(|e| StoreError::storage(path, e))
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| StoreError::storage(path, e))?;
        serde_json::from_str(&content).map_err(|e| {
            StoreError::Config(format!("could not parse variables at {}: {}", path.display(), e))
        })
    }

    /// Substitute every `{{set.name}}` / `{{name}}` reference in `template`.
    pub fn substitute(&self, template: &str) -> Result<String, RunError> {
        let mut missing = None;
        let out = VAR_REF.replace_all(template, |caps: &regex::Captures| {
            let first = &caps[1];
            let found = match caps.get(2) {
                Some(name) => self.get(first, name.as_str()),
                None => self.find(first),
            };
            match found {
                Some(v) => v.to_string(),
                None => {
                    missing.get_or_insert_with(|| caps[0].to_string());
                    String::new()
                }
            }
        });

        match missing {
            Some(reference) => Err(RunError::config(format!(
                "could not resolve {} in '{}'",
                reference, template
            ))),
            None => Ok(out.into_owned()),
        }
    }
}

/// Resolve every deferred string (keys and values) in a config tree.
pub fn resolve_deferred(
    config: Map<String, Value>,
    vars: &VariableSet,
) -> Result<Map<String, Value>, RunError> {
    config
        .into_iter()
        .map(|(key, value)| Ok((resolve_str(key, vars)?, resolve_value(value, vars)?)))
        .collect()
}

fn resolve_str(s: String, vars: &VariableSet) -> Result<String, RunError> {
    match s.strip_prefix(DEFERRED_PREFIX) {
        Some(template) => vars.substitute(template),
        None => Ok(s),
    }
}

fn resolve_value(value: Value, vars: &VariableSet) -> Result<Value, RunError> {
    Ok(match value {
        Value::String(s) => Value::String(resolve_str(s, vars)?),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| resolve_value(v, vars))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(resolve_deferred(map, vars)?),
        other => other,
    })
}
