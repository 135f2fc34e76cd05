//! Credential templating for resource configuration.
//!
//! Get and Put steps evaluate `((name))` placeholders in their `source` and
//! `params` against a [`Variables`] lookup right before use, so secrets never
//! sit in the plan itself.

use crate::errors::{Result, UndefinedVariablesError};
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

#[allow(clippy::unwrap_used)]
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\(([^()\s]+)\)\)").unwrap());

/// A source of credential values.
#[cfg_attr(test, mockall::automock)]
pub trait Variables: Send + Sync {
    /// Looks up `name`. `Ok(None)` means the variable is not defined.
    fn get(&self, name: &str) -> Result<Option<Value>>;
}

/// Variables held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticVariables {
    values: HashMap<String, Value>,
}

impl StaticVariables {
    /// Creates an empty set of variables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines `name`.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl Variables for StaticVariables {
    fn get(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.values.get(name).cloned())
    }
}

/// Replaces every `((name))` in `template` with its value.
///
/// A string consisting of a single placeholder is replaced by the raw value,
/// so objects and numbers keep their type; placeholders embedded in longer
/// strings are interpolated as text. `((name.field))` reads a field of an
/// object-valued variable. Every undefined name is collected into one error.
pub fn evaluate(template: &Value, vars: &dyn Variables) -> Result<Value> {
    let mut missing = Vec::new();
    let value = evaluate_value(template, vars, &mut missing)?;

    if missing.is_empty() {
        Ok(value)
    } else {
        Err(UndefinedVariablesError { names: missing }.into())
    }
}

fn evaluate_value(template: &Value, vars: &dyn Variables, missing: &mut Vec<String>) -> Result<Value> {
    match template {
        Value::String(s) => evaluate_string(s, vars, missing),
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate_value(item, vars, missing))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), evaluate_value(item, vars, missing)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn evaluate_string(s: &str, vars: &dyn Variables, missing: &mut Vec<String>) -> Result<Value> {
    if let Some(caps) = PLACEHOLDER.captures(s) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(s.len()) {
            let name = &caps[1];
            return Ok(lookup(name, vars, missing)?.unwrap_or_else(|| Value::String(s.to_string())));
        }
    } else {
        return Ok(Value::String(s.to_string()));
    }

    let mut lookup_err = None;
    let replaced = PLACEHOLDER.replace_all(s, |caps: &Captures<'_>| {
        match lookup(&caps[1], vars, missing) {
            Ok(Some(Value::String(text))) => text,
            Ok(Some(other)) => other.to_string(),
            Ok(None) => caps[0].to_string(),
            Err(err) => {
                lookup_err.get_or_insert(err);
                caps[0].to_string()
            }
        }
    });

    match lookup_err {
        Some(err) => Err(err),
        None => Ok(Value::String(replaced.into_owned())),
    }
}

fn lookup(name: &str, vars: &dyn Variables, missing: &mut Vec<String>) -> Result<Option<Value>> {
    let mut segments = name.split('.');
    let head = segments.next().unwrap_or(name);

    let mut value = vars.get(head)?;
    for field in segments {
        value = value.and_then(|v| v.get(field).cloned());
    }

    if value.is_none() && !missing.iter().any(|m| m == name) {
        missing.push(name.to_string());
    }
    Ok(value)
}
