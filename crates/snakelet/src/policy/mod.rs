//! Per-command validation and post-processing.
//!
//! A [`CommandPolicy`] runs on both sides of a call:
//! - **validate**: reject bad arguments before a correlation id is allocated
//! - **prepare**: canonicalise keys and merge configured defaults
//! - **transform**: turn a worker's `status: "error"` reply into a failure
//!
//! All three are pure. They never see the channel or the pending table.

pub mod schema;

use std::collections::HashMap;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::commands::Command;
use schema::ArgsValidator;

/// A single offending argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Argument name, or a `/`-joined path for nested fields.
    pub field: String,
    pub msg: String,
    /// Error type string (e.g. "value_error.missing").
    pub error_type: String,
}

impl FieldError {
    pub fn missing(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            msg: "Field required".to_string(),
            error_type: "value_error.missing".to_string(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.msg)
    }
}

/// Arguments rejected before anything was sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unsupported command `{command}` (supported: {})", .supported.join(", "))]
    UnsupportedCommand {
        command: String,
        supported: Vec<&'static str>,
    },
    #[error("invalid arguments for `{command}`: {}", join_fields(.fields))]
    InvalidArguments {
        command: String,
        fields: Vec<FieldError>,
    },
}

fn join_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// The worker answered, but reported an application-level failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("`{command}` failed: {message}")]
pub struct ApplicationError {
    pub command: String,
    pub message: String,
    /// The raw reply, for callers that need more than the message.
    pub details: Value,
}

/// Pluggable per-command validation and post-processing.
pub trait CommandPolicy: Send + Sync {
    fn validate(&self, command: &str, args: &Map<String, Value>) -> Result<(), ValidationError>;

    fn prepare(&self, command: &str, args: Map<String, Value>) -> Map<String, Value>;

    fn transform(&self, command: &str, raw: Value) -> Result<Value, ApplicationError>;
}

/// Defaults merged into arguments by `prepare`.
///
/// Precedence: caller value, then per-command default, then global default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyDefaults {
    pub global: Map<String, Value>,
    pub per_command: HashMap<Command, Map<String, Value>>,
}

impl PolicyDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global(mut self, key: impl Into<String>, value: Value) -> Self {
        self.global.insert(key.into(), value);
        self
    }

    pub fn with_command_default(
        mut self,
        command: Command,
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        self.per_command
            .entry(command)
            .or_default()
            .insert(key.into(), value);
        self
    }
}

/// Policy for the worker's command set.
pub struct BridgePolicy {
    validators: HashMap<Command, ArgsValidator>,
    defaults: PolicyDefaults,
}

impl Default for BridgePolicy {
    fn default() -> Self {
        Self::new(PolicyDefaults::default())
    }
}

impl BridgePolicy {
    pub fn new(defaults: PolicyDefaults) -> Self {
        Self {
            validators: schema::compile_all(),
            defaults,
        }
    }
}

impl CommandPolicy for BridgePolicy {
    fn validate(&self, command: &str, args: &Map<String, Value>) -> Result<(), ValidationError> {
        let known = Command::from_str(command).map_err(|_| ValidationError::UnsupportedCommand {
            command: command.to_string(),
            supported: Command::names(),
        })?;

        let Some(validator) = self.validators.get(&known) else {
            return Ok(());
        };

        let canonical = canonicalize_keys(args.clone());
        validator
            .validate(&canonical)
            .map_err(|fields| ValidationError::InvalidArguments {
                command: command.to_string(),
                fields,
            })
    }

    fn prepare(&self, command: &str, args: Map<String, Value>) -> Map<String, Value> {
        let mut prepared = canonicalize_keys(args);

        if let Ok(known) = Command::from_str(command)
            && let Some(defaults) = self.defaults.per_command.get(&known)
        {
            merge_missing(&mut prepared, defaults);
        }
        merge_missing(&mut prepared, &self.defaults.global);

        prepared
    }

    fn transform(&self, command: &str, raw: Value) -> Result<Value, ApplicationError> {
        if Command::from_str(command).is_err() {
            return Ok(raw);
        }

        match raw.get("status").and_then(Value::as_str) {
            Some("error") => {
                let message = raw
                    .get("error")
                    .or_else(|| raw.get("message"))
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| "worker reported an error".to_string());
                Err(ApplicationError {
                    command: command.to_string(),
                    message,
                    details: raw,
                })
            }
            _ => Ok(raw),
        }
    }
}

fn merge_missing(target: &mut Map<String, Value>, defaults: &Map<String, Value>) {
    for (key, value) in defaults {
        if !target.contains_key(key) {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Rewrite top-level keys to snake_case.
///
/// When an alias and the canonical spelling are both present, the canonical
/// spelling wins regardless of order.
pub fn canonicalize_keys(args: Map<String, Value>) -> Map<String, Value> {
    let mut canonical = Map::with_capacity(args.len());
    for (key, value) in args {
        let normalized = canonical_key(&key);
        if normalized == key {
            canonical.insert(normalized, value);
        } else if !canonical.contains_key(&normalized) {
            canonical.insert(normalized, value);
        } else {
            tracing::debug!(alias = %key, key = %normalized, "Dropping argument alias shadowed by canonical key");
        }
    }
    canonical
}

/// `programId`, `program-id`, ` Program_ID ` all become `program_id`.
pub fn canonical_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev: Option<char> = None;
    for c in key.trim().chars() {
        if c == '-' || c == ' ' || c == '_' {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
        } else if c.is_uppercase() {
            if prev.is_some_and(|p| p.is_lowercase() || p.is_ascii_digit()) && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
        prev = Some(c);
    }
    out
}
