//! Per-command argument schemas.
//!
//! Validates command arguments before anything is written to the worker,
//! catching missing required fields and mistyped fields early with one error
//! per offending field.

use std::collections::HashMap;

use serde_json::{Map, Value, json};

use super::FieldError;
use crate::commands::Command;

/// Compiled validator for one command's arguments.
pub struct ArgsValidator {
    validator: jsonschema::Validator,
    /// Required field names from the schema.
    required: Vec<String>,
}

impl ArgsValidator {
    /// Compile a validator from a JSON Schema object.
    ///
    /// Returns None if the schema does not compile.
    pub fn from_schema(schema: &Value) -> Option<Self> {
        let required: Vec<String> = schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let validator = jsonschema::validator_for(schema)
            .inspect_err(|e| {
                tracing::warn!(error = %e, "Failed to compile argument schema");
            })
            .ok()?;

        Some(Self {
            validator,
            required,
        })
    }

    /// Validate an argument map against the schema.
    pub fn validate(&self, args: &Map<String, Value>) -> Result<(), Vec<FieldError>> {
        let instance = Value::Object(args.clone());
        if self.validator.validate(&instance).is_ok() {
            return Ok(());
        }

        let mut errors = Vec::new();
        let mut seen_required = false;

        for error in self.validator.iter_errors(&instance) {
            let msg = error.to_string();

            // "required" errors: emit one entry per missing field
            if msg.contains("is a required property") {
                if !seen_required {
                    seen_required = true;
                    for field in &self.required {
                        if !args.contains_key(field) {
                            errors.push(FieldError::missing(field));
                        }
                    }
                }
                continue;
            }

            let path = error.instance_path().to_string();
            let field = path.trim_start_matches('/');
            let field_name = if field.is_empty() {
                "__root__".to_string()
            } else {
                field.to_string()
            };
            errors.push(FieldError {
                field: field_name,
                msg,
                error_type: "value_error".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Argument schema for each command.
pub fn command_schema(command: Command) -> Value {
    let program_id = json!({"type": "string", "minLength": 1});
    match command {
        Command::Ping | Command::ListPrograms | Command::ClearSession => json!({
            "type": "object"
        }),
        Command::ConfigureLm => json!({
            "type": "object",
            "properties": {
                "model": {"type": "string", "minLength": 1},
                "api_key": {"type": "string", "minLength": 1},
                "provider": {"type": "string"}
            },
            "required": ["model", "api_key"]
        }),
        Command::CreateProgram => json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "minLength": 1},
                "signature": {
                    "type": "object",
                    "properties": {
                        "inputs": {"type": "array"},
                        "outputs": {"type": "array"}
                    }
                },
                "instructions": {"type": ["string", "null"]},
                "program_type": {"type": "string"}
            },
            "required": ["id", "signature"]
        }),
        Command::ExecuteProgram => json!({
            "type": "object",
            "properties": {
                "program_id": program_id,
                "inputs": {"type": "object"},
                "program_data": {"type": ["object", "null"]}
            },
            "required": ["program_id", "inputs"]
        }),
        Command::GetProgram | Command::DeleteProgram => json!({
            "type": "object",
            "properties": {
                "program_id": program_id
            },
            "required": ["program_id"]
        }),
    }
}

/// Compile validators for every known command.
pub fn compile_all() -> HashMap<Command, ArgsValidator> {
    Command::ALL
        .into_iter()
        .filter_map(|command| {
            let validator = ArgsValidator::from_schema(&command_schema(command));
            if validator.is_none() {
                tracing::error!(%command, "Argument schema did not compile, command will be unchecked");
            }
            validator.map(|v| (command, v))
        })
        .collect()
}
