//! Caller-facing command set and its argument/reply contracts.
//!
//! Inner contents the engine never interprets (signatures, program inputs
//! and outputs, program data) stay as `serde_json::Value`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bridge::protocol::ReplyStatus;

/// Commands understood by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Ping,
    ConfigureLm,
    CreateProgram,
    ExecuteProgram,
    GetProgram,
    ListPrograms,
    DeleteProgram,
    ClearSession,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::Ping,
        Command::ConfigureLm,
        Command::CreateProgram,
        Command::ExecuteProgram,
        Command::GetProgram,
        Command::ListPrograms,
        Command::DeleteProgram,
        Command::ClearSession,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::ConfigureLm => "configure_lm",
            Self::CreateProgram => "create_program",
            Self::ExecuteProgram => "execute_program",
            Self::GetProgram => "get_program",
            Self::ListPrograms => "list_programs",
            Self::DeleteProgram => "delete_program",
            Self::ClearSession => "clear_session",
        }
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(Command::as_str).collect()
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command `{0}`")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|command| command.as_str() == s)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

/// Arguments for commands that take none.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NoArgs {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureLmArgs {
    pub model: String,
    pub api_key: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Provider-specific options forwarded as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_provider() -> String {
    "google".to_string()
}

impl ConfigureLmArgs {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            api_key: api_key.into(),
            provider: default_provider(),
            extra: Map::new(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProgramArgs {
    pub id: String,
    /// `{"inputs": [...], "outputs": [...]}` field definitions.
    pub signature: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteProgramArgs {
    pub program_id: String,
    pub inputs: Map<String, Value>,
    /// Serialized program definition for workers that did not create it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramRef {
    pub program_id: String,
}

impl ProgramRef {
    pub fn new(program_id: impl Into<String>) -> Self {
        Self {
            program_id: program_id.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingReply {
    #[serde(default)]
    pub status: Option<ReplyStatus>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigureLmReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProgramReply {
    pub status: ReplyStatus,
    pub program_id: String,
    #[serde(default)]
    pub signature_def: Option<Value>,
    #[serde(default)]
    pub program_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteProgramReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub program_id: Option<String>,
    #[serde(default)]
    pub execution_count: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramInfo {
    pub status: ReplyStatus,
    pub program_id: String,
    #[serde(default)]
    pub signature_def: Option<Value>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub program_type: Option<String>,
    #[serde(default)]
    pub created_at: Option<f64>,
    #[serde(default)]
    pub execution_count: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramSummary {
    pub program_id: String,
    #[serde(default)]
    pub program_type: Option<String>,
    #[serde(default)]
    pub created_at: Option<f64>,
    #[serde(default)]
    pub execution_count: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListProgramsReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub programs: Vec<ProgramSummary>,
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteProgramReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub program_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClearSessionReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub count: Option<usize>,
}
