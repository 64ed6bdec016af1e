//! Typed wrappers for the worker's command set.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::commands::{
    ClearSessionReply, Command, ConfigureLmArgs, ConfigureLmReply, CreateProgramArgs,
    CreateProgramReply, DeleteProgramReply, ExecuteProgramArgs, ExecuteProgramReply,
    ListProgramsReply, NoArgs, PingReply, ProgramInfo, ProgramRef,
};
use crate::engine::{CallError, Engine};

impl Engine {
    /// Call `command` with serialisable arguments and parse the reply.
    ///
    /// `timeout` falls back to the engine default.
    pub async fn call_typed<A, R>(
        &self,
        command: Command,
        args: &A,
        timeout: Option<Duration>,
    ) -> Result<R, CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = match serde_json::to_value(args) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(CallError::Encode(format!(
                    "arguments for `{command}` must be an object, got {other}"
                )));
            }
            Err(e) => return Err(CallError::Encode(e.to_string())),
        };

        let raw = self
            .call(
                command.as_str(),
                args,
                timeout.unwrap_or(self.default_timeout()),
            )
            .await?;

        serde_json::from_value(raw).map_err(|e| CallError::UnexpectedReply {
            command: command.to_string(),
            reason: e.to_string(),
        })
    }

    pub async fn ping(&self) -> Result<PingReply, CallError> {
        self.call_typed(Command::Ping, &NoArgs {}, None).await
    }

    pub async fn configure_lm(&self, args: &ConfigureLmArgs) -> Result<ConfigureLmReply, CallError> {
        self.call_typed(Command::ConfigureLm, args, None).await
    }

    pub async fn create_program(
        &self,
        args: &CreateProgramArgs,
    ) -> Result<CreateProgramReply, CallError> {
        self.call_typed(Command::CreateProgram, args, None).await
    }

    pub async fn execute_program(
        &self,
        args: &ExecuteProgramArgs,
    ) -> Result<ExecuteProgramReply, CallError> {
        self.call_typed(Command::ExecuteProgram, args, None).await
    }

    pub async fn get_program(&self, program_id: &str) -> Result<ProgramInfo, CallError> {
        self.call_typed(Command::GetProgram, &ProgramRef::new(program_id), None)
            .await
    }

    pub async fn list_programs(&self) -> Result<ListProgramsReply, CallError> {
        self.call_typed(Command::ListPrograms, &NoArgs {}, None).await
    }

    pub async fn delete_program(&self, program_id: &str) -> Result<DeleteProgramReply, CallError> {
        self.call_typed(Command::DeleteProgram, &ProgramRef::new(program_id), None)
            .await
    }

    pub async fn clear_session(&self) -> Result<ClearSessionReply, CallError> {
        self.call_typed(Command::ClearSession, &NoArgs {}, None).await
    }
}
