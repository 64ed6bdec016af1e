//! snakelet: request/response correlation engine for a long-lived worker
//! subprocess speaking length-prefixed JSON over stdin/stdout.

pub mod bridge;
pub mod commands;
pub mod config;
pub mod engine;
mod operations;
pub mod pending;
pub mod policy;
pub mod process;
pub mod stats;
pub mod telemetry;
pub mod worker;

pub use bridge::codec::{DecodeError, EncodeError, FrameCodec, decode, encode};
pub use bridge::protocol::{CorrelationId, Inbound, ReplyStatus};
pub use commands::Command;
pub use config::{ConfigError, EngineConfig};
pub use engine::{CallError, ChannelState, Engine};
pub use policy::{
    ApplicationError, BridgePolicy, CommandPolicy, FieldError, PolicyDefaults, ValidationError,
};
pub use process::{
    ExitReason, ProcessSpawner, SpawnError, WorkerCommand, WorkerSpawner, WriteError,
};
pub use stats::StatsSnapshot;
pub use telemetry::init_tracing;
pub use worker::{RequestHandler, serve};
