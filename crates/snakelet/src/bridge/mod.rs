//! Wire layer between the engine and its worker process.
//!
//! # Architecture
//!
//! - **protocol**: Frame types (RequestFrame, ResponseFrame, Inbound, CorrelationId)
//! - **codec**: Length-prefixed JSON encoding plus a stream codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
