//! Length-prefixed JSON framing.
//!
//! Every frame is a 4-byte big-endian body length followed by a JSON body.
//! `encode`/`decode` are pure functions over whole frames; `FrameCodec`
//! delimits whole frames out of a byte stream for FramedRead/FramedWrite.

use std::io;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{CorrelationId, Inbound, RequestFrame, ResponseFrame};

/// Size of the big-endian length header.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Default upper bound for a single frame, header included.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("failed to serialize frame body: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("frame body of {0} bytes exceeds the 4-byte length prefix")]
    TooLarge(usize),
}

/// Malformed inbound frame. Returned as a value, never raised.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame shorter than its 4-byte length prefix ({0} bytes)")]
    MissingPrefix(usize),
    #[error("truncated frame: prefix declares {declared} bytes, body has {actual}")]
    Truncated { declared: usize, actual: usize },
    #[error("frame has {extra} trailing bytes after the declared {declared}-byte body")]
    TrailingBytes { declared: usize, extra: usize },
    #[error("malformed frame body: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid response shape: {0}")]
    InvalidShape(String),
}

/// Encode a request into a complete frame.
pub fn encode(
    id: CorrelationId,
    command: &str,
    args: &Map<String, Value>,
) -> Result<Bytes, EncodeError> {
    let request = RequestFrame {
        id,
        command: command.to_string(),
        args: args.clone(),
    };
    encode_body(&request)
}

/// Encode a worker response into a complete frame.
pub fn encode_response(response: &ResponseFrame) -> Result<Bytes, EncodeError> {
    encode_body(response)
}

fn encode_body<T: serde::Serialize>(item: &T) -> Result<Bytes, EncodeError> {
    let json = serde_json::to_vec(item)?;
    let json_len = json.len();
    let prefix = u32::try_from(json_len).map_err(|_| EncodeError::TooLarge(json_len))?;

    tracing::trace!(json_size_bytes = json_len, "Encoding frame");
    if json_len > 100_000 {
        tracing::info!(
            json_size_bytes = json_len,
            json_size_kb = json_len / 1024,
            "Large frame being encoded"
        );
    }

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + json_len);
    frame.put_u32(prefix);
    frame.extend_from_slice(&json);
    Ok(frame.freeze())
}

/// Decode a complete response frame (length prefix included).
pub fn decode(frame: &[u8]) -> Result<Inbound, DecodeError> {
    let response: ResponseFrame = decode_body(frame)?;
    if response.success {
        let payload = response.result.ok_or_else(|| {
            DecodeError::InvalidShape(format!(
                "response {} has success=true but no result",
                response.id
            ))
        })?;
        Ok(Inbound::Success {
            id: response.id,
            payload,
        })
    } else {
        let error = response
            .error
            .unwrap_or_else(|| Value::String("unknown worker error".to_string()));
        Ok(Inbound::Failure {
            id: response.id,
            error,
        })
    }
}

/// Decode a complete request frame (worker side).
pub fn decode_request(frame: &[u8]) -> Result<RequestFrame, DecodeError> {
    decode_body(frame)
}

fn decode_body<T: DeserializeOwned>(frame: &[u8]) -> Result<T, DecodeError> {
    let (prefix, body) = frame
        .split_first_chunk::<LENGTH_PREFIX_BYTES>()
        .ok_or(DecodeError::MissingPrefix(frame.len()))?;
    let declared = u32::from_be_bytes(*prefix) as usize;
    let actual = body.len();
    if actual < declared {
        return Err(DecodeError::Truncated { declared, actual });
    }
    if actual > declared {
        return Err(DecodeError::TrailingBytes {
            declared,
            extra: actual - declared,
        });
    }
    Ok(serde_json::from_slice(body)?)
}

/// Stream codec yielding whole frames, length prefix included.
///
/// Decoding buffers partial input until a full frame is available. Encoding
/// writes frames produced by [`encode`] verbatim.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_PREFIX_BYTES)
                .length_adjustment(LENGTH_PREFIX_BYTES as isize)
                .num_skip(0)
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode(src)?.map(BytesMut::freeze))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.len() < LENGTH_PREFIX_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame is missing its length prefix",
            ));
        }
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
