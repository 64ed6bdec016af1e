//! Worker side of the protocol.
//!
//! Reads request frames, runs a [`RequestHandler`] for each one concurrently
//! and writes a response frame as each finishes, in whatever order that is.

use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite, stdin, stdout};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{self, FrameCodec};
use crate::bridge::protocol::{RequestFrame, ResponseFrame};

/// Executes commands on behalf of the engine.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Run one command. `Err` becomes a `success: false` response.
    async fn handle(&self, command: &str, args: Map<String, Value>) -> Result<Value, String>;
}

type ResponseWriter<W> = Arc<Mutex<FramedWrite<W, FrameCodec>>>;

/// Serve requests from `reader` until it reaches EOF.
///
/// Malformed requests are logged and skipped. Handlers still running at EOF
/// are aborted.
pub async fn serve<R, W, H>(reader: R, writer: W, handler: Arc<H>) -> io::Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
    H: RequestHandler,
{
    let mut requests = FramedRead::new(reader, FrameCodec::new());
    let writer: ResponseWriter<W> = Arc::new(Mutex::new(FramedWrite::new(writer, FrameCodec::new())));
    let mut in_flight = JoinSet::new();

    let result = loop {
        tokio::select! {
            frame = requests.next() => match frame {
                Some(Ok(frame)) => match codec::decode_request(&frame) {
                    Ok(request) => {
                        tracing::trace!(id = %request.id, command = %request.command, "Request received");
                        in_flight.spawn(run_request(request, Arc::clone(&handler), Arc::clone(&writer)));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, frame_bytes = frame.len(), "Skipping malformed request");
                    }
                },
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Request stream failed");
                    break Err(e);
                }
                None => {
                    tracing::debug!("Request stream closed");
                    break Ok(());
                }
            },

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    tracing::error!(error = %e, "Request handler panicked");
                }
            }
        }
    };

    if !in_flight.is_empty() {
        tracing::debug!(in_flight = in_flight.len(), "Aborting unfinished requests");
    }
    in_flight.shutdown().await;
    result
}

/// Serve requests over this process's stdin/stdout.
pub async fn serve_stdio<H: RequestHandler>(handler: Arc<H>) -> io::Result<()> {
    tracing::info!("Worker serving on stdio");
    serve(stdin(), stdout(), handler).await
}

async fn run_request<W, H>(request: RequestFrame, handler: Arc<H>, writer: ResponseWriter<W>)
where
    W: AsyncWrite + Send + Unpin,
    H: RequestHandler,
{
    let RequestFrame { id, command, args } = request;
    let response = match handler.handle(&command, args).await {
        Ok(result) => ResponseFrame::success(id, result),
        Err(error) => {
            tracing::debug!(%id, %command, %error, "Request failed");
            ResponseFrame::failure(id, error)
        }
    }
    .with_timestamp(unix_now());

    let frame = match codec::encode_response(&response) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(%id, %command, error = %e, "Failed to encode response");
            match codec::encode_response(
                &ResponseFrame::failure(id, format!("failed to encode response: {e}"))
                    .with_timestamp(unix_now()),
            ) {
                Ok(frame) => frame,
                Err(_) => return,
            }
        }
    };

    let mut w = writer.lock().await;
    if let Err(e) = w.send(frame).await {
        tracing::warn!(%id, error = %e, "Failed to write response");
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
