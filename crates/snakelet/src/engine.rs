//! Correlation engine: many concurrent calls over one worker channel.
//!
//! Each call gets its own correlation id and its own deadline. A background
//! reader routes response frames back to the waiting caller by id, so replies
//! may arrive in any order. Three events can end a call:
//!
//! - a response frame ([`Engine::on_frame_received`])
//! - its deadline ([`Engine::on_timeout`])
//! - channel death ([`Engine::on_channel_exited`])
//!
//! All three resolve a call only after removing it from the pending table,
//! and removal succeeds once, so whichever event gets there first wins.

use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bridge::codec::{self, FrameCodec};
use crate::bridge::protocol::{CorrelationId, Inbound};
use crate::config::EngineConfig;
use crate::pending::{CallResult, CorrelationIds, PendingGuard, PendingTable};
use crate::policy::{ApplicationError, CommandPolicy, ValidationError};
use crate::process::{
    ChannelWriter, ExitReason, SpawnError, SpawnedWorker, forward_stderr, spawn_worker, supervise,
};
use crate::stats::{EngineStats, StatsSnapshot};

/// Every way a call can fail.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("failed to encode request: {0}")]
    Encode(String),
    #[error("failed to write request: {0}")]
    Write(String),
    #[error("request {id} timed out after {}ms", .timeout.as_millis())]
    Timeout { id: CorrelationId, timeout: Duration },
    #[error("channel exited while request was pending: {0}")]
    ChannelExited(ExitReason),
    #[error("channel not available: {0}")]
    ChannelNotAvailable(ExitReason),
    #[error(transparent)]
    Application(#[from] ApplicationError),
    #[error("worker failed `{command}`: {message}")]
    Remote { command: String, message: String },
    #[error("unexpected reply to `{command}`: {reason}")]
    UnexpectedReply { command: String, reason: String },
}

impl CallError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True if the engine can no longer serve calls.
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            Self::ChannelExited(_) | Self::ChannelNotAvailable(_) | Self::Write(_)
        )
    }
}

/// Liveness of the worker channel as observed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Alive,
    Exited(ExitReason),
}

impl ChannelState {
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive)
    }
}

pub struct Engine {
    instance_id: Uuid,
    policy: Arc<dyn CommandPolicy>,
    default_timeout: Duration,
    ids: CorrelationIds,
    pending: PendingTable,
    writer: ChannelWriter,
    state: watch::Sender<ChannelState>,
    pid: Option<u32>,
    /// Set when a supervisor owns a child process.
    exit_grace: Option<Duration>,
    shutdown: CancellationToken,
    monitor: StdMutex<Option<JoinHandle<()>>>,
    stderr_pump: StdMutex<Option<JoinHandle<()>>>,
    stats: EngineStats,
}

impl Engine {
    /// Start the configured worker and an engine bound to its stdio.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: EngineConfig) -> Result<Arc<Self>, SpawnError> {
        let command = config
            .worker
            .as_ref()
            .ok_or_else(|| SpawnError::Other("no worker command configured".to_string()))?;
        let SpawnedWorker {
            child,
            pid,
            stdin,
            stdout,
            stderr,
        } = spawn_worker(config.spawner.as_ref(), command)?;

        let engine = Arc::new(Self::build(
            &config,
            stdin,
            pid,
            Some(config.shutdown_grace),
        ));
        engine.start_reader(stdout, config.max_frame_length);
        if let Some(stderr) = stderr {
            *engine
                .stderr_pump
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(forward_stderr(stderr, pid));
        }

        let weak = Arc::downgrade(&engine);
        let shutdown = engine.shutdown.clone();
        let grace = config.shutdown_grace;
        let monitor = tokio::spawn(async move {
            let reason = supervise(child, shutdown, grace).await;
            match weak.upgrade() {
                Some(engine) => engine.on_channel_exited(reason),
                None => tracing::debug!(%reason, "Worker exited after engine was dropped"),
            }
        });
        *engine
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(monitor);

        tracing::info!(engine = %engine.instance_id, ?pid, "Engine started");
        Ok(engine)
    }

    /// Run an engine over an existing byte stream pair.
    ///
    /// `config.worker`, `config.spawner` and `config.shutdown_grace` are not
    /// used. Must be called from within a tokio runtime.
    pub fn from_channel<R, W>(reader: R, writer: W, config: EngineConfig) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let engine = Arc::new(Self::build(&config, writer, None, None));
        engine.start_reader(reader, config.max_frame_length);
        tracing::debug!(engine = %engine.instance_id, "Engine attached to channel");
        engine
    }

    fn build<W>(
        config: &EngineConfig,
        writer: W,
        pid: Option<u32>,
        exit_grace: Option<Duration>,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (state, _) = watch::channel(ChannelState::Alive);
        let shutdown = CancellationToken::new();
        Self {
            instance_id: Uuid::new_v4(),
            policy: Arc::clone(&config.policy),
            default_timeout: config.default_timeout,
            ids: CorrelationIds::new(),
            pending: PendingTable::new(),
            writer: ChannelWriter::new(writer, shutdown.child_token()),
            state,
            pid,
            exit_grace,
            shutdown,
            monitor: StdMutex::new(None),
            stderr_pump: StdMutex::new(None),
            stats: EngineStats::default(),
        }
    }

    fn start_reader<R>(self: &Arc<Self>, reader: R, max_frame_length: usize)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let frames = FramedRead::new(reader, FrameCodec::with_max_frame_length(max_frame_length));
        tokio::spawn(read_loop(
            Arc::downgrade(self),
            frames,
            self.shutdown.clone(),
        ));
    }

    /// Send `command` and wait for its resolution.
    ///
    /// Validation failures return before an id is allocated or anything is
    /// written. `timeout` covers the write as well as the wait for a reply.
    /// Dropping the returned future abandons the call and frees its pending
    /// entry.
    pub async fn call(
        &self,
        command: &str,
        args: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        self.policy.validate(command, &args)?;

        if let Some(reason) = self.pending.closed_reason() {
            return Err(CallError::ChannelNotAvailable(reason.clone()));
        }

        let args = self.policy.prepare(command, args);
        let id = self.ids.next_id();
        let frame =
            codec::encode(id, command, &args).map_err(|e| CallError::Encode(e.to_string()))?;
        let deadline = Instant::now() + timeout;

        // Registered before the write so a fast reply always finds its entry.
        let mut waiter = self
            .pending
            .register(id, command, timeout)
            .map_err(CallError::ChannelNotAvailable)?;
        let _guard = PendingGuard::new(&self.pending, id);

        tracing::debug!(
            target: "snakelet::request",
            engine = %self.instance_id,
            %id,
            command,
            frame_bytes = frame.len(),
            "Sending request"
        );

        let sent = tokio::time::timeout_at(deadline, self.writer.send(frame)).await;
        match sent {
            Ok(Ok(())) => self.stats.record_sent(),
            Ok(Err(e)) => {
                if self.pending.take(id).is_none() {
                    // Resolved by a channel exit while the write was pending.
                    return self.settle(waiter.await);
                }
                self.stats.record_failed();
                tracing::warn!(target: "snakelet::request", %id, command, error = %e, "Request write failed");
                return Err(CallError::Write(e.to_string()));
            }
            Err(_) => {
                self.on_timeout(id);
                if self.writer.is_closed() {
                    self.on_input_stalled();
                }
                return self.settle(waiter.await);
            }
        }

        let delivered = match tokio::time::timeout_at(deadline, &mut waiter).await {
            Ok(delivered) => delivered,
            Err(_) => {
                self.on_timeout(id);
                waiter.await
            }
        };
        self.settle(delivered)
    }

    fn settle(&self, delivered: Result<CallResult, oneshot::error::RecvError>) -> CallResult {
        delivered.unwrap_or_else(|_| {
            // Only reachable if an entry is dropped without resolution.
            Err(CallError::ChannelNotAvailable(
                self.exit_reason().unwrap_or(ExitReason::Closed),
            ))
        })
    }

    /// [`call`](Self::call) with the configured default timeout.
    pub async fn call_default(
        &self,
        command: &str,
        args: Map<String, Value>,
    ) -> Result<Value, CallError> {
        self.call(command, args, self.default_timeout).await
    }

    /// Route one complete inbound frame to its waiting caller.
    ///
    /// Malformed frames and frames for ids that are no longer pending are
    /// logged, counted and dropped.
    pub fn on_frame_received(&self, frame: &[u8]) {
        let inbound = match codec::decode(frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.stats.record_decode_error();
                tracing::warn!(
                    engine = %self.instance_id,
                    frame_bytes = frame.len(),
                    error = %e,
                    "Discarding malformed frame"
                );
                return;
            }
        };

        let id = inbound.id();
        let Some(entry) = self.pending.take(id) else {
            self.stats.record_stale();
            tracing::debug!(
                target: "snakelet::request",
                engine = %self.instance_id,
                %id,
                "Discarding response for unknown or already-resolved request"
            );
            return;
        };

        let result = match inbound {
            Inbound::Success { payload, .. } => self
                .policy
                .transform(&entry.command, payload)
                .map_err(CallError::from),
            Inbound::Failure { error, .. } => Err(CallError::Remote {
                command: entry.command.clone(),
                message: error_message(error),
            }),
        };

        match &result {
            Ok(_) => self.stats.record_succeeded(),
            Err(_) => self.stats.record_failed(),
        }
        tracing::debug!(
            target: "snakelet::request",
            %id,
            command = %entry.command,
            ok = result.is_ok(),
            elapsed_ms = entry.elapsed().as_millis() as u64,
            "Request resolved"
        );
        entry.resolve(id, result);
    }

    /// Fail `id` with a timeout if it is still pending. No-op otherwise.
    pub fn on_timeout(&self, id: CorrelationId) {
        let Some(entry) = self.pending.take(id) else {
            tracing::trace!(target: "snakelet::request", %id, "Timeout lost the race to a response");
            return;
        };
        self.stats.record_timed_out();
        tracing::warn!(
            target: "snakelet::request",
            engine = %self.instance_id,
            %id,
            command = %entry.command,
            timeout_ms = entry.timeout.as_millis() as u64,
            "Request timed out"
        );
        let timeout = entry.timeout;
        entry.resolve(id, Err(CallError::Timeout { id, timeout }));
    }

    /// Fail every pending call and refuse new ones. Only the first reason
    /// sticks.
    pub fn on_channel_exited(&self, reason: ExitReason) {
        let Some(drained) = self.pending.close(reason.clone()) else {
            tracing::trace!(%reason, "Channel exit already handled");
            return;
        };
        self.state.send_replace(ChannelState::Exited(reason.clone()));

        if drained.is_empty() {
            tracing::info!(engine = %self.instance_id, %reason, "Channel exited");
        } else {
            tracing::warn!(
                engine = %self.instance_id,
                %reason,
                pending = drained.len(),
                "Channel exited, failing pending requests"
            );
        }

        self.stats.record_failed_many(drained.len());
        for (id, entry) in drained {
            entry.resolve(id, Err(CallError::ChannelExited(reason.clone())));
        }
    }

    /// A write ran out of time part way through a frame. The input stream
    /// can no longer be resynchronised, so the channel is finished and the
    /// worker is stopped.
    fn on_input_stalled(&self) {
        tracing::error!(engine = %self.instance_id, "Worker stopped reading its input");
        self.on_channel_exited(ExitReason::InputStalled);
        self.shutdown.cancel();
    }

    /// The worker's output stream ended or broke.
    ///
    /// With a supervised child, give the supervisor a moment to report the
    /// real exit status first.
    async fn on_output_closed(&self) {
        if let Some(grace) = self.exit_grace {
            let mut state = self.state.subscribe();
            let exited = tokio::time::timeout(grace, state.wait_for(|s| !s.is_alive()))
                .await
                .is_ok();
            if !exited {
                tracing::debug!(engine = %self.instance_id, "Worker output closed but process still running");
            }
        }
        self.on_channel_exited(ExitReason::ChannelClosed);
    }

    /// Fail pending calls, close the worker's input, stop the supervisor and
    /// drain the stderr forwarder. Idempotent.
    pub async fn close(&self) {
        self.on_channel_exited(ExitReason::Closed);
        self.writer.close().await;
        self.shutdown.cancel();

        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor
            && let Err(e) = monitor.await
        {
            tracing::warn!(engine = %self.instance_id, error = %e, "Supervisor task failed");
        }

        let pump = self
            .stderr_pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            // The pipe normally hits EOF once the child is reaped.
            let abort = pump.abort_handle();
            let grace = self.exit_grace.unwrap_or_default();
            if tokio::time::timeout(grace, pump).await.is_err() {
                tracing::debug!(engine = %self.instance_id, "Worker stderr still open, abandoning forwarder");
                abort.abort();
            }
        }
    }

    /// Wait until the channel is no longer usable.
    pub async fn closed(&self) -> ExitReason {
        let mut state = self.state.subscribe();
        let result = state.wait_for(|s| !s.is_alive()).await;
        match result.as_deref() {
            Ok(ChannelState::Exited(reason)) => reason.clone(),
            _ => ExitReason::Closed,
        }
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.pending.closed_reason().cloned()
    }

    pub fn is_alive(&self) -> bool {
        self.state.borrow().is_alive()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn read_loop<R>(
    engine: Weak<Engine>,
    mut frames: FramedRead<R, FrameCodec>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = frames.next() => next,
        };

        let Some(engine) = engine.upgrade() else {
            return;
        };

        match next {
            Some(Ok(frame)) => engine.on_frame_received(&frame),
            Some(Err(e)) => {
                tracing::error!(engine = %engine.instance_id, error = %e, "Worker output stream failed");
                engine.on_output_closed().await;
                return;
            }
            None => {
                tracing::debug!(engine = %engine.instance_id, "Worker output reached EOF");
                engine.on_output_closed().await;
                return;
            }
        }
    }
}

fn error_message(error: Value) -> String {
    match error {
        Value::String(s) => s,
        Value::Object(ref map) => map
            .get("message")
            .or_else(|| map.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::SinkExt;
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio_util::bytes::{BufMut, Bytes, BytesMut};
    use tokio_util::codec::FramedWrite;

    use crate::bridge::protocol::{RequestFrame, ResponseFrame};
    use crate::worker::{self, RequestHandler};

    const LONG: Duration = Duration::from_secs(5);

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(LONG, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Fake worker backed by [`worker::serve`].
    struct FakeWorker {
        seen: AtomicUsize,
    }

    impl FakeWorker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RequestHandler for FakeWorker {
        async fn handle(&self, command: &str, args: Map<String, Value>) -> Result<Value, String> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            match command {
                "configure_lm" => Ok(json!({
                    "status": "ok",
                    "message": "configured",
                    "model": args.get("model"),
                    "provider": args.get("provider"),
                })),
                "execute_program" => {
                    let delay = args
                        .get("inputs")
                        .and_then(|i| i.get("delay_ms"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(json!({"status": "ok", "outputs": args.get("inputs")}))
                }
                "get_program" => Ok(json!({
                    "status": "error",
                    "error": format!("Program '{}' not found", args["program_id"].as_str().unwrap_or("")),
                })),
                "delete_program" => Err("boom".to_string()),
                "list_programs" => std::future::pending().await,
                _ => Ok(json!({"status": "ok"})),
            }
        }
    }

    fn engine_with_worker(handler: Arc<FakeWorker>, config: EngineConfig) -> Arc<Engine> {
        let (engine_io, worker_io) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker_io);
        tokio::spawn(worker::serve(worker_read, worker_write, handler));
        let (read, write) = tokio::io::split(engine_io);
        Engine::from_channel(read, write, config)
    }

    /// Worker side driven by hand, one frame at a time.
    struct RawWorker {
        reader: FramedRead<ReadHalf<DuplexStream>, FrameCodec>,
        writer: FramedWrite<WriteHalf<DuplexStream>, FrameCodec>,
    }

    impl RawWorker {
        async fn next_request(&mut self) -> RequestFrame {
            let frame = self.reader.next().await.unwrap().unwrap();
            codec::decode_request(&frame).unwrap()
        }

        async fn reply(&mut self, response: ResponseFrame) {
            let frame = codec::encode_response(&response).unwrap();
            self.writer.send(frame).await.unwrap();
        }

        async fn send_raw(&mut self, frame: Bytes) {
            self.writer.send(frame).await.unwrap();
        }
    }

    fn engine_with_raw(config: EngineConfig) -> (Arc<Engine>, RawWorker) {
        let (engine_io, worker_io) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker_io);
        let (read, write) = tokio::io::split(engine_io);
        let engine = Engine::from_channel(read, write, config);
        let raw = RawWorker {
            reader: FramedRead::new(worker_read, FrameCodec::new()),
            writer: FramedWrite::new(worker_write, FrameCodec::new()),
        };
        (engine, raw)
    }

    #[tokio::test]
    async fn configure_lm_resolves_first_id() {
        let (engine, mut raw) = engine_with_raw(EngineConfig::default());

        let call = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move {
                engine
                    .call(
                        "configure_lm",
                        args(json!({"model": "m", "api_key": "k", "provider": "p"})),
                        Duration::from_millis(30_000),
                    )
                    .await
            }
        });

        let request = raw.next_request().await;
        assert_eq!(request.id, CorrelationId::new(1));
        assert_eq!(request.command, "configure_lm");
        assert_eq!(request.args["provider"], json!("p"));
        raw.reply(ResponseFrame::success(
            request.id,
            json!({"status": "ok", "message": "configured"}),
        ))
        .await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["message"], json!("configured"));
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_the_channel() {
        let (engine, mut raw) = engine_with_raw(EngineConfig::default());

        let err = engine
            .call(
                "execute_program",
                args(json!({"program_id": "x"})),
                Duration::from_millis(5000),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::Validation(ValidationError::InvalidArguments { .. })
        ));
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.stats().sent, 0);

        // The next frame on the wire is the next valid call, and it got id 1.
        let call = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.call("ping", Map::new(), LONG).await }
        });
        let request = raw.next_request().await;
        assert_eq!(request.command, "ping");
        assert_eq!(request.id, CorrelationId::new(1));
        raw.reply(ResponseFrame::success(request.id, json!({"status": "ok"})))
            .await;
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unsupported_command_is_rejected_locally() {
        let worker = FakeWorker::new();
        let engine = engine_with_worker(Arc::clone(&worker), EngineConfig::default());
        let err = engine
            .call("train", Map::new(), LONG)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::Validation(ValidationError::UnsupportedCommand { .. })
        ));
        assert_eq!(worker.seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let (engine, mut raw) = engine_with_raw(EngineConfig::default());

        let err = engine
            .call("ping", Map::new(), Duration::from_millis(100))
            .await
            .unwrap_err();
        match err {
            CallError::Timeout { id, timeout } => {
                assert_eq!(id, CorrelationId::new(1));
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.stats().timed_out, 1);

        // The request did go out.
        assert_eq!(raw.next_request().await.id, CorrelationId::new(1));
    }

    #[tokio::test]
    async fn late_frame_after_timeout_is_discarded() {
        let (engine, mut raw) = engine_with_raw(EngineConfig::default());

        let err = engine
            .call("ping", Map::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let request = raw.next_request().await;
        raw.reply(ResponseFrame::success(request.id, json!({"status": "ok"})))
            .await;
        eventually(|| engine.stats().stale_responses == 1).await;
        assert_eq!(engine.stats().succeeded, 0);

        // Engine keeps working.
        let call = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.call("ping", Map::new(), LONG).await }
        });
        let request = raw.next_request().await;
        assert_eq!(request.id, CorrelationId::new(2));
        raw.reply(ResponseFrame::success(request.id, json!({"status": "ok"})))
            .await;
        assert_eq!(call.await.unwrap().unwrap(), json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn timeout_after_response_is_a_no_op() {
        let worker = FakeWorker::new();
        let engine = engine_with_worker(worker, EngineConfig::default());

        engine.call("ping", Map::new(), LONG).await.unwrap();
        engine.on_timeout(CorrelationId::new(1));

        let stats = engine.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.timed_out, 0);
    }

    #[tokio::test]
    async fn out_of_order_replies_reach_their_callers() {
        let worker = FakeWorker::new();
        let engine = engine_with_worker(worker, EngineConfig::default());

        let slow = engine.call(
            "execute_program",
            args(json!({"program_id": "p", "inputs": {"delay_ms": 150, "tag": "slow"}})),
            LONG,
        );
        let fast = engine.call(
            "execute_program",
            args(json!({"program_id": "p", "inputs": {"delay_ms": 5, "tag": "fast"}})),
            LONG,
        );
        let (slow, fast) = tokio::join!(slow, fast);

        assert_eq!(slow.unwrap()["outputs"]["tag"], json!("slow"));
        assert_eq!(fast.unwrap()["outputs"]["tag"], json!("fast"));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn many_concurrent_calls_each_resolve_once() {
        let worker = FakeWorker::new();
        let engine = engine_with_worker(Arc::clone(&worker), EngineConfig::default());

        let calls: Vec<_> = (0..50u64)
            .map(|n| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine
                        .call(
                            "execute_program",
                            args(json!({"program_id": "p", "inputs": {"n": n, "delay_ms": 50 - n}})),
                            LONG,
                        )
                        .await
                })
            })
            .collect();
        for (n, call) in calls.into_iter().enumerate() {
            let result = call.await.unwrap().unwrap();
            assert_eq!(result["outputs"]["n"], json!(n));
        }

        assert_eq!(worker.seen.load(Ordering::SeqCst), 50);
        let stats = engine.stats();
        assert_eq!(stats.sent, 50);
        assert_eq!(stats.succeeded, 50);
        assert_eq!(stats.stale_responses, 0);
    }

    #[tokio::test]
    async fn unknown_id_does_not_disturb_pending_calls() {
        let (engine, mut raw) = engine_with_raw(EngineConfig::default());

        let call = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.call("ping", Map::new(), LONG).await }
        });
        let request = raw.next_request().await;

        raw.reply(ResponseFrame::success(
            CorrelationId::new(999),
            json!({"status": "ok", "who": "stranger"}),
        ))
        .await;
        eventually(|| engine.stats().stale_responses == 1).await;
        assert_eq!(engine.pending_count(), 1);

        raw.reply(ResponseFrame::success(request.id, json!({"status": "ok", "who": "me"})))
            .await;
        assert_eq!(call.await.unwrap().unwrap()["who"], json!("me"));
    }

    #[tokio::test]
    async fn malformed_frame_is_counted_and_skipped() {
        let (engine, mut raw) = engine_with_raw(EngineConfig::default());

        let call = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.call("ping", Map::new(), LONG).await }
        });
        let request = raw.next_request().await;

        let mut garbage = BytesMut::new();
        garbage.put_u32(3);
        garbage.extend_from_slice(b"{{{");
        raw.send_raw(garbage.freeze()).await;
        raw.reply(ResponseFrame::success(request.id, json!({"status": "ok"})))
            .await;

        call.await.unwrap().unwrap();
        assert_eq!(engine.stats().decode_errors, 1);
        assert!(engine.is_alive());
    }

    #[tokio::test]
    async fn remote_failure_carries_worker_message() {
        let engine = engine_with_worker(FakeWorker::new(), EngineConfig::default());
        let err = engine
            .call("delete_program", args(json!({"program_id": "x"})), LONG)
            .await
            .unwrap_err();
        match err {
            CallError::Remote { command, message } => {
                assert_eq!(command, "delete_program");
                assert_eq!(message, "boom");
            }
            other => panic!("expected remote failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_status_becomes_application_error() {
        let engine = engine_with_worker(FakeWorker::new(), EngineConfig::default());
        let err = engine
            .call("get_program", args(json!({"program_id": "missing"})), LONG)
            .await
            .unwrap_err();
        match err {
            CallError::Application(e) => {
                assert_eq!(e.message, "Program 'missing' not found");
            }
            other => panic!("expected application error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn channel_exit_fails_every_pending_call() {
        let worker = FakeWorker::new();
        let engine = engine_with_worker(Arc::clone(&worker), EngineConfig::default());

        let calls: Vec<_> = (0..5)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.call("list_programs", Map::new(), LONG).await })
            })
            .collect();
        eventually(|| worker.seen.load(Ordering::SeqCst) == 5).await;
        assert_eq!(engine.pending_count(), 5);

        engine.on_channel_exited(ExitReason::Exited { code: 1 });

        for call in calls {
            assert!(matches!(
                call.await.unwrap(),
                Err(CallError::ChannelExited(ExitReason::Exited { code: 1 }))
            ));
        }
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.stats().failed, 5);

        let err = engine.call("ping", Map::new(), LONG).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::ChannelNotAvailable(ExitReason::Exited { code: 1 })
        ));
        assert_eq!(engine.closed().await, ExitReason::Exited { code: 1 });
    }

    #[tokio::test]
    async fn worker_eof_closes_channel() {
        let (engine, mut raw) = engine_with_raw(EngineConfig::default());

        let call = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.call("ping", Map::new(), LONG).await }
        });
        raw.next_request().await;
        assert_eq!(engine.pending_count(), 1);
        drop(raw);

        assert_eq!(engine.closed().await, ExitReason::ChannelClosed);
        assert!(matches!(
            call.await.unwrap(),
            Err(CallError::ChannelExited(ExitReason::ChannelClosed))
        ));
        assert!(!engine.is_alive());
    }

    #[tokio::test]
    async fn oversized_frame_kills_the_channel() {
        let (engine, mut raw) =
            engine_with_raw(EngineConfig::default().with_max_frame_length(64));

        let call = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.call("ping", Map::new(), LONG).await }
        });
        let request = raw.next_request().await;
        raw.reply(ResponseFrame::success(
            request.id,
            json!({"status": "ok", "padding": "x".repeat(256)}),
        ))
        .await;

        assert!(matches!(
            call.await.unwrap(),
            Err(CallError::ChannelExited(ExitReason::ChannelClosed))
        ));
    }

    #[tokio::test]
    async fn dropped_call_frees_its_entry() {
        let (engine, mut raw) = engine_with_raw(EngineConfig::default());

        let call = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.call("ping", Map::new(), LONG).await }
        });
        let request = raw.next_request().await;
        assert_eq!(engine.pending_count(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(engine.pending_count(), 0);

        raw.reply(ResponseFrame::success(request.id, json!({"status": "ok"})))
            .await;
        eventually(|| engine.stats().stale_responses == 1).await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let engine = engine_with_worker(FakeWorker::new(), EngineConfig::default());
        engine.call("ping", Map::new(), LONG).await.unwrap();

        engine.close().await;
        engine.close().await;

        assert_eq!(engine.exit_reason(), Some(ExitReason::Closed));
        let err = engine.call("ping", Map::new(), LONG).await.unwrap_err();
        assert!(matches!(err, CallError::ChannelNotAvailable(ExitReason::Closed)));
        assert!(err.is_channel_failure());
    }

    /// Engine whose peer holds the channel open but never reads a byte.
    fn engine_with_deaf_peer() -> (Arc<Engine>, DuplexStream) {
        let (engine_io, peer) = tokio::io::duplex(16);
        let (read, write) = tokio::io::split(engine_io);
        (Engine::from_channel(read, write, EngineConfig::default()), peer)
    }

    #[tokio::test]
    async fn stalled_write_times_out_and_ends_the_channel() {
        let (engine, _peer) = engine_with_deaf_peer();

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            engine.call("ping", Map::new(), Duration::from_millis(100)),
        )
        .await
        .expect("call must honour its own timeout while writing")
        .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.exit_reason(), Some(ExitReason::InputStalled));
        assert_eq!(engine.stats().timed_out, 1);

        let err = engine.call("ping", Map::new(), LONG).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::ChannelNotAvailable(ExitReason::InputStalled)
        ));
    }

    #[tokio::test]
    async fn close_releases_caller_blocked_on_write() {
        let (engine, _peer) = engine_with_deaf_peer();
        let call = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.call("ping", Map::new(), LONG).await }
        });
        eventually(|| engine.pending_count() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), engine.close())
            .await
            .expect("close must not wait on a blocked write");
        let err = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, CallError::ChannelExited(ExitReason::Closed)));
        assert_eq!(engine.pending_count(), 0);
    }

    /// Input stream that refuses every write.
    struct BrokenPipe;

    impl tokio::io::AsyncWrite for BrokenPipe {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn failed_write_leaves_nothing_pending() {
        let (output, _peer) = tokio::io::duplex(1024);
        let engine = Engine::from_channel(output, BrokenPipe, EngineConfig::default());

        let err = engine.call("ping", Map::new(), LONG).await.unwrap_err();
        assert!(matches!(err, CallError::Write(_)));
        assert!(err.is_channel_failure());
        assert_eq!(engine.pending_count(), 0);
        let stats = engine.stats();
        assert_eq!((stats.sent, stats.failed), (0, 1));

        let again = tokio::time::timeout(
            Duration::from_millis(500),
            engine.call("ping", Map::new(), LONG),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(again, CallError::Write(_)));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn prepare_runs_before_encoding() {
        let (engine, mut raw) = engine_with_raw(EngineConfig::default());

        let call = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move {
                engine
                    .call(
                        "get_program",
                        args(json!({"programId": "qa"})),
                        LONG,
                    )
                    .await
            }
        });
        let request = raw.next_request().await;
        assert_eq!(request.args, args(json!({"program_id": "qa"})));
        raw.reply(ResponseFrame::success(
            request.id,
            json!({"status": "ok", "program_id": "qa"}),
        ))
        .await;
        call.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;
        use crate::process::WorkerCommand;

        fn sh(script: &str) -> EngineConfig {
            EngineConfig::new(WorkerCommand::new("sh").args(["-c", script]))
                .with_shutdown_grace(Duration::from_millis(500))
        }

        #[tokio::test]
        async fn exit_code_is_reported() {
            let engine = Engine::spawn(sh("exit 3")).unwrap();
            assert!(engine.pid().is_some());
            assert_eq!(engine.closed().await, ExitReason::Exited { code: 3 });

            let err = engine.call("ping", Map::new(), LONG).await.unwrap_err();
            assert!(matches!(
                err,
                CallError::ChannelNotAvailable(ExitReason::Exited { code: 3 })
            ));
        }

        #[tokio::test]
        async fn crash_fails_in_flight_call() {
            let engine = Engine::spawn(sh("head -c 1 >/dev/null; exit 7")).unwrap();
            let err = engine.call("ping", Map::new(), LONG).await.unwrap_err();
            assert!(matches!(
                err,
                CallError::ChannelExited(ExitReason::Exited { code: 7 })
            ));
            assert_eq!(engine.pending_count(), 0);
        }

        #[tokio::test]
        async fn echoed_request_is_a_decode_error() {
            let engine = Engine::spawn(EngineConfig::new(WorkerCommand::new("cat"))).unwrap();
            let err = engine
                .call("ping", Map::new(), Duration::from_millis(200))
                .await
                .unwrap_err();
            assert!(err.is_timeout());
            eventually(|| engine.stats().decode_errors == 1).await;

            engine.close().await;
            assert_eq!(engine.exit_reason(), Some(ExitReason::Closed));
        }

        #[tokio::test]
        async fn close_drains_stderr_forwarder() {
            let engine = Engine::spawn(sh("echo warming up >&2; exec cat >/dev/null")).unwrap();
            assert!(engine.stderr_pump.lock().unwrap().is_some());

            tokio::time::timeout(LONG, engine.close()).await.unwrap();
            assert!(engine.stderr_pump.lock().unwrap().is_none());
            assert_eq!(engine.exit_reason(), Some(ExitReason::Closed));
        }

        #[tokio::test]
        async fn missing_executable_fails_to_spawn() {
            let dir = tempfile::tempdir().unwrap();
            let config = EngineConfig::new(WorkerCommand::new(dir.path().join("absent")));
            assert!(matches!(
                Engine::spawn(config).err().unwrap(),
                SpawnError::NotFound(_)
            ));
        }

        #[tokio::test]
        async fn spawn_without_command_fails() {
            assert!(matches!(
                Engine::spawn(EngineConfig::default()).err().unwrap(),
                SpawnError::Other(_)
            ));
        }
    }
}
