//! In-flight request tracking.
//!
//! The table is the single point of arbitration between the three ways a
//! request can end (response frame, timeout, channel exit): every path
//! resolves a request only after removing it, and removal succeeds at most
//! once per id.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::protocol::CorrelationId;
use crate::engine::CallError;
use crate::process::ExitReason;

pub type CallResult = Result<Value, CallError>;

/// Monotonic correlation id source. Starts at 1; 0 is never issued.
#[derive(Debug)]
pub struct CorrelationIds {
    next: AtomicU64,
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> CorrelationId {
        loop {
            let raw = self.next.fetch_add(1, Ordering::Relaxed);
            if raw != 0 {
                return CorrelationId::new(raw);
            }
        }
    }
}

/// One in-flight call.
pub struct PendingRequest {
    pub command: String,
    pub timeout: Duration,
    pub registered_at: Instant,
    waiter: oneshot::Sender<CallResult>,
}

impl PendingRequest {
    /// Deliver the terminal result. Consumes the entry, so it can happen once.
    pub fn resolve(self, id: CorrelationId, result: CallResult) {
        if self.waiter.send(result).is_err() {
            tracing::debug!(%id, command = %self.command, "Caller stopped waiting before resolution");
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.registered_at.elapsed()
    }
}

#[derive(Default)]
pub struct PendingTable {
    entries: DashMap<CorrelationId, PendingRequest>,
    closed: OnceLock<ExitReason>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new request and hand back the caller's end of its waiter.
    ///
    /// Fails once the table is closed. A request that races with `close`
    /// is either refused here or drained by `close`, never stranded.
    pub fn register(
        &self,
        id: CorrelationId,
        command: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<CallResult>, ExitReason> {
        if let Some(reason) = self.closed.get() {
            return Err(reason.clone());
        }

        let (tx, rx) = oneshot::channel();
        let entry = PendingRequest {
            command: command.to_string(),
            timeout,
            registered_at: Instant::now(),
            waiter: tx,
        };
        if self.entries.insert(id, entry).is_some() {
            tracing::error!(%id, "Correlation id reused while still in flight");
        }

        if let Some(reason) = self.closed.get()
            && self.entries.remove(&id).is_some()
        {
            return Err(reason.clone());
        }

        Ok(rx)
    }

    /// Remove an entry. Returns None if it was already resolved.
    pub fn take(&self, id: CorrelationId) -> Option<PendingRequest> {
        self.entries.remove(&id).map(|(_, entry)| entry)
    }

    /// Close the table and drain every entry.
    ///
    /// Returns None if the table was already closed.
    pub fn close(&self, reason: ExitReason) -> Option<Vec<(CorrelationId, PendingRequest)>> {
        self.closed.set(reason).ok()?;
        let ids: Vec<CorrelationId> = self.entries.iter().map(|e| *e.key()).collect();
        Some(
            ids.into_iter()
                .filter_map(|id| self.entries.remove(&id))
                .collect(),
        )
    }

    pub fn closed_reason(&self) -> Option<&ExitReason> {
        self.closed.get()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Removes the entry if the caller goes away before resolution.
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: CorrelationId,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a PendingTable, id: CorrelationId) -> Self {
        Self { table, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.table.take(self.id) {
            tracing::debug!(id = %self.id, command = %entry.command, "Call dropped while in flight");
        }
    }
}
