//! The trace-id-keyed callback registry.
//!
//! Every outbound request registers a completion here before it is written
//! to the transport. A completion leaves the registry exactly once, through
//! a response, its per-trace deadline, an explicit cancel, or a mass-fail on
//! connection loss. Completion invocations are posted to the runtime so
//! callers are never re-entered under the registry lock.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use taplink_types::{
    TraceId,
    error::{TapError, error_codes},
    event::PaymentEvent,
};

use crate::callbacks::TransactionCallback;
use crate::metrics::{METRICS_ID_SDK_CALLS_OUTSTANDING, METRICS_ID_SDK_CALLS_TIMEOUT};

/// Marks a record that never expires. The host application drives the
/// completion on the app-to-app transport.
const NO_EXPIRY: i64 = -1;

/// The kind of an outstanding call, driving its default deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    /// The INIT handshake.
    Init,
    /// Connection-level request.
    Connection,
    /// A transaction status query.
    Query,
    /// A payment transaction.
    Transaction,
}

impl CallKind {
    /// The default deadline for this kind.
    pub fn default_timeout(self) -> Duration {
        match self {
            CallKind::Init => Duration::from_secs(180),
            CallKind::Connection => Duration::from_secs(60),
            CallKind::Query => Duration::from_secs(60),
            CallKind::Transaction => Duration::from_secs(180),
        }
    }
}

struct CallRecord {
    completion: Arc<dyn TransactionCallback>,
    registered_at_ms: i64,
    timeout: Duration,
    kind: CallKind,
}

impl CallRecord {
    fn is_due(&self, now_ms: i64) -> bool {
        self.registered_at_ms != NO_EXPIRY
            && self.registered_at_ms + self.timeout.as_millis() as i64 <= now_ms
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Thread-safe store of pending completions, keyed by trace id.
#[derive(Default, Clone)]
pub struct CallbackRegistry(Arc<Mutex<HashMap<TraceId, CallRecord>>>);

impl CallbackRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a completion under `trace_id`.
    ///
    /// Returns `false` on a trace-id collision; the existing record is kept
    /// and the caller must treat the new request as failed. A collision
    /// means the trace generator is broken.
    ///
    /// An expiry task is scheduled for the record; it is a no-op if the
    /// record is gone by the time it fires. Must be called from within a
    /// tokio runtime.
    pub fn register(
        &self,
        trace_id: TraceId,
        completion: Arc<dyn TransactionCallback>,
        kind: CallKind,
        timeout: Option<Duration>,
    ) -> bool {
        let timeout = timeout.unwrap_or_else(|| kind.default_timeout());
        let record = CallRecord {
            completion,
            registered_at_ms: now_ms(),
            timeout,
            kind,
        };
        if !self.insert(trace_id.clone(), record) {
            return false;
        }
        tokio::spawn({
            let registry = self.clone();
            let trace_id = trace_id.clone();
            async move {
                tokio::time::sleep(timeout).await;
                registry.expire(&trace_id);
            }
        });
        tracing::trace!("registered {kind:?} call {trace_id}");
        true
    }

    /// Registers a completion whose lifecycle the host application drives.
    ///
    /// The record never expires; this is the deliberate policy for the
    /// app-to-app transport, where per-call deadlines live on the host side.
    pub fn register_host_driven(
        &self,
        trace_id: TraceId,
        completion: Arc<dyn TransactionCallback>,
        kind: CallKind,
    ) -> bool {
        let record = CallRecord {
            completion,
            registered_at_ms: NO_EXPIRY,
            timeout: kind.default_timeout(),
            kind,
        };
        self.insert(trace_id, record)
    }

    fn insert(&self, trace_id: TraceId, record: CallRecord) -> bool {
        let mut inner = self.0.lock();
        if inner.contains_key(&trace_id) {
            tracing::warn!("trace id collision on {trace_id}, refusing registration");
            return false;
        }
        inner.insert(trace_id, record);
        ::metrics::gauge!(METRICS_ID_SDK_CALLS_OUTSTANDING).increment(1);
        true
    }

    /// Removes and returns the completion for `trace_id`.
    ///
    /// Idempotent: the second call for the same trace id yields nothing.
    pub fn take(&self, trace_id: &TraceId) -> Option<Arc<dyn TransactionCallback>> {
        let record = self.0.lock().remove(trace_id)?;
        ::metrics::gauge!(METRICS_ID_SDK_CALLS_OUTSTANDING).decrement(1);
        Some(record.completion)
    }

    /// Returns the completion without removing it, expiring the record first
    /// if its deadline already passed.
    pub fn peek(&self, trace_id: &TraceId) -> Option<Arc<dyn TransactionCallback>> {
        {
            let inner = self.0.lock();
            match inner.get(trace_id) {
                Some(record) if !record.is_due(now_ms()) => {
                    return Some(Arc::clone(&record.completion));
                }
                Some(_) => {}
                None => return None,
            }
        }
        // deadline passed, run the timeout path instead
        self.expire(trace_id);
        None
    }

    /// Removes the record without firing its completion.
    pub fn cancel(&self, trace_id: &TraceId) {
        if self.0.lock().remove(trace_id).is_some() {
            ::metrics::gauge!(METRICS_ID_SDK_CALLS_OUTSTANDING).decrement(1);
            tracing::debug!("cancelled call {trace_id}");
        }
    }

    /// Fires the timeout path for `trace_id` if its record still exists.
    ///
    /// No-op when the record is already gone, so the scheduled expiry task
    /// and the lazy expiry in [`CallbackRegistry::peek`] compose safely.
    fn expire(&self, trace_id: &TraceId) {
        let record = {
            let mut inner = self.0.lock();
            match inner.get(trace_id) {
                Some(record) if record.is_due(now_ms()) => {
                    inner.remove(trace_id)
                }
                _ => None,
            }
        };
        let Some(record) = record else {
            return;
        };
        ::metrics::gauge!(METRICS_ID_SDK_CALLS_OUTSTANDING).decrement(1);
        ::metrics::counter!(METRICS_ID_SDK_CALLS_TIMEOUT).increment(1);
        tracing::debug!(
            "{:?} call {trace_id} expired without a response after {:?}",
            record.kind,
            record.timeout
        );
        let completion = record.completion;
        let error =
            TapError::from_code(error_codes::RESPONSE_TIMEOUT).with_trace_id(trace_id.clone());
        tokio::spawn(async move { completion.on_failure(error) });
    }

    /// Removes every record whose deadline passed, firing each timeout.
    pub fn expire_due(&self) {
        let now = now_ms();
        let due: Vec<TraceId> = self
            .0
            .lock()
            .iter()
            .filter(|(_, record)| record.is_due(now))
            .map(|(trace_id, _)| trace_id.clone())
            .collect();
        for trace_id in due {
            self.expire(&trace_id);
        }
    }

    /// Drains the registry, failing every completion with the given error.
    ///
    /// Used on irrecoverable transport loss. Safe to call repeatedly; later
    /// calls drain an empty set.
    pub fn fail_all(&self, code: &str, message: &str) {
        let drained: Vec<(TraceId, CallRecord)> = self.0.lock().drain().collect();
        if drained.is_empty() {
            return;
        }
        ::metrics::gauge!(METRICS_ID_SDK_CALLS_OUTSTANDING).decrement(drained.len() as f64);
        tracing::debug!("failing {} outstanding calls with {code}", drained.len());
        for (trace_id, record) in drained {
            let error = TapError::with_message(code, message).with_trace_id(trace_id);
            let completion = record.completion;
            tokio::spawn(async move { completion.on_failure(error) });
        }
    }

    /// Delivers a progress event to every outstanding completion.
    ///
    /// Used for locally produced events such as reconnect progress.
    pub fn broadcast_progress(&self, event: PaymentEvent) {
        let completions: Vec<Arc<dyn TransactionCallback>> = self
            .0
            .lock()
            .values()
            .map(|record| Arc::clone(&record.completion))
            .collect();
        let message = event.message();
        for completion in completions {
            let event = event.clone();
            let message = message.clone();
            tokio::spawn(async move { completion.on_progress(event, &message) });
        }
    }

    /// The number of outstanding calls.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// `true` iff nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}
