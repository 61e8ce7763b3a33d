//! Caller-facing callback traits.
//!
//! Callbacks fire on the SDK's runtime tasks, never while an internal lock
//! is held. Events for one trace arrive in transport order; keep the
//! implementations quick and hand heavy work to your own executor.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use taplink_types::{DeviceId, TraceId, error::TapError, event::PaymentEvent};

/// Receives the outcome and progress stream of one transaction.
///
/// For every registered call, exactly one of [`on_success`] and
/// [`on_failure`] fires, after zero or more [`on_progress`] deliveries in
/// transport-arrival order.
///
/// [`on_success`]: TransactionCallback::on_success
/// [`on_failure`]: TransactionCallback::on_failure
/// [`on_progress`]: TransactionCallback::on_progress
pub trait TransactionCallback: Send + Sync {
    /// The transaction reached its positive terminal event.
    fn on_success(&self, result: TransactionResult);

    /// The transaction failed, timed out or was cancelled.
    fn on_failure(&self, error: TapError);

    /// A progress event arrived for the transaction.
    fn on_progress(&self, event: PaymentEvent, message: &str) {
        let _ = (event, message);
    }
}

/// Observes connection lifecycle transitions.
pub trait ConnectionListener: Send + Sync {
    /// A connection attempt was accepted and is waiting to dial.
    fn on_waiting_connect(&self) {}

    /// The terminal is connected and business-ready.
    fn on_connected(&self, device: &DeviceInfo);

    /// The connection ended.
    fn on_disconnected(&self, reason: &DisconnectReason);

    /// The connection attempt or the established connection failed.
    fn on_error(&self, error: &TapError);
}

/// Why a connection ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The caller asked for the disconnect. No reconnect follows.
    Manual,
    /// The remote side or the transport dropped the link.
    Passive,
    /// The heartbeat supervisor declared the connection dead. Service
    /// monitoring keeps running so the terminal can be rediscovered.
    Heartbeat,
}

/// Identity of the connected terminal, learned from the INIT handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// The terminal id.
    pub device_id: DeviceId,
    /// The Tapro software version.
    pub tapro_version: String,
}

/// The payload of a positive terminal event.
///
/// `bizData` is action-specific; the well-known fields are lifted out and
/// everything else stays available under [`TransactionResult::extra`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionResult {
    /// Result code, when the terminal reports one.
    pub code: Option<String>,
    /// Result message.
    pub message: Option<String>,
    /// Terminal-assigned transaction id.
    pub transaction_id: Option<String>,
    /// The merchant reference of the transaction.
    pub reference_order_id: Option<String>,
    /// Detailed transaction result code.
    pub transaction_result_code: Option<String>,
    /// The trace id of the completed request. Attached by the SDK.
    #[serde(skip)]
    pub trace_id: Option<TraceId>,
    /// Remaining action-specific fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl TransactionResult {
    /// Parses a result from the `bizData` subtree. Absent fields are `None`.
    pub fn from_biz_data(biz_data: Option<&Value>) -> Self {
        biz_data
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }
}
