//! The inbound frame dispatcher.
//!
//! Every frame a transport delivers funnels through [`handle_frame`]:
//! decode the envelope, match the trace id against the callback registry,
//! and fire progress or terminal handling. The dispatcher runs on the
//! transport's reader task with no locks held, so completions observe
//! events for one trace in transport-arrival order. Corrupt frames are
//! logged and dropped; the affected call surfaces through its per-trace
//! timeout.

use std::time::{SystemTime, UNIX_EPOCH};

use taplink_types::{
    TraceId,
    action::Action,
    envelope::Envelope,
    error::{TapError, category, error_codes, is_success_code, ErrorCategory},
    event::PaymentEvent,
};

use crate::{callbacks::TransactionResult, config::SdkConfig, registry::CallbackRegistry};

/// Milliseconds since epoch, in the envelope's string form.
pub(crate) fn now_timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .to_string()
}

/// Builds a request envelope in the merchant application's identity.
pub(crate) fn build_envelope(
    sdk: &SdkConfig,
    action: Action,
    trace_id: &TraceId,
    biz_data: Option<serde_json::Value>,
) -> Envelope {
    Envelope {
        app_sign: sdk.app_id.clone(),
        version: sdk.version.clone(),
        time_stamp: now_timestamp(),
        action,
        trace_id: trace_id.clone(),
        biz_data,
        event_code: None,
        event_msg: None,
    }
}

/// Routes one inbound frame to its pending completion.
pub(crate) fn handle_frame(registry: &CallbackRegistry, bytes: Vec<u8>) {
    let envelope = match Envelope::decode(&bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            // corrupt frames never poison the transport
            tracing::warn!("dropping unparseable frame: {err}");
            return;
        }
    };
    let trace_id = envelope.trace_id.clone();
    let Some(event_code) = envelope.event_code.clone() else {
        tracing::debug!("frame for {trace_id} carries no event code, dropping");
        return;
    };

    match PaymentEvent::from_event_code(&event_code) {
        Ok(event) if event.is_terminal() => {
            let Some(completion) = registry.take(&trace_id) else {
                tracing::trace!("terminal event for unknown trace {trace_id}");
                return;
            };
            let mut result = TransactionResult::from_biz_data(envelope.biz_data.as_ref());
            result.trace_id = Some(trace_id.clone());
            let failed = match event {
                PaymentEvent::Cancel => Some(TapError::with_message(
                    error_codes::TERMINATED,
                    result
                        .message
                        .clone()
                        .unwrap_or_else(|| "transaction cancelled".to_string()),
                )),
                // a Completed whose bizData reports a non-success code is a
                // terminal failure, e.g. an INIT rejection
                _ => match &result.code {
                    Some(code) if !is_success_code(code) => Some(
                        TapError::with_message(
                            code,
                            result
                                .message
                                .clone()
                                .unwrap_or_else(|| "transaction failed".to_string()),
                        ),
                    ),
                    _ => None,
                },
            };
            match failed {
                Some(error) => completion.on_failure(error.with_trace_id(trace_id)),
                None => completion.on_success(result),
            }
        }
        Ok(event) => {
            let Some(completion) = registry.peek(&trace_id) else {
                tracing::trace!("progress event for unknown trace {trace_id}");
                return;
            };
            let message = envelope.event_msg.unwrap_or_else(|| event.message());
            completion.on_progress(event, &message);
        }
        Err(_) if category(event_code.as_str()) != ErrorCategory::Unknown => {
            // an error-catalogue code retires the call
            let Some(completion) = registry.take(&trace_id) else {
                tracing::trace!("error event for unknown trace {trace_id}");
                return;
            };
            let error = match envelope.event_msg {
                Some(message) => TapError::with_message(event_code.as_str(), message),
                None => TapError::from_code(event_code.as_str()),
            }
            .with_trace_id(trace_id);
            completion.on_failure(error);
        }
        Err(err) => {
            // unknown events downgrade to Processing, progress-only
            tracing::debug!("{err}, treating as Processing");
            let Some(completion) = registry.peek(&trace_id) else {
                return;
            };
            let event = PaymentEvent::Processing;
            let message = envelope.event_msg.unwrap_or_else(|| event.message());
            completion.on_progress(event, &message);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::registry::CallKind;
    use parking_lot::Mutex;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };
    use taplink_types::{TraceId, action::Action, envelope::EventCode};

    #[derive(Default)]
    struct RecordingCallback {
        progress: AtomicU32,
        successes: AtomicU32,
        failures: AtomicU32,
        last_error: Mutex<Option<TapError>>,
        last_result: Mutex<Option<TransactionResult>>,
    }

    impl crate::callbacks::TransactionCallback for RecordingCallback {
        fn on_success(&self, result: TransactionResult) {
            self.successes.fetch_add(1, Ordering::SeqCst);
            *self.last_result.lock() = Some(result);
        }

        fn on_failure(&self, error: TapError) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            *self.last_error.lock() = Some(error);
        }

        fn on_progress(&self, _event: PaymentEvent, _message: &str) {
            self.progress.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn frame(trace_id: &TraceId, event_code: &str, biz_data: Option<serde_json::Value>) -> Vec<u8> {
        Envelope {
            app_sign: "sign".to_string(),
            version: "1.0".to_string(),
            time_stamp: "1722470400000".to_string(),
            action: Action::Sale,
            trace_id: trace_id.clone(),
            biz_data,
            event_code: Some(EventCode::new(event_code)),
            event_msg: None,
        }
        .encode()
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn progress_then_completed_fires_success_once() {
        let registry = CallbackRegistry::new();
        let trace = TraceId::mint();
        let cb = Arc::new(RecordingCallback::default());
        registry.register(trace.clone(), cb.clone(), CallKind::Transaction, None);

        handle_frame(&registry, frame(&trace, "4001", None));
        handle_frame(&registry, frame(&trace, "4002", None));
        handle_frame(
            &registry,
            frame(
                &trace,
                "4003",
                Some(serde_json::json!({"code": "100", "transactionId": "T-1"})),
            ),
        );
        // a late duplicate is ignored
        handle_frame(&registry, frame(&trace, "4003", None));
        settle().await;

        assert_eq!(cb.progress.load(Ordering::SeqCst), 2);
        assert_eq!(cb.successes.load(Ordering::SeqCst), 1);
        assert_eq!(cb.failures.load(Ordering::SeqCst), 0);
        let result = cb.last_result.lock().clone().unwrap();
        assert_eq!(result.transaction_id.as_deref(), Some("T-1"));
        assert_eq!(result.trace_id, Some(trace));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn completed_with_failure_code_fails_the_call() {
        let registry = CallbackRegistry::new();
        let trace = TraceId::mint();
        let cb = Arc::new(RecordingCallback::default());
        registry.register(trace.clone(), cb.clone(), CallKind::Init, None);

        handle_frame(
            &registry,
            frame(&trace, "4003", Some(serde_json::json!({"code": "203"}))),
        );
        settle().await;

        assert_eq!(cb.failures.load(Ordering::SeqCst), 1);
        assert_eq!(cb.last_error.lock().clone().unwrap().code, "203");
    }

    #[tokio::test]
    async fn unknown_event_code_downgrades_to_processing() {
        let registry = CallbackRegistry::new();
        let trace = TraceId::mint();
        let cb = Arc::new(RecordingCallback::default());
        registry.register(trace.clone(), cb.clone(), CallKind::Transaction, None);

        handle_frame(&registry, frame(&trace, "8888", None));
        settle().await;

        assert_eq!(cb.progress.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn error_event_code_retires_the_call() {
        let registry = CallbackRegistry::new();
        let trace = TraceId::mint();
        let cb = Arc::new(RecordingCallback::default());
        registry.register(trace.clone(), cb.clone(), CallKind::Transaction, None);

        handle_frame(&registry, frame(&trace, "307", None));
        settle().await;

        assert_eq!(cb.failures.load(Ordering::SeqCst), 1);
        let error = cb.last_error.lock().clone().unwrap();
        assert_eq!(error.code, "307");
        assert!(!error.can_retry_with_same_id());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn corrupt_frames_are_dropped() {
        let registry = CallbackRegistry::new();
        let trace = TraceId::mint();
        let cb = Arc::new(RecordingCallback::default());
        registry.register(trace.clone(), cb.clone(), CallKind::Transaction, None);

        handle_frame(&registry, b"not json at all".to_vec());
        handle_frame(&registry, b"{\"traceId\": \"half an envelope\"}".to_vec());
        settle().await;

        assert_eq!(cb.progress.load(Ordering::SeqCst), 0);
        assert_eq!(cb.failures.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 1);
    }
}
