//! The payment orchestrator.
//!
//! Admission, trace minting, registration and transport hand-off for every
//! action. The orchestrator never retries on its own; the retry class of a
//! failure is answered by the error catalogue predicates.

use std::{sync::Arc, time::Duration};

use rust_decimal::Decimal;
use taplink_types::{
    TraceId,
    action::Action,
    error::{TapError, error_codes},
    request::{
        AbortRequest, Amount, AuthAmount, AuthRequest, IncrementAuthRequest, OriginalRef,
        PostAuthRequest, QueryRequest, QueryTarget, RefundRequest, SaleRequest, TipAdjustRequest,
        TransactionRequest, VoidRequest,
    },
    validation::{ValidationError, validate},
};

use crate::{
    callbacks::TransactionCallback,
    config::{ConnectionMode, SdkConfig},
    connection::ConnectionManager,
    dispatch::build_envelope,
    registry::CallKind,
};

/// Routes validated requests to the active transport and reconciles their
/// completions through the callback registry.
#[derive(Clone)]
pub struct PaymentManager {
    sdk_config: SdkConfig,
    connection: ConnectionManager,
}

impl PaymentManager {
    pub(crate) fn new(sdk_config: SdkConfig, connection: ConnectionManager) -> Self {
        Self {
            sdk_config,
            connection,
        }
    }

    /// Executes one transaction request.
    ///
    /// Validation failures fail synchronously, before any transport I/O,
    /// with the ordered list of admission errors. An admitted request
    /// always completes through the callback: progress events stream until
    /// the terminal event, the per-kind deadline, or a connection loss
    /// retires it.
    pub async fn execute(
        &self,
        request: TransactionRequest,
        callback: Arc<dyn TransactionCallback>,
    ) -> Result<TraceId, Vec<ValidationError>> {
        validate(&request).into_result()?;
        let action = request.action();
        let trace_id = TraceId::mint();

        let Some((transport, mode)) = self.connection.active_transport() else {
            fail(callback, not_connected(&trace_id));
            return Ok(trace_id);
        };
        if !self.connection.is_connected() {
            fail(callback, not_connected(&trace_id));
            return Ok(trace_id);
        }

        let kind = match action {
            Action::Query => CallKind::Query,
            Action::Init => CallKind::Init,
            _ => CallKind::Transaction,
        };
        let timeout = request.timeout_override_secs().map(Duration::from_secs);
        let registry = self.connection.registry();
        let registered = match mode {
            // the host application drives completion; no local deadline
            ConnectionMode::AppToApp => {
                registry.register_host_driven(trace_id.clone(), Arc::clone(&callback), kind)
            }
            _ => registry.register(trace_id.clone(), Arc::clone(&callback), kind, timeout),
        };
        if !registered {
            fail(
                callback,
                TapError::with_message(error_codes::SERVICE_EXCEPTION, "trace id collision")
                    .with_trace_id(trace_id.clone()),
            );
            return Ok(trace_id);
        }

        let envelope = build_envelope(
            &self.sdk_config,
            action,
            &trace_id,
            Some(request.to_biz_data()),
        );
        tracing::debug!("sending {action} as {trace_id}");
        if let Err(err) = transport.send(&trace_id, envelope.encode()).await {
            registry.cancel(&trace_id);
            fail(callback, err);
        }
        Ok(trace_id)
    }

    /// A sale.
    pub async fn sale(
        &self,
        request: SaleRequest,
        callback: Arc<dyn TransactionCallback>,
    ) -> Result<TraceId, Vec<ValidationError>> {
        self.execute(TransactionRequest::Sale(request), callback).await
    }

    /// A pre-authorization.
    pub async fn auth(
        &self,
        request: AuthRequest,
        callback: Arc<dyn TransactionCallback>,
    ) -> Result<TraceId, Vec<ValidationError>> {
        self.execute(TransactionRequest::Auth(request), callback).await
    }

    /// A forced (offline) authorization.
    pub async fn forced_auth(
        &self,
        request: AuthRequest,
        callback: Arc<dyn TransactionCallback>,
    ) -> Result<TraceId, Vec<ValidationError>> {
        self.execute(TransactionRequest::ForcedAuth(request), callback)
            .await
    }

    /// An increment on a prior authorization.
    pub async fn increment_auth(
        &self,
        original: OriginalRef,
        add_amount: AuthAmount,
        callback: Arc<dyn TransactionCallback>,
    ) -> Result<TraceId, Vec<ValidationError>> {
        self.execute(
            TransactionRequest::IncrementAuth(IncrementAuthRequest {
                original,
                add_amount,
            }),
            callback,
        )
        .await
    }

    /// Capture of a prior authorization.
    pub async fn post_auth(
        &self,
        original: OriginalRef,
        capture_amount: AuthAmount,
        callback: Arc<dyn TransactionCallback>,
    ) -> Result<TraceId, Vec<ValidationError>> {
        self.execute(
            TransactionRequest::PostAuth(PostAuthRequest {
                original,
                capture_amount,
            }),
            callback,
        )
        .await
    }

    /// A referenced or non-referenced refund.
    pub async fn refund(
        &self,
        request: RefundRequest,
        callback: Arc<dyn TransactionCallback>,
    ) -> Result<TraceId, Vec<ValidationError>> {
        self.execute(TransactionRequest::Refund(request), callback)
            .await
    }

    /// Void of a prior transaction.
    pub async fn void_transaction(
        &self,
        original: OriginalRef,
        callback: Arc<dyn TransactionCallback>,
    ) -> Result<TraceId, Vec<ValidationError>> {
        self.execute(
            TransactionRequest::Void(VoidRequest { original }),
            callback,
        )
        .await
    }

    /// Tip adjustment on a prior transaction.
    pub async fn tip_adjust(
        &self,
        original: OriginalRef,
        tip: Decimal,
        callback: Arc<dyn TransactionCallback>,
    ) -> Result<TraceId, Vec<ValidationError>> {
        self.execute(
            TransactionRequest::TipAdjust(TipAdjustRequest { original, tip }),
            callback,
        )
        .await
    }

    /// A transaction status query.
    pub async fn query(
        &self,
        target: QueryTarget,
        callback: Arc<dyn TransactionCallback>,
    ) -> Result<TraceId, Vec<ValidationError>> {
        self.execute(TransactionRequest::Query(QueryRequest { target }), callback)
            .await
    }

    /// A batch close.
    pub async fn batch_close(
        &self,
        callback: Arc<dyn TransactionCallback>,
    ) -> Result<TraceId, Vec<ValidationError>> {
        self.execute(TransactionRequest::BatchClose, callback).await
    }

    /// Aborts an in-flight transaction by its original trace id.
    pub async fn abort(
        &self,
        original_transaction_request_id: impl Into<String>,
        callback: Arc<dyn TransactionCallback>,
    ) -> Result<TraceId, Vec<ValidationError>> {
        self.execute(
            TransactionRequest::Abort(AbortRequest {
                original_transaction_request_id: original_transaction_request_id.into(),
            }),
            callback,
        )
        .await
    }

    /// Convenience constructor for a plain sale amount.
    pub fn amount(order: Decimal, currency: impl Into<String>) -> Amount {
        Amount::order_only(order, currency)
    }
}

fn not_connected(trace_id: &TraceId) -> TapError {
    TapError::from_code(error_codes::NOT_CONNECTED).with_trace_id(trace_id.clone())
}

/// Completion failures are posted, never invoked inline under caller state.
fn fail(callback: Arc<dyn TransactionCallback>, error: TapError) {
    tokio::spawn(async move { callback.on_failure(error) });
}
