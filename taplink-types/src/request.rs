//! Transaction request payloads.
//!
//! These types serialize into the `bizData` subtree of an envelope. All
//! monetary values are arbitrary-precision decimals.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::Action;

/// The monetary breakdown of a sale.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Amount {
    /// The order amount, strictly positive.
    pub order: Decimal,
    /// Tip amount, zero allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tip: Option<Decimal>,
    /// Tax amount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax: Option<Decimal>,
    /// Surcharge amount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surcharge: Option<Decimal>,
    /// Cashback amount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cashback: Option<Decimal>,
    /// Service fee amount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_fee: Option<Decimal>,
    /// ISO-4217 currency code, exactly three characters.
    pub currency: String,
}

impl Amount {
    /// A plain order amount with no extras.
    pub fn order_only(order: Decimal, currency: impl Into<String>) -> Self {
        Self {
            order,
            tip: None,
            tax: None,
            surcharge: None,
            cashback: None,
            service_fee: None,
            currency: currency.into(),
        }
    }
}

/// The amount of an authorization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthAmount {
    /// The authorized amount, strictly positive.
    pub order: Decimal,
    /// ISO-4217 currency code, exactly three characters.
    pub currency: String,
}

/// Reference to a prior transaction.
///
/// Exactly one of the two identifiers must be present where a reference is
/// required; decoding enforces this.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "OriginalRefWire", into = "OriginalRefWire")]
pub enum OriginalRef {
    /// References by the terminal-assigned transaction id.
    TransactionId(String),
    /// References by the trace id of the original request.
    TransactionRequestId(String),
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OriginalRefWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original_transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original_transaction_request_id: Option<String>,
}

impl From<OriginalRef> for OriginalRefWire {
    fn from(value: OriginalRef) -> Self {
        match value {
            OriginalRef::TransactionId(id) => Self {
                original_transaction_id: Some(id),
                original_transaction_request_id: None,
            },
            OriginalRef::TransactionRequestId(id) => Self {
                original_transaction_id: None,
                original_transaction_request_id: Some(id),
            },
        }
    }
}

impl TryFrom<OriginalRefWire> for OriginalRef {
    type Error = String;

    fn try_from(value: OriginalRefWire) -> Result<Self, Self::Error> {
        match (
            value.original_transaction_id,
            value.original_transaction_request_id,
        ) {
            (Some(id), None) => Ok(OriginalRef::TransactionId(id)),
            (None, Some(id)) => Ok(OriginalRef::TransactionRequestId(id)),
            (Some(_), Some(_)) => {
                Err("provide either originalTransactionId or originalTransactionRequestId, not both"
                    .to_string())
            }
            (None, None) => {
                Err("provide one of originalTransactionId or originalTransactionRequestId"
                    .to_string())
            }
        }
    }
}

/// A sale (purchase) request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleRequest {
    /// Merchant reference, 6–32 characters.
    pub reference_order_id: String,
    /// The monetary breakdown.
    pub amount: Amount,
    /// Requested payment method, terminal-defined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    /// Staff identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staff: Option<String>,
    /// Free-form description, at most 128 characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Opaque attachment echoed back in the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attach: Option<String>,
    /// Merchant callback URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_url: Option<String>,
    /// Per-request timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
}

/// A pre-authorization request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    /// Merchant reference, 6–32 characters.
    pub reference_order_id: String,
    /// The authorized amount.
    pub auth_amount: AuthAmount,
}

/// An increment on a prior authorization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementAuthRequest {
    /// The authorization being incremented.
    #[serde(flatten)]
    pub original: OriginalRef,
    /// The additional amount, strictly positive.
    pub add_amount: AuthAmount,
}

/// Capture of a prior authorization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostAuthRequest {
    /// The authorization being captured.
    #[serde(flatten)]
    pub original: OriginalRef,
    /// The captured amount, strictly positive.
    pub capture_amount: AuthAmount,
}

/// A refund request.
///
/// Refunds are either referenced (one of the `original_*` identifiers) or
/// non-referenced (`reference_order_id`), never both and never neither.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    /// References by terminal-assigned transaction id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_transaction_id: Option<String>,
    /// References by the trace id of the original request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_transaction_request_id: Option<String>,
    /// Merchant reference for a non-referenced refund.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_order_id: Option<String>,
    /// The refunded amount.
    pub amount: Amount,
}

impl RefundRequest {
    /// Returns the referenced leg, if this is a referenced refund.
    pub fn original_ref(&self) -> Option<OriginalRef> {
        match (
            &self.original_transaction_id,
            &self.original_transaction_request_id,
        ) {
            (Some(id), _) => Some(OriginalRef::TransactionId(id.clone())),
            (_, Some(id)) => Some(OriginalRef::TransactionRequestId(id.clone())),
            _ => None,
        }
    }
}

/// Void of a prior transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoidRequest {
    /// The transaction being voided.
    #[serde(flatten)]
    pub original: OriginalRef,
}

/// Tip adjustment on a prior transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TipAdjustRequest {
    /// The transaction being adjusted.
    #[serde(flatten)]
    pub original: OriginalRef,
    /// The new tip amount, zero allowed.
    pub tip: Decimal,
}

/// Abort of an in-flight transaction.
///
/// Abort references the original request's trace id; it carries no amount.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    /// The trace id of the request being aborted.
    pub original_transaction_request_id: String,
}

/// What a query looks up, exactly one of the two.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "QueryTargetWire", into = "QueryTargetWire")]
pub enum QueryTarget {
    /// Look up by terminal-assigned transaction id.
    TransactionId(String),
    /// Look up by the trace id of the original request.
    TransactionRequestId(String),
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryTargetWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    by_transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    by_transaction_request_id: Option<String>,
}

impl From<QueryTarget> for QueryTargetWire {
    fn from(value: QueryTarget) -> Self {
        match value {
            QueryTarget::TransactionId(id) => Self {
                by_transaction_id: Some(id),
                by_transaction_request_id: None,
            },
            QueryTarget::TransactionRequestId(id) => Self {
                by_transaction_id: None,
                by_transaction_request_id: Some(id),
            },
        }
    }
}

impl TryFrom<QueryTargetWire> for QueryTarget {
    type Error = String;

    fn try_from(value: QueryTargetWire) -> Result<Self, Self::Error> {
        match (value.by_transaction_id, value.by_transaction_request_id) {
            (Some(id), None) => Ok(QueryTarget::TransactionId(id)),
            (None, Some(id)) => Ok(QueryTarget::TransactionRequestId(id)),
            _ => Err("query by exactly one of byTransactionId or byTransactionRequestId"
                .to_string()),
        }
    }
}

/// A transaction status query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    /// What to look up.
    #[serde(flatten)]
    pub target: QueryTarget,
}

/// The union of all requests the orchestrator accepts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionRequest {
    /// A sale.
    Sale(SaleRequest),
    /// A pre-authorization.
    Auth(AuthRequest),
    /// A forced (offline) authorization.
    ForcedAuth(AuthRequest),
    /// An authorization increment.
    IncrementAuth(IncrementAuthRequest),
    /// A capture.
    PostAuth(PostAuthRequest),
    /// A refund.
    Refund(RefundRequest),
    /// A void.
    Void(VoidRequest),
    /// A tip adjustment.
    TipAdjust(TipAdjustRequest),
    /// An abort.
    Abort(AbortRequest),
    /// A status query.
    Query(QueryRequest),
    /// A batch close.
    BatchClose,
    /// The INIT handshake.
    Init,
}

impl TransactionRequest {
    /// The envelope action this request travels under.
    pub fn action(&self) -> Action {
        match self {
            TransactionRequest::Sale(_) => Action::Sale,
            TransactionRequest::Auth(_) => Action::Auth,
            TransactionRequest::ForcedAuth(_) => Action::ForcedAuth,
            TransactionRequest::IncrementAuth(_) => Action::IncrementAuth,
            TransactionRequest::PostAuth(_) => Action::PostAuth,
            TransactionRequest::Refund(_) => Action::Refund,
            TransactionRequest::Void(_) => Action::Void,
            TransactionRequest::TipAdjust(_) => Action::TipAdjust,
            TransactionRequest::Abort(_) => Action::Abort,
            TransactionRequest::Query(_) => Action::Query,
            TransactionRequest::BatchClose => Action::BatchClose,
            TransactionRequest::Init => Action::Init,
        }
    }

    /// Serializes the request into the `bizData` subtree.
    pub fn to_biz_data(&self) -> Value {
        let value = match self {
            TransactionRequest::Sale(req) => serde_json::to_value(req),
            TransactionRequest::Auth(req) | TransactionRequest::ForcedAuth(req) => {
                serde_json::to_value(req)
            }
            TransactionRequest::IncrementAuth(req) => serde_json::to_value(req),
            TransactionRequest::PostAuth(req) => serde_json::to_value(req),
            TransactionRequest::Refund(req) => serde_json::to_value(req),
            TransactionRequest::Void(req) => serde_json::to_value(req),
            TransactionRequest::TipAdjust(req) => serde_json::to_value(req),
            TransactionRequest::Abort(req) => serde_json::to_value(req),
            TransactionRequest::Query(req) => serde_json::to_value(req),
            TransactionRequest::BatchClose | TransactionRequest::Init => {
                Ok(Value::Object(Default::default()))
            }
        };
        value.expect("request serializes")
    }

    /// The per-request timeout override, where the request carries one.
    pub fn timeout_override_secs(&self) -> Option<u64> {
        match self {
            TransactionRequest::Sale(req) => req.request_timeout,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn original_ref_rejects_both_legs() {
        let raw = serde_json::json!({
            "originalTransactionId": "T-1",
            "originalTransactionRequestId": "R-1",
        });
        assert!(serde_json::from_value::<OriginalRef>(raw).is_err());
    }

    #[test]
    fn original_ref_flattens_into_void() {
        let void = VoidRequest {
            original: OriginalRef::TransactionId("T-42".to_string()),
        };
        let raw = serde_json::to_value(&void).unwrap();
        assert_eq!(raw["originalTransactionId"], "T-42");
        assert_eq!(serde_json::from_value::<VoidRequest>(raw).unwrap(), void);
    }

    #[test]
    fn query_target_is_exclusive() {
        let raw = serde_json::json!({});
        assert!(serde_json::from_value::<QueryRequest>(raw).is_err());
        let raw = serde_json::json!({"byTransactionRequestId": "R-7"});
        let query = serde_json::from_value::<QueryRequest>(raw).unwrap();
        assert_eq!(
            query.target,
            QueryTarget::TransactionRequestId("R-7".to_string())
        );
    }

    #[test]
    fn sale_biz_data_uses_wire_names() {
        let sale = TransactionRequest::Sale(SaleRequest {
            reference_order_id: "O-000001".to_string(),
            amount: Amount::order_only(dec!(8.99), "USD"),
            payment_method: None,
            staff: None,
            description: Some("two coffees".to_string()),
            attach: None,
            notify_url: None,
            request_timeout: None,
        });
        let biz = sale.to_biz_data();
        assert_eq!(biz["referenceOrderId"], "O-000001");
        assert_eq!(biz["amount"]["currency"], "USD");
        assert!(biz.get("paymentMethod").is_none());
    }
}
