//! Request admission rules.
//!
//! Validation runs synchronously before any transport I/O; a request that
//! fails admission never reaches the terminal.

use rust_decimal::Decimal;

use crate::{
    error::error_codes,
    request::{Amount, AuthAmount, TransactionRequest},
};

/// Bounds on the merchant reference.
const REFERENCE_ORDER_ID_LEN: std::ops::RangeInclusive<usize> = 6..=32;
/// Upper bound on the free-form description.
const DESCRIPTION_MAX_LEN: usize = 128;

/// A single admission failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// The offending field, in wire naming.
    pub field: &'static str,
    /// The catalogue code: `301` for missing, `302` for malformed.
    pub code: &'static str,
    /// What went wrong.
    pub message: String,
}

impl ValidationError {
    fn missing(field: &'static str) -> Self {
        Self {
            field,
            code: error_codes::MISSING_PARAM,
            message: "required but absent".to_string(),
        }
    }

    fn format(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            code: error_codes::FORMAT_ERROR,
            message: message.into(),
        }
    }
}

/// The outcome of validating one request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationResult {
    /// Failures in field order; empty means admitted.
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    /// `true` iff the request is admitted.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Converts into a `Result`, yielding the first error's code on failure.
    pub fn into_result(self) -> Result<(), Vec<ValidationError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }

    fn push(&mut self, error: ValidationError) {
        self.errors.push(error);
    }
}

/// Validates a request against the admission rules.
pub fn validate(request: &TransactionRequest) -> ValidationResult {
    let mut result = ValidationResult::default();
    match request {
        TransactionRequest::Sale(req) => {
            check_reference_order_id(&mut result, &req.reference_order_id);
            check_amount(&mut result, &req.amount);
            if let Some(description) = &req.description
                && description.chars().count() > DESCRIPTION_MAX_LEN
            {
                result.push(ValidationError::format(
                    "description",
                    format!("at most {DESCRIPTION_MAX_LEN} characters"),
                ));
            }
        }
        TransactionRequest::Auth(req) | TransactionRequest::ForcedAuth(req) => {
            check_reference_order_id(&mut result, &req.reference_order_id);
            check_auth_amount(&mut result, "authAmount", &req.auth_amount);
        }
        TransactionRequest::IncrementAuth(req) => {
            check_auth_amount(&mut result, "addAmount", &req.add_amount);
        }
        TransactionRequest::PostAuth(req) => {
            check_auth_amount(&mut result, "captureAmount", &req.capture_amount);
        }
        TransactionRequest::Refund(req) => {
            let referenced = req.original_ref().is_some();
            let has_both_legs =
                req.original_transaction_id.is_some() && req.original_transaction_request_id.is_some();
            match (&req.reference_order_id, referenced) {
                (Some(_), true) => result.push(ValidationError::format(
                    "referenceOrderId",
                    "referenced refunds must not carry a referenceOrderId",
                )),
                (Some(id), false) => check_reference_order_id(&mut result, id),
                (None, false) => result.push(ValidationError::missing("originalTransactionId")),
                (None, true) => {}
            }
            if has_both_legs {
                result.push(ValidationError::format(
                    "originalTransactionRequestId",
                    "provide only one original-transaction reference",
                ));
            }
            check_amount(&mut result, &req.amount);
        }
        TransactionRequest::TipAdjust(req) => {
            if req.tip < Decimal::ZERO {
                result.push(ValidationError::format("tip", "must be zero or positive"));
            }
        }
        TransactionRequest::Abort(req) => {
            if req.original_transaction_request_id.is_empty() {
                result.push(ValidationError::missing("originalTransactionRequestId"));
            }
        }
        // exclusivity of the query target and the void reference is
        // guaranteed by construction
        TransactionRequest::Void(_)
        | TransactionRequest::Query(_)
        | TransactionRequest::BatchClose
        | TransactionRequest::Init => {}
    }
    result
}

fn check_reference_order_id(result: &mut ValidationResult, id: &str) {
    if id.is_empty() {
        result.push(ValidationError::missing("referenceOrderId"));
    } else if !REFERENCE_ORDER_ID_LEN.contains(&id.chars().count()) {
        result.push(ValidationError::format(
            "referenceOrderId",
            "must be 6 to 32 characters",
        ));
    }
}

fn check_currency(result: &mut ValidationResult, currency: &str) {
    if currency.len() != 3 || !currency.bytes().all(|b| b.is_ascii_alphabetic()) {
        result.push(ValidationError::format(
            "currency",
            "must be a three-letter ISO-4217 code",
        ));
    }
}

fn check_amount(result: &mut ValidationResult, amount: &Amount) {
    if amount.order <= Decimal::ZERO {
        result.push(ValidationError::format(
            "orderAmount",
            "must be strictly positive",
        ));
    }
    if let Some(tip) = amount.tip
        && tip < Decimal::ZERO
    {
        result.push(ValidationError::format("tipAmount", "must be zero or positive"));
    }
    for (field, value) in [
        ("taxAmount", amount.tax),
        ("surchargeAmount", amount.surcharge),
        ("cashbackAmount", amount.cashback),
        ("serviceFeeAmount", amount.service_fee),
    ] {
        if let Some(value) = value
            && value <= Decimal::ZERO
        {
            result.push(ValidationError::format(field, "must be strictly positive"));
        }
    }
    check_currency(result, &amount.currency);
}

fn check_auth_amount(result: &mut ValidationResult, field: &'static str, amount: &AuthAmount) {
    if amount.order <= Decimal::ZERO {
        result.push(ValidationError::format(field, "must be strictly positive"));
    }
    check_currency(result, &amount.currency);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RefundRequest, SaleRequest, TipAdjustRequest, OriginalRef, VoidRequest};
    use rust_decimal_macros::dec;

    fn sale(order: Decimal, currency: &str) -> TransactionRequest {
        TransactionRequest::Sale(SaleRequest {
            reference_order_id: "O-000001".to_string(),
            amount: Amount::order_only(order, currency),
            payment_method: None,
            staff: None,
            description: None,
            attach: None,
            notify_url: None,
            request_timeout: None,
        })
    }

    #[test]
    fn accepts_minimal_valid_sale() {
        assert!(validate(&sale(dec!(0.01), "USD")).is_ok());
    }

    #[test]
    fn rejects_zero_order_amount() {
        let result = validate(&sale(dec!(0), "USD"));
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].field, "orderAmount");
        assert_eq!(result.errors[0].code, "302");
    }

    #[test]
    fn rejects_two_letter_currency() {
        let result = validate(&sale(dec!(1), "US"));
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].field, "currency");
    }

    #[test]
    fn rejects_short_reference_order_id() {
        let request = TransactionRequest::Sale(SaleRequest {
            reference_order_id: "O-1".to_string(),
            amount: Amount::order_only(dec!(1), "USD"),
            payment_method: None,
            staff: None,
            description: None,
            attach: None,
            notify_url: None,
            request_timeout: None,
        });
        let result = validate(&request);
        assert_eq!(result.errors[0].field, "referenceOrderId");
    }

    #[test]
    fn refund_must_be_referenced_xor_non_referenced() {
        let neither = TransactionRequest::Refund(RefundRequest {
            original_transaction_id: None,
            original_transaction_request_id: None,
            reference_order_id: None,
            amount: Amount::order_only(dec!(1), "USD"),
        });
        assert!(!validate(&neither).is_ok());

        let both = TransactionRequest::Refund(RefundRequest {
            original_transaction_id: Some("T-1".to_string()),
            original_transaction_request_id: None,
            reference_order_id: Some("O-000001".to_string()),
            amount: Amount::order_only(dec!(1), "USD"),
        });
        assert!(!validate(&both).is_ok());

        let referenced = TransactionRequest::Refund(RefundRequest {
            original_transaction_id: Some("T-1".to_string()),
            original_transaction_request_id: None,
            reference_order_id: None,
            amount: Amount::order_only(dec!(1), "USD"),
        });
        assert!(validate(&referenced).is_ok());
    }

    #[test]
    fn tip_adjust_allows_zero_tip() {
        let request = TransactionRequest::TipAdjust(TipAdjustRequest {
            original: OriginalRef::TransactionId("T-1".to_string()),
            tip: dec!(0),
        });
        assert!(validate(&request).is_ok());

        let negative = TransactionRequest::TipAdjust(TipAdjustRequest {
            original: OriginalRef::TransactionId("T-1".to_string()),
            tip: dec!(-1),
        });
        assert!(!validate(&negative).is_ok());
    }

    #[test]
    fn void_is_admitted_by_construction() {
        let request = TransactionRequest::Void(VoidRequest {
            original: OriginalRef::TransactionRequestId("R-1".to_string()),
        });
        assert!(validate(&request).is_ok());
    }
}
