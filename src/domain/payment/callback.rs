use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::order::PaymentStatus;
use super::signature::SignatureVerifier;

// ============================================================================
// Gateway callback validation
// ============================================================================
//
// Raw form fields → CallbackVerdict. Nothing downstream reads the raw form;
// the payment service only matches on the verdict.
//
// ============================================================================

pub type CallbackForm = HashMap<String, String>;

const TRANSACTION_PREFIX: &str = "MKT";

/// Merchant transaction id: `MKT` followed by 32 lowercase hex digits.
pub fn new_transaction_id() -> String {
    format!("{}{}", TRANSACTION_PREFIX, Uuid::new_v4().simple())
}

pub fn is_valid_transaction_id(value: &str) -> bool {
    match value.strip_prefix(TRANSACTION_PREFIX) {
        Some(rest) => rest.len() == 32 && rest.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

/// Gateway-reported outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayVerdict {
    Succeeded,
    Failed,
    Cancelled,
}

impl GatewayVerdict {
    /// Map the gateway's status word. Unknown words yield `None`.
    pub fn from_status(status: &str) -> Option<Self> {
        match status.trim().to_ascii_uppercase().as_str() {
            "VALID" | "VALIDATED" => Some(GatewayVerdict::Succeeded),
            "FAILED" | "UNATTEMPTED" | "EXPIRED" => Some(GatewayVerdict::Failed),
            "CANCELLED" => Some(GatewayVerdict::Cancelled),
            _ => None,
        }
    }

    pub fn payment_status(&self) -> PaymentStatus {
        match self {
            GatewayVerdict::Succeeded => PaymentStatus::Paid,
            GatewayVerdict::Failed => PaymentStatus::Failed,
            GatewayVerdict::Cancelled => PaymentStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifiedCallback {
    pub transaction_id: String,
    pub status: String,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub validation_id: Option<String>,
    pub bank_transaction_id: Option<String>,
    pub signature: String,
}

impl VerifiedCallback {
    /// Reference stored with the settlement.
    pub fn reference(&self) -> Option<String> {
        self.validation_id.clone().or_else(|| self.bank_transaction_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallbackVerdict {
    Succeeded(VerifiedCallback),
    Failed(VerifiedCallback, PaymentStatus),
    Malformed {
        transaction_id: Option<String>,
        reason: String,
    },
}

impl CallbackVerdict {
    pub fn label(&self) -> &'static str {
        match self {
            CallbackVerdict::Succeeded(_) => "succeeded",
            CallbackVerdict::Failed(_, PaymentStatus::Cancelled) => "cancelled",
            CallbackVerdict::Failed(..) => "failed",
            CallbackVerdict::Malformed { .. } => "malformed",
        }
    }

    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            CallbackVerdict::Succeeded(cb) | CallbackVerdict::Failed(cb, _) => Some(&cb.transaction_id),
            CallbackVerdict::Malformed { transaction_id, .. } => transaction_id.as_deref(),
        }
    }
}

fn field(form: &CallbackForm, name: &str) -> Option<String> {
    form.get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Validate a callback form: transaction id format, signature, status word
/// and (for successes) the amount. `tran_id`, `status` and any `amount` must
/// be among the signed fields.
pub fn validate_callback(form: &CallbackForm, verifier: &SignatureVerifier) -> CallbackVerdict {
    let transaction_id = field(form, "tran_id");
    let malformed = |reason: String| CallbackVerdict::Malformed {
        transaction_id: transaction_id.clone(),
        reason,
    };

    let Some(tran_id) = transaction_id.clone() else {
        return malformed("missing tran_id".to_string());
    };
    if !is_valid_transaction_id(&tran_id) {
        return malformed(format!("invalid tran_id {}", tran_id));
    }
    if let Err(e) = verifier.verify(form) {
        return malformed(e.to_string());
    }
    // A valid signature only vouches for the fields it lists
    let signed_fields: Vec<&str> = form
        .get("verify_key")
        .map(|keys| keys.split(',').map(str::trim).collect())
        .unwrap_or_default();
    for name in ["tran_id", "status", "amount"] {
        let required = name != "amount" || form.contains_key(name);
        if required && !signed_fields.contains(&name) {
            return malformed(format!("{} is not signed", name));
        }
    }

    let Some(status) = field(form, "status") else {
        return malformed("missing status".to_string());
    };
    let Some(verdict) = GatewayVerdict::from_status(&status) else {
        return malformed(format!("unknown status {}", status));
    };

    let amount = match field(form, "amount").map(|a| Decimal::from_str(&a)) {
        Some(Ok(amount)) => Some(amount),
        Some(Err(_)) => return malformed("unparseable amount".to_string()),
        None if verdict == GatewayVerdict::Succeeded => return malformed("missing amount".to_string()),
        None => None,
    };

    let callback = VerifiedCallback {
        transaction_id: tran_id,
        status,
        amount,
        currency: field(form, "currency"),
        validation_id: field(form, "val_id"),
        bank_transaction_id: field(form, "bank_tran_id"),
        signature: field(form, "verify_sign").unwrap_or_default(),
    };

    match verdict {
        GatewayVerdict::Succeeded => CallbackVerdict::Succeeded(callback),
        other => CallbackVerdict::Failed(callback, other.payment_status()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn signed(pairs: &[(&str, &str)]) -> CallbackForm {
        let mut form: CallbackForm = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        SignatureVerifier::new("pw").sign(&mut form);
        form
    }

    #[test]
    fn test_transaction_ids() {
        let id = new_transaction_id();
        assert!(id.starts_with("MKT"));
        assert_eq!(id.len(), 35);
        assert!(is_valid_transaction_id(&id));

        assert!(!is_valid_transaction_id("MKT123"));
        assert!(!is_valid_transaction_id("XYZ0123456789abcdef0123456789abcdef"));
        assert!(!is_valid_transaction_id("MKT0123456789abcdef0123456789abcdeg"));
    }

    #[test]
    fn test_valid_success_callback() {
        let tran_id = new_transaction_id();
        let form = signed(&[("tran_id", tran_id.as_str()), ("status", "VALID"), ("amount", "1420.00"), ("val_id", "V1")]);

        match validate_callback(&form, &SignatureVerifier::new("pw")) {
            CallbackVerdict::Succeeded(cb) => {
                assert_eq!(cb.transaction_id, tran_id);
                assert_eq!(cb.amount, Some(dec!(1420)));
                assert_eq!(cb.reference().as_deref(), Some("V1"));
            }
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_failure_statuses() {
        let tran_id = new_transaction_id();
        let verifier = SignatureVerifier::new("pw");

        let failed = validate_callback(&signed(&[("tran_id", tran_id.as_str()), ("status", "FAILED")]), &verifier);
        assert!(matches!(failed, CallbackVerdict::Failed(_, PaymentStatus::Failed)));

        let cancelled = validate_callback(&signed(&[("tran_id", tran_id.as_str()), ("status", "CANCELLED")]), &verifier);
        assert!(matches!(cancelled, CallbackVerdict::Failed(_, PaymentStatus::Cancelled)));
    }

    #[test]
    fn test_malformed_callbacks() {
        let verifier = SignatureVerifier::new("pw");
        let tran_id = new_transaction_id();

        let unsigned: CallbackForm = [("tran_id", tran_id.as_str()), ("status", "VALID")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(matches!(validate_callback(&unsigned, &verifier), CallbackVerdict::Malformed { .. }));

        let bad_id = signed(&[("tran_id", "ORDER-1"), ("status", "VALID"), ("amount", "1")]);
        assert!(matches!(validate_callback(&bad_id, &verifier), CallbackVerdict::Malformed { .. }));

        let unknown = signed(&[("tran_id", tran_id.as_str()), ("status", "PENDING_REVIEW")]);
        assert!(matches!(validate_callback(&unknown, &verifier), CallbackVerdict::Malformed { .. }));

        let no_amount = signed(&[("tran_id", tran_id.as_str()), ("status", "VALID")]);
        let verdict = validate_callback(&no_amount, &verifier);
        assert_eq!(verdict.transaction_id(), Some(tran_id.as_str()));
        assert!(matches!(verdict, CallbackVerdict::Malformed { .. }));
    }

    #[test]
    fn test_fields_outside_the_signature_are_not_trusted() {
        let verifier = SignatureVerifier::new("pw");
        let tran_id = new_transaction_id();

        // Signature covers only the validation id; status and amount ride along unsigned
        let mut status_added = signed(&[("tran_id", tran_id.as_str()), ("val_id", "V1")]);
        status_added.insert("status".to_string(), "VALID".to_string());
        status_added.insert("amount".to_string(), "1420.00".to_string());
        assert!(verifier.verify(&status_added).is_ok());
        match validate_callback(&status_added, &verifier) {
            CallbackVerdict::Malformed { reason, .. } => assert_eq!(reason, "status is not signed"),
            other => panic!("unexpected verdict {:?}", other),
        }

        let mut amount_added = signed(&[("tran_id", tran_id.as_str()), ("status", "VALID")]);
        amount_added.insert("amount".to_string(), "1.00".to_string());
        match validate_callback(&amount_added, &verifier) {
            CallbackVerdict::Malformed { reason, .. } => assert_eq!(reason, "amount is not signed"),
            other => panic!("unexpected verdict {:?}", other),
        }

        let mut id_unsigned = signed(&[("status", "FAILED"), ("val_id", "V1")]);
        id_unsigned.insert("tran_id".to_string(), tran_id.clone());
        assert!(matches!(validate_callback(&id_unsigned, &verifier), CallbackVerdict::Malformed { .. }));
    }

    #[test]
    fn test_failure_without_amount_is_accepted() {
        let verifier = SignatureVerifier::new("pw");
        let tran_id = new_transaction_id();
        let failed = signed(&[("tran_id", tran_id.as_str()), ("status", "FAILED")]);
        let verdict = validate_callback(&failed, &verifier);
        assert!(matches!(verdict, CallbackVerdict::Failed(ref cb, PaymentStatus::Failed) if cb.amount.is_none()));
    }
}
