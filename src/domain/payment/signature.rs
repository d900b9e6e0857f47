use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};

/// Signature problems on a gateway callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("callback is not signed")]
    Unsigned,

    #[error("signed field {0} is missing")]
    MissingField(String),

    #[error("signature does not match")]
    Mismatch,
}

fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// Verifies the `verify_sign` / `verify_key` pair the gateway attaches to
/// callbacks.
///
/// `verify_key` lists the signed field names. The signature is the SHA-256 of
/// those fields plus `store_passwd` (itself the SHA-256 of the store password),
/// sorted by name and joined as `k=v&k=v`.
#[derive(Clone)]
pub struct SignatureVerifier {
    password_hash: String,
}

impl SignatureVerifier {
    pub fn new(store_password: &str) -> Self {
        Self {
            password_hash: sha256_hex(store_password),
        }
    }

    fn digest(&self, fields: &[(&str, &str)]) -> String {
        let mut sorted: BTreeMap<&str, &str> = BTreeMap::new();
        for &(k, v) in fields {
            sorted.insert(k, v);
        }
        sorted.insert("store_passwd", self.password_hash.as_str());

        let joined = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        sha256_hex(&joined)
    }

    pub fn verify(&self, form: &HashMap<String, String>) -> Result<(), SignatureError> {
        let (Some(sign), Some(keys)) = (form.get("verify_sign"), form.get("verify_key")) else {
            return Err(SignatureError::Unsigned);
        };

        let mut fields = Vec::new();
        for key in keys.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            let value = form
                .get(key)
                .ok_or_else(|| SignatureError::MissingField(key.to_string()))?;
            fields.push((key, value.as_str()));
        }
        if fields.is_empty() {
            return Err(SignatureError::Unsigned);
        }

        if self.digest(&fields).eq_ignore_ascii_case(sign.trim()) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// Add `verify_key` and `verify_sign` over every field currently in `form`.
    pub fn sign(&self, form: &mut HashMap<String, String>) {
        let mut keys: Vec<&String> = form.keys().collect();
        keys.sort();
        let verify_key = keys.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(",");
        let fields: Vec<(&str, &str)> = form.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let verify_sign = self.digest(&fields);

        form.insert("verify_key".to_string(), verify_key);
        form.insert("verify_sign".to_string(), verify_sign);
    }
}
