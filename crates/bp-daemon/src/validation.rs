// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request validation for the daemon API, applied before a body reaches
//! the lease/queue/context/bridge crates that already enforce their own
//! domain rules.

use bp_json_guard::{validate_json_object, JsonGuardLimits};

/// Validates incoming API requests before processing.
pub struct RequestValidator;

/// Maximum nesting depth accepted for any request body.
const MAX_BODY_DEPTH: usize = 12;

/// Maximum serialized size accepted for any request body.
const MAX_BODY_BYTES: usize = 4_000_000;

/// Maximum allowed length for a free-form identifier (`sessionId`, `clientId`, `projectKey`).
const MAX_IDENTIFIER_LENGTH: usize = 256;

impl RequestValidator {
    /// Validate the shape of a raw JSON body: must be an object, within the
    /// depth/size caps shared by every endpoint on this boundary.
    pub fn validate_body_shape(body: &serde_json::Value) -> Result<(), Vec<String>> {
        let errors = validate_json_object(body, JsonGuardLimits::new(MAX_BODY_DEPTH, MAX_BODY_BYTES));
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate a caller-supplied identifier (`sessionId`, `clientId`, `projectKey`, ...).
    pub fn validate_identifier(name: &str, value: &str) -> Result<(), String> {
        if value.is_empty() {
            return Err(format!("{name} must not be empty"));
        }
        if value.len() > MAX_IDENTIFIER_LENGTH {
            return Err(format!(
                "{name} exceeds maximum length of {MAX_IDENTIFIER_LENGTH}"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_object_body() {
        let body = serde_json::json!({"clientId": "c1", "placeId": 10});
        assert!(RequestValidator::validate_body_shape(&body).is_ok());
    }

    #[test]
    fn rejects_non_object_body() {
        let body = serde_json::json!([1, 2, 3]);
        assert!(RequestValidator::validate_body_shape(&body).is_err());
    }

    #[test]
    fn rejects_overly_deep_body() {
        let body = serde_json::json!({"a": {"b": {"c": {"d": {"e": {"f": {"g": {"h": {"i": {"j": {"k": {"l": {"m": 1}}}}}}}}}}}}});
        assert!(RequestValidator::validate_body_shape(&body).is_err());
    }

    #[test]
    fn empty_identifier_rejected() {
        assert!(RequestValidator::validate_identifier("sessionId", "").is_err());
    }

    #[test]
    fn overlong_identifier_rejected() {
        let long = "x".repeat(300);
        assert!(RequestValidator::validate_identifier("sessionId", &long).is_err());
    }

    #[test]
    fn valid_identifier_accepted() {
        assert!(RequestValidator::validate_identifier("sessionId", "s1").is_ok());
    }
}
