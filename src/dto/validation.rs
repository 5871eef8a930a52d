//! Validation helpers for DTOs.

use validator::ValidationError;

/// Number of characters in a session join code.
pub const JOIN_CODE_LEN: usize = 6;

/// Canonical form of a user-typed join code: trimmed and uppercased.
pub fn normalize_join_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Validates that a join code is six alphanumeric characters, ignoring case and
/// surrounding whitespace.
///
/// # Examples
///
/// ```ignore
/// validate_join_code("k7pq2m")   // Ok
/// validate_join_code(" K7PQ2M ") // Ok
/// validate_join_code("K7PQ2")    // Err - too short
/// ```
pub fn validate_join_code(code: &str) -> Result<(), ValidationError> {
    let code = code.trim();
    if code.chars().count() != JOIN_CODE_LEN {
        let mut err = ValidationError::new("join_code_length");
        err.message = Some(
            format!(
                "Join code must be exactly {JOIN_CODE_LEN} characters (got {})",
                code.chars().count()
            )
            .into(),
        );
        return Err(err);
    }

    if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        let mut err = ValidationError::new("join_code_format");
        err.message = Some("Join code must contain only letters and digits".into());
        return Err(err);
    }

    Ok(())
}

/// Validates that an idempotency key is not blank once trimmed.
pub fn validate_idempotency_key(key: &str) -> Result<(), ValidationError> {
    if key.trim().is_empty() {
        let mut err = ValidationError::new("idempotency_key_blank");
        err.message = Some("Idempotency key must not be blank".into());
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_join_code_valid() {
        assert!(validate_join_code("K7PQ2M").is_ok());
        assert!(validate_join_code("k7pq2m").is_ok());
        assert!(validate_join_code("  ABC234 ").is_ok());
    }

    #[test]
    fn test_validate_join_code_invalid() {
        assert!(validate_join_code("ABC23").is_err()); // too short
        assert!(validate_join_code("ABC2345").is_err()); // too long
        assert!(validate_join_code("ABC-23").is_err()); // punctuation
        assert!(validate_join_code("").is_err());
    }

    #[test]
    fn test_normalize_join_code() {
        assert_eq!(normalize_join_code(" k7pq2m\n"), "K7PQ2M");
    }

    #[test]
    fn test_validate_idempotency_key() {
        assert!(validate_idempotency_key("retry-1").is_ok());
        assert!(validate_idempotency_key("   ").is_err());
    }
}
