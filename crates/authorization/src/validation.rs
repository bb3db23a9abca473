//! Input validation for authorization requests.
//!
//! Validation runs before any collaborator is touched; a rejected request
//! never allocates an id or writes anything.

use crate::{error::AuthorizationError, model::AuthorizationRequest};

/// Longest accepted diagnosis or procedure code.
pub const MAX_CODE_LENGTH: usize = 16;

/// Most codes accepted per list.
pub const MAX_CODES: usize = 50;

/// Checks a request for structural problems.
///
/// # Errors
///
/// Returns [`AuthorizationError::Validation`] if the date window is inverted,
/// either code list is empty or too long, or a code is malformed.
pub fn validate_request(request: &AuthorizationRequest) -> Result<(), AuthorizationError> {
    if request.policy_id.0 <= 0 {
        return Err(AuthorizationError::validation(format!(
            "policy_id must be positive, got {}",
            request.policy_id
        )));
    }
    if request.end_date < request.start_date {
        return Err(AuthorizationError::validation(format!(
            "end_date {} precedes start_date {}",
            request.end_date, request.start_date
        )));
    }
    validate_codes("diagnosis_codes", &request.diagnosis_codes)?;
    validate_codes("procedure_codes", &request.procedure_codes)
}

fn validate_codes(field: &str, codes: &[String]) -> Result<(), AuthorizationError> {
    if codes.is_empty() {
        return Err(AuthorizationError::validation(format!("{field} must not be empty")));
    }
    if codes.len() > MAX_CODES {
        return Err(AuthorizationError::validation(format!(
            "{field} has {} entries, at most {MAX_CODES} allowed",
            codes.len()
        )));
    }
    for (i, code) in codes.iter().enumerate() {
        if code.is_empty() || code.len() > MAX_CODE_LENGTH {
            return Err(AuthorizationError::validation(format!(
                "{field}[{i}] must be 1-{MAX_CODE_LENGTH} characters"
            )));
        }
        if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '.') {
            return Err(AuthorizationError::validation(format!(
                "{field}[{i}] contains invalid characters: {code:?}"
            )));
        }
    }
    Ok(())
}
