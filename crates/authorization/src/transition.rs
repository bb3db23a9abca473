//! Lifecycle transition guard.
//!
//! The table below is the complete set of legal edges. Anything not listed,
//! including a transition to the current state, is rejected.
//!
//! | From | To |
//! |------|----|
//! | `DRAFT` | `SUBMITTED` |
//! | `SUBMITTED` | `IN_REVIEW`, `REJECTED` |
//! | `IN_REVIEW` | `APPROVED`, `DENIED`, `PENDING_INFO` |
//! | `PENDING_INFO` | `IN_REVIEW`, `DENIED` |
//! | `APPROVED` | `EXPIRED`, `REVOKED` |
//! | `DENIED`, `EXPIRED`, `REVOKED`, `REJECTED` | none |

use chrono::{DateTime, Utc};

use crate::{
    error::AuthorizationError,
    model::{Authorization, AuthorizationStatus},
};

/// Status every new authorization starts in.
pub const INITIAL_STATUS: AuthorizationStatus = AuthorizationStatus::Draft;

/// States reachable from `current` in one step.
#[must_use]
pub fn allowed_transitions(current: AuthorizationStatus) -> &'static [AuthorizationStatus] {
    use crate::model::AuthorizationStatus::*;

    match current {
        Draft => &[Submitted],
        Submitted => &[InReview, Rejected],
        InReview => &[Approved, Denied, PendingInfo],
        PendingInfo => &[InReview, Denied],
        Approved => &[Expired, Revoked],
        Denied | Expired | Revoked | Rejected => &[],
    }
}

/// Returns `true` if `current -> next` is a legal edge.
#[must_use]
pub fn can_transition(current: AuthorizationStatus, next: AuthorizationStatus) -> bool {
    current != next && allowed_transitions(current).contains(&next)
}

/// Moves `record` to `next` if the edge is legal.
///
/// On error the record is left untouched.
///
/// # Errors
///
/// Returns [`AuthorizationError::InvalidTransition`] for any edge not in the
/// lifecycle table.
pub fn apply_transition(
    record: &mut Authorization,
    next: AuthorizationStatus,
    now: DateTime<Utc>,
) -> Result<(), AuthorizationError> {
    let current = record.status();
    if !can_transition(current, next) {
        return Err(AuthorizationError::InvalidTransition { current, attempted: next });
    }
    record.set_status(next, now);
    Ok(())
}
