use crate::limits::*;
use crate::model::*;

use super::error::ConflictReason;
use super::EngineError;

pub(crate) fn validate_span(span: &Span, now: Ms) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::validation("slot must start before it ends"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking longer than a day"));
    }
    if span.end <= now {
        return Err(EngineError::validation("slot has already ended"));
    }
    Ok(())
}

/// Fails if any active booking intersects `span`. Run under the provider's
/// write lock for the authoritative check, or a read lock for a fast fail.
pub(crate) fn check_no_conflict(ps: &ProviderState, span: &Span) -> Result<(), EngineError> {
    match ps.active_overlapping(span).next() {
        Some(existing) => Err(EngineError::Conflict {
            reason: ConflictReason::SlotTaken,
            with: existing.id,
        }),
        None => Ok(()),
    }
}
