use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate};
use dashmap::mapref::entry::Entry;
use tracing::info;
use ulid::Ulid;

use crate::clock::{date_of, day_start_ms};
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_span};
use super::error::PolicyReason;
use super::{Engine, EngineError, ReserveRequest, SharedProviderState};

/// Derive a requester's standing from their active bookings.
///
/// Only bookings starting today or later count. At `limit` with today on or
/// before the earliest counted booking, the requester is blocked until the
/// day after it.
pub fn quota_from(
    requester_id: &str,
    active: &[(Ulid, Span)],
    today: NaiveDate,
    offset: FixedOffset,
    limit: usize,
) -> QuotaState {
    let floor = day_start_ms(today, offset).unwrap_or(Ms::MIN);
    let upcoming = active.iter().filter(|(_, span)| span.start >= floor);
    let active_count = upcoming.clone().count();
    let earliest = upcoming
        .map(|(_, span)| span.start)
        .min()
        .and_then(|ms| date_of(ms, offset));

    let blocked_until = match earliest {
        Some(first) if active_count >= limit && today <= first => first.succ_opt(),
        _ => None,
    };

    QuotaState {
        requester_id: requester_id.to_string(),
        active_count,
        earliest,
        limit,
        blocked_until,
    }
}

impl Engine {
    /// Current standing of a requester. Entries that started before today
    /// can never count again and are dropped from the index here.
    pub fn quota(&self, requester_id: &str) -> QuotaState {
        let today = self.today();
        let floor = day_start_ms(today, self.settings.offset).unwrap_or(Ms::MIN);
        let active = match self.index.by_requester.get_mut(requester_id) {
            Some(mut entries) => {
                entries.retain(|(_, span)| span.start >= floor);
                entries.value().clone()
            }
            None => Vec::new(),
        };
        if active.is_empty() {
            self.index
                .by_requester
                .remove_if(requester_id, |_, v| v.is_empty());
        }
        quota_from(
            requester_id,
            &active,
            today,
            self.settings.offset,
            self.settings.max_active_bookings,
        )
    }

    /// Cooldown date if `requester_id` may not book right now.
    pub(super) fn cooldown_for(&self, requester_id: &str) -> Option<NaiveDate> {
        self.quota(requester_id).blocked_until
    }

    /// Policy front door for the ledger. Validates, applies the requester
    /// cap and the direct-booking pre-check, then commits.
    pub async fn reserve(&self, req: ReserveRequest) -> Result<Booking, EngineError> {
        let provider_id = req.provider_id;
        let result = self.reserve_checked(req).await;
        let outcome = match &result {
            Ok(_) => "reserved",
            Err(EngineError::Conflict { .. }) => "conflict",
            Err(EngineError::PolicyViolation { .. }) => "policy",
            Err(_) => "error",
        };
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => outcome)
            .increment(1);
        if let Ok(b) = &result {
            info!(booking = %b.id, provider = %provider_id, kind = b.kind.as_str(), "reserved");
        }
        result
    }

    async fn reserve_checked(&self, req: ReserveRequest) -> Result<Booking, EngineError> {
        validate_span(&req.span, self.now_ms())?;
        if let Some(r) = &req.requester_id {
            if r.is_empty() {
                return Err(EngineError::validation("requester id is empty"));
            }
            if r.len() > MAX_REQUESTER_ID_LEN {
                return Err(EngineError::LimitExceeded("requester id too long"));
            }
        }
        if let Some(n) = &req.notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        if self.index.tombstones.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let rs = self.require_provider(req.provider_id)?;

        // Claim the id before any provider lock, so the same id sent to two
        // providers at once lands on at most one of them.
        let (id, provider_id) = (req.id, req.provider_id);
        match self.index.booking_to_provider.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(provider_id);
            }
        }

        let result = self.reserve_claimed(rs, req).await;
        if result.is_err() {
            self.index
                .booking_to_provider
                .remove_if(&id, |_, pid| *pid == provider_id);
        }
        result
    }

    async fn reserve_claimed(
        &self,
        rs: SharedProviderState,
        req: ReserveRequest,
    ) -> Result<Booking, EngineError> {
        if req.kind == BookingKind::Appointment {
            let guard = rs.read().await;
            check_no_conflict(&guard, &req.span)?;
        }

        let Some(requester) = req.requester_id.clone() else {
            return self.commit_reservation(rs, req).await;
        };

        let lock = self
            .requester_locks
            .entry(requester.clone())
            .or_default()
            .clone();
        let result = {
            let _held = lock.lock().await;
            match self.cooldown_for(&requester) {
                Some(retry_after) => Err(EngineError::PolicyViolation {
                    reason: PolicyReason::BookingLimit,
                    retry_after,
                }),
                None => self.commit_reservation(rs, req).await,
            }
        };
        drop(lock);
        // Only the map still holds it once no reservation is waiting
        self.requester_locks
            .remove_if(&requester, |_, l| Arc::strong_count(l) == 1);
        result
    }
}
