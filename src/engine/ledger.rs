use chrono::NaiveDate;
use tracing::debug;
use ulid::Ulid;

use crate::clock::day_start_ms;
use crate::limits::*;
use crate::model::*;

use super::conflict::check_no_conflict;
use super::{Engine, EngineError, SharedProviderState};

/// Everything needed to place one booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    pub id: Ulid,
    pub provider_id: Ulid,
    /// `None` books as a guest.
    pub requester_id: Option<String>,
    pub span: Span,
    pub mode: Mode,
    pub kind: BookingKind,
    pub notes: Option<String>,
}

impl Engine {
    /// Re-check overlap and write the booking, all under the provider's
    /// write lock. Either the whole booking lands or nothing does.
    pub(super) async fn commit_reservation(
        &self,
        rs: SharedProviderState,
        req: ReserveRequest,
    ) -> Result<Booking, EngineError> {
        let mut guard = rs.write().await;
        // Deleted while we waited for the lock
        if !self.state.contains_key(&req.provider_id) {
            return Err(EngineError::NotFound(req.provider_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many bookings on provider"));
        }
        check_no_conflict(&guard, &req.span)?;

        let booking = Booking {
            id: req.id,
            provider_id: req.provider_id,
            requester_id: req.requester_id,
            span: req.span,
            mode: req.mode,
            kind: req.kind,
            status: BookingStatus::Booked,
            notes: req.notes,
            created_at: self.now_ms(),
            completed_at: None,
        };
        let event = Event::BookingReserved {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(booking)
    }

    /// Give a slot back. Sessions flip to cancelled and stay on record;
    /// appointments are removed. Releasing something already released is a no-op.
    pub async fn release(&self, id: Ulid) -> Result<(), EngineError> {
        let Some(provider_id) = self.provider_for_booking(&id) else {
            return if self.index.tombstones.contains_key(&id) {
                Ok(())
            } else {
                Err(EngineError::NotFound(id))
            };
        };
        let rs = self.require_provider(provider_id)?;
        let mut guard = rs.write().await;
        let Some(booking) = guard.booking(id) else {
            // Removed by a concurrent release
            return Ok(());
        };
        if !booking.is_active() {
            debug!(booking = %id, status = booking.status.as_str(), "release: already inactive");
            return Ok(());
        }
        let event = match booking.kind {
            BookingKind::Session => Event::BookingStatusChanged {
                id,
                provider_id,
                status: BookingStatus::Cancelled,
                at: self.now_ms(),
            },
            BookingKind::Appointment => Event::BookingDeleted { id, provider_id },
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Active bookings of a provider starting on or after `from`.
    pub async fn list_active(
        &self,
        provider_id: Ulid,
        from: NaiveDate,
    ) -> Result<Vec<Booking>, EngineError> {
        let rs = self.require_provider(provider_id)?;
        let from_ms = day_start_ms(from, self.settings.offset)
            .ok_or_else(|| EngineError::validation(format!("date out of range: {from}")))?;
        let guard = rs.read().await;
        let start = guard.bookings.partition_point(|b| b.span.start < from_ms);
        Ok(guard.bookings[start..]
            .iter()
            .filter(|b| b.is_active())
            .cloned()
            .collect())
    }

    /// Every booking on record for a provider, any status.
    pub async fn list_bookings(&self, provider_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let rs = self.require_provider(provider_id)?;
        let guard = rs.read().await;
        Ok(guard.bookings.clone())
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let provider_id = self
            .provider_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self.require_provider(provider_id)?;
        let guard = rs.read().await;
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }
}
