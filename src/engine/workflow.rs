use chrono::FixedOffset;
use tracing::info;
use ulid::Ulid;

use crate::clock::date_of;
use crate::model::*;
use crate::notify::Notification;

use super::error::Action;
use super::{Engine, EngineError};

/// Proof that the caller acts for the approving authority. Only the
/// connection layer hands these out, after it has checked the login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    name: String,
}

impl Authority {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// What an allowed transition does to the booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    To(BookingStatus),
    Remove,
}

/// The approval state machine. `None` means the move is not allowed.
pub fn next_step(kind: BookingKind, from: BookingStatus, action: Action) -> Option<Step> {
    use BookingStatus::*;
    match (kind, from, action) {
        (BookingKind::Session, Booked, Action::Approve) => Some(Step::To(Approved)),
        (BookingKind::Session, Booked | Approved, Action::Cancel) => Some(Step::To(Cancelled)),
        (BookingKind::Session, Approved, Action::Complete) => Some(Step::To(Completed)),
        (BookingKind::Appointment, Booked, Action::Cancel) => Some(Step::Remove),
        _ => None,
    }
}

fn notification_for(
    booking: &Booking,
    from: BookingStatus,
    action: Action,
    provider: &str,
    offset: FixedOffset,
) -> Option<Notification> {
    let recipient = booking.requester_id.clone()?;
    let noun = match booking.kind {
        BookingKind::Session => "session",
        BookingKind::Appointment => "appointment",
    };
    let verb = match (action, from) {
        (Action::Approve, _) => "approved",
        (Action::Cancel, BookingStatus::Booked) if booking.kind == BookingKind::Session => "rejected",
        (Action::Cancel, _) => "cancelled",
        (Action::Complete, _) => return None,
    };
    let start = chrono::DateTime::from_timestamp_millis(booking.span.start)?.with_timezone(&offset);
    let date = date_of(booking.span.start, offset)?;
    Some(Notification {
        recipient,
        subject: format!("Your {noun} is {verb}"),
        body: format!(
            "Your {noun} with {provider} on {date} at {} has been {verb}.",
            start.format("%H:%M")
        ),
    })
}

impl Engine {
    /// Move a booking through the approval workflow. Approve and cancel
    /// notify the requester after the change is durable. Delivery runs in
    /// the background; a slow or failed notification never undoes or delays it.
    pub async fn transition(
        &self,
        authority: &Authority,
        id: Ulid,
        action: Action,
    ) -> Result<Booking, EngineError> {
        let provider_id = self
            .provider_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self.require_provider(provider_id)?;
        let mut guard = rs.write().await;
        let before = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        let step = next_step(before.kind, before.status, action).ok_or(
            EngineError::InvalidTransition {
                from: before.status,
                action,
            },
        )?;

        let now = self.now_ms();
        let mut after = before.clone();
        let event = match step {
            Step::To(status) => {
                after.status = status;
                if status == BookingStatus::Completed {
                    after.completed_at = Some(now);
                }
                Event::BookingStatusChanged { id, provider_id, status, at: now }
            }
            Step::Remove => {
                after.status = BookingStatus::Cancelled;
                Event::BookingDeleted { id, provider_id }
            }
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let provider = guard.name.clone().unwrap_or_else(|| provider_id.to_string());
        drop(guard);

        info!(
            authority = authority.name(),
            booking = %id,
            action = action.as_str(),
            "{} -> {}",
            before.status.as_str(),
            after.status.as_str()
        );
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "action" => action.as_str())
            .increment(1);

        if let Some(note) = notification_for(&before, before.status, action, &provider, self.settings.offset) {
            self.notify.dispatch(note);
        }
        Ok(after)
    }
}
