use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{NaiveDate, Weekday};
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Input of the bulk override write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkSlots {
    /// Replace the override of every listed date and lift the unavailable flag.
    Dates(BTreeMap<NaiveDate, Vec<Slot>>),
    /// Drop every override and resolve the provider to nothing until lifted.
    Unavailable,
}

pub fn weekday_from_index(i: u8) -> Option<Weekday> {
    Some(match i {
        0 => Weekday::Mon,
        1 => Weekday::Tue,
        2 => Weekday::Wed,
        3 => Weekday::Thu,
        4 => Weekday::Fri,
        5 => Weekday::Sat,
        6 => Weekday::Sun,
        _ => return None,
    })
}

/// Sort a day's slots by start and reject empty or overlapping ranges.
pub fn normalize_slots(mut slots: Vec<Slot>) -> Result<Vec<Slot>, EngineError> {
    if slots.len() > MAX_SLOTS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many slots in one day"));
    }
    if let Some(bad) = slots.iter().find(|s| s.start >= s.end) {
        return Err(EngineError::validation(format!(
            "slot {}-{} must start before it ends",
            bad.start.format("%H:%M"),
            bad.end.format("%H:%M")
        )));
    }
    slots.sort_by_key(|s| s.start);
    if let Some(pair) = slots.windows(2).find(|w| w[1].start < w[0].end) {
        return Err(EngineError::validation(format!(
            "slots {}-{} and {}-{} overlap",
            pair[0].start.format("%H:%M"),
            pair[0].end.format("%H:%M"),
            pair[1].start.format("%H:%M"),
            pair[1].end.format("%H:%M")
        )));
    }
    Ok(slots)
}

impl Engine {
    pub async fn create_provider(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if let Some(n) = &name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("provider name too long"));
        }
        let _catalog = self.catalog.lock().await;
        if self.state.len() >= MAX_PROVIDERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many providers"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ProviderCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(ProviderState::new(id, name))));
        info!(provider = %id, "provider created");
        Ok(())
    }

    /// Refused while the provider still has active bookings.
    pub async fn delete_provider(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let rs = self.require_provider(id)?;
        let guard = rs.write().await;
        if guard.bookings.iter().any(|b| b.is_active()) {
            return Err(EngineError::HasActiveBookings(id));
        }

        self.wal_append(&Event::ProviderDeleted { id }).await?;
        self.index.forget_provider(&guard);
        self.state.remove(&id);
        info!(provider = %id, "provider deleted");
        Ok(())
    }

    /// Replace one weekday of the weekly template. An empty list clears it.
    pub async fn set_template_day(
        &self,
        provider_id: Ulid,
        weekday: Weekday,
        slots: Vec<Slot>,
    ) -> Result<(), EngineError> {
        let slots = normalize_slots(slots)?;
        let rs = self.require_provider(provider_id)?;
        let mut guard = rs.write().await;
        let event = Event::TemplateDaySet {
            provider_id,
            weekday: weekday.num_days_from_monday() as u8,
            slots,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Replace the override of `date` wholesale. An empty list is a valid
    /// "closed" override that hides the template for that date.
    pub async fn set_date_slots(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
        slots: Vec<Slot>,
    ) -> Result<(), EngineError> {
        let slots = normalize_slots(slots)?;
        let rs = self.require_provider(provider_id)?;
        let mut guard = rs.write().await;
        if !guard.overrides.contains_key(&date) && guard.overrides.len() >= MAX_OVERRIDE_DATES {
            return Err(EngineError::LimitExceeded("too many override dates"));
        }
        let event = Event::DateSlotsSet { provider_id, date, slots };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Remove the override of `date`; the date falls back to the template.
    pub async fn clear_date_slots(&self, provider_id: Ulid, date: NaiveDate) -> Result<(), EngineError> {
        let rs = self.require_provider(provider_id)?;
        let mut guard = rs.write().await;
        if !guard.overrides.contains_key(&date) {
            return Ok(());
        }
        let event = Event::DateSlotsCleared { provider_id, date };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// All dates are validated before any is written; the write is one WAL record.
    pub async fn set_multiple_date_slots(
        &self,
        provider_id: Ulid,
        update: BulkSlots,
    ) -> Result<(), EngineError> {
        let event = match update {
            BulkSlots::Unavailable => Event::ProviderMarkedUnavailable { provider_id },
            BulkSlots::Dates(map) => {
                if map.len() > MAX_BULK_DATES {
                    return Err(EngineError::LimitExceeded("too many dates in one update"));
                }
                let dates = map
                    .into_iter()
                    .map(|(date, slots)| Ok((date, normalize_slots(slots)?)))
                    .collect::<Result<Vec<_>, EngineError>>()?;
                Event::DateSlotsBulkSet { provider_id, dates }
            }
        };

        let rs = self.require_provider(provider_id)?;
        let mut guard = rs.write().await;
        if let Event::DateSlotsBulkSet { dates, .. } = &event {
            let added = dates
                .iter()
                .filter(|(d, _)| !guard.overrides.contains_key(d))
                .count();
            if guard.overrides.len() + added > MAX_OVERRIDE_DATES {
                return Err(EngineError::LimitExceeded("too many override dates"));
            }
        }
        self.persist_and_apply(&mut guard, &event).await?;
        if matches!(event, Event::ProviderMarkedUnavailable { .. }) {
            info!(provider = %provider_id, "provider marked unavailable");
        }
        Ok(())
    }

    /// Lift the unavailable flag without touching overrides.
    pub async fn mark_available(&self, provider_id: Ulid) -> Result<(), EngineError> {
        let rs = self.require_provider(provider_id)?;
        let mut guard = rs.write().await;
        if !guard.unavailable {
            return Ok(());
        }
        let event = Event::ProviderMarkedAvailable { provider_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn get_template(&self, provider_id: Ulid) -> Result<WeeklyTemplate, EngineError> {
        let rs = self.require_provider(provider_id)?;
        let guard = rs.read().await;
        Ok(guard.template.clone())
    }

    pub async fn get_overrides(
        &self,
        provider_id: Ulid,
    ) -> Result<BTreeMap<NaiveDate, Vec<Slot>>, EngineError> {
        let rs = self.require_provider(provider_id)?;
        let guard = rs.read().await;
        Ok(guard.overrides.clone())
    }
}
