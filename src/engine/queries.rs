use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{free_slots, resolve_dates};
use super::{Engine, EngineError};

impl Engine {
    /// Free dates of a provider over `[from, to]`.
    ///
    /// `from` defaults to today and `to` to the end of the default window.
    /// A requester at the booking cap gets no dates, only the cooldown.
    pub async fn resolve(
        &self,
        provider_id: Ulid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        requester_id: Option<&str>,
    ) -> Result<Availability, EngineError> {
        let rs = self.require_provider(provider_id)?;
        let today = self.today();
        let from = from.unwrap_or(today);
        let window = u64::from(self.settings.default_window_days.max(1)) - 1;
        let to = match to {
            Some(to) => to,
            None => from
                .checked_add_days(Days::new(window))
                .ok_or_else(|| EngineError::validation("date out of range"))?,
        };
        if to < from {
            return Err(EngineError::validation(format!("empty date range {from}..{to}")));
        }
        if (to - from).num_days() + 1 > MAX_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }

        if let Some(cooldown) = requester_id.and_then(|r| self.cooldown_for(r)) {
            return Ok(Availability {
                dates: Vec::new(),
                cooldown_until: Some(cooldown),
            });
        }

        let guard = rs.read().await;
        let dates = resolve_dates(&guard, from, to, today, self.settings.offset).collect();
        Ok(Availability {
            dates,
            cooldown_until: None,
        })
    }

    /// Today's free slots. Always answers for today, possibly with no slots.
    pub async fn resolve_for_today(&self, provider_id: Ulid) -> Result<DateSlots, EngineError> {
        let rs = self.require_provider(provider_id)?;
        let today = self.today();
        let guard = rs.read().await;
        Ok(DateSlots {
            date: today,
            slots: free_slots(&guard, today, self.settings.offset),
        })
    }

    /// Today's free slots as seen by `requester_id`. A capped requester
    /// still gets today's row, empty and carrying the cooldown.
    pub async fn resolve_today_for(
        &self,
        provider_id: Ulid,
        requester_id: Option<&str>,
    ) -> Result<Availability, EngineError> {
        let mut today = self.resolve_for_today(provider_id).await?;
        let cooldown_until = requester_id.and_then(|r| self.cooldown_for(r));
        if cooldown_until.is_some() {
            today.slots.clear();
        }
        Ok(Availability {
            dates: vec![today],
            cooldown_until,
        })
    }

    pub async fn list_providers(&self) -> Vec<ProviderInfo> {
        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for rs in shared {
            let guard = rs.read().await;
            out.push(ProviderInfo {
                id: guard.id,
                name: guard.name.clone(),
                available: !guard.unavailable,
            });
        }
        out.sort_by_key(|p| p.id);
        out
    }
}
