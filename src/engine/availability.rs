use chrono::{FixedOffset, NaiveDate};

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Free slots of one date: the override (or weekday template) minus every
/// slot an active booking touches, minus slots marked unavailable.
///
/// Any intersection removes the slot, not only an exact match, so a booking
/// made against an older layout still blocks the slots it covers.
pub fn free_slots(ps: &ProviderState, date: NaiveDate, offset: FixedOffset) -> Vec<Slot> {
    ps.base_slots(date)
        .iter()
        .filter(|slot| slot.available)
        .filter(|slot| match slot.span_on(date, offset) {
            Some(span) => ps.active_overlapping(&span).next().is_none(),
            None => false,
        })
        .copied()
        .collect()
}

/// Walk `[from, to]` one date at a time, yielding only dates with free slots.
/// Dates before `today` are skipped. The iterator borrows the provider and
/// holds no other state, so it can be dropped early and rebuilt at will.
pub fn resolve_dates(
    ps: &ProviderState,
    from: NaiveDate,
    to: NaiveDate,
    today: NaiveDate,
    offset: FixedOffset,
) -> impl Iterator<Item = DateSlots> + '_ {
    from.max(today)
        .iter_days()
        .take_while(move |date| *date <= to)
        .filter_map(move |date| {
            let slots = free_slots(ps, date, offset);
            (!slots.is_empty()).then_some(DateSlots { date, slots })
        })
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveTime, Offset, Utc, Weekday};
    use ulid::Ulid;

    use super::*;

    fn utc() -> FixedOffset {
        Utc.fix()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn slot(sh: u32, sm: u32, eh: u32, em: u32) -> Slot {
        Slot::new(
            NaiveTime::from_hms_opt(sh, sm, 0).unwrap(),
            NaiveTime::from_hms_opt(eh, em, 0).unwrap(),
        )
    }

    fn booking_on(ps: &ProviderState, date: NaiveDate, s: Slot, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            provider_id: ps.id,
            requester_id: None,
            span: s.span_on(date, utc()).unwrap(),
            mode: Mode::InPerson,
            kind: BookingKind::Session,
            status,
            notes: None,
            created_at: 0,
            completed_at: None,
        }
    }

    fn provider_with_monday() -> ProviderState {
        let mut ps = ProviderState::new(Ulid::new(), Some("Dr. Rao".into()));
        ps.template
            .set_day(Weekday::Mon, vec![slot(10, 0, 10, 30), slot(11, 0, 11, 30)]);
        ps
    }

    #[test]
    fn template_applies_to_matching_weekday() {
        let ps = provider_with_monday();
        // 2024-01-01 Mon, 2024-01-02 Tue
        assert_eq!(free_slots(&ps, d(2024, 1, 1), utc()).len(), 2);
        assert!(free_slots(&ps, d(2024, 1, 2), utc()).is_empty());
    }

    #[test]
    fn empty_override_closes_date() {
        let mut ps = provider_with_monday();
        ps.overrides.insert(d(2024, 1, 1), Vec::new());
        assert!(free_slots(&ps, d(2024, 1, 1), utc()).is_empty());
    }

    #[test]
    fn override_does_not_merge_with_template() {
        let mut ps = provider_with_monday();
        ps.overrides.insert(d(2024, 1, 1), vec![slot(15, 0, 15, 30)]);
        assert_eq!(free_slots(&ps, d(2024, 1, 1), utc()), vec![slot(15, 0, 15, 30)]);
    }

    #[test]
    fn hidden_slots_dropped() {
        let mut ps = ProviderState::new(Ulid::new(), None);
        let mut hidden = slot(9, 0, 9, 30);
        hidden.available = false;
        ps.overrides.insert(d(2024, 1, 3), vec![hidden, slot(10, 0, 10, 30)]);
        assert_eq!(free_slots(&ps, d(2024, 1, 3), utc()), vec![slot(10, 0, 10, 30)]);
    }

    #[test]
    fn active_booking_removes_slot() {
        let mut ps = provider_with_monday();
        let b = booking_on(&ps, d(2024, 1, 1), slot(10, 0, 10, 30), BookingStatus::Approved);
        ps.insert_booking(b);
        assert_eq!(free_slots(&ps, d(2024, 1, 1), utc()), vec![slot(11, 0, 11, 30)]);
        // Next Monday untouched
        assert_eq!(free_slots(&ps, d(2024, 1, 8), utc()).len(), 2);
    }

    #[test]
    fn partial_overlap_removes_slot() {
        let mut ps = provider_with_monday();
        let b = booking_on(&ps, d(2024, 1, 1), slot(10, 15, 10, 45), BookingStatus::Booked);
        ps.insert_booking(b);
        assert_eq!(free_slots(&ps, d(2024, 1, 1), utc()), vec![slot(11, 0, 11, 30)]);
    }

    #[test]
    fn inactive_booking_keeps_slot() {
        let mut ps = provider_with_monday();
        for status in [BookingStatus::Cancelled, BookingStatus::Completed] {
            let b = booking_on(&ps, d(2024, 1, 1), slot(10, 0, 10, 30), status);
            ps.insert_booking(b);
        }
        assert_eq!(free_slots(&ps, d(2024, 1, 1), utc()).len(), 2);
    }

    #[test]
    fn resolve_skips_past_and_empty_dates() {
        let ps = provider_with_monday();
        // Today is Wednesday 2024-01-03; range covers two Mondays
        let got: Vec<NaiveDate> = resolve_dates(&ps, d(2024, 1, 1), d(2024, 1, 14), d(2024, 1, 3), utc())
            .map(|ds| ds.date)
            .collect();
        assert_eq!(got, vec![d(2024, 1, 8)]);
    }

    #[test]
    fn resolve_is_lazy_and_restartable() {
        let ps = provider_with_monday();
        let today = d(2024, 1, 1);
        let first: Vec<_> = resolve_dates(&ps, today, d(2024, 12, 31), today, utc())
            .take(2)
            .collect();
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].date, d(2024, 1, 8));

        // A fresh walk sees the same prefix
        let again: Vec<_> = resolve_dates(&ps, today, d(2024, 12, 31), today, utc())
            .take(2)
            .collect();
        assert_eq!(first, again);
    }

    #[test]
    fn unavailable_provider_resolves_nothing() {
        let mut ps = provider_with_monday();
        ps.unavailable = true;
        let today = d(2024, 1, 1);
        assert_eq!(resolve_dates(&ps, today, d(2024, 1, 31), today, utc()).count(), 0);
    }
}
