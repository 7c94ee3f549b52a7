use std::collections::BTreeMap;

use chrono::{Datelike, FixedOffset, NaiveDate, NaiveTime, TimeZone, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every booking instant is stored this way.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Schedule ─────────────────────────────────────────────────────

/// A bookable time-of-day range. `available = false` keeps the slot on the
/// schedule but hides it from requesters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub available: bool,
}

impl Slot {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end, available: true }
    }

    /// The exact instants this slot covers on `date` in the schedule's zone.
    pub fn span_on(&self, date: NaiveDate, offset: FixedOffset) -> Option<Span> {
        let start = offset.from_local_datetime(&date.and_time(self.start)).single()?;
        let end = offset.from_local_datetime(&date.and_time(self.end)).single()?;
        let (start, end) = (start.timestamp_millis(), end.timestamp_millis());
        (start < end).then(|| Span::new(start, end))
    }
}

/// Serialized form used in the `slots` JSON column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    pub start: String,
    pub end: String,
    pub available: bool,
}

impl From<&Slot> for SlotView {
    fn from(slot: &Slot) -> Self {
        Self {
            start: slot.start.format("%H:%M").to_string(),
            end: slot.end.format("%H:%M").to_string(),
            available: slot.available,
        }
    }
}

/// One slot list per weekday, Monday first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyTemplate {
    pub days: [Vec<Slot>; 7],
}

impl WeeklyTemplate {
    pub fn day(&self, weekday: Weekday) -> &[Slot] {
        &self.days[weekday.num_days_from_monday() as usize]
    }

    pub fn set_day(&mut self, weekday: Weekday, slots: Vec<Slot>) {
        self.days[weekday.num_days_from_monday() as usize] = slots;
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    InPerson,
    Remote,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::InPerson => "in_person",
            Mode::Remote => "remote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "in_person" | "offline" | "in-person" => Some(Mode::InPerson),
            "remote" | "online" => Some(Mode::Remote),
            _ => None,
        }
    }
}

/// Which lifecycle a booking follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingKind {
    /// Needs authority approval: booked → approved → completed.
    Session,
    /// Confirmed on reserve; cancelling removes it.
    Appointment,
}

impl BookingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingKind::Session => "session",
            BookingKind::Appointment => "appointment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "session" => Some(BookingKind::Session),
            "appointment" => Some(BookingKind::Appointment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Booked,
    Approved,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Active bookings occupy their slot and count toward the requester cap.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Booked | BookingStatus::Approved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Booked => "booked",
            BookingStatus::Approved => "approved",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub provider_id: Ulid,
    /// `None` for guest bookings.
    pub requester_id: Option<String>,
    pub span: Span,
    pub mode: Mode,
    pub kind: BookingKind,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub completed_at: Option<Ms>,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

// ── Provider state ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProviderState {
    pub id: Ulid,
    pub name: Option<String>,
    pub template: WeeklyTemplate,
    /// A present key fully replaces the template for that date, even if empty.
    pub overrides: BTreeMap<NaiveDate, Vec<Slot>>,
    /// Set by the bulk "not available" update; every date resolves empty.
    pub unavailable: bool,
    /// All bookings of this provider, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl ProviderState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            template: WeeklyTemplate::default(),
            overrides: BTreeMap::new(),
            unavailable: false,
            bookings: Vec::new(),
        }
    }

    /// Slots defined for `date` before any booking is subtracted.
    pub fn base_slots(&self, date: NaiveDate) -> &[Slot] {
        if self.unavailable {
            return &[];
        }
        match self.overrides.get(&date) {
            Some(slots) => slots,
            None => self.template.day(date.weekday()),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings of any status whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(|b| b.is_active())
    }
}

/// The WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProviderCreated {
        id: Ulid,
        name: Option<String>,
    },
    ProviderDeleted {
        id: Ulid,
    },
    TemplateDaySet {
        provider_id: Ulid,
        /// 0 = Monday.
        weekday: u8,
        slots: Vec<Slot>,
    },
    DateSlotsSet {
        provider_id: Ulid,
        date: NaiveDate,
        slots: Vec<Slot>,
    },
    DateSlotsCleared {
        provider_id: Ulid,
        date: NaiveDate,
    },
    /// Bulk override write; also lifts the unavailable flag.
    DateSlotsBulkSet {
        provider_id: Ulid,
        dates: Vec<(NaiveDate, Vec<Slot>)>,
    },
    /// Drops every override and hides the provider.
    ProviderMarkedUnavailable {
        provider_id: Ulid,
    },
    ProviderMarkedAvailable {
        provider_id: Ulid,
    },
    BookingReserved {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        provider_id: Ulid,
        status: BookingStatus,
        at: Ms,
    },
    BookingDeleted {
        id: Ulid,
        provider_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub available: bool,
}

/// Free slots of one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateSlots {
    pub date: NaiveDate,
    pub slots: Vec<Slot>,
}

/// Resolver output. A capped requester gets no dates and a cooldown.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Availability {
    pub dates: Vec<DateSlots>,
    pub cooldown_until: Option<NaiveDate>,
}

/// Requester standing against the booking cap, derived from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaState {
    pub requester_id: String,
    pub active_count: usize,
    pub earliest: Option<NaiveDate>,
    pub limit: usize,
    /// First date a new reservation is accepted, if currently blocked.
    pub blocked_until: Option<NaiveDate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            provider_id: Ulid::nil(),
            requester_id: None,
            span: Span::new(start, end),
            mode: Mode::Remote,
            kind: BookingKind::Session,
            status,
            notes: None,
            created_at: 0,
            completed_at: None,
        }
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        assert!(a.overlaps(&Span::new(150, 250)));
        assert!(!a.overlaps(&Span::new(200, 300)));
        assert!(a.overlaps(&Span::new(199, 201)));
    }

    #[test]
    fn slot_span_respects_offset() {
        let slot = Slot::new(t(10, 0), t(10, 30));
        let utc = FixedOffset::east_opt(0).unwrap();
        let span = slot.span_on(d(2024, 1, 1), utc).unwrap();
        assert_eq!(span.start, 1_704_103_200_000);
        assert_eq!(span.duration_ms(), 30 * 60_000);

        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let shifted = slot.span_on(d(2024, 1, 1), plus_two).unwrap();
        assert_eq!(span.start - shifted.start, 2 * 3_600_000);
    }

    #[test]
    fn override_replaces_template() {
        let mut p = ProviderState::new(Ulid::new(), None);
        p.template.set_day(Weekday::Mon, vec![Slot::new(t(10, 0), t(10, 30))]);
        // 2024-01-01 is a Monday
        assert_eq!(p.base_slots(d(2024, 1, 1)).len(), 1);
        assert_eq!(p.base_slots(d(2024, 1, 8)).len(), 1);

        p.overrides.insert(d(2024, 1, 1), Vec::new());
        assert!(p.base_slots(d(2024, 1, 1)).is_empty());
        assert_eq!(p.base_slots(d(2024, 1, 8)).len(), 1);
    }

    #[test]
    fn unavailable_provider_has_no_base_slots() {
        let mut p = ProviderState::new(Ulid::new(), None);
        p.template.set_day(Weekday::Mon, vec![Slot::new(t(9, 0), t(10, 0))]);
        p.unavailable = true;
        assert!(p.base_slots(d(2024, 1, 1)).is_empty());
    }

    #[test]
    fn bookings_stay_sorted() {
        let mut p = ProviderState::new(Ulid::new(), None);
        p.insert_booking(booking(300, 400, BookingStatus::Booked));
        p.insert_booking(booking(100, 200, BookingStatus::Booked));
        p.insert_booking(booking(200, 300, BookingStatus::Approved));
        let starts: Vec<Ms> = p.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut p = ProviderState::new(Ulid::new(), None);
        let a = booking(0, 50, BookingStatus::Booked);
        let b = booking(100, 150, BookingStatus::Booked);
        let c = booking(200, 250, BookingStatus::Booked);
        let (ia, ib, ic) = (a.id, b.id, c.id);
        p.insert_booking(a);
        p.insert_booking(b);
        p.insert_booking(c);
        assert!(p.remove_booking(ib).is_some());
        assert!(p.remove_booking(ib).is_none());
        let ids: Vec<Ulid> = p.bookings.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![ia, ic]);
    }

    #[test]
    fn active_overlapping_skips_cancelled() {
        let mut p = ProviderState::new(Ulid::new(), None);
        p.insert_booking(booking(100, 200, BookingStatus::Cancelled));
        p.insert_booking(booking(450, 600, BookingStatus::Booked));
        p.insert_booking(booking(1000, 1100, BookingStatus::Approved));

        let query = Span::new(100, 800);
        assert_eq!(p.overlapping(&query).count(), 2);
        let active: Vec<_> = p.active_overlapping(&query).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut p = ProviderState::new(Ulid::new(), None);
        p.insert_booking(booking(100, 200, BookingStatus::Booked));
        assert_eq!(p.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(p.overlapping(&Span::new(0, 100)).count(), 0);
        assert_eq!(p.overlapping(&Span::new(199, 300)).count(), 1);
    }

    #[test]
    fn status_activity() {
        assert!(BookingStatus::Booked.is_active());
        assert!(BookingStatus::Approved.is_active());
        assert!(!BookingStatus::Completed.is_active());
        assert!(!BookingStatus::Cancelled.is_active());
    }

    #[test]
    fn mode_accepts_legacy_names() {
        assert_eq!(Mode::parse("Online"), Some(Mode::Remote));
        assert_eq!(Mode::parse("offline"), Some(Mode::InPerson));
        assert_eq!(Mode::parse("in_person"), Some(Mode::InPerson));
        assert_eq!(Mode::parse("carrier pigeon"), None);
    }

    #[test]
    fn event_survives_bincode() {
        let event = Event::DateSlotsBulkSet {
            provider_id: Ulid::new(),
            dates: vec![(d(2024, 1, 1), vec![Slot::new(t(10, 0), t(10, 30))])],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
