mod availability;
mod conflict;
mod error;
mod ledger;
mod policy;
mod queries;
mod schedule;
mod workflow;

pub use availability::{free_slots, resolve_dates};
pub use error::{Action, ConflictReason, EngineError, PolicyReason};
pub use ledger::ReserveRequest;
pub use policy::quota_from;
pub use schedule::{BulkSlots, normalize_slots, weekday_from_index};
pub use workflow::{Authority, Step, next_step};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::warn;
use ulid::Ulid;

use crate::clock::{self, Clock, SystemClock};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

/// Per-engine knobs that are not part of the persisted state.
#[derive(Clone)]
pub struct EngineSettings {
    pub clock: Arc<dyn Clock>,
    /// Zone that slot times and "today" are interpreted in.
    pub offset: FixedOffset,
    /// Future active bookings a requester may hold at once.
    pub max_active_bookings: usize,
    /// Window resolved when a query gives no end date.
    pub default_window_days: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            offset: Utc.fix(),
            max_active_bookings: 2,
            default_window_days: 14,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then pays for a single fsync and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("WAL batch of {} failed: {e}", batch.len());
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stale bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub state: DashMap<Ulid, SharedProviderState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub settings: EngineSettings,
    pub(super) index: LedgerIndex,
    /// Serializes reservations of one requester so the cap check holds.
    pub(super) requester_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Held by provider create/delete and by compaction.
    pub(super) catalog: Mutex<()>,
}

/// Reverse lookups kept in step with every applied event.
#[derive(Default)]
pub(super) struct LedgerIndex {
    /// Booking id → provider id, for bookings that still exist.
    pub booking_to_provider: DashMap<Ulid, Ulid>,
    /// Requester → active bookings (id, span).
    pub by_requester: DashMap<String, Vec<(Ulid, Span)>>,
    /// Appointments removed by cancellation, so repeat releases stay no-ops.
    pub tombstones: DashMap<Ulid, Ulid>,
}

impl LedgerIndex {
    fn track(&self, booking: &Booking) {
        self.booking_to_provider.insert(booking.id, booking.provider_id);
        if let (Some(r), true) = (&booking.requester_id, booking.is_active()) {
            self.by_requester
                .entry(r.clone())
                .or_default()
                .push((booking.id, booking.span));
        }
    }

    fn untrack_active(&self, booking: &Booking) {
        let Some(r) = &booking.requester_id else { return };
        let now_empty = match self.by_requester.get_mut(r) {
            Some(mut entries) => {
                entries.retain(|(id, _)| *id != booking.id);
                entries.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_requester.remove_if(r, |_, v| v.is_empty());
        }
    }

    fn forget_provider(&self, ps: &ProviderState) {
        for b in &ps.bookings {
            self.untrack_active(b);
            self.booking_to_provider.remove(&b.id);
        }
        self.tombstones.retain(|_, pid| *pid != ps.id);
    }
}

/// Apply an event to one provider (caller holds its lock).
fn apply_to_provider(ps: &mut ProviderState, event: &Event, index: &LedgerIndex) {
    match event {
        Event::TemplateDaySet { weekday, slots, .. } => {
            if let Some(day) = weekday_from_index(*weekday) {
                ps.template.set_day(day, slots.clone());
            }
        }
        Event::DateSlotsSet { date, slots, .. } => {
            ps.overrides.insert(*date, slots.clone());
        }
        Event::DateSlotsCleared { date, .. } => {
            ps.overrides.remove(date);
        }
        Event::DateSlotsBulkSet { dates, .. } => {
            for (date, slots) in dates {
                ps.overrides.insert(*date, slots.clone());
            }
            ps.unavailable = false;
        }
        Event::ProviderMarkedUnavailable { .. } => {
            ps.overrides.clear();
            ps.unavailable = true;
        }
        Event::ProviderMarkedAvailable { .. } => {
            ps.unavailable = false;
        }
        Event::BookingReserved { booking } => {
            index.track(booking);
            ps.insert_booking(booking.clone());
        }
        Event::BookingStatusChanged { id, status, at, .. } => {
            if let Some(b) = ps.booking_mut(*id) {
                let was_active = b.is_active();
                b.status = *status;
                if *status == BookingStatus::Completed {
                    b.completed_at = Some(*at);
                }
                if was_active && !status.is_active() {
                    index.untrack_active(b);
                }
            }
        }
        Event::BookingDeleted { id, provider_id } => {
            if let Some(b) = ps.remove_booking(*id) {
                index.untrack_active(&b);
            }
            index.booking_to_provider.remove(id);
            index.tombstones.insert(*id, *provider_id);
        }
        // Handled at the DashMap level
        Event::ProviderCreated { .. } | Event::ProviderDeleted { .. } => {}
    }
}

/// Provider an event belongs to (for everything but create/delete).
fn event_provider_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::TemplateDaySet { provider_id, .. }
        | Event::DateSlotsSet { provider_id, .. }
        | Event::DateSlotsCleared { provider_id, .. }
        | Event::DateSlotsBulkSet { provider_id, .. }
        | Event::ProviderMarkedUnavailable { provider_id }
        | Event::ProviderMarkedAvailable { provider_id }
        | Event::BookingStatusChanged { provider_id, .. }
        | Event::BookingDeleted { provider_id, .. } => Some(*provider_id),
        Event::BookingReserved { booking } => Some(booking.provider_id),
        Event::ProviderCreated { .. } | Event::ProviderDeleted { .. } => None,
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            settings,
            index: LedgerIndex::default(),
            requester_locks: DashMap::new(),
            catalog: Mutex::new(()),
        };

        // Nobody else holds these Arcs yet, so try_* never contends. Blocking
        // variants are off limits: lazy tenant creation runs inside the runtime.
        for event in &events {
            engine.replay_event(event);
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::ProviderCreated { id, name } => {
                let ps = ProviderState::new(*id, name.clone());
                self.state.insert(*id, Arc::new(RwLock::new(ps)));
            }
            Event::ProviderDeleted { id } => {
                if let Some((_, rs)) = self.state.remove(id)
                    && let Ok(guard) = rs.try_read()
                {
                    self.index.forget_provider(&guard);
                }
            }
            other => {
                let Some(rs) = event_provider_id(other).and_then(|pid| self.get_provider(&pid))
                else {
                    return;
                };
                match rs.try_write() {
                    Ok(mut guard) => apply_to_provider(&mut guard, other, &self.index),
                    Err(_) => warn!("replay: provider lock contended, event skipped"),
                };
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply. The caller holds the provider's write lock
    /// across both, which is what makes reservations atomic.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut ProviderState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_provider(ps, event, &self.index);
        Ok(())
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub(super) fn provider_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.index.booking_to_provider.get(booking_id).map(|e| *e.value())
    }

    pub(super) fn require_provider(&self, id: Ulid) -> Result<SharedProviderState, EngineError> {
        self.get_provider(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn now_ms(&self) -> Ms {
        self.settings.clock.now_ms()
    }

    /// Today's date in the schedule's zone.
    pub fn today(&self) -> NaiveDate {
        clock::today(self.settings.clock.as_ref(), self.settings.offset)
    }

    // ── Compaction ───────────────────────────────────────

    /// Rewrite the WAL with only the events needed to rebuild the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;

        let mut ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort();
        // Read locks stay held until the swap so no append slips between
        // the snapshot and the rewrite.
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(rs) = self.get_provider(&id) {
                guards.push(rs.read_owned().await);
            }
        }

        let mut events = Vec::new();
        for ps in &guards {
            snapshot_provider(ps, &mut events);
        }
        for entry in self.index.tombstones.iter() {
            if self.state.contains_key(entry.value()) {
                events.push(Event::BookingDeleted {
                    id: *entry.key(),
                    provider_id: *entry.value(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn snapshot_provider(ps: &ProviderState, events: &mut Vec<Event>) {
    events.push(Event::ProviderCreated {
        id: ps.id,
        name: ps.name.clone(),
    });
    for (i, slots) in ps.template.days.iter().enumerate() {
        if !slots.is_empty() {
            events.push(Event::TemplateDaySet {
                provider_id: ps.id,
                weekday: i as u8,
                slots: slots.clone(),
            });
        }
    }
    // Before the overrides: marking unavailable clears them.
    if ps.unavailable {
        events.push(Event::ProviderMarkedUnavailable { provider_id: ps.id });
    }
    for (date, slots) in &ps.overrides {
        events.push(Event::DateSlotsSet {
            provider_id: ps.id,
            date: *date,
            slots: slots.clone(),
        });
    }
    for booking in &ps.bookings {
        events.push(Event::BookingReserved {
            booking: booking.clone(),
        });
    }
}
