pub mod availability;
pub mod calendar;
pub mod capacity;
mod error;
mod mutations;
mod queries;
pub mod store;

pub use availability::{first_sunday_eligible, resolve, resolve_day, DayRules};
pub use calendar::{month_summary, DayCellState, DaySummary, MonthCache, MonthSummary};
pub use capacity::{account, check_seats, OverbookingPolicy, SeatCheck, WindowCapacity};
pub use error::{EngineError, StoreError};
pub use mutations::NewBooking;
pub use store::{MemoryStore, ScheduleStore};

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::limits::MAX_CALENDAR_CONCURRENCY;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{SharedObserver, WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Takes the first append, drains whatever else is already
/// queued, then pays for one fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes are not
    // attributed to the next batch.
    let flushed = wal.flush_sync();
    let result = result.and(flushed);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

// ── Studio ───────────────────────────────────────────────

fn gate(gates: &DashMap<Ulid, Arc<Mutex<()>>>, key: Ulid) -> Arc<Mutex<()>> {
    gates
        .entry(key)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StudioOptions {
    pub overbooking: OverbookingPolicy,
    /// Days of a month resolved at once.
    pub calendar_concurrency: usize,
}

impl Default for StudioOptions {
    fn default() -> Self {
        Self {
            overbooking: OverbookingPolicy::Strict,
            calendar_concurrency: 8,
        }
    }
}

/// Who has to hear about a committed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Course(Ulid),
    /// One date of one course: bookings and overrides.
    Day(Ulid, CalendarDate),
    /// One date of every course: bookings on a global slot, whose seats
    /// are shared by all courses offering it.
    SharedDay(CalendarDate),
    /// Global weekly slots touch every course.
    Studio,
}

/// Durable owner of the schedule and the booking ledger.
pub struct Studio {
    store: MemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) observer: SharedObserver,
    pub(super) calendar: MonthCache,
    /// Serializes schedule changes with booking admission, per course.
    booking_gates: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Serializes capacity check and append per slot. Taken after the
    /// course gate, never before.
    seat_gates: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Writers hold it shared; compaction holds it exclusively so no append
    /// lands between the snapshot and the file swap.
    pub(super) commit_lock: RwLock<()>,
    /// Bumped after every applied event. Month summaries computed across a
    /// bump are not cached.
    pub(super) generation: AtomicU64,
    pub(super) options: StudioOptions,
}

impl Studio {
    pub fn open(
        wal_path: PathBuf,
        options: StudioOptions,
        notify: Arc<NotifyHub>,
        observer: SharedObserver,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = MemoryStore::new();
        for event in &events {
            store.apply_event(event);
        }
        tracing::info!(
            "opened {} ({} events, {} courses, {} bookings)",
            wal_path.display(),
            events.len(),
            store.course_count(),
            store.booking_count()
        );

        let options = StudioOptions {
            calendar_concurrency: options.calendar_concurrency.clamp(1, MAX_CALENDAR_CONCURRENCY),
            ..options
        };
        Ok(Self {
            store,
            wal_tx,
            notify,
            observer,
            calendar: MonthCache::new(),
            booking_gates: DashMap::new(),
            seat_gates: DashMap::new(),
            commit_lock: RwLock::new(()),
            generation: AtomicU64::new(0),
            options,
        })
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn options(&self) -> StudioOptions {
        self.options
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_request(|response| WalCommand::Append {
            event: event.clone(),
            response,
        })
        .await?
        .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) async fn wal_request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(make(tx))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }

    pub(super) fn booking_gate(&self, course_id: Ulid) -> Arc<Mutex<()>> {
        gate(&self.booking_gates, course_id)
    }

    pub(super) fn seat_gate(&self, slot_id: Ulid) -> Arc<Mutex<()>> {
        gate(&self.seat_gates, slot_id)
    }

    fn booking_scope(&self, booking: &Booking) -> Scope {
        match self.store.recurring_owner(&booking.slot_reference_id) {
            Some(None) => Scope::SharedDay(booking.booking_date),
            _ => Scope::Day(booking.course_id, booking.booking_date),
        }
    }

    /// Must run before the event is applied: removals need the row to find
    /// their owner.
    fn scope_of(&self, event: &Event) -> Scope {
        match event {
            Event::CourseCreated { course } | Event::CourseUpdated { course } => {
                Scope::Course(course.id)
            }
            Event::CourseDeleted { id } => Scope::Course(*id),
            Event::RecurringSlotAdded { slot } => slot.course_id.map_or(Scope::Studio, Scope::Course),
            Event::RecurringSlotToggled { id, .. } | Event::RecurringSlotRemoved { id } => {
                match self.store.recurring_owner(id) {
                    Some(Some(course_id)) => Scope::Course(course_id),
                    _ => Scope::Studio,
                }
            }
            Event::SpecialSlotAdded { slot } => Scope::Course(slot.course_id),
            Event::SpecialSlotRemoved { id } => self
                .store
                .get_special(id)
                .map_or(Scope::Studio, |s| Scope::Course(s.course_id)),
            Event::DateOverrideSet { date_override } => {
                Scope::Day(date_override.course_id, date_override.override_date)
            }
            Event::DateOverrideCleared { course_id, date } => Scope::Day(*course_id, *date),
            Event::BookingRecorded { booking } => self.booking_scope(booking),
            Event::BookingStatusChanged { id, .. } => self
                .store
                .get_booking(id)
                .map_or(Scope::Studio, |b| self.booking_scope(&b)),
        }
    }

    /// WAL-append, apply, notify, then bring cached months up to date.
    pub(super) async fn persist_and_apply(&self, event: Event) -> Result<(), EngineError> {
        let scope = {
            let _shared = self.commit_lock.read().await;
            let scope = self.scope_of(&event);
            self.wal_append(&event).await?;
            self.store.apply_event(&event);
            self.generation.fetch_add(1, Ordering::SeqCst);
            scope
        };

        // Cache first, so a subscriber that refetches on the event reads
        // the post-write month.
        match scope {
            Scope::Course(course_id) => {
                self.calendar.invalidate_course(course_id);
                self.notify.send(course_id, &event);
            }
            Scope::Day(course_id, date) => {
                self.refresh_day(course_id, date).await;
                self.notify.send(course_id, &event);
            }
            Scope::SharedDay(date) => {
                for course_id in self.calendar.courses_for(date.year_month()) {
                    self.refresh_day(course_id, date).await;
                }
                self.notify.send_all(&event);
            }
            Scope::Studio => {
                self.calendar.invalidate_all();
                self.notify.send_all(&event);
            }
        }
        Ok(())
    }
}
