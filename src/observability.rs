use std::sync::Arc;

use serde::Serialize;
use ulid::Ulid;

use crate::model::{CalendarDate, WindowDefect};

// ── Metric names ────────────────────────────────────────────────

/// Counter: day resolutions. Labels: tier (override_closed, override, special, special_ineligible, recurring).
pub const RESOLUTIONS_TOTAL: &str = "kiln_resolutions_total";

/// Counter: stored slots skipped because their window was malformed.
pub const INVALID_WINDOWS_TOTAL: &str = "kiln_invalid_windows_total";

/// Counter: windows observed with more booked seats than capacity.
pub const OVERBOOKINGS_TOTAL: &str = "kiln_overbookings_total";

/// Histogram: month summary computation in seconds.
pub const MONTH_SUMMARY_DURATION_SECONDS: &str = "kiln_month_summary_duration_seconds";

/// Counter: cached month summary lookups. Labels: result (hit, miss).
pub const CALENDAR_CACHE_TOTAL: &str = "kiln_calendar_cache_total";

/// Counter: months dropped from a full calendar cache.
pub const CALENDAR_CACHE_EVICTIONS_TOTAL: &str = "kiln_calendar_cache_evictions_total";

/// Counter: booking attempts. Labels: outcome (recorded, overbooked, rejected).
pub const BOOKINGS_TOTAL: &str = "kiln_bookings_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "kiln_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "kiln_wal_flush_batch_size";

// ── Resolution events ───────────────────────────────────────────

/// Structured facts the resolver and accountant emit instead of logging
/// directly. Hosts decide where they go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResolutionEvent {
    OverrideApplied {
        course_id: Ulid,
        date: CalendarDate,
        is_available: bool,
        windows: usize,
    },
    SpecialRuleApplied {
        course_id: Ulid,
        date: CalendarDate,
        eligible: bool,
        windows: usize,
    },
    RecurringApplied {
        course_id: Ulid,
        date: CalendarDate,
        course_specific: usize,
        global: usize,
    },
    InvalidWindow {
        course_id: Ulid,
        date: CalendarDate,
        slot_id: Ulid,
        defect: WindowDefect,
    },
    Overbooked {
        course_id: Ulid,
        date: CalendarDate,
        slot_id: Ulid,
        booked: u32,
        capacity: u32,
    },
}

pub trait Observer: Send + Sync {
    fn observe(&self, event: &ResolutionEvent);
}

pub type SharedObserver = Arc<dyn Observer>;

pub struct NoopObserver;

impl Observer for NoopObserver {
    fn observe(&self, _event: &ResolutionEvent) {}
}

/// Forwards events to `tracing` and bumps the matching counters.
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn observe(&self, event: &ResolutionEvent) {
        match event {
            ResolutionEvent::OverrideApplied { course_id, date, is_available, windows } => {
                let tier = if *is_available { "override" } else { "override_closed" };
                metrics::counter!(RESOLUTIONS_TOTAL, "tier" => tier).increment(1);
                tracing::debug!(%course_id, %date, is_available, windows, "date override applied");
            }
            ResolutionEvent::SpecialRuleApplied { course_id, date, eligible, windows } => {
                let tier = if *eligible { "special" } else { "special_ineligible" };
                metrics::counter!(RESOLUTIONS_TOTAL, "tier" => tier).increment(1);
                tracing::debug!(%course_id, %date, eligible, windows, "first-sunday rule applied");
            }
            ResolutionEvent::RecurringApplied { course_id, date, course_specific, global } => {
                metrics::counter!(RESOLUTIONS_TOTAL, "tier" => "recurring").increment(1);
                tracing::debug!(%course_id, %date, course_specific, global, "weekly rules applied");
            }
            ResolutionEvent::InvalidWindow { course_id, date, slot_id, defect } => {
                metrics::counter!(INVALID_WINDOWS_TOTAL).increment(1);
                tracing::warn!(%course_id, %date, %slot_id, "skipping slot: {defect}");
            }
            ResolutionEvent::Overbooked { course_id, date, slot_id, booked, capacity } => {
                metrics::counter!(OVERBOOKINGS_TOTAL).increment(1);
                tracing::warn!(%course_id, %date, %slot_id, booked, capacity, "slot is overbooked");
            }
        }
    }
}

/// Observer that keeps every event, for tests and admin tooling.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<ResolutionEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<ResolutionEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl Observer for RecordingObserver {
    fn observe(&self, event: &ResolutionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
