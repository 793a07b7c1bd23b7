use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use ulid::Ulid;

use crate::limits::MAX_CACHED_MONTHS;
use crate::model::*;
use crate::observability::{Observer, CALENDAR_CACHE_EVICTIONS_TOTAL, MONTH_SUMMARY_DURATION_SECONDS};

use super::availability::resolve;
use super::capacity::{with_capacity, WindowCapacity};
use super::store::ScheduleStore;
use super::StoreError;

/// Per-day reduction of the accounted windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DaySummary {
    pub has_slots: bool,
    pub remaining_total: u32,
    /// At least one window holds more bookings than seats.
    pub overbooked: bool,
}

impl DaySummary {
    pub fn from_windows(windows: &[WindowCapacity]) -> Self {
        Self {
            has_slots: !windows.is_empty(),
            remaining_total: windows
                .iter()
                .fold(0u32, |acc, w| acc.saturating_add(w.remaining_seats)),
            overbooked: windows.iter().any(WindowCapacity::is_overbooked),
        }
    }
}

/// A month of day summaries. A date missing from `days` has not been
/// computed yet, which is not the same as a day with zero seats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthSummary {
    pub course_id: Ulid,
    pub month: YearMonth,
    pub days: BTreeMap<CalendarDate, DaySummary>,
}

impl MonthSummary {
    pub fn get(&self, date: CalendarDate) -> Option<&DaySummary> {
        self.days.get(&date)
    }

    pub fn is_complete(&self) -> bool {
        self.month.days().all(|d| self.days.contains_key(&d))
    }

    pub fn remaining_total(&self) -> u32 {
        self.days
            .values()
            .fold(0u32, |acc, d| acc.saturating_add(d.remaining_total))
    }
}

/// Render state of one calendar cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DayCellState {
    Unresolved,
    Available { remaining: u32 },
    FullyBooked,
    Unavailable,
    Past,
}

impl DayCellState {
    /// `today` comes from the caller; the engine has no clock.
    pub fn classify(date: CalendarDate, summary: Option<&DaySummary>, today: CalendarDate) -> Self {
        if date < today {
            return DayCellState::Past;
        }
        match summary {
            None => DayCellState::Unresolved,
            Some(s) if !s.has_slots => DayCellState::Unavailable,
            Some(s) if s.remaining_total == 0 => DayCellState::FullyBooked,
            Some(s) => DayCellState::Available {
                remaining: s.remaining_total,
            },
        }
    }

    pub fn is_selectable(&self) -> bool {
        matches!(self, DayCellState::Available { .. })
    }
}

/// Resolver then Accountant for a single day.
pub async fn day_windows<S: ScheduleStore + ?Sized>(
    store: &S,
    course: &Course,
    date: CalendarDate,
    observer: &dyn Observer,
) -> Result<Vec<WindowCapacity>, StoreError> {
    let windows = resolve(store, course, date, observer).await?;
    with_capacity(store, course, date, windows, observer).await
}

/// Summarize every day of `month`. Days are independent and run with up to
/// `concurrency` in flight; the first store failure aborts the month.
pub async fn month_summary<S: ScheduleStore + ?Sized>(
    store: &S,
    course: &Course,
    month: YearMonth,
    concurrency: usize,
    observer: &dyn Observer,
) -> Result<MonthSummary, StoreError> {
    let started = Instant::now();
    let days: Vec<(CalendarDate, DaySummary)> = stream::iter(month.days())
        .map(|date| async move {
            let windows = day_windows(store, course, date, observer).await?;
            Ok::<_, StoreError>((date, DaySummary::from_windows(&windows)))
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await?;
    metrics::histogram!(MONTH_SUMMARY_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    Ok(MonthSummary {
        course_id: course.id,
        month,
        days: days.into_iter().collect(),
    })
}

// ── Cached aggregates ─────────────────────────────────────────────

/// Month summaries kept between requests. Writers patch or drop entries;
/// readers never see a summary older than the last committed write.
///
/// Holds at most `max_entries` months. Inserting past that evicts the
/// earliest calendar month first.
pub struct MonthCache {
    entries: DashMap<(Ulid, YearMonth), Arc<MonthSummary>>,
    max_entries: usize,
}

impl Default for MonthCache {
    fn default() -> Self {
        Self::with_limit(MAX_CACHED_MONTHS)
    }
}

impl MonthCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn get(&self, course_id: Ulid, month: YearMonth) -> Option<Arc<MonthSummary>> {
        self.entries.get(&(course_id, month)).map(|e| e.value().clone())
    }

    pub fn insert(&self, summary: Arc<MonthSummary>) {
        let key = (summary.course_id, summary.month);
        while self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            let Some(oldest) = self.entries.iter().map(|e| *e.key()).min_by_key(|(_, m)| *m) else {
                break;
            };
            self.entries.remove(&oldest);
            metrics::counter!(CALENDAR_CACHE_EVICTIONS_TOTAL).increment(1);
        }
        self.entries.insert(key, summary);
    }

    /// Courses with `month` cached.
    pub fn courses_for(&self, month: YearMonth) -> Vec<Ulid> {
        self.entries
            .iter()
            .filter(|e| e.key().1 == month)
            .map(|e| e.key().0)
            .collect()
    }

    pub fn contains(&self, course_id: Ulid, month: YearMonth) -> bool {
        self.entries.contains_key(&(course_id, month))
    }

    /// Replace one day of a cached month. No-op if the month is not cached.
    pub fn patch_day(&self, course_id: Ulid, date: CalendarDate, day: DaySummary) -> bool {
        let Some(mut entry) = self.entries.get_mut(&(course_id, date.year_month())) else {
            return false;
        };
        Arc::make_mut(entry.value_mut()).days.insert(date, day);
        true
    }

    pub fn invalidate(&self, course_id: Ulid, month: YearMonth) {
        self.entries.remove(&(course_id, month));
    }

    pub fn invalidate_course(&self, course_id: Ulid) {
        self.entries.retain(|(id, _), _| *id != course_id);
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::engine::store::MemoryStore;
    use crate::observability::NoopObserver;

    fn date(s: &str) -> CalendarDate {
        s.parse().unwrap()
    }

    fn month(s: &str) -> YearMonth {
        s.parse().unwrap()
    }

    fn weekly(course_id: Option<Ulid>, dow: u8, start: &str, end: &str) -> RecurringSlot {
        RecurringSlot {
            id: Ulid::new(),
            course_id,
            day_of_week: dow,
            start_time: start.into(),
            end_time: end.into(),
            is_active: true,
        }
    }

    fn summary(has_slots: bool, remaining_total: u32) -> DaySummary {
        DaySummary {
            has_slots,
            remaining_total,
            overbooked: false,
        }
    }

    #[tokio::test]
    async fn month_covers_every_day() {
        let store = MemoryStore::new();
        let course = Course::new(Ulid::new(), "handbuilding");
        let monday = weekly(None, 1, "09:00", "12:00");
        store.apply_event(&Event::RecurringSlotAdded { slot: monday.clone() });
        store.apply_event(&Event::BookingRecorded {
            booking: Booking {
                id: Ulid::new(),
                course_id: course.id,
                slot_reference_id: monday.id,
                booking_date: date("2025-06-09"),
                participants: 12,
                status: BookingStatus::Confirmed,
                label: None,
            },
        });

        let june = month("2025-06");
        let result = month_summary(&store, &course, june, 4, &NoopObserver).await.unwrap();
        assert!(result.is_complete());
        assert_eq!(result.days.len(), 30);

        // Mondays in June 2025: 2, 9, 16, 23, 30.
        let mondays: Vec<_> = result
            .days
            .iter()
            .filter(|(_, s)| s.has_slots)
            .map(|(d, _)| d.to_string())
            .collect();
        assert_eq!(mondays, ["2025-06-02", "2025-06-09", "2025-06-16", "2025-06-23", "2025-06-30"]);
        assert_eq!(result.get(date("2025-06-02")), Some(&summary(true, 12)));
        assert_eq!(result.get(date("2025-06-09")), Some(&summary(true, 0)));
        assert_eq!(result.get(date("2025-06-03")), Some(&summary(false, 0)));
        assert_eq!(result.remaining_total(), 48);
    }

    #[tokio::test]
    async fn concurrency_of_one_matches_parallel() {
        let store = MemoryStore::new();
        let course = Course::new(Ulid::new(), "handbuilding");
        for dow in 0..7 {
            store.apply_event(&Event::RecurringSlotAdded { slot: weekly(None, dow, "10:00", "12:00") });
        }
        let serial = month_summary(&store, &course, month("2025-02"), 1, &NoopObserver).await.unwrap();
        let parallel = month_summary(&store, &course, month("2025-02"), 16, &NoopObserver).await.unwrap();
        assert_eq!(serial, parallel);
        assert_eq!(serial.days.len(), 28);
    }

    #[test]
    fn summary_serializes_with_iso_keys() {
        let mut days = BTreeMap::new();
        days.insert(date("2025-06-02"), summary(true, 9));
        let m = MonthSummary {
            course_id: Ulid::nil(),
            month: month("2025-06"),
            days,
        };
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["month"], "2025-06");
        assert_eq!(json["days"]["2025-06-02"]["remaining_total"], 9);
        assert!(json["days"].get("2025-06-03").is_none());
    }

    #[test]
    fn cell_states() {
        let today = date("2025-06-10");
        assert_eq!(DayCellState::classify(date("2025-06-09"), Some(&summary(true, 5)), today), DayCellState::Past);
        assert_eq!(DayCellState::classify(date("2025-06-11"), None, today), DayCellState::Unresolved);
        assert_eq!(
            DayCellState::classify(date("2025-06-11"), Some(&summary(false, 0)), today),
            DayCellState::Unavailable
        );
        assert_eq!(
            DayCellState::classify(date("2025-06-11"), Some(&summary(true, 0)), today),
            DayCellState::FullyBooked
        );
        let open = DayCellState::classify(today, Some(&summary(true, 3)), today);
        assert_eq!(open, DayCellState::Available { remaining: 3 });
        assert!(open.is_selectable());
    }

    /// Counts concurrent ledger reads and fails on one chosen date.
    struct Instrumented {
        inner: MemoryStore,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fail_on: Option<CalendarDate>,
    }

    #[async_trait]
    impl ScheduleStore for Instrumented {
        async fn course(&self, id: Ulid) -> Result<Option<Course>, StoreError> {
            self.inner.course(id).await
        }
        async fn date_override(&self, course_id: Ulid, date: CalendarDate) -> Result<Option<DateOverride>, StoreError> {
            if self.fail_on == Some(date) {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.inner.date_override(course_id, date).await
        }
        async fn special_slots(&self, course_id: Ulid) -> Result<Vec<SpecialRecurringSlot>, StoreError> {
            self.inner.special_slots(course_id).await
        }
        async fn recurring_slots(&self, course_id: Ulid, dow: u8) -> Result<Vec<RecurringSlot>, StoreError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.recurring_slots(course_id, dow).await
        }
        async fn bookings_on(&self, date: CalendarDate, slot_ids: &[Ulid]) -> Result<Vec<Booking>, StoreError> {
            self.inner.bookings_on(date, slot_ids).await
        }
    }

    fn instrumented(fail_on: Option<CalendarDate>) -> Instrumented {
        Instrumented {
            inner: MemoryStore::new(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            fail_on,
        }
    }

    #[tokio::test]
    async fn fan_out_respects_concurrency_bound() {
        let store = instrumented(None);
        let course = Course::new(Ulid::new(), "handbuilding");
        month_summary(&store, &course, month("2025-07"), 3, &NoopObserver).await.unwrap();
        let peak = store.peak.load(Ordering::SeqCst);
        assert!((1..=3).contains(&peak), "peak {peak}");
    }

    #[tokio::test]
    async fn store_failure_fails_the_month() {
        let store = instrumented(Some(date("2025-07-15")));
        let course = Course::new(Ulid::new(), "handbuilding");
        let err = month_summary(&store, &course, month("2025-07"), 4, &NoopObserver)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn cache_patch_and_invalidate() {
        let cache = MonthCache::new();
        let course_id = Ulid::new();
        let june = month("2025-06");
        let mut days = BTreeMap::new();
        days.insert(date("2025-06-02"), summary(true, 12));
        cache.insert(Arc::new(MonthSummary { course_id, month: june, days }));

        assert!(cache.patch_day(course_id, date("2025-06-02"), summary(true, 9)));
        assert_eq!(
            cache.get(course_id, june).unwrap().get(date("2025-06-02")),
            Some(&summary(true, 9))
        );
        // Uncached month: nothing to patch.
        assert!(!cache.patch_day(course_id, date("2025-07-07"), summary(true, 1)));

        cache.invalidate_course(Ulid::new());
        assert_eq!(cache.len(), 1);
        cache.invalidate_course(course_id);
        assert!(cache.is_empty());
    }

    fn empty_month(course_id: Ulid, m: &str) -> Arc<MonthSummary> {
        Arc::new(MonthSummary {
            course_id,
            month: month(m),
            days: BTreeMap::new(),
        })
    }

    #[test]
    fn full_cache_evicts_earliest_month() {
        let cache = MonthCache::with_limit(3);
        let a = Ulid::new();
        let b = Ulid::new();
        cache.insert(empty_month(a, "2025-07"));
        cache.insert(empty_month(b, "2025-05"));
        cache.insert(empty_month(a, "2025-06"));

        // Re-inserting a cached month does not evict.
        cache.insert(empty_month(a, "2025-07"));
        assert_eq!(cache.len(), 3);

        cache.insert(empty_month(b, "2025-08"));
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(b, month("2025-05")));
        assert!(cache.contains(a, month("2025-06")));
        assert!(cache.contains(b, month("2025-08")));

        let mut june = cache.courses_for(month("2025-06"));
        june.sort();
        assert_eq!(june, [a]);
        assert!(cache.courses_for(month("2025-05")).is_empty());
    }
}
