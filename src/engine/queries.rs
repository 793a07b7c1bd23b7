use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ulid::Ulid;

use crate::model::*;
use crate::observability::CALENDAR_CACHE_TOTAL;

use super::availability::resolve;
use super::calendar::{day_windows, month_summary, DayCellState, DaySummary, MonthSummary};
use super::{EngineError, Studio};

impl Studio {
    /// Look a course up by ULID or slug.
    pub fn find_course(&self, key: &str) -> Result<Course, EngineError> {
        if let Ok(id) = key.parse::<Ulid>()
            && let Some(course) = self.store.get_course(&id)
        {
            return Ok(course);
        }
        self.store
            .find_course_by_slug(key)
            .ok_or_else(|| EngineError::CourseNotFound(key.to_string()))
    }

    pub fn list_courses(&self) -> Vec<Course> {
        self.store.courses()
    }

    pub(super) fn course(&self, id: Ulid) -> Result<Course, EngineError> {
        self.store.get_course(&id).ok_or(EngineError::NotFound(id))
    }

    /// Resolved windows for one date, before capacity.
    pub async fn resolve(&self, course_id: Ulid, date: CalendarDate) -> Result<Vec<SlotWindow>, EngineError> {
        let course = self.course(course_id)?;
        Ok(resolve(&self.store, &course, date, &*self.observer).await?)
    }

    /// The slot-selection list for one date. Fully booked windows stay in
    /// the list with `fully_booked` set.
    pub async fn slots_for_day(&self, course_id: Ulid, date: CalendarDate) -> Result<DaySlots, EngineError> {
        let course = self.course(course_id)?;
        let windows = day_windows(&self.store, &course, date, &*self.observer).await?;
        Ok(DaySlots {
            course_id,
            date,
            slots: windows.iter().map(|w| w.to_offer()).collect(),
        })
    }

    pub async fn month_summary(
        &self,
        course_id: Ulid,
        month: YearMonth,
    ) -> Result<Arc<MonthSummary>, EngineError> {
        if let Some(cached) = self.calendar.get(course_id, month) {
            metrics::counter!(CALENDAR_CACHE_TOTAL, "result" => "hit").increment(1);
            return Ok(cached);
        }
        metrics::counter!(CALENDAR_CACHE_TOTAL, "result" => "miss").increment(1);

        let course = self.course(course_id)?;
        let before = self.generation.load(Ordering::SeqCst);
        let summary = Arc::new(
            month_summary(
                &self.store,
                &course,
                month,
                self.options.calendar_concurrency,
                &*self.observer,
            )
            .await?,
        );
        self.calendar.insert(summary.clone());
        // A write landed while we were resolving; its refresh may have run
        // before our insert, so drop the entry rather than serve it later.
        if self.generation.load(Ordering::SeqCst) != before {
            self.calendar.invalidate(course_id, month);
        }
        Ok(summary)
    }

    /// Cell state for every day of `month`.
    pub async fn calendar(
        &self,
        course_id: Ulid,
        month: YearMonth,
        today: CalendarDate,
    ) -> Result<BTreeMap<CalendarDate, DayCellState>, EngineError> {
        let summary = self.month_summary(course_id, month).await?;
        Ok(month
            .days()
            .map(|date| (date, DayCellState::classify(date, summary.get(date), today)))
            .collect())
    }

    pub fn bookings_for_course(&self, course_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        if !self.store.contains_course(&course_id) {
            return Err(EngineError::NotFound(course_id));
        }
        Ok(self.store.bookings_for_course(course_id))
    }

    pub fn booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.store.get_booking(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn is_month_cached(&self, course_id: Ulid, month: YearMonth) -> bool {
        self.calendar.contains(course_id, month)
    }

    /// Recompute one day of a cached month. Months nobody has asked for
    /// are left alone; a failed recompute drops the month instead.
    pub(super) async fn refresh_day(&self, course_id: Ulid, date: CalendarDate) {
        let month = date.year_month();
        if !self.calendar.contains(course_id, month) {
            return;
        }
        let Some(course) = self.store.get_course(&course_id) else {
            self.calendar.invalidate_course(course_id);
            return;
        };
        match day_windows(&self.store, &course, date, &*self.observer).await {
            Ok(windows) => {
                self.calendar
                    .patch_day(course_id, date, DaySummary::from_windows(&windows));
            }
            Err(e) => {
                tracing::warn!(%course_id, %date, "dropping cached month, day refresh failed: {e}");
                self.calendar.invalidate(course_id, month);
            }
        }
    }
}
