use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{Observer, ResolutionEvent};

use super::store::ScheduleStore;
use super::{EngineError, StoreError};

/// A resolved window with its seat accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowCapacity {
    pub window: SlotWindow,
    pub total_capacity: u32,
    pub booked_seats: u32,
    /// `max(0, total - booked)`, never negative.
    pub remaining_seats: u32,
}

impl WindowCapacity {
    /// Fully booked windows are still listed; callers render them disabled.
    pub fn is_fully_booked(&self) -> bool {
        self.remaining_seats == 0
    }

    pub fn is_overbooked(&self) -> bool {
        self.booked_seats > self.total_capacity
    }

    pub fn to_offer(&self) -> SlotOffer {
        SlotOffer {
            slot_id: self.window.id,
            source: self.window.source,
            start: self.window.start,
            end: self.window.end,
            duration_minutes: self.window.duration_minutes(),
            display: self.window.label(),
            total_capacity: self.total_capacity,
            booked_seats: self.booked_seats,
            remaining_seats: self.remaining_seats,
            fully_booked: self.is_fully_booked(),
            overbooked: self.is_overbooked(),
        }
    }
}

/// What to do when a new booking does not fit the remaining seats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverbookingPolicy {
    /// Reject at insert time.
    #[default]
    Strict,
    /// Record anyway and report the overbooking.
    Lenient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatCheck {
    Fits,
    Overbooks,
}

/// Seats held on `slot_id` at `date`: pending and confirmed bookings only.
pub fn booked_seats(slot_id: Ulid, date: CalendarDate, bookings: &[Booking]) -> u32 {
    bookings
        .iter()
        .filter(|b| b.slot_reference_id == slot_id && b.booking_date == date && b.status.holds_seat())
        .fold(0u32, |acc, b| acc.saturating_add(b.participants))
}

/// Annotate each window with capacity, booked and remaining seats.
/// Overbooked windows are clamped to zero remaining and reported.
pub fn account(
    course: &Course,
    date: CalendarDate,
    windows: Vec<SlotWindow>,
    bookings: &[Booking],
    observer: &dyn Observer,
) -> Vec<WindowCapacity> {
    let total = course.effective_capacity();
    windows
        .into_iter()
        .map(|window| {
            let booked = booked_seats(window.id, date, bookings);
            if booked > total {
                observer.observe(&ResolutionEvent::Overbooked {
                    course_id: course.id,
                    date,
                    slot_id: window.id,
                    booked,
                    capacity: total,
                });
            }
            WindowCapacity {
                window,
                total_capacity: total,
                booked_seats: booked,
                remaining_seats: total.saturating_sub(booked),
            }
        })
        .collect()
}

/// Store-backed accounting: one ledger read for all windows of the day.
pub async fn with_capacity<S: ScheduleStore + ?Sized>(
    store: &S,
    course: &Course,
    date: CalendarDate,
    windows: Vec<SlotWindow>,
    observer: &dyn Observer,
) -> Result<Vec<WindowCapacity>, StoreError> {
    if windows.is_empty() {
        return Ok(Vec::new());
    }
    let mut slot_ids: Vec<Ulid> = windows.iter().map(|w| w.id).collect();
    slot_ids.sort();
    slot_ids.dedup();
    let bookings = store.bookings_on(date, &slot_ids).await?;
    Ok(account(course, date, windows, &bookings, observer))
}

/// Insert-time decision for `requested` seats against a freshly accounted
/// window. The caller must hold the course's booking gate between this
/// check and the ledger append.
pub fn check_seats(
    window: &WindowCapacity,
    requested: u32,
    policy: OverbookingPolicy,
) -> Result<SeatCheck, EngineError> {
    if requested <= window.remaining_seats {
        return Ok(SeatCheck::Fits);
    }
    match policy {
        OverbookingPolicy::Strict => Err(EngineError::CapacityExceeded {
            requested,
            remaining: window.remaining_seats,
        }),
        OverbookingPolicy::Lenient => Ok(SeatCheck::Overbooks),
    }
}
