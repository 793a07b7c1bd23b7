use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{ResolutionEvent, BOOKINGS_TOTAL};

use super::calendar::day_windows;
use super::capacity::{check_seats, SeatCheck, WindowCapacity};
use super::{EngineError, Studio, WalCommand};

/// A booking request as it arrives from the booking form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub course_id: Ulid,
    pub slot_id: Ulid,
    pub date: CalendarDate,
    pub participants: u32,
    /// Must hold a seat: pending or confirmed.
    pub status: BookingStatus,
    pub label: Option<String>,
}

fn validate_window(start: &str, end: &str) -> Result<(), EngineError> {
    parse_window(start, end)
        .map(|_| ())
        .map_err(|defect| EngineError::InvalidInput(defect.to_string()))
}

fn validate_course_fields(course: &Course) -> Result<(), EngineError> {
    if course.slug.trim().is_empty() {
        return Err(EngineError::InvalidInput("course slug is empty".into()));
    }
    if course.slug.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("course slug too long"));
    }
    if let Some(name) = &course.name
        && name.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("course name too long"));
    }
    if course.capacity == Some(0) {
        return Err(EngineError::InvalidInput("capacity must be at least 1".into()));
    }
    Ok(())
}

fn validate_booking_fields(participants: u32, label: Option<&str>) -> Result<(), EngineError> {
    if !(1..=MAX_PARTICIPANTS_PER_BOOKING).contains(&participants) {
        return Err(EngineError::InvalidInput(format!(
            "participants must be between 1 and {MAX_PARTICIPANTS_PER_BOOKING}"
        )));
    }
    if label.is_some_and(|l| l.len() > MAX_LABEL_LEN) {
        return Err(EngineError::LimitExceeded("booking label too long"));
    }
    Ok(())
}

fn find_window(windows: &[WindowCapacity], slot_id: Ulid) -> Option<&WindowCapacity> {
    windows.iter().find(|w| w.window.id == slot_id)
}

impl Studio {
    // ── Courses ──────────────────────────────────────────

    pub async fn create_course(&self, course: Course) -> Result<(), EngineError> {
        validate_course_fields(&course)?;
        if self.store.course_count() >= MAX_COURSES {
            return Err(EngineError::LimitExceeded("too many courses"));
        }
        if self.store.contains_course(&course.id) {
            return Err(EngineError::AlreadyExists(course.id));
        }
        if self.store.find_course_by_slug(&course.slug).is_some() {
            return Err(EngineError::InvalidInput(format!("slug {:?} already in use", course.slug)));
        }
        tracing::info!(course_id = %course.id, slug = %course.slug, "course created");
        self.persist_and_apply(Event::CourseCreated { course }).await
    }

    /// Replace a course's attributes. Capacity changes show up in the next
    /// resolution; existing bookings are kept.
    pub async fn update_course(&self, course: Course) -> Result<(), EngineError> {
        validate_course_fields(&course)?;
        if !self.store.contains_course(&course.id) {
            return Err(EngineError::NotFound(course.id));
        }
        if let Some(other) = self.store.find_course_by_slug(&course.slug)
            && other.id != course.id
        {
            return Err(EngineError::InvalidInput(format!("slug {:?} already in use", course.slug)));
        }
        self.persist_and_apply(Event::CourseUpdated { course }).await
    }

    /// Drops the course and its schedule rules. Its bookings stay in the
    /// ledger.
    pub async fn delete_course(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.store.contains_course(&id) {
            return Err(EngineError::NotFound(id));
        }
        let gate = self.booking_gate(id);
        let _held = gate.lock().await;
        self.persist_and_apply(Event::CourseDeleted { id }).await?;
        self.notify.remove(&id);
        self.booking_gates.remove(&id);
        tracing::info!(course_id = %id, "course deleted");
        Ok(())
    }

    // ── Weekly slots ─────────────────────────────────────

    /// `course_id: None` adds a global slot offered to every course.
    pub async fn add_recurring_slot(&self, slot: RecurringSlot) -> Result<(), EngineError> {
        if slot.day_of_week > 6 {
            return Err(EngineError::InvalidInput(format!(
                "day_of_week {} out of range 0..=6",
                slot.day_of_week
            )));
        }
        validate_window(&slot.start_time, &slot.end_time)?;
        if let Some(course_id) = slot.course_id
            && !self.store.contains_course(&course_id)
        {
            return Err(EngineError::NotFound(course_id));
        }
        if self.store.contains_slot(&slot.id) {
            return Err(EngineError::AlreadyExists(slot.id));
        }
        if self.store.slot_count(slot.course_id) >= MAX_SLOTS_PER_COURSE {
            return Err(EngineError::LimitExceeded("too many slots"));
        }
        self.persist_and_apply(Event::RecurringSlotAdded { slot }).await
    }

    /// Deactivated slots stop being offered; bookings against them remain.
    pub async fn set_recurring_slot_active(&self, id: Ulid, is_active: bool) -> Result<(), EngineError> {
        let slot = self.store.get_recurring(&id).ok_or(EngineError::NotFound(id))?;
        if slot.is_active == is_active {
            return Ok(());
        }
        self.persist_and_apply(Event::RecurringSlotToggled { id, is_active }).await
    }

    pub async fn remove_recurring_slot(&self, id: Ulid) -> Result<(), EngineError> {
        if self.store.get_recurring(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        self.persist_and_apply(Event::RecurringSlotRemoved { id }).await
    }

    // ── First-Sunday slots ───────────────────────────────

    pub async fn add_special_slot(&self, slot: SpecialRecurringSlot) -> Result<(), EngineError> {
        validate_window(&slot.start_time, &slot.end_time)?;
        let course = self.course(slot.course_id)?;
        if course.schedule_rule != ScheduleRule::FirstSundayOfMonth {
            tracing::warn!(
                course_id = %course.id,
                "special slot added to a course without the first-sunday rule; it will not be offered"
            );
        }
        if self.store.contains_slot(&slot.id) {
            return Err(EngineError::AlreadyExists(slot.id));
        }
        if self.store.slot_count(Some(slot.course_id)) >= MAX_SLOTS_PER_COURSE {
            return Err(EngineError::LimitExceeded("too many slots"));
        }
        self.persist_and_apply(Event::SpecialSlotAdded { slot }).await
    }

    pub async fn remove_special_slot(&self, id: Ulid) -> Result<(), EngineError> {
        if self.store.get_special(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        self.persist_and_apply(Event::SpecialSlotRemoved { id }).await
    }

    // ── Date overrides ───────────────────────────────────

    /// Set the exception for one date, replacing any earlier one so each
    /// `(course, date)` has at most one override.
    pub async fn set_date_override(&self, date_override: DateOverride) -> Result<(), EngineError> {
        self.course(date_override.course_id)?;
        if date_override.slots.len() > MAX_SLOTS_PER_OVERRIDE {
            return Err(EngineError::LimitExceeded("too many slots on override"));
        }
        if !date_override.is_available && !date_override.slots.is_empty() {
            return Err(EngineError::InvalidInput(
                "an unavailable override cannot carry slots".into(),
            ));
        }
        for slot in &date_override.slots {
            if slot.override_id != date_override.id {
                return Err(EngineError::InvalidInput(format!(
                    "slot {} belongs to override {}",
                    slot.id, slot.override_id
                )));
            }
            validate_window(&slot.start_time, &slot.end_time)?;
        }

        let gate = self.booking_gate(date_override.course_id);
        let _held = gate.lock().await;
        if let Some(previous) = self
            .store
            .get_override(date_override.course_id, date_override.override_date)
        {
            tracing::info!(
                course_id = %date_override.course_id,
                date = %date_override.override_date,
                replaced = %previous.id,
                "replacing date override"
            );
        }
        self.persist_and_apply(Event::DateOverrideSet { date_override }).await
    }

    /// Returns whether an override existed.
    pub async fn clear_date_override(&self, course_id: Ulid, date: CalendarDate) -> Result<bool, EngineError> {
        self.course(course_id)?;
        let gate = self.booking_gate(course_id);
        let _held = gate.lock().await;
        if self.store.get_override(course_id, date).is_none() {
            return Ok(false);
        }
        self.persist_and_apply(Event::DateOverrideCleared { course_id, date }).await?;
        Ok(true)
    }

    // ── Bookings ─────────────────────────────────────────

    /// Record a booking against a slot offered on `date`. Under the strict
    /// policy a booking that does not fit the remaining seats is refused.
    pub async fn record_booking(&self, new: NewBooking) -> Result<Booking, EngineError> {
        if !new.status.holds_seat() {
            return Err(EngineError::InvalidInput(format!(
                "a new booking cannot start as {}",
                new.status
            )));
        }
        validate_booking_fields(new.participants, new.label.as_deref())?;
        if self.store.get_booking(&new.id).is_some() {
            return Err(EngineError::AlreadyExists(new.id));
        }

        let gate = self.booking_gate(new.course_id);
        let _held = gate.lock().await;
        // Global slots share their seats across courses.
        let seats = self.seat_gate(new.slot_id);
        let _seats_held = seats.lock().await;
        let course = self.course(new.course_id)?;
        let windows = day_windows(&self.store, &course, new.date, &*self.observer).await?;
        let window = find_window(&windows, new.slot_id).ok_or(EngineError::SlotNotOffered {
            slot_id: new.slot_id,
            date: new.date,
        })?;

        let outcome = match check_seats(window, new.participants, self.options.overbooking) {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics::counter!(BOOKINGS_TOTAL, "outcome" => "rejected").increment(1);
                tracing::info!(course_id = %course.id, date = %new.date, slot_id = %new.slot_id, "booking refused: {e}");
                return Err(e);
            }
        };
        if outcome == SeatCheck::Overbooks {
            self.observer.observe(&ResolutionEvent::Overbooked {
                course_id: course.id,
                date: new.date,
                slot_id: new.slot_id,
                booked: window.booked_seats.saturating_add(new.participants),
                capacity: window.total_capacity,
            });
        }

        let booking = Booking {
            id: new.id,
            course_id: new.course_id,
            slot_reference_id: new.slot_id,
            booking_date: new.date,
            participants: new.participants,
            status: new.status,
            label: new.label,
        };
        self.persist_and_apply(Event::BookingRecorded {
            booking: booking.clone(),
        })
        .await?;
        let label = match outcome {
            SeatCheck::Fits => "recorded",
            SeatCheck::Overbooks => "overbooked",
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => label).increment(1);
        Ok(booking)
    }

    /// Move a booking through its lifecycle. Putting a cancelled booking back
    /// on the books re-checks capacity like a new booking would.
    pub async fn set_booking_status(&self, id: Ulid, status: BookingStatus) -> Result<Booking, EngineError> {
        let Booking {
            course_id,
            slot_reference_id,
            ..
        } = self.booking(id)?;
        let gate = self.booking_gate(course_id);
        let _held = gate.lock().await;
        let seats = self.seat_gate(slot_reference_id);
        let _seats_held = seats.lock().await;

        let current = self.booking(id)?;
        if current.status == status {
            return Ok(current);
        }
        if !current.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to: status,
            });
        }

        if !current.status.holds_seat() && status.holds_seat() {
            let course = self.course(course_id)?;
            let windows = day_windows(&self.store, &course, current.booking_date, &*self.observer).await?;
            let window = find_window(&windows, current.slot_reference_id).ok_or(
                EngineError::SlotNotOffered {
                    slot_id: current.slot_reference_id,
                    date: current.booking_date,
                },
            )?;
            check_seats(window, current.participants, self.options.overbooking)?;
        }

        self.persist_and_apply(Event::BookingStatusChanged { id, status }).await?;
        tracing::debug!(booking_id = %id, from = %current.status, to = %status, "booking status changed");
        Ok(Booking { status, ..current })
    }

    /// Put a finished booking (cancelled or completed) straight into the
    /// ledger. It holds no seat, so there is no seat check and the slot
    /// need not be offered any more.
    pub async fn restore_booking(&self, booking: Booking) -> Result<(), EngineError> {
        if booking.status.holds_seat() {
            return Err(EngineError::InvalidInput(format!(
                "a {} booking must go through admission",
                booking.status
            )));
        }
        validate_booking_fields(booking.participants, booking.label.as_deref())?;
        self.course(booking.course_id)?;
        if self.store.get_booking(&booking.id).is_some() {
            return Err(EngineError::AlreadyExists(booking.id));
        }
        self.persist_and_apply(Event::BookingRecorded { booking }).await
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the log as the minimal event set for the current state.
    /// Returns the number of events kept.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _exclusive = self.commit_lock.write().await;
        let events = self.store.snapshot_events();
        let kept = events.len();
        self.wal_request(|response| WalCommand::Compact { events, response })
            .await?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("compacted WAL to {kept} events");
        Ok(kept)
    }

    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        self.wal_request(|response| WalCommand::AppendsSinceCompact { response })
            .await
    }
}
