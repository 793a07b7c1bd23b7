use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::StoreError;

/// Read access the engine needs from the persistence layer. Implementations
/// return unfiltered rows; the resolver applies the activity and scope
/// predicates itself.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn course(&self, id: Ulid) -> Result<Option<Course>, StoreError>;

    /// The single override for `(course_id, date)`, children included.
    async fn date_override(
        &self,
        course_id: Ulid,
        date: CalendarDate,
    ) -> Result<Option<DateOverride>, StoreError>;

    async fn special_slots(&self, course_id: Ulid) -> Result<Vec<SpecialRecurringSlot>, StoreError>;

    /// Course-specific and global slots for one weekday, inactive included.
    async fn recurring_slots(
        &self,
        course_id: Ulid,
        day_of_week: u8,
    ) -> Result<Vec<RecurringSlot>, StoreError>;

    /// Every booking on `date` referencing one of `slot_ids`, any status.
    async fn bookings_on(
        &self,
        date: CalendarDate,
        slot_ids: &[Ulid],
    ) -> Result<Vec<Booking>, StoreError>;
}

/// DashMap-backed store. Event application is the only write path.
pub struct MemoryStore {
    courses: DashMap<Ulid, Course>,
    recurring: DashMap<Ulid, RecurringSlot>,
    special: DashMap<Ulid, SpecialRecurringSlot>,
    overrides: DashMap<(Ulid, CalendarDate), DateOverride>,
    bookings: DashMap<Ulid, Booking>,
    /// (slot id, date) → booking ids
    bookings_by_slot: DashMap<(Ulid, CalendarDate), Vec<Ulid>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            courses: DashMap::new(),
            recurring: DashMap::new(),
            special: DashMap::new(),
            overrides: DashMap::new(),
            bookings: DashMap::new(),
            bookings_by_slot: DashMap::new(),
        }
    }

    // ── Direct lookups ───────────────────────────────────────

    pub fn get_course(&self, id: &Ulid) -> Option<Course> {
        self.courses.get(id).map(|e| e.value().clone())
    }

    pub fn contains_course(&self, id: &Ulid) -> bool {
        self.courses.contains_key(id)
    }

    pub fn course_count(&self) -> usize {
        self.courses.len()
    }

    pub fn find_course_by_slug(&self, slug: &str) -> Option<Course> {
        self.courses
            .iter()
            .find(|e| e.value().slug == slug)
            .map(|e| e.value().clone())
    }

    pub fn courses(&self) -> Vec<Course> {
        let mut all: Vec<Course> = self.courses.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.slug.cmp(&b.slug));
        all
    }

    pub fn get_recurring(&self, id: &Ulid) -> Option<RecurringSlot> {
        self.recurring.get(id).map(|e| e.value().clone())
    }

    pub fn get_special(&self, id: &Ulid) -> Option<SpecialRecurringSlot> {
        self.special.get(id).map(|e| e.value().clone())
    }

    pub fn get_override(&self, course_id: Ulid, date: CalendarDate) -> Option<DateOverride> {
        self.overrides.get(&(course_id, date)).map(|e| e.value().clone())
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn contains_slot(&self, id: &Ulid) -> bool {
        self.recurring.contains_key(id)
            || self.special.contains_key(id)
            || self
                .overrides
                .iter()
                .any(|e| e.value().slots.iter().any(|s| s.id == *id))
    }

    pub fn bookings_for_course(&self, course_id: Ulid) -> Vec<Booking> {
        let mut found: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|e| e.value().course_id == course_id)
            .map(|e| e.value().clone())
            .collect();
        found.sort_by(|a, b| a.booking_date.cmp(&b.booking_date).then(a.id.cmp(&b.id)));
        found
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    /// Weekly and first-Sunday slots owned by `course_id`; `None` counts
    /// the global weekly slots.
    pub fn slot_count(&self, course_id: Option<Ulid>) -> usize {
        let weekly = self.recurring.iter().filter(|e| e.value().course_id == course_id).count();
        let special = course_id.map_or(0, |id| {
            self.special.iter().filter(|e| e.value().course_id == id).count()
        });
        weekly + special
    }

    /// Owning course of a recurring slot; `Some(None)` for a global slot.
    pub fn recurring_owner(&self, id: &Ulid) -> Option<Option<Ulid>> {
        self.recurring.get(id).map(|e| e.value().course_id)
    }

    // ── Snapshot for compaction ──────────────────────────────

    /// Minimal event sequence that recreates the current state.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for course in self.courses() {
            events.push(Event::CourseCreated { course });
        }
        let mut recurring: Vec<RecurringSlot> =
            self.recurring.iter().map(|e| e.value().clone()).collect();
        recurring.sort_by_key(|s| s.id);
        events.extend(recurring.into_iter().map(|slot| Event::RecurringSlotAdded { slot }));

        let mut special: Vec<SpecialRecurringSlot> =
            self.special.iter().map(|e| e.value().clone()).collect();
        special.sort_by_key(|s| s.id);
        events.extend(special.into_iter().map(|slot| Event::SpecialSlotAdded { slot }));

        let mut overrides: Vec<DateOverride> =
            self.overrides.iter().map(|e| e.value().clone()).collect();
        overrides.sort_by_key(|o| (o.course_id, o.override_date));
        events.extend(
            overrides
                .into_iter()
                .map(|date_override| Event::DateOverrideSet { date_override }),
        );

        let mut bookings: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        events.extend(bookings.into_iter().map(|booking| Event::BookingRecorded { booking }));
        events
    }

    // ── Event application ────────────────────────────────────

    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::CourseCreated { course } | Event::CourseUpdated { course } => {
                self.courses.insert(course.id, course.clone());
            }
            Event::CourseDeleted { id } => {
                self.courses.remove(id);
                self.recurring.retain(|_, s| s.course_id != Some(*id));
                self.special.retain(|_, s| s.course_id != *id);
                self.overrides.retain(|(course_id, _), _| course_id != id);
            }
            Event::RecurringSlotAdded { slot } => {
                self.recurring.insert(slot.id, slot.clone());
            }
            Event::RecurringSlotToggled { id, is_active } => {
                if let Some(mut slot) = self.recurring.get_mut(id) {
                    slot.is_active = *is_active;
                }
            }
            Event::RecurringSlotRemoved { id } => {
                self.recurring.remove(id);
            }
            Event::SpecialSlotAdded { slot } => {
                self.special.insert(slot.id, slot.clone());
            }
            Event::SpecialSlotRemoved { id } => {
                self.special.remove(id);
            }
            Event::DateOverrideSet { date_override } => {
                // Keyed by (course, date): a second override replaces the first.
                self.overrides.insert(
                    (date_override.course_id, date_override.override_date),
                    date_override.clone(),
                );
            }
            Event::DateOverrideCleared { course_id, date } => {
                self.overrides.remove(&(*course_id, *date));
            }
            Event::BookingRecorded { booking } => {
                self.bookings_by_slot
                    .entry((booking.slot_reference_id, booking.booking_date))
                    .or_default()
                    .push(booking.id);
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingStatusChanged { id, status } => {
                if let Some(mut booking) = self.bookings.get_mut(id) {
                    booking.status = *status;
                }
            }
        }
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn course(&self, id: Ulid) -> Result<Option<Course>, StoreError> {
        Ok(self.get_course(&id))
    }

    async fn date_override(
        &self,
        course_id: Ulid,
        date: CalendarDate,
    ) -> Result<Option<DateOverride>, StoreError> {
        Ok(self.get_override(course_id, date))
    }

    async fn special_slots(&self, course_id: Ulid) -> Result<Vec<SpecialRecurringSlot>, StoreError> {
        Ok(self
            .special
            .iter()
            .filter(|e| e.value().course_id == course_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn recurring_slots(
        &self,
        course_id: Ulid,
        day_of_week: u8,
    ) -> Result<Vec<RecurringSlot>, StoreError> {
        Ok(self
            .recurring
            .iter()
            .filter(|e| {
                let s = e.value();
                s.day_of_week == day_of_week
                    && (s.course_id.is_none() || s.course_id == Some(course_id))
            })
            .map(|e| e.value().clone())
            .collect())
    }

    async fn bookings_on(
        &self,
        date: CalendarDate,
        slot_ids: &[Ulid],
    ) -> Result<Vec<Booking>, StoreError> {
        let mut found = Vec::new();
        for slot_id in slot_ids {
            let Some(ids) = self.bookings_by_slot.get(&(*slot_id, date)) else {
                continue;
            };
            found.extend(ids.iter().filter_map(|id| self.get_booking(id)));
        }
        Ok(found)
    }
}
