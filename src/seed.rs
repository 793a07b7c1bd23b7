//! JSON import format for a studio's schedule and booking history.
//!
//! Rows refer to courses by slug. Slots that bookings point at need an
//! explicit `id`; everything else gets a fresh ULID.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{EngineError, NewBooking, Studio};
use crate::model::*;

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("malformed seed file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown course {0:?}")]
    UnknownCourse(String),
    #[error("{what}: {source}")]
    Engine {
        what: String,
        #[source]
        source: EngineError,
    },
}

fn context(what: impl Into<String>) -> impl FnOnce(EngineError) -> SeedError {
    let what = what.into();
    move |source| SeedError::Engine { what, source }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudioSeed {
    #[serde(default)]
    pub courses: Vec<SeedCourse>,
    #[serde(default)]
    pub recurring_slots: Vec<SeedRecurringSlot>,
    #[serde(default)]
    pub special_slots: Vec<SeedSpecialSlot>,
    #[serde(default)]
    pub date_overrides: Vec<SeedOverride>,
    #[serde(default)]
    pub bookings: Vec<SeedBooking>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedCourse {
    pub id: Option<Ulid>,
    pub slug: String,
    pub name: Option<String>,
    pub capacity: Option<u32>,
    /// Falls back to the slug convention when absent.
    pub capacity_class: Option<CapacityClass>,
    #[serde(default)]
    pub schedule_rule: ScheduleRule,
}

fn active() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedRecurringSlot {
    pub id: Option<Ulid>,
    /// `None` for a global slot.
    pub course: Option<String>,
    pub day_of_week: u8,
    pub start_time: String,
    pub end_time: String,
    #[serde(default = "active")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedSpecialSlot {
    pub id: Option<Ulid>,
    pub course: String,
    pub start_time: String,
    pub end_time: String,
    #[serde(default = "active")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedOverrideSlot {
    pub id: Option<Ulid>,
    pub start_time: String,
    pub end_time: String,
    #[serde(default = "active")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedOverride {
    pub course: String,
    pub date: CalendarDate,
    pub is_available: bool,
    #[serde(default)]
    pub slots: Vec<SeedOverrideSlot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedBooking {
    pub id: Option<Ulid>,
    pub course: String,
    pub slot: Ulid,
    pub date: CalendarDate,
    pub participants: u32,
    #[serde(default = "pending")]
    pub status: BookingStatus,
    pub label: Option<String>,
}

fn pending() -> BookingStatus {
    BookingStatus::Pending
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub courses_created: usize,
    pub courses_updated: usize,
    pub recurring_slots: usize,
    pub special_slots: usize,
    pub date_overrides: usize,
    pub bookings: usize,
    /// Rows whose explicit id is already present.
    pub skipped: usize,
}

pub fn parse(json: &str) -> Result<StudioSeed, SeedError> {
    Ok(serde_json::from_str(json)?)
}

fn course_id(studio: &Studio, slug: &str) -> Result<Ulid, SeedError> {
    studio
        .find_course(slug)
        .map(|c| c.id)
        .map_err(|_| SeedError::UnknownCourse(slug.to_string()))
}

/// Apply a seed in dependency order. Courses whose slug already exists are
/// updated in place. Slots and bookings whose explicit id is already
/// present are skipped, so re-importing a seed that names its ids is a
/// no-op for those rows. Rows without an id (and overrides, which have
/// none) are added again. Stops at the first failure; rows before it stay
/// committed.
pub async fn import(studio: &Studio, seed: StudioSeed) -> Result<ImportReport, SeedError> {
    let mut report = ImportReport::default();

    for row in seed.courses {
        let existing = studio.find_course(&row.slug).ok();
        let course = Course {
            id: existing.as_ref().map(|c| c.id).or(row.id).unwrap_or_else(Ulid::new),
            capacity_class: row
                .capacity_class
                .unwrap_or_else(|| CapacityClass::from_slug(&row.slug)),
            name: row.name,
            capacity: row.capacity,
            schedule_rule: row.schedule_rule,
            slug: row.slug,
        };
        let what = format!("course {:?}", course.slug);
        if existing.is_some() {
            studio.update_course(course).await.map_err(context(what))?;
            report.courses_updated += 1;
        } else {
            studio.create_course(course).await.map_err(context(what))?;
            report.courses_created += 1;
        }
    }

    for row in seed.recurring_slots {
        if row.id.is_some_and(|id| studio.store().contains_slot(&id)) {
            report.skipped += 1;
            continue;
        }
        let course_id = row.course.as_deref().map(|slug| course_id(studio, slug)).transpose()?;
        let what = format!(
            "weekly slot {} {}-{} for {}",
            row.day_of_week,
            row.start_time,
            row.end_time,
            row.course.as_deref().unwrap_or("every course")
        );
        studio
            .add_recurring_slot(RecurringSlot {
                id: row.id.unwrap_or_else(Ulid::new),
                course_id,
                day_of_week: row.day_of_week,
                start_time: row.start_time,
                end_time: row.end_time,
                is_active: row.is_active,
            })
            .await
            .map_err(context(what))?;
        report.recurring_slots += 1;
    }

    for row in seed.special_slots {
        if row.id.is_some_and(|id| studio.store().contains_slot(&id)) {
            report.skipped += 1;
            continue;
        }
        let course_id = course_id(studio, &row.course)?;
        let what = format!("special slot {}-{} for {}", row.start_time, row.end_time, row.course);
        studio
            .add_special_slot(SpecialRecurringSlot {
                id: row.id.unwrap_or_else(Ulid::new),
                course_id,
                start_time: row.start_time,
                end_time: row.end_time,
                is_active: row.is_active,
            })
            .await
            .map_err(context(what))?;
        report.special_slots += 1;
    }

    for row in seed.date_overrides {
        let course_id = course_id(studio, &row.course)?;
        let id = Ulid::new();
        let what = format!("override {} for {}", row.date, row.course);
        studio
            .set_date_override(DateOverride {
                id,
                course_id,
                override_date: row.date,
                is_available: row.is_available,
                slots: row
                    .slots
                    .into_iter()
                    .map(|s| OverrideSlot {
                        id: s.id.unwrap_or_else(Ulid::new),
                        override_id: id,
                        start_time: s.start_time,
                        end_time: s.end_time,
                        is_active: s.is_active,
                    })
                    .collect(),
            })
            .await
            .map_err(context(what))?;
        report.date_overrides += 1;
    }

    for row in seed.bookings {
        if row.id.is_some_and(|id| studio.store().get_booking(&id).is_some()) {
            report.skipped += 1;
            continue;
        }
        let course_id = course_id(studio, &row.course)?;
        let what = format!("booking on {} for {}", row.date, row.course);
        let id = row.id.unwrap_or_else(Ulid::new);
        // Live bookings go through admission; finished ones are history
        // and are kept as recorded.
        let result = if row.status.holds_seat() {
            studio
                .record_booking(NewBooking {
                    id,
                    course_id,
                    slot_id: row.slot,
                    date: row.date,
                    participants: row.participants,
                    status: row.status,
                    label: row.label,
                })
                .await
                .map(|_| ())
        } else {
            studio
                .restore_booking(Booking {
                    id,
                    course_id,
                    slot_reference_id: row.slot,
                    booking_date: row.date,
                    participants: row.participants,
                    status: row.status,
                    label: row.label,
                })
                .await
        };
        result.map_err(context(what))?;
        report.bookings += 1;
    }

    tracing::info!(?report, "seed imported");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::engine::StudioOptions;
    use crate::notify::NotifyHub;
    use crate::observability::NoopObserver;

    fn test_studio(name: &str) -> Studio {
        let dir = std::env::temp_dir().join("kiln_test_seed");
        std::fs::create_dir_all(&dir).unwrap();
        let path: PathBuf = dir.join(name);
        let _ = std::fs::remove_file(&path);
        Studio::open(path, StudioOptions::default(), Arc::new(NotifyHub::new()), Arc::new(NoopObserver)).unwrap()
    }

    const SEED: &str = r#"{
        "courses": [
            { "slug": "handbuilding-basics" },
            { "slug": "pottery-wheel-intro", "name": "Wheel intro" },
            { "slug": "family-sunday", "schedule_rule": "first_sunday_of_month", "capacity": 8 }
        ],
        "recurring_slots": [
            { "id": "01J0000000000000000000000A", "day_of_week": 1, "start_time": "09:00", "end_time": "12:00" },
            { "course": "handbuilding-basics", "day_of_week": 1, "start_time": "14:00:00", "end_time": "16:00:00" },
            { "course": "pottery-wheel-intro", "day_of_week": 3, "start_time": "18:00", "end_time": "20:00", "is_active": false }
        ],
        "special_slots": [
            { "course": "family-sunday", "start_time": "13:00", "end_time": "16:00" }
        ],
        "date_overrides": [
            { "course": "handbuilding-basics", "date": "2025-12-24", "is_available": false }
        ],
        "bookings": [
            { "course": "handbuilding-basics", "slot": "01J0000000000000000000000A",
              "date": "2025-06-02", "participants": 3, "status": "confirmed" },
            { "course": "handbuilding-basics", "slot": "01J0000000000000000000000A",
              "date": "2025-06-02", "participants": 2, "status": "cancelled" }
        ]
    }"#;

    #[tokio::test]
    async fn imports_in_dependency_order() {
        let studio = test_studio("import.wal");
        let report = import(&studio, parse(SEED).unwrap()).await.unwrap();
        assert_eq!(
            report,
            ImportReport {
                courses_created: 3,
                courses_updated: 0,
                recurring_slots: 3,
                special_slots: 1,
                date_overrides: 1,
                bookings: 2,
                skipped: 0,
            }
        );

        let wheel = studio.find_course("pottery-wheel-intro").unwrap();
        assert_eq!(wheel.capacity_class, CapacityClass::PotteryWheel);
        assert_eq!(wheel.effective_capacity(), 4);
        let family = studio.find_course("family-sunday").unwrap();
        assert_eq!(family.schedule_rule, ScheduleRule::FirstSundayOfMonth);

        let basics = studio.find_course("handbuilding-basics").unwrap();
        let monday = studio
            .slots_for_day(basics.id, "2025-06-02".parse().unwrap())
            .await
            .unwrap();
        let seats: Vec<_> = monday.slots.iter().map(|s| (s.display.as_str(), s.remaining_seats)).collect();
        assert_eq!(seats, [("09:00 - 12:00", 9), ("14:00 - 16:00", 12)]);

        let history = studio.bookings_for_course(basics.id).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|b| b.status == BookingStatus::Cancelled));
    }

    #[tokio::test]
    async fn reimport_updates_courses() {
        let studio = test_studio("reimport.wal");
        import(&studio, parse(r#"{ "courses": [{ "slug": "glazing" }] }"#).unwrap())
            .await
            .unwrap();
        let report = import(&studio, parse(r#"{ "courses": [{ "slug": "glazing", "capacity": 6 }] }"#).unwrap())
            .await
            .unwrap();
        assert_eq!(report.courses_updated, 1);
        assert_eq!(studio.find_course("glazing").unwrap().effective_capacity(), 6);
    }

    const HISTORY: &str = r#"{
        "courses": [{ "slug": "pottery-wheel-evenings" }],
        "recurring_slots": [
            { "id": "01J0000000000000000000000B", "course": "pottery-wheel-evenings",
              "day_of_week": 3, "start_time": "18:00", "end_time": "20:00" },
            { "id": "01J0000000000000000000000C", "course": "pottery-wheel-evenings",
              "day_of_week": 3, "start_time": "10:00", "end_time": "12:00", "is_active": false }
        ],
        "bookings": [
            { "id": "01J000000000000000000000B1", "course": "pottery-wheel-evenings",
              "slot": "01J0000000000000000000000B", "date": "2025-06-04", "participants": 4,
              "status": "confirmed" },
            { "id": "01J000000000000000000000B2", "course": "pottery-wheel-evenings",
              "slot": "01J0000000000000000000000B", "date": "2025-06-04", "participants": 2,
              "status": "cancelled" },
            { "id": "01J000000000000000000000B3", "course": "pottery-wheel-evenings",
              "slot": "01J0000000000000000000000C", "date": "2025-06-04", "participants": 1,
              "status": "completed" }
        ]
    }"#;

    #[tokio::test]
    async fn finished_bookings_import_on_full_or_retired_slots() {
        let studio = test_studio("history.wal");
        let report = import(&studio, parse(HISTORY).unwrap()).await.unwrap();
        assert_eq!(report.bookings, 3);

        let wheel = studio.find_course("pottery-wheel-evenings").unwrap();
        let day = studio
            .slots_for_day(wheel.id, "2025-06-04".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(day.slots.len(), 1);
        assert_eq!(day.slots[0].booked_seats, 4);
        assert_eq!(day.slots[0].remaining_seats, 0);

        let mut statuses: Vec<_> = studio
            .bookings_for_course(wheel.id)
            .unwrap()
            .into_iter()
            .map(|b| (b.id.to_string(), b.status))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            statuses,
            [
                ("01J000000000000000000000B1".to_string(), BookingStatus::Confirmed),
                ("01J000000000000000000000B2".to_string(), BookingStatus::Cancelled),
                ("01J000000000000000000000B3".to_string(), BookingStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn reimport_skips_rows_with_known_ids() {
        let studio = test_studio("reimport_ids.wal");
        import(&studio, parse(HISTORY).unwrap()).await.unwrap();
        let again = import(&studio, parse(HISTORY).unwrap()).await.unwrap();
        assert_eq!(
            again,
            ImportReport {
                courses_updated: 1,
                skipped: 5,
                ..ImportReport::default()
            }
        );
        let wheel = studio.find_course("pottery-wheel-evenings").unwrap();
        assert_eq!(studio.bookings_for_course(wheel.id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_course_is_reported() {
        let studio = test_studio("unknown.wal");
        let seed = parse(r#"{ "special_slots": [{ "course": "raku", "start_time": "10:00", "end_time": "11:00" }] }"#)
            .unwrap();
        assert!(matches!(import(&studio, seed).await, Err(SeedError::UnknownCourse(slug)) if slug == "raku"));
    }

    #[test]
    fn rejects_unknown_sections() {
        assert!(matches!(parse(r#"{ "holidays": [] }"#), Err(SeedError::Json(_))));
    }
}
