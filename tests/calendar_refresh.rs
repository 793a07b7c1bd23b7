use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ulid::Ulid;

use kiln::engine::{DayCellState, EngineError, NewBooking, Studio, StudioOptions};
use kiln::model::*;
use kiln::notify::NotifyHub;
use kiln::observability::TracingObserver;

// ── Test infrastructure ──────────────────────────────────────

fn fresh_wal() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("kiln_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("studio.wal")
}

fn open(path: PathBuf) -> Arc<Studio> {
    Arc::new(
        Studio::open(
            path,
            StudioOptions::default(),
            Arc::new(NotifyHub::new()),
            Arc::new(TracingObserver),
        )
        .unwrap(),
    )
}

const EVENING_SLOT: &str = "01J1111111111111111111111E";

fn seed() -> kiln::seed::StudioSeed {
    kiln::seed::parse(&format!(
        r#"{{
            "courses": [{{ "slug": "pottery-wheel-evenings" }}],
            "recurring_slots": [
                {{ "id": "{EVENING_SLOT}", "course": "pottery-wheel-evenings",
                   "day_of_week": 3, "start_time": "18:00", "end_time": "20:00" }}
            ]
        }}"#
    ))
    .unwrap()
}

fn date(s: &str) -> CalendarDate {
    s.parse().unwrap()
}

fn booking(course_id: Ulid, on: &str, participants: u32) -> NewBooking {
    NewBooking {
        id: Ulid::new(),
        course_id,
        slot_id: EVENING_SLOT.parse().unwrap(),
        date: date(on),
        participants,
        status: BookingStatus::Pending,
        label: Some("walk-in".into()),
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn subscriber_sees_refreshed_month_after_booking() {
    let studio = open(fresh_wal());
    kiln::seed::import(&studio, seed()).await.unwrap();
    let course = studio.find_course("pottery-wheel-evenings").unwrap();
    let june: YearMonth = "2025-06".parse().unwrap();
    let today = date("2025-06-01");

    let cells = studio.calendar(course.id, june, today).await.unwrap();
    assert_eq!(cells[&date("2025-06-04")], DayCellState::Available { remaining: 4 });

    let mut rx = studio.notify.subscribe(course.id);
    let writer = studio.clone();
    let course_id = course.id;
    tokio::spawn(async move {
        writer.record_booking(booking(course_id, "2025-06-04", 4)).await.unwrap();
    });

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notification timed out")
        .unwrap();
    let Event::BookingRecorded { booking: recorded } = &event else {
        panic!("unexpected event {event:?}");
    };
    assert_eq!(recorded.booking_date, date("2025-06-04"));
    assert_eq!(recorded.label.as_deref(), Some("walk-in"));

    // The cached month was patched before the event went out.
    let cells = studio.calendar(course.id, june, today).await.unwrap();
    assert_eq!(cells[&date("2025-06-04")], DayCellState::FullyBooked);
    assert_eq!(cells[&date("2025-06-11")], DayCellState::Available { remaining: 4 });

    let err = studio
        .record_booking(booking(course.id, "2025-06-04", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded { remaining: 0, .. }));
}

#[tokio::test]
async fn reopened_studio_serves_the_same_calendar() {
    let path = fresh_wal();
    let course_id = {
        let studio = open(path.clone());
        kiln::seed::import(&studio, seed()).await.unwrap();
        let course = studio.find_course("pottery-wheel-evenings").unwrap();
        studio.record_booking(booking(course.id, "2025-06-18", 3)).await.unwrap();
        studio.compact_wal().await.unwrap();
        studio.record_booking(booking(course.id, "2025-06-25", 1)).await.unwrap();
        course.id
    };

    let studio = open(path);
    let summary = studio.month_summary(course_id, "2025-06".parse().unwrap()).await.unwrap();
    let remaining: Vec<u32> = ["2025-06-04", "2025-06-18", "2025-06-25", "2025-06-05"]
        .iter()
        .map(|d| summary.get(date(d)).unwrap().remaining_total)
        .collect();
    assert_eq!(remaining, [4, 1, 3, 0]);
    assert!(!summary.get(date("2025-06-05")).unwrap().has_slots);
}
