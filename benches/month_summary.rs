use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use kiln::engine::{month_summary, MemoryStore};
use kiln::model::*;
use kiln::observability::NoopObserver;

const COURSES: usize = 40;
const ROUNDS: usize = 200;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn slot(course_id: Option<Ulid>, dow: u8, start: &str, end: &str) -> Event {
    Event::RecurringSlotAdded {
        slot: RecurringSlot {
            id: Ulid::new(),
            course_id,
            day_of_week: dow,
            start_time: start.into(),
            end_time: end.into(),
            is_active: true,
        },
    }
}

/// A busy studio: global weekday mornings, two evening slots per course,
/// and a few bookings on every offered evening.
fn populate(store: &MemoryStore) -> Vec<Course> {
    for dow in 1..=5 {
        store.apply_event(&slot(None, dow, "09:00", "12:00"));
    }
    let june = YearMonth::new(2025, 6).expect("valid month");
    let mut courses = Vec::new();
    for i in 0..COURSES {
        let slug = if i % 4 == 0 { format!("wheel-{i}") } else { format!("handbuilding-{i}") };
        let course = Course::new(Ulid::new(), slug);
        store.apply_event(&Event::CourseCreated { course: course.clone() });
        for dow in [(i % 5) as u8 + 1, 6] {
            let added = slot(Some(course.id), dow, "18:00", "20:00");
            let Event::RecurringSlotAdded { slot: ref evening } = added else { unreachable!() };
            let evening_id = evening.id;
            store.apply_event(&added);
            for date in june.days().filter(|d| d.day_of_week() == dow) {
                store.apply_event(&Event::BookingRecorded {
                    booking: Booking {
                        id: Ulid::new(),
                        course_id: course.id,
                        slot_reference_id: evening_id,
                        booking_date: date,
                        participants: 2,
                        status: BookingStatus::Confirmed,
                        label: None,
                    },
                });
            }
        }
        courses.push(course);
    }
    courses
}

#[tokio::main]
async fn main() {
    let store = Arc::new(MemoryStore::new());
    let courses = populate(&store);
    let june = YearMonth::new(2025, 6).expect("valid month");
    println!("kiln month_summary bench: {COURSES} courses, {ROUNDS} rounds per width");

    for width in [1usize, 4, 8, 31] {
        let mut latencies = Vec::with_capacity(ROUNDS);
        let started = Instant::now();
        for round in 0..ROUNDS {
            let course = &courses[round % courses.len()];
            let t = Instant::now();
            let summary = month_summary(store.as_ref(), course, june, width, &NoopObserver)
                .await
                .expect("memory store never fails");
            latencies.push(t.elapsed());
            assert_eq!(summary.days.len(), 30);
        }
        let elapsed = started.elapsed();
        println!(
            "width {width}: {:.0} months/s",
            ROUNDS as f64 / elapsed.as_secs_f64()
        );
        print_latency("month_summary", &mut latencies);
    }
}
