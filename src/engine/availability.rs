use ulid::Ulid;

use crate::model::*;
use crate::observability::{Observer, ResolutionEvent};

use super::store::ScheduleStore;
use super::StoreError;

// ── Availability Resolver ─────────────────────────────────────────

/// Everything the resolver may consult for one `(course, date)`.
#[derive(Debug, Clone, Default)]
pub struct DayRules {
    pub date_override: Option<DateOverride>,
    pub special: Vec<SpecialRecurringSlot>,
    pub recurring: Vec<RecurringSlot>,
}

/// Resolve the bookable windows of `course` on `date`.
///
/// Tiers are strictly ordered and the first that applies wins:
/// 1. A date override closes the date or replaces its slots outright.
/// 2. A `FirstSundayOfMonth` course on a Sunday gets its special windows when
///    the Sunday is eligible, and nothing otherwise. There is no fallback to
///    weekly rules on an ineligible Sunday.
/// 3. Weekly rules: course-specific plus global, concatenated, never deduplicated.
pub fn resolve_day(
    course: &Course,
    date: CalendarDate,
    rules: &DayRules,
    observer: &dyn Observer,
) -> Vec<SlotWindow> {
    if let Some(date_override) = &rules.date_override {
        return override_windows(course.id, date, date_override, observer);
    }
    if special_rule_applies(course, date) {
        return special_windows(course, date, &rules.special, observer);
    }
    recurring_windows(course, date, &rules.recurring, observer)
}

/// Store-backed resolution. Reads lazily in precedence order so a date
/// decided by an override never touches the recurring tables.
pub async fn resolve<S: ScheduleStore + ?Sized>(
    store: &S,
    course: &Course,
    date: CalendarDate,
    observer: &dyn Observer,
) -> Result<Vec<SlotWindow>, StoreError> {
    if let Some(date_override) = store.date_override(course.id, date).await? {
        return Ok(override_windows(course.id, date, &date_override, observer));
    }
    if special_rule_applies(course, date) {
        let slots = if first_sunday_eligible(date) {
            store.special_slots(course.id).await?
        } else {
            Vec::new()
        };
        return Ok(special_windows(course, date, &slots, observer));
    }
    let slots = store.recurring_slots(course.id, date.day_of_week()).await?;
    Ok(recurring_windows(course, date, &slots, observer))
}

pub fn special_rule_applies(course: &Course, date: CalendarDate) -> bool {
    course.schedule_rule == ScheduleRule::FirstSundayOfMonth && date.is_sunday()
}

/// First Sunday of the month, or any Sunday in December.
pub fn first_sunday_eligible(date: CalendarDate) -> bool {
    date.is_sunday() && (date.month() == 12 || date.day() <= 7)
}

pub fn override_windows(
    course_id: Ulid,
    date: CalendarDate,
    date_override: &DateOverride,
    observer: &dyn Observer,
) -> Vec<SlotWindow> {
    let mut windows = Vec::new();
    if date_override.is_available {
        for slot in date_override.slots.iter().filter(|s| s.is_active) {
            let parsed = to_window(
                course_id,
                date,
                slot.id,
                SlotSource::Override,
                (slot.start_time.as_str(), slot.end_time.as_str()),
                observer,
            );
            windows.extend(parsed);
        }
        windows.sort_by_key(|w| (w.start, w.end, w.id));
    }
    observer.observe(&ResolutionEvent::OverrideApplied {
        course_id,
        date,
        is_available: date_override.is_available,
        windows: windows.len(),
    });
    windows
}

pub fn special_windows(
    course: &Course,
    date: CalendarDate,
    slots: &[SpecialRecurringSlot],
    observer: &dyn Observer,
) -> Vec<SlotWindow> {
    let eligible = first_sunday_eligible(date);
    let mut windows = Vec::new();
    if eligible {
        for slot in slots
            .iter()
            .filter(|s| s.is_active && s.course_id == course.id)
        {
            let parsed = to_window(
                course.id,
                date,
                slot.id,
                SlotSource::Special,
                (slot.start_time.as_str(), slot.end_time.as_str()),
                observer,
            );
            windows.extend(parsed);
        }
        windows.sort_by_key(|w| (w.start, w.end, w.id));
    }
    observer.observe(&ResolutionEvent::SpecialRuleApplied {
        course_id: course.id,
        date,
        eligible,
        windows: windows.len(),
    });
    windows
}

pub fn recurring_windows(
    course: &Course,
    date: CalendarDate,
    slots: &[RecurringSlot],
    observer: &dyn Observer,
) -> Vec<SlotWindow> {
    let dow = date.day_of_week();
    let mut windows = Vec::new();
    let (mut course_specific, mut global) = (0usize, 0usize);

    for slot in slots.iter().filter(|s| s.is_active && s.day_of_week == dow) {
        let source = match slot.course_id {
            None => SlotSource::Global,
            Some(id) if id == course.id => SlotSource::Course,
            Some(_) => continue,
        };
        let Some(window) = to_window(
            course.id,
            date,
            slot.id,
            source,
            (slot.start_time.as_str(), slot.end_time.as_str()),
            observer,
        ) else {
            continue;
        };
        match source {
            SlotSource::Global => global += 1,
            _ => course_specific += 1,
        }
        windows.push(window);
    }

    // Start time first; on equal starts the course's own slot precedes the
    // global one. Both stay: identical times are distinct bookable windows.
    windows.sort_by_key(|w| (w.start, w.source, w.end, w.id));

    observer.observe(&ResolutionEvent::RecurringApplied {
        course_id: course.id,
        date,
        course_specific,
        global,
    });
    windows
}

/// Parse one stored slot. A defective slot is reported and skipped so the
/// rest of the day still resolves.
fn to_window(
    course_id: Ulid,
    date: CalendarDate,
    slot_id: Ulid,
    source: SlotSource,
    (start, end): (&str, &str),
    observer: &dyn Observer,
) -> Option<SlotWindow> {
    match parse_window(start, end) {
        Ok((start, end)) => Some(SlotWindow {
            id: slot_id,
            source,
            start,
            end,
        }),
        Err(defect) => {
            observer.observe(&ResolutionEvent::InvalidWindow {
                course_id,
                date,
                slot_id,
                defect,
            });
            None
        }
    }
}
