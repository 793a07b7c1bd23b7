use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid calendar date {0:?}, expected YYYY-MM-DD")]
    Date(String),
    #[error("invalid month {0:?}, expected YYYY-MM")]
    Month(String),
    #[error("invalid time of day {0:?}, expected HH:MM or HH:MM:SS")]
    Time(String),
    #[error("invalid booking status {0:?}")]
    Status(String),
}

// ── Civil dates ──────────────────────────────────────────────────

/// A civil calendar date. No time-of-day, no zone: the date the customer
/// means, so it never shifts when serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CalendarDate(NaiveDate);

impl CalendarDate {
    pub fn new(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn day(&self) -> u32 {
        self.0.day()
    }

    /// 0 = Sunday through 6 = Saturday.
    pub fn day_of_week(&self) -> u8 {
        self.0.weekday().num_days_from_sunday() as u8
    }

    pub fn is_sunday(&self) -> bool {
        self.0.weekday() == Weekday::Sun
    }

    pub fn succ(&self) -> Option<Self> {
        self.0.succ_opt().map(Self)
    }

    pub fn year_month(&self) -> YearMonth {
        YearMonth(Self(self.0.with_day(1).unwrap_or(self.0)))
    }
}

impl fmt::Display for CalendarDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year(), self.month(), self.day())
    }
}

impl FromStr for CalendarDate {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 10 {
            return Err(ParseError::Date(s.to_string()));
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Self)
            .map_err(|_| ParseError::Date(s.to_string()))
    }
}

impl Serialize for CalendarDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CalendarDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A calendar month, anchored on its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth(CalendarDate);

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        CalendarDate::new(year, month, 1).map(Self)
    }

    pub fn first_day(&self) -> CalendarDate {
        self.0
    }

    pub fn contains(&self, date: CalendarDate) -> bool {
        date.year_month() == *self
    }

    /// Every day of the month in ascending order.
    pub fn days(&self) -> impl Iterator<Item = CalendarDate> + use<> {
        let month = *self;
        std::iter::successors(Some(self.0), CalendarDate::succ)
            .take_while(move |d| month.contains(*d))
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.0.year(), self.0.month())
    }
}

impl FromStr for YearMonth {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .filter(|(y, m)| y.len() == 4 && m.len() == 2)
            .ok_or_else(|| ParseError::Month(s.to_string()))?;
        let year: i32 = year.parse().map_err(|_| ParseError::Month(s.to_string()))?;
        let month: u32 = month.parse().map_err(|_| ParseError::Month(s.to_string()))?;
        Self::new(year, month).ok_or_else(|| ParseError::Month(s.to_string()))
    }
}

impl Serialize for YearMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for YearMonth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ── Times of day ─────────────────────────────────────────────────

/// Minutes since local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        (hour < 24 && minute < 60).then(|| Self((hour * 60 + minute) as u16))
    }

    pub fn minutes(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// Accepts `HH:MM` and the `HH:MM:SS` form SQL `TIME` columns produce.
/// Seconds are dropped.
impl FromStr for TimeOfDay {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = NaiveTime::parse_from_str(s, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
            .map_err(|_| ParseError::Time(s.to_string()))?;
        Self::from_hm(t.hour(), t.minute()).ok_or_else(|| ParseError::Time(s.to_string()))
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Why a stored slot could not become a bookable window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "defect", rename_all = "snake_case")]
pub enum WindowDefect {
    MalformedStart { raw: String },
    MalformedEnd { raw: String },
    NotIncreasing { start: String, end: String },
}

impl fmt::Display for WindowDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowDefect::MalformedStart { raw } => write!(f, "malformed start time {raw:?}"),
            WindowDefect::MalformedEnd { raw } => write!(f, "malformed end time {raw:?}"),
            WindowDefect::NotIncreasing { start, end } => {
                write!(f, "start {start} is not before end {end}")
            }
        }
    }
}

/// Parse a stored `(start_time, end_time)` pair into a valid window.
pub fn parse_window(start: &str, end: &str) -> Result<(TimeOfDay, TimeOfDay), WindowDefect> {
    let s: TimeOfDay = start.parse().map_err(|_| WindowDefect::MalformedStart {
        raw: start.to_string(),
    })?;
    let e: TimeOfDay = end.parse().map_err(|_| WindowDefect::MalformedEnd {
        raw: end.to_string(),
    })?;
    if s >= e {
        return Err(WindowDefect::NotIncreasing {
            start: start.to_string(),
            end: end.to_string(),
        });
    }
    Ok((s, e))
}

// ── Resolved windows ─────────────────────────────────────────────

/// Which rule tier produced a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotSource {
    Override,
    Special,
    Course,
    Global,
}

/// A bookable time-of-day interval on one date. `id` is the stored slot the
/// window came from and is what bookings reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotWindow {
    pub id: Ulid,
    pub source: SlotSource,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl SlotWindow {
    pub fn duration_minutes(&self) -> u32 {
        u32::from(self.end.minutes() - self.start.minutes())
    }

    pub fn label(&self) -> String {
        format!("{} - {}", self.start, self.end)
    }
}

// ── Stored records ───────────────────────────────────────────────

/// Weekly rule. `course_id = None` is a global fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringSlot {
    pub id: Ulid,
    pub course_id: Option<Ulid>,
    /// 0 = Sunday.
    pub day_of_week: u8,
    pub start_time: String,
    pub end_time: String,
    pub is_active: bool,
}

impl RecurringSlot {
    pub fn is_global(&self) -> bool {
        self.course_id.is_none()
    }
}

/// Window offered on the eligible Sundays of a `FirstSundayOfMonth` course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialRecurringSlot {
    pub id: Ulid,
    pub course_id: Ulid,
    pub start_time: String,
    pub end_time: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideSlot {
    pub id: Ulid,
    pub override_id: Ulid,
    pub start_time: String,
    pub end_time: String,
    pub is_active: bool,
}

/// Per-date exception. Unavailable closes the date; available replaces the
/// date's recurring slots with `slots`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateOverride {
    pub id: Ulid,
    pub course_id: Ulid,
    pub override_date: CalendarDate,
    pub is_available: bool,
    #[serde(default)]
    pub slots: Vec<OverrideSlot>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityClass {
    #[default]
    Standard,
    PotteryWheel,
}

impl CapacityClass {
    pub fn default_capacity(&self) -> u32 {
        match self {
            CapacityClass::Standard => 12,
            CapacityClass::PotteryWheel => 4,
        }
    }

    /// Legacy naming convention: wheel courses carry "wheel" in their slug.
    /// Only consulted when a course is created without an explicit class.
    pub fn from_slug(slug: &str) -> Self {
        if slug.to_ascii_lowercase().contains("wheel") {
            CapacityClass::PotteryWheel
        } else {
            CapacityClass::Standard
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleRule {
    #[default]
    Standard,
    /// First Sunday of every month, every Sunday in December.
    FirstSundayOfMonth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: Ulid,
    pub slug: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Explicit seat count; falls back to the class default when unset.
    #[serde(default)]
    pub capacity: Option<u32>,
    pub capacity_class: CapacityClass,
    #[serde(default)]
    pub schedule_rule: ScheduleRule,
}

impl Course {
    pub fn new(id: Ulid, slug: impl Into<String>) -> Self {
        let slug = slug.into();
        Self {
            id,
            capacity_class: CapacityClass::from_slug(&slug),
            slug,
            name: None,
            capacity: None,
            schedule_rule: ScheduleRule::Standard,
        }
    }

    pub fn effective_capacity(&self) -> u32 {
        self.capacity
            .unwrap_or_else(|| self.capacity_class.default_capacity())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Only pending and confirmed bookings occupy seats.
    pub fn holds_seat(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, Completed)
                | (Confirmed, Cancelled)
                | (Cancelled, Pending)
                | (Cancelled, Confirmed)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        })
    }
}

impl FromStr for BookingStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(ParseError::Status(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub course_id: Ulid,
    pub slot_reference_id: Ulid,
    pub booking_date: CalendarDate,
    pub participants: u32,
    pub status: BookingStatus,
    #[serde(default)]
    pub label: Option<String>,
}

/// The event types, flat. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CourseCreated { course: Course },
    CourseUpdated { course: Course },
    CourseDeleted { id: Ulid },
    RecurringSlotAdded { slot: RecurringSlot },
    RecurringSlotToggled { id: Ulid, is_active: bool },
    RecurringSlotRemoved { id: Ulid },
    SpecialSlotAdded { slot: SpecialRecurringSlot },
    SpecialSlotRemoved { id: Ulid },
    DateOverrideSet { date_override: DateOverride },
    DateOverrideCleared { course_id: Ulid, date: CalendarDate },
    BookingRecorded { booking: Booking },
    BookingStatusChanged { id: Ulid, status: BookingStatus },
}

// ── Query result types ───────────────────────────────────────────

/// One row of the slot-selection list for a single date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotOffer {
    pub slot_id: Ulid,
    pub source: SlotSource,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub duration_minutes: u32,
    pub display: String,
    pub total_capacity: u32,
    pub booked_seats: u32,
    pub remaining_seats: u32,
    pub fully_booked: bool,
    pub overbooked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaySlots {
    pub course_id: Ulid,
    pub date: CalendarDate,
    pub slots: Vec<SlotOffer>,
}
