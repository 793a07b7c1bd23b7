//! Hard input limits. Exceeding one is an error, never a silent clamp,
//! except for the calendar fan-out width which is clamped on open.

pub const MAX_COURSES: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 1024;
pub const MAX_PARTICIPANTS_PER_BOOKING: u32 = 64;
pub const MAX_SLOTS_PER_OVERRIDE: usize = 48;
pub const MAX_SLOTS_PER_COURSE: usize = 512;
pub const MAX_CALENDAR_CONCURRENCY: usize = 64;
/// Month summaries kept in memory before the earliest months are evicted.
pub const MAX_CACHED_MONTHS: usize = 4096;
