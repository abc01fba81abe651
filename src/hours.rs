//! The daily operating window: 9:00 through 21:59 local time.

/// First hour of the day during which visitors are tracked.
pub const OPEN_HOUR: u32 = 9;
/// First hour of the day after the window has closed.
pub const CLOSE_HOUR: u32 = 22;
/// Number of hour cells per day.
pub const HOURS_PER_DAY: usize = (CLOSE_HOUR - OPEN_HOUR) as usize;

pub fn in_operating_window(hour: u32) -> bool {
    (OPEN_HOUR..CLOSE_HOUR).contains(&hour)
}

/// Column index of `hour` inside a day record, `None` outside the window.
pub fn slot(hour: u32) -> Option<usize> {
    in_operating_window(hour).then(|| (hour - OPEN_HOUR) as usize)
}

pub fn operating_hours() -> impl Iterator<Item = u32> {
    OPEN_HOUR..CLOSE_HOUR
}
