//! Clock-driven state machine deciding which (date, hour) cell is open.
//!
//! The controller never sees observations and never touches storage. Each
//! poll compares the polled `now` with its own notion of the current date,
//! hour and window state and reports the transitions it took, in the order
//! the engine must act on them:
//!
//! ```text
//! date rollover -> hour rollover -> window entry / window exit
//! ```

use chrono::{NaiveDate, NaiveDateTime, Timelike};

use crate::hours;

/// One hour cell of the aggregation store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cell {
    pub date: NaiveDate,
    pub hour: u32,
}

impl Cell {
    pub fn of(now: NaiveDateTime) -> Self {
        Self {
            date: now.date(),
            hour: now.hour(),
        }
    }
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}:00", self.date, self.hour)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The calendar date changed; the ledger is flushed.
    DateRolled { from: NaiveDate, to: NaiveDate },
    /// The hour changed. `closed` is the cell that was accumulating, if any;
    /// `opened` is the next cell when tracking continues into it.
    HourRolled {
        closed: Option<Cell>,
        opened: Option<Cell>,
    },
    /// Tracking starts in `cell`.
    WindowEntered { cell: Cell },
    /// Tracking stops. `closed` is still open only when no hour rollover
    /// closed it in the same poll.
    WindowExited { closed: Option<Cell> },
}

#[derive(Debug)]
pub struct WindowController {
    current_date: NaiveDate,
    current_hour: u32,
    in_window: bool,
    last_minute: NaiveDateTime,
}

impl WindowController {
    /// Starts outside the window at `now`; the first poll inside operating
    /// hours produces a window entry.
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            current_date: now.date(),
            current_hour: now.hour(),
            in_window: false,
            last_minute: truncate_to_minute(now),
        }
    }

    pub fn in_window(&self) -> bool {
        self.in_window
    }

    /// Cell currently accumulating visitors.
    pub fn open_cell(&self) -> Option<Cell> {
        (self.in_window && hours::in_operating_window(self.current_hour)).then_some(Cell {
            date: self.current_date,
            hour: self.current_hour,
        })
    }

    pub fn poll(&mut self, now: NaiveDateTime) -> Vec<Transition> {
        let mut transitions = Vec::new();
        let date = now.date();
        let hour = now.hour();

        let date_changed = date != self.current_date;
        if date_changed {
            transitions.push(Transition::DateRolled {
                from: self.current_date,
                to: date,
            });
        }

        if hour != self.current_hour || date_changed {
            let closed = self.open_cell();
            self.current_date = date;
            self.current_hour = hour;
            transitions.push(Transition::HourRolled {
                closed,
                opened: self.open_cell(),
            });
        }

        let should_track = hours::in_operating_window(hour);
        if should_track && !self.in_window {
            self.in_window = true;
            transitions.push(Transition::WindowEntered {
                cell: Cell::of(now),
            });
        } else if !should_track && self.in_window {
            // hour rollover already moved current_hour out of the window
            // whenever both fire together, so nothing is left open then
            let closed = self.open_cell();
            self.in_window = false;
            transitions.push(Transition::WindowExited { closed });
        }

        transitions
    }

    /// True once per wall-clock minute while tracking; drives the periodic
    /// snapshot and flush.
    pub fn minute_elapsed(&mut self, now: NaiveDateTime) -> bool {
        let minute = truncate_to_minute(now);
        if minute == self.last_minute {
            return false;
        }
        self.last_minute = minute;
        self.open_cell().is_some()
    }
}

fn truncate_to_minute(now: NaiveDateTime) -> NaiveDateTime {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}
