use std::collections::BTreeMap;

use chrono::NaiveDate;
use thiserror::Error;

use crate::hours::{self, HOURS_PER_DAY};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("hour {0} is outside the operating window")]
    HourOutsideWindow(u32),
}

/// Visitor counts for the operating hours of one calendar day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DayRecord {
    counts: [u32; HOURS_PER_DAY],
}

impl DayRecord {
    /// Count for `hour`; hours never written, or outside the window, read as 0.
    /// Builds a record from counts in column order, starting at the opening
    /// hour. Missing columns stay 0 and surplus columns are dropped.
    pub fn from_columns(columns: impl IntoIterator<Item = u32>) -> Self {
        let mut record = Self::default();
        for (slot, count) in record.counts.iter_mut().zip(columns) {
            *slot = count;
        }
        record
    }

    pub fn get(&self, hour: u32) -> u32 {
        hours::slot(hour).map_or(0, |slot| self.counts[slot])
    }

    pub fn set(&mut self, hour: u32, count: u32) -> Result<(), StoreError> {
        let slot = hours::slot(hour).ok_or(StoreError::HourOutsideWindow(hour))?;
        self.counts[slot] = count;
        Ok(())
    }

    /// `(hour, count)` pairs in column order.
    pub fn hours(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        hours::operating_hours().zip(self.counts.iter().copied())
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| u64::from(c)).sum()
    }
}

/// In-memory `date -> hour -> count` working set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationStore {
    days: BTreeMap<NaiveDate, DayRecord>,
}

impl AggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the count of one hour cell, creating the day if needed.
    pub fn set_hour(&mut self, date: NaiveDate, hour: u32, count: u32) -> Result<(), StoreError> {
        self.days.entry(date).or_default().set(hour, count)
    }

    pub fn get_hour(&self, date: NaiveDate, hour: u32) -> u32 {
        self.days.get(&date).map_or(0, |day| day.get(hour))
    }

    /// Registers a day with all-zero counts if it is not already present.
    pub fn touch_day(&mut self, date: NaiveDate) {
        self.days.entry(date).or_default();
    }

    pub fn insert_day(&mut self, date: NaiveDate, record: DayRecord) {
        self.days.insert(date, record);
    }

    pub fn day(&self, date: NaiveDate) -> Option<&DayRecord> {
        self.days.get(&date)
    }

    /// Rows in ascending date order. Each call starts a fresh pass.
    pub fn sorted_rows(&self) -> impl Iterator<Item = (NaiveDate, &DayRecord)> + '_ {
        self.days.iter().map(|(date, record)| (*date, record))
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}
