//! Hourly unique visitor counting.
//!
//! A detection feed reports tracked people frame by frame. The engine
//! deduplicates repeat sightings within a cooldown, counts distinct visitors
//! per hour of the daily operating window (9:00 to 21:59) and keeps the
//! counts in a CSV ledger that survives restarts.

pub mod clock;
pub mod controller;
pub mod engine;
pub mod feed;
pub mod hours;
pub mod journal;
pub mod ledger;
pub mod pump;
pub mod region;
pub mod registry;
pub mod service;
pub mod store;
