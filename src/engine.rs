//! The aggregation engine: owns every piece of mutable counting state and
//! routes clock transitions and observations into it.

use chrono::{NaiveDateTime, TimeDelta};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::controller::{Cell, Transition, WindowController};
use crate::ledger::{Ledger, LedgerError};
use crate::pump::{LiveVisitors, Observation};
use crate::registry::{DedupRegistry, RecountPolicy, TrackId};
use crate::store::AggregationStore;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub cooldown: TimeDelta,
    pub policy: RecountPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cooldown: TimeDelta::minutes(30),
            policy: RecountPolicy::AfterCooldown,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub new_visitor_events: u64,
    pub hours_closed: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
}

pub struct VisitorEngine<L> {
    ledger: L,
    store: AggregationStore,
    controller: WindowController,
    live: LiveVisitors,
    // count already on record for the open cell when it was opened
    baseline: u32,
    stats: SessionStats,
}

impl<L: Ledger> VisitorEngine<L> {
    /// Loads the ledger and starts outside the operating window at `now`.
    ///
    /// Damaged ledger content is tolerated by the ledger itself; an error here
    /// means an existing ledger could not be read at all.
    pub fn start(ledger: L, config: EngineConfig, now: NaiveDateTime) -> Result<Self, LedgerError> {
        let store = ledger.load()?;
        Ok(Self::with_store(ledger, store, config, now))
    }

    pub fn with_store(
        ledger: L,
        store: AggregationStore,
        config: EngineConfig,
        now: NaiveDateTime,
    ) -> Self {
        Self {
            ledger,
            store,
            controller: WindowController::new(now),
            live: LiveVisitors::new(DedupRegistry::new(config.cooldown, config.policy)),
            baseline: 0,
            stats: SessionStats::default(),
        }
    }

    /// Runs the window controller for one tick and applies its transitions.
    pub fn advance(&mut self, now: NaiveDateTime) -> Vec<Transition> {
        self.store.touch_day(now.date());
        let transitions = self.controller.poll(now);
        for transition in &transitions {
            match *transition {
                Transition::DateRolled { to, .. } => {
                    info!("Date changed to {to}");
                    self.flush();
                }
                Transition::HourRolled { closed, opened } => {
                    if let Some(cell) = closed {
                        let count = self.snapshot(cell);
                        self.stats.hours_closed += 1;
                        info!(visitors = count, "Closed hour {cell}");
                        self.flush();
                    }
                    self.open(opened);
                    info!("Reset visitor count for new hour: {}:00", now.format("%H"));
                }
                Transition::WindowEntered { cell } => {
                    info!("Entering operating hours at {cell}");
                    self.open(Some(cell));
                }
                Transition::WindowExited { closed } => {
                    info!("Exiting operating hours at {}", now.format("%H:%M"));
                    if let Some(cell) = closed {
                        self.snapshot(cell);
                    }
                    self.flush();
                }
            }
        }
        transitions
    }

    /// Feeds one tick's observations through the dedup registry. Returns the
    /// tracks counted as new visitors. Nothing is counted outside the window.
    pub fn ingest(&mut self, batch: &[Observation]) -> Vec<TrackId> {
        if self.controller.open_cell().is_none() {
            if !batch.is_empty() {
                debug!(observations = batch.len(), "Dropping observations outside operating hours");
            }
            return Vec::new();
        }
        let new_visitors = self.live.pump(batch);
        for track_id in &new_visitors {
            self.stats.new_visitor_events += 1;
            info!(track_id, "New visitor detected! Current count: {}", self.live_count());
        }
        new_visitors
    }

    /// Periodic snapshot and flush, at most once per wall-clock minute.
    pub fn checkpoint(&mut self, now: NaiveDateTime) -> bool {
        if !self.controller.minute_elapsed(now) {
            return false;
        }
        if let Some(cell) = self.controller.open_cell() {
            self.snapshot(cell);
        }
        self.flush()
    }

    /// Final snapshot of the open cell and a last flush.
    pub fn shutdown(&mut self) -> SessionStats {
        if let Some(cell) = self.controller.open_cell() {
            let count = self.snapshot(cell);
            info!(visitors = count, "Saving {cell} before exit");
        }
        self.flush();
        self.stats
    }

    /// Writes the store to the ledger. Failures are logged and retried by the
    /// next flush; in-memory counts are never discarded.
    pub fn flush(&mut self) -> bool {
        match self.ledger.save(&self.store) {
            Ok(()) => {
                self.stats.flushes += 1;
                true
            }
            Err(err) => {
                self.stats.failed_flushes += 1;
                error!("Failed to update ledger, keeping counts in memory: {err}");
                false
            }
        }
    }

    fn open(&mut self, cell: Option<Cell>) {
        self.live.reset();
        self.baseline = cell.map_or(0, |c| self.store.get_hour(c.date, c.hour));
        if self.baseline > 0 {
            info!(visitors = self.baseline, "Resuming counts already recorded for this hour");
        }
    }

    fn snapshot(&mut self, cell: Cell) -> u32 {
        let count = self.live_count();
        if let Err(err) = self.store.set_hour(cell.date, cell.hour, count) {
            warn!("Snapshot of {cell} rejected: {err}");
        }
        count
    }

    /// Visitors of the open cell, including those on record before a restart.
    pub fn live_count(&self) -> u32 {
        self.baseline.saturating_add(self.live.count())
    }

    pub fn open_cell(&self) -> Option<Cell> {
        self.controller.open_cell()
    }

    pub fn is_tracking(&self) -> bool {
        self.controller.open_cell().is_some()
    }

    pub fn store(&self) -> &AggregationStore {
        &self.store
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;

    /// Ledger keeping every saved store in memory; can be told to fail.
    #[derive(Debug, Default)]
    pub(crate) struct MemoryLedger {
        pub initial: AggregationStore,
        pub saves: Vec<AggregationStore>,
        pub failures_left: usize,
    }

    impl MemoryLedger {
        pub fn last(&self) -> Option<&AggregationStore> {
            self.saves.last()
        }
    }

    impl Ledger for MemoryLedger {
        fn load(&self) -> Result<AggregationStore, LedgerError> {
            Ok(self.initial.clone())
        }

        fn save(&mut self, store: &AggregationStore) -> Result<(), LedgerError> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(LedgerError::Io {
                    path: "memory".into(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.saves.push(store.clone());
            Ok(())
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    fn at(d: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        day(d).and_hms_opt(h, m, s).unwrap()
    }

    fn engine_at(now: NaiveDateTime) -> VisitorEngine<MemoryLedger> {
        VisitorEngine::start(MemoryLedger::default(), EngineConfig::default(), now).unwrap()
    }

    fn tick(engine: &mut VisitorEngine<MemoryLedger>, now: NaiveDateTime, ids: &[TrackId]) {
        engine.advance(now);
        let batch: Vec<Observation> = ids.iter().map(|&id| Observation::new(id, now)).collect();
        engine.ingest(&batch);
        engine.checkpoint(now);
    }

    #[test]
    fn nothing_is_tracked_before_opening() {
        let mut engine = engine_at(at(1, 8, 59, 58));
        tick(&mut engine, at(1, 8, 59, 59), &[1, 2]);
        assert!(!engine.is_tracking());
        assert_eq!(engine.live_count(), 0);
        assert_eq!(engine.store().day(day(1)).unwrap().total(), 0);
    }

    #[test]
    fn tracking_starts_at_nine_with_empty_registry() {
        let mut engine = engine_at(at(1, 8, 59, 59));
        tick(&mut engine, at(1, 9, 0, 0), &[1]);
        assert_eq!(engine.open_cell().map(|c| c.hour), Some(9));
        assert_eq!(engine.live_count(), 1);
    }

    #[test]
    fn scenario_counts_one_distinct_visitor_in_hour_nine() {
        let mut engine = engine_at(at(1, 8, 59, 59));
        let mut events = Vec::new();
        for now in [at(1, 9, 0, 0), at(1, 9, 10, 0), at(1, 9, 45, 0)] {
            engine.advance(now);
            events.push(!engine.ingest(&[Observation::new(5, now)]).is_empty());
        }
        assert_eq!(events, vec![true, false, true]);
        assert_eq!(engine.stats().new_visitor_events, 2);

        engine.advance(at(1, 10, 0, 0));
        assert_eq!(engine.store().get_hour(day(1), 9), 1);
    }

    #[test]
    fn hour_rollover_snapshots_flushes_and_resets() {
        let mut engine = engine_at(at(1, 10, 30, 0));
        tick(&mut engine, at(1, 10, 30, 0), &[1, 2, 3]);
        tick(&mut engine, at(1, 10, 59, 59), &[3, 4]);
        tick(&mut engine, at(1, 11, 0, 0), &[1]);

        let saved = engine.ledger().last().unwrap();
        assert_eq!(saved.get_hour(day(1), 10), 4);
        assert_eq!(engine.store().get_hour(day(1), 10), 4);
        // track 1 was seen 30 seconds ago but the registry was reset
        assert_eq!(engine.live_count(), 1);
        assert_eq!(engine.stats().hours_closed, 1);
    }

    #[test]
    fn window_exit_flushes_last_hour_and_stops_tracking() {
        let mut engine = engine_at(at(1, 21, 59, 0));
        tick(&mut engine, at(1, 21, 59, 0), &[1, 2]);
        tick(&mut engine, at(1, 21, 59, 59), &[3]);
        tick(&mut engine, at(1, 22, 0, 0), &[4]);

        assert!(!engine.is_tracking());
        let saved = engine.ledger().last().unwrap();
        assert_eq!(saved.get_hour(day(1), 21), 3);
        assert!(saved.sorted_rows().all(|(_, rec)| rec.get(22) == 0));

        tick(&mut engine, at(1, 22, 0, 1), &[5]);
        assert_eq!(engine.store().get_hour(day(1), 21), 3);
    }

    #[test]
    fn bucket_is_monotonic_within_hour() {
        let mut engine = engine_at(at(1, 12, 0, 0));
        let mut last = 0;
        for (minute, id) in [(0, 1), (1, 1), (2, 2), (3, 3), (4, 2)] {
            tick(&mut engine, at(1, 12, minute, 0), &[id]);
            let current = engine.store().get_hour(day(1), 12);
            assert!(current >= last);
            last = current;
        }
        assert_eq!(last, 3);
    }

    #[test]
    fn minute_edge_checkpoints_to_ledger() {
        let mut engine = engine_at(at(1, 13, 0, 10));
        tick(&mut engine, at(1, 13, 0, 10), &[1]);
        assert!(engine.ledger().saves.is_empty());

        tick(&mut engine, at(1, 13, 1, 0), &[2]);
        assert_eq!(engine.ledger().saves.len(), 1);
        assert_eq!(engine.ledger().last().unwrap().get_hour(day(1), 13), 2);

        tick(&mut engine, at(1, 13, 1, 30), &[3]);
        assert_eq!(engine.ledger().saves.len(), 1);
    }

    #[test]
    fn failed_flush_keeps_counts_and_next_flush_retries() {
        let ledger = MemoryLedger {
            failures_left: 1,
            ..Default::default()
        };
        let mut engine =
            VisitorEngine::start(ledger, EngineConfig::default(), at(1, 14, 0, 0)).unwrap();
        tick(&mut engine, at(1, 14, 0, 0), &[1, 2]);
        tick(&mut engine, at(1, 14, 1, 0), &[]);
        assert_eq!(engine.stats().failed_flushes, 1);
        assert!(engine.ledger().saves.is_empty());
        assert_eq!(engine.store().get_hour(day(1), 14), 2);

        tick(&mut engine, at(1, 14, 2, 0), &[]);
        assert_eq!(engine.ledger().last().unwrap().get_hour(day(1), 14), 2);
    }

    #[test]
    fn restart_mid_hour_resumes_recorded_count() {
        let mut initial = AggregationStore::new();
        initial.set_hour(day(1), 15, 4).unwrap();
        let ledger = MemoryLedger {
            initial,
            ..Default::default()
        };
        let mut engine =
            VisitorEngine::start(ledger, EngineConfig::default(), at(1, 15, 20, 0)).unwrap();
        tick(&mut engine, at(1, 15, 20, 0), &[9]);
        assert_eq!(engine.live_count(), 5);

        let stats = engine.shutdown();
        assert_eq!(engine.ledger().last().unwrap().get_hour(day(1), 15), 5);
        assert_eq!(stats.flushes, 1);
    }

    #[test]
    fn shutdown_outside_window_still_flushes_without_snapshot() {
        let mut engine = engine_at(at(1, 23, 0, 0));
        tick(&mut engine, at(1, 23, 0, 0), &[1]);
        engine.shutdown();
        let saved = engine.ledger().last().unwrap();
        assert_eq!(saved.day(day(1)).unwrap().total(), 0);
    }

    #[test]
    fn date_rollover_flushes_and_registers_new_day() {
        let mut engine = engine_at(at(1, 23, 59, 59));
        tick(&mut engine, at(1, 23, 59, 59), &[]);
        tick(&mut engine, at(2, 0, 0, 0), &[]);
        let saved = engine.ledger().last().unwrap();
        assert!(saved.day(day(1)).is_some());
        assert!(saved.day(day(2)).is_some());
    }

    #[test]
    fn completed_hours_equal_distinct_new_tracks() {
        let mut engine = engine_at(at(1, 16, 0, 0));
        let sightings: [(u32, &[TrackId]); 5] = [
            (0, &[1, 2]),
            (5, &[2, 3]),
            (20, &[1]),
            (40, &[4, 4]),
            (59, &[5]),
        ];
        for (minute, ids) in sightings {
            tick(&mut engine, at(1, 16, minute, 0), ids);
        }
        tick(&mut engine, at(1, 17, 0, 0), &[]);
        assert_eq!(engine.store().get_hour(day(1), 16), 5);
        assert_eq!(engine.store().get_hour(day(1), 17), 0);
    }
}
