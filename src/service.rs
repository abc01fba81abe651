//! The polling loop tying clock, detection feed and engine together.
//!
//! Every steady-state failure is contained within one tick: it is logged, the
//! loop backs off and carries on. Only a shutdown request or an exhausted
//! feed ends the loop, and both end it through the terminal flush.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::controller::Transition;
use crate::engine::{SessionStats, VisitorEngine};
use crate::feed::{DetectionFeed, FeedError};
use crate::journal::{self, HourClosedLog, JsonLogger, NewVisitorLog, SessionEndLog};
use crate::ledger::Ledger;
use crate::pump::Observation;
use crate::registry::TrackId;

const PAUSE_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    /// Pause after each processed frame.
    pub tick_interval: Duration,
    /// Pause between clock checks outside the operating window.
    pub idle_backoff: Duration,
    /// Pause after a failed tick.
    pub error_backoff: Duration,
    /// How often a status line is logged.
    pub status_interval: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            idle_backoff: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            status_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Tracked,
    Idle,
    Exhausted,
}

pub struct Runner<C, F, L> {
    clock: C,
    feed: F,
    engine: VisitorEngine<L>,
    config: LoopConfig,
    shutdown: Arc<AtomicBool>,
    journal: Option<JsonLogger>,
    last_status: Option<NaiveDateTime>,
}

impl<C: Clock, F: DetectionFeed, L: Ledger> Runner<C, F, L> {
    pub fn new(
        clock: C,
        feed: F,
        engine: VisitorEngine<L>,
        config: LoopConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            clock,
            feed,
            engine,
            config,
            shutdown,
            journal: None,
            last_status: None,
        }
    }

    pub fn with_journal(mut self, journal: Option<JsonLogger>) -> Self {
        self.journal = journal;
        self
    }

    pub fn engine(&self) -> &VisitorEngine<L> {
        &self.engine
    }

    /// Polls until shutdown is requested or the feed runs dry, then performs
    /// the terminal snapshot and flush.
    pub fn run(&mut self) -> SessionStats {
        loop {
            if self.shutdown_requested() {
                info!("Shutdown requested - saving data before exit");
                break;
            }
            match self.tick() {
                Ok(Tick::Tracked) => self.pause(self.config.tick_interval),
                Ok(Tick::Idle) => self.pause(self.config.idle_backoff),
                Ok(Tick::Exhausted) => {
                    info!("Detection feed exhausted - saving data before exit");
                    break;
                }
                Err(err) => {
                    warn!("Error occurred: {err}. Continuing to run...");
                    self.pause(self.config.error_backoff);
                }
            }
        }

        let stats = self.engine.shutdown();
        self.record(&SessionEndLog {
            event: "session_end",
            timestamp: journal::timestamp_now(),
            stats,
        });
        self.flush_journal();
        info!(
            new_visitor_events = stats.new_visitor_events,
            hours_closed = stats.hours_closed,
            flushes = stats.flushes,
            failed_flushes = stats.failed_flushes,
            "Final data saved"
        );
        stats
    }

    fn tick(&mut self) -> Result<Tick, FeedError> {
        let now = self.clock.now();
        let transitions = self.engine.advance(now);
        self.journal_transitions(&transitions);

        if !self.engine.is_tracking() {
            self.report_status(now);
            return Ok(Tick::Idle);
        }

        let outcome = match self.feed.next_batch() {
            Ok(Some(detections)) => {
                let batch: Vec<Observation> = detections
                    .iter()
                    .map(|d| Observation::new(d.track_id, now))
                    .collect();
                let new_visitors = self.engine.ingest(&batch);
                self.journal_new_visitors(&new_visitors, now);
                Ok(Tick::Tracked)
            }
            Ok(None) => Ok(Tick::Exhausted),
            Err(err) => Err(err),
        };
        // snapshots stay valid even when this frame failed
        self.engine.checkpoint(now);
        self.report_status(now);
        outcome
    }

    fn report_status(&mut self, now: NaiveDateTime) {
        let due = self.last_status.is_none_or(|last| {
            now.signed_duration_since(last).to_std().unwrap_or_default() >= self.config.status_interval
        });
        if !due {
            return;
        }
        self.last_status = Some(now);
        match self.engine.open_cell() {
            Some(cell) => info!(visitors = self.engine.live_count(), "Tracking {cell}"),
            None => info!(
                "Waiting for operating hours... Current time: {}",
                now.format("%Y-%m-%d %H:%M:%S")
            ),
        }
    }

    fn journal_transitions(&mut self, transitions: &[Transition]) {
        if self.journal.is_none() {
            return;
        }
        let mut closed_any = false;
        for transition in transitions {
            let closed = match *transition {
                Transition::HourRolled { closed, .. } => closed,
                Transition::WindowExited { closed } => closed,
                _ => None,
            };
            if let Some(cell) = closed {
                let count = self.engine.store().get_hour(cell.date, cell.hour);
                self.record(&HourClosedLog {
                    event: "hour_closed",
                    timestamp: journal::timestamp_now(),
                    date: cell.date.to_string(),
                    hour: cell.hour,
                    count,
                });
                closed_any = true;
            }
        }
        // closed hours reach disk as often as the ledger does
        if closed_any {
            self.flush_journal();
        }
    }

    fn journal_new_visitors(&mut self, new_visitors: &[TrackId], now: NaiveDateTime) {
        let Some(cell) = self.engine.open_cell() else {
            return;
        };
        let live_count = self.engine.live_count();
        for &track_id in new_visitors {
            self.record(&NewVisitorLog {
                event: "new_visitor",
                timestamp: now.format("%Y-%m-%dT%H:%M:%S").to_string(),
                track_id,
                date: cell.date.to_string(),
                hour: cell.hour,
                live_count,
            });
        }
    }

    fn record<T: serde::Serialize>(&mut self, event: &T) {
        if let Some(journal) = self.journal.as_mut() {
            if let Err(err) = journal.write_event(event) {
                warn!("Failed to write event journal: {err}");
            }
        }
    }

    fn flush_journal(&mut self) {
        if let Some(journal) = self.journal.as_mut() {
            if let Err(err) = journal.flush() {
                warn!("Failed to flush event journal: {err}");
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`, waking early on shutdown.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.shutdown_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(PAUSE_SLICE));
        }
    }
}
