use std::collections::HashSet;

use chrono::NaiveDateTime;

use crate::registry::{DedupRegistry, TrackId};

/// One tracked entity seen in one processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub track_id: TrackId,
    pub observed_at: NaiveDateTime,
}

impl Observation {
    pub fn new(track_id: TrackId, observed_at: NaiveDateTime) -> Self {
        Self {
            track_id,
            observed_at,
        }
    }
}

/// Visitors of the open hour cell.
///
/// The dedup registry and the live visitor set only ever reset together, so
/// both live behind this type.
#[derive(Debug)]
pub struct LiveVisitors {
    registry: DedupRegistry,
    visitors: HashSet<TrackId>,
}

impl LiveVisitors {
    pub fn new(registry: DedupRegistry) -> Self {
        Self {
            registry,
            visitors: HashSet::new(),
        }
    }

    /// Feeds one tick's observations through the registry and returns the
    /// track IDs that produced a new-visitor event, in arrival order.
    pub fn pump(&mut self, batch: &[Observation]) -> Vec<TrackId> {
        let mut new_visitors = Vec::new();
        for obs in batch {
            if self.registry.is_new_visitor(obs.track_id, obs.observed_at) {
                self.visitors.insert(obs.track_id);
                new_visitors.push(obs.track_id);
            }
        }
        new_visitors
    }

    pub fn reset(&mut self) {
        self.registry.clear();
        self.visitors.clear();
    }

    /// Distinct visitors counted since the last reset.
    pub fn count(&self) -> u32 {
        u32::try_from(self.visitors.len()).unwrap_or(u32::MAX)
    }

    pub fn registry(&self) -> &DedupRegistry {
        &self.registry
    }
}
