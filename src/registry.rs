use std::collections::HashMap;

use chrono::{NaiveDateTime, TimeDelta};
use clap::ValueEnum;

pub type TrackId = u64;

/// What to do with a track that is still registered but whose last sighting
/// is older than the cooldown.
///
/// Tracker IDs are not stable re-identifications: the same person leaving and
/// coming back can keep an ID, and a different person can inherit one. The
/// default counts such a reappearance as a new visitor event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum RecountPolicy {
    /// A track unseen for at least the cooldown is new again.
    #[default]
    AfterCooldown,
    /// A registered track is never new again until the next hourly reset.
    OncePerHour,
}

/// `track id -> last seen` registry deciding whether a sighting is a new
/// visitor.
#[derive(Debug)]
pub struct DedupRegistry {
    cooldown: TimeDelta,
    policy: RecountPolicy,
    last_seen: HashMap<TrackId, NaiveDateTime>,
}

impl DedupRegistry {
    pub fn new(cooldown: TimeDelta, policy: RecountPolicy) -> Self {
        Self {
            cooldown,
            policy,
            last_seen: HashMap::new(),
        }
    }

    /// Records the sighting and reports whether it counts as a new visitor.
    ///
    /// Every call refreshes the last-seen instant of `track_id`.
    pub fn is_new_visitor(&mut self, track_id: TrackId, now: NaiveDateTime) -> bool {
        let previous = self.last_seen.insert(track_id, now);
        match previous {
            None => true,
            Some(_) if self.policy == RecountPolicy::OncePerHour => false,
            Some(last) => now.signed_duration_since(last) >= self.cooldown,
        }
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}
