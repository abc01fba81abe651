//! Sources of tracked entities, one batch per processed frame.

#[cfg(feature = "opencv")]
pub mod cascade;
pub mod jsonl;
pub mod threaded;

use std::io;

use serde::Deserialize;
use thiserror::Error;

use crate::region::Region;
use crate::registry::TrackId;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to read detection feed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed detection record on line {line}: {source}")]
    Record {
        line: u64,
        #[source]
        source: serde_json::Error,
    },
    #[error("frame capture failed: {0}")]
    Capture(String),
    #[error("detector failed: {0}")]
    Detector(String),
}

/// Axis aligned box `[left, top, right, bottom]` in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(from = "[f32; 4]")]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl From<[f32; 4]> for BoundingBox {
    fn from([left, top, right, bottom]: [f32; 4]) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }
}

impl BoundingBox {
    pub fn center(&self) -> (f32, f32) {
        ((self.left + self.right) / 2.0, (self.top + self.bottom) / 2.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub track_id: TrackId,
    pub bbox: Option<BoundingBox>,
}

impl Detection {
    /// Detections without a box cannot be placed and are always kept.
    pub fn within(&self, region: &Region) -> bool {
        self.bbox.is_none_or(|bbox| {
            let (x, y) = bbox.center();
            region.contains(x, y)
        })
    }
}

/// Source of per-frame detections.
///
/// Implementations may block. Wrap one that can stall indefinitely, such as
/// a pipe from an idle tracker, in [`threaded::ThreadedFeed`] so the caller
/// keeps control of its own loop.
pub trait DetectionFeed {
    /// Tracked entities of the next processed frame. `Ok(None)` means the
    /// source is exhausted and no further frames will arrive.
    fn next_batch(&mut self) -> Result<Option<Vec<Detection>>, FeedError>;
}

impl<F: DetectionFeed + ?Sized> DetectionFeed for Box<F> {
    fn next_batch(&mut self) -> Result<Option<Vec<Detection>>, FeedError> {
        (**self).next_batch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detections_are_filtered_by_box_center() {
        let region = Region::from_corners(100, 100, 200, 200).unwrap();
        let inside = Detection {
            track_id: 1,
            bbox: Some([90.0, 90.0, 150.0, 150.0].into()),
        };
        let outside = Detection {
            track_id: 2,
            bbox: Some([0.0, 0.0, 50.0, 50.0].into()),
        };
        let unplaced = Detection {
            track_id: 3,
            bbox: None,
        };
        assert!(inside.within(&region));
        assert!(!outside.within(&region));
        assert!(unplaced.within(&region));
    }
}
