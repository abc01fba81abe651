//! Newline-delimited JSON feed written by an external tracker.
//!
//! Each line is one processed frame:
//!
//! ```text
//! {"tracks":[{"id":5,"bbox":[264.0,342.0,310.5,480.0]},{"id":7}]}
//! ```
//!
//! A blank line is a frame without tracked entities. End of input exhausts
//! the feed.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use serde::Deserialize;

use super::{BoundingBox, Detection, DetectionFeed, FeedError};
use crate::region::Region;
use crate::registry::TrackId;

#[derive(Debug, Deserialize)]
struct FrameRecord {
    #[serde(default)]
    tracks: Vec<TrackRecord>,
}

#[derive(Debug, Deserialize)]
struct TrackRecord {
    id: TrackId,
    #[serde(default)]
    bbox: Option<BoundingBox>,
}

pub struct JsonLinesFeed<R> {
    reader: R,
    region: Option<Region>,
    line: u64,
    buf: String,
}

impl JsonLinesFeed<BufReader<Box<dyn io::Read + Send>>> {
    /// Opens `path`, or standard input when `path` is `-`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let source: Box<dyn io::Read + Send> = if path == Path::new("-") {
            Box::new(io::stdin())
        } else {
            Box::new(File::open(path)?)
        };
        Ok(Self::new(BufReader::new(source)))
    }
}

impl<R: BufRead> JsonLinesFeed<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            region: None,
            line: 0,
            buf: String::new(),
        }
    }

    /// Keeps only detections whose box centre lies inside `region`.
    pub fn with_region(mut self, region: Option<Region>) -> Self {
        self.region = region;
        self
    }
}

impl<R: BufRead> DetectionFeed for JsonLinesFeed<R> {
    fn next_batch(&mut self) -> Result<Option<Vec<Detection>>, FeedError> {
        self.buf.clear();
        if self.reader.read_line(&mut self.buf)? == 0 {
            return Ok(None);
        }
        self.line += 1;

        let text = self.buf.trim();
        if text.is_empty() {
            return Ok(Some(Vec::new()));
        }
        let record: FrameRecord = serde_json::from_str(text).map_err(|source| FeedError::Record {
            line: self.line,
            source,
        })?;

        let detections = record
            .tracks
            .into_iter()
            .map(|t| Detection {
                track_id: t.id,
                bbox: t.bbox,
            })
            .filter(|d| self.region.as_ref().is_none_or(|r| d.within(r)))
            .collect();
        Ok(Some(detections))
    }
}
