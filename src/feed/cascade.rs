//! Haar cascade person detection with KCF tracking over a video source.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use opencv::{
    core::{self, Ptr, Rect, Size},
    imgproc, objdetect,
    prelude::*,
    tracking::{TrackerKCF, TrackerKCF_Params},
    videoio,
};
use tracing::debug;

use super::{BoundingBox, Detection, DetectionFeed, FeedError};
use crate::region::Region;

#[derive(Debug, Clone)]
pub struct CascadeConfig {
    pub cascade_dir: PathBuf,
    pub scale_factor: f64,
    pub min_neighbors: i32,
    pub min_size: i32,
    pub nms_iou: f32,
    pub max_missing: u32,
    pub min_aspect_ratio: f32,
    pub max_aspect_ratio: f32,
    /// Run the cascades every N frames; trackers fill the frames between.
    pub detection_interval: u64,
    /// Frames a track must persist before it is reported.
    pub confirmation_frames: u32,
}

/// A tracked person. IDs are never reused within one feed.
struct TrackedObject {
    tracker: Ptr<TrackerKCF>,
    rect: Rect,
    missing: u32,
    lifetime: u32,
}

struct KcfTracker {
    tracks: HashMap<u64, TrackedObject>,
    next_id: u64,
    max_missing: u32,
    iou_threshold: f32,
    confirmation_frames: u32,
}

impl KcfTracker {
    fn new(max_missing: u32, iou_threshold: f32, confirmation_frames: u32) -> Self {
        Self {
            tracks: HashMap::new(),
            next_id: 1,
            max_missing,
            iou_threshold,
            confirmation_frames,
        }
    }

    /// Confirmed tracks visible in the last frame.
    fn confirmed(&self) -> Vec<(u64, Rect)> {
        let mut visible: Vec<(u64, Rect)> = self
            .tracks
            .iter()
            .filter(|(_, t)| t.missing == 0 && t.lifetime >= self.confirmation_frames)
            .map(|(id, t)| (*id, t.rect))
            .collect();
        visible.sort_by_key(|(id, _)| *id);
        visible
    }

    fn update(&mut self, frame: &Mat, detections: &[Rect]) {
        for tracked in self.tracks.values_mut() {
            tracked.lifetime = tracked.lifetime.saturating_add(1);
        }

        // Predict visible tracks forward; missing ones keep their last box.
        let mut predicted: HashMap<u64, Option<Rect>> = HashMap::new();
        for (id, tracked) in self.tracks.iter_mut() {
            if tracked.missing > 0 {
                predicted.insert(*id, Some(tracked.rect));
                continue;
            }
            let mut next = tracked.rect;
            match tracked.tracker.update(frame, &mut next) {
                Ok(true) => predicted.insert(*id, Some(next)),
                _ => predicted.insert(*id, None),
            };
        }

        // Greedy IoU matching of predictions to detections.
        let mut pairs: Vec<(f32, u64, usize)> = Vec::new();
        for (id, rect) in &predicted {
            let Some(rect) = rect else { continue };
            for (det_idx, det) in detections.iter().enumerate() {
                let iou = rect_iou(*rect, *det);
                if iou > 0.0 {
                    pairs.push((iou, *id, det_idx));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut matched_tracks: HashSet<u64> = HashSet::new();
        let mut matched_detections: HashSet<usize> = HashSet::new();
        for (iou, id, det_idx) in pairs {
            if iou < self.iou_threshold
                || matched_tracks.contains(&id)
                || matched_detections.contains(&det_idx)
            {
                continue;
            }
            if let Some(tracked) = self.tracks.get_mut(&id) {
                tracked.rect = detections[det_idx];
                tracked.missing = 0;
            }
            matched_tracks.insert(id);
            matched_detections.insert(det_idx);
        }

        for (id, tracked) in self.tracks.iter_mut() {
            if matched_tracks.contains(id) {
                continue;
            }
            if let Some(Some(rect)) = predicted.get(id) {
                tracked.rect = *rect;
            }
            tracked.missing = tracked.missing.saturating_add(1);
        }

        for (det_idx, det) in detections.iter().enumerate() {
            if matched_detections.contains(&det_idx) {
                continue;
            }
            match create_kcf_tracker().and_then(|mut t| {
                t.init(frame, *det)?;
                Ok(t)
            }) {
                Ok(tracker) => {
                    self.tracks.insert(
                        self.next_id,
                        TrackedObject {
                            tracker,
                            rect: *det,
                            missing: 0,
                            lifetime: 1,
                        },
                    );
                    self.next_id += 1;
                }
                Err(err) => debug!("Could not start tracker: {err}"),
            }
        }

        let max_missing = self.max_missing;
        self.tracks.retain(|_, t| t.missing <= max_missing);
    }
}

fn create_kcf_tracker() -> Result<Ptr<TrackerKCF>> {
    let params = TrackerKCF_Params::default()?;
    TrackerKCF::create(params).context("Failed to create KCF tracker")
}

pub struct CascadeFeed {
    config: CascadeConfig,
    capture: videoio::VideoCapture,
    fullbody: objdetect::CascadeClassifier,
    upperbody: objdetect::CascadeClassifier,
    tracker: KcfTracker,
    region: Option<Rect>,
    frame_index: u64,
    frame: Mat,
    gray: Mat,
    gray_eq: Mat,
}

impl CascadeFeed {
    /// Loads both cascades and opens `source` (file path or stream URL).
    /// Any failure here is fatal for the process.
    pub fn open(source: &str, config: CascadeConfig, region: Option<Region>) -> Result<Self> {
        let fullbody = load_cascade(&config.cascade_dir.join("haarcascade_fullbody.xml"))?;
        let upperbody = load_cascade(&config.cascade_dir.join("haarcascade_upperbody.xml"))?;

        let mut capture = videoio::VideoCapture::from_file(source, videoio::CAP_ANY)
            .with_context(|| format!("Failed to open input source: {source}"))?;
        if !capture.is_opened()? {
            bail!("Failed to open input source: {source}");
        }
        let _ = capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);

        let tracker = KcfTracker::new(config.max_missing, config.nms_iou, config.confirmation_frames);
        Ok(Self {
            region: region.map(|r| Rect::new(r.left, r.top, r.width(), r.height())),
            config,
            capture,
            fullbody,
            upperbody,
            tracker,
            frame_index: 0,
            frame: Mat::default(),
            gray: Mat::default(),
            gray_eq: Mat::default(),
        })
    }

    fn detect(&mut self, frame: &Mat) -> opencv::Result<Vec<Rect>> {
        imgproc::cvt_color(
            frame,
            &mut self.gray,
            imgproc::COLOR_BGR2GRAY,
            0,
            core::AlgorithmHint::ALGO_HINT_DEFAULT,
        )?;
        imgproc::equalize_hist(&self.gray, &mut self.gray_eq)?;

        let min_size = Size::new(self.config.min_size, self.config.min_size);
        let mut rects = Vec::new();
        for cascade in [&mut self.fullbody, &mut self.upperbody] {
            let mut found = core::Vector::<Rect>::new();
            cascade.detect_multi_scale(
                &self.gray_eq,
                &mut found,
                self.config.scale_factor,
                self.config.min_neighbors,
                0,
                min_size,
                Size::default(),
            )?;
            rects.extend(found.to_vec());
        }
        let rects = nms_rects(&rects, self.config.nms_iou);
        Ok(filter_by_shape(
            &rects,
            self.config.min_aspect_ratio,
            self.config.max_aspect_ratio,
        ))
    }
}

impl DetectionFeed for CascadeFeed {
    fn next_batch(&mut self) -> Result<Option<Vec<Detection>>, FeedError> {
        let mut frame = std::mem::take(&mut self.frame);
        let read = self
            .capture
            .read(&mut frame)
            .map_err(|e| FeedError::Capture(e.to_string()))?;
        if !read || frame.empty() {
            return Ok(None);
        }
        self.frame_index += 1;

        let frame = match self.region {
            Some(roi) => {
                let mut cropped = Mat::default();
                Mat::roi(&frame, roi)
                    .and_then(|view| view.copy_to(&mut cropped))
                    .map_err(|e| FeedError::Capture(format!("region {roi:?} outside frame: {e}")))?;
                cropped
            }
            None => frame,
        };

        let detections = if self.frame_index % self.config.detection_interval.max(1) == 0 {
            self.detect(&frame)
                .map_err(|e| FeedError::Detector(e.to_string()))?
        } else {
            Vec::new()
        };
        self.tracker.update(&frame, &detections);

        let (dx, dy) = self.region.map_or((0, 0), |r| (r.x, r.y));
        let batch = self
            .tracker
            .confirmed()
            .into_iter()
            .map(|(id, rect)| Detection {
                track_id: id,
                bbox: Some(BoundingBox {
                    left: (rect.x + dx) as f32,
                    top: (rect.y + dy) as f32,
                    right: (rect.x + rect.width + dx) as f32,
                    bottom: (rect.y + rect.height + dy) as f32,
                }),
            })
            .collect();
        self.frame = frame;
        Ok(Some(batch))
    }
}

fn load_cascade(path: &Path) -> Result<objdetect::CascadeClassifier> {
    if !path.is_file() {
        bail!("Required cascade file missing: {}", path.display());
    }
    let name = path
        .to_str()
        .with_context(|| format!("Cascade path is invalid: {}", path.display()))?;
    objdetect::CascadeClassifier::new(name)
        .with_context(|| format!("Failed to load cascade {}", path.display()))
}

/// People are taller than wide.
fn filter_by_shape(rects: &[Rect], min_aspect_ratio: f32, max_aspect_ratio: f32) -> Vec<Rect> {
    rects
        .iter()
        .filter(|rect| {
            let aspect_ratio = rect.height as f32 / rect.width.max(1) as f32;
            (min_aspect_ratio..=max_aspect_ratio).contains(&aspect_ratio)
        })
        .copied()
        .collect()
}

fn rect_area(rect: Rect) -> f32 {
    (rect.width.max(0) * rect.height.max(0)) as f32
}

fn rect_iou(a: Rect, b: Rect) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = ((x2 - x1).max(0) * (y2 - y1).max(0)) as f32;
    let union = rect_area(a) + rect_area(b) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Keeps the largest of every group of overlapping boxes.
fn nms_rects(rects: &[Rect], iou_threshold: f32) -> Vec<Rect> {
    let mut ordered: Vec<Rect> = rects.to_vec();
    ordered.sort_by(|a, b| rect_area(*b).partial_cmp(&rect_area(*a)).unwrap_or(Ordering::Equal));

    let mut keep: Vec<Rect> = Vec::new();
    for rect in ordered {
        if keep.iter().all(|kept| rect_iou(rect, *kept) <= iou_threshold) {
            keep.push(rect);
        }
    }
    keep
}
