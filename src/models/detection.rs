use serde::{Deserialize, Serialize};
use std::fmt;

/// Confidence floor before any detection has been seen.
pub const NO_DETECTION_FLOOR: f64 = -1.0;

/// Decimal places kept for confidence scores.
pub const CONFIDENCE_PLACES: i32 = 4;

/// Decimal places kept for box coordinates, sizes and centers.
pub const GEOMETRY_PLACES: i32 = 2;

/// A single detection from one frame, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub confidence: f64,
    /// `[x1, y1, x2, y2]`
    pub box_xyxy: [f64; 4],
    pub width: f64,
    pub height: f64,
    /// `[x, y]`
    pub center: [f64; 2],
}

impl Detection {
    /// Build a detection from corner coordinates, deriving size and center.
    pub fn from_xyxy(confidence: f64, box_xyxy: [f64; 4]) -> Self {
        let [x1, y1, x2, y2] = box_xyxy;
        let width = (x2 - x1).abs();
        let height = (y2 - y1).abs();
        Self {
            confidence,
            box_xyxy,
            width,
            height,
            center: [x1.min(x2) + width / 2.0, y1.min(y2) + height / 2.0],
        }
    }
}

/// The strongest detection of a job together with the frame it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestHazard {
    pub detection: Detection,
    pub frame_index: usize,
}

impl BestHazard {
    pub fn record(&self) -> HazardRecord {
        HazardRecord::from(&self.detection)
    }
}

/// Running maximum over every detection of every frame of one job.
///
/// Only a strictly greater confidence replaces the current best, so ties
/// keep the first detection seen.
#[derive(Debug, Default)]
pub struct HazardTracker {
    best: Option<BestHazard>,
}

impl HazardTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame's detections. Returns true when this frame now holds the best.
    pub fn observe(&mut self, frame_index: usize, detections: &[Detection]) -> bool {
        let mut improved = false;
        for detection in detections {
            if detection.confidence > self.max_confidence() {
                self.best = Some(BestHazard {
                    detection: *detection,
                    frame_index,
                });
                improved = true;
            }
        }
        improved
    }

    pub fn max_confidence(&self) -> f64 {
        self.best
            .map(|b| b.detection.confidence)
            .unwrap_or(NO_DETECTION_FLOOR)
    }

    pub fn into_best(self) -> Option<BestHazard> {
        self.best
    }
}

/// Round half away from zero to `places` decimals.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// `value` with exactly `places` decimals, as NUMERIC columns print it.
pub fn fixed(value: f64, places: i32) -> String {
    format!("{:.*}", places.max(0) as usize, value)
}

/// Detection fields as persisted on the job row, already rounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HazardRecord {
    pub confidence: f64,
    pub location_xyxy: [f64; 4],
    pub width: f64,
    pub height: f64,
    pub center: [f64; 2],
}

impl From<&Detection> for HazardRecord {
    fn from(d: &Detection) -> Self {
        let geo = |v: f64| round_to(v, GEOMETRY_PLACES);
        Self {
            confidence: round_to(d.confidence, CONFIDENCE_PLACES),
            location_xyxy: d.box_xyxy.map(geo),
            width: geo(d.width),
            height: geo(d.height),
            center: d.center.map(geo),
        }
    }
}

impl HazardRecord {
    /// Confidence as text with exactly four decimals.
    pub fn confidence_text(&self) -> String {
        fixed(self.confidence, CONFIDENCE_PLACES)
    }
}

impl fmt::Display for HazardRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x1, y1, x2, y2] = self.location_xyxy;
        let [cx, cy] = self.center;
        write!(
            f,
            "confidence={} box=[{x1:.2}, {y1:.2}, {x2:.2}, {y2:.2}] size={:.2}x{:.2} center=[{cx:.2}, {cy:.2}]",
            self.confidence_text(),
            self.width,
            self.height,
        )
    }
}
