// THEORY:
// An `Observation` is one detected entity in one frame of one camera: the output of the
// detection adapter and the only input the tracker understands. It is a "dumb" container
// with no memory and no identity; the tracker gives it a persistent id, and it is
// discarded after the frame.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core_modules::geometry::{BoundingBox, Point};

/// Milliseconds on the engine timeline.
pub type Millis = u64;

/// COCO keypoint indices of the two wrists.
const LEFT_WRIST: usize = 9;
const RIGHT_WRIST: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub String);

impl From<&str> for CameraId {
    fn from(value: &str) -> Self {
        CameraId(value.to_string())
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(pub String);

impl From<&str> for ZoneId {
    fn from(value: &str) -> Self {
        ZoneId(value.to_string())
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two kinds of entity the restaurant analytics care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityClass {
    Person,
    Vehicle,
}

/// A single pose keypoint in scene units, with the estimator's confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f64,
    pub y: f64,
    pub confidence: f64,
}

/// Pose keypoints for one person, in COCO-17 order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseSignal {
    pub keypoints: Vec<Keypoint>,
}

impl PoseSignal {
    /// Wrist positions whose confidence clears `min_confidence`.
    pub fn wrists(&self, min_confidence: f64) -> Vec<Point> {
        [LEFT_WRIST, RIGHT_WRIST]
            .iter()
            .filter_map(|&idx| self.keypoints.get(idx))
            .filter(|kp| kp.confidence >= min_confidence)
            .map(|kp| Point::new(kp.x, kp.y))
            .collect()
    }
}

/// One detected entity in one frame of one camera.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// The camera that produced the frame.
    pub camera: CameraId,
    /// The frame timestamp on the camera's monotonic clock.
    pub timestamp_ms: Millis,
    /// The detector's box around the entity.
    pub bbox: BoundingBox,
    pub class: EntityClass,
    /// Keypoints, when the pose estimator ran on this entity.
    pub pose: Option<PoseSignal>,
    /// Detector confidence in [0, 1].
    pub confidence: f64,
}

impl Observation {
    /// The point used for data association.
    pub fn position(&self) -> Point {
        self.bbox.center()
    }

    /// The point used for zone membership.
    pub fn footprint(&self) -> Point {
        self.bbox.footprint()
    }
}
