// THEORY:
// The `DetectionAdapter` is the boundary shim between the external perception oracle and
// the engine. Whatever the detector and pose estimator produce for one frame, the adapter
// turns it into the canonical `Observation` list for exactly that frame of that camera.
//
// Key architectural principles:
// 1.  **All or Nothing**: A frame with a single malformed detection (missing geometry,
//     confidence outside [0, 1]) is rejected whole with `MalformedDetection`. The caller
//     drops and counts it; partial frames never reach the tracker.
// 2.  **Filtering is not an Error**: Detections of classes the camera does not care about,
//     or below the camera's confidence floor, are silently skipped.
// 3.  **Canonical Order**: Observations leave sorted by confidence, highest first. The
//     tracker's tie-break rules depend on that order.
// 4.  **Pure**: `normalize` has no side effects; counting is the pipeline's job.

use serde::{Deserialize, Serialize};

use crate::config::CameraConfig;
use crate::core_modules::geometry::BoundingBox;
use crate::core_modules::observation::{
    CameraId, EntityClass, Keypoint, Millis, Observation, PoseSignal,
};
use crate::error::{Result, VisionError};

/// COCO class ids the engine maps onto its own classes.
const COCO_PERSON: u32 = 0;
const COCO_VEHICLES: [u32; 4] = [2, 3, 5, 7]; // car, motorcycle, bus, truck

/// One frame of perception output as delivered by the upstream collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    pub camera_id: CameraId,
    pub timestamp_ms: Millis,
    #[serde(default)]
    pub detections: Vec<RawDetection>,
}

/// One raw detection. Either `class_id` (COCO) or `label` identifies the class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    /// `[x1, y1, x2, y2]`.
    pub bbox: Option<[f64; 4]>,
    #[serde(default)]
    pub class_id: Option<u32>,
    #[serde(default)]
    pub label: Option<String>,
    pub confidence: f64,
    /// COCO-17 keypoints as `[x, y, confidence]`.
    #[serde(default)]
    pub keypoints: Option<Vec<[f64; 3]>>,
}

impl RawDetection {
    fn entity_class(&self) -> Option<EntityClass> {
        if let Some(id) = self.class_id {
            if id == COCO_PERSON {
                return Some(EntityClass::Person);
            }
            if COCO_VEHICLES.contains(&id) {
                return Some(EntityClass::Vehicle);
            }
            return None;
        }
        match self.label.as_deref()?.to_ascii_lowercase().as_str() {
            "person" | "staff" | "customer" => Some(EntityClass::Person),
            "vehicle" | "car" | "motorcycle" | "bus" | "truck" => Some(EntityClass::Vehicle),
            _ => None,
        }
    }

    fn pose(&self) -> Option<PoseSignal> {
        let raw = self.keypoints.as_ref()?;
        if raw.iter().flatten().any(|v| !v.is_finite()) {
            return None;
        }
        Some(PoseSignal {
            keypoints: raw
                .iter()
                .map(|[x, y, confidence]| Keypoint {
                    x: *x,
                    y: *y,
                    confidence: *confidence,
                })
                .collect(),
        })
    }
}

/// Normalizes raw frames for a single camera.
#[derive(Debug, Clone)]
pub struct DetectionAdapter {
    camera: CameraId,
    tracked_class: EntityClass,
    min_confidence: f64,
}

impl DetectionAdapter {
    pub fn new(camera: &CameraConfig) -> Self {
        Self {
            camera: camera.id.clone(),
            tracked_class: camera.role.tracked_class(),
            min_confidence: camera.min_confidence,
        }
    }

    pub fn camera(&self) -> &CameraId {
        &self.camera
    }

    /// Turns one raw frame into observations sorted by confidence, highest first.
    pub fn normalize(&self, raw: &RawFrame) -> Result<Vec<Observation>> {
        if raw.camera_id != self.camera {
            return Err(self.malformed(format!(
                "frame addressed to camera '{}'",
                raw.camera_id
            )));
        }

        let mut observations = Vec::with_capacity(raw.detections.len());
        for (index, detection) in raw.detections.iter().enumerate() {
            if !detection.confidence.is_finite() || !(0.0..=1.0).contains(&detection.confidence) {
                return Err(self.malformed(format!(
                    "detection {index} has confidence {} outside [0, 1]",
                    detection.confidence
                )));
            }
            let [x1, y1, x2, y2] = detection
                .bbox
                .ok_or_else(|| self.malformed(format!("detection {index} has no geometry")))?;
            let bbox = BoundingBox::new(x1, y1, x2, y2);
            if !bbox.is_valid() {
                return Err(self.malformed(format!("detection {index} has invalid geometry")));
            }

            let Some(class) = detection.entity_class() else {
                continue;
            };
            if class != self.tracked_class || detection.confidence < self.min_confidence {
                continue;
            }

            observations.push(Observation {
                camera: self.camera.clone(),
                timestamp_ms: raw.timestamp_ms,
                bbox,
                class,
                pose: detection.pose(),
                confidence: detection.confidence,
            });
        }

        // Stable sort keeps detector order among equal confidences.
        observations.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(observations)
    }

    fn malformed(&self, reason: String) -> VisionError {
        VisionError::MalformedDetection {
            camera: self.camera.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraRole, ZoneConfig, ZoneGeometry};
    use crate::core_modules::geometry::{FieldOfView, Point};
    use crate::core_modules::observation::ZoneId;
    use crate::core_modules::zone::ZoneRole;

    fn gate_camera() -> CameraConfig {
        CameraConfig {
            id: CameraId::from("gate"),
            role: CameraRole::Gate,
            field_of_view: FieldOfView {
                width: 640.0,
                height: 480.0,
                edge_margin: 20.0,
            },
            zones: vec![ZoneConfig {
                id: ZoneId::from("gate_line"),
                role: ZoneRole::GateLine,
                geometry: ZoneGeometry::Line {
                    from: Point::new(320.0, 0.0),
                    to: Point::new(320.0, 480.0),
                },
                min_dwell_secs: 0.0,
            }],
            min_confidence: 0.4,
        }
    }

    fn detection(class_id: u32, confidence: f64) -> RawDetection {
        RawDetection {
            bbox: Some([10.0, 10.0, 50.0, 120.0]),
            class_id: Some(class_id),
            label: None,
            confidence,
            keypoints: None,
        }
    }

    fn frame(detections: Vec<RawDetection>) -> RawFrame {
        RawFrame {
            camera_id: CameraId::from("gate"),
            timestamp_ms: 1_000,
            detections,
        }
    }

    #[test]
    fn sorts_by_confidence_and_filters_classes() {
        let adapter = DetectionAdapter::new(&gate_camera());
        let observations = adapter
            .normalize(&frame(vec![
                detection(0, 0.6),
                detection(2, 0.99), // a car on the gate camera
                detection(0, 0.9),
                detection(0, 0.2), // below the camera floor
                detection(56, 0.95), // a chair
            ]))
            .expect("well-formed frame");
        let confidences: Vec<f64> = observations.iter().map(|o| o.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.6]);
        assert!(observations.iter().all(|o| o.class == EntityClass::Person));
    }

    #[test]
    fn confidence_out_of_range_rejects_the_frame() {
        let adapter = DetectionAdapter::new(&gate_camera());
        let err = adapter
            .normalize(&frame(vec![detection(0, 0.9), detection(0, 1.2)]))
            .unwrap_err();
        assert!(matches!(err, VisionError::MalformedDetection { .. }));
    }

    #[test]
    fn missing_geometry_rejects_the_frame() {
        let adapter = DetectionAdapter::new(&gate_camera());
        let mut bad = detection(0, 0.9);
        bad.bbox = None;
        assert!(adapter.normalize(&frame(vec![bad])).is_err());
    }

    #[test]
    fn labels_and_keypoints_are_understood() {
        let adapter = DetectionAdapter::new(&gate_camera());
        let raw = RawDetection {
            bbox: Some([0.0, 0.0, 10.0, 10.0]),
            class_id: None,
            label: Some("Person".into()),
            confidence: 0.8,
            keypoints: Some(vec![[1.0, 2.0, 0.9]; 17]),
        };
        let observations = adapter.normalize(&frame(vec![raw])).expect("well-formed frame");
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].pose.as_ref().map(|p| p.keypoints.len()), Some(17));
    }

    #[test]
    fn deserializes_the_wire_shape() {
        let json = r#"{"camera_id":"gate","timestamp_ms":40,"detections":[
            {"bbox":[1,2,3,4],"class_id":0,"confidence":0.7}
        ]}"#;
        let raw: RawFrame = serde_json::from_str(json).expect("valid record");
        assert_eq!(raw.detections[0].bbox, Some([1.0, 2.0, 3.0, 4.0]));
        assert!(raw.detections[0].keypoints.is_none());
    }
}
