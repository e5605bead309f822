// THEORY:
// The engine is configured once, at startup, from a single JSON document: the cameras
// and their zones, and the tunable parameters of every layer. Each section has defaults
// so a deployment only spells out what it changes.
//
// Key architectural principles:
// 1.  **Static**: Zones and cameras are immutable for the life of the engine. There is no
//     hot reload; a new layout means a new engine.
// 2.  **Fail Early**: `validate` is the only place a configuration problem is fatal. A
//     camera whose role needs a zone it does not have is rejected before any frame is
//     processed, instead of silently producing empty KPIs.
// 3.  **Per-Layer Sections**: Each layer receives only its own section (`tracker`, `bus`,
//     `aggregator`, ...), keeping the layers decoupled from one another.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core_modules::geometry::{FieldOfView, LineSegment, Point, Polygon};
use crate::core_modules::observation::{CameraId, EntityClass, ZoneId};
use crate::core_modules::zone::ZoneRole;
use crate::error::{Result, VisionError};

/// What a camera looks at. Decides which entity classes are kept and which zones
/// must exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraRole {
    /// Vehicle detection over the parking slots.
    Parking,
    /// Person tracking across the entrance line.
    Gate,
    /// Queue length and wait time at the counter.
    Queue,
    /// Staff attendance and hand-wash compliance.
    Kitchen,
}

impl CameraRole {
    pub fn tracked_class(&self) -> EntityClass {
        match self {
            CameraRole::Parking => EntityClass::Vehicle,
            _ => EntityClass::Person,
        }
    }

    /// The zone role this camera cannot operate without.
    fn required_zone(&self) -> ZoneRole {
        match self {
            CameraRole::Parking => ZoneRole::ParkingSlot,
            CameraRole::Gate => ZoneRole::GateLine,
            CameraRole::Queue => ZoneRole::QueueCorridor,
            CameraRole::Kitchen => ZoneRole::WorkArea,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ZoneGeometry {
    Polygon { points: Vec<Point> },
    Line { from: Point, to: Point },
}

impl ZoneGeometry {
    pub fn as_polygon(&self) -> Option<Polygon> {
        match self {
            ZoneGeometry::Polygon { points } => Some(Polygon::new(points.clone())),
            ZoneGeometry::Line { .. } => None,
        }
    }

    pub fn as_line(&self) -> Option<LineSegment> {
        match self {
            ZoneGeometry::Line { from, to } => Some(LineSegment::new(*from, *to)),
            ZoneGeometry::Polygon { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub id: ZoneId,
    pub role: ZoneRole,
    pub geometry: ZoneGeometry,
    /// Seconds inside the zone before a DWELL_START is emitted. Filters pass-throughs.
    #[serde(default)]
    pub min_dwell_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: CameraId,
    pub role: CameraRole,
    pub field_of_view: FieldOfView,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
    /// Detections below this confidence are ignored by the adapter.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

fn default_min_confidence() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Maximum association cost (distance plus penalties) for a match.
    pub max_match_distance: f64,
    /// Added to the cost when the observation's class differs from the tracklet's.
    pub class_mismatch_penalty: f64,
    /// Consecutive matches before a TENTATIVE tracklet becomes ACTIVE.
    pub promote_after_hits: u32,
    /// Consecutive misses before an ACTIVE tracklet becomes LOST.
    pub lost_after_misses: u32,
    /// Seconds without a match before a tracklet is CLOSED.
    pub close_after_secs: f64,
    /// Largest assignment problem solved optimally in one frame. Larger frames use greedy
    /// matching.
    pub max_assignment_size: usize,
    /// Cap on how far ahead the constant-velocity prediction extrapolates.
    pub max_prediction_secs: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_match_distance: 80.0,
            class_mismatch_penalty: 1000.0,
            promote_after_hits: 3,
            lost_after_misses: 5,
            close_after_secs: 30.0,
            max_assignment_size: 256,
            max_prediction_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// How long events wait in the reorder buffer for slower cameras.
    pub reorder_window_ms: u64,
    /// Identical events closer together than this are collapsed into one.
    pub dedup_epsilon_ms: u64,
    /// How often the engine drains the bus into the aggregator.
    pub drain_interval_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            reorder_window_ms: 300,
            dedup_epsilon_ms: 50,
            drain_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Window granularity.
    pub window_secs: u64,
    /// How long past its end a window stays open for stragglers.
    pub close_grace_ms: u64,
    /// Wall-clock time of engine timestamp zero, used for hour-of-day histograms.
    pub epoch_unix_ms: i64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window_secs: 3600,
            close_grace_ms: 1000,
            epoch_unix_ms: 0,
        }
    }
}

impl AggregatorConfig {
    /// Saturates; `EngineConfig::validate` rejects windows that would.
    pub fn window_ms(&self) -> u64 {
        self.window_secs.saturating_mul(1000)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HygieneConfig {
    /// Minimum continuous time at the sink for a hand-wash to count.
    pub min_wash_secs: f64,
    /// Minimum wrist keypoint confidence for the pose signal to qualify.
    pub min_keypoint_confidence: f64,
}

impl Default for HygieneConfig {
    fn default() -> Self {
        Self {
            min_wash_secs: 20.0,
            min_keypoint_confidence: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub max_queue_length: usize,
    pub min_staff_count: usize,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_queue_length: 10,
            min_staff_count: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// A camera silent for this long is reported as starved and its tracklets are aged.
    pub starvation_timeout_ms: u64,
    /// Frames buffered per camera before `ingest` applies backpressure.
    pub camera_queue_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            starvation_timeout_ms: 5000,
            camera_queue_depth: 64,
        }
    }
}

/// The full engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub hygiene: HygieneConfig,
    #[serde(default)]
    pub alerts: AlertThresholds,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn camera(&self, id: &CameraId) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| &c.id == id)
    }

    /// Checks every rule a running engine relies on. Any failure is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(VisionError::Config("no cameras configured".into()));
        }
        if self.aggregator.window_secs == 0 {
            return Err(VisionError::Config("aggregator.window_secs must be positive".into()));
        }
        let window_end = self
            .aggregator
            .window_secs
            .checked_mul(1000)
            .and_then(|ms| ms.checked_add(self.aggregator.close_grace_ms));
        if window_end.is_none() {
            return Err(VisionError::Config(format!(
                "aggregator.window_secs {} overflows millisecond timestamps",
                self.aggregator.window_secs
            )));
        }
        if self.tracker.max_match_distance <= 0.0 || self.tracker.close_after_secs <= 0.0 {
            return Err(VisionError::Config(
                "tracker distance and close timeout must be positive".into(),
            ));
        }
        if self.tracker.lost_after_misses == 0 {
            return Err(VisionError::Config("tracker.lost_after_misses must be at least 1".into()));
        }

        let mut camera_ids = HashSet::new();
        for camera in &self.cameras {
            if !camera_ids.insert(&camera.id) {
                return Err(VisionError::Config(format!("duplicate camera id '{}'", camera.id)));
            }
            if !(0.0..=1.0).contains(&camera.min_confidence) {
                return Err(VisionError::Config(format!(
                    "camera '{}': min_confidence must lie in [0, 1]",
                    camera.id
                )));
            }
            validate_zones(camera)?;
        }
        Ok(())
    }
}

fn validate_zones(camera: &CameraConfig) -> Result<()> {
    let mut zone_ids = HashSet::new();
    for zone in &camera.zones {
        if !zone_ids.insert(&zone.id) {
            return Err(VisionError::Config(format!(
                "camera '{}': duplicate zone id '{}'",
                camera.id, zone.id
            )));
        }
        match (&zone.geometry, zone.role.is_line()) {
            (ZoneGeometry::Polygon { points }, false) => {
                if points.len() < 3 || points.iter().any(|p| !p.is_finite()) {
                    return Err(VisionError::Config(format!(
                        "camera '{}': zone '{}' needs at least three finite vertices",
                        camera.id, zone.id
                    )));
                }
            }
            (ZoneGeometry::Line { from, to }, true) => {
                if !from.is_finite() || !to.is_finite() || from.distance(to) == 0.0 {
                    return Err(VisionError::Config(format!(
                        "camera '{}': line zone '{}' is degenerate",
                        camera.id, zone.id
                    )));
                }
            }
            _ => {
                return Err(VisionError::Config(format!(
                    "camera '{}': zone '{}' has a geometry that does not fit its role {:?}",
                    camera.id, zone.id, zone.role
                )));
            }
        }
        if zone.min_dwell_secs < 0.0 {
            return Err(VisionError::Config(format!(
                "camera '{}': zone '{}' has a negative min_dwell_secs",
                camera.id, zone.id
            )));
        }
    }

    let required = camera.role.required_zone();
    if !camera.zones.iter().any(|z| z.role == required) {
        return Err(VisionError::Config(format!(
            "camera '{}' with role {:?} requires at least one {:?} zone",
            camera.id, camera.role, required
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GATE_ONLY: &str = r#"{
        "cameras": [{
            "id": "gate",
            "role": "gate",
            "field_of_view": { "width": 1280, "height": 720 },
            "zones": [{
                "id": "gate_line",
                "role": "gate_line",
                "geometry": { "type": "line", "from": { "x": 600, "y": 0 }, "to": { "x": 600, "y": 720 } }
            }]
        }],
        "tracker": { "promote_after_hits": 2 }
    }"#;

    #[test]
    fn parses_with_section_defaults() {
        let config = EngineConfig::from_json_str(GATE_ONLY).expect("valid config");
        assert_eq!(config.tracker.promote_after_hits, 2);
        assert_eq!(config.tracker.lost_after_misses, TrackerConfig::default().lost_after_misses);
        assert_eq!(config.bus, BusConfig::default());
        assert_eq!(config.cameras[0].field_of_view.edge_margin, 40.0);
        assert_eq!(config.cameras[0].min_confidence, 0.5);
    }

    #[test]
    fn missing_required_zone_is_fatal() {
        let json = GATE_ONLY.replace("\"role\": \"gate\"", "\"role\": \"queue\"");
        let err = EngineConfig::from_json_str(&json).unwrap_err();
        assert!(matches!(err, VisionError::Config(msg) if msg.contains("QueueCorridor")));
    }

    #[test]
    fn line_geometry_on_polygon_role_is_rejected() {
        let json = GATE_ONLY.replace("\"role\": \"gate_line\"", "\"role\": \"queue_corridor\"");
        assert!(matches!(
            EngineConfig::from_json_str(&json),
            Err(VisionError::Config(_))
        ));
    }

    #[test]
    fn duplicate_cameras_are_rejected() {
        let mut config = EngineConfig::from_json_str(GATE_ONLY).expect("valid config");
        config.cameras.push(config.cameras[0].clone());
        assert!(matches!(config.validate(), Err(VisionError::Config(msg)) if msg.contains("duplicate camera")));
    }

    #[test]
    fn zero_window_is_rejected() {
        let mut config = EngineConfig::from_json_str(GATE_ONLY).expect("valid config");
        config.aggregator.window_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overflowing_window_is_rejected() {
        let mut config = EngineConfig::from_json_str(GATE_ONLY).expect("valid config");
        config.aggregator.window_secs = u64::MAX / 100;
        assert!(matches!(config.validate(), Err(VisionError::Config(_))));
        assert_eq!(config.aggregator.window_ms(), u64::MAX);

        config.aggregator.window_secs = u64::MAX / 1000;
        config.aggregator.close_grace_ms = u64::MAX;
        assert!(config.validate().is_err());
    }
}
