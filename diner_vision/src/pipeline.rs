// THEORY:
// The `pipeline` module is the per-camera top-level API. It encapsulates the camera-local
// stack (adapter, tracker, zone event detector) behind a single `process_frame` call that
// turns one raw perception record into the domain events it implies.
//
// Key architectural principles:
// 1.  **One Camera, One Owner**: A `CameraPipeline` owns every piece of state for its camera
//     and shares none of it. Cameras never wait on each other.
// 2.  **Absorb and Count**: A malformed or out-of-order frame is rejected with an error the
//     caller can log, and counted in `PipelineStats`. The pipeline's state is untouched by
//     a rejected frame, so the next good frame proceeds normally.
// 3.  **Clean Shutdown**: `flush` closes every tracklet so each open visit ends and the
//     aggregator can force its truncated ENDs.

use log::{debug, warn};
use serde::Serialize;

use crate::config::{CameraConfig, EngineConfig};
use crate::core_modules::detection_adapter::{DetectionAdapter, RawFrame};
use crate::core_modules::event::DomainEvent;
use crate::core_modules::observation::{CameraId, Millis};
use crate::core_modules::tracker::{DeltaKind, Tracker, TrackletDelta};
use crate::core_modules::tracklet::Tracklet;
use crate::core_modules::zone_events::ZoneEventDetector;
use crate::error::{Result, VisionError};

/// Running counters for one camera.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub frames_dropped_malformed: u64,
    pub frames_out_of_order: u64,
    pub assignment_fallbacks: u64,
    pub events_emitted: u64,
    pub tracklets_closed: u64,
}

/// What one frame produced.
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub events: Vec<DomainEvent>,
    pub deltas: Vec<TrackletDelta>,
    /// The frame was associated greedily instead of optimally.
    pub degraded: bool,
}

pub struct CameraPipeline {
    camera: CameraId,
    adapter: DetectionAdapter,
    tracker: Tracker,
    detector: ZoneEventDetector,
    last_timestamp_ms: Option<Millis>,
    stats: PipelineStats,
}

impl CameraPipeline {
    pub fn new(camera: &CameraConfig, config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            camera: camera.id.clone(),
            adapter: DetectionAdapter::new(camera),
            tracker: Tracker::new(camera, config.tracker.clone())?,
            detector: ZoneEventDetector::new(camera, &config.hygiene)?,
            last_timestamp_ms: None,
            stats: PipelineStats::default(),
        })
    }

    pub fn camera(&self) -> &CameraId {
        &self.camera
    }

    pub fn process_frame(&mut self, raw: &RawFrame) -> Result<FrameReport> {
        if let Some(last) = self.last_timestamp_ms {
            if raw.timestamp_ms <= last {
                self.stats.frames_out_of_order += 1;
                return Err(VisionError::ClockSkew {
                    camera: self.camera.clone(),
                    timestamp_ms: raw.timestamp_ms,
                    horizon_ms: last,
                });
            }
        }

        // Stage 1: Normalization
        let observations = match self.adapter.normalize(raw) {
            Ok(observations) => observations,
            Err(err) => {
                self.stats.frames_dropped_malformed += 1;
                warn!("[{}] dropping frame at {}ms: {err}", self.camera, raw.timestamp_ms);
                return Err(err);
            }
        };
        self.last_timestamp_ms = Some(raw.timestamp_ms);

        // Stage 2: Association
        let deltas = self.tracker.update(raw.timestamp_ms, observations);
        let degraded = self.tracker.last_frame_degraded();
        if degraded {
            self.stats.assignment_fallbacks += 1;
        }

        // Stage 3: Zone Semantics
        let events = self.finish(&deltas);
        self.stats.frames_processed += 1;
        Ok(FrameReport {
            events,
            deltas,
            degraded,
        })
    }

    /// Ages tracklets while the camera is silent.
    pub fn age(&mut self, now_ms: Millis) -> Vec<DomainEvent> {
        let deltas = self.tracker.age(now_ms);
        self.finish(&deltas)
    }

    /// Closes every tracklet, ending every open visit.
    pub fn flush(&mut self) -> Vec<DomainEvent> {
        let now = self.last_timestamp_ms.unwrap_or(0);
        let deltas = self.tracker.flush(now);
        debug!("[{}] flushing {} tracklets", self.camera, deltas.len());
        self.finish(&deltas)
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn tracklets(&self) -> &[Tracklet] {
        self.tracker.tracklets()
    }

    pub fn last_timestamp_ms(&self) -> Option<Millis> {
        self.last_timestamp_ms
    }

    fn finish(&mut self, deltas: &[TrackletDelta]) -> Vec<DomainEvent> {
        self.stats.tracklets_closed += deltas
            .iter()
            .filter(|d| matches!(d.kind, DeltaKind::Closed(_)))
            .count() as u64;
        let events = self.detector.process(deltas);
        self.stats.events_emitted += events.len() as u64;
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::detection_adapter::RawDetection;
    use crate::core_modules::event::EventKind;

    const GATE: &str = r#"{
        "cameras": [{
            "id": "gate", "role": "gate",
            "field_of_view": { "width": 1000, "height": 1000, "edge_margin": 10 },
            "zones": [{ "id": "gate_line", "role": "gate_line",
                        "geometry": { "type": "line", "from": { "x": 500, "y": 0 }, "to": { "x": 500, "y": 1000 } } }]
        }],
        "tracker": { "promote_after_hits": 2 }
    }"#;

    fn pipeline() -> CameraPipeline {
        let config = EngineConfig::from_json_str(GATE).expect("valid config");
        CameraPipeline::new(&config.cameras[0], &config).expect("valid camera")
    }

    fn frame(timestamp_ms: Millis, x: f64) -> RawFrame {
        RawFrame {
            camera_id: CameraId::from("gate"),
            timestamp_ms,
            detections: vec![RawDetection {
                bbox: Some([x - 20.0, 400.0, x + 20.0, 600.0]),
                class_id: Some(0),
                label: None,
                confidence: 0.9,
                keypoints: None,
            }],
        }
    }

    #[test]
    fn walking_through_the_gate_counts_one_entry() {
        let mut pipeline = pipeline();
        let mut events = Vec::new();
        for (i, x) in [560.0, 540.0, 520.0, 480.0, 460.0].into_iter().enumerate() {
            let report = pipeline.process_frame(&frame(i as u64 * 100, x)).expect("good frame");
            events.extend(report.events);
        }
        let crossings: Vec<_> = events.iter().filter(|e| e.kind == EventKind::CrossedLine).collect();
        assert_eq!(crossings.len(), 1);
        assert_eq!(pipeline.stats().frames_processed, 5);
    }

    #[test]
    fn malformed_frames_are_counted_not_applied() {
        let mut pipeline = pipeline();
        let mut bad = frame(0, 560.0);
        bad.detections[0].confidence = 1.5;
        assert!(matches!(
            pipeline.process_frame(&bad),
            Err(VisionError::MalformedDetection { .. })
        ));
        assert_eq!(pipeline.stats().frames_dropped_malformed, 1);
        assert!(pipeline.tracklets().is_empty());
        assert!(pipeline.process_frame(&frame(0, 560.0)).is_ok());
    }

    #[test]
    fn out_of_order_frames_are_rejected() {
        let mut pipeline = pipeline();
        pipeline.process_frame(&frame(500, 560.0)).expect("good frame");
        assert!(matches!(
            pipeline.process_frame(&frame(400, 560.0)),
            Err(VisionError::ClockSkew { .. })
        ));
        assert_eq!(pipeline.stats().frames_out_of_order, 1);
    }

    #[test]
    fn flush_closes_confirmed_tracklets() {
        let mut pipeline = pipeline();
        pipeline.process_frame(&frame(0, 700.0)).expect("good frame");
        pipeline.process_frame(&frame(100, 702.0)).expect("good frame");
        let events = pipeline.flush();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::TrackletClosed);
        assert_eq!(pipeline.stats().tracklets_closed, 1);
    }
}
