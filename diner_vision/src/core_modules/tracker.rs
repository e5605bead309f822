// THEORY:
// The `tracker` adds object permanence to one camera. It takes the stateless observation
// list of a single frame and associates it with the tracklets it carried from previous
// frames, solving the "data association problem".
//
// Key architectural principles:
// 1.  **Predict, Then Match**: Each tracklet's position is extrapolated to the frame
//     timestamp and the cost of pairing it with an observation is the distance from that
//     prediction plus a class-mismatch penalty. Pairs above the gate are never matched.
// 2.  **Optimal When Affordable**: The association is a minimum-cost bipartite assignment.
//     When the frame is too large for the budget, or the solver fails, the frame is
//     matched greedily instead, logged and counted; the next frame is optimal again.
// 3.  **Lifecycle Management**: The tracker owns the whole identity lifecycle:
//     - **Birth**: An unmatched observation spawns a TENTATIVE tracklet.
//     - **Confirmation**: K consecutive matches promote it to ACTIVE. A miss before then
//       discards it silently; tentative identities never reach the event layer.
//     - **Occlusion**: M consecutive misses turn an ACTIVE tracklet LOST. A re-match brings
//       it back to ACTIVE with its identity intact.
//     - **Death**: No match for `close_after_secs`, or LOST at the edge of the frame and
//       outside every zone, closes the tracklet for good.
// 4.  **Deltas, Not State**: `update` reports what changed as `TrackletDelta`s. Downstream
//     layers never borrow the tracklets themselves.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::{CameraConfig, TrackerConfig};
use crate::core_modules::assignment::{self, CostMatrix};
use crate::core_modules::geometry::{FieldOfView, Point};
use crate::core_modules::observation::{CameraId, EntityClass, Millis, Observation, PoseSignal};
use crate::core_modules::tracklet::{Tracklet, TrackletId, TrackletState};
use crate::core_modules::zone::{Zone, zones_from_config};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// No match for longer than the close timeout.
    Timeout,
    /// Lost at the border of the frame, outside every zone.
    LeftFieldOfView,
    /// The camera pipeline was stopped.
    Flushed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Spawned,
    Promoted,
    Updated,
    Recovered,
    Lost,
    Discarded,
    Closed(CloseReason),
}

/// One change to one tracklet, as seen by the event layer.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackletDelta {
    pub id: TrackletId,
    pub class: EntityClass,
    pub kind: DeltaKind,
    /// The frame (or closure) time at which the change happened.
    pub timestamp_ms: Millis,
    pub footprint: Point,
    /// Footprint at the previous matched observation, when there is one.
    pub previous_footprint: Option<Point>,
    /// On promotion, every footprint since spawn, oldest first. Empty otherwise.
    pub path: Vec<(Millis, Point)>,
    pub first_seen_ms: Millis,
    pub last_seen_ms: Millis,
    pub pose: Option<PoseSignal>,
}

impl TrackletDelta {
    fn of(tracklet: &Tracklet, kind: DeltaKind, timestamp_ms: Millis) -> Self {
        let len = tracklet.trajectory.len();
        let previous_footprint = (len >= 2).then(|| tracklet.trajectory[len - 2].footprint());
        // The event layer never saw the tentative frames, so promotion hands them over.
        let path = match kind {
            DeltaKind::Promoted => tracklet
                .trajectory
                .iter()
                .map(|point| (point.timestamp_ms, point.footprint()))
                .collect(),
            _ => Vec::new(),
        };
        Self {
            id: tracklet.id,
            class: tracklet.class,
            kind,
            timestamp_ms,
            footprint: tracklet.latest().footprint(),
            previous_footprint,
            path,
            first_seen_ms: tracklet.first_seen_ms,
            last_seen_ms: tracklet.last_seen_ms,
            pose: tracklet.last_pose.clone(),
        }
    }

    /// Consecutive footprint pairs the tracklet moved through since the last delta the
    /// event layer saw: the whole tentative path on promotion, otherwise the last step.
    pub fn steps(&self) -> Vec<(Point, Point)> {
        if self.path.len() >= 2 {
            self.path.windows(2).map(|pair| (pair[0].1, pair[1].1)).collect()
        } else {
            self.previous_footprint
                .map(|previous| (previous, self.footprint))
                .into_iter()
                .collect()
        }
    }

    /// Deltas that carry a fresh observation of a confirmed tracklet.
    pub fn is_observed(&self) -> bool {
        matches!(
            self.kind,
            DeltaKind::Promoted | DeltaKind::Updated | DeltaKind::Recovered
        )
    }
}

/// Manages the tracklets of one camera from one frame to the next.
pub struct Tracker {
    camera: CameraId,
    config: TrackerConfig,
    field_of_view: FieldOfView,
    /// Area zones, used to decide whether a lost entity has left the scene.
    areas: Vec<Zone>,
    tracklets: Vec<Tracklet>,
    next_id: u64,
    frame_index: u64,
    last_frame_degraded: bool,
    assignment_fallbacks: u64,
}

impl Tracker {
    pub fn new(camera: &CameraConfig, config: TrackerConfig) -> Result<Self> {
        let areas = zones_from_config(&camera.zones)?
            .into_iter()
            .filter(|zone| !zone.role.is_line())
            .collect();
        Ok(Self {
            camera: camera.id.clone(),
            config,
            field_of_view: camera.field_of_view,
            areas,
            tracklets: Vec::new(),
            next_id: 1,
            frame_index: 0,
            last_frame_degraded: false,
            assignment_fallbacks: 0,
        })
    }

    /// Associates one frame's observations with the live tracklets.
    pub fn update(&mut self, timestamp_ms: Millis, observations: Vec<Observation>) -> Vec<TrackletDelta> {
        self.frame_index += 1;
        self.last_frame_degraded = false;

        // --- 1. Expiry ---
        let mut deltas = self.close_stale(timestamp_ms);

        // --- 2. Matching ---
        let assignment = self.associate(timestamp_ms, &observations);

        let mut slots: Vec<Option<Observation>> = observations.into_iter().map(Some).collect();
        for &(row, col) in &assignment.matches {
            let Some(observation) = slots[col].take() else {
                continue;
            };
            let tracklet = &mut self.tracklets[row];
            tracklet.record(observation, self.frame_index);
            let kind = match tracklet.state {
                TrackletState::Tentative if tracklet.hits >= self.config.promote_after_hits => {
                    tracklet.state = TrackletState::Active;
                    debug!("[{}] tracklet {} promoted", self.camera, tracklet.id);
                    Some(DeltaKind::Promoted)
                }
                TrackletState::Tentative => None,
                TrackletState::Active => Some(DeltaKind::Updated),
                TrackletState::Lost => {
                    tracklet.state = TrackletState::Active;
                    debug!("[{}] tracklet {} recovered", self.camera, tracklet.id);
                    Some(DeltaKind::Recovered)
                }
                TrackletState::Closed => None,
            };
            if let Some(kind) = kind {
                deltas.push(TrackletDelta::of(tracklet, kind, timestamp_ms));
            }
        }

        // --- 3. Misses ---
        let mut retired = Vec::new();
        for &row in &assignment.unmatched_rows {
            let tracklet = &mut self.tracklets[row];
            tracklet.mark_missed();
            match tracklet.state {
                TrackletState::Tentative => {
                    tracklet.state = TrackletState::Closed;
                    deltas.push(TrackletDelta::of(tracklet, DeltaKind::Discarded, timestamp_ms));
                    retired.push(row);
                    continue;
                }
                TrackletState::Active if tracklet.misses >= self.config.lost_after_misses => {
                    tracklet.state = TrackletState::Lost;
                    debug!("[{}] tracklet {} lost", self.camera, tracklet.id);
                    deltas.push(TrackletDelta::of(tracklet, DeltaKind::Lost, timestamp_ms));
                }
                _ => {}
            }

            let footprint = tracklet.latest().footprint();
            if tracklet.state == TrackletState::Lost
                && self.field_of_view.near_edge(&footprint)
                && !self.areas.iter().any(|zone| zone.contains(&footprint))
            {
                tracklet.state = TrackletState::Closed;
                debug!("[{}] tracklet {} left the field of view", self.camera, tracklet.id);
                deltas.push(TrackletDelta::of(
                    tracklet,
                    DeltaKind::Closed(CloseReason::LeftFieldOfView),
                    timestamp_ms,
                ));
                retired.push(row);
            }
        }
        retired.sort_unstable();
        for row in retired.into_iter().rev() {
            self.tracklets.remove(row);
        }

        // --- 4. Births ---
        for observation in slots.into_iter().flatten() {
            let id = TrackletId(self.next_id);
            self.next_id += 1;
            let mut tracklet = Tracklet::new(id, observation, self.frame_index);
            deltas.push(TrackletDelta::of(&tracklet, DeltaKind::Spawned, timestamp_ms));
            if tracklet.hits >= self.config.promote_after_hits {
                tracklet.state = TrackletState::Active;
                deltas.push(TrackletDelta::of(&tracklet, DeltaKind::Promoted, timestamp_ms));
            }
            self.tracklets.push(tracklet);
        }

        deltas
    }

    /// Closes tracklets that have gone unmatched for too long, without a frame.
    /// Used when the camera has gone silent.
    pub fn age(&mut self, now_ms: Millis) -> Vec<TrackletDelta> {
        self.close_stale(now_ms)
    }

    /// Closes every tracklet. Confirmed ones produce `Closed(Flushed)`.
    pub fn flush(&mut self, now_ms: Millis) -> Vec<TrackletDelta> {
        let mut deltas = Vec::with_capacity(self.tracklets.len());
        for mut tracklet in self.tracklets.drain(..) {
            let kind = if tracklet.is_confirmed() {
                DeltaKind::Closed(CloseReason::Flushed)
            } else {
                DeltaKind::Discarded
            };
            tracklet.state = TrackletState::Closed;
            deltas.push(TrackletDelta::of(&tracklet, kind, now_ms.max(tracklet.last_seen_ms)));
        }
        deltas
    }

    pub fn tracklets(&self) -> &[Tracklet] {
        &self.tracklets
    }

    pub fn get(&self, id: TrackletId) -> Option<&Tracklet> {
        self.tracklets.iter().find(|t| t.id == id)
    }

    pub fn confirmed_count(&self) -> usize {
        self.tracklets.iter().filter(|t| t.is_confirmed()).count()
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Whether the most recent frame was matched greedily.
    pub fn last_frame_degraded(&self) -> bool {
        self.last_frame_degraded
    }

    pub fn assignment_fallbacks(&self) -> u64 {
        self.assignment_fallbacks
    }

    fn close_stale(&mut self, now_ms: Millis) -> Vec<TrackletDelta> {
        let close_after_ms = (self.config.close_after_secs * 1000.0).round() as Millis;
        let mut deltas = Vec::new();
        let camera = &self.camera;
        self.tracklets.retain_mut(|tracklet| {
            if now_ms.saturating_sub(tracklet.last_seen_ms) < close_after_ms {
                return true;
            }
            let kind = if tracklet.is_confirmed() {
                debug!("[{camera}] tracklet {} closed after timeout", tracklet.id);
                DeltaKind::Closed(CloseReason::Timeout)
            } else {
                DeltaKind::Discarded
            };
            tracklet.state = TrackletState::Closed;
            deltas.push(TrackletDelta::of(tracklet, kind, now_ms));
            false
        });
        deltas
    }

    fn associate(&mut self, timestamp_ms: Millis, observations: &[Observation]) -> assignment::Assignment {
        let horizon = self.config.max_prediction_secs;
        let penalty = self.config.class_mismatch_penalty;
        let predictions: Vec<Point> = self
            .tracklets
            .iter()
            .map(|t| t.predict(timestamp_ms, horizon))
            .collect();
        let costs = CostMatrix::from_fn(self.tracklets.len(), observations.len(), |row, col| {
            let observation = &observations[col];
            let mismatch = if self.tracklets[row].class == observation.class {
                0.0
            } else {
                penalty
            };
            predictions[row].distance(&observation.position()) + mismatch
        });
        let confidences: Vec<f64> = observations.iter().map(|o| o.confidence).collect();
        let ranks = assignment::observation_ranks(&confidences);
        let gate = self.config.max_match_distance;

        match assignment::solve(&costs, &ranks, gate, self.config.max_assignment_size) {
            Ok(result) => result,
            Err(err) => {
                warn!("[{}] frame {}: {err}; matching greedily", self.camera, self.frame_index);
                self.last_frame_degraded = true;
                self.assignment_fallbacks += 1;
                assignment::greedy(&costs, &ranks, gate)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraRole, ZoneConfig, ZoneGeometry};
    use crate::core_modules::geometry::BoundingBox;
    use crate::core_modules::observation::ZoneId;
    use crate::core_modules::zone::ZoneRole;

    fn queue_camera() -> CameraConfig {
        CameraConfig {
            id: CameraId::from("queue"),
            role: CameraRole::Queue,
            field_of_view: FieldOfView {
                width: 640.0,
                height: 480.0,
                edge_margin: 30.0,
            },
            zones: vec![ZoneConfig {
                id: ZoneId::from("queue_corridor"),
                role: ZoneRole::QueueCorridor,
                geometry: ZoneGeometry::Polygon {
                    points: vec![
                        Point::new(200.0, 100.0),
                        Point::new(400.0, 100.0),
                        Point::new(400.0, 400.0),
                        Point::new(200.0, 400.0),
                    ],
                },
                min_dwell_secs: 0.0,
            }],
            min_confidence: 0.5,
        }
    }

    fn config(promote_after_hits: u32) -> TrackerConfig {
        TrackerConfig {
            promote_after_hits,
            lost_after_misses: 2,
            ..TrackerConfig::default()
        }
    }

    fn person(x: f64, y: f64, timestamp_ms: Millis) -> Observation {
        Observation {
            camera: CameraId::from("queue"),
            timestamp_ms,
            bbox: BoundingBox::new(x - 10.0, y - 40.0, x + 10.0, y + 40.0),
            class: EntityClass::Person,
            pose: None,
            confidence: 0.9,
        }
    }

    fn kinds(deltas: &[TrackletDelta]) -> Vec<DeltaKind> {
        deltas.iter().map(|d| d.kind).collect()
    }

    #[test]
    fn tentative_promotes_after_k_hits() {
        let mut tracker = Tracker::new(&queue_camera(), config(3)).expect("valid camera");
        assert_eq!(kinds(&tracker.update(0, vec![person(300.0, 200.0, 0)])), vec![DeltaKind::Spawned]);
        assert!(tracker.update(100, vec![person(302.0, 200.0, 100)]).is_empty());
        let promoted = tracker.update(200, vec![person(304.0, 200.0, 200)]);
        assert_eq!(kinds(&promoted), vec![DeltaKind::Promoted]);
        assert_eq!(tracker.confirmed_count(), 1);

        // The tentative frames travel with the promotion, oldest first.
        let stamps: Vec<Millis> = promoted[0].path.iter().map(|(at, _)| *at).collect();
        assert_eq!(stamps, vec![0, 100, 200]);
        assert_eq!(promoted[0].steps().len(), 2);
        let updated = tracker.update(300, vec![person(306.0, 200.0, 300)]);
        assert!(updated[0].path.is_empty());
        assert_eq!(updated[0].steps().len(), 1);
    }

    #[test]
    fn tentative_miss_is_discarded() {
        let mut tracker = Tracker::new(&queue_camera(), config(3)).expect("valid camera");
        tracker.update(0, vec![person(300.0, 200.0, 0)]);
        assert_eq!(kinds(&tracker.update(100, vec![])), vec![DeltaKind::Discarded]);
        assert!(tracker.tracklets().is_empty());
    }

    #[test]
    fn separated_people_keep_separate_identities() {
        let mut tracker = Tracker::new(&queue_camera(), config(1)).expect("valid camera");
        for frame in 0..20u64 {
            let t = frame * 100;
            let step = frame as f64 * 2.0;
            tracker.update(t, vec![person(220.0 + step, 200.0, t), person(380.0 - step, 300.0, t)]);
        }
        assert_eq!(tracker.tracklets().len(), 2);
        let ids: Vec<u64> = tracker.tracklets().iter().map(|t| t.id.0).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn lost_tracklet_recovers_its_identity() {
        let mut tracker = Tracker::new(&queue_camera(), config(1)).expect("valid camera");
        tracker.update(0, vec![person(300.0, 200.0, 0)]);
        tracker.update(100, vec![]);
        assert_eq!(kinds(&tracker.update(200, vec![])), vec![DeltaKind::Lost]);
        let deltas = tracker.update(300, vec![person(301.0, 200.0, 300)]);
        assert_eq!(kinds(&deltas), vec![DeltaKind::Recovered]);
        assert_eq!(deltas[0].id, TrackletId(1));
    }

    #[test]
    fn lost_at_the_edge_outside_zones_closes() {
        let mut tracker = Tracker::new(&queue_camera(), config(1)).expect("valid camera");
        // Footprint at y = 470, inside the bottom margin and below the corridor.
        tracker.update(0, vec![person(600.0, 430.0, 0)]);
        tracker.update(100, vec![]);
        let deltas = tracker.update(200, vec![]);
        assert_eq!(
            kinds(&deltas),
            vec![DeltaKind::Lost, DeltaKind::Closed(CloseReason::LeftFieldOfView)]
        );
        assert!(tracker.tracklets().is_empty());
    }

    #[test]
    fn timeout_closes_with_last_seen() {
        let mut tracker = Tracker::new(&queue_camera(), config(1)).expect("valid camera");
        tracker.update(1_000, vec![person(300.0, 200.0, 1_000)]);
        let deltas = tracker.age(31_000);
        assert_eq!(kinds(&deltas), vec![DeltaKind::Closed(CloseReason::Timeout)]);
        assert_eq!(deltas[0].last_seen_ms, 1_000);
        assert_eq!(deltas[0].timestamp_ms, 31_000);
    }

    #[test]
    fn class_mismatch_is_not_matched() {
        let mut tracker = Tracker::new(&queue_camera(), config(1)).expect("valid camera");
        tracker.update(0, vec![person(300.0, 200.0, 0)]);
        let mut car = person(300.0, 200.0, 100);
        car.class = EntityClass::Vehicle;
        let deltas = tracker.update(100, vec![car]);
        assert!(kinds(&deltas).contains(&DeltaKind::Spawned));
        assert_eq!(tracker.tracklets().len(), 2);
    }

    #[test]
    fn oversized_frame_degrades_to_greedy() {
        let mut cfg = config(1);
        cfg.max_assignment_size = 2;
        let mut tracker = Tracker::new(&queue_camera(), cfg).expect("valid camera");
        tracker.update(0, vec![person(250.0, 200.0, 0), person(350.0, 200.0, 0)]);
        let deltas = tracker.update(100, vec![person(251.0, 200.0, 100), person(351.0, 200.0, 100)]);
        assert!(tracker.last_frame_degraded());
        assert_eq!(tracker.assignment_fallbacks(), 1);
        assert_eq!(kinds(&deltas), vec![DeltaKind::Updated, DeltaKind::Updated]);
    }

    #[test]
    fn flush_closes_confirmed_and_discards_tentative() {
        let mut tracker = Tracker::new(&queue_camera(), config(2)).expect("valid camera");
        tracker.update(0, vec![person(250.0, 200.0, 0)]);
        tracker.update(100, vec![person(250.0, 200.0, 100), person(350.0, 300.0, 100)]);
        let deltas = tracker.flush(150);
        assert_eq!(
            kinds(&deltas),
            vec![DeltaKind::Closed(CloseReason::Flushed), DeltaKind::Discarded]
        );
    }
}
