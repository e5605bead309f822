// THEORY:
// A `Tracklet` is one entity's persistent identity within one camera's frame sequence.
// Where an `Observation` is a snapshot, a tracklet is the entity *over time*: its recent
// trajectory, its velocity, and where it sits in the identity lifecycle.
//
// Key architectural principles:
// 1.  **Bounded Tolerance**: Identity survives occlusion through an explicit state machine,
//     `Tentative -> Active -> Lost -> Closed`, whose thresholds are tunable parameters
//     rather than ad hoc frame-to-frame rules.
// 2.  **One Observation per Frame**: Each frame index appears at most once in the
//     trajectory. Gaps are allowed; duplicates are not.
// 3.  **Owned by the Tracker**: Only the tracker mutates a tracklet. Every other layer sees
//     the `TrackletDelta`s it emits.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core_modules::geometry::{BoundingBox, Point};
use crate::core_modules::observation::{EntityClass, Millis, Observation, PoseSignal};

const TRAJECTORY_HISTORY_SIZE: usize = 32;

/// Camera-scoped tracklet identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackletId(pub u64);

impl fmt::Display for TrackletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackletState {
    /// Newly born; not yet trusted. Never produces zone events.
    Tentative,
    /// Confirmed and currently matched.
    Active,
    /// Confirmed but unmatched for several frames. Can still be re-matched.
    Lost,
    /// Terminal.
    Closed,
}

/// One matched observation in a tracklet's trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackPoint {
    pub frame_index: u64,
    pub timestamp_ms: Millis,
    pub bbox: BoundingBox,
    pub confidence: f64,
}

impl TrackPoint {
    pub fn position(&self) -> Point {
        self.bbox.center()
    }

    pub fn footprint(&self) -> Point {
        self.bbox.footprint()
    }
}

/// A persistent identity within one camera.
#[derive(Debug, Clone)]
pub struct Tracklet {
    pub id: TrackletId,
    pub class: EntityClass,
    pub state: TrackletState,
    /// The most recent matched observations, oldest first.
    pub trajectory: VecDeque<TrackPoint>,
    /// Velocity of the association point in scene units per second.
    pub velocity: (f64, f64),
    /// Consecutive matched frames.
    pub hits: u32,
    /// Consecutive unmatched frames.
    pub misses: u32,
    pub first_seen_ms: Millis,
    pub last_seen_ms: Millis,
    /// Pose of the most recent observation, when one was supplied.
    pub last_pose: Option<PoseSignal>,
}

impl Tracklet {
    pub(crate) fn new(id: TrackletId, observation: Observation, frame_index: u64) -> Self {
        let mut trajectory = VecDeque::with_capacity(TRAJECTORY_HISTORY_SIZE);
        trajectory.push_back(TrackPoint {
            frame_index,
            timestamp_ms: observation.timestamp_ms,
            bbox: observation.bbox,
            confidence: observation.confidence,
        });
        Self {
            id,
            class: observation.class,
            state: TrackletState::Tentative,
            trajectory,
            velocity: (0.0, 0.0),
            hits: 1,
            misses: 0,
            first_seen_ms: observation.timestamp_ms,
            last_seen_ms: observation.timestamp_ms,
            last_pose: observation.pose,
        }
    }

    /// Appends a matched observation and refreshes the velocity estimate.
    pub(crate) fn record(&mut self, observation: Observation, frame_index: u64) {
        let previous = self.latest().clone();
        debug_assert!(frame_index > previous.frame_index, "one observation per frame");

        let point = TrackPoint {
            frame_index,
            timestamp_ms: observation.timestamp_ms,
            bbox: observation.bbox,
            confidence: observation.confidence,
        };
        let dt_secs = point.timestamp_ms.saturating_sub(previous.timestamp_ms) as f64 / 1000.0;
        if dt_secs > 0.0 {
            let (new_pos, old_pos) = (point.position(), previous.position());
            self.velocity = (
                (new_pos.x - old_pos.x) / dt_secs,
                (new_pos.y - old_pos.y) / dt_secs,
            );
        }

        self.trajectory.push_back(point);
        if self.trajectory.len() > TRAJECTORY_HISTORY_SIZE {
            self.trajectory.pop_front();
        }

        self.last_seen_ms = observation.timestamp_ms;
        self.last_pose = observation.pose;
        self.hits += 1;
        self.misses = 0;
    }

    pub(crate) fn mark_missed(&mut self) {
        self.hits = 0;
        self.misses += 1;
    }

    pub fn latest(&self) -> &TrackPoint {
        // The trajectory is created non-empty and only trimmed from the front past capacity.
        &self.trajectory[self.trajectory.len() - 1]
    }

    /// Constant-velocity prediction, extrapolating at most `max_horizon_secs` ahead so a
    /// long gap does not fling the estimate across the frame.
    pub fn predict(&self, now_ms: Millis, max_horizon_secs: f64) -> Point {
        let last = self.latest().position();
        let dt_secs = (now_ms.saturating_sub(self.last_seen_ms) as f64 / 1000.0).min(max_horizon_secs);
        Point::new(last.x + self.velocity.0 * dt_secs, last.y + self.velocity.1 * dt_secs)
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.state, TrackletState::Active | TrackletState::Lost)
    }
}
