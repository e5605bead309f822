// THEORY:
// A `KpiWindow` is one fixed-granularity bucket of the KPI timeline. It holds plain
// counters and duration sums per scope (a camera, or a zone of a camera); every KPI is a
// pure function of those counters. A window is mutated only by the aggregator while it is
// open and is frozen into an immutable snapshot when it closes.

use std::collections::BTreeMap;

use chrono::{DateTime, Timelike, Utc};
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};

use crate::core_modules::alerts::{Alert, AlertState};
use crate::core_modules::observation::{CameraId, Millis, ZoneId};
use crate::core_modules::tracklet::TrackletId;
use crate::core_modules::zone::ZoneRole;

pub type WindowId = u64;

const MAX_ALERTS_PER_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    /// Still open, or closed before its end was reached.
    Partial,
    Complete,
    /// Closed, but includes events that arrived late or were redirected from a closed window.
    LateAdjusted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalKind {
    Dwell,
    Attendance,
}

/// A DWELL or ATTENDANCE interval that has started and not yet ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenInterval {
    pub kind: IntervalKind,
    pub zone: ZoneId,
    pub role: ZoneRole,
    pub started_ms: Millis,
}

/// Tracklets inside one area zone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneMembers {
    pub camera: CameraId,
    pub zone: ZoneId,
    pub role: ZoneRole,
    pub members: Vec<TrackletId>,
}

/// The live state a window opened with. Applying the window's own events on top of it
/// rebuilds the window, carried-over visits and shifts included.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OpeningState {
    /// Where the time-weighted gauges start integrating inside the window.
    pub clock_ms: Millis,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<ZoneMembers>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub occupancy: Vec<(CameraId, ZoneId, i64)>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub intervals: Vec<(CameraId, TrackletId, OpenInterval)>,
    pub alerts: AlertState,
}

/// Count, sum and extrema of a family of durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DurationStats {
    pub count: u64,
    pub total_ms: Millis,
    pub min_ms: Option<Millis>,
    pub max_ms: Option<Millis>,
    /// How many of the durations were cut short by a tracklet closing.
    pub truncated: u64,
}

impl DurationStats {
    pub fn record(&mut self, duration_ms: Millis, truncated: bool) {
        self.count += 1;
        self.total_ms += duration_ms;
        self.min_ms = Some(self.min_ms.map_or(duration_ms, |m| m.min(duration_ms)));
        self.max_ms = Some(self.max_ms.map_or(duration_ms, |m| m.max(duration_ms)));
        if truncated {
            self.truncated += 1;
        }
    }

    pub fn merge(&mut self, other: &DurationStats) {
        self.count += other.count;
        self.total_ms += other.total_ms;
        self.min_ms = match (self.min_ms, other.min_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_ms = self.max_ms.max(other.max_ms);
        self.truncated += other.truncated;
    }

    pub fn mean_secs(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_ms as f64 / self.count as f64 / 1000.0
    }

    pub fn max_secs(&self) -> f64 {
        self.max_ms.unwrap_or(0) as f64 / 1000.0
    }
}

/// What a counter row is about. `zone: None` holds camera-level facts such as closures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ScopeKey {
    pub camera: CameraId,
    pub zone: Option<ZoneId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScopeCounters {
    pub entered: u64,
    pub exited: u64,
    pub crossed_in: u64,
    pub crossed_out: u64,
    pub dwell: DurationStats,
    pub queue_wait: DurationStats,
    pub attendance: DurationStats,
    pub attendance_starts: u64,
    pub hygiene_pose_confirmed: u64,
    pub hygiene_presence_only: u64,
    pub queue_length_max: usize,
    /// Integral of queue length over time, in length x ms.
    pub queue_length_area_ms: f64,
    /// Time at least one vehicle occupied the slot.
    pub occupied_slot_ms: f64,
    pub vehicle_arrivals: u64,
    pub tracklets_closed: u64,
    /// Gate occupancy when the window closed.
    pub occupancy_end: Option<i64>,
}

impl ScopeCounters {
    pub fn merge(&mut self, other: &ScopeCounters) {
        self.entered += other.entered;
        self.exited += other.exited;
        self.crossed_in += other.crossed_in;
        self.crossed_out += other.crossed_out;
        self.dwell.merge(&other.dwell);
        self.queue_wait.merge(&other.queue_wait);
        self.attendance.merge(&other.attendance);
        self.attendance_starts += other.attendance_starts;
        self.hygiene_pose_confirmed += other.hygiene_pose_confirmed;
        self.hygiene_presence_only += other.hygiene_presence_only;
        self.queue_length_max = self.queue_length_max.max(other.queue_length_max);
        self.queue_length_area_ms += other.queue_length_area_ms;
        self.occupied_slot_ms += other.occupied_slot_ms;
        self.vehicle_arrivals += other.vehicle_arrivals;
        self.tracklets_closed += other.tracklets_closed;
        self.occupancy_end = match (self.occupancy_end, other.occupancy_end) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }

    pub fn hygiene_events(&self) -> u64 {
        self.hygiene_pose_confirmed + self.hygiene_presence_only
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KpiWindow {
    pub id: WindowId,
    pub start_ms: Millis,
    pub end_ms: Millis,
    #[serde(serialize_with = "serialize_scopes")]
    pub counters: BTreeMap<ScopeKey, ScopeCounters>,
    pub events_applied: u64,
    /// Events that arrived behind the sequencer horizon.
    pub late_events: u64,
    /// Events that belonged to an already closed window and were counted here instead.
    pub late_attributed: u64,
    /// Synthetic DWELL_END / ATTENDANCE_END forced by tracklet closure.
    pub truncated_ends: u64,
    pub alerts: Vec<Alert>,
    pub finalized: bool,
    pub completeness: Completeness,
    pub opening: OpeningState,
    /// How far into the window the gauges were integrated when it closed.
    pub gauged_through_ms: Millis,
}

impl KpiWindow {
    pub fn new(id: WindowId, window_ms: Millis) -> Self {
        Self {
            id,
            start_ms: id * window_ms,
            end_ms: (id + 1) * window_ms,
            counters: BTreeMap::new(),
            events_applied: 0,
            late_events: 0,
            late_attributed: 0,
            truncated_ends: 0,
            alerts: Vec::new(),
            finalized: false,
            completeness: Completeness::Partial,
            opening: OpeningState {
                clock_ms: id * window_ms,
                ..OpeningState::default()
            },
            gauged_through_ms: id * window_ms,
        }
    }

    /// A window that starts from carried-over state. Gate occupancy starts at the value
    /// carried in and moves with every crossing counted here.
    pub fn opened(id: WindowId, window_ms: Millis, opening: OpeningState) -> Self {
        let mut window = Self::new(id, window_ms);
        for (camera, zone, occupancy) in &opening.occupancy {
            window.scope_mut(camera, Some(zone)).occupancy_end = Some(*occupancy);
        }
        window.opening = opening;
        window
    }

    pub fn scope_mut(&mut self, camera: &CameraId, zone: Option<&ZoneId>) -> &mut ScopeCounters {
        self.counters
            .entry(ScopeKey {
                camera: camera.clone(),
                zone: zone.cloned(),
            })
            .or_default()
    }

    /// Sum of the counters of every scope accepted by `filter`.
    pub fn merged<F>(&self, filter: F) -> ScopeCounters
    where
        F: Fn(&ScopeKey) -> bool,
    {
        let mut total = ScopeCounters::default();
        for (key, counters) in &self.counters {
            if filter(key) {
                total.merge(counters);
            }
        }
        total
    }

    pub fn duration_ms(&self) -> Millis {
        self.end_ms - self.start_ms
    }

    pub fn push_alert(&mut self, alert: Alert) {
        self.alerts.push(alert);
        if self.alerts.len() > MAX_ALERTS_PER_WINDOW {
            self.alerts.remove(0);
        }
    }

    /// Freezes the window. `reached_end` is false when the engine stopped mid-window.
    pub fn finalize(&mut self, reached_end: bool) {
        self.finalized = true;
        self.completeness = if !reached_end {
            Completeness::Partial
        } else if self.late_events > 0 || self.late_attributed > 0 {
            Completeness::LateAdjusted
        } else {
            Completeness::Complete
        };
    }

    /// Wall-clock hour of day the window starts in.
    pub fn hour_of_day(&self, epoch_unix_ms: i64) -> u32 {
        let start = epoch_unix_ms.saturating_add(self.start_ms as i64);
        DateTime::<Utc>::from_timestamp_millis(start).map_or(0, |t| t.hour())
    }

    /// Human label such as `2024-05-01 12:00`.
    pub fn label(&self, epoch_unix_ms: i64) -> String {
        let start = epoch_unix_ms.saturating_add(self.start_ms as i64);
        DateTime::<Utc>::from_timestamp_millis(start)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| format!("window {}", self.id))
    }
}

#[derive(Serialize)]
struct ScopeEntry<'a> {
    camera: &'a CameraId,
    #[serde(skip_serializing_if = "Option::is_none")]
    zone: Option<&'a ZoneId>,
    #[serde(flatten)]
    counters: &'a ScopeCounters,
}

fn serialize_scopes<S>(scopes: &BTreeMap<ScopeKey, ScopeCounters>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut seq = serializer.serialize_seq(Some(scopes.len()))?;
    for (key, counters) in scopes {
        seq.serialize_element(&ScopeEntry {
            camera: &key.camera,
            zone: key.zone.as_ref(),
            counters,
        })?;
    }
    seq.end()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_follow_the_id() {
        let window = KpiWindow::new(3, 3_600_000);
        assert_eq!(window.start_ms, 10_800_000);
        assert_eq!(window.end_ms, 14_400_000);
        assert_eq!(window.hour_of_day(0), 3);
        assert_eq!(window.label(0), "1970-01-01 03:00");
    }

    #[test]
    fn duration_stats_merge() {
        let mut a = DurationStats::default();
        a.record(10_000, false);
        let mut b = DurationStats::default();
        b.record(30_000, true);
        b.record(20_000, false);
        a.merge(&b);
        assert_eq!(a.count, 3);
        assert_eq!(a.min_ms, Some(10_000));
        assert_eq!(a.max_ms, Some(30_000));
        assert_eq!(a.truncated, 1);
        assert!((a.mean_secs() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn completeness_reflects_lateness() {
        let mut window = KpiWindow::new(0, 1_000);
        window.finalize(true);
        assert_eq!(window.completeness, Completeness::Complete);
        let mut window = KpiWindow::new(0, 1_000);
        window.late_attributed = 1;
        window.finalize(true);
        assert_eq!(window.completeness, Completeness::LateAdjusted);
        let mut window = KpiWindow::new(0, 1_000);
        window.finalize(false);
        assert_eq!(window.completeness, Completeness::Partial);
    }

    #[test]
    fn merged_sums_selected_scopes() {
        let mut window = KpiWindow::new(0, 1_000);
        let queue = CameraId::from("queue");
        window.scope_mut(&queue, Some(&ZoneId::from("a"))).entered = 2;
        window.scope_mut(&queue, Some(&ZoneId::from("b"))).entered = 3;
        window.scope_mut(&CameraId::from("gate"), None).entered = 7;
        assert_eq!(window.merged(|k| k.camera == queue).entered, 5);
        assert_eq!(window.merged(|_| true).entered, 12);
    }

    #[test]
    fn serializes_scopes_as_a_list() {
        let mut window = KpiWindow::new(0, 1_000);
        window.scope_mut(&CameraId::from("gate"), None).crossed_in = 1;
        let json = serde_json::to_value(&window).expect("serializable");
        assert_eq!(json["counters"][0]["camera"], "gate");
        assert_eq!(json["counters"][0]["crossed_in"], 1);
    }
}
