// THEORY:
// The read side of the KPI layer. The aggregator is the only writer; it publishes frozen
// windows as `Arc<KpiWindow>` and copies of the open windows and live gauges into a shared
// store. Viewers clone the handle and read through it concurrently with aggregation: a
// reader either sees the state before a publish or after it, never a torn mix.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::core_modules::kpi_window::{Completeness, KpiWindow, ScopeCounters, ScopeKey, WindowId};
use crate::core_modules::observation::{CameraId, Millis, ZoneId};

/// Which cameras and zones a query covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    All,
    Camera(CameraId),
    Zone { camera: CameraId, zone: ZoneId },
}

impl Scope {
    pub fn zone(camera: &str, zone: &str) -> Self {
        Scope::Zone {
            camera: CameraId::from(camera),
            zone: ZoneId::from(zone),
        }
    }

    pub fn matches(&self, camera: &CameraId, zone: Option<&ZoneId>) -> bool {
        match self {
            Scope::All => true,
            Scope::Camera(c) => c == camera,
            Scope::Zone { camera: c, zone: z } => c == camera && zone == Some(z),
        }
    }

    /// Camera-level facts, such as staff on duty, belong to every zone of their camera.
    pub fn covers_camera(&self, camera: &CameraId) -> bool {
        match self {
            Scope::All => true,
            Scope::Camera(c) | Scope::Zone { camera: c, .. } => c == camera,
        }
    }

    fn accepts(&self, key: &ScopeKey) -> bool {
        self.matches(&key.camera, key.zone.as_ref())
    }
}

/// Which part of the timeline a query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowRange {
    /// The present: live gauges, or the newest window for windowed metrics.
    Live,
    /// Windows overlapping the half-open engine-time range.
    Between { from_ms: Millis, to_ms: Millis },
    All,
}

impl WindowRange {
    pub fn between(from_ms: Millis, to_ms: Millis) -> Self {
        WindowRange::Between { from_ms, to_ms }
    }

    fn overlaps(&self, window: &KpiWindow) -> bool {
        match *self {
            WindowRange::Between { from_ms, to_ms } => window.start_ms < to_ms && window.end_ms > from_ms,
            WindowRange::Live | WindowRange::All => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiMetric {
    /// Gate IN crossings.
    Entries,
    /// Gate OUT crossings.
    Exits,
    /// Live: people inside, IN minus OUT. Series: occupancy when each window closed.
    Occupancy,
    /// Histogram of entries by wall-clock hour of day.
    HourlyEntries,
    DwellCount,
    DwellMeanSecs,
    DwellMaxSecs,
    /// Live: tracklets currently inside queue corridors.
    QueueLength,
    QueueLengthMax,
    /// Time-weighted mean queue length over the window.
    QueueLengthMean,
    QueueWaitMeanSecs,
    VehicleArrivals,
    /// Fraction of slot-time occupied by at least one vehicle.
    ParkingUtilization,
    AttendanceSecs,
    /// Live: staff with an open attendance interval.
    StaffOnDuty,
    HygieneEvents,
    /// Hand-washes of either confidence per attendance shift, capped at 1.
    HygieneComplianceRate,
    /// As above, counting only pose-confirmed hand-washes.
    HygieneComplianceRateStrict,
    /// Mean queue length per staff member on duty. Lower is better.
    ServiceEfficiency,
    LateAttributed,
}

impl KpiMetric {
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            KpiMetric::QueueLength | KpiMetric::StaffOnDuty | KpiMetric::Occupancy
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KpiPoint {
    pub window: WindowId,
    pub start_ms: Millis,
    pub value: f64,
    pub completeness: Completeness,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiValue {
    Live(f64),
    Series(Vec<KpiPoint>),
    /// `(hour of day, value)`, hours in ascending order.
    Histogram(Vec<(u32, f64)>),
}

/// Gauges that only exist in the present tense.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveView {
    pub as_of_ms: Millis,
    pub queue_lengths: BTreeMap<(CameraId, ZoneId), usize>,
    pub occupancy: BTreeMap<(CameraId, ZoneId), i64>,
    pub staff_on_duty: BTreeMap<CameraId, usize>,
    pub occupied_slots: BTreeMap<(CameraId, ZoneId), bool>,
}

#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) finalized: BTreeMap<WindowId, Arc<KpiWindow>>,
    pub(crate) open: BTreeMap<WindowId, Arc<KpiWindow>>,
    pub(crate) live: LiveView,
}

/// Cloneable, read-only handle onto published KPIs.
#[derive(Clone)]
pub struct KpiQuery {
    state: Arc<RwLock<StoreState>>,
    epoch_unix_ms: i64,
    window_ms: Millis,
    /// Every configured parking slot, for utilization denominators.
    parking_slots: Arc<Vec<(CameraId, ZoneId)>>,
}

impl KpiQuery {
    pub(crate) fn new(epoch_unix_ms: i64, window_ms: Millis, parking_slots: Vec<(CameraId, ZoneId)>) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            epoch_unix_ms,
            window_ms,
            parking_slots: Arc::new(parking_slots),
        }
    }

    pub(crate) fn publish_finalized(&self, window: Arc<KpiWindow>) {
        let mut state = self.state.write();
        state.open.remove(&window.id);
        state.finalized.insert(window.id, window);
    }

    pub(crate) fn publish_open(&self, open: BTreeMap<WindowId, Arc<KpiWindow>>, live: LiveView) {
        let mut state = self.state.write();
        state.open = open;
        state.live = live;
    }

    pub fn snapshot(&self, id: WindowId) -> Option<Arc<KpiWindow>> {
        let state = self.state.read();
        state.finalized.get(&id).or_else(|| state.open.get(&id)).cloned()
    }

    /// Every published window in `range`, finalized and open, in id order.
    pub fn windows(&self, range: WindowRange) -> Vec<Arc<KpiWindow>> {
        let state = self.state.read();
        let mut merged: BTreeMap<WindowId, Arc<KpiWindow>> = state
            .open
            .iter()
            .filter(|(_, w)| range.overlaps(w))
            .map(|(id, w)| (*id, Arc::clone(w)))
            .collect();
        for (id, window) in state.finalized.iter().filter(|(_, w)| range.overlaps(w)) {
            merged.insert(*id, Arc::clone(window));
        }
        merged.into_values().collect()
    }

    pub fn live(&self) -> LiveView {
        self.state.read().live.clone()
    }

    pub fn get_kpi(&self, metric: KpiMetric, scope: &Scope, range: WindowRange) -> KpiValue {
        if range == WindowRange::Live {
            if metric.is_live() {
                return KpiValue::Live(self.live_value(metric, scope));
            }
            let value = self.windows(range).last().map_or(0.0, |window| {
                let counters = window.merged(|key| scope.accepts(key));
                self.window_value(metric, scope, window, &counters)
            });
            return KpiValue::Live(value);
        }
        let windows = self.windows(range);
        if metric == KpiMetric::HourlyEntries {
            return KpiValue::Histogram(self.hourly_entries(scope, &windows));
        }
        let points = windows
            .iter()
            .map(|window| {
                let counters = window.merged(|key| scope.accepts(key));
                KpiPoint {
                    window: window.id,
                    start_ms: window.start_ms,
                    value: self.window_value(metric, scope, window, &counters),
                    completeness: window.completeness,
                }
            })
            .collect();
        KpiValue::Series(points)
    }

    /// Hours whose entries exceed 1.5 x the mean of the hours that saw any entries.
    pub fn peak_hours(&self, scope: &Scope, range: WindowRange) -> Vec<u32> {
        let histogram = self.hourly_entries(scope, &self.windows(range));
        let busy: Vec<f64> = histogram.iter().map(|(_, v)| *v).filter(|v| *v > 0.0).collect();
        if busy.is_empty() {
            return Vec::new();
        }
        let mean = busy.iter().sum::<f64>() / busy.len() as f64;
        histogram
            .into_iter()
            .filter(|(_, entries)| *entries > mean * 1.5)
            .map(|(hour, _)| hour)
            .collect()
    }

    pub fn queue_length(&self, camera: &CameraId, zone: &ZoneId) -> usize {
        self.state
            .read()
            .live
            .queue_lengths
            .get(&(camera.clone(), zone.clone()))
            .copied()
            .unwrap_or(0)
    }

    fn live_value(&self, metric: KpiMetric, scope: &Scope) -> f64 {
        let state = self.state.read();
        let live = &state.live;
        match metric {
            KpiMetric::QueueLength => live
                .queue_lengths
                .iter()
                .filter(|((c, z), _)| scope.matches(c, Some(z)))
                .map(|(_, len)| *len as f64)
                .sum(),
            KpiMetric::Occupancy => live
                .occupancy
                .iter()
                .filter(|((c, z), _)| scope.matches(c, Some(z)))
                .map(|(_, n)| *n as f64)
                .sum(),
            KpiMetric::StaffOnDuty => live
                .staff_on_duty
                .iter()
                .filter(|(c, _)| scope.covers_camera(c))
                .map(|(_, n)| *n as f64)
                .sum(),
            _ => 0.0,
        }
    }

    fn window_value(&self, metric: KpiMetric, scope: &Scope, window: &KpiWindow, c: &ScopeCounters) -> f64 {
        let window_ms = window.duration_ms().max(1) as f64;
        match metric {
            KpiMetric::Entries | KpiMetric::HourlyEntries => c.crossed_in as f64,
            KpiMetric::Exits => c.crossed_out as f64,
            KpiMetric::Occupancy => c.occupancy_end.unwrap_or(0) as f64,
            KpiMetric::DwellCount => c.dwell.count as f64,
            KpiMetric::DwellMeanSecs => c.dwell.mean_secs(),
            KpiMetric::DwellMaxSecs => c.dwell.max_secs(),
            KpiMetric::QueueLength | KpiMetric::QueueLengthMax => c.queue_length_max as f64,
            KpiMetric::QueueLengthMean => c.queue_length_area_ms / window_ms,
            KpiMetric::QueueWaitMeanSecs => c.queue_wait.mean_secs(),
            KpiMetric::VehicleArrivals => c.vehicle_arrivals as f64,
            KpiMetric::ParkingUtilization => {
                let slots = self
                    .parking_slots
                    .iter()
                    .filter(|(camera, zone)| scope.matches(camera, Some(zone)))
                    .count();
                if slots == 0 {
                    0.0
                } else {
                    c.occupied_slot_ms / (slots as f64 * window_ms)
                }
            }
            KpiMetric::AttendanceSecs => c.attendance.total_ms as f64 / 1000.0,
            KpiMetric::StaffOnDuty => c.attendance.total_ms as f64 / window_ms,
            KpiMetric::HygieneEvents => c.hygiene_events() as f64,
            KpiMetric::HygieneComplianceRate => compliance(c.hygiene_events(), c.attendance_starts),
            KpiMetric::HygieneComplianceRateStrict => compliance(c.hygiene_pose_confirmed, c.attendance_starts),
            KpiMetric::ServiceEfficiency => {
                if c.attendance.total_ms == 0 {
                    0.0
                } else {
                    c.queue_length_area_ms / c.attendance.total_ms as f64
                }
            }
            KpiMetric::LateAttributed => window.late_attributed as f64,
        }
    }

    fn hourly_entries(&self, scope: &Scope, windows: &[Arc<KpiWindow>]) -> Vec<(u32, f64)> {
        let mut hours: BTreeMap<u32, f64> = BTreeMap::new();
        for window in windows {
            let entries = window.merged(|key| scope.accepts(key)).crossed_in as f64;
            *hours.entry(window.hour_of_day(self.epoch_unix_ms)).or_default() += entries;
        }
        hours.into_iter().collect()
    }

    pub fn window_ms(&self) -> Millis {
        self.window_ms
    }
}

fn compliance(washes: u64, shifts: u64) -> f64 {
    if shifts == 0 {
        return 0.0;
    }
    (washes as f64 / shifts as f64).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(id: WindowId, crossed_in: u64) -> Arc<KpiWindow> {
        let mut window = KpiWindow::new(id, 3_600_000);
        window.scope_mut(&CameraId::from("gate"), Some(&ZoneId::from("gate_line"))).crossed_in = crossed_in;
        window.finalize(true);
        Arc::new(window)
    }

    #[test]
    fn series_reports_each_window() {
        let query = KpiQuery::new(0, 3_600_000, Vec::new());
        query.publish_finalized(window(0, 4));
        query.publish_finalized(window(1, 6));
        let KpiValue::Series(points) = query.get_kpi(
            KpiMetric::Entries,
            &Scope::Camera(CameraId::from("gate")),
            WindowRange::All,
        ) else {
            panic!("entries are a series");
        };
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![4.0, 6.0]);
        assert!(points.iter().all(|p| p.completeness == Completeness::Complete));
    }

    #[test]
    fn range_selects_overlapping_windows() {
        let query = KpiQuery::new(0, 3_600_000, Vec::new());
        for id in 0..4 {
            query.publish_finalized(window(id, id));
        }
        assert_eq!(query.windows(WindowRange::between(3_600_000, 7_200_001)).len(), 2);
    }

    #[test]
    fn peak_hours_use_the_one_and_a_half_rule() {
        let query = KpiQuery::new(0, 3_600_000, Vec::new());
        query.publish_finalized(window(9, 10));
        query.publish_finalized(window(12, 40));
        query.publish_finalized(window(15, 10));
        assert_eq!(query.peak_hours(&Scope::All, WindowRange::All), vec![12]);
    }

    #[test]
    fn compliance_without_shifts_is_zero() {
        assert_eq!(compliance(3, 0), 0.0);
        assert_eq!(compliance(3, 2), 1.0);
        assert_eq!(compliance(1, 2), 0.5);
    }
}
