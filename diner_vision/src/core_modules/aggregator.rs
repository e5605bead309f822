// THEORY:
// The `KpiAggregator` folds the ordered event stream into fixed-granularity KPI windows.
// It runs on one logical task and is the only writer of `KpiWindow`.
//
// Key architectural principles:
// 1.  **Windows Close by Watermark**: A window stays open until the newest event time has
//     passed its end plus a short grace period. Then it is frozen, published as an
//     immutable snapshot, and never touched again.
// 2.  **Never Silently Discard**: An event for an already closed window is counted in the
//     next open window instead, and the receiving window records it as `late_attributed`.
// 3.  **Live State is Derived**: Queue length is the size of the queue corridor's member
//     set, staff on duty is the number of tracklets with an open attendance interval,
//     occupancy is IN minus OUT. None of them is a counter that can drift. Time-weighted
//     gauges (mean queue length, parking utilization) are integrated from that state as
//     event time advances.
// 4.  **Every START Gets an END**: Durations are measured only when an interval ends. When
//     a tracklet closes with an interval still open, the aggregator forces a synthetic END
//     at the tracklet's last sighting, flagged `truncated`, and applies it ahead of the
//     closure. Persisted in that order, the END is replayed like any other event and the
//     closure finds nothing left to force.
// 5.  **Deterministic**: Applying the same event sequence to a fresh aggregator produces the
//     same windows. Each window also records the live state it opened with, so its own
//     events replayed on top of that state rebuild it alone. No wall-clock time is read.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::{AggregatorConfig, EngineConfig};
use crate::core_modules::alerts::{Alert, AlertMonitor};
use crate::core_modules::event::{DomainEvent, EventKind, EventMeta, HygieneConfidence};
use crate::core_modules::geometry::CrossingDirection;
use crate::core_modules::kpi_query::{KpiQuery, LiveView};
use crate::core_modules::kpi_window::{
    Completeness, IntervalKind, KpiWindow, OpenInterval, OpeningState, WindowId, ZoneMembers,
};
use crate::core_modules::observation::{CameraId, EntityClass, Millis, ZoneId};
use crate::core_modules::tracklet::TrackletId;
use crate::core_modules::zone::ZoneRole;
use crate::error::VisionError;

/// What one `apply` produced besides counter updates.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// The window the event was counted in.
    pub window: WindowId,
    /// Truncated ENDs forced by a tracklet closure, each with the window it was counted
    /// in. They were applied before the closure itself.
    pub synthetic: Vec<(WindowId, DomainEvent)>,
    /// Windows frozen as a result of this event.
    pub finalized: Vec<Arc<KpiWindow>>,
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Clone)]
struct Membership {
    role: ZoneRole,
    members: BTreeSet<TrackletId>,
}

type Intervals = BTreeMap<(CameraId, TrackletId), Vec<OpenInterval>>;

pub struct KpiAggregator {
    config: AggregatorConfig,
    window_ms: Millis,
    open: BTreeMap<WindowId, KpiWindow>,
    closed_through: Option<WindowId>,
    /// Newest event time applied.
    watermark: Millis,
    /// Event time the time-weighted gauges have been integrated up to.
    clock_ms: Option<Millis>,
    memberships: BTreeMap<(CameraId, ZoneId), Membership>,
    occupancy: BTreeMap<(CameraId, ZoneId), i64>,
    intervals: Intervals,
    /// Off when replaying a log that already holds the forced ENDs.
    synthesize_ends: bool,
    monitor: AlertMonitor,
    query: KpiQuery,
}

impl KpiAggregator {
    pub fn new(config: &EngineConfig) -> Self {
        let parking_slots = config
            .cameras
            .iter()
            .flat_map(|camera| {
                camera
                    .zones
                    .iter()
                    .filter(|zone| zone.role == ZoneRole::ParkingSlot)
                    .map(|zone| (camera.id.clone(), zone.id.clone()))
            })
            .collect();
        let window_ms = config.aggregator.window_ms();
        Self {
            config: config.aggregator.clone(),
            window_ms,
            open: BTreeMap::new(),
            closed_through: None,
            watermark: 0,
            clock_ms: None,
            memberships: BTreeMap::new(),
            occupancy: BTreeMap::new(),
            intervals: BTreeMap::new(),
            synthesize_ends: true,
            monitor: AlertMonitor::new(config.alerts.clone()),
            query: KpiQuery::new(config.aggregator.epoch_unix_ms, window_ms, parking_slots),
        }
    }

    /// An aggregator for a persisted log. The log already carries every forced END, so
    /// closures apply as plain markers.
    pub fn replaying(config: &EngineConfig) -> Self {
        Self {
            synthesize_ends: false,
            ..Self::new(config)
        }
    }

    /// Rebuilds one window from the state it opened with and the events counted in it,
    /// in the order they were applied. Returns `None` when `window` was never finalized.
    pub fn replay_window(config: &EngineConfig, window: &KpiWindow, events: &[DomainEvent]) -> Option<KpiWindow> {
        if !window.finalized {
            return None;
        }
        let mut aggregator = Self::replaying(config);
        aggregator.resume(window.id, &window.opening);
        for event in events {
            aggregator.apply(event);
        }
        aggregator.integrate_to(window.gauged_through_ms);
        let reached_end = window.completeness != Completeness::Partial;
        let rebuilt = aggregator.finalize_window(window.id, reached_end)?;
        Some((*rebuilt).clone())
    }

    /// Restores the live state window `id` opened with. Earlier windows count as closed.
    fn resume(&mut self, id: WindowId, opening: &OpeningState) {
        self.closed_through = id.checked_sub(1);
        self.clock_ms = Some(opening.clock_ms);
        self.watermark = opening.clock_ms;
        self.memberships = opening
            .members
            .iter()
            .map(|zone| {
                let membership = Membership {
                    role: zone.role,
                    members: zone.members.iter().copied().collect(),
                };
                ((zone.camera.clone(), zone.zone.clone()), membership)
            })
            .collect();
        self.occupancy = opening
            .occupancy
            .iter()
            .map(|(camera, zone, occupancy)| ((camera.clone(), zone.clone()), *occupancy))
            .collect();
        self.intervals = BTreeMap::new();
        for (camera, tracklet, interval) in &opening.intervals {
            self.intervals
                .entry((camera.clone(), *tracklet))
                .or_default()
                .push(interval.clone());
        }
        self.monitor.restore(&opening.alerts);
        self.open.clear();
        self.open.insert(id, KpiWindow::opened(id, self.window_ms, opening.clone()));
    }

    /// A read-only handle for concurrent viewers.
    pub fn query(&self) -> KpiQuery {
        self.query.clone()
    }

    pub fn apply(&mut self, event: &DomainEvent) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        if event.kind == EventKind::TrackletClosed && self.synthesize_ends {
            // Applied exactly as a replay of the persisted log will apply them.
            for synthetic in self.synthesize_ends(event) {
                let window = self.advance_with(&synthetic, &mut outcome);
                outcome.synthetic.push((window, synthetic));
            }
        }
        outcome.window = self.advance_with(event, &mut outcome);
        outcome
    }

    fn advance_with(&mut self, event: &DomainEvent, outcome: &mut ApplyOutcome) -> WindowId {
        self.integrate_to(event.timestamp_ms);
        self.watermark = self.watermark.max(event.timestamp_ms);
        let window = self.apply_one(event, outcome);
        self.finalize_ready(&mut outcome.finalized);
        window
    }

    /// Moves event time forward without an event, closing windows that are due.
    pub fn advance_to(&mut self, now_ms: Millis) -> Vec<Arc<KpiWindow>> {
        self.integrate_to(now_ms);
        self.watermark = self.watermark.max(now_ms);
        let mut finalized = Vec::new();
        self.finalize_ready(&mut finalized);
        finalized
    }

    /// Freezes every open window. Used at shutdown.
    pub fn finalize_all(&mut self) -> Vec<Arc<KpiWindow>> {
        let clock = self.clock_ms.unwrap_or(0);
        let ids: Vec<WindowId> = self.open.keys().copied().collect();
        let mut finalized = Vec::with_capacity(ids.len());
        for id in ids {
            let reached_end = (id + 1) * self.window_ms <= clock;
            if let Some(window) = self.finalize_window(id, reached_end) {
                finalized.push(window);
            }
        }
        self.publish();
        finalized
    }

    /// Copies open windows and live gauges into the query store.
    pub fn publish(&self) {
        let open = self
            .open
            .iter()
            .map(|(id, window)| (*id, Arc::new(window.clone())))
            .collect();
        self.query.publish_open(open, self.live_view());
    }

    /// Pure read of one window: the frozen snapshot, or a copy of the open window.
    pub fn snapshot(&self, id: WindowId) -> Option<KpiWindow> {
        self.open
            .get(&id)
            .cloned()
            .or_else(|| self.query.snapshot(id).map(|window| (*window).clone()))
    }

    pub fn open_windows(&self) -> impl Iterator<Item = &KpiWindow> {
        self.open.values()
    }

    /// Tracklets currently inside the zone. Derived, never stored as a count.
    pub fn queue_length(&self, camera: &CameraId, zone: &ZoneId) -> usize {
        self.memberships
            .get(&(camera.clone(), zone.clone()))
            .map_or(0, |m| m.members.len())
    }

    /// Tracklets with at least one open attendance interval on the camera.
    pub fn staff_on_duty(&self, camera: &CameraId) -> usize {
        on_duty(&self.intervals, camera)
    }

    pub fn open_intervals(&self) -> usize {
        self.intervals.values().map(Vec::len).sum()
    }

    pub fn live_view(&self) -> LiveView {
        let mut live = LiveView {
            as_of_ms: self.watermark,
            ..LiveView::default()
        };
        for (key, membership) in &self.memberships {
            match membership.role {
                ZoneRole::QueueCorridor => {
                    live.queue_lengths.insert(key.clone(), membership.members.len());
                }
                ZoneRole::ParkingSlot => {
                    live.occupied_slots.insert(key.clone(), !membership.members.is_empty());
                }
                _ => {}
            }
        }
        live.occupancy = self.occupancy.clone();
        for ((camera, _), open) in &self.intervals {
            if open.iter().any(|interval| interval.kind == IntervalKind::Attendance) {
                *live.staff_on_duty.entry(camera.clone()).or_default() += 1;
            }
        }
        live
    }

    // --- 1. Event Application ---

    fn apply_one(&mut self, event: &DomainEvent, outcome: &mut ApplyOutcome) -> WindowId {
        let natural = event.timestamp_ms / self.window_ms;
        let id = match self.closed_through {
            Some(closed) if natural <= closed => {
                let redirect = VisionError::WindowClosed {
                    window: natural,
                    redirected_to: closed + 1,
                };
                warn!("{} {} for {}: {redirect}", event.camera, event.kind.as_str(), event.tracklet);
                closed + 1
            }
            _ => natural,
        };
        self.ensure_window(id);
        let Some(window) = self.open.get_mut(&id) else {
            return id;
        };
        if id != natural {
            window.late_attributed += 1;
        }
        window.events_applied += 1;
        if event.meta.late {
            window.late_events += 1;
        }

        let camera = &event.camera;
        let zone = event.zone.as_ref();
        let now = event.timestamp_ms;
        let mut raised: Vec<Alert> = Vec::new();

        match event.kind {
            EventKind::EnteredZone => {
                let counters = window.scope_mut(camera, zone);
                counters.entered += 1;
                if event.zone_role == Some(ZoneRole::ParkingSlot) && event.class == EntityClass::Vehicle {
                    counters.vehicle_arrivals += 1;
                }
                if let (Some(zone), Some(role)) = (zone, event.zone_role) {
                    let membership = self
                        .memberships
                        .entry((camera.clone(), zone.clone()))
                        .or_insert_with(|| Membership {
                            role,
                            members: BTreeSet::new(),
                        });
                    membership.members.insert(event.tracklet);
                    if role == ZoneRole::QueueCorridor {
                        let length = membership.members.len();
                        counters.queue_length_max = counters.queue_length_max.max(length);
                        raised.extend(self.monitor.check_queue(camera, zone, length, now));
                    }
                }
            }
            EventKind::ExitedZone => {
                window.scope_mut(camera, zone).exited += 1;
                if let Some(zone) = zone {
                    if let Some(membership) = self.memberships.get_mut(&(camera.clone(), zone.clone())) {
                        membership.members.remove(&event.tracklet);
                        if membership.role == ZoneRole::QueueCorridor {
                            let length = membership.members.len();
                            raised.extend(self.monitor.check_queue(camera, zone, length, now));
                        }
                    }
                }
            }
            EventKind::CrossedLine => {
                let counters = window.scope_mut(camera, zone);
                let delta = match event.meta.direction {
                    Some(CrossingDirection::In) => {
                        counters.crossed_in += 1;
                        1
                    }
                    Some(CrossingDirection::Out) => {
                        counters.crossed_out += 1;
                        -1
                    }
                    None => 0,
                };
                if let Some(zone) = zone {
                    let occupancy = self.occupancy.entry((camera.clone(), zone.clone())).or_insert(0);
                    *occupancy = (*occupancy + delta).max(0);
                    counters.occupancy_end = Some(*occupancy);
                }
            }
            EventKind::DwellStart | EventKind::AttendanceStart => {
                let kind = if event.kind == EventKind::DwellStart {
                    IntervalKind::Dwell
                } else {
                    IntervalKind::Attendance
                };
                if let (Some(zone), Some(role)) = (zone, event.zone_role) {
                    self.intervals
                        .entry((camera.clone(), event.tracklet))
                        .or_default()
                        .push(OpenInterval {
                            kind,
                            zone: zone.clone(),
                            role,
                            started_ms: event.meta.started_ms.unwrap_or(now),
                        });
                }
                if kind == IntervalKind::Attendance {
                    window.scope_mut(camera, zone).attendance_starts += 1;
                    let count = on_duty(&self.intervals, camera);
                    raised.extend(self.monitor.check_staff(camera, count, false, now));
                }
            }
            EventKind::DwellEnd | EventKind::AttendanceEnd => {
                let kind = if event.kind == EventKind::DwellEnd {
                    IntervalKind::Dwell
                } else {
                    IntervalKind::Attendance
                };
                let opened = take_interval(&mut self.intervals, camera, event.tracklet, kind, zone);
                let started = opened
                    .map(|interval| interval.started_ms)
                    .or(event.meta.started_ms)
                    .unwrap_or(now);
                let duration = event.meta.duration_ms.unwrap_or_else(|| now.saturating_sub(started));
                let truncated = event.meta.truncated;
                if truncated {
                    window.truncated_ends += 1;
                }

                let counters = window.scope_mut(camera, zone);
                if kind == IntervalKind::Dwell {
                    counters.dwell.record(duration, truncated);
                    if event.zone_role == Some(ZoneRole::QueueCorridor) {
                        counters.queue_wait.record(duration, truncated);
                    }
                } else {
                    counters.attendance.record(duration, truncated);
                    // Still on duty while another work area's shift is open.
                    let count = on_duty(&self.intervals, camera);
                    raised.extend(self.monitor.check_staff(camera, count, true, now));
                }
            }
            EventKind::HygieneEvent => {
                let counters = window.scope_mut(camera, zone);
                match event.meta.hygiene {
                    Some(HygieneConfidence::PoseConfirmed) => counters.hygiene_pose_confirmed += 1,
                    _ => counters.hygiene_presence_only += 1,
                }
            }
            EventKind::TrackletClosed => {
                window.scope_mut(camera, None).tracklets_closed += 1;
                for ((member_camera, _), membership) in self.memberships.iter_mut() {
                    if member_camera == camera {
                        membership.members.remove(&event.tracklet);
                    }
                }
            }
        }

        for alert in raised {
            debug!("alert raised: {}", alert.message);
            window.push_alert(alert.clone());
            outcome.alerts.push(alert);
        }
        id
    }

    /// One truncated END per interval the closed tracklet left open. Applying them consumes
    /// the intervals.
    fn synthesize_ends(&self, closed: &DomainEvent) -> Vec<DomainEvent> {
        let Some(open) = self.intervals.get(&(closed.camera.clone(), closed.tracklet)) else {
            return Vec::new();
        };
        let last_seen = closed.meta.last_seen_ms.unwrap_or(closed.timestamp_ms);
        open.iter()
            .map(|interval| {
                let kind = match interval.kind {
                    IntervalKind::Dwell => EventKind::DwellEnd,
                    IntervalKind::Attendance => EventKind::AttendanceEnd,
                };
                debug!(
                    "{} {} closed inside {}; forcing a truncated {}",
                    closed.camera,
                    closed.tracklet,
                    interval.zone,
                    kind.as_str()
                );
                let mut synthetic = DomainEvent::new(kind, closed.camera.clone(), closed.tracklet, closed.class, last_seen)
                    .in_zone(&interval.zone, interval.role)
                    .with_meta(EventMeta {
                        duration_ms: Some(last_seen.saturating_sub(interval.started_ms)),
                        started_ms: Some(interval.started_ms),
                        last_seen_ms: Some(last_seen),
                        truncated: true,
                        late: closed.meta.late,
                        ..EventMeta::default()
                    });
                synthetic.seq = closed.seq;
                synthetic
            })
            .collect()
    }

    // --- 2. Time-Weighted Gauges ---

    fn integrate_to(&mut self, now_ms: Millis) {
        let Some(from) = self.clock_ms else {
            self.clock_ms = Some(now_ms);
            return;
        };
        if now_ms <= from {
            return;
        }
        let gauged = |membership: &Membership| {
            !membership.members.is_empty()
                && matches!(membership.role, ZoneRole::QueueCorridor | ZoneRole::ParkingSlot)
        };
        if self.memberships.values().any(gauged) {
            let (first, last) = (from / self.window_ms, (now_ms - 1) / self.window_ms);
            for id in first..=last {
                if !self.closed_through.is_some_and(|closed| id <= closed) {
                    self.ensure_window(id);
                }
            }
        }
        for ((camera, zone), membership) in &self.memberships {
            if !gauged(membership) {
                continue;
            }
            let length = membership.members.len();
            let mut start = from;
            while start < now_ms {
                let id = start / self.window_ms;
                let end = ((id + 1) * self.window_ms).min(now_ms);
                let span = (end - start) as f64;
                start = end;
                let Some(window) = self.open.get_mut(&id) else {
                    continue;
                };
                let counters = window.scope_mut(camera, Some(zone));
                if membership.role == ZoneRole::QueueCorridor {
                    counters.queue_length_area_ms += length as f64 * span;
                    counters.queue_length_max = counters.queue_length_max.max(length);
                } else {
                    counters.occupied_slot_ms += span;
                }
            }
        }
        self.clock_ms = Some(now_ms);
    }

    // --- 3. Window Lifecycle ---

    /// Opens window `id` if it is not open yet, recording the live state it starts from.
    fn ensure_window(&mut self, id: WindowId) {
        if self.open.contains_key(&id) {
            return;
        }
        let start = id * self.window_ms;
        let opening = OpeningState {
            clock_ms: self.clock_ms.map_or(start, |clock| clock.max(start)),
            members: self
                .memberships
                .iter()
                .filter(|(_, membership)| !membership.members.is_empty())
                .map(|((camera, zone), membership)| ZoneMembers {
                    camera: camera.clone(),
                    zone: zone.clone(),
                    role: membership.role,
                    members: membership.members.iter().copied().collect(),
                })
                .collect(),
            occupancy: self
                .occupancy
                .iter()
                .map(|((camera, zone), occupancy)| (camera.clone(), zone.clone(), *occupancy))
                .collect(),
            intervals: self
                .intervals
                .iter()
                .flat_map(|((camera, tracklet), open)| {
                    open.iter().map(move |interval| (camera.clone(), *tracklet, interval.clone()))
                })
                .collect(),
            alerts: self.monitor.state(),
        };
        debug!("window {id} opened at {}", opening.clock_ms);
        self.open.insert(id, KpiWindow::opened(id, self.window_ms, opening));
    }

    fn finalize_ready(&mut self, finalized: &mut Vec<Arc<KpiWindow>>) {
        let grace = self.config.close_grace_ms;
        let ready: Vec<WindowId> = self
            .open
            .values()
            .filter(|window| window.end_ms.saturating_add(grace) <= self.watermark)
            .map(|window| window.id)
            .collect();
        for id in ready {
            if let Some(window) = self.finalize_window(id, true) {
                finalized.push(window);
            }
        }
    }

    fn finalize_window(&mut self, id: WindowId, reached_end: bool) -> Option<Arc<KpiWindow>> {
        let mut window = self.open.remove(&id)?;
        let clock = self.clock_ms.unwrap_or(window.start_ms);
        window.gauged_through_ms = clock.clamp(window.start_ms, window.end_ms);
        window.finalize(reached_end);
        self.closed_through = Some(self.closed_through.map_or(id, |closed| closed.max(id)));
        info!(
            "window {} ({}) finalized: {} events, {:?}",
            window.id,
            window.label(self.config.epoch_unix_ms),
            window.events_applied,
            window.completeness
        );
        let window = Arc::new(window);
        self.query.publish_finalized(Arc::clone(&window));
        Some(window)
    }
}

fn on_duty(intervals: &Intervals, camera: &CameraId) -> usize {
    intervals
        .iter()
        .filter(|((on, _), open)| {
            on == camera && open.iter().any(|interval| interval.kind == IntervalKind::Attendance)
        })
        .count()
}

fn take_interval(
    intervals: &mut Intervals,
    camera: &CameraId,
    tracklet: TrackletId,
    kind: IntervalKind,
    zone: Option<&ZoneId>,
) -> Option<OpenInterval> {
    let key = (camera.clone(), tracklet);
    let open = intervals.get_mut(&key)?;
    let position = open
        .iter()
        .position(|interval| interval.kind == kind && Some(&interval.zone) == zone)?;
    let interval = open.remove(position);
    if open.is_empty() {
        intervals.remove(&key);
    }
    Some(interval)
}
