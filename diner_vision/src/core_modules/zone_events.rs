// THEORY:
// The `zone_events` module turns the continuous stream of tracklet deltas into a discrete
// narrative of business events. It is the only owner of zone-membership state: for every
// (tracklet, zone) pair it runs a small `OUTSIDE -> INSIDE -> OUTSIDE` machine.
//
// Key architectural principles:
// 1.  **Visits, Not Frames**: Entering opens a visit, leaving closes it. Each visit emits
//     exactly one ENTERED_ZONE and at most one EXITED_ZONE; a re-entry is a new visit.
// 2.  **Role-Driven Semantics**: What a visit means depends on the zone role. Dwell zones
//     add DWELL_START once the minimum dwell has elapsed and DWELL_END on exit; work areas
//     bracket staff attendance; the sink area turns a long enough visit into a
//     HYGIENE_EVENT whose confidence depends on whether a wrist was seen in the sink.
//     Line zones have no visits at all, only directional CROSSED_LINE events.
// 3.  **Closure is Not Exit**: When a tracklet closes while still inside a zone, the visit
//     ends with a `truncated` EXITED_ZONE measured to the last sighting, followed by a
//     TRACKLET_CLOSED marker. Open dwell and attendance intervals are left for the
//     aggregator to end synthetically, so truncation is decided in exactly one place.
// 4.  **Confirmed Only**: Tentative tracklets never produce events. Promotion hands over
//     the tentative path, so a crossing made before confirmation still counts and a visit
//     starts when the tracklet first stood inside, not when it was confirmed.

use std::collections::{BTreeMap, HashMap};

use log::trace;

use crate::config::{CameraConfig, HygieneConfig};
use crate::core_modules::event::{DomainEvent, EventKind, EventMeta, HygieneConfidence};
use crate::core_modules::observation::{CameraId, Millis, ZoneId};
use crate::core_modules::tracker::{DeltaKind, TrackletDelta};
use crate::core_modules::tracklet::TrackletId;
use crate::core_modules::zone::{Zone, ZoneRole, zones_from_config};
use crate::error::Result;

/// An open visit of one tracklet to one area zone.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Visit {
    entered_ms: Millis,
    dwell_started: bool,
    pose_seen: bool,
}

pub struct ZoneEventDetector {
    camera: CameraId,
    zones: Vec<Zone>,
    min_wash_ms: Millis,
    min_keypoint_confidence: f64,
    /// Open visits per tracklet, keyed by zone index.
    visits: HashMap<TrackletId, BTreeMap<usize, Visit>>,
}

impl ZoneEventDetector {
    pub fn new(camera: &CameraConfig, hygiene: &HygieneConfig) -> Result<Self> {
        Ok(Self {
            camera: camera.id.clone(),
            zones: zones_from_config(&camera.zones)?,
            min_wash_ms: (hygiene.min_wash_secs * 1000.0).round() as Millis,
            min_keypoint_confidence: hygiene.min_keypoint_confidence,
            visits: HashMap::new(),
        })
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Zones the tracklet is currently inside.
    pub fn inside(&self, tracklet: TrackletId) -> Vec<&ZoneId> {
        self.visits
            .get(&tracklet)
            .map(|open| open.keys().map(|&i| &self.zones[i].id).collect())
            .unwrap_or_default()
    }

    pub fn open_visits(&self) -> usize {
        self.visits.values().map(BTreeMap::len).sum()
    }

    /// Consumes one frame's deltas, in order, and returns the events they produce.
    pub fn process(&mut self, deltas: &[TrackletDelta]) -> Vec<DomainEvent> {
        let mut events = Vec::new();
        for delta in deltas {
            match delta.kind {
                _ if delta.is_observed() => self.observe(delta, &mut events),
                DeltaKind::Closed(_) => self.close(delta, &mut events),
                _ => {}
            }
        }
        events
    }

    fn observe(&mut self, delta: &TrackletDelta, events: &mut Vec<DomainEvent>) {
        let now = delta.timestamp_ms;
        for (index, zone) in self.zones.iter().enumerate() {
            if !zone.role.admits(delta.class) {
                continue;
            }

            if zone.role.is_line() {
                for (previous, current) in delta.steps() {
                    if let Some(direction) = zone.crossing(&previous, &current) {
                        events.push(self.event(EventKind::CrossedLine, delta, zone, now).with_meta(
                            EventMeta {
                                direction: Some(direction),
                                ..EventMeta::default()
                            },
                        ));
                    }
                }
                continue;
            }

            let inside = zone.contains(&delta.footprint);
            let open = self.visits.entry(delta.id).or_default();
            match (inside, open.get(&index).copied()) {
                (true, None) => {
                    let entered_ms = inside_since(delta, zone);
                    let mut visit = Visit {
                        entered_ms,
                        dwell_started: false,
                        pose_seen: false,
                    };
                    trace!("[{}] {} entered {}", self.camera, delta.id, zone.id);
                    let since = EventMeta {
                        started_ms: Some(entered_ms),
                        ..EventMeta::default()
                    };
                    events.push(self.event(EventKind::EnteredZone, delta, zone, now).with_meta(since.clone()));
                    if zone.role.tracks_attendance() {
                        events.push(self.event(EventKind::AttendanceStart, delta, zone, now).with_meta(since));
                    }
                    self.advance_visit(&mut visit, zone, delta, events);
                    self.visits.entry(delta.id).or_default().insert(index, visit);
                }
                (true, Some(mut visit)) => {
                    self.advance_visit(&mut visit, zone, delta, events);
                    self.visits.entry(delta.id).or_default().insert(index, visit);
                }
                (false, Some(visit)) => {
                    if let Some(open) = self.visits.get_mut(&delta.id) {
                        open.remove(&index);
                    }
                    trace!("[{}] {} left {}", self.camera, delta.id, zone.id);
                    self.end_visit(&visit, zone, delta, now, events);
                }
                (false, None) => {}
            }
        }
        if self.visits.get(&delta.id).is_some_and(BTreeMap::is_empty) {
            self.visits.remove(&delta.id);
        }
    }

    /// Dwell start and pose evidence for a tracklet observed inside a zone.
    fn advance_visit(&self, visit: &mut Visit, zone: &Zone, delta: &TrackletDelta, events: &mut Vec<DomainEvent>) {
        let now = delta.timestamp_ms;
        if zone.role.tracks_dwell()
            && !visit.dwell_started
            && now.saturating_sub(visit.entered_ms) >= zone.min_dwell_ms
        {
            visit.dwell_started = true;
            events.push(self.event(EventKind::DwellStart, delta, zone, now).with_meta(EventMeta {
                started_ms: Some(visit.entered_ms),
                ..EventMeta::default()
            }));
        }
        if zone.role == ZoneRole::SinkArea && !visit.pose_seen {
            visit.pose_seen = delta.pose.as_ref().is_some_and(|pose| {
                pose.wrists(self.min_keypoint_confidence)
                    .iter()
                    .any(|wrist| zone.contains(wrist))
            });
        }
    }

    fn end_visit(
        &self,
        visit: &Visit,
        zone: &Zone,
        delta: &TrackletDelta,
        now: Millis,
        events: &mut Vec<DomainEvent>,
    ) {
        let duration = now.saturating_sub(visit.entered_ms);
        let interval = EventMeta {
            duration_ms: Some(duration),
            started_ms: Some(visit.entered_ms),
            ..EventMeta::default()
        };
        events.push(self.event(EventKind::ExitedZone, delta, zone, now).with_meta(interval.clone()));
        if visit.dwell_started {
            events.push(self.event(EventKind::DwellEnd, delta, zone, now).with_meta(interval.clone()));
        }
        if zone.role.tracks_attendance() {
            events.push(self.event(EventKind::AttendanceEnd, delta, zone, now).with_meta(interval.clone()));
        }
        if let Some(hygiene) = self.hygiene_event(visit, zone, delta, now, duration, false) {
            events.push(hygiene);
        }
    }

    fn close(&mut self, delta: &TrackletDelta, events: &mut Vec<DomainEvent>) {
        let now = delta.timestamp_ms;
        let last_seen = delta.last_seen_ms;
        if let Some(open) = self.visits.remove(&delta.id) {
            for (index, visit) in open {
                let zone = &self.zones[index];
                let duration = last_seen.saturating_sub(visit.entered_ms);
                events.push(self.event(EventKind::ExitedZone, delta, zone, now).with_meta(EventMeta {
                    duration_ms: Some(duration),
                    started_ms: Some(visit.entered_ms),
                    last_seen_ms: Some(last_seen),
                    truncated: true,
                    ..EventMeta::default()
                }));
                if let Some(hygiene) = self.hygiene_event(&visit, zone, delta, now, duration, true) {
                    events.push(hygiene);
                }
            }
        }

        let mut closed = DomainEvent::new(EventKind::TrackletClosed, self.camera.clone(), delta.id, delta.class, now);
        closed.meta.last_seen_ms = Some(last_seen);
        closed.meta.started_ms = Some(delta.first_seen_ms);
        events.push(closed);
    }

    fn hygiene_event(
        &self,
        visit: &Visit,
        zone: &Zone,
        delta: &TrackletDelta,
        now: Millis,
        duration: Millis,
        truncated: bool,
    ) -> Option<DomainEvent> {
        if zone.role != ZoneRole::SinkArea || duration < self.min_wash_ms {
            return None;
        }
        let confidence = if visit.pose_seen {
            HygieneConfidence::PoseConfirmed
        } else {
            HygieneConfidence::PresenceOnly
        };
        Some(self.event(EventKind::HygieneEvent, delta, zone, now).with_meta(EventMeta {
            duration_ms: Some(duration),
            started_ms: Some(visit.entered_ms),
            hygiene: Some(confidence),
            truncated,
            ..EventMeta::default()
        }))
    }

    fn event(&self, kind: EventKind, delta: &TrackletDelta, zone: &Zone, now: Millis) -> DomainEvent {
        DomainEvent::new(kind, self.camera.clone(), delta.id, delta.class, now).in_zone(&zone.id, zone.role)
    }
}

/// Start of the unbroken run of tentative footprints inside `zone` that ends at this delta.
/// Deltas without a path entered at their own timestamp.
fn inside_since(delta: &TrackletDelta, zone: &Zone) -> Millis {
    delta
        .path
        .iter()
        .rev()
        .take_while(|(_, footprint)| zone.contains(footprint))
        .last()
        .map_or(delta.timestamp_ms, |&(at, _)| at)
}
