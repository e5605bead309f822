// THEORY:
// A `DomainEvent` is the business-level fact produced from trajectories: "tracklet 7
// entered the queue corridor at 10s". Events are immutable once emitted. Everything
// downstream of the zone detector (the bus, the aggregator, the sink) speaks only in
// events, which is what makes an event log replayable into identical KPIs.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::core_modules::geometry::CrossingDirection;
use crate::core_modules::observation::{CameraId, EntityClass, Millis, ZoneId};
use crate::core_modules::tracklet::TrackletId;
use crate::core_modules::zone::ZoneRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    EnteredZone,
    ExitedZone,
    CrossedLine,
    DwellStart,
    DwellEnd,
    AttendanceStart,
    AttendanceEnd,
    HygieneEvent,
    /// A tracklet reached its terminal state. Carries `last_seen_ms`.
    TrackletClosed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::EnteredZone => "ENTERED_ZONE",
            EventKind::ExitedZone => "EXITED_ZONE",
            EventKind::CrossedLine => "CROSSED_LINE",
            EventKind::DwellStart => "DWELL_START",
            EventKind::DwellEnd => "DWELL_END",
            EventKind::AttendanceStart => "ATTENDANCE_START",
            EventKind::AttendanceEnd => "ATTENDANCE_END",
            EventKind::HygieneEvent => "HYGIENE_EVENT",
            EventKind::TrackletClosed => "TRACKLET_CLOSED",
        }
    }
}

/// How a hand-wash was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HygieneConfidence {
    /// Sink dwell plus a wrist keypoint inside the sink area.
    PoseConfirmed,
    /// Sink dwell alone.
    PresenceOnly,
}

/// Derived metadata. Which fields are set depends on the event kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Time inside, on EXITED_ZONE / DWELL_END / ATTENDANCE_END / HYGIENE_EVENT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<Millis>,
    /// Start of the interval an END closes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_ms: Option<Millis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<CrossingDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hygiene: Option<HygieneConfidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_ms: Option<Millis>,
    /// The interval was cut short by the tracklet closing rather than observed to end.
    #[serde(default)]
    pub truncated: bool,
    /// Arrived behind the sequencer's release horizon.
    #[serde(default)]
    pub late: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Assigned by the event bus; zero until submitted.
    #[serde(default)]
    pub seq: u64,
    pub kind: EventKind,
    pub camera: CameraId,
    pub tracklet: TrackletId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<ZoneId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_role: Option<ZoneRole>,
    pub class: EntityClass,
    pub timestamp_ms: Millis,
    #[serde(default)]
    pub meta: EventMeta,
}

impl DomainEvent {
    pub fn new(
        kind: EventKind,
        camera: CameraId,
        tracklet: TrackletId,
        class: EntityClass,
        timestamp_ms: Millis,
    ) -> Self {
        Self {
            seq: 0,
            kind,
            camera,
            tracklet,
            zone: None,
            zone_role: None,
            class,
            timestamp_ms,
            meta: EventMeta::default(),
        }
    }

    pub fn in_zone(mut self, zone: &ZoneId, role: ZoneRole) -> Self {
        self.zone = Some(zone.clone());
        self.zone_role = Some(role);
        self
    }

    pub fn with_meta(mut self, meta: EventMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Timeline order: timestamp, then camera id, then sequence number.
    pub fn order_key(&self) -> (Millis, &CameraId, u64) {
        (self.timestamp_ms, &self.camera, self.seq)
    }

    pub fn cmp_order(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}
