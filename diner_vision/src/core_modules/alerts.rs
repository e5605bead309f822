// THEORY:
// Operational alerts raised by the aggregator as it applies events: a queue that has grown
// too long, or a kitchen that has fallen below its minimum staffing. An alert fires on the
// transition across its threshold, not on every event while the condition holds, and is
// re-armed once the condition clears.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::AlertThresholds;
use crate::core_modules::observation::{CameraId, Millis, ZoneId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    QueueTooLong,
    UnderStaffed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub camera: CameraId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<ZoneId>,
    pub severity: Severity,
    pub message: String,
    pub timestamp_ms: Millis,
    /// The measured value that crossed the threshold.
    pub value: f64,
    pub threshold: f64,
}

/// Which thresholds are currently breached. An alert fires only on entering this set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub long_queues: Vec<(CameraId, ZoneId)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub understaffed: Vec<CameraId>,
}

/// Edge-triggered threshold checks.
#[derive(Debug, Clone)]
pub struct AlertMonitor {
    thresholds: AlertThresholds,
    long_queues: BTreeSet<(CameraId, ZoneId)>,
    understaffed: BTreeSet<CameraId>,
}

impl AlertMonitor {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            long_queues: BTreeSet::new(),
            understaffed: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> AlertState {
        AlertState {
            long_queues: self.long_queues.iter().cloned().collect(),
            understaffed: self.understaffed.iter().cloned().collect(),
        }
    }

    pub fn restore(&mut self, state: &AlertState) {
        self.long_queues = state.long_queues.iter().cloned().collect();
        self.understaffed = state.understaffed.iter().cloned().collect();
    }

    /// Called whenever a queue's length changes.
    pub fn check_queue(&mut self, camera: &CameraId, zone: &ZoneId, length: usize, timestamp_ms: Millis) -> Option<Alert> {
        let max = self.thresholds.max_queue_length;
        let key = (camera.clone(), zone.clone());
        if length <= max {
            self.long_queues.remove(&key);
            return None;
        }
        if !self.long_queues.insert(key) {
            return None;
        }
        let severity = if length >= max * 2 {
            Severity::High
        } else {
            Severity::Medium
        };
        Some(Alert {
            kind: AlertKind::QueueTooLong,
            camera: camera.clone(),
            zone: Some(zone.clone()),
            severity,
            message: format!("Queue length {length} exceeds threshold {max}"),
            timestamp_ms,
            value: length as f64,
            threshold: max as f64,
        })
    }

    /// Called after a staff member starts or ends attendance. Only an END can raise.
    pub fn check_staff(&mut self, camera: &CameraId, on_duty: usize, ended: bool, timestamp_ms: Millis) -> Option<Alert> {
        let min = self.thresholds.min_staff_count;
        if on_duty >= min {
            self.understaffed.remove(camera);
            return None;
        }
        if !ended || !self.understaffed.insert(camera.clone()) {
            return None;
        }
        let severity = if on_duty == 0 {
            Severity::Critical
        } else {
            Severity::High
        };
        Some(Alert {
            kind: AlertKind::UnderStaffed,
            camera: camera.clone(),
            zone: None,
            severity,
            message: format!("Staff count {on_duty} below minimum {min}"),
            timestamp_ms,
            value: on_duty as f64,
            threshold: min as f64,
        })
    }
}
