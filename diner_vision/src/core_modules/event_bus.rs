// THEORY:
// The `EventBus` is the single serialization point of the engine. Every camera pipeline
// submits into it concurrently; a single drain loop pulls one monotonic timeline out of it.
//
// Key architectural principles:
// 1.  **Bounded Reorder Buffer**: Cameras run on independent clocks and schedules, so
//     events arrive slightly out of order. Each event waits in a min-heap until either
//     the newest timestamp seen is a full reorder window ahead of it, or it has itself
//     waited a full window of wall time. The second rule means a silent camera can delay
//     the timeline by at most one window, never indefinitely.
// 2.  **Late, Not Lost**: An event whose timestamp is behind what has already been
//     released cannot be placed in order any more. It is flagged `late` and emitted at
//     the next drain, ahead of the ordered batch.
// 3.  **Idempotent Submission**: The same fact submitted twice within a short epsilon
//     (a retried frame, a flapping detection) is collapsed into one event.
// 4.  **Cheap to Share**: `EventBus` is a cloneable handle around one lock. Holding the
//     lock never spans anything but heap operations.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{trace, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::BusConfig;
use crate::core_modules::event::{DomainEvent, EventKind};
use crate::core_modules::geometry::CrossingDirection;
use crate::core_modules::observation::{CameraId, Millis, ZoneId};
use crate::core_modules::tracklet::TrackletId;
use crate::error::VisionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Buffered for ordered release under this sequence number.
    Queued(u64),
    /// Behind the release horizon; will be emitted at the next drain, flagged late.
    Late(u64),
    /// Collapsed into an earlier identical event.
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub submitted: u64,
    pub duplicates: u64,
    pub late: u64,
    pub released: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    kind: EventKind,
    camera: CameraId,
    tracklet: TrackletId,
    zone: Option<ZoneId>,
    direction: Option<CrossingDirection>,
}

impl DedupKey {
    fn of(event: &DomainEvent) -> Self {
        Self {
            kind: event.kind,
            camera: event.camera.clone(),
            tracklet: event.tracklet,
            zone: event.zone.clone(),
            direction: event.meta.direction,
        }
    }
}

struct Queued {
    event: DomainEvent,
    arrived: Instant,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Reversed so the max-heap pops the earliest event first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.event.cmp_order(&self.event)
    }
}

#[derive(Default)]
struct BusState {
    next_seq: u64,
    heap: BinaryHeap<Queued>,
    late: Vec<DomainEvent>,
    high_watermark: Millis,
    released_through: Option<Millis>,
    recent: HashMap<DedupKey, Millis>,
    stats: BusStats,
}

#[derive(Clone)]
pub struct EventBus {
    config: BusConfig,
    state: Arc<Mutex<BusState>>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(BusState {
                next_seq: 1,
                ..BusState::default()
            })),
        }
    }

    pub fn submit(&self, mut event: DomainEvent) -> Submitted {
        let mut state = self.state.lock();
        state.stats.submitted += 1;

        let key = DedupKey::of(&event);
        if let Some(&previous) = state.recent.get(&key) {
            if previous.abs_diff(event.timestamp_ms) <= self.config.dedup_epsilon_ms {
                state.stats.duplicates += 1;
                trace!("dropping duplicate {} for {}", event.kind.as_str(), event.tracklet);
                return Submitted::Duplicate;
            }
        }
        state.recent.insert(key, event.timestamp_ms);

        event.seq = state.next_seq;
        state.next_seq += 1;
        let seq = event.seq;

        if state.released_through.is_some_and(|through| event.timestamp_ms < through) {
            let horizon = state.released_through.unwrap_or_default();
            let skew = VisionError::ClockSkew {
                camera: event.camera.clone(),
                timestamp_ms: event.timestamp_ms,
                horizon_ms: horizon,
            };
            warn!("{skew}");
            event.meta.late = true;
            state.stats.late += 1;
            state.late.push(event);
            return Submitted::Late(seq);
        }

        state.high_watermark = state.high_watermark.max(event.timestamp_ms);
        state.heap.push(Queued {
            event,
            arrived: Instant::now(),
        });
        Submitted::Queued(seq)
    }

    /// Releases everything that is ready as of now.
    pub fn drain(&self) -> Vec<DomainEvent> {
        self.drain_at(Instant::now())
    }

    /// Releases late events, then every buffered event at or below the release horizon, in
    /// timeline order.
    pub fn drain_at(&self, now: Instant) -> Vec<DomainEvent> {
        let window = Duration::from_millis(self.config.reorder_window_ms);
        let mut state = self.state.lock();

        let mut horizon = state.high_watermark.checked_sub(self.config.reorder_window_ms);
        let aged = state
            .heap
            .iter()
            .filter(|q| now.saturating_duration_since(q.arrived) >= window)
            .map(|q| q.event.timestamp_ms)
            .max();
        if let Some(aged) = aged {
            horizon = Some(horizon.map_or(aged, |h| h.max(aged)));
        }

        let mut released = std::mem::take(&mut state.late);
        if let Some(horizon) = horizon {
            while state
                .heap
                .peek()
                .is_some_and(|q| q.event.timestamp_ms <= horizon)
            {
                if let Some(queued) = state.heap.pop() {
                    released.push(queued.event);
                }
            }
        }
        Self::finish_release(&mut state, &released, self.config.dedup_epsilon_ms + self.config.reorder_window_ms);
        released
    }

    /// Releases everything, regardless of the reorder window.
    pub fn flush(&self) -> Vec<DomainEvent> {
        let mut state = self.state.lock();
        let mut released = std::mem::take(&mut state.late);
        let mut ordered = std::mem::take(&mut state.heap).into_sorted_vec();
        // `into_sorted_vec` is ascending by `Ord`, which is reversed timeline order.
        ordered.reverse();
        released.extend(ordered.into_iter().map(|q| q.event));
        Self::finish_release(&mut state, &released, self.config.dedup_epsilon_ms + self.config.reorder_window_ms);
        released
    }

    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.heap.len() + state.late.len()
    }

    pub fn stats(&self) -> BusStats {
        self.state.lock().stats
    }

    fn finish_release(state: &mut BusState, released: &[DomainEvent], retention_ms: Millis) {
        state.stats.released += released.len() as u64;
        if let Some(newest) = released.iter().filter(|e| !e.meta.late).map(|e| e.timestamp_ms).max() {
            state.released_through = Some(state.released_through.map_or(newest, |t| t.max(newest)));
        }
        let floor = state.high_watermark.saturating_sub(retention_ms);
        state.recent.retain(|_, &mut ts| ts >= floor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::observation::EntityClass;

    fn bus() -> EventBus {
        EventBus::new(BusConfig {
            reorder_window_ms: 300,
            dedup_epsilon_ms: 50,
            drain_interval_ms: 100,
        })
    }

    fn entered(camera: &str, tracklet: u64, timestamp_ms: Millis) -> DomainEvent {
        DomainEvent::new(
            EventKind::EnteredZone,
            CameraId::from(camera),
            TrackletId(tracklet),
            EntityClass::Person,
            timestamp_ms,
        )
        .in_zone(&ZoneId::from("queue_corridor"), crate::core_modules::zone::ZoneRole::QueueCorridor)
    }

    #[test]
    fn duplicates_within_epsilon_collapse() {
        let bus = bus();
        assert!(matches!(bus.submit(entered("queue", 1, 1_000)), Submitted::Queued(_)));
        assert_eq!(bus.submit(entered("queue", 1, 1_030)), Submitted::Duplicate);
        assert!(matches!(bus.submit(entered("queue", 1, 1_200)), Submitted::Queued(_)));
        assert_eq!(bus.flush().len(), 2);
        assert_eq!(bus.stats().duplicates, 1);
    }

    #[test]
    fn releases_in_timeline_order_behind_the_window() {
        let bus = bus();
        bus.submit(entered("queue", 1, 1_000));
        bus.submit(entered("gate", 2, 900));
        bus.submit(entered("parking", 3, 950));
        let now = Instant::now();
        assert!(bus.drain_at(now).is_empty());

        bus.submit(entered("queue", 4, 1_260));
        let drained = bus.drain_at(now);
        let stamps: Vec<Millis> = drained.iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(stamps, vec![900, 950]);
        assert_eq!(bus.pending(), 2);
    }

    #[test]
    fn same_timestamp_orders_by_camera() {
        let bus = bus();
        bus.submit(entered("queue", 1, 500));
        bus.submit(entered("gate", 1, 500));
        let drained = bus.flush();
        assert_eq!(drained[0].camera, CameraId::from("gate"));
        assert_eq!(drained[1].camera, CameraId::from("queue"));
    }

    #[test]
    fn silent_cameras_do_not_stall_release() {
        let bus = bus();
        bus.submit(entered("queue", 1, 1_000));
        let later = Instant::now() + Duration::from_millis(301);
        let drained = bus.drain_at(later);
        assert_eq!(drained.len(), 1);
    }

    #[test]
    fn events_behind_the_horizon_are_flagged_late() {
        let bus = bus();
        bus.submit(entered("queue", 1, 5_000));
        bus.flush();
        assert!(matches!(bus.submit(entered("gate", 2, 4_000)), Submitted::Late(_)));
        let drained = bus.drain_at(Instant::now());
        assert_eq!(drained.len(), 1);
        assert!(drained[0].meta.late);
        assert_eq!(bus.stats().late, 1);
    }

    #[test]
    fn sequence_numbers_are_unique() {
        let bus = bus();
        for i in 0..10 {
            bus.submit(entered("queue", i, 100));
        }
        let drained = bus.flush();
        let mut seqs: Vec<u64> = drained.iter().map(|e| e.seq).collect();
        seqs.dedup();
        assert_eq!(seqs.len(), 10);
        assert!(drained.windows(2).all(|w| w[0].cmp_order(&w[1]) == Ordering::Less));
    }
}
