//! End-to-end runs of the synchronous stack: camera pipelines into the event bus into the
//! aggregator, with no runtime in between.

use std::collections::BTreeMap;
use std::sync::Arc;

use diner_vision::core_modules::event_bus::{EventBus, Submitted};
use diner_vision::core_modules::geometry::CrossingDirection;
use diner_vision::core_modules::kpi_window::{KpiWindow, WindowId};
use diner_vision::core_modules::observation::{CameraId, Millis};
use diner_vision::core_modules::tracker::DeltaKind;
use diner_vision::core_modules::tracklet::TrackletState;
use diner_vision::core_modules::zone::ZoneRole;
use diner_vision::sink::{JsonLinesSink, MemorySink, PersistenceSink, read_event_log};
use diner_vision::{CameraPipeline, DomainEvent, EngineConfig, EventKind, KpiAggregator, RawDetection, RawFrame};

const SITE: &str = r#"{
    "cameras": [
        { "id": "queue", "role": "queue", "field_of_view": { "width": 640, "height": 480 },
          "zones": [{ "id": "queue_corridor", "role": "queue_corridor",
                      "geometry": { "type": "polygon", "points": [
                          { "x": 100, "y": 0 }, { "x": 300, "y": 0 }, { "x": 300, "y": 480 }, { "x": 100, "y": 480 } ] } }] },
        { "id": "parking", "role": "parking", "field_of_view": { "width": 640, "height": 480 },
          "zones": [{ "id": "slot_1", "role": "parking_slot",
                      "geometry": { "type": "polygon", "points": [
                          { "x": 100, "y": 100 }, { "x": 300, "y": 100 }, { "x": 300, "y": 400 }, { "x": 100, "y": 400 } ] } }] }
    ],
    "tracker": { "promote_after_hits": 2, "max_match_distance": 200 },
    "aggregator": { "window_secs": 60 }
}"#;

fn config() -> EngineConfig {
    EngineConfig::from_json_str(SITE).expect("valid config")
}

fn pipeline(camera: &str) -> CameraPipeline {
    let config = config();
    let camera = config.camera(&CameraId::from(camera)).expect("configured camera").clone();
    CameraPipeline::new(&camera, &config).expect("valid camera")
}

/// A person whose feet are at `(x, y)`.
fn person(x: f64, y: f64) -> RawDetection {
    RawDetection {
        bbox: Some([x - 20.0, y - 100.0, x + 20.0, y]),
        class_id: Some(0),
        label: None,
        confidence: 0.9,
        keypoints: None,
    }
}

fn vehicle(x: f64) -> RawDetection {
    RawDetection {
        bbox: Some([x - 40.0, 200.0, x + 40.0, 300.0]),
        class_id: Some(2),
        label: None,
        confidence: 0.8,
        keypoints: None,
    }
}

fn frame(camera: &str, timestamp_ms: Millis, detections: Vec<RawDetection>) -> RawFrame {
    RawFrame {
        camera_id: CameraId::from(camera),
        timestamp_ms,
        detections,
    }
}

fn count(events: &[DomainEvent], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}

#[test]
fn jittering_vehicle_keeps_one_identity() {
    let mut parking = pipeline("parking");
    let mut events = Vec::new();
    for i in 0..50u64 {
        let x = if i % 2 == 0 { 200.0 } else { 200.3 };
        let report = parking
            .process_frame(&frame("parking", i * 100, vec![vehicle(x)]))
            .expect("good frame");
        events.extend(report.events);
    }
    assert_eq!(parking.tracklets().len(), 1);
    assert_eq!(count(&events, EventKind::EnteredZone), 1);
    assert_eq!(events[0].zone_role, Some(ZoneRole::ParkingSlot));
}

#[test]
fn queue_visit_measures_wait_time() {
    let mut queue = pipeline("queue");
    let mut events = Vec::new();
    for t in (9_000..=60_000u64).step_by(500) {
        let x = match t {
            t if t < 10_000 => 50.0,
            t if t < 55_000 => 150.0,
            _ => 320.0,
        };
        let report = queue
            .process_frame(&frame("queue", t, vec![person(x, 400.0)]))
            .expect("good frame");
        events.extend(report.events);
    }

    let entered = events.iter().find(|e| e.kind == EventKind::EnteredZone).expect("entered");
    assert_eq!(entered.timestamp_ms, 10_000);
    let dwell_end = events.iter().find(|e| e.kind == EventKind::DwellEnd).expect("dwell ended");
    assert_eq!(dwell_end.timestamp_ms, 55_000);
    assert_eq!(dwell_end.meta.duration_ms, Some(45_000));
    assert!(!dwell_end.meta.truncated);

    let mut aggregator = KpiAggregator::new(&config());
    for event in &events {
        aggregator.apply(event);
    }
    let counters = aggregator.snapshot(0).expect("open window").merged(|_| true);
    assert_eq!(counters.queue_wait.count, 1);
    assert!((counters.queue_wait.mean_secs() - 45.0).abs() < 1e-9);
}

#[test]
fn crossing_before_promotion_is_still_counted() {
    let config = EngineConfig::from_json_str(
        r#"{ "cameras": [
            { "id": "door", "role": "gate", "field_of_view": { "width": 1000, "height": 1000 },
              "zones": [{ "id": "gate_line", "role": "gate_line",
                          "geometry": { "type": "line", "from": { "x": 500, "y": 0 }, "to": { "x": 500, "y": 1000 } } }] }
        ] }"#,
    )
    .expect("valid config");
    assert_eq!(config.tracker.promote_after_hits, 3);
    let camera = config.camera(&CameraId::from("door")).expect("configured camera").clone();
    let mut door = CameraPipeline::new(&camera, &config).expect("valid camera");

    let mut events = Vec::new();
    for (i, x) in [510.0, 490.0, 470.0, 450.0, 430.0].into_iter().enumerate() {
        let report = door
            .process_frame(&frame("door", i as u64 * 100, vec![person(x, 500.0)]))
            .expect("good frame");
        events.extend(report.events);
    }

    let crossings: Vec<_> = events.iter().filter(|e| e.kind == EventKind::CrossedLine).collect();
    assert_eq!(crossings.len(), 1);
    assert_eq!(crossings[0].meta.direction, Some(CrossingDirection::In));
}

#[test]
fn twenty_second_frame_gap_keeps_the_tracklet_active() {
    let mut queue = pipeline("queue");
    let mut kinds = Vec::new();
    let mut events = Vec::new();
    for t in (0..=5_000u64).step_by(500).chain((25_000..=30_000u64).step_by(500)) {
        let report = queue
            .process_frame(&frame("queue", t, vec![person(150.0, 400.0)]))
            .expect("good frame");
        kinds.extend(report.deltas.iter().map(|d| d.kind));
        events.extend(report.events);
    }

    assert_eq!(queue.tracklets().len(), 1);
    assert_eq!(queue.tracklets()[0].state, TrackletState::Active);
    assert!(!kinds.contains(&DeltaKind::Lost));
    assert_eq!(kinds.iter().filter(|k| **k == DeltaKind::Spawned).count(), 1);
    assert_eq!(count(&events, EventKind::EnteredZone), 1);
}

#[test]
fn occlusion_across_empty_frames_recovers_the_same_identity() {
    let mut queue = pipeline("queue");
    let mut events = Vec::new();
    let mut kinds = Vec::new();
    let mut feed = |queue: &mut CameraPipeline, t: Millis, detections: Vec<RawDetection>| {
        let report = queue.process_frame(&frame("queue", t, detections)).expect("good frame");
        kinds.extend(report.deltas.iter().map(|d| d.kind));
        events.extend(report.events);
    };

    for t in (0..=5_000u64).step_by(500) {
        feed(&mut queue, t, vec![person(150.0, 400.0)]);
    }
    let id = queue.tracklets()[0].id;
    for t in (6_000..=25_000u64).step_by(1_000) {
        feed(&mut queue, t, Vec::new());
    }
    for t in (26_000..=30_000u64).step_by(500) {
        feed(&mut queue, t, vec![person(150.0, 400.0)]);
    }

    assert_eq!(queue.tracklets().len(), 1);
    assert_eq!(queue.tracklets()[0].id, id);
    assert!(kinds.contains(&DeltaKind::Lost));
    assert!(kinds.contains(&DeltaKind::Recovered));
    assert_eq!(count(&events, EventKind::TrackletClosed), 0);
    assert_eq!(count(&events, EventKind::EnteredZone), 1);
}

#[test]
fn closure_inside_the_queue_forces_a_truncated_end() {
    let mut queue = pipeline("queue");
    let bus = EventBus::new(config().bus);
    for t in (0..=10_000u64).step_by(500) {
        let report = queue
            .process_frame(&frame("queue", t, vec![person(150.0, 400.0)]))
            .expect("good frame");
        for event in report.events {
            bus.submit(event);
        }
    }
    for event in queue.flush() {
        bus.submit(event);
    }

    let mut aggregator = KpiAggregator::new(&config());
    let mut synthetic = Vec::new();
    let released = bus.flush();
    let exited = released.iter().find(|e| e.kind == EventKind::ExitedZone).expect("visit ended");
    assert!(exited.meta.truncated);
    for event in &released {
        synthetic.extend(aggregator.apply(event).synthetic.into_iter().map(|(_, end)| end));
    }

    assert_eq!(synthetic.len(), 1);
    assert_eq!(synthetic[0].kind, EventKind::DwellEnd);
    assert!(synthetic[0].meta.truncated);
    assert_eq!(synthetic[0].timestamp_ms, 10_000);
    // In line since the first tentative frame.
    assert_eq!(synthetic[0].meta.duration_ms, Some(10_000));
    assert_eq!(aggregator.open_intervals(), 0);
    let window = aggregator.snapshot(0).expect("open window");
    assert_eq!(window.truncated_ends, 1);
}

#[test]
fn identical_events_within_epsilon_are_collapsed() {
    let bus = EventBus::new(config().bus);
    let mut queue = pipeline("queue");
    for t in [0, 500] {
        queue
            .process_frame(&frame("queue", t, vec![person(150.0, 400.0)]))
            .expect("good frame");
    }
    let closed = queue.flush();
    let event = closed.last().expect("closure marker").clone();
    let mut echo = event.clone();
    echo.timestamp_ms += 20;

    assert!(matches!(bus.submit(event), Submitted::Queued(_)));
    assert_eq!(bus.submit(echo), Submitted::Duplicate);
    assert_eq!(bus.flush().len(), 1);
    assert_eq!(bus.stats().duplicates, 1);
}

/// Two minutes of a queue with four customers and a parked car, released through the bus
/// the way the engine does it: in two-second batches, one camera at a time.
fn run_site() -> Vec<DomainEvent> {
    let mut queue = pipeline("queue");
    let mut parking = pipeline("parking");
    let bus = EventBus::new(config().bus);
    let mut released = Vec::new();

    let customers = |t: Millis| -> Vec<RawDetection> {
        (0..4u64)
            .filter_map(|k| {
                let arrive = k * 25_000;
                let y = 300.0 + 40.0 * k as f64;
                match t.checked_sub(arrive)? {
                    0..1_000 => Some(person(50.0, y)),
                    1_000..11_000 => Some(person(150.0, y)),
                    11_000..12_000 => Some(person(320.0, y)),
                    _ => None,
                }
            })
            .collect()
    };
    let car = |t: Millis| -> Vec<RawDetection> {
        if (5_000..70_000).contains(&t) { vec![vehicle(200.0)] } else { Vec::new() }
    };

    for batch in (0..130_000u64).step_by(2_000) {
        for t in (batch..batch + 2_000).step_by(500) {
            let report = queue.process_frame(&frame("queue", t, customers(t))).expect("good frame");
            report.events.into_iter().for_each(|e| {
                bus.submit(e);
            });
        }
        for t in (batch..batch + 2_000).step_by(1_000) {
            let report = parking.process_frame(&frame("parking", t, car(t))).expect("good frame");
            report.events.into_iter().for_each(|e| {
                bus.submit(e);
            });
        }
        released.extend(bus.drain());
    }
    for event in queue.flush().into_iter().chain(parking.flush()) {
        bus.submit(event);
    }
    released.extend(bus.flush());
    released
}

/// Applies the released timeline the way the drain task does: every forced END is persisted
/// ahead of the closure that forced it. Returns the finalized windows and the events each
/// window counted, in application order.
fn drain(released: &[DomainEvent], sink: &dyn PersistenceSink) -> (Vec<Arc<KpiWindow>>, Vec<(WindowId, DomainEvent)>) {
    let mut aggregator = KpiAggregator::new(&config());
    let mut windows = Vec::new();
    let mut counted = Vec::new();
    for event in released {
        let outcome = aggregator.apply(event);
        for (window, end) in outcome.synthetic {
            sink.write_synthetic(&end).expect("in-memory write");
            counted.push((window, end));
        }
        sink.write_event(event).expect("in-memory write");
        counted.push((outcome.window, event.clone()));
        windows.extend(outcome.finalized);
    }
    windows.extend(aggregator.finalize_all());
    (windows, counted)
}

fn replay(events: &[DomainEvent]) -> Vec<KpiWindow> {
    let mut aggregator = KpiAggregator::replaying(&config());
    let mut windows = Vec::new();
    for event in events {
        windows.extend(aggregator.apply(event).finalized);
    }
    windows.extend(aggregator.finalize_all());
    windows.into_iter().map(|w| (*w).clone()).collect()
}

#[test]
fn released_timeline_is_ordered() {
    let released = run_site();
    assert!(!released.is_empty());
    let on_time: Vec<&DomainEvent> = released.iter().filter(|e| !e.meta.late).collect();
    for pair in on_time.windows(2) {
        assert!(
            pair[0].timestamp_ms <= pair[1].timestamp_ms,
            "{} at {} released before {} at {}",
            pair[0].kind.as_str(),
            pair[0].timestamp_ms,
            pair[1].kind.as_str(),
            pair[1].timestamp_ms
        );
    }
}

#[test]
fn every_closed_tracklet_exits_what_it_entered() {
    let released = run_site();
    let mut balance: BTreeMap<(CameraId, u64), i64> = BTreeMap::new();
    for event in &released {
        let key = (event.camera.clone(), event.tracklet.0);
        match event.kind {
            EventKind::EnteredZone => *balance.entry(key).or_default() += 1,
            EventKind::ExitedZone => *balance.entry(key).or_default() -= 1,
            _ => {}
        }
    }
    let closed = released.iter().filter(|e| e.kind == EventKind::TrackletClosed).count();
    assert!(closed >= 5, "four customers and a car, got {closed}");
    assert!(balance.values().all(|&b| b == 0), "unbalanced visits: {balance:?}");
    assert_eq!(count(&released, EventKind::EnteredZone), 5);
}

#[test]
fn replaying_the_persisted_log_reproduces_the_windows() {
    let released = run_site();
    let sink = JsonLinesSink::new(Vec::new());
    let (live, _) = drain(&released, &sink);
    assert!(live.len() >= 2);
    assert!(live.iter().all(|w| w.finalized));

    let log = sink.into_inner();
    let restored = read_event_log(log.as_slice()).expect("readable log");
    // The car vanished from its slot, so its dwell was forced to an end.
    let forced: Vec<&DomainEvent> = restored.iter().filter(|e| !released.contains(e)).collect();
    assert_eq!(forced.len(), 1);
    assert_eq!(forced[0].kind, EventKind::DwellEnd);
    assert!(forced[0].meta.truncated);

    let live: Vec<KpiWindow> = live.iter().map(|w| (**w).clone()).collect();
    assert_eq!(replay(&restored), live);
}

#[test]
fn each_finalized_window_replays_from_its_own_events() {
    let released = run_site();
    let config = config();
    let (live, counted) = drain(&released, &MemorySink::new());
    assert!(live.len() >= 2);
    // The car stayed parked across the first window boundary.
    assert!(live.iter().any(|w| w.id > 0 && !w.opening.members.is_empty()));

    for window in &live {
        let own: Vec<DomainEvent> = counted
            .iter()
            .filter(|(id, _)| *id == window.id)
            .map(|(_, event)| event.clone())
            .collect();
        let rebuilt = KpiAggregator::replay_window(&config, window, &own).expect("finalized window");
        assert_eq!(&rebuilt, window.as_ref(), "window {} does not replay on its own", window.id);
    }
}
