// A synthetic four-camera site, used when no recorded frames are given. Every actor
// follows a scripted path of waypoints and is detected at each frame it is visible in.

use diner_vision::core_modules::observation::{CameraId, Millis};
use diner_vision::{EngineConfig, RawDetection, RawFrame};

const DEMO_CONFIG: &str = r#"{
    "cameras": [
        { "id": "gate", "role": "gate",
          "field_of_view": { "width": 1280, "height": 720 },
          "zones": [{ "id": "entrance", "role": "gate_line",
                      "geometry": { "type": "line", "from": { "x": 640, "y": 0 }, "to": { "x": 640, "y": 720 } } }] },
        { "id": "queue", "role": "queue",
          "field_of_view": { "width": 1280, "height": 720 },
          "zones": [{ "id": "counter_queue", "role": "queue_corridor", "min_dwell_secs": 2,
                      "geometry": { "type": "polygon", "points": [
                          { "x": 200, "y": 200 }, { "x": 500, "y": 200 }, { "x": 500, "y": 600 }, { "x": 200, "y": 600 } ] } }] },
        { "id": "parking", "role": "parking",
          "field_of_view": { "width": 1280, "height": 720 },
          "zones": [
              { "id": "slot_a", "role": "parking_slot", "min_dwell_secs": 30,
                "geometry": { "type": "polygon", "points": [
                    { "x": 100, "y": 200 }, { "x": 400, "y": 200 }, { "x": 400, "y": 600 }, { "x": 100, "y": 600 } ] } },
              { "id": "slot_b", "role": "parking_slot", "min_dwell_secs": 30,
                "geometry": { "type": "polygon", "points": [
                    { "x": 500, "y": 200 }, { "x": 800, "y": 200 }, { "x": 800, "y": 600 }, { "x": 500, "y": 600 } ] } }
          ] },
        { "id": "kitchen", "role": "kitchen",
          "field_of_view": { "width": 1280, "height": 720 },
          "zones": [
              { "id": "prep_line", "role": "work_area",
                "geometry": { "type": "polygon", "points": [
                    { "x": 100, "y": 100 }, { "x": 1200, "y": 100 }, { "x": 1200, "y": 700 }, { "x": 100, "y": 700 } ] } },
              { "id": "hand_sink", "role": "sink_area",
                "geometry": { "type": "polygon", "points": [
                    { "x": 900, "y": 150 }, { "x": 1100, "y": 150 }, { "x": 1100, "y": 500 }, { "x": 900, "y": 500 } ] } }
          ] }
    ],
    "aggregator": { "window_secs": 600, "epoch_unix_ms": 1714564800000 },
    "alerts": { "max_queue_length": 2, "min_staff_count": 2 }
}"#;

/// Length of the scripted run.
pub const DURATION_MS: Millis = 30 * 60 * 1000;
const FRAME_PERIOD_MS: Millis = 500;

const PERSON: u32 = 0;
const CAR: u32 = 2;

pub fn config() -> diner_vision::Result<EngineConfig> {
    EngineConfig::from_json_str(DEMO_CONFIG)
}

struct Actor {
    camera: &'static str,
    class_id: u32,
    /// `(time, x, y)` of the footprint, linearly interpolated.
    waypoints: Vec<(Millis, f64, f64)>,
    /// Intervals during which both wrists are reported at chest height.
    washing: Vec<(Millis, Millis)>,
}

impl Actor {
    fn new(camera: &'static str, class_id: u32, waypoints: Vec<(Millis, f64, f64)>) -> Self {
        Self {
            camera,
            class_id,
            waypoints,
            washing: Vec::new(),
        }
    }

    fn position(&self, t: Millis) -> Option<(f64, f64)> {
        let &(first, ..) = self.waypoints.first()?;
        let &(last, ..) = self.waypoints.last()?;
        if t < first || t > last {
            return None;
        }
        self.waypoints.windows(2).find_map(|pair| {
            let ((t0, x0, y0), (t1, x1, y1)) = (pair[0], pair[1]);
            if t < t0 || t > t1 {
                return None;
            }
            let f = if t1 == t0 { 1.0 } else { (t - t0) as f64 / (t1 - t0) as f64 };
            Some((x0 + (x1 - x0) * f, y0 + (y1 - y0) * f))
        })
    }

    fn detection(&self, t: Millis) -> Option<RawDetection> {
        let (x, y) = self.position(t)?;
        let (half_width, height) = if self.class_id == PERSON { (25.0, 150.0) } else { (70.0, 90.0) };
        let keypoints = self
            .washing
            .iter()
            .any(|(from, to)| (*from..*to).contains(&t))
            .then(|| wrists_at(x, y - 60.0));
        Some(RawDetection {
            bbox: Some([x - half_width, y - height, x + half_width, y]),
            class_id: Some(self.class_id),
            label: None,
            confidence: 0.85,
            keypoints,
        })
    }
}

/// COCO-17 keypoints with only the wrists set.
fn wrists_at(x: f64, y: f64) -> Vec<[f64; 3]> {
    let mut keypoints = vec![[0.0, 0.0, 0.0]; 17];
    keypoints[9] = [x - 10.0, y, 0.9];
    keypoints[10] = [x + 10.0, y, 0.9];
    keypoints
}

fn customers() -> Vec<Actor> {
    let mut actors = Vec::new();
    for k in 0..(DURATION_MS / 45_000) {
        let t0 = k * 45_000;
        // Walks in across the entrance line, right to left.
        actors.push(Actor::new("gate", PERSON, vec![(t0, 1000.0, 450.0), (t0 + 6_000, 300.0, 450.0)]));

        // Waits in its own lane of the queue, then walks off to the counter.
        let lane = 250.0 + (k % 4) as f64 * 100.0;
        let arrive = t0 + 8_000;
        let wait = 30_000 + (k * 17_000) % 60_000;
        actors.push(Actor::new(
            "queue",
            PERSON,
            vec![
                (arrive, 100.0, lane),
                (arrive + 2_000, 300.0, lane),
                (arrive + 2_000 + wait, 300.0, lane),
                (arrive + 5_000 + wait, 600.0, lane),
            ],
        ));

        // Leaves ten minutes later, left to right.
        let leave = t0 + 600_000;
        actors.push(Actor::new("gate", PERSON, vec![(leave, 300.0, 700.0), (leave + 6_000, 1000.0, 700.0)]));
    }
    actors
}

fn vehicles() -> Vec<Actor> {
    (0..(DURATION_MS / 240_000))
        .map(|k| {
            let arrive = 20_000 + k * 240_000;
            let x = if k % 2 == 0 { 250.0 } else { 650.0 };
            let leave = arrive + 360_000;
            Actor::new(
                "parking",
                CAR,
                vec![
                    (arrive, x, 710.0),
                    (arrive + 3_000, x, 500.0),
                    (leave, x, 500.0),
                    (leave + 3_000, x, 715.0),
                ],
            )
        })
        .collect()
}

fn staff() -> Vec<Actor> {
    // The line cook washes up every five minutes.
    let mut waypoints = vec![(0, 700.0, 450.0)];
    let mut washing = Vec::new();
    let mut start = 60_000;
    while start + 40_000 < DURATION_MS {
        waypoints.extend([
            (start, 700.0, 450.0),
            (start + 5_000, 1000.0, 450.0),
            (start + 30_000, 1000.0, 450.0),
            (start + 35_000, 700.0, 450.0),
        ]);
        washing.push((start + 5_000, start + 30_000));
        start += 300_000;
    }
    waypoints.push((DURATION_MS, 700.0, 450.0));

    vec![
        Actor::new("kitchen", PERSON, vec![(0, 350.0, 400.0), (DURATION_MS, 350.0, 400.0)]),
        // A second shift that covers the middle of the run.
        Actor::new(
            "kitchen",
            PERSON,
            vec![(600_000, 150.0, 650.0), (605_000, 400.0, 650.0), (1_500_000, 400.0, 650.0), (1_505_000, 150.0, 650.0)],
        ),
        Actor {
            washing,
            ..Actor::new("kitchen", PERSON, waypoints)
        },
    ]
}

/// Every frame of every camera, in timestamp order.
pub fn frames() -> Vec<RawFrame> {
    let cameras = ["gate", "queue", "parking", "kitchen"];
    let actors: Vec<Actor> = customers().into_iter().chain(vehicles()).chain(staff()).collect();

    let mut frames = Vec::with_capacity(cameras.len() * (DURATION_MS / FRAME_PERIOD_MS) as usize);
    for t in (0..DURATION_MS).step_by(FRAME_PERIOD_MS as usize) {
        for camera in cameras {
            let detections = actors
                .iter()
                .filter(|actor| actor.camera == camera)
                .filter_map(|actor| actor.detection(t))
                .collect();
            frames.push(RawFrame {
                camera_id: CameraId::from(camera),
                timestamp_ms: t,
                detections,
            });
        }
    }
    frames
}
