// THEORY:
// The `parallel_pipeline` module runs the whole engine on tokio. Every camera is an
// independent worker task fed by its own bounded channel; all of them submit into one
// shared `EventBus`, and a single drain task moves the ordered stream into the
// `KpiAggregator` and the persistence sink.
//
// Key architectural principles:
// 1.  **Fan-In, Single Writer**: Camera workers run in parallel and never share state. The
//     aggregator is owned by the drain task alone, so the timeline is applied serially.
// 2.  **Backpressure, Not Loss**: A camera's channel is bounded. A producer that outruns its
//     worker waits in `ingest` instead of growing an unbounded queue.
// 3.  **Silence is Observable**: A worker that receives nothing for `starvation_timeout_ms`
//     reports its camera as starved and ages its tracklets, so visits still end when a
//     stream dies.
// 4.  **Orderly Shutdown**: Stopping flushes every camera's tracklets, drains the bus
//     completely, and freezes every open window before the sink is flushed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::core_modules::aggregator::KpiAggregator;
use crate::core_modules::detection_adapter::RawFrame;
use crate::core_modules::event::DomainEvent;
use crate::core_modules::event_bus::{BusStats, EventBus};
use crate::core_modules::kpi_query::KpiQuery;
use crate::core_modules::observation::{CameraId, Millis};
use crate::error::{Result, VisionError};
use crate::pipeline::{CameraPipeline, PipelineStats};
use crate::sink::PersistenceSink;

// --- 1. Health Reporting ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraStatus {
    Healthy,
    /// No frame for longer than the starvation timeout.
    Starved,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraHealth {
    pub status: CameraStatus,
    pub stats: PipelineStats,
    pub last_frame_ms: Option<Millis>,
    /// Event time the camera has been silent for, while starved.
    pub silent_ms: Millis,
}

impl Default for CameraHealth {
    fn default() -> Self {
        Self {
            status: CameraStatus::Healthy,
            stats: PipelineStats::default(),
            last_frame_ms: None,
            silent_ms: 0,
        }
    }
}

#[derive(Clone, Default)]
struct HealthBoard(Arc<RwLock<BTreeMap<CameraId, CameraHealth>>>);

impl HealthBoard {
    fn update<F>(&self, camera: &CameraId, f: F)
    where
        F: FnOnce(&mut CameraHealth),
    {
        f(self.0.write().entry(camera.clone()).or_default());
    }

    fn snapshot(&self) -> BTreeMap<CameraId, CameraHealth> {
        self.0.read().clone()
    }
}

/// Totals reported when the engine stops.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSummary {
    pub windows_finalized: usize,
    pub events_applied: u64,
    pub bus: BusStats,
    pub cameras: BTreeMap<CameraId, CameraHealth>,
}

// --- 2. Camera Workers ---

enum CameraCommand {
    Frame(RawFrame),
    Stop(oneshot::Sender<()>),
}

struct CameraWorker {
    pipeline: CameraPipeline,
    bus: EventBus,
    health: HealthBoard,
    starvation_timeout: Duration,
}

impl CameraWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<CameraCommand>) {
        let camera = self.pipeline.camera().clone();
        debug!("[{camera}] worker started");
        loop {
            match tokio::time::timeout(self.starvation_timeout, commands.recv()).await {
                Ok(Some(CameraCommand::Frame(raw))) => self.on_frame(&raw),
                Ok(Some(CameraCommand::Stop(ack))) => {
                    commands.close();
                    self.stop();
                    // The caller may have given up waiting.
                    let _ = ack.send(());
                    break;
                }
                Ok(None) => {
                    self.stop();
                    break;
                }
                Err(_) => self.on_silence(),
            }
        }
        debug!("[{camera}] worker finished");
    }

    fn on_frame(&mut self, raw: &RawFrame) {
        let camera = self.pipeline.camera().clone();
        let result = self.pipeline.process_frame(raw);
        if let Err(err) = &result {
            debug!("[{camera}] frame rejected: {err}");
        }
        if let Ok(report) = result {
            self.submit(report.events);
        }
        let stats = self.pipeline.stats();
        let last_frame_ms = self.pipeline.last_timestamp_ms();
        self.health.update(&camera, |health| {
            if health.status == CameraStatus::Starved {
                info!("[{camera}] frames resumed after {}ms of silence", health.silent_ms);
            }
            health.status = CameraStatus::Healthy;
            health.stats = stats;
            health.last_frame_ms = last_frame_ms;
            health.silent_ms = 0;
        });
    }

    fn on_silence(&mut self) {
        let camera = self.pipeline.camera().clone();
        let step = self.starvation_timeout.as_millis() as Millis;
        let mut silent_ms = 0;
        self.health.update(&camera, |health| {
            health.status = CameraStatus::Starved;
            health.silent_ms += step;
            silent_ms = health.silent_ms;
        });
        warn!("{}", VisionError::TrackletStarvation {
            camera: camera.clone(),
            silent_ms,
        });

        // Tracklets age on estimated event time, since no frame carries a timestamp.
        if let Some(last) = self.pipeline.last_timestamp_ms() {
            let events = self.pipeline.age(last + silent_ms);
            self.submit(events);
        }
        let stats = self.pipeline.stats();
        self.health.update(&camera, |health| health.stats = stats);
    }

    fn stop(&mut self) {
        let camera = self.pipeline.camera().clone();
        let events = self.pipeline.flush();
        self.submit(events);
        let stats = self.pipeline.stats();
        self.health.update(&camera, |health| {
            health.status = CameraStatus::Stopped;
            health.stats = stats;
        });
        info!("[{camera}] stopped");
    }

    fn submit(&self, events: Vec<DomainEvent>) {
        for event in events {
            self.bus.submit(event);
        }
    }
}

// --- 3. The Drain Task ---

struct Drainer {
    aggregator: KpiAggregator,
    bus: EventBus,
    sink: Arc<dyn PersistenceSink>,
    windows_finalized: usize,
    events_applied: u64,
}

impl Drainer {
    async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> (usize, u64) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let events = self.bus.drain();
                    self.apply(events);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let remaining = self.bus.flush();
        debug!("final drain of {} events", remaining.len());
        self.apply(remaining);
        for window in self.aggregator.finalize_all() {
            self.windows_finalized += 1;
            self.persist(|sink| sink.write_window(&window));
        }
        self.persist(|sink| sink.flush());
        (self.windows_finalized, self.events_applied)
    }

    fn apply(&mut self, events: Vec<DomainEvent>) {
        if events.is_empty() {
            return;
        }
        for event in &events {
            let outcome = self.aggregator.apply(event);
            self.events_applied += 1;
            // Forced ENDs were applied ahead of the closure, so they are logged ahead of it.
            for (_, synthetic) in &outcome.synthetic {
                self.persist(|sink| sink.write_synthetic(synthetic));
            }
            self.persist(|sink| sink.write_event(event));
            for alert in &outcome.alerts {
                warn!("ALERT {:?}: {}", alert.severity, alert.message);
                self.persist(|sink| sink.write_alert(alert));
            }
            for window in &outcome.finalized {
                self.windows_finalized += 1;
                self.persist(|sink| sink.write_window(window));
            }
        }
        self.aggregator.publish();
    }

    /// Sink failures are logged; the in-memory KPIs stay authoritative.
    fn persist<F>(&self, write: F)
    where
        F: FnOnce(&dyn PersistenceSink) -> Result<()>,
    {
        if let Err(err) = write(self.sink.as_ref()) {
            error!("persistence sink failed: {err}");
        }
    }
}

// --- 4. The Engine ---

/// The running multi-camera engine. Must be started inside a tokio runtime.
pub struct Engine {
    cameras: HashMap<CameraId, mpsc::Sender<CameraCommand>>,
    workers: Vec<JoinHandle<()>>,
    drainer: JoinHandle<(usize, u64)>,
    shutdown: watch::Sender<bool>,
    bus: EventBus,
    query: KpiQuery,
    health: HealthBoard,
}

impl Engine {
    pub fn start(config: EngineConfig, sink: Arc<dyn PersistenceSink>) -> Result<Self> {
        config.validate()?;

        let bus = EventBus::new(config.bus.clone());
        let health = HealthBoard::default();
        let aggregator = KpiAggregator::new(&config);
        let query = aggregator.query();
        let starvation_timeout = Duration::from_millis(config.runtime.starvation_timeout_ms.max(1));
        let depth = config.runtime.camera_queue_depth.max(1);

        // Build every pipeline first so a bad camera fails the start, not a worker.
        let pipelines = config
            .cameras
            .iter()
            .map(|camera| CameraPipeline::new(camera, &config))
            .collect::<Result<Vec<_>>>()?;

        let mut cameras = HashMap::with_capacity(pipelines.len());
        let mut workers = Vec::with_capacity(pipelines.len());
        for pipeline in pipelines {
            let (tx, rx) = mpsc::channel(depth);
            let camera = pipeline.camera().clone();
            health.update(&camera, |_| {});
            let worker = CameraWorker {
                pipeline,
                bus: bus.clone(),
                health: health.clone(),
                starvation_timeout,
            };
            workers.push(tokio::spawn(worker.run(rx)));
            cameras.insert(camera, tx);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let drainer = Drainer {
            aggregator,
            bus: bus.clone(),
            sink,
            windows_finalized: 0,
            events_applied: 0,
        };
        let interval = Duration::from_millis(config.bus.drain_interval_ms.max(1));
        let drainer = tokio::spawn(drainer.run(interval, shutdown_rx));

        info!("engine started with {} cameras", cameras.len());
        Ok(Self {
            cameras,
            workers,
            drainer,
            shutdown,
            bus,
            query,
            health,
        })
    }

    /// Queues one frame for its camera, waiting while the camera's buffer is full.
    pub async fn ingest(&self, frame: RawFrame) -> Result<()> {
        let sender = self
            .cameras
            .get(&frame.camera_id)
            .ok_or_else(|| VisionError::UnknownCamera(frame.camera_id.clone()))?;
        let camera = frame.camera_id.clone();
        sender
            .send(CameraCommand::Frame(frame))
            .await
            .map_err(|_| VisionError::ChannelClosed(format!("camera '{camera}' is stopped")))
    }

    /// Stops one camera. Its open tracklets are closed and their events submitted.
    pub async fn stop_camera(&self, camera: &CameraId) -> Result<()> {
        let sender = self
            .cameras
            .get(camera)
            .ok_or_else(|| VisionError::UnknownCamera(camera.clone()))?;
        let (ack, done) = oneshot::channel();
        sender
            .send(CameraCommand::Stop(ack))
            .await
            .map_err(|_| VisionError::ChannelClosed(format!("camera '{camera}' is stopped")))?;
        done.await
            .map_err(|_| VisionError::ChannelClosed(format!("camera '{camera}' worker exited")))
    }

    /// A read-only KPI handle that stays valid after shutdown.
    pub fn query(&self) -> KpiQuery {
        self.query.clone()
    }

    pub fn health(&self) -> BTreeMap<CameraId, CameraHealth> {
        self.health.snapshot()
    }

    pub fn bus_stats(&self) -> BusStats {
        self.bus.stats()
    }

    /// Stops every camera, drains everything and freezes every open window.
    pub async fn shutdown(self) -> Result<EngineSummary> {
        let ids: Vec<CameraId> = self.cameras.keys().cloned().collect();
        for id in &ids {
            if let Err(err) = self.stop_camera(id).await {
                debug!("{err}");
            }
        }
        drop(self.cameras);
        for result in join_all(self.workers).await {
            if let Err(err) = result {
                error!("camera worker panicked: {err}");
            }
        }

        // The drain task may already be gone if it panicked; join below reports it.
        let _ = self.shutdown.send(true);
        let (windows_finalized, events_applied) = self
            .drainer
            .await
            .map_err(|err| VisionError::ChannelClosed(format!("drain task failed: {err}")))?;

        let summary = EngineSummary {
            windows_finalized,
            events_applied,
            bus: self.bus.stats(),
            cameras: self.health.snapshot(),
        };
        info!(
            "engine stopped: {} events applied, {} windows finalized",
            summary.events_applied, summary.windows_finalized
        );
        Ok(summary)
    }
}
