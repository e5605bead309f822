// THEORY:
// This file is the main entry point for the `diner_vision` library crate. It defines the
// public API exposed to the services that feed frames in and read KPIs out.
//
// The engine is a stack of layers, each consuming the output of the one below:
//   detections -> observations -> tracklets -> domain events -> ordered timeline -> KPI windows
//
// The high-level interfaces are the `Engine` (the concurrent, multi-camera runtime), the
// `CameraPipeline` (one camera's synchronous stack), and the `KpiQuery` read handle. The
// layer internals live in `core_modules` and stay public for replay and testing.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;
pub mod sink;

pub use config::EngineConfig;
pub use core_modules::aggregator::KpiAggregator;
pub use core_modules::detection_adapter::{RawDetection, RawFrame};
pub use core_modules::event::{DomainEvent, EventKind};
pub use core_modules::kpi_query::{KpiMetric, KpiQuery, KpiValue, Scope, WindowRange};
pub use error::{Result, VisionError};
pub use parallel_pipeline::{CameraHealth, CameraStatus, Engine, EngineSummary};
pub use pipeline::{CameraPipeline, FrameReport};
pub use sink::{JsonLinesSink, MemorySink, PersistenceSink};
