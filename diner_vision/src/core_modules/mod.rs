// Camera-local layers first, then the shared timeline and KPI layers.

pub mod geometry;
pub mod observation;
pub mod detection_adapter;
pub mod tracklet;
pub mod assignment;
pub mod tracker;
pub mod zone;
pub mod event;
pub mod zone_events;
pub mod event_bus;
pub mod alerts;
pub mod kpi_window;
pub mod kpi_query;
pub mod aggregator;
