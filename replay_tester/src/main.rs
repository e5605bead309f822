mod demo;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use diner_vision::core_modules::kpi_window::KpiWindow;
use diner_vision::sink::read_event_log;
use diner_vision::{
    Engine, EngineConfig, EventKind, JsonLinesSink, KpiAggregator, KpiMetric, KpiQuery, KpiValue, MemorySink,
    PersistenceSink, RawFrame, Scope, WindowRange,
};
use env_logger::{Builder, Env};
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Feeds recorded or synthetic frames through the engine and prints the KPIs", long_about = None)]
struct Args {
    /// Engine configuration (JSON). Defaults to the built-in demo site.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Recorded frames, one JSON `RawFrame` per line. Defaults to the synthetic demo.
    #[arg(short, long)]
    frames: Option<PathBuf>,

    /// Append the persisted event log (JSON lines) to this file.
    #[arg(long)]
    events_out: Option<PathBuf>,

    /// Rebuild the KPIs from a persisted event log instead of running frames.
    #[arg(long, conflicts_with = "frames")]
    replay: Option<PathBuf>,

    /// Runtime worker threads. Defaults to the number of CPUs.
    #[arg(long)]
    workers: Option<usize>,
}

fn main() -> Result<()> {
    // --- 1. Argument Parsing & Setup ---
    Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => demo::config().context("built-in demo configuration")?,
    };

    if let Some(log) = &args.replay {
        return replay(&config, log);
    }

    // --- 2. Runtime Initialization ---
    let workers = args.workers.unwrap_or_else(num_cpus::get).max(1);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .context("building the tokio runtime")?;
    info!("running on {workers} worker threads");

    let frames = match &args.frames {
        Some(path) => read_frames(path)?,
        None => {
            if args.config.is_some() {
                bail!("--config without --frames: the synthetic frames only fit the demo site");
            }
            demo::frames()
        }
    };
    runtime.block_on(run(config, frames, args.events_out.as_deref()))
}

async fn run(config: EngineConfig, frames: Vec<RawFrame>, events_out: Option<&Path>) -> Result<()> {
    let epoch = config.aggregator.epoch_unix_ms;
    let sink: Arc<dyn PersistenceSink> = match events_out {
        Some(path) => Arc::new(JsonLinesSink::create(path).with_context(|| format!("opening {}", path.display()))?),
        None => Arc::new(MemorySink::new()),
    };

    // --- 3. Main Processing Loop ---
    let engine = Engine::start(config, sink)?;
    let query = engine.query();
    let total = frames.len();
    for frame in frames {
        if let Err(err) = engine.ingest(frame).await {
            warn!("frame not ingested: {err}");
        }
    }
    info!("ingested {total} frames, shutting down");
    let summary = engine.shutdown().await?;

    // --- 4. Reporting ---
    print_report(&query, epoch);
    println!("\n{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn replay(config: &EngineConfig, log: &Path) -> Result<()> {
    let reader = BufReader::new(File::open(log).with_context(|| format!("opening {}", log.display()))?);
    let events = read_event_log(reader).with_context(|| format!("reading {}", log.display()))?;
    let forced = events
        .iter()
        .filter(|e| e.meta.truncated && matches!(e.kind, EventKind::DwellEnd | EventKind::AttendanceEnd))
        .count();
    info!("replaying {} events ({forced} forced ends)", events.len());

    // The log already holds every forced END.
    let mut aggregator = KpiAggregator::replaying(config);
    for event in &events {
        aggregator.apply(event);
    }
    aggregator.finalize_all();
    print_report(&aggregator.query(), config.aggregator.epoch_unix_ms);
    Ok(())
}

fn read_frames(path: &Path) -> Result<Vec<RawFrame>> {
    let reader = BufReader::new(File::open(path).with_context(|| format!("opening {}", path.display()))?);
    let mut frames = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let frame: RawFrame =
            serde_json::from_str(&line).with_context(|| format!("{}:{}", path.display(), number + 1))?;
        frames.push(frame);
    }
    Ok(frames)
}

const REPORTED: [(KpiMetric, &str); 10] = [
    (KpiMetric::Entries, "entries"),
    (KpiMetric::Exits, "exits"),
    (KpiMetric::Occupancy, "occupancy at close"),
    (KpiMetric::QueueLengthMax, "queue length max"),
    (KpiMetric::QueueLengthMean, "queue length mean"),
    (KpiMetric::QueueWaitMeanSecs, "queue wait mean (s)"),
    (KpiMetric::VehicleArrivals, "vehicle arrivals"),
    (KpiMetric::ParkingUtilization, "parking utilization"),
    (KpiMetric::HygieneComplianceRate, "hygiene compliance"),
    (KpiMetric::HygieneComplianceRateStrict, "hygiene compliance (pose)"),
];

fn print_report(query: &KpiQuery, epoch_unix_ms: i64) {
    let windows: Vec<Arc<KpiWindow>> = query.windows(WindowRange::All);
    let header: Vec<String> = windows.iter().map(|w| w.label(epoch_unix_ms)).collect();
    println!("{:<28} {}", "window", header.join(" | "));
    for (metric, name) in REPORTED {
        if let KpiValue::Series(points) = query.get_kpi(metric, &Scope::All, WindowRange::All) {
            let values: Vec<String> = points.iter().map(|p| format!("{:>16.2}", p.value)).collect();
            println!("{name:<28} {}", values.join(" | "));
        }
    }
    let completeness: Vec<String> = windows.iter().map(|w| format!("{:>16}", format!("{:?}", w.completeness))).collect();
    println!("{:<28} {}", "completeness", completeness.join(" | "));
    println!("peak hours: {:?}", query.peak_hours(&Scope::All, WindowRange::All));
    let alerts: usize = windows.iter().map(|w| w.alerts.len()).sum();
    println!("alerts raised: {alerts}");
}
