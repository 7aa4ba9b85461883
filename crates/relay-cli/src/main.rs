//! relay-guard: run the admission controller and inspect its audit log.

#![deny(unsafe_code)]

use clap::{Parser, Subcommand};
use controller::{ControllerBuilder, ControllerConfig, RelayGuardService};
use event_log::{EventRecord, JsonlEventLog, RelayEvent};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use telemetry::{FanoutSink, RelayMetrics};
use tonic::transport::Server;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "relay-guard", about = "Cost-aware admission controller for relay sessions")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gRPC service with cost polling and session reaping
    Serve {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate configuration (file + RELAY_* env) and print the resolved result
    CheckConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Summarize an audit log
    Inspect {
        #[arg(short, long)]
        log: PathBuf,
        #[arg(short, long)]
        peer: Option<String>,
    },
    /// Print audit events with filters
    Replay {
        #[arg(short, long)]
        log: PathBuf,
        #[arg(short, long)]
        peer: Option<String>,
        /// Only this event kind, e.g. mode_transition
        #[arg(short, long)]
        event: Option<String>,
        #[arg(long, default_value_t = 0)]
        from: u64,
        #[arg(long, default_value_t = u64::MAX)]
        to: u64,
        #[arg(long, default_value_t = 0)]
        since_ts_ms: u64,
        #[arg(long, default_value_t = 0)]
        max: u64,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

#[derive(Debug, Default)]
struct Filter<'a> {
    peer: Option<&'a str>,
    event: Option<&'a str>,
    from: u64,
    to: u64,
    since_ts_ms: u64,
    max: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Serve { config } => cmd_serve(config.as_deref()).await?,
        Command::CheckConfig { config } => cmd_check_config(config.as_deref())?,
        Command::Inspect { log, peer } => {
            let recs = load_events(&log, &Filter { peer: peer.as_deref(), to: u64::MAX, ..Filter::default() })?;
            println!("{}", serde_json::to_string_pretty(&summarize(&recs))?);
        }
        Command::Replay { log, peer, event, from, to, since_ts_ms, max, dry_run } => {
            let filter = Filter {
                peer: peer.as_deref(),
                event: event.as_deref(),
                from,
                to,
                since_ts_ms,
                max,
            };
            cmd_replay(&log, &filter, dry_run)?;
        }
    }
    Ok(())
}

async fn cmd_serve(config: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_json_logging();
    let cfg = ControllerConfig::resolve(config)?;
    let addr: SocketAddr = cfg.listen_addr.parse()?;

    let metrics = RelayMetrics::new();
    let sink = FanoutSink::new().with(Arc::new(metrics.clone()));
    #[cfg(feature = "otel")]
    let sink = sink.with(Arc::new(telemetry::metrics::OtelMetricsSink::init()));

    let controller = Arc::new(ControllerBuilder::new(cfg).with_sink(Arc::new(sink)).build()?);
    let handle = controller.start().await;
    let token = handle.cancellation_token();

    info!(%addr, version = relay_core::VERSION, mode = %controller.modes().mode(), "relay guard listening");
    Server::builder()
        .add_service(RelayGuardService::new(controller.clone()).into_server())
        .serve_with_shutdown(addr, async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
                _ = token.cancelled() => {}
            }
        })
        .await?;

    let ended = handle.shutdown().await;
    let snap = metrics.snapshot();
    info!(
        terminated = ended.len(),
        samples = snap.samples,
        source_failures = snap.source_failures,
        last_cost_ratio = snap.cost_ratio,
        "relay guard shut down"
    );
    Ok(())
}

fn cmd_check_config(config: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = ControllerConfig::resolve(config)?;
    print!("{}", serde_yaml::to_string(&cfg)?);
    Ok(())
}

fn load_events(
    log: &Path,
    f: &Filter<'_>,
) -> Result<Vec<EventRecord<RelayEvent>>, Box<dyn std::error::Error>> {
    let log = JsonlEventLog::open(log)?;
    let mut recs: Vec<EventRecord<RelayEvent>> = log.read_range(f.from, f.to)?;
    if let Some(peer) = f.peer {
        recs.retain(|r| r.payload.peer_id() == Some(peer));
    }
    if let Some(kind) = f.event {
        recs.retain(|r| r.payload.kind() == kind);
    }
    if f.since_ts_ms > 0 {
        recs.retain(|r| r.ts_ms >= f.since_ts_ms);
    }
    if f.max > 0 && recs.len() as u64 > f.max {
        recs.truncate(usize::try_from(f.max).unwrap_or(usize::MAX));
    }
    Ok(recs)
}

fn summarize(recs: &[EventRecord<RelayEvent>]) -> serde_json::Value {
    let mut by_event = BTreeMap::<&str, usize>::new();
    let mut rejections = BTreeMap::<String, usize>::new();
    let mut terminations = BTreeMap::<String, usize>::new();
    let mut transitions = Vec::new();
    for rec in recs {
        *by_event.entry(rec.payload.kind()).or_default() += 1;
        match &rec.payload {
            RelayEvent::SessionRejected { reason, .. } => {
                *rejections.entry(reason.clone()).or_default() += 1;
            }
            RelayEvent::SessionTerminated { cause, .. } => {
                *terminations.entry(cause.to_string()).or_default() += 1;
            }
            RelayEvent::ModeTransition { from, to, terminated, .. } => {
                transitions.push(json!({
                    "id": rec.id, "ts_ms": rec.ts_ms, "from": from, "to": to, "terminated": terminated
                }));
            }
            _ => {}
        }
    }
    json!({
        "total": recs.len(),
        "first_id": recs.first().map_or(0, |r| r.id),
        "last_id": recs.last().map_or(0, |r| r.id),
        "first_ts_ms": recs.first().map_or(0, |r| r.ts_ms),
        "last_ts_ms": recs.last().map_or(0, |r| r.ts_ms),
        "by_event": by_event,
        "rejections_by_reason": rejections,
        "terminations_by_cause": terminations,
        "mode_transitions": transitions,
    })
}

fn cmd_replay(log: &Path, f: &Filter<'_>, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let recs = load_events(log, f)?;
    if dry_run {
        println!("events={}", recs.len());
        return Ok(());
    }
    for rec in &recs {
        println!("id={} ts={} {}", rec.id, rec.ts_ms, serde_json::to_string(&rec.payload)?);
    }
    Ok(())
}
