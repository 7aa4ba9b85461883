//! Wiring and background loops.

use crate::admission::{AdmissionController, TransitionReport};
use crate::config::ControllerConfig;
use crate::registry::SessionRegistry;
use crate::stats::StatsReporter;
use budget::{CostMonitor, CostSource, FileCostSource, ModeController};
use event_log::{EventLogError, JsonlEventLog};
use policy::TierPolicy;
use relay_core::{Clock, ConfigError, MetricsSink, NoopSink, Session, SystemClock, TerminationCause};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ControllerBuilder {
    cfg: ControllerConfig,
    source: Option<Arc<dyn CostSource>>,
    sink: Option<Arc<dyn MetricsSink>>,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<JsonlEventLog>,
}

impl ControllerBuilder {
    pub fn new(cfg: ControllerConfig) -> Self {
        Self { cfg, source: None, sink: None, clock: None, audit: None }
    }

    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn CostSource>) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn with_audit_log(mut self, log: JsonlEventLog) -> Self {
        self.audit = Some(log);
        self
    }

    /// Validate the configuration and assemble every component.
    ///
    /// Without an explicit source, `cost_source_path` must name a JSON file.
    /// Without an explicit audit log, `audit_log_path` is opened if set.
    pub fn build(self) -> Result<Controller, ConfigError> {
        let cfg = self.cfg;
        cfg.validate()?;
        let source: Arc<dyn CostSource> = match (self.source, &cfg.cost_source_path) {
            (Some(s), _) => s,
            (None, Some(path)) => Arc::new(FileCostSource::new(path)),
            (None, None) => {
                return Err(ConfigError::invalid("no cost source: set cost_source_path"));
            }
        };
        let audit = match (self.audit, &cfg.audit_log_path) {
            (Some(log), _) => Some(log),
            (None, Some(path)) => {
                let display = path.display().to_string();
                Some(JsonlEventLog::open(path).map_err(|e| match e {
                    EventLogError::Io(source) => ConfigError::Io { path: display, source },
                    other => ConfigError::Parse { path: display, message: other.to_string() },
                })?)
            }
            (None, None) => None,
        };
        let sink = self.sink.unwrap_or_else(|| Arc::new(NoopSink));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let policy = Arc::new(TierPolicy::new(cfg.policy.clone())?);
        let monitor =
            Arc::new(CostMonitor::new(source, cfg.monitor_config(), sink.clone(), clock.clone())?);
        let modes =
            Arc::new(ModeController::starting_at(cfg.thresholds, monitor.latest().cost_ratio)?);
        let registry = Arc::new(SessionRegistry::new(policy.clone(), clock.clone()));
        let mut admission = AdmissionController::new(
            monitor.clone(),
            modes.clone(),
            policy.clone(),
            registry.clone(),
            clock.clone(),
        )
        .with_idle_timeout(cfg.idle_timeout());
        if let Some(log) = audit {
            admission = admission.with_audit_log(log);
        }
        let admission = Arc::new(admission);
        let stats = Arc::new(StatsReporter::new(
            monitor.clone(),
            modes.clone(),
            registry.clone(),
            admission.decisions().clone(),
            clock,
        ));
        Ok(Controller { cfg, monitor, modes, policy, registry, admission, stats, sink })
    }
}

/// Assembled controller. Cheap to share behind `Arc`.
pub struct Controller {
    cfg: ControllerConfig,
    monitor: Arc<CostMonitor>,
    modes: Arc<ModeController>,
    policy: Arc<TierPolicy>,
    registry: Arc<SessionRegistry>,
    admission: Arc<AdmissionController>,
    stats: Arc<StatsReporter>,
    sink: Arc<dyn MetricsSink>,
}

impl Controller {
    pub fn config(&self) -> &ControllerConfig {
        &self.cfg
    }

    pub fn monitor(&self) -> &Arc<CostMonitor> {
        &self.monitor
    }

    pub fn modes(&self) -> &Arc<ModeController> {
        &self.modes
    }

    pub fn policy(&self) -> &Arc<TierPolicy> {
        &self.policy
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn stats(&self) -> &Arc<StatsReporter> {
        &self.stats
    }

    /// One poll cycle: query the source, apply any transition, report session count.
    pub async fn poll_once(&self) -> Option<TransitionReport> {
        poll_cycle(&self.monitor, &self.admission, self.sink.as_ref()).await
    }

    /// Run an initial poll, then spawn the poll and reap loops.
    pub async fn start(&self) -> RuntimeHandle {
        let _ = self.poll_once().await;
        let cancel = CancellationToken::new();
        let poll = spawn_poll_loop(
            self.monitor.clone(),
            self.admission.clone(),
            self.sink.clone(),
            self.cfg.poll_interval(),
            cancel.clone(),
        );
        let reap = spawn_reap_loop(self.admission.clone(), self.cfg.reap_interval(), cancel.clone());
        info!(
            poll_interval_secs = self.cfg.poll_interval_secs,
            reap_interval_secs = self.cfg.reap_interval_secs,
            mode = %self.modes.mode(),
            "relay guard started"
        );
        RuntimeHandle {
            cancel,
            tasks: vec![poll, reap],
            admission: self.admission.clone(),
            terminate_on_shutdown: self.cfg.terminate_on_shutdown,
        }
    }
}

async fn poll_cycle(
    monitor: &CostMonitor,
    admission: &AdmissionController,
    sink: &dyn MetricsSink,
) -> Option<TransitionReport> {
    let metrics = monitor.poll().await;
    let report = admission.apply_cost_sample(&metrics);
    sink.record_active_sessions(admission.registry().len());
    report
}

fn spawn_poll_loop(
    monitor: Arc<CostMonitor>,
    admission: Arc<AdmissionController>,
    sink: Arc<dyn MetricsSink>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("cost poll loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let _ = poll_cycle(&monitor, &admission, sink.as_ref()).await;
                }
            }
        }
    })
}

fn spawn_reap_loop(
    admission: Arc<AdmissionController>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("session reap loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let _ = admission.reap();
                }
            }
        }
    })
}

/// Handle to the running loops.
pub struct RuntimeHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    admission: Arc<AdmissionController>,
    terminate_on_shutdown: bool,
}

impl RuntimeHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop both loops, then end every session unless configured otherwise.
    pub async fn shutdown(self) -> Vec<Session> {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background loop ended abnormally");
            }
        }
        if !self.terminate_on_shutdown {
            info!("relay guard stopped; sessions left in place");
            return Vec::new();
        }
        let ended = self.admission.terminate_all(TerminationCause::ControllerShutdown);
        info!(terminated = ended.len(), "relay guard stopped");
        ended
    }
}
