//! Composition root.
//!
//! Wires the gateway, controller, analyzer, ETL, scheduler, limiter, and
//! evaluator together, owns the background tickers, and runs the two-phase
//! shutdown. There is no hidden global state: everything a component needs
//! arrives through this constructor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::backpressure::{BackpressureController, ExternalSignals};
use crate::config::{ConfigError, CoreConfig};
use crate::etl::{EtlPipeline, SchemaValidator, StorageSink, UpdateBroadcaster};
use crate::gateway::{default_streams, GatewayError, StreamGateway};
use crate::load::LoadSnapshot;
use crate::ratelimit::{MemoryWindowStore, MultiWindowLimiter};
use crate::scheduler::FairShareScheduler;
use crate::slo::SloEvaluator;
use crate::strategy::StrategyAnalyzer;
use crate::telemetry::SharedSink;

/// Source of the resource signals the monitor ticker samples. Memory and
/// CPU readings are host-specific, so the composition root takes them
/// through this seam.
pub trait SignalSource: Send + Sync {
    fn sample(&self) -> ExternalSignals;
}

/// Fixed (but settable) signals; default source when none is wired.
#[derive(Default)]
pub struct StaticSignals {
    current: Mutex<ExternalSignals>,
}

impl StaticSignals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, signals: ExternalSignals) {
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = signals;
    }
}

impl SignalSource for StaticSignals {
    fn sample(&self) -> ExternalSignals {
        *self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// The assembled control plane.
pub struct ControlPlane {
    gateway: Arc<dyn StreamGateway>,
    controller: Arc<BackpressureController>,
    analyzer: Arc<StrategyAnalyzer>,
    scheduler: Arc<FairShareScheduler>,
    limiter: Arc<MultiWindowLimiter<MemoryWindowStore>>,
    slo: Arc<SloEvaluator>,
    etl: Arc<EtlPipeline>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop: tokio::sync::watch::Sender<bool>,
    shutdown_started: AtomicBool,
}

impl ControlPlane {
    /// Validate config, provision default streams, wire the components,
    /// and spawn the background workers.
    pub async fn start(
        config: CoreConfig,
        gateway: Arc<dyn StreamGateway>,
        storage: Arc<dyn StorageSink>,
        broadcaster: Arc<dyn UpdateBroadcaster>,
        signals: Arc<dyn SignalSource>,
        sink: SharedSink,
    ) -> Result<Arc<Self>, StartError> {
        config.validate()?;

        for stream in default_streams() {
            gateway.create_stream(stream).await?;
        }

        let limiter = Arc::new(MultiWindowLimiter::in_memory(sink.clone()));
        for limit in &config.rate_limits {
            limiter.upsert_config(limit.clone()).await;
        }

        let slo = Arc::new(SloEvaluator::new(sink.clone()));
        for slo_config in &config.slos {
            slo.upsert_config(slo_config.clone()).await.map_err(|source| {
                ConfigError::BadSlo { name: slo_config.name.clone(), source }
            })?;
        }

        let controller = Arc::new(BackpressureController::new(
            config.backpressure.clone(),
            gateway.clone(),
            sink.clone(),
        ));
        let analyzer = Arc::new(StrategyAnalyzer::new(sink.clone()));
        let scheduler = Arc::new(FairShareScheduler::new(
            config.scheduler.clone(),
            controller.clone(),
            limiter.clone(),
            sink.clone(),
        ));
        let etl = Arc::new(EtlPipeline::new(
            config.etl.clone(),
            gateway.clone(),
            Arc::new(SchemaValidator::new(config.schema)),
            storage,
            broadcaster,
            Some(slo.clone()),
            sink.clone(),
        ));
        etl.init().await?;

        let (stop, _) = tokio::sync::watch::channel(false);
        let mut tasks = Vec::new();

        // monitoring ticker: resource sampling and ladder updates
        {
            let controller = controller.clone();
            let signals = signals.clone();
            let mut stop_rx = stop.subscribe();
            let interval = config.tickers.monitor_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => controller.monitor_tick(signals.sample()),
                        _ = stop_rx.changed() => break,
                    }
                }
            }));
        }

        // drain ticker: priority-queue dispatch
        {
            let controller = controller.clone();
            let mut stop_rx = stop.subscribe();
            let interval = config.tickers.drain_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => { controller.drain_tick().await; }
                        _ = stop_rx.changed() => break,
                    }
                }
            }));
        }

        // trend ticker: strategy reevaluation
        {
            let controller = controller.clone();
            let analyzer = analyzer.clone();
            let slo = slo.clone();
            let mut stop_rx = stop.subscribe();
            let interval = config.tickers.trend_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let violations = slo.violations().await;
                            analyzer.evaluate(
                                &controller.state(),
                                &controller.metrics(),
                                &violations,
                            );
                        }
                        _ = stop_rx.changed() => break,
                    }
                }
            }));
        }

        // breach ticker: SLO alert scan
        {
            let slo = slo.clone();
            let mut stop_rx = stop.subscribe();
            let interval = config.tickers.breach_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => { slo.check_breaches().await; }
                        _ = stop_rx.changed() => break,
                    }
                }
            }));
        }

        // ETL worker loop
        {
            let etl = etl.clone();
            tasks.push(tokio::spawn(async move {
                etl.run().await;
            }));
        }

        tracing::info!("control plane started");
        Ok(Arc::new(Self {
            gateway,
            controller,
            analyzer,
            scheduler,
            limiter,
            slo,
            etl,
            tasks: Mutex::new(tasks),
            stop,
            shutdown_started: AtomicBool::new(false),
        }))
    }

    pub fn gateway(&self) -> &Arc<dyn StreamGateway> {
        &self.gateway
    }

    pub fn controller(&self) -> &Arc<BackpressureController> {
        &self.controller
    }

    pub fn analyzer(&self) -> &Arc<StrategyAnalyzer> {
        &self.analyzer
    }

    pub fn scheduler(&self) -> &Arc<FairShareScheduler> {
        &self.scheduler
    }

    pub fn limiter(&self) -> &Arc<MultiWindowLimiter<MemoryWindowStore>> {
        &self.limiter
    }

    pub fn slo(&self) -> &Arc<SloEvaluator> {
        &self.slo
    }

    pub fn etl(&self) -> &Arc<EtlPipeline> {
        &self.etl
    }

    /// The header contract evaluated against the current snapshot.
    pub fn load_snapshot(&self) -> LoadSnapshot {
        LoadSnapshot::from_state(&self.controller.state())
    }

    /// Two-phase drain: stop intake, drain queues until empty or the
    /// deadline lapses, then stop the workers. Safe to call repeatedly.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return self.controller.shutdown(deadline).await;
        }
        tracing::info!("control plane shutting down");

        let drained = self.controller.shutdown(deadline).await;
        self.etl.stop().await;
        let _ = self.stop.send(true);

        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!(drained, "control plane stopped");
        drained
    }
}
