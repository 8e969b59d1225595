mod shutdown;

pub use shutdown::ShutdownGuard;

use ghost_llm::InferenceBackend;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, EventTag};
use crate::config::GhostCfg;
use crate::cryostasis::{CryostasisController, CryostasisWatch};
use crate::emotion::{AffectStore, AffectView, EmotionEngine, KeywordSentiment, SentimentEstimator};
use crate::memory::{Embedder, MemoryStore};
use crate::monitor::{self, ResourceMonitor};
use crate::orchestrator::{HardwareSensor, Orchestrator, SensorSuite, TimeSensor, TurnDeps};
use crate::types::CryostasisState;

/// External collaborators the runtime is built from.
pub struct Services {
    pub backend: Arc<dyn InferenceBackend>,
    pub store: Arc<dyn MemoryStore>,
    pub embedder: Arc<dyn Embedder>,
    /// `None` disables sampling; cryostasis then only reacts to published samples.
    pub monitor: Option<Box<dyn ResourceMonitor>>,
    pub sentiment: Arc<dyn SentimentEstimator>,
    /// `None` keeps affect in memory only.
    pub affect_store: Option<Arc<dyn AffectStore>>,
}

impl Services {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        store: Arc<dyn MemoryStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            backend,
            store,
            embedder,
            monitor: None,
            sentiment: Arc::new(KeywordSentiment),
            affect_store: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Box<dyn ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_sentiment(mut self, sentiment: Arc<dyn SentimentEstimator>) -> Self {
        self.sentiment = sentiment;
        self
    }

    pub fn with_affect_store(mut self, store: Arc<dyn AffectStore>) -> Self {
        self.affect_store = Some(store);
        self
    }
}

/// Point-in-time view of the running system.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub inference_available: bool,
    pub cryostasis: CryostasisState,
    pub affect_contexts: usize,
    pub context_workers: usize,
    pub subscribers: Vec<(EventTag, usize)>,
}

/// Components built by `new` and handed to their tasks by `start`.
struct Pending {
    controller: CryostasisController,
    engine: EmotionEngine,
    monitor: Option<Box<dyn ResourceMonitor>>,
}

/// Wires every component onto one bus and owns their tasks.
pub struct Runtime {
    cfg: Arc<GhostCfg>,
    shutdown: ShutdownGuard,
    bus: EventBus,
    backend: Arc<dyn InferenceBackend>,
    store: Arc<dyn MemoryStore>,
    embedder: Arc<dyn Embedder>,
    sentiment: Arc<dyn SentimentEstimator>,
    cryostasis: CryostasisWatch,
    affect: AffectView,
    pending: Option<Pending>,
    live_workers: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub fn new(cfg: Arc<GhostCfg>, services: Services) -> Self {
        Self::with_shutdown(cfg, services, ShutdownGuard::new())
    }

    pub fn with_shutdown(cfg: Arc<GhostCfg>, services: Services, shutdown: ShutdownGuard) -> Self {
        let bus = EventBus::new(shutdown.token());
        let (controller, cryostasis) =
            CryostasisController::new(&cfg, Arc::clone(&services.backend), bus.clone());
        let (engine, affect) = EmotionEngine::new(&cfg, bus.clone());
        let engine = match services.affect_store {
            Some(store) => engine.with_store(store),
            None => engine,
        };

        Self {
            cfg,
            shutdown,
            bus,
            backend: services.backend,
            store: services.store,
            embedder: services.embedder,
            sentiment: services.sentiment,
            cryostasis,
            affect,
            pending: Some(Pending { controller, engine, monitor: services.monitor }),
            live_workers: Arc::new(AtomicUsize::new(0)),
            tasks: Vec::new(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    pub fn cryostasis(&self) -> CryostasisWatch {
        self.cryostasis.clone()
    }

    pub fn affect(&self) -> AffectView {
        self.affect.clone()
    }

    pub fn is_started(&self) -> bool {
        self.pending.is_none()
    }

    /// Spawn every component task. Subscriptions are registered before this
    /// returns, so events published afterwards are not missed. Calling it
    /// twice is a no-op. Must be called within a tokio runtime.
    pub fn start(&mut self) {
        let Some(pending) = self.pending.take() else {
            tracing::warn!("runtime already started");
            return;
        };
        let token = self.shutdown.token();

        self.tasks.push(pending.controller.spawn(token.clone()));
        self.tasks.push(
            pending
                .engine
                .spawn(Duration::from_secs(self.cfg.decay_tick_secs), token.clone()),
        );

        let sensors = SensorSuite::new()
            .with(TimeSensor::new())
            .with(HardwareSensor::attach(&self.bus, Some(self.cryostasis.clone())));
        tracing::debug!(sensors = ?sensors.names(), "sensors attached");

        let orchestrator = Orchestrator::new(TurnDeps {
            cfg: Arc::clone(&self.cfg),
            bus: self.bus.clone(),
            backend: Arc::clone(&self.backend),
            affect: self.affect.clone(),
            cryostasis: self.cryostasis.clone(),
            sensors: Arc::new(sensors),
            sentiment: Arc::clone(&self.sentiment),
            store: Arc::clone(&self.store),
            embedder: Arc::clone(&self.embedder),
        });
        self.live_workers = orchestrator.live_workers();
        self.tasks.push(orchestrator.spawn(token.clone()));

        match pending.monitor {
            Some(m) => {
                let interval = Duration::from_millis(self.cfg.sample_interval_ms);
                self.tasks.push(monitor::spawn_sampler(m, self.bus.clone(), interval, token));
                tracing::info!(interval_ms = self.cfg.sample_interval_ms, "resource sampler started");
            }
            None => tracing::info!("no resource monitor, cryostasis follows published samples only"),
        }

        tracing::info!(persona = %self.cfg.persona_name, "ghost runtime started");
    }

    /// Start, then block until shutdown is requested and the tasks wind down.
    pub async fn run(&mut self) {
        self.shutdown.spawn_signal_listener();
        self.start();

        self.shutdown.token().cancelled().await;
        self.stop().await;
    }

    /// Cancel every task and wait up to `shutdown_timeout_secs` for them.
    pub async fn stop(&mut self) {
        self.shutdown.trigger("runtime stop");
        let tasks = std::mem::take(&mut self.tasks);
        let count = tasks.len();
        let limit = Duration::from_secs(self.cfg.shutdown_timeout_secs);

        let joined = tokio::time::timeout(limit, async {
            for task in tasks {
                if let Err(e) = task.await
                    && e.is_panic()
                {
                    tracing::error!(error = %e, "runtime task panicked");
                }
            }
        })
        .await;

        match joined {
            Ok(()) => tracing::info!(tasks = count, "ghost runtime stopped"),
            Err(_) => tracing::warn!(
                timeout_secs = self.cfg.shutdown_timeout_secs,
                "shutdown timed out, abandoning remaining tasks"
            ),
        }
    }

    pub async fn health(&self) -> HealthReport {
        let inference_available = self.backend.is_available().await;
        let cryostasis = self.cryostasis.borrow().clone();
        HealthReport {
            inference_available,
            cryostasis,
            affect_contexts: self.affect.tracked_contexts(),
            context_workers: self.live_workers.load(Ordering::SeqCst),
            subscribers: EventTag::ALL
                .iter()
                .map(|&tag| (tag, self.bus.subscriber_count(tag)))
                .collect(),
        }
    }
}
