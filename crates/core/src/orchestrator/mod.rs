//! Turn pipeline. Inbound messages are routed to one worker per context:
//! sequential within a context, concurrent across contexts.

pub mod pipeline;
pub mod prompt;
pub mod retry;
pub mod sensors;

pub use pipeline::{ContextWorker, TurnDeps};
pub use retry::{InferenceOutcome, RetryPolicy};
pub use sensors::{HardwareSensor, Sensor, SensorSuite, TimeSensor};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bus::{Event, EventTag};
use crate::types::{ContextId, InboundMessage};

/// Longest pause between idle-worker sweeps.
const MAX_REAP_INTERVAL: Duration = Duration::from_secs(60);

struct WorkerSlot {
    tx: mpsc::UnboundedSender<InboundMessage>,
    /// Messages routed but not yet answered.
    pending: Arc<AtomicUsize>,
    last_routed: Instant,
}

pub struct Orchestrator {
    deps: Arc<TurnDeps>,
    workers: HashMap<ContextId, WorkerSlot>,
    idle_after: Duration,
    live: Arc<AtomicUsize>,
}

impl Orchestrator {
    pub fn new(deps: TurnDeps) -> Self {
        let idle_after = Duration::from_secs(deps.cfg.worker_idle_secs.max(1));
        Self { deps: Arc::new(deps), workers: HashMap::new(), idle_after, live: Arc::new(AtomicUsize::new(0)) }
    }

    /// Number of running context workers, kept current by the routing task.
    pub fn live_workers(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live)
    }

    /// Subscribe to `InboundMessage` and route until cancelled. Workers idle
    /// for `worker_idle_secs` with nothing queued are stopped.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();
        self.deps.bus.subscribe_fn(EventTag::InboundMessage, move |event| {
            let inbox = inbox_tx.clone();
            async move {
                if let Event::InboundMessage(message) = event {
                    inbox
                        .send(message)
                        .map_err(|_| anyhow::anyhow!("orchestrator stopped"))?;
                }
                Ok(())
            }
        });

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval((self.idle_after / 2).clamp(Duration::from_millis(100), MAX_REAP_INTERVAL));
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            sweep.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!(contexts = self.workers.len(), "orchestrator shutting down");
                        break;
                    }
                    _ = sweep.tick() => self.reap_idle(Instant::now()),
                    next = inbox_rx.recv() => match next {
                        Some(message) => self.route(message, &cancel),
                        None => break,
                    },
                }
            }
        })
    }

    fn route(&mut self, message: InboundMessage, cancel: &CancellationToken) {
        let context_id = message.context_id.clone();
        let message = match self.workers.get_mut(&context_id) {
            Some(slot) => {
                slot.pending.fetch_add(1, Ordering::SeqCst);
                slot.last_routed = Instant::now();
                match slot.tx.send(message) {
                    Ok(()) => return,
                    // Worker exited; start a fresh one below.
                    Err(mpsc::error::SendError(message)) => message,
                }
            }
            None => message,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(1));
        let worker = ContextWorker::new(context_id.clone(), Arc::clone(&self.deps));
        tokio::spawn(worker.run(rx, Arc::clone(&pending), cancel.child_token()));
        tracing::debug!(context = %context_id, "context worker started");

        if tx.send(message).is_err() {
            tracing::warn!(context = %context_id, "new context worker closed before first message");
        }
        self.workers.insert(context_id, WorkerSlot { tx, pending, last_routed: Instant::now() });
        self.live.store(self.workers.len(), Ordering::SeqCst);
    }

    /// Drop workers with nothing queued that have not been routed to since
    /// `idle_after`. Closing the sender ends the worker task.
    fn reap_idle(&mut self, now: Instant) {
        let idle_after = self.idle_after;
        let before = self.workers.len();
        self.workers.retain(|context_id, slot| {
            let idle = slot.pending.load(Ordering::SeqCst) == 0
                && now.saturating_duration_since(slot.last_routed) >= idle_after;
            if idle {
                tracing::debug!(context = %context_id, "idle context worker stopped");
            }
            !idle
        });
        if self.workers.len() != before {
            self.live.store(self.workers.len(), Ordering::SeqCst);
        }
    }
}
