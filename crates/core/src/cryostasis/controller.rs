use chrono::Utc;
use ghost_llm::InferenceBackend;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::policy::{CryostasisMachine, Directive};
use crate::bus::{Event, EventBus, EventTag};
use crate::config::GhostCfg;
use crate::types::{CryostasisState, LifecycleOp, ResourceSample};

/// Read-only view of the residency state.
pub type CryostasisWatch = watch::Receiver<CryostasisState>;

#[derive(Debug)]
enum OpResult {
    Done,
    Failed(String),
    Cancelled,
}

#[derive(Debug)]
enum Command {
    Sample(ResourceSample),
    Reload,
    Finished { op: LifecycleOp, result: OpResult },
}

/// Cryostasis actor. Owns the state machine and is the only caller of the
/// backend's `load`/`unload`.
pub struct CryostasisController {
    machine: CryostasisMachine,
    backend: Arc<dyn InferenceBackend>,
    bus: EventBus,
    tx: watch::Sender<CryostasisState>,
    inbox_tx: mpsc::UnboundedSender<Command>,
    inbox_rx: mpsc::UnboundedReceiver<Command>,
}

impl CryostasisController {
    pub fn new(cfg: &GhostCfg, backend: Arc<dyn InferenceBackend>, bus: EventBus) -> (Self, CryostasisWatch) {
        let machine = CryostasisMachine::new(cfg, Utc::now());
        let (tx, rx) = watch::channel(machine.state().clone());
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        (Self { machine, backend, bus, tx, inbox_tx, inbox_rx }, rx)
    }

    /// Subscribe to samples and reload requests, then run until cancelled.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        let inbox = self.inbox_tx.clone();
        self.bus.subscribe_fn(EventTag::ResourceSampled, move |event| {
            let inbox = inbox.clone();
            async move {
                if let Event::ResourceSampled(sample) = event {
                    inbox
                        .send(Command::Sample(sample))
                        .map_err(|_| anyhow::anyhow!("cryostasis controller stopped"))?;
                }
                Ok(())
            }
        });
        let inbox = self.inbox_tx.clone();
        self.bus.subscribe_fn(EventTag::ReloadRequested, move |_| {
            let inbox = inbox.clone();
            async move {
                inbox
                    .send(Command::Reload)
                    .map_err(|_| anyhow::anyhow!("cryostasis controller stopped"))?;
                Ok(())
            }
        });

        tokio::spawn(async move {
            loop {
                let cmd = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("cryostasis controller shutting down");
                        break;
                    }
                    cmd = self.inbox_rx.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => break,
                    },
                };
                self.handle(cmd, &cancel);
            }
        })
    }

    fn handle(&mut self, cmd: Command, cancel: &CancellationToken) {
        let directive = match cmd {
            Command::Sample(sample) => self.machine.observe(&sample, Utc::now()),
            Command::Reload => {
                tracing::debug!(phase = %self.machine.state().phase, "reload requested");
                self.machine.request_reload()
            }
            Command::Finished { op, result } => {
                let succeeded = match &result {
                    OpResult::Done => {
                        tracing::info!(op = op.as_str(), "lifecycle operation completed");
                        true
                    }
                    OpResult::Failed(e) => {
                        tracing::warn!(op = op.as_str(), error = %e, "lifecycle operation failed");
                        false
                    }
                    OpResult::Cancelled => {
                        tracing::info!(op = op.as_str(), "lifecycle operation cancelled");
                        false
                    }
                };
                self.machine.finish(op, succeeded, Utc::now())
            }
        };
        self.apply(directive, cancel);
        self.tx.send_replace(self.machine.state().clone());
    }

    fn apply(&self, directive: Directive, cancel: &CancellationToken) {
        if let Some(t) = directive.transition {
            tracing::info!(from = %t.from, to = %t.to, reason = %t.reason, "cryostasis transition");
            self.bus.publish(Event::CryostasisTransitioned {
                from: t.from,
                to: t.to,
                reason: t.reason,
                at: self.machine.state().last_transition_at,
            });
        }
        if let Some((op, reason)) = directive.start {
            tracing::info!(op = op.as_str(), %reason, "starting lifecycle operation");
            self.run_op(op, cancel.child_token());
        }
    }

    fn run_op(&self, op: LifecycleOp, cancel: CancellationToken) {
        let backend = Arc::clone(&self.backend);
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let call = async {
                match op {
                    LifecycleOp::Load => backend.load().await,
                    LifecycleOp::Unload => backend.unload().await,
                }
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => OpResult::Cancelled,
                r = call => match r {
                    Ok(()) => OpResult::Done,
                    Err(e) => OpResult::Failed(e.to_string()),
                },
            };
            // Controller gone means shutdown; nothing left to report to.
            let _ = inbox.send(Command::Finished { op, result });
        });
    }
}
