use chrono::{Local, Timelike};
use ghost_llm::{CompletionRequest, InferenceBackend};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::prompt::{self, PromptParts};
use super::retry::{self, InferenceOutcome, RetryPolicy};
use super::sensors::SensorSuite;
use crate::bus::{Event, EventBus};
use crate::config::GhostCfg;
use crate::cryostasis::CryostasisWatch;
use crate::emotion::{AffectView, SentimentEstimator, is_apology, phase_name};
use crate::memory::{Embedder, MemoryAssembler, MemoryStore};
use crate::types::{ContextId, InboundMessage, OutboundResponse};

/// Shared collaborators of every turn worker.
pub struct TurnDeps {
    pub cfg: Arc<GhostCfg>,
    pub bus: EventBus,
    pub backend: Arc<dyn InferenceBackend>,
    pub affect: AffectView,
    pub cryostasis: CryostasisWatch,
    pub sensors: Arc<SensorSuite>,
    pub sentiment: Arc<dyn SentimentEstimator>,
    pub store: Arc<dyn MemoryStore>,
    pub embedder: Arc<dyn Embedder>,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    Model(String),
    Fallback,
}

/// Processes the messages of one context strictly in arrival order.
pub struct ContextWorker {
    context_id: ContextId,
    deps: Arc<TurnDeps>,
    memory: MemoryAssembler,
    retry: RetryPolicy,
}

impl ContextWorker {
    pub fn new(context_id: ContextId, deps: Arc<TurnDeps>) -> Self {
        let memory = MemoryAssembler::new(
            context_id.clone(),
            deps.cfg.episodic_buffer_size,
            deps.cfg.context_budget_chars,
            Arc::clone(&deps.store),
            Arc::clone(&deps.embedder),
        );
        let retry = RetryPolicy::from_cfg(&deps.cfg);
        Self { context_id, deps, memory, retry }
    }

    /// Serve `rx` until it closes or `cancel` fires. `pending` counts queued
    /// messages; it is decremented as each turn completes.
    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<InboundMessage>,
        pending: Arc<AtomicUsize>,
        cancel: CancellationToken,
    ) {
        let restored = self.memory.hydrate().await;
        if restored > 0 {
            tracing::debug!(context = %self.context_id, records = restored, "recent memory reloaded");
        }

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(m) => m,
                    None => break,
                },
            };
            self.handle(message).await;
            pending.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::debug!(context = %self.context_id, "context worker stopped");
    }

    /// Run one turn under the turn deadline. Always publishes exactly one response.
    pub async fn handle(&mut self, message: InboundMessage) {
        let deadline = Duration::from_millis(self.deps.cfg.turn_timeout_ms);
        let reply = match timeout(deadline, self.turn(&message)).await {
            Ok(reply) => reply,
            Err(_) => {
                tracing::warn!(context = %self.context_id, message = %message.id, "turn timed out, sending fallback");
                let _ = self.memory.record_turn(&message.speaker, &message.text, &self.deps.cfg.persona_name, None);
                Reply::Fallback
            }
        };

        let (text, fallback) = match reply {
            Reply::Model(text) => (text, false),
            Reply::Fallback => (self.deps.cfg.fallback_message.clone(), true),
        };
        self.deps.bus.publish(Event::OutboundResponse(OutboundResponse {
            context_id: self.context_id.clone(),
            in_reply_to: message.id,
            text,
            fallback,
        }));
    }

    async fn turn(&mut self, message: &InboundMessage) -> Reply {
        let deps = Arc::clone(&self.deps);
        let cfg = &deps.cfg;

        let affect = deps.affect.snapshot(&self.context_id);
        let delta = deps.sentiment.estimate(&message.text);
        let apology = is_apology(&message.text);
        if !delta.is_zero() || apology {
            let reason = if apology { "apology" } else { "message sentiment" };
            deps.bus.publish(Event::AffectStimulus {
                context_id: self.context_id.clone(),
                delta,
                reason: reason.into(),
            });
        }

        let context = self.memory.assemble(&message.text, cfg.retrieval_k).await;
        if context.degraded {
            tracing::info!(context = %self.context_id, "replying without long-term memory");
        }

        let phase = phase_name(Local::now().hour());
        let sensor_context = deps.sensors.gather();
        let parts = PromptParts {
            persona_name: &cfg.persona_name,
            persona_prompt: &cfg.persona_prompt,
            affect: &affect,
            phase,
            sensor_context: &sensor_context,
        };
        let request = CompletionRequest {
            messages: prompt::build_messages(&parts, &context, message),
            max_tokens: cfg.max_output_tokens,
            temperature: cfg.temperature,
        };

        let reply = if self.await_resident().await {
            match retry::complete_with_retry(deps.backend.as_ref(), &request, self.retry).await {
                InferenceOutcome::Completed { response, attempts } => {
                    tracing::debug!(context = %self.context_id, attempts, tokens = response.output_tokens, "reply generated");
                    Reply::Model(response.content)
                }
                InferenceOutcome::Exhausted { attempts, last_error } => {
                    self.inference_failed(attempts, last_error.to_string());
                    Reply::Fallback
                }
            }
        } else {
            self.inference_failed(0, "model did not become resident in time".into());
            Reply::Fallback
        };

        let model_text = match &reply {
            Reply::Model(text) => Some(text.as_str()),
            Reply::Fallback => None,
        };
        // Persistence continues in the background.
        let _ = self.memory.record_turn(&message.speaker, &message.text, &cfg.persona_name, model_text);
        reply
    }

    fn inference_failed(&self, attempts: u32, error: String) {
        tracing::warn!(context = %self.context_id, attempts, error = %error, "inference failed, using fallback");
        self.deps.bus.publish(Event::InferenceFailed {
            context_id: self.context_id.clone(),
            attempts,
            error,
        });
    }

    /// Returns once the model accepts inference. If it is unloaded, asks for a
    /// reload; a thinking signal goes out if the grace period passes first.
    async fn await_resident(&self) -> bool {
        let mut rx = self.deps.cryostasis.clone();
        let accepts = rx.borrow().accepts_inference();
        if accepts {
            return true;
        }

        self.deps.bus.publish(Event::ReloadRequested { context_id: Some(self.context_id.clone()) });
        let grace = Duration::from_millis(self.deps.cfg.reload_grace_ms);
        let total = Duration::from_millis(self.deps.cfg.reload_timeout_ms);

        let ready = matches!(timeout(grace, rx.wait_for(|s| s.accepts_inference())).await, Ok(Ok(_)));
        if ready {
            return true;
        }

        tracing::info!(context = %self.context_id, "model still loading, sending thinking signal");
        self.deps.bus.publish(Event::Thinking {
            context_id: self.context_id.clone(),
            text: self.deps.cfg.thinking_message.clone(),
        });
        let remaining = total.saturating_sub(grace);
        matches!(timeout(remaining, rx.wait_for(|s| s.accepts_inference())).await, Ok(Ok(_)))
    }
}
