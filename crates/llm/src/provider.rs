use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Completion request handed to an inference backend.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Completion response from an inference backend.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Error type for inference operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited")]
    RateLimited,
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("backend returned an empty response")]
    EmptyResponse,
}

/// Boxed future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LlmError>> + Send + 'a>>;

/// A local inference backend whose model can be evicted from and restored to
/// accelerator memory on demand.
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn complete(&self, request: CompletionRequest) -> BackendFuture<'_, CompletionResponse>;

    /// Bring the model into accelerator memory.
    fn load(&self) -> BackendFuture<'_, ()>;

    /// Evict the model from accelerator memory.
    fn unload(&self) -> BackendFuture<'_, ()>;

    /// Cheap reachability probe. Never fails; unreachable means `false`.
    fn is_available(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

/// Scriptable mock backend for tests.
///
/// Completions consume the queued script first and fall back to the fixed
/// response once it is empty. Load/unload calls can be delayed and made to
/// fail, and the mock records how many lifecycle operations overlapped.
#[derive(Debug)]
pub struct MockBackend {
    response: String,
    echo: bool,
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    completion_delay: Duration,
    lifecycle_delay: Duration,
    pending_load_failures: AtomicUsize,
    pending_unload_failures: AtomicUsize,
    loaded: AtomicBool,
    completions: AtomicUsize,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    lifecycle_in_flight: AtomicUsize,
    max_lifecycle_in_flight: AtomicUsize,
    last_request: Mutex<Option<CompletionRequest>>,
}

impl MockBackend {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            echo: false,
            script: Mutex::new(VecDeque::new()),
            completion_delay: Duration::ZERO,
            lifecycle_delay: Duration::ZERO,
            pending_load_failures: AtomicUsize::new(0),
            pending_unload_failures: AtomicUsize::new(0),
            loaded: AtomicBool::new(true),
            completions: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            lifecycle_in_flight: AtomicUsize::new(0),
            max_lifecycle_in_flight: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Reply with `echo: <last user message>`.
    pub fn echo() -> Self {
        Self { echo: true, ..Self::new("") }
    }

    /// Queue per-call outcomes consumed before the fixed response.
    pub fn with_script(self, script: Vec<Result<String, LlmError>>) -> Self {
        *lock(&self.script) = script.into();
        self
    }

    /// Make the next `n` completions fail with `RequestFailed`.
    pub fn failing_first(self, n: usize) -> Self {
        let script = (0..n)
            .map(|i| Err(LlmError::RequestFailed(format!("scripted failure {}", i + 1))))
            .collect();
        self.with_script(script)
    }

    pub fn with_completion_delay(mut self, delay: Duration) -> Self {
        self.completion_delay = delay;
        self
    }

    pub fn with_lifecycle_delay(mut self, delay: Duration) -> Self {
        self.lifecycle_delay = delay;
        self
    }

    pub fn fail_next_loads(&self, n: usize) {
        self.pending_load_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_unloads(&self, n: usize) {
        self.pending_unload_failures.store(n, Ordering::SeqCst);
    }

    pub fn completion_calls(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn load_calls(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_calls(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    /// Highest number of load/unload calls observed running at once.
    pub fn max_concurrent_lifecycle(&self) -> usize {
        self.max_lifecycle_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        lock(&self.last_request).clone()
    }

    async fn lifecycle(&self, counter: &AtomicUsize, failures: &AtomicUsize, loaded: bool) -> Result<(), LlmError> {
        counter.fetch_add(1, Ordering::SeqCst);
        let running = self.lifecycle_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_lifecycle_in_flight.fetch_max(running, Ordering::SeqCst);

        if !self.lifecycle_delay.is_zero() {
            tokio::time::sleep(self.lifecycle_delay).await;
        }
        self.lifecycle_in_flight.fetch_sub(1, Ordering::SeqCst);

        let failed = failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(LlmError::Unavailable("scripted lifecycle failure".into()));
        }
        self.loaded.store(loaded, Ordering::SeqCst);
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InferenceBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn complete(&self, request: CompletionRequest) -> BackendFuture<'_, CompletionResponse> {
        Box::pin(async move {
            self.completions.fetch_add(1, Ordering::SeqCst);
            if !self.completion_delay.is_zero() {
                tokio::time::sleep(self.completion_delay).await;
            }

            let scripted = lock(&self.script).pop_front();
            let content = match scripted {
                Some(outcome) => outcome?,
                None if self.echo => {
                    let last = request
                        .messages
                        .iter()
                        .rev()
                        .find(|m| m.role == Role::User)
                        .map(|m| m.content.clone())
                        .unwrap_or_default();
                    format!("echo: {last}")
                }
                None => self.response.clone(),
            };
            *lock(&self.last_request) = Some(request);

            Ok(CompletionResponse { content, input_tokens: 10, output_tokens: 20 })
        })
    }

    fn load(&self) -> BackendFuture<'_, ()> {
        Box::pin(self.lifecycle(&self.loads, &self.pending_load_failures, true))
    }

    fn unload(&self) -> BackendFuture<'_, ()> {
        Box::pin(self.lifecycle(&self.unloads, &self.pending_unload_failures, false))
    }

    fn is_available(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async { true })
    }
}
