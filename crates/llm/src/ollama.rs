use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::provider::{
    BackendFuture, ChatMessage, CompletionRequest, CompletionResponse, InferenceBackend, LlmError,
};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";
/// How long Ollama keeps the model resident after an explicit load.
const RESIDENT_KEEP_ALIVE: &str = "30m";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// `keep_alive` accepts either a duration string or a number of seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
enum KeepAlive {
    Duration(&'static str),
    Seconds(u32),
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ChatResponseMessage>,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// A `/api/generate` call without a prompt only changes residency.
#[derive(Serialize)]
struct ResidencyRequest<'a> {
    model: &'a str,
    keep_alive: KeepAlive,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Ollama HTTP backend.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embed_model: String,
}

impl OllamaBackend {
    pub fn new(model: String, base_url: Option<String>, embed_model: Option<String>) -> Self {
        let base = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        Self {
            client: reqwest::Client::new(),
            base_url: base.trim_end_matches('/').to_owned(),
            model,
            embed_model: embed_model.unwrap_or_else(|| DEFAULT_EMBED_MODEL.to_owned()),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/{path}", self.base_url)
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<reqwest::Response, LlmError> {
        let resp = self
            .client
            .post(self.endpoint(path))
            .timeout(REQUEST_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(map_transport)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(check_error(status, text));
        }
        Ok(resp)
    }

    async fn chat(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages: &request.messages,
            stream: false,
            options: ChatOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };
        let api: ChatResponse = self
            .post("chat", &body)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let content = api.message.map(|m| m.content).unwrap_or_default();
        if content.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(CompletionResponse {
            content,
            input_tokens: api.prompt_eval_count,
            output_tokens: api.eval_count,
        })
    }

    async fn set_residency(&self, keep_alive: KeepAlive) -> Result<(), LlmError> {
        let body = ResidencyRequest { model: &self.model, keep_alive };
        self.post("generate", &body).await?;
        tracing::debug!(model = %self.model, ?body.keep_alive, "ollama residency updated");
        Ok(())
    }

    /// Embed `text` with the configured embedding model.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let body = EmbeddingRequest { model: &self.embed_model, prompt: text };
        let api: EmbeddingResponse = self
            .post("embeddings", &body)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        if api.embedding.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(api.embedding)
    }
}

fn map_transport(e: reqwest::Error) -> LlmError {
    if e.is_connect() || e.is_timeout() {
        LlmError::Unavailable(e.to_string())
    } else {
        LlmError::RequestFailed(e.to_string())
    }
}

/// Parse error response, returning RateLimited for 429.
fn check_error(status: reqwest::StatusCode, body: String) -> LlmError {
    match status.as_u16() {
        429 => LlmError::RateLimited,
        503 => LlmError::Unavailable(body),
        _ => LlmError::RequestFailed(format!("{status}: {body}")),
    }
}

impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn complete(&self, request: CompletionRequest) -> BackendFuture<'_, CompletionResponse> {
        Box::pin(self.chat(request))
    }

    fn load(&self) -> BackendFuture<'_, ()> {
        Box::pin(self.set_residency(KeepAlive::Duration(RESIDENT_KEEP_ALIVE)))
    }

    fn unload(&self) -> BackendFuture<'_, ()> {
        Box::pin(self.set_residency(KeepAlive::Seconds(0)))
    }

    fn is_available(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            match self.client.get(self.endpoint("tags")).timeout(PROBE_TIMEOUT).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(e) => {
                    tracing::debug!(error = %e, "ollama probe failed");
                    false
                }
            }
        })
    }
}

/// Build an Ollama backend from environment variables.
/// Reads `GHOST_OLLAMA_MODEL`, optionally `GHOST_OLLAMA_URL` and `GHOST_EMBED_MODEL`.
/// Returns `None` if the model is not set.
pub fn from_env() -> Option<OllamaBackend> {
    let model = std::env::var("GHOST_OLLAMA_MODEL").ok()?;
    let base_url = std::env::var("GHOST_OLLAMA_URL").ok();
    let embed_model = std::env::var("GHOST_EMBED_MODEL").ok();
    Some(OllamaBackend::new(model, base_url, embed_model))
}
