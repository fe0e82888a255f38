//! Inference engine adapter: local language-model sessions behind one registry.
//!
//! Loading a model is expensive (download + compile), so the registry memoizes the
//! in-flight initialization: every caller asking for the same model while it loads
//! awaits the same `OnceCell`, and the backend's `load` runs once. A failed load is
//! memoized too; callers treat it as permanent for the session.
//!
//! Generation always runs under a hard timeout, and [`generate_with_recovery`]
//! applies the single degraded-retry policy used for both replies and summaries.

use crate::error::InferenceError;
use crate::message::ConversationMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Load progress reported by a backend (0–100).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadProgress {
    pub percent: u8,
    pub text: String,
}

impl LoadProgress {
    pub fn new(percent: u8, text: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            text: text.into(),
        }
    }
}

/// Callback receiving load progress.
pub type ProgressFn = Arc<dyn Fn(LoadProgress) + Send + Sync>;

/// Progress callback that drops every update.
pub fn ignore_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// Per-request generation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl GenerationOptions {
    pub fn new(max_tokens: u32, temperature: f32, timeout: Duration) -> Self {
        Self {
            max_tokens,
            temperature,
            timeout,
        }
    }
}

/// A loaded model that can complete chat prompts.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_id(&self) -> &str;

    async fn complete(
        &self,
        messages: &[ConversationMessage],
        options: &GenerationOptions,
    ) -> Result<String, InferenceError>;

    /// Release runtime resources. Called when the registry switches models.
    async fn unload(&self) {}
}

/// Shared handle to a loaded model.
pub type Engine = Arc<dyn LanguageModel>;

/// Runtime able to load models (browser-hosted runtime, llama.cpp server, ...).
#[async_trait]
pub trait EngineBackend: Send + Sync {
    async fn load(&self, model_id: &str, progress: ProgressFn) -> Result<Engine, InferenceError>;
}

/// Lifecycle of the registry's current model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EngineStatus {
    NotLoaded,
    Loading { model_id: String },
    Ready { model_id: String },
    Unavailable { model_id: String, reason: String },
}

type InitCell = Arc<OnceCell<Result<Engine, InferenceError>>>;

struct EngineSlot {
    model_id: String,
    cell: InitCell,
}

/// Default bound on one model load. Downloads of multi-gigabyte weights are slow,
/// but a runtime that never answers must still fail the turn.
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Owns the one engine handle of the process. Create-once, teardown on model switch.
pub struct EngineRegistry {
    backend: Arc<dyn EngineBackend>,
    slot: Mutex<Option<EngineSlot>>,
    load_timeout: Duration,
}

static GLOBAL_REGISTRY: OnceLock<Arc<EngineRegistry>> = OnceLock::new();

/// Process-wide registry. The first caller's `init` decides the backend; later calls
/// (e.g. a remounted assistant) get the same registry and its already-loaded engine.
pub fn global_registry<F>(init: F) -> Arc<EngineRegistry>
where
    F: FnOnce() -> EngineRegistry,
{
    GLOBAL_REGISTRY.get_or_init(|| Arc::new(init())).clone()
}

/// Unload an engine that was displaced from the slot, if it finished loading.
async fn release(displaced: Option<EngineSlot>, next: &str) {
    if let Some(prev) = displaced {
        if let Some(Ok(engine)) = prev.cell.get() {
            info!(from = %prev.model_id, to = %next, "unloading previous model");
            engine.unload().await;
        }
    }
}

impl EngineRegistry {
    pub fn new(backend: Arc<dyn EngineBackend>) -> Self {
        Self {
            backend,
            slot: Mutex::new(None),
            load_timeout: DEFAULT_LOAD_TIMEOUT,
        }
    }

    pub fn with_load_timeout(mut self, load_timeout: Duration) -> Self {
        self.load_timeout = load_timeout;
        self
    }

    pub fn load_timeout(&self) -> Duration {
        self.load_timeout
    }

    /// Cell for `model_id`, installing a fresh one if the slot holds another model
    /// (or, with `retry_failed`, a failed load of the same model). The displaced slot
    /// is handed back so its engine can be unloaded.
    fn cell_for(&self, model_id: &str, retry_failed: bool) -> (InitCell, Option<EngineSlot>) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(existing)
                if existing.model_id == model_id
                    && !(retry_failed && matches!(existing.cell.get(), Some(Err(_)))) =>
            {
                (Arc::clone(&existing.cell), None)
            }
            _ => {
                let cell: InitCell = Arc::new(OnceCell::new());
                let displaced = slot.replace(EngineSlot {
                    model_id: model_id.to_string(),
                    cell: Arc::clone(&cell),
                });
                (cell, displaced)
            }
        }
    }

    async fn init(
        &self,
        cell: InitCell,
        model_id: &str,
        progress: ProgressFn,
    ) -> Result<Engine, InferenceError> {
        let backend = Arc::clone(&self.backend);
        let load_timeout = self.load_timeout;
        let result = cell
            .get_or_init(|| async move {
                info!(model = %model_id, "loading inference engine");
                progress(LoadProgress::new(0, format!("Loading {}", model_id)));
                let load = backend.load(model_id, Arc::clone(&progress));
                let loaded = match tokio::time::timeout(load_timeout, load).await {
                    Ok(loaded) => loaded,
                    Err(_) => Err(InferenceError::LoadFailed(format!(
                        "load timed out after {} ms",
                        load_timeout.as_millis()
                    ))),
                };
                match &loaded {
                    Ok(_) => {
                        progress(LoadProgress::new(100, "Model ready"));
                        info!(model = %model_id, "inference engine ready");
                    }
                    Err(e) => warn!(model = %model_id, kind = e.kind(), "inference engine failed: {}", e),
                }
                loaded
            })
            .await;
        result.clone()
    }

    /// Get the engine for `model_id`, loading it on first use. Concurrent callers share
    /// the in-flight load; only the first caller's `progress` receives updates.
    /// A load that outlives the registry's load timeout fails and stays failed.
    pub async fn get_or_create(
        &self,
        model_id: &str,
        progress: ProgressFn,
    ) -> Result<Engine, InferenceError> {
        let (cell, displaced) = self.cell_for(model_id, false);
        release(displaced, model_id).await;
        self.init(cell, model_id, progress).await
    }

    /// Tear down the current engine and load `model_id`. The conversation is not touched.
    /// Switching to the model already held (or loading) reuses it; switching to a model
    /// whose load failed tries it again.
    pub async fn switch_model(
        &self,
        model_id: &str,
        progress: ProgressFn,
    ) -> Result<Engine, InferenceError> {
        let (cell, displaced) = self.cell_for(model_id, true);
        if displaced.is_some() {
            info!(to = %model_id, "switching model");
        }
        release(displaced, model_id).await;
        self.init(cell, model_id, progress).await
    }

    pub fn status(&self) -> EngineStatus {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            None => EngineStatus::NotLoaded,
            Some(s) => match s.cell.get() {
                None => EngineStatus::Loading {
                    model_id: s.model_id.clone(),
                },
                Some(Ok(_)) => EngineStatus::Ready {
                    model_id: s.model_id.clone(),
                },
                Some(Err(e)) => EngineStatus::Unavailable {
                    model_id: s.model_id.clone(),
                    reason: e.to_string(),
                },
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Requests, timeouts and the degraded-retry policy
// ---------------------------------------------------------------------------

/// One chat request: leading instruction, optional injected context, history.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptRequest {
    pub instruction: Option<String>,
    /// Extra system message placed right before the history (the rolling summary).
    pub context: Option<String>,
    pub history: Vec<ConversationMessage>,
    pub options: GenerationOptions,
}

impl PromptRequest {
    pub fn to_messages(&self) -> Vec<ConversationMessage> {
        let mut out = Vec::with_capacity(self.history.len() + 2);
        if let Some(instruction) = &self.instruction {
            out.push(ConversationMessage::system(instruction.clone()));
        }
        if let Some(context) = &self.context {
            out.push(ConversationMessage::system(context.clone()));
        }
        out.extend(self.history.iter().cloned());
        out
    }

    /// The drastically simplified variant: minimal instruction, no context, short tail.
    pub fn degraded(&self, retry: &DegradedRetry, minimal_instruction: &str) -> PromptRequest {
        PromptRequest {
            instruction: Some(minimal_instruction.to_string()),
            context: None,
            history: retry.truncate(&self.history),
            options: retry.options(&self.options),
        }
    }
}

/// Parameters of the one bounded retry: how much history survives, the output cap
/// and the timeout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DegradedRetry {
    pub keep_last: usize,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl DegradedRetry {
    pub fn new(keep_last: usize, max_tokens: u32, timeout: Duration) -> Self {
        Self {
            keep_last,
            max_tokens,
            timeout,
        }
    }

    /// Last `keep_last` non-system messages.
    pub fn truncate(&self, history: &[ConversationMessage]) -> Vec<ConversationMessage> {
        let tail: Vec<&ConversationMessage> = history.iter().filter(|m| !m.is_system()).collect();
        let start = tail.len().saturating_sub(self.keep_last);
        tail[start..].iter().map(|m| (*m).clone()).collect()
    }

    pub fn options(&self, base: &GenerationOptions) -> GenerationOptions {
        GenerationOptions {
            max_tokens: self.max_tokens.min(base.max_tokens),
            temperature: base.temperature,
            timeout: self.timeout,
        }
    }
}

/// Single completion with a hard timeout. Blank completions count as failures.
pub async fn generate_reply(
    engine: &dyn LanguageModel,
    messages: &[ConversationMessage],
    options: &GenerationOptions,
) -> Result<String, InferenceError> {
    let started = std::time::Instant::now();
    let result = match tokio::time::timeout(options.timeout, engine.complete(messages, options)).await {
        Ok(inner) => inner,
        Err(_) => Err(InferenceError::Timeout(options.timeout.as_millis() as u64)),
    };
    debug!(
        model = %engine.model_id(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok = result.is_ok(),
        "completion finished"
    );
    let text = result?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(InferenceError::generation("empty completion"));
    }
    Ok(trimmed.to_string())
}

/// Run `primary`; on a retryable failure run `fallback` once. Engine-level failures
/// are returned as-is.
pub async fn generate_with_recovery(
    engine: &dyn LanguageModel,
    primary: &PromptRequest,
    fallback: &PromptRequest,
) -> Result<String, InferenceError> {
    match generate_reply(engine, &primary.to_messages(), &primary.options).await {
        Ok(text) => Ok(text),
        Err(e) if e.is_retryable() => {
            warn!(
                kind = e.kind(),
                buffer_fault = e.is_buffer_fault(),
                history = fallback.history.len(),
                "generation failed, retrying with degraded prompt: {}",
                e
            );
            generate_reply(engine, &fallback.to_messages(), &fallback.options).await
        }
        Err(e) => Err(e),
    }
}
