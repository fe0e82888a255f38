//! Local runtime backend: any OpenAI-compatible server on the user's machine
//! (llama.cpp `server`, Ollama, LM Studio). Nothing leaves the device.
//!
//! Loading checks that the runtime is reachable and serves the requested model,
//! then sends a one-token warm-up so the weights are resident before the first turn.

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineBackend, GenerationOptions, LanguageModel, LoadProgress, ProgressFn};
use crate::error::InferenceError;
use crate::message::ConversationMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WARMUP_TIMEOUT: Duration = Duration::from_secs(120);

// OpenAI-compatible request/response
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ConversationMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// Backend talking to a local OpenAI-compatible runtime.
pub struct LocalEngineBackend {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl LocalEngineBackend {
    pub fn new(config: &EngineConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config
                .api_key
                .as_ref()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            client,
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.get(format!("{}/{}", self.base_url, path));
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn available_models(&self) -> Result<Vec<String>, InferenceError> {
        let res = self.get("models").send().await.map_err(|e| {
            InferenceError::UnsupportedDevice(format!(
                "local inference runtime unreachable at {}: {}",
                self.base_url, e
            ))
        })?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(InferenceError::LoadFailed(format!(
                "model listing failed {}: {}",
                status, body
            )));
        }
        let list: ModelList = res
            .json()
            .await
            .map_err(|e| InferenceError::LoadFailed(format!("model listing parse failed: {}", e)))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl EngineBackend for LocalEngineBackend {
    async fn load(&self, model_id: &str, progress: ProgressFn) -> Result<Engine, InferenceError> {
        progress(LoadProgress::new(10, "Connecting to local runtime"));
        let models = self.available_models().await?;
        debug!(count = models.len(), "runtime models listed");
        if !models.iter().any(|m| m == model_id) {
            return Err(InferenceError::LoadFailed(format!(
                "model {} is not served by the runtime (available: {})",
                model_id,
                models.join(", ")
            )));
        }

        progress(LoadProgress::new(50, "Warming up model"));
        let model = LocalModel {
            model_id: model_id.to_string(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            client: self.client.clone(),
        };
        let warmup = [ConversationMessage::user("hi")];
        let options = GenerationOptions::new(1, 0.0, WARMUP_TIMEOUT);
        tokio::time::timeout(WARMUP_TIMEOUT, model.complete(&warmup, &options))
            .await
            .map_err(|_| InferenceError::LoadFailed("warm-up timed out".to_string()))?
            .map_err(|e| InferenceError::LoadFailed(format!("warm-up failed: {}", e)))?;

        progress(LoadProgress::new(90, "Model warmed up"));
        info!(model = %model_id, base_url = %self.base_url, "local model loaded");
        Ok(Arc::new(model))
    }
}

/// A model served by the local runtime.
pub struct LocalModel {
    model_id: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[async_trait]
impl LanguageModel for LocalModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete(
        &self,
        messages: &[ConversationMessage],
        options: &GenerationOptions,
    ) -> Result<String, InferenceError> {
        let body = ChatRequest {
            model: &self.model_id,
            messages,
            temperature: Some(options.temperature),
            max_tokens: Some(options.max_tokens),
            stream: false,
        };
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req
            .send()
            .await
            .map_err(|e| InferenceError::generation(format!("request failed: {}", e)))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(InferenceError::generation(format!(
                "runtime error {}: {}",
                status, body
            )));
        }
        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| InferenceError::generation(format!("response parse failed: {}", e)))?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}
