//! Assistant configuration loaded from `config/assistant.toml` and `PARLEY__*` env vars.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | PARLEY_CONFIG | config/assistant | Config file path (toml). |
//! | PARLEY__MODEL_ID | Llama-3.2-1B-Instruct | Model to load in the local runtime. |
//! | PARLEY__ENGINE__BASE_URL | http://127.0.0.1:8080/v1 | OpenAI-compatible local runtime. |
//! | PARLEY__MEMORY__SUMMARY_TRIGGER_COUNT | 16 | Window size that triggers summarization. |
//! | PARLEY__TIMING__ERROR_BACKOFF_MS | 2000 | Delay before re-listening after an error. |

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_MODEL_ID: &str = "Llama-3.2-1B-Instruct";
const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:8080/v1";
const DEFAULT_CONFIG_PATH: &str = "config/assistant";

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Memory policy
// ---------------------------------------------------------------------------

/// Bounds for the prompt history. Invariant: `keep_recent_count < summary_trigger_count <= max_messages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPolicy {
    #[serde(default = "MemoryPolicy::default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "MemoryPolicy::default_summary_trigger_count")]
    pub summary_trigger_count: usize,
    #[serde(default = "MemoryPolicy::default_keep_recent_count")]
    pub keep_recent_count: usize,
    #[serde(default = "default_true")]
    pub auto_summary_enabled: bool,
}

impl MemoryPolicy {
    fn default_max_messages() -> usize {
        20
    }

    fn default_summary_trigger_count() -> usize {
        16
    }

    fn default_keep_recent_count() -> usize {
        6
    }

    /// Build a validated policy.
    pub fn new(
        max_messages: usize,
        summary_trigger_count: usize,
        keep_recent_count: usize,
        auto_summary_enabled: bool,
    ) -> CoreResult<Self> {
        let policy = Self {
            max_messages,
            summary_trigger_count,
            keep_recent_count,
            auto_summary_enabled,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.keep_recent_count >= self.summary_trigger_count {
            return Err(CoreError::MemoryPolicy(format!(
                "keep_recent_count ({}) must be smaller than summary_trigger_count ({})",
                self.keep_recent_count, self.summary_trigger_count
            )));
        }
        if self.summary_trigger_count > self.max_messages {
            return Err(CoreError::MemoryPolicy(format!(
                "summary_trigger_count ({}) must not exceed max_messages ({})",
                self.summary_trigger_count, self.max_messages
            )));
        }
        Ok(())
    }
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            max_messages: Self::default_max_messages(),
            summary_trigger_count: Self::default_summary_trigger_count(),
            keep_recent_count: Self::default_keep_recent_count(),
            auto_summary_enabled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Timing policy
// ---------------------------------------------------------------------------

/// Backoffs and timeouts for the voice loop. All values in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingPolicy {
    /// Delay before re-entering listening after a recognition/inference error.
    pub error_backoff_ms: u64,
    /// Delay before restarting a recognizer session that ended without a result.
    pub listen_restart_delay_ms: u64,
    pub reply_timeout_ms: u64,
    pub summary_timeout_ms: u64,
    /// Timeout for the degraded (minimal prompt) retry.
    pub recovery_timeout_ms: u64,
    /// Bound on one engine load. Expiry is cached as a load failure.
    pub load_timeout_ms: u64,
    pub safety_base_ms: u64,
    pub safety_per_char_ms: u64,
    pub safety_floor_ms: u64,
    pub safety_ceiling_ms: u64,
}

impl Default for TimingPolicy {
    fn default() -> Self {
        Self {
            error_backoff_ms: 2_000,
            listen_restart_delay_ms: 800,
            reply_timeout_ms: 45_000,
            summary_timeout_ms: 30_000,
            recovery_timeout_ms: 15_000,
            load_timeout_ms: 120_000,
            safety_base_ms: 3_000,
            safety_per_char_ms: 80,
            safety_floor_ms: 5_000,
            safety_ceiling_ms: 60_000,
        }
    }
}

impl TimingPolicy {
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn listen_restart_delay(&self) -> Duration {
        Duration::from_millis(self.listen_restart_delay_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_millis(self.summary_timeout_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Upper bound on how long one utterance may keep the assistant in `speaking`.
    /// Proportional to the text length, clamped to `[floor, ceiling]`.
    pub fn speech_safety_timeout(&self, text: &str) -> Duration {
        let chars = text.chars().count() as u64;
        let ms = self
            .safety_base_ms
            .saturating_add(self.safety_per_char_ms.saturating_mul(chars))
            .clamp(self.safety_floor_ms, self.safety_ceiling_ms.max(self.safety_floor_ms));
        Duration::from_millis(ms)
    }
}

// ---------------------------------------------------------------------------
// Voice configuration
// ---------------------------------------------------------------------------

pub const RATE_RANGE: (f32, f32) = (0.1, 10.0);
pub const PITCH_RANGE: (f32, f32) = (0.0, 2.0);
pub const VOLUME_RANGE: (f32, f32) = (0.0, 1.0);

/// Synthesis settings the user edits. Persisted outside the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfiguration {
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
    /// Platform voice identifier; `None` lets the platform pick for `language`.
    pub voice_id: Option<String>,
    pub language: String,
}

impl Default for VoiceConfiguration {
    fn default() -> Self {
        Self {
            rate: 1.0,
            pitch: 1.0,
            volume: 1.0,
            voice_id: None,
            language: "en-US".to_string(),
        }
    }
}

impl VoiceConfiguration {
    pub fn validate(&self) -> CoreResult<()> {
        check_range("rate", self.rate, RATE_RANGE)?;
        check_range("pitch", self.pitch, PITCH_RANGE)?;
        check_range("volume", self.volume, VOLUME_RANGE)?;
        if self.language.trim().is_empty() {
            return Err(CoreError::VoiceConfig("language must not be empty".to_string()));
        }
        Ok(())
    }

    /// Copy with every numeric field forced into the platform range.
    pub fn clamped(&self) -> Self {
        Self {
            rate: clamp_finite(self.rate, RATE_RANGE, 1.0),
            pitch: clamp_finite(self.pitch, PITCH_RANGE, 1.0),
            volume: clamp_finite(self.volume, VOLUME_RANGE, 1.0),
            voice_id: self
                .voice_id
                .as_ref()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            language: if self.language.trim().is_empty() {
                VoiceConfiguration::default().language
            } else {
                self.language.trim().to_string()
            },
        }
    }

    pub fn load_json(path: &Path) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let parsed: VoiceConfiguration = serde_json::from_str(&raw)?;
        Ok(parsed.clamped())
    }

    pub fn save_json(&self, path: &Path) -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn check_range(name: &str, value: f32, (lo, hi): (f32, f32)) -> CoreResult<()> {
    if !value.is_finite() || value < lo || value > hi {
        return Err(CoreError::VoiceConfig(format!(
            "{} must be within {}..={} (got {})",
            name, lo, hi, value
        )));
    }
    Ok(())
}

fn clamp_finite(value: f32, (lo, hi): (f32, f32), fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(lo, hi)
    } else {
        fallback
    }
}

// ---------------------------------------------------------------------------
// Engine + top-level config
// ---------------------------------------------------------------------------

/// Connection settings for the local inference runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ENGINE_URL.to_string(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 512,
        }
    }
}

/// Everything the voice core reads at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantConfig {
    #[serde(default = "AssistantConfig::default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub memory: MemoryPolicy,
    #[serde(default)]
    pub timing: TimingPolicy,
    #[serde(default)]
    pub voice: VoiceConfiguration,
    /// Persona prompt placed first in every request. `None` sends history only.
    #[serde(default = "AssistantConfig::default_system_prompt")]
    pub system_prompt: Option<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            model_id: Self::default_model_id(),
            engine: EngineConfig::default(),
            memory: MemoryPolicy::default(),
            timing: TimingPolicy::default(),
            voice: VoiceConfiguration::default(),
            system_prompt: Self::default_system_prompt(),
        }
    }
}

impl AssistantConfig {
    fn default_model_id() -> String {
        DEFAULT_MODEL_ID.to_string()
    }

    fn default_system_prompt() -> Option<String> {
        Some(crate::prompts::ASSISTANT_SYSTEM_PROMPT.to_string())
    }

    /// Load config from file and environment. Precedence: env `PARLEY_CONFIG` path >
    /// `config/assistant.toml` > defaults; `PARLEY__*` env vars override the file.
    pub fn load() -> CoreResult<Self> {
        let config_path =
            std::env::var("PARLEY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let builder = config::Config::builder()
            .set_default("model_id", DEFAULT_MODEL_ID)?
            .set_default("engine.base_url", DEFAULT_ENGINE_URL)?;

        let path = Path::new(&config_path);
        let with_ext = path.with_extension("toml");
        let builder = if path.is_file() {
            builder.add_source(config::File::from(path))
        } else if with_ext.is_file() {
            builder.add_source(config::File::from(with_ext.as_path()))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("PARLEY").separator("__"))
            .build()?;

        let cfg: AssistantConfig = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a toml document directly (no env overlay).
    pub fn from_toml_str(raw: &str) -> CoreResult<Self> {
        let cfg: AssistantConfig = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.model_id.trim().is_empty() {
            return Err(CoreError::Config("model_id must not be empty".to_string()));
        }
        self.memory.validate()?;
        self.voice.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        let policy = MemoryPolicy::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.summary_trigger_count, 16);
        assert_eq!(policy.keep_recent_count, 6);
    }

    #[test]
    fn policy_rejects_keep_recent_at_trigger() {
        assert!(MemoryPolicy::new(20, 6, 6, true).is_err());
        assert!(MemoryPolicy::new(10, 16, 6, true).is_err());
        assert!(MemoryPolicy::new(16, 16, 6, true).is_ok());
    }

    #[test]
    fn safety_timeout_is_bounded() {
        let timing = TimingPolicy::default();
        assert_eq!(timing.speech_safety_timeout(""), Duration::from_millis(5_000));
        assert_eq!(
            timing.speech_safety_timeout(&"a".repeat(100)),
            Duration::from_millis(11_000)
        );
        assert_eq!(
            timing.speech_safety_timeout(&"a".repeat(10_000)),
            Duration::from_millis(60_000)
        );
    }

    #[test]
    fn voice_configuration_clamps_out_of_range_values() {
        let cfg = VoiceConfiguration {
            rate: 42.0,
            pitch: -1.0,
            volume: f32::NAN,
            voice_id: Some("  ".into()),
            language: String::new(),
        };
        assert!(cfg.validate().is_err());
        let clamped = cfg.clamped();
        assert_eq!(clamped.rate, 10.0);
        assert_eq!(clamped.pitch, 0.0);
        assert_eq!(clamped.volume, 1.0);
        assert_eq!(clamped.voice_id, None);
        assert_eq!(clamped.language, "en-US");
        assert!(clamped.validate().is_ok());
    }

    #[test]
    fn toml_overrides_merge_with_defaults() {
        let cfg = AssistantConfig::from_toml_str(
            r#"
            model_id = "Phi-3.5-mini-instruct"

            [memory]
            summary_trigger_count = 10
            keep_recent_count = 4

            [timing]
            error_backoff_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(cfg.model_id, "Phi-3.5-mini-instruct");
        assert_eq!(cfg.memory.summary_trigger_count, 10);
        assert_eq!(cfg.memory.max_messages, 20);
        assert_eq!(cfg.timing.error_backoff_ms, 500);
        assert_eq!(cfg.timing.reply_timeout_ms, 45_000);
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let shipped = AssistantConfig::from_toml_str(include_str!("../../../config/assistant.toml"))
            .unwrap();
        assert_eq!(shipped, AssistantConfig::default());
    }

    #[test]
    fn toml_with_broken_policy_is_rejected() {
        let err = AssistantConfig::from_toml_str(
            r#"
            [memory]
            summary_trigger_count = 4
            keep_recent_count = 6
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn voice_configuration_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice.json");
        let cfg = VoiceConfiguration {
            rate: 1.3,
            voice_id: Some("Samantha".into()),
            ..Default::default()
        };
        cfg.save_json(&path).unwrap();
        assert_eq!(VoiceConfiguration::load_json(&path).unwrap(), cfg);
    }
}
