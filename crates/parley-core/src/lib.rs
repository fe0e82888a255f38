//! parley-core: conversation content, rolling memory and the local inference engine adapter.
//!
//! Everything here is independent of turn state. The voice crate's orchestrator owns
//! one [`ChatContentStore`] and one [`MemoryManager`] and reaches the model through
//! the process-wide [`EngineRegistry`].

mod chat_store;
mod config;
mod engine;
mod error;
mod local_engine;
mod memory;
mod message;
pub mod prompts;

pub use chat_store::{ChatContentStore, ChatSnapshot, DEFAULT_CURRENT_RESPONSE, DEFAULT_TRANSCRIPT_PREVIEW};
pub use config::{
    AssistantConfig, EngineConfig, MemoryPolicy, TimingPolicy, VoiceConfiguration, DEFAULT_MODEL_ID,
    PITCH_RANGE, RATE_RANGE, VOLUME_RANGE,
};
pub use engine::{
    generate_reply, generate_with_recovery, global_registry, ignore_progress, DegradedRetry, Engine,
    EngineBackend, EngineRegistry, EngineStatus, GenerationOptions, LanguageModel, LoadProgress,
    ProgressFn, PromptRequest,
};
pub use error::{CoreError, CoreResult, InferenceError};
pub use local_engine::{LocalEngineBackend, LocalModel};
pub use memory::{Compaction, CompactionPlan, MemoryManager, SummarySettings};
pub use message::{render_transcript, ConversationMessage, Role};
