//! # Parley Voice - turn orchestration for a local voice assistant
//!
//! Listens, thinks and speaks, one activity at a time, on top of `parley-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Turn Orchestrator                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐    │
//! │  │ Turn Machine │  │  Chat Store  │  │  Memory Manager  │    │
//! │  │ (5 states)   │  │ (durable log)│  │ (rolling summary)│    │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘    │
//! │         ↑ epoch-tagged event queue ↓                         │
//! │  ┌──────────────┐                    ┌──────────────────┐    │
//! │  │  Speech I/O  │                    │ Engine Registry  │    │
//! │  │ (recognizer, │                    │ (one model per   │    │
//! │  │  synthesizer)│                    │  process)        │    │
//! │  └──────────────┘                    └──────────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod orchestrator;
pub mod speech;
pub mod turn;

pub use error::{RecognitionError, SynthesisError, VoiceError, VoiceResult};
pub use orchestrator::{
    AssistantView, EngineView, OrchestratorEvent, TurnOrchestrator, UserIntent,
    STATUS_ENGINE_UNAVAILABLE, STATUS_PERMISSION_DENIED, STATUS_READY,
};
pub use speech::{
    RecognitionEvent, RecognitionSink, SpeechEvent, SpeechIo, SpeechRecognizer, SpeechSignal,
    SpeechSynthesizer, SynthesisEvent, SynthesisSink, Utterance,
};
pub use turn::{Transition, TurnEvent, TurnMachine, TurnState};
