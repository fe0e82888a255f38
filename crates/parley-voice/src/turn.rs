//! Conversational turn state machine
//!
//! Decides which of the five activity states the assistant is in. The machine is
//! pure: [`TurnMachine::handle`] returns the transition (or `None` when the event
//! does not apply) and never performs side effects. The orchestrator runs the
//! entry/exit effects for each transition.

use crate::error::RecognitionError;
use parley_core::InferenceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Activity state. Exactly one is current at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Idle,
    Listening,
    Processing,
    Speaking,
    Error,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Listening => "listening",
            TurnState::Processing => "processing",
            TurnState::Speaking => "speaking",
            TurnState::Error => "error",
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    StartListening,
    SpeechRecognized(String),
    SpeechError(RecognitionError),
    /// Text typed by the user instead of spoken
    TextSubmitted(String),
    ReplyReady(String),
    ReplyError(InferenceError),
    SpeechFinished,
    StopEverything,
    Reset,
}

impl TurnEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::StartListening => "start_listening",
            TurnEvent::SpeechRecognized(_) => "speech_recognized",
            TurnEvent::SpeechError(_) => "speech_error",
            TurnEvent::TextSubmitted(_) => "text_submitted",
            TurnEvent::ReplyReady(_) => "reply_ready",
            TurnEvent::ReplyError(_) => "reply_error",
            TurnEvent::SpeechFinished => "speech_finished",
            TurnEvent::StopEverything => "stop_everything",
            TurnEvent::Reset => "reset",
        }
    }
}

/// An accepted event and the states on either side of it
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: TurnState,
    pub to: TurnState,
    pub event: TurnEvent,
}

/// The turn state machine
#[derive(Debug, Clone, Default)]
pub struct TurnMachine {
    state: TurnState,
    conversation_mode: bool,
}

impl TurnMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Whether finishing a reply goes straight back to listening.
    pub fn conversation_mode(&self) -> bool {
        self.conversation_mode
    }

    pub fn set_conversation_mode(&mut self, enabled: bool) {
        self.conversation_mode = enabled;
    }

    /// Target state for `event` from the current state, without changing anything.
    pub fn next_state(&self, event: &TurnEvent) -> Option<TurnState> {
        use TurnEvent as E;
        use TurnState as S;

        match (self.state, event) {
            (_, E::StopEverything) | (_, E::Reset) => Some(S::Idle),

            (S::Idle, E::StartListening) => Some(S::Listening),
            (S::Speaking, E::StartListening) => Some(S::Listening),
            (S::Error, E::StartListening) => Some(S::Listening),

            (S::Listening, E::SpeechRecognized(_)) => Some(S::Processing),
            (S::Listening, E::SpeechError(_)) => Some(S::Error),

            (S::Processing, E::ReplyReady(_)) => Some(S::Speaking),
            (S::Processing, E::ReplyError(_)) => Some(S::Error),

            (S::Speaking, E::SpeechFinished) if self.conversation_mode => Some(S::Listening),
            (S::Speaking, E::SpeechFinished) => Some(S::Idle),

            (S::Processing, E::TextSubmitted(_)) => None,
            (_, E::TextSubmitted(_)) => Some(S::Processing),

            _ => None,
        }
    }

    /// Apply `event`. Returns the transition, or `None` if the event is a no-op here.
    pub fn handle(&mut self, event: TurnEvent) -> Option<Transition> {
        let from = self.state;
        let Some(to) = self.next_state(&event) else {
            debug!(state = %from, event = event.name(), "event ignored");
            return None;
        };
        self.state = to;
        debug!(from = %from, to = %to, event = event.name(), "turn transition");
        Some(Transition { from, to, event })
    }
}
