//! Speech I/O adapter
//!
//! Wraps the platform recognizer and synthesizer. Both are callback style: `start`
//! or `speak` returns at once and progress arrives later through a sink. Every
//! sink is stamped with the orchestrator epoch and a per-session id so that
//! callbacks from a session we already abandoned can be recognised and dropped.
//!
//! The synthesizer gets a safety timeout. Some platforms never report the end of
//! an utterance; when the timeout fires, a synthetic `Ended` is posted and the
//! platform synthesis is cancelled once the orchestrator consumes it.

use crate::error::{RecognitionError, SynthesisError};
use parley_core::{TimingPolicy, VoiceConfiguration};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Callbacks from a recognition session
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    Started,
    /// Partial hypothesis, only used for the live transcript preview
    Interim(String),
    /// Final result of the session
    Result(String),
    Error(RecognitionError),
    Ended,
}

/// Callbacks from one spoken utterance
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisEvent {
    Started,
    /// `synthetic` is set when the safety timeout produced the end, not the platform.
    Ended { synthetic: bool },
    Error(SynthesisError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEvent {
    Recognition { session: u64, event: RecognitionEvent },
    Synthesis { utterance: u64, event: SynthesisEvent },
}

/// A speech callback stamped with the epoch it was started in
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSignal {
    pub epoch: u64,
    pub event: SpeechEvent,
}

/// Where a recognizer reports its callbacks. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RecognitionSink {
    epoch: u64,
    session: u64,
    tx: mpsc::UnboundedSender<SpeechSignal>,
}

impl RecognitionSink {
    /// Returns `false` once the orchestrator is gone.
    pub fn emit(&self, event: RecognitionEvent) -> bool {
        self.tx
            .send(SpeechSignal {
                epoch: self.epoch,
                event: SpeechEvent::Recognition {
                    session: self.session,
                    event,
                },
            })
            .is_ok()
    }

    pub fn started(&self) -> bool {
        self.emit(RecognitionEvent::Started)
    }

    pub fn interim(&self, text: impl Into<String>) -> bool {
        self.emit(RecognitionEvent::Interim(text.into()))
    }

    pub fn result(&self, text: impl Into<String>) -> bool {
        self.emit(RecognitionEvent::Result(text.into()))
    }

    pub fn error(&self, error: RecognitionError) -> bool {
        self.emit(RecognitionEvent::Error(error))
    }

    pub fn ended(&self) -> bool {
        self.emit(RecognitionEvent::Ended)
    }

    pub fn session(&self) -> u64 {
        self.session
    }
}

/// Where a synthesizer reports the progress of one utterance.
#[derive(Debug, Clone)]
pub struct SynthesisSink {
    epoch: u64,
    utterance: u64,
    tx: mpsc::UnboundedSender<SpeechSignal>,
}

impl SynthesisSink {
    pub fn emit(&self, event: SynthesisEvent) -> bool {
        self.tx
            .send(SpeechSignal {
                epoch: self.epoch,
                event: SpeechEvent::Synthesis {
                    utterance: self.utterance,
                    event,
                },
            })
            .is_ok()
    }

    pub fn started(&self) -> bool {
        self.emit(SynthesisEvent::Started)
    }

    pub fn ended(&self) -> bool {
        self.emit(SynthesisEvent::Ended { synthetic: false })
    }

    pub fn error(&self, error: SynthesisError) -> bool {
        self.emit(SynthesisEvent::Error(error))
    }

    pub fn utterance(&self) -> u64 {
        self.utterance
    }
}

/// Text plus the voice it should be read with
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    /// Already clamped to platform ranges
    pub voice: VoiceConfiguration,
}

/// Platform speech-to-text. `start` must return promptly; results go to the sink.
pub trait SpeechRecognizer: Send {
    fn start(&mut self, language: &str, sink: RecognitionSink) -> Result<(), RecognitionError>;

    /// Stop the current session. Must be safe to call when nothing is running.
    fn stop(&mut self);
}

/// Platform text-to-speech. `speak` must return promptly; progress goes to the sink.
pub trait SpeechSynthesizer: Send {
    fn speak(&mut self, utterance: &Utterance, sink: SynthesisSink) -> Result<(), SynthesisError>;

    /// Cancel whatever is being spoken. Must be safe to call when silent.
    fn cancel(&mut self);
}

struct ActiveUtterance {
    id: u64,
    guard: JoinHandle<()>,
}

/// Owns the recognizer and synthesizer and keeps them from running at once.
pub struct SpeechIo {
    recognizer: Box<dyn SpeechRecognizer>,
    synthesizer: Box<dyn SpeechSynthesizer>,
    timing: TimingPolicy,
    tx: mpsc::UnboundedSender<SpeechSignal>,
    session: Option<u64>,
    utterance: Option<ActiveUtterance>,
    next_id: u64,
}

impl SpeechIo {
    /// Create the adapter and the receiving end of its callback queue.
    pub fn new(
        recognizer: Box<dyn SpeechRecognizer>,
        synthesizer: Box<dyn SpeechSynthesizer>,
        timing: TimingPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<SpeechSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let io = Self {
            recognizer,
            synthesizer,
            timing,
            tx,
            session: None,
            utterance: None,
            next_id: 0,
        };
        (io, rx)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn is_recognizing(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_speaking(&self) -> bool {
        self.utterance.is_some()
    }

    /// Start a recognition session. Synthesis is always cancelled first so the
    /// assistant never hears itself.
    pub fn start_recognition(&mut self, epoch: u64, language: &str) -> Result<u64, RecognitionError> {
        self.cancel_synthesis();
        if self.session.take().is_some() {
            self.recognizer.stop();
        }
        let session = self.next_id();
        let sink = RecognitionSink {
            epoch,
            session,
            tx: self.tx.clone(),
        };
        self.recognizer.start(language, sink)?;
        self.session = Some(session);
        debug!(epoch, session, "recognition started");
        Ok(session)
    }

    pub fn stop_recognition(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(session, "recognition stopped");
            self.recognizer.stop();
        }
    }

    /// Speak `text` and arm the safety timeout. Returns the utterance id.
    pub fn speak(
        &mut self,
        epoch: u64,
        text: &str,
        voice: &VoiceConfiguration,
    ) -> Result<u64, SynthesisError> {
        self.cancel_synthesis();
        let id = self.next_id();
        let sink = SynthesisSink {
            epoch,
            utterance: id,
            tx: self.tx.clone(),
        };
        let utterance = Utterance {
            text: text.to_string(),
            voice: voice.clamped(),
        };
        self.synthesizer.speak(&utterance, sink.clone())?;

        let timeout = self.timing.speech_safety_timeout(text);
        let guard = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!(utterance = id, ?timeout, "speech safety timeout fired");
            sink.emit(SynthesisEvent::Ended { synthetic: true });
        });
        self.utterance = Some(ActiveUtterance { id, guard });
        debug!(epoch, utterance = id, ?timeout, "synthesis started");
        Ok(id)
    }

    /// Cancel current synthesis (if any) and disarm its safety timeout.
    pub fn cancel_synthesis(&mut self) {
        if let Some(active) = self.utterance.take() {
            active.guard.abort();
            self.synthesizer.cancel();
            debug!(utterance = active.id, "synthesis cancelled");
        }
    }

    /// Safety timeout for `text` under the current timing policy.
    pub fn safety_timeout(&self, text: &str) -> Duration {
        self.timing.speech_safety_timeout(text)
    }

    /// Filter a callback against the live session/utterance and update bookkeeping.
    /// Returns `false` for callbacks from sessions that were already stopped.
    pub fn accept(&mut self, signal: &SpeechSignal) -> bool {
        match &signal.event {
            SpeechEvent::Recognition { session, event } => {
                if self.session != Some(*session) {
                    return false;
                }
                if matches!(event, RecognitionEvent::Ended) {
                    self.session = None;
                }
                true
            }
            SpeechEvent::Synthesis { utterance, event } => {
                let live = matches!(&self.utterance, Some(active) if active.id == *utterance);
                if !live {
                    return false;
                }
                match event {
                    SynthesisEvent::Started => {}
                    SynthesisEvent::Ended { synthetic } => {
                        if let Some(active) = self.utterance.take() {
                            active.guard.abort();
                        }
                        if *synthetic {
                            self.synthesizer.cancel();
                        }
                    }
                    SynthesisEvent::Error(_) => {
                        if let Some(active) = self.utterance.take() {
                            active.guard.abort();
                        }
                    }
                }
                true
            }
        }
    }

    /// Stop both directions.
    pub fn halt(&mut self) {
        self.stop_recognition();
        self.cancel_synthesis();
    }
}

impl Drop for SpeechIo {
    fn drop(&mut self) {
        if let Some(active) = self.utterance.take() {
            active.guard.abort();
        }
    }
}
