//! Terminal stand-ins for the platform speech APIs.
//!
//! The "microphone" is the keyboard: while a recognition session is open, the
//! next typed line is delivered as the final result. The "speaker" prints the
//! reply and takes roughly as long as reading it aloud would.

use parley_voice::{
    RecognitionError, RecognitionSink, SpeechRecognizer, SpeechSynthesizer, SynthesisError,
    SynthesisSink, Utterance,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

const MS_PER_WORD: f32 = 350.0;
const MIN_SPEAKING_MS: u64 = 500;

/// Shared slot holding the open recognition session, if any.
#[derive(Clone, Default)]
pub struct MicHandle(Arc<Mutex<Option<RecognitionSink>>>);

impl MicHandle {
    /// Deliver a typed line as recognized speech. Returns `false` if nobody is listening.
    pub fn deliver(&self, text: &str) -> bool {
        let sink = self.0.lock().unwrap_or_else(|e| e.into_inner()).take();
        match sink {
            Some(sink) => {
                sink.result(text);
                sink.ended();
                true
            }
            None => false,
        }
    }

    fn open(&self, sink: RecognitionSink) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    fn close(&self) -> bool {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take().is_some()
    }
}

pub struct TerminalMic {
    handle: MicHandle,
}

impl TerminalMic {
    pub fn new() -> (Self, MicHandle) {
        let handle = MicHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl SpeechRecognizer for TerminalMic {
    fn start(&mut self, language: &str, sink: RecognitionSink) -> Result<(), RecognitionError> {
        debug!(language, session = sink.session(), "terminal mic open");
        sink.started();
        self.handle.open(sink);
        println!("🎤 listening... (type what you would say)");
        Ok(())
    }

    fn stop(&mut self) {
        if self.handle.close() {
            debug!("terminal mic closed");
        }
    }
}

#[derive(Default)]
pub struct TerminalSpeaker {
    playback: Option<JoinHandle<()>>,
}

impl TerminalSpeaker {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Rough time to read `text` aloud at `rate`.
fn reading_time(text: &str, rate: f32) -> Duration {
    let words = text.split_whitespace().count() as f32;
    let ms = (words * MS_PER_WORD / rate.max(0.1)) as u64;
    Duration::from_millis(ms.max(MIN_SPEAKING_MS))
}

impl SpeechSynthesizer for TerminalSpeaker {
    fn speak(&mut self, utterance: &Utterance, sink: SynthesisSink) -> Result<(), SynthesisError> {
        self.cancel();
        println!("🔊 {}", utterance.text);
        sink.started();
        let duration = reading_time(&utterance.text, utterance.voice.rate);
        self.playback = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            sink.ended();
        }));
        Ok(())
    }

    fn cancel(&mut self) {
        if let Some(playback) = self.playback.take() {
            playback.abort();
        }
    }
}
