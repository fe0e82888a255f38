//! Turn orchestrator - the coordination layer
//!
//! Owns the turn machine, the chat store and the memory manager and drives the
//! speech adapter and the inference engine from one event queue. All state lives
//! behind `&mut self`; slow work (inference, engine loading, timers) runs in
//! spawned tasks that post their result back to the queue.
//!
//! Every turn transition bumps the epoch. Results and callbacks carry the epoch
//! they were started in and are dropped if it is no longer current, which is how
//! a stop or reset cancels work already in flight.

use crate::error::{RecognitionError, SynthesisError};
use crate::speech::{
    RecognitionEvent, SpeechEvent, SpeechIo, SpeechRecognizer, SpeechSignal, SpeechSynthesizer,
    SynthesisEvent,
};
use crate::turn::{TurnEvent, TurnMachine, TurnState};
use chrono::{DateTime, Utc};
use parley_core::prompts::{reply_failure_message, REPLY_MINIMAL_PROMPT};
use parley_core::{
    generate_with_recovery, ignore_progress, AssistantConfig, ChatContentStore, ChatSnapshot,
    Compaction, DegradedRetry, Engine, EngineRegistry, GenerationOptions, InferenceError, LoadProgress,
    MemoryManager, ProgressFn, SummarySettings, VoiceConfiguration,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const STATUS_READY: &str = "Ready";
pub const STATUS_LISTENING: &str = "Listening...";
pub const STATUS_THINKING: &str = "Thinking...";
pub const STATUS_SPEAKING: &str = "Speaking...";
pub const STATUS_STOPPED: &str = "Conversation stopped";
pub const STATUS_CLEARED: &str = "Conversation cleared";
pub const STATUS_PERMISSION_DENIED: &str =
    "Microphone access was denied. Allow microphone access to use voice input.";
pub const STATUS_ENGINE_UNAVAILABLE: &str =
    "AI responses are unavailable on this device. Voice input still works.";

const SUMMARY_MAX_TOKENS: u32 = 300;
const SUMMARY_TEMPERATURE: f32 = 0.3;
const SUMMARY_RETRY_KEEP: usize = 6;
const SUMMARY_RETRY_MAX_TOKENS: u32 = 150;
const REPLY_RETRY_KEEP: usize = 2;
const REPLY_RETRY_MAX_TOKENS: u32 = 128;
/// Extra wait past the load timeout; the registry must settle and cache a hung load first.
const LOAD_WAIT_GRACE: Duration = Duration::from_secs(1);

/// What the user can ask for
#[derive(Debug, Clone, PartialEq)]
pub enum UserIntent {
    /// Hands-free mode: keep listening after every reply.
    StartConversation,
    StopConversation,
    /// Listen for one utterance, answer, then go idle.
    ListenOnce,
    SendText(String),
    ClearHistory,
    SwitchModel(String),
    UpdateVoice(VoiceConfiguration),
}

impl UserIntent {
    pub fn name(&self) -> &'static str {
        match self {
            UserIntent::StartConversation => "start_conversation",
            UserIntent::StopConversation => "stop_conversation",
            UserIntent::ListenOnce => "listen_once",
            UserIntent::SendText(_) => "send_text",
            UserIntent::ClearHistory => "clear_history",
            UserIntent::SwitchModel(_) => "switch_model",
            UserIntent::UpdateVoice(_) => "update_voice",
        }
    }
}

/// Engine lifecycle as shown to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EngineView {
    Loading {
        model_id: String,
        percent: u8,
        text: String,
    },
    Ready {
        model_id: String,
    },
    Unavailable {
        model_id: String,
        reason: String,
    },
}

impl EngineView {
    pub fn is_ready(&self) -> bool {
        matches!(self, EngineView::Ready { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, EngineView::Unavailable { .. })
    }
}

/// Observable snapshot for a UI, published after every handled intent and event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantView {
    pub state: TurnState,
    pub conversation_mode: bool,
    pub status: String,
    pub transcript_preview: String,
    pub current_response: String,
    pub message_count: usize,
    pub model_id: String,
    pub engine: EngineView,
    pub updated_at: DateTime<Utc>,
}

/// Everything that can arrive on the orchestrator queue
#[derive(Debug)]
pub enum OrchestratorEvent {
    Speech(SpeechSignal),
    ReplyFinished {
        epoch: u64,
        compaction: Compaction,
        result: Result<String, InferenceError>,
    },
    /// Engine events are tagged with the model they belong to, not the turn epoch.
    EngineProgress {
        model_id: String,
        progress: LoadProgress,
    },
    EngineSettled {
        model_id: String,
        result: Result<(), InferenceError>,
    },
    /// Error backoff elapsed: try listening again.
    RestartListening { epoch: u64 },
    /// Recognizer session ended without a result: open a new one.
    RestartRecognizer { epoch: u64 },
}

/// The voice assistant's single owner of turn state and conversation content
pub struct TurnOrchestrator {
    config: AssistantConfig,
    voice: VoiceConfiguration,
    model_id: String,

    turn: TurnMachine,
    chat: ChatContentStore,
    memory: MemoryManager,
    registry: Arc<EngineRegistry>,
    speech: SpeechIo,

    epoch: u64,
    status: String,
    engine: EngineView,
    permission_blocked: bool,

    // Tasks
    reply_task: Option<JoinHandle<()>>,
    restart_timer: Option<JoinHandle<()>>,

    // Channels
    speech_rx: mpsc::UnboundedReceiver<SpeechSignal>,
    events_tx: mpsc::UnboundedSender<OrchestratorEvent>,
    events_rx: mpsc::UnboundedReceiver<OrchestratorEvent>,
    view_tx: watch::Sender<AssistantView>,
}

impl TurnOrchestrator {
    /// Create the orchestrator and start preloading the engine.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: AssistantConfig,
        registry: Arc<EngineRegistry>,
        recognizer: Box<dyn SpeechRecognizer>,
        synthesizer: Box<dyn SpeechSynthesizer>,
    ) -> Self {
        info!(model = %config.model_id, "🎭 Initializing turn orchestrator");

        let (speech, speech_rx) = SpeechIo::new(recognizer, synthesizer, config.timing);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let model_id = config.model_id.clone();
        let engine = EngineView::Loading {
            model_id: model_id.clone(),
            percent: 0,
            text: "Waiting for model".to_string(),
        };
        let chat = ChatContentStore::new();
        let initial = AssistantView {
            state: TurnState::Idle,
            conversation_mode: false,
            status: STATUS_READY.to_string(),
            transcript_preview: chat.transcript_preview().to_string(),
            current_response: chat.current_response().to_string(),
            message_count: 0,
            model_id: model_id.clone(),
            engine: engine.clone(),
            updated_at: Utc::now(),
        };
        let (view_tx, _) = watch::channel(initial);

        let mut orchestrator = Self {
            voice: config.voice.clamped(),
            memory: MemoryManager::new(config.memory),
            config,
            model_id,
            turn: TurnMachine::new(),
            chat,
            registry,
            speech,
            epoch: 0,
            status: STATUS_READY.to_string(),
            engine,
            permission_blocked: false,
            reply_task: None,
            restart_timer: None,
            speech_rx,
            events_tx,
            events_rx,
            view_tx,
        };
        orchestrator.spawn_engine_load(false);
        orchestrator
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> TurnState {
        self.turn.state()
    }

    pub fn conversation_mode(&self) -> bool {
        self.turn.conversation_mode()
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn chat(&self) -> &ChatContentStore {
        &self.chat
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn voice(&self) -> &VoiceConfiguration {
        &self.voice
    }

    pub fn engine(&self) -> &EngineView {
        &self.engine
    }

    /// Number of scheduled restart timers (never more than one).
    pub fn pending_timers(&self) -> usize {
        usize::from(self.restart_timer.is_some())
    }

    pub fn is_permission_blocked(&self) -> bool {
        self.permission_blocked
    }

    pub fn view(&self) -> AssistantView {
        AssistantView {
            state: self.turn.state(),
            conversation_mode: self.turn.conversation_mode(),
            status: self.status.clone(),
            transcript_preview: self.chat.transcript_preview().to_string(),
            current_response: self.chat.current_response().to_string(),
            message_count: self.chat.len(),
            model_id: self.model_id.clone(),
            engine: self.engine.clone(),
            updated_at: Utc::now(),
        }
    }

    /// Watch the view. The receiver always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<AssistantView> {
        self.view_tx.subscribe()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.chat.snapshot()
    }

    /// Replace the conversation with a saved one. Stops any turn in progress.
    pub fn restore(&mut self, snapshot: ChatSnapshot) {
        self.fire(TurnEvent::Reset);
        self.chat.restore(snapshot);
        self.memory.reset();
        info!(messages = self.chat.len(), "conversation restored");
        self.publish();
    }

    /// Lift the permission block after the user granted microphone access again.
    pub fn microphone_permission_granted(&mut self) {
        if self.permission_blocked {
            info!("microphone permission granted again");
            self.permission_blocked = false;
            self.status = STATUS_READY.to_string();
            self.publish();
        }
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    /// Wait for the next queued event.
    pub async fn next_event(&mut self) -> Option<OrchestratorEvent> {
        tokio::select! {
            Some(signal) = self.speech_rx.recv() => Some(OrchestratorEvent::Speech(signal)),
            Some(event) = self.events_rx.recv() => Some(event),
            else => None,
        }
    }

    /// Take a queued event without waiting.
    pub fn try_next_event(&mut self) -> Option<OrchestratorEvent> {
        if let Ok(signal) = self.speech_rx.try_recv() {
            return Some(OrchestratorEvent::Speech(signal));
        }
        self.events_rx.try_recv().ok()
    }

    /// Handle one queued event. Returns `false` once the queue is closed.
    pub async fn step(&mut self) -> bool {
        match self.next_event().await {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    /// Run until the intent channel closes, then stop everything.
    pub async fn run(&mut self, mut intents: mpsc::Receiver<UserIntent>) {
        info!("🎙️ Turn orchestrator running");
        loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(intent) => self.handle_intent(intent),
                    None => break,
                },
                event = self.next_event() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }
        self.shutdown();
    }

    pub fn shutdown(&mut self) {
        info!("🛑 Turn orchestrator shutting down");
        self.turn.set_conversation_mode(false);
        self.fire(TurnEvent::StopEverything);
        self.publish();
    }

    // -----------------------------------------------------------------------
    // Intents
    // -----------------------------------------------------------------------

    pub fn handle_intent(&mut self, intent: UserIntent) {
        debug!(intent = intent.name(), state = %self.turn.state(), "user intent");
        match intent {
            UserIntent::StartConversation => self.start_listening(true),
            UserIntent::ListenOnce => self.start_listening(false),
            UserIntent::StopConversation => {
                self.turn.set_conversation_mode(false);
                self.fire(TurnEvent::StopEverything);
                self.status = STATUS_STOPPED.to_string();
            }
            UserIntent::SendText(text) => {
                let text = text.trim();
                if text.is_empty() {
                    debug!("ignoring empty text input");
                } else if !self.fire(TurnEvent::TextSubmitted(text.to_string())) {
                    debug!(state = %self.turn.state(), "text input rejected while busy");
                }
            }
            UserIntent::ClearHistory => {
                self.fire(TurnEvent::Reset);
                self.chat.clear();
                self.memory.reset();
                self.status = STATUS_CLEARED.to_string();
                info!("conversation cleared");
            }
            UserIntent::SwitchModel(model_id) => self.switch_model(model_id),
            UserIntent::UpdateVoice(voice) => {
                self.voice = voice.clamped();
                debug!(rate = self.voice.rate, pitch = self.voice.pitch, volume = self.voice.volume, "voice updated");
            }
        }
        self.publish();
    }

    fn start_listening(&mut self, conversation: bool) {
        if self.permission_blocked {
            self.status = STATUS_PERMISSION_DENIED.to_string();
            return;
        }
        self.turn.set_conversation_mode(conversation);
        if !self.fire(TurnEvent::StartListening) {
            debug!(state = %self.turn.state(), "start listening ignored");
        }
    }

    fn switch_model(&mut self, model_id: String) {
        let model_id = model_id.trim().to_string();
        if model_id.is_empty() {
            return;
        }
        if model_id == self.model_id && self.engine.is_ready() {
            debug!(model = %model_id, "model already loaded");
            return;
        }
        self.fire(TurnEvent::StopEverything);
        info!(from = %self.model_id, to = %model_id, "switching model");
        self.model_id = model_id;
        self.status = format!("Switching to {}", self.model_id);
        self.spawn_engine_load(true);
    }

    // -----------------------------------------------------------------------
    // Queue events
    // -----------------------------------------------------------------------

    pub fn handle_event(&mut self, event: OrchestratorEvent) {
        match event {
            OrchestratorEvent::Speech(signal) => self.on_speech(signal),
            OrchestratorEvent::ReplyFinished {
                epoch,
                compaction,
                result,
            } => self.on_reply(epoch, compaction, result),
            OrchestratorEvent::EngineProgress { model_id, progress } => {
                if model_id == self.model_id && !self.engine.is_ready() {
                    debug!(model = %model_id, percent = progress.percent, "engine loading");
                    self.engine = EngineView::Loading {
                        model_id,
                        percent: progress.percent,
                        text: progress.text,
                    };
                }
            }
            OrchestratorEvent::EngineSettled { model_id, result } => {
                self.on_engine_settled(model_id, result)
            }
            OrchestratorEvent::RestartListening { epoch } => {
                if epoch != self.epoch {
                    debug!(epoch, current = self.epoch, "stale restart dropped");
                } else {
                    self.restart_timer = None;
                    if self.turn.state() == TurnState::Error {
                        self.fire(TurnEvent::StartListening);
                    }
                }
            }
            OrchestratorEvent::RestartRecognizer { epoch } => {
                if epoch != self.epoch {
                    debug!(epoch, current = self.epoch, "stale recognizer restart dropped");
                } else {
                    self.restart_timer = None;
                    if self.turn.state() == TurnState::Listening {
                        self.open_recognizer();
                    }
                }
            }
        }
        self.publish();
    }

    fn on_speech(&mut self, signal: SpeechSignal) {
        if signal.epoch != self.epoch {
            debug!(epoch = signal.epoch, current = self.epoch, "stale speech callback dropped");
            return;
        }
        if !self.speech.accept(&signal) {
            debug!("callback from an abandoned speech session dropped");
            return;
        }
        match signal.event {
            SpeechEvent::Recognition { event, .. } => self.on_recognition(event),
            SpeechEvent::Synthesis { event, .. } => self.on_synthesis(event),
        }
    }

    fn on_recognition(&mut self, event: RecognitionEvent) {
        match event {
            RecognitionEvent::Started => debug!("recognizer started"),
            RecognitionEvent::Interim(text) => {
                if self.turn.state() == TurnState::Listening {
                    self.chat.set_transcript_preview(text);
                }
            }
            RecognitionEvent::Result(text) => {
                let text = text.trim();
                if text.is_empty() {
                    debug!("empty recognition result ignored");
                    return;
                }
                self.chat.set_transcript_preview(text);
                self.fire(TurnEvent::SpeechRecognized(text.to_string()));
            }
            RecognitionEvent::Error(err) => self.on_recognition_error(err),
            RecognitionEvent::Ended => {
                if self.turn.state() != TurnState::Listening {
                    return;
                }
                if self.turn.conversation_mode() {
                    debug!("recognizer ended without a result, restarting");
                    let epoch = self.epoch;
                    self.schedule(
                        self.config.timing.listen_restart_delay(),
                        OrchestratorEvent::RestartRecognizer { epoch },
                    );
                } else {
                    info!("recognizer ended without a result");
                    self.fire(TurnEvent::StopEverything);
                }
            }
        }
    }

    fn on_recognition_error(&mut self, err: RecognitionError) {
        match err {
            RecognitionError::Aborted => debug!("recognition aborted"),
            RecognitionError::NoSpeech => {
                if self.fire(TurnEvent::SpeechError(RecognitionError::NoSpeech)) {
                    if !self.turn.conversation_mode() {
                        self.status = STATUS_READY.to_string();
                    }
                    self.schedule_relisten();
                }
            }
            RecognitionError::PermissionDenied => {
                error!("microphone permission denied, voice input disabled");
                self.permission_blocked = true;
                self.turn.set_conversation_mode(false);
                self.fire(TurnEvent::SpeechError(RecognitionError::PermissionDenied));
                self.status = STATUS_PERMISSION_DENIED.to_string();
            }
            other => {
                warn!(reason = other.reason(), "speech recognition failed");
                let status = format!("Speech recognition error: {}", other);
                if self.fire(TurnEvent::SpeechError(other)) {
                    self.status = status;
                    self.schedule_relisten();
                }
            }
        }
    }

    fn on_synthesis(&mut self, event: SynthesisEvent) {
        match event {
            SynthesisEvent::Started => debug!("synthesis started"),
            SynthesisEvent::Ended { synthetic: false } => {
                self.fire(TurnEvent::SpeechFinished);
            }
            SynthesisEvent::Ended { synthetic: true } => {
                let err = SynthesisError::SafetyTimeout;
                warn!("platform never reported end of speech, forcing it: {}", err);
                if self.fire(TurnEvent::SpeechFinished) {
                    self.status = format!("Speech output stopped: {}", err);
                }
            }
            SynthesisEvent::Error(err) => {
                warn!("speech synthesis failed: {}", err);
                self.fire(TurnEvent::SpeechFinished);
                self.status = format!("Speech output failed: {}", err);
            }
        }
    }

    fn on_reply(&mut self, epoch: u64, compaction: Compaction, result: Result<String, InferenceError>) {
        if epoch != self.epoch || self.turn.state() != TurnState::Processing {
            debug!(epoch, current = self.epoch, "stale reply dropped");
            return;
        }
        self.reply_task = None;
        self.memory.apply(compaction);

        match result {
            Ok(text) => {
                self.chat.append_assistant(text.clone());
                self.fire(TurnEvent::ReplyReady(text));
            }
            Err(err) => {
                self.chat.append_assistant(reply_failure_message(err.kind()));
                let status = if err.is_engine_failure() {
                    error!(kind = err.kind(), "no inference engine: {}", err);
                    self.engine = EngineView::Unavailable {
                        model_id: self.model_id.clone(),
                        reason: err.to_string(),
                    };
                    STATUS_ENGINE_UNAVAILABLE.to_string()
                } else {
                    warn!(kind = err.kind(), "reply failed: {}", err);
                    format!("Reply failed: {}", err)
                };
                if self.fire(TurnEvent::ReplyError(err)) {
                    self.status = status;
                    self.schedule_relisten();
                }
            }
        }
    }

    fn on_engine_settled(&mut self, model_id: String, result: Result<(), InferenceError>) {
        if model_id != self.model_id {
            debug!(model = %model_id, current = %self.model_id, "engine result for another model dropped");
            return;
        }
        match result {
            Ok(()) => {
                info!(model = %model_id, "✅ engine ready");
                self.engine = EngineView::Ready { model_id };
                if self.turn.state() == TurnState::Idle {
                    self.status = STATUS_READY.to_string();
                }
            }
            Err(err) => {
                error!(model = %model_id, kind = err.kind(), "engine unavailable: {}", err);
                self.engine = EngineView::Unavailable {
                    model_id,
                    reason: err.to_string(),
                };
                if self.turn.state() == TurnState::Idle {
                    self.status = STATUS_ENGINE_UNAVAILABLE.to_string();
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transitions and their effects
    // -----------------------------------------------------------------------

    /// Feed the turn machine and run exit/entry effects. Returns whether it moved.
    fn fire(&mut self, event: TurnEvent) -> bool {
        let Some(transition) = self.turn.handle(event) else {
            return false;
        };
        self.epoch += 1;
        self.cancel_timer();
        debug!(from = %transition.from, to = %transition.to, epoch = self.epoch, "state changed");

        match transition.from {
            TurnState::Listening => self.speech.stop_recognition(),
            TurnState::Processing => self.abort_reply(),
            TurnState::Speaking => self.speech.cancel_synthesis(),
            TurnState::Idle | TurnState::Error => {}
        }

        match (transition.to, transition.event) {
            (TurnState::Idle, _) => {
                self.speech.halt();
                self.abort_reply();
                self.status = STATUS_READY.to_string();
            }
            (TurnState::Listening, _) => {
                self.chat.set_transcript_preview("");
                self.status = STATUS_LISTENING.to_string();
                self.open_recognizer();
            }
            (TurnState::Processing, TurnEvent::SpeechRecognized(text))
            | (TurnState::Processing, TurnEvent::TextSubmitted(text)) => {
                if !self.chat.append_user(text) {
                    debug!("duplicate user message not recorded");
                }
                self.status = STATUS_THINKING.to_string();
                self.spawn_reply();
            }
            (TurnState::Speaking, TurnEvent::ReplyReady(text)) => {
                self.status = STATUS_SPEAKING.to_string();
                if let Err(err) = self.speech.speak(self.epoch, &text, &self.voice) {
                    warn!("could not start speech output: {}", err);
                    self.fire(TurnEvent::SpeechFinished);
                    self.status = format!("Speech output failed: {}", err);
                }
            }
            _ => {}
        }
        true
    }

    fn open_recognizer(&mut self) {
        let language = self.voice.language.clone();
        if let Err(err) = self.speech.start_recognition(self.epoch, &language) {
            warn!(reason = err.reason(), "recognizer failed to start");
            self.on_recognition_error(err);
        }
    }

    fn abort_reply(&mut self) {
        if let Some(task) = self.reply_task.take() {
            task.abort();
            debug!("reply task cancelled");
        }
    }

    fn schedule_relisten(&mut self) {
        if self.turn.conversation_mode() && !self.permission_blocked {
            let epoch = self.epoch;
            self.schedule(
                self.config.timing.error_backoff(),
                OrchestratorEvent::RestartListening { epoch },
            );
        }
    }

    /// Post `event` after `delay`, replacing any pending timer.
    fn schedule(&mut self, delay: Duration, event: OrchestratorEvent) {
        self.cancel_timer();
        let tx = self.events_tx.clone();
        debug!(?delay, "restart scheduled");
        self.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.restart_timer.take() {
            timer.abort();
        }
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.view());
    }

    // -----------------------------------------------------------------------
    // Background work
    // -----------------------------------------------------------------------

    fn progress_reporter(&self) -> ProgressFn {
        let tx = self.events_tx.clone();
        let model_id = self.model_id.clone();
        Arc::new(move |progress: LoadProgress| {
            let _ = tx.send(OrchestratorEvent::EngineProgress {
                model_id: model_id.clone(),
                progress,
            });
        })
    }

    fn spawn_engine_load(&mut self, switch: bool) {
        let registry = Arc::clone(&self.registry);
        let tx = self.events_tx.clone();
        let model_id = self.model_id.clone();
        let progress = self.progress_reporter();
        self.engine = EngineView::Loading {
            model_id: model_id.clone(),
            percent: 0,
            text: format!("Loading {}", model_id),
        };

        let load_timeout = self.config.timing.load_timeout();

        tokio::spawn(async move {
            let loaded = acquire_engine(&registry, &model_id, progress, switch, load_timeout).await;
            let _ = tx.send(OrchestratorEvent::EngineSettled {
                model_id,
                result: loaded.map(|_| ()),
            });
        });
    }

    fn summary_settings(&self) -> SummarySettings {
        let timing = &self.config.timing;
        SummarySettings {
            options: GenerationOptions::new(
                SUMMARY_MAX_TOKENS,
                SUMMARY_TEMPERATURE,
                timing.summary_timeout(),
            ),
            retry: DegradedRetry::new(
                SUMMARY_RETRY_KEEP,
                SUMMARY_RETRY_MAX_TOKENS,
                timing.recovery_timeout(),
            ),
        }
    }

    /// Compact memory if needed, then generate the reply, all off the event loop.
    fn spawn_reply(&mut self) {
        self.abort_reply();
        let epoch = self.epoch;
        let log = self.chat.messages().to_vec();
        let plan = self.memory.plan(&log, &self.summary_settings());
        let mut memory = self.memory.clone();
        let instruction = self.config.system_prompt.clone();
        let timing = &self.config.timing;
        let options = GenerationOptions::new(
            self.config.engine.max_tokens,
            self.config.engine.temperature,
            timing.reply_timeout(),
        );
        let retry = DegradedRetry::new(
            REPLY_RETRY_KEEP,
            REPLY_RETRY_MAX_TOKENS,
            timing.recovery_timeout(),
        );
        let load_timeout = timing.load_timeout();
        let registry = Arc::clone(&self.registry);
        let model_id = self.model_id.clone();
        let tx = self.events_tx.clone();

        self.reply_task = Some(tokio::spawn(async move {
            let engine = acquire_engine(&registry, &model_id, ignore_progress(), false, load_timeout).await;
            let (compaction, result) = match engine {
                Err(err) => (Compaction::Unchanged, Err(err)),
                Ok(engine) => {
                    let compaction = plan.run(&*engine).await;
                    memory.apply(compaction.clone());
                    let request = memory.build_request(&log, instruction, options);
                    let fallback = request.degraded(&retry, REPLY_MINIMAL_PROMPT);
                    let result = generate_with_recovery(&*engine, &request, &fallback).await;
                    (compaction, result)
                }
            };
            let _ = tx.send(OrchestratorEvent::ReplyFinished {
                epoch,
                compaction,
                result,
            });
        }));
    }
}

/// Wait for the engine. The registry's own load timeout normally settles a hung load
/// and caches the failure; this bound only covers a registry configured with a longer one.
async fn acquire_engine(
    registry: &EngineRegistry,
    model_id: &str,
    progress: ProgressFn,
    switch: bool,
    load_timeout: Duration,
) -> Result<Engine, InferenceError> {
    let load = async {
        if switch {
            registry.switch_model(model_id, progress).await
        } else {
            registry.get_or_create(model_id, progress).await
        }
    };
    match tokio::time::timeout(load_timeout + LOAD_WAIT_GRACE, load).await {
        Ok(loaded) => loaded,
        Err(_) => Err(InferenceError::LoadFailed(format!(
            "load timed out after {} ms",
            load_timeout.as_millis()
        ))),
    }
}

impl Drop for TurnOrchestrator {
    fn drop(&mut self) {
        self.abort_reply();
        self.cancel_timer();
    }
}
