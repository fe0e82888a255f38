//! Integration tests for the turn orchestrator
//!
//! The platform recognizer, synthesizer and engine are fakes; time is paused so
//! backoffs and safety timeouts run instantly.
//!
//! ## Scenarios
//! 1. One listen-once turn ends idle; conversation mode ends listening again.
//! 2. `no-speech` in conversation mode schedules exactly one re-entry, and stop
//!    before the backoff cancels it.
//! 3. A synthesizer that never reports the end is forced out of `speaking`.
//! 4. Late callbacks and replies from abandoned turns are dropped.
//! 5. Permission denial is terminal; an unavailable engine still records input.
//! 6. Long conversations are summarized before the reply request is built.

use async_trait::async_trait;
use parley_core::prompts::SUMMARY_CONTEXT_PREFIX;
use parley_core::{
    AssistantConfig, Compaction, ConversationMessage, Engine, EngineBackend, EngineRegistry,
    GenerationOptions, InferenceError, LanguageModel, MemoryPolicy, ProgressFn,
};
use parley_voice::{
    EngineView, OrchestratorEvent, RecognitionError, RecognitionSink, SpeechRecognizer,
    SpeechSynthesizer, SynthesisError, SynthesisSink, TurnOrchestrator, TurnState, UserIntent,
    Utterance, STATUS_ENGINE_UNAVAILABLE, STATUS_PERMISSION_DENIED, STATUS_READY,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MicState {
    starts: usize,
    stops: usize,
    sink: Option<RecognitionSink>,
}

struct FakeMic(Arc<Mutex<MicState>>);

impl SpeechRecognizer for FakeMic {
    fn start(&mut self, _language: &str, sink: RecognitionSink) -> Result<(), RecognitionError> {
        let mut mic = self.0.lock().unwrap();
        mic.starts += 1;
        mic.sink = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        self.0.lock().unwrap().stops += 1;
    }
}

#[derive(Default)]
struct SpeakerState {
    spoken: Vec<String>,
    cancels: usize,
    sink: Option<SynthesisSink>,
}

struct FakeSpeaker(Arc<Mutex<SpeakerState>>);

impl SpeechSynthesizer for FakeSpeaker {
    fn speak(&mut self, utterance: &Utterance, sink: SynthesisSink) -> Result<(), SynthesisError> {
        let mut speaker = self.0.lock().unwrap();
        speaker.spoken.push(utterance.text.clone());
        speaker.sink = Some(sink);
        Ok(())
    }

    fn cancel(&mut self) {
        self.0.lock().unwrap().cancels += 1;
    }
}

struct FakeModel {
    replies: Mutex<VecDeque<Result<String, InferenceError>>>,
    requests: Mutex<Vec<Vec<ConversationMessage>>>,
    delay: Duration,
}

#[async_trait]
impl LanguageModel for FakeModel {
    fn model_id(&self) -> &str {
        "fake-model"
    }

    async fn complete(
        &self,
        messages: &[ConversationMessage],
        _options: &GenerationOptions,
    ) -> Result<String, InferenceError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("ok".to_string()))
    }
}

struct FakeBackend {
    model: Arc<FakeModel>,
    fail_with: Option<InferenceError>,
    hang: bool,
}

#[async_trait]
impl EngineBackend for FakeBackend {
    async fn load(&self, _model_id: &str, _progress: ProgressFn) -> Result<Engine, InferenceError> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        let engine: Engine = self.model.clone();
        Ok(engine)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    orch: TurnOrchestrator,
    mic: Arc<Mutex<MicState>>,
    speaker: Arc<Mutex<SpeakerState>>,
    model: Arc<FakeModel>,
}

struct Setup {
    config: AssistantConfig,
    replies: Vec<Result<String, InferenceError>>,
    delay: Duration,
    fail_with: Option<InferenceError>,
    /// Engine load never answers; the harness does not wait for it.
    hang_load: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            config: AssistantConfig::default(),
            replies: vec![],
            delay: Duration::ZERO,
            fail_with: None,
            hang_load: false,
        }
    }
}

async fn harness(setup: Setup) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let model = Arc::new(FakeModel {
        replies: Mutex::new(setup.replies.into()),
        requests: Mutex::new(Vec::new()),
        delay: setup.delay,
    });
    let backend = Arc::new(FakeBackend {
        model: Arc::clone(&model),
        fail_with: setup.fail_with,
        hang: setup.hang_load,
    });
    let registry =
        Arc::new(EngineRegistry::new(backend).with_load_timeout(setup.config.timing.load_timeout()));
    let mic = Arc::new(Mutex::new(MicState::default()));
    let speaker = Arc::new(Mutex::new(SpeakerState::default()));

    let mut orch = TurnOrchestrator::new(
        setup.config,
        registry,
        Box::new(FakeMic(Arc::clone(&mic))),
        Box::new(FakeSpeaker(Arc::clone(&speaker))),
    );
    if !setup.hang_load {
        drive_until(&mut orch, |o| !matches!(o.engine(), EngineView::Loading { .. })).await;
    }

    Harness {
        orch,
        mic,
        speaker,
        model,
    }
}

async fn drive_until<F>(orch: &mut TurnOrchestrator, done: F)
where
    F: Fn(&TurnOrchestrator) -> bool,
{
    tokio::time::timeout(Duration::from_secs(600), async {
        while !done(orch) {
            assert!(orch.step().await, "event queue closed");
        }
    })
    .await
    .expect("condition never reached");
}

impl Harness {
    fn mic_sink(&self) -> RecognitionSink {
        self.mic.lock().unwrap().sink.clone().expect("recognizer was started")
    }

    fn speaker_sink(&self) -> SynthesisSink {
        self.speaker.lock().unwrap().sink.clone().expect("synthesizer was started")
    }

    fn starts(&self) -> usize {
        self.mic.lock().unwrap().starts
    }

    async fn until_state(&mut self, state: TurnState) {
        drive_until(&mut self.orch, |o| o.state() == state).await;
    }

    /// Typed turn from idle to idle.
    async fn text_turn(&mut self, text: &str) {
        self.orch.handle_intent(UserIntent::SendText(text.to_string()));
        self.until_state(TurnState::Speaking).await;
        self.speaker_sink().ended();
        self.until_state(TurnState::Idle).await;
    }
}

// ===========================================================================
// Scenario 1: full turns
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn listen_once_runs_a_full_turn_and_goes_idle() {
    let mut h = harness(Setup {
        replies: vec![Ok("hi there".into())],
        ..Setup::default()
    })
    .await;
    assert!(h.orch.engine().is_ready());

    h.orch.handle_intent(UserIntent::ListenOnce);
    assert_eq!(h.orch.state(), TurnState::Listening);
    assert_eq!(h.starts(), 1);

    h.mic_sink().interim("hel");
    h.mic_sink().result("hello");
    h.until_state(TurnState::Speaking).await;
    assert_eq!(h.speaker.lock().unwrap().spoken, vec!["hi there".to_string()]);

    h.speaker_sink().ended();
    h.until_state(TurnState::Idle).await;

    let chat = h.orch.chat();
    assert_eq!(chat.messages().len(), 2);
    assert_eq!(chat.messages()[0], ConversationMessage::user("hello"));
    assert_eq!(chat.messages()[1], ConversationMessage::assistant("hi there"));
    assert_eq!(chat.current_response(), "hi there");
    assert_eq!(h.orch.status(), STATUS_READY);
    assert!(h.mic.lock().unwrap().stops >= 1, "leaving listening stops the recognizer");
}

#[tokio::test(start_paused = true)]
async fn conversation_mode_returns_to_listening_after_reply() {
    let mut h = harness(Setup::default()).await;

    h.orch.handle_intent(UserIntent::StartConversation);
    h.mic_sink().result("hello");
    h.until_state(TurnState::Speaking).await;
    h.speaker_sink().ended();
    h.until_state(TurnState::Listening).await;

    assert!(h.orch.conversation_mode());
    assert_eq!(h.starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn silent_session_restarts_the_recognizer_in_conversation_mode() {
    let mut h = harness(Setup::default()).await;

    h.orch.handle_intent(UserIntent::StartConversation);
    h.mic_sink().ended();
    assert!(h.orch.step().await);
    assert_eq!(h.orch.pending_timers(), 1);

    let before = Instant::now();
    while h.starts() < 2 {
        assert!(h.orch.step().await);
    }
    assert!(before.elapsed() >= Duration::from_millis(800));
    assert_eq!(h.orch.state(), TurnState::Listening);
    assert_eq!(h.orch.pending_timers(), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_session_goes_idle_without_conversation_mode() {
    let mut h = harness(Setup::default()).await;

    h.orch.handle_intent(UserIntent::ListenOnce);
    h.mic_sink().ended();
    h.until_state(TurnState::Idle).await;
    assert_eq!(h.orch.pending_timers(), 0);
    assert_eq!(h.starts(), 1);
}

// ===========================================================================
// Scenario 2: error backoff
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn no_speech_schedules_exactly_one_restart() {
    let mut h = harness(Setup::default()).await;

    h.orch.handle_intent(UserIntent::StartConversation);
    let sink = h.mic_sink();
    sink.error(RecognitionError::NoSpeech);
    sink.ended();

    h.until_state(TurnState::Error).await;
    let failed_at = Instant::now();
    assert_eq!(h.orch.pending_timers(), 1);

    // The trailing `Ended` belongs to the abandoned session.
    assert!(h.orch.step().await);
    assert_eq!(h.orch.state(), TurnState::Error);
    assert_eq!(h.orch.pending_timers(), 1);

    h.until_state(TurnState::Listening).await;
    assert!(failed_at.elapsed() >= Duration::from_millis(2_000));
    assert_eq!(h.starts(), 2);
    assert_eq!(h.orch.pending_timers(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_before_backoff_cancels_the_restart() {
    let mut h = harness(Setup::default()).await;

    h.orch.handle_intent(UserIntent::StartConversation);
    h.mic_sink().error(RecognitionError::Network);
    h.until_state(TurnState::Error).await;
    assert_eq!(h.orch.pending_timers(), 1);
    assert!(h.orch.status().contains("network"));

    h.orch.handle_intent(UserIntent::StopConversation);
    assert_eq!(h.orch.state(), TurnState::Idle);
    assert_eq!(h.orch.pending_timers(), 0);

    tokio::time::advance(Duration::from_secs(10)).await;
    tokio::task::yield_now().await;
    assert!(h.orch.try_next_event().is_none());
    assert_eq!(h.orch.state(), TurnState::Idle);
    assert_eq!(h.starts(), 1);
}

// ===========================================================================
// Scenario 3: speech safety timeout
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn safety_timeout_forces_end_of_speech() {
    let config = AssistantConfig::default();
    let timing = config.timing;
    let reply = "a reply the platform never finishes reading";
    let mut h = harness(Setup {
        config,
        replies: vec![Ok(reply.into())],
        ..Setup::default()
    })
    .await;

    h.orch.handle_intent(UserIntent::SendText("hello".into()));
    h.until_state(TurnState::Speaking).await;
    let speaking_since = Instant::now();

    h.until_state(TurnState::Idle).await;
    assert!(speaking_since.elapsed() <= timing.speech_safety_timeout(reply));
    assert!(h.speaker.lock().unwrap().cancels >= 1);
    assert_eq!(
        h.orch.status(),
        format!("Speech output stopped: {}", SynthesisError::SafetyTimeout)
    );
}

// ===========================================================================
// Scenario 4: stale work
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn barge_in_cancels_speech_and_ignores_its_late_end() {
    let mut h = harness(Setup::default()).await;

    h.orch.handle_intent(UserIntent::SendText("tell me a story".into()));
    h.until_state(TurnState::Speaking).await;
    let late = h.speaker_sink();

    h.orch.handle_intent(UserIntent::StartConversation);
    assert_eq!(h.orch.state(), TurnState::Listening);
    assert_eq!(h.speaker.lock().unwrap().cancels, 1);
    assert_eq!(h.starts(), 1);

    late.ended();
    assert!(h.orch.step().await);
    assert_eq!(h.orch.state(), TurnState::Listening);
}

#[tokio::test(start_paused = true)]
async fn reply_after_stop_is_dropped() {
    let mut h = harness(Setup {
        delay: Duration::from_secs(5),
        ..Setup::default()
    })
    .await;

    h.orch.handle_intent(UserIntent::SendText("hello".into()));
    assert_eq!(h.orch.state(), TurnState::Processing);
    let processing_epoch = h.orch.epoch();

    h.orch.handle_intent(UserIntent::StopConversation);
    assert_eq!(h.orch.state(), TurnState::Idle);

    tokio::time::advance(Duration::from_secs(10)).await;
    tokio::task::yield_now().await;
    assert!(h.orch.try_next_event().is_none(), "reply task was aborted");

    // Even if a result slips through, its epoch is stale.
    h.orch.handle_event(OrchestratorEvent::ReplyFinished {
        epoch: processing_epoch,
        compaction: Compaction::Unchanged,
        result: Ok("too late".into()),
    });
    assert_eq!(h.orch.state(), TurnState::Idle);
    assert_eq!(h.orch.chat().len(), 1);
    assert!(h.speaker.lock().unwrap().spoken.is_empty());
}

#[tokio::test(start_paused = true)]
async fn resubmitting_an_unanswered_message_does_not_duplicate_it() {
    let mut h = harness(Setup {
        delay: Duration::from_secs(5),
        ..Setup::default()
    })
    .await;

    h.orch.handle_intent(UserIntent::SendText("hello".into()));
    h.orch.handle_intent(UserIntent::StopConversation);
    h.orch.handle_intent(UserIntent::SendText("hello".into()));
    assert_eq!(h.orch.state(), TurnState::Processing);
    assert_eq!(h.orch.chat().len(), 1);

    h.until_state(TurnState::Speaking).await;
    assert_eq!(h.orch.chat().len(), 2);
}

// ===========================================================================
// Scenario 5: terminal failures
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn permission_denied_never_retries() {
    let mut h = harness(Setup::default()).await;

    h.orch.handle_intent(UserIntent::StartConversation);
    h.mic_sink().error(RecognitionError::PermissionDenied);
    h.until_state(TurnState::Error).await;

    assert_eq!(h.orch.status(), STATUS_PERMISSION_DENIED);
    assert_eq!(h.orch.pending_timers(), 0);
    assert!(!h.orch.conversation_mode());

    h.orch.handle_intent(UserIntent::StartConversation);
    assert_eq!(h.orch.state(), TurnState::Error);
    assert_eq!(h.starts(), 1);

    h.orch.microphone_permission_granted();
    h.orch.handle_intent(UserIntent::StartConversation);
    assert_eq!(h.orch.state(), TurnState::Listening);
    assert_eq!(h.starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn unavailable_engine_still_records_the_user() {
    let mut h = harness(Setup {
        fail_with: Some(InferenceError::UnsupportedDevice("no gpu".into())),
        ..Setup::default()
    })
    .await;
    assert!(h.orch.engine().is_unavailable());

    h.orch.handle_intent(UserIntent::SendText("hello".into()));
    h.until_state(TurnState::Error).await;

    let messages = h.orch.chat().messages();
    assert_eq!(messages[0], ConversationMessage::user("hello"));
    assert_eq!(messages.len(), 2);
    assert_eq!(h.orch.status(), STATUS_ENGINE_UNAVAILABLE);
    assert!(h.speaker.lock().unwrap().spoken.is_empty());
    assert!(h.model.requests.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn hung_engine_load_fails_the_turn_within_the_load_timeout() {
    let mut config = AssistantConfig::default();
    config.timing.load_timeout_ms = 5_000;
    let load_timeout = config.timing.load_timeout();
    let mut h = harness(Setup {
        config,
        hang_load: true,
        ..Setup::default()
    })
    .await;
    assert!(matches!(h.orch.engine(), EngineView::Loading { .. }));

    let sent_at = Instant::now();
    h.orch.handle_intent(UserIntent::SendText("hello".into()));
    assert_eq!(h.orch.state(), TurnState::Processing);
    h.until_state(TurnState::Error).await;

    assert!(sent_at.elapsed() <= load_timeout + Duration::from_millis(100));
    assert_eq!(h.orch.status(), STATUS_ENGINE_UNAVAILABLE);
    assert!(h.orch.engine().is_unavailable());
    assert_eq!(h.orch.chat().messages().len(), 2);
    assert!(h.model.requests.lock().unwrap().is_empty());

    // The failure is cached: the next turn fails at once instead of hanging again.
    h.orch.handle_intent(UserIntent::SendText("again".into()));
    let retried_at = Instant::now();
    h.until_state(TurnState::Error).await;
    assert!(retried_at.elapsed() < load_timeout);
}

#[tokio::test(start_paused = true)]
async fn generation_failure_becomes_an_assistant_message() {
    let mut h = harness(Setup {
        replies: vec![
            Err(InferenceError::generation("boom")),
            Err(InferenceError::generation("boom again")),
        ],
        ..Setup::default()
    })
    .await;

    h.orch.handle_intent(UserIntent::SendText("hello".into()));
    h.until_state(TurnState::Error).await;

    assert_eq!(h.model.requests.lock().unwrap().len(), 2, "one degraded retry");
    let last = h.orch.chat().messages().last().cloned().unwrap();
    assert_eq!(last.role, parley_core::Role::Assistant);
    assert_eq!(h.orch.pending_timers(), 0, "no relisten outside conversation mode");
}

// ===========================================================================
// Scenario 6: memory
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn long_conversations_are_summarized_before_replying() {
    let mut config = AssistantConfig::default();
    config.memory = MemoryPolicy::new(6, 4, 2, true).unwrap();
    let mut h = harness(Setup {
        config,
        ..Setup::default()
    })
    .await;

    h.text_turn("first").await;
    h.text_turn("second").await;
    h.text_turn("third").await;

    assert_eq!(h.orch.chat().len(), 6, "durable log keeps everything");
    assert_eq!(h.orch.memory().folded(), 3);
    assert_eq!(h.orch.memory().summary(), Some("ok"));

    let requests = h.model.requests.lock().unwrap();
    assert_eq!(requests.len(), 4, "three replies plus one summary");
    let reply = requests.last().unwrap();
    assert_eq!(reply.len(), 4);
    assert!(reply[1].content.starts_with(SUMMARY_CONTEXT_PREFIX));
    assert_eq!(reply[3], ConversationMessage::user("third"));
}

// ===========================================================================
// Intents and view
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn blank_text_and_busy_input_are_ignored() {
    let mut h = harness(Setup {
        delay: Duration::from_secs(5),
        ..Setup::default()
    })
    .await;

    let epoch = h.orch.epoch();
    h.orch.handle_intent(UserIntent::SendText("   ".into()));
    assert_eq!(h.orch.state(), TurnState::Idle);
    assert_eq!(h.orch.epoch(), epoch);

    h.orch.handle_intent(UserIntent::SendText("hello".into()));
    h.orch.handle_intent(UserIntent::StartConversation);
    h.orch.handle_intent(UserIntent::SendText("again".into()));
    assert_eq!(h.orch.state(), TurnState::Processing);
    assert_eq!(h.starts(), 0);
    assert_eq!(h.orch.chat().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn clear_history_resets_conversation() {
    let mut h = harness(Setup::default()).await;
    h.text_turn("hello").await;
    assert_eq!(h.orch.chat().len(), 2);

    h.orch.handle_intent(UserIntent::ClearHistory);
    assert!(h.orch.chat().is_empty());
    assert_eq!(h.orch.state(), TurnState::Idle);
    assert!(h.orch.memory().summary().is_none());
    assert_eq!(h.orch.chat().current_response(), "");
}

#[tokio::test(start_paused = true)]
async fn view_is_published_after_each_intent() {
    let mut h = harness(Setup {
        delay: Duration::from_secs(5),
        ..Setup::default()
    })
    .await;
    let view = h.orch.subscribe();

    h.orch.handle_intent(UserIntent::SendText("hello".into()));
    {
        let current = view.borrow();
        assert_eq!(current.state, TurnState::Processing);
        assert_eq!(current.message_count, 1);
        assert!(current.engine.is_ready());
    }

    h.until_state(TurnState::Speaking).await;
    assert_eq!(view.borrow().current_response, "ok");
}

#[tokio::test(start_paused = true)]
async fn switching_models_keeps_the_conversation() {
    let mut h = harness(Setup::default()).await;
    h.text_turn("hello").await;

    h.orch.handle_intent(UserIntent::SwitchModel("other-model".into()));
    assert_eq!(h.orch.model_id(), "other-model");
    drive_until(&mut h.orch, |o| o.engine().is_ready()).await;

    assert_eq!(h.orch.chat().len(), 2);
    assert_eq!(h.orch.state(), TurnState::Idle);
}
