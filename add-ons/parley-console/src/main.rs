//! Parley console - talk to the local assistant from a terminal
//!
//! Typed lines stand in for the microphone and printed replies for the speaker,
//! so the whole turn loop (listening, thinking, speaking, recovery) can be used
//! without audio hardware. Talks to an OpenAI-compatible local runtime.

mod commands;
mod terminal;

use commands::{Command, HELP};
use parley_core::{
    global_registry, AssistantConfig, ChatSnapshot, CoreError, EngineRegistry, LocalEngineBackend,
    VoiceConfiguration,
};
use parley_voice::{AssistantView, EngineView, TurnOrchestrator, UserIntent, VoiceResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use terminal::{MicHandle, TerminalMic, TerminalSpeaker};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_HISTORY_PATH: &str = "data/history.json";
const DEFAULT_VOICE_PATH: &str = "data/voice.json";

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[parley-console] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match AssistantConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };
    let history_path = env_path("PARLEY_HISTORY_PATH", DEFAULT_HISTORY_PATH);
    let voice_path = env_path("PARLEY_VOICE_PATH", DEFAULT_VOICE_PATH);
    let voice = load_voice(&voice_path).unwrap_or_else(|| config.voice.clone());

    tracing::info!(
        model = %config.model_id,
        runtime = %config.engine.base_url,
        history = %history_path.display(),
        "Parley console starting"
    );

    let engine_config = config.engine.clone();
    let load_timeout = config.timing.load_timeout();
    let registry = global_registry(|| {
        EngineRegistry::new(Arc::new(LocalEngineBackend::new(&engine_config)))
            .with_load_timeout(load_timeout)
    });
    let (mic, mic_handle) = TerminalMic::new();
    let mut orchestrator = TurnOrchestrator::new(
        config,
        registry,
        Box::new(mic),
        Box::new(TerminalSpeaker::new()),
    );
    if let Some(snapshot) = load_history(&history_path) {
        orchestrator.restore(snapshot);
    }
    orchestrator.handle_intent(UserIntent::UpdateVoice(voice.clone()));

    tokio::spawn(print_view_changes(orchestrator.subscribe()));

    let (intent_tx, intent_rx) = mpsc::channel(32);
    tokio::spawn(read_input(intent_tx, mic_handle, voice));
    println!("{}", HELP);

    tokio::select! {
        _ = orchestrator.run(intent_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("CTRL-C received; shutting down");
            orchestrator.shutdown();
        }
    }

    save_history(&history_path, &orchestrator.snapshot());
    if let Err(e) = orchestrator.voice().save_json(&voice_path) {
        tracing::warn!(error = %e, path = %voice_path.display(), "could not save voice settings");
    }
}

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn load_voice(path: &Path) -> Option<VoiceConfiguration> {
    if !path.is_file() {
        return None;
    }
    match VoiceConfiguration::load_json(path) {
        Ok(voice) => Some(voice),
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "ignoring saved voice settings");
            None
        }
    }
}

fn load_history(path: &Path) -> Option<ChatSnapshot> {
    let raw = std::fs::read_to_string(path).ok()?;
    match ChatSnapshot::from_json(&raw) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "ignoring saved conversation");
            None
        }
    }
}

fn write_history(path: &Path, snapshot: &ChatSnapshot) -> VoiceResult<()> {
    let json = snapshot.to_json()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(CoreError::from)?;
    }
    std::fs::write(path, json).map_err(CoreError::from)?;
    Ok(())
}

fn save_history(path: &Path, snapshot: &ChatSnapshot) {
    match write_history(path, snapshot) {
        Ok(()) => tracing::info!(messages = snapshot.messages.len(), "conversation saved"),
        Err(e) => tracing::warn!(error = %e, path = %path.display(), "could not save conversation"),
    }
}

/// Read stdin lines and turn them into intents or recognized speech.
async fn read_input(intents: mpsc::Sender<UserIntent>, mic: MicHandle, mut voice: VoiceConfiguration) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                break;
            }
        };
        let intent = match commands::parse(&line) {
            None => continue,
            Some(Command::Say(text)) => {
                if mic.deliver(&text) {
                    continue;
                }
                UserIntent::SendText(text)
            }
            Some(Command::Intent(intent)) => intent,
            Some(Command::Voice(change)) => {
                change.apply(&mut voice);
                UserIntent::UpdateVoice(voice.clone())
            }
            Some(Command::Help) => {
                println!("{}", HELP);
                continue;
            }
            Some(Command::Invalid(message)) => {
                println!("⚠️  {}", message);
                continue;
            }
            Some(Command::Quit) => break,
        };
        if intents.send(intent).await.is_err() {
            break;
        }
    }
    // Dropping the sender ends the orchestrator loop.
}

async fn print_view_changes(mut views: watch::Receiver<AssistantView>) {
    let mut last_status = String::new();
    let mut last_engine: Option<EngineView> = None;
    while views.changed().await.is_ok() {
        let view = views.borrow_and_update().clone();
        if last_engine.as_ref() != Some(&view.engine) {
            match &view.engine {
                EngineView::Loading { percent, text, .. } => println!("⏳ {}% {}", percent, text),
                EngineView::Ready { model_id } => println!("✅ {} ready", model_id),
                EngineView::Unavailable { reason, .. } => println!("⚠️  model unavailable: {}", reason),
            }
            last_engine = Some(view.engine.clone());
        }
        if view.status != last_status {
            println!("[{}] {}", view.state, view.status);
            last_status = view.status;
        }
    }
}
