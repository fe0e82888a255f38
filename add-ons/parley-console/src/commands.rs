//! Slash commands typed at the console prompt.

use parley_core::VoiceConfiguration;
use parley_voice::UserIntent;

pub const HELP: &str = "\
Commands:
  /start            hands-free conversation (keep listening after each reply)
  /listen           listen for one utterance
  /stop             stop listening and speaking
  /clear            forget the conversation
  /model <id>       switch the local model
  /rate <n>         speech rate (0.1 - 10)
  /pitch <n>        speech pitch (0 - 2)
  /volume <n>       speech volume (0 - 1)
  /voice <id|default>
  /lang <code>      recognition and speech language, e.g. en-US
  /help             this text
  /quit             exit
Anything else is sent as a message, or as speech while listening.";

#[derive(Debug, Clone, PartialEq)]
pub enum VoiceChange {
    Rate(f32),
    Pitch(f32),
    Volume(f32),
    VoiceId(Option<String>),
    Language(String),
}

impl VoiceChange {
    pub fn apply(&self, voice: &mut VoiceConfiguration) {
        match self {
            VoiceChange::Rate(v) => voice.rate = *v,
            VoiceChange::Pitch(v) => voice.pitch = *v,
            VoiceChange::Volume(v) => voice.volume = *v,
            VoiceChange::VoiceId(id) => voice.voice_id = id.clone(),
            VoiceChange::Language(lang) => voice.language = lang.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Intent(UserIntent),
    /// Plain text: speech while the microphone is open, a typed message otherwise.
    Say(String),
    Voice(VoiceChange),
    Help,
    Quit,
    Invalid(String),
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Say(line.to_string()));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    let command = match name.to_ascii_lowercase().as_str() {
        "start" => Command::Intent(UserIntent::StartConversation),
        "listen" => Command::Intent(UserIntent::ListenOnce),
        "stop" => Command::Intent(UserIntent::StopConversation),
        "clear" => Command::Intent(UserIntent::ClearHistory),
        "model" if !arg.is_empty() => Command::Intent(UserIntent::SwitchModel(arg.to_string())),
        "rate" => number(arg, "rate", VoiceChange::Rate),
        "pitch" => number(arg, "pitch", VoiceChange::Pitch),
        "volume" => number(arg, "volume", VoiceChange::Volume),
        "voice" if arg.eq_ignore_ascii_case("default") => {
            Command::Voice(VoiceChange::VoiceId(None))
        }
        "voice" if !arg.is_empty() => Command::Voice(VoiceChange::VoiceId(Some(arg.to_string()))),
        "lang" if !arg.is_empty() => Command::Voice(VoiceChange::Language(arg.to_string())),
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Invalid(format!("unknown or incomplete command: {}", line)),
    };
    Some(command)
}

fn number(arg: &str, name: &str, make: fn(f32) -> VoiceChange) -> Command {
    match arg.parse::<f32>() {
        Ok(v) if v.is_finite() => Command::Voice(make(v)),
        _ => Command::Invalid(format!("/{} needs a number", name)),
    }
}
