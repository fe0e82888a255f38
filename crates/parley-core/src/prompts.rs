//! Fixed prompts used by the assistant and the memory manager.

/// Default persona for spoken replies. Kept short: small local models follow
/// short instructions better, and replies are read aloud.
pub const ASSISTANT_SYSTEM_PROMPT: &str = "You are a friendly voice assistant running \
entirely on the user's device. Answer conversationally in one to three short sentences. \
Do not use markdown, lists, code blocks or emoji; your reply will be spoken aloud.";

/// Instruction for folding older turns into the rolling summary.
pub const SUMMARY_SYSTEM_PROMPT: &str = "You summarize conversations. Write a concise summary \
of the conversation below, keeping names, facts, decisions and open questions the assistant \
will need later. Write plain prose, under 200 words.";

/// Minimal instruction for the degraded summarization retry.
pub const SUMMARY_MINIMAL_PROMPT: &str = "Summarize briefly.";

/// Minimal instruction for the degraded reply retry.
pub const REPLY_MINIMAL_PROMPT: &str = "Reply briefly.";

/// Prefix for the rolling summary when it is injected into a request.
pub const SUMMARY_CONTEXT_PREFIX: &str = "Summary of the earlier conversation: ";

/// Compose a new rolling summary from the previous one (if any) and the latest round.
pub fn compose_rolling_summary(previous: Option<&str>, latest: &str) -> String {
    match previous {
        Some(prev) if !prev.trim().is_empty() => {
            format!("Previous context: {}\n\nRecent summary: {}", prev, latest)
        }
        _ => latest.to_string(),
    }
}

/// Assistant-role message recorded when a reply could not be produced.
pub fn reply_failure_message(kind: &str) -> String {
    match kind {
        "timeout" => "Sorry, I took too long to think about that. Please try again.".to_string(),
        "unsupported-device" | "load-failed" => {
            "AI responses are unavailable on this device. Voice input still works.".to_string()
        }
        _ => "Sorry, something went wrong while generating a reply. Please try again.".to_string(),
    }
}
