//! Memory manager: keeps the prompt bounded with a rolling summary.
//!
//! The durable log in the chat store is never rewritten. The manager keeps a
//! watermark of how many log entries are already folded into the summary; the
//! part after the watermark is the *window*. When the window reaches the trigger
//! count, everything but the `keep_recent_count` newest entries is summarized and
//! the watermark moves forward.
//!
//! Compaction runs in three steps so the long part can live in a spawned task:
//! [`MemoryManager::plan`] (sync, owns its data), [`CompactionPlan::run`] (async,
//! talks to the engine) and [`MemoryManager::apply`].

use crate::config::MemoryPolicy;
use crate::engine::{generate_with_recovery, DegradedRetry, GenerationOptions, LanguageModel, PromptRequest};
use crate::message::{render_transcript, ConversationMessage};
use crate::prompts::{
    compose_rolling_summary, SUMMARY_CONTEXT_PREFIX, SUMMARY_MINIMAL_PROMPT, SUMMARY_SYSTEM_PROMPT,
};
use tracing::{debug, info, warn};

/// Generation settings for summarization rounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummarySettings {
    pub options: GenerationOptions,
    pub retry: DegradedRetry,
}

/// Work needed before the next request can be built.
#[derive(Debug, Clone, PartialEq)]
pub enum CompactionPlan {
    /// Window is below the trigger (or auto-summary is off).
    Skip,
    Summarize {
        /// Watermark the plan was made against; stale plans are ignored by `apply`.
        base: usize,
        /// Watermark after this round succeeds.
        fold_to: usize,
        previous: Option<String>,
        primary: PromptRequest,
        fallback: PromptRequest,
    },
}

/// Result of running a plan.
#[derive(Debug, Clone, PartialEq)]
pub enum Compaction {
    Unchanged,
    Summarized {
        base: usize,
        fold_to: usize,
        summary: String,
    },
    Failed {
        reason: String,
    },
}

impl CompactionPlan {
    pub fn is_skip(&self) -> bool {
        matches!(self, CompactionPlan::Skip)
    }

    /// Ask the engine for the summary. Best effort: failure leaves memory unchanged.
    pub async fn run(self, engine: &dyn LanguageModel) -> Compaction {
        match self {
            CompactionPlan::Skip => Compaction::Unchanged,
            CompactionPlan::Summarize {
                base,
                fold_to,
                previous,
                primary,
                fallback,
            } => match generate_with_recovery(engine, &primary, &fallback).await {
                Ok(latest) => Compaction::Summarized {
                    base,
                    fold_to,
                    summary: compose_rolling_summary(previous.as_deref(), &latest),
                },
                Err(e) => {
                    warn!(kind = e.kind(), "summarization failed, keeping full window: {}", e);
                    Compaction::Failed {
                        reason: e.to_string(),
                    }
                }
            },
        }
    }
}

/// Rolling-summary state for one conversation.
#[derive(Debug, Clone)]
pub struct MemoryManager {
    policy: MemoryPolicy,
    summary: Option<String>,
    folded: usize,
    rounds: usize,
}

impl MemoryManager {
    pub fn new(policy: MemoryPolicy) -> Self {
        Self {
            policy,
            summary: None,
            folded: 0,
            rounds: 0,
        }
    }

    pub fn policy(&self) -> &MemoryPolicy {
        &self.policy
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    /// Number of durable log entries already represented by the summary.
    pub fn folded(&self) -> usize {
        self.folded
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Forget the summary (conversation cleared).
    pub fn reset(&mut self) {
        self.summary = None;
        self.folded = 0;
        self.rounds = 0;
    }

    fn window<'a>(&self, log: &'a [ConversationMessage]) -> &'a [ConversationMessage] {
        &log[self.folded.min(log.len())..]
    }

    /// Decide whether the window needs summarizing.
    pub fn plan(&self, log: &[ConversationMessage], settings: &SummarySettings) -> CompactionPlan {
        let window = self.window(log);
        if !self.policy.auto_summary_enabled || window.len() < self.policy.summary_trigger_count {
            return CompactionPlan::Skip;
        }
        let split = window.len().saturating_sub(self.policy.keep_recent_count);
        let older = &window[..split];
        if older.is_empty() {
            return CompactionPlan::Skip;
        }
        debug!(
            window = window.len(),
            older = older.len(),
            keep = self.policy.keep_recent_count,
            "planning summarization round"
        );

        let primary = PromptRequest {
            instruction: Some(SUMMARY_SYSTEM_PROMPT.to_string()),
            context: None,
            history: vec![ConversationMessage::user(render_transcript(older))],
            options: settings.options,
        };
        let fallback = PromptRequest {
            instruction: Some(SUMMARY_MINIMAL_PROMPT.to_string()),
            context: None,
            history: vec![ConversationMessage::user(render_transcript(
                &settings.retry.truncate(older),
            ))],
            options: settings.retry.options(&settings.options),
        };
        let base = self.folded.min(log.len());
        CompactionPlan::Summarize {
            base,
            fold_to: base + split,
            previous: self.summary.clone(),
            primary,
            fallback,
        }
    }

    /// Store the outcome of a plan. Outcomes computed against an older watermark are dropped.
    pub fn apply(&mut self, outcome: Compaction) -> bool {
        match outcome {
            Compaction::Summarized {
                base,
                fold_to,
                summary,
            } if base == self.folded => {
                self.summary = Some(summary);
                self.folded = fold_to;
                self.rounds += 1;
                info!(rounds = self.rounds, folded = self.folded, "rolling summary updated");
                true
            }
            Compaction::Summarized { base, .. } => {
                debug!(base, folded = self.folded, "ignoring stale summary");
                false
            }
            Compaction::Unchanged | Compaction::Failed { .. } => false,
        }
    }

    /// The history that goes into the next request: the unfolded window, hard-capped
    /// at `max_messages`.
    pub fn effective_history(&self, log: &[ConversationMessage]) -> Vec<ConversationMessage> {
        let window = self.window(log);
        let start = window.len().saturating_sub(self.policy.max_messages);
        window[start..].to_vec()
    }

    /// Build the reply request: instruction, rolling summary as a system message,
    /// then the effective history.
    pub fn build_request(
        &self,
        log: &[ConversationMessage],
        instruction: Option<String>,
        options: GenerationOptions,
    ) -> PromptRequest {
        PromptRequest {
            instruction,
            context: self
                .summary
                .as_ref()
                .map(|s| format!("{}{}", SUMMARY_CONTEXT_PREFIX, s)),
            history: self.effective_history(log),
            options,
        }
    }
}
