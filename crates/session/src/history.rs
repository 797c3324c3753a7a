//! Conversation context — ordered history with budgeted summarization.
//!
//! The transcript owns a session's message sequence and a running summary.
//! When the size estimate exceeds the configured budget, the oldest
//! contiguous block of non-system messages is replaced with a single
//! system-authored summary produced by the model; the most recent N
//! messages are always preserved verbatim. If the summarizer fails, the
//! block is hard-truncated instead so the turn is never blocked.

use chrono::{DateTime, Utc};
use scuttle_core::error::{ContextError, ProviderError};
use scuttle_core::message::{Message, MessageContent, Role};
use scuttle_core::provider::{CompletionRequest, Provider};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Tuning for one session's transcript.
#[derive(Debug, Clone)]
pub struct TranscriptConfig {
    /// Estimated-token budget before compaction triggers
    pub token_budget: usize,

    /// Most recent messages always preserved verbatim
    pub keep_recent: usize,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            token_budget: 6000,
            keep_recent: 4,
        }
    }
}

/// What a compaction pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compaction {
    /// Budget not exceeded, or nothing old enough to fold
    NotNeeded,
    /// The oldest block was replaced with a model-written summary
    Summarized { before: usize, after: usize },
    /// Summarization failed; the oldest block was dropped instead
    Truncated { before: usize, after: usize },
}

/// Serializable snapshot for persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptSnapshot {
    pub messages: Vec<Message>,
    pub summary: Option<String>,
    pub total_appended: u64,
}

/// A session's ordered message history.
pub struct Transcript {
    config: TranscriptConfig,
    messages: Vec<Message>,
    /// Accumulated summaries of folded-away history
    summary: Option<String>,
    /// Messages ever appended, including ones since summarized away
    total_appended: u64,
    last_activity: DateTime<Utc>,
}

impl Transcript {
    pub fn new(config: TranscriptConfig) -> Self {
        Self {
            config,
            messages: Vec::new(),
            summary: None,
            total_appended: 0,
            last_activity: Utc::now(),
        }
    }

    /// Append a message. Fails only on a structurally malformed message.
    pub fn append(&mut self, message: Message) -> Result<(), ContextError> {
        message
            .validate()
            .map_err(ContextError::MalformedMessage)?;
        self.messages.push(message);
        self.total_appended += 1;
        self.last_activity = Utc::now();
        Ok(())
    }

    /// The ordered history, for prompt construction.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Install or refresh the leading system prompt.
    ///
    /// The orchestration loop rebuilds this each turn (base instructions
    /// plus the current scratch-pad digest), so it replaces rather than
    /// appends.
    pub fn set_system_prompt(&mut self, content: impl Into<MessageContent>) {
        let message = Message::system(content.into());
        match self.messages.first() {
            Some(first) if first.role == Role::System => {
                self.messages[0] = message;
            }
            _ => self.messages.insert(0, message),
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// Rough token estimate: 4 chars ≈ 1 token, tool-call payloads included.
    pub fn estimated_tokens(&self) -> usize {
        self.messages
            .iter()
            .map(|m| {
                let args: usize = m.tool_calls.iter().map(|tc| tc.arguments.len()).sum();
                (m.content.char_len() + args) / 4
            })
            .sum()
    }

    /// Case-insensitive search over message text, oldest match first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<&Message> {
        let needle = query.to_lowercase();
        self.messages
            .iter()
            .filter(|m| m.content.flat_text().to_lowercase().contains(&needle))
            .take(limit)
            .collect()
    }

    /// Drop all messages; the accumulated summary survives unless asked not to.
    pub fn clear(&mut self, keep_summary: bool) {
        self.messages.clear();
        if !keep_summary {
            self.summary = None;
        }
        self.last_activity = Utc::now();
    }

    /// The oldest contiguous block of non-system messages that can be folded:
    /// `[start, end)` with the most recent `keep_recent` excluded, and the
    /// boundary nudged so a tool result is never cut away from its call.
    fn foldable_block(&self) -> Option<(usize, usize)> {
        let start = self.messages.iter().position(|m| m.role != Role::System)?;
        let mut end = self.messages.len().saturating_sub(self.config.keep_recent);
        while end > start && self.messages[end].role == Role::Tool {
            end -= 1;
        }
        // Replacing fewer than two messages with one summary can't shrink
        (end.saturating_sub(start) >= 2).then_some((start, end))
    }

    pub fn over_budget(&self) -> bool {
        self.estimated_tokens() > self.config.token_budget
    }

    /// Compact the history if the budget is exceeded.
    ///
    /// Called synchronously before each completion request, never
    /// mid-stream. This is the only point where history may shrink.
    pub async fn compact_if_needed(
        &mut self,
        provider: &dyn Provider,
        model: &str,
    ) -> Compaction {
        if !self.over_budget() {
            return Compaction::NotNeeded;
        }
        let Some((start, end)) = self.foldable_block() else {
            debug!("Over budget but nothing old enough to fold");
            return Compaction::NotNeeded;
        };

        let before = self.messages.len();
        match self.summarize_block(provider, model, start, end).await {
            Ok(summary_text) => {
                self.summary = Some(match self.summary.take() {
                    Some(existing) => format!("{existing}\n\n{summary_text}"),
                    None => summary_text.clone(),
                });
                let summary_msg =
                    Message::system(format!("Conversation summary:\n{summary_text}"));
                self.messages.splice(start..end, std::iter::once(summary_msg));
                let after = self.messages.len();
                info!(before, after, "Compacted history via summarization");
                Compaction::Summarized { before, after }
            }
            Err(e) => {
                warn!(error = %e, "Summarization failed, hard-truncating oldest block");
                self.messages.drain(start..end);
                let after = self.messages.len();
                Compaction::Truncated { before, after }
            }
        }
    }

    async fn summarize_block(
        &self,
        provider: &dyn Provider,
        model: &str,
        start: usize,
        end: usize,
    ) -> Result<String, ProviderError> {
        let rendered: String = self.messages[start..end]
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                let calls = if m.tool_calls.is_empty() {
                    String::new()
                } else {
                    let names: Vec<&str> =
                        m.tool_calls.iter().map(|tc| tc.name.as_str()).collect();
                    format!(" [called: {}]", names.join(", "))
                };
                format!("{role}: {}{calls}", m.content.flat_text())
            })
            .collect::<Vec<_>>()
            .join("\n");

        let request = CompletionRequest {
            model: model.to_string(),
            messages: vec![
                Message::system(SUMMARIZE_PROMPT),
                Message::user(rendered),
            ],
            temperature: 0.2,
            max_tokens: Some(512),
            tools: vec![],
            stream: false,
        };

        let completion = provider.complete(request).await?;
        Ok(completion.message.content.flat_text())
    }

    pub fn snapshot(&self) -> TranscriptSnapshot {
        TranscriptSnapshot {
            messages: self.messages.clone(),
            summary: self.summary.clone(),
            total_appended: self.total_appended,
        }
    }

    pub fn restore(&mut self, snapshot: TranscriptSnapshot) {
        self.messages = snapshot.messages;
        self.summary = snapshot.summary;
        self.total_appended = snapshot.total_appended;
        self.last_activity = Utc::now();
    }
}

/// Instructions for the summarizer round.
const SUMMARIZE_PROMPT: &str = "\
Summarize the following conversation history. Extract and keep:
1. The user's core intent, under an 'Intent' heading.
2. Every key parameter, name, key, or file mentioned, one per line under 'Key facts'.
3. Important actions, decisions, and changes under 'Highlights'.
4. Outstanding work under 'Next steps'.
Be accurate and compact; the summary replaces the original messages.";

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use scuttle_core::provider::{Completion, FinishReason};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A summarizer that returns a fixed summary, or always fails.
    struct StubSummarizer {
        fail: bool,
        calls: AtomicUsize,
    }

    impl StubSummarizer {
        fn ok() -> Self {
            Self {
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
        fn failing() -> Self {
            Self {
                fail: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Provider for StubSummarizer {
        fn name(&self) -> &str {
            "stub"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<Completion, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Network("summarizer down".into()));
            }
            Ok(Completion {
                message: Message::assistant("Intent: testing.\nKey facts: none."),
                finish_reason: FinishReason::Stop,
                usage: None,
                model: "stub".into(),
            })
        }
    }

    fn small_config() -> TranscriptConfig {
        TranscriptConfig {
            token_budget: 20,
            keep_recent: 2,
        }
    }

    fn filled_transcript() -> Transcript {
        let mut t = Transcript::new(small_config());
        t.append(Message::system("You are a helpful assistant."))
            .unwrap();
        for i in 0..6 {
            t.append(Message::user(format!("user message number {i} with some padding text")))
                .unwrap();
            t.append(Message::assistant(format!(
                "assistant reply number {i} with some padding text"
            )))
            .unwrap();
        }
        t
    }

    #[test]
    fn append_rejects_malformed() {
        let mut t = Transcript::new(TranscriptConfig::default());
        let err = t.append(Message::user("")).unwrap_err();
        assert!(matches!(err, ContextError::MalformedMessage(_)));
        assert_eq!(t.message_count(), 0);
    }

    #[test]
    fn ordering_is_append_only() {
        let mut t = Transcript::new(TranscriptConfig::default());
        t.append(Message::user("one")).unwrap();
        t.append(Message::assistant("two")).unwrap();
        t.append(Message::user("three")).unwrap();
        let texts: Vec<String> = t
            .messages()
            .iter()
            .map(|m| m.content.flat_text())
            .collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[test]
    fn token_estimate_counts_chars() {
        let mut t = Transcript::new(TranscriptConfig::default());
        // 20 chars ≈ 5 tokens
        t.append(Message::user("12345678901234567890")).unwrap();
        assert_eq!(t.estimated_tokens(), 5);
    }

    #[tokio::test]
    async fn compaction_preserves_recent_messages_verbatim() {
        let mut t = filled_transcript();
        let tail_before: Vec<String> = t.messages()[t.message_count() - 2..]
            .iter()
            .map(|m| m.content.flat_text())
            .collect();

        let provider = StubSummarizer::ok();
        let outcome = t.compact_if_needed(&provider, "stub").await;
        assert!(matches!(outcome, Compaction::Summarized { .. }));

        let tail_after: Vec<String> = t.messages()[t.message_count() - 2..]
            .iter()
            .map(|m| m.content.flat_text())
            .collect();
        assert_eq!(tail_before, tail_after);
    }

    #[tokio::test]
    async fn compaction_strictly_shrinks_history() {
        let mut t = filled_transcript();
        let before = t.message_count();

        let provider = StubSummarizer::ok();
        t.compact_if_needed(&provider, "stub").await;
        assert!(t.message_count() < before);
    }

    #[tokio::test]
    async fn compaction_is_a_prefix_replacement() {
        let mut t = filled_transcript();
        let provider = StubSummarizer::ok();
        t.compact_if_needed(&provider, "stub").await;

        // Leading system prompt intact, then exactly one summary message.
        assert_eq!(t.messages()[0].content.flat_text(), "You are a helpful assistant.");
        assert_eq!(t.messages()[1].role, Role::System);
        assert!(t.messages()[1].content.flat_text().contains("Conversation summary"));
        // Everything after is the preserved tail, in original order.
        for m in &t.messages()[2..] {
            assert_ne!(m.role, Role::System);
        }
        assert!(t.summary().unwrap().contains("Intent"));
    }

    #[tokio::test]
    async fn summarizer_failure_falls_back_to_truncation() {
        let mut t = filled_transcript();
        let before = t.message_count();

        let provider = StubSummarizer::failing();
        let outcome = t.compact_if_needed(&provider, "stub").await;
        assert!(matches!(outcome, Compaction::Truncated { .. }));
        assert!(t.message_count() < before);
        // Tail survives even on the fallback path.
        assert!(
            t.messages()
                .last()
                .unwrap()
                .content
                .flat_text()
                .contains("reply number 5")
        );
    }

    #[tokio::test]
    async fn under_budget_is_a_noop() {
        let mut t = Transcript::new(TranscriptConfig {
            token_budget: 100_000,
            keep_recent: 2,
        });
        t.append(Message::user("short")).unwrap();

        let provider = StubSummarizer::ok();
        let outcome = t.compact_if_needed(&provider, "stub").await;
        assert_eq!(outcome, Compaction::NotNeeded);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn repeated_compaction_accumulates_summaries() {
        let mut t = filled_transcript();
        let provider = StubSummarizer::ok();
        t.compact_if_needed(&provider, "stub").await;
        let first = t.summary().unwrap().to_string();

        for i in 0..6 {
            t.append(Message::user(format!("another round {i} of padding text here")))
                .unwrap();
        }
        t.compact_if_needed(&provider, "stub").await;
        let second = t.summary().unwrap();
        assert!(second.len() > first.len());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn tool_results_are_not_orphaned_by_the_boundary() {
        let mut t = Transcript::new(TranscriptConfig {
            token_budget: 10,
            keep_recent: 1,
        });
        t.append(Message::user("please compute something for me with the tool"))
            .unwrap();
        t.append(Message::assistant_tool_calls(
            "",
            vec![scuttle_core::message::MessageToolCall {
                id: "call_1".into(),
                name: "echo".into(),
                arguments: "{}".into(),
            }],
        ))
        .unwrap();
        t.append(Message::tool_result("call_1", "tool output goes here"))
            .unwrap();
        t.append(Message::assistant("final answer after the tool round"))
            .unwrap();

        let provider = StubSummarizer::ok();
        t.compact_if_needed(&provider, "stub").await;

        // No tool message may appear without its assistant call before it.
        for (i, m) in t.messages().iter().enumerate() {
            if m.role == Role::Tool {
                let call_id = m.tool_call_id.as_deref().unwrap();
                let has_call = t.messages()[..i]
                    .iter()
                    .any(|prev| prev.tool_calls.iter().any(|tc| tc.id == call_id));
                assert!(has_call, "orphaned tool result at index {i}");
            }
        }
    }

    #[test]
    fn search_matches_case_insensitively() {
        let mut t = Transcript::new(TranscriptConfig::default());
        t.append(Message::user("Design a Spur Gear")).unwrap();
        t.append(Message::assistant("done")).unwrap();

        let hits = t.search("spur gear", 10);
        assert_eq!(hits.len(), 1);
        assert!(t.search("bevel", 10).is_empty());
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let mut t = Transcript::new(TranscriptConfig::default());
        t.append(Message::user("persist me")).unwrap();
        let snapshot = t.snapshot();

        let mut restored = Transcript::new(TranscriptConfig::default());
        restored.restore(snapshot);
        assert_eq!(restored.message_count(), 1);
        assert_eq!(restored.messages()[0].content.flat_text(), "persist me");
    }

    #[test]
    fn clear_keeps_summary_when_asked() {
        let mut t = Transcript::new(TranscriptConfig::default());
        t.append(Message::user("hello")).unwrap();
        t.summary = Some("things happened".into());

        t.clear(true);
        assert_eq!(t.message_count(), 0);
        assert_eq!(t.summary(), Some("things happened"));

        t.clear(false);
        assert!(t.summary().is_none());
    }
}
