//! Bounded conversation memory with LLM-assisted summarization

use crate::config::ConversationConfig;
use crate::error::Result;
use crate::llm::{system_message, user_message, ChatMessage, LlmClient, Role};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const FALLBACK_SNIPPET_CHARS: usize = 40;

/// A message retained in conversation state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Rolling summary of messages no longer retained verbatim
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub content: String,
    pub topics: Vec<String>,
    pub key_questions: Vec<String>,
    pub decisions: Vec<String>,
    pub message_count_summarized: usize,
}

/// State for one conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub conversation_id: String,
    pub messages: Vec<StoredMessage>,
    pub summary: Option<ConversationSummary>,
    pub tokens_estimate: usize,
}

impl ConversationState {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            messages: Vec::new(),
            summary: None,
            tokens_estimate: 0,
        }
    }
}

/// Opaque KV persistence for conversation state
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>>;
    async fn save(&self, state: &ConversationState) -> Result<()>;
}

/// In-process conversation store
#[derive(Default)]
pub struct InMemoryConversationStore {
    states: RwLock<HashMap<String, ConversationState>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>> {
        Ok(self.states.read().await.get(conversation_id).cloned())
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        self.states
            .write()
            .await
            .insert(state.conversation_id.clone(), state.clone());
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SummaryPayload {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    topics_covered: Vec<String>,
    #[serde(default)]
    key_questions: Vec<String>,
    #[serde(default)]
    important_decisions: Vec<String>,
}

/// Conversation memory operations over a store
pub struct ConversationMemory {
    store: std::sync::Arc<dyn ConversationStore>,
    config: ConversationConfig,
}

impl ConversationMemory {
    pub fn new(store: std::sync::Arc<dyn ConversationStore>, config: ConversationConfig) -> Self {
        Self { store, config }
    }

    pub async fn load_or_create(&self, conversation_id: &str) -> Result<ConversationState> {
        Ok(self
            .store
            .load(conversation_id)
            .await?
            .unwrap_or_else(|| ConversationState::new(conversation_id)))
    }

    pub async fn persist(&self, state: &ConversationState) -> Result<()> {
        self.store.save(state).await
    }

    /// Append a message and fold history when it exceeds bounds.
    ///
    /// Summarization failures never fail the append; a deterministic
    /// fallback summary stands in.
    pub async fn append(
        &self,
        state: &mut ConversationState,
        role: Role,
        content: impl Into<String>,
        llm: &dyn LlmClient,
    ) {
        let content = content.into();
        state.tokens_estimate += estimate_tokens(&content);
        state.messages.push(StoredMessage {
            role,
            content,
            timestamp: Utc::now(),
        });

        self.maybe_summarize(state, llm).await;
    }

    /// Messages for prompt assembly: the summary (if any) as a leading
    /// system message, then the retained messages.
    pub fn snapshot(&self, state: &ConversationState) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(state.messages.len() + 1);

        if let Some(summary) = &state.summary {
            messages.push(system_message(render_summary(summary)));
        }

        messages.extend(state.messages.iter().map(|message| ChatMessage {
            role: message.role,
            content: message.content.clone(),
        }));

        messages
    }

    async fn maybe_summarize(&self, state: &mut ConversationState, llm: &dyn LlmClient) {
        let mut drain = state
            .messages
            .len()
            .saturating_sub(self.config.max_messages);

        // The token bound can force draining further.
        while drain < state.messages.len().saturating_sub(1)
            && tokens_of(&state.messages[drain..]) > self.config.max_history_tokens
        {
            drain += 1;
        }

        if drain == 0 {
            return;
        }

        let drained: Vec<StoredMessage> = state.messages.drain(..drain).collect();
        debug!(
            "Summarizing {} messages of conversation {}",
            drained.len(),
            state.conversation_id
        );

        let previous = state.summary.take();
        let summarized_before = previous
            .as_ref()
            .map(|s| s.message_count_summarized)
            .unwrap_or(0);

        let summary = if self.config.summarization_enabled {
            match self.summarize_with_retries(&drained, previous.as_ref(), llm).await {
                Some(summary) => summary,
                None => fallback_summary(&drained),
            }
        } else {
            fallback_summary(&drained)
        };

        state.summary = Some(ConversationSummary {
            message_count_summarized: summarized_before + drained.len(),
            ..summary
        });
        state.tokens_estimate = tokens_of(&state.messages);
    }

    async fn summarize_with_retries(
        &self,
        drained: &[StoredMessage],
        previous: Option<&ConversationSummary>,
        llm: &dyn LlmClient,
    ) -> Option<ConversationSummary> {
        let prompt = summarizer_prompt(drained, previous);

        for attempt in 0..=self.config.max_summarization_retries {
            match llm.complete(&prompt).await {
                Ok(response) => match parse_summary(&response.text) {
                    Some(summary) => return Some(summary),
                    None => warn!("Summarizer returned unparseable JSON, retrying"),
                },
                Err(err) => {
                    warn!("Summarization attempt {} failed: {}", attempt + 1, err);
                }
            }

            if attempt < self.config.max_summarization_retries {
                tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt))).await;
            }
        }

        None
    }
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4 + 1
}

fn tokens_of(messages: &[StoredMessage]) -> usize {
    messages
        .iter()
        .map(|message| estimate_tokens(&message.content))
        .sum()
}

fn render_summary(summary: &ConversationSummary) -> String {
    let mut text = format!("Conversation summary: {}", summary.content);
    if !summary.topics.is_empty() {
        text.push_str(&format!("\nTopics: {}", summary.topics.join(", ")));
    }
    if !summary.key_questions.is_empty() {
        text.push_str(&format!("\nOpen questions: {}", summary.key_questions.join("; ")));
    }
    if !summary.decisions.is_empty() {
        text.push_str(&format!("\nDecisions: {}", summary.decisions.join("; ")));
    }
    text
}

fn summarizer_prompt(
    drained: &[StoredMessage],
    previous: Option<&ConversationSummary>,
) -> Vec<ChatMessage> {
    let mut transcript = String::new();
    if let Some(previous) = previous {
        transcript.push_str(&format!("Earlier summary: {}\n\n", previous.content));
    }
    for message in drained {
        transcript.push_str(&format!("{}: {}\n", message.role, message.content));
    }

    vec![
        system_message(
            "Summarize the conversation below. Respond with a single JSON object \
             with fields: summary (string), topics_covered (array of strings), \
             key_questions (array of strings), important_decisions (array of strings). \
             Respond with JSON only.",
        ),
        user_message(transcript),
    ]
}

fn parse_summary(text: &str) -> Option<ConversationSummary> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    let payload: SummaryPayload = serde_json::from_str(&text[start..=end]).ok()?;

    if payload.summary.is_empty() {
        return None;
    }

    Some(ConversationSummary {
        content: payload.summary,
        topics: payload.topics_covered,
        key_questions: payload.key_questions,
        decisions: payload.important_decisions,
        message_count_summarized: 0,
    })
}

/// Deterministic summary used when the LLM is unavailable or disabled
fn fallback_summary(drained: &[StoredMessage]) -> ConversationSummary {
    let snippets: Vec<String> = drained
        .iter()
        .filter(|message| message.role == Role::User)
        .map(|message| {
            let snippet: String = message.content.chars().take(FALLBACK_SNIPPET_CHARS).collect();
            snippet.trim().to_string()
        })
        .filter(|snippet| !snippet.is_empty())
        .collect();

    ConversationSummary {
        content: format!("User discussed: {}", snippets.join(", ")),
        topics: vec![],
        key_questions: vec![],
        decisions: vec![],
        message_count_summarized: 0,
    }
}
