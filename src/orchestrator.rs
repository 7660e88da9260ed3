//! Answer orchestration: prompt assembly, LLM calls, source post-processing

use crate::conversation::{ConversationMemory, ConversationState};
use crate::error::Result;
use crate::llm::{system_message, user_message, ChatMessage, LlmClient, Role};
use crate::registry::UrlValidator;
use crate::retrieval::{Citation, RetrievalService, RetrievedContext};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fixed identity and scope for the assistant
pub const DEFAULT_SYSTEM_TEMPLATE: &str = "\
You are a developer documentation assistant for the platform's engineering \
organization. Answer questions about the platform's components, deployment, \
and APIs.

Rules:
- Base every factual claim only on the provided context. If the context does \
not cover the question, say so instead of guessing.
- When referencing repositories, use only the canonical repository URLs \
listed below.
- If a question is outside the platform's scope, reply exactly: \"I can only \
help with questions about this platform's documentation. Please ask about \
its components, deployment, or APIs.\"";

/// A completed answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub conversation_id: String,
    pub answer: String,
    pub citations: Vec<Citation>,
}

/// Frames emitted on the streaming path
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamFrame {
    Delta {
        delta_text: String,
    },
    Final {
        conversation_id: String,
        citations: Vec<Citation>,
    },
    Error {
        error: String,
        code: String,
    },
}

/// Pure prompt assembly from its inputs
pub fn build_prompt(
    system_template: &str,
    registry_snapshot: &str,
    history: &[ChatMessage],
    context: &str,
    question: &str,
) -> Vec<ChatMessage> {
    let mut system = system_template.to_string();
    if !registry_snapshot.is_empty() {
        system.push_str("\n\nKnown repositories:\n");
        system.push_str(registry_snapshot);
    }

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(system_message(system));
    messages.extend_from_slice(history);

    let combined = if context.is_empty() {
        format!("Question: {question}")
    } else {
        format!("Context:\n{context}\n\nQuestion: {question}")
    };
    messages.push(user_message(combined));

    messages
}

/// Coordinates retrieval, memory, the LLM, and URL post-processing
pub struct AnswerOrchestrator {
    llm: Arc<dyn LlmClient>,
    retrieval: Arc<RetrievalService>,
    memory: Arc<ConversationMemory>,
    validator: Arc<UrlValidator>,
    system_template: String,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AnswerOrchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        retrieval: Arc<RetrievalService>,
        memory: Arc<ConversationMemory>,
        validator: Arc<UrlValidator>,
    ) -> Self {
        Self {
            llm,
            retrieval,
            memory,
            validator,
            system_template: DEFAULT_SYSTEM_TEMPLATE.to_string(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_system_template(mut self, template: impl Into<String>) -> Self {
        self.system_template = template.into();
        self
    }

    /// Serialize asks per conversation; concurrent requests queue here.
    async fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Shared front half of both ask paths: append the user message, fetch
    /// context, and assemble the prompt.
    async fn prepare(
        &self,
        conversation_id: &str,
        question: &str,
        top_k: Option<usize>,
    ) -> Result<(ConversationState, RetrievedContext, Vec<ChatMessage>)> {
        let mut state = self.memory.load_or_create(conversation_id).await?;
        self.memory
            .append(&mut state, Role::User, question, self.llm.as_ref())
            .await;
        // The user message survives even if the answer never completes.
        self.memory.persist(&state).await?;

        let retrieved = self.retrieval.retrieve(question, top_k, None).await?;
        debug!(
            "Retrieved {} citations for conversation {}",
            retrieved.citations.len(),
            conversation_id
        );

        let mut history = self.memory.snapshot(&state);
        // The question reappears combined with context as the final message.
        history.pop();

        let prompt = build_prompt(
            &self.system_template,
            &self.validator.registry().snapshot(),
            &history,
            &retrieved.context,
            question,
        );

        Ok((state, retrieved, prompt))
    }

    async fn finish(
        &self,
        mut state: ConversationState,
        raw_answer: &str,
        citations: Vec<Citation>,
    ) -> Result<Answer> {
        let rewritten = self.validator.rewrite_text(raw_answer).await;

        let conversation_id = state.conversation_id.clone();
        self.memory
            .append(&mut state, Role::Assistant, rewritten.clone(), self.llm.as_ref())
            .await;
        self.memory.persist(&state).await?;

        Ok(Answer {
            conversation_id,
            answer: rewritten,
            citations,
        })
    }

    /// Answer synchronously
    pub async fn ask(
        &self,
        conversation_id: Option<String>,
        question: &str,
        top_k: Option<usize>,
    ) -> Result<Answer> {
        let conversation_id =
            conversation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let lock = self.conversation_lock(&conversation_id).await;
        let _guard = lock.lock().await;

        info!("Answering in conversation {}", conversation_id);
        let (state, retrieved, prompt) =
            self.prepare(&conversation_id, question, top_k).await?;

        let completion = self.llm.complete(&prompt).await?;

        self.finish(state, &completion.text, retrieved.citations).await
    }

    /// Answer as a stream of frames over a bounded channel.
    ///
    /// The channel holds one frame: a slow consumer backpressures the
    /// producer naturally. A dropped receiver aborts the LLM call and the
    /// partial assistant message is discarded; the user message is kept.
    pub fn ask_stream(
        self: &Arc<Self>,
        conversation_id: Option<String>,
        question: String,
        top_k: Option<usize>,
    ) -> flume::Receiver<StreamFrame> {
        let (tx, rx) = flume::bounded(1);
        let orchestrator = self.clone();
        let conversation_id =
            conversation_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        tokio::spawn(async move {
            let lock = orchestrator.conversation_lock(&conversation_id).await;
            let _guard = lock.lock().await;

            let (state, retrieved, prompt) = match orchestrator
                .prepare(&conversation_id, &question, top_k)
                .await
            {
                Ok(prepared) => prepared,
                Err(err) => {
                    let _ = tx
                        .send_async(StreamFrame::Error {
                            error: err.user_message().to_string(),
                            code: err.category().to_string(),
                        })
                        .await;
                    return;
                }
            };

            let mut stream = match orchestrator.llm.complete_stream(&prompt).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("Stream open failed: {}", err);
                    let _ = tx
                        .send_async(StreamFrame::Error {
                            error: err.user_message().to_string(),
                            code: err.category().to_string(),
                        })
                        .await;
                    return;
                }
            };

            let mut accumulated = String::new();
            while let Some(token) = stream.next().await {
                match token {
                    Ok(delta_text) => {
                        accumulated.push_str(&delta_text);
                        if tx
                            .send_async(StreamFrame::Delta { delta_text })
                            .await
                            .is_err()
                        {
                            // Client went away: abort the LLM stream and do
                            // not persist the partial assistant message.
                            info!(
                                "Client disconnected from conversation {}",
                                conversation_id
                            );
                            return;
                        }
                    }
                    Err(err) => {
                        warn!("Stream failed mid-answer: {}", err);
                        let _ = tx
                            .send_async(StreamFrame::Error {
                                error: err.user_message().to_string(),
                                code: err.category().to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
            drop(stream);

            match orchestrator
                .finish(state, &accumulated, retrieved.citations)
                .await
            {
                Ok(answer) => {
                    let _ = tx
                        .send_async(StreamFrame::Final {
                            conversation_id: answer.conversation_id,
                            citations: answer.citations,
                        })
                        .await;
                }
                Err(err) => {
                    let _ = tx
                        .send_async(StreamFrame::Error {
                            error: err.user_message().to_string(),
                            code: err.category().to_string(),
                        })
                        .await;
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConversationConfig, RegistryConfig, RetrievalConfig};
    use crate::conversation::InMemoryConversationStore;
    use crate::embedding::Embedder;
    use crate::error::{LlmError, Result};
    use crate::llm::{CompletionResponse, TokenStream};
    use crate::store::{MetadataFilter, QueryMatch, VectorRecord, VectorStore};
    use async_trait::async_trait;

    struct EchoLlm {
        text: String,
    }

    #[async_trait]
    impl LlmClient for EchoLlm {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<CompletionResponse> {
            // Summarizer calls ask for JSON; everything else gets the canned text.
            let is_summary = messages
                .first()
                .map(|m| m.content.contains("JSON"))
                .unwrap_or(false);
            Ok(CompletionResponse {
                text: if is_summary {
                    r#"{"summary": "s"}"#.to_string()
                } else {
                    self.text.clone()
                },
                tokens_used: None,
                model: "stub".to_string(),
                finish_reason: None,
            })
        }

        async fn complete_stream(&self, _messages: &[ChatMessage]) -> Result<TokenStream> {
            let words: Vec<Result<String>> = self
                .text
                .split_inclusive(' ')
                .map(|word| Ok(word.to_string()))
                .collect();
            Ok(Box::pin(futures::stream::iter(words)))
        }
    }

    struct RateLimitedLlm;

    #[async_trait]
    impl LlmClient for RateLimitedLlm {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<CompletionResponse> {
            Err(LlmError::NoCapacity.into())
        }
        async fn complete_stream(&self, _messages: &[ChatMessage]) -> Result<TokenStream> {
            Err(LlmError::NoCapacity.into())
        }
    }

    struct NullEmbedder;

    #[async_trait]
    impl Embedder for NullEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
        fn dimension(&self) -> usize {
            2
        }
    }

    struct EmptyStore;

    #[async_trait]
    impl VectorStore for EmptyStore {
        async fn upsert(&self, _records: Vec<VectorRecord>) -> Result<usize> {
            Ok(0)
        }
        async fn query(
            &self,
            _vector: &[f32],
            _top_k: usize,
            _filter: Option<&MetadataFilter>,
        ) -> Result<Vec<QueryMatch>> {
            Ok(vec![])
        }
        async fn find(&self, _f: &MetadataFilter, _l: usize) -> Result<Vec<VectorRecord>> {
            Ok(vec![])
        }
        async fn delete(&self, _f: &MetadataFilter) -> Result<u64> {
            Ok(0)
        }
        async fn count(&self) -> Result<usize> {
            Ok(0)
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn orchestrator(llm: Arc<dyn LlmClient>) -> Arc<AnswerOrchestrator> {
        let retrieval = Arc::new(RetrievalService::new(
            Arc::new(NullEmbedder),
            Arc::new(EmptyStore),
            RetrievalConfig::default(),
        ));
        let memory = Arc::new(ConversationMemory::new(
            Arc::new(InMemoryConversationStore::new()),
            ConversationConfig::default(),
        ));
        let validator = Arc::new(
            UrlValidator::new(&RegistryConfig {
                trusted_domains: vec!["github.com".to_string()],
                ..Default::default()
            })
            .unwrap(),
        );

        Arc::new(AnswerOrchestrator::new(llm, retrieval, memory, validator))
    }

    #[test]
    fn test_build_prompt_shape() {
        let history = vec![user_message("earlier"), crate::llm::assistant_message("reply")];
        let prompt = build_prompt(
            DEFAULT_SYSTEM_TEMPLATE,
            "- alpha: https://github.com/ORG/alpha",
            &history,
            "Alpha deploys to region X.",
            "Where does Alpha deploy?",
        );

        assert_eq!(prompt.len(), 4);
        assert_eq!(prompt[0].role, Role::System);
        assert!(prompt[0].content.contains("Known repositories:"));
        assert!(prompt[0].content.contains("https://github.com/ORG/alpha"));
        let last = prompt.last().unwrap();
        assert_eq!(last.role, Role::User);
        assert!(last.content.contains("Context:\nAlpha deploys to region X."));
        assert!(last.content.contains("Question: Where does Alpha deploy?"));
    }

    #[test]
    fn test_build_prompt_without_context() {
        let prompt = build_prompt(DEFAULT_SYSTEM_TEMPLATE, "", &[], "", "Hello?");
        assert_eq!(prompt.len(), 2);
        assert!(!prompt[0].content.contains("Known repositories:"));
        assert_eq!(prompt[1].content, "Question: Hello?");
    }

    #[tokio::test]
    async fn test_ask_returns_answer_and_persists_history() {
        let orchestrator = orchestrator(Arc::new(EchoLlm {
            text: "Alpha deploys to region X.".to_string(),
        }));

        let answer = orchestrator
            .ask(Some("c1".to_string()), "Where does Alpha deploy?", None)
            .await
            .unwrap();

        assert_eq!(answer.conversation_id, "c1");
        assert!(answer.answer.contains("region X"));

        // A second ask in the same conversation sees both prior messages.
        let answer = orchestrator
            .ask(Some("c1".to_string()), "And Beta?", None)
            .await
            .unwrap();
        assert_eq!(answer.conversation_id, "c1");
    }

    #[tokio::test]
    async fn test_ask_generates_conversation_id() {
        let orchestrator = orchestrator(Arc::new(EchoLlm {
            text: "Hi.".to_string(),
        }));
        let answer = orchestrator.ask(None, "Hello", None).await.unwrap();
        assert!(!answer.conversation_id.is_empty());
    }

    #[tokio::test]
    async fn test_ask_surfaces_capacity_errors() {
        let orchestrator = orchestrator(Arc::new(RateLimitedLlm));
        let err = orchestrator
            .ask(Some("c1".to_string()), "Hello", None)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "llm");
        assert!(err.user_message().contains("retry"));
    }

    #[tokio::test]
    async fn test_ask_stream_deltas_then_final() {
        let orchestrator = orchestrator(Arc::new(EchoLlm {
            text: "Alpha deploys to region X.".to_string(),
        }));

        let rx = orchestrator.ask_stream(Some("c1".to_string()), "Where?".to_string(), None);

        let mut text = String::new();
        let mut saw_final = false;
        while let Ok(frame) = rx.recv_async().await {
            match frame {
                StreamFrame::Delta { delta_text } => text.push_str(&delta_text),
                StreamFrame::Final {
                    conversation_id, ..
                } => {
                    assert_eq!(conversation_id, "c1");
                    saw_final = true;
                }
                StreamFrame::Error { error, .. } => panic!("unexpected error: {error}"),
            }
        }

        assert!(saw_final);
        assert_eq!(text, "Alpha deploys to region X.");
    }

    #[tokio::test]
    async fn test_ask_stream_error_frame_on_no_capacity() {
        let orchestrator = orchestrator(Arc::new(RateLimitedLlm));
        let rx = orchestrator.ask_stream(Some("c1".to_string()), "Where?".to_string(), None);

        let frame = rx.recv_async().await.unwrap();
        assert!(matches!(frame, StreamFrame::Error { .. }));
    }

    #[tokio::test]
    async fn test_stream_frame_wire_shapes() {
        let delta = StreamFrame::Delta {
            delta_text: "hi".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&delta).unwrap(),
            r#"{"delta_text":"hi"}"#
        );

        let final_frame = StreamFrame::Final {
            conversation_id: "c1".to_string(),
            citations: vec![],
        };
        let json = serde_json::to_string(&final_frame).unwrap();
        assert!(json.contains("conversation_id"));
        assert!(json.contains("citations"));
    }
}
