//! Conversational question answering grounded in a session's index.
//!
//! Each question is condensed against prior turns into a standalone query,
//! used to retrieve the closest chunks, and answered by the language model
//! under a fixed system instruction. Both the question and the answer (or
//! an explanatory error) are appended to the conversation.

use crate::embeddings::Embedder;
use crate::llm::{ChatMessage, CompletionRequest, LanguageModel};
use crate::stores::DiskVectorStore;
use crate::traits::VectorIndex;
use crate::{ConversationTurn, RagError, RetrievalHit, Role, Session, DEFAULT_TOP_K};
use tracing::{debug, info, warn};

pub const DEFAULT_TEMPLATE_VERSION: &str = "study-assistant/v1";

const CONTEXT_SLOT: &str = "{context}";
const HISTORY_SLOT: &str = "{chat_history}";
const QUESTION_SLOT: &str = "{question}";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a study assistant helping students understand the material they uploaded: \
lecture notes, textbook chapters and revision guides.

When answering:
1. Use only the information in the retrieved context below. Do not add facts from elsewhere.
2. If the context does not contain the answer, say so plainly and suggest what the student could look up instead.
3. Structure answers to multi-part questions as bullet points or numbered lists.
4. Explain terminology clearly, in a friendly tone, like a knowledgeable peer.

Retrieved context from the student's materials:
{context}";

const DEFAULT_CONDENSE_PROMPT: &str = "Given the following conversation and a follow up question, \
rephrase the follow up question to be a standalone question that can be understood without the conversation. \
Keep the original language and do not answer it.

Chat history:
{chat_history}

Follow up question: {question}
Standalone question:";

/// Versioned prompts handed to the engine at construction and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pub version: String,
    pub system: String,
    pub condense: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            version: DEFAULT_TEMPLATE_VERSION.to_string(),
            system: DEFAULT_SYSTEM_PROMPT.to_string(),
            condense: DEFAULT_CONDENSE_PROMPT.to_string(),
        }
    }
}

impl PromptTemplate {
    pub fn validate(&self) -> Result<(), RagError> {
        if !self.system.contains(CONTEXT_SLOT) {
            return Err(RagError::Configuration(format!(
                "prompt template {} has no {CONTEXT_SLOT} slot in its system prompt",
                self.version
            )));
        }
        for slot in [HISTORY_SLOT, QUESTION_SLOT] {
            if !self.condense.contains(slot) {
                return Err(RagError::Configuration(format!(
                    "prompt template {} has no {slot} slot in its condense prompt",
                    self.version
                )));
            }
        }
        Ok(())
    }

    pub fn render_system(&self, hits: &[RetrievalHit]) -> String {
        let context = hits
            .iter()
            .map(|hit| format!("[{} #{}]\n{}", hit.chunk.source, hit.chunk.chunk_index, hit.chunk.text))
            .collect::<Vec<_>>()
            .join("\n\n");
        self.system.replace(CONTEXT_SLOT, &context)
    }

    pub fn render_condense(&self, history: &[ConversationTurn], question: &str) -> String {
        let transcript = history
            .iter()
            .map(|turn| match turn.role {
                Role::User => format!("Human: {}", turn.content),
                Role::Assistant => format!("Assistant: {}", turn.content),
            })
            .collect::<Vec<_>>()
            .join("\n");
        self.condense
            .replace(HISTORY_SLOT, &transcript)
            .replace(QUESTION_SLOT, question)
    }
}

#[derive(Debug, Clone)]
pub struct QaOptions {
    pub top_k: usize,
    pub answer_temperature: f32,
    pub condense_questions: bool,
    pub condense_temperature: f32,
    /// Most recent turns fed to condensation; `None` means the full history.
    pub history_window: Option<usize>,
}

impl Default for QaOptions {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            answer_temperature: 0.3,
            condense_questions: true,
            condense_temperature: 0.0,
            history_window: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Answering,
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub content: String,
    pub standalone_question: String,
    pub sources: Vec<RetrievalHit>,
    pub error: Option<String>,
}

impl Answer {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

pub struct ConversationEngine<V, L> {
    index: Option<V>,
    model: L,
    template: PromptTemplate,
    options: QaOptions,
    history: Vec<ConversationTurn>,
    state: EngineState,
}

impl<V, L> ConversationEngine<V, L>
where
    V: VectorIndex,
    L: LanguageModel,
{
    pub fn new(model: L, template: PromptTemplate, options: QaOptions) -> Result<Self, RagError> {
        template.validate()?;
        Ok(Self {
            index: None,
            model,
            template,
            options,
            history: Vec::new(),
            state: EngineState::Uninitialized,
        })
    }

    pub fn attach(&mut self, index: V) {
        self.index = Some(index);
        self.state = EngineState::Ready;
        info!(template = %self.template.version, "conversation engine ready");
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    pub fn index(&self) -> Option<&V> {
        self.index.as_ref()
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    /// Forgets the conversation; the index stays loaded.
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub async fn ask(&mut self, question: &str) -> Result<Answer, RagError> {
        if question.trim().is_empty() {
            return Err(RagError::InvalidArgument("question is empty".to_string()));
        }
        let Some(index) = self.index.as_ref() else {
            return Err(RagError::Configuration(
                "no document index is loaded; process documents first".to_string(),
            ));
        };
        if self.state == EngineState::Answering {
            debug!("previous question was abandoned before it finished");
        }

        self.state = EngineState::Answering;
        let outcome = self.answer_with(index, question).await;

        self.history.push(ConversationTurn::user(question));
        let answer = match outcome {
            Ok(answer) => answer,
            Err(error) => {
                warn!(%error, "question could not be answered");
                Answer {
                    content: error.user_message(),
                    standalone_question: question.to_string(),
                    sources: Vec::new(),
                    error: Some(error.to_string()),
                }
            }
        };
        self.history.push(ConversationTurn::assistant(answer.content.clone()));
        self.state = EngineState::Ready;

        Ok(answer)
    }

    async fn answer_with(&self, index: &V, question: &str) -> Result<Answer, RagError> {
        let standalone_question = self.condense(question).await?;
        let sources = index.query(&standalone_question, self.options.top_k).await?;

        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::system(self.template.render_system(&sources)));
        messages.extend(self.history.iter().map(ChatMessage::from));
        messages.push(ChatMessage::user(question));

        debug!(
            sources = sources.len(),
            messages = messages.len(),
            standalone = %standalone_question,
            "asking language model"
        );

        let content = self
            .model
            .complete(&CompletionRequest {
                messages,
                temperature: self.options.answer_temperature,
            })
            .await?;

        Ok(Answer {
            content,
            standalone_question,
            sources,
            error: None,
        })
    }

    async fn condense(&self, question: &str) -> Result<String, RagError> {
        let history = self.condensation_history();
        if !self.options.condense_questions || history.is_empty() {
            return Ok(question.to_string());
        }

        let prompt = self.template.render_condense(history, question);
        let rewritten = self
            .model
            .complete(&CompletionRequest {
                messages: vec![ChatMessage::user(prompt)],
                temperature: self.options.condense_temperature,
            })
            .await?;

        let rewritten = rewritten.trim();
        Ok(if rewritten.is_empty() {
            question.to_string()
        } else {
            rewritten.to_string()
        })
    }

    fn condensation_history(&self) -> &[ConversationTurn] {
        match self.options.history_window {
            Some(window) => {
                let start = self.history.len().saturating_sub(window);
                &self.history[start..]
            }
            None => &self.history,
        }
    }
}

impl<E, L> ConversationEngine<DiskVectorStore<E>, L>
where
    E: Embedder,
    L: LanguageModel,
{
    /// Loads the session's persisted index. A session that was never
    /// populated is a configuration problem and leaves the engine
    /// uninitialized.
    pub async fn load_session(&mut self, session: Session, embedder: E) -> Result<(), RagError> {
        match DiskVectorStore::open(session, embedder).await {
            Ok(store) => {
                self.attach(store);
                Ok(())
            }
            Err(RagError::IndexNotFound { session }) => Err(RagError::Configuration(format!(
                "no processed documents for session {session}; ingest documents first"
            ))),
            Err(error) => Err(error),
        }
    }
}
