use crate::agent::assistants::{AssistantHandle, ThreadHandle};
use crate::agent::tools::{ReportArtifact, ToolEvent};
use crate::quiz::{Quiz, QuizAttempt, QuizKey};
use crate::retrieval::{DocumentIndex, SplitDocument};
use crate::settings::SessionSettings;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Ai,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only, chronologically ordered message log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn append(&mut self, role: Role, content: impl Into<String>) -> Message {
        let msg = Message { id: Uuid::new_v4(), role, content: content.into(), created_at: Utc::now() };
        self.messages.push(msg.clone());
        msg
    }

    pub fn messages(&self) -> &[Message] { &self.messages }
    pub fn len(&self) -> usize { self.messages.len() }
    pub fn is_empty(&self) -> bool { self.messages.is_empty() }
}

#[derive(Default)]
pub struct DocumentPage {
    pub index: Option<DocumentIndex>,
    pub transcript: Transcript,
}

#[derive(Default)]
pub struct QuizPage {
    pub document: Option<SplitDocument>,
    /// Generated quizzes, memoized by topic, count and difficulty.
    pub generated: HashMap<QuizKey, Quiz>,
    pub active: Option<(QuizKey, QuizAttempt)>,
}

#[derive(Default)]
pub struct ResearchPage {
    pub assistant: Option<AssistantHandle>,
    pub thread: Option<ThreadHandle>,
    pub transcript: Transcript,
    pub report: Option<ReportArtifact>,
    pub tool_history: Vec<ToolEvent>,
}

/// Everything one user session owns. Handed explicitly to every operation.
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub api_key: String,
    pub settings: SessionSettings,
    pub document: DocumentPage,
    pub quiz: QuizPage,
    pub research: ResearchPage,
}

impl Session {
    pub fn new(api_key: String, settings: SessionSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            api_key,
            settings,
            document: DocumentPage::default(),
            quiz: QuizPage::default(),
            research: ResearchPage::default(),
        }
    }
}
