use anyhow::Context;
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use super::{Difficulty, Quiz, QuizKey};
use crate::agent::tools::wikipedia;
use crate::models::{ChatMessage, ChatRequest, FunctionSpec, LanguageModel};
use crate::retrieval::{format_docs, SplitDocument};
use crate::settings::EffectiveSettings;

pub const MIN_QUESTIONS: u8 = 3;
pub const MAX_QUESTIONS: u8 = 10;
const WIKIPEDIA_TOP_K: usize = 5;

pub const FUNCTION_NAME: &str = "create_quiz";

pub fn create_quiz_function() -> FunctionSpec {
    FunctionSpec {
        name: FUNCTION_NAME.into(),
        description: "Takes a set of questions and answers and returns a quiz".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "question": { "type": "string" },
                            "answers": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "answer": { "type": "string" },
                                        "correct": { "type": "boolean" }
                                    },
                                    "required": ["answer", "correct"]
                                }
                            }
                        },
                        "required": ["question", "answers"]
                    }
                }
            },
            "required": ["questions"]
        }),
    }
}

/// Where quiz material comes from.
pub enum QuizSource<'a> {
    Document(&'a SplitDocument),
    Wikipedia(&'a str),
}

impl QuizSource<'_> {
    /// File name or search term.
    pub fn topic(&self) -> String {
        match self {
            QuizSource::Document(doc) => doc.identity.file_name.clone(),
            QuizSource::Wikipedia(term) => term.trim().to_string(),
        }
    }

    pub fn key(&self, count: u8, difficulty: Difficulty) -> QuizKey {
        QuizKey { topic: self.topic(), count, difficulty }
    }
}

/// Material ready to be turned into questions.
#[derive(Debug, Clone)]
pub struct QuizMaterial {
    pub topic: String,
    pub context: String,
}

pub fn validate_count(count: u8) -> anyhow::Result<u8> {
    if !(MIN_QUESTIONS..=MAX_QUESTIONS).contains(&count) {
        anyhow::bail!("question count must be between {} and {}", MIN_QUESTIONS, MAX_QUESTIONS);
    }
    Ok(count)
}

pub async fn gather(http: &reqwest::Client, wikipedia_base_url: &str, source: QuizSource<'_>) -> anyhow::Result<QuizMaterial> {
    match &source {
        QuizSource::Document(doc) => {
            if doc.chunks.is_empty() {
                anyhow::bail!("document {} has no text", doc.identity.file_name);
            }
            Ok(QuizMaterial { topic: source.topic(), context: format_docs(&doc.chunks) })
        }
        QuizSource::Wikipedia(term) => {
            let term = term.trim();
            if term.is_empty() {
                anyhow::bail!("search term is empty");
            }
            let pages = wikipedia::search_pages(http, wikipedia_base_url, term, WIKIPEDIA_TOP_K, false).await?;
            if pages.is_empty() {
                anyhow::bail!("no encyclopedia articles found for {:?}", term);
            }
            let context = pages.iter().map(|p| p.text.as_str()).collect::<Vec<_>>().join("\n\n");
            Ok(QuizMaterial { topic: term.to_string(), context })
        }
    }
}

pub fn quiz_prompt(context: &str, count: u8, difficulty: Difficulty) -> String {
    format!("Make {} quiz questions about the following context. Difficulty: {}.\n\n{}", count, difficulty.as_str(), context)
}

fn strip_code_fences(raw: &str) -> anyhow::Result<String> {
    let fence = Regex::new(r"(?s)^\s*```[A-Za-z]*\s*(.*?)\s*```\s*$")?;
    Ok(match fence.captures(raw) {
        Some(c) => c.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
        None => raw.trim().to_string(),
    })
}

pub fn parse_quiz_arguments(raw: &str) -> anyhow::Result<Quiz> {
    let body = strip_code_fences(raw)?;
    let quiz: Quiz = serde_json::from_str(&body).context("model returned malformed quiz JSON")?;
    if quiz.questions.is_empty() {
        anyhow::bail!("model returned no questions");
    }
    if let Some(q) = quiz.questions.iter().find(|q| q.answers.is_empty()) {
        anyhow::bail!("question {:?} has no answers", q.question);
    }
    Ok(quiz)
}

pub async fn generate(
    model: &dyn LanguageModel,
    settings: &EffectiveSettings,
    material: &QuizMaterial,
    count: u8,
    difficulty: Difficulty,
) -> anyhow::Result<Quiz> {
    let count = validate_count(count)?;
    let req = ChatRequest {
        model: settings.model.clone(),
        messages: vec![ChatMessage::user(quiz_prompt(&material.context, count, difficulty))],
        temperature: Some(settings.temperature),
    };
    let raw = model.call_function(req, &create_quiz_function()).await?;
    let quiz = parse_quiz_arguments(&raw)?;
    if quiz.total() != count as usize {
        warn!(requested = count, generated = quiz.total(), "model returned a different number of questions");
    }
    info!(topic = %material.topic, questions = quiz.total(), difficulty = difficulty.as_str(), "quiz generated");
    Ok(quiz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::relay::RunEventStream;
    use crate::retrieval::{Chunk, FileIdentity};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedModel {
        reply: String,
        seen: Mutex<Vec<(ChatRequest, String)>>,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn stream_chat(&self, _req: ChatRequest) -> anyhow::Result<RunEventStream> {
            anyhow::bail!("not used")
        }

        async fn call_function(&self, req: ChatRequest, function: &FunctionSpec) -> anyhow::Result<String> {
            self.seen.lock().unwrap().push((req, function.name.clone()));
            Ok(self.reply.clone())
        }
    }

    fn settings() -> EffectiveSettings {
        EffectiveSettings { model: "m".into(), temperature: 0.1, top_k: 4 }
    }

    const QUIZ_JSON: &str = r#"{"questions":[
        {"question":"Capital of France?","answers":[{"answer":"Lyon","correct":false},{"answer":"Paris","correct":true}]},
        {"question":"2+2?","answers":[{"answer":"4","correct":true},{"answer":"5","correct":false}]},
        {"question":"Sky colour?","answers":[{"answer":"Blue","correct":true},{"answer":"Green","correct":false}]}
    ]}"#;

    #[test]
    fn fenced_and_plain_arguments_parse() {
        let plain = parse_quiz_arguments(QUIZ_JSON).unwrap();
        let fenced = parse_quiz_arguments(&format!("```json\n{}\n```", QUIZ_JSON)).unwrap();
        assert_eq!(plain, fenced);
        assert_eq!(plain.total(), 3);
        assert_eq!(plain.questions[0].answers[1].answer, "Paris");
    }

    #[test]
    fn malformed_or_empty_quizzes_are_rejected() {
        assert!(parse_quiz_arguments("not json").is_err());
        assert!(parse_quiz_arguments(r#"{"questions":[]}"#).is_err());
        assert!(parse_quiz_arguments(r#"{"questions":[{"question":"q","answers":[]}]}"#).is_err());
    }

    #[test]
    fn count_bounds() {
        assert!(validate_count(2).is_err());
        assert!(validate_count(11).is_err());
        assert_eq!(validate_count(3).unwrap(), 3);
        assert_eq!(validate_count(10).unwrap(), 10);
    }

    #[tokio::test]
    async fn forces_create_quiz_over_document_context() {
        let model = ScriptedModel { reply: QUIZ_JSON.into(), seen: Mutex::new(vec![]) };
        let doc = SplitDocument {
            identity: FileIdentity::of("geo.txt", b"x"),
            chunks: vec![Chunk { index: 0, text: "France facts".into() }, Chunk { index: 1, text: "Math facts".into() }],
        };
        let material = gather(&reqwest::Client::new(), "", QuizSource::Document(&doc)).await.unwrap();
        assert_eq!(material.topic, "geo.txt");
        assert_eq!(
            QuizSource::Document(&doc).key(3, Difficulty::Hard),
            QuizKey { topic: "geo.txt".into(), count: 3, difficulty: Difficulty::Hard }
        );
        assert_eq!(QuizSource::Wikipedia("  rust ").topic(), "rust");

        let quiz = generate(&model, &settings(), &material, 3, Difficulty::Hard).await.unwrap();
        assert_eq!(quiz.total(), 3);

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[0].1, "create_quiz");
        let prompt = &seen[0].0.messages[0].content;
        assert!(prompt.contains("Make 3 quiz questions"));
        assert!(prompt.contains("Difficulty: hard"));
        assert!(prompt.contains("France facts\n\nMath facts"));
    }

    #[tokio::test]
    async fn out_of_range_count_never_reaches_the_model() {
        let model = ScriptedModel { reply: QUIZ_JSON.into(), seen: Mutex::new(vec![]) };
        let material = QuizMaterial { topic: "t".into(), context: "c".into() };
        assert!(generate(&model, &settings(), &material, 20, Difficulty::Easy).await.is_err());
        assert!(model.seen.lock().unwrap().is_empty());
    }
}
