use anyhow::{anyhow, Context};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::agent::relay::{RunEvent, RunEventStream};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self { Self { role: "system".into(), content: content.into() } }
    pub fn user(content: impl Into<String>) -> Self { Self { role: "user".into(), content: content.into() } }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
}

/// JSON-schema function declaration, shared by chat function calling and
/// assistant tool declarations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn stream_chat(&self, req: ChatRequest) -> anyhow::Result<RunEventStream>;
    /// Forces a call to `function` and returns its raw JSON arguments.
    async fn call_function(&self, req: ChatRequest, function: &FunctionSpec) -> anyhow::Result<String>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_documents(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut v = self.embed_documents(&[text.to_string()]).await?;
        v.pop().ok_or_else(|| anyhow!("provider returned no embedding"))
    }
}

#[derive(Clone)]
pub struct OpenAICompatible {
    pub(crate) base_url: String,
    pub(crate) api_key: String,
    pub(crate) embedding_model: String,
    pub(crate) http: reqwest::Client,
}

impl OpenAICompatible {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            embedding_model: crate::config::DEFAULT_EMBEDDING_MODEL.into(),
            http,
        }
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    pub(crate) fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.post(self.url(path)).bearer_auth(&self.api_key)
    }
}

pub(crate) async fn ensure_success(resp: reqwest::Response, what: &str) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Value>(&body)
        .ok()
        .as_ref()
        .and_then(extract_api_error_message)
        .unwrap_or(body);
    anyhow::bail!("{} failed: {} {}", what, status, detail)
}

pub(crate) fn extract_api_error_message(v: &Value) -> Option<String> {
    let error = v.get("error")?;
    if let Some(message) = error.get("message").and_then(|m| m.as_str()) {
        return Some(message.to_string());
    }
    if let Some(message) = error.as_str() {
        return Some(message.to_string());
    }
    Some("provider reported an error".to_string())
}

#[derive(Debug, Serialize)]
struct OaiChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")] temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")] stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")] tools: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")] tool_choice: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OaiChunk { #[serde(default)] choices: Vec<OaiChunkChoice> }

#[derive(Debug, Deserialize)]
struct OaiChunkChoice { #[serde(default)] delta: OaiDelta, finish_reason: Option<String> }

#[derive(Debug, Deserialize, Default)]
struct OaiDelta { content: Option<String> }

#[derive(Debug, Deserialize)]
struct OaiChatResponse { choices: Vec<OaiChoice> }

#[derive(Debug, Deserialize)]
struct OaiChoice { message: OaiMessage }

#[derive(Debug, Deserialize)]
struct OaiMessage { #[serde(default)] tool_calls: Vec<OaiToolCall> }

#[derive(Debug, Deserialize)]
struct OaiToolCall { function: OaiFunctionCall }

#[derive(Debug, Deserialize)]
struct OaiFunctionCall { name: String, arguments: String }

#[derive(Debug, Deserialize)]
struct OaiEmbeddingResponse { data: Vec<OaiEmbedding> }

#[derive(Debug, Deserialize)]
struct OaiEmbedding { index: usize, embedding: Vec<f32> }

/// Turns `chat.completion.chunk` payloads into relay events.
#[derive(Debug, Default)]
pub struct ChatChunkDecoder {
    opened: bool,
    closed: bool,
}

impl ChatChunkDecoder {
    pub fn decode(&mut self, data: &str) -> anyhow::Result<Vec<RunEvent>> {
        if data.trim() == "[DONE]" {
            return Ok(self.finish());
        }
        let v: Value = serde_json::from_str(data).with_context(|| format!("SSE parsing error, data: {}", data))?;
        if let Some(msg) = extract_api_error_message(&v) {
            anyhow::bail!("SSE API error: {}", msg);
        }
        let chunk: OaiChunk = serde_json::from_value(v)?;
        let mut out = Vec::new();
        // only the first choice is rendered
        if let Some(choice) = chunk.choices.into_iter().next() {
            if !self.opened {
                self.opened = true;
                out.push(RunEvent::TextCreated);
            }
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                out.push(RunEvent::TextDelta(content));
            }
            if choice.finish_reason.is_some() {
                out.extend(self.finish());
            }
        }
        Ok(out)
    }

    fn finish(&mut self) -> Vec<RunEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        let mut out = Vec::new();
        if !self.opened {
            self.opened = true;
            out.push(RunEvent::TextCreated);
        }
        out.push(RunEvent::TextDone);
        out.push(RunEvent::Completed);
        out
    }
}

#[async_trait]
impl LanguageModel for OpenAICompatible {
    async fn stream_chat(&self, req: ChatRequest) -> anyhow::Result<RunEventStream> {
        let body = OaiChatRequest {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            stream: true,
            tools: None,
            tool_choice: None,
        };
        let resp = self.post("chat/completions").json(&body).send().await?;
        let resp = ensure_success(resp, "chat completion").await?;
        debug!(model = %req.model, "chat stream opened");

        let mut decoder = ChatChunkDecoder::default();
        let stream = resp
            .bytes_stream()
            .eventsource()
            .map(move |sse| -> Vec<anyhow::Result<RunEvent>> {
                match sse {
                    Ok(sse) => {
                        trace!("chat SSE: {:?}", sse.data);
                        match decoder.decode(&sse.data) {
                            Ok(events) => events.into_iter().map(Ok).collect(),
                            Err(e) => vec![Err(e)],
                        }
                    }
                    Err(e) => vec![Err(anyhow!("SSE stream error: {}", e))],
                }
            })
            .flat_map(futures::stream::iter);
        Ok(Box::pin(stream))
    }

    async fn call_function(&self, req: ChatRequest, function: &FunctionSpec) -> anyhow::Result<String> {
        let tools = serde_json::json!([{ "type": "function", "function": function }]);
        let choice = serde_json::json!({ "type": "function", "function": { "name": function.name } });
        let body = OaiChatRequest {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            stream: false,
            tools: Some(tools),
            tool_choice: Some(choice),
        };
        let resp = self.post("chat/completions").json(&body).send().await?;
        let v: OaiChatResponse = ensure_success(resp, "function call").await?.json().await?;
        let call = v
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.tool_calls.into_iter().next())
            .ok_or_else(|| anyhow!("model did not call {}", function.name))?;
        if call.function.name != function.name {
            warn!(expected = %function.name, got = %call.function.name, "model called a different function");
        }
        Ok(call.function.arguments)
    }
}

#[async_trait]
impl Embedder for OpenAICompatible {
    async fn embed_documents(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({ "model": self.embedding_model, "input": texts });
        let resp = self.post("embeddings").json(&body).send().await?;
        let mut v: OaiEmbeddingResponse = ensure_success(resp, "embedding").await?.json().await?;
        if v.data.len() != texts.len() {
            anyhow::bail!("expected {} embeddings, got {}", texts.len(), v.data.len());
        }
        v.data.sort_by_key(|e| e.index);
        Ok(v.data.into_iter().map(|e| e.embedding).collect())
    }
}
