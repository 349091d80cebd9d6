use anyhow::{anyhow, Context};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, trace};

use crate::agent::relay::{Continuation, RunEvent, RunEventStream, ToolCall, ToolOutput};
use crate::models::{ensure_success, FunctionSpec, OpenAICompatible};

const ASSISTANTS_BETA: (&str, &str) = ("OpenAI-Beta", "assistants=v2");

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantHandle {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadHandle {
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct AssistantSpec {
    pub name: String,
    pub instructions: String,
    pub model: String,
    pub tools: Vec<FunctionSpec>,
}

/// Stateful hosted conversation: assistants, threads and streamed runs.
#[async_trait]
pub trait AssistantApi: Send + Sync {
    /// Reuses an existing assistant with the same name before creating one.
    async fn find_or_create_assistant(&self, spec: &AssistantSpec) -> anyhow::Result<AssistantHandle>;
    async fn create_thread(&self) -> anyhow::Result<ThreadHandle>;
    async fn add_user_message(&self, thread: &ThreadHandle, content: &str) -> anyhow::Result<()>;
    async fn stream_run(&self, thread: &ThreadHandle, assistant: &AssistantHandle) -> anyhow::Result<RunEventStream>;
    async fn submit_tool_outputs(&self, continuation: &Continuation, outputs: &[ToolOutput]) -> anyhow::Result<RunEventStream>;
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> { data: Vec<T> }

#[derive(Debug, Deserialize)]
struct IdOnly { id: String }

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    thread_id: String,
    status: Option<String>,
    required_action: Option<RequiredAction>,
    last_error: Option<RunError>,
}

#[derive(Debug, Deserialize)]
struct RequiredAction { submit_tool_outputs: SubmitToolOutputs }

#[derive(Debug, Deserialize)]
struct SubmitToolOutputs { tool_calls: Vec<RunToolCall> }

#[derive(Debug, Deserialize)]
struct RunToolCall { id: String, function: RunFunction }

#[derive(Debug, Deserialize)]
struct RunFunction { name: String, #[serde(default)] arguments: String }

#[derive(Debug, Deserialize)]
struct RunError { message: String }

/// Maps one assistant SSE frame to a relay event. Frames the relay has no use
/// for yield `None`.
pub fn parse_assistant_event(event: &str, data: &str) -> anyhow::Result<Option<RunEvent>> {
    let parsed = match event {
        "thread.message.created" => Some(RunEvent::TextCreated),
        "thread.message.delta" => {
            let v: Value = serde_json::from_str(data).context("message delta payload")?;
            let text: String = v["delta"]["content"]
                .as_array()
                .map(|parts| {
                    parts
                        .iter()
                        .filter(|p| p["type"] == "text")
                        .filter_map(|p| p["text"]["value"].as_str())
                        .collect()
                })
                .unwrap_or_default();
            (!text.is_empty()).then_some(RunEvent::TextDelta(text))
        }
        "thread.message.completed" => Some(RunEvent::TextDone),
        "thread.run.requires_action" => {
            let run: RunObject = serde_json::from_str(data).context("requires_action payload")?;
            let action = run.required_action.ok_or_else(|| anyhow!("run {} requires action but lists none", run.id))?;
            let tool_calls = action
                .submit_tool_outputs
                .tool_calls
                .into_iter()
                .map(|c| ToolCall { id: c.id, function_name: c.function.name, arguments: c.function.arguments })
                .collect();
            Some(RunEvent::RequiresAction(Continuation { thread_id: run.thread_id, run_id: run.id, tool_calls }))
        }
        "thread.run.completed" => Some(RunEvent::Completed),
        "thread.run.failed" | "thread.run.cancelled" | "thread.run.expired" => {
            let run: RunObject = serde_json::from_str(data).context("run payload")?;
            let reason = run
                .last_error
                .map(|e| e.message)
                .or(run.status)
                .unwrap_or_else(|| event.trim_start_matches("thread.run.").to_string());
            Some(RunEvent::Failed(reason))
        }
        "error" => {
            let v: Value = serde_json::from_str(data).unwrap_or(Value::String(data.to_string()));
            let msg = crate::models::extract_api_error_message(&v)
                .or_else(|| v["message"].as_str().map(str::to_string))
                .unwrap_or_else(|| data.to_string());
            Some(RunEvent::Failed(msg))
        }
        _ => {
            trace!(event, "ignoring assistant event");
            None
        }
    };
    Ok(parsed)
}

fn into_run_stream(resp: reqwest::Response) -> RunEventStream {
    let stream = resp
        .bytes_stream()
        .eventsource()
        .map(|sse| match sse {
            Ok(sse) => parse_assistant_event(&sse.event, &sse.data),
            Err(e) => Err(anyhow!("SSE stream error: {}", e)),
        })
        .filter_map(|r| async move { r.transpose() });
    Box::pin(stream)
}

impl OpenAICompatible {
    fn beta_get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.get(self.url(path)).bearer_auth(&self.api_key).header(ASSISTANTS_BETA.0, ASSISTANTS_BETA.1)
    }

    fn beta_post(&self, path: &str) -> reqwest::RequestBuilder {
        self.post(path).header(ASSISTANTS_BETA.0, ASSISTANTS_BETA.1)
    }
}

#[async_trait]
impl AssistantApi for OpenAICompatible {
    async fn find_or_create_assistant(&self, spec: &AssistantSpec) -> anyhow::Result<AssistantHandle> {
        let resp = self.beta_get("assistants").query(&[("order", "desc"), ("limit", "20")]).send().await?;
        let existing: ListResponse<AssistantHandle> = ensure_success(resp, "list assistants").await?.json().await?;
        if let Some(found) = existing.data.into_iter().find(|a| a.name.as_deref() == Some(spec.name.as_str())) {
            debug!(assistant_id = %found.id, "reusing assistant");
            return Ok(found);
        }
        let tools: Vec<Value> = spec.tools.iter().map(|f| serde_json::json!({ "type": "function", "function": f })).collect();
        let body = serde_json::json!({
            "name": spec.name,
            "instructions": spec.instructions,
            "model": spec.model,
            "tools": tools,
        });
        let resp = self.beta_post("assistants").json(&body).send().await?;
        let created: AssistantHandle = ensure_success(resp, "create assistant").await?.json().await?;
        info!(assistant_id = %created.id, "created assistant");
        Ok(created)
    }

    async fn create_thread(&self) -> anyhow::Result<ThreadHandle> {
        let resp = self.beta_post("threads").json(&serde_json::json!({})).send().await?;
        let t: IdOnly = ensure_success(resp, "create thread").await?.json().await?;
        Ok(ThreadHandle { id: t.id })
    }

    async fn add_user_message(&self, thread: &ThreadHandle, content: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({ "role": "user", "content": content });
        let resp = self.beta_post(&format!("threads/{}/messages", thread.id)).json(&body).send().await?;
        ensure_success(resp, "create message").await?;
        Ok(())
    }

    async fn stream_run(&self, thread: &ThreadHandle, assistant: &AssistantHandle) -> anyhow::Result<RunEventStream> {
        let body = serde_json::json!({ "assistant_id": assistant.id, "stream": true });
        let resp = self.beta_post(&format!("threads/{}/runs", thread.id)).json(&body).send().await?;
        Ok(into_run_stream(ensure_success(resp, "create run").await?))
    }

    async fn submit_tool_outputs(&self, continuation: &Continuation, outputs: &[ToolOutput]) -> anyhow::Result<RunEventStream> {
        let body = serde_json::json!({ "tool_outputs": outputs, "stream": true });
        let path = format!("threads/{}/runs/{}/submit_tool_outputs", continuation.thread_id, continuation.run_id);
        let resp = self.beta_post(&path).json(&body).send().await?;
        Ok(into_run_stream(ensure_success(resp, "submit tool outputs").await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::sse::{Event, Sse};
    use axum::{routing::{get, post}, Json, Router};
    use std::convert::Infallible;

    #[test]
    fn parses_message_delta_text_parts() {
        let data = r#"{"id":"msg_1","object":"thread.message.delta","delta":{"content":[
            {"index":0,"type":"text","text":{"value":"Hel"}},
            {"index":1,"type":"image_file","image_file":{"file_id":"f"}},
            {"index":2,"type":"text","text":{"value":"lo"}}]}}"#;
        assert_eq!(parse_assistant_event("thread.message.delta", data).unwrap(), Some(RunEvent::TextDelta("Hello".into())));
    }

    #[test]
    fn parses_requires_action_into_continuation() {
        let data = r#"{"id":"run_1","object":"thread.run","thread_id":"thread_1","status":"requires_action",
            "required_action":{"type":"submit_tool_outputs","submit_tool_outputs":{"tool_calls":[
                {"id":"call_a","type":"function","function":{"name":"search_url_wikipedia","arguments":"{\"query\":\"rust\"}"}},
                {"id":"call_b","type":"function","function":{"name":"save_file","arguments":"{\"text\":\"x\"}"}}]}}}"#;
        let Some(RunEvent::RequiresAction(c)) = parse_assistant_event("thread.run.requires_action", data).unwrap() else {
            panic!("expected requires action");
        };
        assert_eq!(c.run_id, "run_1");
        assert_eq!(c.thread_id, "thread_1");
        assert_eq!(c.tool_calls.len(), 2);
        assert_eq!(c.tool_calls[0].function_name, "search_url_wikipedia");
        assert_eq!(c.tool_calls[1].id, "call_b");
    }

    #[test]
    fn failed_run_carries_last_error() {
        let data = r#"{"id":"run_1","thread_id":"t","status":"failed","last_error":{"code":"server_error","message":"boom"}}"#;
        assert_eq!(parse_assistant_event("thread.run.failed", data).unwrap(), Some(RunEvent::Failed("boom".into())));
        assert_eq!(parse_assistant_event("done", "[DONE]").unwrap(), None);
        assert_eq!(parse_assistant_event("thread.run.step.created", "{}").unwrap(), None);
    }

    async fn run_stream() -> Sse<futures::stream::Iter<std::vec::IntoIter<Result<Event, Infallible>>>> {
        let frames = vec![
            Event::default().event("thread.run.created").data(r#"{"id":"run_1"}"#),
            Event::default().event("thread.message.created").data(r#"{"id":"msg_1"}"#),
            Event::default().event("thread.message.delta").data(r#"{"delta":{"content":[{"type":"text","text":{"value":"Hi"}}]}}"#),
            Event::default().event("thread.message.completed").data(r#"{"id":"msg_1"}"#),
            Event::default().event("thread.run.completed").data(r#"{"id":"run_1","thread_id":"thread_1"}"#),
            Event::default().event("done").data("[DONE]"),
        ];
        Sse::new(futures::stream::iter(frames.into_iter().map(Ok).collect::<Vec<_>>()))
    }

    #[tokio::test]
    async fn reuses_named_assistant_and_streams_run() {
        let app = Router::new()
            .route("/v1/assistants", get(|| async {
                Json(serde_json::json!({ "data": [
                    { "id": "asst_other", "name": "Other" },
                    { "id": "asst_1", "name": "Researcher" }
                ]}))
            }))
            .route("/v1/threads/:id/runs", post(run_stream));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = OpenAICompatible::new(reqwest::Client::new(), format!("http://{}/v1", addr), "k");
        let spec = AssistantSpec { name: "Researcher".into(), instructions: String::new(), model: "m".into(), tools: vec![] };
        let a = client.find_or_create_assistant(&spec).await.unwrap();
        assert_eq!(a.id, "asst_1");

        let stream = client.stream_run(&ThreadHandle { id: "thread_1".into() }, &a).await.unwrap();
        let events: Vec<RunEvent> = stream.map(|e| e.unwrap()).collect().await;
        assert_eq!(events, vec![RunEvent::TextCreated, RunEvent::TextDelta("Hi".into()), RunEvent::TextDone, RunEvent::Completed]);
    }
}
