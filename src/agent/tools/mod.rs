use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::relay::{ToolCall, ToolOutput};
use crate::config::AppConfig;
use crate::models::FunctionSpec;

pub mod file_writer;
pub mod page_loader;
pub mod web_search;
pub mod wikipedia;

/// The closed set of functions the research assistant may call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "name", content = "arguments")]
pub enum ResearchTool {
    #[serde(rename = "search_url_wikipedia")]
    WikipediaSearch { query: String },
    #[serde(rename = "search_url_duckduckgo")]
    WebSearch { query: String },
    #[serde(rename = "load_website")]
    LoadWebsite { url: String },
    #[serde(rename = "save_file")]
    SaveFile { text: String },
}

impl ResearchTool {
    pub fn parse(function_name: &str, arguments: &str) -> anyhow::Result<Self> {
        let args: Value = if arguments.trim().is_empty() { json!({}) } else { serde_json::from_str(arguments)? };
        serde_json::from_value(json!({ "name": function_name, "arguments": args }))
            .map_err(|e| anyhow::anyhow!("cannot dispatch `{}`: {}", function_name, e))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ResearchTool::WikipediaSearch { .. } => "search_url_wikipedia",
            ResearchTool::WebSearch { .. } => "search_url_duckduckgo",
            ResearchTool::LoadWebsite { .. } => "load_website",
            ResearchTool::SaveFile { .. } => "save_file",
        }
    }

    /// Declarations registered on the hosted assistant.
    pub fn function_specs() -> Vec<FunctionSpec> {
        let string_param = |name: &str, description: &str| {
            json!({
                "type": "object",
                "properties": { name: { "type": "string", "description": description } },
                "required": [name],
            })
        };
        vec![
            FunctionSpec {
                name: "search_url_wikipedia".into(),
                description: "Takes a query and collects Wikipedia search results, including article URLs.".into(),
                parameters: string_param("query", "The query to search for. Example: Research ransomware."),
            },
            FunctionSpec {
                name: "search_url_duckduckgo".into(),
                description: "Takes a query and collects DuckDuckGo search results, including result URLs.".into(),
                parameters: string_param("query", "The query to search for. Example: Research ransomware."),
            },
            FunctionSpec {
                name: "load_website".into(),
                description: "Loads the text of a URL found through Wikipedia or DuckDuckGo.".into(),
                parameters: string_param("url", "A URL found through Wikipedia or DuckDuckGo."),
            },
            FunctionSpec {
                name: "save_file".into(),
                description: "Saves the finished research document to a text file.".into(),
                parameters: string_param("text", "The finished research document, sources included."),
            },
        ]
    }
}

#[derive(Clone)]
pub struct ToolContext {
    pub http: reqwest::Client,
    pub wikipedia_base_url: String,
    pub duckduckgo_url: String,
    pub report_path: PathBuf,
    pub max_page_bytes: usize,
}

impl ToolContext {
    pub fn from_config(http: reqwest::Client, cfg: &AppConfig) -> Self {
        Self {
            http,
            wikipedia_base_url: cfg.wikipedia_base_url.clone(),
            duckduckgo_url: cfg.duckduckgo_url.clone(),
            report_path: cfg.report_path.clone(),
            max_page_bytes: cfg.max_page_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReportArtifact {
    pub file_name: String,
    pub content: String,
    pub saved_at: DateTime<Utc>,
}

pub struct ToolResult {
    pub summary: String,
    pub output: String,
    pub artifact: Option<ReportArtifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEvent {
    pub id: Uuid,
    pub tool_call_id: String,
    pub tool: String,
    pub summary: String,
    pub status: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Dispatched {
    pub outputs: Vec<ToolOutput>,
    pub events: Vec<ToolEvent>,
    pub artifact: Option<ReportArtifact>,
}

pub struct ToolDispatcher {
    ctx: ToolContext,
}

impl ToolDispatcher {
    pub fn new(ctx: ToolContext) -> Self { Self { ctx } }

    async fn run(&self, tool: ResearchTool) -> anyhow::Result<ToolResult> {
        match tool {
            ResearchTool::WikipediaSearch { query } => wikipedia::search_tool(&self.ctx, &query).await,
            ResearchTool::WebSearch { query } => web_search::search_tool(&self.ctx, &query).await,
            ResearchTool::LoadWebsite { url } => page_loader::load_tool(&self.ctx, &url).await,
            ResearchTool::SaveFile { text } => file_writer::save_tool(&self.ctx, &text).await,
        }
    }

    async fn dispatch_one(&self, call: &ToolCall) -> (ToolOutput, ToolEvent, Option<ReportArtifact>) {
        let parsed = ResearchTool::parse(&call.function_name, &call.arguments);
        let tool_name = parsed.as_ref().map(|t| t.name().to_string()).unwrap_or_else(|_| call.function_name.clone());
        let result = match parsed {
            Ok(tool) => self.run(tool).await,
            Err(e) => Err(e),
        };
        let (output, summary, status, error, artifact) = match result {
            Ok(r) => (r.output, r.summary, "ok", None, r.artifact),
            Err(e) => {
                warn!(tool = %tool_name, tool_call_id = %call.id, error = %e, "tool call failed");
                (format!("error: {}", e), "failed".to_string(), "error", Some(e.to_string()), None)
            }
        };
        metrics::counter!("gpt_series_tool_calls_total", "tool" => tool_name.clone(), "status" => status).increment(1);
        let event = ToolEvent {
            id: Uuid::new_v4(),
            tool_call_id: call.id.clone(),
            tool: tool_name,
            summary,
            status: status.into(),
            error,
            created_at: Utc::now(),
        };
        (ToolOutput { tool_call_id: call.id.clone(), output }, event, artifact)
    }

    /// Runs every call of a batch concurrently; one output per call, keyed by
    /// the call id.
    pub async fn dispatch_all(&self, calls: &[ToolCall]) -> Dispatched {
        info!(count = calls.len(), "dispatching tool calls");
        let results = join_all(calls.iter().map(|c| self.dispatch_one(c))).await;
        let mut dispatched = Dispatched { outputs: Vec::with_capacity(results.len()), events: Vec::new(), artifact: None };
        for (output, event, artifact) in results {
            dispatched.outputs.push(output);
            dispatched.events.push(event);
            if artifact.is_some() {
                dispatched.artifact = artifact;
            }
        }
        dispatched
    }
}
