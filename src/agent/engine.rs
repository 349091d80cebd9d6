use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::agent::assistants::{AssistantApi, AssistantSpec};
use crate::agent::relay::{Continuation, RelayOutput, RelayState, RunEvent, RunEventStream, StreamingRelay};
use crate::agent::tools::{ResearchTool, ToolDispatcher};
use crate::config::AppConfig;
use crate::models::{ChatMessage, ChatRequest, Embedder, LanguageModel};
use crate::retrieval::format_docs;
use crate::session::{DocumentPage, Message, ResearchPage, Role, Transcript};
use crate::settings::EffectiveSettings;

const RESEARCH_INSTRUCTIONS: &str = "You are an expert in searching and researching websites.

Gather complete and accurate information about the user's query from Wikipedia or DuckDuckGo.

When you find a relevant website through Wikipedia or DuckDuckGo, load its content. Use the loaded content to research and format a detailed answer to the question.

Combine the information from the relevant websites found on Wikipedia and DuckDuckGo. Make sure the final answer is well organized and detailed, and that the sources are accurate and included with their links (URLs).

List the links and sources at the very end. Example: Wikipedia: https://en.wikipedia.org/wiki/PlayStation_4

Save the final answer, with all sources and links, unchanged to a .txt file.";

pub fn research_assistant_spec(cfg: &AppConfig) -> AssistantSpec {
    AssistantSpec {
        name: cfg.assistant_name.clone(),
        instructions: RESEARCH_INSTRUCTIONS.into(),
        model: cfg.chat_model.clone(),
        tools: ResearchTool::function_specs(),
    }
}

fn document_system_prompt(context: &str) -> String {
    format!(
        "You can quickly search the given document to answer questions. Answer only from the given document; do not make anything up.\n\nContext: {}",
        context
    )
}

/// What the client renders while a turn streams.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderUpdate {
    Opened,
    /// Full text of the open turn, replacing whatever was shown before.
    Text { value: String },
    Saved { message: Message },
    ToolCalls { names: Vec<String> },
    Report { file_name: String },
    Error { message: String },
    Done,
}

impl RenderUpdate {
    pub fn event_name(&self) -> &'static str {
        match self {
            RenderUpdate::Opened => "opened",
            RenderUpdate::Text { .. } => "text",
            RenderUpdate::Saved { .. } => "saved",
            RenderUpdate::ToolCalls { .. } => "tool_calls",
            RenderUpdate::Report { .. } => "report",
            RenderUpdate::Error { .. } => "error",
            RenderUpdate::Done => "done",
        }
    }
}

pub type RenderTx = mpsc::UnboundedSender<RenderUpdate>;

pub(crate) fn emit(tx: &RenderTx, update: RenderUpdate) {
    // keep going when the client hangs up so the transcript still completes
    if tx.send(update).is_err() {
        debug!("render receiver dropped");
    }
}

fn forward(outputs: Vec<RelayOutput>, tx: &RenderTx) -> Option<Option<Continuation>> {
    for out in outputs {
        match out {
            RelayOutput::Opened => emit(tx, RenderUpdate::Opened),
            RelayOutput::Render(value) => emit(tx, RenderUpdate::Text { value }),
            RelayOutput::Saved(message) => emit(tx, RenderUpdate::Saved { message }),
            RelayOutput::Suspended(cont) => return Some(Some(cont)),
            RelayOutput::Finished => return Some(None),
            RelayOutput::Ignored => {}
        }
    }
    None
}

/// Feeds `stream` through `relay` until the run finishes or suspends for
/// tool use. A suspended run hands back its continuation.
pub async fn drive(
    mut stream: RunEventStream,
    relay: &mut StreamingRelay,
    transcript: &mut Transcript,
    tx: &RenderTx,
) -> anyhow::Result<Option<Continuation>> {
    while let Some(event) = stream.next().await {
        let event = event?;
        if matches!(event, RunEvent::TextDelta(_)) {
            metrics::counter!("gpt_series_stream_deltas_total").increment(1);
        }
        if let Some(end) = forward(relay.apply(event, transcript)?, tx) {
            return Ok(end);
        }
    }
    // stream closed without a terminal event
    if matches!(relay.state(), RelayState::TextOpen { .. }) {
        forward(relay.apply(RunEvent::Completed, transcript)?, tx);
    }
    Ok(None)
}

/// One DocumentGPT turn: retrieve, prompt with the retrieved context, stream
/// the answer into the page transcript.
pub async fn answer_document_question(
    model: &dyn LanguageModel,
    embedder: &dyn Embedder,
    page: &mut DocumentPage,
    settings: &EffectiveSettings,
    question: &str,
    tx: &RenderTx,
) -> anyhow::Result<()> {
    let index = page.index.as_ref().ok_or_else(|| anyhow::anyhow!("no document has been uploaded"))?;
    page.transcript.append(Role::Human, question);

    let chunks = index.retrieve(embedder, question, settings.top_k).await?;
    debug!(retrieved = chunks.len(), k = settings.top_k, "context retrieved");
    let req = ChatRequest {
        model: settings.model.clone(),
        messages: vec![ChatMessage::system(document_system_prompt(&format_docs(&chunks))), ChatMessage::user(question)],
        temperature: Some(settings.temperature),
    };
    let stream = model.stream_chat(req).await?;
    let mut relay = StreamingRelay::new();
    if let Some(cont) = drive(stream, &mut relay, &mut page.transcript, tx).await? {
        anyhow::bail!("chat completion unexpectedly requested tools (run {})", cont.run_id);
    }
    Ok(())
}

/// One ResearchGPT turn. Tool calls requested by the run are dispatched and
/// answered until the run completes.
pub async fn research_turn(
    api: &dyn AssistantApi,
    dispatcher: &ToolDispatcher,
    spec: &AssistantSpec,
    page: &mut ResearchPage,
    message: &str,
    tx: &RenderTx,
) -> anyhow::Result<()> {
    let assistant = match &page.assistant {
        Some(a) => a.clone(),
        None => {
            let a = api.find_or_create_assistant(spec).await?;
            page.assistant = Some(a.clone());
            a
        }
    };
    let thread = match &page.thread {
        Some(t) => t.clone(),
        None => {
            let t = api.create_thread().await?;
            info!(thread = %t.id, "research thread created");
            page.thread = Some(t.clone());
            t
        }
    };

    page.transcript.append(Role::Human, message);
    api.add_user_message(&thread, message).await?;

    let mut relay = StreamingRelay::new();
    let mut stream = api.stream_run(&thread, &assistant).await?;
    let mut rounds = 0usize;
    while let Some(cont) = drive(stream, &mut relay, &mut page.transcript, tx).await? {
        rounds += 1;
        let names = cont.tool_calls.iter().map(|c| c.function_name.clone()).collect();
        emit(tx, RenderUpdate::ToolCalls { names });

        let dispatched = dispatcher.dispatch_all(&cont.tool_calls).await;
        page.tool_history.extend(dispatched.events);
        if let Some(artifact) = dispatched.artifact {
            emit(tx, RenderUpdate::Report { file_name: artifact.file_name.clone() });
            page.report = Some(artifact);
        }
        stream = api.submit_tool_outputs(&cont, &dispatched.outputs).await?;
        relay.resume(&cont.run_id)?;
    }
    info!(thread = %thread.id, tool_rounds = rounds, "research turn finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::assistants::{AssistantHandle, ThreadHandle};
    use crate::agent::relay::{ToolCall, ToolOutput};
    use crate::agent::tools::ToolContext;
    use crate::models::FunctionSpec;
    use crate::retrieval::{Chunk, DocumentIndex, FileIdentity, SplitDocument};
    use crate::storage::tests::CountingEmbedder;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn scripted(events: Vec<RunEvent>) -> RunEventStream {
        futures::stream::iter(events.into_iter().map(Ok)).boxed()
    }

    fn deltas(parts: &[&str]) -> Vec<RunEvent> {
        let mut v = vec![RunEvent::TextCreated];
        v.extend(parts.iter().map(|p| RunEvent::TextDelta(p.to_string())));
        v.push(RunEvent::TextDone);
        v.push(RunEvent::Completed);
        v
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RenderUpdate>) -> Vec<RenderUpdate> {
        let mut out = Vec::new();
        while let Ok(u) = rx.try_recv() {
            out.push(u);
        }
        out
    }

    struct ChatFake {
        events: Vec<RunEvent>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl LanguageModel for ChatFake {
        async fn stream_chat(&self, req: ChatRequest) -> anyhow::Result<RunEventStream> {
            self.seen.lock().unwrap().push(req);
            Ok(scripted(self.events.clone()))
        }

        async fn call_function(&self, _req: ChatRequest, _f: &FunctionSpec) -> anyhow::Result<String> {
            anyhow::bail!("not used")
        }
    }

    fn settings() -> EffectiveSettings {
        EffectiveSettings { model: "gpt-test".into(), temperature: 0.1, top_k: 4 }
    }

    fn page_with_document() -> DocumentPage {
        let chunks = vec![Chunk { index: 0, text: "Paris is the capital of France.".into() }];
        let doc = SplitDocument { identity: FileIdentity::of("f.txt", b"x"), chunks };
        DocumentPage { index: Some(DocumentIndex::new(doc, vec![vec![1.0, 1.0]]).unwrap()), ..Default::default() }
    }

    #[tokio::test]
    async fn document_answer_streams_and_saves_one_message() {
        let model = ChatFake { events: deltas(&["Par", "is"]), seen: Mutex::new(vec![]) };
        let mut page = page_with_document();
        let (tx, mut rx) = mpsc::unbounded_channel();

        answer_document_question(&model, &CountingEmbedder::default(), &mut page, &settings(), "Capital?", &tx)
            .await
            .unwrap();

        let msgs = page.transcript.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!((msgs[0].role, msgs[0].content.as_str()), (Role::Human, "Capital?"));
        assert_eq!((msgs[1].role, msgs[1].content.as_str()), (Role::Ai, "Paris"));

        let texts: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|u| match u { RenderUpdate::Text { value } => Some(value), _ => None })
            .collect();
        assert_eq!(texts, vec!["Par", "Paris"]);

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[0].model, "gpt-test");
        assert!(seen[0].messages[0].content.contains("Context: Paris is the capital of France."));
        assert_eq!(seen[0].messages[1], ChatMessage::user("Capital?"));
    }

    #[tokio::test]
    async fn question_without_document_is_rejected() {
        let model = ChatFake { events: vec![], seen: Mutex::new(vec![]) };
        let mut page = DocumentPage::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = answer_document_question(&model, &CountingEmbedder::default(), &mut page, &settings(), "q", &tx).await;
        assert!(err.is_err());
        assert!(page.transcript.is_empty());
    }

    #[tokio::test]
    async fn stream_cut_short_still_saves_text() {
        let mut relay = StreamingRelay::new();
        let mut transcript = Transcript::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let stream = scripted(vec![RunEvent::TextCreated, RunEvent::TextDelta("partial".into())]);
        assert!(drive(stream, &mut relay, &mut transcript, &tx).await.unwrap().is_none());
        assert_eq!(transcript.messages()[0].content, "partial");
    }

    #[derive(Default)]
    struct AssistantsFake {
        runs: Mutex<VecDeque<Vec<RunEvent>>>,
        created: AtomicUsize,
        threads: AtomicUsize,
        submitted: Mutex<Vec<(String, Vec<ToolOutput>)>>,
        user_messages: Mutex<Vec<String>>,
    }

    impl AssistantsFake {
        fn with_runs(runs: Vec<Vec<RunEvent>>) -> Self {
            Self { runs: Mutex::new(runs.into()), ..Default::default() }
        }

        fn next_run(&self) -> anyhow::Result<RunEventStream> {
            let events = self.runs.lock().unwrap().pop_front().ok_or_else(|| anyhow::anyhow!("no scripted run"))?;
            Ok(scripted(events))
        }
    }

    #[async_trait]
    impl AssistantApi for AssistantsFake {
        async fn find_or_create_assistant(&self, spec: &AssistantSpec) -> anyhow::Result<AssistantHandle> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(AssistantHandle { id: "asst_1".into(), name: Some(spec.name.clone()) })
        }

        async fn create_thread(&self) -> anyhow::Result<ThreadHandle> {
            self.threads.fetch_add(1, Ordering::SeqCst);
            Ok(ThreadHandle { id: "thread_1".into() })
        }

        async fn add_user_message(&self, _thread: &ThreadHandle, content: &str) -> anyhow::Result<()> {
            self.user_messages.lock().unwrap().push(content.to_string());
            Ok(())
        }

        async fn stream_run(&self, _thread: &ThreadHandle, _assistant: &AssistantHandle) -> anyhow::Result<RunEventStream> {
            self.next_run()
        }

        async fn submit_tool_outputs(&self, cont: &Continuation, outputs: &[ToolOutput]) -> anyhow::Result<RunEventStream> {
            self.submitted.lock().unwrap().push((cont.run_id.clone(), outputs.to_vec()));
            self.next_run()
        }
    }

    fn tool_run(run_id: &str, calls: Vec<ToolCall>) -> Vec<RunEvent> {
        vec![
            RunEvent::TextCreated,
            RunEvent::TextDelta("Researching".into()),
            RunEvent::RequiresAction(Continuation { thread_id: "thread_1".into(), run_id: run_id.into(), tool_calls: calls }),
        ]
    }

    fn call(id: &str, name: &str, args: &str) -> ToolCall {
        ToolCall { id: id.into(), function_name: name.into(), arguments: args.into() }
    }

    fn dispatcher(dir: &tempfile::TempDir) -> ToolDispatcher {
        ToolDispatcher::new(ToolContext {
            http: reqwest::Client::new(),
            wikipedia_base_url: "http://127.0.0.1:1".into(),
            duckduckgo_url: "http://127.0.0.1:1".into(),
            report_path: dir.path().join("research_report.txt"),
            max_page_bytes: 1024,
        })
    }

    #[tokio::test]
    async fn tool_round_trip_resumes_the_same_turn() {
        let dir = tempdir().unwrap();
        let api = AssistantsFake::with_runs(vec![
            tool_run("run_1", vec![call("c1", "save_file", r#"{"text":"report body"}"#), call("c2", "make_coffee", "{}")]),
            deltas(&["Saved ", "the report."]),
            deltas(&["Second answer"]),
        ]);
        let spec = research_assistant_spec(&AppConfig::default());
        let mut page = ResearchPage::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        research_turn(&api, &dispatcher(&dir), &spec, &mut page, "research rust", &tx).await.unwrap();

        let contents: Vec<&str> = page.transcript.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["research rust", "Researching", "Saved the report."]);
        assert_eq!(page.report.as_ref().unwrap().content, "report body");
        assert_eq!(page.tool_history.len(), 2);

        let submitted = api.submitted.lock().unwrap().clone();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].0, "run_1");
        let ids: Vec<&str> = submitted[0].1.iter().map(|o| o.tool_call_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert!(submitted[0].1[1].output.starts_with("error:"));

        let updates = drain(&mut rx);
        assert!(updates.contains(&RenderUpdate::ToolCalls { names: vec!["save_file".into(), "make_coffee".into()] }));
        assert!(updates.contains(&RenderUpdate::Report { file_name: "research_report.txt".into() }));

        // a second turn reuses the assistant and thread
        research_turn(&api, &dispatcher(&dir), &spec, &mut page, "and more", &tx).await.unwrap();
        assert_eq!(api.created.load(Ordering::SeqCst), 1);
        assert_eq!(api.threads.load(Ordering::SeqCst), 1);
        assert_eq!(api.user_messages.lock().unwrap().clone(), vec!["research rust", "and more"]);
        assert_eq!(page.transcript.messages().last().unwrap().content, "Second answer");
    }

    #[tokio::test]
    async fn resumed_run_may_require_action_again() {
        let dir = tempdir().unwrap();
        let requires = |id: &str| {
            vec![RunEvent::RequiresAction(Continuation {
                thread_id: "thread_1".into(),
                run_id: "run_1".into(),
                tool_calls: vec![call(id, "save_file", &format!(r#"{{"text":"draft {}"}}"#, id))],
            })]
        };
        let api = AssistantsFake::with_runs(vec![requires("c1"), requires("c2"), deltas(&["Both drafts saved."])]);
        let spec = research_assistant_spec(&AppConfig::default());
        let mut page = ResearchPage::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        research_turn(&api, &dispatcher(&dir), &spec, &mut page, "write twice", &tx).await.unwrap();

        let submitted = api.submitted.lock().unwrap().clone();
        assert_eq!(submitted.len(), 2);
        assert!(submitted.iter().all(|(run, _)| run == "run_1"));
        assert_eq!(submitted[0].1[0].tool_call_id, "c1");
        assert_eq!(submitted[1].1[0].tool_call_id, "c2");

        let ai: Vec<&str> = page
            .transcript
            .messages()
            .iter()
            .filter(|m| m.role == Role::Ai)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(ai, vec!["Both drafts saved."]);
        assert_eq!(page.report.as_ref().unwrap().content, "draft c2");
        assert_eq!(page.tool_history.len(), 2);

        let tool_rounds = drain(&mut rx).into_iter().filter(|u| matches!(u, RenderUpdate::ToolCalls { .. })).count();
        assert_eq!(tool_rounds, 2);
    }

    #[tokio::test]
    async fn failed_run_discards_partial_text() {
        let dir = tempdir().unwrap();
        let api = AssistantsFake::with_runs(vec![vec![
            RunEvent::TextCreated,
            RunEvent::TextDelta("half an ans".into()),
            RunEvent::Failed("rate limit".into()),
        ]]);
        let spec = research_assistant_spec(&AppConfig::default());
        let mut page = ResearchPage::default();
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = research_turn(&api, &dispatcher(&dir), &spec, &mut page, "q", &tx).await.unwrap_err();
        assert!(err.to_string().contains("rate limit"));
        assert_eq!(page.transcript.len(), 1);
        assert!(page.thread.is_some());
    }
}
