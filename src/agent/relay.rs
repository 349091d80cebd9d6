//! Streaming relay: folds a hosted run's event stream into rendered text and
//! saved transcript messages.

use futures::stream::BoxStream;
use serde::Serialize;
use tracing::{debug, warn};

use crate::session::{Message, Role, Transcript};

pub type RunEventStream = BoxStream<'static, anyhow::Result<RunEvent>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub function_name: String,
    /// Raw JSON arguments as sent by the provider.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// Where a suspended run picks up again once its tool calls are answered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Continuation {
    pub thread_id: String,
    pub run_id: String,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    TextCreated,
    TextDelta(String),
    TextDone,
    RequiresAction(Continuation),
    Completed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayState {
    Idle,
    TextOpen { buffer: String },
    AwaitingToolResult { run_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutput {
    Opened,
    /// Full text of the open turn so far.
    Render(String),
    Saved(Message),
    Suspended(Continuation),
    Finished,
    Ignored,
}

#[derive(Debug)]
pub struct StreamingRelay {
    state: RelayState,
}

impl Default for StreamingRelay {
    fn default() -> Self { Self::new() }
}

impl StreamingRelay {
    pub fn new() -> Self { Self { state: RelayState::Idle } }

    pub fn state(&self) -> &RelayState { &self.state }

    pub fn apply(&mut self, event: RunEvent, transcript: &mut Transcript) -> anyhow::Result<Vec<RelayOutput>> {
        let state = std::mem::replace(&mut self.state, RelayState::Idle);
        let (next, out) = match (state, event) {
            (RelayState::TextOpen { buffer }, RunEvent::TextCreated) => {
                // a new text block closes the previous one
                let mut out = Vec::new();
                if !buffer.is_empty() {
                    out.push(RelayOutput::Saved(transcript.append(Role::Ai, buffer)));
                }
                out.push(RelayOutput::Opened);
                (RelayState::TextOpen { buffer: String::new() }, out)
            }
            (_, RunEvent::TextCreated) => (RelayState::TextOpen { buffer: String::new() }, vec![RelayOutput::Opened]),
            (RelayState::TextOpen { mut buffer }, RunEvent::TextDelta(delta)) => {
                buffer.push_str(&delta);
                let render = RelayOutput::Render(buffer.clone());
                (RelayState::TextOpen { buffer }, vec![render])
            }
            (_, RunEvent::TextDelta(delta)) => {
                warn!("text delta before text start; opening implicitly");
                (RelayState::TextOpen { buffer: delta.clone() }, vec![RelayOutput::Opened, RelayOutput::Render(delta)])
            }
            (RelayState::TextOpen { buffer }, RunEvent::TextDone) => {
                let mut out = Vec::new();
                if !buffer.is_empty() {
                    out.push(RelayOutput::Saved(transcript.append(Role::Ai, buffer)));
                }
                (RelayState::Idle, out)
            }
            (s, RunEvent::TextDone) => {
                debug!("text done with no open text");
                (s, vec![RelayOutput::Ignored])
            }
            (s, RunEvent::RequiresAction(cont)) => {
                let mut out = Vec::new();
                if let RelayState::TextOpen { buffer } = s {
                    if !buffer.is_empty() {
                        out.push(RelayOutput::Saved(transcript.append(Role::Ai, buffer)));
                    }
                }
                let run_id = cont.run_id.clone();
                out.push(RelayOutput::Suspended(cont));
                (RelayState::AwaitingToolResult { run_id }, out)
            }
            (RelayState::TextOpen { buffer }, RunEvent::Completed) => {
                let mut out = Vec::new();
                if !buffer.is_empty() {
                    out.push(RelayOutput::Saved(transcript.append(Role::Ai, buffer)));
                }
                out.push(RelayOutput::Finished);
                (RelayState::Idle, out)
            }
            (_, RunEvent::Completed) => (RelayState::Idle, vec![RelayOutput::Finished]),
            (_, RunEvent::Failed(reason)) => anyhow::bail!("run failed: {}", reason),
        };
        self.state = next;
        Ok(out)
    }

    /// Clears the tool wait after outputs for `run_id` were submitted.
    pub fn resume(&mut self, run_id: &str) -> anyhow::Result<()> {
        match &self.state {
            RelayState::AwaitingToolResult { run_id: waiting } if waiting == run_id => {
                self.state = RelayState::Idle;
                Ok(())
            }
            other => anyhow::bail!("cannot resume run {} from state {:?}", run_id, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deltas(parts: &[&str]) -> Vec<RunEvent> {
        let mut v = vec![RunEvent::TextCreated];
        v.extend(parts.iter().map(|p| RunEvent::TextDelta(p.to_string())));
        v.push(RunEvent::TextDone);
        v
    }

    #[test]
    fn renders_prefixes_and_saves_one_message() {
        let parts = ["The ", "answer ", "is ", "42."];
        let mut relay = StreamingRelay::new();
        let mut transcript = Transcript::default();
        let mut rendered = Vec::new();
        for ev in deltas(&parts) {
            for out in relay.apply(ev, &mut transcript).unwrap() {
                if let RelayOutput::Render(s) = out { rendered.push(s) }
            }
        }
        for (i, r) in rendered.iter().enumerate() {
            assert_eq!(r, &parts[..=i].concat());
        }
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript.messages()[0].content, "The answer is 42.");
        assert_eq!(transcript.messages()[0].role, Role::Ai);
        assert_eq!(relay.state(), &RelayState::Idle);
    }

    #[test]
    fn suspends_on_required_action_and_resumes() {
        let mut relay = StreamingRelay::new();
        let mut transcript = Transcript::default();
        let cont = Continuation {
            thread_id: "thread_1".into(),
            run_id: "run_1".into(),
            tool_calls: vec![ToolCall { id: "call_1".into(), function_name: "save_file".into(), arguments: "{}".into() }],
        };
        let out = relay.apply(RunEvent::RequiresAction(cont.clone()), &mut transcript).unwrap();
        assert_eq!(out, vec![RelayOutput::Suspended(cont)]);
        assert!(relay.resume("run_other").is_err());
        relay.resume("run_1").unwrap();
        assert_eq!(relay.state(), &RelayState::Idle);
        assert!(transcript.is_empty());
    }

    #[test]
    fn partial_text_is_kept_before_tool_use() {
        let mut relay = StreamingRelay::new();
        let mut transcript = Transcript::default();
        relay.apply(RunEvent::TextCreated, &mut transcript).unwrap();
        relay.apply(RunEvent::TextDelta("Searching".into()), &mut transcript).unwrap();
        let cont = Continuation { thread_id: "t".into(), run_id: "r".into(), tool_calls: vec![] };
        relay.apply(RunEvent::RequiresAction(cont), &mut transcript).unwrap();
        assert_eq!(transcript.messages()[0].content, "Searching");
    }

    #[test]
    fn delta_without_start_opens_implicitly() {
        let mut relay = StreamingRelay::new();
        let mut transcript = Transcript::default();
        let out = relay.apply(RunEvent::TextDelta("x".into()), &mut transcript).unwrap();
        assert_eq!(out, vec![RelayOutput::Opened, RelayOutput::Render("x".into())]);
        relay.apply(RunEvent::Completed, &mut transcript).unwrap();
        assert_eq!(transcript.len(), 1);
    }

    #[test]
    fn empty_text_blocks_are_not_saved() {
        let mut relay = StreamingRelay::new();
        let mut transcript = Transcript::default();
        relay.apply(RunEvent::TextCreated, &mut transcript).unwrap();
        assert!(relay.apply(RunEvent::TextDone, &mut transcript).unwrap().is_empty());
        relay.apply(RunEvent::TextCreated, &mut transcript).unwrap();
        let out = relay.apply(RunEvent::Completed, &mut transcript).unwrap();
        assert_eq!(out, vec![RelayOutput::Finished]);
        assert!(transcript.is_empty());
        assert_eq!(relay.state(), &RelayState::Idle);
    }

    #[test]
    fn failure_discards_open_text() {
        let mut relay = StreamingRelay::new();
        let mut transcript = Transcript::default();
        relay.apply(RunEvent::TextCreated, &mut transcript).unwrap();
        relay.apply(RunEvent::TextDelta("half".into()), &mut transcript).unwrap();
        let err = relay.apply(RunEvent::Failed("server_error".into()), &mut transcript).unwrap_err();
        assert!(err.to_string().contains("server_error"));
        assert!(transcript.is_empty());
        assert_eq!(relay.state(), &RelayState::Idle);
    }
}
