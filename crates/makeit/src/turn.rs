use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;

use crate::errors::{AgentError, AgentResult, TurnError, TurnResult};
use crate::models::content::Content;
use crate::models::message::Message;
use crate::models::tool::{Tool, ToolCall};
use crate::prompt_template::finalize_prompt;
use crate::providers::base::{Delta, MessageAccumulator, Provider};
use crate::toolbox::Toolbox;

pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;

/// Which model invocation a delta came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The tool-aware call that decides what to do next
    Decide,
    /// The rewrite call whose output is the user-visible answer
    Final,
}

/// The result of a completed turn
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// The human message as sent to the model, client context included
    pub human: Message,
    /// The finalized answer. Carries the id of the draft it replaced.
    pub answer: Message,
    /// Everything the model saw this turn plus its replies, draft replaced by answer
    pub transcript: Vec<Message>,
    pub tool_rounds: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Delta { step: Step, delta: Delta },
    /// A message was added to the working sequence
    Appended(Message),
    Completed(TurnOutcome),
}

/// Everything the controller needs to run one turn
#[derive(Debug, Clone)]
pub struct TurnPrompt {
    pub system: String,
    pub history: Vec<Message>,
    pub human: Message,
}

impl TurnPrompt {
    pub fn new<S: Into<String>>(system: S, history: Vec<Message>, human: Message) -> Self {
        Self {
            system: system.into(),
            history,
            human,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnState {
    Deciding,
    /// Executing the requests carried by the message
    ExecutingTool(Message),
    /// Rewriting the message into the answer
    Finalizing(Message),
    Done(Message),
}

/// What the controller learned from the step it just ran
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Decided(Message),
    ToolsExecuted,
    Finalized(Message),
}

/// Next state given the outcome of the current step and the tool rounds already run
pub fn transition(observation: Observation, tool_rounds: usize, max_tool_rounds: usize) -> TurnState {
    match observation {
        Observation::Decided(message) => {
            if message.has_tool_requests() && tool_rounds < max_tool_rounds {
                TurnState::ExecutingTool(message)
            } else {
                TurnState::Finalizing(message)
            }
        }
        Observation::ToolsExecuted => TurnState::Deciding,
        Observation::Finalized(answer) => TurnState::Done(answer),
    }
}

fn model_error(err: anyhow::Error) -> TurnError {
    TurnError::ModelInvocation(err.to_string())
}

/// Drives one conversational turn: decide, run tools until none are requested, then finalize
pub struct TurnController {
    provider: Arc<dyn Provider>,
    toolboxes: Vec<Arc<dyn Toolbox>>,
    max_tool_rounds: usize,
}

impl TurnController {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            toolboxes: Vec::new(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    pub fn add_toolbox(&mut self, toolbox: Arc<dyn Toolbox>) {
        self.toolboxes.push(toolbox);
    }

    pub fn with_max_tool_rounds(mut self, max_tool_rounds: usize) -> Self {
        self.max_tool_rounds = max_tool_rounds;
        self
    }

    /// Get all tools from all toolboxes with proper toolbox prefixing
    pub fn tools(&self) -> Vec<Tool> {
        let mut tools = Vec::new();
        for toolbox in &self.toolboxes {
            for tool in toolbox.tools() {
                tools.push(Tool::new(
                    format!("{}__{}", toolbox.name(), tool.name),
                    &tool.description,
                    tool.input_schema.clone(),
                ));
            }
        }
        tools
    }

    fn toolbox_for_tool<'a>(&self, prefixed_name: &'a str) -> Option<(&dyn Toolbox, &'a str)> {
        let (toolbox_name, tool_name) = prefixed_name.split_once("__")?;
        self.toolboxes
            .iter()
            .find(|toolbox| toolbox.name() == toolbox_name)
            .map(|toolbox| (&**toolbox, tool_name))
    }

    /// Dispatch a single tool call to the appropriate toolbox
    async fn dispatch_tool_call(&self, tool_call: AgentResult<ToolCall>) -> AgentResult<Vec<Content>> {
        let call = tool_call?;
        let (toolbox, tool_name) = self
            .toolbox_for_tool(&call.name)
            .ok_or_else(|| AgentError::ToolNotFound(call.name.clone()))?;

        toolbox.call(ToolCall::new(tool_name, call.arguments)).await
    }

    /// Run the turn as a stream of events. The stream ends after
    /// [`TurnEvent::Completed`] or the first error.
    pub fn run(&self, prompt: TurnPrompt) -> BoxStream<'_, TurnResult<TurnEvent>> {
        Box::pin(async_stream::try_stream! {
            let tools = self.tools();
            let TurnPrompt { system, history, human } = prompt;
            let mut messages = history;
            messages.push(human.clone());

            let mut tool_rounds = 0;
            let mut state = TurnState::Deciding;

            loop {
                state = match state {
                    TurnState::Deciding => {
                        // Out of tool rounds: the model has to answer from the results it has
                        let offered: &[Tool] = if tool_rounds < self.max_tool_rounds {
                            &tools
                        } else {
                            &[]
                        };
                        let mut deltas = self
                            .provider
                            .stream(&system, &messages, offered)
                            .await
                            .map_err(model_error)?;

                        let mut accumulator = MessageAccumulator::new();
                        while let Some(delta) = deltas.next().await {
                            let delta = delta.map_err(model_error)?;
                            accumulator.push(&delta);
                            yield TurnEvent::Delta { step: Step::Decide, delta };
                        }

                        let decided = accumulator.finish();
                        messages.push(decided.clone());
                        yield TurnEvent::Appended(decided.clone());

                        let next = transition(
                            Observation::Decided(decided),
                            tool_rounds,
                            self.max_tool_rounds,
                        );
                        if let TurnState::Finalizing(message) = &next {
                            if message.has_tool_requests() {
                                tracing::warn!(
                                    tool_rounds,
                                    "model requested tools after the round limit, finalizing without them"
                                );
                            }
                        }
                        next
                    }
                    TurnState::ExecutingTool(request_message) => {
                        for request in request_message.tool_requests() {
                            let output = self.dispatch_tool_call(request.tool_call.clone()).await;
                            if let Err(e) = &output {
                                tracing::warn!(id = %request.id, error = %e, "tool call failed");
                            }
                            let result = Message::human().with_tool_response(request.id.clone(), output);
                            messages.push(result.clone());
                            yield TurnEvent::Appended(result);
                        }
                        tool_rounds += 1;
                        transition(Observation::ToolsExecuted, tool_rounds, self.max_tool_rounds)
                    }
                    TurnState::Finalizing(draft) => {
                        let instruction = finalize_prompt(&draft.text())
                            .map_err(|e| TurnError::Prompt(e.to_string()))?;
                        let mut deltas = self
                            .provider
                            .stream("", &[Message::human().with_text(instruction)], &[])
                            .await
                            .map_err(model_error)?;

                        let mut text = String::new();
                        while let Some(delta) = deltas.next().await {
                            let delta = delta.map_err(model_error)?;
                            if let Delta::Text(chunk) = &delta {
                                text.push_str(chunk);
                            }
                            yield TurnEvent::Delta { step: Step::Final, delta };
                        }

                        let answer = Message::assistant().with_id(draft.id.clone()).with_text(text);
                        if let Some(slot) = messages.iter_mut().rev().find(|m| m.id == draft.id) {
                            *slot = answer.clone();
                        }
                        transition(Observation::Finalized(answer), tool_rounds, self.max_tool_rounds)
                    }
                    TurnState::Done(answer) => {
                        tracing::debug!(tool_rounds, "turn completed");
                        yield TurnEvent::Completed(TurnOutcome {
                            human: human.clone(),
                            answer,
                            transcript: std::mem::take(&mut messages),
                            tool_rounds,
                        });
                        break;
                    }
                };
            }
        })
    }
}
