use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::base::{message_to_deltas, Delta, DeltaStream, Provider, Usage};
use crate::models::message::Message;
use crate::models::tool::Tool;

/// One invocation observed by the [`MockProvider`]
#[derive(Debug, Clone)]
pub struct MockCall {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
}

#[derive(Debug, Clone)]
enum Fault {
    /// The call fails before producing anything
    Fail(String),
    /// The stream yields the scripted text, then fails
    BreakAfterText(String),
}

/// A mock provider that returns pre-configured responses for testing
#[derive(Clone, Default)]
pub struct MockProvider {
    responses: Arc<Mutex<Vec<Message>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    faults: Arc<Mutex<HashMap<usize, Fault>>>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses
    pub fn new(responses: Vec<Message>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Default::default()
        }
    }

    /// Make the n-th invocation (0-based) fail before producing output
    pub fn failing_on_call<S: Into<String>>(self, call: usize, error: S) -> Self {
        self.faults
            .lock()
            .unwrap()
            .insert(call, Fault::Fail(error.into()));
        self
    }

    /// Make the n-th invocation stream `text` and then fail
    pub fn breaking_on_call<S: Into<String>>(self, call: usize, text: S) -> Self {
        self.faults
            .lock()
            .unwrap()
            .insert(call, Fault::BreakAfterText(text.into()));
        self
    }

    /// Every invocation seen so far, in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, system: &str, messages: &[Message], tools: &[Tool]) -> usize {
        let mut calls = self.calls.lock().unwrap();
        calls.push(MockCall {
            system: system.to_string(),
            messages: messages.to_vec(),
            tools: tools.to_vec(),
        });
        calls.len() - 1
    }

    fn next_response(&self) -> Message {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            // Return empty response if no more pre-configured responses
            Message::assistant().with_text("")
        } else {
            responses.remove(0)
        }
    }

    fn fault(&self, call: usize) -> Option<Fault> {
        self.faults.lock().unwrap().get(&call).cloned()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<(Message, Usage)> {
        let call = self.record(system, messages, tools);
        match self.fault(call) {
            Some(Fault::Fail(error)) | Some(Fault::BreakAfterText(error)) => Err(anyhow!(error)),
            None => Ok((self.next_response(), Usage::default())),
        }
    }

    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<DeltaStream> {
        let call = self.record(system, messages, tools);
        match self.fault(call) {
            Some(Fault::Fail(error)) => Err(anyhow!(error)),
            Some(Fault::BreakAfterText(text)) => Ok(Box::pin(stream::iter(vec![
                Ok(Delta::Text(text)),
                Err(anyhow!("stream interrupted")),
            ]))),
            None => {
                let deltas = message_to_deltas(self.next_response());
                Ok(Box::pin(stream::iter(deltas.into_iter().map(Ok))))
            }
        }
    }
}
