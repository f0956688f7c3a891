//! Scripted model and fake gateway for engine tests.

#![allow(dead_code)]

use freya_bus::{Listener, MessageBus};
use freya_llm::{ChatMessage, ChatReply, ModelClient, ModelError, ToolCall, ToolSpec};
use freya_types::{topics, Arguments, RegistrySnapshot, ToolCallRequest, ToolCallResult, ToolDescriptor};
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// One scripted model completion.
#[derive(Debug, Clone)]
pub enum Step {
    /// Plain assistant answer.
    Text(String),
    /// Assistant asks for these tool calls.
    Tools(Vec<ToolCall>),
    /// HTTP error status.
    Status(u16),
    /// Never completes.
    Hang,
}

pub fn text(content: &str) -> Step {
    Step::Text(content.to_string())
}

pub fn call(name: &str, arguments: Value) -> ToolCall {
    ToolCall::new(name, arguments)
}

#[derive(Clone)]
pub struct ScriptedModel {
    steps: Arc<Mutex<VecDeque<Step>>>,
    otherwise: Step,
    requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    offered: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ScriptedModel {
    /// Plays `steps` in order, then answers "done" forever.
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into())),
            otherwise: text("done"),
            requests: Arc::new(Mutex::new(Vec::new())),
            offered: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Plays `step` on every call.
    pub fn repeating(step: Step) -> Self {
        Self {
            otherwise: step,
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Messages sent on each call.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }

    /// Tool names offered on each call.
    pub fn offered_tools(&self) -> Vec<Vec<String>> {
        self.offered.lock().unwrap().clone()
    }
}

impl ModelClient for ScriptedModel {
    fn chat<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        tools: &'a [ToolSpec],
    ) -> BoxFuture<'a, Result<ChatReply, ModelError>> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.offered
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.function.name.clone()).collect());
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.otherwise.clone());

        Box::pin(async move {
            match step {
                Step::Text(content) => Ok(ChatReply::new(ChatMessage::assistant(content))),
                Step::Tools(calls) => Ok(ChatReply {
                    message: ChatMessage::assistant("").with_tool_calls(calls),
                    eval_count: Some(7),
                }),
                Step::Status(status) => Err(ModelError::Status {
                    status,
                    body: "scripted failure".to_string(),
                }),
                Step::Hang => std::future::pending().await,
            }
        })
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

/// Publishes a retained registry with one tool per name.
pub fn publish_registry(bus: &MessageBus, names: &[&str]) {
    let tools = names
        .iter()
        .map(|name| ToolDescriptor {
            name: name.to_string(),
            description: format!("{name} tool"),
            input_schema: json!({
                "type": "object",
                "properties": { "city": { "type": "string" } },
            }),
            provider_id: "fake".to_string(),
        })
        .collect();
    bus.publish_json_retained(
        topics::TOOL_REGISTRY,
        &RegistrySnapshot::new(tools, vec!["fake".to_string()]),
    )
    .unwrap();
}

type Handler = dyn Fn(&str, &Arguments) -> Option<Result<Value, String>> + Send + Sync;

/// Answers `tool.call.request` messages the way the gateway does.
pub struct FakeGateway {
    requests: Arc<Mutex<Vec<ToolCallRequest>>>,
    _listener: Listener,
}

impl FakeGateway {
    /// `handler` returns the tool output or error, or `None` to never
    /// answer.
    pub fn serve<F>(bus: &MessageBus, handler: F) -> Self
    where
        F: Fn(&str, &Arguments) -> Option<Result<Value, String>> + Send + Sync + 'static,
    {
        let handler: Arc<Handler> = Arc::new(handler);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let replies = bus.clone();
        let listener = bus
            .listen(topics::TOOL_CALL_REQUEST, move |envelope| {
                let request: ToolCallRequest = serde_json::from_value(envelope.payload).unwrap();
                seen.lock().unwrap().push(request.clone());
                let result = match handler(&request.tool_name, &request.arguments) {
                    Some(Ok(value)) => {
                        Some(ToolCallResult::success(&request.request_id, &request.tool_name, value, 0.01))
                    }
                    Some(Err(error)) => {
                        Some(ToolCallResult::failure(&request.request_id, &request.tool_name, error, 0.01))
                    }
                    None => None,
                };
                if let Some(result) = result {
                    replies.publish_json(topics::TOOL_CALL_RESULT, &result).unwrap();
                }
                std::future::ready(())
            })
            .unwrap();

        Self {
            requests,
            _listener: listener,
        }
    }

    pub fn requests(&self) -> Vec<ToolCallRequest> {
        self.requests.lock().unwrap().clone()
    }
}
