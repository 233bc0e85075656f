use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RequestError;
use crate::location::Location;

/// Everything that travels over the wire, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Event(_) => "event",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: u64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Request {
    pub fn new(seq: u64, command: impl Into<String>, arguments: Option<Value>) -> Self {
        Self {
            seq,
            command: command.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_seq: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn success(request_seq: u64, body: Option<Value>) -> Self {
        Self {
            request_seq,
            success: true,
            body,
            message: None,
        }
    }

    pub fn error(request_seq: u64, message: impl Into<String>) -> Self {
        Self {
            request_seq,
            success: false,
            body: None,
            message: Some(message.into()),
        }
    }
}

/// Notifications sent by the engine, tagged by `event` with the payload under `body`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "body", rename_all = "camelCase")]
pub enum Event {
    Stopped(StoppedEvent),
    Continued(ContinuedEvent),
    Thread(ThreadEvent),
    Terminated(TerminatedEvent),
    Output(OutputEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    Breakpoint,
    Step,
    StepIn,
    StepOut,
    Exception,
    Pause,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoppedEvent {
    pub reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub depth: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuedEvent {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadReason {
    New,
    Exited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadEvent {
    pub reason: ThreadReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminatedEvent {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub category: String,
    pub output: String,
}

/// A single frame as reported by `backtrace`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    pub id: usize,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

/// A named value as reported by `locals` and `closureVariables`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            type_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameArguments {
    #[serde(default)]
    pub frame_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateArguments {
    #[serde(default)]
    pub frame_index: usize,
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBreakpoint {
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

/// A breakpoint as acknowledged in the `setBreakpoints` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetBreakpointsArguments {
    pub file: String,
    #[serde(default)]
    pub breakpoints: Vec<SourceBreakpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetExceptionBreakpointsArguments {
    pub enabled: bool,
}

/// Commands the engine understands, decoded from a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Backtrace,
    Locals(FrameArguments),
    ClosureVariables(FrameArguments),
    Evaluate(EvaluateArguments),
    SetBreakpoints(SetBreakpointsArguments),
    SetExceptionBreakpoints(SetExceptionBreakpointsArguments),
    Continue,
    Next,
    StepIn,
    StepOut,
    Pause,
    Disconnect,
}

impl Command {
    pub fn from_request(request: &Request) -> Result<Self, RequestError> {
        let command = match request.command.as_str() {
            "backtrace" | "stackTrace" => Command::Backtrace,
            "locals" => Command::Locals(arguments(request)?),
            "closureVariables" => Command::ClosureVariables(arguments(request)?),
            "evaluate" => Command::Evaluate(arguments(request)?),
            "setBreakpoints" => Command::SetBreakpoints(arguments(request)?),
            "setExceptionBreakpoints" => Command::SetExceptionBreakpoints(arguments(request)?),
            "continue" => Command::Continue,
            "next" | "step" => Command::Next,
            "stepIn" => Command::StepIn,
            "stepOut" => Command::StepOut,
            "pause" => Command::Pause,
            "disconnect" => Command::Disconnect,
            other => return Err(RequestError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Backtrace => "backtrace",
            Command::Locals(_) => "locals",
            Command::ClosureVariables(_) => "closureVariables",
            Command::Evaluate(_) => "evaluate",
            Command::SetBreakpoints(_) => "setBreakpoints",
            Command::SetExceptionBreakpoints(_) => "setExceptionBreakpoints",
            Command::Continue => "continue",
            Command::Next => "next",
            Command::StepIn => "stepIn",
            Command::StepOut => "stepOut",
            Command::Pause => "pause",
            Command::Disconnect => "disconnect",
        }
    }

    /// Requests that may be applied while the program keeps running.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Command::SetBreakpoints(_) | Command::SetExceptionBreakpoints(_) | Command::Disconnect
        )
    }
}

fn arguments<T: DeserializeOwned>(request: &Request) -> Result<T, RequestError> {
    let value = request
        .arguments
        .clone()
        .unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(value).map_err(|e| RequestError::InvalidArguments {
        command: request.command.clone(),
        reason: e.to_string(),
    })
}
