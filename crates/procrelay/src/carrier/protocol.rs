//! Wire types of the carrier message protocol.
//!
//! Requests are `{id, verb, command?, useSandbox?, input?}`, replies are
//! `{id, action, data, isSuccess?}`. Control messages `{"control": ...}`
//! change only the carrier's own posture.

use crate::executor::ExecResult;
use procrelay_core::ProcessEvent;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Verb {
    Start,
    Write,
    Stop,
    IsRunning,
    Exec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default)]
    pub id: String,
    pub verb: Verb,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_sandbox: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

impl Request {
    pub fn new(id: impl Into<String>, verb: Verb) -> Self {
        Self {
            id: id.into(),
            verb,
            command: None,
            use_sandbox: None,
            input: None,
        }
    }

    pub fn start(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(id, Verb::Start).with_command(command)
    }

    pub fn exec(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(id, Verb::Exec).with_command(command)
    }

    pub fn write(id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            input: Some(input.into()),
            ..Self::new(id, Verb::Write)
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_sandbox(mut self, sandboxed: bool) -> Self {
        self.use_sandbox = Some(sandboxed);
        self
    }

    pub fn sandboxed(&self) -> bool {
        self.use_sandbox.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyAction {
    #[serde(rename = "stdout")]
    Stdout,
    #[serde(rename = "stderr")]
    Stderr,
    #[serde(rename = "exit")]
    Exit,
    #[serde(rename = "isRunning")]
    IsRunning,
    #[serde(rename = "exec_result")]
    ExecResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub id: String,
    pub action: ReplyAction,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_success: Option<bool>,
}

impl Reply {
    pub fn new(id: impl Into<String>, action: ReplyAction, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action,
            data: data.into(),
            is_success: None,
        }
    }

    pub fn exec_result(id: impl Into<String>, result: &ExecResult) -> Self {
        let data = if result.is_success() {
            result.stdout.clone()
        } else {
            result.error_message()
        };

        Self {
            is_success: Some(result.is_success()),
            ..Self::new(id, ReplyAction::ExecResult, data)
        }
    }

    pub fn exec_exception(id: impl Into<String>, message: &str) -> Self {
        Self {
            is_success: Some(false),
            ..Self::new(id, ReplyAction::ExecResult, format!("Exception: {message}"))
        }
    }

    /// Replies carrying one process event. An error becomes a `stderr`
    /// line followed by `exit` 1.
    pub fn from_event(id: &str, event: &ProcessEvent) -> Vec<Reply> {
        match event {
            ProcessEvent::Stdout(line) => vec![Reply::new(id, ReplyAction::Stdout, line.as_str())],
            ProcessEvent::Stderr(line) => vec![Reply::new(id, ReplyAction::Stderr, line.as_str())],
            ProcessEvent::Exit(code) => vec![Reply::new(id, ReplyAction::Exit, code.to_string())],
            ProcessEvent::Error(message) => vec![
                Reply::new(id, ReplyAction::Stderr, message.as_str()),
                Reply::new(id, ReplyAction::Exit, "1"),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlAction {
    ExitCarrier,
    EnterBackground,
    EnterForeground,
    ToggleWakeLock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub control: ControlAction,
}

/// Anything a client may send to the carrier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    Control(ControlMessage),
    Request(Request),
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
