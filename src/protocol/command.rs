//! One-shot command requests and their correlated responses

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Actions the command gateway knows how to perform.
///
/// On the wire this is the `action`/`args` pair of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "args", rename_all = "camelCase")]
pub enum CommandAction {
    /// Run an arbitrary shell command
    Exec { command: String },
    /// Fetch details of a container
    Inspect {
        #[serde(rename = "targetId")]
        target_id: String,
    },
    /// Start a container
    StartContainer {
        #[serde(rename = "targetId")]
        target_id: String,
    },
    /// Stop a container
    StopContainer {
        #[serde(rename = "targetId")]
        target_id: String,
    },
    /// Static host information
    SystemInfo {},
    /// All containers on the host
    ListContainers {},
    /// Raw listing of pending OS package updates
    ListUpdates {},
    /// Upgrade one OS package
    ApplyUpdate { package: String },
    /// Upgrade every OS package
    ApplyAllUpdates {},
}

impl CommandAction {
    /// Every action name this build understands
    pub const NAMES: [&'static str; 9] = [
        "exec",
        "inspect",
        "startContainer",
        "stopContainer",
        "systemInfo",
        "listContainers",
        "listUpdates",
        "applyUpdate",
        "applyAllUpdates",
    ];

    /// Wire name of the action
    pub fn name(&self) -> &'static str {
        match self {
            Self::Exec { .. } => "exec",
            Self::Inspect { .. } => "inspect",
            Self::StartContainer { .. } => "startContainer",
            Self::StopContainer { .. } => "stopContainer",
            Self::SystemInfo {} => "systemInfo",
            Self::ListContainers {} => "listContainers",
            Self::ListUpdates {} => "listUpdates",
            Self::ApplyUpdate { .. } => "applyUpdate",
            Self::ApplyAllUpdates {} => "applyAllUpdates",
        }
    }

    /// Reject requests that would reach the executor with empty arguments
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::Exec { command } if command.trim().is_empty() => {
                Err("command required".to_string())
            }
            Self::Inspect { target_id }
            | Self::StartContainer { target_id }
            | Self::StopContainer { target_id }
                if target_id.trim().is_empty() =>
            {
                Err("target id required".to_string())
            }
            Self::ApplyUpdate { package } if package.trim().is_empty() => {
                Err("package required".to_string())
            }
            // Handed to the package manager as an argument, never as an option
            Self::ApplyUpdate { package }
                if package.starts_with('-') || package.contains(char::is_whitespace) =>
            {
                Err(format!("invalid package name: {}", package))
            }
            _ => Ok(()),
        }
    }
}

/// Payload of a `request` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub correlation_key: String,
    pub action: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl CommandRequest {
    /// Build a request with a fresh correlation key
    pub fn new(action: &CommandAction) -> Result<Self> {
        Self::with_key(Uuid::new_v4().to_string(), action)
    }

    pub fn with_key(correlation_key: impl Into<String>, action: &CommandAction) -> Result<Self> {
        let mut tagged = serde_json::to_value(action)?;
        let args = tagged
            .get_mut("args")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Object(Default::default()));
        Ok(Self {
            correlation_key: correlation_key.into(),
            action: action.name().to_string(),
            args,
        })
    }

    /// Parse the typed action. Unknown actions and bad args are protocol errors.
    pub fn parse_action(&self) -> Result<CommandAction> {
        let args = if self.args.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            self.args.clone()
        };
        serde_json::from_value(serde_json::json!({ "action": self.action, "args": args }))
            .map_err(|e| Error::Protocol(format!("invalid {} request: {}", self.action, e)))
    }
}

/// Category of a failed command outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// Missing or malformed arguments
    InvalidRequest,
    /// Action not known to this agent
    Unsupported,
    /// The action exceeded its deadline
    Timeout,
    /// The executor reported an error
    Failed,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidRequest => "invalidRequest",
            Self::Unsupported => "unsupported",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Error outcome carried in a normal response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Payload of a `response` envelope. Exactly one of `ok`/`error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub correlation_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandFailure>,
}

impl CommandResponse {
    pub fn success(correlation_key: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            correlation_key: correlation_key.into(),
            ok: Some(result),
            error: None,
        }
    }

    pub fn failure(
        correlation_key: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            correlation_key: correlation_key.into(),
            ok: None,
            error: Some(CommandFailure {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Collapse into a result; a response with neither field is a success with `null`
    pub fn into_result(self) -> std::result::Result<serde_json::Value, CommandFailure> {
        match self.error {
            Some(failure) => Err(failure),
            None => Ok(self.ok.unwrap_or(serde_json::Value::Null)),
        }
    }
}
