use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which kind of human decision an interactive session collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultKind {
    #[serde(alias = "envSelection", alias = "envId")]
    EnvironmentSelection,
    Clarification,
    Confirmation,
}

impl ResultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultKind::EnvironmentSelection => "environmentSelection",
            ResultKind::Clarification => "clarification",
            ResultKind::Confirmation => "confirmation",
        }
    }
}

/// Outcome of an interactive handoff, returned to the tool call that asked.
///
/// Timeouts, explicit cancels and superseded waits all come back as a
/// successful result with `cancelled` set; the cause only shows up in logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveResult {
    #[serde(rename = "type")]
    pub kind: ResultKind,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub switch_requested: bool,
}

impl InteractiveResult {
    pub fn submitted(kind: ResultKind, data: Value) -> Self {
        Self {
            kind,
            data,
            cancelled: false,
            switch_requested: false,
        }
    }

    pub fn cancelled(kind: ResultKind) -> Self {
        Self {
            kind,
            data: Value::Null,
            cancelled: true,
            switch_requested: false,
        }
    }

    pub fn switch_account(kind: ResultKind) -> Self {
        Self {
            kind,
            data: Value::Null,
            cancelled: false,
            switch_requested: true,
        }
    }

    /// Selected environment id, when the payload carries one.
    pub fn env_id(&self) -> Option<&str> {
        self.data
            .get("envId")
            .or_else(|| self.data.get("env_id"))
            .and_then(Value::as_str)
            .or_else(|| self.data.as_str())
            .filter(|value| !value.trim().is_empty())
    }
}

/// One selectable environment shown on the setup page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvCandidate {
    pub env_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Why the setup page is being shown again, if a previous attempt failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_url: Option<String>,
}
