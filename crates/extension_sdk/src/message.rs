use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};

/// Action names the core itself understands. Everything else is opaque
/// extension API traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "camelCase")]
pub enum CoreAction {
    // Manager operations (host → manager)
    Load,
    Unload,
    List,

    // Context → host
    Render,

    // Manager → host
    SessionTerminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema, EnumString, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CommandMode {
    #[default]
    View,
    NoView,
    MenuBar,
}

impl CommandMode {
    /// Only UI-bearing commands run a render loop.
    pub fn renders(&self) -> bool {
        matches!(self, CommandMode::View | CommandMode::MenuBar)
    }
}

/// Parameters of `load`. The same record is handed, uninterpreted, to the
/// execution context as its init record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadParams {
    pub entrypoint: String,
    #[serde(default)]
    pub preferences: Map<String, Value>,
    #[serde(default)]
    pub launch_arguments: Map<String, Value>,
    #[serde(default)]
    pub mode: CommandMode,
}

pub type InitContext = LoadParams;

impl LoadParams {
    pub fn new(entrypoint: impl Into<String>, mode: CommandMode) -> Self {
        Self { entrypoint: entrypoint.into(), mode, ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnloadParams {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub entrypoint: String,
    pub mode: CommandMode,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionTerminated {
    pub session_id: String,
    pub reason: String,
}

/// One node of a committed UI tree. Contains no live callables: callback
/// props are replaced by their handler id string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SerializedInstance {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    #[serde(default)]
    pub children: Vec<SerializedInstance>,
}

/// Payload of the `render` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RenderCommit {
    pub root: SerializedInstance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive usable with `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
