pub mod llama_cpp;
pub mod mlx_lm;
pub mod vllm;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// Identifies which `CommandSpec` implementation interprets an instance's
/// `backend_options`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    LlamaCpp,
    MlxLm,
    Vllm,
}

#[derive(Debug, Error)]
pub enum CommandSpecError {
    #[error("missing required option {0:?}")]
    MissingOption(&'static str),
    #[error("option {0:?} must be a string")]
    NotAString(&'static str),
}

/// Everything a `ProcessSupervisor` needs to launch a backend's child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<String>,
    /// Path polled by the health prober, relative to the child's own `127.0.0.1:<port>`.
    pub health_path: String,
}

/// Produces a `CommandPlan` from a backend's opaque `backend_options` JSON blob.
///
/// Implementations never need to understand instance lifecycle, ports beyond
/// the one they're given, or anything about the registry — they translate
/// options into an argv the same way every time.
pub trait CommandSpec {
    fn build(&self, port: u16, options: &serde_json::Value) -> Result<CommandPlan, CommandSpecError>;
}

/// Look up the reference `CommandSpec` implementation for a backend type.
pub fn command_spec_for(backend_type: BackendType) -> Box<dyn CommandSpec + Send + Sync> {
    match backend_type {
        BackendType::LlamaCpp => Box::new(llama_cpp::LlamaCpp),
        BackendType::MlxLm => Box::new(mlx_lm::MlxLm),
        BackendType::Vllm => Box::new(vllm::Vllm),
    }
}

fn require_str<'a>(options: &'a serde_json::Value, key: &'static str) -> Result<&'a str, CommandSpecError> {
    match options.get(key) {
        None | Some(serde_json::Value::Null) => Err(CommandSpecError::MissingOption(key)),
        Some(v) => v.as_str().ok_or(CommandSpecError::NotAString(key)),
    }
}

fn optional_str<'a>(options: &'a serde_json::Value, key: &'static str) -> Option<&'a str> {
    options.get(key).and_then(|v| v.as_str())
}

/// Extra free-form flags: `{"extra_args": ["--flag", "value", ...]}`.
fn extra_args(options: &serde_json::Value) -> Vec<String> {
    options
        .get("extra_args")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn extra_env(options: &serde_json::Value) -> Vec<(String, String)> {
    options
        .get("env")
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
