use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised at the tool boundary. These are carried inside tool-result
/// messages so the model can see and react to them.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AgentError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionError(String),
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Failures of the durable key-value store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("No item in {table} for key {key}")]
    NotFound { table: String, key: String },

    #[error("Store backend failed: {0}")]
    Backend(String),

    #[error("Malformed item: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn not_found(table: &str, key: &str) -> Self {
        StoreError::NotFound {
            table: table.to_string(),
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Malformed(err.to_string())
    }
}

/// Errors that end a conversational turn.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TurnError {
    #[error("Bad request: missing or invalid field `{0}`")]
    InvalidInput(String),

    #[error("Model invocation failed: {0}")]
    ModelInvocation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to render prompt: {0}")]
    Prompt(String),
}

pub type TurnResult<T> = Result<T, TurnError>;
