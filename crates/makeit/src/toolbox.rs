mod search;

pub use search::{SearchConfig, WebSearch, DEFAULT_SEARCH_HOST};

use async_trait::async_trait;

use crate::errors::AgentResult;
use crate::models::content::Content;
use crate::models::tool::{Tool, ToolCall};

/// A named group of tools the turn controller can offer to the model.
///
/// Tools are declared to the model as `<toolbox>__<tool>`; `call` receives the
/// unprefixed name.
#[async_trait]
pub trait Toolbox: Send + Sync {
    /// Get the name of the toolbox, used as the tool name prefix
    fn name(&self) -> &str;

    /// Get available tools
    fn tools(&self) -> &[Tool];

    /// Call a tool with the given parameters
    async fn call(&self, tool_call: ToolCall) -> AgentResult<Vec<Content>>;
}
