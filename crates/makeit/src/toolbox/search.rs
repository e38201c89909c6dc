use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use super::Toolbox;
use crate::errors::{AgentError, AgentResult};
use crate::models::content::Content;
use crate::models::tool::{Tool, ToolCall};

pub const DEFAULT_SEARCH_HOST: &str = "https://api.tavily.com";

#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    pub host: String,
    pub api_key: String,
    pub max_results: u32,
}

impl SearchConfig {
    pub fn new<S: Into<String>>(api_key: S) -> Self {
        Self {
            host: DEFAULT_SEARCH_HOST.to_string(),
            api_key: api_key.into(),
            max_results: 1,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

/// Web search backed by the Tavily search API
pub struct WebSearch {
    client: Client,
    config: SearchConfig,
    tools: Vec<Tool>,
}

impl WebSearch {
    pub fn new(config: SearchConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        let search_tool = Tool::new(
            "search",
            "Search the internet for up-to-date information. \
            Returns the title, URL and an extract of the best matching pages.",
            json!({
                "type": "object",
                "required": ["query"],
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query."
                    }
                }
            }),
        );

        Ok(Self {
            client,
            config,
            tools: vec![search_tool],
        })
    }

    async fn search(&self, params: Value) -> AgentResult<Vec<Content>> {
        let query = params
            .get("query")
            .and_then(|v| v.as_str())
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| AgentError::InvalidParameters("Missing 'query' parameter".into()))?;

        let url = format!("{}/search", self.config.host.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "api_key": self.config.api_key,
                "query": query,
                "max_results": self.config.max_results,
            }))
            .send()
            .await
            .map_err(|e| AgentError::ExecutionError(format!("Search request failed: {}", e)))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(AgentError::ExecutionError(format!(
                "Search returned {}",
                status
            )));
        }

        let body: SearchResponse = response.json().await.map_err(|e| {
            AgentError::ExecutionError(format!("Could not read search response: {}", e))
        })?;

        tracing::debug!(query, hits = body.results.len(), "web search finished");
        if body.results.is_empty() {
            return Ok(vec![Content::text("No results found.")]);
        }

        Ok(body
            .results
            .into_iter()
            .map(|hit| Content::text(format!("{}\n{}\n{}", hit.title, hit.url, hit.content)))
            .collect())
    }
}

#[async_trait]
impl Toolbox for WebSearch {
    fn name(&self) -> &str {
        "web"
    }

    fn tools(&self) -> &[Tool] {
        &self.tools
    }

    async fn call(&self, tool_call: ToolCall) -> AgentResult<Vec<Content>> {
        match tool_call.name.as_str() {
            "search" => self.search(tool_call.arguments).await,
            _ => Err(AgentError::ToolNotFound(tool_call.name)),
        }
    }
}
