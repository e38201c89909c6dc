use crate::error::{to_env_var, ConfigError};
use config::{Config, Environment};
use makeit::history::Tables;
use makeit::providers::configs::OpenAiProviderConfig;
use makeit::toolbox::{SearchConfig, DEFAULT_SEARCH_HOST};
use makeit::turn::DEFAULT_MAX_TOOL_ROUNDS;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Default, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerSettings {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_openai_host")]
    pub host: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
}

impl ProviderSettings {
    pub fn into_config(self) -> OpenAiProviderConfig {
        OpenAiProviderConfig {
            host: self.host,
            api_key: self.api_key,
            model: self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchSettings {
    #[serde(default = "default_search_host")]
    pub host: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

impl SearchSettings {
    pub fn into_config(self) -> SearchConfig {
        SearchConfig {
            host: self.host,
            api_key: self.api_key,
            max_results: self.max_results,
        }
    }
}

#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum StoreSettings {
    #[default]
    Memory,
    File { root: PathBuf },
}

#[derive(Debug, Deserialize)]
pub struct TableSettings {
    #[serde(default = "default_sessions_table")]
    pub sessions: String,
    #[serde(default = "default_users_table")]
    pub users: String,
}

impl TableSettings {
    pub fn into_tables(self) -> Tables {
        Tables {
            sessions: self.sessions,
            users: self.users,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    pub provider: ProviderSettings,
    pub search: SearchSettings,
    #[serde(default)]
    pub store: StoreSettings,
    pub tables: TableSettings,
    pub agent: AgentSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load_and_validate()
    }

    fn load_and_validate() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("provider.host", default_openai_host())?
            .set_default("provider.model", default_model())?
            .set_default("search.host", default_search_host())?
            .set_default("search.max_results", default_max_results())?
            .set_default("store.type", "memory")?
            .set_default("tables.sessions", default_sessions_table())?
            .set_default("tables.users", default_users_table())?
            .set_default("agent.max_tool_rounds", default_max_tool_rounds() as u64)?
            // Layer on the environment variables
            .add_source(
                Environment::with_prefix("MAKEIT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = match config.try_deserialize() {
            Ok(settings) => settings,
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);

                let error_str = err.to_string();
                return if error_str.starts_with("missing field") {
                    // "missing field `root`"
                    let field = error_str
                        .trim_start_matches("missing field `")
                        .trim_end_matches('`');
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else if let config::ConfigError::NotFound(field) = &err {
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else {
                    Err(ConfigError::Other(err))
                };
            }
        };

        for (path, value) in [
            ("provider.api_key", &settings.provider.api_key),
            ("search.api_key", &settings.search.api_key),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingEnvVar {
                    env_var: to_env_var(path),
                });
            }
        }

        Ok(settings)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_openai_host() -> String {
    "https://api.openai.com".to_string()
}

fn default_search_host() -> String {
    DEFAULT_SEARCH_HOST.to_string()
}

fn default_max_results() -> u32 {
    1
}

fn default_sessions_table() -> String {
    Tables::default().sessions
}

fn default_users_table() -> String {
    Tables::default().users
}

fn default_max_tool_rounds() -> usize {
    DEFAULT_MAX_TOOL_ROUNDS
}
