use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {env_var}")]
    MissingEnvVar { env_var: String },
    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

// Maps a dotted settings path to the environment variable that sets it
pub fn to_env_var(field_path: &str) -> String {
    format!("MAKEIT_{}", field_path.to_uppercase().replace('.', "__"))
}
