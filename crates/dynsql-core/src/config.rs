//! Configuration schema (dynsql.toml)

use serde::{Deserialize, Serialize};

/// Default name of the config file looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "dynsql.toml";

/// Default dynamic-execution procedure
pub const DEFAULT_PROCEDURE: &str = "sp_executesql";

/// Which assignment wins when a variable is assigned more than once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingPolicy {
    /// The first assignment in source order wins; later reassignments are ignored
    #[default]
    First,

    /// The last assignment in source order wins
    Last,
}

impl std::fmt::Display for BindingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::First => write!(f, "first"),
            Self::Last => write!(f, "last"),
        }
    }
}

/// How resolution results are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,

    /// Versioned JSON report
    Json,
}

/// Settings that change how a dynamic call is resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// Name of the dynamic-execution procedure (matched case-insensitively)
    #[serde(default = "default_procedure")]
    pub procedure: String,

    /// Policy for variables assigned more than once
    #[serde(default)]
    pub binding_policy: BindingPolicy,

    /// Policy for the variable holding the query text, which scripts
    /// usually build up over several assignments
    #[serde(default = "default_query_text_policy")]
    pub query_text_policy: BindingPolicy,

    /// Treat `DECLARE @x type = expr` initializers as assignments
    #[serde(default = "default_true")]
    pub include_declarations: bool,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            procedure: default_procedure(),
            binding_policy: BindingPolicy::default(),
            query_text_policy: default_query_text_policy(),
            include_declarations: true,
        }
    }
}

/// Output settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolution settings
    #[serde(default)]
    pub resolution: ResolutionConfig,

    /// Output settings
    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Self::from_toml(&contents)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if config.resolution.procedure.trim().is_empty() {
            return Err(ConfigError::Invalid("resolution.procedure must not be empty".to_string()));
        }

        Ok(config)
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }
}

fn default_procedure() -> String {
    DEFAULT_PROCEDURE.to_string()
}

fn default_query_text_policy() -> BindingPolicy {
    BindingPolicy::Last
}

fn default_true() -> bool {
    true
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.resolution.procedure, "sp_executesql");
        assert_eq!(config.resolution.binding_policy, BindingPolicy::First);
        assert_eq!(config.resolution.query_text_policy, BindingPolicy::Last);
        assert!(config.resolution.include_declarations);
        assert_eq!(config.output.format, OutputFormat::Text);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = Config::from_toml(
            r#"
            [resolution]
            binding_policy = "last"
            "#,
        )
        .unwrap();

        assert_eq!(config.resolution.binding_policy, BindingPolicy::Last);
        assert_eq!(config.resolution.query_text_policy, BindingPolicy::Last);
        assert_eq!(config.resolution.procedure, "sp_executesql");
        assert!(config.resolution.include_declarations);
    }

    #[test]
    fn empty_procedure_rejected() {
        let result = Config::from_toml("[resolution]\nprocedure = \"  \"\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_policy_rejected() {
        let result = Config::from_toml("[resolution]\nbinding_policy = \"random\"\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut config = Config::default();
        config.resolution.procedure = "sp_exec_wrapper".to_string();
        config.output.format = OutputFormat::Json;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_is_io_error() {
        let result = Config::from_file(std::path::Path::new("/nonexistent/dynsql.toml"));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }
}
