//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into an [`OrchestratorConfig`],
//! validate it, and resolve `key_env` references before returning. This is
//! the primary entry point for loading engine configuration at startup.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - Every key in a loaded config carries its material; unresolved
//!   environment variables are reported together, by name
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Defining the config schema (that belongs to `mod.rs`)
//! - Building the engine (that belongs to [`OrchestratorConfig::build_orchestrator`])

use std::path::Path;

use super::validation::{self, ConfigError};
use super::OrchestratorConfig;

/// Load an [`OrchestratorConfig`] from a TOML file.
///
/// # Returns
///
/// - `Ok(OrchestratorConfig)` if the file is readable, well-formed, valid,
///   and every `key_env` is set.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated
///   or secrets are missing.
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```rust,ignore
/// use critique_orchestrator::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("orchestrator.toml"))?;
/// println!("Loaded: {}", config.orchestrator.name);
/// ```
pub fn load_from_file(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load an [`OrchestratorConfig`] from a TOML string, resolving `key_env`
/// from the process environment.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<OrchestratorConfig, ConfigError> {
    load_with_env(content, source_name, |var| std::env::var(var).ok())
}

/// Load an [`OrchestratorConfig`] from a TOML string, resolving `key_env`
/// through `lookup`.
///
/// # Panics
///
/// This function never panics.
pub fn load_with_env<F>(
    content: &str,
    source_name: &str,
    lookup: F,
) -> Result<OrchestratorConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let config: OrchestratorConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(join_errors)?;
    resolve_secrets(config, lookup).map_err(join_errors)
}

/// Fill in `key` for every entry that names a `key_env`.
///
/// # Errors
///
/// One [`ConfigError::MissingSecret`] per unset or empty variable.
pub fn resolve_secrets<F>(
    mut config: OrchestratorConfig,
    lookup: F,
) -> Result<OrchestratorConfig, Vec<ConfigError>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();
    for (i, provider) in config.providers.iter_mut().enumerate() {
        for (j, key) in provider.keys.iter_mut().enumerate() {
            if key.key.is_some() {
                continue;
            }
            let Some(var) = key.key_env.as_deref() else {
                continue;
            };
            match lookup(var).filter(|v| !v.trim().is_empty()) {
                Some(value) => key.key = Some(value),
                None => errors.push(ConfigError::MissingSecret {
                    field: format!("providers[{i}].keys[{j}]"),
                    var: var.to_string(),
                }),
            }
        }
    }

    if errors.is_empty() {
        Ok(config)
    } else {
        Err(errors)
    }
}

fn join_errors(errors: Vec<ConfigError>) -> ConfigError {
    ConfigError::Validation(
        errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[orchestrator]
name = "test"

[policy]
max_iterations = 2
quality_threshold = 0.9
cost_limit = 0.5

[timeouts]
primary_timeout_ms = 5000

[selection]
jitter = 0.0
retention = "reselect"

[[providers]]
name = "openai"
kind = "open_ai"
base_url = "http://localhost:9999"

[[providers.keys]]
key = "sk-one"

[[providers.keys]]
key_env = "TEST_OPENAI_KEY_TWO"
model = "gpt-4o-mini"

[[models]]
id = "gpt-4o"
provider = "openai"
model_id = "gpt-4o"
base_confidence = 0.85
cost_per_1k_tokens = 0.005
keywords = [{ term = "analyze" }, { term = "explain", weight = 2.0 }]
domains = ["reasoning"]
bonuses = [{ when = "question", amount = 0.05 }]

[observability]
log_format = "json"
"#;

    fn env(var: &str) -> Option<String> {
        (var == "TEST_OPENAI_KEY_TWO").then(|| "sk-two".to_string())
    }

    #[test]
    fn test_load_with_env_valid_toml_succeeds() {
        let config = load_with_env(VALID_TOML, "test", env).expect("test: valid config");
        assert_eq!(config.orchestrator.name, "test");
        assert_eq!(config.policy.max_iterations, 2);
        assert_eq!(config.policy.cost_limit, Some(0.5));
        assert_eq!(config.timeouts.primary_timeout_ms, 5000);
        assert_eq!(config.timeouts.critique_timeout_ms, 10_000);
        assert_eq!(config.selection.retention, super::super::RetentionKind::Reselect);
        assert_eq!(config.observability.log_format, super::super::LogFormat::Json);
        assert_eq!(config.models.len(), 1);
        assert_eq!(config.models[0].keywords[1].weight, 2.0);
    }

    #[test]
    fn test_key_env_is_resolved() {
        let config = load_with_env(VALID_TOML, "test", env).expect("test: valid config");
        let keys = &config.providers[0].keys;
        assert_eq!(keys[0].key.as_deref(), Some("sk-one"));
        assert_eq!(keys[1].key.as_deref(), Some("sk-two"));
        assert_eq!(keys[1].model.as_deref(), Some("gpt-4o-mini"));
        assert!(config.build_gateway().is_ok());
    }

    #[test]
    fn test_missing_env_var_names_the_variable() {
        let err = load_with_env(VALID_TOML, "test", |_| None).expect_err("test: missing");
        let msg = err.to_string();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(msg.contains("TEST_OPENAI_KEY_TWO"));
    }

    #[test]
    fn test_empty_env_var_counts_as_missing() {
        let result = load_with_env(VALID_TOML, "test", |_| Some("  ".into()));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_str_invalid_toml_returns_parse_error() {
        let err = load_from_str("not valid toml [[[", "bad.toml").expect_err("test: parse");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_from_str_unknown_provider_kind_fails() {
        let toml_str = r#"
[[providers]]
name = "x"
kind = "carrier_pigeon"
keys = [{ key = "k" }]
"#;
        let err = load_from_str(toml_str, "kind.toml").expect_err("test: parse");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_from_str_missing_providers_returns_parse_error() {
        let err = load_from_str("[policy]\nmax_iterations = 2\n", "no-providers.toml")
            .expect_err("test: parse");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_from_str_validation_failure_returns_validation_error() {
        let toml_str = r#"
[policy]
quality_threshold = 1.5

[[providers]]
name = "openai"
kind = "open_ai"
keys = [{ key = "sk" }]

[[models]]
id = "gpt-4o"
provider = "openai"
model_id = "gpt-4o"
base_confidence = 0.85
"#;
        let err = load_from_str(toml_str, "bad-threshold.toml").expect_err("test: invalid");
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("policy.quality_threshold"));
    }

    #[test]
    fn test_load_from_file_valid_toml_succeeds() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("test.toml");
        let mut f = std::fs::File::create(&path).expect("test: create file");
        f.write_all(
            br#"
[[providers]]
name = "echo"
kind = "echo"
keys = [{ key = "demo" }]

[[models]]
id = "echo-model"
provider = "echo"
model_id = "echo-1"
base_confidence = 0.7
"#,
        )
        .expect("test: write");
        drop(f);

        let config = load_from_file(&path).expect("test: load from file");
        assert_eq!(config.providers[0].name, "echo");
        assert_eq!(config.registry().len(), 1);
    }

    #[test]
    fn test_demo_config_loads_with_all_secrets_present() {
        let content = include_str!("../../demos/orchestrator.toml");
        let config = load_with_env(content, "demos/orchestrator.toml", |var| {
            Some(format!("value-of-{var}"))
        })
        .expect("test: demo config is valid");
        assert_eq!(config.providers.len(), 6);
        assert!(config.models.is_empty());
        assert!(config.build_gateway().is_ok());
    }

    #[test]
    fn test_demo_config_reports_every_missing_secret() {
        let content = include_str!("../../demos/orchestrator.toml");
        let err = load_with_env(content, "demos/orchestrator.toml", |_| None)
            .expect_err("test: secrets missing");
        let msg = err.to_string();
        for var in ["DEEPSEEK_API_KEY", "OPENAI_API_KEY_2", "GROQ_API_KEY"] {
            assert!(msg.contains(var), "missing {var} in {msg}");
        }
    }

    #[test]
    fn test_load_from_file_missing_file_returns_io_error() {
        let err = load_from_file(Path::new("/nonexistent/path/config.toml")).expect_err("test: io");
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_load_from_str_source_name_appears_in_error() {
        let err = load_from_str("invalid [[[", "my-source.toml").expect_err("test: parse");
        assert!(err.to_string().contains("my-source.toml"));
    }
}
