//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`OrchestratorConfig`] that
//! cannot be expressed through the type system alone (range checks,
//! uniqueness, cross-references between models and providers).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value, never
//!   key material
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - Resolving `key_env` (that belongs to `loader`)

use std::collections::HashSet;

use super::OrchestratorConfig;
use crate::OrchestratorError;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "policy.quality_threshold").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// A key references an environment variable that is not set.
    #[error("Field '{field}' references unset environment variable '{var}'")]
    MissingSecret {
        /// Path of the key entry (e.g., "providers[0].keys[1]").
        field: String,
        /// Environment variable name.
        var: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl From<ConfigError> for OrchestratorError {
    fn from(e: ConfigError) -> Self {
        OrchestratorError::ConfigError(e.to_string())
    }
}

fn invalid(field: impl Into<String>, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Validate all semantic constraints on an [`OrchestratorConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &OrchestratorConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Policy ───────────────────────────────────────────────────────
    if config.policy.max_iterations == 0 {
        errors.push(invalid("policy.max_iterations", 0, "must be at least 1"));
    }

    let q = config.policy.quality_threshold;
    if !(0.0..=1.0).contains(&q) {
        errors.push(invalid(
            "policy.quality_threshold",
            q,
            "must be between 0.0 and 1.0",
        ));
    }

    if let Some(limit) = config.policy.cost_limit {
        if !limit.is_finite() || limit < 0.0 {
            errors.push(invalid("policy.cost_limit", limit, "must be a non-negative number"));
        }
    }

    // ── Timeouts ─────────────────────────────────────────────────────
    for (field, ms) in [
        ("timeouts.primary_timeout_ms", config.timeouts.primary_timeout_ms),
        ("timeouts.critique_timeout_ms", config.timeouts.critique_timeout_ms),
        ("timeouts.critique_deadline_ms", config.timeouts.critique_deadline_ms),
    ] {
        if ms == 0 {
            errors.push(invalid(field, 0, "must be at least 1ms"));
        }
    }

    // ── Selection ────────────────────────────────────────────────────
    if !(config.selection.jitter >= 0.0 && config.selection.jitter.is_finite()) {
        errors.push(invalid(
            "selection.jitter",
            config.selection.jitter,
            "must be a non-negative number",
        ));
    }

    if !(config.selection.keyword_weight >= 0.0 && config.selection.keyword_weight.is_finite()) {
        errors.push(invalid(
            "selection.keyword_weight",
            config.selection.keyword_weight,
            "must be a non-negative number",
        ));
    }

    // ── Credentials ──────────────────────────────────────────────────
    if config.credentials.backoff_base_s == 0 {
        errors.push(invalid("credentials.backoff_base_s", 0, "must be at least 1 second"));
    }

    if config.credentials.backoff_base_s > config.credentials.backoff_cap_s {
        errors.push(invalid(
            "credentials.backoff_base_s",
            config.credentials.backoff_base_s,
            "must be \u{2264} backoff_cap_s",
        ));
    }

    // ── Providers ────────────────────────────────────────────────────
    if config.providers.is_empty() {
        errors.push(invalid("providers", "[]", "at least one provider is required"));
    }

    let mut provider_names = HashSet::new();
    for (i, provider) in config.providers.iter().enumerate() {
        if provider.name.trim().is_empty() {
            errors.push(invalid(
                format!("providers[{i}].name"),
                "",
                "provider name must not be empty",
            ));
        } else if !provider_names.insert(provider.name.as_str()) {
            errors.push(invalid(
                format!("providers[{i}].name"),
                &provider.name,
                "duplicate provider name",
            ));
        }

        if provider.keys.is_empty() {
            errors.push(invalid(
                format!("providers[{i}].keys"),
                "[]",
                "at least one key is required",
            ));
        }

        for (j, key) in provider.keys.iter().enumerate() {
            match (&key.key, &key.key_env) {
                (Some(_), Some(_)) => errors.push(invalid(
                    format!("providers[{i}].keys[{j}]"),
                    "key + key_env",
                    "set exactly one of key or key_env",
                )),
                (None, None) => errors.push(invalid(
                    format!("providers[{i}].keys[{j}]"),
                    "none",
                    "set exactly one of key or key_env",
                )),
                (Some(k), None) if k.trim().is_empty() => errors.push(invalid(
                    format!("providers[{i}].keys[{j}].key"),
                    "",
                    "key must not be empty",
                )),
                _ => {}
            }
        }

        if let Some(t) = provider.temperature {
            if !(0.0..=2.0).contains(&t) {
                errors.push(invalid(
                    format!("providers[{i}].temperature"),
                    t,
                    "must be between 0.0 and 2.0",
                ));
            }
        }
    }

    // ── Models ───────────────────────────────────────────────────────
    let registry = config.registry();
    let mut model_ids = HashSet::new();
    for (i, model) in registry.iter().enumerate() {
        let path = if config.models.is_empty() {
            format!("default_registry[{}]", model.id)
        } else {
            format!("models[{i}]")
        };

        if !model_ids.insert(model.id.as_str()) {
            errors.push(invalid(format!("{path}.id"), &model.id, "duplicate model id"));
        }

        if !provider_names.contains(model.provider.as_str()) {
            errors.push(invalid(
                format!("{path}.provider"),
                &model.provider,
                "no provider with this name is configured",
            ));
        }

        if !(0.0..=1.0).contains(&model.base_confidence) {
            errors.push(invalid(
                format!("{path}.base_confidence"),
                model.base_confidence,
                "must be between 0.0 and 1.0",
            ));
        }

        if !(model.cost_per_1k_tokens >= 0.0 && model.cost_per_1k_tokens.is_finite()) {
            errors.push(invalid(
                format!("{path}.cost_per_1k_tokens"),
                model.cost_per_1k_tokens,
                "must be a non-negative number",
            ));
        }

        for (k, bonus) in model.bonuses.iter().enumerate() {
            if !(0.05..=0.10).contains(&bonus.amount) {
                errors.push(invalid(
                    format!("{path}.bonuses[{k}].amount"),
                    bonus.amount,
                    "must be between 0.05 and 0.10",
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
