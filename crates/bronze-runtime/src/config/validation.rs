//! Configuration validation utilities.

use std::collections::HashSet;

use super::error::{ConfigError, ConfigResult};
use super::schema::{BronzeConfig, LogOutput, PluginConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &BronzeConfig) -> ConfigResult<()> {
    validate_logging(config)?;
    validate_session(config)?;
    validate_dispatch(config)?;
    validate_plugins(config)?;
    Ok(())
}

fn validate_logging(config: &BronzeConfig) -> ConfigResult<()> {
    let logging = &config.logging;
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::missing_field("logging.file_path"));
    }
    if logging.filters.keys().any(|module| module.trim().is_empty()) {
        return Err(ConfigError::validation("Log filter module names cannot be empty"));
    }
    Ok(())
}

fn validate_session(config: &BronzeConfig) -> ConfigResult<()> {
    let session = &config.session;
    if session.ttl_secs == 0 {
        return Err(ConfigError::validation("Session TTL must be greater than 0"));
    }
    if session.confirmation_ttl_secs == 0 {
        return Err(ConfigError::validation(
            "Confirmation TTL must be greater than 0",
        ));
    }
    if session.key_prefix.is_empty() {
        return Err(ConfigError::missing_field("session.key_prefix"));
    }
    Ok(())
}

fn validate_dispatch(config: &BronzeConfig) -> ConfigResult<()> {
    if config.dispatch.max_concurrent_events == 0 {
        return Err(ConfigError::validation(
            "max_concurrent_events must be greater than 0",
        ));
    }
    Ok(())
}

/// Validates all plugin configurations.
///
/// Capability names and triggers must be unique across every enabled
/// plugin, since they share one registry.
fn validate_plugins(config: &BronzeConfig) -> ConfigResult<()> {
    let mut names = HashSet::new();
    let mut triggers = HashSet::new();

    for (id, plugin) in config.plugins.iter().filter(|(_, p)| p.enabled) {
        validate_plugin(id, plugin)?;

        for command in &plugin.commands {
            if !names.insert(command.name.trim()) {
                return Err(ConfigError::DuplicateCapability(command.name.clone()));
            }
            for trigger in &command.triggers {
                if !triggers.insert(trigger.trim().to_lowercase()) {
                    return Err(ConfigError::validation(format!(
                        "Trigger '{trigger}' is declared more than once"
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Validates a single plugin configuration.
fn validate_plugin(id: &str, plugin: &PluginConfig) -> ConfigResult<()> {
    if id.trim().is_empty() || id.contains(char::is_whitespace) {
        return Err(ConfigError::validation(format!(
            "Plugin id '{id}' must be non-empty and contain no whitespace"
        )));
    }

    if plugin.command.trim().is_empty() {
        return Err(ConfigError::missing_field(format!("plugins.{id}.command")));
    }

    if plugin.request_timeout_ms == 0 {
        return Err(ConfigError::validation(format!(
            "plugins.{id}.request_timeout_ms must be greater than 0"
        )));
    }

    if plugin.max_line_bytes == 0 {
        return Err(ConfigError::validation(format!(
            "plugins.{id}.max_line_bytes must be greater than 0"
        )));
    }

    for command in &plugin.commands {
        if command.name.trim().is_empty() {
            return Err(ConfigError::missing_field(format!(
                "plugins.{id}.commands.name"
            )));
        }
        if command.triggers.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::validation(format!(
                "Command '{}' of plugin '{id}' has an empty trigger",
                command.name
            )));
        }
    }

    Ok(())
}
