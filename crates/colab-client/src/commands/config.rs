//! Configuration commands.

use std::path::Path;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Dump the current configuration to stdout.
pub fn dump(config: &ClientConfig, config_path: &Path) -> ClientResult<()> {
    let toml_str = toml::to_string_pretty(config)
        .map_err(|e| ClientError::Config(format!("failed to serialize config: {}", e)))?;
    println!("# config.toml ({})", config_path.display());
    println!("{}", toml_str);
    Ok(())
}

/// Validate the configuration, resolving secret references.
pub fn validate(config: &ClientConfig) -> ClientResult<()> {
    if config.oauth.client_id.is_some() || config.oauth.client_secret.is_some() {
        super::auth_config(config, None)?;
        println!("OAuth client is valid.");
    }
    url::Url::parse(&config.colab.api_base_url)
        .map_err(|e| ClientError::Config(format!("invalid api_base_url: {}", e)))?;
    if config.keep_alive.interval_secs == 0 {
        return Err(ClientError::Config(
            "keep_alive.interval_secs must be positive".to_string(),
        ));
    }

    println!("Configuration is valid.");
    Ok(())
}

/// Show the configuration file path.
pub fn path(config_path: &Path) -> ClientResult<()> {
    println!("config: {}", config_path.display());
    Ok(())
}
