use crate::config::types::{Config, Credential};
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Loads and parses a configuration file from the given path
///
/// Environment overrides (`GITHUB_TOKEN` or the configured `token-env`,
/// `GITHUB_API_URL`, `BATCH_SIZE`, `STARLING_DATABASE`) are applied after
/// parsing and before validation.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use starling::config::load_config;
///
/// let config = load_config(Path::new("starling.toml")).unwrap();
/// println!("Batch size: {}", config.crawl.batch_size);
/// ```
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content, |key| std::env::var(key).ok())
}

/// Parses configuration text, resolving overrides through `env`
pub fn parse_config<F>(content: &str, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: Config = toml::from_str(content)?;

    apply_env_overrides(&mut config, &env)?;
    config.github.api_url = normalize_api_url(&config.github.api_url);
    config.credentials = resolve_credentials(&config, &env);

    validate(&config)?;

    Ok(config)
}

fn apply_env_overrides<F>(config: &mut Config, env: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = env("GITHUB_API_URL") {
        config.github.api_url = url;
    }

    if let Some(size) = env("BATCH_SIZE") {
        config.crawl.batch_size = size.trim().parse().map_err(|_| {
            ConfigError::Validation(format!("BATCH_SIZE must be a positive integer, got '{}'", size))
        })?;
    }

    if let Some(path) = env("STARLING_DATABASE") {
        config.output.database_path = path;
    }

    Ok(())
}

/// Makes sure the endpoint points at the GraphQL route
///
/// POSTing a GraphQL body to the API root returns 404, so a bare
/// `https://api.github.com/` is completed to `https://api.github.com/graphql`.
pub fn normalize_api_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.ends_with("/graphql") {
        trimmed.to_string()
    } else {
        format!("{}/graphql", trimmed)
    }
}

fn resolve_credentials<F>(config: &Config, env: &F) -> Vec<Credential>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = env(&config.github.token_env).or_else(|| config.github.token.clone());

    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .enumerate()
            .map(|(i, token)| Credential {
                label: format!("token-{}", i + 1),
                token: token.to_string(),
            })
            .collect()
    })
    .unwrap_or_default()
}

/// Computes a SHA-256 hash of the configuration file content
///
/// Stored with every run so a resumed crawl can be told apart from one started
/// under a different configuration.
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Loads a configuration and returns both the config and its hash
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let config = load_config(path)?;
    let hash = compute_config_hash(path)?;
    Ok((config, hash))
}
