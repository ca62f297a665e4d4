use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the bridge
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream MCP server configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
        }
    }
}

/// Configuration for the upstream MCP server spawned per connection
///
/// # Security Warning
///
/// The `command` field is executed directly, once per accepted connection.
/// Configuration files must be protected with appropriate file permissions;
/// a malicious configuration could execute arbitrary code with the
/// permissions of the bridge process.
#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Executable to spawn for each connection
    #[serde(default = "default_upstream_command")]
    pub command: String,

    /// Arguments passed to the executable (default: ["stdio"])
    #[serde(default = "default_upstream_args")]
    pub args: Vec<String>,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl UpstreamConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            command: default_upstream_command(),
            args: default_upstream_args(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// Identity name to token mapping. Empty means authentication is
    /// disabled and every request is accepted without an identity.
    #[serde(default)]
    pub identities: HashMap<String, String>,

    /// Legacy single API key. Promoted to a one-entry identity mapping
    /// under "default" when `identities` is otherwise empty.
    pub api_key: Option<String>,
}

impl AuthConfig {
    /// Effective identity -> token mapping after legacy promotion
    pub fn effective_identities(&self) -> HashMap<String, String> {
        if !self.identities.is_empty() {
            return self.identities.clone();
        }
        match self.api_key.as_deref() {
            Some(key) if !key.is_empty() => {
                HashMap::from([("default".to_string(), key.to_string())])
            }
            _ => HashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.effective_identities().is_empty()
    }
}

fn default_listen_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_upstream_command() -> String {
    "terraform-mcp-server".to_string()
}

fn default_upstream_args() -> Vec<String> {
    vec!["stdio".to_string()]
}

fn default_shutdown_grace_period() -> u64 {
    5
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            )
        })?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment-variable overrides on top of the loaded values
    ///
    /// Recognized variables: PORT, BIND, MCP_COMMAND, API_KEY, API_KEYS.
    /// API_KEYS is a comma-separated list of name=token pairs; MCP_COMMAND
    /// is shell-split, with any extra words replacing the configured args.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(
        &mut self,
        get: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(port) = get("PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid PORT '{}': {}", port, e))?;
        }

        if let Some(bind) = get("BIND") {
            self.server.bind = bind;
        }

        if let Some(command) = get("MCP_COMMAND") {
            let mut words = shell_words::split(&command)
                .map_err(|e| anyhow::anyhow!("Invalid MCP_COMMAND '{}': {}", command, e))?;
            if words.is_empty() {
                anyhow::bail!("MCP_COMMAND is empty");
            }
            self.upstream.command = words.remove(0);
            if !words.is_empty() {
                self.upstream.args = words;
            }
        }

        if let Some(key) = get("API_KEY") {
            if !key.is_empty() {
                self.auth.api_key = Some(key);
            }
        }

        if let Some(keys) = get("API_KEYS") {
            let mut identities = HashMap::new();
            for pair in keys.split(',') {
                let pair = pair.trim();
                if pair.is_empty() {
                    continue;
                }
                let (name, token) = pair.split_once('=').ok_or_else(|| {
                    anyhow::anyhow!("Invalid API_KEYS entry '{}': expected name=token", pair)
                })?;
                identities.insert(name.trim().to_string(), token.trim().to_string());
            }
            if !identities.is_empty() {
                self.auth.identities = identities;
            }
        }

        Ok(())
    }
}
