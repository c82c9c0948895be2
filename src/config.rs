//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags** — `--port`, `--host`, `--isolation`, and the
//!    child command line (applied by `main.rs` via [`Config::apply_cli`])
//! 2. **Environment variables** — `MCP_PROXY_HOST`, `MCP_PROXY_PORT`,
//!    `MCP_PROXY_ISOLATION`
//! 3. **Config file** — path via `--config <path>`, or `mcp-proxy.toml` in CWD
//! 4. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//! sse_path = "/sse"
//! messages_path = "/messages"
//! keep_alive_secs = 15
//! max_body_bytes = 4194304  # 4 MB
//! channel_capacity = 64
//!
//! [child]
//! command = "node"
//! args = ["server.js"]
//! working_dir = "~/mcp"
//! isolation = "per-session"  # or "shared"
//! shutdown_grace_ms = 2000
//!
//! [child.env]
//! NODE_ENV = "production"
//!
//! [bridge]
//! connect_timeout_secs = 30
//!
//! [logging]
//! level = "info"
//! ```

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_CONFIG_FILE: &str = "mcp-proxy.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub child: ChildConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings for `sse-to-stdio`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind (default `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: String,
    /// Preferred port (default 8080). If taken, an ephemeral port is used.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Route remote peers open to start a session (default `/sse`).
    #[serde(default = "default_sse_path")]
    pub sse_path: String,
    /// Route remote peers POST messages to (default `/messages`).
    #[serde(default = "default_messages_path")]
    pub messages_path: String,
    /// Seconds between SSE keep-alive comments; 0 disables (default 15).
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Maximum POST body size in bytes (default 4 MB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Queue depth per direction per session (default 64).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// How sessions map onto child processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Isolation {
    /// One child process per session. A crash affects only its own session.
    #[default]
    PerSession,
    /// One child process for every session. Degraded mode: any session's
    /// close, or the child's death, tears down all sessions, and child output
    /// is delivered to every live session.
    Shared,
}

impl Isolation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerSession => "per-session",
            Self::Shared => "shared",
        }
    }
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Isolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-session" => Ok(Self::PerSession),
            "shared" => Ok(Self::Shared),
            other => Err(format!(
                "unknown isolation mode `{other}` (expected `per-session` or `shared`)"
            )),
        }
    }
}

/// The child process fronted by the relay.
#[derive(Debug, Clone, Deserialize)]
pub struct ChildConfig {
    /// Program to launch. Normally given on the command line.
    #[serde(default)]
    pub command: String,
    /// Arguments passed to `command`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory (default: inherit). A leading `~` is expanded.
    pub working_dir: Option<String>,
    /// Extra environment variables, merged into the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Session-to-process mapping (default `per-session`).
    #[serde(default)]
    pub isolation: Isolation,
    /// Milliseconds to wait after closing stdin before killing (default 2000).
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl ChildConfig {
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Human-readable command line for log messages.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Settings for the single-session `stdio-to-sse` bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Seconds to wait for the remote `endpoint` event (default 30).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_sse_path() -> String {
    "/sse".to_string()
}
fn default_messages_path() -> String {
    "/messages".to_string()
}
fn default_keep_alive_secs() -> u64 {
    15
}
fn default_max_body_bytes() -> usize {
    4 * 1024 * 1024 // 4 MB
}
fn default_channel_capacity() -> usize {
    64
}
fn default_shutdown_grace_ms() -> u64 {
    2000
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            sse_path: default_sse_path(),
            messages_path: default_messages_path(),
            keep_alive_secs: default_keep_alive_secs(),
            max_body_bytes: default_max_body_bytes(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            isolation: Isolation::default(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Overrides collected from the command line.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub isolation: Option<Isolation>,
    /// Program followed by its arguments. Empty keeps the configured command.
    pub command: Vec<String>,
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `mcp-proxy.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = if let Some(p) = path {
            Self::from_file(&expand_tilde(p))?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(DEFAULT_CONFIG_FILE)?
        } else {
            Self::default()
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(path, &content)
    }

    fn from_toml(path: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply `MCP_PROXY_*` overrides, reading variables through `var`.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(host) = var("MCP_PROXY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("MCP_PROXY_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                name: "MCP_PROXY_PORT",
                value: port,
            })?;
        }
        if let Some(mode) = var("MCP_PROXY_ISOLATION") {
            self.child.isolation = mode.parse().map_err(|_| ConfigError::InvalidValue {
                name: "MCP_PROXY_ISOLATION",
                value: mode,
            })?;
        }
        Ok(())
    }

    /// Apply command-line overrides on top of file and environment values.
    pub fn apply_cli(&mut self, cli: CliOverrides) {
        if let Some(host) = cli.host {
            self.server.host = host;
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(isolation) = cli.isolation {
            self.child.isolation = isolation;
        }
        let mut command = cli.command.into_iter();
        if let Some(program) = command.next() {
            self.child.command = program;
            self.child.args = command.collect();
        }
    }

    /// Check the settings `sse-to-stdio` depends on.
    pub fn validate_relay(&self) -> Result<(), ConfigError> {
        if self.child.command.trim().is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        for (name, path) in [
            ("server.sse_path", &self.server.sse_path),
            ("server.messages_path", &self.server.messages_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidValue {
                    name,
                    value: path.clone(),
                });
            }
        }
        if self.server.sse_path == self.server.messages_path {
            return Err(ConfigError::InvalidValue {
                name: "server.messages_path",
                value: self.server.messages_path.clone(),
            });
        }
        if self.server.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                name: "server.channel_capacity",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Cow::Owned(format!("{home}{}", &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.sse_path, "/sse");
        assert_eq!(config.server.messages_path, "/messages");
        assert_eq!(config.child.isolation, Isolation::PerSession);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parses_partial_toml() {
        let config = Config::from_toml(
            "test.toml",
            r#"
            [server]
            port = 9000

            [child]
            command = "node"
            args = ["server.js", "--stdio"]
            isolation = "shared"

            [child.env]
            NODE_ENV = "test"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.child.isolation, Isolation::Shared);
        assert_eq!(config.child.command_line(), "node server.js --stdio");
        assert_eq!(config.child.env["NODE_ENV"], "test");
        assert_eq!(config.child.shutdown_grace(), Duration::from_secs(2));
    }

    #[test]
    fn rejects_unknown_isolation() {
        let err = Config::from_toml("bad.toml", "[child]\nisolation = \"pooled\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!("pooled".parse::<Isolation>().is_err());
    }

    #[test]
    fn env_then_cli_precedence() {
        let mut config = Config::default();
        config
            .apply_env(|name| match name {
                "MCP_PROXY_PORT" => Some("9100".to_string()),
                "MCP_PROXY_ISOLATION" => Some("shared".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.child.isolation, Isolation::Shared);

        config.apply_cli(CliOverrides {
            port: Some(9200),
            command: vec!["python".into(), "-m".into(), "server".into()],
            ..CliOverrides::default()
        });
        assert_eq!(config.server.port, 9200);
        assert_eq!(config.child.isolation, Isolation::Shared);
        assert_eq!(config.child.command, "python");
        assert_eq!(config.child.args, vec!["-m", "server"]);
    }

    #[test]
    fn bad_env_port_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_env(|name| (name == "MCP_PROXY_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "MCP_PROXY_PORT",
                ..
            }
        ));
    }

    #[test]
    fn relay_validation() {
        let mut config = Config::default();
        assert!(matches!(
            config.validate_relay(),
            Err(ConfigError::MissingCommand)
        ));
        config.child.command = "cat".into();
        assert!(config.validate_relay().is_ok());
        config.server.messages_path = "messages".into();
        assert!(config.validate_relay().is_err());
    }

    #[test]
    fn tilde_expansion_leaves_other_paths_alone() {
        assert_eq!(expand_tilde("/etc/mcp-proxy.toml"), "/etc/mcp-proxy.toml");
        assert_eq!(expand_tilde("~user/x"), "~user/x");
    }
}
