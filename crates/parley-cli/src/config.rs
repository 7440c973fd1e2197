//! Configuration file: TOML with per-field defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_core::providers::OpenAiCompatConfig;
use parley_gateway::{BroadcastConfig, GatewayConfig, SessionConfig, ThreadConfig};
use parley_mcp::CatalogConfig;

/// Environment variable naming an alternative config file
pub const CONFIG_ENV: &str = "PARLEY_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub log_level: Option<String>,
    pub server: ServerSection,
    pub agent: AgentSection,
    pub catalog: CatalogSection,
    pub approvals: ApprovalsSection,
    pub broadcast: BroadcastSection,
    pub history: HistorySection,
    pub wire: WireSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:18790".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub name: String,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: Option<String>,
    pub instructions: Option<String>,
    pub temperature: f32,
    pub max_tool_rounds: usize,
    pub request_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        let defaults = OpenAiCompatConfig::default();
        Self {
            name: defaults.name,
            base_url: defaults.base_url,
            model: defaults.model,
            api_key_env: None,
            instructions: None,
            temperature: defaults.temperature,
            max_tool_rounds: defaults.max_tool_rounds,
            request_timeout_secs: defaults.request_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSection {
    pub cache_idle_secs: u64,
    pub request_timeout_secs: u64,
    pub connect_retries: u32,
    pub elicitation_timeout_secs: u64,
}

impl Default for CatalogSection {
    fn default() -> Self {
        Self {
            cache_idle_secs: 1800,
            request_timeout_secs: 30,
            connect_retries: 2,
            elicitation_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalsSection {
    /// Unresolved calls older than this are expired and treated as rejected
    pub timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ApprovalsSection {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSection {
    pub grace_secs: u64,
}

impl Default for BroadcastSection {
    fn default() -> Self {
        Self { grace_secs: 15 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    pub keep_recent: usize,
    pub thread_idle_secs: u64,
    pub max_threads: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            keep_recent: 3,
            thread_idle_secs: 3600,
            max_threads: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WireSection {
    /// Append `<tool_update>` markers to fragment text
    pub inline_tool_markers: bool,
}

/// Where the config file is looked up: `--config`, `$PARLEY_CONFIG`, then
/// `~/.parley/config.toml`
pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV)
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".parley").join("config.toml"))
}

impl ParleyConfig {
    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML")
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", self.server.bind))
    }

    pub fn agent_config(&self) -> OpenAiCompatConfig {
        let agent = &self.agent;
        let api_key = agent
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.trim().is_empty());
        let mut config = OpenAiCompatConfig {
            name: agent.name.clone(),
            base_url: agent.base_url.clone(),
            model: agent.model.clone(),
            api_key,
            temperature: agent.temperature,
            max_tool_rounds: agent.max_tool_rounds,
            request_timeout: Duration::from_secs(agent.request_timeout_secs),
            ..OpenAiCompatConfig::default()
        };
        if let Some(instructions) = &agent.instructions {
            config.instructions = instructions.clone();
        }
        config
    }

    pub fn catalog_config(&self) -> CatalogConfig {
        CatalogConfig {
            cache_idle: Duration::from_secs(self.catalog.cache_idle_secs),
            request_timeout: Duration::from_secs(self.catalog.request_timeout_secs),
            connect_retries: self.catalog.connect_retries,
            elicitation_timeout: Duration::from_secs(self.catalog.elicitation_timeout_secs),
            ..CatalogConfig::default()
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            approval_timeout: Duration::from_secs(self.approvals.timeout_secs),
            approval_sweep_interval: Duration::from_secs(self.approvals.sweep_interval_secs.max(1)),
            ..GatewayConfig::default()
        }
    }

    pub fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            grace: Duration::from_secs(self.broadcast.grace_secs),
        }
    }

    pub fn thread_config(&self) -> ThreadConfig {
        ThreadConfig {
            keep_recent: self.history.keep_recent,
            idle: Duration::from_secs(self.history.thread_idle_secs),
            max_threads: self.history.max_threads.max(1),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            inline_tool_markers: self.wire.inline_tool_markers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ParleyConfig::parse("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:18790");
        assert_eq!(config.catalog.cache_idle_secs, 1800);
        assert_eq!(config.approvals.timeout_secs, 600);
        assert_eq!(config.broadcast.grace_secs, 15);
        assert_eq!(config.history.keep_recent, 3);
        assert!(!config.wire.inline_tool_markers);
        assert!(config.log_level.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config = ParleyConfig::parse(
            r#"
            log_level = "debug"

            [agent]
            model = "gpt-4o-mini"
            base_url = "https://api.openai.com/v1"

            [broadcast]
            grace_secs = 5

            [wire]
            inline_tool_markers = true
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.agent.model, "gpt-4o-mini");
        assert_eq!(config.agent.max_tool_rounds, 8);
        assert_eq!(config.broadcast_config().grace, Duration::from_secs(5));
        assert!(config.session_config().inline_tool_markers);
        assert_eq!(config.catalog.connect_retries, 2);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(ParleyConfig::parse("[server").is_err());
        assert!(ParleyConfig::parse("[history]\nkeep_recent = \"many\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nbind = \"0.0.0.0:9000\"").unwrap();

        let config = ParleyConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.bind_addr().unwrap().port(), 9000);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ParleyConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.history.max_threads, 1000);
    }

    #[test]
    fn test_explicit_path_wins() {
        let explicit = PathBuf::from("/tmp/explicit.toml");
        assert_eq!(config_path(Some(&explicit)), Some(explicit));
    }

    #[test]
    fn test_agent_config_mapping() {
        let config = ParleyConfig::parse(
            r#"
            [agent]
            name = "Parley"
            api_key_env = "PARLEY_TEST_KEY_THAT_IS_NOT_SET"
            instructions = "Be brief."
            request_timeout_secs = 12
            "#,
        )
        .unwrap();
        let agent = config.agent_config();
        assert_eq!(agent.name, "Parley");
        assert_eq!(agent.instructions, "Be brief.");
        assert!(agent.api_key.is_none());
        assert_eq!(agent.request_timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_bad_bind_address() {
        let config = ParleyConfig::parse("[server]\nbind = \"nowhere\"").unwrap();
        assert!(config.bind_addr().is_err());
    }
}
