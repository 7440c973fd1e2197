//! Starter configuration written by `parley init`

use anyhow::{Context, Result, bail};
use std::path::Path;

/// Commented config mirroring the built-in defaults
pub const CONFIG_TEMPLATE: &str = r#"# Parley gateway configuration
#
# Every value below is the built-in default; delete what you don't change.

# Log filter when RUST_LOG is not set (error, warn, info, debug, trace)
# log_level = "info"

[server]
bind = "127.0.0.1:18790"

[agent]
name = "Assistant"
# Any OpenAI-compatible /chat/completions endpoint
base_url = "http://localhost:11434/v1"
model = "qwen3:4b"
# Name of the environment variable holding the API key
# api_key_env = "OPENAI_API_KEY"
# instructions = "You are a helpful assistant."
temperature = 0.0
max_tool_rounds = 8
request_timeout_secs = 300

[catalog]
# Tool server clients and lists are dropped after this much inactivity
cache_idle_secs = 1800
request_timeout_secs = 30
connect_retries = 2
# Unanswered elicitations are cancelled after this long
elicitation_timeout_secs = 60

[approvals]
# Pending tool calls older than this are rejected
timeout_secs = 600
sweep_interval_secs = 60

[broadcast]
# Idle groups are torn down after this long without subscribers
grace_secs = 15

[history]
keep_recent = 3
thread_idle_secs = 3600
max_threads = 1000

[wire]
# Also embed <tool_update> markers in fragment text for older clients
inline_tool_markers = false
"#;

/// Write the template to `path`, refusing to overwrite unless `force`
pub fn write_template(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
