//! Configuration (layered: defaults < TOML file < environment).
//!
//! Every field is optional. [`WardenConfig::normalized`] clamps values into
//! their supported ranges and is applied by every loader.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};
use crate::safety::{ApprovalMode, ToolTier};

/// Smallest accepted approval / sub-agent timeout, in seconds.
pub const MIN_TIMEOUT_SECS: u64 = 10;
/// Largest accepted approval / sub-agent timeout, in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 600;
/// Hard cap on simultaneously pending approval requests.
pub const MAX_PENDING_APPROVALS: usize = 100;

const CONFIG_FILE_NAME: &str = "warden.toml";

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub safety: SafetyConfig,
    pub subagent: SubagentConfig,
    pub agent: AgentConfig,
    pub events: EventsConfig,
    pub provider: ProviderConfig,
}

/// Tool approval policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub approval_mode: ApprovalMode,
    /// Seconds to wait for a human response before denying.
    pub approval_timeout: u64,
    pub allowed_tools: BTreeSet<String>,
    pub denied_tools: BTreeSet<String>,
    pub tool_tiers: BTreeMap<String, ToolTier>,
    pub custom_patterns: Vec<String>,
    pub sensitive_paths: Vec<String>,
    pub max_pending_approvals: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            approval_mode: ApprovalMode::default(),
            approval_timeout: 120,
            allowed_tools: BTreeSet::new(),
            denied_tools: BTreeSet::new(),
            tool_tiers: BTreeMap::new(),
            custom_patterns: Vec::new(),
            sensitive_paths: Vec::new(),
            max_pending_approvals: MAX_PENDING_APPROVALS,
        }
    }
}

impl SafetyConfig {
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout)
    }
}

/// Budgets for nested `run_agent` executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubagentConfig {
    pub max_concurrent: usize,
    pub max_total: usize,
    pub max_depth: usize,
    pub max_iterations: usize,
    /// Wall-clock limit per sub-agent, in seconds.
    pub timeout: u64,
    pub max_output_chars: usize,
    pub max_prompt_chars: usize,
    /// Whether session-scope approvals granted at the top level also apply
    /// inside sub-agents.
    pub inherit_session_grants: bool,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_total: 10,
            max_depth: 3,
            max_iterations: 15,
            timeout: 120,
            max_output_chars: 4000,
            max_prompt_chars: 32_000,
            inherit_session_grants: false,
        }
    }
}

impl SubagentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Top-level agent loop and stream lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: usize,
    /// Estimated-token ceiling that triggers history compaction.
    pub token_ceiling: usize,
    /// Histories shorter than this are never compacted.
    pub min_compact_messages: usize,
    /// Follow-up messages accepted while a loop is running.
    pub queue_capacity: usize,
    /// Added to the approval timeout to get the stale-session threshold.
    pub stale_buffer_secs: u64,
    /// A model stream silent for this long fails the turn.
    pub stream_idle_timeout_secs: u64,
    pub retry_attempts: u32,
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            token_ceiling: 100_000,
            min_compact_messages: 6,
            queue_capacity: 10,
            stale_buffer_secs: 30,
            stream_idle_timeout_secs: 120,
            retry_attempts: 3,
            system_prompt: None,
        }
    }
}

/// Event bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Change-log poll interval, in milliseconds.
    pub poll_interval_ms: u64,
    /// Per-subscriber delivery queue size.
    pub subscriber_buffer: usize,
    /// Maximum change-log rows read per poll.
    pub poll_batch: usize,
    /// Logical database/tenant name for broadcast notices.
    pub database: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1500,
            subscriber_buffer: 256,
            poll_batch: 500,
            database: "main".to_string(),
        }
    }
}

impl EventsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Model endpoint settings. The API key is never written back to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
        }
    }
}

impl WardenConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| WardenError::Configuration(format!("invalid config: {e}")))?;
        Ok(config.normalized())
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Default config file location (`<config dir>/warden/warden.toml`).
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "warden", "warden")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load the default config file when present, then apply the environment.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path)?,
            _ => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config.normalized())
    }

    /// Write as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = self.to_toml_string()?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, raw)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| WardenError::Configuration(format!("cannot encode config: {e}")))
    }

    /// Overlay `WARDEN_*` variables (and the provider's `OPENAI_*` keys).
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("WARDEN_APPROVAL_MODE") {
            self.safety.approval_mode = parse_env("WARDEN_APPROVAL_MODE", &v)?;
        }
        if let Some(v) = lookup("WARDEN_APPROVAL_TIMEOUT") {
            self.safety.approval_timeout = parse_env("WARDEN_APPROVAL_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("WARDEN_ALLOWED_TOOLS") {
            self.safety.allowed_tools = split_list(&v).collect();
        }
        if let Some(v) = lookup("WARDEN_DENIED_TOOLS") {
            self.safety.denied_tools = split_list(&v).collect();
        }

        let subagent_mappings: [(&str, &mut usize); 6] = [
            ("WARDEN_SUBAGENT_MAX_CONCURRENT", &mut self.subagent.max_concurrent),
            ("WARDEN_SUBAGENT_MAX_TOTAL", &mut self.subagent.max_total),
            ("WARDEN_SUBAGENT_MAX_DEPTH", &mut self.subagent.max_depth),
            ("WARDEN_SUBAGENT_MAX_ITERATIONS", &mut self.subagent.max_iterations),
            ("WARDEN_SUBAGENT_MAX_OUTPUT_CHARS", &mut self.subagent.max_output_chars),
            ("WARDEN_SUBAGENT_MAX_PROMPT_CHARS", &mut self.subagent.max_prompt_chars),
        ];
        for (key, slot) in subagent_mappings {
            if let Some(v) = lookup(key) {
                *slot = parse_env(key, &v)?;
            }
        }
        if let Some(v) = lookup("WARDEN_SUBAGENT_TIMEOUT") {
            self.subagent.timeout = parse_env("WARDEN_SUBAGENT_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("WARDEN_MAX_ITERATIONS") {
            self.agent.max_iterations = parse_env("WARDEN_MAX_ITERATIONS", &v)?;
        }

        if let Some(v) = lookup("OPENAI_API_KEY") {
            self.provider.api_key = Some(v);
        }
        if let Some(v) = lookup("OPENAI_BASE_URL") {
            self.provider.base_url = v;
        }
        if let Some(v) = lookup("WARDEN_MODEL") {
            self.provider.model = v;
        }
        Ok(())
    }

    /// Clamp every value into its supported range.
    pub fn normalized(mut self) -> Self {
        let safety = &mut self.safety;
        safety.approval_timeout = safety.approval_timeout.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
        safety.max_pending_approvals = safety.max_pending_approvals.clamp(1, MAX_PENDING_APPROVALS);

        let sub = &mut self.subagent;
        sub.timeout = sub.timeout.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
        sub.max_concurrent = sub.max_concurrent.max(1);
        sub.max_total = sub.max_total.max(1);
        sub.max_depth = sub.max_depth.max(1);
        sub.max_iterations = sub.max_iterations.max(1);
        sub.max_output_chars = sub.max_output_chars.max(1);
        sub.max_prompt_chars = sub.max_prompt_chars.max(1);

        let agent = &mut self.agent;
        agent.max_iterations = agent.max_iterations.max(1);
        agent.queue_capacity = agent.queue_capacity.max(1);
        agent.retry_attempts = agent.retry_attempts.max(1);

        self.events.poll_interval_ms = self.events.poll_interval_ms.max(10);
        self.events.subscriber_buffer = self.events.subscriber_buffer.max(1);
        self.events.poll_batch = self.events.poll_batch.max(1);
        self
    }

    /// Age after which a stream session is considered abandoned.
    pub fn stale_after(&self) -> Duration {
        self.safety.approval_timeout() + Duration::from_secs(self.agent.stale_buffer_secs)
    }
}

fn parse_env<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| WardenError::Configuration(format!("{key}={raw:?}: {e}")))
}

fn split_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn empty_document_yields_defaults() {
        let config = WardenConfig::from_toml_str("").unwrap();
        assert_eq!(config, WardenConfig::default());
        assert_eq!(config.safety.approval_mode, ApprovalMode::AskForWrites);
        assert_eq!(config.subagent.max_concurrent, 5);
        assert_eq!(config.agent.queue_capacity, 10);
    }

    #[test]
    fn parses_nested_sections_and_ask_alias() {
        let config = WardenConfig::from_toml_str(
            r#"
            [safety]
            approval_mode = "ask"
            approval_timeout = 30
            denied_tools = ["delete_file"]
            custom_patterns = ["terraform destroy"]

            [safety.tool_tiers]
            deploy = "destructive"

            [subagent]
            max_concurrent = 2
            inherit_session_grants = true
            "#,
        )
        .unwrap();

        assert_eq!(config.safety.approval_mode, ApprovalMode::AskForWrites);
        assert_eq!(config.safety.approval_timeout, 30);
        assert!(config.safety.denied_tools.contains("delete_file"));
        assert_eq!(config.safety.tool_tiers["deploy"], ToolTier::Destructive);
        assert_eq!(config.subagent.max_concurrent, 2);
        assert!(config.subagent.inherit_session_grants);
        assert_eq!(config.subagent.max_total, 10);
    }

    #[test]
    fn timeouts_are_clamped() {
        let low = WardenConfig::from_toml_str("[safety]\napproval_timeout = 1\n[subagent]\ntimeout = 0").unwrap();
        assert_eq!(low.safety.approval_timeout, MIN_TIMEOUT_SECS);
        assert_eq!(low.subagent.timeout, MIN_TIMEOUT_SECS);

        let high = WardenConfig::from_toml_str("[safety]\napproval_timeout = 9000\nmax_pending_approvals = 5000").unwrap();
        assert_eq!(high.safety.approval_timeout, MAX_TIMEOUT_SECS);
        assert_eq!(high.safety.max_pending_approvals, MAX_PENDING_APPROVALS);
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("WARDEN_APPROVAL_MODE", "auto"),
            ("WARDEN_DENIED_TOOLS", "run_command, delete_file,"),
            ("WARDEN_SUBAGENT_MAX_DEPTH", "2"),
            ("OPENAI_API_KEY", "sk-test"),
        ]);
        let mut config = WardenConfig::default();
        config
            .apply_env_with(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.safety.approval_mode, ApprovalMode::Auto);
        assert_eq!(
            config.safety.denied_tools,
            BTreeSet::from(["delete_file".to_string(), "run_command".to_string()])
        );
        assert_eq!(config.subagent.max_depth, 2);
        assert_eq!(config.provider.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn invalid_environment_value_is_reported() {
        let mut config = WardenConfig::default();
        let err = config
            .apply_env_with(|key| (key == "WARDEN_SUBAGENT_MAX_TOTAL").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("WARDEN_SUBAGENT_MAX_TOTAL"));
    }

    #[test]
    fn save_and_load_round_trip_without_api_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let mut config = WardenConfig::default();
        config.safety.allowed_tools.insert("read_file".into());
        config.provider.api_key = Some("secret".into());

        config.save(&path).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("secret"));

        let loaded = WardenConfig::load(&path).unwrap();
        assert!(loaded.safety.allowed_tools.contains("read_file"));
        assert_eq!(loaded.provider.api_key, None);
    }

    #[test]
    fn stale_threshold_adds_buffer_to_approval_timeout() {
        let config = WardenConfig::default();
        assert_eq!(config.stale_after(), Duration::from_secs(150));
    }
}
