//! Tool risk classification.
//!
//! Everything here is pure: tiers, approval modes, [`classify`] and the
//! [`PatternDetector`] take their inputs by reference and touch no shared
//! state, so the same inputs always produce the same [`Classification`].

pub mod patterns;

pub use patterns::{PatternDetector, PatternMatch, PatternSeverity};

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::SafetyConfig;
use crate::error::Result;

/// Ordinal risk classification of a tool.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ToolTier {
    Read = 0,
    Write = 1,
    Execute = 2,
    Destructive = 3,
}

/// Policy mapping tiers to whether a human must confirm.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ApprovalMode {
    /// Never prompt on tier alone.
    Auto,
    /// Prompt for destructive tools only.
    AskForDangerous,
    /// Prompt for anything above read-only. `ask` is accepted as an alias.
    #[default]
    #[serde(alias = "ask")]
    #[strum(to_string = "ask_for_writes", serialize = "ask")]
    AskForWrites,
}

impl ApprovalMode {
    /// Lowest tier that requires approval, or `None` when nothing does.
    pub fn threshold(self) -> Option<ToolTier> {
        match self {
            Self::Auto => None,
            Self::AskForDangerous => Some(ToolTier::Destructive),
            Self::AskForWrites => Some(ToolTier::Write),
        }
    }
}

/// Tri-state outcome of classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    HardDeny,
    AutoAllow,
    RequireApproval,
}

/// Default tier for the built-in tools.
pub fn default_tier(tool: &str) -> Option<ToolTier> {
    let tier = match tool {
        "read_file" | "list_directory" | "search_files" => ToolTier::Read,
        "write_file" | "edit_file" => ToolTier::Write,
        "run_command" | "run_agent" => ToolTier::Execute,
        "delete_file" => ToolTier::Destructive,
        _ => return None,
    };
    Some(tier)
}

/// Resolve a tool's tier: configured override, then built-in default, then `Execute`.
pub fn resolve_tier(tool: &str, overrides: &BTreeMap<String, ToolTier>) -> ToolTier {
    overrides
        .get(tool)
        .copied()
        .or_else(|| default_tier(tool))
        .unwrap_or(ToolTier::Execute)
}

/// Classify a call by tool name and tier alone.
///
/// Deny-list beats allow-list, allow-list beats the mode threshold.
#[must_use]
pub fn classify(
    tool: &str,
    tier: ToolTier,
    mode: ApprovalMode,
    allowed: &BTreeSet<String>,
    denied: &BTreeSet<String>,
) -> Classification {
    if denied.contains(tool) {
        return Classification::HardDeny;
    }
    if allowed.contains(tool) {
        return Classification::AutoAllow;
    }
    match mode.threshold() {
        Some(threshold) if tier >= threshold => Classification::RequireApproval,
        _ => Classification::AutoAllow,
    }
}

/// Result of evaluating one call against a [`SafetyPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub tier: ToolTier,
    pub classification: Classification,
    /// Pattern that escalated the decision, if one matched.
    pub pattern: Option<PatternMatch>,
}

impl Verdict {
    /// Human-readable reason for prompting, used in approval requests.
    pub fn reason(&self) -> String {
        match &self.pattern {
            Some(hit) => hit.description.clone(),
            None => format!("{} tool requires approval", self.tier),
        }
    }
}

/// Compiled safety settings: classification inputs plus the pattern detector.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    mode: ApprovalMode,
    allowed: BTreeSet<String>,
    denied: BTreeSet<String>,
    tiers: BTreeMap<String, ToolTier>,
    detector: PatternDetector,
}

impl SafetyPolicy {
    /// Compile a policy from configuration. Invalid custom patterns are rejected.
    pub fn from_config(config: &SafetyConfig) -> Result<Self> {
        Ok(Self {
            mode: config.approval_mode,
            allowed: config.allowed_tools.clone(),
            denied: config.denied_tools.clone(),
            tiers: config.tool_tiers.clone(),
            detector: PatternDetector::new(&config.custom_patterns, &config.sensitive_paths)?,
        })
    }

    pub fn mode(&self) -> ApprovalMode {
        self.mode
    }

    pub fn tier_of(&self, tool: &str) -> ToolTier {
        resolve_tier(tool, &self.tiers)
    }

    /// Tier for a registered tool: a configured override wins over the
    /// tier the tool was registered with.
    pub fn effective_tier(&self, tool: &str, registered: ToolTier) -> ToolTier {
        self.tiers.get(tool).copied().unwrap_or(registered)
    }

    /// Add a tool to the allow-list (used for persisted "always" grants).
    pub fn allow(&mut self, tool: impl Into<String>) {
        self.allowed.insert(tool.into());
    }

    /// Evaluate one call.
    ///
    /// `session_granted` marks tools approved earlier in this process run;
    /// they are treated like allow-listed tools. A pattern hit escalates
    /// auto-allowed calls to approval: critical rules in every mode, caution
    /// rules in every mode except [`ApprovalMode::Auto`]. Denied tools stay
    /// denied.
    #[must_use]
    pub fn evaluate(
        &self,
        tool: &str,
        tier: ToolTier,
        arguments: &serde_json::Value,
        session_granted: bool,
    ) -> Verdict {
        let mut classification = classify(tool, tier, self.mode, &self.allowed, &self.denied);
        if classification == Classification::RequireApproval && session_granted {
            classification = Classification::AutoAllow;
        }
        if classification == Classification::HardDeny {
            return Verdict {
                tier,
                classification,
                pattern: None,
            };
        }

        let pattern = self.detector.inspect(tier, arguments);
        if let Some(hit) = &pattern {
            let escalate = match hit.severity {
                PatternSeverity::Critical => true,
                PatternSeverity::Caution => self.mode != ApprovalMode::Auto,
            };
            if escalate {
                classification = Classification::RequireApproval;
            }
        }

        Verdict {
            tier,
            classification,
            pattern,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn tiers_are_ordered() {
        assert!(ToolTier::Read < ToolTier::Write);
        assert!(ToolTier::Write < ToolTier::Execute);
        assert!(ToolTier::Execute < ToolTier::Destructive);
    }

    #[test]
    fn ask_parses_as_ask_for_writes() {
        assert_eq!(ApprovalMode::from_str("ask").unwrap(), ApprovalMode::AskForWrites);
        assert_eq!(
            ApprovalMode::from_str("ask_for_writes").unwrap(),
            ApprovalMode::AskForWrites
        );
        let mode: ApprovalMode = serde_json::from_value(json!("ask")).unwrap();
        assert_eq!(mode, ApprovalMode::AskForWrites);
        assert_eq!(ApprovalMode::AskForWrites.to_string(), "ask_for_writes");
        assert_eq!(serde_json::to_value(mode).unwrap(), json!("ask_for_writes"));
    }

    #[test]
    fn unknown_tools_default_to_execute() {
        let overrides = BTreeMap::new();
        assert_eq!(resolve_tier("mcp_fetch", &overrides), ToolTier::Execute);
        assert_eq!(resolve_tier("read_file", &overrides), ToolTier::Read);
        assert_eq!(resolve_tier("delete_file", &overrides), ToolTier::Destructive);
    }

    #[test]
    fn overrides_win_over_builtin_tiers() {
        let overrides = BTreeMap::from([("read_file".to_string(), ToolTier::Destructive)]);
        assert_eq!(resolve_tier("read_file", &overrides), ToolTier::Destructive);
    }

    #[test]
    fn ask_for_writes_requires_approval_for_write_tier() {
        let verdict = classify(
            "write_file",
            ToolTier::Write,
            ApprovalMode::AskForWrites,
            &set(&[]),
            &set(&[]),
        );
        assert_eq!(verdict, Classification::RequireApproval);
    }

    #[test]
    fn mode_thresholds() {
        let none = set(&[]);
        let cases = [
            (ApprovalMode::Auto, ToolTier::Destructive, Classification::AutoAllow),
            (ApprovalMode::AskForDangerous, ToolTier::Execute, Classification::AutoAllow),
            (ApprovalMode::AskForDangerous, ToolTier::Destructive, Classification::RequireApproval),
            (ApprovalMode::AskForWrites, ToolTier::Read, Classification::AutoAllow),
            (ApprovalMode::AskForWrites, ToolTier::Execute, Classification::RequireApproval),
        ];
        for (mode, tier, expected) in cases {
            assert_eq!(classify("t", tier, mode, &none, &none), expected, "{mode} {tier}");
        }
    }

    #[test]
    fn deny_list_wins_in_every_mode() {
        let denied = set(&["run_command"]);
        let allowed = set(&["run_command"]);
        for mode in [
            ApprovalMode::Auto,
            ApprovalMode::AskForDangerous,
            ApprovalMode::AskForWrites,
        ] {
            for tier in [ToolTier::Read, ToolTier::Destructive] {
                assert_eq!(
                    classify("run_command", tier, mode, &allowed, &denied),
                    Classification::HardDeny
                );
            }
        }
    }

    #[test]
    fn classify_is_repeatable() {
        let allowed = set(&["read_file"]);
        let denied = set(&["delete_file"]);
        let first = classify("edit_file", ToolTier::Write, ApprovalMode::AskForWrites, &allowed, &denied);
        for _ in 0..16 {
            assert_eq!(
                classify("edit_file", ToolTier::Write, ApprovalMode::AskForWrites, &allowed, &denied),
                first
            );
        }
        assert_eq!(allowed, set(&["read_file"]));
        assert_eq!(denied, set(&["delete_file"]));
    }

    fn policy(mode: ApprovalMode) -> SafetyPolicy {
        SafetyPolicy::from_config(&SafetyConfig {
            approval_mode: mode,
            ..SafetyConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn recursive_delete_prompts_even_in_auto_mode() {
        let verdict = policy(ApprovalMode::Auto).evaluate(
            "run_command",
            ToolTier::Destructive,
            &json!({ "command": "rm -rf ./build" }),
            false,
        );
        assert_eq!(verdict.classification, Classification::RequireApproval);
        assert!(verdict.pattern.is_some());
    }

    #[test]
    fn caution_patterns_escalate_except_in_auto() {
        let args = json!({ "command": "sudo apt-get install jq" });
        let mut allow = policy(ApprovalMode::AskForWrites);
        allow.allow("run_command");

        let escalated = allow.evaluate("run_command", ToolTier::Execute, &args, false);
        assert_eq!(escalated.classification, Classification::RequireApproval);

        let auto = policy(ApprovalMode::Auto).evaluate("run_command", ToolTier::Execute, &args, false);
        assert_eq!(auto.classification, Classification::AutoAllow);
    }

    #[test]
    fn session_grant_skips_prompt_but_not_patterns() {
        let p = policy(ApprovalMode::AskForWrites);
        let plain = p.evaluate("run_command", ToolTier::Execute, &json!({ "command": "ls" }), true);
        assert_eq!(plain.classification, Classification::AutoAllow);

        let risky = p.evaluate(
            "run_command",
            ToolTier::Execute,
            &json!({ "command": "git push --force origin main" }),
            true,
        );
        assert_eq!(risky.classification, Classification::RequireApproval);
    }

    #[test]
    fn hard_deny_ignores_patterns() {
        let mut config = SafetyConfig::default();
        config.denied_tools.insert("run_command".into());
        let verdict = SafetyPolicy::from_config(&config).unwrap().evaluate(
            "run_command",
            ToolTier::Execute,
            &json!({ "command": "rm -rf /" }),
            false,
        );
        assert_eq!(verdict.classification, Classification::HardDeny);
        assert!(verdict.pattern.is_none());
    }
}
