//! Dangerous-argument detection.
//!
//! Rules are regular expressions matched case-insensitively against the
//! command text of execute-style calls and the target path of write-style
//! calls. Critical rules cover the short list of operations that must
//! always prompt (recursive delete, forced history rewrite, credential
//! files); caution rules, including every configured pattern, are relaxed
//! in auto mode.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::ToolTier;
use crate::error::{Result, WardenError};

/// How strongly a matched rule escalates a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSeverity {
    /// Prompt in every approval mode.
    Critical,
    /// Prompt in every mode except auto.
    Caution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Command,
    Path,
}

/// Built-in rules: (id, severity, target, regex, description).
const BUILTIN_RULES: &[(&str, PatternSeverity, Target, &str, &str)] = &[
    (
        "recursive-delete",
        PatternSeverity::Critical,
        Target::Command,
        r"\brm\s+(?:-[a-z]+\s+)*-[a-z]*(?:r[a-z]*f|f[a-z]*r)",
        "recursive forced delete",
    ),
    (
        "recursive-delete-split-flags",
        PatternSeverity::Critical,
        Target::Command,
        r"\brm\s+-[a-z]*[rf][a-z]*\s+-[a-z]*[rf]|\brm\b[^;&|\n]*--(?:recursive|force)[^;&|\n]*--(?:recursive|force)",
        "recursive forced delete",
    ),
    (
        "force-push",
        PatternSeverity::Critical,
        Target::Command,
        r"\bgit\s+push\b[^;&|\n]*(?:\s--force(?:-with-lease)?\b|\s-f\b|\s\+\S)",
        "forced git push rewrites remote history",
    ),
    (
        "history-rewrite",
        PatternSeverity::Critical,
        Target::Command,
        r"\bgit\s+(?:reset\s+--hard|filter-branch|filter-repo)\b",
        "git history rewrite",
    ),
    (
        "credential-file-command",
        PatternSeverity::Critical,
        Target::Command,
        r"(?:>|\btee\b|\bcp\b|\bmv\b)[^;&|\n]*(?:\.ssh/|\.aws/credentials|\.git-credentials|\.netrc\b)",
        "command writes to a credential file",
    ),
    (
        "privilege-escalation",
        PatternSeverity::Caution,
        Target::Command,
        r"(?:^|[;&|]\s*|\s)sudo\s",
        "privilege escalation with sudo",
    ),
    (
        "pipe-to-shell",
        PatternSeverity::Caution,
        Target::Command,
        r"\|\s*(?:ba|z)?sh\b",
        "downloaded content piped into a shell",
    ),
    (
        "git-discard",
        PatternSeverity::Caution,
        Target::Command,
        r"\bgit\s+(?:clean\s+-[a-z]*f|checkout\s+--?\s*\.|restore\s+\.)",
        "git command discards local changes",
    ),
    (
        "disk-write",
        PatternSeverity::Caution,
        Target::Command,
        r"\bmkfs(?:\.\w+)?\b|\bdd\s+[^;&|\n]*of=/dev/|>\s*/dev/sd[a-z]",
        "raw disk write",
    ),
    (
        "world-writable",
        PatternSeverity::Caution,
        Target::Command,
        r"\bchmod\s+(?:-R\s+)?777\b",
        "world-writable permissions",
    ),
    (
        "fork-bomb",
        PatternSeverity::Caution,
        Target::Command,
        r":\(\)\s*\{\s*:\|:&\s*\};:",
        "fork bomb",
    ),
    (
        "credential-path",
        PatternSeverity::Critical,
        Target::Path,
        r"(?:^|/)(?:\.ssh/|\.gnupg/|\.aws/credentials$|\.netrc$|\.git-credentials$|\.kube/config$|\.docker/config\.json$|id_(?:rsa|dsa|ecdsa|ed25519)(?:\.pub)?$)",
        "write to a credential file",
    ),
    (
        "dotenv-path",
        PatternSeverity::Critical,
        Target::Path,
        r"(?:^|/)\.env(?:\.[\w.-]+)?$",
        "write to an environment secrets file",
    ),
    (
        "system-path",
        PatternSeverity::Caution,
        Target::Path,
        r"^/(?:etc|usr|bin|sbin|boot|lib)/",
        "write to a system directory",
    ),
    (
        "shell-profile",
        PatternSeverity::Caution,
        Target::Path,
        r"(?:^|/)(?:\.bashrc|\.zshrc|\.profile|\.bash_profile)$|(?:^|/)\.git/",
        "write to shell profile or git internals",
    ),
];

const COMMAND_KEYS: &[&str] = &["command", "cmd", "script"];
const PATH_KEYS: &[&str] = &["path", "file_path", "target", "destination"];

/// A rule that matched a call's arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub rule: String,
    pub description: String,
    pub severity: PatternSeverity,
    /// The command or path that matched.
    pub subject: String,
}

#[derive(Debug, Clone)]
struct Rule {
    id: String,
    description: String,
    severity: PatternSeverity,
    target: Target,
    regex: Regex,
}

impl Rule {
    fn compile(
        id: impl Into<String>,
        description: impl Into<String>,
        severity: PatternSeverity,
        target: Target,
        pattern: &str,
    ) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| WardenError::Configuration(format!("invalid pattern '{pattern}': {e}")))?;
        Ok(Self {
            id: id.into(),
            description: description.into(),
            severity,
            target,
            regex,
        })
    }
}

/// Compiled rule set: built-ins plus configured patterns and sensitive paths.
#[derive(Debug, Clone)]
pub struct PatternDetector {
    rules: Vec<Rule>,
}

impl PatternDetector {
    /// Built-in rules only.
    pub fn builtin() -> Self {
        let rules = BUILTIN_RULES
            .iter()
            .filter_map(|(id, severity, target, pattern, description)| {
                Rule::compile(*id, *description, *severity, *target, pattern)
                    .map_err(|e| tracing::error!(rule = id, error = %e, "built-in pattern failed to compile"))
                    .ok()
            })
            .collect();
        Self { rules }
    }

    /// Built-ins plus `custom_patterns` (regexes over command text) and
    /// `sensitive_paths` (literal path fragments, `~/` stripped).
    pub fn new(custom_patterns: &[String], sensitive_paths: &[String]) -> Result<Self> {
        let mut detector = Self::builtin();
        for (idx, pattern) in custom_patterns.iter().enumerate() {
            detector.rules.push(Rule::compile(
                format!("custom-{idx}"),
                format!("matches configured pattern '{pattern}'"),
                PatternSeverity::Caution,
                Target::Command,
                pattern,
            )?);
        }
        for (idx, path) in sensitive_paths.iter().enumerate() {
            let fragment = path.trim_start_matches("~/");
            if fragment.is_empty() {
                continue;
            }
            detector.rules.push(Rule::compile(
                format!("sensitive-path-{idx}"),
                format!("write to sensitive path '{path}'"),
                PatternSeverity::Caution,
                Target::Path,
                &regex::escape(fragment),
            )?);
        }
        Ok(detector)
    }

    /// Inspect a call's arguments. Critical hits are preferred over caution hits.
    ///
    /// Path rules only apply to tools that can modify files (`Write` and above).
    pub fn inspect(&self, tier: ToolTier, arguments: &serde_json::Value) -> Option<PatternMatch> {
        let commands = string_fields(arguments, COMMAND_KEYS);
        let paths = if tier >= ToolTier::Write {
            string_fields(arguments, PATH_KEYS)
        } else {
            Vec::new()
        };

        let mut best: Option<PatternMatch> = None;
        for rule in &self.rules {
            let subjects = match rule.target {
                Target::Command => &commands,
                Target::Path => &paths,
            };
            let Some(subject) = subjects.iter().find(|s| rule.regex.is_match(s)) else {
                continue;
            };
            let hit = PatternMatch {
                rule: rule.id.clone(),
                description: rule.description.clone(),
                severity: rule.severity,
                subject: subject.to_string(),
            };
            if hit.severity == PatternSeverity::Critical {
                return Some(hit);
            }
            best.get_or_insert(hit);
        }
        best
    }
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::builtin()
    }
}

fn string_fields<'a>(arguments: &'a serde_json::Value, keys: &[&str]) -> Vec<&'a str> {
    keys.iter()
        .filter_map(|key| arguments.get(*key).and_then(|v| v.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command(detector: &PatternDetector, cmd: &str) -> Option<PatternMatch> {
        detector.inspect(ToolTier::Execute, &json!({ "command": cmd }))
    }

    #[test]
    fn recursive_delete_variants_are_critical() {
        let detector = PatternDetector::builtin();
        for cmd in [
            "rm -rf build",
            "RM -RF /tmp/x",
            "rm -fr .",
            "rm -v -rf target",
            "rm -r -f target",
            "cd /tmp && rm --recursive --force cache",
        ] {
            let hit = command(&detector, cmd).unwrap_or_else(|| panic!("no match for {cmd}"));
            assert_eq!(hit.severity, PatternSeverity::Critical, "{cmd}");
        }
    }

    #[test]
    fn plain_commands_do_not_match() {
        let detector = PatternDetector::builtin();
        for cmd in ["ls -la", "rm notes.txt", "git push origin main", "cargo fmt"] {
            assert!(command(&detector, cmd).is_none(), "{cmd}");
        }
    }

    #[test]
    fn force_push_and_hard_reset_are_critical() {
        let detector = PatternDetector::builtin();
        assert_eq!(command(&detector, "git push --force origin main").unwrap().rule, "force-push");
        assert_eq!(command(&detector, "git push -f").unwrap().rule, "force-push");
        assert_eq!(command(&detector, "git reset --hard HEAD~3").unwrap().rule, "history-rewrite");
    }

    #[test]
    fn credential_paths_only_checked_for_writing_tools() {
        let detector = PatternDetector::builtin();
        let args = json!({ "path": "/home/dev/.ssh/authorized_keys" });
        assert_eq!(
            detector.inspect(ToolTier::Write, &args).unwrap().severity,
            PatternSeverity::Critical
        );
        assert!(detector.inspect(ToolTier::Read, &args).is_none());
        assert!(detector
            .inspect(ToolTier::Write, &json!({ "path": "project/.env.local" }))
            .is_some());
    }

    #[test]
    fn custom_patterns_and_sensitive_paths_are_caution() {
        let detector = PatternDetector::new(
            &[r"terraform\s+destroy".to_string()],
            &["~/secrets/prod.yaml".to_string()],
        )
        .unwrap();

        let hit = command(&detector, "terraform destroy -auto-approve").unwrap();
        assert_eq!(hit.rule, "custom-0");
        assert_eq!(hit.severity, PatternSeverity::Caution);

        let path_hit = detector
            .inspect(ToolTier::Write, &json!({ "path": "/home/me/secrets/prod.yaml" }))
            .unwrap();
        assert_eq!(path_hit.rule, "sensitive-path-0");
    }

    #[test]
    fn invalid_custom_pattern_is_a_configuration_error() {
        let err = PatternDetector::new(&["(unclosed".to_string()], &[]).unwrap_err();
        assert!(matches!(err, WardenError::Configuration(_)));
    }

    #[test]
    fn critical_hit_preferred_over_caution() {
        let detector = PatternDetector::builtin();
        let hit = command(&detector, "sudo rm -rf /var/cache").unwrap();
        assert_eq!(hit.severity, PatternSeverity::Critical);
    }
}
