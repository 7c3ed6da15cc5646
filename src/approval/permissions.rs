//! Tools granted for the rest of the process run.

use std::collections::BTreeSet;
use std::sync::RwLock;

/// In-memory set of tool names approved with session (or always) scope.
///
/// Owned by the serving-process context; nothing here is persisted.
#[derive(Debug, Default)]
pub struct SessionPermissions {
    tools: RwLock<BTreeSet<String>>,
}

impl SessionPermissions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, tool: impl Into<String>) {
        match self.tools.write() {
            Ok(mut tools) => {
                tools.insert(tool.into());
            }
            Err(e) => tracing::error!("session permissions lock poisoned on grant: {e}"),
        }
    }

    /// Returns whether the tool had been granted.
    pub fn revoke(&self, tool: &str) -> bool {
        match self.tools.write() {
            Ok(mut tools) => tools.remove(tool),
            Err(e) => {
                tracing::error!("session permissions lock poisoned on revoke: {e}");
                false
            }
        }
    }

    /// Poisoned lock reads as "not granted".
    #[must_use]
    pub fn contains(&self, tool: &str) -> bool {
        self.tools
            .read()
            .map(|tools| tools.contains(tool))
            .unwrap_or(false)
    }

    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.tools
            .read()
            .map(|tools| tools.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut tools) = self.tools.write() {
            tools.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_revoke_cycle() {
        let perms = SessionPermissions::new();
        assert!(!perms.contains("write_file"));

        perms.grant("write_file");
        perms.grant("run_command");
        assert!(perms.contains("write_file"));
        assert_eq!(perms.list(), vec!["run_command".to_string(), "write_file".to_string()]);

        assert!(perms.revoke("write_file"));
        assert!(!perms.revoke("write_file"));
        perms.clear();
        assert!(perms.list().is_empty());
    }
}
