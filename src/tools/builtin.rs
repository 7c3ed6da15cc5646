//! Built-in file and shell tools.
//!
//! Each tool is an [`AgentTool`] with a fixed tier: `read_file` and
//! `list_directory` read, `write_file` and `edit_file` write, `run_command`
//! executes and `delete_file` is destructive. Large outputs are truncated so
//! a single call cannot flood the model's context.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::WardenError;
use crate::safety::ToolTier;
use crate::tools::tool::{AgentTool, Tool, ToolContext};
use crate::tools::types::ToolParameters;
use crate::util::text::{truncate_utf8, TRUNCATION_MARKER};

const COMMAND_OUTPUT_MAX_BYTES: usize = 32_768;
const READ_FILE_MAX_BYTES: usize = 65_536;
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

fn io_error(tool: &str, path: &str, err: std::io::Error) -> WardenError {
    WardenError::tool(tool, format!("{path}: {err}"))
}

fn capped(text: &str, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text.to_string(), false);
    }
    (format!("{}{TRUNCATION_MARKER}", truncate_utf8(text, max_bytes)), true)
}

/// `read_file`: read a UTF-8 file, capped at 64 KB.
pub fn read_file_tool() -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "read_file",
            "Read a file's contents as UTF-8 text",
            ToolParameters::object()
                .string("path", "Path to the file to read", true)
                .build(),
            |args, _ctx: ToolContext| async move {
                let path = args.get_str("path")?;
                let content = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| io_error("read_file", path, e))?;
                let (display, truncated) = capped(&content, READ_FILE_MAX_BYTES);
                Ok(serde_json::json!({
                    "content": display,
                    "bytes": content.len(),
                    "truncated": truncated,
                }))
            },
        )
        .with_tier(ToolTier::Read),
    )
}

/// `list_directory`: sorted entries with name, type and size.
pub fn list_directory_tool() -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "list_directory",
            "List files and directories in a given path",
            ToolParameters::object()
                .string("path", "Directory to list", true)
                .build(),
            |args, _ctx: ToolContext| async move {
                let path = args.get_str("path")?;
                let mut read_dir = tokio::fs::read_dir(path)
                    .await
                    .map_err(|e| io_error("list_directory", path, e))?;

                let mut entries = Vec::new();
                while let Some(entry) = read_dir
                    .next_entry()
                    .await
                    .map_err(|e| io_error("list_directory", path, e))?
                {
                    let metadata = entry
                        .metadata()
                        .await
                        .map_err(|e| io_error("list_directory", path, e))?;
                    let kind = if metadata.is_dir() {
                        "dir"
                    } else if metadata.is_file() {
                        "file"
                    } else {
                        "other"
                    };
                    entries.push((
                        entry.file_name().to_string_lossy().into_owned(),
                        kind,
                        metadata.len(),
                    ));
                }
                entries.sort_by(|a, b| a.0.cmp(&b.0));

                let count = entries.len();
                let entries: Vec<_> = entries
                    .into_iter()
                    .map(|(name, kind, size)| {
                        serde_json::json!({ "name": name, "type": kind, "size": size })
                    })
                    .collect();
                Ok(serde_json::json!({ "path": path, "entries": entries, "count": count }))
            },
        )
        .with_tier(ToolTier::Read),
    )
}

/// `write_file`: create or overwrite a file, creating parent directories.
pub fn write_file_tool() -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "write_file",
            "Write content to a file, creating parent directories if needed",
            ToolParameters::object()
                .string("path", "Path to the file to write", true)
                .string("content", "Content to write to the file", true)
                .build(),
            |args, _ctx: ToolContext| async move {
                let path = args.get_str("path")?;
                let content = args.get_str("content")?;
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| io_error("write_file", path, e))?;
                    }
                }
                tokio::fs::write(path, content)
                    .await
                    .map_err(|e| io_error("write_file", path, e))?;
                Ok(serde_json::json!({ "path": path, "bytes_written": content.len() }))
            },
        )
        .with_tier(ToolTier::Write),
    )
}

#[derive(serde::Deserialize)]
struct EditArgs {
    path: String,
    old_text: String,
    new_text: String,
    #[serde(default)]
    replace_all: bool,
}

/// `edit_file`: exact string replacement. The old text must be unique unless
/// `replace_all` is set.
pub fn edit_file_tool() -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "edit_file",
            "Replace exact text in a file",
            ToolParameters::object()
                .string("path", "File to edit", true)
                .string("old_text", "Exact text to replace", true)
                .string("new_text", "Replacement text", true)
                .boolean("replace_all", "Replace every occurrence", false)
                .build(),
            |args, _ctx: ToolContext| async move {
                let edit: EditArgs = args.deserialize()?;
                if edit.old_text.is_empty() {
                    return Err(WardenError::InvalidArgument("old_text must not be empty".into()));
                }
                let original = tokio::fs::read_to_string(&edit.path)
                    .await
                    .map_err(|e| io_error("edit_file", &edit.path, e))?;
                let occurrences = original.matches(&edit.old_text).count();
                match occurrences {
                    0 => {
                        return Err(WardenError::tool(
                            "edit_file",
                            format!("old_text not found in {}", edit.path),
                        ))
                    }
                    n if n > 1 && !edit.replace_all => {
                        return Err(WardenError::tool(
                            "edit_file",
                            format!("old_text occurs {n} times in {}; set replace_all", edit.path),
                        ))
                    }
                    _ => {}
                }
                let updated = if edit.replace_all {
                    original.replace(&edit.old_text, &edit.new_text)
                } else {
                    original.replacen(&edit.old_text, &edit.new_text, 1)
                };
                tokio::fs::write(&edit.path, updated)
                    .await
                    .map_err(|e| io_error("edit_file", &edit.path, e))?;
                let replaced = if edit.replace_all { occurrences } else { 1 };
                Ok(serde_json::json!({ "path": edit.path, "replacements": replaced }))
            },
        )
        .with_tier(ToolTier::Write),
    )
}

/// `delete_file`: remove a file, or a directory tree when `recursive` is set.
pub fn delete_file_tool() -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "delete_file",
            "Delete a file or directory",
            ToolParameters::object()
                .string("path", "Path to delete", true)
                .boolean("recursive", "Delete directories and their contents", false)
                .build(),
            |args, _ctx: ToolContext| async move {
                let path = args.get_str("path")?;
                let recursive = args.get_bool_or("recursive", false);
                let metadata = tokio::fs::metadata(path)
                    .await
                    .map_err(|e| io_error("delete_file", path, e))?;
                let result = if metadata.is_dir() {
                    if recursive {
                        tokio::fs::remove_dir_all(path).await
                    } else {
                        tokio::fs::remove_dir(path).await
                    }
                } else {
                    tokio::fs::remove_file(path).await
                };
                result.map_err(|e| io_error("delete_file", path, e))?;
                Ok(serde_json::json!({ "path": path, "deleted": true }))
            },
        )
        .with_tier(ToolTier::Destructive),
    )
}

/// `run_command`: run `sh -c <command>`, honouring cancellation and a timeout.
pub fn run_command_tool() -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "run_command",
            "Execute a shell command and return its output",
            ToolParameters::object()
                .string("command", "The shell command to execute", true)
                .string("cwd", "Working directory", false)
                .integer("timeout_secs", "Timeout in seconds (default 60, max 600)", false)
                .build(),
            |args, ctx: ToolContext| async move {
                let command = args.get_str("command")?;
                let timeout = args
                    .get_u64_opt("timeout_secs")
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_COMMAND_TIMEOUT)
                    .min(MAX_COMMAND_TIMEOUT);

                let mut cmd = tokio::process::Command::new("sh");
                cmd.arg("-c").arg(command).kill_on_drop(true);
                if let Some(cwd) = args.get_str_opt("cwd") {
                    cmd.current_dir(cwd);
                }

                let output = tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(WardenError::Canceled),
                    result = tokio::time::timeout(timeout, cmd.output()) => match result {
                        Ok(output) => output.map_err(|e| WardenError::tool("run_command", e.to_string()))?,
                        Err(_) => {
                            return Err(WardenError::tool(
                                "run_command",
                                format!("command timed out after {}s", timeout.as_secs()),
                            ))
                        }
                    },
                };

                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let (combined, truncated) = capped(&format!("{stdout}{stderr}"), COMMAND_OUTPUT_MAX_BYTES);
                Ok(serde_json::json!({
                    "exit_code": output.status.code(),
                    "output": combined,
                    "truncated": truncated,
                }))
            },
        )
        .with_tier(ToolTier::Execute),
    )
}

/// All built-in file and shell tools (`run_agent` is registered separately).
pub fn all_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        read_file_tool(),
        list_directory_tool(),
        write_file_tool(),
        edit_file_tool(),
        run_command_tool(),
        delete_file_tool(),
    ]
}
