use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;

use crate::config::FlotillaConfig;
use crate::error::Result;
use crate::task::Task;

use super::spawner::AgentRole;

/// Everything the watcher hook script needs to police one agent.
#[derive(Debug, Clone)]
pub struct WatcherData {
    pub agent_id: String,
    pub role: AgentRole,
    pub allowed_tools: Vec<String>,
    pub blocked_tools: Vec<String>,
    pub blocked_paths: Vec<String>,
    pub allowed_commands: Vec<String>,
    pub blocked_patterns: Vec<String>,
    pub file_locks: Vec<String>,
    pub audit_log_path: PathBuf,
}

impl WatcherData {
    pub fn build(
        agent_id: &str,
        role: AgentRole,
        task: Option<&Task>,
        config: &FlotillaConfig,
        state_dir: &Path,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            role,
            allowed_tools: config.permissions.allowed_tools.clone(),
            blocked_tools: config.permissions.blocked_tools.clone(),
            blocked_paths: config.permissions.blocked_paths.clone(),
            allowed_commands: config.permissions.bash_rules.allowed_commands.clone(),
            blocked_patterns: config.permissions.bash_rules.blocked_patterns.clone(),
            file_locks: task.map(|t| t.file_locks.clone()).unwrap_or_default(),
            audit_log_path: state_dir.join("audit").join(format!("{}.jsonl", agent_id)),
        }
    }
}

/// Render the per-agent PreToolUse watcher script and write it executable.
///
/// The script reads a tool invocation from stdin, appends an audit record,
/// and answers allow (exit 0) or block (exit 2) per the embedded rules.
pub async fn render_watcher_hook(data: &WatcherData, output_path: &Path) -> Result<()> {
    let script = render_script(data);

    if let Some(dir) = output_path.parent() {
        fs::create_dir_all(dir).await?;
    }
    fs::write(output_path, script).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(output_path).await?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(output_path, perms).await?;
    }

    Ok(())
}

fn render_script(data: &WatcherData) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "#!/usr/bin/env bash");
    let _ = writeln!(
        s,
        "# Watcher hook for agent {} (role: {})",
        data.agent_id, data.role
    );
    let _ = writeln!(s, "# Registered as a PreToolUse hook; exit 0 allows, exit 2 blocks.");
    s.push_str(
        r#"
set -euo pipefail

"#,
    );
    let _ = writeln!(s, "AUDIT_LOG={}", shell_word(&data.audit_log_path.to_string_lossy()));
    s.push_str(
        r#"mkdir -p "$(dirname "$AUDIT_LOG")"

INPUT=$(cat)
TOOL=$(echo "$INPUT" | jq -r '.tool_name // empty')
FILE_PATH=$(echo "$INPUT" | jq -r '.tool_input.file_path // .tool_input.path // empty')
COMMAND=$(echo "$INPUT" | jq -r '.tool_input.command // empty')

log_decision() {
    echo "{\"timestamp\":\"$(date -u +%Y-%m-%dT%H:%M:%SZ)\",\"agent_id\":\"$AGENT_ID\",\"tool\":\"$TOOL\",\"target\":\"${FILE_PATH:-$COMMAND}\",\"decision\":\"$1\",\"rule\":\"$2\"}" >> "$AUDIT_LOG"
}

block() {
    log_decision "block" "$2"
    echo "{\"decision\":\"block\",\"reason\":\"$1\"}"
    exit 2
}

allow() {
    log_decision "allow" "${1:-allowed}"
    echo "{\"decision\":\"allow\"}"
    exit 0
}

"#,
    );
    let _ = writeln!(s, "AGENT_ID={}", shell_word(&data.agent_id));
    s.push('\n');

    for tool in &data.blocked_tools {
        let _ = writeln!(s, "if [ \"$TOOL\" = {} ]; then", shell_word(tool));
        let _ = writeln!(s, "    block \"Tool {} is blocked\" \"tool_blocked\"", tool);
        let _ = writeln!(s, "fi");
    }

    if !data.allowed_tools.is_empty() {
        s.push_str("TOOL_ALLOWED=false\n");
        for tool in &data.allowed_tools {
            let _ = writeln!(
                s,
                "if [ \"$TOOL\" = {} ]; then TOOL_ALLOWED=true; fi",
                shell_word(tool)
            );
        }
        s.push_str(
            "if [ \"$TOOL_ALLOWED\" = false ]; then\n    block \"Tool $TOOL is not on the allowlist\" \"tool_not_allowed\"\nfi\n",
        );
    }

    if !data.blocked_paths.is_empty() {
        s.push_str("\nif [ -n \"$FILE_PATH\" ]; then\n");
        for pattern in &data.blocked_paths {
            let _ = writeln!(s, "    case \"$FILE_PATH\" in");
            let _ = writeln!(
                s,
                "        {}|*/{}) block \"Path matches blocked pattern\" \"blocked_path\" ;;",
                pattern, pattern
            );
            let _ = writeln!(s, "    esac");
        }
        s.push_str("fi\n");
    }

    if !data.file_locks.is_empty() {
        s.push_str("\nif [ -n \"$FILE_PATH\" ] && [ \"$TOOL\" != \"Read\" ]; then\n");
        s.push_str("    IN_SCOPE=false\n");
        for lock in &data.file_locks {
            let _ = writeln!(
                s,
                "    case \"$FILE_PATH\" in {}*|*/{}*) IN_SCOPE=true ;; esac",
                lock, lock
            );
        }
        s.push_str(
            "    if [ \"$IN_SCOPE\" = false ]; then\n        block \"Write outside declared file locks\" \"outside_file_scope\"\n    fi\nfi\n",
        );
    }

    if !data.blocked_patterns.is_empty() {
        s.push_str("\nif [ -n \"$COMMAND\" ]; then\n");
        for pattern in &data.blocked_patterns {
            let _ = writeln!(
                s,
                "    if echo \"$COMMAND\" | grep -Eq {}; then",
                shell_word(pattern)
            );
            s.push_str("        block \"Command matches blocked pattern\" \"bash_blocked\"\n    fi\n");
        }
        s.push_str("fi\n");
    }

    if !data.allowed_commands.is_empty() {
        s.push_str("\nif [ -n \"$COMMAND\" ]; then\n");
        s.push_str("    FIRST_WORD=$(echo \"$COMMAND\" | awk '{print $1}')\n");
        s.push_str("    CMD_ALLOWED=false\n");
        for command in &data.allowed_commands {
            let _ = writeln!(
                s,
                "    if [ \"$FIRST_WORD\" = {} ]; then CMD_ALLOWED=true; fi",
                shell_word(command)
            );
        }
        s.push_str(
            "    if [ \"$CMD_ALLOWED\" = false ]; then\n        block \"Command $FIRST_WORD is not on the allowlist\" \"bash_not_allowed\"\n    fi\nfi\n",
        );
    }

    s.push_str("\nallow\n");
    s
}

fn shell_word(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

#[derive(Serialize)]
struct AgentSettings {
    hooks: HooksSettings,
}

#[derive(Serialize)]
struct HooksSettings {
    #[serde(rename = "PreToolUse")]
    pre_tool_use: Vec<HookEntry>,
}

#[derive(Serialize)]
struct HookEntry {
    #[serde(rename = "type")]
    kind: String,
    command: String,
    timeout: u64,
}

/// Write `.claude/settings.json` inside a worktree, registering the
/// watcher script as a PreToolUse hook.
pub async fn generate_agent_settings(worktree: &Path, watcher_script: &Path) -> Result<()> {
    let settings_dir = worktree.join(".claude");
    fs::create_dir_all(&settings_dir).await?;

    let absolute = watcher_script
        .canonicalize()
        .unwrap_or_else(|_| watcher_script.to_path_buf());

    let settings = AgentSettings {
        hooks: HooksSettings {
            pre_tool_use: vec![HookEntry {
                kind: "command".to_string(),
                command: absolute.to_string_lossy().to_string(),
                timeout: 5000,
            }],
        },
    };

    let json = serde_json::to_string_pretty(&settings)?;
    fs::write(settings_dir.join("settings.json"), json).await?;
    Ok(())
}
