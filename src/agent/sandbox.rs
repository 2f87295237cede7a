use tokio::process::Command;

use crate::config::SandboxConfig;

/// Build the command for an agent subprocess with resource limits applied.
///
/// Limits ride on a `bash -c 'ulimit ... && exec ...'` wrapper so they bind
/// to the child before the agent runtime starts. Address-space limiting is
/// best-effort on macOS; the timeout and budget limits are the real
/// backstop there. The child is always placed in its own process group so
/// the kill protocol can signal the whole tree.
pub fn sandboxed_command(program: &str, args: &[String], sandbox: &SandboxConfig) -> Command {
    let limits = ulimit_prefix(sandbox);

    let mut command = if limits.is_empty() {
        let mut command = Command::new(program);
        command.args(args);
        command
    } else {
        let mut line = String::from(program);
        for arg in args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        let script = format!("{} && exec {}", limits.join(" && "), line);
        let mut command = Command::new("bash");
        command.arg("-c").arg(script);
        command
    };

    #[cfg(unix)]
    command.process_group(0);

    command
}

fn ulimit_prefix(sandbox: &SandboxConfig) -> Vec<String> {
    let mut limits = Vec::new();
    if sandbox.max_cpu_seconds > 0 {
        limits.push(format!("ulimit -t {}", sandbox.max_cpu_seconds));
    }
    if sandbox.max_file_size_mb > 0 {
        // ulimit -f takes 512-byte blocks.
        limits.push(format!("ulimit -f {}", sandbox.max_file_size_mb * 2048));
    }
    if sandbox.max_open_files > 0 {
        limits.push(format!("ulimit -n {}", sandbox.max_open_files));
    }
    if sandbox.max_memory_mb > 0 {
        // RLIMIT_AS via ulimit -v, in kilobytes.
        limits.push(format!("ulimit -v {}", sandbox.max_memory_mb * 1024));
    }
    limits
}

/// Single-quote a string for bash, escaping embedded single quotes.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_limits_runs_program_directly() {
        let sandbox = SandboxConfig {
            max_cpu_seconds: 0,
            max_memory_mb: 0,
            max_file_size_mb: 0,
            max_open_files: 0,
            allow_network: true,
        };
        let command = sandboxed_command("claude", &["--print".to_string()], &sandbox);
        assert_eq!(command.as_std().get_program(), "claude");
    }

    #[test]
    fn limits_wrap_in_bash_with_exec() {
        let sandbox = SandboxConfig::default();
        let command = sandboxed_command("claude", &["--print".to_string()], &sandbox);
        assert_eq!(command.as_std().get_program(), "bash");

        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        let script = &args[1];
        assert!(script.contains("ulimit -t 600"));
        assert!(script.contains("ulimit -v"));
        assert!(script.contains("exec claude '--print'"));
    }

    #[test]
    fn file_size_limit_converts_to_blocks() {
        let prefix = ulimit_prefix(&SandboxConfig::default());
        assert!(prefix.iter().any(|l| l == "ulimit -f 102400"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
    }
}
