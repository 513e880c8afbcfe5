//! Shell commands inside the sandbox.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext};
use crate::agent::AgentState;
use crate::sandbox::SandboxError;

const MAX_OUTPUT_CHARS: usize = 20_000;

/// Commands that would take the sandbox down with them.
const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    ("rm -rf /", "This would destroy the sandbox"),
    ("rm -rf /*", "This would destroy the sandbox"),
    ("find /", "Search a specific directory such as /home/user"),
    ("grep -r /", "Search a specific directory such as /home/user"),
    ("dd if=/dev/", "Direct disk operations are blocked"),
    ("> /dev/", "Writing to device files is blocked"),
];

/// Patterns ending at the root slash only match the root itself.
fn matches_pattern(cmd: &str, pattern: &str) -> bool {
    match cmd.strip_prefix(pattern) {
        Some(rest) if pattern.ends_with(" /") => rest.is_empty() || rest.starts_with([' ', '*']),
        Some(_) => true,
        None => false,
    }
}

fn validate_command(cmd: &str) -> Result<(), String> {
    let trimmed = cmd.trim();
    let unprefixed = ["sudo ", "time ", "nohup "]
        .iter()
        .find_map(|p| trimmed.strip_prefix(p))
        .unwrap_or(trimmed);

    for (pattern, suggestion) in DANGEROUS_PATTERNS {
        if matches_pattern(trimmed, pattern) || matches_pattern(unprefixed, pattern) {
            return Err(format!(
                "Blocked dangerous command pattern '{}'. {}",
                pattern, suggestion
            ));
        }
    }
    Ok(())
}

/// Make command output safe to hand back to the model.
fn sanitize_output(text: &str) -> String {
    let bytes = text.as_bytes();
    let non_printable = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    // More than 10% control bytes is almost certainly binary.
    if bytes.len() > 100 && non_printable > bytes.len() / 10 {
        return format!(
            "[Binary output detected - {} bytes, {}% non-printable]",
            bytes.len(),
            non_printable * 100 / bytes.len()
        );
    }

    let cleaned: String = text
        .chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect();

    match cleaned.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((cut, _)) => format!("{}\n... [output truncated]", &cleaned[..cut]),
        None => cleaned,
    }
}

fn failure_report(error: &str, stdout: &str, stderr: &str) -> String {
    format!(
        "command failed: {}\nstdout:{}\nstderr:{}",
        error,
        sanitize_output(stdout),
        sanitize_output(stderr)
    )
}

async fn run_in_sandbox(ctx: &ToolContext<'_>, command: &str) -> String {
    if let Err(msg) = validate_command(command) {
        tracing::warn!(command, "Blocked dangerous command");
        return failure_report(&msg, "", "");
    }

    let sandbox = match ctx.sandbox().await {
        Ok(sandbox) => sandbox,
        Err(e) => return failure_report(&e.to_string(), "", ""),
    };

    match sandbox.run_command(command).await {
        Ok(output) => {
            tracing::debug!(
                exit_code = output.exit_code,
                stdout_len = output.stdout.len(),
                stderr_len = output.stderr.len(),
                "Command completed"
            );
            sanitize_output(&output.stdout)
        }
        Err(SandboxError::CommandExit {
            exit_code,
            error,
            stdout,
            stderr,
        }) => {
            let reason = if error.is_empty() {
                format!("exit status {}", exit_code)
            } else {
                error
            };
            failure_report(&reason, &stdout, &stderr)
        }
        Err(e) => failure_report(&e.to_string(), "", ""),
    }
}

/// `terminal { command }`
pub struct Terminal;

#[async_trait]
impl Tool for Terminal {
    fn name(&self) -> &str {
        "terminal"
    }

    fn description(&self) -> &str {
        "Run terminal commands in the sandbox"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to run inside the sandbox"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext<'_>,
        _state: &mut AgentState,
    ) -> anyhow::Result<String> {
        let command = args["command"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'command' argument"))?
            .to_string();

        tracing::info!(sandbox_id = %ctx.sandbox_id, command = %command, "Running terminal command");

        ctx.step
            .run("terminal", async { Ok(run_in_sandbox(ctx, &command).await) })
            .await
    }
}
