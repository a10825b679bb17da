use async_trait::async_trait;
use serde_json::{Value, json};

use super::traits::{Tool, ToolContext, ToolFlags, ToolResult};

/// Executes shell commands via `sh -c`.  Destructive: every call goes
/// through the approval gate unless god mode or an `allow-always` grant
/// applies.
pub struct ExecuteShellCommandTool;

#[async_trait]
impl Tool for ExecuteShellCommandTool {
    fn name(&self) -> &str {
        "execute_shell_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command on the host and return its stdout/stderr output."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute."
                },
                "working_dir": {
                    "type": "string",
                    "description": "Optional working directory for the command."
                }
            },
            "required": ["command"]
        })
    }

    fn flags(&self) -> ToolFlags {
        ToolFlags::DESTRUCTIVE
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, String> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or("missing required argument 'command'")?
            .to_owned();
        let working_dir = args
            .get("working_dir")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&command);
        if let Some(dir) = &working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("failed to spawn process: {e}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let success = output.status.success();

        let mut text = stdout;
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("[stderr]\n");
            text.push_str(&stderr);
        }

        Ok(ToolResult {
            output: text,
            success,
            metadata: Some(json!({ "exitCode": output.status.code() })),
        })
    }
}
