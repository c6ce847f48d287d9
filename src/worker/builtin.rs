use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::config::ShellConfig;
use crate::events::EventType;
use crate::worker::executor::{ExecutionError, Executor, RunContext};

/// `sysexits.h` EX_TEMPFAIL: the command asks to be retried.
const EXIT_TEMPFAIL: i32 = 75;

/// Replies with the last user message.
#[derive(Debug, Clone, Default)]
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, ctx: RunContext) -> Result<Value, ExecutionError> {
        let content = ctx
            .messages()
            .iter()
            .rev()
            .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutionError::Permanent("input has no user message".into()))?
            .to_string();

        ctx.emit(
            EventType::AssistantMessage,
            json!({ "role": "assistant", "content": content }),
        )
        .await?;
        Ok(json!({ "content": content }))
    }
}

/// Runs `input.command` through `sh -c`, optionally inside a Docker sandbox.
///
/// Exit status 0 succeeds, 75 (EX_TEMPFAIL) is retried, anything else fails the run.
/// The child is killed when the attempt is cancelled or torn down.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    config: ShellConfig,
}

impl ShellExecutor {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    fn command(&self, script: &str) -> Command {
        let Some(image) = &self.config.image else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(script);
            return cmd;
        };

        let mut args = vec!["run".to_string(), "--rm".to_string()];
        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(limit) = &self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(limit) = &self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }
        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());
        args.push(image.clone());
        args.extend(["sh".to_string(), "-c".to_string(), script.to_string()]);

        let mut cmd = Command::new("docker");
        cmd.args(&args);
        cmd
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, ctx: RunContext) -> Result<Value, ExecutionError> {
        let script = ctx
            .input()
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutionError::Permanent("input.command must be a string".into()))?
            .to_string();

        ctx.emit(
            EventType::ToolCall,
            json!({ "tool": "shell", "command": script, "sandbox": self.config.image }),
        )
        .await?;
        tracing::info!(run_id = %ctx.run_id(), command = %script, "Executing shell command");

        let child = self
            .command(&script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::Transient(format!("failed to spawn shell: {}", e)))?;

        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| ExecutionError::Transient(format!("failed to collect output: {}", e)))?,
            _ = ctx.cancelled() => return Err(ctx.check().err().unwrap_or(ExecutionError::Cancelled)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();
        tracing::info!(run_id = %ctx.run_id(), exit_code = ?exit_code, "Shell command finished");

        ctx.emit(
            EventType::ToolResult,
            json!({ "tool": "shell", "exit_code": exit_code, "stdout": stdout, "stderr": stderr }),
        )
        .await?;

        match exit_code {
            Some(0) => Ok(json!({ "exit_code": 0, "stdout": stdout })),
            Some(EXIT_TEMPFAIL) => Err(ExecutionError::Transient(failure_message(exit_code, &stderr))),
            _ => Err(ExecutionError::Permanent(failure_message(exit_code, &stderr))),
        }
    }
}

fn failure_message(exit_code: Option<i32>, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exit code: {:?}", exit_code)
    } else {
        stderr.to_string()
    }
}
