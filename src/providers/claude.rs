//! Claude CLI subprocess adapter
//!
//! Drives the vendor CLI in print mode, one subprocess per turn, resuming
//! the provider-side session between turns. The child environment is
//! isolated: any ambient `ANTHROPIC_API_KEY` is stripped so the user's
//! shell cannot bill the wrong account, and the managed key from the
//! credential file is re-injected only when the auth method asks for it.
//! With no key configured the CLI's own OAuth login is inherited.

use super::{Provider, ProviderError, Role, Turn, TurnOutput};
use crate::cancel::CancelSignal;
use crate::config::{ClaudeAuthMethod, Settings};
use crate::credentials::Credentials;
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";

/// Grace period between the polite kill and SIGKILL on cancellation.
const KILL_GRACE: Duration = Duration::from_secs(2);

pub struct ClaudeCliProvider {
    binary: String,
    auth_method: ClaudeAuthMethod,
    managed_api_key: Option<String>,
}

impl ClaudeCliProvider {
    pub fn new(settings: &Settings, credentials: &Credentials) -> Self {
        Self {
            binary: settings
                .claude_bin
                .clone()
                .unwrap_or_else(|| "claude".to_string()),
            auth_method: settings.claude_auth_method,
            managed_api_key: credentials.anthropic_api_key().map(str::to_string),
        }
    }

    /// Build the command, shell-wrapped on Windows when the resolved path
    /// contains spaces or is a `.cmd` shim (CreateProcess cannot run those
    /// directly).
    fn build_command(&self, args: &[String]) -> Command {
        let needs_shell = cfg!(windows)
            && (self.binary.contains(' ') || self.binary.to_ascii_lowercase().ends_with(".cmd"));

        let mut command = if needs_shell {
            let mut c = Command::new("cmd.exe");
            c.arg("/d").arg("/c").arg(&self.binary);
            c
        } else {
            Command::new(&self.binary)
        };
        command.args(args);

        // Isolated credentials: strip the ambient key, re-inject the
        // managed one only for api-auth. The OAuth token inherits as-is.
        command.env_remove(API_KEY_VAR);
        if self.auth_method == ClaudeAuthMethod::Api {
            if let Some(key) = &self.managed_api_key {
                command.env(API_KEY_VAR, key);
            }
        }

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn turn_args(memory_session_id: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if let Some(id) = memory_session_id {
            args.push("--resume".to_string());
            args.push(id.to_string());
        }
        args
    }

    /// Decode the CLI's result frame.
    fn parse_result(stdout: &str) -> Result<TurnOutput, ProviderError> {
        let data: Value = serde_json::from_str(stdout.trim())
            .map_err(|e| ProviderError::Malformed(format!("CLI output: {}", e)))?;

        if data["is_error"].as_bool().unwrap_or(false) {
            let message = data["result"].as_str().unwrap_or("unknown CLI error");
            return Err(ProviderError::Api {
                status: 0,
                message: message.to_string(),
            });
        }

        let text = data["result"].as_str().unwrap_or_default().to_string();
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyReply);
        }

        let usage = &data["usage"];
        Ok(TurnOutput {
            text,
            input_tokens: usage["input_tokens"].as_u64(),
            output_tokens: usage["output_tokens"].as_u64(),
            memory_session_id: data["session_id"].as_str().map(str::to_string),
        })
    }

    /// Kill the child: polite kill, bounded grace wait, then hard kill.
    async fn shutdown_child(child: &mut Child) {
        let grace = if cfg!(windows) {
            KILL_GRACE.mul_f32(1.5)
        } else {
            KILL_GRACE
        };
        let _ = child.start_kill();
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
impl Provider for ClaudeCliProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn captures_session_id(&self) -> bool {
        true
    }

    async fn run_turn(
        &self,
        history: &[Turn],
        memory_session_id: Option<&str>,
        cancel: &CancelSignal,
    ) -> Result<TurnOutput, ProviderError> {
        // The CLI resumes its own conversation state; only the newest user
        // turn travels over stdin.
        let prompt = history
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.text.as_str())
            .ok_or_else(|| ProviderError::Malformed("no user turn in history".into()))?;

        let args = Self::turn_args(memory_session_id);
        let mut child = self
            .build_command(&args)
            .spawn()
            .map_err(|e| ProviderError::Spawn(format!("spawn {}: {}", self.binary, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| ProviderError::Spawn(format!("stdin write: {}", e)))?;
            drop(stdin);
        }

        let (status, stdout, stderr) = tokio::select! {
            out = collect_output(&mut child) => {
                out.map_err(|e| ProviderError::Spawn(format!("wait: {}", e)))?
            }
            _ = cancel.cancelled() => {
                Self::shutdown_child(&mut child).await;
                return Err(ProviderError::Cancelled);
            }
        };

        super::log_payload("result", self.name(), &stdout);

        if !status.success() {
            return Err(ProviderError::Spawn(format!(
                "CLI exited {}: {}",
                status,
                crate::util::truncate_utf8_safe(&stderr, 300)
            )));
        }

        Self::parse_result(&stdout)
    }
}

/// Drain both pipes, then reap the exit status.
async fn collect_output(
    child: &mut Child,
) -> std::io::Result<(std::process::ExitStatus, String, String)> {
    use tokio::io::AsyncReadExt;

    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    if let Some(mut stdout) = child.stdout.take() {
        stdout.read_to_end(&mut stdout_buf).await?;
    }
    if let Some(mut stderr) = child.stderr.take() {
        stderr.read_to_end(&mut stderr_buf).await?;
    }
    let status = child.wait().await?;
    Ok((
        status,
        String::from_utf8_lossy(&stdout_buf).into_owned(),
        String::from_utf8_lossy(&stderr_buf).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_flag_only_on_continuation() {
        assert_eq!(
            ClaudeCliProvider::turn_args(None),
            vec!["-p", "--output-format", "json"]
        );
        assert_eq!(
            ClaudeCliProvider::turn_args(Some("mem-1")),
            vec!["-p", "--output-format", "json", "--resume", "mem-1"]
        );
    }

    #[test]
    fn parses_result_frame() {
        let out = ClaudeCliProvider::parse_result(
            r#"{"type":"result","result":"<observation>...</observation>","session_id":"abc","usage":{"input_tokens":120,"output_tokens":40}}"#,
        )
        .unwrap();
        assert_eq!(out.text, "<observation>...</observation>");
        assert_eq!(out.memory_session_id.as_deref(), Some("abc"));
        assert_eq!(out.input_tokens, Some(120));
        assert_eq!(out.output_tokens, Some(40));
    }

    #[test]
    fn error_frame_is_api_error() {
        let err = ClaudeCliProvider::parse_result(
            r#"{"is_error":true,"result":"credit exhausted"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProviderError::Api { .. }));
    }

    #[test]
    fn empty_result_is_empty_reply() {
        let err = ClaudeCliProvider::parse_result(r#"{"result":"  "}"#).unwrap_err();
        assert!(matches!(err, ProviderError::EmptyReply));
    }

    #[test]
    fn non_json_is_malformed() {
        let err = ClaudeCliProvider::parse_result("garbage").unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }
}
