//! Shell-command remediator driven by `[remediation]` config

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::borrow::Cow;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use super::{RemediationReport, Remediator};
use crate::config::RemediationConfig;
use crate::models::{ErrorReport, FixResult, ProposedFix};

/// Timeout for collecting output from child process pipes
const OUTPUT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Output kept per stream (1MB)
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Characters of combined output quoted back in attempt details
const DETAIL_TAIL: usize = 400;

/// How often a running command checks for timeout and cancellation
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Result of one shell command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    /// Short description for attempt details
    pub fn describe(&self) -> String {
        let status = if self.timed_out {
            "timed out".to_string()
        } else if self.cancelled {
            "cancelled".to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("exit {code}"),
                None => "terminated".to_string(),
            }
        };
        let output = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        if output.is_empty() {
            format!("`{}` {status}", self.command)
        } else {
            format!("`{}` {status}: {}", self.command, tail(output, DETAIL_TAIL))
        }
    }
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Applies remediations by running configured shell commands.
///
/// A fix type without a command fails the attempt. After a command succeeds
/// the verify command decides between `success` and `partial`; with no verify
/// command a clean exit counts as success.
#[derive(Debug, Clone)]
pub struct CommandRemediator {
    config: RemediationConfig,
}

impl CommandRemediator {
    pub fn new(config: RemediationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RemediationConfig {
        &self.config
    }

    fn working_dir(&self) -> Option<PathBuf> {
        self.config.working_dir.clone()
    }

    /// Run `command` on the blocking pool.
    ///
    /// The child is killed when `cancel` fires or when this future is
    /// dropped before the command exits.
    async fn run(&self, command: String, cancel: &CancellationToken) -> Result<CommandOutput> {
        let working_dir = self.working_dir();
        let timeout = self.config.timeout();
        let abort = cancel.child_token();
        let _kill_on_drop = abort.clone().drop_guard();
        tokio::task::spawn_blocking(move || {
            run_shell_command(&command, working_dir.as_deref(), timeout, &abort)
        })
        .await
        .context("Remediation command task panicked")?
    }
}

#[async_trait]
impl Remediator for CommandRemediator {
    async fn apply(
        &self,
        fix: &ProposedFix,
        error: &ErrorReport,
        cancel: &CancellationToken,
    ) -> Result<RemediationReport> {
        let Some(template) = self.config.command_for(fix.fix_type) else {
            return Ok(RemediationReport::new(
                FixResult::Failed,
                Some(format!("no remediation command configured for {}", fix.fix_type)),
            ));
        };

        let command = expand_template(template, fix, error, self.working_dir().as_deref());
        info!(fix_type = %fix.fix_type, target = %fix.fix_target, "running remediation command");
        let applied = self.run(command, cancel).await?;
        if !applied.success {
            return Ok(RemediationReport::new(
                FixResult::Failed,
                Some(applied.describe()),
            ));
        }

        let Some(verify) = self.config.verify.clone() else {
            return Ok(RemediationReport::new(FixResult::Success, None));
        };
        let verified = self.run(verify, cancel).await?;
        if verified.cancelled {
            return Ok(RemediationReport::new(
                FixResult::Failed,
                Some(verified.describe()),
            ));
        }
        if verified.success {
            Ok(RemediationReport::new(FixResult::Success, None))
        } else {
            debug!(detail = %verified.describe(), "verification still failing");
            Ok(RemediationReport::new(
                FixResult::Partial,
                Some(verified.describe()),
            ))
        }
    }

    async fn rollback(&self, error: &ErrorReport) -> Result<()> {
        let Some(command) = self.config.rollback.clone() else {
            debug!(error_type = %error.error_type, "no rollback command configured");
            return Ok(());
        };
        let output = self.run(command, &CancellationToken::new()).await?;
        if output.success {
            Ok(())
        } else {
            warn!(detail = %output.describe(), "rollback command failed");
            anyhow::bail!("rollback failed: {}", output.describe())
        }
    }
}

/// Substitute `${VAR}` placeholders with shell-quoted values.
///
/// Known variables: `FIX_TYPE`, `FIX_TARGET`, `FIX_DESCRIPTION`, `ERROR_TYPE`,
/// `ERROR_MESSAGE`, `ERROR_FILE`, `TASK_ID`, `WORKDIR`. Unknown variables are
/// left as written so the shell can resolve them from the environment.
pub fn expand_template(
    template: &str,
    fix: &ProposedFix,
    error: &ErrorReport,
    working_dir: Option<&Path>,
) -> String {
    let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &regex::Captures| {
        let value = match &caps[1] {
            "FIX_TYPE" => fix.fix_type.to_string(),
            "FIX_TARGET" => fix.fix_target.clone(),
            "FIX_DESCRIPTION" => fix.fix_description.clone(),
            "ERROR_TYPE" => error.error_type.clone(),
            "ERROR_MESSAGE" => error.error_message.clone(),
            "ERROR_FILE" => error.file.clone().unwrap_or_default(),
            "TASK_ID" => error.task_id.clone().unwrap_or_default(),
            "WORKDIR" => working_dir
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ".".to_string()),
            _ => return caps[0].to_string(),
        };
        shell_escape::escape(Cow::Owned(value)).into_owned()
    })
    .into_owned()
}

/// Run a shell command, killing it once `timeout` elapses or `cancel` fires
pub fn run_shell_command(
    command: &str,
    working_dir: Option<&Path>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut child = spawn_shell_command(command, working_dir)?;

    // Drain pipes while waiting so a chatty child cannot block on a full pipe
    let (stdout_tx, stdout_rx) = mpsc::channel();
    let (stderr_tx, stderr_rx) = mpsc::channel();
    match child.stdout.take() {
        Some(stdout) => {
            thread::spawn(move || {
                let _ = stdout_tx.send(read_stream_to_string(stdout));
            });
        }
        None => {
            let _ = stdout_tx.send(String::new());
        }
    }
    match child.stderr.take() {
        Some(stderr) => {
            thread::spawn(move || {
                let _ = stderr_tx.send(read_stream_to_string(stderr));
            });
        }
        None => {
            let _ = stderr_tx.send(String::new());
        }
    }

    let mut cancelled = false;
    let wait_result = loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        let status = child
            .wait_timeout(remaining.min(WAIT_POLL))
            .with_context(|| format!("Failed to wait for command: {command}"))?;
        if status.is_some() {
            break status;
        }
        if cancel.is_cancelled() {
            cancelled = true;
            break None;
        }
        if start.elapsed() >= timeout {
            break None;
        }
    };
    if wait_result.is_none() {
        let _ = child.kill();
        let _ = child.wait();
    }

    let stdout = stdout_rx
        .recv_timeout(OUTPUT_COLLECTION_TIMEOUT)
        .unwrap_or_else(|_| "[output collection timed out]".to_string());
    let stderr = stderr_rx
        .recv_timeout(OUTPUT_COLLECTION_TIMEOUT)
        .unwrap_or_else(|_| "[output collection timed out]".to_string());

    let duration = start.elapsed();
    Ok(match wait_result {
        Some(status) => CommandOutput {
            command: command.to_string(),
            success: status.success(),
            exit_code: status.code(),
            stdout,
            stderr,
            duration,
            timed_out: false,
            cancelled: false,
        },
        None if cancelled => CommandOutput {
            command: command.to_string(),
            success: false,
            exit_code: None,
            stdout,
            stderr: format!("{stderr}\n[Process killed on cancel]"),
            duration,
            timed_out: false,
            cancelled: true,
        },
        None => CommandOutput {
            command: command.to_string(),
            success: false,
            exit_code: None,
            stdout,
            stderr: format!("{stderr}\n[Process killed after {}s timeout]", timeout.as_secs()),
            duration,
            timed_out: true,
            cancelled: false,
        },
    })
}

fn spawn_shell_command(command: &str, working_dir: Option<&Path>) -> Result<Child> {
    let mut cmd = if cfg!(target_family = "unix") {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    } else {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    };
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    cmd.spawn()
        .with_context(|| format!("Failed to spawn command: {command}"))
}

fn read_stream_to_string<R: Read>(mut stream: R) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let remaining = MAX_OUTPUT_SIZE.saturating_sub(buf.len());
                let to_copy = n.min(remaining);
                buf.extend_from_slice(&chunk[..to_copy]);
                if to_copy < n {
                    truncated = true;
                }
            }
            Err(_) => {
                if buf.is_empty() {
                    return "[error reading output]".to_string();
                }
                break;
            }
        }
    }
    if truncated {
        buf.extend_from_slice(b"\n[output truncated]");
    }
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::{FixSource, FixType};
    use std::io::Cursor;

    fn fix(fix_type: FixType, target: &str) -> ProposedFix {
        ProposedFix {
            fix_type,
            fix_target: target.into(),
            fix_description: "do the thing".into(),
            source: FixSource::Default,
            confidence: 0.1,
        }
    }

    fn remediator(commands: &[(&str, &str)], verify: Option<&str>) -> CommandRemediator {
        let mut config = RemediationConfig {
            verify: verify.map(String::from),
            timeout_secs: 5,
            ..Default::default()
        };
        for (key, cmd) in commands {
            config.commands.insert(key.to_string(), cmd.to_string());
        }
        CommandRemediator::new(config)
    }

    #[test]
    fn test_expand_template_quotes_values() {
        let error = ErrorReport::new("E0432", "unresolved import").with_task("build");
        let expanded = expand_template(
            "fix ${FIX_TYPE} ${FIX_TARGET} --task ${TASK_ID} ${HOME}",
            &fix(FixType::Patch, "src/my file.rs"),
            &error,
            None,
        );
        assert_eq!(expanded, "fix patch 'src/my file.rs' --task build ${HOME}");
    }

    #[test]
    fn test_expand_template_neutralizes_injection() {
        let error = ErrorReport::new("E", "x");
        let expanded = expand_template(
            "echo ${FIX_TARGET}",
            &fix(FixType::Custom, "a; rm -rf /"),
            &error,
            None,
        );
        assert_eq!(expanded, "echo 'a; rm -rf /'");
    }

    #[test]
    fn test_run_shell_command_captures_output() {
        let output = run_shell_command(
            "echo hello",
            None,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(output.success);
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn test_run_shell_command_times_out() {
        let output = run_shell_command(
            "sleep 5",
            None,
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(!output.success);
        assert!(output.timed_out);
        assert!(output.describe().contains("timed out"));
    }

    #[test]
    fn test_run_shell_command_killed_on_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let started = Instant::now();
        let output = run_shell_command("sleep 5", None, Duration::from_secs(30), &cancel).unwrap();
        assert!(output.cancelled);
        assert!(!output.timed_out);
        assert!(!output.success);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(output.describe().contains("cancelled"));
    }

    #[test]
    fn test_read_stream_truncates() {
        let data = vec![b'x'; MAX_OUTPUT_SIZE + 10];
        let result = read_stream_to_string(Cursor::new(data));
        assert!(result.ends_with("[output truncated]"));
    }

    #[tokio::test]
    async fn test_apply_without_command_fails() {
        let report = remediator(&[], None)
            .apply(
                &fix(FixType::Config, "x"),
                &ErrorReport::new("E", "m"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.result, FixResult::Failed);
        assert!(report.detail.unwrap().contains("config"));
    }

    #[tokio::test]
    async fn test_apply_then_verify() {
        let error = ErrorReport::new("E", "m");
        let token = CancellationToken::new();
        let ok = remediator(&[("patch", "true")], Some("true"))
            .apply(&fix(FixType::Patch, "x"), &error, &token)
            .await
            .unwrap();
        assert_eq!(ok.result, FixResult::Success);

        let partial = remediator(&[("patch", "true")], Some("echo still broken >&2; false"))
            .apply(&fix(FixType::Patch, "x"), &error, &token)
            .await
            .unwrap();
        assert_eq!(partial.result, FixResult::Partial);
        assert!(partial.detail.unwrap().contains("still broken"));

        let failed = remediator(&[("patch", "exit 3")], Some("true"))
            .apply(&fix(FixType::Patch, "x"), &error, &token)
            .await
            .unwrap();
        assert_eq!(failed.result, FixResult::Failed);
        assert!(failed.detail.unwrap().contains("exit 3"));
    }

    #[tokio::test]
    async fn test_apply_cancelled_mid_command() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let report = remediator(&[("patch", "sleep 5")], Some("true"))
            .apply(&fix(FixType::Patch, "x"), &ErrorReport::new("E", "m"), &token)
            .await
            .unwrap();
        assert_eq!(report.result, FixResult::Failed);
        assert!(report.detail.unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_rollback_reports_failure() {
        let mut remediator = remediator(&[], None);
        let error = ErrorReport::new("E", "m");
        remediator.rollback(&error).await.unwrap();

        remediator.config.rollback = Some("false".into());
        assert!(remediator.rollback(&error).await.is_err());
    }
}
