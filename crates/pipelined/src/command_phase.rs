//! Command-backed phases.
//!
//! Key responsibilities:
//! - Spawn the configured command through `sh -c`
//! - Send `{"task": .., "context": ..}` as one JSON line on stdin
//! - Read the outcome from the last JSON line on stdout, keeping only the
//!   tail of long output
//! - Kill the child on cancellation while keeping partial output

use crate::phase::{Phase, PhaseError, PhaseRegistry, Result};
use async_trait::async_trait;
use pipeline_core::{Config, PhaseContext, PhaseOutcome, Task};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between heartbeat log messages while a phase command runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for capturing stdout/stderr after the process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Newest stdout bytes kept. The outcome is the last JSON line, so the head
/// of a long transcript is what gets dropped.
const STDOUT_TAIL_BYTES: usize = 1024 * 1024;

/// Newest stderr bytes kept for the debug log.
const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// Read a stream to the end, keeping only its last `max_bytes`.
///
/// When the head is dropped, the buffer starts at the first complete line.
async fn read_tail<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut dropped = 0;

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        // Trim in batches so the buffer is not shifted on every read.
        if buf.len() > max_bytes.saturating_mul(2) {
            let excess = buf.len() - max_bytes;
            buf.drain(..excess);
            dropped += excess;
        }
    }
    if buf.len() > max_bytes {
        let excess = buf.len() - max_bytes;
        buf.drain(..excess);
        dropped += excess;
    }

    if dropped > 0 {
        debug!(dropped, kept = buf.len(), "phase output exceeded limit; kept the tail");
        let partial = buf.iter().position(|&b| b == b'\n').map_or(buf.len(), |i| i + 1);
        buf.drain(..partial);
    }
    Ok(buf)
}

async fn capture(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
    stream: &str,
) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(stream, error = %err, "output capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(stream, error = %err, "output task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!(stream, "output capture timed out");
            Vec::new()
        }
    }
}

/// Last stdout line that parses as an outcome.
fn parse_outcome(stdout: &str) -> Option<PhaseOutcome> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str(line).ok())
}

/// How the process wait loop terminated.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    Cancelled,
}

#[derive(Serialize)]
struct PhaseInput<'a> {
    task: &'a Task,
    context: &'a PhaseContext,
}

/// A phase that runs an external command.
#[derive(Debug, Clone)]
pub struct CommandPhase {
    name: String,
    command: String,
    workdir: Option<PathBuf>,
}

impl CommandPhase {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            workdir: None,
        }
    }

    pub fn with_workdir(mut self, workdir: Option<PathBuf>) -> Self {
        self.workdir = workdir;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Registry of the `phase.<name>` commands in `config`.
pub fn command_registry(config: &Config) -> PhaseRegistry {
    let mut registry = PhaseRegistry::new();
    for (name, command) in &config.phase_commands {
        let phase = CommandPhase::new(name.clone(), command.clone())
            .with_workdir(config.phase_workdir.clone());
        registry.register(name.clone(), Arc::new(phase));
    }
    registry
}

#[async_trait]
impl Phase for CommandPhase {
    async fn run(
        &self,
        task: &Task,
        context: &PhaseContext,
        cancel: CancellationToken,
    ) -> Result<PhaseOutcome> {
        let mut input = serde_json::to_vec(&PhaseInput { task, context })?;
        input.push(b'\n');

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .env("PIPELINE_PHASE", &self.name)
            .env("PIPELINE_TASK_ID", &task.id.0)
            .env("PIPELINE_ITERATION", context.iteration.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(workdir) = &self.workdir {
            cmd.current_dir(workdir);
        }

        debug!(phase = %self.name, command = %self.command, "spawning phase command");
        let mut child = cmd.spawn()?;

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_tail(stdout, STDOUT_TAIL_BYTES)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_tail(stderr, STDERR_TAIL_BYTES)));

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores its input may close stdin early.
            if let Err(err) = stdin.write_all(&input).await {
                debug!(phase = %self.name, error = %err, "phase command closed stdin");
            }
        }

        let started = Instant::now();
        let outcome = loop {
            tokio::select! {
                result = child.wait() => {
                    break ProcessOutcome::Completed(result?);
                }
                () = cancel.cancelled() => {
                    info!(phase = %self.name, task_id = %task.id, "cancellation requested; killing phase command");
                    if let Err(err) = child.kill().await {
                        warn!(phase = %self.name, error = %err, "failed to kill phase command");
                    }
                    if let Err(err) = child.wait().await {
                        warn!(phase = %self.name, error = %err, "failed to reap phase command");
                    }
                    break ProcessOutcome::Cancelled;
                }
                () = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    info!(
                        phase = %self.name,
                        task_id = %task.id,
                        elapsed_sec = started.elapsed().as_secs(),
                        "phase command still running"
                    );
                }
            }
        };

        let stdout = capture(stdout_task, "stdout").await;
        let stderr = capture(stderr_task, "stderr").await;
        let stdout = String::from_utf8_lossy(&stdout);
        let stderr = String::from_utf8_lossy(&stderr);
        let parsed = parse_outcome(&stdout);

        match outcome {
            ProcessOutcome::Cancelled => parsed.ok_or(PhaseError::Cancelled),
            ProcessOutcome::Completed(status) => {
                let Some(mut parsed) = parsed else {
                    if !stderr.trim().is_empty() {
                        debug!(phase = %self.name, stderr = %stderr.trim(), "phase command stderr");
                    }
                    return Err(PhaseError::NoOutcome {
                        exit_code: status.code(),
                    });
                };
                if !status.success() && parsed.success {
                    warn!(
                        phase = %self.name,
                        exit_code = ?status.code(),
                        "phase reported success but exited non-zero"
                    );
                    parsed.success = false;
                    parsed.message = format!("{} (exit code {:?})", parsed.message, status.code());
                }
                Ok(parsed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::{ActionKind, TrendSummary};
    use tempfile::TempDir;

    fn context() -> PhaseContext {
        PhaseContext {
            iteration: 3,
            phase: "coding".to_string(),
            trend: TrendSummary::default(),
            guidance: Some("try again".to_string()),
            strategy: None,
            hints: pipeline_core::ActionHints::default(),
            recent_errors: Vec::new(),
        }
    }

    async fn run(command: &str) -> Result<PhaseOutcome> {
        let task = Task::new("write tests", "src/a.rs", 0);
        CommandPhase::new("coding", command)
            .run(&task, &context(), CancellationToken::new())
            .await
    }

    #[test]
    fn parse_outcome_takes_last_json_line() {
        let stdout = "working...\n{\"success\": false}\nnoise\n{\"success\": true, \"message\": \"ok\"}\n";
        let outcome = parse_outcome(stdout).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.message, "ok");
        assert!(parse_outcome("no json here\n").is_none());
    }

    #[test]
    fn parse_outcome_accepts_tool_named_and_unknown_actions() {
        let stdout = r#"{"success": true, "touched_artifacts": ["a.rs"], "actions": [{"kind": "str_replace", "target": "a.rs"}, {"kind": "run_linter"}]}"#;
        let outcome = parse_outcome(stdout).unwrap();
        assert_eq!(outcome.touched_artifacts, vec!["a.rs"]);
        assert_eq!(outcome.actions[0].kind, ActionKind::Modify);
        assert_eq!(outcome.actions[1].kind, ActionKind::Other);
    }

    #[tokio::test]
    async fn read_tail_keeps_newest_complete_lines() {
        let output = b"line one\nline two\n{\"success\": true}\n";
        let tail = read_tail(&output[..], 20).await.unwrap();
        assert_eq!(tail, b"{\"success\": true}\n");

        let short = read_tail(&output[..], 1024).await.unwrap();
        assert_eq!(short, output);
    }

    #[tokio::test]
    async fn outcome_after_long_output_is_found() {
        let outcome = run(
            r#"head -c 3000000 /dev/zero | tr '\0' 'x'; echo; echo '{"success": true, "message": "after noise"}'"#,
        )
        .await
        .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.message, "after noise");
    }

    #[tokio::test]
    async fn reads_outcome_from_stdout() {
        let outcome = run(
            r#"echo progress; echo '{"success": true, "message": "built", "touched_artifacts": ["src/a.rs"], "actions": [{"kind": "modify", "target": "src/a.rs"}]}'"#,
        )
        .await
        .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.touched_artifacts, vec!["src/a.rs"]);
        assert_eq!(outcome.actions[0].kind, ActionKind::Modify);
    }

    #[tokio::test]
    async fn task_and_context_arrive_on_stdin() {
        let outcome = run(
            r#"read -r input; case "$input" in *'"target":"src/a.rs"'*'"guidance":"try again"'*) echo '{"success": true}';; *) echo '{"success": false}';; esac"#,
        )
        .await
        .unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn environment_names_phase_and_task() {
        let outcome = run(
            r#"echo "{\"success\": true, \"message\": \"$PIPELINE_PHASE/$PIPELINE_ITERATION\"}""#,
        )
        .await
        .unwrap();
        assert_eq!(outcome.message, "coding/3");
    }

    #[tokio::test]
    async fn nonzero_exit_forces_failure() {
        let outcome = run(r#"echo '{"success": true, "message": "claimed"}'; exit 2"#)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.starts_with("claimed"));
    }

    #[tokio::test]
    async fn missing_outcome_is_an_error() {
        let err = run("echo nothing useful; exit 1").await.unwrap_err();
        assert!(matches!(err, PhaseError::NoOutcome { exit_code: Some(1) }));
    }

    #[tokio::test]
    async fn runs_in_configured_workdir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();
        let task = Task::new("t", "a", 0);
        let outcome = CommandPhase::new("coding", r#"test -f marker && echo '{"success": true}'"#)
            .with_workdir(Some(dir.path().to_path_buf()))
            .run(&task, &context(), CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn cancellation_kills_and_keeps_partial_outcome() {
        let task = Task::new("t", "a", 0);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = CommandPhase::new(
            "coding",
            r#"echo '{"success": true, "message": "partial"}'; exec sleep 30"#,
        )
        .run(&task, &context(), cancel)
        .await
        .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.message, "partial");
    }

    #[test]
    fn registry_built_from_config_commands() {
        let mut config = Config::default();
        config
            .parse_content("phase.coding = ./code.sh\nphase.review = \"./review.sh --strict\"\n")
            .unwrap();
        let registry = command_registry(&config);
        assert_eq!(registry.names(), vec!["coding", "review"]);
    }

    #[tokio::test]
    async fn cancellation_without_output_is_cancelled() {
        let task = Task::new("t", "a", 0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = CommandPhase::new("coding", "exec sleep 30")
            .run(&task, &context(), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseError::Cancelled));
    }
}
