//! `ShellTask`: runs a templated command line through `bash -c`.
//!
//! Process spawning sits behind the [`CommandRunner`] trait so the task's
//! exit-code handling can be exercised with scripted runners.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::{template, ExecutableTask, TaskContext, TaskError};

/// Exit code that marks a task as skipped rather than failed.
pub const DEFAULT_SKIP_EXIT_CODE: i32 = 99;

/// Bytes of stdout/stderr kept per attempt.
pub const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

/// Characters of stderr quoted in a failure message.
const ERROR_EXCERPT_CHARS: usize = 500;

/// Static description of a shell task.
#[derive(Debug, Clone)]
pub struct ShellTaskConfig {
    /// Command line, may contain `{{ name }}` placeholders.
    pub command: String,
    /// Working directory; inherits the runner's when `None`.
    pub cwd: Option<PathBuf>,
    /// Extra environment for the process.
    pub env: BTreeMap<String, String>,
    /// Kill the process and fail the attempt after this long.
    pub execution_timeout: Option<Duration>,
    /// Exit code treated as "skip"; `None` disables skipping.
    pub skip_exit_code: Option<i32>,
}

impl ShellTaskConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            env: BTreeMap::new(),
            execution_timeout: None,
            skip_exit_code: Some(DEFAULT_SKIP_EXIT_CODE),
        }
    }
}

/// A fully rendered process invocation.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub script: String,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

/// What a finished process left behind.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Spawns processes on behalf of a [`ShellTask`].
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput, TaskError>;
}

/// Runs commands with `bash -c` on the tokio process driver.
///
/// Output lines are logged as they arrive; only the last
/// [`OUTPUT_TAIL_BYTES`] of each stream are retained.
pub struct TokioCommandRunner {
    shell: String,
}

impl Default for TokioCommandRunner {
    fn default() -> Self {
        Self { shell: "bash".into() }
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput, TaskError> {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&request.script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }
        command.envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let mut child = command
            .spawn()
            .map_err(|e| TaskError::Retryable(format!("failed to spawn {}: {e}", self.shell)))?;
        let mut group = ProcessGroup::of(&child);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskError::Fatal("child stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TaskError::Fatal("child stderr was not captured".into()))?;

        let finished = async {
            let (out, err) = tokio::join!(drain(stdout, "stdout"), drain(stderr, "stderr"));
            let status = child.wait().await;
            (out, err, status)
        };

        let result = match request.timeout {
            Some(limit) => tokio::time::timeout(limit, finished).await.ok(),
            None => Some(finished.await),
        };

        let Some((stdout, stderr, status)) = result else {
            // Everything the command started must be gone before the
            // retry delay starts.
            group.kill();
            let _ = child.start_kill();
            let _ = child.wait().await;
            let limit = request.timeout.unwrap_or_default();
            return Err(TaskError::Retryable(format!(
                "command timed out after {}",
                humanize(limit)
            )));
        };

        group.disarm();

        let status =
            status.map_err(|e| TaskError::Retryable(format!("failed to wait for command: {e}")))?;

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}

/// The child's process group, killed as a whole unless disarmed.
///
/// `kill_on_drop` only reaches the shell itself; signalling the group also
/// reaches the subshells and pipelines it started.
struct ProcessGroup {
    #[cfg(unix)]
    pgid: Option<nix::unistd::Pid>,
}

impl ProcessGroup {
    #[cfg(unix)]
    fn of(child: &Child) -> Self {
        let pgid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(nix::unistd::Pid::from_raw);
        Self { pgid }
    }

    #[cfg(not(unix))]
    fn of(_child: &Child) -> Self {
        Self {}
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};

            if let Some(pgid) = self.pgid.take() {
                match killpg(pgid, Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => warn!("failed to kill process group {pgid}: {e}"),
                }
            }
        }
    }

    /// The shell was reaped normally; leave the group alone.
    fn disarm(&mut self) {
        #[cfg(unix)]
        {
            self.pgid = None;
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: R, stream: &'static str) -> String {
    let mut reader = BufReader::new(reader);
    let mut tail = String::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']);
                info!(stream, "{text}");
                tail.push_str(text);
                tail.push('\n');
                keep_tail(&mut tail, OUTPUT_TAIL_BYTES);
            }
            Err(e) => {
                debug!(stream, "stopped reading output: {e}");
                break;
            }
        }
    }

    tail
}

/// Drop leading bytes so at most `limit` remain, respecting char boundaries.
fn keep_tail(s: &mut String, limit: usize) {
    if s.len() <= limit {
        return;
    }
    let mut cut = s.len() - limit;
    while !s.is_char_boundary(cut) {
        cut += 1;
    }
    s.drain(..cut);
}

fn humanize(d: Duration) -> String {
    if d.as_millis() < 1000 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

/// A task that executes a shell command line.
pub struct ShellTask {
    config: ShellTaskConfig,
    runner: Arc<dyn CommandRunner>,
}

impl ShellTask {
    pub fn new(config: ShellTaskConfig) -> Self {
        Self::with_runner(config, Arc::new(TokioCommandRunner::default()))
    }

    pub fn with_runner(config: ShellTaskConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    fn request_for(&self, ctx: &TaskContext) -> Result<CommandRequest, TaskError> {
        let vars = ctx.template_vars();
        let script = template::render(&self.config.command, &vars)?;
        if script.trim().is_empty() {
            return Err(TaskError::Fatal("command is empty".into()));
        }

        let mut env = Vec::with_capacity(self.config.env.len() + vars.len());
        for (key, value) in &self.config.env {
            env.push((key.clone(), template::render(value, &vars)?));
        }
        env.extend(ctx.env_vars());

        Ok(CommandRequest {
            script,
            cwd: self.config.cwd.clone(),
            env,
            timeout: self.config.execution_timeout,
        })
    }
}

#[async_trait]
impl ExecutableTask for ShellTask {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, TaskError> {
        let request = self.request_for(ctx)?;
        debug!(script = %request.script, cwd = ?request.cwd, "running command");

        let started = Instant::now();
        let output = self.runner.run(&request).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        match output.exit_code {
            Some(0) => {
                let return_value = output
                    .stdout
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or_default();
                Ok(json!({
                    "exit_code": 0,
                    "return_value": return_value,
                    "duration_ms": duration_ms,
                    "stdout_tail": output.stdout,
                }))
            }
            Some(code) if Some(code) == self.config.skip_exit_code => Err(TaskError::Skipped(
                format!("command exited with skip code {code}"),
            )),
            Some(code) => Err(TaskError::Retryable(with_excerpt(
                format!("command exited with code {code}"),
                &output.stderr,
            ))),
            None => Err(TaskError::Retryable(with_excerpt(
                "command was terminated by a signal".into(),
                &output.stderr,
            ))),
        }
    }
}

fn with_excerpt(message: String, stderr: &str) -> String {
    let trimmed = stderr.trim_end();
    if trimmed.is_empty() {
        return message;
    }
    let mut excerpt = trimmed.to_owned();
    keep_tail(&mut excerpt, ERROR_EXCERPT_CHARS);
    format!("{message}: {excerpt}")
}
