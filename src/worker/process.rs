//! Child-process worker launcher.
//!
//! The agent is started once per run. It receives a JSON request on stdin and
//! reports on stdout; the last line that parses as
//! `{"status":"success","result":...}` or
//! `{"status":"error","error":...,"retryable":false}` is the result. Plain text
//! on a zero exit is taken as the reply verbatim.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::error::WorkerError;
use crate::queue::{Payload, WorkItem, WorkKind};
use crate::worker::{WorkerHandle, WorkerLauncher, WorkerOutput};

/// Exit code a worker uses to say "this input can never succeed" (EX_DATAERR).
pub const TERMINAL_EXIT_CODE: i32 = 65;

/// How much stderr to keep in error messages.
const STDERR_TAIL_CHARS: usize = 500;

/// Stdout kept per run. The result is the last JSON line, so the tail is enough.
const MAX_STDOUT_BYTES: usize = 1024 * 1024;

const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Descendants can keep the output pipes open after the worker exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Command line for the agent process.
#[derive(Debug, Clone)]
pub struct ProcessLauncherConfig {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessLauncherConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Request written to the worker's stdin.
#[derive(Debug, Serialize)]
struct WorkerRequest<'a> {
    group_id: &'a str,
    kind: WorkKind,
    attempt: u32,
    #[serde(flatten)]
    payload: &'a Payload,
}

/// Result line read from the worker's stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum WireOutput {
    Success {
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Error {
        error: String,
        #[serde(default)]
        retryable: Option<bool>,
    },
}

/// Launches the agent as a child process per run.
pub struct ProcessLauncher {
    config: ProcessLauncherConfig,
}

impl ProcessLauncher {
    pub fn new(config: ProcessLauncherConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn start(&self, item: &WorkItem) -> Result<Box<dyn WorkerHandle>, WorkerError> {
        let request = WorkerRequest {
            group_id: &item.group_id,
            kind: item.kind,
            attempt: item.attempt,
            payload: &*item.payload,
        };
        let input = serde_json::to_vec(&request).map_err(|e| WorkerError::Start {
            reason: format!("failed to encode request: {e}"),
        })?;

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .envs(self.config.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("CHATLANE_GROUP_ID", &item.group_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| WorkerError::Start {
            reason: format!("{}: {e}", self.config.program),
        })?;

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_tail(out, MAX_STDOUT_BYTES)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(read_tail(err, MAX_STDERR_BYTES)));

        if let Some(mut stdin) = child.stdin.take() {
            let group_id = item.group_id.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!(group_id = %group_id, "Worker closed stdin early: {}", e);
                }
                let _ = stdin.shutdown().await;
            });
        }

        tracing::debug!(
            group_id = %item.group_id,
            pid = ?child.id(),
            program = %self.config.program,
            "Worker process spawned"
        );

        Ok(Box::new(ProcessHandle {
            child,
            stdout,
            stderr,
        }))
    }
}

/// A spawned agent process.
pub struct ProcessHandle {
    child: Child,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    async fn wait(&mut self) -> Result<WorkerOutput, WorkerError> {
        let status = self.child.wait().await.map_err(|e| WorkerError::Runtime {
            reason: format!("failed to wait for worker: {e}"),
        })?;

        let stdout = collect(self.stdout.take()).await;
        let stderr = collect(self.stderr.take()).await;

        classify(status, &stdout, &stderr)
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(pid = ?self.child.id(), "Worker kill failed: {}", e);
        }
    }
}

/// Read a stream to the end, keeping only its last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut dropped = 0usize;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                // Compact at twice the limit.
                if buf.len() > limit.saturating_mul(2) {
                    let excess = buf.len() - limit;
                    buf.drain(..excess);
                    dropped += excess;
                }
            }
            Err(e) => {
                tracing::debug!("Worker output stream error: {}", e);
                break;
            }
        }
    }
    if buf.len() > limit {
        let excess = buf.len() - limit;
        buf.drain(..excess);
        dropped += excess;
    }
    if dropped > 0 {
        tracing::debug!(dropped_bytes = dropped, "Worker output truncated to its tail");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(task: Option<JoinHandle<String>>) -> String {
    let Some(task) = task else {
        return String::new();
    };
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await {
        Ok(output) => output.unwrap_or_default(),
        Err(_) => {
            tracing::debug!("Worker output still open after exit, ignoring the rest");
            String::new()
        }
    }
}

/// The last stdout line that is a result object.
fn parse_output(stdout: &str) -> Option<WireOutput> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str(line).ok())
}

fn tail(s: &str, max_chars: usize) -> String {
    let trimmed = s.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        trimmed.to_string()
    } else {
        trimmed.chars().skip(count - max_chars).collect()
    }
}

/// Map exit status and output to the run result.
fn classify(status: ExitStatus, stdout: &str, stderr: &str) -> Result<WorkerOutput, WorkerError> {
    let wire = parse_output(stdout);

    match (status.code(), wire) {
        (Some(0), Some(WireOutput::Success { result, session_id })) => {
            Ok(WorkerOutput { result, session_id })
        }
        (Some(0), None) => {
            let text = stdout.trim();
            Ok(WorkerOutput {
                result: (!text.is_empty()).then(|| text.to_string()),
                session_id: None,
            })
        }
        (_, Some(WireOutput::Error { error, retryable: Some(false) })) => {
            Err(WorkerError::Terminal { reason: error })
        }
        (Some(0), Some(WireOutput::Error { error, .. })) => {
            Err(WorkerError::Runtime { reason: error })
        }
        (Some(TERMINAL_EXIT_CODE), wire) => Err(WorkerError::Terminal {
            reason: match wire {
                Some(WireOutput::Error { error, .. }) => error,
                _ => tail(stderr, STDERR_TAIL_CHARS),
            },
        }),
        (Some(code), wire) => Err(WorkerError::Runtime {
            reason: match wire {
                Some(WireOutput::Error { error, .. }) => format!("exit code {code}: {error}"),
                _ => format!("exit code {code}: {}", tail(stderr, STDERR_TAIL_CHARS)),
            },
        }),
        (None, _) => Err(WorkerError::Runtime {
            reason: "worker terminated by signal".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn exit(code: i32) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(code << 8)
    }

    #[test]
    fn parse_takes_last_result_line() {
        let stdout = "log line\n{\"status\":\"success\",\"result\":\"first\"}\nmore\n\
                      {\"status\":\"success\",\"result\":\"second\",\"session_id\":\"s1\"}\n";
        match parse_output(stdout) {
            Some(WireOutput::Success { result, session_id }) => {
                assert_eq!(result.as_deref(), Some("second"));
                assert_eq!(session_id.as_deref(), Some("s1"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_skips_non_result_json() {
        assert!(parse_output("{\"hello\":1}\nplain").is_none());
    }

    #[tokio::test]
    async fn read_tail_keeps_last_bytes() {
        let data = "x".repeat(100) + "\n{\"status\":\"success\",\"result\":\"ok\"}";
        let kept = read_tail(data.as_bytes(), 40).await;
        assert_eq!(kept.len(), 40);
        assert!(kept.ends_with("\"result\":\"ok\"}"));
        assert!(matches!(parse_output(&kept), Some(WireOutput::Success { .. })));

        let short = read_tail("hello".as_bytes(), 40).await;
        assert_eq!(short, "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runaway_output_is_bounded() {
        let launcher = shell(
            "cat > /dev/null; head -c 3000000 /dev/zero | tr '\\0' 'a'; echo; \
             echo '{\"status\":\"success\",\"result\":\"done\"}'",
        );
        let item = WorkItem::message("g1", Payload::new("ping"));
        let mut handle = launcher.start(&item).await.unwrap();
        let output = handle.wait().await.unwrap();
        assert_eq!(output.result.as_deref(), Some("done"));
    }

    #[test]
    fn tail_keeps_end() {
        assert_eq!(tail("  abcdef  ", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }

    #[cfg(unix)]
    #[test]
    fn classify_outcomes() {
        let ok = classify(exit(0), "{\"status\":\"success\",\"result\":\"hi\"}", "");
        assert_eq!(ok, Ok(WorkerOutput::text("hi")));

        let plain = classify(exit(0), "just text\n", "");
        assert_eq!(plain, Ok(WorkerOutput::text("just text")));

        let terminal = classify(
            exit(0),
            "{\"status\":\"error\",\"error\":\"bad\",\"retryable\":false}",
            "",
        );
        assert_eq!(terminal, Err(WorkerError::Terminal { reason: "bad".into() }));

        let soft = classify(exit(0), "{\"status\":\"error\",\"error\":\"flaky\"}", "");
        assert_eq!(soft, Err(WorkerError::Runtime { reason: "flaky".into() }));

        let data_err = classify(exit(TERMINAL_EXIT_CODE), "", "cannot parse input");
        assert_eq!(
            data_err,
            Err(WorkerError::Terminal { reason: "cannot parse input".into() })
        );

        match classify(exit(1), "", "boom") {
            Err(WorkerError::Runtime { reason }) => assert!(reason.contains("boom")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[cfg(unix)]
    fn shell(script: &str) -> ProcessLauncher {
        ProcessLauncher::new(ProcessLauncherConfig::new("sh").with_args(["-c", script]))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_process_and_reads_result() {
        let launcher = shell(
            "cat > /dev/null; echo '{\"status\":\"success\",\"result\":\"pong\"}'",
        );
        let item = WorkItem::message("g1", Payload::new("ping"));
        let mut handle = launcher.start(&item).await.unwrap();
        let output = handle.wait().await.unwrap();
        assert_eq!(output.result.as_deref(), Some("pong"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn request_reaches_stdin() {
        let launcher = shell("grep -q '\"prompt\":\"ping\"' && echo seen");
        let item = WorkItem::message("g1", Payload::new("ping"));
        let mut handle = launcher.start(&item).await.unwrap();
        let output = handle.wait().await.unwrap();
        assert_eq!(output.result.as_deref(), Some("seen"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_program_is_start_error() {
        let launcher = ProcessLauncher::new(ProcessLauncherConfig::new(
            "/nonexistent/chatlane-agent-binary",
        ));
        let item = WorkItem::message("g1", Payload::new("ping"));
        match launcher.start(&item).await {
            Err(WorkerError::Start { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("spawn should fail"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_kills_process() {
        let launcher = shell("exec sleep 30");
        let item = WorkItem::message("g1", Payload::new("ping"));
        let mut handle = launcher.start(&item).await.unwrap();
        handle.terminate().await;
        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("wait should return after kill");
        assert!(matches!(result, Err(WorkerError::Runtime { .. })));
    }
}
