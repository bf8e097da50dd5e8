// ProcessInvoker: spawns a child process, streams its output line by line and
// handles cooperative cancellation with a SIGINT -> SIGTERM -> SIGKILL escalation.

use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long to wait after SIGINT before escalating to SIGTERM.
const SIGINT_TIMEOUT: Duration = Duration::from_millis(7500);
/// How long to wait after SIGTERM before killing the process.
const SIGTERM_TIMEOUT: Duration = Duration::from_millis(2500);

/// Error for a non-zero exit code when a zero exit code was required.
#[derive(Debug, thiserror::Error)]
#[error("Exit code {exit_code} returned from process '{program}'")]
pub struct ProcessExitCodeError {
    pub exit_code: i32,
    pub program: String,
}

/// Error returned when the process was stopped because of cancellation.
#[derive(Debug, thiserror::Error)]
#[error("Process '{program}' was cancelled")]
pub struct ProcessCancelledError {
    pub program: String,
}

/// Which stream a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A single line of process output.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub data: String,
}

/// Everything needed to start a process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub environment: HashMap<String, String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Build a spec from a single command line, e.g. `"ffmpeg -i 'in file.png'"`.
    pub fn from_command_line(command_line: &str) -> Option<Self> {
        let mut parts = split_command_line(command_line).into_iter();
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            ..Self::default()
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// The command line as it would be typed, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Runs child processes on behalf of command handlers.
pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
}

impl ProcessInvoker {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        Self { trace }
    }

    /// Run the process described by `spec` until it exits or `cancel` fires.
    ///
    /// Every output line is sent on `output`; the sender is dropped once both
    /// streams are drained, so a receiver loop ends when the process is done.
    ///
    /// Returns the exit code. Fails with [`ProcessExitCodeError`] for a
    /// non-zero exit when `require_exit_code_zero` is set, and with
    /// [`ProcessCancelledError`] when cancellation stopped the process.
    pub async fn execute(
        &self,
        spec: &ProcessSpec,
        require_exit_code_zero: bool,
        cancel: CancellationToken,
        output: mpsc::UnboundedSender<OutputLine>,
    ) -> Result<i32> {
        self.trace.info(&format!("Starting process: {}", spec.display()));
        if let Some(dir) = &spec.working_directory {
            self.trace
                .verbose(&format!("  Working directory: '{}'", dir.display()));
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.working_directory {
            if dir.is_dir() {
                cmd.current_dir(dir);
            }
        }
        for (key, value) in &spec.environment {
            cmd.env(key, value);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::null());

        let start = std::time::Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start process '{}'", spec.program))?;

        let pid = child.id().unwrap_or(0);
        self.trace
            .info(&format!("Process started with process id {pid}."));

        let stdout_task = child
            .stdout
            .take()
            .map(|s| tokio::spawn(forward_lines(s, OutputStream::Stdout, output.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(forward_lines(s, OutputStream::Stderr, output.clone())));
        drop(output);

        let (exit_code, was_cancelled) = tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for process")?;
                (status.code().unwrap_or(-1), false)
            }
            _ = cancel.cancelled() => {
                self.trace.info("Cancellation requested, stopping process.");
                (self.cancel_and_kill_process(&mut child).await, true)
            }
        };

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        self.trace.info(&format!(
            "Finished process {pid} with exit code {exit_code} after {:.2?}.",
            start.elapsed()
        ));

        if was_cancelled {
            return Err(ProcessCancelledError {
                program: spec.program.clone(),
            }
            .into());
        }

        if exit_code != 0 && require_exit_code_zero {
            return Err(ProcessExitCodeError {
                exit_code,
                program: spec.program.clone(),
            }
            .into());
        }

        Ok(exit_code)
    }

    /// SIGINT, then SIGTERM, then kill.
    async fn cancel_and_kill_process(&self, child: &mut tokio::process::Child) -> i32 {
        for (signal, timeout) in [(Signal::Int, SIGINT_TIMEOUT), (Signal::Term, SIGTERM_TIMEOUT)] {
            if self.send_signal_and_wait(child, signal, timeout).await {
                self.trace
                    .info(&format!("Process stopped after {signal:?} signal."));
                return exit_code_of(child).await;
            }
        }

        self.trace
            .warning("Process ignored SIGINT and SIGTERM, killing it.");
        if let Err(e) = child.kill().await {
            tracing::warn!("Killing process failed: {}", e);
        }
        exit_code_of(child).await
    }

    /// Send `signal` and wait up to `timeout` for the process to exit.
    #[cfg(unix)]
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        signal: Signal,
        timeout: Duration,
    ) -> bool {
        let Some(pid) = child.id() else {
            return true;
        };

        let sig = match signal {
            Signal::Int => nix::sys::signal::Signal::SIGINT,
            Signal::Term => nix::sys::signal::Signal::SIGTERM,
        };

        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig).is_err() {
            self.trace
                .verbose(&format!("{sig:?} could not be sent to process {pid}."));
            return false;
        }

        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => false,
        }
    }

    #[cfg(not(unix))]
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        _signal: Signal,
        timeout: Duration,
    ) -> bool {
        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Int,
    Term,
}

async fn exit_code_of(child: &mut tokio::process::Child) -> i32 {
    child
        .wait()
        .await
        .map(|s| s.code().unwrap_or(-1))
        .unwrap_or(-1)
}

async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Reading process {:?} failed: {}", stream, e);
                break;
            }
        }

        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        let data = match String::from_utf8(std::mem::take(&mut buf)) {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!("Process {:?} line is not valid UTF-8", stream);
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        };
        if tx.send(OutputLine { stream, data }).is_err() {
            break;
        }
    }
}

/// Split a command line on whitespace, honouring single quotes, double quotes
/// and backslash escapes.
pub fn split_command_line(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut escape_next = false;
    let mut has_token = false;

    for ch in input.chars() {
        if escape_next {
            current.push(ch);
            escape_next = false;
            continue;
        }

        match ch {
            '\\' if !in_single_quote => {
                escape_next = true;
                has_token = true;
            }
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                has_token = true;
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                has_token = true;
            }
            ' ' | '\t' | '\n' if !in_single_quote && !in_double_quote => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            _ => {
                current.push(ch);
                has_token = true;
            }
        }
    }

    if has_token {
        args.push(current);
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::NullTraceWriter;

    fn make_invoker() -> ProcessInvoker {
        ProcessInvoker::new(Arc::new(NullTraceWriter))
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<OutputLine>) -> Vec<OutputLine> {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn split_simple() {
        assert_eq!(split_command_line("hello world"), vec!["hello", "world"]);
    }

    #[test]
    fn split_quoted() {
        assert_eq!(
            split_command_line(r#"blender "my scene.blend" -f '1'"#),
            vec!["blender", "my scene.blend", "-f", "1"]
        );
    }

    #[test]
    fn split_keeps_empty_quoted_argument() {
        assert_eq!(split_command_line(r#"a "" b"#), vec!["a", "", "b"]);
    }

    #[test]
    fn split_empty() {
        assert!(split_command_line("   ").is_empty());
    }

    #[test]
    fn spec_from_command_line() {
        let spec = ProcessSpec::from_command_line("echo 'hi there'").unwrap();
        assert_eq!(spec.program, "echo");
        assert_eq!(spec.args, vec!["hi there"]);
        assert_eq!(spec.display(), "echo hi there");
        assert!(ProcessSpec::from_command_line("").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_streams_output() {
        let invoker = make_invoker();
        let (tx, rx) = mpsc::unbounded_channel();
        let spec = ProcessSpec::new("sh").args(["-c", "echo out; echo err 1>&2"]);

        let (result, lines) = tokio::join!(
            invoker.execute(&spec, true, CancellationToken::new(), tx),
            collect(rx)
        );

        assert_eq!(result.unwrap(), 0);
        assert!(lines
            .iter()
            .any(|l| l.stream == OutputStream::Stdout && l.data == "out"));
        assert!(lines
            .iter()
            .any(|l| l.stream == OutputStream::Stderr && l.data == "err"));
    }

    #[tokio::test]
    async fn execute_nonexistent() {
        let invoker = make_invoker();
        let (tx, _rx) = mpsc::unbounded_channel();
        let spec = ProcessSpec::new("nonexistent_command_xyz_123");
        let result = invoker
            .execute(&spec, false, CancellationToken::new(), tx)
            .await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_require_exit_code_zero() {
        let invoker = make_invoker();
        let (tx, _rx) = mpsc::unbounded_channel();
        let spec = ProcessSpec::new("sh").args(["-c", "exit 3"]);
        let err = invoker
            .execute(&spec, true, CancellationToken::new(), tx)
            .await
            .unwrap_err();
        let exit = err.downcast_ref::<ProcessExitCodeError>().unwrap();
        assert_eq!(exit.exit_code, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_keeps_output_after_invalid_utf8() {
        let invoker = make_invoker();
        let (tx, rx) = mpsc::unbounded_channel();
        let spec = ProcessSpec::new("sh").args(["-c", r"printf 'a\377b\r\nnext\n'"]);

        let (result, lines) = tokio::join!(
            invoker.execute(&spec, true, CancellationToken::new(), tx),
            collect(rx)
        );

        assert_eq!(result.unwrap(), 0);
        let data: Vec<_> = lines.iter().map(|l| l.data.as_str()).collect();
        assert_eq!(data, vec!["a\u{FFFD}b", "next"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_cancel_stops_process() {
        let invoker = make_invoker();
        let (tx, _rx) = mpsc::unbounded_channel();
        let spec = ProcessSpec::new("sleep").arg("30");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = invoker.execute(&spec, true, cancel, tx).await.unwrap_err();
        assert!(err.downcast_ref::<ProcessCancelledError>().is_some());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
