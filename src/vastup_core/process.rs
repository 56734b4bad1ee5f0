use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Rolling window of child output retained per stream. Matches the bounded
/// log-tail discipline used for job diagnostics; full output is never kept.
const MAX_TAIL_LINES: usize = 200;

const CANCEL_POLL: Duration = Duration::from_millis(200);

/// Process-wide cooperative cancellation handle. Armed once by the operator
/// interrupt handler; observed at every poll tick, retry sleep, and child
/// wait.
#[derive(Debug, Clone, Default)]
pub struct Cancel {
    flag: Arc<AtomicBool>,
}

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on cancellation. Returns false when
    /// the sleep was cut short by a cancel.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.is_cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(remaining.min(CANCEL_POLL));
        }
        !self.is_cancelled()
    }
}

/// Structured description of one child process invocation: program, argv,
/// working directory, and environment overlay. Replaces ad-hoc shell string
/// composition so specs can be inspected and asserted on.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
        }
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

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn env_is_set(&self, key: &str) -> bool {
        self.envs.iter().any(|(k, _)| k == key)
    }

    /// Human-readable command line with quoted arguments, for logs and
    /// diagnostics bundles.
    pub fn rendered(&self) -> String {
        let mut parts = vec![quote_arg(&self.program.to_string_lossy())];
        parts.extend(self.args.iter().map(|a| quote_arg(a)));
        parts.join(" ")
    }
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"') {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Tagged result of a supervised child: exit status, bounded stream tails,
/// and wall-clock time.
#[derive(Debug)]
pub struct ProcessOutcome {
    pub exit_code: Option<i32>,
    pub success: bool,
    /// True when the child was killed because the operator cancelled.
    pub cancelled: bool,
    pub stdout_tail: Vec<String>,
    pub stderr_tail: Vec<String>,
    pub elapsed: Duration,
}

impl ProcessOutcome {
    /// Compact excerpt of the most recent stderr (falling back to stdout)
    /// lines, for failure reasons and diagnostics.
    pub fn tail_excerpt(&self, max_lines: usize) -> String {
        let source = if self.stderr_tail.is_empty() {
            &self.stdout_tail
        } else {
            &self.stderr_tail
        };
        let start = source.len().saturating_sub(max_lines);
        source[start..].join("\n")
    }
}

enum StreamLine {
    Stdout(String),
    Stderr(String),
}

/// Run a child to completion under the cancellation flag.
///
/// Both output streams are drained line by line on dedicated threads; each
/// line is offered to `on_line` as it arrives and folded into a bounded
/// tail. On cancellation the child is killed and the outcome is marked
/// `cancelled` rather than surfacing an error, so callers can distinguish
/// operator intent from failure.
pub fn run(
    spec: &ProcessSpec,
    cancel: &Cancel,
    on_line: Option<&(dyn Fn(&str) + Sync)>,
) -> Result<ProcessOutcome> {
    let started = Instant::now();

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &spec.envs {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", spec.program.display()))?;

    let stdout = child.stdout.take().context("child stdout not captured")?;
    let stderr = child.stderr.take().context("child stderr not captured")?;

    let mut stdout_tail: Vec<String> = Vec::new();
    let mut stderr_tail: Vec<String> = Vec::new();
    let mut cancelled = false;

    let (line_tx, line_rx) = mpsc::channel::<StreamLine>();

    thread::scope(|scope| -> Result<()> {
        let stdout_tx = line_tx.clone();
        scope.spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if stdout_tx.send(StreamLine::Stdout(line)).is_err() {
                    break;
                }
            }
        });
        let stderr_tx = line_tx;
        scope.spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                if stderr_tx.send(StreamLine::Stderr(line)).is_err() {
                    break;
                }
            }
        });

        // Drain lines while polling the child so a cancel can interrupt a
        // long-running stage promptly. The channel closes once both reader
        // threads finish, which only happens after the child exits.
        loop {
            match line_rx.recv_timeout(CANCEL_POLL) {
                Ok(line) => {
                    let (tail, text) = match line {
                        StreamLine::Stdout(text) => (&mut stdout_tail, text),
                        StreamLine::Stderr(text) => (&mut stderr_tail, text),
                    };
                    if let Some(on_line) = on_line
                        && !text.trim().is_empty()
                    {
                        on_line(&text);
                    }
                    push_bounded(tail, text);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if cancel.is_cancelled() && !cancelled {
                        cancelled = true;
                        let _ = child.kill();
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    })?;

    let status = child
        .wait()
        .with_context(|| format!("failed to wait for {}", spec.program.display()))?;

    Ok(ProcessOutcome {
        exit_code: status.code(),
        success: status.success() && !cancelled,
        cancelled,
        stdout_tail,
        stderr_tail,
        elapsed: started.elapsed(),
    })
}

fn push_bounded(tail: &mut Vec<String>, line: String) {
    if tail.len() >= MAX_TAIL_LINES {
        tail.remove(0);
    }
    tail.push(line);
}
