// Agent process adapter: owns one child process, speaks the line protocol with
// it, and captures its stderr in the background.

use std::fs::File;
use std::future::Future;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::config::COLLECTOR_GRACE_MS;
use super::state::{Coord, Direction};
use crate::metrics;

/// Faults raised while talking to an agent. Everything except `Cancelled`
/// eliminates the agent; none of them abort the match.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to launch {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent process did not expose its {0} pipe")]
    MissingPipe(&'static str),
    #[error("agent is not running")]
    NotRunning,
    #[error("agent stream error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent closed its output stream")]
    OutputClosed,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("no decision within {0:?}")]
    Timeout(Duration),
    #[error("match cancelled")]
    Cancelled,
}

impl AgentError {
    /// Short label for metrics and progress reporting.
    pub fn reason(&self) -> &'static str {
        match self {
            AgentError::SpawnFailed { .. } => "spawn_failed",
            AgentError::MissingPipe(_) => "missing_pipe",
            AgentError::NotRunning => "not_running",
            AgentError::Io(_) => "io",
            AgentError::OutputClosed => "output_closed",
            AgentError::ProtocolViolation(_) => "protocol_violation",
            AgentError::Timeout(_) => "timeout",
            AgentError::Cancelled => "cancelled",
        }
    }
}

/// Launch description of one agent slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentSpec {
    pub index: usize,
    /// Program to run. `None` declares a disabled slot.
    pub program: Option<PathBuf>,
    /// Optional launcher, e.g. `python3`; the program path becomes its argument.
    pub interpreter: Option<String>,
    /// Starting cell. Must be resolved before the match is constructed.
    pub start: Option<Coord>,
}

impl AgentSpec {
    pub fn is_enabled(&self) -> bool {
        self.program.is_some()
    }

    /// Identity used for the diagnostic artifact: `<index>_<program stem>`.
    pub fn name(&self) -> String {
        let stem = self
            .program
            .as_deref()
            .and_then(Path::file_stem)
            .map(|s| s.to_string_lossy().into_owned());
        match stem {
            Some(stem) => format!("{}_{}", self.index, stem),
            None => format!("{}_disabled", self.index),
        }
    }
}

/// When the `<agentCount> <agentId>` line is written.
///
/// Reference agents read that line at the top of every turn, so they only
/// stay in sync when it precedes each request block. Agents that read it
/// once at startup want [`SettingsLine::Once`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SettingsLine {
    /// Before every request block.
    #[default]
    EveryTurn,
    /// Only before the first request block.
    Once,
}

/// Per-match knobs shared by every agent process.
#[derive(Clone, Debug)]
pub struct AgentOptions {
    /// Directory for `<name>.log` diagnostic artifacts.
    pub log_dir: Option<PathBuf>,
    /// Upper bound on one decision. `None` blocks indefinitely.
    pub decision_timeout: Option<Duration>,
    pub settings_line: SettingsLine,
    /// Flipped to `true` to interrupt a pending read.
    pub cancel: watch::Receiver<bool>,
}

/// Result of one request/response round.
#[derive(Debug)]
pub struct Decision {
    pub outcome: Result<Direction, AgentError>,
    pub duration: Duration,
}

/// One agent program running as a child process.
pub struct AgentProcess {
    index: usize,
    name: String,
    enabled: bool,
    running: bool,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    diagnostics: Option<mpsc::UnboundedReceiver<String>>,
    collector: Option<JoinHandle<()>>,
    log_file: Option<BufWriter<File>>,
    settings_line: SettingsLine,
    settings_sent: bool,
    decision_timeout: Option<Duration>,
    cancel: watch::Receiver<bool>,
    /// Diagnostic blocks, indexed by the agent's own decision counter.
    turn_logs: Vec<Vec<String>>,
}

impl AgentProcess {
    /// Start the agent described by `spec`. A disabled spec yields a process
    /// that never runs. Must be called from within a tokio runtime.
    pub fn launch(spec: &AgentSpec, options: &AgentOptions) -> Result<Self, AgentError> {
        let name = spec.name();
        let log_file = match &options.log_dir {
            Some(dir) => Some(BufWriter::new(File::create(dir.join(format!("{name}.log")))?)),
            None => None,
        };

        let mut agent = AgentProcess {
            index: spec.index,
            name,
            enabled: spec.is_enabled(),
            running: false,
            child: None,
            stdin: None,
            stdout: None,
            diagnostics: None,
            collector: None,
            log_file,
            settings_line: options.settings_line,
            settings_sent: false,
            decision_timeout: options.decision_timeout,
            cancel: options.cancel.clone(),
            turn_logs: Vec::new(),
        };

        let Some(program) = &spec.program else {
            tracing::info!(agent = spec.index, "Agent slot disabled");
            return Ok(agent);
        };

        let mut command = match &spec.interpreter {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(program);
                c
            }
            None => Command::new(program),
        };
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| AgentError::SpawnFailed {
            program: program.display().to_string(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(AgentError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(AgentError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(AgentError::MissingPipe("stderr"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        agent.collector = Some(spawn_collector(stderr, tx, spec.index));
        agent.diagnostics = Some(rx);
        agent.stdin = Some(stdin);
        agent.stdout = Some(BufReader::new(stdout));

        tracing::info!(
            agent = spec.index,
            pid = child.id(),
            program = %program.display(),
            "Agent launched"
        );
        agent.child = Some(child);
        agent.running = true;
        metrics::LIVE_AGENT_PROCESSES.inc();

        Ok(agent)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Diagnostic lines filed under the agent's `turn`-th decision.
    pub fn logs_at_turn(&self, turn: usize) -> Option<&[String]> {
        self.turn_logs.get(turn).map(Vec::as_slice)
    }

    pub fn turn_logs(&self) -> &[Vec<String>] {
        &self.turn_logs
    }

    /// Run one protocol round: send the shared state, read one move, then file
    /// whatever diagnostics are queued under this decision.
    ///
    /// `views` holds `(start, head)` for every agent in index order. An agent
    /// that is not running answers `DOWN` without any I/O.
    pub async fn ask(&mut self, agent_count: usize, views: &[(Coord, Coord)]) -> Decision {
        if !self.running {
            tracing::debug!(agent = self.index, "Agent not running, defaulting to DOWN");
            self.turn_logs.push(Vec::new());
            return Decision {
                outcome: Ok(Direction::Down),
                duration: Duration::ZERO,
            };
        }

        let started = Instant::now();
        let outcome = self.exchange(agent_count, views).await;
        let duration = started.elapsed();

        if !matches!(outcome, Err(AgentError::Cancelled)) {
            self.flush_diagnostics();
        }
        Decision { outcome, duration }
    }

    async fn exchange(
        &mut self,
        agent_count: usize,
        views: &[(Coord, Coord)],
    ) -> Result<Direction, AgentError> {
        let request = self.build_request(agent_count, views);
        tracing::trace!(agent = self.index, request = %request.trim_end(), "Sending request");

        let stdin = self.stdin.as_mut().ok_or(AgentError::NotRunning)?;
        stdin.write_all(request.as_bytes()).await?;
        stdin.flush().await?;

        let line = self.read_line().await?;
        parse_move(&line)
    }

    fn build_request(&mut self, agent_count: usize, views: &[(Coord, Coord)]) -> String {
        let mut request = String::new();
        if self.settings_line == SettingsLine::EveryTurn || !self.settings_sent {
            request.push_str(&format!("{agent_count} {}\n", self.index));
            self.settings_sent = true;
        }
        for (start, head) in views {
            request.push_str(&format!("{start} {head}\n"));
        }
        request
    }

    async fn read_line(&mut self) -> Result<String, AgentError> {
        let Self {
            stdout,
            cancel,
            decision_timeout,
            ..
        } = self;
        let stdout = stdout.as_mut().ok_or(AgentError::NotRunning)?;

        let mut buf = Vec::new();
        let read = stdout.read_until(b'\n', &mut buf);
        let n = tokio::select! {
            res = within_budget(*decision_timeout, read) => res?,
            _ = cancelled(cancel) => return Err(AgentError::Cancelled),
        };
        if n == 0 {
            return Err(AgentError::OutputClosed);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Non-blocking drain of the diagnostic queue into a new per-decision block.
    fn flush_diagnostics(&mut self) {
        let mut block = Vec::new();
        if let Some(rx) = self.diagnostics.as_mut() {
            while let Ok(line) = rx.try_recv() {
                block.push(line);
            }
        }
        let turn = self.turn_logs.len();
        self.persist(turn, &block);
        self.turn_logs.push(block);
    }

    fn persist(&mut self, turn: usize, block: &[String]) {
        if block.is_empty() {
            return;
        }
        metrics::DIAGNOSTIC_LINES_TOTAL.inc_by(block.len() as u64);
        let Some(file) = self.log_file.as_mut() else {
            return;
        };
        let written = (|| -> std::io::Result<()> {
            writeln!(file, "--- turn {turn} ---")?;
            for line in block {
                writeln!(file, "{line}")?;
            }
            file.flush()
        })();
        if let Err(e) = written {
            tracing::warn!(agent = self.index, "Failed to write diagnostic log, disabling it: {e}");
            self.log_file = None;
        }
    }

    /// Kill the process and wait for it. Idempotent; safe on a disabled agent.
    ///
    /// Diagnostics still queued when the stream closes are filed as one more
    /// block after the last decision.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.stdin = None;

        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(agent = self.index, "Kill signal not delivered: {e}");
            }
            match child.wait().await {
                Ok(status) => tracing::info!(agent = self.index, %status, "Agent stopped"),
                Err(e) => tracing::warn!(agent = self.index, "Failed to reap agent process: {e}"),
            }
        }
        self.stdout = None;

        if let Some(mut collector) = self.collector.take() {
            let grace = Duration::from_millis(COLLECTOR_GRACE_MS);
            if tokio::time::timeout(grace, &mut collector).await.is_err() {
                tracing::debug!(agent = self.index, "Diagnostic stream still open, aborting collector");
                collector.abort();
            }
        }

        let mut leftovers = Vec::new();
        if let Some(mut rx) = self.diagnostics.take() {
            rx.close();
            while let Ok(line) = rx.try_recv() {
                leftovers.push(line);
            }
        }
        if !leftovers.is_empty() {
            let turn = self.turn_logs.len();
            self.persist(turn, &leftovers);
            self.turn_logs.push(leftovers);
        }
        if let Some(mut file) = self.log_file.take() {
            if let Err(e) = file.flush() {
                tracing::warn!(agent = self.index, "Failed to flush diagnostic log: {e}");
            }
        }
        metrics::LIVE_AGENT_PROCESSES.dec();
    }
}

/// Parse one output line as a move token. Only the line terminator is stripped.
pub fn parse_move(line: &str) -> Result<Direction, AgentError> {
    let token = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
    token.parse().map_err(AgentError::ProtocolViolation)
}

/// Read stderr lines into the queue until the stream closes or the receiver goes away.
fn spawn_collector(
    stderr: ChildStderr,
    tx: mpsc::UnboundedSender<String>,
    agent: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(|c: char| c == '\n' || c == '\r')
                        .to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(agent, "Diagnostic stream error: {e}");
                    break;
                }
            }
        }
        tracing::debug!(agent, "Diagnostic collector finished");
    })
}

async fn within_budget<F>(budget: Option<Duration>, read: F) -> Result<usize, AgentError>
where
    F: Future<Output = std::io::Result<usize>>,
{
    match budget {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .map_err(|_| AgentError::Timeout(limit))?
            .map_err(AgentError::from),
        None => Ok(read.await?),
    }
}

/// Resolves once the cancel flag is set. Never resolves if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
