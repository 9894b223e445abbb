// Turn loop: drives the agent processes round-robin against the game history.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::metrics;
use crate::replay::ReplayRecorder;

use super::agent::{AgentError, AgentOptions, AgentProcess, AgentSpec, SettingsLine};
use super::config::*;
use super::game::Game;
use super::grid::Grid;
use super::state::{Coord, Direction};

/// Everything the core needs to run one match.
#[derive(Clone, Debug, Default)]
pub struct SimulationConfig {
    /// One entry per slot, in agent-index order. Enabled slots need a start.
    pub agents: Vec<AgentSpec>,
    /// Run directory for per-agent logs and the replay. `None` keeps nothing.
    pub log_dir: Option<PathBuf>,
    pub decision_timeout: Option<Duration>,
    pub settings_line: SettingsLine,
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("{0} agents configured, at most {MAX_AGENTS} are supported")]
    TooManyAgents(usize),
    #[error("{0} usable agents configured, at least {MIN_AGENTS} are required")]
    NotEnoughAgents(usize),
    #[error("agent {0} has no starting coordinate")]
    MissingStart(usize),
    #[error("start ({coord}) of agent {agent} is off the board")]
    InvalidStart { agent: usize, coord: Coord },
    #[error("agents {first} and {second} share start ({coord})")]
    StartCollision {
        first: usize,
        second: usize,
        coord: Coord,
    },
    #[error("launch path {path} of agent {agent} is unreadable: {source}")]
    UnreadableProgram {
        agent: usize,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("agent {agent} failed to launch: {source}")]
    Launch {
        agent: usize,
        #[source]
        source: AgentError,
    },
    #[error("log directory unavailable: {0}")]
    LogDir(#[from] std::io::Error),
    #[error("simulation already started")]
    AlreadyStarted,
    #[error("simulation cancelled")]
    Cancelled,
    #[error("no agent left alive")]
    NoSurvivors,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    Initialized,
    Running,
    Completed,
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "move", rename_all = "snake_case")]
pub enum ProgressEvent {
    Start,
    Move(Direction),
    Forfeit,
    Death,
    Win,
}

impl ProgressEvent {
    pub fn label(&self) -> &'static str {
        match self {
            ProgressEvent::Start => "start",
            ProgressEvent::Move(d) => d.token(),
            ProgressEvent::Forfeit => "forfeit",
            ProgressEvent::Death => "death",
            ProgressEvent::Win => "win",
        }
    }
}

/// One progress tick reported inline from the turn loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// Progress step counter; `MAX_TURNS` on the final win tick.
    pub turn: usize,
    pub agent: Option<usize>,
    pub event: ProgressEvent,
}

impl Progress {
    /// Share of the nominal match length, clamped to 100.
    pub fn percent(&self) -> f64 {
        (self.turn as f64 * 100.0 / MAX_TURNS as f64).min(100.0)
    }
}

/// Agent identity announced at match start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AgentSummary {
    pub index: usize,
    pub name: String,
    pub enabled: bool,
    pub start: Option<Coord>,
}

/// Messages recorded into replays and broadcast to match subscribers.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum MatchMessage {
    #[serde(rename = "match_start")]
    MatchStart {
        width: i32,
        height: i32,
        agents: Vec<AgentSummary>,
    },
    /// One applied decision.
    #[serde(rename = "turn")]
    Turn {
        turn: usize,
        agent: usize,
        action: String,
        head: Coord,
        duration_ms: f64,
    },
    #[serde(rename = "progress")]
    Progress(Progress),
    #[serde(rename = "match_end")]
    MatchEnd {
        winner: Option<usize>,
        turns: usize,
        death_turns: Vec<Option<usize>>,
        aborted: bool,
    },
}

/// Shared flag that interrupts a running match.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        CancelHandle { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// One match: the agent processes plus the game they play.
pub struct Simulation {
    game: Game,
    agents: Vec<AgentProcess>,
    phase: MatchPhase,
    cancel: CancelHandle,
    recorder: ReplayRecorder,
    log_dir: Option<PathBuf>,
    format: &'static str,
}

impl Simulation {
    /// Validate the configuration, launch every enabled agent and build the
    /// turn-0 state. Any failure stops the agents launched so far.
    pub async fn new(config: SimulationConfig) -> Result<Self, SimulationError> {
        Self::with_cancel(config, CancelHandle::new()).await
    }

    /// Like [`Simulation::new`], but driven by a handle the caller already
    /// holds, so a cancel issued while the agents launch is honoured.
    pub async fn with_cancel(
        config: SimulationConfig,
        cancel: CancelHandle,
    ) -> Result<Self, SimulationError> {
        let starts = validate(&config)?;
        check_programs(&config)?;
        let usable = starts.iter().flatten().count();

        if let Some(dir) = &config.log_dir {
            std::fs::create_dir_all(dir)?;
        }

        let options = AgentOptions {
            log_dir: config.log_dir.clone(),
            decision_timeout: config.decision_timeout,
            settings_line: config.settings_line,
            cancel: cancel.subscribe(),
        };

        let mut agents: Vec<AgentProcess> = Vec::with_capacity(config.agents.len());
        for (index, spec) in config.agents.iter().enumerate() {
            let spec = AgentSpec {
                index,
                ..spec.clone()
            };
            match AgentProcess::launch(&spec, &options) {
                Ok(agent) => agents.push(agent),
                Err(source) => {
                    tracing::error!(agent = index, "Failed to launch agent: {source}");
                    for launched in agents.iter_mut() {
                        launched.stop().await;
                    }
                    return Err(SimulationError::Launch {
                        agent: index,
                        source,
                    });
                }
            }
        }

        if cancel.is_cancelled() {
            tracing::info!("Cancelled while launching agents");
            for launched in agents.iter_mut() {
                launched.stop().await;
            }
            return Err(SimulationError::Cancelled);
        }

        tracing::info!(
            agents = agents.len(),
            usable,
            timeout_ms = config.decision_timeout.map(|d| d.as_millis() as u64),
            "Simulation initialized"
        );

        Ok(Simulation {
            game: Game::new(&starts),
            agents,
            phase: MatchPhase::Initialized,
            cancel,
            recorder: ReplayRecorder::new(),
            log_dir: config.log_dir,
            format: metrics::format_label(usable),
        })
    }

    /// Run the match to completion and return the winner's index.
    ///
    /// `on_progress` is called inline at every decision point, death tick and
    /// the final win. Every agent process is stopped on return, on any path.
    pub async fn start<F>(&mut self, mut on_progress: F) -> Result<usize, SimulationError>
    where
        F: FnMut(&Progress) + Send,
    {
        if self.phase != MatchPhase::Initialized {
            return Err(SimulationError::AlreadyStarted);
        }
        self.phase = MatchPhase::Running;
        metrics::ACTIVE_MATCHES.inc();
        metrics::MATCHES_STARTED_TOTAL
            .with_label_values(&[self.format])
            .inc();
        let started = Instant::now();

        tracing::info!("Starting simulation");
        let start_msg = self.start_message();
        self.recorder.record(&start_msg);
        on_progress(&Progress {
            turn: 0,
            agent: None,
            event: ProgressEvent::Start,
        });

        let outcome = self.run_turns(&mut on_progress).await;

        match &outcome {
            Ok(winner) => {
                tracing::info!(agent = winner, turns = self.game.turn_count(), "Agent won");
                self.phase = MatchPhase::Completed;
                on_progress(&Progress {
                    turn: MAX_TURNS,
                    agent: Some(*winner),
                    event: ProgressEvent::Win,
                });
                metrics::MATCHES_COMPLETED_TOTAL
                    .with_label_values(&[self.format])
                    .inc();
            }
            Err(e) => {
                tracing::warn!("Simulation aborted: {e}");
                self.phase = MatchPhase::Aborted;
                metrics::MATCHES_ABORTED_TOTAL
                    .with_label_values(&[self.format])
                    .inc();
            }
        }

        self.stop_agents().await;
        metrics::ACTIVE_MATCHES.dec();
        metrics::MATCH_DURATION_SECONDS
            .with_label_values(&[self.format])
            .observe(started.elapsed().as_secs_f64());

        let end_msg = self.end_message();
        self.recorder.record(&end_msg);
        self.save_replay();

        outcome
    }

    async fn run_turns<F>(&mut self, on_progress: &mut F) -> Result<usize, SimulationError>
    where
        F: FnMut(&Progress) + Send,
    {
        let agent_count = self.agents.len();
        let mut step = 0;

        loop {
            if let Some(winner) = self.game.winner() {
                return Ok(winner);
            }
            if self.game.last_state().alive_agents().is_empty() {
                return Err(SimulationError::NoSurvivors);
            }

            for agent in 0..agent_count {
                if self.game.winner().is_some() {
                    break;
                }
                if self.cancel.is_cancelled() {
                    return Err(SimulationError::Cancelled);
                }

                if self.game.last_state().is_dead(agent) {
                    self.agents[agent].stop().await;
                    metrics::AGENT_TURNS_TOTAL.with_label_values(&["idle"]).inc();
                    step += 1;
                    on_progress(&Progress {
                        turn: step,
                        agent: Some(agent),
                        event: ProgressEvent::Death,
                    });
                    continue;
                }

                let views: Vec<(Coord, Coord)> =
                    (0..agent_count).map(|i| self.game.public_view(i)).collect();
                let decision = self.agents[agent].ask(agent_count, &views).await;
                metrics::DECISION_DURATION_MS
                    .with_label_values(&[self.format])
                    .observe(decision.duration.as_secs_f64() * 1000.0);

                let event = match decision.outcome {
                    Ok(direction) => {
                        self.game.advance(agent, direction, decision.duration);
                        metrics::AGENT_TURNS_TOTAL.with_label_values(&["move"]).inc();
                        ProgressEvent::Move(direction)
                    }
                    Err(AgentError::Cancelled) => return Err(SimulationError::Cancelled),
                    Err(e) => {
                        tracing::warn!(agent, "Agent forfeits: {e}");
                        metrics::AGENT_TURNS_TOTAL
                            .with_label_values(&["forfeit"])
                            .inc();
                        metrics::AGENT_FORFEITS_TOTAL
                            .with_label_values(&[e.reason()])
                            .inc();
                        self.game.forfeit(agent, decision.duration);
                        ProgressEvent::Forfeit
                    }
                };

                let state = self.game.last_state();
                tracing::debug!(
                    agent,
                    turn = state.turn(),
                    action = event.label(),
                    elapsed_ms = decision.duration.as_secs_f64() * 1000.0,
                    "Agent move"
                );
                let turn_msg = MatchMessage::Turn {
                    turn: state.turn(),
                    agent,
                    action: event.label().to_string(),
                    head: state.head(agent),
                    duration_ms: decision.duration.as_secs_f64() * 1000.0,
                };
                let died = state.is_dead(agent);
                self.recorder.record(&turn_msg);

                if died {
                    self.agents[agent].stop().await;
                }

                step += 1;
                on_progress(&Progress {
                    turn: step,
                    agent: Some(agent),
                    event,
                });
            }
        }
    }

    /// Stop every agent process. Idempotent; a match that has not finished is
    /// marked aborted and can no longer be started.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.stop_agents().await;
        if matches!(self.phase, MatchPhase::Initialized | MatchPhase::Running) {
            self.phase = MatchPhase::Aborted;
        }
    }

    async fn stop_agents(&mut self) {
        for agent in self.agents.iter_mut() {
            agent.stop().await;
        }
    }

    /// Handle for cancelling the match from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn game(&self) -> &Game {
        &self.game
    }

    pub fn agent(&self, index: usize) -> Option<&AgentProcess> {
        self.agents.get(index)
    }

    pub fn agents(&self) -> &[AgentProcess] {
        &self.agents
    }

    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    pub fn winner(&self) -> Option<usize> {
        self.game.winner()
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Diagnostic lines that `agent` wrote around history step `step`.
    ///
    /// `None` if the step is out of range or was taken by another agent.
    pub fn logs_at(&self, step: usize, agent: usize) -> Option<&[String]> {
        let record = self.game.turn_record_at(step)?;
        if record.agent != Some(agent) {
            return None;
        }
        self.agents.get(agent)?.logs_at_turn(record.agent_turn?)
    }

    /// Gzipped JSON replay of everything recorded so far.
    pub fn replay_data(&self) -> Result<Vec<u8>, std::io::Error> {
        self.recorder.finish()
    }

    /// Log every state in the history as a text board.
    pub fn log_all_states(&self) {
        for state in self.game.states() {
            tracing::info!(
                turn = state.turn(),
                agent = ?state.acting_agent(),
                "State\n{state}"
            );
        }
    }

    /// `match_start` message describing the board and the agent slots.
    pub fn start_message(&self) -> MatchMessage {
        let grid: &Grid = self.game.last_state().grid();
        MatchMessage::MatchStart {
            width: grid.width,
            height: grid.height,
            agents: self
                .agents
                .iter()
                .map(|a| AgentSummary {
                    index: a.index(),
                    name: a.name().to_string(),
                    enabled: a.is_enabled(),
                    start: self.game.start_of(a.index()),
                })
                .collect(),
        }
    }

    /// `match_end` message for the current history. Aborted matches report no winner.
    pub fn end_message(&self) -> MatchMessage {
        let aborted = self.phase == MatchPhase::Aborted;
        MatchMessage::MatchEnd {
            winner: if aborted { None } else { self.game.winner() },
            turns: self.game.turn_count(),
            death_turns: (0..self.agents.len())
                .map(|a| self.game.death_turn_of(a))
                .collect(),
            aborted,
        }
    }

    fn save_replay(&self) {
        let Some(dir) = &self.log_dir else {
            return;
        };
        let path = dir.join("replay.json.gz");
        match self.recorder.save(&path) {
            Ok(()) => tracing::info!(path = %path.display(), "Replay saved"),
            Err(e) => tracing::warn!(path = %path.display(), "Failed to save replay: {e}"),
        }
    }
}

/// Check slot count, usable agents and starts. Returns the per-slot starts,
/// `None` for disabled slots.
fn validate(config: &SimulationConfig) -> Result<Vec<Option<Coord>>, SimulationError> {
    if config.agents.len() > MAX_AGENTS {
        return Err(SimulationError::TooManyAgents(config.agents.len()));
    }
    let usable = config.agents.iter().filter(|a| a.is_enabled()).count();
    if usable < MIN_AGENTS {
        return Err(SimulationError::NotEnoughAgents(usable));
    }

    let board = Grid::new(GRID_WIDTH, GRID_HEIGHT);
    let mut starts: Vec<Option<Coord>> = Vec::with_capacity(config.agents.len());
    for (agent, spec) in config.agents.iter().enumerate() {
        if !spec.is_enabled() {
            starts.push(None);
            continue;
        }
        let coord = spec.start.ok_or(SimulationError::MissingStart(agent))?;
        if !board.is_valid(coord.x, coord.y) {
            return Err(SimulationError::InvalidStart { agent, coord });
        }
        if let Some(first) = starts.iter().position(|s| *s == Some(coord)) {
            return Err(SimulationError::StartCollision {
                first,
                second: agent,
                coord,
            });
        }
        starts.push(Some(coord));
    }
    Ok(starts)
}

/// Every enabled launch path must be openable, interpreter or not.
fn check_programs(config: &SimulationConfig) -> Result<(), SimulationError> {
    for (agent, spec) in config.agents.iter().enumerate() {
        let Some(path) = &spec.program else {
            continue;
        };
        if let Err(source) = std::fs::File::open(path) {
            return Err(SimulationError::UnreadableProgram {
                agent,
                path: path.clone(),
                source,
            });
        }
    }
    Ok(())
}
