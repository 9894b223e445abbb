use std::time::Duration;

use serde::Serialize;

use super::config::*;
use super::grid::Grid;
use super::state::{Coord, Direction, GameState};

/// What an agent did on a given turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "move", rename_all = "snake_case")]
pub enum TurnAction {
    /// Placeholder record for the initial placement (turn 0).
    Init,
    Move(Direction),
    /// The agent broke the protocol or its process failed; it is eliminated.
    Forfeit,
}

impl TurnAction {
    pub fn label(&self) -> &'static str {
        match self {
            TurnAction::Init => "INIT",
            TurnAction::Move(d) => d.token(),
            TurnAction::Forfeit => "FORFEIT",
        }
    }
}

/// Metadata for one history step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TurnRecord {
    /// History index of the state this record produced.
    pub turn: usize,
    /// Acting agent; `None` for the initial record.
    pub agent: Option<usize>,
    /// The acting agent's own decision counter (0 for its first decision).
    pub agent_turn: Option<usize>,
    pub action: TurnAction,
    /// Time the agent took to answer.
    pub duration: Duration,
}

/// Owns the append-only history of a match and the per-agent death index.
///
/// `advance` and `forfeit` are the only mutating operations.
#[derive(Clone, Debug)]
pub struct Game {
    starts: Vec<Option<Coord>>,
    states: Vec<GameState>,
    death_turns: Vec<Option<usize>>,
    records: Vec<TurnRecord>,
    agent_turns: Vec<usize>,
}

impl Game {
    /// Create a game on the standard 30x20 board. `None` marks a disabled slot.
    pub fn new(starts: &[Option<Coord>]) -> Self {
        Self::with_grid(Grid::new(GRID_WIDTH, GRID_HEIGHT), starts)
    }

    pub fn with_grid(grid: Grid, starts: &[Option<Coord>]) -> Self {
        let initial = GameState::initial(grid, starts);
        // disabled slots count as dead from turn 0
        let death_turns = starts.iter().map(|s| s.map_or(Some(0), |_| None)).collect();
        Game {
            starts: starts.to_vec(),
            states: vec![initial],
            death_turns,
            records: vec![TurnRecord {
                turn: 0,
                agent: None,
                agent_turn: None,
                action: TurnAction::Init,
                duration: Duration::ZERO,
            }],
            agent_turns: vec![0; starts.len()],
        }
    }

    /// Rebuild a game by replaying recorded actions from turn 0.
    pub fn replay(starts: &[Option<Coord>], records: &[TurnRecord]) -> Self {
        let mut game = Game::new(starts);
        for record in records {
            let Some(agent) = record.agent else { continue };
            match record.action {
                TurnAction::Move(d) => {
                    game.advance(agent, d, record.duration);
                }
                TurnAction::Forfeit => {
                    game.forfeit(agent, record.duration);
                }
                TurnAction::Init => {}
            }
        }
        game
    }

    pub fn agent_count(&self) -> usize {
        self.starts.len()
    }

    /// Apply a move for `agent` and append the resulting state.
    pub fn advance(&mut self, agent: usize, direction: Direction, duration: Duration) -> &GameState {
        let next = self.last_state().move_agent(agent, direction);
        self.push(agent, next, TurnAction::Move(direction), duration)
    }

    /// Eliminate `agent` after a protocol violation or process failure.
    pub fn forfeit(&mut self, agent: usize, duration: Duration) -> &GameState {
        let next = self.last_state().eliminate(agent);
        self.push(agent, next, TurnAction::Forfeit, duration)
    }

    fn push(
        &mut self,
        agent: usize,
        next: GameState,
        action: TurnAction,
        duration: Duration,
    ) -> &GameState {
        let turn = self.states.len();
        if !self.last_state().is_dead(agent) && next.is_dead(agent) {
            self.death_turns[agent] = Some(turn);
            tracing::debug!(agent, turn, action = action.label(), "Agent died");
        }
        self.records.push(TurnRecord {
            turn,
            agent: Some(agent),
            agent_turn: Some(self.agent_turns[agent]),
            action,
            duration,
        });
        self.agent_turns[agent] += 1;
        self.states.push(next);
        &self.states[turn]
    }

    pub fn last_state(&self) -> &GameState {
        // history always holds the initial state
        &self.states[self.states.len() - 1]
    }

    pub fn states(&self) -> &[GameState] {
        &self.states
    }

    pub fn state_at(&self, turn: usize) -> Option<&GameState> {
        self.states.get(turn)
    }

    /// Number of states in the history, initial placement included.
    pub fn turn_count(&self) -> usize {
        self.states.len()
    }

    pub fn turn_record_at(&self, turn: usize) -> Option<&TurnRecord> {
        self.records.get(turn)
    }

    pub fn records(&self) -> &[TurnRecord] {
        &self.records
    }

    /// History index of the state in which `agent` died, if it has.
    pub fn death_turn_of(&self, agent: usize) -> Option<usize> {
        self.death_turns.get(agent).copied().flatten()
    }

    pub fn start_of(&self, agent: usize) -> Option<Coord> {
        self.starts.get(agent).copied().flatten()
    }

    /// `(start, head)` as announced to agents; both are the sentinel for a dead agent.
    pub fn public_view(&self, agent: usize) -> (Coord, Coord) {
        let last = self.last_state();
        if last.is_dead(agent) {
            (Coord::DEAD, Coord::DEAD)
        } else {
            (self.starts[agent].unwrap_or(Coord::DEAD), last.head(agent))
        }
    }

    pub fn winner(&self) -> Option<usize> {
        self.last_state().winner()
    }
}
