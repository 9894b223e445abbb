use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::config::*;
use super::grid::Grid;

/// A board coordinate. `Coord::DEAD` is the off-grid sentinel for a dead agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

impl Coord {
    pub const DEAD: Coord = Coord {
        x: DEAD_X,
        y: DEAD_Y,
    };

    pub const fn new(x: i32, y: i32) -> Self {
        Coord { x, y }
    }

    pub fn is_dead(&self) -> bool {
        *self == Coord::DEAD
    }

    pub fn offset(&self, direction: Direction) -> Coord {
        let (dx, dy) = direction.delta();
        Coord::new(self.x + dx, self.y + dy)
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.x, self.y)
    }
}

/// One unit move on the board.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }

    /// Protocol token for this move.
    pub fn token(self) -> &'static str {
        match self {
            Direction::Up => MOVE_UP,
            Direction::Down => MOVE_DOWN,
            Direction::Left => MOVE_LEFT,
            Direction::Right => MOVE_RIGHT,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Direction {
    type Err = String;

    /// Case-sensitive exact match against the four move tokens.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Direction::ALL
            .into_iter()
            .find(|d| d.token() == s)
            .ok_or_else(|| format!("unknown move token {s:?}"))
    }
}

/// One turn's immutable snapshot of the match.
///
/// States live in an append-only history owned by `Game`; the link to the
/// predecessor is its turn index rather than a pointer. Unchanged trails are
/// shared between consecutive snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GameState {
    turn: usize,
    grid: Grid,
    heads: Vec<Coord>,
    trails: Vec<Arc<Vec<Coord>>>,
    acting_agent: Option<usize>,
    previous: Option<usize>,
}

impl GameState {
    /// Build the turn-0 state. `None` marks a disabled slot: dead from the start
    /// with an empty trail.
    ///
    /// Panics if an enabled start is off the grid or shared with another agent.
    pub fn initial(mut grid: Grid, starts: &[Option<Coord>]) -> Self {
        let mut heads = Vec::with_capacity(starts.len());
        let mut trails = Vec::with_capacity(starts.len());
        for (agent, start) in starts.iter().enumerate() {
            match start {
                Some(c) => {
                    assert!(grid.is_valid(c.x, c.y), "start {c:?} of agent {agent} is off-grid");
                    assert!(
                        grid.get(c.x, c.y).is_none(),
                        "start {c:?} of agent {agent} is already taken"
                    );
                    grid.set(c.x, c.y, Some(agent));
                    heads.push(*c);
                    trails.push(Arc::new(vec![*c]));
                }
                None => {
                    heads.push(Coord::DEAD);
                    trails.push(Arc::new(Vec::new()));
                }
            }
        }
        GameState {
            turn: 0,
            grid,
            heads,
            trails,
            acting_agent: None,
            previous: None,
        }
    }

    pub fn turn(&self) -> usize {
        self.turn
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn heads(&self) -> &[Coord] {
        &self.heads
    }

    pub fn head(&self, agent: usize) -> Coord {
        self.heads[agent]
    }

    pub fn trail(&self, agent: usize) -> &[Coord] {
        &self.trails[agent]
    }

    /// The agent whose action produced this state (`None` for turn 0).
    pub fn acting_agent(&self) -> Option<usize> {
        self.acting_agent
    }

    /// Turn index of the predecessor state (`None` for turn 0).
    pub fn previous_turn(&self) -> Option<usize> {
        self.previous
    }

    pub fn agent_count(&self) -> usize {
        self.heads.len()
    }

    pub fn is_dead(&self, agent: usize) -> bool {
        self.heads[agent].is_dead()
    }

    pub fn alive_agents(&self) -> Vec<usize> {
        (0..self.heads.len()).filter(|&a| !self.is_dead(a)).collect()
    }

    /// The sole survivor, or `None` while more than one agent is alive.
    pub fn winner(&self) -> Option<usize> {
        match self.alive_agents().as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// Apply one move for `agent` and return the successor state.
    ///
    /// Moving onto a free in-bounds cell extends the trail. Anything else kills
    /// the agent and erases its cells from the board.
    pub fn move_agent(&self, agent: usize, direction: Direction) -> GameState {
        let target = self.heads[agent].offset(direction);
        let free = self.grid.is_valid(target.x, target.y)
            && self.grid.get(target.x, target.y).is_none();
        if !free {
            return self.eliminate(agent);
        }

        let mut grid = self.grid.clone();
        grid.set(target.x, target.y, Some(agent));
        let mut heads = self.heads.clone();
        heads[agent] = target;
        let mut trails = self.trails.clone();
        let mut trail = Vec::with_capacity(trails[agent].len() + 1);
        trail.extend_from_slice(&trails[agent]);
        trail.push(target);
        trails[agent] = Arc::new(trail);

        self.successor(agent, grid, heads, trails)
    }

    /// Remove `agent` from the board: head becomes the sentinel, trail is
    /// cleared, and its cells become unowned.
    pub fn eliminate(&self, agent: usize) -> GameState {
        let mut grid = self.grid.clone();
        grid.replace_all(Some(agent), None);
        let mut heads = self.heads.clone();
        heads[agent] = Coord::DEAD;
        let mut trails = self.trails.clone();
        trails[agent] = Arc::new(Vec::new());

        self.successor(agent, grid, heads, trails)
    }

    fn successor(
        &self,
        agent: usize,
        grid: Grid,
        heads: Vec<Coord>,
        trails: Vec<Arc<Vec<Coord>>>,
    ) -> GameState {
        GameState {
            turn: self.turn + 1,
            grid,
            heads,
            trails,
            acting_agent: Some(agent),
            previous: Some(self.turn),
        }
    }
}

impl fmt::Display for GameState {
    /// Text board: `.` for free cells, the owner index otherwise, `[` before a head.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header: Vec<String> = (0..self.grid.width).map(|x| (x % 10).to_string()).collect();
        writeln!(f, "_| {}", header.join(" "))?;
        for y in 0..self.grid.height {
            write!(f, "{}|", y % 10)?;
            for x in 0..self.grid.width {
                match self.grid.get(x, y) {
                    Some(owner) => {
                        let marker = if self.heads[owner] == Coord::new(x, y) { '[' } else { ' ' };
                        write!(f, "{marker}{owner}")?;
                    }
                    None => write!(f, " .")?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_agents() -> GameState {
        GameState::initial(
            Grid::new(GRID_WIDTH, GRID_HEIGHT),
            &[Some(Coord::new(5, 5)), Some(Coord::new(24, 14))],
        )
    }

    /// Every owned cell belongs to its owner's trail and every trail cell is owned.
    fn assert_consistent(state: &GameState) {
        for (x, y, owner) in state.grid().owned_cells() {
            assert!(
                state.trail(owner).contains(&Coord::new(x, y)),
                "cell ({x}, {y}) owned by {owner} missing from its trail"
            );
        }
        for agent in 0..state.agent_count() {
            for c in state.trail(agent) {
                assert_eq!(state.grid().get(c.x, c.y), Some(agent));
            }
            assert_eq!(state.grid().count_owned(agent), state.trail(agent).len());
        }
    }

    #[test]
    fn test_direction_tokens() {
        assert_eq!("UP".parse::<Direction>(), Ok(Direction::Up));
        assert_eq!("DOWN".parse::<Direction>(), Ok(Direction::Down));
        assert_eq!("LEFT".parse::<Direction>(), Ok(Direction::Left));
        assert_eq!("RIGHT".parse::<Direction>(), Ok(Direction::Right));
        assert!("up".parse::<Direction>().is_err());
        assert!(" UP".parse::<Direction>().is_err());
        assert!("".parse::<Direction>().is_err());
        assert_eq!(Direction::Left.to_string(), "LEFT");
    }

    #[test]
    fn test_initial_state() {
        let s = two_agents();
        assert_eq!(s.turn(), 0);
        assert_eq!(s.previous_turn(), None);
        assert_eq!(s.acting_agent(), None);
        assert_eq!(s.trail(0), &[Coord::new(5, 5)]);
        assert_eq!(s.trail(1), &[Coord::new(24, 14)]);
        assert_eq!(s.winner(), None);
        assert_consistent(&s);
    }

    #[test]
    fn test_disabled_slot_is_dead_from_start() {
        let s = GameState::initial(
            Grid::new(GRID_WIDTH, GRID_HEIGHT),
            &[Some(Coord::new(1, 1)), None, Some(Coord::new(3, 3))],
        );
        assert!(s.is_dead(1));
        assert!(s.trail(1).is_empty());
        assert_eq!(s.alive_agents(), vec![0, 2]);
    }

    #[test]
    fn test_move_into_free_cell() {
        let s = two_agents();
        let next = s.move_agent(0, Direction::Right);
        assert_eq!(next.turn(), 1);
        assert_eq!(next.previous_turn(), Some(0));
        assert_eq!(next.acting_agent(), Some(0));
        assert_eq!(next.head(0), Coord::new(6, 5));
        assert_eq!(next.trail(0).len(), 2);
        assert_eq!(next.grid().get(6, 5), Some(0));
        assert_consistent(&next);
        // predecessor untouched
        assert_eq!(s.head(0), Coord::new(5, 5));
        assert_eq!(s.grid().get(6, 5), None);
    }

    #[test]
    fn test_move_off_grid_kills() {
        let s = GameState::initial(
            Grid::new(GRID_WIDTH, GRID_HEIGHT),
            &[Some(Coord::new(0, 0)), Some(Coord::new(10, 10))],
        );
        let s = s.move_agent(0, Direction::Right);
        let s = s.move_agent(0, Direction::Up);
        assert!(s.is_dead(0));
        assert_eq!(s.head(0), Coord::DEAD);
        assert!(s.trail(0).is_empty());
        assert_eq!(s.grid().count_owned(0), 0);
        assert_eq!(s.winner(), Some(1));
        assert_consistent(&s);
    }

    #[test]
    fn test_move_into_trail_kills_only_mover() {
        let s = GameState::initial(
            Grid::new(GRID_WIDTH, GRID_HEIGHT),
            &[Some(Coord::new(4, 5)), Some(Coord::new(6, 5))],
        );
        let s = s.move_agent(1, Direction::Up); // 1 at (6,4), trail (6,5),(6,4)
        let s = s.move_agent(0, Direction::Right); // 0 at (5,5)
        let s = s.move_agent(0, Direction::Right); // (6,5) owned by 1
        assert!(s.is_dead(0));
        assert!(!s.is_dead(1));
        assert_eq!(s.grid().get(6, 5), Some(1));
        assert_eq!(s.grid().get(6, 4), Some(1));
        assert_eq!(s.trail(1).len(), 2);
        assert_consistent(&s);
    }

    #[test]
    fn test_move_is_deterministic() {
        let s = two_agents();
        for d in Direction::ALL {
            assert_eq!(s.move_agent(1, d), s.move_agent(1, d));
        }
    }

    #[test]
    fn test_unchanged_trails_are_shared() {
        let s = two_agents();
        let next = s.move_agent(0, Direction::Down);
        assert!(Arc::ptr_eq(&s.trails[1], &next.trails[1]));
        assert!(!Arc::ptr_eq(&s.trails[0], &next.trails[0]));
    }

    #[test]
    fn test_display_marks_heads() {
        let s = GameState::initial(Grid::new(3, 2), &[Some(Coord::new(0, 0)), Some(Coord::new(2, 1))]);
        let s = s.move_agent(0, Direction::Right);
        let text = s.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "_| 0 1 2");
        assert_eq!(lines[1], "0| 0[0 .");
        assert_eq!(lines[2], "1| . .[1");
    }
}
