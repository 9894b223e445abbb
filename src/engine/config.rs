// Board dimensions
pub const GRID_WIDTH: i32 = 30;
pub const GRID_HEIGHT: i32 = 20;

// Agent slots
pub const MAX_AGENTS: usize = 4;
pub const MIN_AGENTS: usize = 2;

/// Documented upper bound on match length. Reported in the final progress
/// event, never enforced by the turn loop.
pub const MAX_TURNS: usize = 950;

// Sentinel coordinate for a dead or absent agent
pub const DEAD_X: i32 = -1;
pub const DEAD_Y: i32 = -1;

// Move tokens of the line protocol
pub const MOVE_UP: &str = "UP";
pub const MOVE_DOWN: &str = "DOWN";
pub const MOVE_LEFT: &str = "LEFT";
pub const MOVE_RIGHT: &str = "RIGHT";

/// How long `stop()` waits for the diagnostic collector to reach end-of-stream
/// after the child has been killed.
pub const COLLECTOR_GRACE_MS: u64 = 500;
