// Shared helpers for tests that run real agent processes.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use lightcycle_arena::engine::agent::AgentSpec;
use lightcycle_arena::engine::simulation::SimulationConfig;
use lightcycle_arena::engine::state::Coord;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Agent that reads each request block and always answers `token`.
pub fn constant_agent(token: &str) -> String {
    format!(
        r#"
while read n id; do
  i=0
  while [ "$i" -lt "$n" ]; do
    read line
    i=$((i+1))
  done
  echo {token}
done
"#
    )
}

/// Like `constant_agent`, but writes one diagnostic line per decision.
pub fn chatty_agent(token: &str) -> String {
    format!(
        r#"
turn=0
while read n id; do
  i=0
  while [ "$i" -lt "$n" ]; do
    read line
    i=$((i+1))
  done
  echo "agent $id thinking on turn $turn" >&2
  turn=$((turn+1))
  echo {token}
done
"#
    )
}

/// Agent that never answers.
pub const STUCK_AGENT: &str = "exec sleep 30\n";

/// Write `body` to a fresh script file in the temp dir.
pub fn write_script(name: &str, body: &str) -> PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = std::env::temp_dir().join(format!(
        "lightcycle-it-{}-{n}-{name}.sh",
        std::process::id()
    ));
    std::fs::write(&path, body).unwrap();
    path
}

/// Fresh empty directory in the temp dir.
pub fn temp_dir(name: &str) -> PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "lightcycle-it-{}-{n}-{name}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

pub fn sh_agent(script: PathBuf, x: i32, y: i32) -> AgentSpec {
    AgentSpec {
        index: 0,
        program: Some(script),
        interpreter: Some("sh".to_string()),
        start: Some(Coord::new(x, y)),
    }
}

pub fn disabled_agent() -> AgentSpec {
    AgentSpec {
        index: 0,
        program: None,
        interpreter: None,
        start: None,
    }
}

pub fn config(agents: Vec<AgentSpec>) -> SimulationConfig {
    SimulationConfig {
        agents,
        ..Default::default()
    }
}
