// Arena configuration, loaded from CLI flags, environment variables and a JSON
// match file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::agent::{AgentSpec, SettingsLine};
use crate::engine::config::{GRID_HEIGHT, GRID_WIDTH};
use crate::engine::simulation::SimulationConfig;
use crate::engine::state::Coord;

/// CLI flags that take a value.
const VALUE_FLAGS: [&str; 4] = ["--config", "--log-dir", "--decision-timeout-ms", "--interpreter"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no match file given (pass a path or set ARENA_CONFIG)")]
    MissingMatchFile,
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid match file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("agent {0} has an empty program_path")]
    EmptyProgramPath(usize),
    #[error("agent {agent} has invalid initial_coords [{x}, {y}]")]
    InvalidCoords { agent: usize, x: i32, y: i32 },
    #[error("no free cell left for agent {0}")]
    BoardFull(usize),
}

/// Process-level configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ArenaConfig {
    /// Match description to run.
    pub match_file: Option<PathBuf>,
    /// Parent of the per-run directories.
    pub log_dir: PathBuf,
    /// Whether the run directory (simulator.log, agent logs, replay) is written.
    pub keep_logs: bool,
    /// Per-decision budget. `None` waits indefinitely.
    pub decision_timeout: Option<Duration>,
    pub settings_once: bool,
    /// Default launcher for agents whose entry names none.
    pub interpreter: Option<String>,
    pub print_states: bool,
    pub print_metrics: bool,
}

impl ArenaConfig {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `ARENA_CONFIG` - Path to the match file
    /// - `ARENA_LOG_DIR` - Parent directory for run logs (default: `logs`)
    /// - `ARENA_KEEP_LOGS` - Set to `false` or `0` to keep no artifacts
    /// - `ARENA_DECISION_TIMEOUT_MS` - Per-decision budget in milliseconds
    /// - `ARENA_INTERPRETER` - Default launcher, e.g. `python3`
    ///
    /// CLI flags:
    /// - `<match.json>` or `--config <path>`
    /// - `--log-dir <dir>`, `--no-logs`
    /// - `--decision-timeout-ms <ms>`
    /// - `--settings-once`
    /// - `--interpreter <cmd>`
    /// - `--print-states`, `--metrics`
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_sources(&args, |key| std::env::var(key).ok())
    }

    /// Build from explicit arguments and an environment lookup. CLI wins over env.
    pub fn from_sources(args: &[String], env: impl Fn(&str) -> Option<String>) -> Self {
        let match_file = Self::parse_cli_value(args, "--config")
            .or_else(|| Self::positional(args))
            .or_else(|| env("ARENA_CONFIG"))
            .map(PathBuf::from);

        let log_dir = Self::parse_cli_value(args, "--log-dir")
            .or_else(|| env("ARENA_LOG_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("logs"));

        let keep_logs = !Self::has_flag(args, "--no-logs")
            && env("ARENA_KEEP_LOGS")
                .map(|v| !(v.eq_ignore_ascii_case("false") || v == "0"))
                .unwrap_or(true);

        let decision_timeout = Self::parse_cli_value(args, "--decision-timeout-ms")
            .or_else(|| env("ARENA_DECISION_TIMEOUT_MS"))
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let interpreter = Self::parse_cli_value(args, "--interpreter")
            .or_else(|| env("ARENA_INTERPRETER"))
            .filter(|v| !v.is_empty());

        ArenaConfig {
            match_file,
            log_dir,
            keep_logs,
            decision_timeout,
            settings_once: Self::has_flag(args, "--settings-once"),
            interpreter,
            print_states: Self::has_flag(args, "--print-states"),
            print_metrics: Self::has_flag(args, "--metrics"),
        }
    }

    pub fn settings_line(&self) -> SettingsLine {
        if self.settings_once {
            SettingsLine::Once
        } else {
            SettingsLine::EveryTurn
        }
    }

    /// `<log_dir>/run_<timestamp>`, or `None` when logs are not kept.
    pub fn run_dir(&self) -> Option<PathBuf> {
        if !self.keep_logs {
            return None;
        }
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        Some(self.log_dir.join(format!("run_{stamp}")))
    }

    /// Read the match file and turn it into the core's configuration.
    pub fn simulation_config(&self, run_dir: Option<PathBuf>) -> Result<SimulationConfig, ConfigError> {
        let path = self.match_file.as_ref().ok_or(ConfigError::MissingMatchFile)?;
        let match_file = MatchFile::load(path)?;
        let agents = match_file.agent_specs(self.interpreter.as_deref(), &mut rand::thread_rng())?;
        Ok(SimulationConfig {
            agents,
            log_dir: run_dir,
            decision_timeout: self.decision_timeout,
            settings_line: self.settings_line(),
        })
    }

    /// Parse a CLI flag value like `--log-dir out`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }

    fn has_flag(args: &[String], flag: &str) -> bool {
        args.iter().skip(1).any(|a| a == flag)
    }

    /// First argument that is neither a flag nor a flag's value.
    fn positional(args: &[String]) -> Option<String> {
        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            if VALUE_FLAGS.contains(&arg.as_str()) {
                iter.next();
                continue;
            }
            if !arg.starts_with("--") {
                return Some(arg.clone());
            }
        }
        None
    }
}

/// JSON match description: `{"ais": [{"program_path": ..., "initial_coords": [x, y]}]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchFile {
    #[serde(default)]
    pub ais: Vec<AgentEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEntry {
    /// `null` declares a disabled slot.
    pub program_path: Option<String>,
    /// Fixed start. `[-1, -1]` also disables the slot; absent means random.
    #[serde(default)]
    pub initial_coords: Option<[i32; 2]>,
    #[serde(default)]
    pub interpreter: Option<String>,
}

impl AgentEntry {
    fn is_disabled(&self) -> bool {
        self.program_path.is_none() || self.initial_coords == Some([-1, -1])
    }
}

impl MatchFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build agent specs in slot order, choosing a random free cell for every
    /// enabled agent without a fixed start.
    pub fn agent_specs<R: Rng>(
        &self,
        default_interpreter: Option<&str>,
        rng: &mut R,
    ) -> Result<Vec<AgentSpec>, ConfigError> {
        let mut taken: Vec<Coord> = Vec::new();
        let mut specs = Vec::with_capacity(self.ais.len());

        for (index, entry) in self.ais.iter().enumerate() {
            if entry.is_disabled() {
                specs.push(AgentSpec {
                    index,
                    program: None,
                    interpreter: None,
                    start: None,
                });
                continue;
            }
            let program = entry.program_path.as_deref().unwrap_or_default();
            if program.trim().is_empty() {
                return Err(ConfigError::EmptyProgramPath(index));
            }
            let start = match entry.initial_coords {
                Some([x, y]) => {
                    if !(0..GRID_WIDTH).contains(&x) || !(0..GRID_HEIGHT).contains(&y) {
                        return Err(ConfigError::InvalidCoords { agent: index, x, y });
                    }
                    Some(Coord::new(x, y))
                }
                None => None,
            };
            if let Some(c) = start {
                taken.push(c);
            }
            specs.push(AgentSpec {
                index,
                program: Some(PathBuf::from(program)),
                interpreter: entry
                    .interpreter
                    .clone()
                    .or_else(|| default_interpreter.map(str::to_string)),
                start,
            });
        }

        for spec in specs.iter_mut().filter(|s| s.is_enabled() && s.start.is_none()) {
            let cell = random_free_cell(&taken, rng).ok_or(ConfigError::BoardFull(spec.index))?;
            tracing::info!(agent = spec.index, x = cell.x, y = cell.y, "Random start chosen");
            taken.push(cell);
            spec.start = Some(cell);
        }

        Ok(specs)
    }
}

fn random_free_cell<R: Rng>(taken: &[Coord], rng: &mut R) -> Option<Coord> {
    let free = (GRID_WIDTH * GRID_HEIGHT) as usize - taken.len();
    if free == 0 {
        return None;
    }
    loop {
        let c = Coord::new(rng.gen_range(0..GRID_WIDTH), rng.gen_range(0..GRID_HEIGHT));
        if !taken.contains(&c) {
            return Some(c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("lightcycle-arena")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_defaults() {
        let cfg = ArenaConfig::from_sources(&args(&[]), |_| None);
        assert_eq!(cfg.match_file, None);
        assert_eq!(cfg.log_dir, PathBuf::from("logs"));
        assert!(cfg.keep_logs);
        assert_eq!(cfg.decision_timeout, None);
        assert_eq!(cfg.settings_line(), SettingsLine::EveryTurn);
        assert!(!cfg.print_states);
    }

    #[test]
    fn test_cli_flags() {
        let cfg = ArenaConfig::from_sources(
            &args(&[
                "--log-dir",
                "out",
                "match.json",
                "--decision-timeout-ms",
                "250",
                "--settings-once",
                "--no-logs",
                "--metrics",
            ]),
            |_| None,
        );
        assert_eq!(cfg.match_file, Some(PathBuf::from("match.json")));
        assert_eq!(cfg.log_dir, PathBuf::from("out"));
        assert!(!cfg.keep_logs);
        assert_eq!(cfg.run_dir(), None);
        assert_eq!(cfg.decision_timeout, Some(Duration::from_millis(250)));
        assert_eq!(cfg.settings_line(), SettingsLine::Once);
        assert!(cfg.print_metrics);
    }

    #[test]
    fn test_env_fallback_and_cli_precedence() {
        let env = |key: &str| match key {
            "ARENA_CONFIG" => Some("env.json".to_string()),
            "ARENA_DECISION_TIMEOUT_MS" => Some("100".to_string()),
            "ARENA_KEEP_LOGS" => Some("false".to_string()),
            _ => None,
        };
        let cfg = ArenaConfig::from_sources(&args(&[]), env);
        assert_eq!(cfg.match_file, Some(PathBuf::from("env.json")));
        assert_eq!(cfg.decision_timeout, Some(Duration::from_millis(100)));
        assert!(!cfg.keep_logs);

        let cfg = ArenaConfig::from_sources(&args(&["--config", "cli.json"]), env);
        assert_eq!(cfg.match_file, Some(PathBuf::from("cli.json")));
    }

    #[test]
    fn test_run_dir_is_under_log_dir() {
        let cfg = ArenaConfig::from_sources(&args(&["--log-dir", "runs"]), |_| None);
        let dir = cfg.run_dir().unwrap();
        assert!(dir.starts_with("runs"));
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("run_"));
    }

    #[test]
    fn test_match_file_parsing() {
        let file = MatchFile::from_json(
            r#"{"ais": [
                {"program_path": "bots/a.py", "initial_coords": [1, 2], "interpreter": "python3"},
                {"program_path": null},
                {"program_path": "bots/c", "initial_coords": [-1, -1]},
                {"program_path": "bots/d"}
            ]}"#,
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let specs = file.agent_specs(Some("sh"), &mut rng).unwrap();
        assert_eq!(specs.len(), 4);
        assert_eq!(specs[0].start, Some(Coord::new(1, 2)));
        assert_eq!(specs[0].interpreter.as_deref(), Some("python3"));
        assert!(!specs[1].is_enabled());
        assert!(!specs[2].is_enabled());
        assert!(specs[3].is_enabled());
        assert_eq!(specs[3].interpreter.as_deref(), Some("sh"));
        let random = specs[3].start.unwrap();
        assert!((0..GRID_WIDTH).contains(&random.x));
        assert!((0..GRID_HEIGHT).contains(&random.y));
        assert_ne!(random, Coord::new(1, 2));
    }

    #[test]
    fn test_match_file_errors() {
        assert!(matches!(
            MatchFile::from_json("{not json"),
            Err(ConfigError::Json(_))
        ));

        let mut rng = StdRng::seed_from_u64(1);
        let empty = MatchFile::from_json(r#"{"ais": [{"program_path": "  "}]}"#).unwrap();
        assert!(matches!(
            empty.agent_specs(None, &mut rng),
            Err(ConfigError::EmptyProgramPath(0))
        ));

        let off = MatchFile::from_json(r#"{"ais": [{"program_path": "a", "initial_coords": [30, 0]}]}"#)
            .unwrap();
        assert!(matches!(
            off.agent_specs(None, &mut rng),
            Err(ConfigError::InvalidCoords { agent: 0, x: 30, y: 0 })
        ));

        assert!(matches!(
            MatchFile::load(Path::new("/nonexistent/match.json")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_missing_match_file() {
        let cfg = ArenaConfig::from_sources(&args(&[]), |_| None);
        assert!(matches!(
            cfg.simulation_config(None),
            Err(ConfigError::MissingMatchFile)
        ));
    }

    #[test]
    fn test_random_free_cell_avoids_taken() {
        let mut rng = StdRng::seed_from_u64(3);
        let taken: Vec<Coord> = (0..GRID_WIDTH)
            .flat_map(|x| (0..GRID_HEIGHT).map(move |y| Coord::new(x, y)))
            .filter(|c| *c != Coord::new(4, 4))
            .collect();
        assert_eq!(random_free_cell(&taken, &mut rng), Some(Coord::new(4, 4)));
    }
}
