// Match server: runs one match at a time on a background task and broadcasts
// its progress to subscribers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::config::MAX_TURNS;
use super::simulation::{
    CancelHandle, MatchMessage, Simulation, SimulationConfig, SimulationError,
};

/// Result of a finished match, passed to the on_complete callback.
pub struct MatchResult {
    pub winner: Option<usize>,
    /// Why the match ended without a winner, if it did.
    pub error: Option<String>,
    pub turn_count: usize,
    pub replay_data: Vec<u8>,
    /// The finished match, for history and log queries.
    pub simulation: Simulation,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("A match is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Simulation(#[from] SimulationError),
}

type CompletionCallback = Box<dyn FnOnce(MatchResult) + Send + 'static>;

/// Runs matches on a background task and broadcasts every progress event as
/// JSON via a broadcast channel.
pub struct MatchServer {
    broadcast_tx: broadcast::Sender<String>,
    running: Arc<AtomicBool>,
    /// Progress step, updated by the match task.
    current_turn: Arc<AtomicUsize>,
    cancel: Arc<Mutex<Option<CancelHandle>>>,
}

impl Default for MatchServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchServer {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            broadcast_tx: tx,
            running: Arc::new(AtomicBool::new(false)),
            current_turn: Arc::new(AtomicUsize::new(0)),
            cancel: Arc::new(Mutex::new(None)),
        }
    }

    /// Subscribe to match messages. Returns a receiver that yields JSON strings.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.broadcast_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcast_tx.receiver_count()
    }

    /// Whether a match is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn current_turn(&self) -> usize {
        self.current_turn.load(Ordering::Relaxed)
    }

    /// Cancel the running match (if any). Every agent process is terminated.
    pub fn stop_match(&self) {
        if let Ok(guard) = self.cancel.lock() {
            if let Some(handle) = guard.as_ref() {
                tracing::info!("Stopping match");
                handle.cancel();
            }
        }
    }

    pub async fn start_match(&self, config: SimulationConfig) -> Result<JoinHandle<()>, ServerError> {
        self.start_match_with_callback(config, None).await
    }

    /// Launch the agents and run the match on a background task.
    ///
    /// Configuration and launch failures are returned here, before any turn is
    /// taken. The returned handle resolves after `on_complete` has run.
    pub async fn start_match_with_callback(
        &self,
        config: SimulationConfig,
        on_complete: Option<CompletionCallback>,
    ) -> Result<JoinHandle<()>, ServerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ServerError::AlreadyRunning);
        }

        // registered before launch so stop_match reaches a match still starting up
        let handle = CancelHandle::new();
        if let Ok(mut guard) = self.cancel.lock() {
            *guard = Some(handle.clone());
        }

        let mut simulation = match Simulation::with_cancel(config, handle).await {
            Ok(s) => s,
            Err(e) => {
                if let Ok(mut guard) = self.cancel.lock() {
                    *guard = None;
                }
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        self.current_turn.store(0, Ordering::Relaxed);

        let tx = self.broadcast_tx.clone();
        let running = self.running.clone();
        let current_turn = self.current_turn.clone();
        let cancel = self.cancel.clone();

        send(&tx, &simulation.start_message());

        let task = tokio::spawn(async move {
            let progress_tx = tx.clone();
            let progress_turn = current_turn.clone();
            let run = tokio::spawn(async move {
                let outcome = simulation
                    .start(move |p| {
                        progress_turn.store(p.turn, Ordering::Relaxed);
                        tracing::info!(
                            agent = ?p.agent,
                            event = p.event.label(),
                            "Progress {} / {} = {:.2}%",
                            p.turn,
                            MAX_TURNS,
                            p.percent()
                        );
                        send(&progress_tx, &MatchMessage::Progress(*p));
                    })
                    .await;
                (simulation, outcome)
            });

            match run.await {
                Ok((simulation, outcome)) => {
                    send(&tx, &simulation.end_message());
                    if let Some(callback) = on_complete {
                        let replay_data = simulation.replay_data().unwrap_or_else(|e| {
                            tracing::warn!("Failed to compress replay: {e}");
                            Vec::new()
                        });
                        let (winner, error) = match outcome {
                            Ok(w) => (Some(w), None),
                            Err(e) => (None, Some(e.to_string())),
                        };
                        callback(MatchResult {
                            winner,
                            error,
                            turn_count: simulation.game().turn_count(),
                            replay_data,
                            simulation,
                        });
                    }
                }
                Err(e) if e.is_panic() => {
                    let panic_info = e.into_panic();
                    let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic_info.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    tracing::error!("Match task panicked: {}", msg);
                }
                Err(e) => tracing::error!("Match task failed: {e}"),
            }

            if let Ok(mut guard) = cancel.lock() {
                *guard = None;
            }
            current_turn.store(0, Ordering::Relaxed);
            running.store(false, Ordering::SeqCst);
        });

        Ok(task)
    }
}

fn send(tx: &broadcast::Sender<String>, msg: &MatchMessage) {
    match serde_json::to_string(msg) {
        // no subscribers is fine
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => tracing::warn!("Failed to serialize match message: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::agent::AgentSpec;
    use crate::engine::state::Coord;
    use std::path::PathBuf;

    #[test]
    fn test_match_server_new() {
        let server = MatchServer::new();
        assert!(!server.is_running());
        assert_eq!(server.current_turn(), 0);
        // no match yet, nothing to stop
        server.stop_match();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_immediately() {
        let server = MatchServer::new();
        let config = SimulationConfig {
            agents: vec![AgentSpec {
                index: 0,
                program: Some(PathBuf::from("agent.sh")),
                interpreter: Some("sh".to_string()),
                start: Some(Coord::new(0, 0)),
            }],
            ..Default::default()
        };
        let result = server.start_match(config).await;
        assert!(matches!(
            result,
            Err(ServerError::Simulation(SimulationError::NotEnoughAgents(1)))
        ));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_failed_launch_clears_cancel_slot() {
        let server = MatchServer::new();
        let agent = |x| AgentSpec {
            index: 0,
            program: Some(PathBuf::from("/nonexistent/lightcycle-agent.sh")),
            interpreter: Some("sh".to_string()),
            start: Some(Coord::new(x, 0)),
        };
        let config = SimulationConfig {
            agents: vec![agent(0), agent(5)],
            ..Default::default()
        };
        let result = server.start_match(config).await;
        assert!(matches!(
            result,
            Err(ServerError::Simulation(SimulationError::UnreadableProgram { agent: 0, .. }))
        ));
        assert!(server.cancel.lock().unwrap().is_none());
        assert!(!server.is_running());
    }
}
