use std::fs::File;
use std::process::ExitCode;
use std::sync::Mutex;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use lightcycle_arena::config::ArenaConfig;
use lightcycle_arena::engine::server::{MatchResult, MatchServer};
use lightcycle_arena::metrics;

fn init_tracing(log_file: Option<File>) {
    let file_layer = log_file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_filter(LevelFilter::DEBUG)
    });
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
        .with(file_layer)
        .init();
}

/// Create the run directory and its `simulator.log`.
fn open_run_log(config: &ArenaConfig) -> (Option<std::path::PathBuf>, Option<File>) {
    let Some(dir) = config.run_dir() else {
        return (None, None);
    };
    match std::fs::create_dir_all(&dir).and_then(|_| File::create(dir.join("simulator.log"))) {
        Ok(file) => (Some(dir), Some(file)),
        Err(e) => {
            eprintln!("Cannot create run directory {}: {e}", dir.display());
            (None, None)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = ArenaConfig::load();
    let (run_dir, log_file) = open_run_log(&config);
    init_tracing(log_file);
    metrics::register_metrics();

    tracing::info!(?config, "Configuration loaded");
    match &run_dir {
        Some(dir) => tracing::info!(run_dir = %dir.display(), "Logs kept"),
        None => tracing::info!("Logs won't be kept"),
    }

    let sim_config = match config.simulation_config(run_dir) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let server = MatchServer::new();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<MatchResult>();
    let on_complete = Box::new(move |result: MatchResult| {
        let _ = done_tx.send(result);
    });
    let mut handle = match server
        .start_match_with_callback(sim_config, Some(on_complete))
        .await
    {
        Ok(h) => h,
        Err(e) => {
            tracing::error!("Failed to start match: {e}");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        _ = &mut handle => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, stopping match");
            server.stop_match();
            let _ = handle.await;
        }
    }

    let result = match done_rx.await {
        Ok(r) => r,
        Err(_) => {
            tracing::error!("Match ended without a result");
            return ExitCode::FAILURE;
        }
    };

    let game = result.simulation.game();
    for agent in 0..game.agent_count() {
        tracing::info!(
            agent,
            name = result.simulation.agent(agent).map(|a| a.name()),
            death_turn = game.death_turn_of(agent),
            "Agent summary"
        );
    }

    let exit = match (result.winner, &result.error) {
        (Some(winner), _) => {
            tracing::info!(agent = winner, turns = result.turn_count, "Match won");
            ExitCode::SUCCESS
        }
        (None, Some(e)) => {
            tracing::error!("Match aborted: {e}");
            ExitCode::FAILURE
        }
        (None, None) => ExitCode::FAILURE,
    };

    if config.print_states {
        result.simulation.log_all_states();
    }
    if config.print_metrics {
        println!("{}", metrics::gather_metrics());
    }

    exit
}
