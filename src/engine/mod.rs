pub mod agent;
pub mod config;
pub mod game;
pub mod grid;
pub mod server;
pub mod simulation;
pub mod state;
