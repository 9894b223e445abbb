// Light-cycle arena: runs external agent programs against each other on a shared grid.

pub mod config;
pub mod engine;
pub mod metrics;
pub mod replay;
