pub mod agents;
pub mod api;
pub mod autopilot;
pub mod budget;
pub mod checks;
pub mod communications;
pub mod config;
pub mod database;
pub mod error;
pub mod runs;
pub mod server;
pub mod shift;
pub mod vcs;
