pub mod behavior;
pub mod cli;
pub mod config;
pub mod core;
pub mod engine;
pub mod exit;
pub mod http;
pub mod load;
pub mod probes;
pub mod registry;
pub mod report;
pub mod rules;
pub mod session;
pub mod ui;
