//! CLI command implementations

pub mod config;
pub mod context;
pub mod run;
pub mod secret;
pub mod stack;
