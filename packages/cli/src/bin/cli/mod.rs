// ABOUTME: Subcommand modules of the corral binary
// ABOUTME: Environment management, sync exec, health and shared table rendering

pub mod env;
pub mod exec;
pub mod health;
pub mod output;
