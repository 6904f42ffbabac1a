// ABOUTME: Library root for shipyard - exposes the orchestration engine for the binary and tests.
// ABOUTME: The main binary is in main.rs.

pub mod config;
pub mod controller;
pub mod deploy;
pub mod diagnostics;
pub mod error;
pub mod output;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod ssh;
pub mod state;
pub mod types;
