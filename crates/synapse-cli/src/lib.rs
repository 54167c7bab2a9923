//! Synapse command-line tool library.
//!
//! Configuration, logging setup, shared state, and the subcommand handlers
//! that drive the file store and search index. Kept apart from main.rs so the
//! handlers can be exercised in integration tests.

pub mod commands;
pub mod config;
pub mod logging;
pub mod state;
