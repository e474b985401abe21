pub mod commands;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod filelock;
pub mod migrate;
pub mod output;
pub mod store;
pub mod worktree;
