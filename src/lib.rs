//! snail - task lists with optimistic sync
//!
//! This library holds everything behind the `snail` CLI: an in-memory task
//! store that changes before the backend confirms, and the pipeline that
//! confirms or rolls those changes back.
//!
//! # Core Concepts
//!
//! - **Optimistic mutations**: every intent snapshots, applies, calls the
//!   backend, then merges the confirmed record or restores the snapshot
//! - **Partitions**: a task is active, trashed or abandoned, never two
//! - **Fractional ordering**: manual order uses float keys so a move
//!   usually rewrites one record
//! - **Tag scopes**: tags are global or belong to one project
//!
//! # Module Organization
//!
//! - `model`: records and partial updates
//! - `store`: the in-memory task store
//! - `sync`: the mutation pipeline, reorder queue and tag intents
//! - `reorder`: pure ordering-key arithmetic
//! - `tag_cache`: per-scope tag lists with a version counter
//! - `activity`: task history derived from updates
//! - `storage`: the backend trait with SQLite and remote implementations
//! - `backup`: `.tar.gz` export and import
//! - `checkin`: daily check-ins and streaks
//! - `config`: `config.toml` loading
//! - `lock`: file locking and atomic writes for local files
//! - `cli` / `output`: the command tree and its output envelopes

pub mod activity;
pub mod backup;
pub mod checkin;
pub mod cli;
pub mod config;
pub mod error;
pub mod lock;
pub mod model;
pub mod output;
pub mod reorder;
pub mod storage;
pub mod store;
pub mod sync;
pub mod tag_cache;

pub use error::{Error, Result};
