#![forbid(unsafe_code)]

//! `crackq` — supervised, resumable hashcat job orchestration.

pub mod config;
pub mod engine;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod persistence;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
