//! Job orchestration.
//!
//! Leaf-first:
//! - `checkpoint_store`: atomic per-session checkpoint records.
//! - `broadcaster`: non-blocking event fan-out with per-subscriber backlog.
//! - `scheduler`: priority-then-FIFO admission queue.
//! - `supervisor`: engine process spawn, terminate, and wait.
//! - `monitor`: per-process task reading status output and watching exit.
//! - `coordinator`: single-writer owner of sessions and admission.

pub mod broadcaster;
pub mod checkpoint_store;
pub mod coordinator;
pub mod monitor;
pub mod scheduler;
pub mod supervisor;
