//! Domain model module declarations.

pub mod checkpoint;
pub mod event;
pub mod job;
pub mod progress;
pub mod session;
