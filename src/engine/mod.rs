//! External engine (hashcat) integration.
//!
//! Everything that knows the engine's command line, its machine-readable
//! status records, or its potfile format lives here:
//! - `codec`: bounded line framing for the engine's stdout/stderr.
//! - `status`: status-record parser producing tagged [`status::StatusLine`]s.
//! - `command`: job-to-argv translation and job validation.
//! - `potfile`: recovered-result parsing and incremental tailing.

pub mod codec;
pub mod command;
pub mod potfile;
pub mod status;
