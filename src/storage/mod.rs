//! Minimal storage collaborator
//!
//! The real key/value store lives outside the scripting core. This
//! trimmed engine provides the surface scripts reach through
//! `server.call` and the debugger's command prompt: a per-database
//! string store and a small command router.

pub mod commands;
pub mod engine;

pub use engine::{DatabaseIndex, StorageEngine};
