//! Hematite scripting core
//!
//! The scripting subsystem of a Redis-compatible in-memory database
//! server: a pluggable scripting-engine registry, the SHA-addressed
//! EVAL script cache with LRU eviction, the execution dispatcher, a
//! fork-based interactive script debugger, and two reference engine
//! back-ends (the Lua interpreter and the minimal HELLO stack VM).

pub mod config;
pub mod engines;
pub mod error;
pub mod lazyfree;
pub mod protocol;
pub mod scripting;
pub mod storage;

// Re-export commonly used types
pub use config::ScriptingConfig;
pub use error::{HematiteError, Result, ScriptError};
pub use protocol::RespFrame;
pub use scripting::dispatcher::ClientContext;
pub use scripting::{EngineManager, ScriptingSubsystem};
pub use storage::StorageEngine;
