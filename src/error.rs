//! Error types for Hematite
//!
//! This module defines all error types used by the scripting core.
//! We follow Redis's error conventions where applicable: errors that
//! reach a client are rendered as RESP error strings by the Display
//! implementations below.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Main error type for Hematite operations
#[derive(Debug)]
pub enum HematiteError {
    /// Protocol-related errors (RESP parsing, serialization)
    Protocol(String),

    /// Command execution errors
    Command(CommandError),

    /// Storage engine errors
    Storage(StorageError),

    /// Network/IO errors
    Io(String),

    /// Configuration errors
    Config(String),

    /// Client connection errors
    Connection(String),

    /// Script execution errors
    Script(ScriptError),

    /// Scripting engine registry errors
    Engine(EngineError),

    /// Internal errors. These are bugs and are never reported to clients.
    Internal(String),
}

/// Command-specific errors that map to Redis error responses
#[derive(Debug, Clone)]
pub enum CommandError {
    /// Unknown command
    UnknownCommand(String),

    /// Wrong number of arguments for command
    WrongNumberOfArgs(String),

    /// Syntax error in command
    SyntaxError(String),

    /// Value is not an integer or out of range
    NotInteger,

    /// Write command issued against a read only context
    ReadOnly,

    /// Generic command error with message
    Generic(String),
}

/// Storage-related errors
#[derive(Debug, Clone)]
pub enum StorageError {
    /// Key not found
    KeyNotFound,

    /// Wrong data type for operation
    WrongType,

    /// Database index out of range
    InvalidDatabase,
}

/// Script execution errors
#[derive(Debug, Clone)]
pub enum ScriptError {
    /// Script not found in cache
    NotFound,

    /// Script compilation error, message already formatted for the client
    CompilationError(String),

    /// Script execution error
    ExecutionError(String),

    /// Script killed via SCRIPT KILL (or FUNCTION KILL when `function` is set)
    Killed { function: bool },

    /// SCRIPT KILL / FUNCTION KILL with no script running
    NotBusy,

    /// The running script already performed writes and cannot be killed
    Unkillable,

    /// FUNCTION LOAD exceeded its time budget
    LoadTimeout,
}

/// Engine registry errors
#[derive(Debug, Clone)]
pub enum EngineError {
    /// An engine with the same (case-insensitive) name is already registered
    AlreadyRegistered(String),

    /// No engine registered under this name
    NotFound(String),

    /// The engine was built against an incompatible ABI version
    VersionMismatch { engine: String, version: u32 },

    /// The engine still owns compiled scripts and cannot be unregistered
    InUse(String),
}

/// Type alias for Results throughout Hematite
pub type Result<T> = std::result::Result<T, HematiteError>;

impl fmt::Display for HematiteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HematiteError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            HematiteError::Command(err) => write!(f, "{}", err),
            HematiteError::Storage(err) => write!(f, "{}", err),
            HematiteError::Io(msg) => write!(f, "I/O error: {}", msg),
            HematiteError::Config(msg) => write!(f, "Configuration error: {}", msg),
            HematiteError::Connection(msg) => write!(f, "Connection error: {}", msg),
            HematiteError::Script(err) => write!(f, "{}", err),
            HematiteError::Engine(err) => write!(f, "{}", err),
            HematiteError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::UnknownCommand(cmd) => {
                write!(f, "ERR unknown command '{}'", cmd)
            }
            CommandError::WrongNumberOfArgs(cmd) => {
                write!(f, "ERR wrong number of arguments for '{}' command", cmd)
            }
            CommandError::SyntaxError(msg) => write!(f, "ERR syntax error: {}", msg),
            CommandError::NotInteger => {
                write!(f, "ERR value is not an integer or out of range")
            }
            CommandError::ReadOnly => {
                write!(f, "READONLY You can't write against a read only replica.")
            }
            CommandError::Generic(msg) => {
                write!(f, "ERR {}", msg)
            }
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::KeyNotFound => write!(f, "ERR no such key"),
            StorageError::WrongType => {
                write!(f, "WRONGTYPE Operation against a key holding the wrong kind of value")
            }
            StorageError::InvalidDatabase => write!(f, "ERR invalid DB index"),
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::NotFound => write!(f, "NOSCRIPT No matching script. Please use EVAL."),
            ScriptError::CompilationError(msg) => write!(f, "{}", msg),
            ScriptError::ExecutionError(msg) => write!(f, "{}", msg),
            ScriptError::Killed { function: false } => {
                write!(f, "ERR Script killed by user with SCRIPT KILL...")
            }
            ScriptError::Killed { function: true } => {
                write!(f, "ERR Script killed by user with FUNCTION KILL...")
            }
            ScriptError::NotBusy => write!(f, "NOTBUSY No scripts in execution right now."),
            ScriptError::Unkillable => {
                write!(
                    f,
                    "UNKILLABLE Sorry the script already executed write commands against the dataset."
                )
            }
            ScriptError::LoadTimeout => write!(f, "ERR FUNCTION LOAD timeout"),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::AlreadyRegistered(name) => {
                write!(f, "ERR Scripting engine '{}' is already registered in the server", name)
            }
            EngineError::NotFound(name) => {
                write!(f, "ERR Could not find scripting engine '{}'", name)
            }
            EngineError::VersionMismatch { engine, version } => {
                write!(f, "ERR Scripting engine '{}' uses unsupported ABI version {}", engine, version)
            }
            EngineError::InUse(name) => {
                write!(f, "ERR Scripting engine '{}' still owns compiled scripts", name)
            }
        }
    }
}

impl StdError for HematiteError {}
impl StdError for CommandError {}
impl StdError for StorageError {}
impl StdError for ScriptError {}
impl StdError for EngineError {}

// Conversion implementations
impl From<io::Error> for HematiteError {
    fn from(err: io::Error) -> Self {
        HematiteError::Io(err.to_string())
    }
}

impl From<CommandError> for HematiteError {
    fn from(err: CommandError) -> Self {
        HematiteError::Command(err)
    }
}

impl From<StorageError> for HematiteError {
    fn from(err: StorageError) -> Self {
        HematiteError::Storage(err)
    }
}

impl From<ScriptError> for HematiteError {
    fn from(err: ScriptError) -> Self {
        HematiteError::Script(err)
    }
}

impl From<EngineError> for HematiteError {
    fn from(err: EngineError) -> Self {
        HematiteError::Engine(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CommandError::UnknownCommand("FOOBAR".to_string());
        assert_eq!(err.to_string(), "ERR unknown command 'FOOBAR'");

        let err = ScriptError::NotFound;
        assert_eq!(err.to_string(), "NOSCRIPT No matching script. Please use EVAL.");

        let err = ScriptError::Killed { function: false };
        assert!(err.to_string().contains("SCRIPT KILL"));
        let err = ScriptError::Killed { function: true };
        assert!(err.to_string().contains("FUNCTION KILL"));
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::AlreadyRegistered("LUA".to_string());
        assert!(err.to_string().contains("already registered"));

        let err = EngineError::NotFound("wasm".to_string());
        assert_eq!(err.to_string(), "ERR Could not find scripting engine 'wasm'");
    }
}
