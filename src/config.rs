//! Configuration for the scripting core
//!
//! Provides the knobs the scripting subsystem consults at runtime.
//! The embedding server is expected to build one of these from its own
//! configuration system and hand it to `ScriptingSubsystem::new`.

/// Scripting subsystem configuration
#[derive(Debug, Clone)]
pub struct ScriptingConfig {
    /// Number of databases exposed to scripts
    pub databases: usize,

    /// Default SCRIPT FLUSH behavior when no SYNC|ASYNC argument is given
    pub lazyfree_lazy_user_flush: bool,

    /// Time budget for FUNCTION LOAD top-level execution, in milliseconds
    pub function_load_timeout_ms: u64,

    /// Send timeout installed on the debugger connection, in milliseconds
    pub debugger_send_timeout_ms: u64,

    /// This instance is a replica
    pub is_replica: bool,

    /// Replica refuses writes
    pub replica_read_only: bool,

    /// Cluster mode is enabled
    pub cluster_enabled: bool,
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        ScriptingConfig {
            databases: 16,
            lazyfree_lazy_user_flush: false,
            function_load_timeout_ms: 500,
            debugger_send_timeout_ms: 5000,
            is_replica: false,
            replica_read_only: true,
            cluster_enabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ScriptingConfig::default();
        assert_eq!(config.function_load_timeout_ms, 500);
        assert_eq!(config.debugger_send_timeout_ms, 5000);
        assert!(!config.lazyfree_lazy_user_flush);
    }
}
