//! Scripting subsystem façade
//!
//! Owns the engine manager, the EVAL cache, the function library, the
//! running-script slot and the lazy-free worker, and wires the built-in
//! Lua engine in at startup. Command handlers in `dispatcher` operate
//! on an `Arc<ScriptingSubsystem>`.

use std::sync::Arc;

use super::engine::{ModuleHandle, ScriptingEngineImpl};
use super::eval_cache::EvalCache;
use super::functions::FunctionLibrary;
use super::manager::EngineManager;
use super::run_ctx::RunningRegistry;
use super::ENGINE_ABI_VERSION;
use crate::config::ScriptingConfig;
use crate::engines::lua::{debug as ldb, LuaEngine, LUA_ENGINE_NAME};
use crate::error::EngineError;
use crate::lazyfree::LazyFreeWorker;
use crate::storage::StorageEngine;

/// The scripting core of the server
pub struct ScriptingSubsystem {
    pub engines: EngineManager,
    pub eval_cache: EvalCache,
    pub functions: FunctionLibrary,
    pub running: RunningRegistry,
    pub lazyfree: LazyFreeWorker,
    pub storage: Arc<StorageEngine>,
    pub config: ScriptingConfig,
}

impl ScriptingSubsystem {
    /// Initialize the subsystem and register the built-in Lua engine
    pub fn new(config: ScriptingConfig, storage: Arc<StorageEngine>) -> Arc<Self> {
        let engines = EngineManager::new();
        engines
            .register(
                LUA_ENGINE_NAME,
                None,
                ENGINE_ABI_VERSION,
                Box::new(LuaEngine::new()),
            )
            .expect("built-in Lua engine registration cannot collide");

        Arc::new(ScriptingSubsystem {
            engines,
            eval_cache: EvalCache::new(),
            functions: FunctionLibrary::new(),
            running: RunningRegistry::new(),
            lazyfree: LazyFreeWorker::new(),
            storage,
            config,
        })
    }

    /// Register an additional engine (module-provided back-ends)
    pub fn register_engine(
        &self,
        name: &str,
        module: Option<ModuleHandle>,
        version: u32,
        implementation: Box<dyn ScriptingEngineImpl>,
    ) -> Result<(), EngineError> {
        self.engines.register(name, module, version, implementation)
    }

    /// Unregister an engine.
    ///
    /// The engine's library functions are dropped first; the request is
    /// refused while any cached EVAL script still references the engine.
    pub fn unregister_engine(&self, name: &str) -> Result<(), EngineError> {
        if self.eval_cache.references_engine(name) {
            return Err(EngineError::InUse(name.to_string()));
        }
        self.functions.remove_engine_functions(name);
        self.engines.unregister(name).map(|_| ())
    }

    /// SCRIPT FLUSH [ASYNC|SYNC]
    pub fn flush_scripts(&self, async_flush: bool) {
        self.eval_cache
            .flush(&self.engines, &self.lazyfree, async_flush);
    }

    /// Shutdown path: kill forked debugger children and flush
    /// synchronously, resetting every engine.
    pub fn shutdown(&self) {
        ldb::kill_forked_sessions();
        self.flush_scripts(false);
    }

    /// Total memory used by engines' EVAL environments
    pub fn eval_memory(&self) -> usize {
        self.eval_cache.eval_memory(&self.engines)
    }

    /// Memory used by the EVAL cache bookkeeping
    pub fn eval_scripts_memory(&self) -> usize {
        self.eval_cache.scripts_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registers_lua() {
        let sub = ScriptingSubsystem::new(ScriptingConfig::default(), StorageEngine::new());
        assert_eq!(sub.engines.count(), 1);
        assert!(sub.engines.find("LUA").is_some());
    }

    #[test]
    fn test_unregister_refused_while_cache_references() {
        let sub = ScriptingSubsystem::new(ScriptingConfig::default(), StorageEngine::new());
        sub.eval_cache
            .register(&sub.engines, "return 1", false)
            .unwrap();

        assert!(matches!(
            sub.unregister_engine("lua"),
            Err(EngineError::InUse(_))
        ));

        sub.flush_scripts(false);
        sub.unregister_engine("lua").unwrap();
        assert_eq!(sub.engines.count(), 0);
    }

    #[test]
    fn test_sync_flush_empties_cache() {
        let sub = ScriptingSubsystem::new(ScriptingConfig::default(), StorageEngine::new());
        sub.eval_cache
            .register(&sub.engines, "return 1", false)
            .unwrap();
        sub.flush_scripts(false);
        assert!(sub.eval_cache.is_empty());
        assert_eq!(sub.eval_scripts_memory(), 0);
    }
}
