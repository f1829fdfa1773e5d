//! Engine manager
//!
//! Process-wide registry of scripting engines. Engine names are
//! case-insensitive and unique; the manager accounts the aggregate
//! memory overhead reported by the registered back-ends.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use super::engine::{ModuleHandle, ScriptingEngine, ScriptingEngineImpl};
use super::{ScriptSubsystem, ENGINE_ABI_VERSION};
use crate::error::EngineError;

/// Registry of scripting engines
pub struct EngineManager {
    engines: RwLock<HashMap<String, Arc<ScriptingEngine>>>,
    total_memory_overhead: AtomicUsize,
    registering: AtomicBool,
}

impl EngineManager {
    pub fn new() -> Self {
        EngineManager {
            engines: RwLock::new(HashMap::new()),
            total_memory_overhead: AtomicUsize::new(0),
            registering: AtomicBool::new(false),
        }
    }

    /// Register a new scripting engine.
    ///
    /// `version` is the engine ABI version the back-end was built
    /// against; mismatches are rejected. Fails on case-insensitive name
    /// collisions.
    pub fn register(
        &self,
        name: &str,
        module: Option<ModuleHandle>,
        version: u32,
        implementation: Box<dyn ScriptingEngineImpl>,
    ) -> Result<(), EngineError> {
        if version != ENGINE_ABI_VERSION {
            return Err(EngineError::VersionMismatch {
                engine: name.to_string(),
                version,
            });
        }

        // Registration must not be re-entered from an engine callback.
        if self.registering.swap(true, Ordering::SeqCst) {
            panic!("scripting engine registration re-entered");
        }

        let result = self.register_inner(name, module, implementation);
        self.registering.store(false, Ordering::SeqCst);
        result
    }

    fn register_inner(
        &self,
        name: &str,
        module: Option<ModuleHandle>,
        implementation: Box<dyn ScriptingEngineImpl>,
    ) -> Result<(), EngineError> {
        let key = name.to_lowercase();
        let mut engines = self.engines.write().unwrap();
        if engines.contains_key(&key) {
            eprintln!("Scripting engine '{}' is already registered in the server", name);
            return Err(EngineError::AlreadyRegistered(name.to_string()));
        }

        let engine = Arc::new(ScriptingEngine::new(
            name.to_string(),
            module,
            implementation,
        ));

        let mem_info = engine.call_get_memory_info(ScriptSubsystem::All);
        self.total_memory_overhead.fetch_add(
            mem::size_of::<ScriptingEngine>() + name.len() + mem_info.engine_memory_overhead,
            Ordering::Relaxed,
        );

        engines.insert(key, engine);
        Ok(())
    }

    /// Remove an engine from the registry, returning its descriptor.
    ///
    /// The caller (the subsystem facade) is responsible for dropping
    /// the engine's library functions first and for verifying no cached
    /// script still references it.
    pub fn unregister(&self, name: &str) -> Result<Arc<ScriptingEngine>, EngineError> {
        let key = name.to_lowercase();
        let mut engines = self.engines.write().unwrap();
        let engine = match engines.get(&key) {
            Some(engine) => Arc::clone(engine),
            None => {
                eprintln!("There's no engine registered with name {}", name);
                return Err(EngineError::NotFound(name.to_string()));
            }
        };

        if engine.in_call() {
            // An engine cannot vanish out from under one of its own calls.
            return Err(EngineError::InUse(name.to_string()));
        }

        let mem_info = engine.call_get_memory_info(ScriptSubsystem::All);
        let overhead =
            mem::size_of::<ScriptingEngine>() + engine.name().len() + mem_info.engine_memory_overhead;
        let total = &self.total_memory_overhead;
        let _ = total.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            Some(current.saturating_sub(overhead))
        });

        engines.remove(&key);
        Ok(engine)
    }

    /// Case-insensitive engine lookup
    pub fn find(&self, name: &str) -> Option<Arc<ScriptingEngine>> {
        let engines = self.engines.read().unwrap();
        engines.get(&name.to_lowercase()).cloned()
    }

    /// Invoke `callback` for every registered engine. Iteration order is
    /// unspecified but stable within one call.
    pub fn for_each<F: FnMut(&Arc<ScriptingEngine>)>(&self, mut callback: F) {
        let engines = self.engines.read().unwrap();
        for engine in engines.values() {
            callback(engine);
        }
    }

    /// Sum of the memory overhead reported by all registered engines
    pub fn total_memory_overhead(&self) -> usize {
        self.total_memory_overhead.load(Ordering::Relaxed)
    }

    /// Number of registered engines
    pub fn count(&self) -> usize {
        self.engines.read().unwrap().len()
    }

    /// Memory used by the manager's own bookkeeping
    pub fn manager_bytes(&self) -> usize {
        let engines = self.engines.read().unwrap();
        mem::size_of::<Self>()
            + engines.capacity()
                * (mem::size_of::<String>() + mem::size_of::<Arc<ScriptingEngine>>())
    }
}
