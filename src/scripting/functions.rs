//! Named function catalog
//!
//! The minimal library slice behind FUNCTION LOAD and FCALL: named
//! functions compiled through an engine's FUNCTION subsystem and looked
//! up at call time. Persistence and ACL handling belong to the host
//! server's full library catalog.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::engine::{CompiledFunction, ScriptingEngine};
use super::manager::EngineManager;
use super::shebang::parse_shebang;
use super::{ScriptFlags, ScriptSubsystem};

/// One loaded library function
pub struct LoadedFunction {
    pub name: String,
    pub desc: Option<String>,
    pub engine: Arc<ScriptingEngine>,
    pub function: Arc<CompiledFunction>,
    pub flags: ScriptFlags,
}

/// Catalog of loaded functions, keyed by function name
pub struct FunctionLibrary {
    inner: Mutex<HashMap<String, LoadedFunction>>,
}

/// Everything the dispatcher needs to invoke a loaded function
pub struct CallableFunction {
    pub engine: Arc<ScriptingEngine>,
    pub function: Arc<CompiledFunction>,
    pub flags: ScriptFlags,
}

impl FunctionLibrary {
    pub fn new() -> Self {
        FunctionLibrary {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Load a library body: compile it through the FUNCTION subsystem
    /// and register every function it declares.
    ///
    /// The whole load is rejected when it registers nothing, when any
    /// function is unnamed, or (without `replace`) when a name
    /// collides. Returns the registered names, or the client-ready
    /// error string.
    pub fn load(
        &self,
        manager: &EngineManager,
        body: &str,
        replace: bool,
        timeout: Duration,
    ) -> Result<Vec<String>, String> {
        if !body.starts_with("#!") {
            return Err("Missing library shebang".to_string());
        }
        let info = parse_shebang(body)?;
        let engine = manager
            .find(&info.engine)
            .ok_or_else(|| format!("Could not find scripting engine '{}'", info.engine))?;

        let functions = engine.call_compile_code(
            ScriptSubsystem::Function,
            &body[info.body_offset..],
            timeout,
        )?;

        if functions.is_empty() {
            return Err("No functions registered".to_string());
        }

        let mut inner = self.inner.lock().unwrap();

        let mut names = Vec::with_capacity(functions.len());
        let mut rejected = None;
        for function in &functions {
            let name = match &function.name {
                Some(name) => name.clone(),
                None => {
                    rejected = Some("Function name is missing".to_string());
                    break;
                }
            };
            if !replace && inner.contains_key(&name) {
                rejected = Some(format!("Function '{}' already exists", name));
                break;
            }
            names.push(name);
        }
        if let Some(err) = rejected {
            // Nothing registers on a failed load.
            for function in functions {
                engine.call_free_function(ScriptSubsystem::Function, function);
            }
            return Err(err);
        }

        for (name, function) in names.iter().zip(functions) {
            if let Some(old) = inner.remove(name) {
                Self::release(old);
            }
            let flags = function.flags.union(info.flags);
            inner.insert(
                name.clone(),
                LoadedFunction {
                    name: name.clone(),
                    desc: function.desc.clone(),
                    engine: Arc::clone(&engine),
                    function: Arc::new(function),
                    flags,
                },
            );
        }

        Ok(names)
    }

    fn release(loaded: LoadedFunction) {
        if let Ok(function) = Arc::try_unwrap(loaded.function) {
            loaded
                .engine
                .call_free_function(ScriptSubsystem::Function, function);
        }
    }

    /// Look up a function for FCALL
    pub fn get(&self, name: &str) -> Option<CallableFunction> {
        let inner = self.inner.lock().unwrap();
        inner.get(name).map(|loaded| CallableFunction {
            engine: Arc::clone(&loaded.engine),
            function: Arc::clone(&loaded.function),
            flags: loaded.flags,
        })
    }

    /// Delete one function
    pub fn delete(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.remove(name) {
            Some(loaded) => {
                Self::release(loaded);
                true
            }
            None => false,
        }
    }

    /// Drop every function belonging to `engine_name`. Called before an
    /// engine is unregistered.
    pub fn remove_engine_functions(&self, engine_name: &str) {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<String> = inner
            .values()
            .filter(|loaded| loaded.engine.name().eq_ignore_ascii_case(engine_name))
            .map(|loaded| loaded.name.clone())
            .collect();
        for name in doomed {
            if let Some(loaded) = inner.remove(&name) {
                Self::release(loaded);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::hello::HelloEngine;
    use crate::scripting::ENGINE_ABI_VERSION;

    fn manager_with_hello() -> EngineManager {
        let manager = EngineManager::new();
        manager
            .register("hello", None, ENGINE_ABI_VERSION, Box::new(HelloEngine::new()))
            .unwrap();
        manager
    }

    const TIMEOUT: Duration = Duration::from_millis(500);

    #[test]
    fn test_load_registers_functions() {
        let manager = manager_with_hello();
        let library = FunctionLibrary::new();
        let names = library
            .load(
                &manager,
                "#!hello\nFUNCTION foo CONSTI 1 RETURN FUNCTION bar CONSTI 2 RETURN",
                false,
                TIMEOUT,
            )
            .unwrap();
        assert_eq!(names, vec!["foo", "bar"]);
        assert!(library.get("foo").is_some());
        assert!(library.get("bar").is_some());
        assert_eq!(library.len(), 2);
    }

    #[test]
    fn test_load_requires_shebang() {
        let manager = manager_with_hello();
        let library = FunctionLibrary::new();
        let err = library
            .load(&manager, "FUNCTION foo RETURN", false, TIMEOUT)
            .unwrap_err();
        assert_eq!(err, "Missing library shebang");
    }

    #[test]
    fn test_name_collision_without_replace() {
        let manager = manager_with_hello();
        let library = FunctionLibrary::new();
        library
            .load(&manager, "#!hello\nFUNCTION foo CONSTI 1 RETURN", false, TIMEOUT)
            .unwrap();
        let err = library
            .load(&manager, "#!hello\nFUNCTION foo CONSTI 2 RETURN", false, TIMEOUT)
            .unwrap_err();
        assert!(err.contains("already exists"));

        library
            .load(&manager, "#!hello\nFUNCTION foo CONSTI 2 RETURN", true, TIMEOUT)
            .unwrap();
        assert_eq!(library.len(), 1);
    }

    #[test]
    fn test_delete() {
        let manager = manager_with_hello();
        let library = FunctionLibrary::new();
        library
            .load(&manager, "#!hello\nFUNCTION foo CONSTI 1 RETURN", false, TIMEOUT)
            .unwrap();
        assert!(library.delete("foo"));
        assert!(!library.delete("foo"));
        assert!(library.is_empty());
    }

    #[test]
    fn test_remove_engine_functions() {
        let manager = manager_with_hello();
        let library = FunctionLibrary::new();
        library
            .load(
                &manager,
                "#!hello\nFUNCTION foo CONSTI 1 RETURN FUNCTION bar CONSTI 2 RETURN",
                false,
                TIMEOUT,
            )
            .unwrap();
        library.remove_engine_functions("HELLO");
        assert!(library.is_empty());
    }
}
