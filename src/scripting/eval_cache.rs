//! EVAL script cache
//!
//! Content-addressable store of compiled ad-hoc scripts, keyed by the
//! SHA-1 hex digest of the body. Scripts admitted through EVAL live on
//! an LRU list bounded to 500 entries; scripts admitted through SCRIPT
//! LOAD are never evicted. Teardown is synchronous or deferred to the
//! lazy-free worker.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sha1::{Digest, Sha1};

use super::engine::{CompiledFunction, ScriptingEngine};
use super::lru::{LruHandle, LruList};
use super::manager::EngineManager;
use super::shebang::parse_shebang;
use super::{ScriptFlags, ScriptSubsystem};
use crate::lazyfree::LazyFreeWorker;

/// Upper bound of the LRU residency list
pub const LRU_LIST_LENGTH: usize = 500;

/// SHA-1 of `data` rendered as 40 lowercase hex characters
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// One cached EVAL script
struct EvalScript {
    /// Compiled form, owned by `engine`
    script: Arc<CompiledFunction>,

    /// Engine that produced the compiled form
    engine: Arc<ScriptingEngine>,

    /// Original script body, shebang included
    body: String,

    /// Flags parsed from the shebang
    flags: ScriptFlags,

    /// Back-reference into the LRU list; None for SCRIPT LOAD entries
    lru_node: Option<LruHandle>,
}

#[derive(Default)]
struct CacheInner {
    scripts: HashMap<String, EvalScript>,
    lru: LruList,
    scripts_mem: usize,
}

/// Everything the dispatcher needs to run a cached script
pub struct CachedScript {
    pub engine: Arc<ScriptingEngine>,
    pub script: Arc<CompiledFunction>,
    pub flags: ScriptFlags,
}

/// The EVAL script cache
pub struct EvalCache {
    inner: Mutex<CacheInner>,
    evicted_scripts: AtomicU64,
}

impl EvalCache {
    pub fn new() -> Self {
        EvalCache {
            inner: Mutex::new(CacheInner::default()),
            evicted_scripts: AtomicU64::new(0),
        }
    }

    /// Register a new script, compiling it through its engine.
    ///
    /// `script_load` marks SCRIPT LOAD admissions, which bypass the LRU
    /// list; an existing LRU-tracked entry is promoted instead of
    /// recompiled. Returns the digest, or the client-ready error string.
    pub fn register(
        &self,
        manager: &EngineManager,
        body: &str,
        script_load: bool,
    ) -> Result<String, String> {
        let sha = sha1_hex(body.as_bytes());

        let mut inner = self.inner.lock().unwrap();

        if let Some(entry) = inner.scripts.get_mut(&sha) {
            if script_load {
                // Promote an EVAL-admitted script: detach it from the
                // LRU list so it can no longer be evicted.
                if let Some(handle) = entry.lru_node.take() {
                    inner.lru.remove(handle);
                }
            }
            return Ok(sha);
        }

        let info = parse_shebang(body)?;
        let engine = manager
            .find(&info.engine)
            .ok_or_else(|| format!("Could not find scripting engine '{}'", info.engine))?;

        let mut functions = engine.call_compile_code(
            ScriptSubsystem::Eval,
            &body[info.body_offset..],
            std::time::Duration::ZERO,
        )?;
        assert_eq!(functions.len(), 1, "EVAL compile must yield one function");
        let script = Arc::new(functions.pop().unwrap());

        let lru_node = if script_load {
            None
        } else {
            Some(self.lru_admit(&mut inner, &sha))
        };

        inner.scripts_mem += sha.len() + body.len();
        inner.scripts.insert(
            sha.clone(),
            EvalScript {
                script,
                engine,
                body: body.to_string(),
                flags: info.flags,
                lru_node,
            },
        );

        Ok(sha)
    }

    /// Make room on the LRU list and append `sha` at the tail.
    fn lru_admit(&self, inner: &mut CacheInner, sha: &str) -> LruHandle {
        while inner.lru.len() >= LRU_LIST_LENGTH {
            let oldest = inner
                .lru
                .head_value()
                .expect("non-empty LRU list has a head")
                .to_string();
            let handle = inner.lru.head_handle().unwrap();
            inner.lru.remove(handle);
            Self::delete_entry(inner, &oldest);
            self.evicted_scripts.fetch_add(1, Ordering::Relaxed);
        }
        inner.lru.push_tail(sha.to_string())
    }

    /// Remove one entry from the map, releasing its compiled function
    /// through the owning engine. The LRU node must already be gone.
    fn delete_entry(inner: &mut CacheInner, sha: &str) {
        let entry = inner
            .scripts
            .remove(sha)
            .expect("LRU digest indexes a cache entry");
        inner.scripts_mem -= sha.len() + entry.body.len();
        if let Ok(function) = Arc::try_unwrap(entry.script) {
            entry
                .engine
                .call_free_function(ScriptSubsystem::Eval, function);
        }
    }

    /// Fetch a script for execution. Does not touch the LRU order.
    pub fn get_for_run(&self, sha: &str) -> Option<CachedScript> {
        let inner = self.inner.lock().unwrap();
        inner.scripts.get(sha).map(|entry| CachedScript {
            engine: Arc::clone(&entry.engine),
            script: Arc::clone(&entry.script),
            flags: entry.flags,
        })
    }

    /// Move the entry's LRU node to the tail after a successful run.
    pub fn touch(&self, sha: &str) {
        let mut inner = self.inner.lock().unwrap();
        let handle = match inner.scripts.get_mut(sha) {
            Some(entry) => entry.lru_node.take(),
            None => return,
        };
        if let Some(handle) = handle {
            let moved = inner.lru.move_to_tail(handle);
            if let Some(entry) = inner.scripts.get_mut(sha) {
                entry.lru_node = moved;
            }
        }
    }

    /// Flags stored for a cached script
    pub fn flags_of(&self, sha: &str) -> Option<ScriptFlags> {
        let inner = self.inner.lock().unwrap();
        inner.scripts.get(sha).map(|entry| entry.flags)
    }

    pub fn exists(&self, sha: &str) -> bool {
        self.inner.lock().unwrap().scripts.contains_key(sha)
    }

    /// Stored body for SCRIPT SHOW
    pub fn show(&self, sha: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.scripts.get(sha).map(|entry| entry.body.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the entry is tracked by the LRU list (EVAL admission)
    pub fn is_lru_tracked(&self, sha: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .scripts
            .get(sha)
            .map(|entry| entry.lru_node.is_some())
            .unwrap_or(false)
    }

    /// Number of scripts evicted from the LRU list so far
    pub fn evicted_scripts(&self) -> u64 {
        self.evicted_scripts.load(Ordering::Relaxed)
    }

    /// True when any cached script belongs to `engine_name`
    pub fn references_engine(&self, engine_name: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .scripts
            .values()
            .any(|entry| entry.engine.name().eq_ignore_ascii_case(engine_name))
    }

    /// Discard the whole cache and reset every engine's EVAL environment.
    ///
    /// With `async_flush`, the old cache, the LRU list and the engines'
    /// deferred reset closures become one lazy-free job; the main thread
    /// forgets them the moment they are handed over.
    pub fn flush(&self, manager: &EngineManager, lazyfree: &LazyFreeWorker, async_flush: bool) {
        let old = {
            let mut inner = self.inner.lock().unwrap();
            mem::take(&mut *inner)
        };

        if async_flush {
            let mut resets = Vec::new();
            manager.for_each(|engine| {
                if let Some(reset) = engine.call_reset_eval_env(true) {
                    resets.push(reset);
                }
            });

            let effort = old.scripts.len();
            let scripts = old.scripts;
            let lru = old.lru;
            lazyfree.free_async(
                effort,
                Box::new(move || {
                    drop(scripts);
                    drop(lru);
                    for reset in resets {
                        reset.run();
                    }
                }),
            );
        } else {
            for (_sha, entry) in old.scripts {
                if let Ok(function) = Arc::try_unwrap(entry.script) {
                    entry
                        .engine
                        .call_free_function(ScriptSubsystem::Eval, function);
                }
            }
            drop(old.lru);
            manager.for_each(|engine| {
                let reset = engine.call_reset_eval_env(false);
                debug_assert!(reset.is_none());
            });
        }
    }

    /// Total memory used by engines' EVAL environments
    pub fn eval_memory(&self, manager: &EngineManager) -> usize {
        let mut memory = 0;
        manager.for_each(|engine| {
            memory += engine.call_get_memory_info(ScriptSubsystem::Eval).used_memory;
        });
        memory
    }

    /// Memory used by the cache's own bookkeeping
    pub fn scripts_memory(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.scripts_mem
            + inner.scripts.capacity() * mem::size_of::<EvalScript>()
            + inner.lru.len() * mem::size_of::<Option<LruHandle>>()
    }

    /// Verify the cache ↔ LRU cross-references. Panics on violation;
    /// used by tests.
    pub fn check_invariants(&self) {
        let inner = self.inner.lock().unwrap();
        assert!(inner.lru.len() <= LRU_LIST_LENGTH);
        for sha in inner.lru.iter() {
            let entry = inner
                .scripts
                .get(sha)
                .expect("every LRU digest indexes a cache entry");
            let handle = entry.lru_node.expect("LRU-listed entry has a back-reference");
            assert_eq!(inner.lru.value(handle), Some(sha));
        }
        for (sha, entry) in &inner.scripts {
            assert_eq!(*sha, sha1_hex(entry.body.as_bytes()));
            if let Some(handle) = entry.lru_node {
                assert_eq!(inner.lru.value(handle), Some(sha.as_str()));
            }
        }
    }
}
