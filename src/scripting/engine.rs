//! Scripting engine descriptor and back-end contract
//!
//! Every language back-end implements `ScriptingEngineImpl`. The
//! descriptor wraps each implementation call in a call scope that
//! installs the engine's invocation context before the call and tears
//! it down on every exit path; going through the descriptor is the only
//! sanctioned way to reach a back-end.

use std::any::Any;
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::run_ctx::ScriptRunCtx;
use super::{ScriptFlags, ScriptSubsystem};
use crate::protocol::resp::RespFrame;

/// Handle of the module that provides an engine. Built-in engines have none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHandle {
    pub name: String,
}

/// Dedicated caller identity used when commands are invoked by a script
#[derive(Debug, Clone)]
pub struct ScriptCaller {
    /// Identity shown in client listings
    pub name: String,

    /// Scripts never block on blocking commands
    pub deny_blocking: bool,
}

impl ScriptCaller {
    fn for_engine(engine_name: &str) -> Self {
        ScriptCaller {
            name: format!("script:{}", engine_name.to_lowercase()),
            deny_blocking: true,
        }
    }
}

/// Artifact produced by an engine's compile step.
///
/// The payload is owned by the producing engine and must only ever be
/// handed back to it.
pub struct CompiledFunction {
    /// Required for library functions, absent for EVAL scripts
    pub name: Option<String>,

    /// Optional human description
    pub desc: Option<String>,

    /// Engine-owned opaque payload
    pub payload: Box<dyn Any + Send + Sync>,

    /// Flags attached at registration time
    pub flags: ScriptFlags,
}

impl std::fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("name", &self.name)
            .field("desc", &self.desc)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Memory introspection result
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineMemoryInfo {
    /// Memory used by the requested subsystem's interpreter state
    pub used_memory: usize,

    /// Fixed overhead of the engine context itself
    pub engine_memory_overhead: usize,
}

/// Self-contained deferred reset job returned by `reset_eval_env(async)`.
///
/// Owns everything the discarded environment still references; run on
/// the lazy-free worker.
pub struct LazyEvalReset {
    closure: Box<dyn FnOnce() + Send>,
}

impl LazyEvalReset {
    pub fn new(closure: impl FnOnce() + Send + 'static) -> Self {
        LazyEvalReset {
            closure: Box::new(closure),
        }
    }

    pub fn run(self) {
        (self.closure)()
    }
}

/// Capability set every scripting back-end must provide
pub trait ScriptingEngineImpl: Send + Sync {
    /// Compile `code`. For Eval the result holds exactly one function;
    /// for Function, zero or more named functions may be produced and
    /// `timeout` bounds the load step. Errors are client-ready strings.
    fn compile(
        &self,
        subsystem: ScriptSubsystem,
        code: &str,
        timeout: Duration,
    ) -> Result<Vec<CompiledFunction>, String>;

    /// Release one compiled function
    fn free_function(&self, subsystem: ScriptSubsystem, function: CompiledFunction);

    /// Run a compiled function, materializing its reply.
    ///
    /// The engine must poll `run_ctx` state at safe points and return
    /// promptly when it observes the killed state; the dispatcher
    /// produces the kill error reply.
    fn call(
        &self,
        run_ctx: &ScriptRunCtx,
        function: &CompiledFunction,
        subsystem: ScriptSubsystem,
        keys: &[Vec<u8>],
        args: &[Vec<u8>],
    ) -> RespFrame;

    /// Bytes attributed to one compiled function
    fn function_memory_overhead(&self, function: &CompiledFunction) -> usize;

    /// Discard all EVAL-compiled state. With `async_reset`, return a
    /// deferred reset closure instead of resetting inline; either way a
    /// functional replacement environment is in place on return.
    fn reset_eval_env(&self, async_reset: bool) -> Option<LazyEvalReset>;

    /// Memory introspection for one subsystem (or All)
    fn memory_info(&self, subsystem: ScriptSubsystem) -> EngineMemoryInfo;
}

thread_local! {
    static CURRENT_ENGINE_CALLER: RefCell<Option<ScriptCaller>> = const { RefCell::new(None) };
}

/// Caller identity installed for the engine call running on this
/// thread, if any. Back-ends may consult this while servicing a call.
pub fn current_engine_caller() -> Option<ScriptCaller> {
    CURRENT_ENGINE_CALLER.with(|cell| cell.borrow().clone())
}

/// RAII scope installing the engine's invocation context
struct EngineCallScope<'a> {
    engine: &'a ScriptingEngine,
}

impl<'a> EngineCallScope<'a> {
    fn enter(engine: &'a ScriptingEngine) -> Self {
        CURRENT_ENGINE_CALLER.with(|cell| {
            *cell.borrow_mut() = Some(engine.caller.clone());
        });
        engine.in_call.fetch_add(1, Ordering::SeqCst);
        EngineCallScope { engine }
    }
}

impl Drop for EngineCallScope<'_> {
    fn drop(&mut self) {
        // Teardown is guaranteed on all exit paths, including panics.
        self.engine.in_call.fetch_sub(1, Ordering::SeqCst);
        CURRENT_ENGINE_CALLER.with(|cell| {
            *cell.borrow_mut() = None;
        });
    }
}

/// A registered scripting engine
pub struct ScriptingEngine {
    name: String,
    module: Option<ModuleHandle>,
    implementation: Box<dyn ScriptingEngineImpl>,
    caller: ScriptCaller,
    in_call: AtomicUsize,
}

impl ScriptingEngine {
    pub(super) fn new(
        name: String,
        module: Option<ModuleHandle>,
        implementation: Box<dyn ScriptingEngineImpl>,
    ) -> Self {
        let caller = ScriptCaller::for_engine(&name);
        ScriptingEngine {
            name,
            module,
            implementation,
            caller,
            in_call: AtomicUsize::new(0),
        }
    }

    /// Engine name as registered
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Providing module, if the engine is not built in
    pub fn module(&self) -> Option<&ModuleHandle> {
        self.module.as_ref()
    }

    /// The engine's dedicated script caller identity
    pub fn caller(&self) -> &ScriptCaller {
        &self.caller
    }

    /// True while a call scope for this engine is open
    pub fn in_call(&self) -> bool {
        self.in_call.load(Ordering::SeqCst) > 0
    }

    pub fn call_compile_code(
        &self,
        subsystem: ScriptSubsystem,
        code: &str,
        timeout: Duration,
    ) -> Result<Vec<CompiledFunction>, String> {
        assert!(subsystem != ScriptSubsystem::All);
        let _scope = EngineCallScope::enter(self);
        self.implementation.compile(subsystem, code, timeout)
    }

    pub fn call_free_function(&self, subsystem: ScriptSubsystem, function: CompiledFunction) {
        assert!(subsystem != ScriptSubsystem::All);
        let _scope = EngineCallScope::enter(self);
        self.implementation.free_function(subsystem, function)
    }

    pub fn call_function(
        &self,
        run_ctx: &ScriptRunCtx,
        function: &CompiledFunction,
        subsystem: ScriptSubsystem,
        keys: &[Vec<u8>],
        args: &[Vec<u8>],
    ) -> RespFrame {
        assert!(subsystem != ScriptSubsystem::All);
        let _scope = EngineCallScope::enter(self);
        self.implementation.call(run_ctx, function, subsystem, keys, args)
    }

    pub fn call_get_function_memory_overhead(&self, function: &CompiledFunction) -> usize {
        let _scope = EngineCallScope::enter(self);
        self.implementation.function_memory_overhead(function)
    }

    pub fn call_reset_eval_env(&self, async_reset: bool) -> Option<LazyEvalReset> {
        let _scope = EngineCallScope::enter(self);
        self.implementation.reset_eval_env(async_reset)
    }

    pub fn call_get_memory_info(&self, subsystem: ScriptSubsystem) -> EngineMemoryInfo {
        let _scope = EngineCallScope::enter(self);
        self.implementation.memory_info(subsystem)
    }
}
