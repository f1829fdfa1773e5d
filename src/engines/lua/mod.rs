//! Lua scripting engine
//!
//! A real interpreter back-end wired through the engine contract. Two
//! interpreter instances are maintained: one for EVAL scripts and one
//! for named-function libraries, so resetting the EVAL environment
//! never disturbs loaded library functions.

pub mod api;
pub mod debug;

use std::any::Any;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use mlua::{
    DebugEvent, Function, HookTriggers, Lua, LuaOptions, RegistryKey, StdLib, Table, Value,
    VmState,
};

use crate::protocol::resp::RespFrame;
use crate::scripting::engine::{CompiledFunction, EngineMemoryInfo, LazyEvalReset};
use crate::scripting::run_ctx::ScriptRunCtx;
use crate::scripting::{ScriptFlags, ScriptSubsystem, ScriptingEngineImpl};

/// Engine name used at registration
pub const LUA_ENGINE_NAME: &str = "lua";

const ERROR_HANDLER_KEY: &str = "__error_handler";
const PCALL_WRAPPER_KEY: &str = "__pcall_wrapper";

/// Protected-call error handler. Captures the source file and line of
/// any failure inside the script; loaded while the debug library is
/// still reachable, before the globals are sandboxed.
const ERROR_HANDLER_SRC: &str = "\
local dbg = debug
local error_handler = function (err)
  local i = dbg.getinfo(2, 'nSl')
  if i and i.what == 'C' then
    i = dbg.getinfo(3, 'nSl')
  end
  if type(err) ~= 'table' then
    err = {err='ERR ' .. tostring(err)}
  end
  if i then
    err['source'] = i.source
    err['line'] = i.currentline
  end
  return err
end
return error_handler";

const PCALL_WRAPPER_SRC: &str = "\
return function(handler, f, ...)
  return xpcall(f, handler, ...)
end";

/// Payload of a compiled Lua function: a reference into the registry of
/// the state that compiled it.
struct LuaPayload {
    key: RegistryKey,
    state_id: u64,
}

struct LuaStateHolder {
    lua: Lua,
    state_id: u64,
}

/// The Lua engine context
pub struct LuaEngine {
    eval: Mutex<LuaStateHolder>,
    function_lua: Mutex<LuaStateHolder>,
    next_state_id: AtomicU64,
}

impl LuaEngine {
    pub fn new() -> Self {
        LuaEngine {
            eval: Mutex::new(LuaStateHolder {
                lua: Self::init_state(false),
                state_id: 0,
            }),
            function_lua: Mutex::new(LuaStateHolder {
                lua: Self::init_state(true),
                state_id: 1,
            }),
            next_state_id: AtomicU64::new(2),
        }
    }

    /// Build and initialize one interpreter state.
    fn init_state(function_subsystem: bool) -> Lua {
        // The debug library backs the error handler and the script
        // debugger; scripts never see it because the globals are
        // sandboxed below.
        let lua = unsafe { Lua::unsafe_new_with(StdLib::ALL, LuaOptions::default()) };
        Self::init_state_inner(&lua, function_subsystem)
            .expect("failed to initialize Lua interpreter state");
        lua
    }

    fn init_state_inner(lua: &Lua, function_subsystem: bool) -> mlua::Result<()> {
        let handler: Function = lua
            .load(ERROR_HANDLER_SRC)
            .set_name("@err_handler_def")
            .eval()?;
        lua.set_named_registry_value(ERROR_HANDLER_KEY, handler)?;

        let wrapper: Function = lua
            .load(PCALL_WRAPPER_SRC)
            .set_name("@pcall_wrapper_def")
            .eval()?;
        lua.set_named_registry_value(PCALL_WRAPPER_KEY, wrapper)?;

        // Stash the introspection entry points the debugger needs
        // before the debug library goes away.
        if let Ok(Some(dbg)) = lua.globals().get::<Option<Table>>("debug") {
            if let Ok(getlocal) = dbg.get::<Function>("getlocal") {
                lua.set_named_registry_value(debug::REG_GETLOCAL, getlocal)?;
            }
            if let Ok(getinfo) = dbg.get::<Function>("getinfo") {
                lua.set_named_registry_value(debug::REG_GETINFO, getinfo)?;
            }
        }

        api::install_server_api(lua, function_subsystem)?;
        api::sandbox_globals(lua)?;
        Ok(())
    }

    fn holder(&self, subsystem: ScriptSubsystem) -> std::sync::MutexGuard<'_, LuaStateHolder> {
        match subsystem {
            ScriptSubsystem::Eval => self.eval.lock().unwrap(),
            ScriptSubsystem::Function => self.function_lua.lock().unwrap(),
            ScriptSubsystem::All => unreachable!("All is only valid for memory introspection"),
        }
    }

    fn compile_eval(&self, code: &str) -> Result<Vec<CompiledFunction>, String> {
        let holder = self.holder(ScriptSubsystem::Eval);
        let func = holder
            .lua
            .load(code)
            .set_name("@user_script")
            .into_function()
            .map_err(|e| format!("Error compiling script (new function): {}", fmt_lua_error(&e)))?;
        let key = holder
            .lua
            .create_registry_value(func)
            .map_err(|e| format!("Error compiling script (new function): {}", fmt_lua_error(&e)))?;

        Ok(vec![CompiledFunction {
            name: None,
            desc: None,
            payload: Box::new(LuaPayload {
                key,
                state_id: holder.state_id,
            }) as Box<dyn Any + Send + Sync>,
            flags: ScriptFlags::empty(),
        }])
    }

    fn compile_function(
        &self,
        code: &str,
        timeout: Duration,
    ) -> Result<Vec<CompiledFunction>, String> {
        let holder = self.holder(ScriptSubsystem::Function);
        let lua = &holder.lua;

        let chunk = lua
            .load(code)
            .set_name("@user_function")
            .into_function()
            .map_err(|e| format!("Error compiling function: {}", fmt_lua_error(&e)))?;

        // The top-level code runs under a time budget; its only
        // permitted effect is registering named functions.
        let _load_scope = api::install_load_ctx(timeout.as_millis() as u64);
        lua.set_hook(
            HookTriggers {
                every_nth_instruction: Some(100_000),
                ..Default::default()
            },
            |_, _| {
                if api::load_ctx_timed_out() {
                    Err(mlua::Error::RuntimeError("FUNCTION LOAD timeout".to_string()))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );
        let outcome = chunk.call::<()>(());
        lua.remove_hook();

        match outcome {
            Ok(()) => {
                let load_ctx = api::take_load_ctx().expect("load context installed above");
                Ok(load_ctx
                    .functions
                    .into_iter()
                    .map(|pending| CompiledFunction {
                        name: Some(pending.name),
                        desc: pending.desc,
                        payload: Box::new(LuaPayload {
                            key: pending.key,
                            state_id: holder.state_id,
                        }) as Box<dyn Any + Send + Sync>,
                        flags: pending.flags,
                    })
                    .collect())
            }
            Err(e) => {
                // Registered functions are discarded with the context.
                let _ = api::take_load_ctx();
                Err(format!("Error registering functions: {}", fmt_lua_error(&e)))
            }
        }
    }

    fn protected_call(
        &self,
        lua: &Lua,
        run_ctx: &ScriptRunCtx,
        payload: &LuaPayload,
        subsystem: ScriptSubsystem,
        keys: &[Vec<u8>],
        args: &[Vec<u8>],
    ) -> RespFrame {
        let attempt = || -> mlua::Result<RespFrame> {
            let wrapper: Function = lua.named_registry_value(PCALL_WRAPPER_KEY)?;
            let handler: Function = lua.named_registry_value(ERROR_HANDLER_KEY)?;
            let func: Function = lua.registry_value(&payload.key)?;

            let (ok, result): (bool, Value) = if subsystem == ScriptSubsystem::Function {
                let keys_table = api::byte_strings_to_table(lua, keys)?;
                let args_table = api::byte_strings_to_table(lua, args)?;
                wrapper.call((handler, func, keys_table, args_table))?
            } else {
                wrapper.call((handler, func))?
            };

            if ok {
                Ok(api::lua_value_to_resp(&result))
            } else {
                Ok(error_value_to_frame(run_ctx, &result))
            }
        };

        attempt().unwrap_or_else(|e| {
            RespFrame::error(format!("ERR Error running script: {}", fmt_lua_error(&e)))
        })
    }
}

impl ScriptingEngineImpl for LuaEngine {
    fn compile(
        &self,
        subsystem: ScriptSubsystem,
        code: &str,
        timeout: Duration,
    ) -> Result<Vec<CompiledFunction>, String> {
        match subsystem {
            ScriptSubsystem::Eval => self.compile_eval(code),
            ScriptSubsystem::Function => self.compile_function(code, timeout),
            ScriptSubsystem::All => unreachable!("All is only valid for memory introspection"),
        }
    }

    fn free_function(&self, subsystem: ScriptSubsystem, function: CompiledFunction) {
        let payload = match function.payload.downcast::<LuaPayload>() {
            Ok(payload) => payload,
            Err(_) => panic!("lua function payload handed to another engine"),
        };
        let holder = self.holder(subsystem);
        if payload.state_id == holder.state_id {
            let _ = holder.lua.remove_registry_value(payload.key);
        }
        // A mismatched state id means the compiling environment was
        // already reset; the key is inert and just dropped.
    }

    fn call(
        &self,
        run_ctx: &ScriptRunCtx,
        function: &CompiledFunction,
        subsystem: ScriptSubsystem,
        keys: &[Vec<u8>],
        args: &[Vec<u8>],
    ) -> RespFrame {
        let holder = self.holder(subsystem);
        let payload = function
            .payload
            .downcast_ref::<LuaPayload>()
            .expect("lua function payload handed to another engine");
        if payload.state_id != holder.state_id {
            return RespFrame::error("ERR Script compiled against a discarded environment");
        }
        let lua = &holder.lua;

        let _ctx_scope = api::install_run_ctx(run_ctx.clone());

        if subsystem == ScriptSubsystem::Eval {
            if let Err(e) = api::set_keys_argv(lua, keys, args) {
                return RespFrame::error(format!("ERR {}", fmt_lua_error(&e)));
            }
        }

        let debug_session =
            subsystem == ScriptSubsystem::Eval && run_ctx.eval_mode && debug::is_active();
        lua.set_hook(
            HookTriggers {
                every_line: debug_session,
                every_nth_instruction: Some(100_000),
                ..Default::default()
            },
            |lua, ar| {
                if let Some(kill_msg) = api::with_run_ctx(|ctx| {
                    if ctx.state.is_killed() {
                        Some(ctx.kill_error().to_string())
                    } else {
                        None
                    }
                })
                .flatten()
                {
                    return Err(mlua::Error::RuntimeError(kill_msg));
                }
                if matches!(ar.event(), DebugEvent::Line) {
                    return debug::line_hook(lua, ar.curr_line());
                }
                Ok(VmState::Continue)
            },
        );

        let reply = self.protected_call(lua, run_ctx, payload, subsystem, keys, args);
        lua.remove_hook();
        reply
    }

    fn function_memory_overhead(&self, function: &CompiledFunction) -> usize {
        mem::size_of::<LuaPayload>()
            + mem::size_of::<CompiledFunction>()
            + function.name.as_ref().map(|n| n.len()).unwrap_or(0)
            + function.desc.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    fn reset_eval_env(&self, async_reset: bool) -> Option<LazyEvalReset> {
        let mut holder = self.eval.lock().unwrap();
        let state_id = self.next_state_id.fetch_add(1, Ordering::SeqCst);

        // The replacement environment is in place before this returns,
        // so an EVAL issued right after an async flush compiles cleanly.
        let old = mem::replace(
            &mut *holder,
            LuaStateHolder {
                lua: Self::init_state(false),
                state_id,
            },
        );

        if async_reset {
            Some(LazyEvalReset::new(move || {
                let _ = old.lua.gc_collect();
                drop(old);
            }))
        } else {
            let _ = old.lua.gc_collect();
            drop(old);
            None
        }
    }

    fn memory_info(&self, subsystem: ScriptSubsystem) -> EngineMemoryInfo {
        let mut info = EngineMemoryInfo {
            used_memory: 0,
            engine_memory_overhead: mem::size_of::<LuaEngine>(),
        };
        if subsystem == ScriptSubsystem::Eval || subsystem == ScriptSubsystem::All {
            info.used_memory += self.eval.lock().unwrap().lua.used_memory();
        }
        if subsystem == ScriptSubsystem::Function || subsystem == ScriptSubsystem::All {
            info.used_memory += self.function_lua.lock().unwrap().lua.used_memory();
        }
        info
    }
}

/// Render an error table produced by the protected-call handler
fn error_value_to_frame(run_ctx: &ScriptRunCtx, value: &Value) -> RespFrame {
    match value {
        Value::Table(table) => {
            let err = table
                .get::<Option<String>>("err")
                .ok()
                .flatten()
                .unwrap_or_else(|| "ERR Error running script".to_string());
            let source = table.get::<Option<String>>("source").ok().flatten();
            let line = table.get::<Option<i64>>("line").ok().flatten();
            match (source, line) {
                (Some(source), Some(line)) if line > 0 && !run_ctx.sha.is_empty() => {
                    RespFrame::error(format!(
                        "{} script: {}, on {}:{}.",
                        err, run_ctx.sha, source, line
                    ))
                }
                _ => RespFrame::error(err),
            }
        }
        Value::String(s) => RespFrame::error(format!("ERR {}", s.to_string_lossy())),
        _ => RespFrame::error("ERR Error running script"),
    }
}

/// Flatten an mlua error into a single client-presentable line
fn fmt_lua_error(error: &mlua::Error) -> String {
    let message = match error {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::CallbackError { cause, .. } => fmt_lua_error(cause),
        other => other.to_string(),
    };
    match message.find("\nstack traceback") {
        Some(pos) => message[..pos].to_string(),
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;
    use std::sync::Arc;

    fn run_ctx(read_only: bool) -> ScriptRunCtx {
        ScriptRunCtx::new(
            StorageEngine::new(),
            0,
            ScriptFlags::empty(),
            read_only,
            "a".repeat(40),
            true,
        )
    }

    fn eval(engine: &LuaEngine, ctx: &ScriptRunCtx, code: &str) -> RespFrame {
        let mut functions = engine
            .compile(ScriptSubsystem::Eval, code, Duration::ZERO)
            .unwrap();
        let function = functions.pop().unwrap();
        let reply = engine.call(ctx, &function, ScriptSubsystem::Eval, &[], &[]);
        engine.free_function(ScriptSubsystem::Eval, function);
        reply
    }

    #[test]
    fn test_eval_basic_values() {
        let engine = LuaEngine::new();
        let ctx = run_ctx(false);

        assert_eq!(eval(&engine, &ctx, "return 1 + 1"), RespFrame::Integer(2));
        assert_eq!(
            eval(&engine, &ctx, "return 'ok'"),
            RespFrame::bulk_string("ok")
        );
        assert_eq!(eval(&engine, &ctx, "return true"), RespFrame::Integer(1));
        assert_eq!(eval(&engine, &ctx, "return false"), RespFrame::null_bulk());
        assert_eq!(eval(&engine, &ctx, "return 3.7"), RespFrame::Integer(3));
        assert_eq!(
            eval(&engine, &ctx, "return {1, 2, 3}"),
            RespFrame::array(vec![
                RespFrame::Integer(1),
                RespFrame::Integer(2),
                RespFrame::Integer(3)
            ])
        );
    }

    #[test]
    fn test_eval_status_and_error_tables() {
        let engine = LuaEngine::new();
        let ctx = run_ctx(false);

        assert_eq!(
            eval(&engine, &ctx, "return server.status_reply('GOOD')"),
            RespFrame::simple_string("GOOD")
        );
        let reply = eval(&engine, &ctx, "return server.error_reply('boom')");
        assert!(reply.is_error());
    }

    #[test]
    fn test_compile_error_reported() {
        let engine = LuaEngine::new();
        let err = engine
            .compile(ScriptSubsystem::Eval, "return 1 +", Duration::ZERO)
            .unwrap_err();
        assert!(err.starts_with("Error compiling script"), "{}", err);
    }

    #[test]
    fn test_runtime_error_reported() {
        let engine = LuaEngine::new();
        let ctx = run_ctx(false);
        let reply = eval(&engine, &ctx, "error('something broke')");
        assert!(reply.is_error());
    }

    #[test]
    fn test_server_call_reaches_storage() {
        let engine = LuaEngine::new();
        let ctx = run_ctx(false);

        let reply = eval(
            &engine,
            &ctx,
            "server.call('SET', 'counter', '5'); return server.call('INCR', 'counter')",
        );
        assert_eq!(reply, RespFrame::Integer(6));
        assert_eq!(
            ctx.storage.get_string(0, b"counter").unwrap(),
            Some(b"6".to_vec())
        );
        assert!(ctx.has_written());
    }

    #[test]
    fn test_redis_alias() {
        let engine = LuaEngine::new();
        let ctx = run_ctx(false);
        let reply = eval(&engine, &ctx, "return redis.call('PING')");
        // Status replies surface as {ok=...} tables.
        assert_eq!(reply, RespFrame::simple_string("PONG"));
    }

    #[test]
    fn test_call_error_aborts_script() {
        let engine = LuaEngine::new();
        let ctx = run_ctx(false);
        let reply = eval(
            &engine,
            &ctx,
            "server.call('NOSUCHCMD'); return 'unreachable'",
        );
        assert!(reply.is_error());
    }

    #[test]
    fn test_pcall_error_returns_table() {
        let engine = LuaEngine::new();
        let ctx = run_ctx(false);
        let reply = eval(
            &engine,
            &ctx,
            "local e = server.pcall('NOSUCHCMD'); return e.err ~= nil",
        );
        assert_eq!(reply, RespFrame::Integer(1));
    }

    #[test]
    fn test_read_only_run_blocks_writes() {
        let engine = LuaEngine::new();
        let ctx = run_ctx(true);
        let reply = eval(&engine, &ctx, "return server.call('SET', 'k', 'v')");
        assert!(reply.is_error());
        assert!(!ctx.has_written());
    }

    #[test]
    fn test_keys_argv_globals() {
        let engine = LuaEngine::new();
        let ctx = run_ctx(false);

        let mut functions = engine
            .compile(
                ScriptSubsystem::Eval,
                "return {KEYS[1], ARGV[1], ARGV[2]}",
                Duration::ZERO,
            )
            .unwrap();
        let function = functions.pop().unwrap();
        let reply = engine.call(
            &ctx,
            &function,
            ScriptSubsystem::Eval,
            &[b"mykey".to_vec()],
            &[b"a".to_vec(), b"b".to_vec()],
        );
        engine.free_function(ScriptSubsystem::Eval, function);

        assert_eq!(
            reply,
            RespFrame::array(vec![
                RespFrame::bulk_string("mykey"),
                RespFrame::bulk_string("a"),
                RespFrame::bulk_string("b"),
            ])
        );
    }

    #[test]
    fn test_sandboxed_globals_are_gone() {
        let engine = LuaEngine::new();
        let ctx = run_ctx(false);
        let reply = eval(
            &engine,
            &ctx,
            "return (os == nil and io == nil and debug == nil) and 1 or 0",
        );
        assert_eq!(reply, RespFrame::Integer(1));
    }

    #[test]
    fn test_sha1hex_binding() {
        let engine = LuaEngine::new();
        let ctx = run_ctx(false);
        let reply = eval(&engine, &ctx, "return server.sha1hex('')");
        assert_eq!(
            reply,
            RespFrame::bulk_string("da39a3ee5e6b4b0d3255bfef95601890afd80709")
        );
    }

    #[test]
    fn test_function_load_registers() {
        let engine = LuaEngine::new();
        let functions = engine
            .compile(
                ScriptSubsystem::Function,
                "server.register_function('myfunc', function(keys, args) return 1 end)",
                Duration::from_millis(500),
            )
            .unwrap();
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].name.as_deref(), Some("myfunc"));
        for function in functions {
            engine.free_function(ScriptSubsystem::Function, function);
        }
    }

    #[test]
    fn test_function_load_named_args_and_flags() {
        let engine = LuaEngine::new();
        let functions = engine
            .compile(
                ScriptSubsystem::Function,
                "server.register_function{function_name='ro', callback=function() return 7 end, \
                 description='reads only', flags={'no-writes'}}",
                Duration::from_millis(500),
            )
            .unwrap();
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].desc.as_deref(), Some("reads only"));
        assert!(functions[0].flags.contains(ScriptFlags::NO_WRITES));
        for function in functions {
            engine.free_function(ScriptSubsystem::Function, function);
        }
    }

    #[test]
    fn test_function_callback_receives_keys_args() {
        let engine = LuaEngine::new();
        let mut functions = engine
            .compile(
                ScriptSubsystem::Function,
                "server.register_function('echoarg', function(keys, args) return args[1] end)",
                Duration::from_millis(500),
            )
            .unwrap();
        let function = functions.pop().unwrap();

        let mut ctx = run_ctx(false);
        ctx.eval_mode = false;
        let reply = engine.call(
            &ctx,
            &function,
            ScriptSubsystem::Function,
            &[],
            &[b"7".to_vec()],
        );
        assert_eq!(reply, RespFrame::bulk_string("7"));
        engine.free_function(ScriptSubsystem::Function, function);
    }

    #[test]
    fn test_register_function_outside_load_fails() {
        let engine = LuaEngine::new();
        let ctx = run_ctx(false);
        let reply = eval(
            &engine,
            &ctx,
            "return server.register_function('x', function() end)",
        );
        assert!(reply.is_error());
    }

    #[test]
    fn test_function_load_timeout() {
        let engine = LuaEngine::new();
        let err = engine
            .compile(
                ScriptSubsystem::Function,
                "local i = 0 while true do i = i + 1 end",
                Duration::from_millis(100),
            )
            .unwrap_err();
        assert!(err.contains("FUNCTION LOAD timeout"), "{}", err);
    }

    #[test]
    fn test_reset_eval_env_sync() {
        let engine = LuaEngine::new();
        let ctx = run_ctx(false);

        eval(&engine, &ctx, "return 1");
        assert!(engine.reset_eval_env(false).is_none());
        // The fresh environment compiles and runs immediately.
        assert_eq!(eval(&engine, &ctx, "return 2"), RespFrame::Integer(2));
    }

    #[test]
    fn test_reset_eval_env_async_returns_closure() {
        let engine = LuaEngine::new();
        let reset = engine.reset_eval_env(true).expect("deferred reset closure");
        reset.run();
        let ctx = run_ctx(false);
        assert_eq!(eval(&engine, &ctx, "return 3"), RespFrame::Integer(3));
    }

    #[test]
    fn test_stale_compiled_function_rejected() {
        let engine = LuaEngine::new();
        let ctx = run_ctx(false);
        let mut functions = engine
            .compile(ScriptSubsystem::Eval, "return 1", Duration::ZERO)
            .unwrap();
        let function = functions.pop().unwrap();

        engine.reset_eval_env(false);
        let reply = engine.call(&ctx, &function, ScriptSubsystem::Eval, &[], &[]);
        assert!(reply.is_error());
        engine.free_function(ScriptSubsystem::Eval, function);
    }

    #[test]
    fn test_kill_interrupts_long_loop() {
        let engine = Arc::new(LuaEngine::new());
        let ctx = run_ctx(false);
        let state = Arc::clone(&ctx.state);

        let killer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            state.kill();
        });

        let reply = eval(&engine, &ctx, "local i = 0 while true do i = i + 1 end");
        killer.join().unwrap();
        assert!(reply.is_error());
        assert!(ctx.state.is_killed());
    }

    #[test]
    fn test_error_carries_line_info() {
        let engine = LuaEngine::new();
        let ctx = run_ctx(false);
        let reply = eval(&engine, &ctx, "local x = 1\nerror('broken here')");
        match reply {
            RespFrame::Error(bytes) => {
                let msg = String::from_utf8_lossy(&bytes);
                assert!(msg.contains("broken here"), "{}", msg);
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_memory_info_reports_usage() {
        let engine = LuaEngine::new();
        let info = engine.memory_info(ScriptSubsystem::All);
        assert!(info.used_memory > 0);
        assert!(info.engine_memory_overhead > 0);
    }
}
