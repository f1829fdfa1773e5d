//! Script-facing `server` API and value conversion
//!
//! Installs the `server` table (aliased as `redis`) into an interpreter
//! state and converts values between Lua and RESP. The per-call run
//! context and the FUNCTION LOAD collection context are scoped
//! thread-locals installed around the engine calls.

use std::cell::RefCell;
use std::time::Instant;

use mlua::{Lua, MultiValue, RegistryKey, Table, Value};

use super::debug as ldb;
use crate::protocol::resp::RespFrame;
use crate::scripting::eval_cache::sha1_hex;
use crate::scripting::run_ctx::ScriptRunCtx;
use crate::scripting::ScriptFlags;
use crate::storage::commands;

/// A function registered during FUNCTION LOAD, before it becomes a
/// compiled-function descriptor.
pub struct PendingFunction {
    pub name: String,
    pub desc: Option<String>,
    pub key: RegistryKey,
    pub flags: ScriptFlags,
}

/// Collection context alive for the duration of one FUNCTION compile
pub struct LoadCtx {
    pub functions: Vec<PendingFunction>,
    pub start: Instant,
    pub timeout_ms: u64,
}

thread_local! {
    static CURRENT_RUN_CTX: RefCell<Option<ScriptRunCtx>> = const { RefCell::new(None) };
    static CURRENT_LOAD_CTX: RefCell<Option<LoadCtx>> = const { RefCell::new(None) };
}

/// RAII guard installing the run context for the current call
pub struct RunCtxGuard;

pub fn install_run_ctx(ctx: ScriptRunCtx) -> RunCtxGuard {
    CURRENT_RUN_CTX.with(|cell| *cell.borrow_mut() = Some(ctx));
    RunCtxGuard
}

impl Drop for RunCtxGuard {
    fn drop(&mut self) {
        CURRENT_RUN_CTX.with(|cell| *cell.borrow_mut() = None);
    }
}

/// Run `f` with the current run context, if one is installed
pub fn with_run_ctx<R>(f: impl FnOnce(&ScriptRunCtx) -> R) -> Option<R> {
    CURRENT_RUN_CTX.with(|cell| cell.borrow().as_ref().map(f))
}

/// RAII guard installing the FUNCTION LOAD collection context
pub struct LoadCtxGuard;

pub fn install_load_ctx(timeout_ms: u64) -> LoadCtxGuard {
    CURRENT_LOAD_CTX.with(|cell| {
        *cell.borrow_mut() = Some(LoadCtx {
            functions: Vec::new(),
            start: Instant::now(),
            timeout_ms,
        })
    });
    LoadCtxGuard
}

/// Collect the functions registered so far, ending the load scope
pub fn take_load_ctx() -> Option<LoadCtx> {
    CURRENT_LOAD_CTX.with(|cell| cell.borrow_mut().take())
}

/// True when the running FUNCTION LOAD exceeded its time budget
pub fn load_ctx_timed_out() -> bool {
    CURRENT_LOAD_CTX.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|ctx| {
                ctx.timeout_ms > 0 && ctx.start.elapsed().as_millis() as u64 > ctx.timeout_ms
            })
            .unwrap_or(false)
    })
}

impl Drop for LoadCtxGuard {
    fn drop(&mut self) {
        CURRENT_LOAD_CTX.with(|cell| *cell.borrow_mut() = None);
    }
}

/// Convert a script reply value to a RESP frame.
///
/// Booleans map to 1 / nil, numbers are truncated to integers, and
/// tables reply as arrays cut at the first nil unless they carry an
/// `err` or `ok` field.
pub fn lua_value_to_resp(value: &Value) -> RespFrame {
    match value {
        Value::Nil => RespFrame::null_bulk(),
        Value::Boolean(true) => RespFrame::Integer(1),
        Value::Boolean(false) => RespFrame::null_bulk(),
        Value::Integer(i) => RespFrame::Integer(*i),
        Value::Number(n) => RespFrame::Integer(*n as i64),
        Value::String(s) => RespFrame::bulk_string(s.as_bytes()),
        Value::Table(table) => {
            if let Ok(Some(err)) = table.get::<Option<String>>("err") {
                return RespFrame::error(err);
            }
            if let Ok(Some(ok)) = table.get::<Option<String>>("ok") {
                return RespFrame::simple_string(ok);
            }
            let mut items = Vec::new();
            let mut index = 1;
            loop {
                match table.get::<Value>(index) {
                    Ok(Value::Nil) | Err(_) => break,
                    Ok(item) => items.push(lua_value_to_resp(&item)),
                }
                index += 1;
            }
            RespFrame::array(items)
        }
        _ => RespFrame::null_bulk(),
    }
}

/// Convert a command reply to the Lua value scripts observe.
///
/// Status replies become `{ok=...}` tables, error replies `{err=...}`,
/// and null replies the boolean false.
pub fn resp_to_lua_value(lua: &Lua, frame: &RespFrame) -> mlua::Result<Value> {
    match frame {
        RespFrame::Integer(i) => Ok(Value::Integer(*i)),
        RespFrame::SimpleString(bytes) => {
            let table = lua.create_table()?;
            table.set("ok", lua.create_string(bytes.as_ref())?)?;
            Ok(Value::Table(table))
        }
        RespFrame::Error(bytes) => {
            let table = lua.create_table()?;
            table.set("err", lua.create_string(bytes.as_ref())?)?;
            Ok(Value::Table(table))
        }
        RespFrame::BulkString(Some(bytes)) => {
            Ok(Value::String(lua.create_string(bytes.as_ref())?))
        }
        RespFrame::BulkString(None) | RespFrame::Array(None) | RespFrame::Null => {
            Ok(Value::Boolean(false))
        }
        RespFrame::Array(Some(frames)) => {
            let table = lua.create_table()?;
            for (i, frame) in frames.iter().enumerate() {
                table.set(i + 1, resp_to_lua_value(lua, frame)?)?;
            }
            Ok(Value::Table(table))
        }
        RespFrame::Boolean(b) => Ok(Value::Boolean(*b)),
        RespFrame::Double(d) => Ok(Value::Number(*d)),
        _ => Ok(Value::Boolean(false)),
    }
}

/// Collect `server.call` arguments into command argv form
fn command_argv(args: MultiValue) -> Result<Vec<Vec<u8>>, String> {
    let mut argv = Vec::with_capacity(args.len());
    for value in args {
        match value {
            Value::String(s) => argv.push(s.as_bytes().to_vec()),
            Value::Integer(i) => argv.push(i.to_string().into_bytes()),
            Value::Number(n) => argv.push(n.to_string().into_bytes()),
            _ => {
                return Err(
                    "Lua server lib command arguments must be strings or integers".to_string(),
                )
            }
        }
    }
    if argv.is_empty() {
        return Err("Please specify at least one argument for this call".to_string());
    }
    Ok(argv)
}

/// Execute a script-issued command through the current run context
fn run_script_command(argv: &[Vec<u8>]) -> Result<RespFrame, String> {
    let outcome = with_run_ctx(|ctx| {
        if ctx.state.is_killed() {
            return Err(ctx.kill_error().to_string());
        }
        let name = String::from_utf8_lossy(&argv[0]).to_uppercase();
        let reply = commands::execute(&ctx.storage, ctx.db, argv, ctx.read_only)
            .map_err(|e| e.to_string())?;
        if commands::is_write_command(&name) && !reply.is_error() {
            ctx.mark_written();
        }
        Ok(reply)
    });
    match outcome {
        Some(result) => result,
        None => Err("server.call is only available inside a script".to_string()),
    }
}

fn server_call(lua: &Lua, args: MultiValue, raise: bool) -> mlua::Result<Value> {
    let argv = match command_argv(args) {
        Ok(argv) => argv,
        Err(msg) => return script_command_error(lua, msg, raise),
    };

    if ldb::is_active_and_stepping() {
        ldb::log_issued_command(&argv);
    }

    match run_script_command(&argv) {
        Ok(reply) => {
            if ldb::is_active_and_stepping() {
                ldb::log_command_reply(&reply);
            }
            if reply.is_error() {
                let msg = match &reply {
                    RespFrame::Error(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                    _ => unreachable!(),
                };
                return script_command_error(lua, msg, raise);
            }
            resp_to_lua_value(lua, &reply)
        }
        Err(msg) => script_command_error(lua, msg, raise),
    }
}

/// Error propagation for server.call vs server.pcall: call aborts the
/// script, pcall hands the error table back to it.
fn script_command_error(lua: &Lua, msg: String, raise: bool) -> mlua::Result<Value> {
    // Leave messages alone when they already start with an error code
    // (ERR, WRONGTYPE, NOSCRIPT, ...).
    let has_code = msg
        .split(' ')
        .next()
        .map(|word| !word.is_empty() && word.chars().all(|c| c.is_ascii_uppercase()))
        .unwrap_or(false);
    let msg = if has_code { msg } else { format!("ERR {}", msg) };

    if raise {
        Err(mlua::Error::RuntimeError(msg))
    } else {
        let table = lua.create_table()?;
        table.set("err", lua.create_string(&msg)?)?;
        Ok(Value::Table(table))
    }
}

/// Install KEYS and ARGV globals for an EVAL call
pub fn set_keys_argv(lua: &Lua, keys: &[Vec<u8>], args: &[Vec<u8>]) -> mlua::Result<()> {
    let globals = lua.globals();

    let keys_table = lua.create_table()?;
    for (i, key) in keys.iter().enumerate() {
        keys_table.set(i + 1, lua.create_string(key)?)?;
    }
    globals.set("KEYS", keys_table)?;

    let argv_table = lua.create_table()?;
    for (i, arg) in args.iter().enumerate() {
        argv_table.set(i + 1, lua.create_string(arg)?)?;
    }
    globals.set("ARGV", argv_table)?;

    Ok(())
}

/// Build a Lua sequence from raw byte strings (FCALL parameters)
pub fn byte_strings_to_table(lua: &Lua, items: &[Vec<u8>]) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    for (i, item) in items.iter().enumerate() {
        table.set(i + 1, lua.create_string(item)?)?;
    }
    Ok(table)
}

fn register_function_from_table(lua: &Lua, spec: Table) -> mlua::Result<PendingFunction> {
    let mut name: Option<String> = None;
    let mut desc: Option<String> = None;
    let mut key: Option<RegistryKey> = None;
    let mut flags = ScriptFlags::empty();

    for pair in spec.pairs::<String, Value>() {
        let (arg, value) = pair.map_err(|_| {
            mlua::Error::RuntimeError(
                "named argument key given to server.register_function is not a string".to_string(),
            )
        })?;
        match arg.to_lowercase().as_str() {
            "function_name" => match value {
                Value::String(s) => name = Some(s.to_string_lossy().to_string()),
                _ => {
                    return Err(mlua::Error::RuntimeError(
                        "function_name argument given to server.register_function must be a string"
                            .to_string(),
                    ))
                }
            },
            "description" => match value {
                Value::String(s) => desc = Some(s.to_string_lossy().to_string()),
                _ => {
                    return Err(mlua::Error::RuntimeError(
                        "description argument given to server.register_function must be a string"
                            .to_string(),
                    ))
                }
            },
            "callback" => match value {
                Value::Function(f) => key = Some(lua.create_registry_value(f)?),
                _ => {
                    return Err(mlua::Error::RuntimeError(
                        "callback argument given to server.register_function must be a function"
                            .to_string(),
                    ))
                }
            },
            "flags" => match value {
                Value::Table(list) => {
                    for flag in list.sequence_values::<String>() {
                        let flag = flag.map_err(|_| {
                            mlua::Error::RuntimeError("unknown flag given".to_string())
                        })?;
                        match ScriptFlags::parse_token(&flag) {
                            Some(parsed) => flags.insert(parsed),
                            None => {
                                return Err(mlua::Error::RuntimeError(
                                    "unknown flag given".to_string(),
                                ))
                            }
                        }
                    }
                }
                _ => {
                    return Err(mlua::Error::RuntimeError(
                        "flags argument to server.register_function must be a table representing function flags"
                            .to_string(),
                    ))
                }
            },
            _ => {
                return Err(mlua::Error::RuntimeError(
                    "unknown argument given to server.register_function".to_string(),
                ))
            }
        }
    }

    let name = name.ok_or_else(|| {
        mlua::Error::RuntimeError(
            "server.register_function must get a function name argument".to_string(),
        )
    })?;
    let key = key.ok_or_else(|| {
        mlua::Error::RuntimeError(
            "server.register_function must get a callback argument".to_string(),
        )
    })?;

    Ok(PendingFunction {
        name,
        desc,
        key,
        flags,
    })
}

fn register_function(lua: &Lua, args: MultiValue) -> mlua::Result<()> {
    let in_load = CURRENT_LOAD_CTX.with(|cell| cell.borrow().is_some());
    if !in_load {
        return Err(mlua::Error::RuntimeError(
            "server.register_function can only be called on FUNCTION LOAD command".to_string(),
        ));
    }

    let mut args = args.into_iter();
    let pending = match (args.next(), args.next(), args.next()) {
        // Named arguments: a single table.
        (Some(Value::Table(spec)), None, None) => register_function_from_table(lua, spec)?,
        // Positional: name and callback.
        (Some(Value::String(name)), Some(Value::Function(callback)), None) => PendingFunction {
            name: name.to_string_lossy().to_string(),
            desc: None,
            key: lua.create_registry_value(callback)?,
            flags: ScriptFlags::empty(),
        },
        _ => {
            return Err(mlua::Error::RuntimeError(
                "wrong number of arguments to server.register_function".to_string(),
            ))
        }
    };

    CURRENT_LOAD_CTX.with(|cell| {
        if let Some(ctx) = cell.borrow_mut().as_mut() {
            ctx.functions.push(pending);
        }
    });
    Ok(())
}

/// Install the `server` table (and the `redis` alias) into a state.
///
/// `function_subsystem` states get `server.register_function`; EVAL
/// states get the debugger bindings instead.
pub fn install_server_api(lua: &Lua, function_subsystem: bool) -> mlua::Result<()> {
    let globals = lua.globals();
    let server = lua.create_table()?;

    server.set(
        "call",
        lua.create_function(|lua, args: MultiValue| server_call(lua, args, true))?,
    )?;
    server.set(
        "pcall",
        lua.create_function(|lua, args: MultiValue| server_call(lua, args, false))?,
    )?;
    server.set(
        "error_reply",
        lua.create_function(|lua, msg: String| {
            let table = lua.create_table()?;
            let msg = if msg.starts_with("ERR ") {
                msg
            } else {
                format!("ERR {}", msg)
            };
            table.set("err", msg)?;
            Ok(table)
        })?,
    )?;
    server.set(
        "status_reply",
        lua.create_function(|lua, msg: String| {
            let table = lua.create_table()?;
            table.set("ok", msg)?;
            Ok(table)
        })?,
    )?;
    server.set(
        "sha1hex",
        lua.create_function(|_, input: mlua::String| Ok(sha1_hex(&input.as_bytes())))?,
    )?;
    server.set(
        "log",
        lua.create_function(|_, args: MultiValue| {
            let rendered: Vec<String> = args
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => s.to_string_lossy().to_string(),
                    other => format!("{:?}", other),
                })
                .collect();
            println!("script: {}", rendered.join(" "));
            Ok(())
        })?,
    )?;

    if function_subsystem {
        server.set(
            "register_function",
            lua.create_function(|lua, args: MultiValue| register_function(lua, args))?,
        )?;
    } else {
        // Inert unless a debugging session is active.
        server.set(
            "breakpoint",
            lua.create_function(|_, ()| Ok(ldb::request_breakpoint()))?,
        )?;
        server.set(
            "debug",
            lua.create_function(|lua, args: MultiValue| {
                ldb::log_script_debug(lua, args);
                Ok(())
            })?,
        )?;
    }

    globals.set("redis", &server)?;
    globals.set("server", server)?;
    Ok(())
}

/// Remove host-environment escape hatches from a state's globals
pub fn sandbox_globals(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in [
        "os", "io", "debug", "package", "require", "dofile", "loadfile", "load",
    ] {
        globals.set(name, Value::Nil)?;
    }
    Ok(())
}
