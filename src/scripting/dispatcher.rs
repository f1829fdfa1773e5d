//! Script command handlers
//!
//! Translates EVAL/EVALSHA/SCRIPT/FCALL/FUNCTION command shapes into
//! engine calls through the subsystem. Client-visible failures are
//! returned as RESP error frames; `Err` is reserved for internal
//! failures.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use super::eval_cache::sha1_hex;
use super::run_ctx::{check_run_policy, fold_command_flags, CommandFlags, KillScope, ScriptRunCtx};
use super::subsystem::ScriptingSubsystem;
use super::ScriptSubsystem;
use crate::engines::lua::debug as ldb;
use crate::error::{Result, ScriptError};
use crate::protocol::resp::RespFrame;

/// Per-client state the scripting commands care about
pub struct ClientContext {
    /// Selected database
    pub db: usize,

    /// SCRIPT DEBUG YES|SYNC armed
    pub lua_debug: bool,

    /// SCRIPT DEBUG SYNC (debug in-process, keep dataset changes)
    pub lua_debug_sync: bool,

    /// The client connection, when the front-end exposes one. The
    /// debugger performs direct I/O on it.
    pub conn: Option<TcpStream>,

    /// The front-end should close this client after the next reply
    pub close_after_reply: bool,
}

impl ClientContext {
    pub fn new() -> Self {
        ClientContext {
            db: 0,
            lua_debug: false,
            lua_debug_sync: false,
            conn: None,
            close_after_reply: false,
        }
    }
}

impl Default for ClientContext {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_args(cmd: &str) -> RespFrame {
    RespFrame::error(format!(
        "ERR wrong number of arguments for '{}' command",
        cmd
    ))
}

fn noscript() -> RespFrame {
    RespFrame::error(ScriptError::NotFound.to_string())
}

/// Handle EVAL
pub fn handle_eval(
    sub: &Arc<ScriptingSubsystem>,
    client: &mut ClientContext,
    parts: &[RespFrame],
) -> Result<RespFrame> {
    eval_entry(sub, client, parts, false, false)
}

/// Handle EVAL_RO
pub fn handle_eval_ro(
    sub: &Arc<ScriptingSubsystem>,
    client: &mut ClientContext,
    parts: &[RespFrame],
) -> Result<RespFrame> {
    eval_entry(sub, client, parts, false, true)
}

/// Handle EVALSHA
pub fn handle_evalsha(
    sub: &Arc<ScriptingSubsystem>,
    client: &mut ClientContext,
    parts: &[RespFrame],
) -> Result<RespFrame> {
    eval_entry(sub, client, parts, true, false)
}

/// Handle EVALSHA_RO
pub fn handle_evalsha_ro(
    sub: &Arc<ScriptingSubsystem>,
    client: &mut ClientContext,
    parts: &[RespFrame],
) -> Result<RespFrame> {
    eval_entry(sub, client, parts, true, true)
}

fn eval_entry(
    sub: &Arc<ScriptingSubsystem>,
    client: &mut ClientContext,
    parts: &[RespFrame],
    evalsha: bool,
    read_only_cmd: bool,
) -> Result<RespFrame> {
    if parts.len() < 3 {
        return Ok(wrong_args(if evalsha { "evalsha" } else { "eval" }));
    }

    if evalsha {
        // A digest of the wrong length can never match; reject before
        // touching the cache.
        match parts[1].as_bulk_bytes() {
            Some(digest) if digest.len() == 40 => {}
            _ => return Ok(noscript()),
        }
        if client.lua_debug {
            return Ok(RespFrame::error(
                "ERR Please use EVAL instead of EVALSHA for debugging",
            ));
        }
        return eval_generic(sub, client, parts, true, read_only_cmd);
    }

    if client.lua_debug {
        eval_with_debugging(sub, client, parts, read_only_cmd)
    } else {
        eval_generic(sub, client, parts, false, read_only_cmd)
    }
}

fn eval_generic(
    sub: &Arc<ScriptingSubsystem>,
    client: &mut ClientContext,
    parts: &[RespFrame],
    evalsha: bool,
    read_only_cmd: bool,
) -> Result<RespFrame> {
    let script = match parts[1].as_bulk_str() {
        Some(script) => script,
        None => return Ok(RespFrame::error("ERR invalid script")),
    };

    let numkeys = match parts[2]
        .as_bulk_str()
        .and_then(|s| s.parse::<i64>().ok())
    {
        Some(n) => n,
        None => {
            return Ok(RespFrame::error(
                "ERR value is not an integer or out of range",
            ))
        }
    };
    if numkeys < 0 {
        return Ok(RespFrame::error("ERR Number of keys can't be negative"));
    }
    let numkeys = numkeys as usize;
    if numkeys > parts.len() - 3 {
        return Ok(RespFrame::error(
            "ERR Number of keys can't be greater than number of args",
        ));
    }

    let mut keys = Vec::with_capacity(numkeys);
    for frame in &parts[3..3 + numkeys] {
        match frame.as_bulk_bytes() {
            Some(bytes) => keys.push(bytes.to_vec()),
            None => return Ok(RespFrame::error("ERR invalid key")),
        }
    }
    let mut args = Vec::new();
    for frame in &parts[3 + numkeys..] {
        match frame.as_bulk_bytes() {
            Some(bytes) => args.push(bytes.to_vec()),
            None => return Ok(RespFrame::error("ERR invalid argument")),
        }
    }

    let sha = if evalsha {
        script.to_lowercase()
    } else {
        sha1_hex(script.as_bytes())
    };

    let cached = match sub.eval_cache.get_for_run(&sha) {
        Some(cached) => cached,
        None => {
            if evalsha {
                // EVALSHA with a digest that was never admitted.
                return Ok(noscript());
            }
            if let Err(msg) = sub.eval_cache.register(&sub.engines, &script, false) {
                return Ok(RespFrame::error(format!("ERR {}", msg)));
            }
            sub.eval_cache
                .get_for_run(&sha)
                .expect("script admitted just above")
        }
    };

    // Combined flags decide cluster/replica admission before the
    // script runs.
    let mut base = CommandFlags::empty();
    if read_only_cmd {
        base.insert(CommandFlags::READONLY);
    } else {
        base.insert(CommandFlags::WRITE);
    }
    let folded = fold_command_flags(base, cached.flags);
    if let Err(msg) = check_run_policy(&sub.config, folded) {
        return Ok(RespFrame::error(msg));
    }

    // EVAL_RO stays strictly read-only regardless of script flags.
    let read_only = read_only_cmd || folded.contains(CommandFlags::READONLY);

    let ctx = ScriptRunCtx::new(
        Arc::clone(&sub.storage),
        client.db,
        cached.flags,
        read_only,
        sha.clone(),
        true,
    );

    let guard = sub.running.begin(&ctx);
    let reply = cached
        .engine
        .call_function(&ctx, &cached.script, ScriptSubsystem::Eval, &keys, &args);
    let killed = ctx.state.is_killed();
    drop(guard);

    if killed {
        return Ok(RespFrame::error(ctx.kill_error().to_string()));
    }

    // Maintain the LRU list after the call.
    sub.eval_cache.touch(&sha);

    Ok(reply)
}

/// Wrapper for EVAL that enables debugging and makes sure that when
/// EVAL returns, whatever happened, the session is ended.
fn eval_with_debugging(
    sub: &Arc<ScriptingSubsystem>,
    client: &mut ClientContext,
    parts: &[RespFrame],
    read_only_cmd: bool,
) -> Result<RespFrame> {
    let script = match parts[1].as_bulk_str() {
        Some(script) => script,
        None => return Ok(RespFrame::error("ERR invalid script")),
    };

    match ldb::start_session(
        &script,
        client.lua_debug_sync,
        sub.config.debugger_send_timeout_ms,
    ) {
        ldb::SessionStart::ForkFailed(err) => {
            client.lua_debug = false;
            client.lua_debug_sync = false;
            Ok(RespFrame::error(format!(
                "ERR Fork() failed: can't run EVAL in debugging mode: {}",
                err
            )))
        }
        ldb::SessionStart::ParentClosedClient => {
            // The child owns the session; this side drops the client.
            client.lua_debug = false;
            client.lua_debug_sync = false;
            client.conn = None;
            client.close_after_reply = true;
            Ok(RespFrame::null_bulk())
        }
        ldb::SessionStart::Proceed => {
            let reply = eval_generic(sub, client, parts, false, read_only_cmd)?;
            // In a forked session this call does not return.
            ldb::end_session(&reply);
            client.lua_debug = false;
            client.lua_debug_sync = false;
            client.close_after_reply = true;
            Ok(reply)
        }
    }
}

/// Handle the SCRIPT container command
pub fn handle_script(
    sub: &Arc<ScriptingSubsystem>,
    client: &mut ClientContext,
    parts: &[RespFrame],
) -> Result<RespFrame> {
    if parts.len() < 2 {
        return Ok(wrong_args("script"));
    }
    let subcommand = match parts[1].as_bulk_str() {
        Some(subcommand) => subcommand.to_uppercase(),
        None => return Ok(RespFrame::error("ERR invalid subcommand format")),
    };

    match subcommand.as_str() {
        "HELP" if parts.len() == 2 => {
            let help = [
                "DEBUG (YES|SYNC|NO)",
                "    Set the debug mode for subsequent scripts executed.",
                "EXISTS <sha1> [<sha1> ...]",
                "    Return information about the existence of the scripts in the script cache.",
                "FLUSH [ASYNC|SYNC]",
                "    Flush the Lua scripts cache. Very dangerous on replicas.",
                "KILL",
                "    Kill the currently executing Lua script.",
                "LOAD <script>",
                "    Load a script into the scripts cache without executing it.",
                "SHOW <sha1>",
                "    Show a script from the scripts cache.",
            ];
            Ok(RespFrame::array(
                help.iter().map(|line| RespFrame::simple_string(*line)).collect(),
            ))
        }
        "FLUSH" => {
            let async_flush = match parts.len() {
                2 => sub.config.lazyfree_lazy_user_flush,
                3 => match parts[2].as_bulk_str().map(|s| s.to_uppercase()).as_deref() {
                    Some("SYNC") => false,
                    Some("ASYNC") => true,
                    _ => {
                        return Ok(RespFrame::error(
                            "ERR SCRIPT FLUSH only support SYNC|ASYNC option",
                        ))
                    }
                },
                _ => {
                    return Ok(RespFrame::error(
                        "ERR SCRIPT FLUSH only support SYNC|ASYNC option",
                    ))
                }
            };
            sub.flush_scripts(async_flush);
            Ok(RespFrame::ok())
        }
        "EXISTS" if parts.len() >= 3 => {
            let mut results = Vec::with_capacity(parts.len() - 2);
            for frame in &parts[2..] {
                let found = frame
                    .as_bulk_str()
                    .map(|sha| sub.eval_cache.exists(&sha.to_lowercase()))
                    .unwrap_or(false);
                results.push(RespFrame::Integer(found as i64));
            }
            Ok(RespFrame::array(results))
        }
        "LOAD" if parts.len() == 3 => {
            let script = match parts[2].as_bulk_str() {
                Some(script) => script,
                None => return Ok(RespFrame::error("ERR invalid script")),
            };
            match sub.eval_cache.register(&sub.engines, &script, true) {
                Ok(sha) => Ok(RespFrame::bulk_string(sha)),
                Err(msg) => Ok(RespFrame::error(format!("ERR {}", msg))),
            }
        }
        "KILL" if parts.len() == 2 => match sub.running.kill(KillScope::Script) {
            Ok(()) => Ok(RespFrame::ok()),
            Err(e) => Ok(RespFrame::error(e.to_string())),
        },
        "DEBUG" if parts.len() == 3 => {
            let mode = match parts[2].as_bulk_str() {
                Some(mode) => mode.to_lowercase(),
                None => return Ok(RespFrame::error("ERR Use SCRIPT DEBUG YES/SYNC/NO")),
            };
            match mode.as_str() {
                "no" => {
                    client.lua_debug = false;
                    client.lua_debug_sync = false;
                    Ok(RespFrame::ok())
                }
                "yes" | "sync" => {
                    let conn = client.conn.as_ref().and_then(|c| c.try_clone().ok());
                    if conn.is_none() {
                        return Ok(RespFrame::error(
                            "ERR SCRIPT DEBUG requires a client connection",
                        ));
                    }
                    ldb::enable(conn);
                    client.lua_debug = true;
                    client.lua_debug_sync = mode == "sync";
                    Ok(RespFrame::ok())
                }
                _ => Ok(RespFrame::error("ERR Use SCRIPT DEBUG YES/SYNC/NO")),
            }
        }
        "SHOW" if parts.len() == 3 => {
            let sha = match parts[2].as_bulk_str() {
                Some(sha) if sha.len() == 40 => sha.to_lowercase(),
                _ => return Ok(noscript()),
            };
            match sub.eval_cache.show(&sha) {
                Some(body) => Ok(RespFrame::bulk_string(body)),
                None => Ok(noscript()),
            }
        }
        _ => Ok(RespFrame::error(format!(
            "ERR Unknown SCRIPT subcommand or wrong number of arguments for '{}'",
            subcommand.to_lowercase()
        ))),
    }
}

/// Handle FCALL / FCALL_RO
pub fn handle_fcall(
    sub: &Arc<ScriptingSubsystem>,
    client: &mut ClientContext,
    parts: &[RespFrame],
    read_only_cmd: bool,
) -> Result<RespFrame> {
    if parts.len() < 3 {
        return Ok(wrong_args("fcall"));
    }
    let name = match parts[1].as_bulk_str() {
        Some(name) => name,
        None => return Ok(RespFrame::error("ERR invalid function name")),
    };
    let numkeys = match parts[2]
        .as_bulk_str()
        .and_then(|s| s.parse::<i64>().ok())
    {
        Some(n) if n >= 0 => n as usize,
        Some(_) => return Ok(RespFrame::error("ERR Number of keys can't be negative")),
        None => {
            return Ok(RespFrame::error(
                "ERR value is not an integer or out of range",
            ))
        }
    };
    if numkeys > parts.len() - 3 {
        return Ok(RespFrame::error(
            "ERR Number of keys can't be greater than number of args",
        ));
    }

    let mut keys = Vec::with_capacity(numkeys);
    for frame in &parts[3..3 + numkeys] {
        match frame.as_bulk_bytes() {
            Some(bytes) => keys.push(bytes.to_vec()),
            None => return Ok(RespFrame::error("ERR invalid key")),
        }
    }
    let mut args = Vec::new();
    for frame in &parts[3 + numkeys..] {
        match frame.as_bulk_bytes() {
            Some(bytes) => args.push(bytes.to_vec()),
            None => return Ok(RespFrame::error("ERR invalid argument")),
        }
    }

    let callable = match sub.functions.get(&name) {
        Some(callable) => callable,
        None => return Ok(RespFrame::error("ERR Function not found")),
    };

    let mut base = CommandFlags::empty();
    if read_only_cmd {
        base.insert(CommandFlags::READONLY);
    } else {
        base.insert(CommandFlags::WRITE);
    }
    let folded = fold_command_flags(base, callable.flags);
    if let Err(msg) = check_run_policy(&sub.config, folded) {
        return Ok(RespFrame::error(msg));
    }
    let read_only = read_only_cmd || folded.contains(CommandFlags::READONLY);

    let ctx = ScriptRunCtx::new(
        Arc::clone(&sub.storage),
        client.db,
        callable.flags,
        read_only,
        String::new(),
        false,
    );

    let guard = sub.running.begin(&ctx);
    let reply = callable.engine.call_function(
        &ctx,
        &callable.function,
        ScriptSubsystem::Function,
        &keys,
        &args,
    );
    let killed = ctx.state.is_killed();
    drop(guard);

    if killed {
        return Ok(RespFrame::error(ctx.kill_error().to_string()));
    }
    Ok(reply)
}

/// Handle the FUNCTION container command (the registry-facing slice:
/// LOAD, DELETE, KILL)
pub fn handle_function(
    sub: &Arc<ScriptingSubsystem>,
    _client: &mut ClientContext,
    parts: &[RespFrame],
) -> Result<RespFrame> {
    if parts.len() < 2 {
        return Ok(wrong_args("function"));
    }
    let subcommand = match parts[1].as_bulk_str() {
        Some(subcommand) => subcommand.to_uppercase(),
        None => return Ok(RespFrame::error("ERR invalid subcommand format")),
    };

    match subcommand.as_str() {
        "LOAD" if parts.len() == 3 || parts.len() == 4 => {
            let (replace, body_idx) = if parts.len() == 4 {
                match parts[2].as_bulk_str().map(|s| s.to_uppercase()).as_deref() {
                    Some("REPLACE") => (true, 3),
                    _ => return Ok(RespFrame::error("ERR Unknown option given to FUNCTION LOAD")),
                }
            } else {
                (false, 2)
            };
            let body = match parts[body_idx].as_bulk_str() {
                Some(body) => body,
                None => return Ok(RespFrame::error("ERR invalid function code")),
            };
            let timeout = Duration::from_millis(sub.config.function_load_timeout_ms);
            match sub.functions.load(&sub.engines, &body, replace, timeout) {
                Ok(names) => Ok(RespFrame::array(
                    names.into_iter().map(RespFrame::bulk_string).collect(),
                )),
                Err(msg) => Ok(RespFrame::error(format!("ERR {}", msg))),
            }
        }
        "DELETE" if parts.len() == 3 => {
            let name = match parts[2].as_bulk_str() {
                Some(name) => name,
                None => return Ok(RespFrame::error("ERR invalid function name")),
            };
            if sub.functions.delete(&name) {
                Ok(RespFrame::ok())
            } else {
                Ok(RespFrame::error("ERR Function not found"))
            }
        }
        "KILL" if parts.len() == 2 => match sub.running.kill(KillScope::Function) {
            Ok(()) => Ok(RespFrame::ok()),
            Err(e) => Ok(RespFrame::error(e.to_string())),
        },
        _ => Ok(RespFrame::error(format!(
            "ERR Unknown FUNCTION subcommand or wrong number of arguments for '{}'",
            subcommand.to_lowercase()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptingConfig;
    use crate::storage::StorageEngine;

    fn setup() -> (Arc<ScriptingSubsystem>, ClientContext) {
        let sub = ScriptingSubsystem::new(ScriptingConfig::default(), StorageEngine::new());
        (sub, ClientContext::new())
    }

    fn cmd(parts: &[&str]) -> Vec<RespFrame> {
        parts.iter().map(|p| RespFrame::bulk_string(p)).collect()
    }

    #[test]
    fn test_eval_integer_reply() {
        let (sub, mut client) = setup();
        let reply = handle_eval(&sub, &mut client, &cmd(&["EVAL", "return 1 + 1", "0"])).unwrap();
        assert_eq!(reply, RespFrame::Integer(2));
    }

    #[test]
    fn test_eval_numkeys_validation() {
        let (sub, mut client) = setup();

        let reply = handle_eval(&sub, &mut client, &cmd(&["EVAL", "return 1", "-1"])).unwrap();
        assert!(reply.is_error());

        let reply = handle_eval(&sub, &mut client, &cmd(&["EVAL", "return 1", "3", "k"])).unwrap();
        assert!(reply.is_error());

        let reply = handle_eval(&sub, &mut client, &cmd(&["EVAL", "return 1", "notanum"])).unwrap();
        assert!(reply.is_error());
    }

    #[test]
    fn test_evalsha_roundtrip() {
        let (sub, mut client) = setup();
        let script = "return 'cached'";

        let reply = handle_script(&sub, &mut client, &cmd(&["SCRIPT", "LOAD", script])).unwrap();
        let sha = reply.as_bulk_str().unwrap();
        assert_eq!(sha, sha1_hex(script.as_bytes()));

        let reply = handle_evalsha(&sub, &mut client, &cmd(&["EVALSHA", &sha, "0"])).unwrap();
        assert_eq!(reply, RespFrame::bulk_string("cached"));

        // Uppercase digests are accepted.
        let reply =
            handle_evalsha(&sub, &mut client, &cmd(&["EVALSHA", &sha.to_uppercase(), "0"]))
                .unwrap();
        assert_eq!(reply, RespFrame::bulk_string("cached"));
    }

    #[test]
    fn test_evalsha_wrong_length_digest() {
        let (sub, mut client) = setup();
        for digest in ["abc", &"a".repeat(39), &"a".repeat(41)] {
            let reply =
                handle_evalsha(&sub, &mut client, &cmd(&["EVALSHA", digest, "0"])).unwrap();
            match &reply {
                RespFrame::Error(bytes) => {
                    assert!(String::from_utf8_lossy(bytes).starts_with("NOSCRIPT"))
                }
                other => panic!("expected NOSCRIPT, got {:?}", other),
            }
        }
        assert!(sub.eval_cache.is_empty());
    }

    #[test]
    fn test_evalsha_unknown_digest() {
        let (sub, mut client) = setup();
        let reply =
            handle_evalsha(&sub, &mut client, &cmd(&["EVALSHA", &"b".repeat(40), "0"])).unwrap();
        assert!(reply.is_error());
    }

    #[test]
    fn test_eval_admits_and_script_exists() {
        let (sub, mut client) = setup();
        let script = "return 'ok'";
        handle_eval(&sub, &mut client, &cmd(&["EVAL", script, "0"])).unwrap();

        let sha = sha1_hex(script.as_bytes());
        let reply = handle_script(&sub, &mut client, &cmd(&["SCRIPT", "EXISTS", &sha])).unwrap();
        assert_eq!(reply, RespFrame::array(vec![RespFrame::Integer(1)]));
    }

    #[test]
    fn test_script_show() {
        let (sub, mut client) = setup();
        let script = "return 42";
        let reply = handle_script(&sub, &mut client, &cmd(&["SCRIPT", "LOAD", script])).unwrap();
        let sha = reply.as_bulk_str().unwrap();

        let reply = handle_script(&sub, &mut client, &cmd(&["SCRIPT", "SHOW", &sha])).unwrap();
        assert_eq!(reply, RespFrame::bulk_string(script));

        let reply =
            handle_script(&sub, &mut client, &cmd(&["SCRIPT", "SHOW", &"c".repeat(40)])).unwrap();
        assert!(reply.is_error());
    }

    #[test]
    fn test_script_flush_modes() {
        let (sub, mut client) = setup();
        handle_eval(&sub, &mut client, &cmd(&["EVAL", "return 1", "0"])).unwrap();

        let reply =
            handle_script(&sub, &mut client, &cmd(&["SCRIPT", "FLUSH", "SYNC"])).unwrap();
        assert_eq!(reply, RespFrame::ok());
        assert!(sub.eval_cache.is_empty());

        let reply =
            handle_script(&sub, &mut client, &cmd(&["SCRIPT", "FLUSH", "LATER"])).unwrap();
        assert!(reply.is_error());
    }

    #[test]
    fn test_script_kill_not_busy() {
        let (sub, mut client) = setup();
        let reply = handle_script(&sub, &mut client, &cmd(&["SCRIPT", "KILL"])).unwrap();
        match reply {
            RespFrame::Error(bytes) => {
                assert!(String::from_utf8_lossy(&bytes).starts_with("NOTBUSY"))
            }
            other => panic!("expected NOTBUSY, got {:?}", other),
        }
    }

    #[test]
    fn test_eval_ro_denies_writes() {
        let (sub, mut client) = setup();
        let reply = handle_eval_ro(
            &sub,
            &mut client,
            &cmd(&["EVAL_RO", "return server.call('SET', KEYS[1], 'v')", "1", "k"]),
        )
        .unwrap();
        assert!(reply.is_error());
        assert!(!sub.storage.exists(0, b"k").unwrap());

        let reply = handle_eval(
            &sub,
            &mut client,
            &cmd(&["EVAL", "return server.call('SET', KEYS[1], 'v')", "1", "k"]),
        )
        .unwrap();
        assert!(!reply.is_error());
        assert!(sub.storage.exists(0, b"k").unwrap());
    }

    #[test]
    fn test_readonly_replica_policy() {
        let config = ScriptingConfig {
            is_replica: true,
            replica_read_only: true,
            ..Default::default()
        };
        let sub = ScriptingSubsystem::new(config, StorageEngine::new());
        let mut client = ClientContext::new();

        // A script declaring no-writes runs on the replica.
        let reply = handle_eval(
            &sub,
            &mut client,
            &cmd(&["EVAL", "#!lua flags=no-writes\nreturn 1", "0"]),
        )
        .unwrap();
        assert_eq!(reply, RespFrame::Integer(1));

        // A default script is refused before it runs.
        let reply =
            handle_eval(&sub, &mut client, &cmd(&["EVAL", "return 1", "0"])).unwrap();
        match reply {
            RespFrame::Error(bytes) => {
                assert!(String::from_utf8_lossy(&bytes).starts_with("READONLY"))
            }
            other => panic!("expected READONLY, got {:?}", other),
        }
    }

    #[test]
    fn test_no_cluster_flag_policy() {
        let config = ScriptingConfig {
            cluster_enabled: true,
            ..Default::default()
        };
        let sub = ScriptingSubsystem::new(config, StorageEngine::new());
        let mut client = ClientContext::new();

        let reply = handle_eval(
            &sub,
            &mut client,
            &cmd(&["EVAL", "#!lua flags=no-cluster\nreturn 1", "0"]),
        )
        .unwrap();
        assert!(reply.is_error());
    }

    #[test]
    fn test_shebang_compile_errors() {
        let (sub, mut client) = setup();

        let reply = handle_eval(
            &sub,
            &mut client,
            &cmd(&["EVAL", "#!lua flags=made-up\nreturn 1", "0"]),
        )
        .unwrap();
        assert!(reply.is_error());

        let reply = handle_eval(
            &sub,
            &mut client,
            &cmd(&["EVAL", "#!nosuchengine\nreturn 1", "0"]),
        )
        .unwrap();
        match reply {
            RespFrame::Error(bytes) => {
                assert!(String::from_utf8_lossy(&bytes).contains("Could not find scripting engine"))
            }
            other => panic!("expected engine error, got {:?}", other),
        }
        assert!(sub.eval_cache.is_empty());
    }

    #[test]
    fn test_function_load_and_fcall() {
        let (sub, mut client) = setup();

        let reply = handle_function(
            &sub,
            &mut client,
            &cmd(&[
                "FUNCTION",
                "LOAD",
                "#!lua\nserver.register_function('double', function(keys, args) \
                 return tonumber(args[1]) * 2 end)",
            ]),
        )
        .unwrap();
        assert_eq!(reply, RespFrame::array(vec![RespFrame::bulk_string("double")]));

        let reply =
            handle_fcall(&sub, &mut client, &cmd(&["FCALL", "double", "0", "21"]), false).unwrap();
        assert_eq!(reply, RespFrame::Integer(42));

        let reply = handle_function(&sub, &mut client, &cmd(&["FUNCTION", "DELETE", "double"]))
            .unwrap();
        assert_eq!(reply, RespFrame::ok());

        let reply =
            handle_fcall(&sub, &mut client, &cmd(&["FCALL", "double", "0", "21"]), false).unwrap();
        assert!(reply.is_error());
    }

    #[test]
    fn test_script_debug_arming_requires_connection() {
        let (sub, mut client) = setup();
        let reply =
            handle_script(&sub, &mut client, &cmd(&["SCRIPT", "DEBUG", "YES"])).unwrap();
        assert!(reply.is_error());
        assert!(!client.lua_debug);

        let reply = handle_script(&sub, &mut client, &cmd(&["SCRIPT", "DEBUG", "NO"])).unwrap();
        assert_eq!(reply, RespFrame::ok());

        let reply =
            handle_script(&sub, &mut client, &cmd(&["SCRIPT", "DEBUG", "MAYBE"])).unwrap();
        assert!(reply.is_error());
    }
}
