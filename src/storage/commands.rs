//! Command router for script-issued commands
//!
//! `server.call`, the HELLO engine tests and the debugger prompt all
//! funnel server commands through here. Errors a client would see are
//! returned as RESP error frames; `Err` is reserved for internal
//! failures.

use std::sync::Arc;

use super::engine::{DatabaseIndex, StorageEngine};
use crate::protocol::resp::RespFrame;
use crate::error::Result;

/// Commands scripts may never issue, regardless of flags.
const DENIED_IN_SCRIPTS: &[&str] = &[
    "EVAL", "EVALSHA", "EVAL_RO", "EVALSHA_RO", "SCRIPT", "FCALL", "FCALL_RO", "FUNCTION",
    "MULTI", "EXEC", "DISCARD", "WATCH", "UNWATCH", "SELECT", "SUBSCRIBE", "UNSUBSCRIBE",
];

/// Return true if `name` (uppercased) denotes a command that writes to the keyspace.
pub fn is_write_command(name: &str) -> bool {
    matches!(
        name,
        "SET" | "DEL" | "INCR" | "DECR" | "INCRBY" | "DECRBY" | "FLUSHDB"
    )
}

/// Execute a script-issued command against the storage engine.
///
/// `read_only` reflects the run context: write commands are refused
/// when it is set.
pub fn execute(
    storage: &Arc<StorageEngine>,
    db: DatabaseIndex,
    args: &[Vec<u8>],
    read_only: bool,
) -> Result<RespFrame> {
    if args.is_empty() {
        return Ok(RespFrame::error("ERR no command specified"));
    }

    let name = String::from_utf8_lossy(&args[0]).to_uppercase();

    if DENIED_IN_SCRIPTS.contains(&name.as_str()) {
        return Ok(RespFrame::error(format!(
            "ERR This command is not allowed from script: '{}'",
            name.to_lowercase()
        )));
    }

    if read_only && is_write_command(&name) {
        return Ok(RespFrame::error(
            "ERR Write commands are not allowed from read-only scripts.",
        ));
    }

    match name.as_str() {
        "PING" => match args.len() {
            1 => Ok(RespFrame::simple_string("PONG")),
            2 => Ok(RespFrame::bulk_string(&args[1])),
            _ => Ok(wrong_args("ping")),
        },
        "ECHO" => {
            if args.len() != 2 {
                return Ok(wrong_args("echo"));
            }
            Ok(RespFrame::bulk_string(&args[1]))
        }
        "SET" => handle_set(storage, db, args),
        "GET" => {
            if args.len() != 2 {
                return Ok(wrong_args("get"));
            }
            match storage.get_string(db, &args[1])? {
                Some(value) => Ok(RespFrame::bulk_string(value)),
                None => Ok(RespFrame::null_bulk()),
            }
        }
        "DEL" => {
            if args.len() < 2 {
                return Ok(wrong_args("del"));
            }
            let mut deleted = 0;
            for key in &args[1..] {
                if storage.delete(db, key)? {
                    deleted += 1;
                }
            }
            Ok(RespFrame::Integer(deleted))
        }
        "EXISTS" => {
            if args.len() < 2 {
                return Ok(wrong_args("exists"));
            }
            let mut count = 0;
            for key in &args[1..] {
                if storage.exists(db, key)? {
                    count += 1;
                }
            }
            Ok(RespFrame::Integer(count))
        }
        "INCR" | "DECR" => {
            if args.len() != 2 {
                return Ok(wrong_args(&name.to_lowercase()));
            }
            let delta = if name == "INCR" { 1 } else { -1 };
            incr_reply(storage, db, args[1].clone(), delta)
        }
        "INCRBY" | "DECRBY" => {
            if args.len() != 3 {
                return Ok(wrong_args(&name.to_lowercase()));
            }
            let raw = String::from_utf8_lossy(&args[2]);
            let delta = match raw.parse::<i64>() {
                Ok(n) => n,
                Err(_) => {
                    return Ok(RespFrame::error(
                        "ERR value is not an integer or out of range",
                    ))
                }
            };
            let delta = if name == "DECRBY" { -delta } else { delta };
            incr_reply(storage, db, args[1].clone(), delta)
        }
        "FLUSHDB" => {
            storage.flush_db(db)?;
            Ok(RespFrame::ok())
        }
        "DBSIZE" => Ok(RespFrame::Integer(storage.key_count(db)? as i64)),
        _ => Ok(RespFrame::error(format!(
            "ERR unknown command '{}'",
            name.to_lowercase()
        ))),
    }
}

fn wrong_args(cmd: &str) -> RespFrame {
    RespFrame::error(format!(
        "ERR wrong number of arguments for '{}' command",
        cmd
    ))
}

fn incr_reply(
    storage: &Arc<StorageEngine>,
    db: DatabaseIndex,
    key: Vec<u8>,
    delta: i64,
) -> Result<RespFrame> {
    match storage.incr_by(db, key, delta) {
        Ok(value) => Ok(RespFrame::Integer(value)),
        Err(e) => Ok(RespFrame::error(e.to_string())),
    }
}

fn handle_set(
    storage: &Arc<StorageEngine>,
    db: DatabaseIndex,
    args: &[Vec<u8>],
) -> Result<RespFrame> {
    if args.len() < 3 {
        return Ok(wrong_args("set"));
    }

    let mut nx = false;
    let mut xx = false;
    for option in &args[3..] {
        match String::from_utf8_lossy(option).to_uppercase().as_str() {
            "NX" => nx = true,
            "XX" => xx = true,
            _ => return Ok(RespFrame::error("ERR syntax error")),
        }
    }

    if nx && storage.exists(db, &args[1])? {
        return Ok(RespFrame::null_bulk());
    }
    if xx && !storage.exists(db, &args[1])? {
        return Ok(RespFrame::null_bulk());
    }

    storage.set_string(db, args[1].clone(), args[2].clone())?;
    Ok(RespFrame::ok())
}
