//! End-to-end tests for the scripting dispatcher over the Lua engine

use std::sync::Arc;
use std::time::{Duration, Instant};

use hematite::protocol::resp::RespFrame;
use hematite::scripting::dispatcher::{
    handle_eval, handle_eval_ro, handle_evalsha, handle_script, ClientContext,
};
use hematite::scripting::eval_cache::{sha1_hex, LRU_LIST_LENGTH};
use hematite::{ScriptingConfig, ScriptingSubsystem, StorageEngine};

fn setup() -> (Arc<ScriptingSubsystem>, ClientContext) {
    let sub = ScriptingSubsystem::new(ScriptingConfig::default(), StorageEngine::new());
    (sub, ClientContext::new())
}

fn cmd(parts: &[&str]) -> Vec<RespFrame> {
    parts.iter().map(|p| RespFrame::bulk_string(p)).collect()
}

fn error_text(frame: &RespFrame) -> String {
    match frame {
        RespFrame::Error(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        other => panic!("expected error frame, got {:?}", other),
    }
}

#[test]
fn test_eval_with_explicit_engine_tag() {
    let (sub, mut client) = setup();
    let reply = handle_eval(
        &sub,
        &mut client,
        &cmd(&["EVAL", "#!lua \nreturn 1+1", "0"]),
    )
    .unwrap();
    assert_eq!(reply, RespFrame::Integer(2));
}

#[test]
fn test_eval_then_script_exists() {
    let (sub, mut client) = setup();
    let script = "return 'ok'";
    let reply = handle_eval(&sub, &mut client, &cmd(&["EVAL", script, "0"])).unwrap();
    assert_eq!(reply, RespFrame::bulk_string("ok"));

    let digest = sha1_hex(script.as_bytes());
    let reply = handle_script(&sub, &mut client, &cmd(&["SCRIPT", "EXISTS", &digest])).unwrap();
    assert_eq!(reply, RespFrame::array(vec![RespFrame::Integer(1)]));
}

#[test]
fn test_script_load_show_roundtrip() {
    let (sub, mut client) = setup();
    let body = "-- a comment\nreturn 7";

    let reply = handle_script(&sub, &mut client, &cmd(&["SCRIPT", "LOAD", body])).unwrap();
    let digest = reply.as_bulk_str().unwrap();
    assert_eq!(digest, sha1_hex(body.as_bytes()));

    let reply = handle_script(&sub, &mut client, &cmd(&["SCRIPT", "SHOW", &digest])).unwrap();
    assert_eq!(reply.as_bulk_str().as_deref(), Some(body));
}

#[test]
fn test_keys_and_args_reach_script() {
    let (sub, mut client) = setup();
    let reply = handle_eval(
        &sub,
        &mut client,
        &cmd(&[
            "EVAL",
            "return {KEYS[1], KEYS[2], ARGV[1]}",
            "2",
            "k1",
            "k2",
            "v1",
        ]),
    )
    .unwrap();
    assert_eq!(
        reply,
        RespFrame::array(vec![
            RespFrame::bulk_string("k1"),
            RespFrame::bulk_string("k2"),
            RespFrame::bulk_string("v1"),
        ])
    );
}

#[test]
fn test_script_writes_are_visible() {
    let (sub, mut client) = setup();
    handle_eval(
        &sub,
        &mut client,
        &cmd(&["EVAL", "server.call('SET', KEYS[1], ARGV[1]) return 1", "1", "greeting", "hello"]),
    )
    .unwrap();
    assert_eq!(
        sub.storage.get_string(0, b"greeting").unwrap(),
        Some(b"hello".to_vec())
    );
}

#[test]
fn test_eval_ro_is_strict() {
    let (sub, mut client) = setup();
    let reply = handle_eval_ro(
        &sub,
        &mut client,
        &cmd(&["EVAL_RO", "return server.call('SET', KEYS[1], 'v')", "1", "k"]),
    )
    .unwrap();
    assert!(reply.is_error());
    assert!(!sub.storage.exists(0, b"k").unwrap());
}

#[test]
fn test_evicts_oldest_but_keeps_loaded_scripts() {
    let (sub, mut client) = setup();

    // A script admitted via SCRIPT LOAD is never evicted.
    let loaded_body = "return 'loaded'";
    let reply = handle_script(&sub, &mut client, &cmd(&["SCRIPT", "LOAD", loaded_body])).unwrap();
    let loaded = reply.as_bulk_str().unwrap();

    // Fill the LRU list with distinct EVAL scripts.
    let mut digests = Vec::new();
    for i in 0..LRU_LIST_LENGTH {
        let body = format!("return {}", i);
        let reply = handle_eval(&sub, &mut client, &cmd(&["EVAL", &body, "0"])).unwrap();
        assert!(!reply.is_error());
        digests.push(sha1_hex(body.as_bytes()));
    }
    assert_eq!(sub.eval_cache.evicted_scripts(), 0);

    // One more EVAL evicts exactly the oldest EVAL-admitted script.
    let last_body = format!("return {}", LRU_LIST_LENGTH);
    handle_eval(&sub, &mut client, &cmd(&["EVAL", &last_body, "0"])).unwrap();
    let last = sha1_hex(last_body.as_bytes());
    assert_eq!(sub.eval_cache.evicted_scripts(), 1);

    let reply = handle_script(
        &sub,
        &mut client,
        &cmd(&["SCRIPT", "EXISTS", &loaded, &digests[0], &digests[1], &last]),
    )
    .unwrap();
    assert_eq!(
        reply,
        RespFrame::array(vec![
            RespFrame::Integer(1),
            RespFrame::Integer(0),
            RespFrame::Integer(1),
            RespFrame::Integer(1),
        ])
    );
    sub.eval_cache.check_invariants();
}

#[test]
fn test_script_flush_async_then_eval() {
    let (sub, mut client) = setup();
    for i in 0..10 {
        handle_eval(&sub, &mut client, &cmd(&["EVAL", &format!("return {}", i), "0"])).unwrap();
    }

    let reply = handle_script(&sub, &mut client, &cmd(&["SCRIPT", "FLUSH", "ASYNC"])).unwrap();
    assert_eq!(reply, RespFrame::ok());
    assert!(sub.eval_cache.is_empty());

    // The replacement environment accepts compiles immediately.
    let reply = handle_eval(&sub, &mut client, &cmd(&["EVAL", "return 99", "0"])).unwrap();
    assert_eq!(reply, RespFrame::Integer(99));

    sub.lazyfree.drain();
}

#[test]
fn test_flush_resets_engine_eval_memory_sources() {
    let (sub, mut client) = setup();
    handle_eval(&sub, &mut client, &cmd(&["EVAL", "return 1", "0"])).unwrap();

    handle_script(&sub, &mut client, &cmd(&["SCRIPT", "FLUSH", "SYNC"])).unwrap();
    assert_eq!(sub.eval_cache.len(), 0);
    assert_eq!(sub.eval_scripts_memory(), 0);
}

#[test]
fn test_script_kill_interrupts_running_script() {
    let (sub, mut client) = setup();

    let killer_sub = Arc::clone(&sub);
    let killer = std::thread::spawn(move || {
        let mut killer_client = ClientContext::new();
        // Retry until the script is actually running.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            std::thread::sleep(Duration::from_millis(50));
            let reply = handle_script(
                &killer_sub,
                &mut killer_client,
                &cmd(&["SCRIPT", "KILL"]),
            )
            .unwrap();
            if reply == RespFrame::ok() || Instant::now() > deadline {
                break;
            }
        }
    });

    let start = Instant::now();
    let reply = handle_eval(
        &sub,
        &mut client,
        &cmd(&["EVAL", "local i = 0 while true do i = i + 1 end", "0"]),
    )
    .unwrap();
    killer.join().unwrap();

    let msg = error_text(&reply);
    assert!(msg.contains("SCRIPT KILL"), "unexpected error: {}", msg);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_shebang_without_newline_fails_compilation() {
    let (sub, mut client) = setup();
    let reply = handle_eval(
        &sub,
        &mut client,
        &cmd(&["EVAL", "#!lua flags=no-writes", "0"]),
    )
    .unwrap();
    let msg = error_text(&reply);
    assert!(msg.contains("Invalid script shebang"), "{}", msg);
    assert!(sub.eval_cache.is_empty());
}

#[test]
fn test_lua_error_includes_message() {
    let (sub, mut client) = setup();
    let reply = handle_eval(
        &sub,
        &mut client,
        &cmd(&["EVAL", "error('user failure')", "0"]),
    )
    .unwrap();
    let msg = error_text(&reply);
    assert!(msg.contains("user failure"), "{}", msg);
}

#[test]
fn test_shutdown_flushes_everything() {
    let (sub, mut client) = setup();
    for i in 0..5 {
        handle_eval(&sub, &mut client, &cmd(&["EVAL", &format!("return {}", i), "0"])).unwrap();
    }
    sub.shutdown();
    assert!(sub.eval_cache.is_empty());
}
