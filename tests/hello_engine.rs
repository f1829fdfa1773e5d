//! The HELLO stack VM exercised through the full dispatch path

use std::sync::Arc;
use std::time::{Duration, Instant};

use hematite::engines::hello::{HelloEngine, HELLO_ENGINE_NAME};
use hematite::protocol::resp::RespFrame;
use hematite::scripting::dispatcher::{
    handle_eval, handle_fcall, handle_function, handle_script, ClientContext,
};
use hematite::scripting::ENGINE_ABI_VERSION;
use hematite::{ScriptingConfig, ScriptingSubsystem, StorageEngine};

fn setup() -> (Arc<ScriptingSubsystem>, ClientContext) {
    let sub = ScriptingSubsystem::new(ScriptingConfig::default(), StorageEngine::new());
    sub.register_engine(
        HELLO_ENGINE_NAME,
        None,
        ENGINE_ABI_VERSION,
        Box::new(HelloEngine::new()),
    )
    .unwrap();
    (sub, ClientContext::new())
}

fn cmd(parts: &[&str]) -> Vec<RespFrame> {
    parts.iter().map(|p| RespFrame::bulk_string(p)).collect()
}

#[test]
fn test_eval_hello_script() {
    let (sub, mut client) = setup();
    let reply = handle_eval(
        &sub,
        &mut client,
        &cmd(&["EVAL", "#!hello\nFUNCTION f CONSTI 42 RETURN", "0"]),
    )
    .unwrap();
    assert_eq!(reply, RespFrame::Integer(42));
}

#[test]
fn test_function_load_then_fcall_with_argument() {
    let (sub, mut client) = setup();

    let reply = handle_function(
        &sub,
        &mut client,
        &cmd(&["FUNCTION", "LOAD", "#!hello\nFUNCTION foo ARGS 0 RETURN"]),
    )
    .unwrap();
    assert_eq!(reply, RespFrame::array(vec![RespFrame::bulk_string("foo")]));

    let reply = handle_fcall(&sub, &mut client, &cmd(&["FCALL", "foo", "0", "7"]), false).unwrap();
    assert_eq!(reply, RespFrame::Integer(7));
}

#[test]
fn test_fcall_unknown_function() {
    let (sub, mut client) = setup();
    let reply = handle_fcall(&sub, &mut client, &cmd(&["FCALL", "ghost", "0"]), false).unwrap();
    assert!(reply.is_error());
}

#[test]
fn test_function_kill_during_sleep() {
    let (sub, mut client) = setup();

    handle_function(
        &sub,
        &mut client,
        &cmd(&[
            "FUNCTION",
            "LOAD",
            "#!hello\nFUNCTION baz CONSTI 5 SLEEP CONSTI 0 RETURN",
        ]),
    )
    .unwrap();

    let killer_sub = Arc::clone(&sub);
    let killer = std::thread::spawn(move || {
        let mut killer_client = ClientContext::new();
        std::thread::sleep(Duration::from_millis(100));
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let reply = handle_function(
                &killer_sub,
                &mut killer_client,
                &cmd(&["FUNCTION", "KILL"]),
            )
            .unwrap();
            if reply == RespFrame::ok() || Instant::now() > deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    });

    let start = Instant::now();
    let reply = handle_fcall(&sub, &mut client, &cmd(&["FCALL", "baz", "0"]), false).unwrap();
    killer.join().unwrap();
    let elapsed = start.elapsed();

    match &reply {
        RespFrame::Error(bytes) => {
            let msg = String::from_utf8_lossy(bytes);
            assert!(msg.contains("FUNCTION KILL"), "unexpected error: {}", msg);
        }
        other => panic!("expected kill error, got {:?}", other),
    }
    // The sleep polls every millisecond; the 5s sleep must not finish.
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
}

#[test]
fn test_script_kill_error_names_script_kill_for_eval() {
    let (sub, mut client) = setup();

    let killer_sub = Arc::clone(&sub);
    let killer = std::thread::spawn(move || {
        let mut killer_client = ClientContext::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            std::thread::sleep(Duration::from_millis(20));
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

    let reply = handle_eval(
        &sub,
        &mut client,
        &cmd(&["EVAL", "#!hello\nFUNCTION slow CONSTI 5 SLEEP CONSTI 0 RETURN", "0"]),
    )
    .unwrap();
    killer.join().unwrap();

    match &reply {
        RespFrame::Error(bytes) => {
            let msg = String::from_utf8_lossy(bytes);
            assert!(msg.contains("SCRIPT KILL"), "unexpected error: {}", msg);
        }
        other => panic!("expected kill error, got {:?}", other),
    }
}

#[test]
fn test_unregister_hello_engine_drops_its_functions() {
    let (sub, mut client) = setup();
    handle_function(
        &sub,
        &mut client,
        &cmd(&["FUNCTION", "LOAD", "#!hello\nFUNCTION foo CONSTI 1 RETURN"]),
    )
    .unwrap();
    assert_eq!(sub.functions.len(), 1);

    sub.unregister_engine("hello").unwrap();
    assert!(sub.functions.is_empty());

    let reply = handle_eval(
        &sub,
        &mut client,
        &cmd(&["EVAL", "#!hello\nFUNCTION f CONSTI 1 RETURN", "0"]),
    )
    .unwrap();
    assert!(reply.is_error());
}
