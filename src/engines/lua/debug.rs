//! LDB: the Lua script debugger
//!
//! Line-oriented interactive debugging for EVAL scripts. A session
//! either forks (mutations discarded, server stays available) or runs
//! synchronously in-process (server blocked, mutations persist). The
//! debugger owns direct, blocking I/O on the client connection for the
//! session duration.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use lazy_static::lazy_static;
use mlua::{Function, Lua, MultiValue, Table, Value, VmState};

use super::api;
use crate::protocol::resp::RespFrame;
use crate::protocol::serializer::serialize_to_vec;
use crate::storage::commands;

/// Max number of breakpoints
pub const LDB_BREAKPOINTS_MAX: usize = 64;

/// Default length limit for replies / var dumps
pub const LDB_MAX_LEN_DEFAULT: usize = 256;

/// Recursion bound for value rendering
const LDB_MAX_VALUES_DEPTH: usize = 10;

/// Named registry slots where the engine stashes debug introspection
/// entry points before sandboxing (see `LuaEngine::init_state`).
pub(super) const REG_GETLOCAL: &str = "__ldb_getlocal";
pub(super) const REG_GETINFO: &str = "__ldb_getinfo";

/// Debugger shared state. A singleton: at most one session exists at a
/// time (per process; forked children each own their copy).
struct LdbState {
    /// Connection of the debugging client
    conn: Option<TcpStream>,

    /// Are we debugging EVAL right now?
    active: bool,

    /// Is this a fork()ed debugging session?
    forked: bool,

    /// Messages pending delivery to the client
    logs: Vec<String>,

    /// PIDs of all forked debugging sessions
    children: Vec<i32>,

    /// Breakpoint line numbers
    bp: Vec<i32>,

    /// Stop at next line regardless of breakpoints
    step: bool,

    /// Stop at next line because server.breakpoint() was called
    luabp: bool,

    /// Script source split by line
    src: Vec<String>,

    /// Current line number
    currentline: i32,

    /// Debugger client command buffer
    cbuf: Vec<u8>,

    /// Max var dump / reply length (0 = unlimited)
    maxlen: usize,

    /// Did we already hint about "maxlen 0"?
    maxlen_hint_sent: bool,

    /// The prompt is running; suppress hook re-entry
    in_prompt: bool,
}

impl LdbState {
    fn new() -> Self {
        LdbState {
            conn: None,
            active: false,
            forked: false,
            logs: Vec::new(),
            children: Vec::new(),
            bp: Vec::new(),
            step: false,
            luabp: false,
            src: Vec::new(),
            currentline: -1,
            cbuf: Vec::new(),
            maxlen: LDB_MAX_LEN_DEFAULT,
            maxlen_hint_sent: false,
            in_prompt: false,
        }
    }

    fn log(&mut self, entry: String) {
        self.logs.push(entry);
    }

    /// Log with the reply cap applied; emit the one-time trimming hint.
    fn log_with_maxlen(&mut self, mut entry: String) {
        let mut trimmed = false;
        if self.maxlen > 0 && entry.len() > self.maxlen {
            entry.truncate(self.maxlen);
            entry.push_str(" ...");
            trimmed = true;
        }
        self.log(entry);
        if trimmed && !self.maxlen_hint_sent {
            self.maxlen_hint_sent = true;
            self.log("<hint> The above reply was trimmed. Use 'maxlen 0' to disable trimming.".to_string());
        }
    }

    /// Send pending logs as a multi-bulk of simple strings. Embedded
    /// CR/LF become spaces. Entries are consumed either way.
    fn send_logs(&mut self) {
        let entries: Vec<String> = self.logs.drain(..).collect();
        let conn = match &self.conn {
            Some(conn) => conn,
            None => return,
        };

        let mut proto = format!("*{}\r\n", entries.len()).into_bytes();
        for entry in entries {
            let clean = entry.replace('\r', " ").replace('\n', " ");
            proto.push(b'+');
            proto.extend_from_slice(clean.as_bytes());
            proto.extend_from_slice(b"\r\n");
        }
        // Write errors surface on the next read, which ends the session.
        let mut writer = conn;
        let _ = writer.write_all(&proto);
    }

    fn is_breakpoint(&self, line: i32) -> bool {
        self.bp.contains(&line)
    }

    /// Add a breakpoint. Fails on invalid lines or when the table is full.
    fn add_breakpoint(&mut self, line: i32) -> bool {
        if line <= 0 || line > self.src.len() as i32 {
            return false;
        }
        if !self.is_breakpoint(line) && self.bp.len() != LDB_BREAKPOINTS_MAX {
            self.bp.push(line);
            return true;
        }
        self.is_breakpoint(line)
    }

    fn del_breakpoint(&mut self, line: i32) -> bool {
        match self.bp.iter().position(|&b| b == line) {
            Some(idx) => {
                self.bp.remove(idx);
                true
            }
            None => false,
        }
    }

    /// One-based source line, with a placeholder for out of range lines
    fn source_line(&self, line: i32) -> &str {
        let idx = line - 1;
        if idx < 0 || idx as usize >= self.src.len() {
            return "<out of range source code line>";
        }
        &self.src[idx as usize]
    }

    fn log_source_line(&mut self, line: i32) {
        let bp = self.is_breakpoint(line);
        let current = self.currentline == line;
        let prefix = match (current, bp) {
            (true, true) => "->#",
            (true, false) => "-> ",
            (false, true) => "  #",
            (false, false) => "   ",
        };
        let entry = format!("{}{:<3} {}", prefix, line, self.source_line(line));
        self.log(entry);
    }

    /// List the source around a line; `around == 0` lists everything.
    fn list(&mut self, around: i32, context: i32) {
        for line in 1..=self.src.len() as i32 {
            if around != 0 && (around - line).abs() > context {
                continue;
            }
            self.log_source_line(line);
        }
    }
}

lazy_static! {
    static ref LDB: Mutex<LdbState> = Mutex::new(LdbState::new());
}

/// How a session start resolved
pub enum SessionStart {
    /// Execute the script under the debugger
    Proceed,

    /// Forked parent: the child runs the session, close the client
    ParentClosedClient,

    /// fork() failed
    ForkFailed(String),
}

/// Outcome of a prompt interaction
enum ReplOutcome {
    /// Resume script execution
    Resume,

    /// Terminate the script with an error
    Abort(String),

    /// Client went away; keep running without stops
    Disconnected,
}

/// Arm the debugger for a client connection (SCRIPT DEBUG YES|SYNC).
/// Session fields reset; forked-children bookkeeping survives.
pub fn enable(conn: Option<TcpStream>) {
    let mut ldb = LDB.lock().unwrap();
    ldb.logs.clear();
    ldb.conn = conn;
    ldb.step = true;
    ldb.bp.clear();
    ldb.luabp = false;
    ldb.cbuf.clear();
    ldb.maxlen = LDB_MAX_LEN_DEFAULT;
    ldb.maxlen_hint_sent = false;
    ldb.in_prompt = false;
}

/// True while a debugging session is executing a script
pub fn is_active() -> bool {
    LDB.lock().unwrap().active
}

/// True when the debugger is active and stepping (used to decide
/// whether script-issued commands should be logged)
pub fn is_active_and_stepping() -> bool {
    let ldb = LDB.lock().unwrap();
    ldb.active && ldb.step
}

/// `server.breakpoint()`: break on the next line. Inert outside a session.
pub fn request_breakpoint() -> bool {
    let mut ldb = LDB.lock().unwrap();
    if ldb.active {
        ldb.luabp = true;
        true
    } else {
        false
    }
}

/// `server.debug(...)`: log values to the debugger console
pub fn log_script_debug(_lua: &Lua, args: MultiValue) {
    let mut ldb = LDB.lock().unwrap();
    if !ldb.active {
        return;
    }
    let mut entry = format!("<debug> line {}: ", ldb.currentline);
    for (i, value) in args.into_iter().enumerate() {
        if i > 0 {
            entry.push_str(", ");
        }
        cat_value(&mut entry, &value, 0);
    }
    ldb.log_with_maxlen(entry);
}

/// Log a command a script issued while stepping
pub fn log_issued_command(argv: &[Vec<u8>]) {
    let mut ldb = LDB.lock().unwrap();
    let rendered: Vec<String> = argv
        .iter()
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect();
    let entry = format!("<redis> {}", rendered.join(" "));
    ldb.log_with_maxlen(entry);
}

/// Log a command reply in human readable form
pub fn log_command_reply(frame: &RespFrame) {
    let mut ldb = LDB.lock().unwrap();
    let mut entry = String::from("<reply> ");
    entry.push_str(&resp_to_human(frame));
    ldb.log_with_maxlen(entry);
}

/// Start a debugging session before the EVAL call.
///
/// In forked mode the child proceeds and the parent records the child
/// PID and closes the client. The caller must call `end_session` only
/// when `Proceed` was returned.
pub fn start_session(source: &str, sync: bool, send_timeout_ms: u64) -> SessionStart {
    let mut ldb = LDB.lock().unwrap();
    ldb.forked = !sync;

    if ldb.forked {
        let pid = unsafe { libc::fork() };
        if pid == -1 {
            return SessionStart::ForkFailed(std::io::Error::last_os_error().to_string());
        }
        if pid == 0 {
            // Child: ignore the signals the parent handles.
            unsafe {
                libc::signal(libc::SIGTERM, libc::SIG_IGN);
                libc::signal(libc::SIGINT, libc::SIG_IGN);
            }
            println!("Forked for debugging eval");
        } else {
            ldb.children.push(pid);
            return SessionStart::ParentClosedClient;
        }
    } else {
        println!("Synchronous debugging eval session started");
    }

    if let Some(conn) = &ldb.conn {
        let _ = conn.set_nonblocking(false);
        let _ = conn.set_write_timeout(Some(Duration::from_millis(send_timeout_ms)));
    }
    ldb.active = true;

    // The source is accessed by the debugger line by line.
    let trimmed = source.trim_end_matches(['\n', '\r']);
    ldb.src = trimmed.split('\n').map(|line| line.to_string()).collect();
    ldb.currentline = -1;

    SessionStart::Proceed
}

/// End a debugging session after the EVAL call returned.
///
/// The forked child writes the final reply itself and exits; the
/// synchronous path restores the connection and asks the caller to
/// close the client after the reply.
pub fn end_session(reply: &RespFrame) {
    let mut ldb = LDB.lock().unwrap();
    ldb.log("<endsession>".to_string());
    ldb.send_logs();

    if ldb.forked {
        if let Some(conn) = &ldb.conn {
            if let Ok(bytes) = serialize_to_vec(reply) {
                let mut writer = conn;
                let _ = writer.write_all(&bytes);
            }
        }
        println!("Lua debugging session child exiting");
        let _ = std::io::stdout().flush();
        unsafe { libc::_exit(0) };
    }

    println!("Synchronous debugging eval session ended");
    if let Some(conn) = &ldb.conn {
        let _ = conn.set_write_timeout(None);
    }
    ldb.src.clear();
    ldb.active = false;
    ldb.conn = None;
}

/// Remove a terminated child from the forked-session list
pub fn remove_child(pid: i32) -> bool {
    let mut ldb = LDB.lock().unwrap();
    match ldb.children.iter().position(|&p| p == pid) {
        Some(idx) => {
            ldb.children.remove(idx);
            true
        }
        None => false,
    }
}

/// Number of forked sessions not yet reaped
pub fn pending_children() -> usize {
    LDB.lock().unwrap().children.len()
}

/// Kill every forked debugging session (server shutdown path)
pub fn kill_forked_sessions() {
    let mut ldb = LDB.lock().unwrap();
    for pid in ldb.children.drain(..) {
        println!("Killing debugging session {}", pid);
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

/// The engine's line hook entry point: decide whether to stop at this
/// line, and run the prompt when we do.
pub fn line_hook(lua: &Lua, line: i32) -> mlua::Result<VmState> {
    {
        let mut ldb = LDB.lock().unwrap();
        if !ldb.active || ldb.in_prompt {
            return Ok(VmState::Continue);
        }
        ldb.currentline = line;

        let bp = ldb.is_breakpoint(line);
        if !(ldb.step || ldb.luabp || bp) {
            return Ok(VmState::Continue);
        }

        let reason = if ldb.luabp {
            "server.breakpoint() called"
        } else if ldb.step {
            "step over"
        } else {
            "break point"
        };
        ldb.step = false;
        ldb.luabp = false;
        ldb.log(format!("* Stopped at {}, stop reason = {}", line, reason));
        ldb.log_source_line(line);
        ldb.send_logs();
        ldb.in_prompt = true;
    }

    let outcome = repl(lua);
    LDB.lock().unwrap().in_prompt = false;

    match outcome {
        ReplOutcome::Resume => Ok(VmState::Continue),
        ReplOutcome::Disconnected => Ok(VmState::Continue),
        ReplOutcome::Abort(msg) => Err(mlua::Error::RuntimeError(msg)),
    }
}

/// Parse a multi-bulk command from the debugger client buffer.
///
/// Deliberately forgiving: arrays of at most 1024 bulk strings, each at
/// most 1024 bytes. `Ok(None)` means more data is needed; `Err` is a
/// protocol error.
fn parse_repl_command(cbuf: &[u8]) -> Result<Option<Vec<String>>, ()> {
    if cbuf.is_empty() {
        return Ok(None);
    }

    let star = match cbuf.iter().position(|&b| b == b'*') {
        Some(pos) => pos,
        None => return Err(()),
    };
    let mut pos = star + 1;

    let (argc, next) = match read_number_crlf(cbuf, pos) {
        Some(parsed) => parsed,
        None => return Ok(None),
    };
    pos = next;
    if argc <= 0 || argc > 1024 {
        return Err(());
    }

    let mut argv = Vec::with_capacity(argc as usize);
    while (argv.len() as i64) < argc {
        if pos >= cbuf.len() {
            return Ok(None);
        }
        if cbuf[pos] != b'$' {
            return Err(());
        }
        let (slen, next) = match read_number_crlf(cbuf, pos + 1) {
            Some(parsed) => parsed,
            None => return Ok(None),
        };
        pos = next;
        if slen <= 0 || slen > 1024 {
            return Err(());
        }
        let slen = slen as usize;
        if pos + slen + 2 > cbuf.len() {
            return Ok(None);
        }
        argv.push(String::from_utf8_lossy(&cbuf[pos..pos + slen]).into_owned());
        pos += slen;
        if &cbuf[pos..pos + 2] != b"\r\n" {
            return Err(());
        }
        pos += 2;
    }

    Ok(Some(argv))
}

/// Read an integer terminated by CRLF starting at `pos`. Returns the
/// value and the position after the CRLF, or None if incomplete.
fn read_number_crlf(buf: &[u8], pos: usize) -> Option<(i64, usize)> {
    let rest = &buf[pos.min(buf.len())..];
    let crlf = rest.windows(2).position(|w| w == b"\r\n")?;
    let number = std::str::from_utf8(&rest[..crlf])
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .unwrap_or(0);
    Some((number, pos + crlf + 2))
}

/// Read debugger commands until one resumes execution
fn repl(lua: &Lua) -> ReplOutcome {
    loop {
        // Accumulate input until a full command is buffered.
        let argv = loop {
            let parsed = {
                let ldb = LDB.lock().unwrap();
                parse_repl_command(&ldb.cbuf)
            };
            match parsed {
                Err(()) => return ReplOutcome::Abort("protocol error".to_string()),
                Ok(Some(argv)) => {
                    LDB.lock().unwrap().cbuf.clear();
                    break argv;
                }
                Ok(None) => {
                    let stream = {
                        let ldb = LDB.lock().unwrap();
                        ldb.conn.as_ref().and_then(|c| c.try_clone().ok())
                    };
                    let mut stream = match stream {
                        Some(stream) => stream,
                        None => return client_gone(),
                    };
                    let mut buf = [0u8; 1024];
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => return client_gone(),
                        Ok(n) => {
                            let mut ldb = LDB.lock().unwrap();
                            ldb.cbuf.extend_from_slice(&buf[..n]);
                            if ldb.cbuf.len() > 1 << 20 {
                                ldb.cbuf.clear();
                                return ReplOutcome::Abort(
                                    "max client buffer reached".to_string(),
                                );
                            }
                        }
                    }
                }
            }
        };

        if argv.is_empty() {
            continue;
        }
        let cmd = argv[0].to_lowercase();
        match cmd.as_str() {
            "h" | "help" => {
                log_help();
                LDB.lock().unwrap().send_logs();
            }
            "s" | "step" | "n" | "next" => {
                LDB.lock().unwrap().step = true;
                return ReplOutcome::Resume;
            }
            "c" | "continue" => return ReplOutcome::Resume,
            "t" | "trace" => {
                trace_cmd(lua);
                LDB.lock().unwrap().send_logs();
            }
            "m" | "maxlen" => {
                maxlen_cmd(&argv);
                LDB.lock().unwrap().send_logs();
            }
            "b" | "break" => {
                break_cmd(&argv);
                LDB.lock().unwrap().send_logs();
            }
            "e" | "eval" => {
                eval_cmd(lua, &argv);
                LDB.lock().unwrap().send_logs();
            }
            "a" | "abort" => {
                return ReplOutcome::Abort("script aborted for user request".to_string());
            }
            "r" | "redis" | "v" | "valkey" | "server" if argv.len() > 1 => {
                server_cmd(&argv);
                LDB.lock().unwrap().send_logs();
            }
            "p" | "print" => {
                if argv.len() == 2 {
                    print_var_cmd(lua, &argv[1]);
                } else {
                    print_all_cmd(lua);
                }
                LDB.lock().unwrap().send_logs();
            }
            "l" | "list" => {
                let mut ldb = LDB.lock().unwrap();
                let mut around = ldb.currentline;
                let mut context = 5;
                if argv.len() > 1 {
                    if let Ok(num) = argv[1].parse::<i32>() {
                        if num > 0 {
                            around = num;
                        }
                    }
                }
                if argv.len() > 2 {
                    if let Ok(num) = argv[2].parse::<i32>() {
                        context = num;
                    }
                }
                ldb.list(around, context);
                ldb.send_logs();
            }
            "w" | "whole" => {
                let mut ldb = LDB.lock().unwrap();
                ldb.list(1, 1_000_000);
                ldb.send_logs();
            }
            _ => {
                let mut ldb = LDB.lock().unwrap();
                ldb.log("<error> Unknown Lua debugger command or wrong number of arguments.".to_string());
                ldb.send_logs();
            }
        }
    }
}

/// The client is gone: run the rest of the script without stops.
fn client_gone() -> ReplOutcome {
    let mut ldb = LDB.lock().unwrap();
    ldb.step = false;
    ldb.bp.clear();
    ReplOutcome::Disconnected
}

fn log_help() {
    let mut ldb = LDB.lock().unwrap();
    for line in [
        "Lua debugger help:",
        "[h]elp               Show this help.",
        "[s]tep               Run current line and stop again.",
        "[n]ext               Alias for step.",
        "[c]ontinue           Run till next breakpoint.",
        "[l]ist               List source code around current line.",
        "[l]ist [line]        List source code around [line].",
        "                     line = 0 means: current position.",
        "[l]ist [line] [ctx]  In this form [ctx] specifies how many lines",
        "                     to show before/after [line].",
        "[w]hole              List all source code. Alias for 'list 1 1000000'.",
        "[p]rint              Show all the local variables.",
        "[p]rint <var>        Show the value of the specified variable.",
        "                     Can also show global vars KEYS and ARGV.",
        "[b]reak              Show all breakpoints.",
        "[b]reak <line>       Add a breakpoint to the specified line.",
        "[b]reak -<line>      Remove breakpoint from the specified line.",
        "[b]reak 0            Remove all breakpoints.",
        "[t]race              Show a backtrace.",
        "[e]val <code>        Execute some Lua code (in a different callframe).",
        "[v]alkey <cmd>       Execute a command.",
        "[m]axlen [len]       Trim logged replies and Lua var dumps to len.",
        "                     Specifying zero as <len> means unlimited.",
        "[a]bort              Stop the execution of the script. In sync",
        "                     mode dataset changes will be retained.",
        "",
        "Debugger functions you can call from Lua scripts:",
        "server.debug()       Produce logs in the debugger console.",
        "server.breakpoint()  Stop execution like if there was a breakpoint in the",
        "                     next line of code.",
    ] {
        ldb.log(line.to_string());
    }
}

/// `break`: list, add (`b N`), remove (`b -N`) or clear (`b 0`)
fn break_cmd(argv: &[String]) {
    let mut ldb = LDB.lock().unwrap();
    if argv.len() == 1 {
        if ldb.bp.is_empty() {
            ldb.log("No breakpoints set. Use 'b <line>' to add one.".to_string());
            return;
        }
        let bp_count = ldb.bp.len();
        ldb.log(format!("{} breakpoints set:", bp_count));
        let lines: Vec<i32> = ldb.bp.clone();
        for line in lines {
            ldb.log_source_line(line);
        }
        return;
    }

    for arg in &argv[1..] {
        let line = match arg.parse::<i32>() {
            Ok(line) => line,
            Err(_) => {
                ldb.log(format!("Invalid argument:'{}'", arg));
                continue;
            }
        };
        if line == 0 {
            ldb.bp.clear();
            ldb.log("All breakpoints removed.".to_string());
        } else if line > 0 {
            if ldb.bp.len() == LDB_BREAKPOINTS_MAX {
                ldb.log("Too many breakpoints set.".to_string());
            } else if ldb.add_breakpoint(line) {
                ldb.list(line, 1);
            } else {
                ldb.log("Wrong line number.".to_string());
            }
        } else if ldb.del_breakpoint(-line) {
            ldb.log("Breakpoint removed.".to_string());
        } else {
            ldb.log("No breakpoint in the specified line.".to_string());
        }
    }
}

/// `maxlen`: query or set the reply trim cap
fn maxlen_cmd(argv: &[String]) {
    let mut ldb = LDB.lock().unwrap();
    if argv.len() == 2 {
        let mut newval = argv[1].parse::<i64>().unwrap_or(0).max(0) as usize;
        ldb.maxlen_hint_sent = true;
        if newval != 0 && newval <= 60 {
            newval = 60;
        }
        ldb.maxlen = newval;
    }
    if ldb.maxlen > 0 {
        let maxlen = ldb.maxlen;
        ldb.log(format!("<value> replies are truncated at {} bytes.", maxlen));
    } else {
        ldb.log("<value> replies are unlimited.".to_string());
    }
}

/// `eval`: run a fragment in a new call frame, expression first
fn eval_cmd(lua: &Lua, argv: &[String]) {
    let code = argv[1..].join(" ");
    let expr = format!("return {}", code);

    let result = match lua.load(&expr).set_name("@ldb_eval").eval::<Value>() {
        Ok(value) => Ok(value),
        Err(mlua::Error::SyntaxError { .. }) => lua.load(&code).set_name("@ldb_eval").eval::<Value>(),
        Err(e) => Err(e),
    };

    match result {
        Ok(value) => {
            let mut entry = String::from("<retval> ");
            cat_value(&mut entry, &value, 0);
            LDB.lock().unwrap().log_with_maxlen(entry);
        }
        Err(e) => {
            let mut ldb = LDB.lock().unwrap();
            ldb.log(format!("<error> {}", super::fmt_lua_error(&e)));
        }
    }
}

/// `redis`/`valkey`/`server`: run a command through the script's
/// command binding and log the reply
fn server_cmd(argv: &[String]) {
    let cmd_argv: Vec<Vec<u8>> = argv[1..].iter().map(|a| a.as_bytes().to_vec()).collect();
    log_issued_command(&cmd_argv);

    let reply = api::with_run_ctx(|ctx| {
        commands::execute(&ctx.storage, ctx.db, &cmd_argv, ctx.read_only)
    });
    match reply {
        Some(Ok(frame)) => log_command_reply(&frame),
        Some(Err(e)) => {
            LDB.lock().unwrap().log(format!("<error> {}", e));
        }
        None => {
            LDB.lock().unwrap().log("<error> no script is running".to_string());
        }
    }
}

/// `print <var>`: scan local variables frame by frame, falling back to
/// the KEYS/ARGV globals
fn print_var_cmd(lua: &Lua, varname: &str) {
    if let Ok(getlocal) = lua.named_registry_value::<Function>(REG_GETLOCAL) {
        'levels: for level in 0..=15 {
            let mut index = 1;
            loop {
                match getlocal.call::<(Option<String>, Value)>((level, index)) {
                    Ok((Some(name), value)) => {
                        if name == varname {
                            let mut entry = String::from("<value> ");
                            cat_value(&mut entry, &value, 0);
                            LDB.lock().unwrap().log_with_maxlen(entry);
                            return;
                        }
                        index += 1;
                    }
                    Ok((None, _)) => break,
                    Err(_) => break 'levels,
                }
            }
        }
    }

    // KEYS and ARGV live in the globals, not on the stack.
    if varname == "KEYS" || varname == "ARGV" {
        if let Ok(value) = lua.globals().get::<Value>(varname) {
            let mut entry = String::from("<value> ");
            cat_value(&mut entry, &value, 0);
            LDB.lock().unwrap().log_with_maxlen(entry);
            return;
        }
    }
    LDB.lock().unwrap().log("No such variable.".to_string());
}

/// `print`: dump the locals of the innermost user frame
fn print_all_cmd(lua: &Lua) {
    let mut vars = 0;
    if let Ok(getlocal) = lua.named_registry_value::<Function>(REG_GETLOCAL) {
        'levels: for level in 0..=15 {
            let mut index = 1;
            loop {
                match getlocal.call::<(Option<String>, Value)>((level, index)) {
                    Ok((Some(name), value)) => {
                        index += 1;
                        if name.contains("(*temporary)") {
                            continue;
                        }
                        let mut entry = format!("<value> {} = ", name);
                        cat_value(&mut entry, &value, 0);
                        LDB.lock().unwrap().log_with_maxlen(entry);
                        vars += 1;
                    }
                    Ok((None, _)) => {
                        if vars > 0 {
                            break 'levels;
                        }
                        break;
                    }
                    Err(_) => break 'levels,
                }
            }
        }
    }
    if vars == 0 {
        LDB.lock().unwrap().log("No local variables in the current context.".to_string());
    }
}

/// `trace`: walk the stack and print user-script frames
fn trace_cmd(lua: &Lua) {
    let mut logged = 0;
    if let Ok(getinfo) = lua.named_registry_value::<Function>(REG_GETINFO) {
        for level in 0..=31 {
            match getinfo.call::<Option<Table>>((level, "nSl")) {
                Ok(Some(info)) => {
                    let short_src: String = info
                        .get::<Option<String>>("short_src")
                        .ok()
                        .flatten()
                        .unwrap_or_default();
                    if !short_src.contains("user_script") {
                        continue;
                    }
                    let name = info
                        .get::<Option<String>>("name")
                        .ok()
                        .flatten()
                        .unwrap_or_else(|| "top level".to_string());
                    let currentline: i64 =
                        info.get::<Option<i64>>("currentline").ok().flatten().unwrap_or(-1);

                    let mut ldb = LDB.lock().unwrap();
                    ldb.log(format!("{} {}:", if logged == 0 { "In" } else { "From" }, name));
                    ldb.log_source_line(currentline as i32);
                    logged += 1;
                }
                Ok(None) | Err(_) => break,
            }
        }
    }
    if logged == 0 {
        LDB.lock().unwrap().log("<error> Can't retrieve Lua stack.".to_string());
    }
}

/// Append a quoted, escaped representation of a byte string
fn cat_repr(out: &mut String, bytes: &[u8]) {
    out.push('"');
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x07 => out.push_str("\\a"),
            0x08 => out.push_str("\\b"),
            b if (0x20..0x7f).contains(&b) => out.push(b as char),
            b => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out.push('"');
}

/// Append a human readable rendering of a Lua value.
///
/// Tables are rendered twice in parallel, once as a sequence and once
/// as a keyed mapping; the sequence form wins when the keys turn out to
/// be 1,2,3,... in encounter order.
fn cat_value(out: &mut String, value: &Value, level: usize) {
    if level == LDB_MAX_VALUES_DEPTH {
        out.push_str("<max recursion level reached! Nested table?>");
        return;
    }

    match value {
        Value::String(s) => cat_repr(out, &s.as_bytes()),
        Value::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Integer(i) => out.push_str(&i.to_string()),
        Value::Number(n) => out.push_str(&format!("{}", n)),
        Value::Nil => out.push_str("nil"),
        Value::Table(table) => {
            let mut seq_repr = String::new();
            let mut map_repr = String::new();
            let mut expected_index = 1i64;
            let mut is_array = true;

            for pair in table.clone().pairs::<Value, Value>() {
                let (key, item) = match pair {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                if is_array && !matches!(&key, Value::Integer(i) if *i == expected_index) {
                    is_array = false;
                }
                cat_value(&mut seq_repr, &item, level + 1);
                seq_repr.push_str("; ");
                map_repr.push('[');
                cat_value(&mut map_repr, &key, level + 1);
                map_repr.push_str("]=");
                cat_value(&mut map_repr, &item, level + 1);
                map_repr.push_str("; ");
                expected_index += 1;
            }
            for repr in [&mut seq_repr, &mut map_repr] {
                if repr.ends_with("; ") {
                    repr.truncate(repr.len() - 2);
                }
            }
            out.push('{');
            out.push_str(if is_array { &seq_repr } else { &map_repr });
            out.push('}');
        }
        Value::Function(_) | Value::Thread(_) | Value::UserData(_) | Value::LightUserData(_) => {
            out.push_str(&format!("\"{}@{:p}\"", value.type_name(), value.to_pointer()));
        }
        _ => out.push_str("\"<unknown-lua-type>\""),
    }
}

/// Human readable rendering of a RESP reply for the debugger console
fn resp_to_human(frame: &RespFrame) -> String {
    let mut out = String::new();
    match frame {
        RespFrame::Integer(n) => out.push_str(&n.to_string()),
        RespFrame::SimpleString(bytes) => {
            let mut tagged = vec![b'+'];
            tagged.extend_from_slice(bytes);
            cat_repr(&mut out, &tagged);
        }
        RespFrame::Error(bytes) => {
            let mut tagged = vec![b'-'];
            tagged.extend_from_slice(bytes);
            cat_repr(&mut out, &tagged);
        }
        RespFrame::BulkString(None) | RespFrame::Array(None) => out.push_str("NULL"),
        RespFrame::BulkString(Some(bytes)) => cat_repr(&mut out, bytes),
        RespFrame::Array(Some(frames)) => {
            out.push('[');
            for (i, frame) in frames.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&resp_to_human(frame));
            }
            out.push(']');
        }
        RespFrame::Set(frames) => {
            out.push_str("~(");
            for (i, frame) in frames.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&resp_to_human(frame));
            }
            out.push(')');
        }
        RespFrame::Map(pairs) => {
            out.push('{');
            for (i, (key, value)) in pairs.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&resp_to_human(key));
                out.push_str(" => ");
                out.push_str(&resp_to_human(value));
            }
            out.push('}');
        }
        RespFrame::Null => out.push_str("(null)"),
        RespFrame::Boolean(true) => out.push_str("#true"),
        RespFrame::Boolean(false) => out.push_str("#false"),
        RespFrame::Double(d) => out.push_str(&format!("(double) {}", d)),
    }
    out
}
