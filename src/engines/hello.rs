//! HELLO: a minimal stack-machine scripting engine
//!
//! Exists to exercise the engine contract end to end. A program is a
//! whitespace-separated token stream of function blocks, each opened by
//! `FUNCTION <name>` and closed by `RETURN`:
//!
//! ```text
//! FUNCTION foo
//!     ARGS 0
//! RETURN
//! ```
//!
//! Calls reply with an unsigned 32-bit integer.

use std::any::Any;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::protocol::resp::RespFrame;
use crate::scripting::engine::{CompiledFunction, EngineMemoryInfo, LazyEvalReset};
use crate::scripting::run_ctx::ScriptRunCtx;
use crate::scripting::{ScriptFlags, ScriptSubsystem, ScriptingEngineImpl};

/// Engine name used at registration
pub const HELLO_ENGINE_NAME: &str = "hello";

const MAX_FUNCTIONS: usize = 16;
const MAX_INSTRUCTIONS: usize = 256;
const STACK_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Instruction {
    /// Push a constant
    ConstI(u32),

    /// Push the script argument at the given index, parsed as u32
    Args(usize),

    /// Pop a number of seconds and sleep cooperatively
    Sleep,

    /// Pop the reply value and return to the caller
    Return,
}

#[derive(Debug)]
struct FunctionDef {
    name: String,
    instructions: Vec<Instruction>,
}

/// Payload stored inside a `CompiledFunction`
struct HelloPayload {
    def: Arc<FunctionDef>,
}

/// The HELLO engine context
pub struct HelloEngine {
    /// The FUNCTION-subsystem program slot. A new library compile
    /// replaces the previous program.
    program: Mutex<Vec<Arc<FunctionDef>>>,
}

impl HelloEngine {
    pub fn new() -> Self {
        HelloEngine {
            program: Mutex::new(Vec::new()),
        }
    }

    /// Parse a token stream into function blocks
    fn parse(code: &str) -> Result<Vec<FunctionDef>, String> {
        let mut tokens = code.split_whitespace();
        let mut functions: Vec<FunctionDef> = Vec::new();

        while let Some(token) = tokens.next() {
            if token != "FUNCTION" {
                return Err(format!("Expected FUNCTION, found '{}'", token));
            }
            if functions.len() == MAX_FUNCTIONS {
                return Err(format!("Too many functions (max {})", MAX_FUNCTIONS));
            }
            let name = tokens
                .next()
                .ok_or_else(|| "FUNCTION requires a name".to_string())?
                .to_string();

            let mut instructions = Vec::new();
            loop {
                let token = tokens
                    .next()
                    .ok_or_else(|| format!("Function '{}' is missing RETURN", name))?;
                if instructions.len() == MAX_INSTRUCTIONS {
                    return Err(format!(
                        "Function '{}' exceeds {} instructions",
                        name, MAX_INSTRUCTIONS
                    ));
                }
                match token {
                    "RETURN" => {
                        instructions.push(Instruction::Return);
                        break;
                    }
                    "CONSTI" => {
                        let value = tokens
                            .next()
                            .and_then(|t| t.parse::<u32>().ok())
                            .ok_or_else(|| "CONSTI requires an unsigned integer".to_string())?;
                        instructions.push(Instruction::ConstI(value));
                    }
                    "ARGS" => {
                        let index = tokens
                            .next()
                            .and_then(|t| t.parse::<usize>().ok())
                            .ok_or_else(|| "ARGS requires an index".to_string())?;
                        instructions.push(Instruction::Args(index));
                    }
                    "SLEEP" => instructions.push(Instruction::Sleep),
                    other => return Err(format!("Unknown instruction '{}'", other)),
                }
            }

            functions.push(FunctionDef { name, instructions });
        }

        Ok(functions)
    }

    /// Run one function. Returns the reply value, or the client-ready
    /// error string. On cooperative kill the current value is returned;
    /// the dispatcher notices the killed state and replies accordingly.
    fn execute(def: &FunctionDef, run_ctx: &ScriptRunCtx, args: &[Vec<u8>]) -> Result<u32, String> {
        let mut stack: Vec<u32> = Vec::with_capacity(STACK_SIZE);

        for instruction in &def.instructions {
            match instruction {
                Instruction::ConstI(value) => {
                    if stack.len() == STACK_SIZE {
                        return Err("stack overflow".to_string());
                    }
                    stack.push(*value);
                }
                Instruction::Args(index) => {
                    if stack.len() == STACK_SIZE {
                        return Err("stack overflow".to_string());
                    }
                    let raw = args
                        .get(*index)
                        .ok_or_else(|| format!("missing argument {}", index))?;
                    let value = std::str::from_utf8(raw)
                        .ok()
                        .and_then(|s| s.parse::<u32>().ok())
                        .ok_or_else(|| format!("argument {} is not an unsigned integer", index))?;
                    stack.push(value);
                }
                Instruction::Sleep => {
                    let seconds = stack.pop().ok_or_else(|| "stack underflow".to_string())?;
                    let deadline = Instant::now() + Duration::from_secs(seconds as u64);
                    // Poll the shared state every millisecond so a kill
                    // is honored within one interval.
                    while Instant::now() < deadline {
                        if run_ctx.state.is_killed() {
                            return Ok(0);
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                Instruction::Return => {
                    let value = stack.pop().ok_or_else(|| "stack underflow".to_string())?;
                    return Ok(value);
                }
            }
        }

        Err(format!("function '{}' fell off the end", def.name))
    }

    fn wrap(def: Arc<FunctionDef>) -> CompiledFunction {
        CompiledFunction {
            name: Some(def.name.clone()),
            desc: None,
            payload: Box::new(HelloPayload { def }) as Box<dyn Any + Send + Sync>,
            flags: ScriptFlags::empty(),
        }
    }
}

impl ScriptingEngineImpl for HelloEngine {
    fn compile(
        &self,
        subsystem: ScriptSubsystem,
        code: &str,
        timeout: Duration,
    ) -> Result<Vec<CompiledFunction>, String> {
        let start = Instant::now();
        let parsed = Self::parse(code)?;

        if subsystem == ScriptSubsystem::Eval && parsed.len() != 1 {
            return Err("EVAL scripts must define exactly one function".to_string());
        }

        if !timeout.is_zero() && start.elapsed() > timeout {
            return Err("FUNCTION LOAD timeout".to_string());
        }

        let defs: Vec<Arc<FunctionDef>> = parsed.into_iter().map(Arc::new).collect();

        if subsystem == ScriptSubsystem::Function {
            // A new library replaces the previous program.
            let mut program = self.program.lock().unwrap();
            program.clear();
            program.extend(defs.iter().cloned());
        }

        Ok(defs.into_iter().map(Self::wrap).collect())
    }

    fn free_function(&self, _subsystem: ScriptSubsystem, function: CompiledFunction) {
        // The payload owns its definition; dropping it releases the
        // last engine-side reference once the program slot let go.
        drop(function);
    }

    fn call(
        &self,
        run_ctx: &ScriptRunCtx,
        function: &CompiledFunction,
        _subsystem: ScriptSubsystem,
        _keys: &[Vec<u8>],
        args: &[Vec<u8>],
    ) -> RespFrame {
        let payload = function
            .payload
            .downcast_ref::<HelloPayload>()
            .expect("hello function payload handed to another engine");

        match Self::execute(&payload.def, run_ctx, args) {
            Ok(value) => RespFrame::Integer(value as i64),
            Err(msg) => RespFrame::error(format!("ERR {}", msg)),
        }
    }

    fn function_memory_overhead(&self, function: &CompiledFunction) -> usize {
        match function.payload.downcast_ref::<HelloPayload>() {
            Some(payload) => {
                payload.def.name.len()
                    + payload.def.instructions.len() * mem::size_of::<Instruction>()
            }
            None => 0,
        }
    }

    fn reset_eval_env(&self, _async_reset: bool) -> Option<LazyEvalReset> {
        // EVAL compiles are self-contained; there is no interpreter
        // state to discard.
        None
    }

    fn memory_info(&self, subsystem: ScriptSubsystem) -> EngineMemoryInfo {
        let program_bytes: usize = match subsystem {
            ScriptSubsystem::Eval => 0,
            _ => {
                let program = self.program.lock().unwrap();
                program
                    .iter()
                    .map(|def| {
                        def.name.len() + def.instructions.len() * mem::size_of::<Instruction>()
                    })
                    .sum()
            }
        };
        EngineMemoryInfo {
            used_memory: program_bytes,
            engine_memory_overhead: mem::size_of::<HelloEngine>(),
        }
    }
}
