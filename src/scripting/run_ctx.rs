//! Per-run script execution context
//!
//! Carries the shared execution state used for cooperative
//! cancellation, the effective flag set, and the identity of the run.
//! Also hosts the pre-run policy checks and the registry slot behind
//! SCRIPT KILL / FUNCTION KILL.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use uuid::Uuid;

use super::ScriptFlags;
use crate::config::ScriptingConfig;
use crate::error::ScriptError;
use crate::storage::StorageEngine;

/// Tri-valued execution status shared between dispatcher and engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutionStatus {
    Executing = 0,
    Killed = 1,
    Finished = 2,
}

/// Shared cell holding the execution status of one script run
#[derive(Debug)]
pub struct ExecutionState(AtomicU8);

impl ExecutionState {
    pub fn new() -> Arc<Self> {
        Arc::new(ExecutionState(AtomicU8::new(ExecutionStatus::Executing as u8)))
    }

    pub fn status(&self) -> ExecutionStatus {
        match self.0.load(Ordering::SeqCst) {
            0 => ExecutionStatus::Executing,
            1 => ExecutionStatus::Killed,
            _ => ExecutionStatus::Finished,
        }
    }

    /// Request cooperative termination. Engines poll for this at safe points.
    pub fn kill(&self) {
        self.0.store(ExecutionStatus::Killed as u8, Ordering::SeqCst);
    }

    pub fn finish(&self) {
        self.0.store(ExecutionStatus::Finished as u8, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.status() == ExecutionStatus::Killed
    }
}

/// Command-planning flags derived before a script runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandFlags(u64);

impl CommandFlags {
    pub const WRITE: CommandFlags = CommandFlags(1 << 0);
    pub const READONLY: CommandFlags = CommandFlags(1 << 1);
    pub const NO_CLUSTER: CommandFlags = CommandFlags(1 << 2);
    pub const ALLOW_STALE: CommandFlags = CommandFlags(1 << 3);
    pub const ALLOW_CROSS_SLOT: CommandFlags = CommandFlags(1 << 4);

    pub fn empty() -> CommandFlags {
        CommandFlags(0)
    }

    pub fn contains(&self, other: CommandFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: CommandFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: CommandFlags) {
        self.0 &= !other.0;
    }
}

/// Fold a script's declared flags into the command's base flags.
///
/// In compat mode (no shebang) the command keeps its base flags.
/// Otherwise the script's explicit flags replace the script-relevant
/// subset of the command's flags.
pub fn fold_command_flags(base: CommandFlags, script_flags: ScriptFlags) -> CommandFlags {
    if script_flags.contains(ScriptFlags::EVAL_COMPAT_MODE) {
        return base;
    }

    let mut folded = base;
    folded.remove(CommandFlags::WRITE);
    folded.remove(CommandFlags::READONLY);
    folded.remove(CommandFlags::NO_CLUSTER);
    folded.remove(CommandFlags::ALLOW_STALE);
    folded.remove(CommandFlags::ALLOW_CROSS_SLOT);

    if script_flags.contains(ScriptFlags::NO_WRITES)
        || script_flags.contains(ScriptFlags::READ_ONLY)
    {
        folded.insert(CommandFlags::READONLY);
    } else {
        folded.insert(CommandFlags::WRITE);
    }
    if script_flags.contains(ScriptFlags::NO_CLUSTER) {
        folded.insert(CommandFlags::NO_CLUSTER);
    }
    if script_flags.contains(ScriptFlags::ALLOW_STALE) {
        folded.insert(CommandFlags::ALLOW_STALE);
    }
    if script_flags.contains(ScriptFlags::ALLOW_CROSS_SLOT_KEYS) {
        folded.insert(CommandFlags::ALLOW_CROSS_SLOT);
    }
    folded
}

/// Context handed to the engine for one script run
#[derive(Clone)]
pub struct ScriptRunCtx {
    /// Shared execution status, polled by the engine
    pub state: Arc<ExecutionState>,

    /// Storage the script's commands operate on
    pub storage: Arc<StorageEngine>,

    /// Selected database
    pub db: usize,

    /// Effective script flags
    pub flags: ScriptFlags,

    /// Writes are refused when set (EVAL_RO, or folded read-only flags)
    pub read_only: bool,

    /// Digest of the running script (empty for FCALL)
    pub sha: String,

    /// Unique id of this run
    pub run_id: Uuid,

    /// Start of execution
    pub start: Instant,

    /// EVAL-style run (as opposed to FCALL); selects the kill error variant
    pub eval_mode: bool,

    written: Arc<AtomicBool>,
}

impl ScriptRunCtx {
    pub fn new(
        storage: Arc<StorageEngine>,
        db: usize,
        flags: ScriptFlags,
        read_only: bool,
        sha: String,
        eval_mode: bool,
    ) -> Self {
        ScriptRunCtx {
            state: ExecutionState::new(),
            storage,
            db,
            flags,
            read_only,
            sha,
            run_id: Uuid::new_v4(),
            start: Instant::now(),
            eval_mode,
            written: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record that the script performed a write; after this the run can
    /// no longer be killed.
    pub fn mark_written(&self) {
        self.written.store(true, Ordering::SeqCst);
    }

    pub fn has_written(&self) -> bool {
        self.written.load(Ordering::SeqCst)
    }

    /// The kill error for this run's mode
    pub fn kill_error(&self) -> ScriptError {
        ScriptError::Killed {
            function: !self.eval_mode,
        }
    }
}

/// Pre-run policy checks from the folded flags. Returns the RESP error
/// string when the script must not run.
pub fn check_run_policy(config: &ScriptingConfig, folded: CommandFlags) -> Result<(), String> {
    if config.cluster_enabled && folded.contains(CommandFlags::NO_CLUSTER) {
        return Err("ERR Can not run script on cluster, 'no-cluster' flag is set.".to_string());
    }

    if config.is_replica
        && config.replica_read_only
        && folded.contains(CommandFlags::WRITE)
    {
        return Err("READONLY You can't write against a read only replica.".to_string());
    }

    Ok(())
}

/// Bookkeeping for the script currently executing on the main thread
pub struct RunningScript {
    pub sha: String,
    pub start: Instant,
    pub state: Arc<ExecutionState>,
    pub eval_mode: bool,
    written: Arc<AtomicBool>,
}

/// Which command requested the kill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillScope {
    Script,
    Function,
}

/// Registry slot for the running script. Scripts never overlap, so a
/// single slot suffices.
pub struct RunningRegistry {
    slot: Mutex<Option<Arc<RunningScript>>>,
}

impl RunningRegistry {
    pub fn new() -> Self {
        RunningRegistry {
            slot: Mutex::new(None),
        }
    }

    /// Install the run; the returned guard clears the slot when dropped.
    pub fn begin(&self, ctx: &ScriptRunCtx) -> RunGuard<'_> {
        let info = Arc::new(RunningScript {
            sha: ctx.sha.clone(),
            start: ctx.start,
            state: Arc::clone(&ctx.state),
            eval_mode: ctx.eval_mode,
            written: Arc::clone(&ctx.written),
        });
        *self.slot.lock().unwrap() = Some(info);
        RunGuard { registry: self }
    }

    /// Handle SCRIPT KILL / FUNCTION KILL.
    pub fn kill(&self, _scope: KillScope) -> Result<(), ScriptError> {
        let slot = self.slot.lock().unwrap();
        match slot.as_ref() {
            None => Err(ScriptError::NotBusy),
            Some(running) => {
                if running.written.load(Ordering::SeqCst) {
                    return Err(ScriptError::Unkillable);
                }
                running.state.kill();
                Ok(())
            }
        }
    }

    /// Currently running script, if any
    pub fn current(&self) -> Option<Arc<RunningScript>> {
        self.slot.lock().unwrap().clone()
    }
}

/// Clears the running slot and marks the state finished on drop
pub struct RunGuard<'a> {
    registry: &'a RunningRegistry,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.registry.slot.lock().unwrap();
        if let Some(running) = slot.take() {
            if !running.state.is_killed() {
                running.state.finish();
            }
        }
    }
}
