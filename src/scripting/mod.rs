//! Scripting subsystem
//!
//! The pluggable engine registry, the EVAL script cache, the execution
//! dispatcher and their shared vocabulary. Engine back-ends live under
//! `crate::engines` and plug in through the `ScriptingEngineImpl`
//! contract.

pub mod dispatcher;
pub mod engine;
pub mod eval_cache;
pub mod functions;
pub mod lru;
pub mod manager;
pub mod run_ctx;
pub mod shebang;
pub mod subsystem;

pub use engine::{CompiledFunction, EngineMemoryInfo, LazyEvalReset, ScriptingEngine, ScriptingEngineImpl};
pub use manager::EngineManager;
pub use run_ctx::{ExecutionState, ScriptRunCtx};
pub use subsystem::ScriptingSubsystem;

/// Engine selected when a script carries no shebang
pub const DEFAULT_ENGINE: &str = "lua";

/// ABI version engine back-ends must declare at registration
pub const ENGINE_ABI_VERSION: u32 = 1;

/// Which invocation style an engine operation serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptSubsystem {
    /// Ad-hoc scripts (EVAL / EVALSHA)
    Eval,

    /// Named library functions (FUNCTION LOAD / FCALL)
    Function,

    /// Both, accepted only by memory introspection
    All,
}

/// Script flags parsed from the shebang line (plus internal bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScriptFlags(u64);

impl ScriptFlags {
    /// No shebang was present; the command's own flags stay authoritative.
    pub const EVAL_COMPAT_MODE: ScriptFlags = ScriptFlags(1 << 0);

    /// The script declares it performs no writes.
    pub const NO_WRITES: ScriptFlags = ScriptFlags(1 << 1);

    /// The script may run where only reads are served.
    pub const READ_ONLY: ScriptFlags = ScriptFlags(1 << 2);

    /// The script tolerates stale data on a disconnected replica.
    pub const ALLOW_STALE: ScriptFlags = ScriptFlags(1 << 3);

    /// The script may touch keys from multiple cluster slots.
    pub const ALLOW_CROSS_SLOT_KEYS: ScriptFlags = ScriptFlags(1 << 4);

    /// The script refuses to run in cluster mode.
    pub const NO_CLUSTER: ScriptFlags = ScriptFlags(1 << 5);

    /// The closed shebang vocabulary. EVAL_COMPAT_MODE is internal and
    /// deliberately absent.
    pub const VOCABULARY: &'static [(&'static str, ScriptFlags)] = &[
        ("no-writes", ScriptFlags::NO_WRITES),
        ("read-only", ScriptFlags::READ_ONLY),
        ("allow-stale", ScriptFlags::ALLOW_STALE),
        ("allow-cross-slot-keys", ScriptFlags::ALLOW_CROSS_SLOT_KEYS),
        ("no-cluster", ScriptFlags::NO_CLUSTER),
    ];

    /// The empty flag set
    pub fn empty() -> ScriptFlags {
        ScriptFlags(0)
    }

    /// Look up a single shebang flag token
    pub fn parse_token(token: &str) -> Option<ScriptFlags> {
        Self::VOCABULARY
            .iter()
            .find(|(name, _)| *name == token)
            .map(|(_, flag)| *flag)
    }

    pub fn contains(&self, other: ScriptFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ScriptFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ScriptFlags) {
        self.0 &= !other.0;
    }

    pub fn union(self, other: ScriptFlags) -> ScriptFlags {
        ScriptFlags(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Render the shebang-vocabulary flags as a `flags=` value.
    /// `parse_token` over the emitted tokens reconstructs the set.
    pub fn emit(&self) -> String {
        let mut tokens = Vec::new();
        for (name, flag) in Self::VOCABULARY {
            if self.contains(*flag) {
                tokens.push(*name);
            }
        }
        tokens.join(",")
    }
}
