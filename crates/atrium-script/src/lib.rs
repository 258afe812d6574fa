//! Atrium script sandbox -- wasmtime execution of untrusted app scripts.
//!
//! App scripts run identically on the server and every connected client, so
//! they are treated as hostile on both: each script executes inside a
//! fuel-metered Wasmtime instance with no filesystem, network, threading or
//! wall-clock access. The only capabilities a script observes are the host
//! functions of the `"atrium"` import namespace.
//!
//! # Architecture
//!
//! - **[`sandbox`]**: [`ScriptInstance`] -- loads, validates and drives a
//!   module; resolves the optional lifecycle exports (`start`,
//!   `fixed_update`, `update`, `late_update`, `destroy`); enforces fuel and
//!   memory budgets.
//! - **[`host`]**: [`HostScope`] -- the state held inside the Wasmtime
//!   store -- and the host function registrations (log sink, tick clock,
//!   id generation, and the app / world / fetch proxies).
//!
//! # Crash isolation
//!
//! Any trap, fuel exhaustion or memory-cap hit during a handler surfaces as
//! a [`ScriptError`]; the app layer routes it to `App::crash` and the
//! process never aborts.
//!
//! # Shared state across rebuilds
//!
//! Each evaluation owns a mutable `shared` JSON record. The host keeps it
//! keyed by (blueprint id, version) and hands it back on re-execution of
//! the same source, so rebuilds preserve script-managed state; isolation is
//! per (blueprint, version) pair.

#![deny(unsafe_code)]

pub mod host;
pub mod sandbox;

pub use host::{HostScope, ScriptEvent, ScriptOutputs};
pub use sandbox::{SandboxConfig, ScriptInstance};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by script loading or execution.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// The bytes are not a valid WASM/WAT module.
    #[error("script compilation failed: {0}")]
    Compile(String),

    /// The module exports a lifecycle handler with the wrong signature.
    #[error("handler '{name}' has the wrong signature: {reason}")]
    BadHandler {
        /// The handler export name.
        name: &'static str,
        /// Signature mismatch description.
        reason: String,
    },

    /// The script exhausted its fuel budget inside a handler.
    #[error("script ran out of fuel (budget: {budget} units)")]
    OutOfFuel {
        /// The per-call fuel budget that was exceeded.
        budget: u64,
    },

    /// A WASM trap occurred (unreachable, out-of-bounds access, ...).
    #[error("script trap: {0}")]
    Trap(String),

    /// The module tried to grow past its memory cap.
    #[error("script exceeded memory limit of {limit_bytes} bytes")]
    MemoryLimit {
        /// The configured cap.
        limit_bytes: usize,
    },

    /// A general runtime failure (instantiation, unsatisfied imports, ...).
    #[error("script runtime error: {0}")]
    Runtime(String),
}
