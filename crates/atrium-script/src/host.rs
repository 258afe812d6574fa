//! The host capability surface.
//!
//! [`HostScope`] lives inside the Wasmtime store. Reads are immediate
//! (clock, state blobs); writes are deferred -- emitted events, begun
//! fetches and state updates accumulate in the scope and are drained by the
//! app layer after each handler call, on the simulation thread.
//!
//! Host functions are registered under the `"atrium"` import namespace.
//! Strings and JSON blobs cross the boundary as (ptr, len) pairs into the
//! module's exported linear memory; the host never hands the script a
//! pointer it did not receive from the script first.
//!
//! # Host functions
//!
//! ## Diagnostics
//! - `log(level: i32, ptr: i32, len: i32)` -- routed to the tracing sink.
//!
//! ## Clock
//! - `sim_time() -> f64`, `tick_number() -> i64`, `delta_time() -> f64`
//!
//! ## Identifiers
//! - `next_id() -> i64` -- monotone per-instance counter for script-local
//!   identifier generation.
//!
//! ## App proxy
//! - `state_len() -> i32`, `state_read(ptr: i32, cap: i32) -> i32`
//! - `state_write(ptr: i32, len: i32)` -- replaces the replicated,
//!   script-owned `state` blob (must be valid JSON).
//! - `shared_len() -> i32`, `shared_read(ptr, cap) -> i32`,
//!   `shared_write(ptr, len)` -- the rebuild-surviving shared record.
//! - `set_position(x: f64, y: f64, z: f64)`, `set_quaternion(x, y, z, w)`
//!
//! ## World proxy
//! - `emit(name_ptr, name_len, data_ptr, data_len)` -- emit a named entity
//!   event (data must be valid JSON).
//!
//! ## Fetch proxy
//! - `fetch_begin(url_ptr, url_len) -> i64` -- request an asset fetch
//!   chained to the app's abort token; completion arrives on a later tick.

use wasmtime::{Caller, Linker, StoreLimits};

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// A named event emitted by the script through the world proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptEvent {
    /// Event name.
    pub name: String,
    /// JSON event data.
    pub data: serde_json::Value,
}

/// Everything a handler call produced, drained by the app layer.
#[derive(Debug, Default, PartialEq)]
pub struct ScriptOutputs {
    /// Events to fan out through the replicator.
    pub events: Vec<ScriptEvent>,
    /// URLs whose fetch the script began this call.
    pub fetches: Vec<String>,
    /// New `state` blob, if the script wrote one.
    pub state: Option<serde_json::Value>,
    /// Position the script moved its app to, if any.
    pub position: Option<[f64; 3]>,
    /// Orientation the script set, if any.
    pub quaternion: Option<[f64; 4]>,
}

impl ScriptOutputs {
    /// `true` when the call produced nothing.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.fetches.is_empty()
            && self.state.is_none()
            && self.position.is_none()
            && self.quaternion.is_none()
    }
}

// ---------------------------------------------------------------------------
// HostScope
// ---------------------------------------------------------------------------

/// State held inside the Wasmtime store for host function dispatch.
pub struct HostScope {
    /// The replicated, script-owned `state` blob.
    pub state: serde_json::Value,
    /// Whether the script wrote `state` during the current call.
    pub state_dirty: bool,
    /// The rebuild-surviving shared record for this (blueprint, version).
    pub shared: serde_json::Value,
    /// The blueprint's config map (typed asset references), read-only to
    /// the script.
    pub config: serde_json::Value,
    /// Events emitted during the current call.
    pub events: Vec<ScriptEvent>,
    /// Fetches begun during the current call.
    pub fetches: Vec<String>,
    /// Position written during the current call.
    pub position: Option<[f64; 3]>,
    /// Orientation written during the current call.
    pub quaternion: Option<[f64; 4]>,
    /// Current tick number.
    pub tick: u64,
    /// Current simulation time, seconds.
    pub sim_time: f64,
    /// Delta time of the running handler call, seconds.
    pub dt: f64,
    /// Monotone counter backing `next_id()`.
    pub id_counter: i64,
    /// Identifier of the owning app, for log attribution.
    pub app_label: String,
    /// The entity event being delivered, while an `on_event` call runs.
    pub current_event: Option<ScriptEvent>,
    /// Memory growth limiter (wired via `Store::limiter`).
    pub(crate) limits: StoreLimits,
}

impl HostScope {
    /// Build a scope with the given state blobs.
    pub fn new(
        state: serde_json::Value,
        shared: serde_json::Value,
        config: serde_json::Value,
        app_label: String,
    ) -> Self {
        Self {
            state,
            state_dirty: false,
            shared,
            config,
            events: Vec::new(),
            fetches: Vec::new(),
            position: None,
            quaternion: None,
            tick: 0,
            sim_time: 0.0,
            dt: 0.0,
            id_counter: 0,
            app_label,
            current_event: None,
            limits: StoreLimits::default(),
        }
    }

    /// Set the clock before a handler call.
    pub fn begin_call(&mut self, tick: u64, sim_time: f64, dt: f64) {
        self.tick = tick;
        self.sim_time = sim_time;
        self.dt = dt;
    }

    /// Drain everything the last handler call produced.
    pub fn drain_outputs(&mut self) -> ScriptOutputs {
        ScriptOutputs {
            events: std::mem::take(&mut self.events),
            fetches: std::mem::take(&mut self.fetches),
            state: if std::mem::take(&mut self.state_dirty) {
                Some(self.state.clone())
            } else {
                None
            },
            position: self.position.take(),
            quaternion: self.quaternion.take(),
        }
    }
}

// ---------------------------------------------------------------------------
// Memory access helpers
// ---------------------------------------------------------------------------

/// Read `(ptr, len)` out of the module's exported memory.
fn read_bytes(
    caller: &mut Caller<'_, HostScope>,
    ptr: i32,
    len: i32,
) -> anyhow::Result<Vec<u8>> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow::anyhow!("script has no exported memory"))?;
    let start = usize::try_from(ptr).map_err(|_| anyhow::anyhow!("negative pointer"))?;
    let len = usize::try_from(len).map_err(|_| anyhow::anyhow!("negative length"))?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| anyhow::anyhow!("pointer overflow"))?;
    let data = memory.data(&caller);
    data.get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| anyhow::anyhow!("read past end of script memory"))
}

/// Read a UTF-8 string out of the module's memory.
fn read_string(caller: &mut Caller<'_, HostScope>, ptr: i32, len: i32) -> anyhow::Result<String> {
    String::from_utf8(read_bytes(caller, ptr, len)?)
        .map_err(|_| anyhow::anyhow!("script passed invalid utf-8"))
}

/// Read a JSON value out of the module's memory.
fn read_json(
    caller: &mut Caller<'_, HostScope>,
    ptr: i32,
    len: i32,
) -> anyhow::Result<serde_json::Value> {
    let text = read_string(caller, ptr, len)?;
    serde_json::from_str(&text).map_err(|e| anyhow::anyhow!("script passed invalid json: {e}"))
}

/// Copy up to `cap` bytes of `blob` into the module's memory at `ptr`.
/// Returns the full length of `blob` so the script can detect truncation
/// and retry with a larger buffer.
fn write_blob(
    caller: &mut Caller<'_, HostScope>,
    ptr: i32,
    cap: i32,
    blob: &[u8],
) -> anyhow::Result<i32> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow::anyhow!("script has no exported memory"))?;
    let start = usize::try_from(ptr).map_err(|_| anyhow::anyhow!("negative pointer"))?;
    let cap = usize::try_from(cap).map_err(|_| anyhow::anyhow!("negative capacity"))?;
    let copy_len = blob.len().min(cap);
    let end = start
        .checked_add(copy_len)
        .ok_or_else(|| anyhow::anyhow!("pointer overflow"))?;
    let data = memory.data_mut(caller);
    let slot = data
        .get_mut(start..end)
        .ok_or_else(|| anyhow::anyhow!("write past end of script memory"))?;
    slot.copy_from_slice(&blob[..copy_len]);
    Ok(blob.len() as i32)
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register every `"atrium"` host function on the linker.
///
/// # Errors
///
/// [`anyhow::Error`] if a registration collides, which would be a bug in
/// this table rather than in any script.
pub(crate) fn register_host_api(linker: &mut Linker<HostScope>) -> anyhow::Result<()> {
    // -- diagnostics --------------------------------------------------------
    linker.func_wrap(
        "atrium",
        "log",
        |mut caller: Caller<'_, HostScope>, level: i32, ptr: i32, len: i32| -> anyhow::Result<()> {
            let message = read_string(&mut caller, ptr, len)?;
            let app = caller.data().app_label.clone();
            match level {
                0 => tracing::error!(%app, "{message}"),
                1 => tracing::warn!(%app, "{message}"),
                2 => tracing::info!(%app, "{message}"),
                _ => tracing::debug!(%app, "{message}"),
            }
            Ok(())
        },
    )?;

    // -- clock --------------------------------------------------------------
    linker.func_wrap("atrium", "sim_time", |caller: Caller<'_, HostScope>| {
        caller.data().sim_time
    })?;
    linker.func_wrap("atrium", "tick_number", |caller: Caller<'_, HostScope>| {
        caller.data().tick as i64
    })?;
    linker.func_wrap("atrium", "delta_time", |caller: Caller<'_, HostScope>| {
        caller.data().dt
    })?;

    // -- identifiers --------------------------------------------------------
    linker.func_wrap("atrium", "next_id", |mut caller: Caller<'_, HostScope>| {
        let scope = caller.data_mut();
        scope.id_counter += 1;
        scope.id_counter
    })?;

    // -- app proxy: state ---------------------------------------------------
    linker.func_wrap("atrium", "state_len", |caller: Caller<'_, HostScope>| {
        caller.data().state.to_string().len() as i32
    })?;
    linker.func_wrap(
        "atrium",
        "state_read",
        |mut caller: Caller<'_, HostScope>, ptr: i32, cap: i32| -> anyhow::Result<i32> {
            let blob = caller.data().state.to_string();
            write_blob(&mut caller, ptr, cap, blob.as_bytes())
        },
    )?;
    linker.func_wrap(
        "atrium",
        "state_write",
        |mut caller: Caller<'_, HostScope>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let value = read_json(&mut caller, ptr, len)?;
            let scope = caller.data_mut();
            scope.state = value;
            scope.state_dirty = true;
            Ok(())
        },
    )?;

    // -- app proxy: shared record -------------------------------------------
    linker.func_wrap("atrium", "shared_len", |caller: Caller<'_, HostScope>| {
        caller.data().shared.to_string().len() as i32
    })?;
    linker.func_wrap(
        "atrium",
        "shared_read",
        |mut caller: Caller<'_, HostScope>, ptr: i32, cap: i32| -> anyhow::Result<i32> {
            let blob = caller.data().shared.to_string();
            write_blob(&mut caller, ptr, cap, blob.as_bytes())
        },
    )?;
    linker.func_wrap(
        "atrium",
        "shared_write",
        |mut caller: Caller<'_, HostScope>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let value = read_json(&mut caller, ptr, len)?;
            caller.data_mut().shared = value;
            Ok(())
        },
    )?;

    // -- app proxy: blueprint config (read-only) -----------------------------
    linker.func_wrap("atrium", "config_len", |caller: Caller<'_, HostScope>| {
        caller.data().config.to_string().len() as i32
    })?;
    linker.func_wrap(
        "atrium",
        "config_read",
        |mut caller: Caller<'_, HostScope>, ptr: i32, cap: i32| -> anyhow::Result<i32> {
            let blob = caller.data().config.to_string();
            write_blob(&mut caller, ptr, cap, blob.as_bytes())
        },
    )?;

    // -- app proxy: transform -----------------------------------------------
    linker.func_wrap(
        "atrium",
        "set_position",
        |mut caller: Caller<'_, HostScope>, x: f64, y: f64, z: f64| {
            caller.data_mut().position = Some([x, y, z]);
        },
    )?;
    linker.func_wrap(
        "atrium",
        "set_quaternion",
        |mut caller: Caller<'_, HostScope>, x: f64, y: f64, z: f64, w: f64| {
            caller.data_mut().quaternion = Some([x, y, z, w]);
        },
    )?;

    // -- world proxy ---------------------------------------------------------
    linker.func_wrap(
        "atrium",
        "emit",
        |mut caller: Caller<'_, HostScope>,
         name_ptr: i32,
         name_len: i32,
         data_ptr: i32,
         data_len: i32|
         -> anyhow::Result<()> {
            let name = read_string(&mut caller, name_ptr, name_len)?;
            let data = if data_len == 0 {
                serde_json::Value::Null
            } else {
                read_json(&mut caller, data_ptr, data_len)?
            };
            caller.data_mut().events.push(ScriptEvent { name, data });
            Ok(())
        },
    )?;

    // -- event mailbox -------------------------------------------------------
    // While `on_event` runs, the delivered event is readable through these.
    linker.func_wrap("atrium", "event_name_len", |caller: Caller<'_, HostScope>| {
        caller
            .data()
            .current_event
            .as_ref()
            .map_or(0, |e| e.name.len() as i32)
    })?;
    linker.func_wrap(
        "atrium",
        "event_name_read",
        |mut caller: Caller<'_, HostScope>, ptr: i32, cap: i32| -> anyhow::Result<i32> {
            let name = caller
                .data()
                .current_event
                .as_ref()
                .map(|e| e.name.clone())
                .unwrap_or_default();
            write_blob(&mut caller, ptr, cap, name.as_bytes())
        },
    )?;
    linker.func_wrap("atrium", "event_data_len", |caller: Caller<'_, HostScope>| {
        caller
            .data()
            .current_event
            .as_ref()
            .map_or(0, |e| e.data.to_string().len() as i32)
    })?;
    linker.func_wrap(
        "atrium",
        "event_data_read",
        |mut caller: Caller<'_, HostScope>, ptr: i32, cap: i32| -> anyhow::Result<i32> {
            let data = caller
                .data()
                .current_event
                .as_ref()
                .map(|e| e.data.to_string())
                .unwrap_or_default();
            write_blob(&mut caller, ptr, cap, data.as_bytes())
        },
    )?;

    // -- fetch proxy ---------------------------------------------------------
    linker.func_wrap(
        "atrium",
        "fetch_begin",
        |mut caller: Caller<'_, HostScope>, url_ptr: i32, url_len: i32| -> anyhow::Result<i64> {
            let url = read_string(&mut caller, url_ptr, url_len)?;
            let scope = caller.data_mut();
            scope.fetches.push(url);
            Ok(scope.fetches.len() as i64)
        },
    )?;

    Ok(())
}
