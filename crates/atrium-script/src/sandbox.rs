//! Script loading, validation and execution.
//!
//! [`ScriptInstance`] wraps a Wasmtime instance of one app script. Unlike a
//! conventional plugin host there is no required entry point: every
//! lifecycle handler is optional, and an app whose script exports nothing
//! is simply inert. Fuel is reset before each handler call so one frame's
//! budget cannot starve the next.

use wasmtime::{Engine, Instance, Linker, Module, Store, TypedFunc};

use crate::host::{register_host_api, HostScope, ScriptOutputs};
use crate::ScriptError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Budgets for one script instance.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Fuel units granted per handler call. Exhaustion traps with
    /// [`ScriptError::OutOfFuel`]. Default: 1,000,000.
    pub fuel_per_call: u64,

    /// Maximum linear memory the module may hold, in bytes.
    /// Default: 16 MiB.
    pub memory_limit_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            fuel_per_call: 1_000_000,
            memory_limit_bytes: 16 * 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptInstance
// ---------------------------------------------------------------------------

/// A loaded, validated app script.
///
/// # Sandbox guarantees
///
/// - No WASI: no filesystem, network, threads or wall-clock.
/// - The only imports satisfied are the `"atrium"` host functions; a module
///   importing anything else fails instantiation.
/// - Fuel metering bounds every handler call; memory growth is capped.
impl std::fmt::Debug for ScriptInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptInstance").finish_non_exhaustive()
    }
}

pub struct ScriptInstance {
    store: Store<HostScope>,
    #[allow(dead_code)]
    instance: Instance,
    start_fn: Option<TypedFunc<(), ()>>,
    fixed_update_fn: Option<TypedFunc<f64, ()>>,
    update_fn: Option<TypedFunc<f64, ()>>,
    late_update_fn: Option<TypedFunc<f64, ()>>,
    destroy_fn: Option<TypedFunc<(), ()>>,
    on_event_fn: Option<TypedFunc<(), ()>>,
    config: SandboxConfig,
}

impl ScriptInstance {
    /// Compile and instantiate a script from raw bytes (binary `.wasm` or
    /// text `.wat`; wasmtime handles both transparently).
    ///
    /// `state` is the app's replicated script-owned blob; `shared` is the
    /// rebuild-surviving record for this (blueprint, version);
    /// `blueprint_config` is the blueprint's read-only config map.
    ///
    /// # Errors
    ///
    /// - [`ScriptError::Compile`] for invalid bytes.
    /// - [`ScriptError::BadHandler`] if a lifecycle export has the wrong
    ///   signature.
    /// - [`ScriptError::Runtime`] for unsatisfied imports or engine
    ///   failures.
    pub fn load(
        config: &SandboxConfig,
        bytes: &[u8],
        state: serde_json::Value,
        shared: serde_json::Value,
        blueprint_config: serde_json::Value,
        app_label: String,
    ) -> Result<Self, ScriptError> {
        let mut engine_config = wasmtime::Config::new();
        engine_config.consume_fuel(true);
        let engine = Engine::new(&engine_config)
            .map_err(|e| ScriptError::Runtime(format!("failed to create engine: {e}")))?;

        let module =
            Module::new(&engine, bytes).map_err(|e| ScriptError::Compile(format!("{e}")))?;

        let mut scope = HostScope::new(state, shared, blueprint_config, app_label);
        scope.limits = wasmtime::StoreLimitsBuilder::new()
            .memory_size(config.memory_limit_bytes)
            .build();

        let mut store = Store::new(&engine, scope);
        store.limiter(|scope| &mut scope.limits);
        store
            .set_fuel(config.fuel_per_call)
            .map_err(|e| ScriptError::Runtime(format!("failed to set fuel: {e}")))?;

        let mut linker = Linker::new(&engine);
        register_host_api(&mut linker)
            .map_err(|e| ScriptError::Runtime(format!("host api registration failed: {e}")))?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| ScriptError::Runtime(format!("{e}")))?;

        let start_fn = optional_func(&mut store, &instance, "start")?;
        let fixed_update_fn = optional_func(&mut store, &instance, "fixed_update")?;
        let update_fn = optional_func(&mut store, &instance, "update")?;
        let late_update_fn = optional_func(&mut store, &instance, "late_update")?;
        let destroy_fn = optional_func(&mut store, &instance, "destroy")?;
        let on_event_fn = optional_func(&mut store, &instance, "on_event")?;

        tracing::debug!(
            fuel_per_call = config.fuel_per_call,
            memory_limit = config.memory_limit_bytes,
            has_start = start_fn.is_some(),
            has_fixed_update = fixed_update_fn.is_some(),
            has_update = update_fn.is_some(),
            "script instantiated"
        );

        Ok(Self {
            store,
            instance,
            start_fn,
            fixed_update_fn,
            update_fn,
            late_update_fn,
            destroy_fn,
            on_event_fn,
            config: config.clone(),
        })
    }

    /// Run `start`, if exported.
    ///
    /// # Errors
    ///
    /// Trap / fuel / memory errors; the caller routes them to `App::crash`.
    pub fn call_start(
        &mut self,
        tick: u64,
        sim_time: f64,
    ) -> Result<ScriptOutputs, ScriptError> {
        self.store.data_mut().begin_call(tick, sim_time, 0.0);
        if let Some(f) = self.start_fn.clone() {
            self.reset_fuel()?;
            f.call(&mut self.store, ())
                .map_err(|e| self.classify_trap(e))?;
        }
        Ok(self.store.data_mut().drain_outputs())
    }

    /// Run `fixed_update(dt)`, if exported.
    pub fn call_fixed_update(
        &mut self,
        tick: u64,
        sim_time: f64,
        dt: f64,
    ) -> Result<ScriptOutputs, ScriptError> {
        self.call_dt(Self::pick_fixed_update, tick, sim_time, dt)
    }

    /// Run `update(dt)`, if exported.
    pub fn call_update(
        &mut self,
        tick: u64,
        sim_time: f64,
        dt: f64,
    ) -> Result<ScriptOutputs, ScriptError> {
        self.call_dt(Self::pick_update, tick, sim_time, dt)
    }

    /// Run `late_update(dt)`, if exported.
    pub fn call_late_update(
        &mut self,
        tick: u64,
        sim_time: f64,
        dt: f64,
    ) -> Result<ScriptOutputs, ScriptError> {
        self.call_dt(Self::pick_late_update, tick, sim_time, dt)
    }

    /// Deliver a named entity event through the mailbox and run the
    /// script's `on_event` export, if present. The event is readable by
    /// the script through `event_name_read` / `event_data_read` for the
    /// duration of the call.
    pub fn call_on_event(
        &mut self,
        name: &str,
        data: serde_json::Value,
        tick: u64,
        sim_time: f64,
    ) -> Result<ScriptOutputs, ScriptError> {
        self.store.data_mut().begin_call(tick, sim_time, 0.0);
        self.store.data_mut().current_event = Some(crate::host::ScriptEvent {
            name: name.to_owned(),
            data,
        });
        let result = if let Some(f) = self.on_event_fn.clone() {
            self.reset_fuel()?;
            f.call(&mut self.store, ())
                .map_err(|e| self.classify_trap(e))
        } else {
            Ok(())
        };
        self.store.data_mut().current_event = None;
        result?;
        Ok(self.store.data_mut().drain_outputs())
    }

    /// Run `destroy`, if exported. Errors are reported but the unbuild that
    /// called this proceeds regardless.
    pub fn call_destroy(&mut self) -> Result<ScriptOutputs, ScriptError> {
        if let Some(f) = self.destroy_fn.clone() {
            self.reset_fuel()?;
            f.call(&mut self.store, ())
                .map_err(|e| self.classify_trap(e))?;
        }
        Ok(self.store.data_mut().drain_outputs())
    }

    /// Whether the script reacts to the fixed phase. Apps with no per-tick
    /// handlers stay out of the hot set.
    pub fn wants_ticks(&self) -> bool {
        self.fixed_update_fn.is_some() || self.update_fn.is_some() || self.late_update_fn.is_some()
    }

    /// Take the shared record back out, for preservation across a rebuild.
    pub fn take_shared(&mut self) -> serde_json::Value {
        std::mem::take(&mut self.store.data_mut().shared)
    }

    /// The configured budgets.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    // -- internals ----------------------------------------------------------

    fn pick_fixed_update(&self) -> Option<TypedFunc<f64, ()>> {
        self.fixed_update_fn.clone()
    }

    fn pick_update(&self) -> Option<TypedFunc<f64, ()>> {
        self.update_fn.clone()
    }

    fn pick_late_update(&self) -> Option<TypedFunc<f64, ()>> {
        self.late_update_fn.clone()
    }

    fn call_dt(
        &mut self,
        pick: fn(&Self) -> Option<TypedFunc<f64, ()>>,
        tick: u64,
        sim_time: f64,
        dt: f64,
    ) -> Result<ScriptOutputs, ScriptError> {
        self.store.data_mut().begin_call(tick, sim_time, dt);
        if let Some(f) = pick(self) {
            self.reset_fuel()?;
            f.call(&mut self.store, dt)
                .map_err(|e| self.classify_trap(e))?;
        }
        Ok(self.store.data_mut().drain_outputs())
    }

    /// Reset fuel to the per-call budget. Wasmtime's `set_fuel` replaces
    /// the tank, so one call is enough.
    fn reset_fuel(&mut self) -> Result<(), ScriptError> {
        self.store
            .set_fuel(self.config.fuel_per_call)
            .map_err(|e| ScriptError::Runtime(format!("failed to reset fuel: {e}")))
    }

    /// Classify a Wasmtime error into the matching [`ScriptError`].
    fn classify_trap(&self, error: anyhow::Error) -> ScriptError {
        for cause in error.chain() {
            if let Some(trap) = cause.downcast_ref::<wasmtime::Trap>() {
                if *trap == wasmtime::Trap::OutOfFuel {
                    return ScriptError::OutOfFuel {
                        budget: self.config.fuel_per_call,
                    };
                }
                return ScriptError::Trap(format!("{error}"));
            }
        }
        // Memory-limiter rejections surface as a grow failure message.
        let text = format!("{error}");
        if text.contains("memory") && text.contains("grow") {
            return ScriptError::MemoryLimit {
                limit_bytes: self.config.memory_limit_bytes,
            };
        }
        ScriptError::Runtime(text)
    }
}

/// Resolve an optional lifecycle export, rejecting wrong signatures.
fn optional_func<P, R>(
    store: &mut Store<HostScope>,
    instance: &Instance,
    name: &'static str,
) -> Result<Option<TypedFunc<P, R>>, ScriptError>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    match instance.get_func(&mut *store, name) {
        None => Ok(None),
        Some(func) => func
            .typed(&*store)
            .map(Some)
            .map_err(|e| ScriptError::BadHandler {
                name,
                reason: format!("{e}"),
            }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
