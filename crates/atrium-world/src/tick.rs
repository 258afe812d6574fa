//! The four-phase tick driver.
//!
//! Fixed physics steps run at `tick_rate` (default 50 Hz) out of an
//! accumulator; the variable, late and post-late phases run once per
//! frame. The variable dt is clamped to a ceiling so a lag spike cannot
//! schedule an unbounded amount of catch-up work. Inbound packets and
//! chat-driven events are drained into the world *between* frames by the
//! session layer, never mid-phase.

/// Phase hooks the engine drives. Implemented by the world.
pub trait TickPhases {
    /// Fixed-rate physics step.
    fn fixed_update(&mut self, dt: f64);
    /// Variable-rate update.
    fn update(&mut self, dt: f64);
    /// Late phase (cameras, interpolation targets).
    fn late_update(&mut self, dt: f64);
    /// Post-late phase (render handoff, network flush).
    fn post_late_update(&mut self, dt: f64);
}

/// Tick timing configuration.
#[derive(Debug, Clone)]
pub struct TickConfig {
    /// Fixed steps per second.
    pub tick_rate: u32,
    /// Ceiling on the per-frame variable dt, seconds.
    pub max_frame_dt: f64,
}

impl Default for TickConfig {
    /// 50 Hz fixed step, 250 ms frame ceiling.
    fn default() -> Self {
        Self {
            tick_rate: 50,
            max_frame_dt: 0.25,
        }
    }
}

/// Drives the phases. Owns only timing state; all world state lives with
/// the caller.
#[derive(Debug)]
pub struct TickEngine {
    config: TickConfig,
    accumulator: f64,
    tick_count: u64,
}

impl TickEngine {
    /// New engine at tick zero.
    pub fn new(config: TickConfig) -> Self {
        assert!(config.tick_rate > 0, "tick_rate must be positive");
        Self {
            config,
            accumulator: 0.0,
            tick_count: 0,
        }
    }

    /// The fixed step length, seconds.
    pub fn fixed_dt(&self) -> f64 {
        1.0 / f64::from(self.config.tick_rate)
    }

    /// Number of fixed steps executed so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Simulation time: computed from the tick count rather than
    /// accumulated, so it cannot drift.
    pub fn sim_time(&self) -> f64 {
        self.tick_count as f64 * self.fixed_dt()
    }

    /// Run one frame: as many fixed steps as the accumulator affords, then
    /// the three variable phases. Returns the number of fixed steps run.
    pub fn advance<T: TickPhases>(&mut self, target: &mut T, frame_dt: f64) -> u32 {
        let frame_dt = frame_dt.clamp(0.0, self.config.max_frame_dt);
        let step = self.fixed_dt();
        self.accumulator += frame_dt;

        let mut steps = 0u32;
        while self.accumulator >= step {
            target.fixed_update(step);
            self.accumulator -= step;
            self.tick_count += 1;
            steps += 1;
        }

        target.update(frame_dt);
        target.late_update(frame_dt);
        target.post_late_update(frame_dt);
        steps
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<&'static str>,
        fixed_dts: Vec<f64>,
    }

    impl TickPhases for Recorder {
        fn fixed_update(&mut self, dt: f64) {
            self.calls.push("fixed");
            self.fixed_dts.push(dt);
        }
        fn update(&mut self, _dt: f64) {
            self.calls.push("update");
        }
        fn late_update(&mut self, _dt: f64) {
            self.calls.push("late");
        }
        fn post_late_update(&mut self, _dt: f64) {
            self.calls.push("post");
        }
    }

    #[test]
    fn phases_run_in_order() {
        let mut engine = TickEngine::new(TickConfig::default());
        let mut rec = Recorder::default();
        engine.advance(&mut rec, 0.02); // exactly one fixed step
        assert_eq!(rec.calls, vec!["fixed", "update", "late", "post"]);
    }

    #[test]
    fn accumulator_carries_remainder_across_frames() {
        let mut engine = TickEngine::new(TickConfig::default());
        let mut rec = Recorder::default();

        // Three 15 ms frames = 45 ms = two 20 ms steps + 5 ms remainder.
        let mut total_steps = 0;
        for _ in 0..3 {
            total_steps += engine.advance(&mut rec, 0.015);
        }
        assert_eq!(total_steps, 2);
        assert_eq!(engine.tick_count(), 2);
    }

    #[test]
    fn fixed_dt_is_constant() {
        let mut engine = TickEngine::new(TickConfig::default());
        let mut rec = Recorder::default();
        engine.advance(&mut rec, 0.123);
        assert!(rec.fixed_dts.iter().all(|&dt| (dt - 0.02).abs() < 1e-12));
    }

    #[test]
    fn lag_spike_is_clamped() {
        let mut engine = TickEngine::new(TickConfig::default());
        let mut rec = Recorder::default();
        // A 10-second stall must not schedule 500 steps.
        let steps = engine.advance(&mut rec, 10.0);
        assert_eq!(steps, (0.25 / 0.02) as u32);
    }

    #[test]
    fn sim_time_is_computed_not_accumulated() {
        let mut engine = TickEngine::new(TickConfig::default());
        let mut rec = Recorder::default();
        for _ in 0..1000 {
            engine.advance(&mut rec, 0.02);
        }
        assert_eq!(engine.sim_time(), engine.tick_count() as f64 * 0.02);
        assert_eq!(engine.tick_count(), 1000);
    }
}
