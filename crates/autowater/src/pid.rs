//! Per-plant PID controllers.
//!
//! One evaluation is one sample of a discrete PID running at the cadence the
//! process is invoked at. The integral and last error are carried between
//! invocations through the plant store, so the controller behaves as if it
//! had never stopped.

use std::collections::HashMap;

use crate::store::{Plant, PlantConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Controller {
    gains: Gains,
    setpoint: f64,
    max_output: f64,
    integral: f64,
    last_error: f64,
}

impl Controller {
    /// Output is clamped to `[0, max_output]`.
    pub fn new(gains: Gains, setpoint: f64, max_output: f64) -> Self {
        Self {
            gains,
            setpoint,
            max_output: max_output.max(0.0),
            integral: 0.0,
            last_error: 0.0,
        }
    }

    pub fn with_state(mut self, integral: f64, last_error: f64) -> Self {
        self.integral = integral;
        self.last_error = last_error;
        self
    }

    /// Controller for one plant, seeded from its persisted state unless
    /// `reset` asks for a clean start.
    pub fn for_plant(cfg: &PlantConfig, reset: bool) -> Self {
        let c = Self::new(
            Gains {
                kp: cfg.kp,
                ki: cfg.ki,
                kd: cfg.kd,
            },
            cfg.target,
            cfg.max_watering_time,
        );
        if reset {
            c
        } else {
            c.with_state(cfg.integral, cfg.last_error)
        }
    }

    /// Advance one sample and return the clamped output. Stateful: call
    /// exactly once per plant per pass.
    pub fn evaluate(&mut self, measurement: f64) -> f64 {
        if !measurement.is_finite() {
            return 0.0;
        }
        let error = self.setpoint - measurement;

        let proportional = self.gains.kp * error;
        // Clamp the accumulator to the output range to avoid windup.
        self.integral = self.clamp(self.integral + self.gains.ki * error);
        let derivative = self.gains.kd * (error - self.last_error);
        self.last_error = error;

        self.clamp(proportional + self.integral + derivative)
    }

    /// `(integral, last_error)` as they stand after the latest evaluation.
    pub fn snapshot(&self) -> (f64, f64) {
        (self.integral, self.last_error)
    }

    fn clamp(&self, v: f64) -> f64 {
        v.clamp(0.0, self.max_output)
    }
}

/// All controllers for one pass, keyed by plant name.
#[derive(Debug, Default)]
pub struct ControllerBank {
    controllers: HashMap<String, Controller>,
}

impl ControllerBank {
    pub fn new(plants: &[Plant], reset: bool) -> Self {
        Self {
            controllers: plants
                .iter()
                .map(|p| (p.name.clone(), Controller::for_plant(&p.config, reset)))
                .collect(),
        }
    }

    pub fn evaluate(&mut self, plant: &str, measurement: f64) -> Option<f64> {
        self.controllers
            .get_mut(plant)
            .map(|c| c.evaluate(measurement))
    }

    pub fn snapshot(&self, plant: &str) -> Option<(f64, f64)> {
        self.controllers.get(plant).map(Controller::snapshot)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{plant, plant_config};

    fn p_only(kp: f64) -> Gains {
        Gains {
            kp,
            ki: 0.0,
            kd: 0.0,
        }
    }

    #[test]
    fn dry_soil_asks_for_water() {
        let mut c = Controller::new(p_only(2.0), 30.0, 25.0);
        assert_eq!(c.evaluate(25.0), 10.0);
    }

    #[test]
    fn wet_soil_clamps_to_zero() {
        let mut c = Controller::new(p_only(2.0), 30.0, 25.0);
        assert_eq!(c.evaluate(45.0), 0.0);
    }

    #[test]
    fn output_never_exceeds_max() {
        let mut c = Controller::new(p_only(100.0), 30.0, 25.0);
        for m in [0.0, 5.0, 10.0, 29.0] {
            let v = c.evaluate(m);
            assert!((0.0..=25.0).contains(&v), "{v}");
        }
    }

    #[test]
    fn integral_accumulates_and_is_anti_windup_clamped() {
        let mut c = Controller::new(
            Gains {
                kp: 0.0,
                ki: 1.0,
                kd: 0.0,
            },
            30.0,
            25.0,
        );
        assert_eq!(c.evaluate(20.0), 10.0);
        assert_eq!(c.evaluate(20.0), 20.0);
        assert_eq!(c.evaluate(20.0), 25.0);
        assert_eq!(c.snapshot(), (25.0, 10.0));
        // Soil overshoots; integral unwinds from the clamp, not from 30.
        assert_eq!(c.evaluate(35.0), 20.0);
    }

    #[test]
    fn derivative_uses_persisted_last_error() {
        let g = Gains {
            kp: 0.0,
            ki: 0.0,
            kd: 1.0,
        };
        let mut c = Controller::new(g, 30.0, 25.0).with_state(0.0, 2.0);
        // error 8, last 2 → d = 6
        assert_eq!(c.evaluate(22.0), 6.0);
        assert_eq!(c.snapshot(), (0.0, 8.0));
    }

    #[test]
    fn for_plant_seeds_or_resets_state() {
        let mut cfg = plant_config();
        cfg.integral = 4.0;
        cfg.last_error = 1.5;
        assert_eq!(Controller::for_plant(&cfg, false).snapshot(), (4.0, 1.5));
        assert_eq!(Controller::for_plant(&cfg, true).snapshot(), (0.0, 0.0));
    }

    #[test]
    fn evaluate_twice_gives_different_answers() {
        let mut cfg = plant_config();
        cfg.kp = 0.0;
        cfg.ki = 1.0;
        let mut c = Controller::for_plant(&cfg, true);
        let a = c.evaluate(28.0);
        let b = c.evaluate(28.0);
        assert_ne!(a, b);
    }

    #[test]
    fn nan_measurement_leaves_state_untouched() {
        let mut c = Controller::new(p_only(1.0), 30.0, 25.0).with_state(3.0, 1.0);
        assert_eq!(c.evaluate(f64::NAN), 0.0);
        assert_eq!(c.snapshot(), (3.0, 1.0));
    }

    #[test]
    fn bank_tracks_plants_independently() {
        let mut fern = plant("fern");
        fern.config.integral = 5.0;
        let basil = plant("basil");

        let mut bank = ControllerBank::new(&[fern, basil], false);
        bank.evaluate("basil", 30.0).unwrap();
        assert_eq!(bank.snapshot("fern"), Some((5.0, 0.0)));
        assert_eq!(bank.snapshot("basil"), Some((0.0, 0.0)));
        assert_eq!(bank.evaluate("cactus", 10.0), None);
    }
}
