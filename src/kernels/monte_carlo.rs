//! Metropolis Monte Carlo for the 2D Ising model on a periodic square lattice.
//!
//! Hamiltonian: `H = −J Σ⟨ij⟩ sᵢ sⱼ − h Σ sᵢ`. The lattice starts fully
//! ordered, is thermalized, then sampled once per sweep.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scheduler::JobContext;

/// Largest accepted lattice edge.
pub const MAX_LATTICE_SIZE: usize = 1024;

/// Largest accepted count for either sweep phase.
pub const MAX_SWEEPS: usize = 10_000_000;

fn default_coupling() -> f64 {
    1.0
}

fn default_thermalization_sweeps() -> usize {
    200
}

fn default_measurement_sweeps() -> usize {
    1000
}

/// Input of a Monte Carlo job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Edge length `L` of the `L × L` lattice.
    pub lattice_size: usize,
    /// Temperature in units of `J / k_B`.
    pub temperature: f64,
    /// Exchange coupling `J`.
    #[serde(default = "default_coupling")]
    pub coupling: f64,
    /// External field `h`.
    #[serde(default)]
    pub external_field: f64,
    /// Sweeps discarded before measuring.
    #[serde(default = "default_thermalization_sweeps")]
    pub thermalization_sweeps: usize,
    /// Sweeps sampled.
    #[serde(default = "default_measurement_sweeps")]
    pub measurement_sweeps: usize,
    /// RNG seed. A random seed is drawn when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl SimulationParams {
    /// Parameters with default coupling, zero field and default sweep counts.
    pub fn new(lattice_size: usize, temperature: f64) -> Self {
        Self {
            lattice_size,
            temperature,
            coupling: default_coupling(),
            external_field: 0.0,
            thermalization_sweeps: default_thermalization_sweeps(),
            measurement_sweeps: default_measurement_sweeps(),
            seed: None,
        }
    }

    /// Builder method to fix the RNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builder method to set both sweep counts.
    pub fn with_sweeps(mut self, thermalization: usize, measurement: usize) -> Self {
        self.thermalization_sweeps = thermalization;
        self.measurement_sweeps = measurement;
        self
    }

    /// Checks ranges of every parameter.
    pub fn validate(&self) -> Result<(), String> {
        if !(2..=MAX_LATTICE_SIZE).contains(&self.lattice_size) {
            return Err(format!(
                "lattice_size must be in 2..={}, got {}",
                MAX_LATTICE_SIZE, self.lattice_size
            ));
        }
        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(format!(
                "temperature must be positive and finite, got {}",
                self.temperature
            ));
        }
        if !self.coupling.is_finite() || !self.external_field.is_finite() {
            return Err("coupling and external_field must be finite".to_string());
        }
        if self.measurement_sweeps == 0 {
            return Err("measurement_sweeps must be greater than 0".to_string());
        }
        if self.thermalization_sweeps > MAX_SWEEPS || self.measurement_sweeps > MAX_SWEEPS {
            return Err(format!(
                "sweep counts must be at most {}, got {} + {}",
                MAX_SWEEPS, self.thermalization_sweeps, self.measurement_sweeps
            ));
        }
        Ok(())
    }
}

/// Thermodynamic averages of a simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    /// Mean absolute magnetization per spin.
    pub magnetization: f64,
    /// Mean energy per spin.
    pub energy: f64,
    /// Specific heat per spin.
    pub specific_heat: f64,
    /// Magnetic susceptibility per spin.
    pub susceptibility: f64,
    /// Fraction of proposed flips that were accepted.
    pub acceptance_rate: f64,
    /// Sweeps run, thermalization included.
    pub sweeps: usize,
    /// Seed that produced this run.
    pub seed: u64,
}

struct Lattice {
    size: usize,
    spins: Vec<i8>,
}

impl Lattice {
    fn ordered(size: usize) -> Self {
        Self {
            size,
            spins: vec![1; size * size],
        }
    }

    fn spin(&self, row: usize, col: usize) -> f64 {
        f64::from(self.spins[row * self.size + col])
    }

    fn neighbor_sum(&self, row: usize, col: usize) -> f64 {
        let l = self.size;
        self.spin((row + 1) % l, col)
            + self.spin((row + l - 1) % l, col)
            + self.spin(row, (col + 1) % l)
            + self.spin(row, (col + l - 1) % l)
    }

    fn magnetization(&self) -> f64 {
        self.spins.iter().map(|&s| f64::from(s)).sum()
    }

    fn energy(&self, coupling: f64, field: f64) -> f64 {
        let l = self.size;
        let mut bonds = 0.0;
        for row in 0..l {
            for col in 0..l {
                // Right and down neighbors count each bond once.
                let s = self.spin(row, col);
                bonds += s * (self.spin(row, (col + 1) % l) + self.spin((row + 1) % l, col));
            }
        }
        -coupling * bonds - field * self.magnetization()
    }
}

/// Runs the simulation. `progress` receives the completed fraction.
pub fn simulate<F>(params: &SimulationParams, seed: u64, mut progress: F) -> SimulationResult
where
    F: FnMut(f64),
{
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let l = params.lattice_size;
    let n = (l * l) as f64;
    let beta = 1.0 / params.temperature;

    let mut lattice = Lattice::ordered(l);
    let mut energy = lattice.energy(params.coupling, params.external_field);
    let mut magnetization = lattice.magnetization();

    let total_sweeps = params
        .thermalization_sweeps
        .saturating_add(params.measurement_sweeps);
    let report_every = (total_sweeps / 20).max(1);

    let mut accepted: u64 = 0;
    let mut proposed: u64 = 0;
    let (mut sum_e, mut sum_e2, mut sum_m, mut sum_m2) = (0.0, 0.0, 0.0, 0.0);

    for sweep in 0..total_sweeps {
        for _ in 0..l * l {
            let row = rng.random_range(0..l);
            let col = rng.random_range(0..l);
            let s = lattice.spin(row, col);
            let delta = 2.0
                * s
                * (params.coupling * lattice.neighbor_sum(row, col) + params.external_field);

            proposed += 1;
            if delta <= 0.0 || rng.random::<f64>() < (-beta * delta).exp() {
                lattice.spins[row * l + col] = -lattice.spins[row * l + col];
                energy += delta;
                magnetization -= 2.0 * s;
                accepted += 1;
            }
        }

        if sweep >= params.thermalization_sweeps {
            sum_e += energy;
            sum_e2 += energy * energy;
            sum_m += magnetization.abs();
            sum_m2 += magnetization * magnetization;
        }

        if (sweep + 1) % report_every == 0 || sweep + 1 == total_sweeps {
            progress((sweep + 1) as f64 / total_sweeps as f64);
        }
    }

    let samples = params.measurement_sweeps as f64;
    let mean_e = sum_e / samples;
    let mean_m = sum_m / samples;
    let var_e = (sum_e2 / samples - mean_e * mean_e).max(0.0);
    let var_m = (sum_m2 / samples - mean_m * mean_m).max(0.0);

    SimulationResult {
        magnetization: mean_m / n,
        energy: mean_e / n,
        specific_heat: var_e * beta * beta / n,
        susceptibility: var_m * beta / n,
        acceptance_rate: accepted as f64 / proposed.max(1) as f64,
        sweeps: total_sweeps,
        seed,
    }
}

/// Job body for [`JobKind::MonteCarlo`](crate::scheduler::JobKind::MonteCarlo).
pub fn run(ctx: &JobContext) -> Result<Value, String> {
    let params: SimulationParams = super::decode(ctx)?;
    params.validate()?;

    let seed = params.seed.unwrap_or_else(|| rand::rng().random());
    let spins = params.lattice_size * params.lattice_size;
    ctx.record_memory((spins * std::mem::size_of::<i8>()) as u64);

    let result = simulate(&params, seed, |fraction| ctx.report_progress(fraction));
    super::encode(&result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobId;
    use std::sync::Arc;

    #[test]
    fn test_ordered_lattice_energy() {
        let lattice = Lattice::ordered(4);
        // 2 bonds per site, all aligned.
        assert_eq!(lattice.energy(1.0, 0.0), -32.0);
        assert_eq!(lattice.energy(1.0, 0.5), -40.0);
        assert_eq!(lattice.magnetization(), 16.0);
    }

    #[test]
    fn test_low_temperature_stays_ordered() {
        let params = SimulationParams::new(8, 1.0).with_sweeps(100, 300);
        let result = simulate(&params, 7, |_| {});

        assert!(result.magnetization > 0.9, "m = {}", result.magnetization);
        assert!(result.energy < -1.8, "e = {}", result.energy);
        assert_eq!(result.sweeps, 400);
    }

    #[test]
    fn test_high_temperature_disorders() {
        let params = SimulationParams::new(16, 10.0).with_sweeps(200, 500);
        let result = simulate(&params, 11, |_| {});

        assert!(result.magnetization < 0.3, "m = {}", result.magnetization);
        assert!(result.acceptance_rate > 0.5);
    }

    #[test]
    fn test_same_seed_is_reproducible() {
        let params = SimulationParams::new(6, 2.3).with_sweeps(20, 50);
        let a = simulate(&params, 42, |_| {});
        let b = simulate(&params, 42, |_| {});
        assert_eq!(a, b);
    }

    #[test]
    fn test_progress_is_monotonic_and_complete() {
        let params = SimulationParams::new(4, 2.0).with_sweeps(10, 30);
        let mut seen = Vec::new();
        simulate(&params, 1, |f| seen.push(f));

        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.last().copied(), Some(1.0));
    }

    #[test]
    fn test_validation() {
        assert!(SimulationParams::new(1, 1.0).validate().is_err());
        assert!(SimulationParams::new(8, 0.0).validate().is_err());
        assert!(SimulationParams::new(8, f64::INFINITY).validate().is_err());
        assert!(SimulationParams::new(8, 1.0)
            .with_sweeps(10, 0)
            .validate()
            .is_err());
        assert!(SimulationParams::new(8, 2.269).validate().is_ok());
    }

    #[test]
    fn test_validation_bounds_sweep_counts() {
        let err = SimulationParams::new(4, 2.0)
            .with_sweeps(usize::MAX, 1)
            .validate()
            .expect_err("thermalization too long");
        assert!(err.contains("sweep counts"));

        assert!(SimulationParams::new(4, 2.0)
            .with_sweeps(1, MAX_SWEEPS + 1)
            .validate()
            .is_err());
        assert!(SimulationParams::new(4, 2.0)
            .with_sweeps(MAX_SWEEPS, MAX_SWEEPS)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_body_rejects_overflowing_sweeps() {
        let payload = serde_json::to_value(
            SimulationParams::new(4, 2.0)
                .with_sweeps(usize::MAX, 1)
                .with_seed(1),
        )
        .expect("params encode");
        let ctx = JobContext::new(JobId(1), 1, Arc::new(payload), None);

        let err = run(&ctx).expect_err("sweeps out of range");
        assert!(err.contains("sweep counts"));
    }
}
