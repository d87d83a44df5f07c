//! Nearest-neighbor tight-binding bands along a high-symmetry k-path.
//!
//! Lattice constants are 1 (nearest-neighbor distance 1 on the honeycomb).
//!
//! | lattice   | path          | bands |
//! |-----------|---------------|-------|
//! | chain     | Γ → X         | 1     |
//! | square    | Γ → X → M → Γ | 1     |
//! | honeycomb | Γ → K → M → Γ | 2     |

use std::f64::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scheduler::JobContext;

/// Largest accepted sampling density.
pub const MAX_POINTS_PER_SEGMENT: usize = 10_000;

/// Lattices with a built-in dispersion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lattice {
    Chain,
    Square,
    Honeycomb,
}

impl fmt::Display for Lattice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lattice::Chain => write!(f, "chain"),
            Lattice::Square => write!(f, "square"),
            Lattice::Honeycomb => write!(f, "honeycomb"),
        }
    }
}

impl std::str::FromStr for Lattice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chain" => Ok(Lattice::Chain),
            "square" => Ok(Lattice::Square),
            "honeycomb" | "graphene" => Ok(Lattice::Honeycomb),
            other => Err(format!("unknown lattice '{}'", other)),
        }
    }
}

impl Lattice {
    /// High-symmetry points visited by the path, with labels.
    fn path(self) -> Vec<(&'static str, [f64; 2])> {
        match self {
            Lattice::Chain => vec![("Γ", [0.0, 0.0]), ("X", [PI, 0.0])],
            Lattice::Square => vec![
                ("Γ", [0.0, 0.0]),
                ("X", [PI, 0.0]),
                ("M", [PI, PI]),
                ("Γ", [0.0, 0.0]),
            ],
            Lattice::Honeycomb => vec![
                ("Γ", [0.0, 0.0]),
                ("K", [2.0 * PI / 3.0, 2.0 * PI / (3.0 * 3f64.sqrt())]),
                ("M", [2.0 * PI / 3.0, 0.0]),
                ("Γ", [0.0, 0.0]),
            ],
        }
    }

    fn band_count(self) -> usize {
        match self {
            Lattice::Chain | Lattice::Square => 1,
            Lattice::Honeycomb => 2,
        }
    }

    /// Band energies at `k`, ascending.
    fn energies(self, k: [f64; 2], hopping: f64, onsite: f64) -> Vec<f64> {
        match self {
            Lattice::Chain => vec![onsite - 2.0 * hopping * k[0].cos()],
            Lattice::Square => vec![onsite - 2.0 * hopping * (k[0].cos() + k[1].cos())],
            Lattice::Honeycomb => {
                // f(k) = 1 + e^{ik·a1} + e^{ik·a2}, a1,2 = (3/2, ±√3/2)
                let half_sqrt3 = 3f64.sqrt() / 2.0;
                let phase1 = 1.5 * k[0] + half_sqrt3 * k[1];
                let phase2 = 1.5 * k[0] - half_sqrt3 * k[1];
                let re = 1.0 + phase1.cos() + phase2.cos();
                let im = phase1.sin() + phase2.sin();
                let magnitude = (hopping * (re * re + im * im).sqrt()).abs();
                vec![onsite - magnitude, onsite + magnitude]
            }
        }
    }
}

fn default_hopping() -> f64 {
    1.0
}

fn default_points_per_segment() -> usize {
    50
}

/// Input of a band structure job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandStructureParams {
    pub lattice: Lattice,
    /// Nearest-neighbor hopping amplitude `t`.
    #[serde(default = "default_hopping")]
    pub hopping: f64,
    /// On-site energy `ε`.
    #[serde(default)]
    pub onsite_energy: f64,
    /// k-points sampled per path segment.
    #[serde(default = "default_points_per_segment")]
    pub points_per_segment: usize,
}

impl BandStructureParams {
    pub fn new(lattice: Lattice) -> Self {
        Self {
            lattice,
            hopping: default_hopping(),
            onsite_energy: 0.0,
            points_per_segment: default_points_per_segment(),
        }
    }

    /// Builder method to set the hopping amplitude.
    pub fn with_hopping(mut self, hopping: f64) -> Self {
        self.hopping = hopping;
        self
    }

    /// Builder method to set the sampling density.
    pub fn with_points_per_segment(mut self, points: usize) -> Self {
        self.points_per_segment = points;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.hopping.is_finite() || !self.onsite_energy.is_finite() {
            return Err("hopping and onsite_energy must be finite".to_string());
        }
        if !(2..=MAX_POINTS_PER_SEGMENT).contains(&self.points_per_segment) {
            return Err(format!(
                "points_per_segment must be in 2..={}, got {}",
                MAX_POINTS_PER_SEGMENT, self.points_per_segment
            ));
        }
        Ok(())
    }
}

/// Bands sampled along the path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandStructure {
    pub lattice: Lattice,
    /// Labels of the high-symmetry points, in path order.
    pub path_labels: Vec<String>,
    /// Path distance at which each label sits.
    pub label_positions: Vec<f64>,
    pub k_points: Vec<[f64; 2]>,
    /// Cumulative path distance of each k-point.
    pub k_distance: Vec<f64>,
    /// `bands[b][i]` is the energy of band `b` at `k_points[i]`.
    pub bands: Vec<Vec<f64>>,
    /// Minimum of the upper band minus maximum of the lower, for two-band lattices.
    pub band_gap: Option<f64>,
    /// Energy range covered by all bands.
    pub bandwidth: f64,
}

/// Samples the bands. `progress` receives the completed fraction.
pub fn compute<F>(params: &BandStructureParams, mut progress: F) -> BandStructure
where
    F: FnMut(f64),
{
    let path = params.lattice.path();
    let segments = path.len() - 1;
    let per_segment = params.points_per_segment;
    let total_points = segments * per_segment + 1;

    let mut k_points = Vec::with_capacity(total_points);
    let mut k_distance = Vec::with_capacity(total_points);
    let mut label_positions = vec![0.0];
    let mut travelled = 0.0;

    for (segment, pair) in path.windows(2).enumerate() {
        let (from, to) = (pair[0].1, pair[1].1);
        let length = ((to[0] - from[0]).powi(2) + (to[1] - from[1]).powi(2)).sqrt();
        // The segment end is emitted as the next segment's start, or below.
        for step in 0..per_segment {
            let t = step as f64 / per_segment as f64;
            k_points.push([
                from[0] + t * (to[0] - from[0]),
                from[1] + t * (to[1] - from[1]),
            ]);
            k_distance.push(travelled + t * length);
        }
        travelled += length;
        label_positions.push(travelled);
        progress((segment + 1) as f64 / (segments + 1) as f64);
    }
    if let Some(&(_, end)) = path.last() {
        k_points.push(end);
        k_distance.push(travelled);
    }

    let mut bands = vec![Vec::with_capacity(k_points.len()); params.lattice.band_count()];
    for &k in &k_points {
        for (band, energy) in params
            .lattice
            .energies(k, params.hopping, params.onsite_energy)
            .into_iter()
            .enumerate()
        {
            bands[band].push(energy);
        }
    }
    progress(1.0);

    let min_of = |band: &[f64]| band.iter().copied().fold(f64::INFINITY, f64::min);
    let max_of = |band: &[f64]| band.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let band_gap = match bands.as_slice() {
        [lower, upper] => Some((min_of(upper.as_slice()) - max_of(lower.as_slice())).max(0.0)),
        _ => None,
    };
    let bandwidth = bands
        .iter()
        .map(|b| max_of(b.as_slice()))
        .fold(f64::NEG_INFINITY, f64::max)
        - bands
            .iter()
            .map(|b| min_of(b.as_slice()))
            .fold(f64::INFINITY, f64::min);

    BandStructure {
        lattice: params.lattice,
        path_labels: path.iter().map(|(label, _)| label.to_string()).collect(),
        label_positions,
        k_points,
        k_distance,
        bands,
        band_gap,
        bandwidth,
    }
}

/// Job body for [`JobKind::BandStructure`](crate::scheduler::JobKind::BandStructure).
pub fn run(ctx: &JobContext) -> Result<Value, String> {
    let params: BandStructureParams = super::decode(ctx)?;
    params.validate()?;

    let points = (params.lattice.path().len() - 1) * params.points_per_segment + 1;
    // k-points, distances and one energy per band per point.
    let per_point = 2 + 1 + params.lattice.band_count();
    ctx.record_memory((points * per_point * std::mem::size_of::<f64>()) as u64);

    let bands = compute(&params, |fraction| ctx.report_progress(fraction));
    super::encode(&bands)
}
