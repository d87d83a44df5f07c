//! Leading eigenpairs of a real symmetric matrix.
//!
//! Uses power iteration on the current matrix, then Hotelling deflation
//! (`A ← A − λ v vᵀ`) to expose the next eigenpair. Eigenvalues come out in
//! order of decreasing magnitude.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scheduler::JobContext;

/// Relative tolerance for the symmetry check.
const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// Largest accepted matrix dimension.
pub const MAX_DIMENSION: usize = 2048;

fn default_num_eigenvalues() -> usize {
    1
}

fn default_max_iterations() -> usize {
    1000
}

fn default_tolerance() -> f64 {
    1e-10
}

/// Input of a diagonalization job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagonalizationRequest {
    /// Row-major symmetric matrix.
    pub matrix: Vec<Vec<f64>>,
    /// How many leading eigenpairs to compute.
    #[serde(default = "default_num_eigenvalues")]
    pub num_eigenvalues: usize,
    /// Power iteration cap per eigenpair.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Residual tolerance, relative to the eigenvalue magnitude.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

impl DiagonalizationRequest {
    /// Requests the leading `num_eigenvalues` eigenpairs with default settings.
    pub fn new(matrix: Vec<Vec<f64>>, num_eigenvalues: usize) -> Self {
        Self {
            matrix,
            num_eigenvalues,
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
        }
    }

    /// Checks shape, finiteness, symmetry and the requested count.
    pub fn validate(&self) -> Result<(), String> {
        let n = self.matrix.len();
        if n == 0 {
            return Err("matrix is empty".to_string());
        }
        if n > MAX_DIMENSION {
            return Err(format!("matrix dimension {} exceeds {}", n, MAX_DIMENSION));
        }
        if let Some((i, row)) = self.matrix.iter().enumerate().find(|(_, r)| r.len() != n) {
            return Err(format!(
                "matrix is not square: row {} has {} columns, expected {}",
                i,
                row.len(),
                n
            ));
        }
        if self.matrix.iter().flatten().any(|x| !x.is_finite()) {
            return Err("matrix contains non-finite entries".to_string());
        }

        let scale = self
            .matrix
            .iter()
            .flatten()
            .fold(0.0_f64, |acc, x| acc.max(x.abs()))
            .max(1.0);
        for i in 0..n {
            for j in (i + 1)..n {
                if (self.matrix[i][j] - self.matrix[j][i]).abs() > SYMMETRY_TOLERANCE * scale {
                    return Err(format!("matrix is not symmetric at ({}, {})", i, j));
                }
            }
        }

        if self.num_eigenvalues == 0 || self.num_eigenvalues > n {
            return Err(format!(
                "num_eigenvalues must be in 1..={}, got {}",
                n, self.num_eigenvalues
            ));
        }
        if self.max_iterations == 0 {
            return Err("max_iterations must be greater than 0".to_string());
        }
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(format!("tolerance must be positive, got {}", self.tolerance));
        }
        Ok(())
    }

    fn to_array(&self) -> Array2<f64> {
        let n = self.matrix.len();
        Array2::from_shape_fn((n, n), |(i, j)| self.matrix[i][j])
    }
}

/// Computed eigenpairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Eigensystem {
    /// Eigenvalues in order of decreasing magnitude.
    pub eigenvalues: Vec<f64>,
    /// Unit eigenvectors, one per eigenvalue.
    pub eigenvectors: Vec<Vec<f64>>,
    /// Power iterations spent on each eigenpair.
    pub iterations: Vec<usize>,
    /// Whether every eigenpair met the tolerance.
    pub converged: bool,
}

/// Runs power iteration with deflation. `progress` receives the completed fraction.
pub fn solve<F>(request: &DiagonalizationRequest, mut progress: F) -> Eigensystem
where
    F: FnMut(f64),
{
    let n = request.matrix.len();
    let k = request.num_eigenvalues;
    let mut matrix = request.to_array();

    let mut system = Eigensystem {
        eigenvalues: Vec::with_capacity(k),
        eigenvectors: Vec::with_capacity(k),
        iterations: Vec::with_capacity(k),
        converged: true,
    };
    let mut found: Vec<Array1<f64>> = Vec::with_capacity(k);

    for index in 0..k {
        let start = starting_vector(n, &found);
        let (value, vector, iterations, converged) =
            power_iteration(&matrix, start, request.max_iterations, request.tolerance);

        // Hotelling deflation
        for i in 0..n {
            for j in 0..n {
                matrix[[i, j]] -= value * vector[i] * vector[j];
            }
        }

        system.converged &= converged;
        system.eigenvalues.push(value);
        system.eigenvectors.push(vector.to_vec());
        system.iterations.push(iterations);
        found.push(vector);

        progress((index + 1) as f64 / k as f64);
    }

    system
}

/// A fixed, non-degenerate start vector orthogonalized against `found`.
fn starting_vector(n: usize, found: &[Array1<f64>]) -> Array1<f64> {
    let mut v = Array1::from_shape_fn(n, |i| 1.0 + (i + 1) as f64 / n as f64);
    for u in found {
        let overlap = v.dot(u);
        v.scaled_add(-overlap, u);
    }
    let norm = v.dot(&v).sqrt();
    if norm > f64::EPSILON {
        v / norm
    } else {
        // Start vector fell entirely into the found subspace; pick the first
        // unit vector with a component outside it.
        unit_outside(n, found)
    }
}

fn unit_outside(n: usize, found: &[Array1<f64>]) -> Array1<f64> {
    for axis in 0..n {
        let mut v = Array1::zeros(n);
        v[axis] = 1.0;
        for u in found {
            let overlap = v.dot(u);
            v.scaled_add(-overlap, u);
        }
        let norm = v.dot(&v).sqrt();
        if norm > 1e-6 {
            return v / norm;
        }
    }
    Array1::zeros(n)
}

/// Returns (eigenvalue, unit eigenvector, iterations, converged).
fn power_iteration(
    matrix: &Array2<f64>,
    mut v: Array1<f64>,
    max_iterations: usize,
    tolerance: f64,
) -> (f64, Array1<f64>, usize, bool) {
    let mut eigenvalue = 0.0;

    for iteration in 1..=max_iterations {
        let w = matrix.dot(&v);
        eigenvalue = v.dot(&w);

        let residual = &w - &(&v * eigenvalue);
        if residual.dot(&residual).sqrt() <= tolerance * eigenvalue.abs().max(1.0) {
            return (eigenvalue, v, iteration, true);
        }

        let norm = w.dot(&w).sqrt();
        if norm <= f64::EPSILON {
            // v lies in the null space of what is left.
            return (0.0, v, iteration, true);
        }
        v = w / norm;
    }

    (eigenvalue, v, max_iterations, false)
}

/// Job body for [`JobKind::Diagonalization`](crate::scheduler::JobKind::Diagonalization).
pub fn run(ctx: &JobContext) -> Result<Value, String> {
    let request: DiagonalizationRequest = super::decode(ctx)?;
    request.validate()?;

    let n = request.matrix.len();
    // Working copy plus the eigenvectors kept for deflation.
    let bytes = (n * n + request.num_eigenvalues * n) * std::mem::size_of::<f64>();
    ctx.record_memory(bytes as u64);

    let system = solve(&request, |fraction| ctx.report_progress(fraction));
    super::encode(&system)
}
