//! Bounded minimization and Metropolis sampling of a negative log-likelihood.
//!
//! The minimizer is a damped Newton iteration on finite-difference
//! derivatives, projected onto box bounds. It is meant for the handful of
//! parameters a template fit has, not for large problems.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Relative finite-difference step.
const FD_STEP: f64 = 1e-4;

/// Largest damping factor before giving up.
const MAX_DAMPING: f64 = 1e10;

/// Maximum step halvings in the line search.
const MAX_HALVINGS: usize = 30;

/// Optimal random-walk scale factor for Gaussian targets.
const RW_SCALE: f64 = 2.38;

/// Minimizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinimizerSettings {
    /// Maximum Newton iterations.
    pub max_iterations: usize,
    /// Relative tolerance on the function value change.
    pub tolerance: f64,
    /// Absolute tolerance on the projected gradient.
    pub gradient_tolerance: f64,
}

impl Default for MinimizerSettings {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-10,
            gradient_tolerance: 1e-7,
        }
    }
}

impl MinimizerSettings {
    /// Set the maximum number of iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the relative tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }
}

/// Result of a minimization.
#[derive(Debug, Clone)]
pub struct MinimizeResult {
    /// Location of the minimum.
    pub x: Vec<f64>,
    /// Function value at the minimum.
    pub value: f64,
    /// Iterations used.
    pub iterations: usize,
    /// Whether a convergence criterion was met.
    pub converged: bool,
    /// Inverse Hessian at the minimum, if positive definite.
    pub covariance: Option<DMatrix<f64>>,
}

impl MinimizeResult {
    /// Square roots of the covariance diagonal.
    pub fn std_errors(&self) -> Option<Vec<f64>> {
        let cov = self.covariance.as_ref()?;
        Some((0..cov.nrows()).map(|i| cov[(i, i)].max(0.0).sqrt()).collect())
    }
}

/// Summary of a Metropolis chain.
#[derive(Debug, Clone)]
pub struct McmcResult {
    /// Posterior means.
    pub mean: Vec<f64>,
    /// Posterior standard deviations.
    pub std: Vec<f64>,
    /// Fraction of accepted proposals.
    pub acceptance: f64,
}

fn clamp_into(x: &mut [f64], lower: &[f64], upper: &[f64]) {
    for ((v, &lo), &hi) in x.iter_mut().zip(lower).zip(upper) {
        *v = v.clamp(lo, hi);
    }
}

fn fd_step(x: f64) -> f64 {
    FD_STEP * x.abs().max(1.0)
}

/// Gradient and Hessian by central differences.
///
/// The stencil is shifted inside the bounds so the function is never
/// evaluated outside them.
fn derivatives<F>(f: &F, x: &[f64], lower: &[f64], upper: &[f64]) -> (DVector<f64>, DMatrix<f64>)
where
    F: Fn(&[f64]) -> f64,
{
    let n = x.len();
    let steps: Vec<f64> = x.iter().map(|&v| fd_step(v)).collect();
    let center: Vec<f64> = x
        .iter()
        .zip(&steps)
        .zip(lower.iter().zip(upper))
        .map(|((&v, &h), (&lo, &hi))| {
            if hi - lo > 2.0 * h {
                v.clamp(lo + h, hi - h)
            } else {
                0.5 * (lo + hi)
            }
        })
        .collect();

    let eval = |shifts: &[(usize, f64)]| {
        let mut p = center.clone();
        for &(i, d) in shifts {
            p[i] += d;
        }
        f(&p)
    };

    let f0 = f(&center);
    let mut grad = DVector::zeros(n);
    let mut hess = DMatrix::zeros(n, n);
    let mut plus = vec![0.0; n];
    let mut minus = vec![0.0; n];

    for i in 0..n {
        let h = steps[i];
        plus[i] = eval(&[(i, h)]);
        minus[i] = eval(&[(i, -h)]);
        grad[i] = (plus[i] - minus[i]) / (2.0 * h);
        hess[(i, i)] = (plus[i] - 2.0 * f0 + minus[i]) / (h * h);
    }

    for i in 0..n {
        for j in (i + 1)..n {
            let (hi, hj) = (steps[i], steps[j]);
            let pp = eval(&[(i, hi), (j, hj)]);
            let pm = eval(&[(i, hi), (j, -hj)]);
            let mp = eval(&[(i, -hi), (j, hj)]);
            let mm = eval(&[(i, -hi), (j, -hj)]);
            let value = (pp - pm - mp + mm) / (4.0 * hi * hj);
            hess[(i, j)] = value;
            hess[(j, i)] = value;
        }
    }

    (grad, hess)
}

/// Minimize `f` within `[lower, upper]` starting from `x0`.
pub fn minimize<F>(
    f: F,
    x0: &[f64],
    lower: &[f64],
    upper: &[f64],
    settings: &MinimizerSettings,
) -> MinimizeResult
where
    F: Fn(&[f64]) -> f64,
{
    let n = x0.len();
    let mut x = x0.to_vec();
    clamp_into(&mut x, lower, upper);
    let mut fx = f(&x);

    if n == 0 || !fx.is_finite() {
        return MinimizeResult {
            x,
            value: fx,
            iterations: 0,
            converged: n == 0 && fx.is_finite(),
            covariance: (n == 0).then(|| DMatrix::zeros(0, 0)),
        };
    }

    let mut damping = 0.0;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < settings.max_iterations {
        iterations += 1;
        let (grad, hess) = derivatives(&f, &x, lower, upper);

        // Coordinates pinned at a bound by the gradient do not move.
        let free: Vec<usize> = (0..n)
            .filter(|&i| !((x[i] <= lower[i] && grad[i] > 0.0) || (x[i] >= upper[i] && grad[i] < 0.0)))
            .collect();

        let projected_norm = free.iter().map(|&i| grad[i].abs()).fold(0.0, f64::max);
        if free.is_empty() || projected_norm < settings.gradient_tolerance {
            converged = true;
            break;
        }

        let m = free.len();
        let g_free = DVector::from_iterator(m, free.iter().map(|&i| grad[i]));
        let h_free = DMatrix::from_fn(m, m, |a, b| hess[(free[a], free[b])]);

        let mut accepted = false;
        while damping <= MAX_DAMPING {
            let mut system = h_free.clone();
            for a in 0..m {
                let scale = h_free[(a, a)].abs().max(1e-8);
                system[(a, a)] += damping * scale;
            }

            let Some(chol) = system.cholesky() else {
                damping = (damping * 10.0).max(1e-6);
                continue;
            };
            let step = -chol.solve(&g_free);

            let mut alpha = 1.0;
            for _ in 0..MAX_HALVINGS {
                let mut candidate = x.clone();
                for (a, &i) in free.iter().enumerate() {
                    candidate[i] += alpha * step[a];
                }
                clamp_into(&mut candidate, lower, upper);
                let f_candidate = f(&candidate);
                if f_candidate.is_finite() && f_candidate <= fx {
                    let change = fx - f_candidate;
                    x = candidate;
                    fx = f_candidate;
                    accepted = true;
                    if change <= settings.tolerance * (1.0 + fx.abs()) {
                        converged = true;
                    }
                    break;
                }
                alpha *= 0.5;
            }

            if accepted {
                damping /= 10.0;
                if damping < 1e-12 {
                    damping = 0.0;
                }
                break;
            }
            damping = (damping * 10.0).max(1e-6);
        }

        if !accepted || converged {
            break;
        }
    }

    let (_, hess) = derivatives(&f, &x, lower, upper);
    let covariance = hess.cholesky().map(|chol| chol.inverse());

    MinimizeResult {
        x,
        value: fx,
        iterations,
        converged,
        covariance,
    }
}

/// Random-walk Metropolis sampling of `exp(-f)` within `[lower, upper]`.
///
/// `steps` are per-parameter proposal widths before the usual
/// `2.38 / sqrt(d)` scaling. Proposals outside the bounds are rejected.
#[allow(clippy::too_many_arguments)]
pub fn metropolis<F, R>(
    f: F,
    x0: &[f64],
    steps: &[f64],
    lower: &[f64],
    upper: &[f64],
    iterations: usize,
    burn_in: usize,
    rng: &mut R,
) -> McmcResult
where
    F: Fn(&[f64]) -> f64,
    R: Rng,
{
    let n = x0.len();
    if n == 0 || iterations == 0 {
        return McmcResult {
            mean: x0.to_vec(),
            std: vec![0.0; n],
            acceptance: 0.0,
        };
    }

    let scale = RW_SCALE / (n as f64).sqrt();
    let mut x = x0.to_vec();
    clamp_into(&mut x, lower, upper);
    let mut fx = f(&x);

    let mut mean = vec![0.0; n];
    let mut m2 = vec![0.0; n];
    let mut accepted = 0usize;
    let total = burn_in + iterations;

    for step_index in 0..total {
        let proposal: Vec<f64> = x
            .iter()
            .zip(steps)
            .map(|(&v, &s)| {
                let z: f64 = rng.sample(StandardNormal);
                v + scale * s * z
            })
            .collect();

        let inside = proposal
            .iter()
            .zip(lower.iter().zip(upper))
            .all(|(&v, (&lo, &hi))| v >= lo && v <= hi);

        if inside {
            let f_proposal = f(&proposal);
            let u: f64 = rng.random();
            if f_proposal.is_finite() && u.ln() < fx - f_proposal {
                x = proposal;
                fx = f_proposal;
                accepted += 1;
            }
        }

        if step_index >= burn_in {
            // Welford update.
            let k = (step_index - burn_in + 1) as f64;
            for i in 0..n {
                let delta = x[i] - mean[i];
                mean[i] += delta / k;
                m2[i] += delta * (x[i] - mean[i]);
            }
        }
    }

    let denom = (iterations.max(2) - 1) as f64;
    McmcResult {
        mean,
        std: m2.iter().map(|v| (v / denom).sqrt()).collect(),
        acceptance: accepted as f64 / total as f64,
    }
}
