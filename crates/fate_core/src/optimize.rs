//! Unconstrained quasi-Newton minimization.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Relative step of the central-difference gradient fallback.
const GRADIENT_FD_STEP: f64 = 1e-6;

/// A smooth scalar function of a flat parameter vector.
pub trait Objective {
    fn value(&self, x: &[f64]) -> f64;

    /// Value at `x`, with the gradient written into `grad`. The default
    /// differences `value` centrally, costing `2 * x.len() + 1` evaluations.
    fn value_and_gradient(&self, x: &[f64], grad: &mut [f64]) -> f64 {
        central_difference_gradient(|p| self.value(p), x, grad);
        self.value(x)
    }
}

/// Central finite-difference gradient of `f` at `x`.
pub fn central_difference_gradient(f: impl Fn(&[f64]) -> f64, x: &[f64], grad: &mut [f64]) {
    let mut probe = x.to_vec();
    for (i, g) in grad.iter_mut().enumerate() {
        let h = GRADIENT_FD_STEP * x[i].abs().max(1.0);
        probe[i] = x[i] + h;
        let plus = f(&probe);
        probe[i] = x[i] - h;
        let minus = f(&probe);
        probe[i] = x[i];
        *g = (plus - minus) / (2.0 * h);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimizeSettings {
    pub max_iterations: usize,
    /// Converged once the largest gradient component is at most this.
    pub gtol: f64,
    /// Sufficient decrease constant of the Armijo condition.
    pub armijo: f64,
    /// Step shrink factor while backtracking.
    pub backtrack: f64,
    pub max_backtracks: usize,
}

impl Default for MinimizeSettings {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            gtol: 1e-5,
            armijo: 1e-4,
            backtrack: 0.5,
            max_backtracks: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinimizeReport {
    pub x: Vec<f64>,
    pub fun: f64,
    /// Infinity norm of the gradient at `x`.
    pub grad_norm: f64,
    pub iterations: usize,
    /// Calls to `value_and_gradient`.
    pub evaluations: usize,
    pub converged: bool,
    pub message: String,
}

/// Minimizes `objective` from `x0` with BFGS and a backtracking line search.
///
/// Failing to converge is not an error: the best point found is returned and
/// `message` says why the run stopped. Errors are reserved for invalid
/// settings and a non-finite value at `x0`.
pub fn bfgs(
    objective: &impl Objective,
    x0: &[f64],
    settings: &MinimizeSettings,
) -> Result<MinimizeReport> {
    if !(settings.gtol > 0.0) {
        bail!("gtol must be positive.");
    }
    if !(settings.armijo > 0.0 && settings.armijo < 1.0) {
        bail!("armijo must lie in (0, 1).");
    }
    if !(settings.backtrack > 0.0 && settings.backtrack < 1.0) {
        bail!("backtrack must lie in (0, 1).");
    }

    let n = x0.len();
    let mut x = DVector::from_column_slice(x0);
    let mut g = DVector::<f64>::zeros(n);
    let mut f = objective.value_and_gradient(x.as_slice(), g.as_mut_slice());
    let mut evaluations = 1usize;
    if !f.is_finite() {
        bail!("Objective is not finite at the initial point.");
    }

    let mut h_inv = DMatrix::<f64>::identity(n, n);
    let mut fresh_hessian = true;
    let mut iterations = 0usize;
    let mut x_new = DVector::<f64>::zeros(n);
    let mut g_new = DVector::<f64>::zeros(n);

    let (converged, message) = loop {
        let grad_norm = inf_norm(&g);
        if grad_norm <= settings.gtol {
            break (true, "Optimization terminated successfully.".to_string());
        }
        if iterations >= settings.max_iterations {
            break (false, "Maximum number of iterations has been exceeded.".to_string());
        }

        let mut direction = -(&h_inv * &g);
        let mut slope = direction.dot(&g);
        if slope >= 0.0 {
            // Lost positive definiteness; fall back to steepest descent.
            h_inv.fill_with_identity();
            fresh_hessian = true;
            direction = -g.clone();
            slope = direction.dot(&g);
        }

        let mut alpha = 1.0;
        let mut f_new = f;
        let mut accepted = false;
        for _ in 0..settings.max_backtracks {
            x_new.copy_from(&x);
            x_new.axpy(alpha, &direction, 1.0);
            f_new = objective.value_and_gradient(x_new.as_slice(), g_new.as_mut_slice());
            evaluations += 1;
            if f_new.is_finite() && f_new <= f + settings.armijo * alpha * slope {
                accepted = true;
                break;
            }
            alpha *= settings.backtrack;
        }

        if !accepted {
            if fresh_hessian {
                break (
                    false,
                    "Desired error not necessarily achieved due to precision loss.".to_string(),
                );
            }
            h_inv.fill_with_identity();
            fresh_hessian = true;
            continue;
        }

        let s = &x_new - &x;
        let y = &g_new - &g;
        let sy = s.dot(&y);
        if sy > 1e-10 * s.norm() * y.norm() {
            if fresh_hessian {
                // Scale the first update to the observed curvature.
                h_inv *= sy / y.dot(&y);
            }
            let rho = 1.0 / sy;
            let identity = DMatrix::<f64>::identity(n, n);
            let left = &identity - rho * &s * y.transpose();
            let right = &identity - rho * &y * s.transpose();
            h_inv = &left * &h_inv * &right + rho * &s * s.transpose();
            fresh_hessian = false;
        }

        trace!(iteration = iterations, f = f_new, step = alpha, "bfgs step");
        std::mem::swap(&mut x, &mut x_new);
        std::mem::swap(&mut g, &mut g_new);
        f = f_new;
        iterations += 1;
    };

    let grad_norm = inf_norm(&g);
    debug!(
        iterations,
        evaluations,
        fun = f,
        grad_norm,
        converged,
        "bfgs finished"
    );

    Ok(MinimizeReport {
        x: x.as_slice().to_vec(),
        fun: f,
        grad_norm,
        iterations,
        evaluations,
        converged,
        message,
    })
}

fn inf_norm(v: &DVector<f64>) -> f64 {
    v.iter().fold(0.0, |m, x| m.max(x.abs()))
}
