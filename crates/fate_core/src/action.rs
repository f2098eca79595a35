//! Discretised Onsager-Machlup style action of a path under the stochastic
//! dynamics `dx = f(x) dt + sqrt(2D) dW`, and the quantities derived from it.
//!
//! For points `x_0..x_N`, midpoints `m_i = (x_i + x_{i+1}) / 2` and finite
//! difference velocities `v_i = (x_{i+1} - x_i) / dt`:
//!
//! ```text
//! S = dt / (2D) * Σ_i ‖v_i - f(m_i)‖²
//! ```
//!
//! These are free functions over [`Path`] so any trajectory can be scored, not
//! only the ones produced by the least action solver.

use crate::path::Path;
use crate::traits::VectorField;

/// Residuals `r_i = v_i - f(m_i)` (row-major) and the velocities `v_i`.
struct Residuals {
    residuals: Vec<f64>,
    velocities: Vec<f64>,
    midpoints: Vec<f64>,
}

fn residuals(path: &Path, field: &impl VectorField, dt: f64) -> Residuals {
    let dim = path.dimension();
    let segments = path.len().saturating_sub(1);
    let mut midpoints = vec![0.0; segments * dim];
    let mut velocities = vec![0.0; segments * dim];
    for i in 0..segments {
        let (a, b) = (path.point(i), path.point(i + 1));
        for k in 0..dim {
            midpoints[i * dim + k] = 0.5 * (a[k] + b[k]);
            velocities[i * dim + k] = (b[k] - a[k]) / dt;
        }
    }

    // One field evaluation per midpoint.
    let mut residuals = vec![0.0; segments * dim];
    field.apply_batch(&midpoints, &mut residuals);
    for (r, v) in residuals.iter_mut().zip(&velocities) {
        *r = v - *r;
    }

    Residuals {
        residuals,
        velocities,
        midpoints,
    }
}

/// Action of `path` with diffusion coefficient `diffusion` and time step `dt`.
/// A path with fewer than two points has zero action.
pub fn action(path: &Path, field: &impl VectorField, diffusion: f64, dt: f64) -> f64 {
    if path.len() < 2 {
        return 0.0;
    }
    let r = residuals(path, field, dt);
    0.5 * dt / diffusion * r.residuals.iter().map(|x| x * x).sum::<f64>()
}

/// Action of `path` together with its analytic gradient with respect to the
/// interior points, written into `grad` (length `(N - 1) * dim`).
///
/// Uses `field.jacobian` at every midpoint, so it only pays off when the field
/// provides an exact Jacobian.
pub fn action_with_gradient(
    path: &Path,
    field: &impl VectorField,
    diffusion: f64,
    dt: f64,
    grad: &mut [f64],
) -> f64 {
    let dim = path.dimension();
    let n = path.len();
    grad.fill(0.0);
    if n < 2 {
        return 0.0;
    }
    let segments = n - 1;
    let r = residuals(path, field, dt);

    // z_i = r_i^T J(m_i)
    let mut z = vec![0.0; segments * dim];
    let mut jac = vec![0.0; dim * dim];
    for i in 0..segments {
        field.jacobian(&r.midpoints[i * dim..(i + 1) * dim], &mut jac);
        let res = &r.residuals[i * dim..(i + 1) * dim];
        for j in 0..dim {
            z[i * dim + j] = (0..dim).map(|k| res[k] * jac[k * dim + j]).sum();
        }
    }

    for p in 1..segments {
        let out = &mut grad[(p - 1) * dim..p * dim];
        for j in 0..dim {
            let (prev, next) = ((p - 1) * dim + j, p * dim + j);
            out[j] = (r.residuals[prev] - r.residuals[next]) / diffusion
                - 0.5 * dt / diffusion * (z[prev] + z[next]);
        }
    }

    0.5 * dt / diffusion * r.residuals.iter().map(|x| x * x).sum::<f64>()
}

/// Action as a function of `dt` for a fixed path, with its derivative in `dt`.
pub fn action_and_time_derivative(
    path: &Path,
    field: &impl VectorField,
    diffusion: f64,
    dt: f64,
) -> (f64, f64) {
    if path.len() < 2 {
        return (0.0, 0.0);
    }
    let r = residuals(path, field, dt);
    let mut squared = 0.0;
    let mut cross = 0.0;
    for (res, v) in r.residuals.iter().zip(&r.velocities) {
        squared += res * res;
        cross += res * v;
    }
    // d/d(dt) of dt/(2D) Σ ‖Δx/dt - f‖²
    (
        0.5 * dt / diffusion * squared,
        0.5 / diffusion * (squared - 2.0 * cross),
    )
}

/// Action of every prefix `x_0..x_i`, each recomputed from scratch. Entry 0 is
/// always exactly zero.
pub fn cumulative_action(
    path: &Path,
    field: &impl VectorField,
    diffusion: f64,
    dt: f64,
) -> Vec<f64> {
    let mut series = vec![0.0; path.len()];
    for (i, value) in series.iter_mut().enumerate().skip(1) {
        *value = action(&path.prefix(i + 1), field, diffusion, dt);
    }
    series
}

/// Mean first passage time proxy `1 / exp(-S)`, usable only to rank paths.
pub fn mfpt_proxy(action: &[f64]) -> Vec<f64> {
    action.iter().map(|a| 1.0 / (-a).exp()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{ConstantField, FnField, LinearField};
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn straight_line(n_points: usize) -> Path {
        let points: Vec<[f64; 2]> = (0..=n_points)
            .map(|i| {
                let s = i as f64 / n_points as f64;
                [s, s]
            })
            .collect();
        Path::from_points(&points).expect("valid path")
    }

    fn numeric_gradient(
        path: &Path,
        field: &impl VectorField,
        diffusion: f64,
        dt: f64,
    ) -> Vec<f64> {
        let mut probe = path.clone();
        let n = probe.interior().len();
        let mut grad = vec![0.0; n];
        for idx in 0..n {
            let h = 1e-6;
            let x = probe.interior()[idx];
            probe.interior_mut()[idx] = x + h;
            let plus = action(&probe, field, diffusion, dt);
            probe.interior_mut()[idx] = x - h;
            let minus = action(&probe, field, diffusion, dt);
            probe.interior_mut()[idx] = x;
            grad[idx] = (plus - minus) / (2.0 * h);
        }
        grad
    }

    #[test]
    fn matching_constant_field_has_zero_action() {
        let field = ConstantField {
            velocity: vec![1.0, 1.0],
        };
        let path = straight_line(10);
        assert_relative_eq!(action(&path, &field, 1.0, 0.1), 0.0, epsilon = 1e-20);
        // dt = 1 makes every segment lag the field by (0.9, 0.9).
        assert_relative_eq!(action(&path, &field, 2.0, 1.0), 10.0 * 1.62 / 4.0, epsilon = 1e-12);
    }

    #[test]
    fn analytic_gradient_matches_numeric_gradient() {
        let field = LinearField::new(vec![-1.0, 2.0, -0.5, -0.3], vec![0.2, -0.1]);
        let path = Path::from_points(&[[0.0, 0.0], [0.3, 0.7], [0.9, 0.4], [1.2, 1.5], [2.0, 1.0]])
            .expect("valid path");
        let mut grad = vec![0.0; path.interior().len()];
        let value = action_with_gradient(&path, &field, 0.7, 0.4, &mut grad);
        assert_relative_eq!(value, action(&path, &field, 0.7, 0.4), epsilon = 1e-12);
        let numeric = numeric_gradient(&path, &field, 0.7, 0.4);
        for (a, b) in grad.iter().zip(&numeric) {
            assert_relative_eq!(*a, *b, epsilon = 1e-5, max_relative = 1e-5);
        }
    }

    #[test]
    fn time_derivative_matches_difference_quotient() {
        let field = FnField::new(2, |x: &[f64], out: &mut [f64]| {
            out[0] = x[1];
            out[1] = -x[0].sin();
        });
        let path = straight_line(6);
        let (value, deriv) = action_and_time_derivative(&path, &field, 1.5, 0.3);
        assert_relative_eq!(value, action(&path, &field, 1.5, 0.3), epsilon = 1e-12);
        let h = 1e-6;
        let numeric =
            (action(&path, &field, 1.5, 0.3 + h) - action(&path, &field, 1.5, 0.3 - h)) / (2.0 * h);
        assert_relative_eq!(deriv, numeric, epsilon = 1e-5);
    }

    #[test]
    fn cumulative_action_starts_at_zero_and_ends_at_total() {
        let field = LinearField::new(vec![-1.0, 0.0, 0.0, -1.0], vec![0.0, 0.0]);
        let path = straight_line(5);
        let series = cumulative_action(&path, &field, 1.0, 0.5);
        assert_eq!(series.len(), 6);
        assert_eq!(series[0], 0.0);
        assert_relative_eq!(series[5], action(&path, &field, 1.0, 0.5), epsilon = 1e-12);
    }

    #[test]
    fn mfpt_proxy_is_exp_of_action() {
        let proxy = mfpt_proxy(&[0.0, 1.0, 2.5]);
        assert_eq!(proxy[0], 1.0);
        assert_relative_eq!(proxy[1], 1.0f64.exp(), epsilon = 1e-12);
        assert_relative_eq!(proxy[2], 2.5f64.exp(), epsilon = 1e-12);
    }

    proptest! {
        #[test]
        fn prop_action_is_non_negative(
            coords in prop::collection::vec((-3.0f64..3.0, -3.0f64..3.0), 1..20),
            diffusion in 1e-3f64..10.0,
            dt in 1e-3f64..10.0,
        ) {
            let points: Vec<[f64; 2]> = coords.iter().map(|&(x, y)| [x, y]).collect();
            let path = Path::from_points(&points).unwrap();
            let field = FnField::new(2, |x: &[f64], out: &mut [f64]| {
                out[0] = x[0] - x[0].powi(3) - x[1];
                out[1] = x[0] * x[1].cos();
            });
            prop_assert!(action(&path, &field, diffusion, dt) >= 0.0);
            let series = cumulative_action(&path, &field, diffusion, dt);
            prop_assert_eq!(series[0], 0.0);
        }
    }
}
