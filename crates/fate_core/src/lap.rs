//! Least action path between two fixed states.
//!
//! The interior of a discretised path is optimized at a fixed time step, then
//! the time step itself is optimized for the resulting path. The boundary
//! states never enter the optimizer, so they come back bit for bit.

use crate::action::{action, action_and_time_derivative, action_with_gradient};
use crate::error::ensure_dimension;
use crate::graph::{Embedding, SimilarityGraph};
use crate::init_path::{initial_path, straight_line_path, InitPathSettings};
use crate::optimize::{
    bfgs, central_difference_gradient, MinimizeReport, MinimizeSettings, Objective,
};
use crate::path::Path;
use crate::trajectory::LeastActionPath;
use crate::traits::VectorField;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LapSettings {
    /// Segments of the path; it holds `n_points + 1` states.
    pub n_points: usize,
    pub diffusion: f64,
    /// Time step used while the path is optimized and the starting guess of
    /// the time optimization.
    pub dt_0: f64,
    pub path_minimizer: MinimizeSettings,
    pub time_minimizer: MinimizeSettings,
    pub init_path: InitPathSettings,
}

impl Default for LapSettings {
    fn default() -> Self {
        Self {
            n_points: 20,
            diffusion: 1.0,
            dt_0: 1.0,
            path_minimizer: MinimizeSettings::default(),
            time_minimizer: MinimizeSettings::default(),
            init_path: InitPathSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeastActionSolution {
    pub path: Path,
    /// Optimal time step between consecutive states.
    pub dt: f64,
    /// Action of `path` at `dt`.
    pub action: f64,
    pub path_report: MinimizeReport,
    pub time_report: MinimizeReport,
}

impl LeastActionSolution {
    /// Total time spent along the path.
    pub fn transit_time(&self) -> f64 {
        self.path.len().saturating_sub(1) as f64 * self.dt
    }
}

/// Action as a function of the interior points, endpoints held fixed.
struct InteriorAction<'a, F> {
    field: &'a F,
    boundary: Path,
    diffusion: f64,
    dt: f64,
}

impl<F: VectorField> InteriorAction<'_, F> {
    fn assemble(&self, interior: &[f64]) -> Path {
        let mut path = self.boundary.clone();
        path.interior_mut().copy_from_slice(interior);
        path
    }
}

impl<F: VectorField> Objective for InteriorAction<'_, F> {
    fn value(&self, x: &[f64]) -> f64 {
        action(&self.assemble(x), self.field, self.diffusion, self.dt)
    }

    fn value_and_gradient(&self, x: &[f64], grad: &mut [f64]) -> f64 {
        let path = self.assemble(x);
        if self.field.has_jacobian() {
            return action_with_gradient(&path, self.field, self.diffusion, self.dt, grad);
        }
        central_difference_gradient(|p| self.value(p), x, grad);
        action(&path, self.field, self.diffusion, self.dt)
    }
}

/// Action of a fixed path as a function of the time step. Non-positive steps
/// are infinitely expensive.
struct TimeStepAction<'a, F> {
    field: &'a F,
    path: &'a Path,
    diffusion: f64,
}

impl<F: VectorField> Objective for TimeStepAction<'_, F> {
    fn value(&self, x: &[f64]) -> f64 {
        if !(x[0] > 0.0) {
            return f64::INFINITY;
        }
        action(self.path, self.field, self.diffusion, x[0])
    }

    fn value_and_gradient(&self, x: &[f64], grad: &mut [f64]) -> f64 {
        if !(x[0] > 0.0) {
            grad[0] = 0.0;
            return f64::INFINITY;
        }
        let (value, derivative) =
            action_and_time_derivative(self.path, self.field, self.diffusion, x[0]);
        grad[0] = derivative;
        value
    }
}

/// Minimizes the action between `start` and `end`.
///
/// `init_path` seeds the optimizer; its first and last states are replaced by
/// `start` and `end`. Without a seed a straight line of `n_points` segments is
/// used. Non-convergence is reported in the returned minimizer reports.
pub fn least_action_path<F: VectorField>(
    field: &F,
    start: &[f64],
    end: &[f64],
    init_path: Option<&Path>,
    settings: &LapSettings,
) -> Result<LeastActionSolution> {
    let dim = field.dimension();
    if dim == 0 {
        bail!("Vector field must have positive dimension.");
    }
    ensure_dimension("Start state", dim, start.len())?;
    ensure_dimension("End state", dim, end.len())?;
    if !(settings.diffusion.is_finite() && settings.diffusion > 0.0) {
        bail!("Diffusion coefficient must be positive and finite, got {}.", settings.diffusion);
    }
    if !(settings.dt_0.is_finite() && settings.dt_0 > 0.0) {
        bail!("dt_0 must be positive and finite, got {}.", settings.dt_0);
    }

    let mut path = match init_path {
        Some(seed) => {
            ensure_dimension("Initial path", dim, seed.dimension())?;
            if seed.len() < 2 {
                bail!("Initial path needs at least two states, got {}.", seed.len());
            }
            seed.clone()
        }
        None => {
            if settings.n_points < 2 {
                bail!("n_points must be at least 2, got {}.", settings.n_points);
            }
            straight_line_path(start, end, settings.n_points)?
        }
    };
    let last = path.len() - 1;
    path.point_mut(0).copy_from_slice(start);
    path.point_mut(last).copy_from_slice(end);

    let interior = InteriorAction {
        field,
        boundary: path.clone(),
        diffusion: settings.diffusion,
        dt: settings.dt_0,
    };
    let path_report = bfgs(&interior, path.interior(), &settings.path_minimizer)
        .context("Path optimization failed")?;
    path.interior_mut().copy_from_slice(&path_report.x);
    if !path_report.converged {
        warn!(message = %path_report.message, "path optimization did not converge");
    }

    let time = TimeStepAction {
        field,
        path: &path,
        diffusion: settings.diffusion,
    };
    let time_report = bfgs(&time, &[settings.dt_0], &settings.time_minimizer)
        .context("Time step optimization failed")?;
    if !time_report.converged {
        warn!(message = %time_report.message, "time step optimization did not converge");
    }
    let dt = time_report.x[0];
    let action = time_report.fun;

    Ok(LeastActionSolution {
        path,
        dt,
        action,
        path_report,
        time_report,
    })
}

/// Least action path between `start` and `end`, seeded with the shortest path
/// through the similarity graph over the embedded cells.
pub fn least_action<F: VectorField>(
    field: &F,
    graph: &SimilarityGraph,
    embedding: &Embedding,
    start: &[f64],
    end: &[f64],
    settings: &LapSettings,
) -> Result<LeastActionPath> {
    info!("initializing path with the shortest path in the similarity graph");
    let seed = initial_path(graph, start, end, embedding, settings.n_points, &settings.init_path)?;

    info!(n_points = settings.n_points, "searching for the least action path");
    let solution = least_action_path(field, start, end, Some(&seed), settings)?;
    info!(
        message = %solution.path_report.message,
        action = solution.action,
        dt = solution.dt,
        "least action path found"
    );

    LeastActionPath::new(solution.path, field, settings.diffusion, solution.dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Autodiff;
    use crate::field::{ConstantField, FnField};
    use crate::path::distance;
    use crate::traits::{GenericField, Scalar};
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn diagonal_field() -> ConstantField {
        ConstantField {
            velocity: vec![1.0, 1.0],
        }
    }

    fn double_well(x: &[f64], out: &mut [f64]) {
        out[0] = x[0] - x[0].powi(3);
        out[1] = -x[1];
    }

    fn double_well_jacobian(x: &[f64], out: &mut [f64]) {
        out[0] = 1.0 - 3.0 * x[0] * x[0];
        out[1] = 0.0;
        out[2] = 0.0;
        out[3] = -1.0;
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn constant_field_gives_straight_line_with_zero_action() {
        let settings = LapSettings {
            n_points: 10,
            ..LapSettings::default()
        };
        let solution =
            least_action_path(&diagonal_field(), &[0.0, 0.0], &[1.0, 1.0], None, &settings)
                .expect("solver runs");

        assert_eq!(solution.path.len(), 11);
        for (i, point) in solution.path.points().enumerate() {
            let s = i as f64 / 10.0;
            assert_relative_eq!(point[0], s, epsilon = 1e-6);
            assert_relative_eq!(point[1], s, epsilon = 1e-6);
        }
        assert_relative_eq!(solution.action, 0.0, epsilon = 1e-8);
        assert_relative_eq!(solution.dt, 0.1, epsilon = 1e-5);
        // Distance sqrt(2) covered at speed sqrt(2).
        assert_relative_eq!(solution.transit_time(), 1.0, epsilon = 1e-4);
        assert!(solution.path_report.converged);
        assert!(solution.time_report.converged);
    }

    #[test]
    fn endpoints_are_bit_exact() {
        let field = FnField::new(2, double_well);
        let start = [-1.0000000001, 0.3];
        let end = [0.9999999997, -0.1];
        // Seed endpoints deliberately differ from the requested ones.
        let seed = straight_line_path(&[-2.0, 2.0], &[2.0, 2.0], 8).unwrap();
        let solution = least_action_path(&field, &start, &end, Some(&seed), &LapSettings::default())
            .expect("solver runs");

        assert_eq!(solution.path.len(), 9);
        assert_eq!(solution.path.first(), Some(&start[..]));
        assert_eq!(solution.path.last(), Some(&end[..]));
    }

    #[test]
    fn analytic_and_numeric_gradients_find_the_same_path() {
        let settings = LapSettings {
            n_points: 8,
            ..LapSettings::default()
        };
        let start = [-1.0, 0.0];
        let end = [1.0, 0.0];
        let exact = FnField::new(2, double_well).with_jacobian(double_well_jacobian);
        let numeric = FnField::new(2, double_well);

        let a = least_action_path(&exact, &start, &end, None, &settings).expect("solver runs");
        let b = least_action_path(&numeric, &start, &end, None, &settings).expect("solver runs");

        assert_relative_eq!(
            a.path_report.fun,
            b.path_report.fun,
            max_relative = 1e-4,
            epsilon = 1e-9
        );
        assert_relative_eq!(a.dt, b.dt, max_relative = 1e-3);
        for (p, q) in a.path.points().zip(b.path.points()) {
            assert!(distance(p, q) < 1e-2);
            assert_relative_eq!(p[1], 0.0, epsilon = 1e-8);
        }
    }

    /// The double well written once over any scalar.
    struct GenericDoubleWell;

    impl<T: Scalar> GenericField<T> for GenericDoubleWell {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, x: &[T], out: &mut [T]) {
            out[0] = x[0] - x[0].powi(3);
            out[1] = -x[1];
        }
    }

    #[test]
    fn dual_number_jacobian_lowers_the_action() {
        let field = Autodiff::new(GenericDoubleWell);
        let settings = LapSettings {
            n_points: 8,
            ..LapSettings::default()
        };
        // A detour through y = 0.5 is worse than the straight crossing.
        let mut seed = straight_line_path(&[-1.0, 0.0], &[1.0, 0.0], 8).unwrap();
        for i in 1..8 {
            seed.point_mut(i)[1] = 0.5;
        }
        let seed_action = action(&seed, &field, 1.0, 1.0);

        let solution = least_action_path(&field, &[-1.0, 0.0], &[1.0, 0.0], Some(&seed), &settings)
            .expect("solver runs");
        assert!(solution.path_report.fun < seed_action);
        for point in solution.path.points() {
            assert!(point[1].abs() < 1e-3);
        }
    }

    #[test]
    fn optimal_time_step_has_closed_form() {
        let field = FnField::new(2, double_well).with_jacobian(double_well_jacobian);
        let settings = LapSettings {
            n_points: 6,
            time_minimizer: MinimizeSettings {
                gtol: 1e-9,
                ..MinimizeSettings::default()
            },
            ..LapSettings::default()
        };
        let solution = least_action_path(&field, &[-1.0, 0.5], &[1.0, -0.5], None, &settings)
            .expect("solver runs");

        let path = &solution.path;
        let mut moved = 0.0;
        let mut speed = 0.0;
        let mut f = [0.0; 2];
        for i in 0..path.len() - 1 {
            let (a, b) = (path.point(i), path.point(i + 1));
            let mid = [0.5 * (a[0] + b[0]), 0.5 * (a[1] + b[1])];
            double_well(&mid, &mut f);
            moved += distance(a, b).powi(2);
            speed += f[0] * f[0] + f[1] * f[1];
        }
        assert_relative_eq!(solution.dt, (moved / speed).sqrt(), max_relative = 1e-4);
        assert_relative_eq!(
            solution.action,
            action(path, &field, 1.0, solution.dt),
            epsilon = 1e-12
        );
    }

    #[test]
    fn graph_seeded_end_to_end() {
        let coords: Vec<f64> = (0..=5).flat_map(|k| [k as f64 / 5.0, k as f64 / 5.0]).collect();
        let embedding = Embedding::new(DMatrix::from_row_slice(6, 2, &coords));
        let edges: Vec<(usize, usize, f64)> = (1..=5).map(|k| (k - 1, k, 1.0)).collect();
        let graph = SimilarityGraph::from_edges(6, &edges).expect("valid graph");
        let settings = LapSettings {
            n_points: 10,
            ..LapSettings::default()
        };

        let (start, end) = ([0.0, 0.0], [1.0, 1.0]);
        let lap = least_action(&diagonal_field(), &graph, &embedding, &start, &end, &settings)
            .expect("solver runs");

        assert_eq!(lap.path().len(), 11);
        assert_eq!(lap.path().first(), Some(&[0.0, 0.0][..]));
        assert_eq!(lap.path().last(), Some(&[1.0, 1.0][..]));
        // The seed is unevenly spaced, so the optimizer has to even it out.
        assert_relative_eq!(lap.total_action(), 0.0, epsilon = 1e-5);
        assert_relative_eq!(lap.dt() * 10.0, 1.0, epsilon = 1e-3);
        let series = lap.action(None).unwrap();
        assert_eq!(series[0], 0.0);
        assert_eq!(lap.mfpt(None).len(), 11);
    }

    #[test]
    fn rejects_invalid_inputs() {
        let field = diagonal_field();
        let settings = LapSettings::default();
        assert_err_contains(
            least_action_path(&field, &[0.0], &[1.0, 1.0], None, &settings),
            "Start state dimension mismatch",
        );
        assert_err_contains(
            least_action_path(
                &field,
                &[0.0, 0.0],
                &[1.0, 1.0],
                None,
                &LapSettings {
                    diffusion: 0.0,
                    ..settings
                },
            ),
            "Diffusion",
        );
        assert_err_contains(
            least_action_path(
                &field,
                &[0.0, 0.0],
                &[1.0, 1.0],
                None,
                &LapSettings {
                    dt_0: -1.0,
                    ..settings
                },
            ),
            "dt_0",
        );
        assert_err_contains(
            least_action_path(
                &field,
                &[0.0, 0.0],
                &[1.0, 1.0],
                None,
                &LapSettings {
                    n_points: 1,
                    ..settings
                },
            ),
            "n_points",
        );
        let seed = Path::from_points(&[[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]]).unwrap();
        assert_err_contains(
            least_action_path(&field, &[0.0, 0.0], &[1.0, 1.0], Some(&seed), &settings),
            "Initial path dimension mismatch",
        );
    }

    #[test]
    fn settings_round_trip_through_json() {
        let settings: LapSettings =
            serde_json::from_str(r#"{"n_points": 50, "diffusion": 10.0}"#).expect("valid json");
        assert_eq!(settings.n_points, 50);
        assert_eq!(settings.diffusion, 10.0);
        assert_eq!(settings.dt_0, 1.0);
        assert_eq!(settings.path_minimizer.gtol, MinimizeSettings::default().gtol);
    }
}
