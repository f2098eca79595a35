//! Batch integration of a vector field from many initial states.
//!
//! Two front ends share the post-processing: [`integrate_vector_field`] steps a
//! fixed-step solver across a caller supplied grid, while
//! [`integrate_vector_field_ivp`] runs an adaptive solver that stops at fixed
//! points and keeps a dense solution per trajectory. Both can re-interpolate
//! the batch onto a common grid and average it.

use crate::error::{ensure_dimension, FateError};
use crate::solvers::{AdaptiveSettings, DenseSolution, Dopri5, StepperKind, Termination};
use crate::traits::VectorField;
use anyhow::{bail, Result};
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// A step counts as movement when some feature changes by at least this much.
pub const FLATNESS_THRESHOLD: f64 = 1e-3;
/// Speed below which the adaptive integrator considers a fixed point reached.
pub const FIXED_POINT_SPEED: f64 = 1e-5;
/// The adaptive integrator never steps further than `span / IVP_MAX_STEP_DIVISOR`.
const IVP_MAX_STEP_DIVISOR: f64 = 2500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    /// Integrates the same field over negated time steps.
    Backward,
    /// Backward run (reversed) followed by the forward run, meeting at t = 0.
    #[default]
    Both,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
            Direction::Both => "both",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = FateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forward" => Ok(Direction::Forward),
            "backward" => Ok(Direction::Backward),
            "both" => Ok(Direction::Both),
            other => Err(FateError::InvalidDirection(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationSettings {
    pub stepper: StepperKind,
    /// Fixed steps taken between two consecutive grid times.
    pub substeps: usize,
    /// Re-interpolate onto this many points (doubled for `Both`).
    pub interpolation_num: Option<usize>,
    /// Replace the batch by its per-time mean when it holds several cells.
    pub average: bool,
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        Self {
            stepper: StepperKind::Rk4,
            substeps: 10,
            interpolation_num: None,
            average: false,
        }
    }
}

/// Integrated batch. `states` stacks the trajectories by rows, each one
/// `times.len()` rows long, in the order of the initial states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationResult {
    pub times: Vec<f64>,
    pub states: DMatrix<f64>,
    /// Trajectories in `states`; 1 after averaging.
    pub n_trajectories: usize,
}

impl IntegrationResult {
    pub fn n_steps(&self) -> usize {
        self.times.len()
    }

    /// Rows of trajectory `idx`.
    pub fn trajectory(&self, idx: usize) -> Result<DMatrix<f64>> {
        if idx >= self.n_trajectories {
            bail!(
                "Trajectory index {} out of range for {} trajectories.",
                idx,
                self.n_trajectories
            );
        }
        let n = self.n_steps();
        Ok(self.states.rows(idx * n, n).into_owned())
    }
}

struct RawTrajectory {
    times: Vec<f64>,
    states: Vec<f64>,
}

/// Integrates every row of `init_states` over the grid `t` in `direction`.
///
/// `t` must be non-empty, non-negative and non-decreasing. Backward runs report
/// the times `-t` in the order they were integrated.
pub fn integrate_vector_field<F>(
    field: &F,
    init_states: &DMatrix<f64>,
    t: &[f64],
    direction: Direction,
    settings: &IntegrationSettings,
) -> Result<IntegrationResult>
where
    F: VectorField + Sync,
{
    validate_batch(field, init_states)?;
    validate_grid(t)?;
    if settings.substeps == 0 {
        bail!("substeps must be at least 1.");
    }
    if settings.interpolation_num == Some(0) {
        bail!("interpolation_num must be positive when given.");
    }

    let dim = init_states.ncols();
    let rows = state_rows(init_states);
    debug!(
        n_cell = rows.len(),
        n_steps = t.len(),
        %direction,
        "integrating vector field on a fixed grid"
    );

    let raw: Vec<RawTrajectory> = rows
        .par_iter()
        .map(|y0| raw_trajectory(field, y0, t, direction, settings))
        .collect();
    let raw_times = raw_times(&raw)?;

    let (times, blocks) = match settings.interpolation_num {
        None => (raw_times, raw.into_iter().map(|r| r.states).collect()),
        Some(m) => {
            let m = if direction == Direction::Both { 2 * m } else { m };
            let hull = raw
                .iter()
                .filter_map(|r| moving_range(&r.states, dim))
                .reduce(|a, b| (a.0.min(b.0), a.1.max(b.1)));
            let (lo, hi) = match hull {
                Some(range) => range,
                None => {
                    warn!(
                        threshold = FLATNESS_THRESHOLD,
                        "no trajectory moves; interpolating over the full time range"
                    );
                    (0, raw_times.len() - 1)
                }
            };
            let grid = linspace(raw_times[lo], raw_times[hi], m);
            let blocks = raw
                .par_iter()
                .map(|r| resample(&r.times, &r.states, dim, &grid))
                .collect();
            (grid, blocks)
        }
    };

    Ok(assemble(times, blocks, dim, settings.average))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct IvpSettings {
    pub rtol: f64,
    pub atol: f64,
    pub max_steps: usize,
    /// Evaluate on this many evenly spaced times (doubled for `Both`) instead
    /// of the union of accepted step times.
    pub interpolation_num: Option<usize>,
    pub average: bool,
}

impl Default for IvpSettings {
    fn default() -> Self {
        Self {
            rtol: 1e-3,
            atol: 1e-6,
            max_steps: 100_000,
            interpolation_num: None,
            average: false,
        }
    }
}

/// Dense output of one trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IvpSolution {
    Single(DenseSolution),
    Both {
        backward: DenseSolution,
        forward: DenseSolution,
    },
}

impl IvpSolution {
    /// State at `t`; for `Both`, negative times read the backward run.
    pub fn evaluate(&self, t: f64) -> Vec<f64> {
        match self {
            IvpSolution::Single(solution) => solution.evaluate(t),
            IvpSolution::Both { backward, forward } => {
                if t < 0.0 {
                    backward.evaluate(t)
                } else {
                    forward.evaluate(t)
                }
            }
        }
    }

    pub fn reached_fixed_point(&self) -> bool {
        match self {
            IvpSolution::Single(solution) => solution.termination == Termination::FixedPoint,
            IvpSolution::Both { backward, forward } => {
                backward.termination == Termination::FixedPoint
                    || forward.termination == Termination::FixedPoint
            }
        }
    }

    fn accepted_times(&self) -> Vec<f64> {
        match self {
            IvpSolution::Single(solution) => solution.times.clone(),
            IvpSolution::Both { backward, forward } => backward
                .times
                .iter()
                .chain(&forward.times)
                .copied()
                .collect(),
        }
    }

    fn bounds(&self) -> (f64, f64) {
        self.accepted_times()
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &t| {
                (lo.min(t), hi.max(t))
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvpResult {
    /// Shared ascending grid every solution was evaluated on.
    pub times: Vec<f64>,
    pub states: DMatrix<f64>,
    pub n_trajectories: usize,
    pub solutions: Vec<IvpSolution>,
}

/// Adaptive counterpart of [`integrate_vector_field`]. Only the first and last
/// entries of `t` are used; each run stops early once the speed drops below
/// [`FIXED_POINT_SPEED`].
pub fn integrate_vector_field_ivp<F>(
    field: &F,
    init_states: &DMatrix<f64>,
    t: &[f64],
    direction: Direction,
    settings: &IvpSettings,
) -> Result<IvpResult>
where
    F: VectorField + Sync,
{
    validate_batch(field, init_states)?;
    validate_grid(t)?;
    if settings.interpolation_num == Some(0) {
        bail!("interpolation_num must be positive when given.");
    }
    let (t0, t_end) = (t[0], t[t.len() - 1]);
    if t_end <= t0 {
        bail!("IVP integration needs a time grid spanning a positive interval.");
    }

    let adaptive = AdaptiveSettings {
        rtol: settings.rtol,
        atol: settings.atol,
        max_step: (t_end - t0) / IVP_MAX_STEP_DIVISOR,
        max_steps: settings.max_steps,
        stop_speed: Some(FIXED_POINT_SPEED),
    };
    let dim = init_states.ncols();
    let rows = state_rows(init_states);
    debug!(n_cell = rows.len(), %direction, "integrating vector field with the ivp solver");

    let solutions = rows
        .par_iter()
        .map(|y0| -> Result<IvpSolution> {
            let mut solver = Dopri5::new(dim);
            let solution = match direction {
                Direction::Forward => {
                    IvpSolution::Single(solver.integrate(field, y0, t0, t_end, &adaptive)?)
                }
                Direction::Backward => {
                    IvpSolution::Single(solver.integrate(field, y0, -t0, -t_end, &adaptive)?)
                }
                Direction::Both => IvpSolution::Both {
                    backward: solver.integrate(field, y0, -t0, -t_end, &adaptive)?,
                    forward: solver.integrate(field, y0, t0, t_end, &adaptive)?,
                },
            };
            Ok(solution)
        })
        .collect::<Result<Vec<_>>>()?;

    let stopped = solutions.iter().filter(|s| s.reached_fixed_point()).count();
    if stopped > 0 {
        debug!(stopped, "trajectories stopped at a fixed point");
    }

    let grid = match settings.interpolation_num {
        Some(m) => {
            let m = if direction == Direction::Both { 2 * m } else { m };
            let (lo, hi) = solutions
                .iter()
                .map(IvpSolution::bounds)
                .fold((f64::INFINITY, f64::NEG_INFINITY), |a, b| {
                    (a.0.min(b.0), a.1.max(b.1))
                });
            linspace(lo, hi, m)
        }
        None => {
            let mut all: Vec<f64> = solutions.iter().flat_map(|s| s.accepted_times()).collect();
            all.sort_by(f64::total_cmp);
            all.dedup();
            all
        }
    };

    let blocks: Vec<Vec<f64>> = solutions
        .par_iter()
        .map(|s| grid.iter().flat_map(|&time| s.evaluate(time)).collect())
        .collect();
    let result = assemble(grid, blocks, dim, settings.average);

    Ok(IvpResult {
        times: result.times,
        states: result.states,
        n_trajectories: result.n_trajectories,
        solutions,
    })
}

fn validate_batch(field: &impl VectorField, init_states: &DMatrix<f64>) -> Result<()> {
    if init_states.nrows() == 0 {
        bail!("At least one initial state is required.");
    }
    if init_states.ncols() == 0 {
        bail!("Initial states must have positive dimension.");
    }
    ensure_dimension("Initial state", field.dimension(), init_states.ncols())?;
    Ok(())
}

fn validate_grid(t: &[f64]) -> Result<()> {
    if t.is_empty() {
        bail!("Time grid must not be empty.");
    }
    if t.iter().any(|v| !v.is_finite() || *v < 0.0) {
        bail!("Time grid must be finite and non-negative.");
    }
    if t.windows(2).any(|w| w[1] < w[0]) {
        bail!("Time grid must be non-decreasing.");
    }
    Ok(())
}

fn state_rows(states: &DMatrix<f64>) -> Vec<Vec<f64>> {
    states
        .row_iter()
        .map(|row| row.iter().copied().collect())
        .collect()
}

fn raw_times(raw: &[RawTrajectory]) -> Result<Vec<f64>> {
    match raw.first() {
        Some(first) => Ok(first.times.clone()),
        None => bail!("At least one initial state is required."),
    }
}

fn integrate_on_grid(
    field: &impl VectorField,
    y0: &[f64],
    t: &[f64],
    sign: f64,
    settings: &IntegrationSettings,
) -> Vec<f64> {
    let dim = y0.len();
    let mut stepper = settings.stepper.build(dim);
    let mut state = y0.to_vec();
    let mut time = sign * t[0];
    let mut out = Vec::with_capacity(t.len() * dim);
    out.extend_from_slice(&state);

    for w in t.windows(2) {
        let h = sign * (w[1] - w[0]) / settings.substeps as f64;
        for _ in 0..settings.substeps {
            stepper.step(field, &mut time, &mut state, h);
        }
        out.extend_from_slice(&state);
    }
    out
}

fn raw_trajectory(
    field: &impl VectorField,
    y0: &[f64],
    t: &[f64],
    direction: Direction,
    settings: &IntegrationSettings,
) -> RawTrajectory {
    let dim = y0.len();
    match direction {
        Direction::Forward => RawTrajectory {
            times: t.to_vec(),
            states: integrate_on_grid(field, y0, t, 1.0, settings),
        },
        Direction::Backward => RawTrajectory {
            times: t.iter().map(|v| -v).collect(),
            states: integrate_on_grid(field, y0, t, -1.0, settings),
        },
        Direction::Both => {
            let backward = integrate_on_grid(field, y0, t, -1.0, settings);
            let forward = integrate_on_grid(field, y0, t, 1.0, settings);
            let mut states: Vec<f64> =
                backward.chunks_exact(dim).rev().flatten().copied().collect();
            states.extend(forward);
            let times = t.iter().rev().map(|v| -v).chain(t.iter().copied()).collect();
            RawTrajectory { times, states }
        }
    }
}

/// Sample range `[first, last]` enclosing every step that moves by at least
/// [`FLATNESS_THRESHOLD`] in some feature, or `None` for a flat trajectory.
fn moving_range(states: &[f64], dim: usize) -> Option<(usize, usize)> {
    let n = states.len() / dim;
    let moving = |k: usize| {
        let a = &states[k * dim..(k + 1) * dim];
        let b = &states[(k + 1) * dim..(k + 2) * dim];
        a.iter().zip(b).any(|(x, y)| (y - x).abs() >= FLATNESS_THRESHOLD)
    };
    let steps = n.saturating_sub(1);
    let first = (0..steps).find(|&k| moving(k))?;
    let last = (0..steps).rev().find(|&k| moving(k))?;
    Some((first, last + 1))
}

fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (count - 1) as f64;
            let mut grid: Vec<f64> = (0..count).map(|k| start + step * k as f64).collect();
            grid[count - 1] = end;
            grid
        }
    }
}

/// Linear interpolation of a sampled trajectory at every time in `grid`.
/// `times` may run in either direction and may repeat a value; queries outside
/// the sampled span are clamped.
fn resample(times: &[f64], states: &[f64], dim: usize, grid: &[f64]) -> Vec<f64> {
    let n = times.len();
    let mut out = Vec::with_capacity(grid.len() * dim);
    if n == 1 {
        for _ in grid {
            out.extend_from_slice(&states[..dim]);
        }
        return out;
    }

    let increasing = times[n - 1] >= times[0];
    let beyond = |a: f64, b: f64| if increasing { a > b } else { a < b };
    for &t in grid {
        let i = (1..n).find(|&i| !beyond(t, times[i])).unwrap_or(n - 1);
        let (t0, t1) = (times[i - 1], times[i]);
        let s = if t1 == t0 {
            1.0
        } else {
            ((t - t0) / (t1 - t0)).clamp(0.0, 1.0)
        };
        let a = &states[(i - 1) * dim..i * dim];
        let b = &states[i * dim..(i + 1) * dim];
        out.extend(a.iter().zip(b).map(|(x, y)| x + s * (y - x)));
    }
    out
}

fn assemble(
    times: Vec<f64>,
    blocks: Vec<Vec<f64>>,
    dim: usize,
    average: bool,
) -> IntegrationResult {
    let n_steps = times.len();
    let n_trajectories = blocks.len();

    if average && n_trajectories > 1 {
        let mut mean = vec![0.0; n_steps * dim];
        for block in &blocks {
            for (m, v) in mean.iter_mut().zip(block) {
                *m += v;
            }
        }
        for m in &mut mean {
            *m /= n_trajectories as f64;
        }
        return IntegrationResult {
            times,
            states: DMatrix::from_row_slice(n_steps, dim, &mean),
            n_trajectories: 1,
        };
    }

    let data = blocks.concat();
    IntegrationResult {
        times,
        states: DMatrix::from_row_slice(n_trajectories * n_steps, dim, &data),
        n_trajectories,
    }
}
