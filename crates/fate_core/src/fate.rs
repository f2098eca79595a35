//! Fate prediction: integrate selected cells through the vector field over a
//! time horizon, optionally collapsing the batch to a single representative.

use crate::error::ensure_dimension;
use crate::graph::{CellRef, Embedding};
use crate::integration::{
    integrate_vector_field, integrate_vector_field_ivp, Direction, IntegrationResult,
    IntegrationSettings, IvpSettings,
};
use crate::solvers::StepperKind;
use crate::traits::VectorField;
use anyhow::{bail, Context, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Grid size used when no step size is given.
pub const DEFAULT_TIME_STEPS: usize = 250;

/// `[0, h, 2h, ...]` up to `t_end` for a step size `h`, otherwise
/// [`DEFAULT_TIME_STEPS`] evenly spaced points on `[0, t_end]`.
pub fn time_grid(t_end: f64, step_size: Option<f64>) -> Result<Vec<f64>> {
    if !(t_end.is_finite() && t_end > 0.0) {
        bail!("t_end must be positive and finite, got {}.", t_end);
    }
    match step_size {
        Some(h) => {
            if !(h.is_finite() && h > 0.0) {
                bail!("step_size must be positive and finite, got {}.", h);
            }
            let count = (t_end / h + 1e-9).floor() as usize;
            Ok((0..=count).map(|k| k as f64 * h).collect())
        }
        None => {
            let n = DEFAULT_TIME_STEPS;
            let step = t_end / (n - 1) as f64;
            let mut grid: Vec<f64> = (0..n).map(|k| k as f64 * step).collect();
            grid[n - 1] = t_end;
            Ok(grid)
        }
    }
}

/// Time needed to cross the widest coordinate span at the slowest non-zero
/// speed component.
pub fn estimate_t_end(coords: &DMatrix<f64>, velocities: &DMatrix<f64>) -> Result<f64> {
    if coords.shape() != velocities.shape() {
        bail!(
            "Velocity shape {:?} does not match coordinate shape {:?}.",
            velocities.shape(),
            coords.shape()
        );
    }
    let max_span = coords
        .column_iter()
        .map(|col| col.max() - col.min())
        .fold(0.0, f64::max);
    let min_speed = velocities
        .iter()
        .map(|v| v.abs())
        .filter(|v| *v > 0.0)
        .fold(f64::INFINITY, f64::min);

    if !min_speed.is_finite() {
        bail!("Cannot estimate t_end: every velocity component is zero.");
    }
    if max_span <= 0.0 {
        bail!("Cannot estimate t_end: the coordinates do not span any distance.");
    }
    Ok(max_span / min_speed)
}

/// Field velocity at every row of `coords`.
pub fn velocities(field: &impl VectorField, coords: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    ensure_dimension("Coordinate", field.dimension(), coords.ncols())?;
    // Column-major storage of the transpose is the row-major batch.
    let flat = coords.transpose();
    let mut out = vec![0.0; flat.len()];
    field.apply_batch(flat.as_slice(), &mut out);
    Ok(DMatrix::from_row_slice(coords.nrows(), coords.ncols(), &out))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Averaging {
    #[default]
    None,
    /// Integrate once from the mean initial state.
    Origin,
    /// Integrate every cell and average the trajectories.
    Trajectory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FateMethod {
    #[default]
    Grid,
    Ivp,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FateSettings {
    /// Horizon; estimated from the data when absent.
    pub t_end: Option<f64>,
    pub step_size: Option<f64>,
    pub direction: Direction,
    pub average: Averaging,
    pub interpolation_num: Option<usize>,
    pub method: FateMethod,
    pub stepper: StepperKind,
    pub substeps: usize,
    pub rtol: f64,
    pub atol: f64,
}

impl Default for FateSettings {
    fn default() -> Self {
        let grid = IntegrationSettings::default();
        let ivp = IvpSettings::default();
        Self {
            t_end: None,
            step_size: None,
            direction: Direction::Both,
            average: Averaging::None,
            interpolation_num: Some(DEFAULT_TIME_STEPS),
            method: FateMethod::Grid,
            stepper: grid.stepper,
            substeps: grid.substeps,
            rtol: ivp.rtol,
            atol: ivp.atol,
        }
    }
}

/// Predicts the past and/or future of every row of `init_states`. Without an
/// explicit `t_end` the horizon is estimated from the initial states.
pub fn fate<F>(
    field: &F,
    init_states: &DMatrix<f64>,
    settings: &FateSettings,
) -> Result<IntegrationResult>
where
    F: VectorField + Sync,
{
    let t_end = match settings.t_end {
        Some(t_end) => t_end,
        None => estimate_t_end(init_states, &velocities(field, init_states)?)
            .context("t_end was not given and could not be estimated from the initial states")?,
    };
    run(field, init_states, t_end, settings)
}

/// [`fate`] for cells picked out of an embedding. Without an explicit `t_end`
/// the horizon is estimated from the whole embedding.
pub fn fate_from_cells<F>(
    field: &F,
    embedding: &Embedding,
    cells: &[CellRef],
    settings: &FateSettings,
) -> Result<IntegrationResult>
where
    F: VectorField + Sync,
{
    let init_states = embedding.select_states(cells)?;
    let t_end = match settings.t_end {
        Some(t_end) => t_end,
        None => {
            let coords = embedding.coords();
            estimate_t_end(coords, &velocities(field, coords)?)?
        }
    };
    run(field, &init_states, t_end, settings)
}

fn run<F>(
    field: &F,
    init_states: &DMatrix<f64>,
    t_end: f64,
    settings: &FateSettings,
) -> Result<IntegrationResult>
where
    F: VectorField + Sync,
{
    let t = time_grid(t_end, settings.step_size)?;
    let states = match settings.average {
        Averaging::Origin if init_states.nrows() > 1 => {
            let origin = init_states.row_mean();
            DMatrix::from_row_slice(1, origin.len(), origin.as_slice())
        }
        _ => init_states.clone(),
    };
    let average = settings.average == Averaging::Trajectory;

    info!(
        n_cell = states.nrows(),
        t_end,
        n_steps = t.len(),
        direction = %settings.direction,
        "predicting cell fate"
    );

    match settings.method {
        FateMethod::Grid => {
            let integration = IntegrationSettings {
                stepper: settings.stepper,
                substeps: settings.substeps,
                interpolation_num: settings.interpolation_num,
                average,
            };
            integrate_vector_field(field, &states, &t, settings.direction, &integration)
        }
        FateMethod::Ivp => {
            let ivp = IvpSettings {
                rtol: settings.rtol,
                atol: settings.atol,
                interpolation_num: settings.interpolation_num,
                average,
                ..IvpSettings::default()
            };
            let result = integrate_vector_field_ivp(field, &states, &t, settings.direction, &ivp)?;
            Ok(IntegrationResult {
                times: result.times,
                states: result.states,
                n_trajectories: result.n_trajectories,
            })
        }
    }
}
