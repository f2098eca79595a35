//! Time-indexed states and the least action path built on top of them.

use crate::action::{cumulative_action, mfpt_proxy};
use crate::error::ensure_dimension;
use crate::path::Path;
use crate::traits::VectorField;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// A path together with the time of each of its points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    path: Path,
    times: Vec<f64>,
}

impl Trajectory {
    pub fn new(path: Path, times: Vec<f64>) -> Result<Self> {
        if path.is_empty() {
            bail!("A trajectory needs at least one state.");
        }
        if times.len() != path.len() {
            bail!(
                "Time sequence length mismatch. Expected {}, got {}.",
                path.len(),
                times.len()
            );
        }
        if times.windows(2).any(|w| !(w[1] >= w[0])) {
            bail!("Trajectory times must be non-decreasing.");
        }
        Ok(Self { path, times })
    }

    /// Times `0, dt, 2 dt, ...`.
    pub fn uniform(path: Path, dt: f64) -> Result<Self> {
        if !(dt.is_finite() && dt > 0.0) {
            bail!("dt must be positive and finite, got {}.", dt);
        }
        let times = (0..path.len()).map(|i| i as f64 * dt).collect();
        Self::new(path, times)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Mean time step, 0 for a single state.
    pub fn dt(&self) -> f64 {
        let n = self.times.len();
        if n < 2 {
            return 0.0;
        }
        (self.times[n - 1] - self.times[0]) / (n - 1) as f64
    }

    /// Linearly interpolated state at `t`, clamped to the first and last state.
    pub fn interpolate(&self, t: f64) -> Vec<f64> {
        let n = self.len();
        match bracket(&self.times, t) {
            Some((i, s)) => {
                let (a, b) = (self.path.point(i), self.path.point(i + 1));
                a.iter().zip(b).map(|(x, y)| x + s * (y - x)).collect()
            }
            None if n > 0 && t > self.times[n - 1] => self.path.point(n - 1).to_vec(),
            None => self.path.point(0).to_vec(),
        }
    }
}

/// Segment `i` and fraction `s` with `times[i] + s * (times[i+1] - times[i]) == t`,
/// or `None` when `t` lies outside `times`.
fn bracket(times: &[f64], t: f64) -> Option<(usize, f64)> {
    let n = times.len();
    if n < 2 || t < times[0] || t > times[n - 1] {
        return None;
    }
    let i = times[1..]
        .iter()
        .position(|&tk| t <= tk)
        .unwrap_or(n - 2);
    let h = times[i + 1] - times[i];
    let s = if h == 0.0 { 1.0 } else { (t - times[i]) / h };
    Some((i, s))
}

/// Cumulative action along a path: `values[i]` is the action of its first
/// `i + 1` points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProfile {
    pub diffusion: f64,
    pub values: Vec<f64>,
}

/// An optimized transition path with uniform time steps and its action profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeastActionPath {
    trajectory: Trajectory,
    profile: ActionProfile,
}

impl LeastActionPath {
    /// Evaluates the action profile of `path` once; later queries are lookups.
    pub fn new(path: Path, field: &impl VectorField, diffusion: f64, dt: f64) -> Result<Self> {
        ensure_dimension("Path", field.dimension(), path.dimension())?;
        if !(diffusion.is_finite() && diffusion > 0.0) {
            bail!("Diffusion coefficient must be positive and finite, got {}.", diffusion);
        }
        let values = cumulative_action(&path, field, diffusion, dt);
        let trajectory = Trajectory::uniform(path, dt)?;
        Ok(Self {
            trajectory,
            profile: ActionProfile { diffusion, values },
        })
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    pub fn path(&self) -> &Path {
        self.trajectory.path()
    }

    pub fn times(&self) -> &[f64] {
        self.trajectory.times()
    }

    pub fn dt(&self) -> f64 {
        self.trajectory.dt()
    }

    pub fn diffusion(&self) -> f64 {
        self.profile.diffusion
    }

    pub fn profile(&self) -> &ActionProfile {
        &self.profile
    }

    /// Action of the whole path.
    pub fn total_action(&self) -> f64 {
        self.profile.values.last().copied().unwrap_or(0.0)
    }

    /// The cumulative action series, or its linear interpolation at `t`. Times
    /// outside the trajectory are an error.
    pub fn action(&self, t: Option<&[f64]>) -> Result<Vec<f64>> {
        let Some(t) = t else {
            return Ok(self.profile.values.clone());
        };
        let times = self.trajectory.times();
        let values = &self.profile.values;
        t.iter()
            .map(|&ti| -> Result<f64> {
                if values.len() == 1 && ti == times[0] {
                    return Ok(values[0]);
                }
                match bracket(times, ti) {
                    Some((i, s)) => Ok(values[i] + s * (values[i + 1] - values[i])),
                    None => bail!(
                        "Time {} is outside the trajectory span [{}, {}].",
                        ti,
                        times[0],
                        times[times.len() - 1]
                    ),
                }
            })
            .collect()
    }

    /// Mean first passage time proxy of `action`, or of the cached series.
    pub fn mfpt(&self, action: Option<&[f64]>) -> Vec<f64> {
        mfpt_proxy(action.unwrap_or(&self.profile.values))
    }
}
