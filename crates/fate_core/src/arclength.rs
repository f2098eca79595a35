//! Arclength utilities for polylines of states.
//!
//! Paths coming out of integrators or graph searches are sampled unevenly;
//! these helpers drop near-duplicate points and redistribute the remaining
//! polyline so consecutive points are one fixed arclength apart.

use crate::path::{distance, Path};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default tolerance used when deduplicating paths before resampling.
pub const REDUNDANT_POINT_TOLERANCE: f64 = 1e-4;

/// Drops every point closer than `tol` to the last retained point.
///
/// The first point is always kept. Returns the filtered path and its
/// arclength.
pub fn remove_redundant_points(path: &Path, tol: f64) -> (Path, f64) {
    let (filtered, arclength, _) = remove_redundant_points_with_mask(path, tol);
    (filtered, arclength)
}

/// Same as [`remove_redundant_points`], also reporting which input points
/// were discarded.
pub fn remove_redundant_points_with_mask(path: &Path, tol: f64) -> (Path, f64, Vec<bool>) {
    let mut discard = vec![false; path.len()];
    let mut filtered = Path::empty(path.dimension());
    let mut last_kept: Option<&[f64]> = None;
    let mut arclength = 0.0;

    for (idx, point) in path.points().enumerate() {
        if let Some(prev) = last_kept {
            let d = distance(prev, point);
            if d < tol {
                discard[idx] = true;
                continue;
            }
            arclength += d;
        }
        filtered.push_point(point);
        last_kept = Some(point);
    }

    (filtered, arclength, discard)
}

/// Result of [`sample_at_arclength`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArclengthSample {
    pub points: Path,
    pub times: Option<Vec<f64>>,
    /// Arclength covered by the emitted points, `points.len() * step_length`.
    pub arclength: f64,
    /// Zero-length segments that were stepped over.
    pub degenerate_segments: usize,
}

/// Walks the polyline and emits a point every `step_length` of arclength.
///
/// Each emitted point is linearly interpolated on the segment where the
/// accumulated length reaches `step_length`, and the walk restarts from it.
/// When `times` is given, a time is interpolated the same way. The walk stops
/// when less than `step_length` remains before the last point; that tail is
/// dropped rather than padded.
pub fn sample_at_arclength(
    path: &Path,
    step_length: f64,
    times: Option<&[f64]>,
) -> Result<ArclengthSample> {
    if !(step_length.is_finite() && step_length > 0.0) {
        bail!("step_length must be positive and finite, got {}.", step_length);
    }
    if let Some(t) = times {
        if t.len() != path.len() {
            bail!(
                "Time sequence length mismatch. Expected {}, got {}.",
                path.len(),
                t.len()
            );
        }
    }

    let dim = path.dimension();
    let n = path.len();
    let mut points = Path::empty(dim);
    let mut sampled_times = times.map(|_| Vec::new());
    let mut degenerate_segments = 0usize;

    if n >= 2 {
        let mut anchor = path.point(0).to_vec();
        let mut anchor_t = times.map(|t| t[0]).unwrap_or(0.0);
        let mut segment = 1usize;

        loop {
            let mut walked = 0.0;
            let mut emitted = false;

            for j in segment..n {
                let start = if j == segment { &anchor[..] } else { path.point(j - 1) };
                let end = path.point(j);
                let d = distance(start, end);
                if d == 0.0 {
                    if distance(path.point(j - 1), end) == 0.0 {
                        degenerate_segments += 1;
                    }
                    continue;
                }
                if walked + d >= step_length {
                    let frac = (step_length - walked) / d;
                    let point: Vec<f64> = start
                        .iter()
                        .zip(end)
                        .map(|(a, b)| a + frac * (b - a))
                        .collect();
                    if distance(&point, &anchor) == 0.0 {
                        bail!(
                            "step_length {} is below the coordinate resolution near {:?}.",
                            step_length,
                            anchor
                        );
                    }
                    if let (Some(t), Some(out)) = (times, sampled_times.as_mut()) {
                        let t_start = if j == segment { anchor_t } else { t[j - 1] };
                        anchor_t = t_start + frac * (t[j] - t_start);
                        out.push(anchor_t);
                    }
                    points.push_point(&point);
                    anchor = point;
                    segment = j;
                    emitted = true;
                    break;
                }
                walked += d;
            }

            if !emitted {
                break;
            }
        }
    }

    if degenerate_segments > 0 {
        warn!(
            degenerate_segments,
            "zero-length segments skipped during arclength sampling"
        );
    }

    let arclength = points.len() as f64 * step_length;
    Ok(ArclengthSample {
        points,
        times: sampled_times,
        arclength,
        degenerate_segments,
    })
}
