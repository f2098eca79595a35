//! Seeds for the least action solver.

use crate::arclength::{remove_redundant_points, sample_at_arclength, REDUNDANT_POINT_TOLERANCE};
use crate::error::ensure_dimension;
use crate::graph::{Embedding, NearestNeighbors, PathMetric, SimilarityGraph};
use crate::path::Path;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct InitPathSettings {
    /// Graph points closer than this to the previous kept point are dropped.
    pub tol: f64,
    pub metric: PathMetric,
}

impl Default for InitPathSettings {
    fn default() -> Self {
        Self {
            tol: REDUNDANT_POINT_TOLERANCE,
            metric: PathMetric::Hops,
        }
    }
}

/// `n_points + 1` evenly spaced points from `start` to `end`, endpoints copied
/// exactly.
pub fn straight_line_path(start: &[f64], end: &[f64], n_points: usize) -> Result<Path> {
    if start.is_empty() {
        bail!("Start state must have positive dimension.");
    }
    ensure_dimension("End state", start.len(), end.len())?;
    if n_points == 0 {
        bail!("n_points must be at least 1.");
    }

    let mut path = Path::empty(start.len());
    path.push_point(start);
    let mut point = vec![0.0; start.len()];
    for k in 1..n_points {
        let s = k as f64 / n_points as f64;
        for (p, (a, b)) in point.iter_mut().zip(start.iter().zip(end)) {
            *p = a + s * (b - a);
        }
        path.push_point(&point);
    }
    path.push_point(end);
    Ok(path)
}

/// Builds an `n_points + 1` point seed between `start` and `end` that follows
/// the shortest graph path between their nearest cells.
///
/// The graph path's coordinates are deduplicated and resampled to
/// `n_points - 1` evenly spaced points, then the exact `start` and `end` are
/// added as boundary points. When both endpoints map to the same cell the seed
/// is a straight line.
pub fn initial_path(
    graph: &SimilarityGraph,
    start: &[f64],
    end: &[f64],
    embedding: &Embedding,
    n_points: usize,
    settings: &InitPathSettings,
) -> Result<Path> {
    if n_points < 2 {
        bail!("n_points must be at least 2, got {}.", n_points);
    }
    ensure_dimension("Start state", embedding.dimension(), start.len())?;
    ensure_dimension("End state", embedding.dimension(), end.len())?;
    if graph.node_count() != embedding.n_cells() {
        bail!(
            "Graph has {} nodes but the embedding has {} cells.",
            graph.node_count(),
            embedding.n_cells()
        );
    }

    let source = nearest_cell(embedding, start).context("Failed to locate the start cell")?;
    let target = nearest_cell(embedding, end).context("Failed to locate the end cell")?;
    if source == target {
        debug!(cell = source, "start and end share a cell, seeding with a straight line");
        return straight_line_path(start, end, n_points);
    }

    let nodes = graph.shortest_path(source, target, settings.metric)?;
    let mut coords = Path::empty(embedding.dimension());
    for &node in &nodes {
        coords.push_point(&embedding.point(node)?);
    }
    let (filtered, arclength) = remove_redundant_points(&coords, settings.tol);
    if arclength == 0.0 {
        debug!(source, target, "graph path has no length, seeding with a straight line");
        return straight_line_path(start, end, n_points);
    }
    debug!(
        source,
        target,
        hops = nodes.len() - 1,
        arclength,
        "graph path found"
    );

    let interior = n_points - 1;
    let sample = sample_at_arclength(&filtered, arclength / interior as f64, None)?;

    let mut path = Path::empty(start.len());
    path.push_point(start);
    for point in sample.points.points().take(interior) {
        path.push_point(point);
    }
    // Rounding can lose the sample that lands on the last graph point.
    if let Some(last) = filtered.last() {
        while path.len() < n_points {
            path.push_point(last);
        }
    }
    path.push_point(end);
    Ok(path)
}

fn nearest_cell(embedding: &Embedding, point: &[f64]) -> Result<usize> {
    match embedding.nearest(point, 1)?.first() {
        Some(&idx) => Ok(idx),
        None => bail!("Nearest-neighbour lookup returned no cell."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn line_embedding(n: usize) -> (SimilarityGraph, Embedding) {
        let coords: Vec<f64> = (0..n).flat_map(|i| [i as f64, 0.0]).collect();
        let embedding = Embedding::new(DMatrix::from_row_slice(n, 2, &coords));
        let edges: Vec<(usize, usize, f64)> = (1..n).map(|i| (i - 1, i, 1.0)).collect();
        let graph = SimilarityGraph::from_edges(n, &edges).expect("valid graph");
        (graph, embedding)
    }

    #[test]
    fn straight_line_has_exact_endpoints() {
        let path = straight_line_path(&[0.1, 0.2], &[1.3, -0.7], 7).unwrap();
        assert_eq!(path.len(), 8);
        assert_eq!(path.first(), Some(&[0.1, 0.2][..]));
        assert_eq!(path.last(), Some(&[1.3, -0.7][..]));
        assert!(straight_line_path(&[0.0], &[1.0, 2.0], 3).is_err());
    }

    #[test]
    fn seed_follows_graph_and_keeps_exact_endpoints() {
        let (graph, embedding) = line_embedding(5);
        let start = [-0.1, 0.1];
        let end = [4.2, 0.0];
        let path = initial_path(&graph, &start, &end, &embedding, 5, &InitPathSettings::default())
            .expect("seed builds");

        assert_eq!(path.len(), 6);
        assert_eq!(path.point(0), &start);
        assert_eq!(path.point(5), &end);
        for (i, x) in [1.0, 2.0, 3.0, 4.0].iter().enumerate() {
            assert_relative_eq!(path.point(i + 1)[0], *x, epsilon = 1e-12);
            assert_relative_eq!(path.point(i + 1)[1], 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn seed_length_is_always_n_points_plus_one() {
        let coords = DMatrix::from_row_slice(
            6,
            2,
            &[0.0, 0.0, 0.3, 0.1, 0.35, 0.9, 1.7, 1.1, 1.71, 1.1, 2.9, 0.2],
        );
        let embedding = Embedding::new(coords);
        let graph = SimilarityGraph::from_edges(
            6,
            &[(0, 1, 1.0), (1, 2, 1.0), (2, 3, 1.0), (3, 4, 1.0), (4, 5, 1.0)],
        )
        .expect("valid graph");

        for n_points in 2..15 {
            let path = initial_path(
                &graph,
                &[0.0, 0.0],
                &[2.9, 0.2],
                &embedding,
                n_points,
                &InitPathSettings::default(),
            )
            .expect("seed builds");
            assert_eq!(path.len(), n_points + 1, "n_points = {n_points}");
        }
    }

    #[test]
    fn shared_nearest_cell_falls_back_to_straight_line() {
        let (graph, embedding) = line_embedding(3);
        let path = initial_path(
            &graph,
            &[0.9, 0.1],
            &[1.1, -0.1],
            &embedding,
            4,
            &InitPathSettings::default(),
        )
        .expect("seed builds");
        assert_eq!(path, straight_line_path(&[0.9, 0.1], &[1.1, -0.1], 4).unwrap());
    }

    #[test]
    fn weight_metric_changes_the_route() {
        // 0 -> 2 is either one heavy edge or two light hops through (1, 1).
        let coords = DMatrix::from_row_slice(3, 2, &[0.0, 0.0, 1.0, 1.0, 2.0, 0.0]);
        let embedding = Embedding::new(coords);
        let graph = SimilarityGraph::from_edges(3, &[(0, 2, 10.0), (0, 1, 1.0), (1, 2, 1.0)])
            .expect("valid graph");
        let settings = InitPathSettings {
            metric: PathMetric::Weight,
            ..InitPathSettings::default()
        };
        let path = initial_path(&graph, &[0.0, 0.0], &[2.0, 0.0], &embedding, 2, &settings)
            .expect("seed builds");
        // The single interior sample sits at the end of the detour.
        assert_eq!(path.len(), 3);
        assert_relative_eq!(path.point(1)[0], 2.0, epsilon = 1e-12);

        let defaults = InitPathSettings::default();
        let direct = initial_path(&graph, &[0.0, 0.0], &[2.0, 0.0], &embedding, 3, &defaults)
            .expect("seed builds");
        assert_relative_eq!(direct.point(1)[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn rejects_mismatched_inputs() {
        let (graph, embedding) = line_embedding(3);
        let settings = InitPathSettings::default();
        assert!(initial_path(&graph, &[0.0], &[1.0, 0.0], &embedding, 4, &settings).is_err());
        assert!(initial_path(&graph, &[0.0, 0.0], &[1.0, 0.0], &embedding, 1, &settings).is_err());
        let (small_graph, _) = line_embedding(2);
        let err = initial_path(&small_graph, &[0.0, 0.0], &[2.0, 0.0], &embedding, 4, &settings)
            .expect_err("size mismatch");
        assert!(format!("{err}").contains("Graph has 2 nodes"));
    }
}
