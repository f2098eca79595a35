//! Cell similarity graph, embedding coordinates and nearest-neighbour lookup.

use crate::error::{ensure_dimension, FateError};
use anyhow::{bail, Result};
use nalgebra::DMatrix;
use nalgebra_sparse::CsrMatrix;
use petgraph::algo::astar;
use petgraph::graph::{NodeIndex, UnGraph};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How edges are costed in shortest-path queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PathMetric {
    /// Every edge costs one hop.
    #[default]
    Hops,
    /// Edges cost their stored weight.
    Weight,
}

/// Undirected weighted graph over cell indices.
#[derive(Debug, Clone)]
pub struct SimilarityGraph {
    graph: UnGraph<(), f64>,
}

impl SimilarityGraph {
    pub fn with_nodes(n_nodes: usize) -> Self {
        let mut graph = UnGraph::with_capacity(n_nodes, 0);
        for _ in 0..n_nodes {
            graph.add_node(());
        }
        Self { graph }
    }

    /// Builds the graph from `(u, v, weight)` triples.
    pub fn from_edges(n_nodes: usize, edges: &[(usize, usize, f64)]) -> Result<Self> {
        let mut graph = Self::with_nodes(n_nodes);
        for &(u, v, w) in edges {
            graph.add_edge(u, v, w)?;
        }
        Ok(graph)
    }

    /// Every stored non-zero off-diagonal entry of a square sparse matrix (for
    /// example a transition matrix) becomes an undirected edge.
    pub fn from_csr(matrix: &CsrMatrix<f64>) -> Result<Self> {
        if matrix.nrows() != matrix.ncols() {
            bail!(
                "Similarity matrix must be square, got {}x{}.",
                matrix.nrows(),
                matrix.ncols()
            );
        }
        let mut graph = Self::with_nodes(matrix.nrows());
        for (row, col, &value) in matrix.triplet_iter() {
            if row == col || value == 0.0 {
                continue;
            }
            graph.add_edge(row, col, value.abs())?;
        }
        Ok(graph)
    }

    pub fn add_edge(&mut self, u: usize, v: usize, weight: f64) -> Result<()> {
        let n = self.node_count();
        for idx in [u, v] {
            if idx >= n {
                return Err(FateError::CellIndexOutOfRange { index: idx, len: n }.into());
            }
        }
        if !weight.is_finite() || weight < 0.0 {
            bail!("Edge weight must be finite and non-negative, got {}.", weight);
        }
        self.graph
            .add_edge(NodeIndex::new(u), NodeIndex::new(v), weight);
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Node indices of a shortest path from `source` to `target`, both
    /// inclusive.
    pub fn shortest_path(
        &self,
        source: usize,
        target: usize,
        metric: PathMetric,
    ) -> Result<Vec<usize>> {
        let n = self.node_count();
        for idx in [source, target] {
            if idx >= n {
                return Err(FateError::CellIndexOutOfRange { index: idx, len: n }.into());
            }
        }
        let goal = NodeIndex::new(target);
        let found = astar(
            &self.graph,
            NodeIndex::new(source),
            |node| node == goal,
            |edge| match metric {
                PathMetric::Hops => 1.0,
                PathMetric::Weight => *edge.weight(),
            },
            |_| 0.0,
        );
        match found {
            Some((_, nodes)) => Ok(nodes.into_iter().map(|n| n.index()).collect()),
            None => bail!(
                "No path between cells {} and {} in the similarity graph.",
                source,
                target
            ),
        }
    }
}

/// Reference to a cell by position or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellRef {
    Index(usize),
    Name(String),
}

/// Per-cell coordinates (one row per cell) with optional cell names.
#[derive(Debug, Clone)]
pub struct Embedding {
    coords: DMatrix<f64>,
    names: Vec<String>,
    lookup: HashMap<String, usize>,
}

impl Embedding {
    pub fn new(coords: DMatrix<f64>) -> Self {
        Self {
            coords,
            names: Vec::new(),
            lookup: HashMap::new(),
        }
    }

    pub fn with_names(coords: DMatrix<f64>, names: Vec<String>) -> Result<Self> {
        if names.len() != coords.nrows() {
            bail!(
                "Cell name count mismatch. Expected {}, got {}.",
                coords.nrows(),
                names.len()
            );
        }
        let mut lookup = HashMap::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            if lookup.insert(name.clone(), idx).is_some() {
                bail!("Duplicate cell name \"{}\".", name);
            }
        }
        Ok(Self {
            coords,
            names,
            lookup,
        })
    }

    pub fn n_cells(&self) -> usize {
        self.coords.nrows()
    }

    pub fn dimension(&self) -> usize {
        self.coords.ncols()
    }

    pub fn coords(&self) -> &DMatrix<f64> {
        &self.coords
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.lookup.get(name).copied()
    }

    pub fn point(&self, idx: usize) -> Result<Vec<f64>, FateError> {
        if idx >= self.n_cells() {
            return Err(FateError::CellIndexOutOfRange {
                index: idx,
                len: self.n_cells(),
            });
        }
        Ok(self.coords.row(idx).iter().copied().collect())
    }

    pub fn resolve(&self, cell: &CellRef) -> Result<usize, FateError> {
        match cell {
            CellRef::Index(idx) if *idx < self.n_cells() => Ok(*idx),
            CellRef::Index(idx) => Err(FateError::CellIndexOutOfRange {
                index: *idx,
                len: self.n_cells(),
            }),
            CellRef::Name(name) => self
                .index_of(name)
                .ok_or_else(|| FateError::UnknownCell(name.clone())),
        }
    }

    /// Coordinates of the referenced cells, one row per reference.
    pub fn select_states(&self, cells: &[CellRef]) -> Result<DMatrix<f64>> {
        if cells.is_empty() {
            bail!("At least one cell must be selected.");
        }
        let rows = cells
            .iter()
            .map(|cell| self.resolve(cell).map(|idx| self.coords.row(idx)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DMatrix::from_rows(&rows))
    }
}

/// k-nearest-neighbour queries over a fixed set of points.
pub trait NearestNeighbors {
    /// Indices of the `k` closest points to `query`, closest first.
    fn nearest(&self, query: &[f64], k: usize) -> Result<Vec<usize>>;
}

impl NearestNeighbors for Embedding {
    fn nearest(&self, query: &[f64], k: usize) -> Result<Vec<usize>> {
        ensure_dimension("Query point", self.dimension(), query.len())?;
        if self.n_cells() == 0 {
            bail!("Embedding has no cells.");
        }
        let mut scored: Vec<(f64, usize)> = self
            .coords
            .row_iter()
            .enumerate()
            .map(|(idx, row)| {
                let d2: f64 = row.iter().zip(query).map(|(a, b)| (a - b) * (a - b)).sum();
                (d2, idx)
            })
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        Ok(scored.into_iter().take(k).map(|(_, idx)| idx).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CooMatrix;

    fn chain_embedding() -> Embedding {
        let coords = DMatrix::from_row_slice(4, 2, &[0.0, 0.0, 1.0, 0.0, 2.0, 0.0, 3.0, 0.0]);
        let names = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        Embedding::with_names(coords, names).expect("valid embedding")
    }

    #[test]
    fn hop_and_weight_metrics_pick_different_paths() {
        // 0-1-2 is two hops but heavy, 0-3-4-2 is three light hops.
        let graph = SimilarityGraph::from_edges(
            5,
            &[(0, 1, 5.0), (1, 2, 5.0), (0, 3, 1.0), (3, 4, 1.0), (4, 2, 1.0)],
        )
        .expect("valid graph");
        assert_eq!(graph.shortest_path(0, 2, PathMetric::Hops).unwrap(), vec![0, 1, 2]);
        assert_eq!(
            graph.shortest_path(0, 2, PathMetric::Weight).unwrap(),
            vec![0, 3, 4, 2]
        );
        assert_eq!(graph.shortest_path(2, 0, PathMetric::Hops).unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn csr_matrix_becomes_undirected_graph_without_self_loops() {
        let mut coo = CooMatrix::new(3, 3);
        coo.push(0, 0, 1.0);
        coo.push(0, 1, 0.5);
        coo.push(2, 1, 0.25);
        let graph = SimilarityGraph::from_csr(&CsrMatrix::from(&coo)).expect("valid matrix");
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.shortest_path(0, 2, PathMetric::Hops).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn disconnected_cells_report_missing_path() {
        let graph = SimilarityGraph::from_edges(3, &[(0, 1, 1.0)]).expect("valid graph");
        let err = graph.shortest_path(0, 2, PathMetric::Hops).expect_err("no path");
        assert!(format!("{err}").contains("No path"));
        assert!(graph.shortest_path(0, 7, PathMetric::Hops).is_err());
    }

    #[test]
    fn nearest_neighbours_are_sorted_by_distance() {
        let embedding = chain_embedding();
        assert_eq!(embedding.nearest(&[2.2, 0.3], 1).unwrap(), vec![2]);
        assert_eq!(embedding.nearest(&[1.4, 0.0], 3).unwrap(), vec![1, 2, 0]);
        // Ties resolve to the lower index.
        assert_eq!(embedding.nearest(&[0.5, 0.0], 1).unwrap(), vec![0]);
        assert!(embedding.nearest(&[0.5], 1).is_err());
    }

    #[test]
    fn states_select_by_name_or_index() {
        let embedding = chain_embedding();
        let states = embedding
            .select_states(&[CellRef::Name("c".into()), CellRef::Index(0)])
            .expect("cells exist");
        assert_eq!(states.nrows(), 2);
        assert_eq!(states[(0, 0)], 2.0);
        assert_eq!(states[(1, 0)], 0.0);

        let err = embedding
            .select_states(&[CellRef::Name("zz".into())])
            .expect_err("unknown cell");
        assert_eq!(
            err.downcast_ref::<FateError>(),
            Some(&FateError::UnknownCell("zz".into()))
        );
    }

    #[test]
    fn point_lookup_checks_the_index() {
        let embedding = chain_embedding();
        assert_eq!(embedding.point(3), Ok(vec![3.0, 0.0]));
        assert_eq!(
            embedding.point(4),
            Err(FateError::CellIndexOutOfRange { index: 4, len: 4 })
        );
    }
}
