use anyhow::{bail, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// An ordered sequence of states of equal dimension, stored row-major.
///
/// For a least action path the first and last rows are the boundary
/// conditions; the interior rows form the contiguous slice returned by
/// [`Path::interior`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PathData")]
pub struct Path {
    dimension: usize,
    data: Vec<f64>,
}

/// Unchecked wire form of [`Path`]; validated by [`Path::new`].
#[derive(Deserialize)]
struct PathData {
    dimension: usize,
    data: Vec<f64>,
}

impl TryFrom<PathData> for Path {
    type Error = anyhow::Error;

    fn try_from(raw: PathData) -> Result<Self> {
        Path::new(raw.dimension, raw.data)
    }
}

impl Path {
    pub fn new(dimension: usize, data: Vec<f64>) -> Result<Self> {
        if dimension == 0 {
            bail!("Path dimension must be positive.");
        }
        if data.len() % dimension != 0 {
            bail!(
                "Path data length {} is not a multiple of dimension {}.",
                data.len(),
                dimension
            );
        }
        Ok(Self { dimension, data })
    }

    pub fn empty(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    pub fn from_points<P: AsRef<[f64]>>(points: &[P]) -> Result<Self> {
        let Some(first) = points.first() else {
            bail!("Cannot build a path from zero points.");
        };
        let dimension = first.as_ref().len();
        let mut path = Path::new(dimension, Vec::with_capacity(points.len() * dimension))?;
        for point in points {
            path.push(point.as_ref())?;
        }
        Ok(path)
    }

    /// Rows of `matrix` become the points of the path.
    pub fn from_matrix(matrix: &DMatrix<f64>) -> Result<Self> {
        let mut data = Vec::with_capacity(matrix.len());
        for row in matrix.row_iter() {
            data.extend(row.iter().copied());
        }
        Path::new(matrix.ncols(), data)
    }

    pub fn to_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(self.len(), self.dimension, &self.data)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.data.len().checked_div(self.dimension).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn point(&self, idx: usize) -> &[f64] {
        &self.data[idx * self.dimension..(idx + 1) * self.dimension]
    }

    pub fn point_mut(&mut self, idx: usize) -> &mut [f64] {
        &mut self.data[idx * self.dimension..(idx + 1) * self.dimension]
    }

    pub fn first(&self) -> Option<&[f64]> {
        (!self.is_empty()).then(|| self.point(0))
    }

    pub fn last(&self) -> Option<&[f64]> {
        (!self.is_empty()).then(|| self.point(self.len() - 1))
    }

    pub fn points(&self) -> impl Iterator<Item = &[f64]> + '_ {
        self.data.chunks_exact(self.dimension)
    }

    pub fn push(&mut self, point: &[f64]) -> Result<()> {
        if point.len() != self.dimension {
            bail!(
                "Point dimension mismatch. Expected {}, got {}.",
                self.dimension,
                point.len()
            );
        }
        self.data.extend_from_slice(point);
        Ok(())
    }

    pub(crate) fn push_point(&mut self, point: &[f64]) {
        debug_assert_eq!(point.len(), self.dimension);
        self.data.extend_from_slice(point);
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Points strictly between the first and the last, flattened.
    pub fn interior(&self) -> &[f64] {
        if self.len() < 2 {
            return &[];
        }
        &self.data[self.dimension..self.data.len() - self.dimension]
    }

    pub fn interior_mut(&mut self) -> &mut [f64] {
        if self.len() < 2 {
            return &mut [];
        }
        let end = self.data.len() - self.dimension;
        &mut self.data[self.dimension..end]
    }

    /// The first `count` points as a new path.
    pub fn prefix(&self, count: usize) -> Path {
        Path {
            dimension: self.dimension,
            data: self.data[..count.min(self.len()) * self.dimension].to_vec(),
        }
    }

    /// Sum of Euclidean distances between consecutive points.
    pub fn arclength(&self) -> f64 {
        (1..self.len())
            .map(|i| distance(self.point(i - 1), self.point(i)))
            .sum()
    }
}

pub(crate) fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interior_excludes_boundary_points() {
        let path = Path::from_points(&[[0.0, 0.0], [1.0, 2.0], [3.0, 4.0], [5.0, 6.0]])
            .expect("valid path");
        assert_eq!(path.len(), 4);
        assert_eq!(path.interior(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(path.first(), Some(&[0.0, 0.0][..]));
        assert_eq!(path.last(), Some(&[5.0, 6.0][..]));
    }

    #[test]
    fn matrix_conversion_keeps_rows_as_points() {
        let path = Path::from_points(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).expect("valid path");
        let matrix = path.to_matrix();
        assert_eq!(matrix[(1, 0)], 4.0);
        assert_eq!(Path::from_matrix(&matrix).expect("valid matrix"), path);
    }

    #[test]
    fn push_rejects_wrong_dimension() {
        let mut path = Path::empty(2);
        let err = path.push(&[1.0]).expect_err("expected mismatch");
        assert!(format!("{err}").contains("dimension mismatch"));
    }

    #[test]
    fn deserialization_validates_the_layout() {
        let path: Path = serde_json::from_str(r#"{"dimension": 2, "data": [0.0, 1.0, 2.0, 3.0]}"#)
            .expect("valid path");
        assert_eq!(path.len(), 2);
        assert_eq!(path.point(1), &[2.0, 3.0]);

        let err = serde_json::from_str::<Path>(r#"{"dimension": 0, "data": []}"#)
            .expect_err("zero dimension");
        assert!(err.to_string().contains("dimension must be positive"));
        let err = serde_json::from_str::<Path>(r#"{"dimension": 2, "data": [1.0, 2.0, 3.0]}"#)
            .expect_err("ragged data");
        assert!(err.to_string().contains("not a multiple"));
    }

    #[test]
    fn arclength_sums_segments() {
        let path = Path::from_points(&[[0.0, 0.0], [3.0, 4.0], [3.0, 5.0]]).expect("valid path");
        assert_eq!(path.arclength(), 6.0);
        assert_eq!(path.prefix(2).arclength(), 5.0);
    }
}
