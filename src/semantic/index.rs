//! Immutable nearest-neighbor index over a row-ordered matrix.
//!
//! Row `r` of the matrix belongs to catalog id `r + 1`. The index is never
//! updated in place: a rebuild assembles a fresh matrix and constructs a new
//! `VectorIndex` from it.

use rayon::prelude::*;
use std::cmp::Ordering;

/// A search hit: matrix row and its Euclidean distance to the target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub row: usize,
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    /// Row-major, `rows * dimensions` values.
    matrix: Vec<f32>,
    dimensions: usize,
    rows: usize,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Matrix of {len} values is not a multiple of {dimensions} dimensions")]
    RaggedMatrix { len: usize, dimensions: usize },

    #[error("Cannot build an index with zero-dimensional vectors")]
    ZeroDimensions,
}

impl VectorIndex {
    /// An index with no rows.
    pub fn empty(dimensions: usize) -> Self {
        Self {
            matrix: Vec::new(),
            dimensions,
            rows: 0,
        }
    }

    /// Build from row vectors, keeping their order. All rows must share one
    /// dimension.
    pub fn build(vectors: Vec<Vec<f32>>) -> Result<Self, IndexError> {
        let Some(dimensions) = vectors.first().map(Vec::len) else {
            return Ok(Self::empty(0));
        };
        if dimensions == 0 {
            return Err(IndexError::ZeroDimensions);
        }

        let rows = vectors.len();
        let mut matrix = Vec::with_capacity(rows * dimensions);
        for vector in vectors {
            if vector.len() != dimensions {
                return Err(IndexError::DimensionMismatch {
                    expected: dimensions,
                    got: vector.len(),
                });
            }
            matrix.extend(vector);
        }

        Ok(Self {
            matrix,
            dimensions,
            rows,
        })
    }

    /// Build from an already flattened row-major matrix.
    pub fn from_matrix(dimensions: usize, matrix: Vec<f32>) -> Result<Self, IndexError> {
        if matrix.is_empty() {
            return Ok(Self::empty(dimensions));
        }
        if dimensions == 0 {
            return Err(IndexError::ZeroDimensions);
        }
        if matrix.len() % dimensions != 0 {
            return Err(IndexError::RaggedMatrix {
                len: matrix.len(),
                dimensions,
            });
        }

        Ok(Self {
            rows: matrix.len() / dimensions,
            matrix,
            dimensions,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of rows in the index.
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// The vector stored at `row`.
    pub fn row(&self, row: usize) -> Option<&[f32]> {
        if row >= self.rows {
            return None;
        }
        let start = row * self.dimensions;
        Some(&self.matrix[start..start + self.dimensions])
    }

    pub fn matrix(&self) -> &[f32] {
        &self.matrix
    }

    /// The `k` rows closest to `target`, nearest first. Equal distances are
    /// ordered by row. Returns fewer than `k` hits when the index is smaller.
    pub fn search(&self, target: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if target.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: target.len(),
            });
        }

        let mut hits: Vec<Neighbor> = self
            .matrix
            .par_chunks_exact(self.dimensions)
            .enumerate()
            .map(|(row, vector)| Neighbor {
                row,
                distance: Self::euclidean(target, vector),
            })
            .collect();

        if k < hits.len() {
            hits.select_nth_unstable_by(k - 1, Self::rank);
            hits.truncate(k);
        }
        hits.sort_by(Self::rank);

        Ok(hits)
    }

    fn rank(a: &Neighbor, b: &Neighbor) -> Ordering {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.row.cmp(&b.row))
    }

    fn euclidean(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }
}
