#![forbid(unsafe_code)]

//! Row-major observation tables.
//!
//! Rows are time steps, columns are features. A univariate series is a
//! one-column table, so every scorer works on vectors and reduces to its
//! scalar formula when `cols == 1`.

use std::ops::Range;

use crate::error::{VilleError, VilleResult};

/// Dense `rows × cols` matrix of observations with column names.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    cols: usize,
    data: Vec<f64>,
    names: Vec<String>,
}

impl FeatureTable {
    /// One-column table over a scalar series.
    pub fn univariate(series: &[f64]) -> VilleResult<Self> {
        check_finite(series, 1)?;
        Ok(Self {
            cols: 1,
            data: series.to_vec(),
            names: vec!["value".to_string()],
        })
    }

    /// Build from rows. Every row must have the width of the first.
    pub fn from_rows(rows: &[Vec<f64>]) -> VilleResult<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if cols == 0 {
            return Err(VilleError::EmptyTable);
        }
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (row, values) in rows.iter().enumerate() {
            if values.len() != cols {
                return Err(VilleError::ShapeMismatch {
                    row,
                    expected: cols,
                    found: values.len(),
                });
            }
            data.extend_from_slice(values);
        }
        check_finite(&data, cols)?;
        let names = (0..cols).map(|j| format!("feature_{j}")).collect();
        Ok(Self { cols, data, names })
    }

    /// Build from named columns of equal length.
    pub fn from_columns(columns: Vec<(String, Vec<f64>)>) -> VilleResult<Self> {
        let cols = columns.len();
        if cols == 0 {
            return Err(VilleError::EmptyTable);
        }
        let rows = columns[0].1.len();
        for (_, values) in &columns {
            if values.len() != rows {
                // The first row index that one column lacks (or has extra).
                return Err(VilleError::ShapeMismatch {
                    row: rows.min(values.len()),
                    expected: rows,
                    found: values.len(),
                });
            }
        }
        let mut data = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            data.extend(columns.iter().map(|(_, values)| values[i]));
        }
        check_finite(&data, cols)?;
        let names = columns.into_iter().map(|(name, _)| name).collect();
        Ok(Self { cols, data, names })
    }

    /// Replace the column names. Extra names are ignored, missing ones kept.
    #[must_use]
    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for (slot, name) in self.names.iter_mut().zip(names) {
            *slot = name.into();
        }
        self
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.data.len() / self.cols
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Observation vector at time `i`.
    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Copy of column `j` as a series.
    pub fn column(&self, j: usize) -> Vec<f64> {
        self.data.iter().skip(j).step_by(self.cols).copied().collect()
    }

    /// Borrow a contiguous block of rows.
    #[inline]
    pub fn view(&self, range: Range<usize>) -> ReferenceView<'_> {
        ReferenceView {
            data: &self.data[range.start * self.cols..range.end * self.cols],
            cols: self.cols,
        }
    }
}

/// Borrowed block of reference rows handed to a scorer.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceView<'a> {
    data: &'a [f64],
    cols: usize,
}

impl<'a> ReferenceView<'a> {
    /// Wrap row-major data. `data.len()` must be a multiple of `cols`.
    pub fn new(data: &'a [f64], cols: usize) -> Self {
        debug_assert!(cols > 0 && data.len() % cols == 0);
        Self { data, cols }
    }

    /// Scalar reference (one column).
    pub fn scalar(data: &'a [f64]) -> Self {
        Self { data, cols: 1 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() / self.cols
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn row(&self, i: usize) -> &'a [f64] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &'a [f64]> + 'a {
        self.data.chunks_exact(self.cols)
    }

    /// Values of column `j` across all rows.
    pub fn column(&self, j: usize) -> Vec<f64> {
        self.data.iter().skip(j).step_by(self.cols).copied().collect()
    }
}

fn check_finite(data: &[f64], cols: usize) -> VilleResult<()> {
    match data.iter().position(|v| !v.is_finite()) {
        Some(pos) => Err(VilleError::NonFiniteObservation {
            row: pos / cols,
            column: pos % cols,
        }),
        None => Ok(()),
    }
}
