// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Complex (u,v) accumulation grids.

use std::fmt::Debug;

use ndarray::prelude::*;
use ndarray::Zip;
use num_complex::Complex;
use num_traits::{Float, NumAssign, Zero};
use thiserror::Error;

use crate::mapping::UvMapping;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Insufficient memory available; need {need_mib} MiB of memory for a grid of shape {shape:?}")]
    /// Error when we asked for too much memory
    InsufficientMemory {
        /// The grid shape that was requested
        shape: [usize; 4],
        /// The amount of memory we think we need
        need_mib: usize,
    },

    #[error("cannot combine a grid of shape {theirs:?} into a grid of shape {ours:?}")]
    ShapeMismatch { ours: [usize; 4], theirs: [usize; 4] },

    #[error("grid dimensions must all be non-zero, got {0:?}")]
    Empty([usize; 4]),

    #[error(transparent)]
    Ndarray(#[from] ndarray::ShapeError),
}

/// The floating-point precision of grid cells. Accumulating in `f64` is more
/// accurate for very large numbers of visibilities, `f32` halves the memory.
pub trait GridFloat: Float + NumAssign + Send + Sync + Debug + Default + 'static {
    fn from_f64(x: f64) -> Self;

    fn as_f64(self) -> f64;
}

impl GridFloat for f32 {
    #[inline]
    fn from_f64(x: f64) -> Self {
        x as f32
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl GridFloat for f64 {
    #[inline]
    fn from_f64(x: f64) -> Self {
        x
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self
    }
}

/// The geometry of an image and its (u,v) grid.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GridSpec {
    /// Number of pixels along x (u).
    pub nx: usize,
    /// Number of pixels along y (v).
    pub ny: usize,
    /// Number of polarisation planes.
    pub num_pols: usize,
    /// Number of channel planes.
    pub num_chans: usize,
    /// Image pixel size along x and y \[radians\]
    pub cell_rad: [f64; 2],
}

impl GridSpec {
    pub fn new(nx: usize, ny: usize, cell_rad: f64) -> Self {
        Self {
            nx,
            ny,
            num_pols: 1,
            num_chans: 1,
            cell_rad: [cell_rad; 2],
        }
    }

    pub fn with_pols(mut self, num_pols: usize) -> Self {
        self.num_pols = num_pols;
        self
    }

    pub fn with_chans(mut self, num_chans: usize) -> Self {
        self.num_chans = num_chans;
        self
    }

    /// The grid shape `(nx, ny, num_pols, num_chans)`.
    pub fn shape(&self) -> [usize; 4] {
        [self.nx, self.ny, self.num_pols, self.num_chans]
    }

    /// The (u,v) mapping for this geometry: an image `n` pixels across with
    /// a cell of `cell` radians has a (u,v) cell of `1 / (n * cell)`
    /// wavelengths, and zero spacing lands on pixel `n / 2`.
    pub fn uv_mapping(&self, oversampling: [usize; 2]) -> UvMapping {
        UvMapping::new(
            [
                self.nx as f64 * self.cell_rad[0],
                self.ny as f64 * self.cell_rad[1],
            ],
            [(self.nx / 2) as f64, (self.ny / 2) as f64],
            oversampling,
        )
    }
}

/// A 4-D complex accumulation grid indexed `(x, y, pol, chan)`, together with
/// the sum of weights indexed `(pol, chan)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid<F: GridFloat> {
    data: Array4<Complex<F>>,
    sum_weights: Array2<F>,
}

impl<F: GridFloat> Grid<F> {
    /// Allocate a zero-filled grid of shape `(nx, ny, num_pols, num_chans)`.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::InsufficientMemory`] if the grid can't be
    /// allocated, rather than aborting.
    pub fn new(shape: [usize; 4]) -> Result<Self, GridError> {
        if shape.iter().any(|&n| n == 0) {
            return Err(GridError::Empty(shape));
        }
        let data = try_filled(shape, Complex::zero())?;

        Ok(Self {
            data,
            sum_weights: Array2::zeros((shape[2], shape[3])),
        })
    }

    pub fn from_spec(spec: &GridSpec) -> Result<Self, GridError> {
        Self::new(spec.shape())
    }

    /// Allocate a zero-filled grid with the same shape as this one.
    pub fn zeros_like(&self) -> Result<Self, GridError> {
        Self::new(self.shape())
    }

    pub fn shape(&self) -> [usize; 4] {
        let (nx, ny, np, nc) = self.data.dim();
        [nx, ny, np, nc]
    }

    /// The number of pixels along (x, y).
    pub fn size(&self) -> [usize; 2] {
        let (nx, ny, _, _) = self.data.dim();
        [nx, ny]
    }

    pub fn num_pols(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    pub fn num_chans(&self) -> usize {
        self.data.len_of(Axis(3))
    }

    pub fn data(&self) -> ArrayView4<'_, Complex<F>> {
        self.data.view()
    }

    pub fn data_mut(&mut self) -> ArrayViewMut4<'_, Complex<F>> {
        self.data.view_mut()
    }

    pub fn sum_weights(&self) -> ArrayView2<'_, F> {
        self.sum_weights.view()
    }

    pub fn sum_weights_mut(&mut self) -> ArrayViewMut2<'_, F> {
        self.sum_weights.view_mut()
    }

    /// Mutable access to both the cells and the sum of weights at once.
    pub(crate) fn parts_mut(
        &mut self,
    ) -> (ArrayViewMut4<'_, Complex<F>>, ArrayViewMut2<'_, F>) {
        (self.data.view_mut(), self.sum_weights.view_mut())
    }

    /// Zero the grid and its weights, ready for another accumulation pass.
    pub fn reset(&mut self) {
        self.data.fill(Complex::zero());
        self.sum_weights.fill(F::zero());
    }

    /// Add another grid (e.g. a worker's partial grid) into this one.
    pub fn accumulate(&mut self, other: &Grid<F>) -> Result<(), GridError> {
        if self.shape() != other.shape() {
            return Err(GridError::ShapeMismatch {
                ours: self.shape(),
                theirs: other.shape(),
            });
        }
        Zip::from(&mut self.data)
            .and(&other.data)
            .par_for_each(|a, &b| *a += b);
        self.sum_weights += &other.sum_weights;
        Ok(())
    }

    /// The total of the sum of weights over all planes.
    pub fn total_weight(&self) -> f64 {
        self.sum_weights.iter().map(|w| w.as_f64()).sum()
    }
}

/// Allocate a `len`-element vector filled with `elem`. `shape` is only used
/// to describe what was being allocated if there isn't enough memory.
pub(crate) fn try_vec<T: Clone>(
    len: usize,
    elem: T,
    shape: [usize; 4],
) -> Result<Vec<T>, GridError> {
    let mut v = Vec::new();
    if v.try_reserve_exact(len).is_err() {
        return Err(insufficient_memory::<T>(shape));
    }
    // Make the vector's length equal to its new capacity.
    v.resize(len, elem);
    Ok(v)
}

/// Allocate an array of `shape` filled with `elem`, returning
/// [`GridError::InsufficientMemory`] rather than aborting when it's too big.
pub(crate) fn try_filled<T: Clone>(shape: [usize; 4], elem: T) -> Result<Array4<T>, GridError> {
    let len = shape
        .iter()
        .try_fold(1_usize, |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| insufficient_memory::<T>(shape))?;
    let v = try_vec(len, elem, shape)?;
    Ok(Array4::from_shape_vec(shape, v)?)
}

fn insufficient_memory<T>(shape: [usize; 4]) -> GridError {
    let bytes = shape
        .iter()
        .fold(std::mem::size_of::<T>() as f64, |acc, &n| acc * n as f64);
    GridError::InsufficientMemory {
        shape,
        need_mib: (bytes / 1024_f64.powi(2)).ceil() as usize,
    }
}
