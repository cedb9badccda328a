// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Batches of visibility samples, and the collaborator that supplies them.

use ndarray::prelude::*;
use thiserror::Error;

use crate::{c32, resampler::ResampleError, LMN, UVW};

#[derive(Error, Debug)]
pub enum VisSourceError {
    #[error("visibility source ran into a problem reading batch {batch}: {message}")]
    Read { batch: usize, message: String },

    #[error(transparent)]
    BadBatch(#[from] ResampleError),
}

/// A batch of visibility rows (e.g. one integration or one time chunk) with
/// everything the resampler needs to know about them.
///
/// - `vis` and `flags` are `[row][chan][pol]`
/// - `weights` are `[row][chan]`
/// - `uvws`, `dphase`, `row_flags` and `baselines` have one element per row
/// - `freqs_hz` has one element per channel
///
/// A sample contributes to a grid only if neither its row flag nor its cell
/// flag are set.
#[derive(Debug, Clone)]
pub struct VisBatch {
    /// The antenna pair of each row. Not interpreted by the resampler.
    pub baselines: Vec<(usize, usize)>,
    /// The baseline coordinates of each row \[metres\]
    pub uvws: Vec<UVW>,
    /// The centre frequency of each channel \[Hz\]
    pub freqs_hz: Vec<f64>,
    /// The complex visibilities.
    pub vis: Array3<c32>,
    /// The imaging weights, with any robust/natural weighting already folded
    /// in.
    pub weights: Array2<f32>,
    /// Per-sample flags.
    pub flags: Array3<bool>,
    /// Per-row flags.
    pub row_flags: Vec<bool>,
    /// Per-row delay used to shift the phase centre \[metres\]. See
    /// [`VisBatch::shift_phase_centre`].
    pub dphase: Vec<f64>,
}

impl VisBatch {
    /// Make a new unflagged batch with unit weights, no phase shifts and zeroed
    /// visibilities.
    pub fn new(uvws: Vec<UVW>, freqs_hz: Vec<f64>, num_pols: usize) -> Self {
        let num_rows = uvws.len();
        let num_chans = freqs_hz.len();
        Self {
            baselines: vec![(0, 0); num_rows],
            uvws,
            freqs_hz,
            vis: Array3::zeros((num_rows, num_chans, num_pols)),
            weights: Array2::ones((num_rows, num_chans)),
            flags: Array3::from_elem((num_rows, num_chans, num_pols), false),
            row_flags: vec![false; num_rows],
            dphase: vec![0.0; num_rows],
        }
    }

    pub fn num_rows(&self) -> usize {
        self.uvws.len()
    }

    pub fn num_chans(&self) -> usize {
        self.freqs_hz.len()
    }

    pub fn num_pols(&self) -> usize {
        self.vis.len_of(Axis(2))
    }

    /// The expected dimensions of `vis` and `flags`.
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.num_rows(), self.num_chans(), self.num_pols())
    }

    /// Check that every array in this batch agrees on the number of rows,
    /// channels and polarisations.
    ///
    /// # Errors
    ///
    /// Returns [`ResampleError::ShapeMismatch`] naming the first inconsistent
    /// field.
    pub fn validate(&self) -> Result<(), ResampleError> {
        let dims = self.dims();
        let function = "VisBatch::validate";

        if self.flags.dim() != dims {
            return Err(ResampleError::shape_mismatch(
                "flags",
                function,
                format!("{dims:?}"),
                format!("{:?}", self.flags.dim()),
            ));
        }
        if self.vis.dim() != dims {
            return Err(ResampleError::shape_mismatch(
                "vis",
                function,
                format!("{dims:?}"),
                format!("{:?}", self.vis.dim()),
            ));
        }
        if self.weights.dim() != (dims.0, dims.1) {
            return Err(ResampleError::shape_mismatch(
                "weights",
                function,
                format!("{:?}", (dims.0, dims.1)),
                format!("{:?}", self.weights.dim()),
            ));
        }
        for (argument, len) in [
            ("row_flags", self.row_flags.len()),
            ("dphase", self.dphase.len()),
            ("baselines", self.baselines.len()),
        ] {
            if len != dims.0 {
                return Err(ResampleError::shape_mismatch(
                    argument,
                    function,
                    format!("{} rows", dims.0),
                    format!("{len} rows"),
                ));
            }
        }
        Ok(())
    }

    /// Grid relative to `centre` instead of the correlator's phase centre: a
    /// source at `centre` then grids as though it were at the phase centre.
    pub fn shift_phase_centre(&mut self, centre: LMN) {
        self.dphase = centre.delays(&self.uvws).into_iter().map(|d| -d).collect();
    }

    /// A copy of this batch with every visibility set to zero, ready to be
    /// filled by degridding.
    pub fn zeroed_like(&self) -> Self {
        let mut batch = self.clone();
        batch.vis.fill(c32::new(0.0, 0.0));
        batch
    }
}

/// A forward-only supplier of [`VisBatch`]es, e.g. a reader iterating over
/// the time chunks of a measurement set.
pub trait VisSource {
    /// Go back to the first batch. Called at the start of every pass over the
    /// data.
    fn reset(&mut self) -> Result<(), VisSourceError>;

    /// Get the next batch, or `None` when the data are exhausted.
    fn next_batch(&mut self) -> Result<Option<VisBatch>, VisSourceError>;
}

/// A [`VisSource`] over batches that are already in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryVisSource {
    batches: Vec<VisBatch>,
    next: usize,
}

impl InMemoryVisSource {
    pub fn new(batches: Vec<VisBatch>) -> Self {
        Self { batches, next: 0 }
    }

    pub fn batches(&self) -> &[VisBatch] {
        &self.batches
    }
}

impl VisSource for InMemoryVisSource {
    fn reset(&mut self) -> Result<(), VisSourceError> {
        self.next = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<VisBatch>, VisSourceError> {
        let batch = self.batches.get(self.next).cloned();
        if batch.is_some() {
            self.next += 1;
        }
        Ok(batch)
    }
}
