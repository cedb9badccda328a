// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors from imaging.

use thiserror::Error;

use super::CycleState;
use crate::{grid::GridError, kernel::KernelError, resampler::ResampleError, vis::VisSourceError};

#[derive(Error, Debug)]
pub enum ImagingError {
    #[error("cannot go from the {from:?} state to the {to:?} state")]
    BadTransition { from: CycleState, to: CycleState },

    #[error("no image mappers were supplied")]
    NoMappers,

    #[error("image for mapper '{mapper}' has shape {received:?}, expected {expected:?}")]
    ImageShape {
        mapper: String,
        expected: [usize; 4],
        received: [usize; 4],
    },

    #[error("a worker thread panicked: {0}")]
    Worker(String),

    #[error("image transform failed: {0}")]
    Transform(String),

    #[error(transparent)]
    Resample(#[from] ResampleError),

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    VisSource(#[from] VisSourceError),
}
