// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Convolutional gridding and degridding of radio-interferometric
//! visibilities, and the major-cycle loop that drives them.

#[allow(non_camel_case_types)]
pub type c32 = num_complex::Complex<f32>;
#[allow(non_camel_case_types)]
pub type c64 = num_complex::Complex<f64>;

pub mod constants;
pub mod grid;
pub mod imager;
pub mod kernel;
pub mod mapping;
pub mod math;
pub mod pos;
pub mod resampler;
pub mod vis;

#[cfg(feature = "fft")]
pub mod fft;

/// Information about this build, generated by `build.rs`.
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

// Re-exports.
pub use grid::{Grid, GridError, GridFloat, GridSpec};
pub use imager::{
    CycleState, Deconvolver, Dispatcher, ImageMapper, ImageTransform, ImagingError,
    IterationControl, MajorCycleController, MinorCycleOutcome, PeakMode, RunSummary,
    SerialDispatcher, StopReason, ThreadedDispatcher,
};
pub use kernel::{ConvolutionFunction, KernelError, KernelKind, KernelPlaneMap};
pub use mapping::{GridPosition, UvMapping};
pub use pos::{lmn::LMN, uvw::UVW};
pub use resampler::{ResampleError, ResampleStats, VisResampler};
pub use vis::{InMemoryVisSource, VisBatch, VisSource, VisSourceError};

pub use ndarray;
pub use num_complex;
pub use num_complex::Complex;
pub use num_traits;
pub use rayon;

cfg_if::cfg_if! {
    if #[cfg(feature = "fft")] {
        pub use fft::FftTransform;
        pub use rustfft;
    }
}

#[cfg(test)]
#[test]
fn built_info_is_present() {
    assert_eq!(built_info::PKG_NAME, "visgrid");
    assert!(!built_info::PKG_VERSION.is_empty());
}
