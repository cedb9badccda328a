// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Convolutional gridding and degridding of visibilities.
//!
//! [`VisResampler::data_to_grid`] spreads each unflagged visibility over the
//! grid cells around its (u,v) position, weighted by the convolution function,
//! and [`VisResampler::grid_to_data`] does the adjoint, interpolating the grid
//! back onto the visibilities' (u,v) positions.
//!
//! # Gorey details
//!
//! For each sample, the nearest grid cell `loc` and the sub-cell offset `off`
//! (in kernel-table samples) come from [`UvMapping::map`]. The tap at grid
//! offset `d` from `loc` reads the table at `|oversampling * d + off|`; the
//! kernel is symmetric, so only the non-negative half is tabulated. A sample
//! is only used if its whole support box lies inside the grid; otherwise it is
//! dropped and counted in [`ResampleStats`].

use std::ops::{Add, AddAssign};

use itertools::izip;
use log::trace;
use num_complex::Complex;
use thiserror::Error;

use crate::{
    c32, c64,
    grid::{Grid, GridFloat, GridSpec},
    kernel::ConvolutionFunction,
    mapping::UvMapping,
    vis::VisBatch,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResampleError {
    #[error("bad array shape supplied to argument {argument} of function {function}. expected {expected}, received {received}")]
    ShapeMismatch {
        /// The argument name within the function
        argument: String,
        /// The function name
        function: String,
        /// The expected shape
        expected: String,
        /// The shape that was received instead
        received: String,
    },
}

impl ResampleError {
    pub(crate) fn shape_mismatch(
        argument: &str,
        function: &str,
        expected: String,
        received: String,
    ) -> Self {
        ResampleError::ShapeMismatch {
            argument: argument.to_string(),
            function: function.to_string(),
            expected,
            received,
        }
    }
}

/// Diagnostic counters for a gridding or degridding call. Every count is of
/// individual (row, channel, polarisation) samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResampleStats {
    /// Samples that were gridded or degridded.
    pub num_resampled: u64,
    /// Samples skipped because their row or cell was flagged.
    pub num_flagged: u64,
    /// Samples skipped because their imaging weight was zero.
    pub num_zero_weight: u64,
    /// Samples whose channel doesn't map to a grid channel.
    pub num_unmapped_chan: u64,
    /// Samples whose polarisation doesn't map to a grid polarisation.
    pub num_unmapped_pol: u64,
    /// Samples whose kernel support box doesn't fit in the grid.
    pub num_off_grid: u64,
    /// Degridded samples with a kernel-weight sum of zero, which were left
    /// untouched.
    pub num_zero_norm: u64,
}

impl ResampleStats {
    /// The number of samples that were expected to contribute but couldn't,
    /// i.e. everything that wasn't flagged or zero-weighted.
    pub fn num_dropped(&self) -> u64 {
        self.num_unmapped_chan + self.num_unmapped_pol + self.num_off_grid + self.num_zero_norm
    }
}

impl AddAssign for ResampleStats {
    fn add_assign(&mut self, rhs: Self) {
        self.num_resampled += rhs.num_resampled;
        self.num_flagged += rhs.num_flagged;
        self.num_zero_weight += rhs.num_zero_weight;
        self.num_unmapped_chan += rhs.num_unmapped_chan;
        self.num_unmapped_pol += rhs.num_unmapped_pol;
        self.num_off_grid += rhs.num_off_grid;
        self.num_zero_norm += rhs.num_zero_norm;
    }
}

impl Add for ResampleStats {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

/// Map every visibility channel to the grid channel of the same index.
pub fn identity_map(n: usize) -> Vec<Option<usize>> {
    (0..n).map(Some).collect()
}

/// Map every visibility channel to grid channel 0 (multi-frequency synthesis).
pub fn mfs_chan_map(n: usize) -> Vec<Option<usize>> {
    vec![Some(0); n]
}

/// Map visibility channels to image channels by frequency. Image channel `i`
/// covers `[start_hz + i * width_hz, start_hz + (i + 1) * width_hz)`; visibility
/// channels outside all image channels map to `None`.
pub fn chan_map_by_freq(
    vis_freqs_hz: &[f64],
    start_hz: f64,
    width_hz: f64,
    num_image_chans: usize,
) -> Vec<Option<usize>> {
    vis_freqs_hz
        .iter()
        .map(|&f| {
            let i = ((f - start_hz) / width_hz).floor();
            if i >= 0.0 && i < num_image_chans as f64 {
                Some(i as usize)
            } else {
                None
            }
        })
        .collect()
}

/// Grids and degrids batches of visibilities for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct VisResampler {
    mapping: UvMapping,
    chan_map: Vec<Option<usize>>,
    pol_map: Vec<Option<usize>>,
}

impl VisResampler {
    /// `chan_map[i]` is the grid channel of visibility channel `i`, and
    /// `pol_map[i]` the grid polarisation of visibility polarisation `i`;
    /// `None` drops those samples.
    pub fn new(
        mapping: UvMapping,
        chan_map: Vec<Option<usize>>,
        pol_map: Vec<Option<usize>>,
    ) -> Self {
        Self {
            mapping,
            chan_map,
            pol_map,
        }
    }

    /// Make a resampler for an image of the given geometry, using the
    /// oversampling of `kernel`.
    pub fn for_spec(
        spec: &GridSpec,
        kernel: &ConvolutionFunction,
        chan_map: Vec<Option<usize>>,
        pol_map: Vec<Option<usize>>,
    ) -> Self {
        Self::new(spec.uv_mapping(kernel.oversampling()), chan_map, pol_map)
    }

    pub fn mapping(&self) -> &UvMapping {
        &self.mapping
    }

    pub fn chan_map(&self) -> &[Option<usize>] {
        &self.chan_map
    }

    pub fn pol_map(&self) -> &[Option<usize>] {
        &self.pol_map
    }

    /// Check everything that must agree before touching the hot loops.
    fn check(
        &self,
        batch: &VisBatch,
        kernel: &ConvolutionFunction,
        function: &str,
    ) -> Result<(), ResampleError> {
        batch.validate()?;
        if self.chan_map.len() != batch.num_chans() {
            return Err(ResampleError::shape_mismatch(
                "chan_map",
                function,
                format!("{} channels", batch.num_chans()),
                format!("{} channels", self.chan_map.len()),
            ));
        }
        if self.pol_map.len() != batch.num_pols() {
            return Err(ResampleError::shape_mismatch(
                "pol_map",
                function,
                format!("{} polarisations", batch.num_pols()),
                format!("{} polarisations", self.pol_map.len()),
            ));
        }
        if kernel.oversampling() != self.mapping.oversampling {
            return Err(ResampleError::shape_mismatch(
                "kernel",
                function,
                format!("oversampling {:?}", self.mapping.oversampling),
                format!("oversampling {:?}", kernel.oversampling()),
            ));
        }
        Ok(())
    }

    /// Accumulate a batch of visibilities onto `grid`, convolved with
    /// `kernel`. When `compute_psf` is set, each sample deposits its imaging
    /// weight instead of its (weighted, phase-shifted) visibility, producing the
    /// point-spread function.
    ///
    /// The grid and its sum of weights are only ever added to, so batches may
    /// be gridded in any order, or into separate grids that are summed later.
    ///
    /// # Errors
    ///
    /// Returns [`ResampleError::ShapeMismatch`] if the batch is inconsistent,
    /// or the maps or kernel don't match it; in this case the grid is not
    /// modified.
    pub fn data_to_grid<F: GridFloat>(
        &self,
        batch: &VisBatch,
        grid: &mut Grid<F>,
        kernel: &ConvolutionFunction,
        compute_psf: bool,
    ) -> Result<ResampleStats, ResampleError> {
        self.check(batch, kernel, "VisResampler::data_to_grid")?;

        let mut stats = ResampleStats::default();
        let num_pols = batch.num_pols() as u64;
        let grid_size = grid.size();
        let (num_grid_pols, num_grid_chans) = (grid.num_pols(), grid.num_chans());
        let support = kernel.support();
        let (sx, sy) = (support[0] as i64, support[1] as i64);
        let (osx, osy) = (
            self.mapping.oversampling[0] as i64,
            self.mapping.oversampling[1] as i64,
        );
        let (mut cells, mut sum_weights) = grid.parts_mut();

        for (i_row, (&uvw, &dphase, &row_flagged)) in
            izip!(&batch.uvws, &batch.dphase, &batch.row_flags).enumerate()
        {
            if row_flagged {
                stats.num_flagged += batch.num_chans() as u64 * num_pols;
                continue;
            }

            for (i_chan, (&freq, &grid_chan)) in
                izip!(&batch.freqs_hz, &self.chan_map).enumerate()
            {
                let weight = batch.weights[[i_row, i_chan]];
                if weight == 0.0 {
                    stats.num_zero_weight += num_pols;
                    continue;
                }
                let grid_chan = match grid_chan {
                    Some(c) if c < num_grid_chans => c,
                    _ => {
                        stats.num_unmapped_chan += num_pols;
                        continue;
                    }
                };

                let position = self.mapping.map(uvw, freq, dphase);
                if !position.fits(support, grid_size) {
                    stats.num_off_grid += num_pols;
                    continue;
                }
                let plane = kernel.plane(kernel.plane_index(i_chan, uvw.to_wavelengths(freq).w));
                let [locx, locy] = position.loc;
                let [offx, offy] = position.off;

                for (i_pol, &grid_pol) in self.pol_map.iter().enumerate() {
                    if batch.flags[[i_row, i_chan, i_pol]] {
                        stats.num_flagged += 1;
                        continue;
                    }
                    let grid_pol = match grid_pol {
                        Some(p) if p < num_grid_pols => p,
                        _ => {
                            stats.num_unmapped_pol += 1;
                            continue;
                        }
                    };

                    let value = if compute_psf {
                        c64::new(weight as f64, 0.0)
                    } else {
                        let v = batch.vis[[i_row, i_chan, i_pol]];
                        c64::new(v.re as f64, v.im as f64) * weight as f64 * position.phasor
                    };

                    let mut norm = 0.0;
                    for dy in -sy..=sy {
                        let iy = (osy * dy + offy).unsigned_abs() as usize;
                        debug_assert!(iy < plane.len());
                        let wy = plane[iy] as f64;
                        let y = (locy + dy) as usize;
                        for dx in -sx..=sx {
                            let ix = (osx * dx + offx).unsigned_abs() as usize;
                            debug_assert!(ix < plane.len());
                            let wt = plane[ix] as f64 * wy;
                            let x = (locx + dx) as usize;
                            debug_assert!(x < grid_size[0] && y < grid_size[1]);
                            cells[[x, y, grid_pol, grid_chan]] += Complex::new(
                                F::from_f64(value.re * wt),
                                F::from_f64(value.im * wt),
                            );
                            norm += wt;
                        }
                    }
                    sum_weights[[grid_pol, grid_chan]] += F::from_f64(weight as f64 * norm);
                    stats.num_resampled += 1;
                }
            }
        }

        trace!("data_to_grid: {stats:?}");
        Ok(stats)
    }

    /// Predict visibilities from `grid`, overwriting the visibilities of every
    /// unflagged sample that maps onto it. Each prediction is the
    /// kernel-weighted mean of the grid cells around the sample, with the
    /// sample's phase shift undone. Flags and weights are untouched, as are
    /// samples that are flagged or dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ResampleError::ShapeMismatch`] if the batch is inconsistent,
    /// or the maps or kernel don't match it; in this case the batch is not
    /// modified.
    pub fn grid_to_data<F: GridFloat>(
        &self,
        grid: &Grid<F>,
        batch: &mut VisBatch,
        kernel: &ConvolutionFunction,
    ) -> Result<ResampleStats, ResampleError> {
        self.check(batch, kernel, "VisResampler::grid_to_data")?;

        let mut stats = ResampleStats::default();
        let num_pols = batch.num_pols() as u64;
        let num_chans = batch.num_chans() as u64;
        let grid_size = grid.size();
        let (num_grid_pols, num_grid_chans) = (grid.num_pols(), grid.num_chans());
        let cells = grid.data();
        let support = kernel.support();
        let (sx, sy) = (support[0] as i64, support[1] as i64);
        let (osx, osy) = (
            self.mapping.oversampling[0] as i64,
            self.mapping.oversampling[1] as i64,
        );

        let VisBatch {
            uvws,
            freqs_hz,
            vis,
            flags,
            row_flags,
            dphase,
            ..
        } = batch;

        for (i_row, (&uvw, &dphase, &row_flagged)) in
            izip!(uvws.iter(), dphase.iter(), row_flags.iter()).enumerate()
        {
            if row_flagged {
                stats.num_flagged += num_chans * num_pols;
                continue;
            }

            for (i_chan, (&freq, &grid_chan)) in
                izip!(freqs_hz.iter(), &self.chan_map).enumerate()
            {
                let grid_chan = match grid_chan {
                    Some(c) if c < num_grid_chans => c,
                    _ => {
                        stats.num_unmapped_chan += num_pols;
                        continue;
                    }
                };

                let position = self.mapping.map(uvw, freq, dphase);
                if !position.fits(support, grid_size) {
                    stats.num_off_grid += num_pols;
                    continue;
                }
                let plane = kernel.plane(kernel.plane_index(i_chan, uvw.to_wavelengths(freq).w));
                let [locx, locy] = position.loc;
                let [offx, offy] = position.off;

                for (i_pol, &grid_pol) in self.pol_map.iter().enumerate() {
                    if flags[[i_row, i_chan, i_pol]] {
                        stats.num_flagged += 1;
                        continue;
                    }
                    let grid_pol = match grid_pol {
                        Some(p) if p < num_grid_pols => p,
                        _ => {
                            stats.num_unmapped_pol += 1;
                            continue;
                        }
                    };

                    let mut value = c64::new(0.0, 0.0);
                    let mut norm = 0.0;
                    for dy in -sy..=sy {
                        let iy = (osy * dy + offy).unsigned_abs() as usize;
                        debug_assert!(iy < plane.len());
                        let wy = plane[iy] as f64;
                        let y = (locy + dy) as usize;
                        for dx in -sx..=sx {
                            let ix = (osx * dx + offx).unsigned_abs() as usize;
                            debug_assert!(ix < plane.len());
                            let wt = plane[ix] as f64 * wy;
                            let x = (locx + dx) as usize;
                            let cell = cells[[x, y, grid_pol, grid_chan]];
                            value += c64::new(cell.re.as_f64(), cell.im.as_f64()) * wt;
                            norm += wt;
                        }
                    }

                    if norm == 0.0 {
                        stats.num_zero_norm += 1;
                        continue;
                    }
                    let predicted = value * position.phasor.conj() / norm;
                    vis[[i_row, i_chan, i_pol]] = c32::new(predicted.re as f32, predicted.im as f32);
                    stats.num_resampled += 1;
                }
            }
        }

        trace!("grid_to_data: {stats:?}");
        Ok(stats)
    }
}
