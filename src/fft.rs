// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! An [`ImageTransform`] using FFTs.
//!
//! Grid cell `x` holds spatial frequency `x - n/2`, and image pixel `i` is at
//! direction cosine `(i - n/2) * cell`, so both are rotated by `n/2` before
//! transforming. Grid to image uses `exp(+2 pi i u l)`, image to grid uses
//! `exp(-2 pi i u l)`, matching the visibility convention of the resampler.

use std::sync::Arc;

use ndarray::prelude::*;
use num_complex::Complex;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

use crate::{
    c64,
    grid::{try_filled, try_vec, Grid, GridError, GridFloat},
    imager::{ImageTransform, ImagingError},
    kernel::ConvolutionFunction,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct FftTransform;

/// FFT plans and taper corrections for one grid size.
struct Plans {
    nx: usize,
    ny: usize,
    fft_x: Arc<dyn Fft<f64>>,
    fft_y: Arc<dyn Fft<f64>>,
    /// `taper_x[i] * taper_y[j]` is the kernel's taper at pixel `(i, j)`.
    taper_x: Vec<f64>,
    taper_y: Vec<f64>,
}

impl Plans {
    fn new(nx: usize, ny: usize, kernel: &ConvolutionFunction, inverse: bool) -> Self {
        let mut planner = FftPlanner::new();
        let (fft_x, fft_y) = if inverse {
            (planner.plan_fft_inverse(nx), planner.plan_fft_inverse(ny))
        } else {
            (planner.plan_fft_forward(nx), planner.plan_fft_forward(ny))
        };
        Self {
            nx,
            ny,
            fft_x,
            fft_y,
            taper_x: kernel.taper(nx, 0),
            taper_y: kernel.taper(ny, 1),
        }
    }

    /// Index into a `[x * ny + y]` buffer after rotating by half the axis
    /// length.
    #[inline]
    fn shifted(&self, x: usize, y: usize) -> usize {
        let sx = (x + self.nx - self.nx / 2) % self.nx;
        let sy = (y + self.ny - self.ny / 2) % self.ny;
        sx * self.ny + sy
    }

    /// A zeroed `[x * ny + y]` buffer for one plane.
    fn buffer(&self) -> Result<Vec<c64>, GridError> {
        try_vec(self.nx * self.ny, c64::new(0.0, 0.0), [self.nx, self.ny, 1, 1])
    }

    /// Transform a `[x * ny + y]` buffer along both axes in place.
    fn fft2(&self, buf: &mut [c64]) -> Result<(), GridError> {
        // y is contiguous, so every row can go in one call.
        self.fft_y.process(buf);

        let mut transposed = self.buffer()?;
        for x in 0..self.nx {
            for y in 0..self.ny {
                transposed[y * self.nx + x] = buf[x * self.ny + y];
            }
        }
        self.fft_x.process(&mut transposed);
        for x in 0..self.nx {
            for y in 0..self.ny {
                buf[x * self.ny + y] = transposed[y * self.nx + x];
            }
        }
        Ok(())
    }
}

impl ImageTransform for FftTransform {
    fn grid_to_image<F: GridFloat>(
        &self,
        grid: &Grid<F>,
        kernel: &ConvolutionFunction,
    ) -> Result<Array4<f64>, ImagingError> {
        let [nx, ny, num_pols, num_chans] = grid.shape();
        let plans = Plans::new(nx, ny, kernel, true);
        let data = grid.data();
        let sum_weights = grid.sum_weights();

        let planes = (0..num_pols * num_chans)
            .into_par_iter()
            .map(|i_plane| -> Result<_, ImagingError> {
                let (pol, chan) = (i_plane / num_chans, i_plane % num_chans);
                let weight = sum_weights[[pol, chan]].as_f64();
                // Nothing was gridded here.
                if weight == 0.0 {
                    return Ok(None);
                }

                let mut buf = plans.buffer()?;
                for ((x, y), cell) in data.slice(s![.., .., pol, chan]).indexed_iter() {
                    buf[plans.shifted(x, y)] = c64::new(cell.re.as_f64(), cell.im.as_f64());
                }
                plans.fft2(&mut buf)?;
                Ok(Some((buf, weight)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut image = try_filled([nx, ny, num_pols, num_chans], 0.0)?;
        for ((x, y, pol, chan), pixel) in image.indexed_iter_mut() {
            if let Some((buf, weight)) = &planes[pol * num_chans + chan] {
                let taper = plans.taper_x[x] * plans.taper_y[y];
                *pixel = buf[plans.shifted(x, y)].re / weight / taper;
            }
        }
        Ok(image)
    }

    fn image_to_grid<F: GridFloat>(
        &self,
        image: ArrayView4<f64>,
        grid: &mut Grid<F>,
        kernel: &ConvolutionFunction,
    ) -> Result<(), ImagingError> {
        let [nx, ny, num_pols, num_chans] = grid.shape();
        if image.dim() != (nx, ny, num_pols, num_chans) {
            return Err(ImagingError::Transform(format!(
                "image has shape {:?}, but the grid has shape {:?}",
                image.dim(),
                grid.shape()
            )));
        }
        let plans = Plans::new(nx, ny, kernel, false);

        let planes = (0..num_pols * num_chans)
            .into_par_iter()
            .map(|i_plane| -> Result<_, ImagingError> {
                let (pol, chan) = (i_plane / num_chans, i_plane % num_chans);
                let mut buf = plans.buffer()?;
                for ((x, y), &pixel) in image.slice(s![.., .., pol, chan]).indexed_iter() {
                    // Degridding tapers the image, so undo that up front.
                    let taper = plans.taper_x[x] * plans.taper_y[y];
                    buf[plans.shifted(x, y)] = c64::new(pixel / taper, 0.0);
                }
                plans.fft2(&mut buf)?;
                Ok(buf)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut data = grid.data_mut();
        for (i_plane, buf) in planes.iter().enumerate() {
            let (pol, chan) = (i_plane / num_chans, i_plane % num_chans);
            for ((x, y), cell) in data.slice_mut(s![.., .., pol, chan]).indexed_iter_mut() {
                let v = buf[plans.shifted(x, y)];
                *cell = Complex::new(F::from_f64(v.re), F::from_f64(v.im));
            }
        }
        Ok(())
    }
}
