// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-field image and grid buffers.

use ndarray::prelude::*;

use super::{ImageTransform, ImagingError};
use crate::{
    grid::{try_filled, Grid, GridFloat, GridSpec},
    kernel::ConvolutionFunction,
    resampler::VisResampler,
};

/// How [`ImageMapper::peak_residual`] and [`ImageMapper::model_flux`] are
/// evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PeakMode {
    /// The largest absolute residual anywhere, and the total model flux.
    #[default]
    MaxAbs,
    /// Only look at pixel `[x, y]` (in every polarisation and channel). Handy
    /// for checking a single-pixel model.
    ReferencePixel { x: usize, y: usize },
}

/// Everything belonging to one field (image) being made: the grids the
/// resampler accumulates into, and the image planes derived from them.
///
/// Image planes are real and indexed `(x, y, pol, chan)`, like the grids.
/// The weight plane holds the sum of weights of each `(pol, chan)`.
#[derive(Debug, Clone)]
pub struct ImageMapper<F: GridFloat> {
    name: String,
    spec: GridSpec,
    resampler: VisResampler,
    kernel: ConvolutionFunction,
    peak_mode: PeakMode,

    psf_grid: Grid<F>,
    residual_grid: Grid<F>,
    model_grid: Grid<F>,

    psf: Array4<f64>,
    residual: Array4<f64>,
    model: Array4<f64>,
    weights: Array2<f64>,

    model_updated: bool,
    has_model: bool,
}

impl<F: GridFloat> ImageMapper<F> {
    /// Allocate every buffer for a field with geometry `spec`.
    /// `chan_map`/`pol_map` map visibility channels/polarisations to image
    /// channels/polarisations.
    ///
    /// # Errors
    ///
    /// Fails if the grids or image planes can't be allocated.
    pub fn new(
        name: &str,
        spec: GridSpec,
        kernel: ConvolutionFunction,
        chan_map: Vec<Option<usize>>,
        pol_map: Vec<Option<usize>>,
    ) -> Result<Self, ImagingError> {
        let resampler = VisResampler::for_spec(&spec, &kernel, chan_map, pol_map);
        let psf_grid = Grid::from_spec(&spec)?;
        let residual_grid = psf_grid.zeros_like()?;
        let model_grid = psf_grid.zeros_like()?;
        let shape = spec.shape();

        Ok(Self {
            name: name.to_string(),
            spec,
            resampler,
            kernel,
            peak_mode: PeakMode::default(),
            psf_grid,
            residual_grid,
            model_grid,
            psf: try_filled(shape, 0.0)?,
            residual: try_filled(shape, 0.0)?,
            model: try_filled(shape, 0.0)?,
            weights: Array2::zeros((spec.num_pols, spec.num_chans)),
            model_updated: false,
            has_model: false,
        })
    }

    pub fn with_peak_mode(mut self, peak_mode: PeakMode) -> Self {
        self.peak_mode = peak_mode;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &GridSpec {
        &self.spec
    }

    pub fn resampler(&self) -> &VisResampler {
        &self.resampler
    }

    pub fn kernel(&self) -> &ConvolutionFunction {
        &self.kernel
    }

    pub fn peak_mode(&self) -> PeakMode {
        self.peak_mode
    }

    pub fn psf(&self) -> ArrayView4<'_, f64> {
        self.psf.view()
    }

    pub fn residual(&self) -> ArrayView4<'_, f64> {
        self.residual.view()
    }

    pub fn model(&self) -> ArrayView4<'_, f64> {
        self.model.view()
    }

    /// The sum of weights of each `(pol, chan)` from the last PSF pass.
    pub fn weights(&self) -> ArrayView2<'_, f64> {
        self.weights.view()
    }

    pub fn psf_grid(&self) -> &Grid<F> {
        &self.psf_grid
    }

    pub fn residual_grid(&self) -> &Grid<F> {
        &self.residual_grid
    }

    pub fn model_grid(&self) -> &Grid<F> {
        &self.model_grid
    }

    /// Mutable access to the model image. This marks the model as updated,
    /// so it is predicted before the next residual pass.
    pub fn model_mut(&mut self) -> ArrayViewMut4<'_, f64> {
        self.model_updated = true;
        self.model.view_mut()
    }

    /// Replace the model image.
    ///
    /// # Errors
    ///
    /// The new model must have the same shape as this mapper's images.
    pub fn set_model(&mut self, model: Array4<f64>) -> Result<(), ImagingError> {
        if model.shape() != self.model.shape() {
            let s = model.shape();
            return Err(ImagingError::ImageShape {
                mapper: self.name.clone(),
                expected: self.spec.shape(),
                received: [s[0], s[1], s[2], s[3]],
            });
        }
        self.model = model;
        self.model_updated = true;
        Ok(())
    }

    /// Has the model changed since it was last predicted?
    pub fn is_model_updated(&self) -> bool {
        self.model_updated
    }

    /// Is there a (predicted) model to subtract from the data?
    pub fn has_model(&self) -> bool {
        self.has_model
    }

    /// The peak residual according to this mapper's [`PeakMode`].
    pub fn peak_residual(&self) -> f64 {
        match self.peak_mode {
            PeakMode::MaxAbs => self.residual.iter().fold(0.0_f64, |acc, r| acc.max(r.abs())),
            PeakMode::ReferencePixel { x, y } => self
                .reference_pixel(&self.residual, x, y)
                .fold(0.0_f64, |acc, r| acc.max(r.abs())),
        }
    }

    /// The model flux according to this mapper's [`PeakMode`].
    pub fn model_flux(&self) -> f64 {
        match self.peak_mode {
            PeakMode::MaxAbs => self.model.sum(),
            PeakMode::ReferencePixel { x, y } => self.reference_pixel(&self.model, x, y).sum(),
        }
    }

    /// The largest value of the PSF image; 1 for a normalised PSF.
    pub fn psf_peak(&self) -> f64 {
        self.psf.iter().copied().fold(0.0, f64::max)
    }

    /// Every `(pol, chan)` value at pixel `[x, y]`. Out-of-range pixels have
    /// no values.
    fn reference_pixel<'a>(
        &self,
        image: &'a Array4<f64>,
        x: usize,
        y: usize,
    ) -> impl Iterator<Item = f64> + 'a {
        let pixel = if x < self.spec.nx && y < self.spec.ny {
            Some(image.slice(s![x, y, .., ..]))
        } else {
            None
        };
        pixel.into_iter().flat_map(|p| p.into_iter().copied())
    }

    /// Take a finished PSF grid and form the PSF and weight planes.
    pub(crate) fn finish_psf<T: ImageTransform>(
        &mut self,
        grid: Grid<F>,
        transform: &T,
    ) -> Result<(), ImagingError> {
        self.psf_grid = grid;
        self.psf = transform.grid_to_image(&self.psf_grid, &self.kernel)?;
        self.weights = self.psf_grid.sum_weights().mapv(|w| w.as_f64());
        Ok(())
    }

    /// Take a finished residual grid and form the residual plane.
    pub(crate) fn finish_residual<T: ImageTransform>(
        &mut self,
        grid: Grid<F>,
        transform: &T,
    ) -> Result<(), ImagingError> {
        self.residual_grid = grid;
        self.residual = transform.grid_to_image(&self.residual_grid, &self.kernel)?;
        Ok(())
    }

    /// Transform the model image onto the model grid, ready for degridding.
    pub(crate) fn prepare_model<T: ImageTransform>(
        &mut self,
        transform: &T,
    ) -> Result<(), ImagingError> {
        transform.image_to_grid(self.model.view(), &mut self.model_grid, &self.kernel)?;
        self.has_model = self.model.iter().any(|&m| m != 0.0);
        self.model_updated = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{grid::GridError, kernel::KernelKind, resampler::identity_map};
    use approx::assert_abs_diff_eq;

    fn mapper() -> ImageMapper<f64> {
        ImageMapper::new(
            "test",
            GridSpec::new(8, 8, 1e-2).with_pols(2),
            ConvolutionFunction::new(KernelKind::Box, 1, 4).unwrap(),
            identity_map(1),
            identity_map(2),
        )
        .unwrap()
    }

    #[test]
    fn test_new_mapper_is_empty() {
        let m = mapper();
        assert_eq!(m.name(), "test");
        assert_eq!(m.psf().dim(), (8, 8, 2, 1));
        assert_eq!(m.weights().dim(), (2, 1));
        assert_eq!(m.residual_grid().shape(), [8, 8, 2, 1]);
        assert!(!m.is_model_updated());
        assert!(!m.has_model());
        assert_abs_diff_eq!(m.peak_residual(), 0.0);
        assert_abs_diff_eq!(m.model_flux(), 0.0);
    }

    #[test]
    fn test_oversized_mapper_is_an_error() {
        let result = ImageMapper::<f32>::new(
            "huge",
            GridSpec::new(1 << 20, 1 << 20, 1e-6).with_chans(1 << 20),
            ConvolutionFunction::new(KernelKind::Box, 1, 4).unwrap(),
            identity_map(1),
            identity_map(1),
        );
        assert!(matches!(
            result,
            Err(ImagingError::Grid(GridError::InsufficientMemory { .. }))
        ));
    }

    #[test]
    fn test_model_mut_marks_model_updated() {
        let mut m = mapper();
        m.model_mut()[[4, 4, 0, 0]] = 2.0;
        m.model_mut()[[1, 2, 1, 0]] = -0.5;
        assert!(m.is_model_updated());
        assert_abs_diff_eq!(m.model_flux(), 1.5);

        let m = m.with_peak_mode(PeakMode::ReferencePixel { x: 4, y: 4 });
        assert_abs_diff_eq!(m.model_flux(), 2.0);
    }

    #[test]
    fn test_set_model_checks_shape() {
        let mut m = mapper();
        let result = m.set_model(Array4::zeros((8, 8, 1, 1)));
        assert!(matches!(
            result,
            Err(ImagingError::ImageShape {
                expected: [8, 8, 2, 1],
                received: [8, 8, 1, 1],
                ..
            })
        ));
        assert!(!m.is_model_updated());

        m.set_model(Array4::ones((8, 8, 2, 1))).unwrap();
        assert!(m.is_model_updated());
        assert_abs_diff_eq!(m.model_flux(), 128.0);
    }

    #[test]
    fn test_peak_modes() {
        let mut m = mapper();
        m.residual[[1, 1, 0, 0]] = -3.0;
        m.residual[[5, 6, 1, 0]] = 2.0;
        assert_abs_diff_eq!(m.peak_residual(), 3.0);

        let m = m.with_peak_mode(PeakMode::ReferencePixel { x: 5, y: 6 });
        assert_abs_diff_eq!(m.peak_residual(), 2.0);

        let m = m.with_peak_mode(PeakMode::ReferencePixel { x: 50, y: 6 });
        assert_abs_diff_eq!(m.peak_residual(), 0.0);
        assert_abs_diff_eq!(m.model_flux(), 0.0);
    }
}
