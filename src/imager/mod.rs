// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The major-cycle imaging loop.
//!
//! A [`MajorCycleController`] makes repeated passes over a [`VisSource`],
//! gridding the PSF once, then the residual (data minus the predicted model)
//! each major cycle. Work within a pass is spread out by a [`Dispatcher`];
//! finished grids become image planes through an [`ImageTransform`], and a
//! [`Deconvolver`] turns residual images into model updates between passes.

mod dispatch;
mod error;
mod mapper;

pub use dispatch::{Dispatcher, SerialDispatcher, ThreadedDispatcher};
pub use error::ImagingError;
pub use mapper::{ImageMapper, PeakMode};

use log::{debug, info, warn};
use ndarray::prelude::*;

use crate::{
    built_info, c32,
    constants::DEFAULT_MAX_MAJOR_CYCLES,
    grid::{Grid, GridFloat},
    kernel::ConvolutionFunction,
    resampler::ResampleStats,
    vis::{VisBatch, VisSource},
};

/// Converts between grids and image planes.
pub trait ImageTransform {
    /// Make real image planes `(x, y, pol, chan)` from a finished grid,
    /// normalised by the grid's sum of weights and corrected for the
    /// kernel's taper.
    fn grid_to_image<F: GridFloat>(
        &self,
        grid: &Grid<F>,
        kernel: &ConvolutionFunction,
    ) -> Result<Array4<f64>, ImagingError>;

    /// Overwrite `grid` with the transform of a model image, such that
    /// degridding it predicts the model's visibilities.
    fn image_to_grid<F: GridFloat>(
        &self,
        image: ArrayView4<f64>,
        grid: &mut Grid<F>,
        kernel: &ConvolutionFunction,
    ) -> Result<(), ImagingError>;
}

/// What a [`Deconvolver`] thinks of its progress after a major cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinorCycleOutcome {
    /// More major cycles would help.
    Continue,
    /// The deconvolver has nothing more to do.
    Converged,
}

/// Runs minor cycles: reads each mapper's residual and PSF, and writes
/// model updates through [`ImageMapper::model_mut`] or
/// [`ImageMapper::set_model`].
pub trait Deconvolver<F: GridFloat> {
    fn deconvolve(
        &mut self,
        major_cycle: usize,
        mappers: &mut [ImageMapper<F>],
    ) -> Result<MinorCycleOutcome, ImagingError>;
}

/// Why the major-cycle loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The peak residual fell below the threshold.
    Threshold,
    /// The maximum number of major cycles was reached.
    MaxMajorCycles,
    /// The deconvolver reported convergence.
    Converged,
    /// The deconvolver didn't change any model.
    NoModelUpdate,
}

/// When to stop major cycles.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IterationControl {
    pub max_major_cycles: usize,
    /// Stop once the largest peak residual over all mappers is at or below
    /// this.
    pub threshold: f64,
}

impl Default for IterationControl {
    fn default() -> Self {
        Self {
            max_major_cycles: DEFAULT_MAX_MAJOR_CYCLES,
            threshold: 0.0,
        }
    }
}

impl IterationControl {
    /// Should the loop stop before major cycle `major_cycle` (counting from
    /// 0), given the current peak residual?
    pub fn check(&self, major_cycle: usize, peak_residual: f64) -> Option<StopReason> {
        if peak_residual <= self.threshold {
            Some(StopReason::Threshold)
        } else if major_cycle >= self.max_major_cycles {
            Some(StopReason::MaxMajorCycles)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    GriddingPsf,
    GriddingResidual,
    Degridding,
    Done,
}

/// The outcome of [`MajorCycleController::run`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    /// The number of deconvolve-and-regrid cycles performed.
    pub major_cycles: usize,
    pub stop_reason: StopReason,
    pub peak_residual: f64,
    pub model_flux: f64,
}

/// Per-worker accumulators for a gridding pass: one grid per mapper.
struct PassGrids<F: GridFloat> {
    grids: Vec<Grid<F>>,
    gridding: ResampleStats,
    degridding: ResampleStats,
}

impl<F: GridFloat> PassGrids<F> {
    fn new(mappers: &[ImageMapper<F>]) -> Result<Self, ImagingError> {
        let grids = mappers
            .iter()
            .map(|m| Grid::from_spec(m.spec()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            grids,
            gridding: ResampleStats::default(),
            degridding: ResampleStats::default(),
        })
    }

    fn merge(&mut self, other: Self) -> Result<(), ImagingError> {
        for (ours, theirs) in self.grids.iter_mut().zip(other.grids.iter()) {
            ours.accumulate(theirs)?;
        }
        self.gridding += other.gridding;
        self.degridding += other.degridding;
        Ok(())
    }
}

/// Predict the total model visibilities of every mapper with a model for
/// `batch`.
fn predict_batch<F: GridFloat>(
    mappers: &[ImageMapper<F>],
    batch: &VisBatch,
) -> Result<(VisBatch, ResampleStats), ImagingError> {
    let mut model = batch.zeroed_like();
    let mut scratch = batch.zeroed_like();
    let mut stats = ResampleStats::default();
    for mapper in mappers.iter().filter(|m| m.has_model()) {
        stats += mapper
            .resampler()
            .grid_to_data(mapper.model_grid(), &mut scratch, mapper.kernel())?;
        model.vis += &scratch.vis;
        scratch.vis.fill(c32::new(0.0, 0.0));
    }
    Ok((model, stats))
}

fn log_stats(pass: &str, stats: &ResampleStats) {
    info!("{pass}: resampled {} samples", stats.num_resampled);
    debug!(
        "{pass}: {} flagged, {} with zero weight",
        stats.num_flagged, stats.num_zero_weight
    );
    if stats.num_dropped() > 0 {
        warn!(
            "{pass}: dropped {} samples ({} off the grid, {} unmapped channels, {} unmapped polarisations, {} with no kernel weight)",
            stats.num_dropped(),
            stats.num_off_grid,
            stats.num_unmapped_chan,
            stats.num_unmapped_pol,
            stats.num_zero_norm
        );
    }
}

/// Drives the PSF, residual and prediction passes over a set of image
/// mappers.
///
/// The state machine is
///
/// ```text
/// Idle -> GriddingPsf -> GriddingResidual <-> Degridding
///                                \-> Done
/// ```
///
/// Only one pass runs at a time, and the grids written by a pass are only
/// read by later passes. If a pass fails, its error is returned and the
/// controller stays in that pass's state; all further transitions out of it
/// are then rejected except those the state machine allows.
pub struct MajorCycleController<F: GridFloat, D: Dispatcher, T: ImageTransform> {
    mappers: Vec<ImageMapper<F>>,
    dispatcher: D,
    transform: T,
    control: IterationControl,
    state: CycleState,
    major_cycle: usize,
    last_stats: ResampleStats,
}

impl<F: GridFloat, D: Dispatcher, T: ImageTransform> MajorCycleController<F, D, T> {
    /// # Errors
    ///
    /// At least one mapper is needed.
    pub fn new(
        mappers: Vec<ImageMapper<F>>,
        dispatcher: D,
        transform: T,
    ) -> Result<Self, ImagingError> {
        if mappers.is_empty() {
            return Err(ImagingError::NoMappers);
        }
        debug!(
            "{} v{} (built {})",
            built_info::PKG_NAME,
            built_info::PKG_VERSION,
            built_info::BUILT_TIME_UTC
        );
        debug!(
            "Imaging {} field(s): {}",
            mappers.len(),
            mappers.iter().map(|m| m.name()).collect::<Vec<_>>().join(", ")
        );

        Ok(Self {
            mappers,
            dispatcher,
            transform,
            control: IterationControl::default(),
            state: CycleState::Idle,
            major_cycle: 0,
            last_stats: ResampleStats::default(),
        })
    }

    pub fn with_iteration_control(mut self, control: IterationControl) -> Self {
        self.control = control;
        self
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn major_cycle(&self) -> usize {
        self.major_cycle
    }

    pub fn mappers(&self) -> &[ImageMapper<F>] {
        &self.mappers
    }

    pub fn mappers_mut(&mut self) -> &mut [ImageMapper<F>] {
        &mut self.mappers
    }

    pub fn into_mappers(self) -> Vec<ImageMapper<F>> {
        self.mappers
    }

    /// The gridding counters of the most recent pass.
    pub fn last_stats(&self) -> ResampleStats {
        self.last_stats
    }

    /// The largest peak residual of any mapper.
    pub fn peak_residual(&self) -> f64 {
        self.mappers
            .iter()
            .map(|m| m.peak_residual())
            .fold(0.0, f64::max)
    }

    /// The model flux summed over mappers.
    pub fn model_flux(&self) -> f64 {
        self.mappers.iter().map(|m| m.model_flux()).sum()
    }

    fn any_model_updated(&self) -> bool {
        self.mappers.iter().any(|m| m.is_model_updated())
    }

    /// Grid the PSF of every mapper and form the PSF and weight planes. This
    /// is the first pass of an imaging run.
    pub fn make_psf(&mut self, source: &mut dyn VisSource) -> Result<(), ImagingError> {
        if self.state != CycleState::Idle {
            return Err(ImagingError::BadTransition {
                from: self.state,
                to: CycleState::GriddingPsf,
            });
        }
        self.state = CycleState::GriddingPsf;
        info!("Gridding the PSF");

        let pass = self.grid_pass(source, true)?;
        for (mapper, grid) in self.mappers.iter_mut().zip(pass.grids) {
            mapper.finish_psf(grid, &self.transform)?;
            debug!("'{}' PSF peak: {}", mapper.name(), mapper.psf_peak());
        }
        log_stats("PSF", &pass.gridding);
        self.last_stats = pass.gridding;
        Ok(())
    }

    /// Grid the residual visibilities (data minus the models of every mapper)
    /// and form the residual planes. Models that have changed are predicted
    /// first.
    pub fn make_residual(&mut self, source: &mut dyn VisSource) -> Result<(), ImagingError> {
        let any_updated = self.any_model_updated();
        match self.state {
            CycleState::GriddingPsf | CycleState::Degridding => (),
            CycleState::GriddingResidual if any_updated => (),
            from => {
                return Err(ImagingError::BadTransition {
                    from,
                    to: CycleState::GriddingResidual,
                })
            }
        }

        if any_updated {
            self.state = CycleState::Degridding;
            self.prepare_models()?;
        }
        self.state = CycleState::GriddingResidual;
        info!("Gridding residuals (major cycle {})", self.major_cycle);

        let pass = self.grid_pass(source, false)?;
        for (mapper, grid) in self.mappers.iter_mut().zip(pass.grids) {
            mapper.finish_residual(grid, &self.transform)?;
            debug!("'{}' peak residual: {}", mapper.name(), mapper.peak_residual());
        }
        if self.mappers.iter().any(|m| m.has_model()) {
            log_stats("Model prediction", &pass.degridding);
        }
        log_stats("Residual", &pass.gridding);
        self.last_stats = pass.gridding;
        Ok(())
    }

    /// Predict the model visibilities of every batch in `source`, in source
    /// order, summed over mappers. Flags and weights are copied from the
    /// data.
    pub fn predict(&mut self, source: &mut dyn VisSource) -> Result<Vec<VisBatch>, ImagingError> {
        let previous = self.state;
        if previous == CycleState::Idle {
            return Err(ImagingError::BadTransition {
                from: previous,
                to: CycleState::Degridding,
            });
        }
        self.state = CycleState::Degridding;
        info!("Predicting model visibilities");
        self.prepare_models()?;

        let mappers = &self.mappers;
        let (mut batches, stats) = self.dispatcher.map_reduce(
            source,
            || Ok((vec![], ResampleStats::default())),
            |acc, i_batch, batch| {
                let (model, stats) = predict_batch(mappers, &batch)?;
                acc.0.push((i_batch, model));
                acc.1 += stats;
                Ok(())
            },
            |total, (batches, stats)| {
                total.0.extend(batches);
                total.1 += stats;
                Ok(())
            },
        )?;
        batches.sort_unstable_by_key(|(i_batch, _)| *i_batch);

        log_stats("Prediction", &stats);
        self.last_stats = stats;
        if previous == CycleState::Done {
            self.state = CycleState::Done;
        }
        Ok(batches.into_iter().map(|(_, batch)| batch).collect())
    }

    /// Run a whole imaging run: the PSF, the initial residual, then major
    /// cycles of deconvolution and re-gridding until the iteration control or
    /// the deconvolver says to stop.
    pub fn run<X: Deconvolver<F>>(
        &mut self,
        source: &mut dyn VisSource,
        deconvolver: &mut X,
    ) -> Result<RunSummary, ImagingError> {
        self.make_psf(source)?;
        self.make_residual(source)?;

        let stop_reason = loop {
            let peak_residual = self.peak_residual();
            info!(
                "Major cycle {}: peak residual {peak_residual:e}",
                self.major_cycle
            );
            if let Some(reason) = self.control.check(self.major_cycle, peak_residual) {
                break reason;
            }

            let outcome = deconvolver.deconvolve(self.major_cycle, &mut self.mappers)?;
            if !self.any_model_updated() {
                break StopReason::NoModelUpdate;
            }
            self.major_cycle += 1;
            self.make_residual(source)?;
            if outcome == MinorCycleOutcome::Converged {
                break StopReason::Converged;
            }
        };

        self.state = CycleState::Done;
        let summary = RunSummary {
            major_cycles: self.major_cycle,
            stop_reason,
            peak_residual: self.peak_residual(),
            model_flux: self.model_flux(),
        };
        info!(
            "Finished after {} major cycle(s) ({:?}); peak residual {:e}, model flux {}",
            summary.major_cycles, summary.stop_reason, summary.peak_residual, summary.model_flux
        );
        Ok(summary)
    }

    /// Move updated model images onto their grids.
    fn prepare_models(&mut self) -> Result<(), ImagingError> {
        for mapper in self.mappers.iter_mut().filter(|m| m.is_model_updated()) {
            debug!("Transforming the model of '{}'", mapper.name());
            mapper.prepare_model(&self.transform)?;
        }
        Ok(())
    }

    /// Grid every batch into fresh grids, one per mapper. Unless gridding
    /// the PSF, the mappers' models are subtracted from the data first.
    fn grid_pass(
        &self,
        source: &mut dyn VisSource,
        compute_psf: bool,
    ) -> Result<PassGrids<F>, ImagingError> {
        let mappers = &self.mappers;
        let subtract_model = !compute_psf && mappers.iter().any(|m| m.has_model());

        self.dispatcher.map_reduce(
            source,
            || PassGrids::new(mappers),
            |acc, i_batch, mut batch| {
                if subtract_model {
                    let (model, stats) = predict_batch(mappers, &batch)?;
                    batch.vis -= &model.vis;
                    acc.degridding += stats;
                }
                for (mapper, grid) in mappers.iter().zip(acc.grids.iter_mut()) {
                    acc.gridding += mapper.resampler().data_to_grid(
                        &batch,
                        grid,
                        mapper.kernel(),
                        compute_psf,
                    )?;
                }
                debug!("Gridded batch {i_batch} ({} rows)", batch.num_rows());
                Ok(())
            },
            |total, other| total.merge(other),
        )
    }
}
