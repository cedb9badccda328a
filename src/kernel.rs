// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Oversampled convolution functions (gridding kernels).
//!
//! A [`ConvolutionFunction`] is a 1-D lookup table of kernel values sampled
//! `oversampling` times per grid cell, starting at the kernel centre. It is
//! applied separably along both grid axes. A table can hold several planes
//! (e.g. one per channel or per w); [`KernelPlaneMap`] decides which plane a
//! sample uses.

use std::f64::consts::{LN_2, TAU};
use std::fmt;
use std::str::FromStr;

use ndarray::prelude::*;
use thiserror::Error;

use crate::{
    constants::{DEFAULT_OVERSAMPLING, DEFAULT_SUPPORT},
    math::{nint, spheroidal_gridding_function},
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("unknown kernel type '{0}'; expected one of: box, pillbox, gaussian, spheroidal")]
    UnknownKind(String),

    #[error("kernel {parameter} must be greater than zero")]
    NotPositive { parameter: &'static str },

    #[error("kernel table has {have} taps per plane, but support {support} with oversampling {oversampling} needs at least {need}")]
    TableTooShort {
        have: usize,
        need: usize,
        support: usize,
        oversampling: usize,
    },

    #[error("kernel table has no planes")]
    NoPlanes,

    #[error("kernel plane map refers to plane {plane}, but there are only {num_planes} planes")]
    BadPlane { plane: usize, num_planes: usize },

    #[error("kernel w scale must be finite and non-negative, got {0}")]
    BadWScale(f64),
}

/// The families of kernel that can be generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum KernelKind {
    /// Deposit each sample into its nearest cell only.
    Box,
    /// Flat over the whole support.
    Pillbox,
    /// A gaussian with a half-width at half-maximum of half the support.
    Gaussian,
    /// The prolate spheroidal anti-aliasing function.
    Spheroidal,
}

impl KernelKind {
    /// Evaluate the (un-normalised) kernel at a distance of `u` cells from the
    /// centre.
    fn eval(self, u: f64, support: usize) -> f64 {
        let u = u.abs();
        let support = support as f64;
        match self {
            KernelKind::Box => {
                if u <= 0.5 {
                    1.0
                } else {
                    0.0
                }
            }
            KernelKind::Pillbox => {
                if u <= support {
                    1.0
                } else {
                    0.0
                }
            }
            KernelKind::Gaussian => {
                if u <= support {
                    let hwhm = support / 2.0;
                    (-LN_2 * (u / hwhm).powi(2)).exp()
                } else {
                    0.0
                }
            }
            KernelKind::Spheroidal => spheroidal_gridding_function(u / support),
        }
    }
}

impl FromStr for KernelKind {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "box" | "nearest" => Ok(KernelKind::Box),
            "pillbox" | "pb" => Ok(KernelKind::Pillbox),
            "gaussian" | "gauss" => Ok(KernelKind::Gaussian),
            "spheroidal" | "sf" | "prolate" => Ok(KernelKind::Spheroidal),
            _ => Err(KernelError::UnknownKind(s.to_string())),
        }
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelKind::Box => "box",
            KernelKind::Pillbox => "pillbox",
            KernelKind::Gaussian => "gaussian",
            KernelKind::Spheroidal => "spheroidal",
        };
        write!(f, "{s}")
    }
}

/// How samples choose a plane of a [`ConvolutionFunction`].
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum KernelPlaneMap {
    /// Every sample uses plane 0.
    #[default]
    Single,
    /// Visibility channel `i` uses plane `map[i]`.
    ByChannel(Vec<usize>),
    /// w-planes: a sample with w (in wavelengths) uses plane
    /// `nint(sqrt(|w| * w_scale))`, clamped to the last plane.
    ByW { w_scale: f64 },
}

/// An immutable, oversampled, separable convolution function.
#[derive(Debug, Clone)]
pub struct ConvolutionFunction {
    /// `[plane][tap]`; tap `i` is the kernel `i / oversampling` cells from the
    /// centre.
    planes: Array2<f32>,
    support: [usize; 2],
    oversampling: [usize; 2],
    plane_map: KernelPlaneMap,
}

impl ConvolutionFunction {
    /// Generate a single-plane kernel with the same support and oversampling
    /// along both axes, normalised to 1 at the centre.
    pub fn new(
        kind: KernelKind,
        support: usize,
        oversampling: usize,
    ) -> Result<Self, KernelError> {
        check_positive(support, "support")?;
        check_positive(oversampling, "oversampling")?;

        let num_taps = min_taps(support, oversampling);
        let mut table = Array2::zeros((1, num_taps));
        let centre = kind.eval(0.0, support);
        for (i, tap) in table.row_mut(0).iter_mut().enumerate() {
            let u = i as f64 / oversampling as f64;
            *tap = (kind.eval(u, support) / centre) as f32;
        }

        Self::from_table(table, [support; 2], [oversampling; 2])
    }

    /// The usual anti-aliasing gridder.
    pub fn default_spheroidal() -> Self {
        // The parameters are known-good constants, so this cannot fail.
        match Self::new(
            KernelKind::Spheroidal,
            DEFAULT_SUPPORT,
            DEFAULT_OVERSAMPLING,
        ) {
            Ok(cf) => cf,
            Err(e) => unreachable!("default spheroidal kernel is invalid: {e}"),
        }
    }

    /// Use a pre-computed table (`[plane][tap]`), e.g. from a convolution
    /// function cache.
    ///
    /// # Errors
    ///
    /// The table must have at least one plane, and enough taps to cover
    /// `oversampling * (support + 1) + 1` samples along each axis.
    pub fn from_table(
        planes: Array2<f32>,
        support: [usize; 2],
        oversampling: [usize; 2],
    ) -> Result<Self, KernelError> {
        for axis in 0..2 {
            check_positive(support[axis], "support")?;
            check_positive(oversampling[axis], "oversampling")?;
        }
        if planes.len_of(Axis(0)) == 0 {
            return Err(KernelError::NoPlanes);
        }
        let have = planes.len_of(Axis(1));
        for axis in 0..2 {
            let need = min_taps(support[axis], oversampling[axis]);
            if have < need {
                return Err(KernelError::TableTooShort {
                    have,
                    need,
                    support: support[axis],
                    oversampling: oversampling[axis],
                });
            }
        }

        Ok(Self {
            planes,
            support,
            oversampling,
            plane_map: KernelPlaneMap::Single,
        })
    }

    /// Set how samples choose a kernel plane.
    pub fn with_plane_map(mut self, plane_map: KernelPlaneMap) -> Result<Self, KernelError> {
        let num_planes = self.num_planes();
        match &plane_map {
            KernelPlaneMap::Single => (),
            KernelPlaneMap::ByChannel(map) => {
                if let Some(&plane) = map.iter().find(|&&p| p >= num_planes) {
                    return Err(KernelError::BadPlane { plane, num_planes });
                }
            }
            KernelPlaneMap::ByW { w_scale } => {
                if !w_scale.is_finite() || *w_scale < 0.0 {
                    return Err(KernelError::BadWScale(*w_scale));
                }
            }
        }
        self.plane_map = plane_map;
        Ok(self)
    }

    pub fn support(&self) -> [usize; 2] {
        self.support
    }

    pub fn oversampling(&self) -> [usize; 2] {
        self.oversampling
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len_of(Axis(0))
    }

    pub fn num_taps(&self) -> usize {
        self.planes.len_of(Axis(1))
    }

    pub fn plane_map(&self) -> &KernelPlaneMap {
        &self.plane_map
    }

    /// Get a plane of the table.
    pub fn plane(&self, plane: usize) -> ArrayView1<'_, f32> {
        self.planes.row(plane)
    }

    /// Which plane should a sample in visibility channel `chan` with a w
    /// coordinate of `w_lambda` wavelengths use?
    #[inline]
    pub fn plane_index(&self, chan: usize, w_lambda: f64) -> usize {
        match &self.plane_map {
            KernelPlaneMap::Single => 0,
            // Channels beyond the map fall back to the first plane.
            KernelPlaneMap::ByChannel(map) => map.get(chan).copied().unwrap_or(0),
            KernelPlaneMap::ByW { w_scale } => {
                let plane = nint((w_lambda.abs() * w_scale).sqrt());
                (plane.max(0) as usize).min(self.num_planes() - 1)
            }
        }
    }

    /// The sum of the taps that a sample landing exactly on a cell centre
    /// would spread over the grid, using plane 0. This is what the sum of
    /// weights grows by for a unit-weight sample.
    pub fn centred_weight_sum(&self) -> f64 {
        let plane = self.plane(0);
        let axis_sum = |axis: usize| -> f64 {
            let os = self.oversampling[axis] as i64;
            let s = self.support[axis] as i64;
            (-s..=s)
                .map(|d| plane[(os * d).unsigned_abs() as usize] as f64)
                .sum()
        };
        axis_sum(0) * axis_sum(1)
    }

    /// The Fourier transform of plane 0 of the kernel along `axis`, evaluated
    /// at the `n` image pixels of that axis and normalised to 1 at the image
    /// centre (pixel `n / 2`). Dividing an image by this removes the taper
    /// the kernel imposes.
    pub fn taper(&self, n: usize, axis: usize) -> Vec<f64> {
        let plane = self.plane(0);
        let os = self.oversampling[axis] as f64;
        let max_tap = (self.oversampling[axis] * (self.support[axis] + 1)).min(plane.len() - 1);

        let transform = |l: f64| -> f64 {
            let mut sum = plane[0] as f64;
            for (j, &k) in plane.iter().enumerate().take(max_tap + 1).skip(1) {
                // The kernel is symmetric, so count each tap twice.
                sum += 2.0 * k as f64 * (TAU * l * j as f64 / os).cos();
            }
            sum
        };

        let centre = transform(0.0);
        (0..n)
            .map(|i| {
                let l = (i as f64 - (n / 2) as f64) / n as f64;
                transform(l) / centre
            })
            .collect()
    }
}

fn check_positive(value: usize, parameter: &'static str) -> Result<(), KernelError> {
    if value == 0 {
        Err(KernelError::NotPositive { parameter })
    } else {
        Ok(())
    }
}

/// The number of taps needed so that every index the tap loop can produce is
/// within the table.
#[inline]
fn min_taps(support: usize, oversampling: usize) -> usize {
    oversampling * (support + 1) + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_parse_kernel_kind() {
        assert_eq!("BOX".parse::<KernelKind>(), Ok(KernelKind::Box));
        assert_eq!(" sf ".parse::<KernelKind>(), Ok(KernelKind::Spheroidal));
        assert_eq!("gauss".parse::<KernelKind>(), Ok(KernelKind::Gaussian));
        assert_eq!("pb".parse::<KernelKind>(), Ok(KernelKind::Pillbox));
        assert_eq!(
            "kaiser".parse::<KernelKind>(),
            Err(KernelError::UnknownKind("kaiser".to_string()))
        );
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for kind in [
            KernelKind::Box,
            KernelKind::Pillbox,
            KernelKind::Gaussian,
            KernelKind::Spheroidal,
        ] {
            assert_eq!(kind.to_string().parse::<KernelKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_tables_are_normalised() {
        for kind in [
            KernelKind::Box,
            KernelKind::Pillbox,
            KernelKind::Gaussian,
            KernelKind::Spheroidal,
        ] {
            let cf = ConvolutionFunction::new(kind, 3, 8).unwrap();
            assert_eq!(cf.num_taps(), 8 * 4 + 1);
            assert_abs_diff_eq!(cf.plane(0)[0], 1.0);
            // Nothing beyond the support.
            assert_abs_diff_eq!(cf.plane(0)[8 * 4], 0.0);
        }
    }

    #[test]
    fn test_box_kernel_only_covers_nearest_cell() {
        let cf = ConvolutionFunction::new(KernelKind::Box, 1, 4).unwrap();
        let plane = cf.plane(0);
        assert_abs_diff_eq!(plane[0], 1.0);
        assert_abs_diff_eq!(plane[2], 1.0);
        assert_abs_diff_eq!(plane[3], 0.0);
        assert_abs_diff_eq!(plane[4], 0.0);
        assert_abs_diff_eq!(cf.centred_weight_sum(), 1.0);
    }

    #[test]
    fn test_zero_parameters_are_rejected() {
        assert_eq!(
            ConvolutionFunction::new(KernelKind::Box, 0, 4).unwrap_err(),
            KernelError::NotPositive {
                parameter: "support"
            }
        );
        assert_eq!(
            ConvolutionFunction::new(KernelKind::Box, 1, 0).unwrap_err(),
            KernelError::NotPositive {
                parameter: "oversampling"
            }
        );
    }

    #[test]
    fn test_short_tables_are_rejected() {
        let table = Array2::ones((1, 8));
        let result = ConvolutionFunction::from_table(table, [1, 1], [4, 4]);
        assert!(matches!(
            result,
            Err(KernelError::TableTooShort { have: 8, need: 9, .. })
        ));
        let table = Array2::ones((0, 9));
        assert!(matches!(
            ConvolutionFunction::from_table(table, [1, 1], [4, 4]),
            Err(KernelError::NoPlanes)
        ));
    }

    #[test]
    fn test_plane_maps() {
        let table = Array2::ones((3, 9));
        let cf = ConvolutionFunction::from_table(table, [1, 1], [4, 4]).unwrap();
        assert_eq!(cf.plane_index(5, 1000.0), 0);

        let cf = cf.with_plane_map(KernelPlaneMap::ByChannel(vec![2, 1])).unwrap();
        assert_eq!(cf.plane_index(0, 0.0), 2);
        assert_eq!(cf.plane_index(1, 0.0), 1);
        assert_eq!(cf.plane_index(7, 0.0), 0);

        let cf = cf
            .with_plane_map(KernelPlaneMap::ByW { w_scale: 1.0 })
            .unwrap();
        assert_eq!(cf.plane_index(0, 0.0), 0);
        assert_eq!(cf.plane_index(0, -1.0), 1);
        assert_eq!(cf.plane_index(0, 4.0), 2);
        assert_eq!(cf.plane_index(0, 1e6), 2);

        let table = Array2::ones((2, 9));
        let cf = ConvolutionFunction::from_table(table, [1, 1], [4, 4]).unwrap();
        assert_eq!(
            cf.clone()
                .with_plane_map(KernelPlaneMap::ByChannel(vec![0, 2]))
                .unwrap_err(),
            KernelError::BadPlane {
                plane: 2,
                num_planes: 2
            }
        );
        assert!(cf
            .with_plane_map(KernelPlaneMap::ByW { w_scale: f64::NAN })
            .is_err());
    }

    #[test]
    fn test_default_spheroidal() {
        let cf = ConvolutionFunction::default_spheroidal();
        assert_eq!(cf.support(), [DEFAULT_SUPPORT; 2]);
        assert_eq!(cf.oversampling(), [DEFAULT_OVERSAMPLING; 2]);
        // The taps decrease away from the centre.
        let plane = cf.plane(0);
        assert!(plane[100] < plane[0]);
        assert!(plane[200] < plane[100]);
        assert!(plane[300] < plane[200]);
    }

    #[test]
    fn test_box_kernel_has_flat_taper() {
        // A nearest-cell kernel doesn't taper the image (to within the
        // sampling of the table).
        let cf = ConvolutionFunction::new(KernelKind::Box, 1, 1).unwrap();
        for t in cf.taper(16, 0) {
            assert_abs_diff_eq!(t, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_spheroidal_taper_peaks_at_centre() {
        let cf = ConvolutionFunction::default_spheroidal();
        let taper = cf.taper(64, 0);
        assert_abs_diff_eq!(taper[32], 1.0);
        assert!(taper[0] < taper[16]);
        assert!(taper[16] < taper[32]);
        // Symmetric about the centre.
        assert_abs_diff_eq!(taper[31], taper[33], epsilon = 1e-9);
        assert!(taper.iter().all(|&t| t > 0.0));
    }
}
