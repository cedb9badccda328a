// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Map visibility coordinates onto the (u,v) grid.

use std::f64::consts::TAU;

use crate::{c64, constants::VEL_C, math::nint, UVW};

/// The linear transform from physical (u,v) \[metres\] at a given frequency
/// to fractional grid pixels, i.e. `pos = scale * uv * freq / c + offset`,
/// together with the kernel oversampling used to derive sub-cell offsets.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UvMapping {
    /// Pixels per wavelength along (u, v).
    pub scale: [f64; 2],
    /// The grid pixel of the (u,v) origin along each axis.
    pub offset: [f64; 2],
    /// Kernel samples per grid cell along each axis.
    pub oversampling: [usize; 2],
}

/// Where a single visibility sample lands on the grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPosition {
    /// The fractional grid position.
    pub pos: [f64; 2],
    /// The nearest grid cell.
    pub loc: [i64; 2],
    /// The offset from `pos` to `loc`, in units of kernel-table samples.
    pub off: [i64; 2],
    /// The phase-shift correction for this sample.
    pub phasor: c64,
}

impl GridPosition {
    /// Does the kernel's support box around `loc` lie entirely within a grid
    /// of size `grid_size` (along x and y)?
    #[inline]
    pub fn fits(&self, support: [usize; 2], grid_size: [usize; 2]) -> bool {
        (0..2).all(|axis| {
            let s = support[axis] as i64;
            self.loc[axis].saturating_sub(s) >= 0
                && self.loc[axis].saturating_add(s) < grid_size[axis] as i64
        })
    }
}

impl UvMapping {
    pub fn new(scale: [f64; 2], offset: [f64; 2], oversampling: [usize; 2]) -> Self {
        Self {
            scale,
            offset,
            oversampling,
        }
    }

    /// Map a sample's (u,v,w) and frequency to the grid. `dphase` is the
    /// sample row's phase-centre-shift delay \[metres\]; the returned phasor is
    /// `exp(-2 pi i dphase freq / c)`.
    ///
    /// Nothing here can fail; non-finite or very large coordinates produce
    /// positions far outside any grid, which [`GridPosition::fits`] rejects.
    #[inline]
    pub fn map(&self, uvw: UVW, freq_hz: f64, dphase: f64) -> GridPosition {
        let uv = [uvw.u, uvw.v];
        let mut pos = [0.0; 2];
        let mut loc = [0; 2];
        let mut off = [0; 2];
        for axis in 0..2 {
            pos[axis] = self.scale[axis] * uv[axis] * freq_hz / VEL_C + self.offset[axis];
            loc[axis] = nint(pos[axis]);
            off[axis] = nint((loc[axis] as f64 - pos[axis]) * self.oversampling[axis] as f64);
        }

        let phase = -TAU * dphase * freq_hz / VEL_C;
        let (s, c) = phase.sin_cos();

        GridPosition {
            pos,
            loc,
            off,
            phasor: c64::new(c, s),
        }
    }
}
