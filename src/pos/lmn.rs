// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Interferometric direction-cosine coordinates.
//!
//! These are used to shift the phase centre of visibilities before gridding;
//! the shift is expressed as a per-row delay (`dphase`) in metres, which the
//! coordinate mapper turns into a phasor for each channel.

use super::uvw::UVW;

/// (l,m,n) direction-cosine coordinates. There are no units (i.e.
/// dimensionless).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(clippy::upper_case_acronyms)]
pub struct LMN {
    /// l coordinate \[dimensionless\]
    pub l: f64,
    /// m coordinate \[dimensionless\]
    pub m: f64,
    /// n coordinate \[dimensionless\]
    pub n: f64,
}

impl LMN {
    /// Make an [`LMN`] from (l,m) offsets, deriving n from the unit sphere.
    /// Offsets beyond the horizon (l^2 + m^2 > 1) get an n of 0.
    pub fn from_lm(l: f64, m: f64) -> Self {
        let n = (1.0 - l * l - m * m).max(0.0).sqrt();
        Self { l, m, n }
    }

    /// The phase centre itself.
    pub fn phase_centre() -> Self {
        Self {
            l: 0.0,
            m: 0.0,
            n: 1.0,
        }
    }

    /// Get the path-length difference of a baseline towards this direction
    /// relative to the phase centre, i.e. `u * l + v * m + w * (n - 1)`
    /// \[metres\]. Negated, this is the `dphase` that moves the phase centre
    /// here; see [`crate::VisBatch::shift_phase_centre`].
    #[inline]
    pub fn delay(self, uvw: UVW) -> f64 {
        uvw.u * self.l + uvw.v * self.m + uvw.w * (self.n - 1.0)
    }

    /// [`LMN::delay`] for each of `uvws`.
    pub fn delays(self, uvws: &[UVW]) -> Vec<f64> {
        uvws.iter().map(|&uvw| self.delay(uvw)).collect()
    }
}
