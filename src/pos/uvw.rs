// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Handle UVW coordinates.

use crate::constants::VEL_C;

/// The (u,v,w) coordinates of a baseline, with units of metres.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(clippy::upper_case_acronyms)]
pub struct UVW {
    /// u coordinate \[meters\]
    pub u: f64,
    /// v coordinate \[meters\]
    pub v: f64,
    /// w coordinate \[meters\]
    pub w: f64,
}

impl UVW {
    pub fn new(u: f64, v: f64, w: f64) -> Self {
        Self { u, v, w }
    }

    /// Convert these coordinates from metres to wavelengths at the given
    /// frequency \[Hz\].
    #[inline]
    pub fn to_wavelengths(self, freq_hz: f64) -> Self {
        self * (freq_hz / VEL_C)
    }
}

impl std::ops::Mul<f64> for UVW {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self {
        UVW {
            u: self.u * rhs,
            v: self.v * rhs,
            w: self.w * rhs,
        }
    }
}

#[cfg(any(test, feature = "approx"))]
impl approx::AbsDiffEq for UVW {
    type Epsilon = f64;

    fn default_epsilon() -> f64 {
        f64::EPSILON
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: f64) -> bool {
        f64::abs_diff_eq(&self.u, &other.u, epsilon)
            && f64::abs_diff_eq(&self.v, &other.v, epsilon)
            && f64::abs_diff_eq(&self.w, &other.w, epsilon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::*;

    #[test]
    fn test_uvw_mul() {
        let uvw = UVW::new(1.0, 2.0, 3.0) * 3.0;
        assert_abs_diff_eq!(uvw, UVW::new(3.0, 6.0, 9.0));
    }

    #[test]
    fn test_uvw_to_wavelengths() {
        // One wavelength at ~150 MHz is just under 2 metres.
        let freq = VEL_C / 2.0;
        let uvw = UVW::new(2.0, 4.0, -6.0).to_wavelengths(freq);
        assert_abs_diff_eq!(uvw, UVW::new(1.0, 2.0, -3.0), epsilon = 1e-12);
    }
}
