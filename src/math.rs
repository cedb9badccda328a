// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Some helper mathematics.

/// Round to the nearest integer, with halves rounded up (towards positive
/// infinity), i.e. `floor(x + 0.5)`. This is *not* the same as [`f64::round`],
/// which rounds halves away from zero; -2.5 becomes -2 here, not -3.
#[inline]
pub fn nint(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

/// Evaluate the prolate spheroidal wave function used for gridding (order 0,
/// alpha 1, support 6), following the rational approximation of Schwab (1984).
/// `nu` is the distance from the kernel centre as a fraction of the full
/// support radius; values outside [-1, 1] are zero.
pub fn grdsf(nu: f64) -> f64 {
    const P: [[f64; 5]; 2] = [
        [8.203343e-2, -3.644705e-1, 6.278660e-1, -5.335581e-1, 2.312756e-1],
        [4.028559e-3, -3.697768e-2, 1.021332e-1, -1.201436e-1, 6.412774e-2],
    ];
    const Q: [[f64; 3]; 2] = [
        [1.0000000e0, 8.212018e-1, 2.078043e-1],
        [1.0000000e0, 9.599102e-1, 2.918724e-1],
    ];

    let nu = nu.abs();
    let (part, nuend) = if nu <= 0.75 {
        (0, 0.75)
    } else if nu <= 1.0 {
        (1, 1.0)
    } else {
        return 0.0;
    };

    let delnusq = nu * nu - nuend * nuend;
    let mut top = P[part][0];
    let mut delnusq_pow = delnusq;
    for p in &P[part][1..] {
        top += p * delnusq_pow;
        delnusq_pow *= delnusq;
    }
    let bot = Q[part][0] + Q[part][1] * delnusq + Q[part][2] * delnusq * delnusq;

    if bot == 0.0 {
        0.0
    } else {
        top / bot
    }
}

/// The gridding function corresponding to [`grdsf`], i.e. the spheroidal
/// function multiplied by `(1 - nu^2)`.
#[inline]
pub fn spheroidal_gridding_function(nu: f64) -> f64 {
    let nu = nu.abs();
    if nu >= 1.0 {
        0.0
    } else {
        grdsf(nu) * (1.0 - nu * nu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_nint_rounds_halves_up() {
        assert_eq!(nint(2.5), 3);
        assert_eq!(nint(2.49), 2);
        assert_eq!(nint(-2.5), -2);
        assert_eq!(nint(-2.51), -3);
        assert_eq!(nint(0.0), 0);
        assert_eq!(nint(-0.5), 0);
    }

    #[test]
    fn test_grdsf_centre_and_edges() {
        // At the centre the rational approximation reduces to sum(p) / sum(q)
        // evaluated at delnusq = -0.5625.
        let centre = grdsf(0.0);
        assert!(centre > 0.99 && centre < 1.01, "grdsf(0) = {centre}");
        // Continuous across the two approximation intervals.
        assert_abs_diff_eq!(grdsf(0.75 - 1e-9), grdsf(0.75 + 1e-9), epsilon = 1e-3);
        assert_abs_diff_eq!(grdsf(1.5), 0.0);
        assert_abs_diff_eq!(grdsf(-0.3), grdsf(0.3));
    }

    #[test]
    fn test_spheroidal_gridding_function_is_monotonic() {
        let mut last = spheroidal_gridding_function(0.0);
        for i in 1..=100 {
            let nu = i as f64 / 100.0;
            let this = spheroidal_gridding_function(nu);
            assert!(this <= last, "not monotonic at nu = {nu}");
            last = this;
        }
        assert_abs_diff_eq!(spheroidal_gridding_function(1.0), 0.0);
    }
}
