// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Useful constants.

/// Speed of light \[metres/second\]
pub const VEL_C: f64 = 299_792_458.0;

/// The default number of kernel samples per grid cell.
pub const DEFAULT_OVERSAMPLING: usize = 100;

/// The default kernel support radius \[grid cells\]. Together with
/// [`DEFAULT_OVERSAMPLING`], this matches the usual prolate spheroidal gridder
/// (a 7x7 footprint).
pub const DEFAULT_SUPPORT: usize = 3;

/// The default depth of the queue feeding worker threads, in batches.
pub const DEFAULT_QUEUE_DEPTH: usize = 4;

/// The default maximum number of major cycles before the imager gives up.
pub const DEFAULT_MAX_MAJOR_CYCLES: usize = 10;
