// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use crate::Samples;

/// Tolerance when deciding whether a duration maps onto a whole number of samples.
const SAMPLE_TOLERANCE: f64 = 1e-6;

/// Convert a duration in seconds into samples.
///
/// Returns `None` if the duration does not correspond to an integer number of samples.
pub fn duration_to_samples(duration: f64, sampling_rate: f64) -> Option<Samples> {
    let exact = duration * sampling_rate;
    let rounded = exact.round();
    if rounded < 0.0 || (exact - rounded).abs() > SAMPLE_TOLERANCE {
        return None;
    }
    Some(rounded as Samples)
}
