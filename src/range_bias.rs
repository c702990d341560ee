//! Correction of the range bias
//!
//! The received signal level skews the leading-edge detection, which shows up
//! as a distance-dependent error. The tables here map a measured range to the
//! correction for each channel and PRF. Ranges are in centimeters.
//!
//! [`range_bias_m`] is the default implementation of
//! [`Radio::range_bias`](crate::radio::Radio::range_bias).

use crate::configs::{PulseRepetitionFrequency, UwbChannel};

/// Correction factors, as (upper_bound_in_cm, correction_in_cm)
///
/// The correction is added to the measured range. The last entry of every
/// table has `u16::MAX` as its upper bound.
pub type CorrectionFactors = [(u16, i16)];

/// Returns the correction table for a channel and PRF
pub fn correction_factors(
    channel: UwbChannel,
    prf: PulseRepetitionFrequency,
) -> &'static CorrectionFactors {
    match (channel, prf) {
        (UwbChannel::Channel1, PulseRepetitionFrequency::Mhz16) => CH1_PRF16,
        (UwbChannel::Channel2, PulseRepetitionFrequency::Mhz16) => CH2_PRF16,
        (UwbChannel::Channel3, PulseRepetitionFrequency::Mhz16) => CH3_PRF16,
        (UwbChannel::Channel4, PulseRepetitionFrequency::Mhz16) => CH4_PRF16,
        (UwbChannel::Channel5, PulseRepetitionFrequency::Mhz16) => CH5_PRF16,
        (UwbChannel::Channel7, PulseRepetitionFrequency::Mhz16) => CH7_PRF16,
        (UwbChannel::Channel1, PulseRepetitionFrequency::Mhz64) => CH1_PRF64,
        (UwbChannel::Channel2, PulseRepetitionFrequency::Mhz64) => CH2_PRF64,
        (UwbChannel::Channel3, PulseRepetitionFrequency::Mhz64) => CH3_PRF64,
        (UwbChannel::Channel4, PulseRepetitionFrequency::Mhz64) => CH4_PRF64,
        (UwbChannel::Channel5, PulseRepetitionFrequency::Mhz64) => CH5_PRF64,
        (UwbChannel::Channel7, PulseRepetitionFrequency::Mhz64) => CH7_PRF64,
    }
}

/// Looks up the correction for a measured range
pub fn correction_cm(factors: &CorrectionFactors, measured_range_cm: u16) -> i16 {
    factors
        .iter()
        .find(|(upper_bound, _)| measured_range_cm <= *upper_bound)
        .or_else(|| factors.last())
        .map(|(_, correction)| *correction)
        .unwrap_or(0)
}

/// Computes the range bias for a measured distance, in meters
///
/// The result is meant to be subtracted from the measured distance. Negative
/// distances use the first table entry, distances beyond the table use the
/// last.
pub fn range_bias_m(channel: UwbChannel, distance_m: f64, prf: PulseRepetitionFrequency) -> f64 {
    let distance_cm = distance_m * 100.0;
    let measured_range_cm = if distance_cm <= 0.0 {
        0
    } else if distance_cm >= u16::MAX as f64 {
        u16::MAX
    } else {
        distance_cm as u16
    };

    let correction = correction_cm(correction_factors(channel, prf), measured_range_cm);

    -(correction as f64) / 100.0
}

const CH1_PRF16: &CorrectionFactors = &[
    (25, -23), (75, -22), (100, -21), (125, -20), (175, -19), (225, -18),
    (275, -17), (300, -16), (325, -15), (375, -14), (450, -13), (500, -12),
    (575, -11), (625, -10), (700, -9), (750, -8), (825, -7), (900, -6),
    (1000, -5), (1075, -4), (1175, -3), (1250, -2), (1350, -1), (1450, 0),
    (1575, 1), (1650, 2), (1775, 3), (1900, 4), (2050, 5), (2225, 6),
    (2450, 7), (2725, 8), (3175, 9), (3875, 10), (5550, 11), (65535, 12),
];

const CH2_PRF16: &CorrectionFactors = &[
    (25, -23), (50, -22), (100, -21), (125, -20), (150, -19), (200, -18),
    (225, -17), (250, -16), (300, -15), (325, -14), (375, -13), (450, -12),
    (500, -11), (550, -10), (600, -9), (675, -8), (725, -7), (800, -6),
    (875, -5), (950, -4), (1025, -3), (1100, -2), (1175, -1), (1275, 0),
    (1375, 1), (1450, 2), (1550, 3), (1650, 4), (1775, 5), (1950, 6),
    (2125, 7), (2400, 8), (2775, 9), (3375, 10), (4850, 11), (6000, 12),
    (65535, 13),
];

const CH3_PRF16: &CorrectionFactors = &[
    (25, -23), (50, -22), (75, -21), (100, -20), (125, -19), (175, -18),
    (200, -17), (225, -16), (250, -15), (300, -14), (350, -13), (400, -12),
    (450, -11), (500, -10), (550, -9), (600, -8), (650, -7), (700, -6),
    (775, -5), (825, -4), (900, -3), (975, -2), (1050, -1), (1125, 0),
    (1225, 1), (1300, 2), (1375, 3), (1475, 4), (1575, 5), (1725, 6),
    (1900, 7), (2125, 8), (2450, 9), (3000, 10), (4325, 11), (5325, 12),
    (65535, 13),
];

const CH4_PRF16: &CorrectionFactors = &[
    (175, -28), (200, -26), (225, -25), (250, -23), (275, -22), (300, -20),
    (325, -19), (350, -18), (375, -17), (400, -16), (425, -15), (450, -14),
    (475, -13), (500, -12), (525, -11), (550, -10), (575, -9), (600, -8),
    (650, -7), (675, -6), (700, -5), (750, -4), (775, -3), (800, -2),
    (850, -1), (900, 0), (950, 1), (1000, 2), (1050, 3), (1100, 4),
    (1150, 5), (1200, 6), (1250, 7), (1300, 8), (1375, 9), (1425, 10),
    (1475, 11), (1525, 12), (1575, 13), (1650, 14), (1700, 15), (1775, 16),
    (1850, 17), (1950, 18), (2025, 19), (2125, 20), (2225, 21), (2350, 22),
    (2475, 23), (2600, 24), (2750, 25), (2900, 26), (3075, 27), (3250, 28),
    (3475, 29), (3750, 30), (4100, 31), (4550, 32), (5175, 33), (5950, 34),
    (65535, 35),
];

const CH5_PRF16: &CorrectionFactors = &[
    (25, -23), (50, -21), (75, -20), (100, -19), (125, -18), (150, -17),
    (175, -15), (200, -14), (225, -13), (275, -12), (300, -11), (350, -10),
    (375, -9), (400, -8), (450, -7), (500, -6), (525, -5), (575, -4),
    (625, -3), (675, -2), (725, -1), (775, 0), (850, 1), (900, 2),
    (950, 3), (1025, 4), (1100, 5), (1200, 6), (1325, 7), (1475, 8),
    (1700, 9), (2075, 10), (3000, 11), (3700, 12), (65535, 13),
];

const CH7_PRF16: &CorrectionFactors = &[
    (100, -28), (125, -27), (150, -24), (175, -22), (200, -19), (225, -18),
    (250, -16), (275, -14), (300, -12), (325, -11), (350, -9), (375, -8),
    (400, -7), (425, -6), (450, -4), (475, -3), (500, -2), (525, -1),
    (550, 0), (575, 1), (625, 2), (650, 3), (675, 4), (725, 5),
    (750, 6), (775, 7), (800, 8), (850, 9), (875, 10), (900, 11),
    (950, 12), (975, 13), (1000, 14), (1050, 15), (1100, 16), (1150, 17),
    (1200, 18), (1250, 19), (1300, 20), (1375, 21), (1450, 22), (1525, 23),
    (1600, 24), (1700, 25), (1800, 26), (1875, 27), (2000, 28), (2125, 29),
    (2300, 30), (2525, 31), (2800, 32), (3175, 33), (3675, 34), (4200, 35),
    (4550, 36), (4850, 37), (5125, 38), (65535, 39),
];

const CH1_PRF64: &CorrectionFactors = &[
    (25, -17), (50, -16), (75, -14), (100, -13), (125, -12), (175, -11),
    (250, -10), (325, -9), (400, -8), (475, -7), (550, -6), (600, -5),
    (675, -4), (750, -3), (800, -2), (875, -1), (950, 0), (1075, 1),
    (1200, 2), (1400, 3), (1950, 4), (2525, 5), (3000, 6), (3925, 7),
    (65535, 8),
];

const CH2_PRF64: &CorrectionFactors = &[
    (25, -17), (50, -16), (75, -14), (100, -13), (150, -11), (225, -10),
    (300, -9), (350, -8), (425, -7), (475, -6), (525, -5), (600, -4),
    (650, -3), (700, -2), (775, -1), (825, 0), (925, 1), (1050, 2),
    (1225, 3), (1700, 4), (2225, 5), (2625, 6), (3450, 7), (65535, 8),
];

const CH3_PRF64: &CorrectionFactors = &[
    (25, -17), (50, -15), (75, -14), (100, -12), (125, -11), (200, -10),
    (250, -9), (325, -8), (375, -7), (425, -6), (475, -5), (525, -4),
    (575, -3), (625, -2), (675, -1), (750, 0), (825, 1), (925, 2),
    (1100, 3), (1500, 4), (1975, 5), (2325, 6), (3050, 7), (65535, 8),
];

const CH4_PRF64: &CorrectionFactors = &[
    (175, -30), (200, -29), (225, -27), (250, -25), (275, -24), (300, -23),
    (325, -22), (350, -20), (375, -19), (400, -18), (425, -16), (450, -15),
    (475, -14), (500, -12), (525, -11), (550, -10), (600, -9), (625, -8),
    (675, -7), (700, -6), (725, -5), (750, -4), (800, -3), (825, -2),
    (850, -1), (875, 0), (925, 1), (975, 2), (1025, 3), (1075, 4),
    (1125, 5), (1200, 6), (1250, 7), (1325, 8), (1400, 9), (1500, 10),
    (1600, 11), (1700, 12), (1850, 13), (2025, 14), (2225, 15), (2450, 16),
    (2725, 17), (3050, 18), (3400, 19), (3650, 20), (3850, 21), (4050, 22),
    (4450, 23), (5500, 24), (6225, 25), (65535, 26),
];

const CH5_PRF64: &CorrectionFactors = &[
    (25, -17), (50, -14), (75, -12), (100, -11), (150, -10), (175, -9),
    (225, -8), (250, -7), (300, -6), (325, -5), (375, -4), (400, -3),
    (425, -2), (475, -1), (525, 0), (575, 1), (650, 2), (750, 3),
    (1050, 4), (1375, 5), (1625, 6), (2125, 7), (65535, 8),
];

const CH7_PRF64: &CorrectionFactors = &[
    (100, -30), (125, -29), (150, -26), (175, -24), (200, -22), (225, -20),
    (250, -18), (275, -15), (300, -13), (325, -12), (350, -10), (375, -9),
    (400, -8), (425, -6), (450, -5), (475, -4), (500, -2), (525, -1),
    (550, 0), (575, 1), (600, 2), (625, 3), (650, 4), (700, 5),
    (725, 6), (775, 7), (825, 8), (875, 9), (925, 10), (975, 11),
    (1050, 12), (1150, 13), (1250, 14), (1350, 15), (1500, 16), (1675, 17),
    (1875, 18), (2075, 19), (2250, 20), (2375, 21), (2500, 22), (2750, 23),
    (3375, 24), (3825, 25), (4300, 26), (4800, 27), (65535, 28),
];
