//! Time-of-flight and distance estimation
//!
//! Double-sided two-way ranging uses six timestamps, taken on two clocks that
//! are neither synchronized nor running at exactly the same rate:
//!
//! ``` text
//!  Tag                         Anchor
//!  tSP  ---- POLL -------->    tRP
//!  tRR  <--- RESPONSE -----    tSR
//!  tSF  ---- FINAL ------->    tRF
//! ```
//!
//! The time of flight is the smaller root of
//!
//! ``` text
//! x² + b·x + c = 0
//! b = -tRF + tSR - tRR + tSP
//! c = tRR·tRF - tSP·tRF - tSR·tRR + tSP·tSR - (tSF - tRR)·(tSR - tRP)
//! ```
//!
//! which is twice the one-way propagation time. Each side's timestamps are
//! only ever compared with each other, so they are taken relative to the first
//! timestamp of that side before solving. This keeps the values small enough
//! for `f64` and handles clock overflow between timestamps.

use serde::{Deserialize, Serialize};

use crate::{
    configs::RangingConfig,
    subsequence::{Subsequence, SUBSEQUENCE_COUNT},
    time::{Instant, TIME_UNIT_SECONDS},
};

/// Speed of light in air, in m/s
pub const SPEED_OF_LIGHT: f64 = 299_702_547.0;

/// The timestamps of one exchange
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Timestamps {
    /// The anchor received the POLL (tRP)
    pub poll_rx: Instant,
    /// The anchor sent the RESPONSE (tSR)
    pub response_tx: Instant,
    /// The anchor received the FINAL (tRF)
    pub final_rx: Instant,
    /// The tag sent the POLL (tSP)
    pub poll_tx: Instant,
    /// The tag received the RESPONSE (tRR)
    pub response_rx: Instant,
    /// The tag sent the FINAL (tSF)
    pub final_tx: Instant,
}

/// Solves for the round-trip time of flight, in system clock ticks
///
/// Returns [`EstimateError::DegenerateGeometry`], if the timestamps don't
/// describe a physically possible exchange.
pub fn time_of_flight(t: &Timestamps) -> Result<f64, EstimateError> {
    let sp = 0.0;
    let rr = t.response_rx.duration_since(t.poll_tx).value() as f64;
    let sf = t.final_tx.duration_since(t.poll_tx).value() as f64;

    let rp = 0.0;
    let sr = t.response_tx.duration_since(t.poll_rx).value() as f64;
    let rf = t.final_rx.duration_since(t.poll_rx).value() as f64;

    let b = -rf + sr - rr + sp;
    let c = rr * rf - sp * rf - sr * rr + sp * sr - (sf - rr) * (sr - rp);

    let discriminant = b * b - 4.0 * c;
    if !(discriminant >= 0.0) {
        return Err(EstimateError::DegenerateGeometry { discriminant });
    }

    Ok((-b - libm::sqrt(discriminant)) / 2.0)
}

/// Converts a round-trip time of flight in ticks to meters
pub fn ticks_to_meters(tof_ticks: f64) -> f64 {
    tof_ticks * TIME_UNIT_SECONDS * 0.5 * SPEED_OF_LIGHT
}

/// One distance per subsequence
///
/// Slots that haven't been measured in the current sequence are 0.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DistanceHistogram([f32; SUBSEQUENCE_COUNT]);

impl DistanceHistogram {
    /// Creates an empty histogram
    pub fn new() -> Self {
        DistanceHistogram([0.0; SUBSEQUENCE_COUNT])
    }

    /// Resets every slot to 0
    pub fn clear(&mut self) {
        self.0 = [0.0; SUBSEQUENCE_COUNT];
    }

    /// The distance measured in subsequence `index`
    pub fn get(&self, index: usize) -> Option<f32> {
        self.0.get(index).copied()
    }

    /// Stores a distance; indices out of range are ignored
    pub fn set(&mut self, index: usize, distance: f32) {
        if let Some(slot) = self.0.get_mut(index) {
            *slot = distance;
        }
    }

    /// Iterates over all slots in subsequence order
    pub fn iter(&self) -> impl Iterator<Item = f32> + '_ {
        self.0.iter().copied()
    }
}

impl Default for DistanceHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns timestamps into calibrated distances and keeps them per subsequence
#[derive(Clone, Debug)]
pub struct Estimator {
    calibration_offset_m: f64,
    apply_range_bias: bool,
    histogram: DistanceHistogram,
}

impl Estimator {
    /// Creates an estimator with an empty histogram
    pub fn new(config: &RangingConfig) -> Self {
        Estimator {
            calibration_offset_m: config.calibration_offset_m,
            apply_range_bias: config.apply_range_bias,
            histogram: DistanceHistogram::new(),
        }
    }

    /// The distances of the current sequence
    pub fn histogram(&self) -> &DistanceHistogram {
        &self.histogram
    }

    /// Forgets all distances
    pub fn clear(&mut self) {
        self.histogram.clear();
    }

    /// Computes the calibrated distance, without recording it
    ///
    /// `range_bias` maps the uncorrected distance to the bias to subtract. It
    /// is only called if range bias correction is enabled.
    pub fn distance<F>(&self, timestamps: &Timestamps, range_bias: F) -> Result<f64, EstimateError>
    where
        F: FnOnce(f64) -> f64,
    {
        let distance = ticks_to_meters(time_of_flight(timestamps)?);

        let corrected = if self.apply_range_bias {
            distance - range_bias(distance)
        } else {
            distance
        };

        Ok(corrected + self.calibration_offset_m)
    }

    /// Computes the calibrated distance and stores it for `subsequence`
    ///
    /// On error, the slot keeps its previous value.
    pub fn record<F>(
        &mut self,
        subsequence: Subsequence,
        timestamps: &Timestamps,
        range_bias: F,
    ) -> Result<f64, EstimateError>
    where
        F: FnOnce(f64) -> f64,
    {
        if subsequence.is_idle() {
            return Err(EstimateError::InvalidSubsequence(subsequence.index()));
        }

        let distance = self.distance(timestamps, range_bias)?;
        self.histogram.set(subsequence.index() as usize, distance as f32);

        Ok(distance)
    }
}

/// Returned when no distance can be computed
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum EstimateError {
    /// The quadratic has no real solution
    ///
    /// Happens when timestamps are corrupt, or belong to different exchanges.
    DegenerateGeometry {
        /// The negative (or NaN) discriminant
        discriminant: f64,
    },

    /// The subsequence has no histogram slot
    InvalidSubsequence(u8),
}
