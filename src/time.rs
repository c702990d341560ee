//! Time-related types based on the DW1000's system time
//!
//! The DW1000 reports timestamps with 40 bits of resolution, but delayed
//! transmissions are scheduled using only the upper 32 bits of the system
//! clock. Everything that crosses that boundary goes through this module, so
//! the 8-bit shift is applied in exactly one place.


use core::ops::Add;
use serde::{Serialize, Deserialize};


/// The maximum value of 40-bit system time stamps.
pub const TIME_MAX: u64 = 0xffffffffff;

/// Duration of one system clock tick in seconds
///
/// The DW1000 system clock runs at 128 × 499.2 MHz, so one tick is roughly
/// 15.65 picoseconds.
pub const TIME_UNIT_SECONDS: f64 = 1.0 / (499.2e6 * 128.0);

/// System clock ticks per 10 microseconds
const TICKS_PER_10_MICROS: u64 = 638_976;

/// Bits of a 40-bit timestamp that are dropped when using upper-32 time
pub const UPPER_SHIFT: u32 = 8;

/// Mask applied to a delay before it is converted to upper-32 time
///
/// Delayed transmissions ignore the low 9 bits of the programmed time, so the
/// delay is rounded down to a multiple of 512 ticks.
pub const DELAY_MASK: u64 = 0x00FF_FFFF_FE00;


/// Represents an instant in time
///
/// Internally uses the same 40-bit timestamps that the DW1000 uses.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[repr(C)]
pub struct Instant(u64);

impl Instant {
    /// Creates a new instance of `Instant`
    ///
    /// The given value must fit in a 40-bit timestamp, so:
    /// 0 <= `value` <= 2^40 - 1
    ///
    /// Returns `Some(...)`, if `value` is within the valid range, `None` if it
    /// isn't.
    ///
    /// # Example
    ///
    /// ``` rust
    /// use dw1000_diversity::time::{
    ///     TIME_MAX,
    ///     Instant,
    /// };
    ///
    /// let valid_instant   = Instant::new(TIME_MAX);
    /// let invalid_instant = Instant::new(TIME_MAX + 1);
    ///
    /// assert!(valid_instant.is_some());
    /// assert!(invalid_instant.is_none());
    /// ```
    pub fn new(value: u64) -> Option<Self> {
        if value <= TIME_MAX {
            Some(Instant(value))
        } else {
            None
        }
    }

    /// Creates an `Instant` from an upper-32 system time value
    ///
    /// This is the inverse of [`Instant::upper32`], with the low 8 bits set to
    /// zero. Any 32-bit value shifted left by 8 fits into 40 bits.
    pub fn from_upper32(value: u32) -> Self {
        Instant((value as u64) << UPPER_SHIFT)
    }

    /// Assembles an `Instant` from the 5 little-endian bytes of a timestamp
    /// register
    pub fn from_bytes(bytes: [u8; 5]) -> Self {
        let value = bytes
            .iter()
            .rev()
            .fold(0u64, |acc, byte| (acc << 8) | *byte as u64);

        Instant(value)
    }

    /// Returns the raw 40-bit timestamp
    ///
    /// The returned value is guaranteed to be in the following range:
    /// 0 <= `value` <= 2^40 - 1
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the upper 32 bits of the timestamp
    ///
    /// This is the unit delayed transmissions are scheduled in.
    pub fn upper32(&self) -> u32 {
        (self.0 >> UPPER_SHIFT) as u32
    }

    /// Returns the amount of time passed between the two `Instant`s
    ///
    /// Assumes that `&self` represents a later time than the argument
    /// `earlier`. Please make sure that this is the case, as this method has no
    /// way of knowing (DW1000 timestamps can overflow, so comparing the
    /// numerical value of the timestamp doesn't tell anything about order).
    ///
    /// # Example
    ///
    /// ``` rust
    /// use dw1000_diversity::time::{
    ///     TIME_MAX,
    ///     Instant,
    /// };
    ///
    /// // `unwrap`ing here is okay, since we're passing constants that we know
    /// // are in the valid range.
    /// let instant_1 = Instant::new(TIME_MAX - 50).unwrap();
    /// let instant_2 = Instant::new(TIME_MAX).unwrap();
    /// let instant_3 = Instant::new(49).unwrap();
    ///
    /// let duration = instant_2.duration_since(instant_1);
    /// assert_eq!(duration.value(), 50);
    ///
    /// // Still works, if the later timestamp is the numerically smaller value.
    /// let duration = instant_3.duration_since(instant_2);
    /// assert_eq!(duration.value(), 50);
    /// ```
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        if self.value() >= earlier.value() {
            Duration(self.value() - earlier.value())
        } else {
            Duration(TIME_MAX - earlier.value() + self.value() + 1)
        }
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        // Both values are 40-bit, so the sum can't overflow a `u64`, and the
        // modulo brings it back into range.
        Instant((self.value() + rhs.value()) % (TIME_MAX + 1))
    }
}


/// A duration between two instants in DW1000 system time
///
/// Internally uses the same 40-bit timestamps that the DW1000 uses.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[repr(C)]
pub struct Duration(u64);

impl Duration {
    /// Creates a new instance of `Duration`
    ///
    /// Returns `None`, if `value` doesn't fit in 40 bits.
    pub fn new(value: u64) -> Option<Self> {
        if value <= TIME_MAX {
            Some(Duration(value))
        } else {
            None
        }
    }

    /// Creates a `Duration` from a number of microseconds
    ///
    /// The result is rounded down to whole clock ticks. Returns `None` for
    /// durations that exceed the 40-bit clock range (about 17.2 seconds).
    ///
    /// # Example
    ///
    /// ``` rust
    /// use dw1000_diversity::time::Duration;
    ///
    /// let duration = Duration::from_micros(5000).unwrap();
    /// assert_eq!(duration.value(), 319_488_000);
    ///
    /// assert!(Duration::from_micros(20_000_000).is_none());
    /// ```
    pub fn from_micros(micros: u32) -> Option<Self> {
        // One microsecond is exactly 63897.6 ticks. Integer math keeps the
        // rounding exact.
        Duration::new(micros as u64 * TICKS_PER_10_MICROS / 10)
    }

    /// Returns the raw 40-bit duration
    pub fn value(&self) -> u64 {
        self.0
    }
}


/// A delayed transmission time in upper-32 system time
///
/// The DW1000 requires the least significant bit of a delayed transmission
/// time to be zero. Every constructor enforces that.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct DelayedTxTime(u32);

impl DelayedTxTime {
    /// Creates a delayed transmission time, clearing the least significant
    /// bit
    pub fn new(upper32: u32) -> Self {
        DelayedTxTime(upper32 & 0xFFFF_FFFE)
    }

    /// The value to be programmed into the delayed TX register
    pub fn value(&self) -> u32 {
        self.0
    }

    /// The transmission time as a 40-bit `Instant`
    pub fn instant(&self) -> Instant {
        Instant::from_upper32(self.0)
    }
}


/// The fixed node turnaround delay, in upper-32 system time
///
/// Computed once from the configured round-trip budget and used by both roles:
/// the tag delays its POLL and FINAL by one node delay, anchor `n` replies
/// `n` node delays after the POLL arrived.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct NodeDelay(u32);

impl NodeDelay {
    /// Computes the node delay from a budget in microseconds
    ///
    /// Returns `None`, if the budget doesn't fit in the 40-bit clock range.
    ///
    /// # Example
    ///
    /// ``` rust
    /// use dw1000_diversity::time::NodeDelay;
    ///
    /// let delay = NodeDelay::from_micros(5000).unwrap();
    /// assert_eq!(delay.value(), 1_248_000);
    /// ```
    pub fn from_micros(micros: u32) -> Option<Self> {
        let ticks = Duration::from_micros(micros)?.value();
        Some(NodeDelay(((ticks & DELAY_MASK) >> UPPER_SHIFT) as u32))
    }

    /// The delay in upper-32 system time
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Computes the delayed transmission time `slots` node delays after
    /// `reference`
    ///
    /// `reference` is an upper-32 system time. The addition wraps around with
    /// the clock, and the result is always even.
    pub fn after(&self, reference: u32, slots: u32) -> DelayedTxTime {
        DelayedTxTime::new(reference.wrapping_add(self.0.wrapping_mul(slots)))
    }
}
