//! Interfaces to the radio driver and the timer
//!
//! The ranging engine doesn't talk to the DW1000 directly. It is written
//! against [`Radio`], which a driver implements on top of its register
//! interface, and [`Timer`], a one-shot timer that reposts
//! [`Event::Tick`](crate::node::Event::Tick) when it expires.

use crate::{
    configs::{PulseRepetitionFrequency, RadioConfig, TxRfConfig, UwbChannel},
    range_bias,
    subsequence::Antenna,
    time::{DelayedTxTime, Instant},
};

/// Whether to send a frame immediately or at a specific time
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SendTime {
    /// Send the frame now
    Now,
    /// Send the frame at the given time
    ///
    /// If the time has already passed when the transmission is started, the
    /// radio rejects it and the driver must return an error.
    Delayed(DelayedTxTime),
}

/// Receive window opened automatically after a transmission
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ResponseWindow {
    /// Delay between the end of the transmission and enabling the receiver
    pub rx_after_tx_us: u32,
    /// Receive timeout; 0 keeps the receiver enabled until a frame arrives
    pub timeout_us: u32,
}

/// Radio events, as reported from the driver's interrupt handler
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RadioEvent {
    /// A frame has been sent
    TxDone,
    /// A frame has been received
    RxOk {
        /// Length of the frame, including the FCS
        len: usize,
    },
    /// The receive timeout expired without a frame
    RxTimeout,
    /// A frame was received, but is corrupt (PHY, FCS or sync loss errors)
    RxError,
}

/// The radio driver, as seen by the ranging engine
///
/// All timing-critical operations are done by the radio itself: delayed
/// transmissions, timestamps and the receive timeout. The engine only reacts
/// to [`RadioEvent`]s.
pub trait Radio {
    /// The driver's error type
    type Error;

    /// Resets and initializes the radio
    ///
    /// Must verify the device identity. Called whenever the antenna and
    /// channel cycle wraps around.
    fn init(&mut self, config: &RadioConfig) -> Result<(), Self::Error>;

    /// Applies PHY and TX RF settings
    ///
    /// Also programs the RX and TX antenna delays, which the radio loses on
    /// reconfiguration.
    fn configure(
        &mut self,
        config: &RadioConfig,
        tx_rf: &TxRfConfig,
        antenna_delay: u16,
    ) -> Result<(), Self::Error>;

    /// Routes the RF front-end to one of the antennas
    fn select_antenna(&mut self, antenna: Antenna) -> Result<(), Self::Error>;

    /// Programs the TX antenna delay
    fn set_tx_antenna_delay(&mut self, delay: u16) -> Result<(), Self::Error>;

    /// Aborts any ongoing transmission or reception
    fn force_idle(&mut self) -> Result<(), Self::Error>;

    /// Writes a frame and starts its transmission
    ///
    /// `frame` includes the 2 bytes reserved for the FCS. If `response` is
    /// given, the receiver is enabled automatically after the transmission.
    fn send(
        &mut self,
        frame: &[u8],
        send_time: SendTime,
        response: Option<ResponseWindow>,
    ) -> Result<(), Self::Error>;

    /// Enables the receiver
    ///
    /// A `timeout_us` of 0 disables the receive timeout.
    fn receive(&mut self, timeout_us: u32) -> Result<(), Self::Error>;

    /// Reads the received frame into `buffer`
    ///
    /// Reads exactly `buffer.len()` bytes, starting at the first byte of the
    /// frame.
    fn read_frame(&mut self, buffer: &mut [u8]) -> Result<(), Self::Error>;

    /// The time the last frame was received
    fn rx_timestamp(&mut self) -> Result<Instant, Self::Error>;

    /// The upper 32 bits of the current system time
    fn system_time_hi32(&mut self) -> Result<u32, Self::Error>;

    /// The range bias for a measured distance, in meters
    ///
    /// This is subtracted from the measured distance. The default uses the
    /// DW1000 user manual's correction tables.
    fn range_bias(
        &self,
        channel: UwbChannel,
        distance_m: f64,
        prf: PulseRepetitionFrequency,
    ) -> f64 {
        range_bias::range_bias_m(channel, distance_m, prf)
    }
}

/// A one-shot timer
///
/// Expiry must result in [`Event::Tick`](crate::node::Event::Tick) being
/// enqueued. The timer is re-armed on every tick, never periodic.
pub trait Timer {
    /// Arms the timer, replacing any pending expiry
    fn schedule_once(&mut self, delay_us: u32);
}
