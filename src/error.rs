use core::fmt;

use embedded_hal::digital::OutputPin;

use crate::{configs::ConfigError, estimator::EstimateError, packet, radio::Radio};

/// An error that can occur while processing an event
///
/// None of these stop the node. The exchange in progress is abandoned and the
/// next tick or POLL starts over.
pub enum Error<R, LED>
where
    R: Radio,
    LED: OutputPin,
{
    /// The ranging configuration is invalid
    Config(ConfigError),

    /// The radio could not be initialized
    ///
    /// The radio stays unusable until the next successful reinitialization,
    /// when the antenna and channel cycle wraps around. The fault indicator is
    /// on in the meantime.
    Init(R::Error),

    /// A transmission was rejected, typically because a delayed send time had
    /// already passed
    Transmit(R::Error),

    /// Any other radio driver error
    Radio(R::Error),

    /// The fault indicator could not be driven
    Indicator(LED::Error),

    /// A received frame could not be decoded, or a frame could not be encoded
    Packet(packet::Error),

    /// No distance could be computed from the timestamps
    Estimate(EstimateError),

    /// A RESPONSE carried an anchor id that maps to no slot
    UnknownAnchor(u8),

    /// A FINAL doesn't belong to the exchange in progress, or lacks this
    /// anchor's RESPONSE receive time
    IncompleteExchange,
}

impl<R, LED> From<ConfigError> for Error<R, LED>
where
    R: Radio,
    LED: OutputPin,
{
    fn from(error: ConfigError) -> Self {
        Error::Config(error)
    }
}

impl<R, LED> From<packet::Error> for Error<R, LED>
where
    R: Radio,
    LED: OutputPin,
{
    fn from(error: packet::Error) -> Self {
        Error::Packet(error)
    }
}

impl<R, LED> From<EstimateError> for Error<R, LED>
where
    R: Radio,
    LED: OutputPin,
{
    fn from(error: EstimateError) -> Self {
        Error::Estimate(error)
    }
}

// Can't be derived without requiring `Debug` for `R` and `LED` themselves.
impl<R, LED> fmt::Debug for Error<R, LED>
where
    R: Radio,
    R::Error: fmt::Debug,
    LED: OutputPin,
    LED::Error: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(error) => write!(f, "Config({:?})", error),
            Error::Init(error) => write!(f, "Init({:?})", error),
            Error::Transmit(error) => write!(f, "Transmit({:?})", error),
            Error::Radio(error) => write!(f, "Radio({:?})", error),
            Error::Indicator(error) => write!(f, "Indicator({:?})", error),
            Error::Packet(error) => write!(f, "Packet({:?})", error),
            Error::Estimate(error) => write!(f, "Estimate({:?})", error),
            Error::UnknownAnchor(id) => write!(f, "UnknownAnchor({:?})", id),
            Error::IncompleteExchange => write!(f, "IncompleteExchange"),
        }
    }
}
