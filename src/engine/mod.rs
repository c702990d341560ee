//! The ranging protocol, in its two variants
//!
//! A node runs either [`Tag`] or [`Anchor`], both implementations of
//! [`RangingRole`]. The [`Node`](crate::node::Node) driver takes care of the
//! event queue, the subsequence schedule and the radio configuration, and
//! hands each event to the role together with a [`Context`].

use core::{marker::PhantomData, num::Wrapping};

use embedded_hal::digital::OutputPin;
use ieee802154::mac::{ExtendedAddress, PanId};

use crate::{
    configs::{RangingConfig, Role},
    packet::{self, Destination, Header, Packet, Payload, ResponseTimes, MAX_FRAME_LEN},
    radio::{Radio, RadioEvent, ResponseWindow, SendTime, Timer},
    subsequence::{Subsequence, SubsequenceScheduler},
    time::{DelayedTxTime, Instant, NodeDelay},
    Error,
};

pub use self::{anchor::*, tag::*};

mod anchor;
mod tag;

/// One side of the ranging protocol
pub trait RangingRole {
    /// The role this implementation plays
    const ROLE: Role;

    /// Handles a scheduler tick
    ///
    /// Called after the radio has been configured for `subsequence`.
    fn on_tick<R, T, LED>(
        &mut self,
        ctx: &mut Context<R, T, LED>,
        subsequence: Subsequence,
    ) -> Result<Outcome, Error<R, LED>>
    where
        R: Radio,
        T: Timer,
        LED: OutputPin;

    /// Handles an event reported by the radio
    fn on_radio_event<R, T, LED>(
        &mut self,
        ctx: &mut Context<R, T, LED>,
        event: RadioEvent,
    ) -> Result<Outcome, Error<R, LED>>
    where
        R: Radio,
        T: Timer,
        LED: OutputPin;
}

/// What handling an event resulted in
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Outcome {
    /// The tag has sent a POLL
    PollSent {
        /// The subsequence the POLL belongs to
        subsequence: Subsequence,
        /// When the POLL goes out
        tx_time: DelayedTxTime,
    },

    /// The tag has received a RESPONSE
    ResponseRecorded {
        /// The responding anchor
        anchor_id: u8,
        /// When the RESPONSE arrived
        rx_time: Instant,
    },

    /// The tag has sent its FINAL
    FinalSent {
        /// The subsequence the FINAL belongs to
        subsequence: Subsequence,
        /// How many RESPONSEs it carries receive times for
        responses: usize,
    },

    /// An anchor has answered a POLL
    ResponseSent {
        /// The subsequence the anchor is in
        subsequence: Subsequence,
        /// When the RESPONSE goes out
        tx_time: DelayedTxTime,
    },

    /// An anchor has computed a distance
    DistanceMeasured {
        /// The subsequence the distance was recorded for
        subsequence: Subsequence,
        /// The calibrated distance in meters
        distance_m: f64,
    },

    /// An anchor has sent its distances at the end of a sequence
    ReportSent,

    /// The tag has received an anchor's distances
    ReportReceived {
        /// The reporting anchor
        anchor_id: u8,
    },

    /// The receiver is enabled without timeout
    Listening,

    /// Nothing to do
    Idle,
}

/// The hardware and shared state a role operates on
///
/// `LED` is the fault indicator's type. Roles never touch it, but their errors
/// are reported in terms of it.
pub struct Context<'r, R, T, LED> {
    /// The radio driver
    pub radio: &'r mut R,
    /// The timer that drives the scheduler
    pub timer: &'r mut T,
    /// The subsequence schedule
    pub scheduler: &'r mut SubsequenceScheduler,
    /// Static configuration
    pub config: &'r RangingConfig,
    /// The node turnaround delay
    pub delay: NodeDelay,
    pub(crate) seq: &'r mut Wrapping<u8>,
    pub(crate) indicator: PhantomData<fn() -> LED>,
}

impl<'r, R, T, LED> Context<'r, R, T, LED>
where
    R: Radio,
    T: Timer,
    LED: OutputPin,
{
    /// The current system time, upper 32 bits
    pub fn now_hi32(&mut self) -> Result<u32, Error<R, LED>> {
        self.radio.system_time_hi32().map_err(Error::Radio)
    }

    /// Encodes and sends a frame
    ///
    /// Every frame gets the next sequence number, the configured PAN id and
    /// this node's EUI. A rejected transmission is reported as
    /// [`Error::Transmit`].
    pub fn send(
        &mut self,
        destination: Destination,
        payload: Payload,
        send_time: SendTime,
        response: Option<ResponseWindow>,
    ) -> Result<(), Error<R, LED>> {
        let packet = Packet {
            header: Header {
                seq: self.seq.0,
                pan_id: PanId(self.config.pan_id),
                destination,
                source: ExtendedAddress(self.config.eui(self.config.node_id)),
            },
            payload,
        };
        *self.seq += Wrapping(1);

        let mut buffer = [0; MAX_FRAME_LEN];
        let len = packet.encode(&mut buffer)?;

        self.radio
            .send(&buffer[..len], send_time, response)
            .map_err(Error::Transmit)
    }

    /// Reads and decodes the frame that was just received
    pub fn receive_packet(&mut self, len: usize) -> Result<Packet, Error<R, LED>> {
        let mut buffer = [0; MAX_FRAME_LEN];
        let frame = buffer
            .get_mut(..len)
            .ok_or(packet::Error::BufferTooSmall { required_len: len })?;

        self.radio.read_frame(frame).map_err(Error::<R, LED>::Radio)?;

        Ok(Packet::decode(frame)?)
    }

    /// When the last frame was received
    pub fn rx_timestamp(&mut self) -> Result<Instant, Error<R, LED>> {
        self.radio.rx_timestamp().map_err(Error::Radio)
    }

    /// Enables the receiver; 0 disables the timeout
    pub fn listen(&mut self, timeout_us: u32) -> Result<(), Error<R, LED>> {
        self.radio.receive(timeout_us).map_err(Error::Radio)
    }
}

/// The timestamps of the exchange in progress
///
/// Owned by the role; reset whenever a new exchange starts.
#[derive(Clone, Debug, Default)]
pub struct RangingSession {
    /// The subsequence the exchange belongs to
    pub subsequence: Option<Subsequence>,
    /// tSP, when the tag sent its POLL
    pub poll_tx: Option<DelayedTxTime>,
    /// tRR, when the tag received each RESPONSE
    pub response_rx: Option<ResponseTimes>,
    /// tRP, when the anchor received the POLL
    pub poll_rx: Option<Instant>,
    /// tSR, when the anchor sent its RESPONSE
    pub response_tx: Option<DelayedTxTime>,
}

impl RangingSession {
    /// Forgets the previous exchange and starts one for `subsequence`
    pub fn start(&mut self, subsequence: Subsequence) {
        *self = RangingSession {
            subsequence: Some(subsequence),
            ..Default::default()
        };
    }

    /// Forgets the exchange in progress
    pub fn abandon(&mut self) {
        *self = Default::default();
    }
}
