//! Wire format of the ranging messages
//!
//! Four messages take part in a ranging sequence:
//! 1. The tag broadcasts a [`Poll`] for the current subsequence.
//! 2. Every anchor answers with a [`Response`], each in its own time slot.
//! 3. The tag broadcasts a [`TagFinal`] carrying its send times and the
//!    receive times of all responses. Each anchor computes its distance.
//! 4. After the last subsequence, every anchor reports its distances to the
//!    tag in an [`AnchorFinal`].
//!
//! All frames are IEEE 802.15.4 data frames with PAN id compression. Frames
//! sent by the tag use a short broadcast destination, frames sent by anchors
//! are addressed to the tag's EUI. Multi-byte fields are little-endian.
//!
//! Tag frames:
//!
//! | Offset | Length | Field                          |
//! |--------|--------|--------------------------------|
//! | 0      | 2      | frame control (`41 C8`)        |
//! | 2      | 1      | sequence number                |
//! | 3      | 2      | PAN id                         |
//! | 5      | 2      | destination (`FF FF`)          |
//! | 7      | 8      | source EUI                     |
//! | 15     | 1      | message type                   |
//! | 16     | 1      | subsequence                    |
//! | 17     | 4      | POLL send time (upper 32 bits) |
//! | 21     | 4      | FINAL send time (FINAL only)   |
//! | 25     | 8 × N  | RESPONSE receive times (FINAL) |
//!
//! Anchor frames:
//!
//! | Offset | Length | Field                          |
//! |--------|--------|--------------------------------|
//! | 0      | 2      | frame control (`41 CC`)        |
//! | 2      | 1      | sequence number                |
//! | 3      | 2      | PAN id                         |
//! | 5      | 8      | destination EUI                |
//! | 13     | 8      | source EUI                     |
//! | 21     | 1      | message type                   |
//! | 22     | 1      | anchor id                      |
//! | 23     | 4 × 27 | distances as `f32` (FINAL)     |
//!
//! Every frame ends with 2 bytes reserved for the FCS, which the radio
//! computes on transmission.

use core::convert::TryFrom;

use byte::{BytesExt as _, LE};
use ieee802154::mac::{ExtendedAddress, PanId, ShortAddress};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    estimator::DistanceHistogram,
    subsequence::SUBSEQUENCE_COUNT,
    time::{DelayedTxTime, Instant},
};

/// The maximum number of anchors a FINAL can carry receive times for
pub const MAX_ANCHORS: usize = 8;

/// Length of the FCS trailer
pub const FCS_LEN: usize = 2;

/// Length of the header of frames sent by the tag
pub const TAG_HEADER_LEN: usize = 15;

/// Length of the header of frames sent by anchors
pub const ANCHOR_HEADER_LEN: usize = 21;

/// Length of a POLL frame
pub const POLL_LEN: usize = TAG_HEADER_LEN + 6 + FCS_LEN;

/// Length of a RESPONSE frame
pub const RESPONSE_LEN: usize = ANCHOR_HEADER_LEN + 2 + FCS_LEN;

/// Length of an anchor FINAL frame
pub const ANCHOR_FINAL_LEN: usize = ANCHOR_HEADER_LEN + 2 + 4 * SUBSEQUENCE_COUNT + FCS_LEN;

/// Length of the largest frame, which is the anchor FINAL
pub const MAX_FRAME_LEN: usize = ANCHOR_FINAL_LEN;

const FRAME_CONTROL_LOW: u8 = 0x41;
const FRAME_CONTROL_HIGH_SHORT_DST: u8 = 0xC8;
const FRAME_CONTROL_HIGH_EXTENDED_DST: u8 = 0xCC;

/// Length of a tag FINAL frame carrying `num_anchors` receive times
pub const fn tag_final_len(num_anchors: usize) -> usize {
    TAG_HEADER_LEN + 10 + 8 * num_anchors + FCS_LEN
}

/// Identifies the message carried by a frame
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    /// [`Poll`], sent by the tag
    TagPoll = 0x61,
    /// [`Response`], sent by an anchor
    AnchorResponse = 0x50,
    /// [`TagFinal`], sent by the tag
    TagFinal = 0x69,
    /// [`AnchorFinal`], sent by an anchor
    AnchorFinal = 0x51,
}

/// The destination of a frame
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Destination {
    /// A short address; the tag always uses the broadcast address
    Short(ShortAddress),
    /// An extended address
    Extended(ExtendedAddress),
}

impl Destination {
    /// The broadcast destination used by the tag
    pub fn broadcast() -> Self {
        Destination::Short(ShortAddress(0xFFFF))
    }
}

/// The MAC header shared by all messages
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Header {
    /// The sequence number
    pub seq: u8,
    /// The PAN both nodes are part of
    pub pan_id: PanId,
    /// The receiver
    pub destination: Destination,
    /// The sender's EUI
    pub source: ExtendedAddress,
}

impl Header {
    fn len(&self) -> usize {
        match self.destination {
            Destination::Short(_) => TAG_HEADER_LEN,
            Destination::Extended(_) => ANCHOR_HEADER_LEN,
        }
    }
}

/// Starts the exchange for one subsequence
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Poll {
    /// The subsequence this exchange belongs to
    pub subsequence: u8,
    /// When the POLL is sent (tSP)
    pub tx_time: DelayedTxTime,
}

/// An anchor's answer to a POLL
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Response {
    /// The 1-based id of the answering anchor
    pub anchor_id: u8,
}

/// Receive times of the RESPONSEs, one slot per anchor
///
/// Slot `n` belongs to anchor `n + 1`. An empty slot is transmitted as zero.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResponseTimes {
    slots: heapless::Vec<Option<Instant>, MAX_ANCHORS>,
}

impl ResponseTimes {
    /// Creates an empty set of receive times for `num_anchors` anchors
    ///
    /// `num_anchors` is capped at [`MAX_ANCHORS`].
    pub fn new(num_anchors: usize) -> Self {
        let mut slots = heapless::Vec::new();
        // Can't fail, the length is capped at the capacity.
        let _ = slots.resize(num_anchors.min(MAX_ANCHORS), None);

        ResponseTimes { slots }
    }

    /// The number of anchors
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no anchor slots at all
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The number of slots holding a receive time
    pub fn collected(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Empties every slot
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    /// Maps an anchor id to its slot
    ///
    /// Ids above the anchor count are clamped to the last slot. Id 0 is not a
    /// valid anchor id and has no slot.
    pub fn slot_for(&self, anchor_id: u8) -> Option<usize> {
        if anchor_id == 0 || self.slots.is_empty() {
            return None;
        }

        Some((anchor_id as usize).min(self.slots.len()) - 1)
    }

    /// Records the receive time of an anchor's RESPONSE
    ///
    /// Returns the slot that was written.
    pub fn record(&mut self, anchor_id: u8, rx_time: Instant) -> Option<usize> {
        let slot = self.slot_for(anchor_id)?;
        self.slots[slot] = Some(rx_time);
        Some(slot)
    }

    /// The receive time recorded for an anchor
    pub fn get(&self, anchor_id: u8) -> Option<Instant> {
        self.slots[self.slot_for(anchor_id)?]
    }
}

/// Ends the exchange for one subsequence
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TagFinal {
    /// The subsequence this exchange belongs to
    pub subsequence: u8,
    /// When the POLL was sent (tSP)
    pub poll_tx_time: DelayedTxTime,
    /// When this FINAL is sent (tSF)
    pub final_tx_time: DelayedTxTime,
    /// When the RESPONSEs were received (tRR)
    pub response_rx_times: ResponseTimes,
}

/// An anchor's distances for a complete sequence
#[derive(Clone, Debug, PartialEq)]
pub struct AnchorFinal {
    /// The 1-based id of the reporting anchor
    pub anchor_id: u8,
    /// One distance per subsequence
    pub distances: DistanceHistogram,
}

/// The message-specific part of a frame
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// See [`Poll`]
    Poll(Poll),
    /// See [`Response`]
    Response(Response),
    /// See [`TagFinal`]
    TagFinal(TagFinal),
    /// See [`AnchorFinal`]
    AnchorFinal(AnchorFinal),
}

impl Payload {
    /// The message type tag of this payload
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Poll(_) => MessageType::TagPoll,
            Payload::Response(_) => MessageType::AnchorResponse,
            Payload::TagFinal(_) => MessageType::TagFinal,
            Payload::AnchorFinal(_) => MessageType::AnchorFinal,
        }
    }

    fn len(&self) -> usize {
        match self {
            Payload::Poll(_) => 6,
            Payload::Response(_) => 2,
            Payload::TagFinal(payload) => 10 + 8 * payload.response_rx_times.len(),
            Payload::AnchorFinal(_) => 2 + 4 * SUBSEQUENCE_COUNT,
        }
    }
}

/// A complete ranging frame
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    /// The MAC header
    pub header: Header,
    /// The message
    pub payload: Payload,
}

impl Packet {
    /// The length of the encoded frame, including the FCS
    pub fn len(&self) -> usize {
        self.header.len() + self.payload.len() + FCS_LEN
    }

    /// Encodes the frame into `buffer`
    ///
    /// Returns the frame length, including the 2 FCS bytes. Those are left
    /// zeroed, as the radio fills them in.
    pub fn encode(&self, buffer: &mut [u8]) -> Result<usize, Error> {
        let len = self.len();
        if buffer.len() < len {
            return Err(Error::BufferTooSmall { required_len: len });
        }

        let offset = &mut 0;
        encode_header(&self.header, buffer, offset)?;

        buffer.write_with(offset, u8::from(self.payload.message_type()), LE)?;
        match &self.payload {
            Payload::Poll(poll) => {
                buffer.write_with(offset, poll.subsequence, LE)?;
                buffer.write_with(offset, poll.tx_time.value(), LE)?;
            }
            Payload::Response(response) => {
                buffer.write_with(offset, response.anchor_id, LE)?;
            }
            Payload::TagFinal(fin) => {
                buffer.write_with(offset, fin.subsequence, LE)?;
                buffer.write_with(offset, fin.poll_tx_time.value(), LE)?;
                buffer.write_with(offset, fin.final_tx_time.value(), LE)?;
                for slot in fin.response_rx_times.slots.iter() {
                    let value = slot.map(|time| time.value()).unwrap_or(0);
                    buffer.write_with(offset, value, LE)?;
                }
            }
            Payload::AnchorFinal(fin) => {
                buffer.write_with(offset, fin.anchor_id, LE)?;
                for distance in fin.distances.iter() {
                    buffer.write_with(offset, distance.to_bits(), LE)?;
                }
            }
        }

        buffer[*offset..len].iter_mut().for_each(|byte| *byte = 0);

        Ok(len)
    }

    /// Decodes a received frame
    ///
    /// `frame` must be the complete frame as reported by the radio, including
    /// the FCS. The length has to match the message type exactly.
    pub fn decode(frame: &[u8]) -> Result<Packet, Error> {
        let offset = &mut 0;
        let header = decode_header(frame, offset)?;

        let message_type: u8 = frame.read_with(offset, LE)?;
        let message_type =
            MessageType::try_from(message_type).map_err(|error| Error::InvalidMessageType(error.number))?;

        let expected = match message_type {
            MessageType::TagPoll => POLL_LEN,
            MessageType::AnchorResponse => RESPONSE_LEN,
            MessageType::AnchorFinal => ANCHOR_FINAL_LEN,
            MessageType::TagFinal => {
                let fixed = tag_final_len(0);
                let num_anchors = frame.len().saturating_sub(fixed) / 8;
                if frame.len() < fixed || num_anchors > MAX_ANCHORS {
                    return Err(Error::UnexpectedLength {
                        message_type,
                        len: frame.len(),
                    });
                }
                tag_final_len(num_anchors)
            }
        };
        if frame.len() != expected {
            return Err(Error::UnexpectedLength {
                message_type,
                len: frame.len(),
            });
        }

        let payload = match message_type {
            MessageType::TagPoll => Payload::Poll(Poll {
                subsequence: frame.read_with(offset, LE)?,
                tx_time: DelayedTxTime::new(frame.read_with(offset, LE)?),
            }),
            MessageType::AnchorResponse => Payload::Response(Response {
                anchor_id: frame.read_with(offset, LE)?,
            }),
            MessageType::TagFinal => {
                let subsequence = frame.read_with(offset, LE)?;
                let poll_tx_time = DelayedTxTime::new(frame.read_with(offset, LE)?);
                let final_tx_time = DelayedTxTime::new(frame.read_with(offset, LE)?);

                let num_anchors = (expected - tag_final_len(0)) / 8;
                let mut response_rx_times = ResponseTimes::new(num_anchors);
                for slot in response_rx_times.slots.iter_mut() {
                    let value: u64 = frame.read_with(offset, LE)?;
                    // A zero timestamp means the RESPONSE was never received.
                    *slot = if value == 0 { None } else { Instant::new(value) };
                }

                Payload::TagFinal(TagFinal {
                    subsequence,
                    poll_tx_time,
                    final_tx_time,
                    response_rx_times,
                })
            }
            MessageType::AnchorFinal => {
                let anchor_id = frame.read_with(offset, LE)?;
                let mut distances = DistanceHistogram::new();
                for index in 0..SUBSEQUENCE_COUNT {
                    let bits: u32 = frame.read_with(offset, LE)?;
                    distances.set(index, f32::from_bits(bits));
                }

                Payload::AnchorFinal(AnchorFinal { anchor_id, distances })
            }
        };

        Ok(Packet { header, payload })
    }
}

fn encode_header(header: &Header, buffer: &mut [u8], offset: &mut usize) -> Result<(), Error> {
    let frame_control_high = match header.destination {
        Destination::Short(_) => FRAME_CONTROL_HIGH_SHORT_DST,
        Destination::Extended(_) => FRAME_CONTROL_HIGH_EXTENDED_DST,
    };

    buffer.write_with(offset, FRAME_CONTROL_LOW, LE)?;
    buffer.write_with(offset, frame_control_high, LE)?;
    buffer.write_with(offset, header.seq, LE)?;
    buffer.write_with(offset, header.pan_id.0, LE)?;
    match header.destination {
        Destination::Short(address) => buffer.write_with(offset, address.0, LE)?,
        Destination::Extended(address) => buffer.write_with(offset, address.0, LE)?,
    }
    buffer.write_with(offset, header.source.0, LE)?;

    Ok(())
}

fn decode_header(frame: &[u8], offset: &mut usize) -> Result<Header, Error> {
    // The shorter header plus the message type byte is the minimum that has to
    // be there to tell what kind of frame this is.
    if frame.len() < TAG_HEADER_LEN + 1 {
        return Err(Error::BufferTooSmall {
            required_len: TAG_HEADER_LEN + 1,
        });
    }

    let _frame_control_low: u8 = frame.read_with(offset, LE)?;
    let frame_control_high: u8 = frame.read_with(offset, LE)?;
    let seq = frame.read_with(offset, LE)?;
    let pan_id = PanId(frame.read_with(offset, LE)?);

    // Destination addressing mode, bits 10-11 of the frame control field
    let destination = match (frame_control_high >> 2) & 0b11 {
        0b10 => Destination::Short(ShortAddress(frame.read_with(offset, LE)?)),
        0b11 => {
            if frame.len() < ANCHOR_HEADER_LEN + 1 {
                return Err(Error::BufferTooSmall {
                    required_len: ANCHOR_HEADER_LEN + 1,
                });
            }
            Destination::Extended(ExtendedAddress(frame.read_with(offset, LE)?))
        }
        mode => return Err(Error::UnsupportedAddressing(mode)),
    };

    // Source addressing mode, bits 14-15
    let source_mode = frame_control_high >> 6;
    if source_mode != 0b11 {
        return Err(Error::UnsupportedAddressing(source_mode));
    }
    let source = ExtendedAddress(frame.read_with(offset, LE)?);

    Ok(Header {
        seq,
        pan_id,
        destination,
        source,
    })
}

/// Returned when encoding or decoding a frame fails
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// The message type byte matches none of the known messages
    InvalidMessageType(u8),

    /// The frame length doesn't match the message type
    UnexpectedLength {
        /// The message type found in the frame
        message_type: MessageType,
        /// The length of the frame
        len: usize,
    },

    /// Buffer too small
    BufferTooSmall {
        /// Indicates how large a buffer would have been required
        required_len: usize,
    },

    /// The frame uses an addressing mode that no ranging message uses
    UnsupportedAddressing(u8),

    /// A field could not be read or written
    Malformed,
}

impl From<byte::Error> for Error {
    fn from(_: byte::Error) -> Self {
        Error::Malformed
    }
}
