//! Configuration structs for the radio and the ranging protocol
//!
//! [`RadioConfig`] and [`TxRfConfig`] describe how the radio driver should set
//! up the PHY. [`RangingConfig`] holds the static deployment parameters of one
//! node: its identity, the number of anchors and the timing budget.

use serde::{Deserialize, Serialize};

use crate::{packet::MAX_ANCHORS, time::NodeDelay};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
/// The role a node plays in the ranging exchange
///
/// Fixed for the lifetime of a node.
pub enum Role {
    /// The mobile node that initiates every exchange
    Tag,
    /// A fixed node that answers the tag and computes the distance
    Anchor,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
/// The bitrate at which a message is transmitted
pub enum BitRate {
    /// 110 kilobits per second.
    /// This is an unofficial extension from decawave.
    Kbps110 = 0b00,
    /// 850 kilobits per second.
    Kbps850 = 0b01,
    /// 6.8 megabits per second.
    Kbps6800 = 0b10,
}

impl Default for BitRate {
    fn default() -> Self {
        BitRate::Kbps110
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
/// The PRF value
pub enum PulseRepetitionFrequency {
    /// 16 megahertz
    Mhz16 = 0b01,
    /// 64 megahertz
    Mhz64 = 0b10,
}

impl Default for PulseRepetitionFrequency {
    fn default() -> Self {
        PulseRepetitionFrequency::Mhz64
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
/// An enum that specifies the length of the preamble.
///
/// Longer preambles improve the reception quality and thus range.
/// This comes at the cost of longer transmission times and thus power consumption and bandwidth use.
pub enum PreambleLength {
    /// 64 bits of preamble.
    /// Only supported at Bitrate::Kbps6800.
    Bits64 = 0b0100,
    /// 128 bits of preamble.
    Bits128 = 0b0101,
    /// 256 bits of preamble.
    Bits256 = 0b0110,
    /// 512 bits of preamble.
    Bits512 = 0b0111,
    /// 1024 bits of preamble.
    Bits1024 = 0b1000,
    /// 1536 bits of preamble.
    /// Only supported at Bitrate::Kbps110.
    Bits1536 = 0b1001,
    /// 2048 bits of preamble.
    /// Only supported at Bitrate::Kbps110.
    Bits2048 = 0b1010,
    /// 4096 bits of preamble.
    /// Only supported at Bitrate::Kbps110.
    Bits4096 = 0b1100,
}

impl Default for PreambleLength {
    fn default() -> Self {
        PreambleLength::Bits4096
    }
}

impl PreambleLength {
    /// Gets the recommended PAC size based on the preamble length.
    pub fn get_recommended_pac_size(&self) -> u8 {
        // Values are taken from Table 6 of the DW1000 User manual
        match self {
            PreambleLength::Bits64 => 8,
            PreambleLength::Bits128 => 8,
            PreambleLength::Bits256 => 16,
            PreambleLength::Bits512 => 16,
            PreambleLength::Bits1024 => 32,
            PreambleLength::Bits1536 => 64,
            PreambleLength::Bits2048 => 64,
            PreambleLength::Bits4096 => 64,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
/// An enum that allows the selection between different SFD sequences
pub enum SfdSequence {
    /// The standard sequence defined by the IEEE standard.
    IEEE,
    /// A sequence defined by Decawave that is supposed to be more robust.
    /// This is an unofficial addition.
    Decawave,
}

impl Default for SfdSequence {
    fn default() -> Self {
        SfdSequence::Decawave
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
/// All the available UWB channels.
///
/// Channel numbers are radio-specific identifiers, not a linear scale:
/// channel 4 overlaps channel 2 with a wider bandwidth.
pub enum UwbChannel {
    /// Channel 1
    /// - Center frequency: 3494.4 Mhz
    /// - Bandwidth: 499.2 Mhz
    Channel1 = 1,
    /// Channel 2
    /// - Center frequency: 3993.6 Mhz
    /// - Bandwidth: 499.2 Mhz
    Channel2 = 2,
    /// Channel 3
    /// - Center frequency: 4492.8 Mhz
    /// - Bandwidth: 499.2 Mhz
    Channel3 = 3,
    /// Channel 4
    /// - Center frequency: 3993.6 Mhz
    /// - Bandwidth: 1331.2 Mhz
    Channel4 = 4,
    /// Channel 5
    /// - Center frequency: 6489.6 Mhz
    /// - Bandwidth: 499.2 Mhz
    Channel5 = 5,
    /// Channel 7
    /// - Center frequency: 6489.6 Mhz
    /// - Bandwidth: 1081.6 Mhz
    Channel7 = 7,
}

impl Default for UwbChannel {
    fn default() -> Self {
        UwbChannel::Channel1
    }
}

impl UwbChannel {
    /// The channel number as used by the radio
    pub fn number(&self) -> u8 {
        *self as u8
    }

    /// Whether this is one of the 500 MHz channels
    pub fn is_narrow(&self) -> bool {
        !matches!(self, UwbChannel::Channel4 | UwbChannel::Channel7)
    }

    /// Gets the recommended preamble code
    pub fn get_recommended_preamble_code(&self, prf_value: PulseRepetitionFrequency) -> u8 {
        // Many have overlapping possibilities, so the numbers have been chosen so that there's no overlap here
        match (self, prf_value) {
            (UwbChannel::Channel1, PulseRepetitionFrequency::Mhz16) => 1,
            (UwbChannel::Channel2, PulseRepetitionFrequency::Mhz16) => 3,
            (UwbChannel::Channel3, PulseRepetitionFrequency::Mhz16) => 5,
            (UwbChannel::Channel4, PulseRepetitionFrequency::Mhz16) => 7,
            (UwbChannel::Channel5, PulseRepetitionFrequency::Mhz16) => 4,
            (UwbChannel::Channel7, PulseRepetitionFrequency::Mhz16) => 8,
            (UwbChannel::Channel1, PulseRepetitionFrequency::Mhz64) => 9,
            (UwbChannel::Channel2, PulseRepetitionFrequency::Mhz64) => 10,
            (UwbChannel::Channel3, PulseRepetitionFrequency::Mhz64) => 11,
            (UwbChannel::Channel4, PulseRepetitionFrequency::Mhz64) => 17,
            (UwbChannel::Channel5, PulseRepetitionFrequency::Mhz64) => 12,
            (UwbChannel::Channel7, PulseRepetitionFrequency::Mhz64) => 18,
        }
    }

    /// Gets the recommended value for the tc_pgdelay register
    pub fn get_recommended_tc_pgdelay(&self) -> u8 {
        // Values based on Table 40 of the DW1000 User Manual
        match self {
            UwbChannel::Channel1 => 0xC9,
            UwbChannel::Channel2 => 0xC2,
            UwbChannel::Channel3 => 0xC5,
            UwbChannel::Channel4 => 0x95,
            UwbChannel::Channel5 => 0xC0,
            UwbChannel::Channel7 => 0x93,
        }
    }

    /// Gets the recommended TX power with smart power disabled
    pub fn get_recommended_tx_power(&self, prf_value: PulseRepetitionFrequency) -> u32 {
        // Values based on Table 20 of the DW1000 User Manual
        match (self, prf_value) {
            (UwbChannel::Channel1, PulseRepetitionFrequency::Mhz16) => 0x7575_7575,
            (UwbChannel::Channel2, PulseRepetitionFrequency::Mhz16) => 0x7575_7575,
            (UwbChannel::Channel3, PulseRepetitionFrequency::Mhz16) => 0x6F6F_6F6F,
            (UwbChannel::Channel4, PulseRepetitionFrequency::Mhz16) => 0x5F5F_5F5F,
            (UwbChannel::Channel5, PulseRepetitionFrequency::Mhz16) => 0x4848_4848,
            (UwbChannel::Channel7, PulseRepetitionFrequency::Mhz16) => 0x9292_9292,
            (UwbChannel::Channel1, PulseRepetitionFrequency::Mhz64) => 0x6767_6767,
            (UwbChannel::Channel2, PulseRepetitionFrequency::Mhz64) => 0x6767_6767,
            (UwbChannel::Channel3, PulseRepetitionFrequency::Mhz64) => 0x8B8B_8B8B,
            (UwbChannel::Channel4, PulseRepetitionFrequency::Mhz64) => 0x9A9A_9A9A,
            (UwbChannel::Channel5, PulseRepetitionFrequency::Mhz64) => 0x8585_8585,
            (UwbChannel::Channel7, PulseRepetitionFrequency::Mhz64) => 0xD1D1_D1D1,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
/// PHY configuration handed to the radio driver
pub struct RadioConfig {
    /// The channel to transmit and receive on
    pub channel: UwbChannel,
    /// Sets the PRF value
    pub pulse_repetition_frequency: PulseRepetitionFrequency,
    /// The length of the transmitted preamble
    pub preamble_length: PreambleLength,
    /// Overrides the preamble code
    ///
    /// If `None`, the recommended code for the channel and PRF is used.
    pub preamble_code: Option<u8>,
    /// Sets the bitrate
    pub bitrate: BitRate,
    /// The SFD sequence to send and scan for
    pub sfd_sequence: SfdSequence,
    /// Enables the extended PHY header, allowing frames up to 1023 bytes
    pub extended_phr: bool,
    /// Enables smart TX power control
    pub smart_power: bool,
    /// SFD detection timeout, in preamble symbols
    pub sfd_timeout: u16,
}

impl Default for RadioConfig {
    fn default() -> Self {
        RadioConfig {
            channel: Default::default(),
            pulse_repetition_frequency: Default::default(),
            preamble_length: Default::default(),
            preamble_code: None,
            bitrate: Default::default(),
            sfd_sequence: Default::default(),
            extended_phr: true,
            smart_power: false,
            sfd_timeout: 4096 + 64 + 1,
        }
    }
}

impl RadioConfig {
    /// Returns a copy of this configuration, tuned to `channel`
    pub fn with_channel(&self, channel: UwbChannel) -> Self {
        RadioConfig { channel, ..*self }
    }

    /// The preamble acquisition chunk size, derived from the preamble length
    pub fn pac_size(&self) -> u8 {
        self.preamble_length.get_recommended_pac_size()
    }

    /// The preamble code in effect for the configured channel
    pub fn preamble_code(&self) -> u8 {
        self.preamble_code.unwrap_or_else(|| {
            self.channel
                .get_recommended_preamble_code(self.pulse_repetition_frequency)
        })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
/// RF transmitter settings that depend on the channel
pub struct TxRfConfig {
    /// Pulse generator delay
    pub pg_delay: u8,
    /// TX power register value
    pub power: u32,
}

impl TxRfConfig {
    /// The recommended settings for a channel and PRF
    pub fn for_channel(channel: UwbChannel, prf: PulseRepetitionFrequency) -> Self {
        TxRfConfig {
            pg_delay: channel.get_recommended_tc_pgdelay(),
            power: channel.get_recommended_tx_power(prf),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Deserialize, Serialize)]
/// Static deployment parameters of a ranging node
pub struct RangingConfig {
    /// This node's identifier
    ///
    /// For anchors, this is the 1-based anchor id that selects the reply slot.
    pub node_id: u8,
    /// The tag's identifier, used by anchors to address their replies
    pub tag_id: u8,
    /// The number of anchors taking part in the exchange
    pub num_anchors: u8,
    /// The IEEE 802.15.4 PAN id shared by all nodes
    pub pan_id: u16,
    /// Base of the node EUIs; a node's EUI is `eui_base | id`
    pub eui_base: u64,
    /// The round-trip turnaround budget per node, in microseconds
    pub node_delay_us: u32,
    /// The normal period between two subsequences, in microseconds
    pub subsequence_period_us: u32,
    /// The wait between the idle slot and the start of the next sequence
    pub sequence_wait_us: u32,
    /// Multiple of the subsequence period granted after the last slot
    pub last_slot_factor: u32,
    /// Subtracted from the first anchor tick after a subsequence-0 POLL, to
    /// line up the anchor's reconfiguration with the tag's
    pub anchor_tick_alignment_us: u32,
    /// Delay between the anchor's RESPONSE and re-enabling its receiver
    pub anchor_rx_after_tx_us: u32,
    /// Added to the tag's remaining response window after each RESPONSE
    pub response_timeout_slack_us: u32,
    /// Fixed per-deployment calibration offset, in meters
    pub calibration_offset_m: f64,
    /// Whether to subtract the channel-dependent range bias
    pub apply_range_bias: bool,
    /// RX and TX antenna delay, in system clock ticks
    pub antenna_delay: u16,
    /// PHY settings; the channel is overridden per subsequence
    pub radio: RadioConfig,
}

impl Default for RangingConfig {
    fn default() -> Self {
        RangingConfig {
            node_id: 0,
            tag_id: 0,
            num_anchors: 2,
            pan_id: 0xD100,
            eui_base: 0x0000_0000_0000_0000,
            node_delay_us: 5000,
            subsequence_period_us: 65_000,
            sequence_wait_us: 1_000_000,
            last_slot_factor: 5,
            anchor_tick_alignment_us: 9_869,
            anchor_rx_after_tx_us: 1000,
            response_timeout_slack_us: 1000,
            calibration_offset_m: -155.4 + 0.914,
            apply_range_bias: true,
            antenna_delay: 0,
            radio: Default::default(),
        }
    }
}

impl RangingConfig {
    /// The default configuration for an anchor with the given 1-based id
    pub fn anchor(anchor_id: u8) -> Self {
        RangingConfig {
            node_id: anchor_id,
            ..Default::default()
        }
    }

    /// The EUI of the node with the given id
    pub fn eui(&self, id: u8) -> u64 {
        self.eui_base | id as u64
    }

    /// Checks the configuration for the given role
    pub fn validate(&self, role: Role) -> Result<(), ConfigError> {
        if self.num_anchors == 0 {
            return Err(ConfigError::NoAnchors);
        }
        if self.num_anchors as usize > MAX_ANCHORS {
            return Err(ConfigError::TooManyAnchors(self.num_anchors));
        }
        if role == Role::Anchor && (self.node_id == 0 || self.node_id > self.num_anchors) {
            return Err(ConfigError::AnchorIdOutOfRange {
                anchor_id: self.node_id,
                num_anchors: self.num_anchors,
            });
        }
        match NodeDelay::from_micros(self.node_delay_us) {
            Some(delay) if delay.value() > 0 => {}
            _ => return Err(ConfigError::InvalidNodeDelay),
        }
        if self.subsequence_period_us == 0 {
            return Err(ConfigError::ZeroSubsequencePeriod);
        }
        if self.anchor_tick_alignment_us >= self.subsequence_period_us {
            return Err(ConfigError::AlignmentTooLarge);
        }

        Ok(())
    }
}

/// Returned from [`RangingConfig::validate`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// At least one anchor is required
    NoAnchors,

    /// A FINAL can't carry receive times for this many anchors
    TooManyAnchors(u8),

    /// Anchor ids are 1-based and must not exceed the anchor count
    AnchorIdOutOfRange {
        /// The configured id
        anchor_id: u8,
        /// The configured anchor count
        num_anchors: u8,
    },

    /// The node delay is zero after rounding, or doesn't fit in the clock
    /// range
    InvalidNodeDelay,

    /// The subsequence period is zero
    ZeroSubsequencePeriod,

    /// The anchor tick alignment swallows the whole subsequence period
    AlignmentTooLarge,
}
