//! The antenna and channel cycle
//!
//! A sequence steps through every combination of tag antenna, anchor antenna
//! and channel once. Each step is a subsequence, identified by its index. The
//! index right after the last combination is the idle slot, used to settle
//! and exchange results before the cycle starts over.

use serde::{Deserialize, Serialize};

use crate::configs::{RangingConfig, Role, UwbChannel};

/// Number of antennas on each node
pub const NUM_ANTENNAS: usize = 3;

/// Number of channels cycled through
pub const NUM_CHANNELS: usize = 3;

/// Number of active subsequences in one sequence
pub const SUBSEQUENCE_COUNT: usize = NUM_ANTENNAS * NUM_ANTENNAS * NUM_CHANNELS;

/// The channels cycled through, in order
///
/// Channel numbers are not contiguous, so this is a lookup rather than an
/// offset.
pub const DIVERSITY_CHANNELS: [UwbChannel; NUM_CHANNELS] =
    [UwbChannel::Channel1, UwbChannel::Channel4, UwbChannel::Channel3];

/// One of the antennas connected to the RF switch
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Antenna(u8);

impl Antenna {
    /// Creates an antenna from its index
    ///
    /// Returns `None`, if there's no antenna with that index.
    pub fn new(index: u8) -> Option<Self> {
        if (index as usize) < NUM_ANTENNAS {
            Some(Antenna(index))
        } else {
            None
        }
    }

    /// The index of the antenna, in `0..NUM_ANTENNAS`
    pub fn index(&self) -> u8 {
        self.0
    }
}

/// Position in the antenna and channel cycle
///
/// Valid values are `0..=SUBSEQUENCE_COUNT`, where `SUBSEQUENCE_COUNT` is the
/// idle slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Subsequence(u8);

impl Subsequence {
    /// The first subsequence of a sequence
    pub const FIRST: Subsequence = Subsequence(0);

    /// The last subsequence that performs an exchange
    pub const LAST_ACTIVE: Subsequence = Subsequence(SUBSEQUENCE_COUNT as u8 - 1);

    /// The idle slot following the last active subsequence
    pub const IDLE: Subsequence = Subsequence(SUBSEQUENCE_COUNT as u8);

    /// Creates a subsequence from its index
    ///
    /// Returns `None` for indices past the idle slot.
    pub fn new(index: u8) -> Option<Self> {
        if index as usize <= SUBSEQUENCE_COUNT {
            Some(Subsequence(index))
        } else {
            None
        }
    }

    /// The raw index
    pub fn index(&self) -> u8 {
        self.0
    }

    /// Whether this is the idle slot
    pub fn is_idle(&self) -> bool {
        *self == Self::IDLE
    }

    /// The channel used during this subsequence
    ///
    /// The idle slot maps to the channel of the first subsequence.
    pub fn channel(&self) -> UwbChannel {
        let ordinal = (self.0 as usize / (NUM_ANTENNAS * NUM_ANTENNAS)) % NUM_CHANNELS;
        DIVERSITY_CHANNELS[ordinal]
    }

    /// The antenna the tag uses during this subsequence
    pub fn tag_antenna(&self) -> Antenna {
        Antenna(((self.0 as usize / NUM_ANTENNAS) % NUM_ANTENNAS) as u8)
    }

    /// The antenna the anchors use during this subsequence
    pub fn anchor_antenna(&self) -> Antenna {
        Antenna((self.0 as usize % NUM_ANTENNAS) as u8)
    }

    /// The antenna a node of the given role uses during this subsequence
    pub fn antenna(&self, role: Role) -> Antenna {
        match role {
            Role::Tag => self.tag_antenna(),
            Role::Anchor => self.anchor_antenna(),
        }
    }

    fn next(&self) -> (Subsequence, bool) {
        if self.is_idle() {
            (Self::FIRST, true)
        } else {
            (Subsequence(self.0 + 1), false)
        }
    }
}

/// When the scheduler wants to be ticked next
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NextTick {
    /// After the given number of microseconds
    After(u32),
    /// Not until something else restarts the cycle
    Suspended,
}

/// The result of [`SubsequenceScheduler::advance`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Advance {
    /// The subsequence that is now active
    pub subsequence: Subsequence,
    /// Whether the cycle wrapped around from the idle slot
    ///
    /// The radio has to be reinitialized before the new subsequence starts.
    pub wrapped: bool,
    /// When to tick next
    pub next_tick: NextTick,
}

/// Advances through the subsequences and decides when the next tick is due
#[derive(Clone, Debug)]
pub struct SubsequenceScheduler {
    current: Subsequence,
    period_us: u32,
    last_slot_us: u32,
    sequence_wait_us: u32,
    first_tick_after_reset_us: u32,
    follows_tag: bool,
}

impl SubsequenceScheduler {
    /// Creates a scheduler in the idle slot
    ///
    /// Anchors follow the tag: after wrapping around to the first subsequence,
    /// their scheduler suspends and waits for [`SubsequenceScheduler::reset`].
    /// They wrap one last-slot period after the idle slot, well before the tag
    /// is done waiting.
    pub fn new(config: &RangingConfig, role: Role) -> Self {
        SubsequenceScheduler {
            current: Subsequence::IDLE,
            period_us: config.subsequence_period_us,
            last_slot_us: config
                .subsequence_period_us
                .saturating_mul(config.last_slot_factor),
            sequence_wait_us: config.sequence_wait_us,
            first_tick_after_reset_us: config
                .subsequence_period_us
                .saturating_sub(config.anchor_tick_alignment_us),
            follows_tag: role == Role::Anchor,
        }
    }

    /// The active subsequence
    pub fn current(&self) -> Subsequence {
        self.current
    }

    /// The delay before the very first tick
    ///
    /// A node starts in the idle slot, so its first tick is one sequence wait
    /// away and wraps around to the first subsequence.
    pub fn start(&self) -> NextTick {
        NextTick::After(self.sequence_wait_us)
    }

    /// Moves on to the next subsequence
    pub fn advance(&mut self) -> Advance {
        let (subsequence, wrapped) = self.current.next();
        self.current = subsequence;

        let next_tick = if subsequence.is_idle() {
            if self.follows_tag {
                NextTick::After(self.last_slot_us)
            } else {
                NextTick::After(self.sequence_wait_us)
            }
        } else if wrapped && self.follows_tag {
            NextTick::Suspended
        } else if subsequence == Subsequence::LAST_ACTIVE {
            NextTick::After(self.last_slot_us)
        } else {
            NextTick::After(self.period_us)
        };

        Advance {
            subsequence,
            wrapped,
            next_tick,
        }
    }

    /// Restarts the cycle at the first subsequence without reinitialization
    ///
    /// Used by anchors when the tag starts a new sequence. The returned tick is
    /// shortened by the alignment offset, as the POLL arrives partway into the
    /// tag's subsequence.
    pub fn reset(&mut self) -> NextTick {
        self.current = Subsequence::FIRST;
        NextTick::After(self.first_tick_after_reset_us)
    }

    /// Goes back to the idle slot, so the next tick wraps around again
    ///
    /// Used to retry a failed radio initialization instead of waiting for a
    /// tag that can't be heard.
    pub fn rewind(&mut self) -> NextTick {
        self.current = Subsequence::IDLE;
        NextTick::After(self.sequence_wait_us)
    }
}
