//! Antenna-diversity ranging with the DW1000 UWB transceiver
//!
//! This crate implements double-sided two-way ranging (DS-TWR) between one
//! mobile tag and a fixed set of anchors. Every exchange is repeated for each
//! combination of tag antenna, anchor antenna and channel, and the anchors
//! collect one distance per combination. At the end of a sequence, the anchors
//! report their distances to the tag, which makes it possible to calibrate the
//! antennas against each other.
//!
//! The crate doesn't talk to the hardware directly. It is written against the
//! [`Radio`] and [`Timer`] traits, which the firmware implements on top of its
//! DW1000 driver and timer peripheral. Interrupt handlers feed [`Event`]s into
//! a queue, and a [`Node`] processes them one by one:
//!
//! - [`time`] converts between microseconds and DW1000 system time.
//! - [`packet`] encodes and decodes the ranging messages.
//! - [`subsequence`] cycles through the antennas and channels.
//! - [`engine`] implements the [`Tag`] and [`Anchor`] sides of the protocol.
//! - [`estimator`] turns the six timestamps of an exchange into a distance.
//!
//! [`Radio`]: radio::Radio
//! [`Timer`]: radio::Timer
//! [`Event`]: node::Event
//! [`Node`]: node::Node
//! [`Tag`]: engine::Tag
//! [`Anchor`]: engine::Anchor

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(missing_docs)]

pub mod configs;
pub mod engine;
pub mod estimator;
pub mod node;
pub mod packet;
pub mod radio;
pub mod range_bias;
pub mod subsequence;
pub mod time;

mod error;

#[cfg(test)]
mod mock;

pub use crate::{
    configs::{RangingConfig, Role},
    engine::{Anchor, Outcome, RangingRole, Tag},
    error::Error,
    node::{Event, Node},
};
pub use ieee802154::mac;
