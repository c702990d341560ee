use embedded_hal::digital::OutputPin;
use log::{debug, info, trace, warn};

use crate::{
    configs::Role,
    estimator::DistanceHistogram,
    packet::{AnchorFinal, Destination, Payload, Poll, ResponseTimes, TagFinal, MAX_ANCHORS},
    radio::{Radio, RadioEvent, ResponseWindow, SendTime, Timer},
    subsequence::Subsequence,
    Error,
};

use super::{Context, Outcome, RangingRole, RangingSession};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Idle,
    AwaitingResponses { timeout_us: u32 },
    CollectingReports,
}

/// The mobile node, which drives the timing of every exchange
///
/// Each subsequence, the tag sends a POLL, collects the anchors' RESPONSEs
/// until the receive timeout fires and then sends a FINAL with all
/// timestamps. During the idle slot, it listens for the anchors' reports.
#[derive(Debug)]
pub struct Tag {
    session: RangingSession,
    state: State,
    reports: [Option<DistanceHistogram>; MAX_ANCHORS],
}

impl Tag {
    /// Creates a tag that hasn't started an exchange yet
    pub fn new() -> Self {
        Tag {
            session: RangingSession::default(),
            state: State::Idle,
            reports: Default::default(),
        }
    }

    /// The exchange in progress
    pub fn session(&self) -> &RangingSession {
        &self.session
    }

    /// The distances last reported by an anchor
    pub fn report(&self, anchor_id: u8) -> Option<&DistanceHistogram> {
        let index = (anchor_id as usize).checked_sub(1)?;
        self.reports.get(index)?.as_ref()
    }

    fn send_poll<R, T, LED>(
        &mut self,
        ctx: &mut Context<R, T, LED>,
        subsequence: Subsequence,
    ) -> Result<Outcome, Error<R, LED>>
    where
        R: Radio,
        T: Timer,
        LED: OutputPin,
    {
        self.session.start(subsequence);
        self.session.response_rx = Some(ResponseTimes::new(ctx.config.num_anchors as usize));
        self.state = State::Idle;

        let now = ctx.now_hi32()?;
        let tx_time = ctx.delay.after(now, 1);
        let timeout_us = ctx
            .config
            .node_delay_us
            .saturating_mul(ctx.config.num_anchors as u32);

        ctx.send(
            Destination::broadcast(),
            Payload::Poll(Poll {
                subsequence: subsequence.index(),
                tx_time,
            }),
            SendTime::Delayed(tx_time),
            Some(ResponseWindow {
                rx_after_tx_us: 0,
                timeout_us,
            }),
        )?;

        // The radio doesn't preserve the TX antenna delay across a delayed
        // transmission.
        ctx.radio
            .set_tx_antenna_delay(ctx.config.antenna_delay)
            .map_err(Error::<R, LED>::Radio)?;

        self.session.poll_tx = Some(tx_time);
        self.state = State::AwaitingResponses { timeout_us };

        debug!("POLL for subsequence {} at {:#x}", subsequence.index(), tx_time.value());

        Ok(Outcome::PollSent {
            subsequence,
            tx_time,
        })
    }

    fn send_final<R, T, LED>(&mut self, ctx: &mut Context<R, T, LED>) -> Result<Outcome, Error<R, LED>>
    where
        R: Radio,
        T: Timer,
        LED: OutputPin,
    {
        self.state = State::Idle;

        let (subsequence, poll_tx, response_rx) = match (
            self.session.subsequence,
            self.session.poll_tx,
            self.session.response_rx.clone(),
        ) {
            (Some(subsequence), Some(poll_tx), Some(response_rx)) => {
                (subsequence, poll_tx, response_rx)
            }
            _ => return Ok(Outcome::Idle),
        };

        let now = ctx.now_hi32()?;
        let final_tx_time = ctx.delay.after(now, 1);
        let responses = response_rx.collected();

        ctx.send(
            Destination::broadcast(),
            Payload::TagFinal(TagFinal {
                subsequence: subsequence.index(),
                poll_tx_time: poll_tx,
                final_tx_time,
                response_rx_times: response_rx,
            }),
            SendTime::Delayed(final_tx_time),
            None,
        )?;

        debug!(
            "FINAL for subsequence {} with {} responses",
            subsequence.index(),
            responses
        );

        Ok(Outcome::FinalSent {
            subsequence,
            responses,
        })
    }

    fn on_frame<R, T, LED>(
        &mut self,
        ctx: &mut Context<R, T, LED>,
        len: usize,
    ) -> Result<Outcome, Error<R, LED>>
    where
        R: Radio,
        T: Timer,
        LED: OutputPin,
    {
        let rx_time = ctx.rx_timestamp()?;
        let packet = match ctx.receive_packet(len) {
            Ok(packet) => packet,
            Err(error) => {
                self.resume(ctx)?;
                return Err(error);
            }
        };

        match (self.state, packet.payload) {
            (State::AwaitingResponses { .. }, Payload::Response(response)) => {
                let anchor_id = response.anchor_id;
                let recorded = self
                    .session
                    .response_rx
                    .as_mut()
                    .and_then(|times| times.record(anchor_id, rx_time));
                if recorded.is_none() {
                    warn!("Discarding RESPONSE from unknown anchor {}", anchor_id);
                    self.resume(ctx)?;
                    return Err(Error::UnknownAnchor(anchor_id));
                }

                // Only wait as long as the remaining anchors need to reply.
                let num_anchors = ctx.config.num_anchors as u32;
                let remaining = num_anchors.saturating_sub(anchor_id as u32);
                let timeout_us = ctx
                    .config
                    .node_delay_us
                    .saturating_mul(remaining)
                    .saturating_add(ctx.config.response_timeout_slack_us);
                self.state = State::AwaitingResponses { timeout_us };
                ctx.listen(timeout_us)?;

                debug!("RESPONSE from anchor {} at {:#x}", anchor_id, rx_time.value());

                Ok(Outcome::ResponseRecorded { anchor_id, rx_time })
            }
            (State::CollectingReports, Payload::AnchorFinal(AnchorFinal { anchor_id, distances })) => {
                let slot = (anchor_id as usize)
                    .checked_sub(1)
                    .and_then(|index| self.reports.get_mut(index));
                let slot = match slot {
                    Some(slot) => slot,
                    None => {
                        warn!("Discarding report from unknown anchor {}", anchor_id);
                        ctx.listen(0)?;
                        return Err(Error::UnknownAnchor(anchor_id));
                    }
                };
                *slot = Some(distances);
                ctx.listen(0)?;

                info!("Distances reported by anchor {}", anchor_id);

                Ok(Outcome::ReportReceived { anchor_id })
            }
            (_, payload) => {
                trace!("Ignoring {:?} frame", payload.message_type());
                self.resume(ctx)?;
                Ok(Outcome::Idle)
            }
        }
    }

    /// Re-enables the receiver after a frame that didn't advance the state
    fn resume<R, T, LED>(&mut self, ctx: &mut Context<R, T, LED>) -> Result<(), Error<R, LED>>
    where
        R: Radio,
        T: Timer,
        LED: OutputPin,
    {
        match self.state {
            State::AwaitingResponses { timeout_us } => ctx.listen(timeout_us),
            State::CollectingReports => ctx.listen(0),
            State::Idle => Ok(()),
        }
    }
}

impl Default for Tag {
    fn default() -> Self {
        Self::new()
    }
}

impl RangingRole for Tag {
    const ROLE: Role = Role::Tag;

    fn on_tick<R, T, LED>(
        &mut self,
        ctx: &mut Context<R, T, LED>,
        subsequence: Subsequence,
    ) -> Result<Outcome, Error<R, LED>>
    where
        R: Radio,
        T: Timer,
        LED: OutputPin,
    {
        if subsequence.is_idle() {
            self.session.abandon();
            self.state = State::CollectingReports;
            ctx.listen(0)?;

            return Ok(Outcome::Listening);
        }

        self.send_poll(ctx, subsequence)
    }

    fn on_radio_event<R, T, LED>(
        &mut self,
        ctx: &mut Context<R, T, LED>,
        event: RadioEvent,
    ) -> Result<Outcome, Error<R, LED>>
    where
        R: Radio,
        T: Timer,
        LED: OutputPin,
    {
        match event {
            RadioEvent::TxDone => Ok(Outcome::Idle),
            RadioEvent::RxOk { len } => self.on_frame(ctx, len),
            RadioEvent::RxTimeout => match self.state {
                State::AwaitingResponses { .. } => self.send_final(ctx),
                State::CollectingReports => {
                    ctx.listen(0)?;
                    Ok(Outcome::Listening)
                }
                State::Idle => Ok(Outcome::Idle),
            },
            RadioEvent::RxError => {
                self.resume(ctx)?;
                Ok(Outcome::Idle)
            }
        }
    }
}
