use embedded_hal::digital::OutputPin;
use ieee802154::mac::ExtendedAddress;
use log::{debug, info, trace, warn};

use crate::{
    configs::{RangingConfig, Role},
    estimator::{DistanceHistogram, EstimateError, Estimator, Timestamps},
    packet::{AnchorFinal, Destination, Payload, Poll, Response, TagFinal},
    radio::{Radio, RadioEvent, ResponseWindow, SendTime, Timer},
    subsequence::{NextTick, Subsequence},
    time::Instant,
    Error,
};

use super::{Context, Outcome, RangingRole, RangingSession};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Listening,
    Responding,
    Reporting,
}

/// A fixed node that answers the tag and computes the distances
///
/// The anchor follows the tag's timing: a POLL for the first subsequence
/// restarts its schedule. It answers each POLL in the time slot given by its
/// id, computes the distance from the tag's FINAL and reports all distances
/// when the sequence is over.
#[derive(Debug)]
pub struct Anchor {
    session: RangingSession,
    estimator: Estimator,
    state: State,
}

impl Anchor {
    /// Creates an anchor with an empty histogram
    pub fn new(config: &RangingConfig) -> Self {
        Anchor {
            session: RangingSession::default(),
            estimator: Estimator::new(config),
            state: State::Listening,
        }
    }

    /// The exchange in progress
    pub fn session(&self) -> &RangingSession {
        &self.session
    }

    /// The distances measured in the current sequence
    pub fn histogram(&self) -> &DistanceHistogram {
        self.estimator.histogram()
    }

    fn tag_address(config: &RangingConfig) -> Destination {
        Destination::Extended(ExtendedAddress(config.eui(config.tag_id)))
    }

    fn send_report<R, T, LED>(&mut self, ctx: &mut Context<R, T, LED>) -> Result<Outcome, Error<R, LED>>
    where
        R: Radio,
        T: Timer,
        LED: OutputPin,
    {
        self.session.abandon();
        ctx.radio.force_idle().map_err(Error::<R, LED>::Radio)?;

        // Anchors report in reverse order of their ids, two slots apart.
        let anchor_id = ctx.config.node_id;
        let slots = (ctx.config.num_anchors as u32)
            .saturating_sub(anchor_id as u32)
            .saturating_add(1)
            .saturating_mul(2);
        let now = ctx.now_hi32()?;
        let tx_time = ctx.delay.after(now, slots);

        let sent = ctx.send(
            Self::tag_address(ctx.config),
            Payload::AnchorFinal(AnchorFinal {
                anchor_id,
                distances: self.estimator.histogram().clone(),
            }),
            SendTime::Delayed(tx_time),
            None,
        );
        if let Err(error) = sent {
            self.state = State::Listening;
            ctx.listen(0)?;
            return Err(error);
        }

        self.state = State::Reporting;
        info!("Reporting distances of the completed sequence");

        Ok(Outcome::ReportSent)
    }

    fn on_poll<R, T, LED>(
        &mut self,
        ctx: &mut Context<R, T, LED>,
        poll: Poll,
        rx_time: Instant,
    ) -> Result<Outcome, Error<R, LED>>
    where
        R: Radio,
        T: Timer,
        LED: OutputPin,
    {
        let announced = match Subsequence::new(poll.subsequence) {
            Some(subsequence) => subsequence,
            None => {
                warn!("Discarding POLL for subsequence {}", poll.subsequence);
                ctx.listen(0)?;
                return Err(EstimateError::InvalidSubsequence(poll.subsequence).into());
            }
        };

        // The tag starts every sequence; follow its timing. The idle slot uses
        // the same channel and antennas as the first subsequence, so the radio
        // is already set up correctly.
        if announced == Subsequence::FIRST {
            if let NextTick::After(delay_us) = ctx.scheduler.reset() {
                ctx.timer.schedule_once(delay_us);
            }
            self.estimator.clear();
            info!("Tag started a new sequence");
        }

        let current = ctx.scheduler.current();
        if current != announced {
            debug!(
                "POLL for subsequence {}, but in subsequence {}",
                announced.index(),
                current.index()
            );
        }

        self.session.start(announced);
        self.session.poll_rx = Some(rx_time);

        let anchor_id = ctx.config.node_id;
        let tx_time = ctx.delay.after(rx_time.upper32(), anchor_id as u32);
        let response = ResponseWindow {
            rx_after_tx_us: ctx.config.anchor_rx_after_tx_us,
            timeout_us: 0,
        };

        let sent = ctx.send(
            Self::tag_address(ctx.config),
            Payload::Response(Response { anchor_id }),
            SendTime::Delayed(tx_time),
            Some(response),
        );
        if let Err(error) = sent {
            warn!("RESPONSE for subsequence {} not sent", announced.index());
            self.session.abandon();
            ctx.listen(0)?;
            return Err(error);
        }

        self.session.response_tx = Some(tx_time);
        self.state = State::Responding;

        Ok(Outcome::ResponseSent {
            subsequence: current,
            tx_time,
        })
    }

    fn on_final<R, T, LED>(
        &mut self,
        ctx: &mut Context<R, T, LED>,
        fin: TagFinal,
        rx_time: Instant,
    ) -> Result<Outcome, Error<R, LED>>
    where
        R: Radio,
        T: Timer,
        LED: OutputPin,
    {
        let session = core::mem::take(&mut self.session);
        let anchor_id = ctx.config.node_id;

        let timestamps = match (
            session.subsequence,
            session.poll_rx,
            session.response_tx,
            fin.response_rx_times.get(anchor_id),
        ) {
            (Some(subsequence), Some(poll_rx), Some(response_tx), Some(response_rx))
                if subsequence.index() == fin.subsequence =>
            {
                Timestamps {
                    poll_rx,
                    response_tx: response_tx.instant(),
                    final_rx: rx_time,
                    poll_tx: fin.poll_tx_time.instant(),
                    response_rx,
                    final_tx: fin.final_tx_time.instant(),
                }
            }
            _ => {
                warn!("Discarding FINAL for subsequence {}", fin.subsequence);
                ctx.listen(0)?;
                return Err(Error::IncompleteExchange);
            }
        };

        let subsequence = ctx.scheduler.current();
        let channel = subsequence.channel();
        let prf = ctx.config.radio.pulse_repetition_frequency;

        let radio = &*ctx.radio;
        let result = self
            .estimator
            .record(subsequence, &timestamps, |distance| {
                radio.range_bias(channel, distance, prf)
            });

        ctx.listen(0)?;

        match result {
            Ok(distance_m) => {
                info!(
                    "Distance in subsequence {}: {} m",
                    subsequence.index(),
                    distance_m
                );
                Ok(Outcome::DistanceMeasured {
                    subsequence,
                    distance_m,
                })
            }
            Err(error) => {
                warn!("No distance for subsequence {}: {:?}", subsequence.index(), error);
                Err(error.into())
            }
        }
    }
}

impl RangingRole for Anchor {
    const ROLE: Role = Role::Anchor;

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
            return self.send_report(ctx);
        }

        self.session.abandon();
        self.state = State::Listening;
        ctx.listen(0)?;

        Ok(Outcome::Listening)
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
            RadioEvent::TxDone => match self.state {
                State::Reporting => {
                    self.state = State::Listening;
                    ctx.listen(0)?;
                    Ok(Outcome::Listening)
                }
                // The receiver turns on by itself after a RESPONSE.
                State::Responding => {
                    self.state = State::Listening;
                    Ok(Outcome::Idle)
                }
                State::Listening => Ok(Outcome::Idle),
            },
            RadioEvent::RxOk { len } => {
                let rx_time = ctx.rx_timestamp()?;
                let packet = match ctx.receive_packet(len) {
                    Ok(packet) => packet,
                    Err(error) => {
                        ctx.listen(0)?;
                        return Err(error);
                    }
                };

                match packet.payload {
                    Payload::Poll(poll) => self.on_poll(ctx, poll, rx_time),
                    Payload::TagFinal(fin) => self.on_final(ctx, fin, rx_time),
                    payload => {
                        trace!("Ignoring {:?} frame", payload.message_type());
                        ctx.listen(0)?;
                        Ok(Outcome::Idle)
                    }
                }
            }
            RadioEvent::RxTimeout | RadioEvent::RxError => {
                ctx.listen(0)?;
                Ok(Outcome::Listening)
            }
        }
    }
}
