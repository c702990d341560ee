//! The event loop that drives a ranging node
//!
//! Interrupt handlers don't touch any ranging state. The radio interrupt
//! handler and the timer push [`Event`]s into a `heapless::spsc::Queue`, and
//! [`Node::poll`] processes them one at a time from the main loop:
//!
//! ``` ignore
//! let (mut producer, consumer) = QUEUE.split();
//! let mut node = Node::new(Tag::new(), config, radio, timer, fault_led, consumer)?;
//!
//! loop {
//!     match nb::block!(node.poll()) {
//!         Ok(outcome) => log::trace!("{:?}", outcome),
//!         Err(error) => log::warn!("{:?}", error),
//!     }
//! }
//! ```

use core::{marker::PhantomData, num::Wrapping};

use embedded_hal::digital::OutputPin;
use heapless::spsc::Consumer;
use log::{debug, error, info, trace, warn};

use crate::{
    configs::{ConfigError, RangingConfig, TxRfConfig},
    engine::{Context, Outcome, RangingRole},
    radio::{Radio, RadioEvent, Timer},
    subsequence::{NextTick, Subsequence, SubsequenceScheduler},
    time::NodeDelay,
    Error,
};

/// Something that happened outside of the main loop
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// The subsequence timer expired
    Tick,
    /// The radio reported an event
    Radio(RadioEvent),
}

/// A ranging node
///
/// Owns the radio, the timer and the fault indicator, and runs one
/// [`RangingRole`]. `N` is the capacity of the event queue.
pub struct Node<'q, P, R, T, LED, const N: usize> {
    role: P,
    radio: R,
    timer: T,
    fault: LED,
    events: Consumer<'q, Event, N>,
    scheduler: SubsequenceScheduler,
    config: RangingConfig,
    delay: NodeDelay,
    seq: Wrapping<u8>,
    radio_ready: bool,
}

impl<'q, P, R, T, LED, const N: usize> Node<'q, P, R, T, LED, N>
where
    P: RangingRole,
    R: Radio,
    T: Timer,
    LED: OutputPin,
{
    /// Creates a node and arms the timer for its first tick
    ///
    /// The node starts in the idle slot. The radio is initialized by the
    /// first tick, one sequence wait from now.
    pub fn new(
        role: P,
        config: RangingConfig,
        radio: R,
        mut timer: T,
        fault: LED,
        events: Consumer<'q, Event, N>,
    ) -> Result<Self, Error<R, LED>> {
        config.validate(P::ROLE)?;
        let delay =
            NodeDelay::from_micros(config.node_delay_us).ok_or(ConfigError::InvalidNodeDelay)?;

        let scheduler = SubsequenceScheduler::new(&config, P::ROLE);
        if let NextTick::After(delay_us) = scheduler.start() {
            timer.schedule_once(delay_us);
        }

        Ok(Node {
            role,
            radio,
            timer,
            fault,
            events,
            scheduler,
            config,
            delay,
            seq: Wrapping(0),
            radio_ready: false,
        })
    }

    /// Processes the next event
    ///
    /// Returns `nb::Error::WouldBlock`, if no event is queued. Errors only
    /// affect the exchange in progress; keep polling after them.
    pub fn poll(&mut self) -> nb::Result<Outcome, Error<R, LED>> {
        let event = match self.events.dequeue() {
            Some(event) => event,
            None => return Err(nb::Error::WouldBlock),
        };
        trace!("Event: {:?}", event);

        let result = match event {
            Event::Tick => self.tick(),
            Event::Radio(event) => {
                if !self.radio_ready {
                    return Ok(Outcome::Idle);
                }
                self.dispatch(|role, ctx| role.on_radio_event(ctx, event))
            }
        };

        result.map_err(nb::Error::Other)
    }

    /// The role this node runs
    pub fn role(&self) -> &P {
        &self.role
    }

    /// The active subsequence
    pub fn subsequence(&self) -> Subsequence {
        self.scheduler.current()
    }

    /// Whether the last radio initialization succeeded
    pub fn radio_ready(&self) -> bool {
        self.radio_ready
    }

    /// Returns the parts this node was created from
    pub fn free(self) -> (P, R, T, LED) {
        (self.role, self.radio, self.timer, self.fault)
    }

    fn tick(&mut self) -> Result<Outcome, Error<R, LED>> {
        let advance = self.scheduler.advance();

        let mut init = Ok(());
        let mut indicator = Ok(());
        if advance.wrapped {
            init = self.reinit();
            indicator = self.update_fault_indicator();
        }

        // A radio that failed to initialize can't hear the tag, so don't wait
        // for it. Wrap around again after the sequence wait.
        let next_tick = match advance.next_tick {
            NextTick::Suspended if !self.radio_ready => self.scheduler.rewind(),
            next_tick => next_tick,
        };
        if let NextTick::After(delay_us) = next_tick {
            self.timer.schedule_once(delay_us);
        }

        if let Err(err) = init {
            if let Err(led_err) = indicator {
                warn!("Fault indicator not set: {:?}", led_err);
            }
            return Err(Error::Init(err));
        }
        if !self.radio_ready {
            return Ok(Outcome::Idle);
        }

        let subsequence = advance.subsequence;
        let outcome = match self.configure(subsequence) {
            Ok(()) => self.dispatch(|role, ctx| role.on_tick(ctx, subsequence)),
            Err(error) => Err(error),
        };

        // The indicator is not part of the radio path. Report its failure only
        // once the subsequence has been handled.
        match indicator {
            Ok(()) => outcome,
            Err(err) => {
                warn!("Fault indicator not cleared: {:?}", err);
                outcome.and(Err(Error::Indicator(err)))
            }
        }
    }

    fn reinit(&mut self) -> Result<(), R::Error> {
        let result = self.radio.init(&self.config.radio);
        self.radio_ready = result.is_ok();

        if self.radio_ready {
            info!("Radio initialized");
        } else {
            error!("Radio initialization failed, retrying with the next sequence");
        }

        result
    }

    fn update_fault_indicator(&mut self) -> Result<(), LED::Error> {
        if self.radio_ready {
            self.fault.set_low()
        } else {
            self.fault.set_high()
        }
    }

    fn configure(&mut self, subsequence: Subsequence) -> Result<(), Error<R, LED>> {
        let channel = subsequence.channel();
        let radio_config = self.config.radio.with_channel(channel);
        let tx_rf = TxRfConfig::for_channel(channel, radio_config.pulse_repetition_frequency);
        let antenna = subsequence.antenna(P::ROLE);

        self.radio
            .configure(&radio_config, &tx_rf, self.config.antenna_delay)
            .map_err(Error::<R, LED>::Radio)?;
        self.radio
            .select_antenna(antenna)
            .map_err(Error::<R, LED>::Radio)?;

        debug!(
            "Subsequence {}: channel {}, antenna {}",
            subsequence.index(),
            channel.number(),
            antenna.index()
        );

        Ok(())
    }

    fn dispatch<F>(&mut self, f: F) -> Result<Outcome, Error<R, LED>>
    where
        F: FnOnce(&mut P, &mut Context<R, T, LED>) -> Result<Outcome, Error<R, LED>>,
    {
        let Node {
            role,
            radio,
            timer,
            scheduler,
            config,
            delay,
            seq,
            ..
        } = self;

        let mut ctx = Context {
            radio,
            timer,
            scheduler,
            config,
            delay: *delay,
            seq,
            indicator: PhantomData,
        };

        f(role, &mut ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    use embedded_hal_mock::eh1::{
        digital::{Mock as PinMock, State as PinState, Transaction as PinTransaction},
        MockError as PinError,
    };
    use heapless::spsc::{Producer, Queue};

    use crate::{
        configs::UwbChannel,
        engine::{Anchor, Tag},
        estimator::{DistanceHistogram, SPEED_OF_LIGHT},
        mock::{Call, MockError, MockRadio, MockTimer},
        packet::{
            AnchorFinal, Destination, Header, Packet, Payload, Poll, Response, ResponseTimes,
            TagFinal,
        },
        radio::{ResponseWindow, SendTime},
        subsequence::SUBSEQUENCE_COUNT,
        time::{DelayedTxTime, Instant, TIME_UNIT_SECONDS},
    };
    use ieee802154::mac::{ExtendedAddress, PanId};

    type TestNode<'q, P> = Node<'q, P, MockRadio, MockTimer, PinMock, 8>;
    type TestError = Error<MockRadio, PinMock>;

    fn step<P: RangingRole>(
        node: &mut TestNode<P>,
        producer: &mut Producer<Event, 8>,
        event: Event,
    ) -> Result<Outcome, TestError> {
        producer.enqueue(event).unwrap();
        match node.poll() {
            Ok(outcome) => Ok(outcome),
            Err(nb::Error::Other(error)) => Err(error),
            Err(nb::Error::WouldBlock) => panic!("Event was not processed"),
        }
    }

    fn tick<P: RangingRole>(node: &mut TestNode<P>, producer: &mut Producer<Event, 8>) -> Outcome {
        step(node, producer, Event::Tick).unwrap()
    }

    fn radio_event(event: RadioEvent) -> Event {
        Event::Radio(event)
    }

    fn led_initialized_once() -> PinMock {
        PinMock::new(&[PinTransaction::set(PinState::Low)])
    }

    fn anchor_frame(anchor_id: u8, payload: Payload) -> Packet {
        Packet {
            header: Header {
                seq: 0,
                pan_id: PanId(0xD100),
                destination: Destination::Extended(ExtendedAddress(0)),
                source: ExtendedAddress(anchor_id as u64),
            },
            payload,
        }
    }

    /// Runs a POLL and FINAL with a tag about 10 m away
    ///
    /// Returns the outcome of the FINAL.
    fn exchange(
        node: &mut TestNode<Anchor>,
        producer: &mut Producer<Event, 8>,
        subsequence: u8,
    ) -> Result<Outcome, TestError> {
        let delay = NodeDelay::from_micros(5000).unwrap();
        let anchor_id = node.config.node_id;
        let tof = 2132;

        let poll_tx = DelayedTxTime::new(0x0100_0000);
        let final_tx = DelayedTxTime::new(0x0100_0000 + 3 * delay.value());
        let poll_rx = Instant::new(0x20_0000_0037).unwrap();
        let response_tx = delay.after(poll_rx.upper32(), anchor_id as u32);

        let event = node.radio.deliver(
            &tag_frame(Payload::Poll(Poll {
                subsequence,
                tx_time: poll_tx,
            })),
            poll_rx,
        );
        assert!(matches!(
            step(node, producer, radio_event(event))?,
            Outcome::ResponseSent { .. }
        ));
        step(node, producer, radio_event(RadioEvent::TxDone))?;

        let reply = response_tx.instant().duration_since(poll_rx);
        let response_rx = Instant::new(poll_tx.instant().value() + reply.value() + 2 * tof).unwrap();
        let final_rx = poll_rx + final_tx.instant().duration_since(poll_tx.instant());

        let mut response_rx_times = ResponseTimes::new(node.config.num_anchors as usize);
        response_rx_times.record(anchor_id, response_rx);
        let event = node.radio.deliver(
            &tag_frame(Payload::TagFinal(TagFinal {
                subsequence,
                poll_tx_time: poll_tx,
                final_tx_time: final_tx,
                response_rx_times,
            })),
            final_rx,
        );
        step(node, producer, radio_event(event))
    }

    fn tag_frame(payload: Payload) -> Packet {
        Packet {
            header: Header {
                seq: 0,
                pan_id: PanId(0xD100),
                destination: Destination::broadcast(),
                source: ExtendedAddress(0),
            },
            payload,
        }
    }

    #[test]
    fn poll_without_events_would_block() {
        let mut queue: Queue<Event, 8> = Queue::new();
        let (_, consumer) = queue.split();
        let mut node: TestNode<Tag> = Node::new(
            Tag::new(),
            RangingConfig::default(),
            MockRadio::new(),
            MockTimer::new(),
            PinMock::new(&[]),
            consumer,
        )
        .unwrap();

        assert!(matches!(node.poll(), Err(nb::Error::WouldBlock)));

        let (_, _, timer, mut fault) = node.free();
        assert_eq!(timer.scheduled, [1_000_000]);
        fault.done();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut queue: Queue<Event, 8> = Queue::new();
        let (_, consumer) = queue.split();
        let mut fault = PinMock::new(&[]);

        let result: Result<TestNode<Anchor>, _> = Node::new(
            Anchor::new(&RangingConfig::anchor(0)),
            RangingConfig::anchor(0),
            MockRadio::new(),
            MockTimer::new(),
            fault.clone(),
            consumer,
        );

        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::AnchorIdOutOfRange { anchor_id: 0, .. }))
        ));
        fault.done();
    }

    #[test]
    fn failed_reinit_sets_fault_until_next_successful_one() {
        let mut queue: Queue<Event, 8> = Queue::new();
        let (mut producer, consumer) = queue.split();

        let mut radio = MockRadio::new();
        radio.init_results.push_back(Err(MockError));
        radio.init_results.push_back(Ok(()));
        let fault = PinMock::new(&[
            PinTransaction::set(PinState::High),
            PinTransaction::set(PinState::Low),
        ]);

        let mut node: TestNode<Tag> = Node::new(
            Tag::new(),
            RangingConfig::default(),
            radio,
            MockTimer::new(),
            fault,
            consumer,
        )
        .unwrap();

        // The first tick wraps around from the idle slot and fails.
        let result = step(&mut node, &mut producer, Event::Tick);
        assert!(matches!(result, Err(Error::Init(MockError))));
        assert_eq!(node.subsequence(), Subsequence::FIRST);
        assert!(!node.radio_ready());

        // Without a radio, the rest of the sequence passes quietly.
        for _ in 1..=SUBSEQUENCE_COUNT {
            assert_eq!(tick(&mut node, &mut producer), Outcome::Idle);
        }
        assert_eq!(node.subsequence(), Subsequence::IDLE);
        assert_eq!(node.timer.scheduled.last(), Some(&1_000_000));
        assert_eq!(node.radio.calls, [Call::Init]);

        // Radio events are ignored while the radio is down.
        assert_eq!(
            step(&mut node, &mut producer, radio_event(RadioEvent::RxTimeout)).unwrap(),
            Outcome::Idle
        );

        // The next wraparound recovers.
        match tick(&mut node, &mut producer) {
            Outcome::PollSent { subsequence, .. } => assert_eq!(subsequence, Subsequence::FIRST),
            outcome => panic!("Unexpected outcome: {:?}", outcome),
        }
        assert!(node.radio_ready());

        let (_, radio, _, mut fault) = node.free();
        assert_eq!(radio.init_count(), 2);
        fault.done();
    }

    #[test]
    fn tick_configures_channel_and_antenna() {
        let mut queue: Queue<Event, 8> = Queue::new();
        let (mut producer, consumer) = queue.split();
        let config = RangingConfig {
            antenna_delay: 16_450,
            ..RangingConfig::anchor(1)
        };
        let mut node: TestNode<Anchor> = Node::new(
            Anchor::new(&config),
            config,
            MockRadio::new(),
            MockTimer::new(),
            led_initialized_once(),
            consumer,
        )
        .unwrap();

        // Subsequences 0 to 13
        for _ in 0..14 {
            tick(&mut node, &mut producer);
        }
        assert_eq!(node.subsequence().index(), 13);

        let calls = &node.radio.calls;
        let configure = calls
            .iter()
            .rev()
            .find(|call| matches!(call, Call::Configure { .. }))
            .unwrap();
        assert_eq!(
            configure,
            &Call::Configure {
                channel: UwbChannel::Channel4,
                antenna_delay: 16_450,
            }
        );
        let antenna = calls
            .iter()
            .rev()
            .find_map(|call| match call {
                Call::SelectAntenna(antenna) => Some(antenna.index()),
                _ => None,
            })
            .unwrap();
        assert_eq!(antenna, 13 % 3);
        assert_eq!(calls.last(), Some(&Call::Receive(0)));

        let (_, _, _, mut fault) = node.free();
        fault.done();
    }

    #[test]
    fn tag_collects_responses_from_both_anchors() {
        let mut queue: Queue<Event, 8> = Queue::new();
        let (mut producer, consumer) = queue.split();
        let config = RangingConfig {
            antenna_delay: 16_450,
            ..Default::default()
        };

        let mut node: TestNode<Tag> = Node::new(
            Tag::new(),
            config,
            MockRadio::new(),
            MockTimer::new(),
            led_initialized_once(),
            consumer,
        )
        .unwrap();

        // Subsequences 0 to 4
        for _ in 0..5 {
            tick(&mut node, &mut producer);
        }

        node.radio.now_hi32 = 0x1000_0000;
        let tx_time = match tick(&mut node, &mut producer) {
            Outcome::PollSent {
                subsequence,
                tx_time,
            } => {
                assert_eq!(subsequence.index(), 5);
                tx_time
            }
            outcome => panic!("Unexpected outcome: {:?}", outcome),
        };
        assert_eq!(tx_time, DelayedTxTime::new(0x1000_0000 + 1_248_000));

        let (poll, send_time, response) = node.radio.last_sent().unwrap();
        assert_eq!(
            poll.payload,
            Payload::Poll(Poll {
                subsequence: 5,
                tx_time
            })
        );
        assert_eq!(send_time, SendTime::Delayed(tx_time));
        assert_eq!(
            response,
            Some(ResponseWindow {
                rx_after_tx_us: 0,
                timeout_us: 10_000,
            })
        );
        assert_eq!(node.radio.calls.last(), Some(&Call::SetTxAntennaDelay(16_450)));

        // Anchor 2 answers first. The window shrinks to the slack.
        let t2 = Instant::new(0x10_0040_0000).unwrap();
        let event = node.radio.deliver(
            &anchor_frame(2, Payload::Response(Response { anchor_id: 2 })),
            t2,
        );
        assert_eq!(
            step(&mut node, &mut producer, radio_event(event)).unwrap(),
            Outcome::ResponseRecorded {
                anchor_id: 2,
                rx_time: t2
            }
        );
        assert_eq!(node.radio.calls.last(), Some(&Call::Receive(1000)));

        let t1 = Instant::new(0x10_0020_0000).unwrap();
        let event = node.radio.deliver(
            &anchor_frame(1, Payload::Response(Response { anchor_id: 1 })),
            t1,
        );
        assert_eq!(
            step(&mut node, &mut producer, radio_event(event)).unwrap(),
            Outcome::ResponseRecorded {
                anchor_id: 1,
                rx_time: t1
            }
        );
        assert_eq!(node.radio.calls.last(), Some(&Call::Receive(6000)));

        node.radio.now_hi32 = 0x1010_0000;
        assert_eq!(
            step(&mut node, &mut producer, radio_event(RadioEvent::RxTimeout)).unwrap(),
            Outcome::FinalSent {
                subsequence: Subsequence::new(5).unwrap(),
                responses: 2,
            }
        );

        let (fin, send_time, response) = node.radio.last_sent().unwrap();
        let fin = match fin.payload {
            Payload::TagFinal(fin) => fin,
            payload => panic!("Unexpected payload: {:?}", payload),
        };
        assert_eq!(fin.subsequence, 5);
        assert_eq!(fin.poll_tx_time, tx_time);
        assert_eq!(fin.final_tx_time, DelayedTxTime::new(0x1010_0000 + 1_248_000));
        assert_eq!(fin.response_rx_times.get(1), Some(t1));
        assert_eq!(fin.response_rx_times.get(2), Some(t2));
        assert_eq!(send_time, SendTime::Delayed(fin.final_tx_time));
        assert_eq!(response, None);

        let (_, _, _, mut fault) = node.free();
        fault.done();
    }

    #[test]
    fn tag_discards_bad_frames_and_keeps_listening() {
        let mut queue: Queue<Event, 8> = Queue::new();
        let (mut producer, consumer) = queue.split();
        let mut node: TestNode<Tag> = Node::new(
            Tag::new(),
            RangingConfig::default(),
            MockRadio::new(),
            MockTimer::new(),
            led_initialized_once(),
            consumer,
        )
        .unwrap();

        tick(&mut node, &mut producer);

        let mut garbage = [0u8; 25];
        garbage[0] = 0x41;
        garbage[1] = 0xCC;
        garbage[21] = 0x42;
        let event = node.radio.deliver_raw(&garbage, Instant::new(1).unwrap());
        assert!(matches!(
            step(&mut node, &mut producer, radio_event(event)),
            Err(Error::Packet(crate::packet::Error::InvalidMessageType(0x42)))
        ));
        assert_eq!(node.radio.calls.last(), Some(&Call::Receive(10_000)));

        let event = node.radio.deliver(
            &anchor_frame(0, Payload::Response(Response { anchor_id: 0 })),
            Instant::new(2).unwrap(),
        );
        assert!(matches!(
            step(&mut node, &mut producer, radio_event(event)),
            Err(Error::UnknownAnchor(0))
        ));
        assert_eq!(node.radio.calls.last(), Some(&Call::Receive(10_000)));

        // The timeout still completes the exchange, without any responses.
        assert!(matches!(
            step(&mut node, &mut producer, radio_event(RadioEvent::RxTimeout)),
            Ok(Outcome::FinalSent { responses: 0, .. })
        ));

        let (_, _, _, mut fault) = node.free();
        fault.done();
    }

    #[test]
    fn rejected_transmission_is_reported_and_next_tick_proceeds() {
        let mut queue: Queue<Event, 8> = Queue::new();
        let (mut producer, consumer) = queue.split();
        let mut node: TestNode<Tag> = Node::new(
            Tag::new(),
            RangingConfig::default(),
            MockRadio::new(),
            MockTimer::new(),
            led_initialized_once(),
            consumer,
        )
        .unwrap();

        node.radio.fail_send = true;
        assert!(matches!(
            step(&mut node, &mut producer, Event::Tick),
            Err(Error::Transmit(MockError))
        ));
        assert_eq!(node.timer.scheduled.last(), Some(&65_000));

        // A late timeout doesn't produce a FINAL for the abandoned exchange.
        assert_eq!(
            step(&mut node, &mut producer, radio_event(RadioEvent::RxTimeout)).unwrap(),
            Outcome::Idle
        );

        node.radio.fail_send = false;
        assert!(matches!(
            tick(&mut node, &mut producer),
            Outcome::PollSent { .. }
        ));

        let (_, _, _, mut fault) = node.free();
        fault.done();
    }

    #[test]
    fn tag_waits_a_sequence_after_idle_and_collects_reports() {
        let mut queue: Queue<Event, 8> = Queue::new();
        let (mut producer, consumer) = queue.split();
        let mut node: TestNode<Tag> = Node::new(
            Tag::new(),
            RangingConfig::default(),
            MockRadio::new(),
            MockTimer::new(),
            led_initialized_once(),
            consumer,
        )
        .unwrap();

        for _ in 0..SUBSEQUENCE_COUNT {
            tick(&mut node, &mut producer);
        }
        assert_eq!(node.subsequence(), Subsequence::LAST_ACTIVE);
        assert_eq!(node.timer.scheduled.last(), Some(&(5 * 65_000)));

        assert_eq!(tick(&mut node, &mut producer), Outcome::Listening);
        assert_eq!(node.subsequence(), Subsequence::IDLE);
        assert_eq!(node.timer.scheduled.last(), Some(&1_000_000));
        assert_eq!(node.radio.calls.last(), Some(&Call::Receive(0)));

        let mut distances = DistanceHistogram::new();
        distances.set(3, 2.5);
        let event = node.radio.deliver(
            &anchor_frame(
                1,
                Payload::AnchorFinal(AnchorFinal {
                    anchor_id: 1,
                    distances: distances.clone(),
                }),
            ),
            Instant::new(5).unwrap(),
        );
        assert_eq!(
            step(&mut node, &mut producer, radio_event(event)).unwrap(),
            Outcome::ReportReceived { anchor_id: 1 }
        );
        assert_eq!(node.role().report(1), Some(&distances));
        assert_eq!(node.role().report(2), None);
        assert_eq!(node.radio.calls.last(), Some(&Call::Receive(0)));

        let (_, _, _, mut fault) = node.free();
        fault.done();
    }

    #[test]
    fn anchor_restarts_schedule_on_first_poll() {
        let mut queue: Queue<Event, 8> = Queue::new();
        let (mut producer, consumer) = queue.split();
        let mut node: TestNode<Anchor> = Node::new(
            Anchor::new(&RangingConfig::anchor(1)),
            RangingConfig::anchor(1),
            MockRadio::new(),
            MockTimer::new(),
            led_initialized_once(),
            consumer,
        )
        .unwrap();

        for _ in 0..4 {
            assert_eq!(tick(&mut node, &mut producer), Outcome::Listening);
        }
        assert_eq!(node.subsequence().index(), 3);

        let poll_rx = Instant::new(0x00_1234_5678).unwrap();
        let event = node.radio.deliver(
            &tag_frame(Payload::Poll(Poll {
                subsequence: 0,
                tx_time: DelayedTxTime::new(0x10),
            })),
            poll_rx,
        );
        let expected_tx = DelayedTxTime::new(0x0012_3456 + 1_248_000);
        assert_eq!(
            step(&mut node, &mut producer, radio_event(event)).unwrap(),
            Outcome::ResponseSent {
                subsequence: Subsequence::FIRST,
                tx_time: expected_tx,
            }
        );
        assert_eq!(node.subsequence(), Subsequence::FIRST);
        assert_eq!(node.timer.scheduled.last(), Some(&(65_000 - 9_869)));

        let (response, send_time, window) = node.radio.last_sent().unwrap();
        assert_eq!(response.payload, Payload::Response(Response { anchor_id: 1 }));
        assert_eq!(
            response.header.destination,
            Destination::Extended(ExtendedAddress(0))
        );
        assert_eq!(send_time, SendTime::Delayed(expected_tx));
        assert_eq!(
            window,
            Some(ResponseWindow {
                rx_after_tx_us: 1000,
                timeout_us: 0,
            })
        );

        let (_, _, _, mut fault) = node.free();
        fault.done();
    }

    #[test]
    fn anchor_measures_distance_and_reports_sequence() {
        let mut queue: Queue<Event, 8> = Queue::new();
        let (mut producer, consumer) = queue.split();
        let config = RangingConfig {
            apply_range_bias: false,
            calibration_offset_m: 0.0,
            ..RangingConfig::anchor(2)
        };
        let mut node: TestNode<Anchor> = Node::new(
            Anchor::new(&config),
            config,
            MockRadio::new(),
            MockTimer::new(),
            led_initialized_once(),
            consumer,
        )
        .unwrap();
        let delay = NodeDelay::from_micros(5000).unwrap();

        assert_eq!(tick(&mut node, &mut producer), Outcome::Listening);

        // The tag's clock
        let poll_tx = DelayedTxTime::new(0x0100_0000);
        let final_tx = DelayedTxTime::new(0x0100_0000 + 3 * delay.value());
        // The anchor's clock
        let poll_rx = Instant::new(0x20_0000_0037).unwrap();
        let response_tx = delay.after(poll_rx.upper32(), 2);
        // About 10 m
        let tof = 2132;

        let event = node.radio.deliver(
            &tag_frame(Payload::Poll(Poll {
                subsequence: 0,
                tx_time: poll_tx,
            })),
            poll_rx,
        );
        assert_eq!(
            step(&mut node, &mut producer, radio_event(event)).unwrap(),
            Outcome::ResponseSent {
                subsequence: Subsequence::FIRST,
                tx_time: response_tx,
            }
        );
        assert_eq!(
            step(&mut node, &mut producer, radio_event(RadioEvent::TxDone)).unwrap(),
            Outcome::Idle
        );

        let reply = response_tx.instant().duration_since(poll_rx);
        let response_rx = Instant::new(poll_tx.instant().value() + reply.value() + 2 * tof).unwrap();
        let final_delay = final_tx.instant().duration_since(poll_tx.instant());
        let final_rx = poll_rx + final_delay;

        let mut response_rx_times = ResponseTimes::new(2);
        response_rx_times.record(2, response_rx);
        let event = node.radio.deliver(
            &tag_frame(Payload::TagFinal(TagFinal {
                subsequence: 0,
                poll_tx_time: poll_tx,
                final_tx_time: final_tx,
                response_rx_times,
            })),
            final_rx,
        );

        let expected = tof as f64 * TIME_UNIT_SECONDS * SPEED_OF_LIGHT;
        match step(&mut node, &mut producer, radio_event(event)).unwrap() {
            Outcome::DistanceMeasured {
                subsequence,
                distance_m,
            } => {
                assert_eq!(subsequence, Subsequence::FIRST);
                assert!((distance_m - expected).abs() < 1e-3);
            }
            outcome => panic!("Unexpected outcome: {:?}", outcome),
        }
        assert_eq!(node.radio.calls.last(), Some(&Call::Receive(0)));

        // A second FINAL has no exchange to belong to.
        let event = node.radio.deliver_again(final_rx);
        assert!(matches!(
            step(&mut node, &mut producer, radio_event(event)),
            Err(Error::IncompleteExchange)
        ));

        // Run through the rest of the sequence.
        for _ in 1..SUBSEQUENCE_COUNT {
            assert_eq!(tick(&mut node, &mut producer), Outcome::Listening);
        }
        assert_eq!(node.timer.scheduled.last(), Some(&(5 * 65_000)));

        node.radio.now_hi32 = 0x4000_0000;
        assert_eq!(tick(&mut node, &mut producer), Outcome::ReportSent);
        assert_eq!(node.subsequence(), Subsequence::IDLE);
        // Wraps around one last slot later
        assert_eq!(node.timer.scheduled.last(), Some(&(5 * 65_000)));

        let (report, send_time, _) = node.radio.last_sent().unwrap();
        let report = match report.payload {
            Payload::AnchorFinal(report) => report,
            payload => panic!("Unexpected payload: {:?}", payload),
        };
        assert_eq!(report.anchor_id, 2);
        assert!((report.distances.get(0).unwrap() as f64 - expected).abs() < 1e-3);
        assert_eq!(report.distances.get(1), Some(0.0));
        assert_eq!(send_time, SendTime::Delayed(delay.after(0x4000_0000, 2)));
        assert!(node.radio.calls.contains(&Call::ForceIdle));

        assert_eq!(
            step(&mut node, &mut producer, radio_event(RadioEvent::TxDone)).unwrap(),
            Outcome::Listening
        );
        assert_eq!(node.radio.calls.last(), Some(&Call::Receive(0)));

        let (_, _, _, mut fault) = node.free();
        fault.done();
    }

    #[test]
    fn degenerate_exchange_leaves_histogram_untouched() {
        let mut queue: Queue<Event, 8> = Queue::new();
        let (mut producer, consumer) = queue.split();
        let config = RangingConfig::anchor(1);
        let mut node: TestNode<Anchor> = Node::new(
            Anchor::new(&config),
            config,
            MockRadio::new(),
            MockTimer::new(),
            led_initialized_once(),
            consumer,
        )
        .unwrap();

        tick(&mut node, &mut producer);

        let poll_rx = Instant::new(0x20_0000_0000).unwrap();
        let event = node.radio.deliver(
            &tag_frame(Payload::Poll(Poll {
                subsequence: 0,
                tx_time: DelayedTxTime::new(0x0100_0000),
            })),
            poll_rx,
        );
        step(&mut node, &mut producer, radio_event(event)).unwrap();

        // The FINAL claims to have been sent before the RESPONSE arrived.
        let mut response_rx_times = ResponseTimes::new(2);
        response_rx_times.record(1, Instant::new(0x01_8000_0000).unwrap());
        let event = node.radio.deliver(
            &tag_frame(Payload::TagFinal(TagFinal {
                subsequence: 0,
                poll_tx_time: DelayedTxTime::new(0x0100_0000),
                final_tx_time: DelayedTxTime::new(0x0100_0100),
                response_rx_times,
            })),
            Instant::new(0x20_4000_0000).unwrap(),
        );

        assert!(matches!(
            step(&mut node, &mut producer, radio_event(event)),
            Err(Error::Estimate(crate::estimator::EstimateError::DegenerateGeometry { .. }))
        ));
        assert_eq!(node.role().histogram(), &DistanceHistogram::new());
        assert_eq!(node.radio.calls.last(), Some(&Call::Receive(0)));

        let (_, _, _, mut fault) = node.free();
        fault.done();
    }

    #[test]
    fn failed_anchor_reinit_is_retried_after_sequence_wait() {
        let mut queue: Queue<Event, 8> = Queue::new();
        let (mut producer, consumer) = queue.split();

        let mut radio = MockRadio::new();
        radio.init_results.push_back(Err(MockError));
        radio.init_results.push_back(Ok(()));
        let fault = PinMock::new(&[
            PinTransaction::set(PinState::High),
            PinTransaction::set(PinState::Low),
        ]);

        let mut node: TestNode<Anchor> = Node::new(
            Anchor::new(&RangingConfig::anchor(1)),
            RangingConfig::anchor(1),
            radio,
            MockTimer::new(),
            fault,
            consumer,
        )
        .unwrap();

        let result = step(&mut node, &mut producer, Event::Tick);
        assert!(matches!(result, Err(Error::Init(MockError))));
        assert!(!node.radio_ready());

        // Back to the idle slot instead of waiting for a POLL it can't hear
        assert_eq!(node.subsequence(), Subsequence::IDLE);
        assert_eq!(node.timer.scheduled, [1_000_000, 1_000_000]);

        let event = node.radio.deliver(
            &tag_frame(Payload::Poll(Poll {
                subsequence: 0,
                tx_time: DelayedTxTime::new(0x10),
            })),
            Instant::new(1).unwrap(),
        );
        assert_eq!(
            step(&mut node, &mut producer, radio_event(event)).unwrap(),
            Outcome::Idle
        );
        assert_eq!(node.radio.calls, [Call::Init]);

        assert_eq!(tick(&mut node, &mut producer), Outcome::Listening);
        assert!(node.radio_ready());
        assert_eq!(node.subsequence(), Subsequence::FIRST);
        assert_eq!(node.timer.scheduled.len(), 2);
        assert_eq!(node.radio.calls.last(), Some(&Call::Receive(0)));

        let (_, radio, _, mut fault) = node.free();
        assert_eq!(radio.init_count(), 2);
        fault.done();
    }

    #[test]
    fn anchor_reinitializes_after_every_sequence() {
        let mut queue: Queue<Event, 8> = Queue::new();
        let (mut producer, consumer) = queue.split();
        let fault = PinMock::new(&[
            PinTransaction::set(PinState::Low),
            PinTransaction::set(PinState::Low),
        ]);
        let mut node: TestNode<Anchor> = Node::new(
            Anchor::new(&RangingConfig::anchor(1)),
            RangingConfig::anchor(1),
            MockRadio::new(),
            MockTimer::new(),
            fault,
            consumer,
        )
        .unwrap();

        // Initialized, then waiting for the tag
        assert_eq!(tick(&mut node, &mut producer), Outcome::Listening);
        assert_eq!(node.timer.scheduled, [1_000_000]);

        let event = node.radio.deliver(
            &tag_frame(Payload::Poll(Poll {
                subsequence: 0,
                tx_time: DelayedTxTime::new(0x10),
            })),
            Instant::new(0x00_1234_5678).unwrap(),
        );
        assert!(matches!(
            step(&mut node, &mut producer, radio_event(event)).unwrap(),
            Outcome::ResponseSent { .. }
        ));
        assert_eq!(node.timer.scheduled.last(), Some(&(65_000 - 9_869)));

        for _ in 1..SUBSEQUENCE_COUNT {
            assert_eq!(tick(&mut node, &mut producer), Outcome::Listening);
        }
        assert_eq!(tick(&mut node, &mut producer), Outcome::ReportSent);
        assert_eq!(node.timer.scheduled.last(), Some(&(5 * 65_000)));
        assert_eq!(
            step(&mut node, &mut producer, radio_event(RadioEvent::TxDone)).unwrap(),
            Outcome::Listening
        );

        let scheduled = node.timer.scheduled.len();
        assert_eq!(tick(&mut node, &mut producer), Outcome::Listening);
        assert_eq!(node.subsequence(), Subsequence::FIRST);
        assert_eq!(node.timer.scheduled.len(), scheduled);

        let (_, radio, _, mut fault) = node.free();
        assert_eq!(radio.init_count(), 2);
        fault.done();
    }

    #[test]
    fn first_poll_clears_distances_of_previous_sequence() {
        let mut queue: Queue<Event, 8> = Queue::new();
        let (mut producer, consumer) = queue.split();
        let config = RangingConfig {
            apply_range_bias: false,
            calibration_offset_m: 0.0,
            ..RangingConfig::anchor(1)
        };
        let mut node: TestNode<Anchor> = Node::new(
            Anchor::new(&config),
            config,
            MockRadio::new(),
            MockTimer::new(),
            led_initialized_once(),
            consumer,
        )
        .unwrap();

        tick(&mut node, &mut producer);
        assert!(matches!(
            exchange(&mut node, &mut producer, 0),
            Ok(Outcome::DistanceMeasured { .. })
        ));
        let first = node.role().histogram().get(0).unwrap();
        assert!(first > 9.0);

        // Later subsequences add to the histogram.
        tick(&mut node, &mut producer);
        assert!(matches!(
            exchange(&mut node, &mut producer, 1),
            Ok(Outcome::DistanceMeasured { .. })
        ));
        assert_eq!(node.role().histogram().get(0), Some(first));
        assert!(node.role().histogram().get(1).unwrap() > 9.0);

        // The tag starting over doesn't.
        let event = node.radio.deliver(
            &tag_frame(Payload::Poll(Poll {
                subsequence: 0,
                tx_time: DelayedTxTime::new(0x10),
            })),
            Instant::new(0x20_0000_0037).unwrap(),
        );
        step(&mut node, &mut producer, radio_event(event)).unwrap();
        assert_eq!(node.role().histogram(), &DistanceHistogram::new());

        let (_, _, _, mut fault) = node.free();
        fault.done();
    }

    #[test]
    fn indicator_failure_doesnt_cost_the_first_subsequence() {
        let mut queue: Queue<Event, 8> = Queue::new();
        let (mut producer, consumer) = queue.split();
        let fault = PinMock::new(&[PinTransaction::set(PinState::Low)
            .with_error(PinError::Io(ErrorKind::NotConnected))]);
        let mut node: TestNode<Tag> = Node::new(
            Tag::new(),
            RangingConfig::default(),
            MockRadio::new(),
            MockTimer::new(),
            fault,
            consumer,
        )
        .unwrap();

        assert!(matches!(
            step(&mut node, &mut producer, Event::Tick),
            Err(Error::Indicator(_))
        ));
        assert!(node.radio_ready());
        assert!(node
            .radio
            .calls
            .iter()
            .any(|call| matches!(call, Call::Configure { .. })));

        let (poll, _, _) = node.radio.last_sent().unwrap();
        assert!(matches!(
            poll.payload,
            Payload::Poll(Poll { subsequence: 0, .. })
        ));

        assert!(matches!(
            tick(&mut node, &mut producer),
            Outcome::PollSent { .. }
        ));

        let (_, _, _, mut fault) = node.free();
        fault.done();
    }
}
