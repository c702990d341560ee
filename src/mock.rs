//! Radio and timer doubles that record every call

use std::{collections::VecDeque, vec::Vec};

use crate::{
    configs::{RadioConfig, TxRfConfig, UwbChannel},
    packet::{Packet, MAX_FRAME_LEN},
    radio::{Radio, RadioEvent, ResponseWindow, SendTime, Timer},
    subsequence::Antenna,
    time::Instant,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MockError;

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Init,
    Configure { channel: UwbChannel, antenna_delay: u16 },
    SelectAntenna(Antenna),
    SetTxAntennaDelay(u16),
    ForceIdle,
    Send {
        frame: Vec<u8>,
        send_time: SendTime,
        response: Option<ResponseWindow>,
    },
    Receive(u32),
    ReadFrame,
    RxTimestamp,
    SystemTime,
}

pub struct MockRadio {
    pub calls: Vec<Call>,
    /// Results of the next `init` calls; success once exhausted
    pub init_results: VecDeque<Result<(), MockError>>,
    pub fail_send: bool,
    pub now_hi32: u32,
    rx_frame: Vec<u8>,
    rx_time: Instant,
}

impl MockRadio {
    pub fn new() -> Self {
        MockRadio {
            calls: Vec::new(),
            init_results: VecDeque::new(),
            fail_send: false,
            now_hi32: 0,
            rx_frame: Vec::new(),
            rx_time: Instant::from_upper32(0),
        }
    }

    /// Makes `packet` the received frame
    pub fn deliver(&mut self, packet: &Packet, rx_time: Instant) -> RadioEvent {
        let mut buffer = [0; MAX_FRAME_LEN];
        let len = packet.encode(&mut buffer).unwrap();
        self.deliver_raw(&buffer[..len], rx_time)
    }

    pub fn deliver_raw(&mut self, frame: &[u8], rx_time: Instant) -> RadioEvent {
        self.rx_frame = frame.to_vec();
        self.deliver_again(rx_time)
    }

    /// Receives the previous frame once more
    pub fn deliver_again(&mut self, rx_time: Instant) -> RadioEvent {
        self.rx_time = rx_time;
        RadioEvent::RxOk {
            len: self.rx_frame.len(),
        }
    }

    pub fn init_count(&self) -> usize {
        self.calls.iter().filter(|call| **call == Call::Init).count()
    }

    /// Decodes the last frame that was sent
    pub fn last_sent(&self) -> Option<(Packet, SendTime, Option<ResponseWindow>)> {
        self.calls.iter().rev().find_map(|call| match call {
            Call::Send {
                frame,
                send_time,
                response,
            } => Some((Packet::decode(frame).unwrap(), *send_time, *response)),
            _ => None,
        })
    }
}

impl Radio for MockRadio {
    type Error = MockError;

    fn init(&mut self, _: &RadioConfig) -> Result<(), Self::Error> {
        self.calls.push(Call::Init);
        self.init_results.pop_front().unwrap_or(Ok(()))
    }

    fn configure(
        &mut self,
        config: &RadioConfig,
        _: &TxRfConfig,
        antenna_delay: u16,
    ) -> Result<(), Self::Error> {
        self.calls.push(Call::Configure {
            channel: config.channel,
            antenna_delay,
        });
        Ok(())
    }

    fn select_antenna(&mut self, antenna: Antenna) -> Result<(), Self::Error> {
        self.calls.push(Call::SelectAntenna(antenna));
        Ok(())
    }

    fn set_tx_antenna_delay(&mut self, delay: u16) -> Result<(), Self::Error> {
        self.calls.push(Call::SetTxAntennaDelay(delay));
        Ok(())
    }

    fn force_idle(&mut self) -> Result<(), Self::Error> {
        self.calls.push(Call::ForceIdle);
        Ok(())
    }

    fn send(
        &mut self,
        frame: &[u8],
        send_time: SendTime,
        response: Option<ResponseWindow>,
    ) -> Result<(), Self::Error> {
        self.calls.push(Call::Send {
            frame: frame.to_vec(),
            send_time,
            response,
        });

        if self.fail_send {
            Err(MockError)
        } else {
            Ok(())
        }
    }

    fn receive(&mut self, timeout_us: u32) -> Result<(), Self::Error> {
        self.calls.push(Call::Receive(timeout_us));
        Ok(())
    }

    fn read_frame(&mut self, buffer: &mut [u8]) -> Result<(), Self::Error> {
        self.calls.push(Call::ReadFrame);
        buffer.copy_from_slice(&self.rx_frame[..buffer.len()]);
        Ok(())
    }

    fn rx_timestamp(&mut self) -> Result<Instant, Self::Error> {
        self.calls.push(Call::RxTimestamp);
        Ok(self.rx_time)
    }

    fn system_time_hi32(&mut self) -> Result<u32, Self::Error> {
        self.calls.push(Call::SystemTime);
        Ok(self.now_hi32)
    }
}

pub struct MockTimer {
    pub scheduled: Vec<u32>,
}

impl MockTimer {
    pub fn new() -> Self {
        MockTimer {
            scheduled: Vec::new(),
        }
    }
}

impl Timer for MockTimer {
    fn schedule_once(&mut self, delay_us: u32) {
        self.scheduled.push(delay_us);
    }
}
