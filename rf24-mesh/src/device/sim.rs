//! In-memory radio medium, to run nodes without hardware.
//!
//! Every [SimulatedRadio] created from the same [SimulatedAir] shares the medium. A transmitted
//! frame reaches the first other station listening on the same channel with a reading pipe bound
//! to the writing pipe address, as long as its receive FIFO (3 frames deep, like the chip) is not
//! full. Losses can be scheduled to exercise the retry and duplicate-suppression paths.
//!
//! ```rust
//! use rf24_mesh::device::sim::SimulatedAir;
//! use rf24_mesh::{Node, NodeConfig, Packet};
//!
//! let air = SimulatedAir::new();
//! let mut a = Node::new(air.radio(), &NodeConfig { address: 1, ..Default::default() }).unwrap();
//! let mut b = Node::new(air.radio(), &NodeConfig { address: 2, ..Default::default() }).unwrap();
//!
//! let mut packet = Packet::new();
//! packet.set_address(2);
//! packet.add_payload(b"hi").unwrap();
//! a.write(&mut packet).unwrap();
//!
//! let received = b.read().unwrap().unwrap();
//! assert_eq!(received.address(), 1);
//! ```
use embedded_hal::blocking::delay::DelayUs;
use log::trace;
use ringbuf::{HeapRb, Rb};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::device::{PaLevel, Transceiver};
use crate::{PipeAddress, MAX_CHANNEL};

const RX_FIFO_DEPTH: usize = 3;
const READING_PIPES: usize = 6;
const MAX_PAYLOAD_SIZE: u8 = 32;

/// A frame as it went through the air, kept for inspection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transmission {
    /// Station index of the emitter.
    pub station: usize,
    pub channel: u8,
    pub address: PipeAddress,
    pub frame: Vec<u8>,
    /// Station index of the receiver, if any station caught the frame.
    pub delivered_to: Option<usize>,
    pub acknowledged: bool,
}

struct Station {
    started: bool,
    channel: u8,
    listening: bool,
    auto_ack: bool,
    retries: (u8, u8),
    payload_size: u8,
    pa_level: Option<PaLevel>,
    reading_pipes: [Option<PipeAddress>; READING_PIPES],
    rx_fifo: HeapRb<Vec<u8>>,
}

impl Station {
    fn new() -> Self {
        Station {
            started: false,
            channel: 76,
            listening: false,
            auto_ack: false,
            retries: (0, 0),
            payload_size: MAX_PAYLOAD_SIZE,
            pa_level: None,
            reading_pipes: [None; READING_PIPES],
            rx_fifo: HeapRb::new(RX_FIFO_DEPTH),
        }
    }

    fn catches(&self, channel: u8, address: PipeAddress) -> bool {
        self.started
            && self.listening
            && self.channel == channel
            && self.reading_pipes.contains(&Some(address))
            && self.rx_fifo.len() < RX_FIFO_DEPTH
    }
}

#[derive(Default)]
struct Air {
    stations: Vec<Station>,
    lost_frames: usize,
    lost_acks: usize,
    history: Vec<Transmission>,
}

/// Shared radio medium. Cloning gives another handle on the same medium.
#[derive(Clone, Default)]
pub struct SimulatedAir {
    inner: Arc<Mutex<Air>>,
}

impl SimulatedAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new station to the medium and returns its transceiver.
    pub fn radio(&self) -> SimulatedRadio {
        let mut air = self.lock();
        air.stations.push(Station::new());
        SimulatedRadio {
            air: self.clone(),
            station: air.stations.len() - 1,
            writing_pipe: None,
            waited_us: 0,
        }
    }

    /// The next `n` transmitted frames vanish: nobody receives them and no acknowledgment comes
    /// back.
    pub fn lose_next_frames(&self, n: usize) {
        self.lock().lost_frames = n;
    }

    /// The next `n` delivered frames are not acknowledged: the receiver gets them but the
    /// emitter believes the transmission failed.
    pub fn lose_next_acks(&self, n: usize) {
        self.lock().lost_acks = n;
    }

    /// Every transmission attempt so far, oldest first.
    pub fn transmissions(&self) -> Vec<Transmission> {
        self.lock().history.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Air> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One station of a [SimulatedAir].
pub struct SimulatedRadio {
    air: SimulatedAir,
    station: usize,
    writing_pipe: Option<PipeAddress>,
    waited_us: u64,
}

impl SimulatedRadio {
    /// Index of this station on the air, as found in [Transmission].
    pub fn station(&self) -> usize {
        self.station
    }

    /// Pushes a raw frame in the receive FIFO, as if it was caught on air. Returns `false` if the
    /// FIFO is full.
    pub fn inject(&self, frame: &[u8]) -> bool {
        let mut air = self.air.lock();
        let station = &mut air.stations[self.station];
        let mut frame = frame.to_vec();
        frame.resize(station.payload_size as usize, 0);
        station.rx_fifo.push(frame).is_ok()
    }

    pub fn channel(&self) -> u8 {
        self.air.lock().stations[self.station].channel
    }

    pub fn is_listening(&self) -> bool {
        self.air.lock().stations[self.station].listening
    }

    pub fn auto_ack(&self) -> bool {
        self.air.lock().stations[self.station].auto_ack
    }

    /// Programmed `(delay, count)` of the hardware auto-retry.
    pub fn retries(&self) -> (u8, u8) {
        self.air.lock().stations[self.station].retries
    }

    pub fn payload_size(&self) -> u8 {
        self.air.lock().stations[self.station].payload_size
    }

    pub fn pa_level(&self) -> Option<PaLevel> {
        self.air.lock().stations[self.station].pa_level
    }

    pub fn reading_pipes(&self) -> [Option<PipeAddress>; READING_PIPES] {
        self.air.lock().stations[self.station].reading_pipes
    }

    pub fn writing_pipe(&self) -> Option<PipeAddress> {
        self.writing_pipe
    }

    /// Total of the delays requested through [DelayUs].
    pub fn waited_us(&self) -> u64 {
        self.waited_us
    }
}

impl Transceiver for SimulatedRadio {
    type Error = SimError;

    fn begin(&mut self) -> Result<(), SimError> {
        let mut air = self.air.lock();
        let station = &mut air.stations[self.station];
        *station = Station::new();
        station.started = true;
        self.writing_pipe = None;
        Ok(())
    }

    fn set_channel(&mut self, channel: u8) -> Result<(), SimError> {
        self.air.lock().stations[self.station].channel = channel.min(MAX_CHANNEL);
        Ok(())
    }

    fn set_auto_ack(&mut self, enable: bool) -> Result<(), SimError> {
        self.air.lock().stations[self.station].auto_ack = enable;
        Ok(())
    }

    fn set_retries(&mut self, delay: u8, count: u8) -> Result<(), SimError> {
        self.air.lock().stations[self.station].retries = (delay.min(15), count.min(15));
        Ok(())
    }

    fn set_payload_size(&mut self, size: u8) -> Result<(), SimError> {
        self.air.lock().stations[self.station].payload_size = size.clamp(1, MAX_PAYLOAD_SIZE);
        Ok(())
    }

    fn open_reading_pipe(&mut self, pipe: u8, address: PipeAddress) -> Result<(), SimError> {
        let mut air = self.air.lock();
        let slot = air.stations[self.station]
            .reading_pipes
            .get_mut(pipe as usize)
            .ok_or(SimError::InvalidPipe { pipe })?;
        *slot = Some(address);
        Ok(())
    }

    fn open_writing_pipe(&mut self, address: PipeAddress) -> Result<(), SimError> {
        self.writing_pipe = Some(address);
        Ok(())
    }

    fn start_listening(&mut self) -> Result<(), SimError> {
        let mut air = self.air.lock();
        let station = &mut air.stations[self.station];
        if !station.started {
            return Err(SimError::NotStarted);
        }
        station.listening = true;
        Ok(())
    }

    fn stop_listening(&mut self) -> Result<(), SimError> {
        self.air.lock().stations[self.station].listening = false;
        Ok(())
    }

    fn available(&mut self) -> Result<bool, SimError> {
        Ok(self.air.lock().stations[self.station].rx_fifo.len() > 0)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), SimError> {
        let mut air = self.air.lock();
        let station = &mut air.stations[self.station];
        if buf.len() > station.payload_size as usize {
            return Err(SimError::BufferTooLarge { size: buf.len() });
        }
        match station.rx_fifo.pop() {
            Some(frame) => {
                let n = buf.len().min(frame.len());
                buf[..n].copy_from_slice(&frame[..n]);
                buf[n..].fill(0);
            }
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<bool, SimError> {
        let address = self.writing_pipe.ok_or(SimError::NoWritingPipe)?;
        let mut air = self.air.lock();
        let (channel, auto_ack, payload_size) = {
            let station = &air.stations[self.station];
            if !station.started {
                return Err(SimError::NotStarted);
            }
            if station.listening {
                return Err(SimError::Listening);
            }
            (station.channel, station.auto_ack, station.payload_size)
        };
        let mut frame = buf.to_vec();
        frame.resize(payload_size as usize, 0);

        let mut delivered_to = None;
        if air.lost_frames > 0 {
            air.lost_frames -= 1;
            trace!("Station {}: frame lost on air.", self.station);
        } else {
            let me = self.station;
            delivered_to = air
                .stations
                .iter()
                .enumerate()
                .position(|(i, s)| i != me && s.catches(channel, address));
            if let Some(target) = delivered_to {
                let _ = air.stations[target].rx_fifo.push(frame.clone());
            }
        }
        let acknowledged = match delivered_to {
            _ if !auto_ack => true,
            Some(_) if air.lost_acks > 0 => {
                air.lost_acks -= 1;
                trace!("Station {}: acknowledgment lost on air.", self.station);
                false
            }
            Some(_) => true,
            None => false,
        };
        air.history.push(Transmission {
            station: self.station,
            channel,
            address,
            frame,
            delivered_to,
            acknowledged,
        });
        Ok(acknowledged)
    }

    fn set_pa_level(&mut self, level: PaLevel) -> Result<(), SimError> {
        self.air.lock().stations[self.station].pa_level = Some(level);
        Ok(())
    }
}

impl DelayUs<u32> for SimulatedRadio {
    fn delay_us(&mut self, us: u32) {
        self.waited_us += us as u64;
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("Radio was not started (begin not called).")]
    NotStarted,

    #[error("Cannot transmit while listening.")]
    Listening,

    #[error("No writing pipe opened.")]
    NoWritingPipe,

    #[error("Invalid reading pipe {} (max: {}).", .pipe, READING_PIPES - 1)]
    InvalidPipe { pipe: u8 },

    #[error("Read buffer is larger than the payload size (is: {}B).", .size)]
    BufferTooLarge { size: usize },
}
