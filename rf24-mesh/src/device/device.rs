use embedded_hal::blocking::delay::DelayUs;
use std::fmt::Debug;

use crate::PipeAddress;

/// Transmission power of the power amplifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum PaLevel {
    Min,
    Low,
    High,
    Max,
}

/// Capabilities of an nRF24L01-class transceiver driver, as used by a [Node](crate::Node).
///
/// Hardware acknowledgments, retry timing and pipe filtering are left to the chip: the driver
/// only has to expose them. `Err` is reserved to driver faults (bus errors, missing chip...);
/// a frame that was not acknowledged is reported by [write](Transceiver::write) as `Ok(false)`.
pub trait Transceiver {
    type Error: Debug;

    /// Powers up and resets the chip.
    fn begin(&mut self) -> Result<(), Self::Error>;

    fn set_channel(&mut self, channel: u8) -> Result<(), Self::Error>;

    fn set_auto_ack(&mut self, enable: bool) -> Result<(), Self::Error>;

    /// Hardware auto-retry: `delay` in steps of 250µs, up to `count` retries.
    fn set_retries(&mut self, delay: u8, count: u8) -> Result<(), Self::Error>;

    fn set_payload_size(&mut self, size: u8) -> Result<(), Self::Error>;

    /// Binds reading pipe `pipe` (0 to 5) to `address`.
    fn open_reading_pipe(&mut self, pipe: u8, address: PipeAddress) -> Result<(), Self::Error>;

    fn open_writing_pipe(&mut self, address: PipeAddress) -> Result<(), Self::Error>;

    fn start_listening(&mut self) -> Result<(), Self::Error>;

    fn stop_listening(&mut self) -> Result<(), Self::Error>;

    /// Is there at least one unread frame in the receive FIFO?
    fn available(&mut self) -> Result<bool, Self::Error>;

    /// Pops the oldest frame of the receive FIFO into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Transmits `buf` on the writing pipe, returns whether it was acknowledged.
    fn write(&mut self, buf: &[u8]) -> Result<bool, Self::Error>;

    fn set_pa_level(&mut self, level: PaLevel) -> Result<(), Self::Error>;
}

/// Radio physical device representation: a transceiver able to wait a few microseconds.
pub trait Radio: Transceiver + DelayUs<u32> {}

impl<T: Transceiver + DelayUs<u32>> Radio for T {}
