//! Packet representation, as it is sent over the air.
//!
//! A frame is always [FRAME_SIZE] bytes long:
//!
//! | byte | content                                   |
//! |------|-------------------------------------------|
//! | 0    | node address (destination or source)      |
//! | 1    | sequence counter                          |
//! | 2..  | payload, zero-padded past the written data |
use std::fmt;

use crate::{NodeAddress, FRAME_SIZE, PAYLOAD_CAPACITY};

/// Packet exchanged between two nodes.
///
/// The address field changes meaning with the direction: set it to the destination before
/// handing the packet to [Node::write](crate::Node::write), read it as the source on a packet
/// returned by [Node::read](crate::Node::read).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    address: NodeAddress,
    counter: u8,
    payload: [u8; PAYLOAD_CAPACITY],
    /// Length of the last written payload. Only used for debug rendering, never transmitted.
    len: usize,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet {
    /// Constructs a blank (zeroed) packet.
    pub const fn new() -> Self {
        Packet {
            address: 0,
            counter: 0,
            payload: [0; PAYLOAD_CAPACITY],
            len: 0,
        }
    }

    pub fn set_address(&mut self, address: NodeAddress) {
        self.address = address;
    }

    pub fn address(&self) -> NodeAddress {
        self.address
    }

    /// Sets the sequence counter. The node stamps it on transmission, users have no reason to.
    pub fn set_counter(&mut self, counter: u8) {
        self.counter = counter;
    }

    pub fn counter(&self) -> u8 {
        self.counter
    }

    /// Raw payload buffer, including the zero padding.
    pub fn payload(&self) -> &[u8; PAYLOAD_CAPACITY] {
        &self.payload
    }

    /// Number of bytes written by the last [add_payload](Packet::add_payload), 0 when unknown
    /// (e.g. the packet was received).
    pub fn payload_len(&self) -> usize {
        self.len
    }

    /// Copies `data` at the start of the payload and zero-fills the rest of it.
    ///
    /// Fails without touching the packet if `data` does not fit in [PAYLOAD_CAPACITY] bytes.
    pub fn add_payload(&mut self, data: &[u8]) -> Result<(), FrameError> {
        if data.len() > PAYLOAD_CAPACITY {
            return Err(FrameError::PayloadTooLarge {
                size: data.len(),
                max: PAYLOAD_CAPACITY,
            });
        }
        self.payload[..data.len()].copy_from_slice(data);
        self.payload[data.len()..].fill(0);
        self.len = data.len();
        Ok(())
    }

    /// Fills `out` with the first `out.len()` bytes of the payload.
    ///
    /// The written length is not checked: reading past it yields the zero padding, reading less
    /// truncates. Fails without touching `out` if it is larger than [PAYLOAD_CAPACITY].
    pub fn read_payload(&self, out: &mut [u8]) -> Result<(), FrameError> {
        if out.len() > PAYLOAD_CAPACITY {
            return Err(FrameError::PayloadTooLarge {
                size: out.len(),
                max: PAYLOAD_CAPACITY,
            });
        }
        out.copy_from_slice(&self.payload[..out.len()]);
        Ok(())
    }

    /// Writes a typed value as payload. No type tag is stored, the receiver must know what to
    /// read back.
    pub fn add_value<V: PayloadValue>(&mut self, value: &V) -> Result<(), FrameError> {
        if V::SIZE > PAYLOAD_CAPACITY {
            return Err(FrameError::PayloadTooLarge {
                size: V::SIZE,
                max: PAYLOAD_CAPACITY,
            });
        }
        let mut raw = [0u8; PAYLOAD_CAPACITY];
        value.write_to(&mut raw[..V::SIZE]);
        self.add_payload(&raw[..V::SIZE])
    }

    /// Reads a typed value from the start of the payload.
    pub fn read_value<V: PayloadValue>(&self) -> Result<V, FrameError> {
        if V::SIZE > PAYLOAD_CAPACITY {
            return Err(FrameError::PayloadTooLarge {
                size: V::SIZE,
                max: PAYLOAD_CAPACITY,
            });
        }
        Ok(V::read_from(&self.payload[..V::SIZE]))
    }

    pub fn to_bytes(&self) -> [u8; FRAME_SIZE] {
        let mut bytes = [0u8; FRAME_SIZE];
        bytes[0] = self.address;
        bytes[1] = self.counter;
        bytes[2..].copy_from_slice(&self.payload);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != FRAME_SIZE {
            return Err(FrameError::InvalidLength { size: bytes.len() });
        }
        let mut payload = [0u8; PAYLOAD_CAPACITY];
        payload.copy_from_slice(&bytes[2..]);
        Ok(Packet {
            address: bytes[0],
            counter: bytes[1],
            payload,
            len: 0,
        })
    }

    /// Debug rendering with the payload as hexadecimal bytes.
    pub fn hex_dump(&self) -> HexDump<'_> {
        HexDump(self)
    }

    /// Debug rendering with the payload as (best-effort) text.
    pub fn string_dump(&self) -> StringDump<'_> {
        StringDump(self)
    }

    fn dump_len(&self) -> usize {
        if self.len > 0 {
            self.len
        } else {
            PAYLOAD_CAPACITY
        }
    }
}

/// See [Packet::hex_dump].
pub struct HexDump<'a>(&'a Packet);

/// See [Packet::string_dump].
pub struct StringDump<'a>(&'a Packet);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Address:{}", self.0.address)?;
        writeln!(f, "  count:{}", self.0.counter)?;
        write!(f, "Payload:")?;
        for b in &self.0.payload[..self.0.dump_len()] {
            write!(f, "{:#04X} ", b)?;
        }
        Ok(())
    }
}

impl fmt::Display for StringDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Address:{}", self.0.address)?;
        writeln!(f, "  count:{}", self.0.counter)?;
        write!(f, "Payload:")?;
        for b in self.0.payload[..self.0.dump_len()]
            .iter()
            .take_while(|b| **b != 0)
        {
            let c = *b as char;
            if c.is_ascii_graphic() || c == ' ' {
                write!(f, "{}", c)?;
            } else {
                write!(f, ".")?;
            }
        }
        Ok(())
    }
}

/// Small plain values that can be copied in and out of a payload.
///
/// Multi-byte values use little-endian order, the memory layout of the microcontrollers this
/// protocol was first written for, so packets stay readable by those nodes.
pub trait PayloadValue: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Encodes into `buf`, which is exactly [SIZE](PayloadValue::SIZE) bytes long.
    fn write_to(&self, buf: &mut [u8]);

    /// Decodes from `buf`, which is exactly [SIZE](PayloadValue::SIZE) bytes long.
    fn read_from(buf: &[u8]) -> Self;
}

macro_rules! impl_payload_value {
    ($($ty:ty),*) => {
        $(
            impl PayloadValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn write_to(&self, buf: &mut [u8]) {
                    buf.copy_from_slice(&self.to_le_bytes());
                }

                fn read_from(buf: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(buf);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_payload_value!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl PayloadValue for bool {
    const SIZE: usize = 1;

    fn write_to(&self, buf: &mut [u8]) {
        buf[0] = *self as u8;
    }

    fn read_from(buf: &[u8]) -> Self {
        buf[0] != 0
    }
}

impl<const N: usize> PayloadValue for [u8; N] {
    const SIZE: usize = N;

    fn write_to(&self, buf: &mut [u8]) {
        buf.copy_from_slice(self);
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut raw = [0u8; N];
        raw.copy_from_slice(buf);
        raw
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Payload is too large (is: {}B, max: {}B)!", .size, .max)]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Invalid frame length (is: {}B, expected: {}B)!", .size, FRAME_SIZE)]
    InvalidLength { size: usize },
}
