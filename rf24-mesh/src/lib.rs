//! Addressed mesh transport for up to [MAX_NODES] nRF24L01-class radios.
//!
//! Every pair of nodes talks over its own hardware pipe (see [pipe_address]), and each node
//! keeps one sequence counter per peer so the retransmissions caused by a lost acknowledgment
//! are dropped on the receiving end. Delivery is best-effort: a failed transmission is retried
//! once and then reported to the caller.
pub mod device;

pub use device::frame::{FrameError, Packet, PayloadValue};
pub use device::radio::{pipe_address, Node, NodeConfig, NodeError, RadioMode};
pub use device::{PaLevel, Radio, Transceiver};

/// Node identity, valid in `0..MAX_NODES`.
pub type NodeAddress = u8;

/// 40-bit hardware pipe address (stored in the low bytes).
pub type PipeAddress = u64;

/// Maximum number of participants in a mesh. Six is the number of reading pipes of the chip.
pub const MAX_NODES: usize = 6;

/// Base of every pipe address. Pipes 1 to 5 only differ on their least significant byte.
pub const BASE_ADDRESS: PipeAddress = 0xDE_AD_BE_EF_00;

/// Sequence counters wrap at this value (must be a power of two).
pub const PACKET_COUNTER_MODULUS: u8 = 32;

/// Fixed payload size programmed into the hardware, i.e. the size of every frame on air.
pub const FRAME_SIZE: usize = 30;

/// Room left for user data once the address and counter bytes are accounted for.
pub const PAYLOAD_CAPACITY: usize = FRAME_SIZE - 2;

/// Highest channel supported by the chip.
pub const MAX_CHANNEL: u8 = 125;

/// Channel used when setup is given an invalid one. Channels above 108 stay clear of Wi-Fi.
pub const DEFAULT_CHANNEL: u8 = 108;

/// Base of the hardware auto-retry delay, offset by the node address.
pub const RETRY_DELAY_BASE: u8 = 5;

/// Number of hardware auto-retries.
pub const RETRY_COUNT: u8 = 15;

/// Software backoff (µs) per unit of node address before the second transmission attempt.
pub const BACKOFF_STEP_US: u32 = 5;
