use embedded_hal::blocking::delay::DelayUs;
use log::{debug, info, trace, warn};
use std::fmt::Debug;
use std::ops::{Deref, DerefMut};

use super::device::{PaLevel, Radio, Transceiver};
use super::frame::{FrameError, Packet};
use crate::{
    NodeAddress, PipeAddress, BACKOFF_STEP_US, BASE_ADDRESS, DEFAULT_CHANNEL, FRAME_SIZE,
    MAX_CHANNEL, MAX_NODES, PACKET_COUNTER_MODULUS, RETRY_COUNT, RETRY_DELAY_BASE,
};

/// Receive counter of a peer we never heard from. Out of the counter range, so the first packet
/// of every peer is accepted.
const UNKNOWN_PEER_COUNTER: u8 = PACKET_COUNTER_MODULUS;

/// Pipe address used for the link going from node `from` to node `to`.
///
/// Every ordered pair of nodes gets its own address, so the receiver knows the sender from the
/// pipe that caught the frame.
pub const fn pipe_address(from: NodeAddress, to: NodeAddress) -> PipeAddress {
    BASE_ADDRESS + from as PipeAddress + (MAX_NODES as PipeAddress + 1) * to as PipeAddress
}

/// Node configuration.
///
/// Pins and bus settings belong to the [Transceiver] implementation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NodeConfig {
    /// Address of this node, unique in the mesh and lower than [MAX_NODES].
    pub address: NodeAddress,
    /// Radio channel. Values above [MAX_CHANNEL] are replaced by [DEFAULT_CHANNEL].
    pub channel: u8,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            address: 0,
            channel: DEFAULT_CHANNEL,
        }
    }
}

/// The chip either listens or transmits, never both.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RadioMode {
    Listening,
    Transmitting,
}

/// Mesh node, exclusive owner of its radio.
pub struct Node<T: Radio> {
    radio: T,
    address: NodeAddress,
    channel: u8,
    mode: RadioMode,
    /// Next counter to stamp, per destination.
    tx_counters: [u8; MAX_NODES],
    /// Counter of the last accepted packet, per source.
    rx_counters: [u8; MAX_NODES],
}

impl<T: Radio> Node<T> {
    /// Configures the radio and starts listening to every peer.
    pub fn new(radio: T, config: &NodeConfig) -> Result<Self, NodeError<T::Error>> {
        if config.address as usize >= MAX_NODES {
            return Err(NodeError::InvalidAddress {
                address: config.address,
            });
        }
        let channel = if config.channel > MAX_CHANNEL {
            warn!(
                "Channel {} is out of range, falling back to channel {}.",
                config.channel, DEFAULT_CHANNEL
            );
            DEFAULT_CHANNEL
        } else {
            config.channel
        };
        let mut node = Node {
            radio,
            address: config.address,
            channel,
            mode: RadioMode::Transmitting,
            tx_counters: [0; MAX_NODES],
            rx_counters: [UNKNOWN_PEER_COUNTER; MAX_NODES],
        };
        node.setup()?;
        Ok(node)
    }

    fn setup(&mut self) -> Result<(), NodeError<T::Error>> {
        let radio = &mut self.radio;
        radio
            .begin()
            .map_err(|src| NodeError::InternalRadioError(src))?;
        radio
            .set_channel(self.channel)
            .map_err(|src| NodeError::InternalRadioError(src))?;
        radio
            .set_auto_ack(true)
            .map_err(|src| NodeError::InternalRadioError(src))?;
        // Nodes sharing a channel should not retry in lockstep.
        radio
            .set_retries(RETRY_DELAY_BASE + self.address, RETRY_COUNT)
            .map_err(|src| NodeError::InternalRadioError(src))?;
        radio
            .set_payload_size(FRAME_SIZE as u8)
            .map_err(|src| NodeError::InternalRadioError(src))?;
        let peers = (0..MAX_NODES as NodeAddress).filter(|peer| *peer != self.address);
        for (pipe, peer) in peers.enumerate() {
            let address = pipe_address(peer, self.address);
            trace!("Reading pipe {} bound to {:#012X} (node {}).", pipe, address, peer);
            radio
                .open_reading_pipe(pipe as u8, address)
                .map_err(|src| NodeError::InternalRadioError(src))?;
        }
        radio
            .set_pa_level(PaLevel::Max)
            .map_err(|src| NodeError::InternalRadioError(src))?;
        radio
            .start_listening()
            .map_err(|src| NodeError::InternalRadioError(src))?;
        self.mode = RadioMode::Listening;
        info!(
            "Node {} listening on channel {}.",
            self.address, self.channel
        );
        Ok(())
    }

    pub fn address(&self) -> NodeAddress {
        self.address
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn mode(&self) -> RadioMode {
        self.mode
    }

    pub fn radio(&self) -> &T {
        &self.radio
    }

    /// Gives the radio back.
    pub fn into_radio(self) -> T {
        self.radio
    }

    /// Is there an unread frame waiting in the radio?
    pub fn available(&mut self) -> Result<bool, NodeError<T::Error>> {
        self.radio
            .available()
            .map_err(|src| NodeError::InternalRadioError(src))
    }

    /// Sends `packet` to the node set as its address.
    ///
    /// The address and counter of `packet` are overwritten with this node's address and the
    /// sequence counter of the destination, so the caller has to set the destination again
    /// before sending the same packet twice. A transmission that is not acknowledged is retried
    /// once after a short backoff. The destination counter only moves forward on success.
    pub fn write(&mut self, packet: &mut Packet) -> Result<(), NodeError<T::Error>> {
        let destination = packet.address();
        if destination as usize >= MAX_NODES {
            return Err(NodeError::InvalidAddress {
                address: destination,
            });
        }
        if destination == self.address {
            return Err(NodeError::SelfAddressed {
                address: destination,
            });
        }
        let dest = destination as usize;

        let mut radio = TransmitGuard::enter(&mut self.radio, &mut self.mode)
            .map_err(|src| NodeError::InternalRadioError(src))?;
        packet.set_address(self.address);
        packet.set_counter(self.tx_counters[dest]);
        radio
            .open_writing_pipe(pipe_address(self.address, destination))
            .map_err(|src| NodeError::InternalRadioError(src))?;
        let frame = packet.to_bytes();
        let mut success = radio
            .write(&frame)
            .map_err(|src| NodeError::InternalRadioError(src))?;
        if !success {
            debug!(
                "Frame {} to node {} not acknowledged, retrying once.",
                self.tx_counters[dest], destination
            );
            radio.delay_us(BACKOFF_STEP_US * self.address as u32);
            success = radio
                .write(&frame)
                .map_err(|src| NodeError::InternalRadioError(src))?;
        }
        let restored = radio.leave();

        if success {
            self.tx_counters[dest] = (self.tx_counters[dest] + 1) % PACKET_COUNTER_MODULUS;
        }
        restored.map_err(|src| NodeError::InternalRadioError(src))?;
        if success {
            trace!("Frame {} sent to node {}.", packet.counter(), destination);
            Ok(())
        } else {
            Err(NodeError::TransmissionFailed { destination })
        }
    }

    /// Returns the next new packet waiting in the radio, if any.
    ///
    /// Frames repeating the counter of the last packet accepted from the same source are
    /// retransmissions (the acknowledgment got lost, not the frame) and are dropped.
    pub fn read(&mut self) -> Result<Option<Packet>, NodeError<T::Error>> {
        let mut buf = [0u8; FRAME_SIZE];
        while self.available()? {
            self.radio
                .read(&mut buf)
                .map_err(|src| NodeError::InternalRadioError(src))?;
            let packet = Packet::from_bytes(&buf)?;
            let source = packet.address() as usize;
            if source >= MAX_NODES {
                warn!("Dropping frame from invalid address {}.", source);
                continue;
            }
            if packet.counter() == self.rx_counters[source] {
                debug!(
                    "Dropping duplicate frame {} from node {}.",
                    packet.counter(),
                    source
                );
                continue;
            }
            self.rx_counters[source] = packet.counter();
            trace!("Frame {} received from node {}.", packet.counter(), source);
            return Ok(Some(packet));
        }
        Ok(None)
    }

    /// Moves to another channel. Unlike [new](Node::new), an invalid channel is rejected.
    pub fn set_channel(&mut self, channel: u8) -> Result<(), NodeError<T::Error>> {
        if channel > MAX_CHANNEL {
            return Err(NodeError::InvalidChannel { channel });
        }
        let mut radio = TransmitGuard::enter(&mut self.radio, &mut self.mode)
            .map_err(|src| NodeError::InternalRadioError(src))?;
        radio
            .set_channel(channel)
            .map_err(|src| NodeError::InternalRadioError(src))?;
        self.channel = channel;
        radio
            .leave()
            .map_err(|src| NodeError::InternalRadioError(src))?;
        info!("Node {} moved to channel {}.", self.address, channel);
        Ok(())
    }
}

/// Radio taken out of listening mode. Listening is restored when the guard is left or dropped,
/// whatever path the caller takes.
struct TransmitGuard<'a, T: Transceiver> {
    radio: &'a mut T,
    mode: &'a mut RadioMode,
    active: bool,
}

impl<'a, T: Transceiver> TransmitGuard<'a, T> {
    fn enter(radio: &'a mut T, mode: &'a mut RadioMode) -> Result<Self, T::Error> {
        radio.stop_listening()?;
        *mode = RadioMode::Transmitting;
        Ok(TransmitGuard {
            radio,
            mode,
            active: true,
        })
    }

    fn leave(mut self) -> Result<(), T::Error> {
        self.active = false;
        self.radio.start_listening()?;
        *self.mode = RadioMode::Listening;
        Ok(())
    }
}

impl<T: Transceiver> Deref for TransmitGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.radio
    }
}

impl<T: Transceiver> DerefMut for TransmitGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.radio
    }
}

impl<T: Transceiver> Drop for TransmitGuard<'_, T> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        match self.radio.start_listening() {
            Ok(()) => *self.mode = RadioMode::Listening,
            Err(err) => warn!("Radio failed to resume listening: {:?}", err),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum NodeError<R>
where
    R: Debug,
{
    #[error("Invalid node address {} (max: {})!", .address, MAX_NODES - 1)]
    InvalidAddress { address: NodeAddress },

    #[error("A node cannot send a packet to itself (address: {}).", .address)]
    SelfAddressed { address: NodeAddress },

    #[error("Transmission to node {} failed, even after a retry.", .destination)]
    TransmissionFailed { destination: NodeAddress },

    #[error("Invalid channel {} (max: {})!", .channel, MAX_CHANNEL)]
    InvalidChannel { channel: u8 },

    #[error("Bad frame error.")]
    FrameError(#[from] FrameError),

    #[error("Internal radio error.")]
    InternalRadioError(R),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SimError, SimulatedAir, SimulatedRadio};
    use std::collections::HashSet;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn node(air: &SimulatedAir, address: NodeAddress) -> Node<SimulatedRadio> {
        Node::new(
            air.radio(),
            &NodeConfig {
                address,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn packet_to(destination: NodeAddress, payload: &[u8]) -> Packet {
        let mut packet = Packet::new();
        packet.set_address(destination);
        packet.add_payload(payload).unwrap();
        packet
    }

    #[test]
    fn pipe_addresses_are_unique() {
        let mut seen = HashSet::new();
        for from in 0..MAX_NODES as NodeAddress {
            for to in 0..MAX_NODES as NodeAddress {
                if from != to {
                    assert!(seen.insert(pipe_address(from, to)), "{} -> {}", from, to);
                }
            }
        }
        assert_eq!(seen.len(), MAX_NODES * (MAX_NODES - 1));
        assert_eq!(pipe_address(1, 2), BASE_ADDRESS + 1 + 7 * 2);
        // Addresses only differ on their least significant byte.
        assert!(seen.iter().all(|a| a >> 8 == BASE_ADDRESS >> 8));
    }

    #[test]
    fn setup_programs_the_radio() {
        init();
        let air = SimulatedAir::new();
        let node = node(&air, 2);
        let radio = node.radio();
        assert_eq!(node.mode(), RadioMode::Listening);
        assert!(radio.is_listening());
        assert!(radio.auto_ack());
        assert_eq!(radio.channel(), DEFAULT_CHANNEL);
        assert_eq!(radio.retries(), (RETRY_DELAY_BASE + 2, RETRY_COUNT));
        assert_eq!(radio.payload_size() as usize, FRAME_SIZE);
        assert_eq!(radio.pa_level(), Some(PaLevel::Max));
        assert_eq!(
            radio.reading_pipes(),
            [
                Some(pipe_address(0, 2)),
                Some(pipe_address(1, 2)),
                Some(pipe_address(3, 2)),
                Some(pipe_address(4, 2)),
                Some(pipe_address(5, 2)),
                None,
            ]
        );
        assert_eq!(node.tx_counters, [0; MAX_NODES]);
        assert_eq!(node.rx_counters, [UNKNOWN_PEER_COUNTER; MAX_NODES]);
    }

    #[test]
    fn setup_clamps_invalid_channel() {
        let air = SimulatedAir::new();
        let node = Node::new(
            air.radio(),
            &NodeConfig {
                address: 0,
                channel: 200,
            },
        )
        .unwrap();
        assert_eq!(node.channel(), DEFAULT_CHANNEL);
        assert_eq!(node.radio().channel(), DEFAULT_CHANNEL);
    }

    #[test]
    fn setup_rejects_invalid_address() {
        let air = SimulatedAir::new();
        let res = Node::new(
            air.radio(),
            &NodeConfig {
                address: MAX_NODES as NodeAddress,
                ..Default::default()
            },
        );
        assert!(matches!(res, Err(NodeError::InvalidAddress { address: 6 })));
    }

    #[test]
    fn write_stamps_and_advances_counter() {
        init();
        let air = SimulatedAir::new();
        let mut a = node(&air, 1);
        let _b = node(&air, 2);

        let mut packet = packet_to(2, b"hi");
        a.write(&mut packet).unwrap();
        assert_eq!(packet.address(), 1);
        assert_eq!(packet.counter(), 0);
        assert_eq!(a.tx_counters[2], 1);
        assert_eq!(a.mode(), RadioMode::Listening);
        assert!(a.radio().is_listening());
        assert_eq!(a.radio().writing_pipe(), Some(pipe_address(1, 2)));

        let history = air.transmissions();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].address, pipe_address(1, 2));
        assert_eq!(history[0].frame, packet.to_bytes().to_vec());
    }

    #[test]
    fn self_addressed_write_is_rejected() {
        let air = SimulatedAir::new();
        let mut a = node(&air, 3);
        let mut packet = packet_to(3, b"me");
        assert!(matches!(
            a.write(&mut packet),
            Err(NodeError::SelfAddressed { address: 3 })
        ));
        assert_eq!(packet.address(), 3);
        assert_eq!(a.tx_counters, [0; MAX_NODES]);
        assert!(air.transmissions().is_empty());
        assert!(a.radio().is_listening());

        let mut packet = packet_to(9, b"nobody");
        assert!(matches!(
            a.write(&mut packet),
            Err(NodeError::InvalidAddress { address: 9 })
        ));
        assert!(air.transmissions().is_empty());
    }

    #[test]
    fn failed_write_retries_once_and_keeps_counter() {
        init();
        let air = SimulatedAir::new();
        let mut a = node(&air, 4);
        let _b = node(&air, 0);

        air.lose_next_frames(2);
        let mut packet = packet_to(0, b"lost");
        assert!(matches!(
            a.write(&mut packet),
            Err(NodeError::TransmissionFailed { destination: 0 })
        ));
        assert_eq!(air.transmissions().len(), 2);
        assert_eq!(a.radio().waited_us(), (BACKOFF_STEP_US * 4) as u64);
        assert_eq!(a.tx_counters[0], 0);
        assert_eq!(a.mode(), RadioMode::Listening);
        assert!(a.radio().is_listening());
    }

    #[test]
    fn second_attempt_can_succeed() {
        let air = SimulatedAir::new();
        let mut a = node(&air, 1);
        let mut b = node(&air, 2);

        air.lose_next_frames(1);
        let mut packet = packet_to(2, b"again");
        a.write(&mut packet).unwrap();
        assert_eq!(air.transmissions().len(), 2);
        assert_eq!(a.tx_counters[2], 1);
        assert_eq!(b.read().unwrap().unwrap().counter(), 0);
    }

    #[test]
    fn duplicates_are_dropped() {
        init();
        let air = SimulatedAir::new();
        let mut a = node(&air, 1);
        let mut b = node(&air, 2);

        // The frame arrives but its acknowledgment does not: the sender retransmits it.
        air.lose_next_acks(1);
        let mut packet = packet_to(2, b"once");
        a.write(&mut packet).unwrap();
        assert_eq!(air.transmissions().len(), 2);

        let received = b.read().unwrap().unwrap();
        assert_eq!(received.counter(), 0);
        assert!(b.read().unwrap().is_none());
        assert!(!b.available().unwrap());
    }

    #[test]
    fn counters_are_tracked_per_peer() {
        let air = SimulatedAir::new();
        let mut a = node(&air, 0);
        let mut c = node(&air, 5);
        let mut b = node(&air, 3);

        a.write(&mut packet_to(3, b"from a")).unwrap();
        c.write(&mut packet_to(3, b"from c")).unwrap();

        let first = b.read().unwrap().unwrap();
        let second = b.read().unwrap().unwrap();
        assert_eq!((first.address(), first.counter()), (0, 0));
        assert_eq!((second.address(), second.counter()), (5, 0));
        assert_eq!(b.rx_counters[0], 0);
        assert_eq!(b.rx_counters[5], 0);
        assert_eq!(b.rx_counters[1], UNKNOWN_PEER_COUNTER);
    }

    #[test]
    fn counter_wraps_and_duplicates_are_still_detected() {
        let air = SimulatedAir::new();
        let mut a = node(&air, 1);
        let mut b = node(&air, 2);

        let mut received = Vec::new();
        for i in 0..(PACKET_COUNTER_MODULUS as usize + 3) {
            let mut packet = packet_to(2, &[i as u8]);
            a.write(&mut packet).unwrap();
            assert_eq!(packet.counter() as usize, i % PACKET_COUNTER_MODULUS as usize);
            let packet = b.read().unwrap().unwrap();
            assert_eq!(packet.payload()[0], i as u8);
            received.push(packet);
        }
        let last = received[received.len() - 1];
        assert_eq!(last.counter(), 2);
        assert_eq!(received[PACKET_COUNTER_MODULUS as usize].counter(), 0);

        assert!(b.radio().inject(&last.to_bytes()));
        assert!(b.read().unwrap().is_none());
    }

    #[test]
    fn invalid_source_is_dropped() {
        let air = SimulatedAir::new();
        let mut b = node(&air, 2);
        let mut bogus = Packet::new();
        bogus.set_address(42);
        assert!(b.radio().inject(&bogus.to_bytes()));
        assert!(b.read().unwrap().is_none());
    }

    #[test]
    fn set_channel() {
        init();
        let air = SimulatedAir::new();
        let mut a = node(&air, 1);

        assert!(matches!(
            a.set_channel(130),
            Err(NodeError::InvalidChannel { channel: 130 })
        ));
        assert_eq!(a.channel(), DEFAULT_CHANNEL);
        assert_eq!(a.radio().channel(), DEFAULT_CHANNEL);

        a.set_channel(50).unwrap();
        assert_eq!(a.channel(), 50);
        assert_eq!(a.radio().channel(), 50);
        assert!(a.radio().is_listening());
        assert_eq!(a.mode(), RadioMode::Listening);
    }

    /// Radio whose transmissions fail at the driver level.
    struct BrokenRadio(SimulatedRadio);

    impl Transceiver for BrokenRadio {
        type Error = SimError;

        fn begin(&mut self) -> Result<(), SimError> {
            self.0.begin()
        }
        fn set_channel(&mut self, channel: u8) -> Result<(), SimError> {
            self.0.set_channel(channel)
        }
        fn set_auto_ack(&mut self, enable: bool) -> Result<(), SimError> {
            self.0.set_auto_ack(enable)
        }
        fn set_retries(&mut self, delay: u8, count: u8) -> Result<(), SimError> {
            self.0.set_retries(delay, count)
        }
        fn set_payload_size(&mut self, size: u8) -> Result<(), SimError> {
            self.0.set_payload_size(size)
        }
        fn open_reading_pipe(&mut self, pipe: u8, address: PipeAddress) -> Result<(), SimError> {
            self.0.open_reading_pipe(pipe, address)
        }
        fn open_writing_pipe(&mut self, _address: PipeAddress) -> Result<(), SimError> {
            Err(SimError::NoWritingPipe)
        }
        fn start_listening(&mut self) -> Result<(), SimError> {
            self.0.start_listening()
        }
        fn stop_listening(&mut self) -> Result<(), SimError> {
            self.0.stop_listening()
        }
        fn available(&mut self) -> Result<bool, SimError> {
            self.0.available()
        }
        fn read(&mut self, buf: &mut [u8]) -> Result<(), SimError> {
            self.0.read(buf)
        }
        fn write(&mut self, buf: &[u8]) -> Result<bool, SimError> {
            self.0.write(buf)
        }
        fn set_pa_level(&mut self, level: PaLevel) -> Result<(), SimError> {
            self.0.set_pa_level(level)
        }
    }

    impl DelayUs<u32> for BrokenRadio {
        fn delay_us(&mut self, us: u32) {
            self.0.delay_us(us)
        }
    }

    #[test]
    fn driver_error_still_restores_listening() {
        init();
        let air = SimulatedAir::new();
        let mut a = Node::new(
            BrokenRadio(air.radio()),
            &NodeConfig {
                address: 1,
                ..Default::default()
            },
        )
        .unwrap();

        let mut packet = packet_to(2, b"x");
        assert!(matches!(
            a.write(&mut packet),
            Err(NodeError::InternalRadioError(SimError::NoWritingPipe))
        ));
        assert_eq!(a.mode(), RadioMode::Listening);
        assert!(a.radio().0.is_listening());
        assert_eq!(a.tx_counters[2], 0);
    }
}
