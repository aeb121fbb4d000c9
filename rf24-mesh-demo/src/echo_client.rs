use anyhow::bail;
use log::{info, warn};
use rf24_mesh::{Node, NodeAddress, NodeError, Packet, Radio};

use std::fmt::Debug;
use std::time::{Duration, Instant};

const MAX_ATTEMPTS: usize = 50;
const ATTEMPT_DELAY: Duration = Duration::from_millis(2);
const POLL_DELAY: Duration = Duration::from_millis(1);

/// A basic echo client: sends every message to the server and waits for it to come back.
pub struct EchoClient<T: Radio> {
    pub node: Node<T>,
    pub server: NodeAddress,
    pub messages: Vec<Vec<u8>>,
    pub echo_timeout: Duration,
}

impl<T: Radio> EchoClient<T>
where
    T::Error: Sync + Send + Debug + 'static,
{
    pub fn new(node: Node<T>, server: NodeAddress, msgs: Vec<Vec<u8>>) -> Self {
        Self {
            node,
            server,
            messages: msgs,
            echo_timeout: Duration::from_secs(2),
        }
    }

    fn try_transmit(&mut self, msg: &[u8]) -> anyhow::Result<u8> {
        let mut packet = Packet::new();
        packet.add_payload(msg)?;
        let mut attempts = 0;
        loop {
            // The address is replaced by ours on every write.
            packet.set_address(self.server);
            attempts += 1;
            match self.node.write(&mut packet) {
                Ok(()) => return Ok(packet.counter()),
                Err(NodeError::TransmissionFailed { .. }) if attempts < MAX_ATTEMPTS => {
                    std::thread::sleep(ATTEMPT_DELAY)
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn wait_echo(&mut self) -> anyhow::Result<Packet> {
        let deadline = Instant::now() + self.echo_timeout;
        loop {
            if let Some(packet) = self.node.read()? {
                if packet.address() == self.server {
                    return Ok(packet);
                }
                warn!("Ignoring packet from node {}.", packet.address());
            }
            if Instant::now() > deadline {
                bail!("No echo from node {} after {:?}.", self.server, self.echo_timeout);
            }
            std::thread::sleep(POLL_DELAY);
        }
    }

    /// Runs the exchange, returns the number of messages echoed back unchanged.
    pub fn spawn(&mut self) -> anyhow::Result<usize> {
        let mut echoed = 0;
        for msg in std::mem::take(&mut self.messages) {
            let counter = self.try_transmit(&msg)?;
            info!(
                "Sending message (counter: {}): {}",
                counter,
                String::from_utf8_lossy(&msg)
            );
            let echo = self.wait_echo()?;
            let mut payload = vec![0u8; msg.len()];
            echo.read_payload(&mut payload)?;
            if payload == msg {
                info!(
                    "Received echo (counter: {}) from {}: {}",
                    echo.counter(),
                    echo.address(),
                    String::from_utf8_lossy(&payload)
                );
                echoed += 1;
            } else {
                warn!("Echo does not match what was sent:\n{}", echo.hex_dump());
            }
        }
        Ok(echoed)
    }
}
