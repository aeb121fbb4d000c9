use log::{debug, info, warn};
use rf24_mesh::{Node, NodeError, Radio};

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const POLL_DELAY: Duration = Duration::from_millis(1);

/// A basic echo server
pub struct EchoServer<T: Radio> {
    pub node: Node<T>,
}

impl<T: Radio> EchoServer<T>
where
    T::Error: Sync + Send + Debug + 'static,
{
    pub fn new(node: Node<T>) -> Self {
        Self { node }
    }

    /// Sends every received packet back to its source until `stop` is raised. Returns the
    /// number of echoed packets.
    pub fn spawn(&mut self, stop: &AtomicBool) -> anyhow::Result<usize> {
        let mut echoed = 0;
        while !stop.load(Ordering::Relaxed) {
            let packet = match self.node.read()? {
                Some(packet) => packet,
                None => {
                    std::thread::sleep(POLL_DELAY);
                    continue;
                }
            };
            info!(
                "Received payload (counter: {}) from {}.",
                packet.counter(),
                packet.address()
            );
            debug!("{}", packet.string_dump());
            let mut reply = packet;
            match self.node.write(&mut reply) {
                Ok(()) => echoed += 1,
                Err(NodeError::TransmissionFailed { destination }) => {
                    warn!("Echo to node {} lost.", destination)
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(echoed)
    }
}
