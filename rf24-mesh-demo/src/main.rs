use anyhow::{anyhow, Result};
use log::info;

use rf24_mesh::device::sim::SimulatedAir;
use rf24_mesh::{Node, NodeAddress, NodeConfig};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

mod echo_client;
mod echo_server;

const CHANNEL: u8 = 108;
const SERVER_ADDRESS: NodeAddress = 0;
const CLIENT_ADDRESS: NodeAddress = 1;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let messages = vec!["HELO1", "HELO2", "Enchante de communiquer!"]
        .into_iter()
        .map(|s| s.as_bytes().to_owned())
        .collect();
    let echoed = run(messages)?;
    info!("{} message(s) echoed.", echoed);

    println!("Stopping!");
    Ok(())
}

/// Runs an echo server and an echo client on the same simulated air.
fn run(messages: Vec<Vec<u8>>) -> Result<usize> {
    let air = SimulatedAir::new();
    let server_node = Node::new(
        air.radio(),
        &NodeConfig {
            address: SERVER_ADDRESS,
            channel: CHANNEL,
        },
    )
    .map_err(|err| anyhow!("Server radio setup failed!\ncause: {:?}", err))?;
    let client_node = Node::new(
        air.radio(),
        &NodeConfig {
            address: CLIENT_ADDRESS,
            channel: CHANNEL,
        },
    )
    .map_err(|err| anyhow!("Client radio setup failed!\ncause: {:?}", err))?;
    info!("Radios are ready.");

    let stop = Arc::new(AtomicBool::new(false));
    let server = {
        let stop = stop.clone();
        thread::spawn(move || echo_server::EchoServer::new(server_node).spawn(&stop))
    };

    let mut client = echo_client::EchoClient::new(client_node, SERVER_ADDRESS, messages);
    let res = client.spawn();
    stop.store(true, Ordering::Relaxed);
    let served = server
        .join()
        .map_err(|_| anyhow!("Echo server panicked!"))??;
    info!("Server echoed {} packet(s).", served);
    res
}
