//! Minimal voter daemon: load a config file, run the server, and print
//! per-node channel events.
//!
//! Usage: voterd [path/to/voter.conf]

use std::env;
use std::thread;
use std::time::Duration;

use voter_engine::{ChannelEvent, Config, VoterServer};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let path = env::args().nth(1).unwrap_or_else(|| "voter.conf".to_string());
    let config = Config::from_file(&path)?;
    let nodes: Vec<u32> = config.nodes.iter().map(|n| n.nodenum).collect();

    let mut server = VoterServer::start(config)?;

    let mut printers = Vec::new();
    for nodenum in nodes {
        let rx = match server.take_events(nodenum) {
            Some(rx) => rx,
            None => continue,
        };
        printers.push(thread::spawn(move || {
            for event in rx {
                match event {
                    ChannelEvent::Audio(_) => {}
                    ChannelEvent::Text(text) => println!("[{nodenum}] text: {text}"),
                    ChannelEvent::RadioKey => println!("[{nodenum}] keyed"),
                    ChannelEvent::RadioUnkey => println!("[{nodenum}] unkeyed"),
                    ChannelEvent::DtmfEnd { digit, duration_ms } => {
                        println!("[{nodenum}] DTMF {digit} ({duration_ms} ms)")
                    }
                }
            }
        }));
    }

    // Dump a status snapshot every 10 seconds until killed.
    loop {
        thread::sleep(Duration::from_secs(10));
        for node in server.status() {
            let winner = node.winner.as_deref().unwrap_or("-");
            println!("node {}: winner {}", node.nodenum, winner);
            for c in &node.clients {
                println!(
                    "  {:<16} rssi {:>3} {}{}{}",
                    c.name,
                    c.last_rssi,
                    if c.heardfrom { "up " } else { "down " },
                    if c.mix { "mix " } else { "" },
                    if c.proxied { "(proxied)" } else { "" },
                );
            }
        }
    }
}
