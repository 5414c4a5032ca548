//! RSSI-voting simulcast server.
//!
//! Receives time-stamped audio from remote radio receivers over UDP,
//! aligns it on a master timebase, votes the best receiver per 20 ms
//! frame by signal strength, and feeds the result to a host channel.
//! Transmit audio fans back out to the receivers in each one's encoding,
//! with optional primary/secondary server redundancy.
//!
//! The host obtains a [`VoterServer`] from a [`Config`] and reads
//! [`ChannelEvent`]s per node; everything else runs on internal threads.

mod client;
mod instance;
mod primary;
mod reader;
mod state;
mod timer;
mod time;
mod voting;
mod xmit;

pub mod channel;
pub mod config;
pub mod error;
pub mod server;
pub mod status;

pub use channel::{AudioFrame, ChannelEvent, DtmfDetector, DtmfEvent};
pub use client::PingSummary;
pub use config::Config;
pub use error::{ConfigError, EngineError};
pub use server::VoterServer;
pub use status::{ClientStatus, NodeStatus};
