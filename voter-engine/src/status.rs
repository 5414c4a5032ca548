//! Status snapshots for the operator control surface.

use std::net::SocketAddrV4;

use crate::client::{Client, PingSummary};
use crate::state::VoterState;

/// One client's live state as shown by status/display queries.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientStatus {
    pub name: String,
    pub addr: Option<SocketAddrV4>,
    /// True when the client is reached through a secondary server.
    pub proxied: bool,
    pub heardfrom: bool,
    pub master: bool,
    pub curmaster: bool,
    pub mix: bool,
    pub adpcm: bool,
    pub nulaw: bool,
    pub totransmit: bool,
    pub txlockout: bool,
    pub prio: i32,
    pub prio_override: i32,
    pub last_rssi: u8,
    pub last_ping: Option<PingSummary>,
}

impl ClientStatus {
    fn of(c: &Client) -> Self {
        ClientStatus {
            name: c.name.clone(),
            addr: c.addr,
            proxied: c.proxy_addr.is_some(),
            heardfrom: c.heardfrom,
            master: c.ismaster,
            curmaster: c.curmaster,
            mix: c.mix,
            adpcm: c.doadpcm,
            nulaw: c.donulaw,
            totransmit: c.totransmit,
            txlockout: c.txlockout,
            prio: c.prio,
            prio_override: c.prio_override,
            last_rssi: c.last_rssi,
            last_ping: c.ping.last_summary,
        }
    }
}

/// One node's live state.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    pub nodenum: u32,
    pub winner: Option<String>,
    pub rxkey: bool,
    pub txkey: bool,
    pub test_mode: i32,
    pub is_primary: bool,
    pub primary_connected: bool,
    pub recording: Option<String>,
    pub clients: Vec<ClientStatus>,
}

pub(crate) fn node_status(st: &VoterState, pi: usize) -> NodeStatus {
    let p = &st.instances[pi];
    NodeStatus {
        nodenum: p.nodenum,
        winner: p.winner.clone(),
        rxkey: p.rxkey,
        txkey: p.txkey,
        test_mode: p.voter_test,
        is_primary: p.isprimary,
        primary_connected: p.priconn,
        recording: p.rec_path.clone(),
        clients: st
            .clients
            .iter()
            .filter(|c| c.nodenum == p.nodenum)
            .map(ClientStatus::of)
            .collect(),
    }
}
