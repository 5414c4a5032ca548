//! Shared server state: the client list, the instance list, and the
//! master timebase, all guarded by one coarse lock.

use std::net::UdpSocket;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use parking_lot::Mutex;

use voter_dsp::MULAW_SILENCE;

use crate::channel::ChannelEvent;
use crate::client::Client;
use crate::instance::Instance;
use crate::time::{since_ms, VTime};

/// A master packet gap of more than this many 20 ms ticks drops the
/// timebase.
pub const MAX_MASTER_COUNT: u32 = 3;

/// Receive carrier timeout.
pub const RX_TIMEOUT_MS: u64 = 200;

/// Ordinary client liveness timeout.
pub const CLIENT_TIMEOUT_MS: u64 = 3000;

/// Master client liveness timeout.
pub const MASTER_TIMEOUT_MS: u64 = 100;

/// Idle time before a keepalive is sent to a client.
pub const TX_KEEPALIVE_MS: u64 = 1000;

/// Spacing between ping transmissions.
pub const PING_TIME_MS: i64 = 250;

/// Silence after the last ping response before the batch is abandoned.
pub const PING_TIMEOUT_MS: i64 = 3000;

/// Minimum interval between repeated no-master auth warnings.
pub const CLIENT_WARN_SECS: u64 = 60;

/// All mutable server state, protected by [`Shared::state`].
pub struct VoterState {
    /// Server password used for response digests.
    pub password: String,
    pub sanity: bool,
    pub puckit: bool,
    pub gps_dir: String,
    pub listen_port: u16,

    /// Whether any configured client is a master timing source.
    pub hasmaster: bool,
    pub master_time: VTime,
    pub mastergps_time: VTime,
    /// Monotonic count of 20 ms timer ticks.
    pub voter_timing_count: u32,
    /// Tick count at the last master packet; 0 when the timebase is down.
    pub last_master_count: u32,
    /// Source port of the master, pinned when sanity checking is off.
    pub master_port: u16,

    pub clients: Vec<Client>,
    pub instances: Vec<Instance>,
}

impl VoterState {
    pub fn client_by_digest(&self, digest: u32) -> Option<usize> {
        if digest == 0 {
            return None;
        }
        self.clients.iter().position(|c| c.digest == digest)
    }

    pub fn instance_for_node(&self, nodenum: u32) -> Option<usize> {
        self.instances.iter().position(|p| p.nodenum == nodenum)
    }

    pub fn client_by_name(&self, name: &str) -> Option<usize> {
        self.clients.iter().position(|c| c.name == name)
    }

    /// GPS-puck clock correction for a client, in nanoseconds.
    pub fn puck_offset(&self, ci: usize) -> i64 {
        if !self.puckit {
            return 0;
        }
        let c = &self.clients[ci];
        c.lastgpstime.as_nanos() - c.lastmastergpstime.as_nanos()
    }

    /// Master time adjusted by a client's puck offset, for outbound
    /// packet headers.
    pub fn pucked_time(&self, ci: usize) -> VTime {
        let total = self.master_time.as_nanos() + self.puck_offset(ci);
        VTime::new(
            (total / 1_000_000_000) as u32,
            (total % 1_000_000_000) as u32,
        )
    }

    /// Advance the drain index of every client on a node by one frame.
    pub fn advance_drain(&mut self, nodenum: u32) {
        for c in &mut self.clients {
            if c.nodenum == nodenum {
                c.advance_drain();
            }
        }
    }

    /// Drop every queued TX frame on every instance.
    pub fn flush_txqs(&self) {
        for p in &self.instances {
            p.txq.lock().clear();
        }
    }

    /// Advance mix clients' TX/RX drain counters one tick and wake every
    /// transmit worker.
    pub fn xmit_master_tick(&mut self) {
        for c in &mut self.clients {
            if c.resp_digest == 0 || !c.heardfrom || !c.mix {
                continue;
            }
            c.txseqno = c.txseqno.wrapping_add(1);
            if c.rxseqno != 0 {
                if !c.doadpcm && !c.donulaw {
                    c.rxseqno = c.rxseqno.wrapping_add(1);
                } else {
                    if c.rxseq40ms {
                        c.rxseqno = c.rxseqno.wrapping_add(2);
                    }
                    c.rxseq40ms = !c.rxseq40ms;
                }
            }
        }
        for p in &self.instances {
            p.tick.signal();
        }
    }

    /// Disconnect clients that have gone quiet (masters on a much shorter
    /// fuse than ordinary clients).
    pub fn timeout_scan(&mut self, now: Instant) {
        for c in &mut self.clients {
            let limit = if c.ismaster {
                MASTER_TIMEOUT_MS
            } else {
                CLIENT_TIMEOUT_MS
            };
            if c.lastheardtime.is_some() && since_ms(c.lastheardtime, now) > limit {
                log::info!("client {} disconnect (timeout)", c.name);
                c.invalidate();
                c.lastheardtime = None;
            }
            if !c.heardfrom {
                c.lastheardtime = None;
            }
        }
    }

    /// Invalidate every pair of authenticated clients sharing an address.
    /// Skips nodes relaying through a connected primary, where duplicate
    /// source addresses are expected.
    pub fn sanity_scan(&mut self) {
        if !self.sanity {
            return;
        }
        let skip: Vec<bool> = self
            .clients
            .iter()
            .map(|c| match self.instance_for_node(c.nodenum) {
                Some(pi) => self.instances[pi].priconn,
                None => true,
            })
            .collect();
        for a in 0..self.clients.len() {
            if skip[a] || self.clients[a].resp_digest == 0 {
                continue;
            }
            for b in (a + 1)..self.clients.len() {
                if self.clients[b].resp_digest == 0 {
                    continue;
                }
                let same = match (self.clients[a].addr, self.clients[b].addr) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                };
                if same {
                    log::warn!(
                        "clients {} and {} share {}, invalidating both",
                        self.clients[a].name,
                        self.clients[b].name,
                        self.clients[a].addr.unwrap()
                    );
                    self.clients[a].invalidate();
                    self.clients[b].invalidate();
                }
            }
        }
    }

    /// Master timing loss recovery: drop the timebase, wipe every buffer,
    /// unkey every receiving instance, and flush all TX queues.
    pub fn lost_master(&mut self) {
        log::warn!("lost master timing source");
        self.last_master_count = 0;
        self.master_time = VTime::default();
        for c in &mut self.clients {
            c.audio.fill(MULAW_SILENCE);
            c.rssi.fill(0);
        }
        for p in &mut self.instances {
            if p.rxkey {
                p.queue_event(ChannelEvent::RadioUnkey);
            }
            p.rxkey = false;
            p.last_won = None;
            p.txq.lock().clear();
        }
    }
}

/// State shared between all server threads.
pub struct Shared {
    pub state: Mutex<VoterState>,
    pub run: AtomicBool,
    pub socket: UdpSocket,
    /// Per-process challenge string, stable for the process lifetime.
    pub challenge: String,
}
