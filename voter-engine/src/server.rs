//! Server lifecycle and the operator control surface.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::net::{SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};

use voter_dsp::apply_gain;
use voter_proto::{crc32_bufs, FRAME_SIZE};

use crate::channel::{AudioFrame, ChannelEvent, DtmfDetector};
use crate::client::{Client, PRIO_OVERRIDE_OFF};
use crate::config::Config;
use crate::error::EngineError;
use crate::instance::Instance;
use crate::state::{Shared, VoterState};
use crate::status::{node_status, NodeStatus};
use crate::time::VTime;
use crate::{primary, reader, timer, xmit};

/// A running voter server: reader and timer threads, one transmit worker
/// per node, and a primary-session worker per redundant node.
pub struct VoterServer {
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    events: HashMap<u32, Receiver<ChannelEvent>>,
}

fn make_challenge() -> String {
    let mut s = format!("{}", rand::thread_rng().gen::<u32>());
    s.truncate(voter_proto::CHALLENGE_LEN - 1);
    s
}

fn bind_socket(config: &Config) -> Result<UdpSocket, EngineError> {
    let addr = SocketAddrV4::new(config.general.bindaddr, config.general.port);
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(EngineError::Socket)?;
    socket.set_reuse_address(true).map_err(EngineError::Socket)?;
    socket
        .bind(&addr.into())
        .map_err(|source| EngineError::Bind { addr, source })?;
    socket
        .set_read_timeout(Some(Duration::from_millis(50)))
        .map_err(EngineError::Socket)?;
    let _ = socket.set_recv_buffer_size(1024 * 1024);
    let _ = socket.set_send_buffer_size(1024 * 1024);
    if config.general.utos {
        // Voice-priority TOS, as radio clients expect.
        socket.set_tos(0xC0).map_err(EngineError::Socket)?;
    }
    Ok(socket.into())
}

impl VoterServer {
    /// Bind the socket, build state from the configuration, and start
    /// every thread.
    pub fn start(config: Config) -> Result<Self, EngineError> {
        let challenge = make_challenge();
        let socket = bind_socket(&config)?;

        let mut clients = Vec::new();
        let mut instances = Vec::new();
        let mut events = HashMap::new();
        for node in &config.nodes {
            let (tx, rx) = unbounded();
            events.insert(node.nodenum, rx);
            instances.push(Instance::from_config(node, tx));
            let buflen = config.buflen_samples(node);
            for ccfg in &node.clients {
                clients.push(Client::from_config(ccfg, node.nodenum, buflen, &challenge));
            }
        }

        let state = VoterState {
            password: config.general.password.clone(),
            sanity: config.general.sanity,
            puckit: config.general.puckit,
            gps_dir: config.general.gps_dir.clone(),
            listen_port: config.general.port,
            hasmaster: config.has_master(),
            master_time: VTime::default(),
            mastergps_time: VTime::default(),
            voter_timing_count: 0,
            last_master_count: 0,
            master_port: 0,
            clients,
            instances,
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            run: AtomicBool::new(true),
            socket,
            challenge,
        });

        let mut workers = Vec::new();
        {
            let st = shared.state.lock();
            for p in &st.instances {
                let nodenum = p.nodenum;
                let txq = p.txq.clone();
                let pagerq = p.pagerq.clone();
                let tick = p.tick.clone();
                let kill = p.kill_xmit.clone();
                let sh = shared.clone();
                workers.push(
                    thread::Builder::new()
                        .name(format!("voter-xmit-{nodenum}"))
                        .spawn(move || xmit::xmit_loop(sh, nodenum, txq, pagerq, tick, kill))
                        .map_err(EngineError::Socket)?,
                );
                if p.primary.is_some() {
                    let kill = p.kill_primary.clone();
                    let sh = shared.clone();
                    workers.push(
                        thread::Builder::new()
                            .name(format!("voter-primary-{nodenum}"))
                            .spawn(move || primary::primary_loop(sh, nodenum, kill))
                            .map_err(EngineError::Socket)?,
                    );
                }
            }
        }

        let reader = {
            let sh = shared.clone();
            thread::Builder::new()
                .name("voter-reader".to_string())
                .spawn(move || reader::reader_loop(sh))
                .map_err(EngineError::Socket)?
        };
        let timer = {
            let sh = shared.clone();
            thread::Builder::new()
                .name("voter-timer".to_string())
                .spawn(move || timer::timer_loop(sh))
                .map_err(EngineError::Socket)?
        };

        log::info!(
            "voter server listening on {}:{}",
            config.general.bindaddr,
            config.general.port
        );
        Ok(VoterServer {
            shared,
            reader: Some(reader),
            timer: Some(timer),
            workers,
            events,
        })
    }

    /// Take the event receiver for a node. The host reads voted audio,
    /// text, and key/unkey control events from it.
    pub fn take_events(&mut self, nodenum: u32) -> Option<Receiver<ChannelEvent>> {
        self.events.remove(&nodenum)
    }

    fn with_node<R>(
        &self,
        nodenum: u32,
        f: impl FnOnce(&mut VoterState, usize) -> R,
    ) -> Result<R, EngineError> {
        let mut st = self.shared.state.lock();
        let pi = st
            .instance_for_node(nodenum)
            .ok_or(EngineError::NoSuchNode(nodenum))?;
        Ok(f(&mut st, pi))
    }

    /// Queue one frame of transmit audio for a node. Frames are dropped
    /// while the node is unkeyed, and the queue is flushed while the
    /// master timebase is down.
    pub fn write_audio(&self, nodenum: u32, frame: &[i16]) -> Result<(), EngineError> {
        self.with_node(nodenum, |st, pi| {
            if !st.instances[pi].txkey {
                return;
            }
            if st.hasmaster && st.master_time.sec == 0 {
                st.instances[pi].txq.lock().clear();
                return;
            }
            let mut out: AudioFrame = [0i16; FRAME_SIZE];
            let n = frame.len().min(FRAME_SIZE);
            out[..n].copy_from_slice(&frame[..n]);
            let gain = st.instances[pi].gtxgain;
            apply_gain(&mut out, gain);
            st.instances[pi].txq.lock().push_back(out);
        })
    }

    /// Key or unkey a node's transmitter.
    pub fn set_txkey(&self, nodenum: u32, on: bool) -> Result<(), EngineError> {
        self.with_node(nodenum, |st, pi| {
            st.instances[pi].txkey = on;
            log::debug!("node {nodenum}: TX {}", if on { "on" } else { "off" });
        })
    }

    /// Queue pre-rendered pager audio; an `ENDPAGE` text event follows
    /// the last frame out.
    pub fn enqueue_pager_audio(
        &self,
        nodenum: u32,
        frames: &[AudioFrame],
    ) -> Result<(), EngineError> {
        self.with_node(nodenum, |st, pi| {
            let mut q = st.instances[pi].pagerq.lock();
            for f in frames {
                q.push_back(*f);
            }
        })
    }

    /// Whether pager audio is still queued.
    pub fn pager_pending(&self, nodenum: u32) -> Result<bool, EngineError> {
        self.with_node(nodenum, |st, pi| !st.instances[pi].pagerq.lock().is_empty())
    }

    /// Install a DTMF detector for a node.
    pub fn set_dtmf_detector(
        &self,
        nodenum: u32,
        detector: Option<Box<dyn DtmfDetector>>,
    ) -> Result<(), EngineError> {
        self.with_node(nodenum, |st, pi| st.instances[pi].dtmf = detector)
    }

    /// Enable or disable test-mode voting (0 = off, 1 = random,
    /// N > 1 = cycle every N-1 ticks).
    pub fn set_test(&self, nodenum: u32, value: i32) -> Result<(), EngineError> {
        self.with_node(nodenum, |st, pi| {
            st.instances[pi].voter_test = value.max(0);
            st.instances[pi].testcycle = 0;
            st.instances[pi].testindex = 0;
        })
    }

    /// Override a client's effective priority: `Some(-1)` mutes it,
    /// `Some(n >= 0)` forces priority n, `None` removes the override.
    pub fn set_prio(
        &self,
        nodenum: u32,
        client: &str,
        value: Option<i32>,
    ) -> Result<(), EngineError> {
        let mut st = self.shared.state.lock();
        st.instance_for_node(nodenum)
            .ok_or(EngineError::NoSuchNode(nodenum))?;
        let ci = st
            .clients
            .iter()
            .position(|c| c.nodenum == nodenum && c.name == client)
            .ok_or_else(|| EngineError::NoSuchClient(client.to_string()))?;
        st.clients[ci].prio_override = value.unwrap_or(PRIO_OVERRIDE_OFF).max(PRIO_OVERRIDE_OFF);
        Ok(())
    }

    /// Start or stop raw per-frame recording for a node.
    pub fn set_record(&self, nodenum: u32, path: Option<&str>) -> Result<(), EngineError> {
        let mut st = self.shared.state.lock();
        let pi = st
            .instance_for_node(nodenum)
            .ok_or(EngineError::NoSuchNode(nodenum))?;
        match path {
            Some(path) => {
                let file = File::create(path).map_err(EngineError::Record)?;
                st.instances[pi].recfp = Some(BufWriter::new(file));
                st.instances[pi].rec_path = Some(path.to_string());
            }
            None => {
                st.instances[pi].recfp = None;
                st.instances[pi].rec_path = None;
            }
        }
        Ok(())
    }

    /// Set the TX CTCSS tone level (0..=250).
    pub fn set_tone(&self, nodenum: u32, level: i32) -> Result<(), EngineError> {
        self.with_node(nodenum, |st, pi| {
            if let Some(gen) = st.instances[pi].ctcss.as_mut() {
                gen.set_level(level);
            }
        })
    }

    /// Adjust per-client TX gating: `"all"`, `"none"`, or a comma list
    /// of `+name`/`-name` toggles.
    pub fn set_txlockout(&self, nodenum: u32, gating: &str) -> Result<(), EngineError> {
        let mut st = self.shared.state.lock();
        st.instance_for_node(nodenum)
            .ok_or(EngineError::NoSuchNode(nodenum))?;
        match gating {
            "all" => {
                for c in st.clients.iter_mut().filter(|c| c.nodenum == nodenum) {
                    c.txlockout = true;
                }
            }
            "none" => {
                for c in st.clients.iter_mut().filter(|c| c.nodenum == nodenum) {
                    c.txlockout = false;
                }
            }
            list => {
                for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    let (on, name) = match item.strip_prefix('+') {
                        Some(name) => (true, name),
                        None => match item.strip_prefix('-') {
                            Some(name) => (false, name),
                            None => (true, item),
                        },
                    };
                    let c = st
                        .clients
                        .iter_mut()
                        .find(|c| c.nodenum == nodenum && c.name == name)
                        .ok_or_else(|| EngineError::NoSuchClient(name.to_string()))?;
                    c.txlockout = on;
                }
            }
        }
        Ok(())
    }

    /// Start a ping batch to a client; a count of 0 aborts the batch in
    /// flight.
    pub fn ping_client(&self, client: &str, count: u32) -> Result<(), EngineError> {
        let mut st = self.shared.state.lock();
        let ci = st
            .client_by_name(client)
            .ok_or_else(|| EngineError::NoSuchClient(client.to_string()))?;
        let ping = &mut st.clients[ci].ping;
        if count == 0 {
            if ping.requested != 0 {
                ping.abort = true;
            }
            return Ok(());
        }
        ping.requested = count;
        ping.sent = 0;
        ping.received = 0;
        ping.oos = 0;
        ping.best_ms = 0;
        ping.worst_ms = 0;
        ping.total_ms = 0;
        ping.last_seqno = 0;
        ping.abort = false;
        Ok(())
    }

    /// Live per-client view for one node.
    pub fn node_status(&self, nodenum: u32) -> Result<NodeStatus, EngineError> {
        self.with_node(nodenum, |st, pi| node_status(st, pi))
    }

    /// Status of every node.
    pub fn status(&self) -> Vec<NodeStatus> {
        let st = self.shared.state.lock();
        (0..st.instances.len()).map(|pi| node_status(&st, pi)).collect()
    }

    /// Apply a new configuration snapshot. Clients keep their identity
    /// by authentication digest; clients gone from the configuration are
    /// destroyed. Node sections for nodes without a live instance only
    /// contribute clients (ignored by the reader until an instance
    /// exists).
    pub fn reload(&self, config: &Config) -> Result<(), EngineError> {
        let mut st = self.shared.state.lock();
        st.password = config.general.password.clone();
        st.sanity = config.general.sanity;
        st.puckit = config.general.puckit;
        st.gps_dir = config.general.gps_dir.clone();
        st.hasmaster = config.has_master();

        for c in &mut st.clients {
            c.seen_in_reload = false;
        }

        for node in &config.nodes {
            if let Some(pi) = st.instance_for_node(node.nodenum) {
                st.instances[pi].apply_config(node);
            }
            let buflen = config.buflen_samples(node);
            for ccfg in &node.clients {
                let digest = crc32_bufs(self.shared.challenge.as_bytes(), ccfg.password.as_bytes());
                let existing = st
                    .clients
                    .iter()
                    .position(|c| c.digest == digest && c.nodenum == node.nodenum);
                match existing {
                    Some(ci) => {
                        st.clients[ci].apply_config(ccfg, node.nodenum, buflen, &self.shared.challenge)
                    }
                    None => st.clients.push(Client::from_config(
                        ccfg,
                        node.nodenum,
                        buflen,
                        &self.shared.challenge,
                    )),
                }
            }
        }

        let before = st.clients.len();
        st.clients.retain(|c| c.seen_in_reload);
        let removed = before - st.clients.len();
        if removed > 0 {
            log::info!("reload removed {removed} client(s)");
        }
        Ok(())
    }

    /// Stop every thread and join them.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.run.store(false, Ordering::SeqCst);
        {
            let st = self.shared.state.lock();
            for p in &st.instances {
                p.kill_xmit.store(true, Ordering::SeqCst);
                p.kill_primary.store(true, Ordering::SeqCst);
                p.tick.signal();
            }
        }
        if let Some(h) = self.reader.take() {
            let _ = h.join();
        }
        if let Some(h) = self.timer.take() {
            let _ = h.join();
        }
        for h in self.workers.drain(..) {
            let _ = h.join();
        }
    }
}

impl Drop for VoterServer {
    fn drop(&mut self) {
        self.stop();
    }
}
