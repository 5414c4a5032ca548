//! Per-instance transmit worker.
//!
//! Woken once per 20 ms tick: drains the outbound queue, encodes audio
//! per client capability (μ-law every tick, ADPCM and half-rate μ-law as
//! 40 ms pairs), services pings, and keeps idle clients alive.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use voter_dsp::{mix_saturating, mulaw_decode, mulaw_encode, nulaw_encode, MULAW_SILENCE};
use voter_proto::{
    crc32_bufs, PacketHeader, PayloadType, PingBody, ProxyHeader, ADPCM_FRAME_SIZE, FRAME_SIZE,
    HEADER_LEN, PING_BODY_LEN, PROXY_HEADER_LEN,
};

use crate::channel::{AudioFrame, ChannelEvent};
use crate::config::TxTocType;
use crate::instance::{TickSignal, TxQueue};
use crate::state::{Shared, VoterState, PING_TIME_MS, PING_TIMEOUT_MS, TX_KEEPALIVE_MS};
use crate::time::{since_ms, walltime_diff_ms, walltime_now};

/// How many frames may sit in the TX queue before draining starts while
/// the channel is still keyed.
const TXQ_HIGH_WATER: usize = 3;

pub(crate) fn xmit_loop(
    shared: Arc<Shared>,
    nodenum: u32,
    txq: TxQueue,
    pagerq: TxQueue,
    tick: Arc<TickSignal>,
    kill: Arc<std::sync::atomic::AtomicBool>,
) {
    log::debug!("node {nodenum}: transmit worker started");
    let mut last_tick = 0u64;
    let mut prev_txkey = false;
    while shared.run.load(Ordering::SeqCst) && !kill.load(Ordering::SeqCst) {
        if !tick.wait(&mut last_tick, Duration::from_millis(100)) {
            continue;
        }
        let mut st = shared.state.lock();
        let pi = match st.instance_for_node(nodenum) {
            Some(pi) => pi,
            None => continue,
        };
        if !st.instances[pi].drained_once {
            st.instances[pi].drained_once = true;
            continue;
        }
        xmit_tick(&mut st, pi, &shared, &txq, &pagerq, &mut prev_txkey);
    }
    log::debug!("node {nodenum}: transmit worker exited");
}

pub(crate) fn xmit_tick(
    st: &mut VoterState,
    pi: usize,
    shared: &Shared,
    txq: &TxQueue,
    pagerq: &TxQueue,
    prev_txkey: &mut bool,
) {
    let now = Instant::now();
    let nodenum = st.instances[pi].nodenum;
    let members: Vec<usize> = st
        .clients
        .iter()
        .enumerate()
        .filter(|(_, c)| c.nodenum == nodenum)
        .map(|(i, _)| i)
        .collect();

    // Pick this tick's transmit frame: channel audio when the queue has
    // built up (or the channel just unkeyed), pager audio when queued.
    let mut lin: Option<AudioFrame> = None;
    {
        let mut q = txq.lock();
        let n = q.len();
        if n > 0 && (n > TXQ_HIGH_WATER || !st.instances[pi].txkey) {
            lin = q.pop_front();
        }
    }
    {
        let mut q = pagerq.lock();
        if q.is_empty() && st.instances[pi].waspager {
            st.instances[pi].waspager = false;
            st.instances[pi].queue_event(ChannelEvent::Text("ENDPAGE".to_string()));
        }
        if let Some(frame) = q.pop_front() {
            lin = Some(frame);
            st.instances[pi].waspager = true;
        }
    }
    let x = lin.is_some();

    // Sub-audible tone, with the configured turn-off behavior.
    let txkey = st.instances[pi].txkey;
    let toctype = st.instances[pi].txtoctype;
    if let Some(gen) = st.instances[pi].ctcss.as_mut() {
        if *prev_txkey && !txkey && toctype == TxTocType::Phase {
            gen.reverse_phase();
        }
        if let Some(frame) = lin.as_mut() {
            if !(toctype == TxTocType::NoTone && !txkey) {
                gen.mix_frame(frame);
            }
        }
    }
    *prev_txkey = txkey;

    let ulaw: Option<[u8; FRAME_SIZE]> = lin.map(|frame| {
        let mut out = [0u8; FRAME_SIZE];
        for (o, &s) in out.iter_mut().zip(frame.iter()) {
            *o = mulaw_encode(s);
        }
        out
    });

    // Mix-minus keeps transmitting while any mix client is active even
    // with no channel audio.
    let mixminus = st.instances[pi].mixminus;
    let priconn = st.instances[pi].priconn;
    let mx = mixminus
        && members.iter().any(|&ci| {
            let c = &st.clients[ci];
            c.heardfrom
                && c.resp_digest != 0
                && c.mix
                && !c.doadpcm
                && !c.donulaw
                && c.last_rssi > 0
        });

    if x || mx {
        let base = ulaw.unwrap_or([MULAW_SILENCE; FRAME_SIZE]);
        for &ci in &members {
            {
                let c = &st.clients[ci];
                if priconn && !c.mix {
                    continue;
                }
                if c.resp_digest == 0 && c.proxy_addr.is_none() {
                    continue;
                }
                if !c.heardfrom || c.doadpcm || c.donulaw {
                    continue;
                }
            }
            let mut audio = base;
            if mixminus {
                // Per-destination sum of every other active mix client.
                let mut acc: AudioFrame = [0i16; FRAME_SIZE];
                for (s, &b) in acc.iter_mut().zip(base.iter()) {
                    *s = mulaw_decode(b);
                }
                let mut summed = false;
                for &cj in &members {
                    if cj == ci {
                        continue;
                    }
                    let o = &st.clients[cj];
                    if !o.heardfrom
                        || o.resp_digest == 0
                        || !o.mix
                        || o.doadpcm
                        || o.donulaw
                        || o.last_rssi == 0
                    {
                        continue;
                    }
                    mix_saturating(&mut acc, &o.lastaudio);
                    summed = true;
                }
                if !x && !summed {
                    continue;
                }
                for (b, &s) in audio.iter_mut().zip(acc.iter()) {
                    *b = mulaw_encode(s);
                }
            }
            let mut body = [0u8; 1 + FRAME_SIZE];
            body[1..].copy_from_slice(&audio);
            if send_audio_packet(st, shared, ci, PayloadType::Ulaw, &body) {
                st.clients[ci].lastsenttime = Some(now);
            }
        }
    }

    // ADPCM clients get 40 ms pairs: hold the first frame, emit on the
    // second (silence-filled when transmission stops mid-pair).
    if x || st.instances[pi].adpcm_pending.is_some() {
        match st.instances[pi].adpcm_pending.take() {
            None => st.instances[pi].adpcm_pending = ulaw,
            Some(first) => {
                let second = ulaw.unwrap_or([MULAW_SILENCE; FRAME_SIZE]);
                let mut lin40 = [0i16; 2 * FRAME_SIZE];
                for (i, &b) in first.iter().chain(second.iter()).enumerate() {
                    lin40[i] = mulaw_decode(b);
                }
                let mut data = [0u8; ADPCM_FRAME_SIZE];
                st.instances[pi].adpcm_enc.encode_frame(&lin40, &mut data);
                let mut body = [0u8; 1 + ADPCM_FRAME_SIZE];
                body[1..].copy_from_slice(&data);
                for &ci in &members {
                    {
                        let c = &st.clients[ci];
                        if priconn && !c.mix {
                            continue;
                        }
                        if c.resp_digest == 0 && c.proxy_addr.is_none() {
                            continue;
                        }
                        if !c.heardfrom || !c.doadpcm {
                            continue;
                        }
                    }
                    if send_audio_packet(st, shared, ci, PayloadType::Adpcm, &body) {
                        st.clients[ci].lastsenttime = Some(now);
                    }
                }
            }
        }
    }

    // Half-rate μ-law clients, same pairing.
    if x || st.instances[pi].nulaw_pending.is_some() {
        match st.instances[pi].nulaw_pending.take() {
            None => st.instances[pi].nulaw_pending = ulaw,
            Some(first) => {
                let second = ulaw.unwrap_or([MULAW_SILENCE; FRAME_SIZE]);
                let mut lin40 = [0i16; 2 * FRAME_SIZE];
                for (i, &b) in first.iter().chain(second.iter()).enumerate() {
                    lin40[i] = mulaw_decode(b);
                }
                let mut data = [0u8; FRAME_SIZE];
                nulaw_encode(&lin40, &mut st.instances[pi].nulaw_tx_lp, &mut data);
                let mut body = [0u8; 1 + FRAME_SIZE];
                body[1..].copy_from_slice(&data);
                for &ci in &members {
                    {
                        let c = &st.clients[ci];
                        if priconn && !c.mix {
                            continue;
                        }
                        if c.resp_digest == 0 && c.proxy_addr.is_none() {
                            continue;
                        }
                        if !c.heardfrom || !c.donulaw {
                            continue;
                        }
                    }
                    if send_audio_packet(st, shared, ci, PayloadType::Nulaw, &body) {
                        st.clients[ci].lastsenttime = Some(now);
                    }
                }
            }
        }
    }

    service_pings(st, shared, &members);
    send_keepalives(st, shared, &members, priconn, now);
}

/// Build the outbound header for a client: pucked master seconds, with
/// the nanosecond field carrying the mix sequence number for mix clients.
fn outbound_header(
    st: &VoterState,
    shared: &Shared,
    ci: usize,
    pt: PayloadType,
) -> PacketHeader {
    let vt = st.pucked_time(ci);
    let c = &st.clients[ci];
    let nsec = if c.mix {
        c.txseqno
    } else {
        st.master_time.nsec
    };
    PacketHeader::new(vt.sec, nsec, &shared.challenge, c.resp_digest, pt)
}

/// Send an audio packet to a client, wrapping in a proxy envelope when
/// the client is reached through a secondary. Returns whether anything
/// was sent.
fn send_audio_packet(
    st: &VoterState,
    shared: &Shared,
    ci: usize,
    pt: PayloadType,
    body: &[u8],
) -> bool {
    let c = &st.clients[ci];
    if !c.totransmit || c.txlockout {
        return false;
    }
    let addr = match c.addr {
        Some(a) => a,
        None => return false,
    };
    let hdr = outbound_header(st, shared, ci, pt);
    if let Some(proxy_addr) = c.proxy_addr {
        let mut outer = hdr;
        outer.digest = crc32_bufs(c.saved_challenge.as_bytes(), c.password.as_bytes());
        outer.payload_type = PayloadType::Proxy.raw();
        let envelope = ProxyHeader {
            addr: *proxy_addr.ip(),
            port: proxy_addr.port(),
            payload_type: pt.raw(),
            flags: 0,
            challenge: [0u8; voter_proto::CHALLENGE_LEN],
        };
        let mut out = vec![0u8; HEADER_LEN + PROXY_HEADER_LEN + body.len()];
        outer.encode(&mut out);
        envelope.encode(&mut out[HEADER_LEN..]);
        out[HEADER_LEN + PROXY_HEADER_LEN..].copy_from_slice(body);
        log::trace!(
            "node {}: sending proxied TX packet to {} digest {:08x}",
            c.nodenum,
            c.name,
            outer.digest
        );
        let _ = shared.socket.send_to(&out, addr);
        true
    } else {
        let mut out = vec![0u8; HEADER_LEN + body.len()];
        hdr.encode(&mut out);
        out[HEADER_LEN..].copy_from_slice(body);
        log::trace!(
            "node {}: sending TX packet to {} digest {:08x}",
            c.nodenum,
            c.name,
            c.resp_digest
        );
        let _ = shared.socket.send_to(&out, addr);
        true
    }
}

/// Transmit outstanding pings at 250 ms spacing and close out finished
/// batches.
fn service_pings(st: &mut VoterState, shared: &Shared, members: &[usize]) {
    let now_wall = walltime_now();
    for &ci in members {
        {
            let c = &st.clients[ci];
            if c.resp_digest == 0 || !c.heardfrom || c.proxy_addr.is_some() {
                continue;
            }
        }
        st.clients[ci].check_ping_done(now_wall, PING_TIMEOUT_MS);
        {
            let ping = &st.clients[ci].ping;
            if ping.requested == 0 || ping.sent >= ping.requested {
                continue;
            }
            if ping.sent != 0
                && walltime_diff_ms(now_wall, ping.start) < PING_TIME_MS * ping.sent as i64
            {
                continue;
            }
        }
        {
            let ping = &mut st.clients[ci].ping;
            if ping.sent == 0 {
                ping.start = now_wall;
                ping.last_rx = None;
            }
            ping.sent += 1;
            ping.seqno = ping.seqno.wrapping_add(1);
        }
        let body_struct = PingBody {
            seqno: st.clients[ci].ping.seqno,
            txtime: now_wall,
            starttime: st.clients[ci].ping.start,
        };
        let hdr = outbound_header(st, shared, ci, PayloadType::Ping);
        let c = &st.clients[ci];
        if let Some(addr) = c.addr {
            let mut out = [0u8; HEADER_LEN + PING_BODY_LEN];
            hdr.encode(&mut out);
            body_struct.encode(&mut out[HEADER_LEN..]);
            log::debug!(
                "node {}: sending ping {} to {}",
                c.nodenum,
                body_struct.seqno,
                c.name
            );
            let _ = shared.socket.send_to(&out, addr);
        }
    }
}

/// Keep NAT bindings and client liveness alive with empty GPS packets.
fn send_keepalives(
    st: &mut VoterState,
    shared: &Shared,
    members: &[usize],
    priconn: bool,
    now: Instant,
) {
    for &ci in members {
        {
            let c = &st.clients[ci];
            if c.resp_digest == 0 && c.proxy_addr.is_none() {
                continue;
            }
            if priconn && !c.mix && c.proxy_addr.is_none() {
                continue;
            }
            if !c.heardfrom {
                continue;
            }
            if since_ms(c.lastsenttime, now) < TX_KEEPALIVE_MS {
                continue;
            }
        }
        let hdr = outbound_header(st, shared, ci, PayloadType::Gps);
        let c = &st.clients[ci];
        let addr = match c.addr {
            Some(a) => a,
            None => continue,
        };
        if let Some(proxy_addr) = c.proxy_addr {
            let mut outer = hdr;
            outer.digest = crc32_bufs(c.saved_challenge.as_bytes(), c.password.as_bytes());
            outer.payload_type = PayloadType::Proxy.raw();
            let envelope = ProxyHeader {
                addr: *proxy_addr.ip(),
                port: proxy_addr.port(),
                payload_type: PayloadType::Gps.raw(),
                flags: 0,
                challenge: [0u8; voter_proto::CHALLENGE_LEN],
            };
            let mut out = [0u8; HEADER_LEN + PROXY_HEADER_LEN];
            outer.encode(&mut out);
            envelope.encode(&mut out[HEADER_LEN..]);
            let _ = shared.socket.send_to(&out, addr);
        } else {
            let mut out = [0u8; HEADER_LEN];
            hdr.encode(&mut out);
            let _ = shared.socket.send_to(&out, addr);
        }
        log::trace!("node {}: keepalive to {}", c.nodenum, c.name);
        st.clients[ci].lastsenttime = Some(now);
    }
}
