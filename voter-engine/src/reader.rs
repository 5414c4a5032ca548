//! UDP reader: authentication, payload dispatch, buffer writes, and the
//! master-tick voting trigger.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use voter_dsp::{mulaw_encode, MULAW_SILENCE};
use voter_proto::{
    crc32_bufs, AuthFlags, GpsPayload, PacketHeader, PayloadType, PingBody, ProxyHeader,
    ADPCM_FRAME_SIZE, FRAME_SIZE, HEADER_LEN, PING_BODY_LEN, PROXY_HEADER_LEN,
};

use crate::channel::ChannelEvent;
use crate::state::{Shared, VoterState, MAX_MASTER_COUNT, PING_TIMEOUT_MS, RX_TIMEOUT_MS};
use crate::time::{since_ms, walltime_now, VTime};
use crate::voting::run_voting_cycle;

/// Reader thread body: drains the shared socket until shutdown.
pub(crate) fn reader_loop(shared: Arc<Shared>) {
    log::debug!("reader thread started");
    let mut buf = [0u8; 4096];
    while shared.run.load(Ordering::SeqCst) {
        {
            let mut st = shared.state.lock();
            check_rx_timeouts(&mut st, Instant::now());
        }
        let (len, src) = match shared.socket.recv_from(&mut buf) {
            Ok(x) => x,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => {
                log::error!("recvfrom failed: {e}");
                continue;
            }
        };
        let src = match src {
            SocketAddr::V4(v4) => v4,
            _ => continue,
        };
        if len < HEADER_LEN {
            continue;
        }
        let hdr = match PacketHeader::parse(&buf[..len]) {
            Some(h) => h,
            None => continue,
        };
        let mut st = shared.state.lock();
        handle_packet(&mut st, &shared, &hdr, &buf[HEADER_LEN..len], src, Instant::now());
    }
    log::debug!("reader thread exited");
}

/// Unkey any instance whose carrier has gone quiet.
pub(crate) fn check_rx_timeouts(st: &mut VoterState, now: Instant) {
    for p in &mut st.instances {
        if !p.rxkey {
            continue;
        }
        if since_ms(p.lastrxtime, now) > RX_TIMEOUT_MS {
            log::debug!("node {}: receiver stopped (rx timeout)", p.nodenum);
            p.queue_event(ChannelEvent::RadioUnkey);
            p.rxkey = false;
            p.last_won = None;
        }
    }
}

pub(crate) fn handle_packet(
    st: &mut VoterState,
    shared: &Shared,
    hdr: &PacketHeader,
    body: &[u8],
    mut src: SocketAddrV4,
    now: Instant,
) {
    // With sanity checking off, all traffic is folded onto the master's
    // source port (NAT deployments present one rewritten port).
    if !st.sanity && st.master_port != 0 {
        src.set_port(st.master_port);
    }

    if hdr.digest == 0 {
        send_auth_response(st, shared, None, None, hdr, body, src, None);
        return;
    }

    let ci = match st.client_by_digest(hdr.digest) {
        Some(ci) => ci,
        // Unknown digest: drop without a reply.
        None => return,
    };
    let pi = match st.instance_for_node(st.clients[ci].nodenum) {
        Some(pi) => pi,
        None => {
            // The client maps to a node with no live instance: act as if
            // unknown, do not answer.
            log::debug!(
                "client {} maps to node {} with no instance",
                st.clients[ci].name,
                st.clients[ci].nodenum
            );
            return;
        }
    };

    if st.sanity && !st.instances[pi].priconn {
        let c = &mut st.clients[ci];
        if let Some(addr) = c.addr {
            if addr != src {
                c.heardfrom = false;
            }
        }
        if c.proxy_addr.is_some() {
            c.heardfrom = false;
            c.resp_digest = 0;
        }
    }

    st.clients[ci].lastheardtime = Some(now);
    elect_master(st, ci, now);

    if hdr.payload() != Some(PayloadType::Proxy) {
        st.clients[ci].resp_digest = crc32_bufs(&hdr.challenge, st.password.as_bytes());
    }
    st.clients[ci].addr = Some(src);
    st.clients[ci].proxy_addr = None;

    if !st.clients[ci].curmaster && st.hasmaster {
        if st.last_master_count != 0
            && st.voter_timing_count > st.last_master_count + MAX_MASTER_COUNT
        {
            st.lost_master();
            return;
        }
        if st.master_time.sec == 0 {
            return;
        }
    }

    if hdr.payload_type != 0 {
        st.clients[ci].heardfrom = true;
    }

    let pt = hdr.payload();
    let heard = st.clients[ci].heardfrom;
    let audio_sized = match pt {
        Some(PayloadType::Ulaw) | Some(PayloadType::Nulaw) => body.len() == FRAME_SIZE + 1,
        Some(PayloadType::Adpcm) => body.len() == ADPCM_FRAME_SIZE + 1,
        Some(PayloadType::Proxy) => true,
        _ => false,
    };
    if heard && audio_sized {
        handle_audio_or_proxy(st, shared, ci, pi, hdr, body, src, now);
        return;
    }
    if heard && pt == Some(PayloadType::Ping) && body.len() == PING_BODY_LEN {
        handle_ping_reply(st, ci, body);
        return;
    }
    if heard
        && pt == Some(PayloadType::Gps)
        && (body.is_empty() || GpsPayload::len_ok(body.len()))
    {
        handle_gps(st, shared, ci, pi, hdr, body, src, now, false);
        return;
    }

    // Malformed or unknown payloads are dropped without a reply; only
    // authentication traffic reaches the responder.
    if hdr.payload_type != 0 {
        return;
    }
    st.clients[ci].heardfrom = true;
    send_auth_response(st, shared, Some(ci), Some(pi), hdr, body, src, None);
}

/// Re-elect the current master: prefer the first configured master heard
/// recently, else the packet's own client if it is one, else any
/// configured master.
fn elect_master(st: &mut VoterState, ci: usize, now: Instant) {
    let mut lastmaster = None;
    for (i, c) in st.clients.iter_mut().enumerate() {
        if c.curmaster {
            lastmaster = Some(i);
            c.curmaster = false;
        }
    }
    let mut chosen = None;
    for i in 0..st.clients.len() {
        if !st.clients[i].ismaster || st.clients[i].lastheardtime.is_none() {
            continue;
        }
        if since_ms(st.clients[i].lastheardtime, now) > crate::state::MASTER_TIMEOUT_MS {
            continue;
        }
        chosen = Some(i);
        break;
    }
    if chosen.is_none() {
        if st.clients[ci].ismaster {
            chosen = Some(ci);
        } else {
            chosen = (0..st.clients.len()).find(|&i| st.clients[i].ismaster);
        }
    }
    if let Some(i) = chosen {
        st.clients[i].curmaster = true;
        if lastmaster != Some(i) {
            log::info!(
                "master changed from {} to {}",
                lastmaster.map_or("NONE", |l| st.clients[l].name.as_str()),
                st.clients[i].name
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_audio_or_proxy(
    st: &mut VoterState,
    shared: &Shared,
    ci: usize,
    pi: usize,
    hdr: &PacketHeader,
    body: &[u8],
    src: SocketAddrV4,
    now: Instant,
) {
    st.clients[ci].lastheardtime = Some(now);

    let mut payload = hdr.payload().unwrap();
    let mut body = body;

    if st.clients[ci].curmaster {
        if st.master_time.sec == 0 {
            st.flush_txqs();
        }
        st.last_master_count = st.voter_timing_count;
        st.master_time = VTime::new(hdr.vtime_sec, hdr.vtime_nsec);
        if st.master_port == 0 {
            st.master_port = src.port();
        }
    } else {
        if st.master_time.sec == 0 {
            return;
        }
        if payload == PayloadType::Proxy {
            let proxy = match ProxyHeader::parse(body) {
                Some(p) => p,
                None => return,
            };
            let inner = &body[PROXY_HEADER_LEN..];
            let inner_addr = SocketAddrV4::new(proxy.addr, proxy.port);

            if !st.instances[pi].isprimary {
                // We are the secondary: this is outbound traffic from the
                // primary. Re-stamp it as our own and pass it to the
                // real client.
                let mut fwd = hdr.clone();
                fwd.digest = st.clients[ci].resp_digest;
                fwd.set_challenge(&shared.challenge);
                fwd.payload_type = proxy.payload_type;
                let mut out = vec![0u8; HEADER_LEN + inner.len()];
                fwd.encode(&mut out);
                out[HEADER_LEN..].copy_from_slice(inner);
                let _ = shared.socket.send_to(&out, inner_addr);
                return;
            }

            let mut saved = [0u8; voter_proto::CHALLENGE_LEN];
            saved.copy_from_slice(&proxy.challenge);
            let end = saved.iter().position(|&b| b == 0).unwrap_or(saved.len());
            st.clients[ci].saved_challenge =
                String::from_utf8_lossy(&saved[..end]).into_owned();
            st.clients[ci].proxy_addr = Some(inner_addr);
            st.clients[ci].mix = proxy.flags & AuthFlags::MIX != 0;
            log::debug!(
                "unwrapped proxy packet for {} payload {} from {}",
                st.clients[ci].name,
                proxy.payload_type,
                src
            );

            match proxy.payload() {
                Some(PayloadType::Gps)
                    if inner.is_empty() || GpsPayload::len_ok(inner.len()) =>
                {
                    handle_gps(st, shared, ci, pi, hdr, inner, src, now, true);
                    return;
                }
                Some(pt2 @ (PayloadType::Ulaw | PayloadType::Nulaw))
                    if inner.len() == FRAME_SIZE + 1 =>
                {
                    payload = pt2;
                    body = inner;
                }
                Some(PayloadType::Adpcm) if inner.len() == ADPCM_FRAME_SIZE + 1 => {
                    payload = PayloadType::Adpcm;
                    body = inner;
                }
                Some(PayloadType::None) => {
                    send_auth_response(st, shared, Some(ci), Some(pi), hdr, inner, src, Some(inner_addr));
                    return;
                }
                _ => return,
            }
        } else if st.instances[pi].priconn && !st.clients[ci].mix {
            forward_to_primary(st, shared, ci, pi, hdr, body, src);
            return;
        }
    }

    write_client_audio(st, ci, hdr, payload, body);

    if st.clients[ci].curmaster {
        st.timeout_scan(now);
        st.sanity_scan();
        st.xmit_master_tick();
        run_voting_cycle(st, &shared.socket, now, true);
    }
}

/// Compute the write index for a packet and place its decoded audio and
/// RSSI into the client's rings.
pub(crate) fn write_client_audio(
    st: &mut VoterState,
    ci: usize,
    hdr: &PacketHeader,
    payload: PayloadType,
    body: &[u8],
) {
    let buflen = st.clients[ci].buflen as i64;
    let bufdelay = buflen - 2 * FRAME_SIZE as i64;

    let index: i64 = if st.clients[ci].mix {
        let c = &mut st.clients[ci];
        if hdr.vtime_nsec > c.rxseqno {
            c.reset_mix_seq();
        }
        if c.txseqno > c.txseqno_rxkeyed.wrapping_add(4) {
            c.reset_mix_seq();
        }
        c.txseqno_rxkeyed = c.txseqno;
        if c.rxseqno == 0 {
            c.rxseqno = hdr.vtime_nsec;
            c.rxseqno_40ms = hdr.vtime_nsec;
        }
        let base = if !c.doadpcm && !c.donulaw {
            c.rxseqno
        } else {
            c.rxseqno_40ms
        };
        (hdr.vtime_nsec as i64 - base as i64) * FRAME_SIZE as i64 + bufdelay
            - 4 * FRAME_SIZE as i64
    } else {
        let mut btime = st.master_time.as_nanos() + 40_000_000;
        if st.clients[ci].curmaster {
            btime -= 20_000_000;
        }
        let ptime = VTime::new(hdr.vtime_sec, hdr.vtime_nsec).as_nanos();
        let difftime = (ptime - btime) + bufdelay * 125_000 - st.puck_offset(ci);
        difftime / 125_000
    };

    if index <= 0 || index >= buflen - 2 * FRAME_SIZE as i64 {
        if st.clients[ci].mix {
            log::debug!(
                "mix client {} write index {} out of bounds, resetting",
                st.clients[ci].name,
                index
            );
            st.clients[ci].reset_mix_seq();
        }
        return;
    }

    let rssi = body[0];
    let single_rate = !st.clients[ci].doadpcm && !st.clients[ci].donulaw;
    let base = if single_rate {
        st.clients[ci].drainindex
    } else {
        st.clients[ci].drainindex_40ms
    };
    let at = (index as usize + base) % st.clients[ci].buflen;

    match payload {
        PayloadType::Ulaw => {
            if rssi == 0 {
                st.clients[ci].write_at(at, &[MULAW_SILENCE; FRAME_SIZE], 0);
            } else {
                let mut audio = [0u8; FRAME_SIZE];
                audio.copy_from_slice(&body[1..1 + FRAME_SIZE]);
                st.clients[ci].write_at(at, &audio, rssi);
            }
        }
        PayloadType::Adpcm => {
            if rssi == 0 {
                st.clients[ci].write_at(at, &[MULAW_SILENCE; FRAME_SIZE], 0);
            } else {
                let mut data = [0u8; ADPCM_FRAME_SIZE];
                data.copy_from_slice(&body[1..1 + ADPCM_FRAME_SIZE]);
                let mut lin = [0i16; 2 * FRAME_SIZE];
                st.clients[ci].adpcm_dec.decode_frame(&data, &mut lin);
                let mut ulaw = [0u8; 2 * FRAME_SIZE];
                for (u, &s) in ulaw.iter_mut().zip(lin.iter()) {
                    *u = mulaw_encode(s);
                }
                st.clients[ci].write_at(at, &ulaw, rssi);
            }
        }
        PayloadType::Nulaw => {
            if rssi == 0 {
                st.clients[ci].write_at(at, &[MULAW_SILENCE; FRAME_SIZE], 0);
            } else {
                let mut data = [0u8; FRAME_SIZE];
                data.copy_from_slice(&body[1..1 + FRAME_SIZE]);
                let mut lin = [0i16; 2 * FRAME_SIZE];
                let c = &mut st.clients[ci];
                voter_dsp::nulaw_decode(&data, &mut c.nulaw_lp, &mut lin);
                let mut ulaw = [0u8; 2 * FRAME_SIZE];
                for (u, &s) in ulaw.iter_mut().zip(lin.iter()) {
                    *u = mulaw_encode(s);
                }
                c.write_at(at, &ulaw, rssi);
            }
        }
        _ => {}
    }
}

fn handle_ping_reply(st: &mut VoterState, ci: usize, body: &[u8]) {
    let ping = match PingBody::parse(body) {
        Some(p) => p,
        None => return,
    };
    let now = walltime_now();
    if let Some(diff) =
        st.clients[ci].record_ping_response(ping.seqno, ping.txtime, ping.starttime, now)
    {
        log::info!(
            "PING ({}) response: seqno {} diff {} ms",
            st.clients[ci].name,
            ping.seqno,
            diff
        );
    }
    st.clients[ci].check_ping_done(now, PING_TIMEOUT_MS);
}

#[allow(clippy::too_many_arguments)]
fn handle_gps(
    st: &mut VoterState,
    shared: &Shared,
    ci: usize,
    pi: usize,
    hdr: &PacketHeader,
    body: &[u8],
    src: SocketAddrV4,
    now: Instant,
    from_proxy: bool,
) {
    if !from_proxy {
        st.clients[ci].lastheardtime = Some(now);
        st.clients[ci].lastgpstime = VTime::new(hdr.vtime_sec, hdr.vtime_nsec);
        if st.clients[ci].curmaster {
            st.mastergps_time = VTime::new(hdr.vtime_sec, hdr.vtime_nsec);
        } else if st.instances[pi].priconn && !st.clients[ci].mix {
            forward_to_primary(st, shared, ci, pi, hdr, body, src);
            return;
        }
    }
    st.clients[ci].lastmastergpstime = st.mastergps_time;
    if body.is_empty() {
        log::trace!("got GPS keepalive from {}", st.clients[ci].name);
        return;
    }
    let gps = match GpsPayload::parse(body) {
        Some(g) => g,
        None => return,
    };
    log::debug!(
        "got GPS position from {}: lat {} lon {} elev {}",
        st.clients[ci].name,
        gps.lat,
        gps.lon,
        gps.elev
    );
    if let Some(gpsid) = st.clients[ci].gpsid.clone() {
        let work = format!("{}/gps{}.tmp", st.gps_dir, gpsid);
        let data = format!("{}/gps{}.dat", st.gps_dir, gpsid);
        let (sec, _) = walltime_now();
        let line = format!("{} {} {} {}M\n", sec, gps.lat, gps.lon, gps.elev);
        if let Err(e) = std::fs::write(&work, line).and_then(|_| std::fs::rename(&work, &data)) {
            log::error!("unable to write GPS file {work}: {e}");
        }
    }
}

/// Wrap a client packet in a proxy envelope and relay it to the primary.
fn forward_to_primary(
    st: &VoterState,
    shared: &Shared,
    ci: usize,
    pi: usize,
    hdr: &PacketHeader,
    body: &[u8],
    src: SocketAddrV4,
) {
    let p = &st.instances[pi];
    let primary = match &p.primary {
        Some(pr) => pr,
        None => return,
    };
    let c = &st.clients[ci];
    let mut flags = 0u8;
    if c.ismaster {
        flags |= AuthFlags::MASTER | AuthFlags::MASTER_IND;
    }
    if c.doadpcm {
        flags |= AuthFlags::ADPCM;
    }
    if c.mix {
        flags |= AuthFlags::MIX;
    }
    if c.nodeemp || p.hostdeemp {
        flags |= AuthFlags::DEEMP;
    }
    if c.noplfilter {
        flags |= AuthFlags::NO_PL_FILTER;
    }
    let mut challenge = [0u8; voter_proto::CHALLENGE_LEN];
    let chal_bytes = shared.challenge.as_bytes();
    let n = chal_bytes.len().min(challenge.len());
    challenge[..n].copy_from_slice(&chal_bytes[..n]);
    let proxy = ProxyHeader {
        addr: *src.ip(),
        port: src.port(),
        payload_type: hdr.payload_type,
        flags,
        challenge,
    };
    let mut outer = hdr.clone();
    outer.digest = crc32_bufs(p.primary_challenge.as_bytes(), c.password.as_bytes());
    outer.payload_type = PayloadType::Proxy.raw();

    let mut out = vec![0u8; HEADER_LEN + PROXY_HEADER_LEN + body.len()];
    outer.encode(&mut out);
    proxy.encode(&mut out[HEADER_LEN..]);
    out[HEADER_LEN + PROXY_HEADER_LEN..].copy_from_slice(body);
    log::debug!(
        "relayed {} payload {} to primary {} digest {:08x}",
        c.name,
        hdr.payload_type,
        primary.addr,
        outer.digest
    );
    let _ = shared.socket.send_to(&out, primary.addr);
}

/// Answer an authentication request (or re-request). `proxy_reply_to`
/// carries the real client address when the request arrived through a
/// secondary; the reply is then wrapped and sent back through it.
#[allow(clippy::too_many_arguments)]
fn send_auth_response(
    st: &mut VoterState,
    shared: &Shared,
    ci: Option<usize>,
    pi: Option<usize>,
    hdr: &PacketHeader,
    body: &[u8],
    src: SocketAddrV4,
    proxy_reply_to: Option<SocketAddrV4>,
) {
    if let Some(ci) = ci {
        st.clients[ci].reset_session();
    }

    let (wsec, wusec) = walltime_now();
    let mut reply = PacketHeader::new(
        wsec as u32,
        (wusec * 1000) as u32,
        &shared.challenge,
        crc32_bufs(&hdr.challenge, st.password.as_bytes()),
        PayloadType::None,
    );
    let mut flags = 0u8;

    if let Some(ci) = ci {
        if hdr.payload_type == 0 {
            st.clients[ci].mix = false;
            if !body.is_empty() {
                if st.clients[ci].ismaster {
                    log::warn!(
                        "master timing source {} attempting to authenticate as a mix client",
                        st.clients[ci].name
                    );
                    st.clients[ci].invalidate();
                    return;
                }
                if body[0] & AuthFlags::MIX != 0 {
                    st.clients[ci].mix = true;
                }
            }
            if !st.clients[ci].mix && !st.hasmaster {
                let c = &mut st.clients[ci];
                if since_ms(c.warntime, Instant::now())
                    >= crate::state::CLIENT_WARN_SECS * 1000
                {
                    c.warntime = Some(Instant::now());
                    log::warn!(
                        "client {} authenticating as GPS-timed with no master timing source defined",
                        c.name
                    );
                }
                reply.digest = 0;
                st.clients[ci].invalidate();
            } else {
                let hostdeemp = pi.map_or(false, |pi| st.instances[pi].hostdeemp);
                let c = &st.clients[ci];
                if c.ismaster {
                    flags |= AuthFlags::MASTER | AuthFlags::MASTER_IND;
                }
                if c.doadpcm {
                    flags |= AuthFlags::ADPCM;
                }
                if c.mix {
                    flags |= AuthFlags::MIX;
                }
                if c.nodeemp || hostdeemp {
                    flags |= AuthFlags::DEEMP;
                }
                if c.noplfilter {
                    flags |= AuthFlags::NO_PL_FILTER;
                }
            }
        }
    }

    if let Some(client_addr) = proxy_reply_to {
        let mut challenge = [0u8; voter_proto::CHALLENGE_LEN];
        let chal_bytes = shared.challenge.as_bytes();
        let n = chal_bytes.len().min(challenge.len());
        challenge[..n].copy_from_slice(&chal_bytes[..n]);
        let proxy = ProxyHeader {
            addr: *client_addr.ip(),
            port: client_addr.port(),
            payload_type: 0,
            flags,
            challenge,
        };
        reply.payload_type = PayloadType::Proxy.raw();
        let mut out = [0u8; HEADER_LEN + PROXY_HEADER_LEN + 1];
        reply.encode(&mut out);
        proxy.encode(&mut out[HEADER_LEN..]);
        out[HEADER_LEN + PROXY_HEADER_LEN] = flags;
        let _ = shared.socket.send_to(&out, src);
    } else {
        log::debug!(
            "sending auth response digest {:08x} flags {:02x} to {}",
            reply.digest,
            flags,
            src
        );
        let mut out = [0u8; HEADER_LEN + 1];
        reply.encode(&mut out);
        out[HEADER_LEN] = flags;
        let _ = shared.socket.send_to(&out, src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::ClientConfig;
    use crate::test_support::{state_with, test_instance, test_shared};

    fn client(name: &str, node: u32, buflen: usize) -> Client {
        let cfg = ClientConfig {
            name: name.into(),
            password: format!("{name}-pw"),
            ..Default::default()
        };
        Client::from_config(&cfg, node, buflen, "srvchal")
    }

    fn mix_client(name: &str, node: u32, buflen: usize) -> Client {
        let mut c = client(name, node, buflen);
        c.mix = true;
        c.heardfrom = true;
        c.resp_digest = 1;
        c
    }

    #[test]
    fn auth_handshake_assigns_digest_and_grants_flags() {
        let shared = test_shared();
        let mut st = state_with(vec![test_instance(1)], vec![client("a", 1, 640)]);
        st.hasmaster = false;
        let src = "10.0.0.2:4000".parse().unwrap();

        // Initial request: digest 0, client requests mix via flag byte.
        let hdr = PacketHeader::new(0, 0, "clientchal", 0, PayloadType::None);
        handle_packet(&mut st, &shared, &hdr, &[AuthFlags::MIX], src, Instant::now());

        // Second round: client presents CRC32(server challenge, password).
        let digest = crc32_bufs(b"srvchal", b"a-pw");
        assert_eq!(st.clients[0].digest, digest);
        let hdr = PacketHeader::new(0, 0, "clientchal", digest, PayloadType::None);
        handle_packet(&mut st, &shared, &hdr, &[AuthFlags::MIX], src, Instant::now());

        let c = &st.clients[0];
        assert!(c.mix);
        assert!(c.heardfrom);
        assert_eq!(c.addr, Some(src));
        assert_eq!(
            c.resp_digest,
            crc32_bufs(b"clientchal", st.password.as_bytes())
        );
    }

    #[test]
    fn master_cannot_be_mix() {
        let shared = test_shared();
        let mut st = state_with(vec![test_instance(1)], vec![client("m", 1, 640)]);
        st.clients[0].ismaster = true;
        st.hasmaster = true;
        let src = "10.0.0.2:4000".parse().unwrap();
        let digest = st.clients[0].digest;
        let hdr = PacketHeader::new(0, 0, "chal", digest, PayloadType::None);
        handle_packet(&mut st, &shared, &hdr, &[AuthFlags::MIX], src, Instant::now());
        assert!(!st.clients[0].heardfrom);
        assert_eq!(st.clients[0].resp_digest, 0);
    }

    #[test]
    fn voted_client_without_master_refused() {
        let shared = test_shared();
        let mut st = state_with(vec![test_instance(1)], vec![client("a", 1, 640)]);
        st.hasmaster = false;
        let src = "10.0.0.2:4000".parse().unwrap();
        let digest = st.clients[0].digest;
        let hdr = PacketHeader::new(0, 0, "chal", digest, PayloadType::None);
        handle_packet(&mut st, &shared, &hdr, &[], src, Instant::now());
        assert!(!st.clients[0].heardfrom);
        assert_eq!(st.clients[0].resp_digest, 0);
    }

    #[test]
    fn mix_audio_lands_at_buffer_delay() {
        let mut st = state_with(vec![test_instance(1)], vec![mix_client("m", 1, 3840)]);
        st.master_time = VTime::new(100, 0);
        let hdr = PacketHeader::new(0, 50, "c", 1, PayloadType::Ulaw);
        let mut body = vec![200u8];
        body.extend_from_slice(&[0x21; FRAME_SIZE]);
        write_client_audio(&mut st, 0, &hdr, PayloadType::Ulaw, &body);

        // First packet seeds the sequence: index = bufdelay - 640.
        let expect = 3840 - 320 - 640;
        assert_eq!(st.clients[0].rxseqno, 50);
        assert_eq!(st.clients[0].audio[expect], 0x21);
        assert_eq!(st.clients[0].rssi[expect], 200);
        assert_eq!(st.clients[0].audio[expect + FRAME_SIZE - 1], 0x21);
        assert_eq!(st.clients[0].audio[expect + FRAME_SIZE], MULAW_SILENCE);
    }

    #[test]
    fn zero_rssi_writes_silence() {
        let mut st = state_with(vec![test_instance(1)], vec![mix_client("m", 1, 3840)]);
        let hdr = PacketHeader::new(0, 50, "c", 1, PayloadType::Ulaw);
        let mut body = vec![0u8];
        body.extend_from_slice(&[0x21; FRAME_SIZE]);
        write_client_audio(&mut st, 0, &hdr, PayloadType::Ulaw, &body);
        let expect = 3840 - 320 - 640;
        assert_eq!(st.clients[0].audio[expect], MULAW_SILENCE);
        assert_eq!(st.clients[0].rssi[expect], 0);
    }

    #[test]
    fn minimum_buffer_drops_everything() {
        // buflen 320: the in-bounds window (0, buflen-320) is empty, so
        // every mix packet resets the sequence state.
        let mut st = state_with(vec![test_instance(1)], vec![mix_client("m", 1, 320)]);
        let hdr = PacketHeader::new(0, 50, "c", 1, PayloadType::Ulaw);
        let mut body = vec![200u8];
        body.extend_from_slice(&[0x21; FRAME_SIZE]);
        write_client_audio(&mut st, 0, &hdr, PayloadType::Ulaw, &body);
        assert_eq!(st.clients[0].rxseqno, 0);
        assert!(st.clients[0].audio.iter().all(|&b| b == MULAW_SILENCE));
    }

    #[test]
    fn voted_client_index_from_master_time() {
        let mut st = state_with(vec![test_instance(1)], vec![client("v", 1, 3840)]);
        st.clients[0].heardfrom = true;
        st.master_time = VTime::new(100, 0);
        // Packet stamped exactly at master time: index = bufdelay - 40ms
        // in samples = 3520 - 320 = 3200.
        let hdr = PacketHeader::new(100, 0, "c", 1, PayloadType::Ulaw);
        let mut body = vec![150u8];
        body.extend_from_slice(&[0x33; FRAME_SIZE]);
        write_client_audio(&mut st, 0, &hdr, PayloadType::Ulaw, &body);
        assert_eq!(st.clients[0].audio[3200], 0x33);
        assert_eq!(st.clients[0].rssi[3200], 150);
    }

    #[test]
    fn late_voted_packet_dropped() {
        let mut st = state_with(vec![test_instance(1)], vec![client("v", 1, 3840)]);
        st.clients[0].heardfrom = true;
        st.master_time = VTime::new(100, 500_000_000);
        // Packet stamped far in the past: negative index, dropped.
        let hdr = PacketHeader::new(99, 0, "c", 1, PayloadType::Ulaw);
        let mut body = vec![150u8];
        body.extend_from_slice(&[0x33; FRAME_SIZE]);
        write_client_audio(&mut st, 0, &hdr, PayloadType::Ulaw, &body);
        assert!(st.clients[0].audio.iter().all(|&b| b == MULAW_SILENCE));
        // Voted clients do not reset sequence state on drops.
        assert_eq!(st.clients[0].rxseqno, 0);
    }

    #[test]
    fn puck_offset_shifts_write_position() {
        let mut st = state_with(vec![test_instance(1)], vec![client("v", 1, 3840)]);
        st.clients[0].heardfrom = true;
        st.puckit = true;
        st.master_time = VTime::new(100, 0);
        // Client's puck runs 20 ms fast relative to the master.
        st.clients[0].lastgpstime = VTime::new(100, 20_000_000);
        st.clients[0].lastmastergpstime = VTime::new(100, 0);
        let hdr = PacketHeader::new(100, 0, "c", 1, PayloadType::Ulaw);
        let mut body = vec![150u8];
        body.extend_from_slice(&[0x33; FRAME_SIZE]);
        write_client_audio(&mut st, 0, &hdr, PayloadType::Ulaw, &body);
        assert_eq!(st.clients[0].audio[3200 - FRAME_SIZE], 0x33);
    }

    #[test]
    fn master_packet_updates_timebase_and_votes() {
        let shared = test_shared();
        let mut st = state_with(
            vec![test_instance(1)],
            vec![client("m", 1, 3840), client("v", 1, 3840)],
        );
        st.hasmaster = true;
        st.clients[0].ismaster = true;
        st.clients[0].heardfrom = true;
        st.voter_timing_count = 10;
        let src = "10.0.0.2:4000".parse().unwrap();
        let digest = st.clients[0].digest;
        let mut body = vec![90u8];
        body.extend_from_slice(&[0x21; FRAME_SIZE]);
        let hdr = PacketHeader::new(500, 0, "c", digest, PayloadType::Ulaw);
        handle_packet(&mut st, &shared, &hdr, &body, src, Instant::now());

        assert_eq!(st.master_time, VTime::new(500, 0));
        assert_eq!(st.last_master_count, 10);
        assert!(st.clients[0].curmaster);
        assert_eq!(st.master_port, 4000);
        // Voting ran: drain advanced.
        assert_eq!(st.clients[0].drainindex, FRAME_SIZE);
        assert_eq!(st.clients[1].drainindex, FRAME_SIZE);
    }

    #[test]
    fn master_silence_drops_timebase() {
        let shared = test_shared();
        let mut st = state_with(
            vec![test_instance(1)],
            vec![client("m", 1, 3840), client("v", 1, 3840)],
        );
        st.hasmaster = true;
        st.clients[0].ismaster = true;
        st.clients[1].heardfrom = true;
        st.master_time = VTime::new(500, 0);
        st.last_master_count = 10;
        st.voter_timing_count = 14; // more than 3 ticks past the master
        st.instances[0].rxkey = true;

        let src = "10.0.0.3:4001".parse().unwrap();
        let digest = st.clients[1].digest;
        let mut body = vec![90u8];
        body.extend_from_slice(&[0x21; FRAME_SIZE]);
        let hdr = PacketHeader::new(500, 0, "c", digest, PayloadType::Ulaw);
        handle_packet(&mut st, &shared, &hdr, &body, src, Instant::now());

        assert!(st.master_time.is_zero());
        assert_eq!(st.last_master_count, 0);
        assert!(!st.instances[0].rxkey);
    }

    #[test]
    fn ping_reply_updates_stats() {
        let shared = test_shared();
        let mut st = state_with(vec![test_instance(1)], vec![client("a", 1, 640)]);
        st.hasmaster = false;
        st.clients[0].heardfrom = true;
        let start = walltime_now();
        st.clients[0].ping.requested = 1;
        st.clients[0].ping.sent = 1;
        st.clients[0].ping.start = start;

        let body_struct = PingBody {
            seqno: 1,
            txtime: start,
            starttime: start,
        };
        let mut body = [0u8; PING_BODY_LEN];
        body_struct.encode(&mut body);
        let digest = st.clients[0].digest;
        let hdr = PacketHeader::new(0, 0, "c", digest, PayloadType::Ping);
        let src = "10.0.0.2:4000".parse().unwrap();
        handle_packet(&mut st, &shared, &hdr, &body, src, Instant::now());

        assert_eq!(st.clients[0].ping.requested, 0);
        let summary = st.clients[0].ping.last_summary.unwrap();
        assert_eq!(summary.received, 1);
    }

    #[test]
    fn gps_updates_times_and_master_reference() {
        let shared = test_shared();
        let mut st = state_with(vec![test_instance(1)], vec![client("m", 1, 640)]);
        st.hasmaster = true;
        st.clients[0].ismaster = true;
        st.clients[0].heardfrom = true;
        st.master_time = VTime::new(10, 0);
        let digest = st.clients[0].digest;
        let hdr = PacketHeader::new(123, 456, "c", digest, PayloadType::Gps);
        let src = "10.0.0.2:4000".parse().unwrap();
        handle_packet(&mut st, &shared, &hdr, &[], src, Instant::now());
        assert_eq!(st.clients[0].lastgpstime, VTime::new(123, 456));
        assert_eq!(st.mastergps_time, VTime::new(123, 456));
        assert_eq!(st.clients[0].lastmastergpstime, VTime::new(123, 456));
    }

    #[test]
    fn unknown_digest_dropped_silently() {
        let shared = test_shared();
        let mut st = state_with(vec![test_instance(1)], vec![client("a", 1, 640)]);
        let src = "10.0.0.2:4000".parse().unwrap();
        let hdr = PacketHeader::new(0, 0, "c", 0xBAD0BAD, PayloadType::Ulaw);
        let mut body = vec![10u8];
        body.extend_from_slice(&[0x21; FRAME_SIZE]);
        handle_packet(&mut st, &shared, &hdr, &body, src, Instant::now());
        assert!(!st.clients[0].heardfrom);
    }

    #[test]
    fn duplicate_address_invalidates_on_sanity() {
        let shared = test_shared();
        let mut st = state_with(
            vec![test_instance(1)],
            vec![client("a", 1, 3840), client("b", 1, 3840)],
        );
        st.hasmaster = true;
        st.clients[0].ismaster = true;
        let src: SocketAddrV4 = "10.0.0.2:4000".parse().unwrap();
        st.clients[0].heardfrom = true;
        st.clients[0].addr = Some(src);
        st.clients[0].resp_digest = 5;
        st.clients[1].heardfrom = true;
        st.clients[1].addr = Some(src);
        st.clients[1].resp_digest = 6;
        st.clients[1].lastheardtime = Some(Instant::now());

        // Master audio packet triggers the sanity scan.
        let digest = st.clients[0].digest;
        let mut body = vec![90u8];
        body.extend_from_slice(&[0x21; FRAME_SIZE]);
        let hdr = PacketHeader::new(500, 0, "c", digest, PayloadType::Ulaw);
        handle_packet(&mut st, &shared, &hdr, &body, src, Instant::now());
        // Both clients sharing the address were invalidated.
        assert_eq!(st.clients[1].resp_digest, 0);
        assert!(!st.clients[1].heardfrom);
    }

    #[test]
    fn secondary_wraps_voted_traffic_to_primary() {
        let shared = test_shared();
        let mut inst = test_instance(1);
        inst.priconn = true;
        inst.primary_challenge = "prichal".into();
        inst.primary = Some(crate::config::PrimaryConfig {
            addr: test_socket_addr(&shared),
            password: "pripw".into(),
        });
        let mut st = state_with(vec![inst], vec![client("v", 1, 3840)]);
        st.hasmaster = true;
        st.clients[0].ismaster = true; // make it its own timing master
        st.clients[0].heardfrom = true;
        st.master_time = VTime::new(100, 0);

        // A non-master voted client relays through the primary.
        st.clients[0].ismaster = false;
        st.clients[0].curmaster = false;
        let digest = st.clients[0].digest;
        let mut body = vec![90u8];
        body.extend_from_slice(&[0x21; FRAME_SIZE]);
        let hdr = PacketHeader::new(100, 0, "clientchal", digest, PayloadType::Ulaw);
        let src = "10.0.0.9:5000".parse().unwrap();
        handle_packet(&mut st, &shared, &hdr, &body, src, Instant::now());

        // The wrapped packet arrived on our test socket.
        let mut buf = [0u8; 4096];
        let (len, _) = shared.socket.recv_from(&mut buf).unwrap();
        assert_eq!(len, HEADER_LEN + PROXY_HEADER_LEN + body.len());
        let outer = PacketHeader::parse(&buf[..len]).unwrap();
        assert_eq!(outer.payload(), Some(PayloadType::Proxy));
        assert_eq!(outer.digest, crc32_bufs(b"prichal", b"v-pw"));
        let proxy = ProxyHeader::parse(&buf[HEADER_LEN..len]).unwrap();
        assert_eq!(proxy.addr, *src.ip());
        assert_eq!(proxy.port, src.port());
        assert_eq!(proxy.payload_type, PayloadType::Ulaw.raw());
        // Nothing was written locally.
        assert!(st.clients[0].audio.iter().all(|&b| b == MULAW_SILENCE));
    }

    #[test]
    fn primary_unwraps_and_records_proxy_path() {
        let shared = test_shared();
        let mut inst = test_instance(1);
        inst.isprimary = true;
        let mut st = state_with(
            vec![inst],
            vec![client("m", 1, 3840), client("v", 1, 3840)],
        );
        st.hasmaster = true;
        st.clients[0].ismaster = true;
        st.clients[0].heardfrom = true;
        st.clients[0].curmaster = true;
        st.clients[0].lastheardtime = Some(Instant::now());
        st.clients[1].heardfrom = true;
        st.master_time = VTime::new(100, 0);

        // Secondary wraps client v's ULAW packet.
        let digest = st.clients[1].digest;
        let mut chal = [0u8; voter_proto::CHALLENGE_LEN];
        chal[..7].copy_from_slice(b"secchal");
        let proxy = ProxyHeader {
            addr: "192.168.1.50".parse().unwrap(),
            port: 9000,
            payload_type: PayloadType::Ulaw.raw(),
            flags: 0,
            challenge: chal,
        };
        let mut body = vec![0u8; PROXY_HEADER_LEN + 1 + FRAME_SIZE];
        proxy.encode(&mut body);
        body[PROXY_HEADER_LEN] = 90;
        for b in &mut body[PROXY_HEADER_LEN + 1..] {
            *b = 0x21;
        }
        let hdr = PacketHeader::new(100, 0, "clientchal", digest, PayloadType::Proxy);
        let secondary_src = "10.0.0.7:1667".parse().unwrap();
        handle_packet(&mut st, &shared, &hdr, &body, secondary_src, Instant::now());

        let v = &st.clients[1];
        assert_eq!(v.proxy_addr, Some("192.168.1.50:9000".parse().unwrap()));
        assert_eq!(v.addr, Some(secondary_src));
        assert_eq!(v.saved_challenge, "secchal");
        assert!(!v.mix);
        // The audio landed in the ring at the master-derived index.
        assert_eq!(v.audio[3200], 0x21);
    }

    fn test_socket_addr(shared: &Shared) -> SocketAddrV4 {
        match shared.socket.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            _ => unreachable!(),
        }
    }

    #[test]
    fn rx_timeout_unkeys() {
        let mut st = state_with(vec![test_instance(1)], vec![]);
        st.instances[0].rxkey = true;
        st.instances[0].lastrxtime = Some(Instant::now() - std::time::Duration::from_millis(500));
        check_rx_timeouts(&mut st, Instant::now());
        assert!(!st.instances[0].rxkey);
    }
}
