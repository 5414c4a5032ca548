//! Primary-session worker.
//!
//! When an instance is configured as a secondary, this worker keeps an
//! authenticated session open to the primary server over its own socket:
//! auth attempts every 500 ms until connected, GPS keepalives every
//! second after, and a 2 s silence window that tears the session down
//! and invalidates every proxied client.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use voter_proto::{crc32_bufs, AuthFlags, PacketHeader, PayloadType, HEADER_LEN};

use crate::state::Shared;
use crate::time::since_ms;

const AUTH_INTERVAL_MS: u64 = 500;
const KEEPALIVE_INTERVAL_MS: u64 = 1000;
const LOSS_TIMEOUT_MS: u64 = 2000;

fn bind_session_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;
    Ok(socket.into())
}

pub(crate) fn primary_loop(shared: Arc<Shared>, nodenum: u32, kill: Arc<AtomicBool>) {
    log::debug!("node {nodenum}: primary client thread started");
    let socket = match bind_session_socket() {
        Ok(s) => s,
        Err(e) => {
            log::error!("node {nodenum}: unable to create primary session socket: {e}");
            return;
        }
    };

    // Session-local authentication state.
    let mut resp_digest: u32 = 0;
    let mut session_digest: u32 = 0;
    let mut lasttx: Option<Instant> = None;
    let mut lastrx: Option<Instant> = None;
    let mut buf = [0u8; 4096];

    {
        let mut st = shared.state.lock();
        if let Some(pi) = st.instance_for_node(nodenum) {
            st.instances[pi].primary_challenge.clear();
        }
    }

    while shared.run.load(Ordering::SeqCst) && !kill.load(Ordering::SeqCst) {
        let received = match socket.recv_from(&mut buf) {
            Ok((len, _)) => Some(len),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                None
            }
            Err(e) => {
                log::error!("node {nodenum}: primary session recv failed: {e}");
                return;
            }
        };

        let now = Instant::now();
        let mut st = shared.state.lock();
        let pi = match st.instance_for_node(nodenum) {
            Some(pi) => pi,
            None => continue,
        };
        let primary = match st.instances[pi].primary.clone() {
            Some(p) => p,
            None => continue,
        };

        if !st.instances[pi].priconn && since_ms(lasttx, now) >= AUTH_INTERVAL_MS {
            let hdr = PacketHeader::new(
                st.master_time.sec,
                st.voter_timing_count,
                &shared.challenge,
                resp_digest,
                PayloadType::None,
            );
            let mut out = [0u8; HEADER_LEN + 1];
            hdr.encode(&mut out);
            out[HEADER_LEN] = AuthFlags::MIX;
            log::debug!("node {nodenum}: sent primary client auth to {}", primary.addr);
            let _ = socket.send_to(&out, primary.addr);
            lasttx = Some(now);
        }
        if st.instances[pi].priconn && since_ms(lasttx, now) >= KEEPALIVE_INTERVAL_MS {
            let hdr = PacketHeader::new(
                st.master_time.sec,
                st.voter_timing_count,
                &shared.challenge,
                resp_digest,
                PayloadType::Gps,
            );
            let mut out = [0u8; HEADER_LEN];
            hdr.encode(&mut out);
            log::trace!("node {nodenum}: sent primary client keepalive to {}", primary.addr);
            let _ = socket.send_to(&out, primary.addr);
            lasttx = Some(now);
        }
        if st.instances[pi].priconn && since_ms(lastrx, now) >= LOSS_TIMEOUT_MS {
            st.instances[pi].priconn = false;
            session_digest = 0;
            st.instances[pi].primary_challenge.clear();
            log::warn!("node {nodenum}: primary client lost connection");
            for c in &mut st.clients {
                if c.nodenum != nodenum || c.proxy_addr.is_none() {
                    continue;
                }
                c.invalidate();
            }
        }

        let len = match received {
            Some(len) if len >= HEADER_LEN => len,
            _ => continue,
        };
        let hdr = match PacketHeader::parse(&buf[..len]) {
            Some(h) => h,
            None => continue,
        };
        log::debug!(
            "node {nodenum}: primary client packet payload {} challenge {} digest {:08x}",
            hdr.payload_type,
            hdr.challenge_str(),
            hdr.digest
        );
        if hdr.challenge_str() != st.instances[pi].primary_challenge {
            // New session: compute our response digest against the
            // primary's fresh challenge.
            resp_digest = crc32_bufs(&hdr.challenge, primary.password.as_bytes());
            st.instances[pi].primary_challenge = hdr.challenge_str().to_string();
            st.instances[pi].priconn = false;
        } else if session_digest == 0
            || hdr.digest == 0
            || session_digest != hdr.digest
            || hdr.payload_type == 0
            || hdr.payload() == Some(PayloadType::Gps)
        {
            let mydigest = crc32_bufs(shared.challenge.as_bytes(), st.password.as_bytes());
            if mydigest == hdr.digest {
                session_digest = mydigest;
                if !st.instances[pi].priconn {
                    log::info!(
                        "node {nodenum}: primary client connected (challenge {})",
                        st.instances[pi].primary_challenge
                    );
                }
                st.instances[pi].priconn = true;
                lastrx = Some(now);
            } else {
                st.instances[pi].priconn = false;
                session_digest = 0;
            }
        }
    }
    log::debug!("node {nodenum}: primary client thread exited");
}
