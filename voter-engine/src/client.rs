//! Per-client state: identity, flags, ring buffers, sequence counters,
//! and ping bookkeeping.

use std::net::SocketAddrV4;
use std::time::Instant;

use voter_dsp::{AdpcmCoder, Lowpass4k, MULAW_SILENCE};
use voter_proto::{crc32_bufs, FRAME_SIZE};

use crate::config::ClientConfig;
use crate::time::{walltime_diff_ms, VTime};

/// Priority override value meaning "no override in effect".
pub const PRIO_OVERRIDE_OFF: i32 = -2;

/// Priority override value muting a client out of the vote.
pub const PRIO_OVERRIDE_MUTED: i32 = -1;

/// Final statistics of a completed ping batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingSummary {
    pub sent: u32,
    pub received: u32,
    pub oos: u32,
    pub best_ms: i64,
    pub worst_ms: i64,
    pub avg_ms: f64,
    pub aborted: bool,
    pub timed_out: bool,
}

/// In-flight ping batch state.
#[derive(Debug, Default, Clone)]
pub struct PingState {
    pub requested: u32,
    pub sent: u32,
    pub received: u32,
    pub oos: u32,
    pub best_ms: i64,
    pub worst_ms: i64,
    pub total_ms: i64,
    pub seqno: u32,
    pub last_seqno: u32,
    /// Batch start wall time; echoed in every packet as the session id.
    pub start: (i64, i64),
    /// Wall time of the most recent response.
    pub last_rx: Option<(i64, i64)>,
    pub abort: bool,
    /// Summary of the last completed batch, for the control surface.
    pub last_summary: Option<PingSummary>,
}

/// One remote radio endpoint.
pub struct Client {
    pub nodenum: u32,
    pub name: String,
    pub password: String,
    /// Lookup digest: CRC32(server challenge ‖ client password).
    pub digest: u32,
    /// Digest stamped on packets we send to this client:
    /// CRC32(client's challenge ‖ server password).
    pub resp_digest: u32,
    /// Last source address; for proxied clients this is the secondary.
    pub addr: Option<SocketAddrV4>,
    /// Real address of a client reached through a secondary.
    pub proxy_addr: Option<SocketAddrV4>,
    /// Challenge from the proxy envelope, used to re-wrap outbound packets.
    pub saved_challenge: String,

    // Capability flags from configuration and authentication.
    pub heardfrom: bool,
    pub totransmit: bool,
    pub ismaster: bool,
    pub curmaster: bool,
    pub doadpcm: bool,
    pub donulaw: bool,
    pub mix: bool,
    pub nodeemp: bool,
    pub noplfilter: bool,
    pub txlockout: bool,
    pub prio: i32,
    pub prio_override: i32,

    // Ring buffers: μ-law audio and matching RSSI per sample.
    pub audio: Vec<u8>,
    pub rssi: Vec<u8>,
    pub buflen: usize,
    pub drainindex: usize,
    pub drainindex_40ms: usize,
    pub drain40ms: bool,

    // Sequence state.
    pub txseqno: u32,
    pub txseqno_rxkeyed: u32,
    pub rxseqno: u32,
    pub rxseqno_40ms: u32,
    pub rxseq40ms: bool,

    pub last_rssi: u8,
    pub lastheardtime: Option<Instant>,
    pub lastsenttime: Option<Instant>,
    pub lastgpstime: VTime,
    pub lastmastergpstime: VTime,
    pub gpsid: Option<String>,
    /// Last decoded frame in linear form, kept for mix-minus.
    pub lastaudio: [i16; FRAME_SIZE],
    /// Last no-master warning, rate limited.
    pub warntime: Option<Instant>,

    pub ping: PingState,

    // Decoder state.
    pub adpcm_dec: AdpcmCoder,
    pub nulaw_lp: Lowpass4k,

    /// Marks survivors during a reload.
    pub seen_in_reload: bool,
}

impl Client {
    pub fn from_config(cfg: &ClientConfig, nodenum: u32, buflen: usize, challenge: &str) -> Self {
        let mut c = Client {
            nodenum,
            name: cfg.name.clone(),
            password: cfg.password.clone(),
            digest: 0,
            resp_digest: 0,
            addr: None,
            proxy_addr: None,
            saved_challenge: String::new(),
            heardfrom: false,
            totransmit: false,
            ismaster: false,
            curmaster: false,
            doadpcm: false,
            donulaw: false,
            mix: false,
            nodeemp: false,
            noplfilter: false,
            txlockout: false,
            prio: 0,
            prio_override: PRIO_OVERRIDE_OFF,
            audio: vec![MULAW_SILENCE; buflen],
            rssi: vec![0u8; buflen],
            buflen,
            drainindex: 0,
            drainindex_40ms: 0,
            drain40ms: false,
            txseqno: 0,
            txseqno_rxkeyed: 0,
            rxseqno: 0,
            rxseqno_40ms: 0,
            rxseq40ms: false,
            last_rssi: 0,
            lastheardtime: None,
            lastsenttime: None,
            lastgpstime: VTime::default(),
            lastmastergpstime: VTime::default(),
            gpsid: None,
            lastaudio: [0i16; FRAME_SIZE],
            warntime: None,
            ping: PingState::default(),
            adpcm_dec: AdpcmCoder::new(),
            nulaw_lp: Lowpass4k::new(),
            seen_in_reload: true,
        };
        c.apply_config(cfg, nodenum, buflen, challenge);
        c
    }

    /// Re-apply configuration on reload, resizing buffers if needed.
    pub fn apply_config(&mut self, cfg: &ClientConfig, nodenum: u32, buflen: usize, challenge: &str) {
        self.nodenum = nodenum;
        self.name = cfg.name.clone();
        self.password = cfg.password.clone();
        self.digest = crc32_bufs(challenge.as_bytes(), cfg.password.as_bytes());
        self.totransmit = cfg.transmit;
        self.ismaster = cfg.master;
        self.doadpcm = cfg.adpcm;
        self.donulaw = cfg.nulaw;
        self.nodeemp = cfg.nodeemp;
        self.noplfilter = cfg.noplfilter;
        self.prio = cfg.prio;
        self.gpsid = cfg.gpsid.clone();
        self.seen_in_reload = true;
        if self.buflen != buflen {
            self.buflen = buflen;
            self.audio = vec![MULAW_SILENCE; buflen];
            self.rssi = vec![0u8; buflen];
            self.drainindex = 0;
            self.drainindex_40ms = 0;
        }
    }

    /// Priority used by the vote: an operator override when one is set.
    pub fn effective_prio(&self) -> i32 {
        if self.prio_override > PRIO_OVERRIDE_OFF {
            self.prio_override
        } else {
            self.prio
        }
    }

    /// Drop authentication so the client re-authenticates.
    pub fn invalidate(&mut self) {
        self.heardfrom = false;
        self.resp_digest = 0;
    }

    /// Reset TX/RX sequence state, as done when a client re-authenticates.
    pub fn reset_session(&mut self) {
        self.txseqno = 0;
        self.txseqno_rxkeyed = 0;
        self.reset_mix_seq();
    }

    /// Reset the mix-mode receive counters; the next packet reseeds them.
    pub fn reset_mix_seq(&mut self) {
        self.rxseqno = 0;
        self.rxseqno_40ms = 0;
        self.rxseq40ms = false;
        self.drain40ms = false;
    }

    /// Write decoded audio and its RSSI into the rings, wrapping.
    pub fn write_at(&mut self, index: usize, audio: &[u8], rssi: u8) {
        let index = index % self.buflen;
        let tail = self.buflen - index;
        if audio.len() <= tail {
            self.audio[index..index + audio.len()].copy_from_slice(audio);
            self.rssi[index..index + audio.len()].fill(rssi);
        } else {
            self.audio[index..].copy_from_slice(&audio[..tail]);
            self.rssi[index..].fill(rssi);
            self.audio[..audio.len() - tail].copy_from_slice(&audio[tail..]);
            self.rssi[..audio.len() - tail].fill(rssi);
        }
    }

    /// Mean RSSI over the 160-sample window at the drain index.
    pub fn rssi_window_mean(&self) -> u8 {
        let mut sum = 0u32;
        for i in 0..FRAME_SIZE {
            sum += self.rssi[(self.drainindex + i) % self.buflen] as u32;
        }
        (sum / FRAME_SIZE as u32) as u8
    }

    /// Zero the RSSI window at the drain index.
    pub fn clear_rssi_window(&mut self) {
        for i in 0..FRAME_SIZE {
            let idx = (self.drainindex + i) % self.buflen;
            self.rssi[idx] = 0;
        }
    }

    /// Fill the audio window at the drain index with μ-law silence.
    pub fn silence_audio_window(&mut self) {
        for i in 0..FRAME_SIZE {
            let idx = (self.drainindex + i) % self.buflen;
            self.audio[idx] = MULAW_SILENCE;
        }
    }

    /// Copy the audio window at the drain index out, wrapping.
    pub fn copy_audio_window(&self, out: &mut [u8; FRAME_SIZE]) {
        for (i, o) in out.iter_mut().enumerate() {
            *o = self.audio[(self.drainindex + i) % self.buflen];
        }
    }

    /// Advance the drain index one frame; every second tick latches the
    /// 40 ms drain state used by the paired codecs.
    pub fn advance_drain(&mut self) {
        if !self.drain40ms {
            self.drainindex_40ms = self.drainindex;
            self.rxseqno_40ms = self.rxseqno;
        }
        self.drainindex = (self.drainindex + FRAME_SIZE) % self.buflen;
        self.drain40ms = !self.drain40ms;
    }

    /// Record one ping response. Returns the measured round trip in ms,
    /// or `None` if the response is stale or has an invalid timestamp.
    pub fn record_ping_response(
        &mut self,
        seqno: u32,
        txtime: (i64, i64),
        starttime: (i64, i64),
        now: (i64, i64),
    ) -> Option<i64> {
        let ping = &mut self.ping;
        ping.last_rx = Some(now);
        if walltime_diff_ms(ping.start, starttime) != 0 {
            return None;
        }
        if ping.last_seqno != 0 && seqno < ping.last_seqno + 1 {
            log::warn!("PING ({}): packets out of sequence", self.name);
            ping.oos += 1;
        }
        let diff = walltime_diff_ms(now, txtime);
        if diff < 0 {
            log::warn!("PING ({}): packet has invalid time (diff={diff})", self.name);
            return None;
        }
        ping.last_seqno = seqno;
        ping.received += 1;
        ping.total_ms += diff;
        if ping.best_ms == 0 || diff < ping.best_ms {
            ping.best_ms = diff;
        }
        if diff > ping.worst_ms {
            ping.worst_ms = diff;
        }
        Some(diff)
    }

    /// Close out a ping batch if it is complete, aborted, or timed out.
    pub fn check_ping_done(&mut self, now: (i64, i64), timeout_ms: i64) -> Option<PingSummary> {
        let ping = &mut self.ping;
        if ping.requested == 0 {
            return None;
        }
        let mut timed_out = false;
        if !ping.abort {
            if ping.sent < ping.requested {
                return None;
            }
            let reference = ping.last_rx.unwrap_or(ping.start);
            if walltime_diff_ms(now, reference) > timeout_ms {
                log::warn!("PING ({}): response timeout", self.name);
                timed_out = true;
            } else if ping.received < ping.requested {
                return None;
            }
        } else {
            log::warn!("PING ({}): aborted", self.name);
        }
        let summary = PingSummary {
            sent: ping.sent,
            received: ping.received,
            oos: ping.oos,
            best_ms: ping.best_ms,
            worst_ms: ping.worst_ms,
            avg_ms: if ping.received > 0 {
                ping.total_ms as f64 / ping.received as f64
            } else {
                0.0
            },
            aborted: ping.abort,
            timed_out,
        };
        log::info!(
            "PING ({}): tx {} rx {} oos {} best {} ms worst {} ms avg {:.3} ms",
            self.name,
            summary.sent,
            summary.received,
            summary.oos,
            summary.best_ms,
            summary.worst_ms,
            summary.avg_ms
        );
        ping.abort = false;
        ping.requested = 0;
        ping.last_summary = Some(summary);
        Some(summary)
    }
}
