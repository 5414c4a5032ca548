//! Per-node instance state: selection, queues, worker signals, and the
//! transmit-side DSP.

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufWriter;
use std::net::SocketAddrV4;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};

use voter_dsp::{AdpcmCoder, CtcssGen, Deemphasis, Highpass300, Lowpass4k};
use voter_proto::FRAME_SIZE;

use crate::channel::{AudioFrame, ChannelEvent, DtmfDetector};
use crate::config::{NodeConfig, PrimaryConfig, Threshold, TxTocType};

/// Wakes a transmit worker once per 20 ms master tick.
#[derive(Default)]
pub struct TickSignal {
    seq: Mutex<u64>,
    cv: Condvar,
}

impl TickSignal {
    pub fn signal(&self) {
        let mut seq = self.seq.lock();
        *seq += 1;
        self.cv.notify_all();
    }

    /// Wait for the next tick, or time out so kill flags stay observable.
    /// Returns true if a tick arrived.
    pub fn wait(&self, last_seen: &mut u64, timeout: Duration) -> bool {
        let mut seq = self.seq.lock();
        if *seq == *last_seen {
            let _ = self.cv.wait_for(&mut seq, timeout);
        }
        let ticked = *seq != *last_seen;
        *last_seen = *seq;
        ticked
    }
}

/// Shared TX queue: filled by the host, drained by the TX worker. Its own
/// lock so host writes never contend with the main state lock.
pub type TxQueue = Arc<Mutex<VecDeque<AudioFrame>>>;

/// One voting node.
pub struct Instance {
    pub nodenum: u32,

    // Configuration.
    pub linger: u16,
    pub plfilter: bool,
    pub hostdeemp: bool,
    pub duplex: bool,
    pub mixminus: bool,
    pub isprimary: bool,
    pub streams: Vec<SocketAddrV4>,
    pub thresholds: Vec<Threshold>,
    pub gtxgain: f32,
    pub txtoctype: TxTocType,
    pub primary: Option<PrimaryConfig>,

    // Carrier and selection state.
    pub txkey: bool,
    pub rxkey: bool,
    pub drained_once: bool,
    pub waspager: bool,
    pub lastrxtime: Option<Instant>,
    /// Winner of the most recent vote (client name).
    pub winner: Option<String>,
    /// Sticky previous winner driving threshold/linger logic.
    pub last_won: Option<String>,
    /// 1-based index into the threshold table; 0 = none armed.
    pub threshold: usize,
    pub threshcount: u16,
    pub lingercount: u16,
    pub voter_test: i32,
    pub testcycle: i32,
    pub testindex: usize,

    // Primary session state shared with the primary worker.
    pub priconn: bool,
    pub primary_challenge: String,

    // Host interface.
    pub events: Sender<ChannelEvent>,
    pub dtmf: Option<Box<dyn DtmfDetector>>,
    pub usedtmf: bool,

    // Queues and worker signals (Arc: cloned into workers and host handles).
    pub txq: TxQueue,
    pub pagerq: TxQueue,
    pub tick: Arc<TickSignal>,
    pub kill_xmit: Arc<AtomicBool>,
    pub kill_primary: Arc<AtomicBool>,

    // Transmit-side DSP.
    pub ctcss: Option<CtcssGen>,
    pub txctcss_level_set: i32,
    /// Pending 20 ms μ-law frame awaiting its pair for ADPCM output.
    pub adpcm_pending: Option<[u8; FRAME_SIZE]>,
    /// Pending 20 ms μ-law frame awaiting its pair for half-rate output.
    pub nulaw_pending: Option<[u8; FRAME_SIZE]>,
    pub nulaw_tx_lp: Lowpass4k,
    pub adpcm_enc: AdpcmCoder,

    // Receive-side post filters.
    pub rx_hp: Highpass300,
    pub rx_deemp: Deemphasis,

    /// Last voted frame in linear form, for mix-minus.
    pub lastaudio: [i16; FRAME_SIZE],

    /// Raw frame recording sink.
    pub recfp: Option<BufWriter<File>>,
    pub rec_path: Option<String>,
}

impl Instance {
    pub fn from_config(cfg: &NodeConfig, events: Sender<ChannelEvent>) -> Self {
        let ctcss = cfg
            .txctcss_freq
            .map(|freq| CtcssGen::new(freq, cfg.txctcss_level));
        Instance {
            nodenum: cfg.nodenum,
            linger: cfg.linger,
            plfilter: cfg.plfilter,
            hostdeemp: cfg.hostdeemp,
            duplex: cfg.duplex,
            mixminus: cfg.mixminus,
            isprimary: cfg.isprimary,
            streams: cfg.streams.clone(),
            thresholds: cfg.thresholds.clone(),
            gtxgain: voter_dsp::db_to_gain(cfg.gtxgain_db),
            txtoctype: cfg.txtoctype,
            primary: cfg.primary.clone(),
            txkey: false,
            rxkey: false,
            drained_once: false,
            waspager: false,
            lastrxtime: None,
            winner: None,
            last_won: None,
            threshold: 0,
            threshcount: 0,
            lingercount: 0,
            voter_test: 0,
            testcycle: 0,
            testindex: 0,
            priconn: false,
            primary_challenge: String::new(),
            events,
            dtmf: None,
            usedtmf: true,
            txq: Arc::new(Mutex::new(VecDeque::new())),
            pagerq: Arc::new(Mutex::new(VecDeque::new())),
            tick: Arc::new(TickSignal::default()),
            kill_xmit: Arc::new(AtomicBool::new(false)),
            kill_primary: Arc::new(AtomicBool::new(false)),
            ctcss,
            txctcss_level_set: cfg.txctcss_level,
            adpcm_pending: None,
            nulaw_pending: None,
            nulaw_tx_lp: Lowpass4k::new(),
            adpcm_enc: AdpcmCoder::new(),
            rx_hp: Highpass300::new(),
            rx_deemp: Deemphasis::new(),
            lastaudio: [0i16; FRAME_SIZE],
            recfp: None,
            rec_path: None,
        }
    }

    /// Re-apply node configuration on reload, keeping runtime state.
    pub fn apply_config(&mut self, cfg: &NodeConfig) {
        self.linger = cfg.linger;
        self.plfilter = cfg.plfilter;
        self.hostdeemp = cfg.hostdeemp;
        self.duplex = cfg.duplex;
        self.mixminus = cfg.mixminus;
        self.isprimary = cfg.isprimary;
        self.streams = cfg.streams.clone();
        self.thresholds = cfg.thresholds.clone();
        self.gtxgain = voter_dsp::db_to_gain(cfg.gtxgain_db);
        self.txtoctype = cfg.txtoctype;
        self.primary = cfg.primary.clone();
        let level_changed = self.txctcss_level_set != cfg.txctcss_level;
        self.txctcss_level_set = cfg.txctcss_level;
        match cfg.txctcss_freq {
            Some(freq) => {
                let rebuild = match self.ctcss.as_mut() {
                    Some(gen) if (gen.freq() - freq).abs() < f32::EPSILON => {
                        if level_changed {
                            gen.set_level(cfg.txctcss_level);
                        }
                        false
                    }
                    _ => true,
                };
                if rebuild {
                    self.ctcss = Some(CtcssGen::new(freq, cfg.txctcss_level));
                }
            }
            None => self.ctcss = None,
        }
    }

    /// Send an event to the host, ignoring a disconnected receiver.
    pub fn queue_event(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    /// Reset selection state (no winner this tick).
    pub fn clear_selection(&mut self) {
        self.threshold = 0;
        self.threshcount = 0;
        self.lingercount = 0;
        self.winner = None;
    }
}
