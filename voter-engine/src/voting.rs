//! Winner selection and frame delivery.
//!
//! Runs once per 20 ms for every instance, triggered by the master
//! client's audio packet (or by the timer when no master is configured).
//! Selects the best voted-mode client by priority then RSSI, applies the
//! threshold/linger stickiness, folds in mix-mode clients, and queues the
//! resulting frame to the host.

use std::io::Write;
use std::net::UdpSocket;
use std::time::Instant;

use rand::Rng;

use voter_dsp::{mix_saturating, mulaw_decode, mulaw_encode, MULAW_SILENCE};
use voter_proto::FRAME_SIZE;

use crate::channel::{AudioFrame, ChannelEvent, SILENCE};
use crate::client::PRIO_OVERRIDE_MUTED;
use crate::state::VoterState;

/// Size of the status datagram text field.
const STREAM_TEXT_LEN: usize = 152;

/// One voting pass over every instance.
pub(crate) fn run_voting_cycle(st: &mut VoterState, socket: &UdpSocket, now: Instant, vote: bool) {
    for pi in 0..st.instances.len() {
        if vote {
            vote_instance(st, pi, socket, now);
        } else {
            // No master: silence carrier, but mix clients still sum in.
            mix_and_send(st, pi, None, 0, &[MULAW_SILENCE; FRAME_SIZE], now);
        }
    }
}

/// Indices of all clients bound to a node.
fn node_clients(st: &VoterState, nodenum: u32) -> Vec<usize> {
    st.clients
        .iter()
        .enumerate()
        .filter(|(_, c)| c.nodenum == nodenum)
        .map(|(i, _)| i)
        .collect()
}

fn vote_instance(st: &mut VoterState, pi: usize, socket: &UdpSocket, now: Instant) {
    let nodenum = st.instances[pi].nodenum;
    let members = node_clients(st, nodenum);

    // Candidate scan. Priority dominates RSSI: when a higher-priority
    // candidate appears mid-scan the walk restarts from the top so every
    // client is re-compared against the new bar.
    let mut maxrssi: u8 = 0;
    let mut maxclient: Option<usize> = None;
    let mut i = 0;
    while i < members.len() {
        let ci = members[i];
        i += 1;
        if st.clients[ci].mix || st.clients[ci].prio_override == PRIO_OVERRIDE_MUTED {
            continue;
        }
        let rssi = st.clients[ci].rssi_window_mean();
        st.clients[ci].last_rssi = rssi;
        let maxprio = maxclient.map_or(0, |m| st.clients[m].effective_prio());
        let thisprio = st.clients[ci].effective_prio();
        if (rssi > maxrssi && thisprio == maxprio) || (rssi > 0 && thisprio > maxprio) {
            maxrssi = rssi;
            maxclient = Some(ci);
            if thisprio > maxprio {
                i = 0;
            }
        }
    }

    // The drained RSSI window is consumed by the scan.
    for &ci in &members {
        if st.clients[ci].mix || st.clients[ci].prio_override == PRIO_OVERRIDE_MUTED {
            continue;
        }
        st.clients[ci].clear_rssi_window();
    }

    if maxclient.is_none() {
        maxrssi = 0;
    }

    let mut frame = [MULAW_SILENCE; FRAME_SIZE];
    if maxclient.is_some() {
        apply_stickiness(st, pi, &mut maxclient, &mut maxrssi);
        apply_test_mode(st, pi, &members, &mut maxclient, &mut maxrssi);
    }

    if let Some(mc) = maxclient {
        st.clients[mc].copy_audio_window(&mut frame);
        record_and_scrub(st, pi, &members);

        // Half-duplex: while this node transmits, its receiver is dead.
        if !st.instances[pi].duplex && st.instances[pi].txkey {
            suppress_rx(st, pi, nodenum);
            return;
        }

        if st.instances[pi].plfilter || st.instances[pi].hostdeemp {
            let p = &mut st.instances[pi];
            for b in frame.iter_mut() {
                let mut s = mulaw_decode(*b);
                if p.plfilter {
                    s = p.rx_hp.filter(s);
                }
                if p.hostdeemp {
                    s = p.rx_deemp.filter(s);
                }
                *b = mulaw_encode(s);
            }
        }

        send_stream_status(st, pi, &members, mc, &frame, socket);

        let winner_name = st.clients[mc].name.clone();
        if st.instances[pi].last_won.as_deref() != Some(winner_name.as_str()) {
            log::debug!("node {nodenum}: client {winner_name} selected");
            st.instances[pi].last_won = Some(winner_name.clone());
            st.instances[pi].queue_event(ChannelEvent::Text(winner_name));
        }
    } else if !st.instances[pi].duplex && st.instances[pi].txkey {
        suppress_rx(st, pi, nodenum);
        return;
    }

    mix_and_send(st, pi, maxclient, maxrssi, &frame, now);
}

/// Threshold/linger sticky-winner logic: the previous winner keeps the
/// vote while its RSSI holds a configured threshold, then lingers a few
/// ticks after the threshold breaks.
fn apply_stickiness(st: &mut VoterState, pi: usize, maxclient: &mut Option<usize>, maxrssi: &mut u8) {
    let nodenum = st.instances[pi].nodenum;
    let lw = match st.instances[pi].last_won.as_deref().and_then(|name| {
        st.clients
            .iter()
            .position(|c| c.nodenum == nodenum && c.name == name)
    }) {
        Some(lw) => lw,
        None => return,
    };
    let mc = match *maxclient {
        Some(mc) => mc,
        None => return,
    };
    let maxprio = st.clients[mc].effective_prio();
    let lastprio = st.clients[lw].effective_prio();

    if !st.instances[pi].thresholds.is_empty() && maxprio <= lastprio {
        let nthresh = st.instances[pi].thresholds.len();
        let lw_name = st.clients[lw].name.clone();
        for i in 0..nthresh {
            let thresh = st.instances[pi].thresholds[i];
            let lw_rssi = st.clients[lw].last_rssi;
            if lw_rssi >= thresh.rssi {
                let p = &mut st.instances[pi];
                if i + 1 != p.threshold {
                    p.threshold = i + 1;
                    p.threshcount = 0;
                    log::debug!(
                        "node {}: new threshold {} client {} rssi {}",
                        p.nodenum,
                        p.threshold,
                        lw_name,
                        lw_rssi
                    );
                } else {
                    let dwell = p.threshcount;
                    p.threshcount += 1;
                    if thresh.count != 0 && dwell >= thresh.count {
                        log::debug!(
                            "node {}: threshold {} dwell {} exceeded",
                            p.nodenum,
                            p.threshold,
                            thresh.count
                        );
                        p.threshold = 0;
                        p.threshcount = 0;
                        p.lingercount = 0;
                        continue;
                    }
                }
                p.lingercount = 0;
                *maxclient = Some(lw);
                *maxrssi = lw_rssi;
                break;
            }
            if i == nthresh - 1 {
                let p = &mut st.instances[pi];
                if p.threshold != 0 {
                    p.lingercount = p.thresholds[p.threshold - 1].linger;
                }
                p.threshold = 0;
                p.threshcount = 0;
            }
        }
    }

    if st.instances[pi].lingercount > 0 {
        st.instances[pi].lingercount -= 1;
        *maxclient = Some(lw);
        *maxrssi = st.clients[lw].last_rssi;
    }
}

/// Test-mode selection among the clients tied at the top RSSI: mode 1
/// picks uniformly at random, mode N > 1 cycles every N-1 ticks.
fn apply_test_mode(
    st: &mut VoterState,
    pi: usize,
    members: &[usize],
    maxclient: &mut Option<usize>,
    maxrssi: &mut u8,
) {
    if st.instances[pi].voter_test <= 0 {
        st.instances[pi].testcycle = 0;
        st.instances[pi].testindex = 0;
        return;
    }
    let eligible: Vec<usize> = members
        .iter()
        .copied()
        .filter(|&ci| !st.clients[ci].mix && st.clients[ci].last_rssi == *maxrssi)
        .collect();
    if eligible.is_empty() {
        return;
    }
    let p = &mut st.instances[pi];
    if p.voter_test == 1 {
        p.testindex = rand::thread_rng().gen_range(0..eligible.len());
    } else {
        p.testcycle += 1;
        if p.testcycle >= p.voter_test - 1 {
            p.testcycle = 0;
            p.testindex += 1;
            if p.testindex >= eligible.len() {
                p.testindex = 0;
            }
        }
    }
    if let Some(&ci) = eligible.get(p.testindex) {
        *maxclient = Some(ci);
        *maxrssi = st.clients[ci].last_rssi;
    }
}

/// Write recording records and wipe every voted candidate's drained
/// audio window so the next frame starts fresh.
fn record_and_scrub(st: &mut VoterState, pi: usize, members: &[usize]) {
    let mut wrote_master_rec = false;
    for &ci in members {
        if st.clients[ci].mix {
            continue;
        }
        if st.instances[pi].recfp.is_some() {
            let mut window = [0u8; FRAME_SIZE];
            st.clients[ci].copy_audio_window(&mut window);
            let name = st.clients[ci].name.clone();
            let rssi = st.clients[ci].last_rssi;
            let master_time = st.master_time;
            let p = &mut st.instances[pi];
            let mut failed = false;
            if let Some(fp) = p.recfp.as_mut() {
                if !wrote_master_rec {
                    wrote_master_rec = true;
                    let mut rec = [0u8; 193];
                    rec[32..36].copy_from_slice(&master_time.sec.to_be_bytes());
                    rec[36..40].copy_from_slice(&master_time.nsec.to_be_bytes());
                    failed |= fp.write_all(&rec).is_err();
                }
                let mut rec = [0u8; 193];
                let name_bytes = name.as_bytes();
                let n = name_bytes.len().min(31);
                rec[..n].copy_from_slice(&name_bytes[..n]);
                rec[32..192].copy_from_slice(&window);
                rec[192] = rssi;
                failed |= fp.write_all(&rec).is_err();
            }
            if failed {
                log::error!("node {}: recording write failed, closing", p.nodenum);
                p.recfp = None;
                p.rec_path = None;
            }
        }
        st.clients[ci].silence_audio_window();
    }
}

/// Emit the multi-line status datagram to each configured subscriber:
/// timestamp, the voted frame, and `winner,client=rssi,...`.
fn send_stream_status(
    st: &VoterState,
    pi: usize,
    members: &[usize],
    winner: usize,
    frame: &[u8; FRAME_SIZE],
    socket: &UdpSocket,
) {
    let p = &st.instances[pi];
    if p.streams.is_empty() {
        return;
    }
    let mut text = st.clients[winner].name.clone();
    for &ci in members {
        let c = &st.clients[ci];
        text.push_str(&format!(",{}={}", c.name, c.last_rssi));
    }
    let mut pkt = [0u8; 8 + FRAME_SIZE + STREAM_TEXT_LEN];
    pkt[0..4].copy_from_slice(&st.master_time.sec.to_be_bytes());
    pkt[4..8].copy_from_slice(&st.master_time.nsec.to_be_bytes());
    pkt[8..8 + FRAME_SIZE].copy_from_slice(frame);
    let bytes = text.as_bytes();
    let n = bytes.len().min(STREAM_TEXT_LEN - 1);
    pkt[8 + FRAME_SIZE..8 + FRAME_SIZE + n].copy_from_slice(&bytes[..n]);
    for dst in &p.streams {
        let _ = socket.send_to(&pkt, dst);
    }
}

/// Half-duplex suppression: advance drains and feed silence so the
/// channel stays alive without receive audio.
fn suppress_rx(st: &mut VoterState, pi: usize, nodenum: u32) {
    st.instances[pi].rxkey = false;
    st.instances[pi].last_won = None;
    st.instances[pi].clear_selection();
    st.advance_drain(nodenum);
    st.instances[pi].queue_event(ChannelEvent::Audio(Box::new(SILENCE)));
}

/// Fold mix-mode clients into the voted frame and deliver it.
pub(crate) fn mix_and_send(
    st: &mut VoterState,
    pi: usize,
    mut maxclient: Option<usize>,
    mut maxrssi: u8,
    voted_ulaw: &[u8; FRAME_SIZE],
    now: Instant,
) {
    let nodenum = st.instances[pi].nodenum;
    let members = node_clients(st, nodenum);

    let mut sp1: AudioFrame = [0i16; FRAME_SIZE];
    for (s, &b) in sp1.iter_mut().zip(voted_ulaw.iter()) {
        *s = mulaw_decode(b);
    }

    // A prioritized mix client replaces the voted audio instead of
    // adding to it.
    let mut maxprio = 0;
    for &ci in &members {
        let c = &st.clients[ci];
        if !c.mix || c.prio_override == PRIO_OVERRIDE_MUTED {
            continue;
        }
        let prio = c.effective_prio();
        if prio > maxprio {
            maxprio = prio;
        }
    }

    let mut haslastaudio = false;
    for &ci in &members {
        {
            let c = &st.clients[ci];
            if !c.mix || c.prio_override == PRIO_OVERRIDE_MUTED {
                continue;
            }
            if maxprio > 0 && c.effective_prio() < maxprio {
                continue;
            }
        }
        let mut window = [0u8; FRAME_SIZE];
        st.clients[ci].copy_audio_window(&mut window);
        st.clients[ci].silence_audio_window();
        let rssi = st.clients[ci].rssi_window_mean();
        st.clients[ci].clear_rssi_window();
        st.clients[ci].last_rssi = rssi;
        if rssi > maxrssi {
            maxrssi = rssi;
            maxclient = Some(ci);
        }
        let mut sp2: AudioFrame = [0i16; FRAME_SIZE];
        for (s, &b) in sp2.iter_mut().zip(window.iter()) {
            *s = mulaw_decode(b);
        }
        if !haslastaudio {
            st.instances[pi].lastaudio = sp1;
            haslastaudio = true;
        }
        st.clients[ci].lastaudio = sp2;
        if maxprio > 0 && rssi > 0 {
            sp1 = sp2;
        } else {
            mix_saturating(&mut sp1, &sp2);
        }
    }

    // While relaying to a primary the local vote result is suppressed;
    // the primary does the voting.
    if st.instances[pi].priconn {
        maxclient = None;
    }

    if maxclient.is_none() {
        run_dtmf_on_silence(st, pi, now);
        st.instances[pi].clear_selection();
        st.advance_drain(nodenum);
        st.instances[pi].queue_event(ChannelEvent::Audio(Box::new(SILENCE)));
        return;
    }

    let winner_name = st.clients[maxclient.unwrap()].name.clone();
    st.instances[pi].winner = Some(winner_name);
    st.advance_drain(nodenum);
    st.instances[pi].lastrxtime = Some(now);
    if !st.instances[pi].rxkey {
        st.instances[pi].queue_event(ChannelEvent::RadioKey);
    }
    st.instances[pi].rxkey = true;

    let consumed = run_dtmf(st, pi, &sp1);
    let p = &st.instances[pi];
    if consumed {
        p.queue_event(ChannelEvent::Audio(Box::new(SILENCE)));
    } else {
        p.queue_event(ChannelEvent::Audio(Box::new(sp1)));
    }
}

/// Run the DTMF detector over a frame. Returns true when the audio frame
/// should be replaced with silence (a digit ended on it).
fn run_dtmf(st: &mut VoterState, pi: usize, frame: &AudioFrame) -> bool {
    let p = &mut st.instances[pi];
    if !p.usedtmf {
        return false;
    }
    let event = match p.dtmf.as_mut() {
        Some(det) => det.process(frame),
        None => return false,
    };
    if let Some(ev) = event {
        // Mute digits squelch the audio but are not reported.
        if ev.digit != 'm' && ev.digit != 'u' {
            log::debug!("node {}: got DTMF char {}", p.nodenum, ev.digit);
            p.queue_event(ChannelEvent::DtmfEnd {
                digit: ev.digit,
                duration_ms: ev.duration_ms,
            });
        }
        return true;
    }
    false
}

/// Keep the DTMF detector fed while the carrier is up but no winner
/// exists; a digit completing here still counts as activity.
fn run_dtmf_on_silence(st: &mut VoterState, pi: usize, now: Instant) {
    if !st.instances[pi].rxkey {
        return;
    }
    if run_dtmf(st, pi, &SILENCE) {
        st.instances[pi].lastrxtime = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DtmfEvent;
    use crate::config::Threshold;
    use crate::test_support::{fill_window, state_with, test_instance_with_events, test_socket};

    use crossbeam_channel::Receiver;

    fn ready_client(name: &str, node: u32) -> crate::client::Client {
        let cfg = crate::config::ClientConfig {
            name: name.into(),
            password: format!("{name}-pw"),
            ..Default::default()
        };
        let mut c = crate::client::Client::from_config(&cfg, node, 640, "chal");
        c.heardfrom = true;
        c.resp_digest = 1;
        c
    }

    fn drain_events(rx: &Receiver<ChannelEvent>) -> Vec<ChannelEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn audio_frames(events: &[ChannelEvent]) -> Vec<&AudioFrame> {
        events
            .iter()
            .filter_map(|e| match e {
                ChannelEvent::Audio(f) => Some(f.as_ref()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn two_client_vote_picks_higher_rssi() {
        let (inst, rx) = test_instance_with_events(1);
        let mut st = state_with(vec![inst], vec![ready_client("a", 1), ready_client("b", 1)]);
        fill_window(&mut st.clients[0], 0x21, 200);
        fill_window(&mut st.clients[1], 0x42, 100);
        let sock = test_socket();
        run_voting_cycle(&mut st, &sock, Instant::now(), true);

        let events = drain_events(&rx);
        assert!(events.contains(&ChannelEvent::RadioKey));
        assert!(events.contains(&ChannelEvent::Text("a".into())));
        let frames = audio_frames(&events);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], mulaw_decode(0x21));
        assert_eq!(st.instances[0].winner.as_deref(), Some("a"));

        // Both candidates' windows were consumed.
        assert_eq!(st.clients[0].rssi.iter().map(|&r| r as u32).sum::<u32>(), 0);
        assert_eq!(st.clients[1].rssi.iter().map(|&r| r as u32).sum::<u32>(), 0);
        assert!(st.clients[1].audio[..FRAME_SIZE].iter().all(|&b| b == MULAW_SILENCE));
    }

    #[test]
    fn muted_client_never_wins() {
        let (inst, rx) = test_instance_with_events(1);
        let mut st = state_with(vec![inst], vec![ready_client("a", 1), ready_client("b", 1)]);
        fill_window(&mut st.clients[0], 0x21, 250);
        fill_window(&mut st.clients[1], 0x42, 10);
        st.clients[0].prio_override = PRIO_OVERRIDE_MUTED;
        let sock = test_socket();
        run_voting_cycle(&mut st, &sock, Instant::now(), true);
        let events = drain_events(&rx);
        assert!(events.contains(&ChannelEvent::Text("b".into())));
    }

    #[test]
    fn priority_dominates_rssi() {
        let (inst, rx) = test_instance_with_events(1);
        let mut st = state_with(
            vec![inst],
            vec![ready_client("low", 1), ready_client("high", 1)],
        );
        fill_window(&mut st.clients[0], 0x21, 250);
        fill_window(&mut st.clients[1], 0x42, 50);
        st.clients[1].prio = 5;
        let sock = test_socket();
        run_voting_cycle(&mut st, &sock, Instant::now(), true);
        let events = drain_events(&rx);
        assert!(events.contains(&ChannelEvent::Text("high".into())));
    }

    #[test]
    fn no_candidates_emits_silence_and_clears() {
        let (inst, rx) = test_instance_with_events(1);
        let mut st = state_with(vec![inst], vec![ready_client("a", 1)]);
        st.instances[0].last_won = Some("a".into());
        st.instances[0].lingercount = 0;
        let sock = test_socket();
        run_voting_cycle(&mut st, &sock, Instant::now(), true);
        let events = drain_events(&rx);
        let frames = audio_frames(&events);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].iter().all(|&s| s == 0));
        assert!(st.instances[0].winner.is_none());
        assert!(!events.contains(&ChannelEvent::RadioKey));
        // Drain advanced exactly one frame.
        assert_eq!(st.clients[0].drainindex, FRAME_SIZE);
    }

    #[test]
    fn threshold_stickiness_scenario() {
        // thresholds = [150 count 5 linger 3]; A then fades while B rises.
        let (inst, rx) = test_instance_with_events(1);
        let mut st = state_with(vec![inst], vec![ready_client("a", 1), ready_client("b", 1)]);
        st.instances[0].thresholds = vec![Threshold {
            rssi: 150,
            count: 0,
            linger: 3,
        }];
        let sock = test_socket();

        let mut tick = |st: &mut VoterState, ra: u8, rb: u8| {
            fill_window(&mut st.clients[0], 0x21, ra);
            fill_window(&mut st.clients[1], 0x42, rb);
            run_voting_cycle(st, &sock, Instant::now(), true);
        };

        tick(&mut st, 200, 100);
        assert_eq!(st.instances[0].last_won.as_deref(), Some("a"));

        // B now stronger, but A still meets the 150 threshold.
        for _ in 0..4 {
            tick(&mut st, 160, 170);
            assert_eq!(st.instances[0].last_won.as_deref(), Some("a"));
        }

        // A breaks the threshold: linger keeps A for 3 more ticks.
        tick(&mut st, 140, 170);
        assert_eq!(st.instances[0].last_won.as_deref(), Some("a"));
        assert_eq!(st.instances[0].lingercount, 2);
        tick(&mut st, 140, 170);
        tick(&mut st, 140, 170);
        assert_eq!(st.instances[0].last_won.as_deref(), Some("a"));

        // Linger exhausted: B takes over.
        tick(&mut st, 140, 170);
        assert_eq!(st.instances[0].last_won.as_deref(), Some("b"));
        let events = drain_events(&rx);
        assert!(events.contains(&ChannelEvent::Text("b".into())));
    }

    #[test]
    fn dwell_count_limits_stickiness() {
        let (inst, _rx) = test_instance_with_events(1);
        let mut st = state_with(vec![inst], vec![ready_client("a", 1), ready_client("b", 1)]);
        st.instances[0].thresholds = vec![Threshold {
            rssi: 150,
            count: 2,
            linger: 0,
        }];
        let sock = test_socket();
        let mut tick = |st: &mut VoterState, ra: u8, rb: u8| {
            fill_window(&mut st.clients[0], 0x21, ra);
            fill_window(&mut st.clients[1], 0x42, rb);
            run_voting_cycle(st, &sock, Instant::now(), true);
        };
        tick(&mut st, 200, 100);
        assert_eq!(st.instances[0].last_won.as_deref(), Some("a"));
        // A holds the threshold, B stronger; dwell count expires after 2.
        tick(&mut st, 160, 170);
        tick(&mut st, 160, 170);
        tick(&mut st, 160, 170);
        tick(&mut st, 160, 170);
        assert_eq!(st.instances[0].last_won.as_deref(), Some("b"));
    }

    #[test]
    fn no_thresholds_means_no_hysteresis() {
        let (inst, _rx) = test_instance_with_events(1);
        let mut st = state_with(vec![inst], vec![ready_client("a", 1), ready_client("b", 1)]);
        let sock = test_socket();
        let mut tick = |st: &mut VoterState, ra: u8, rb: u8| {
            fill_window(&mut st.clients[0], 0x21, ra);
            fill_window(&mut st.clients[1], 0x42, rb);
            run_voting_cycle(st, &sock, Instant::now(), true);
        };
        tick(&mut st, 200, 100);
        assert_eq!(st.instances[0].last_won.as_deref(), Some("a"));
        tick(&mut st, 100, 200);
        assert_eq!(st.instances[0].last_won.as_deref(), Some("b"));
        tick(&mut st, 200, 100);
        assert_eq!(st.instances[0].last_won.as_deref(), Some("a"));
    }

    #[test]
    fn voting_is_deterministic_outside_test_mode() {
        let sock = test_socket();
        let run = || {
            let (inst, _rx) = test_instance_with_events(1);
            let mut st =
                state_with(vec![inst], vec![ready_client("a", 1), ready_client("b", 1)]);
            fill_window(&mut st.clients[0], 0x21, 180);
            fill_window(&mut st.clients[1], 0x42, 180);
            run_voting_cycle(&mut st, &sock, Instant::now(), true);
            st.instances[0].winner.clone()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn random_test_mode_spreads_selection() {
        let (inst, _rx) = test_instance_with_events(1);
        let mut st = state_with(vec![inst], vec![ready_client("a", 1), ready_client("b", 1)]);
        st.instances[0].voter_test = 1;
        let sock = test_socket();
        let mut wins = [0u32; 2];
        for _ in 0..200 {
            fill_window(&mut st.clients[0], 0x21, 150);
            fill_window(&mut st.clients[1], 0x42, 150);
            run_voting_cycle(&mut st, &sock, Instant::now(), true);
            match st.instances[0].winner.as_deref() {
                Some("a") => wins[0] += 1,
                Some("b") => wins[1] += 1,
                _ => {}
            }
        }
        assert!(wins[0] > 40 && wins[1] > 40, "wins {:?}", wins);
    }

    #[test]
    fn mix_client_sums_into_voted_audio() {
        let (inst, rx) = test_instance_with_events(1);
        let mut st = state_with(vec![inst], vec![ready_client("v", 1), ready_client("m", 1)]);
        st.clients[1].mix = true;
        fill_window(&mut st.clients[0], 0x21, 100);
        fill_window(&mut st.clients[1], 0x21, 80);
        let sock = test_socket();
        run_voting_cycle(&mut st, &sock, Instant::now(), true);
        let events = drain_events(&rx);
        let frames = audio_frames(&events);
        assert_eq!(frames.len(), 1);
        let single = mulaw_decode(0x21) as i32;
        assert_eq!(frames[0][0] as i32, single * 2);
    }

    #[test]
    fn prioritized_mix_client_replaces_audio() {
        let (inst, rx) = test_instance_with_events(1);
        let mut st = state_with(vec![inst], vec![ready_client("v", 1), ready_client("m", 1)]);
        st.clients[1].mix = true;
        st.clients[1].prio = 3;
        fill_window(&mut st.clients[0], 0x21, 100);
        fill_window(&mut st.clients[1], 0x42, 80);
        let sock = test_socket();
        run_voting_cycle(&mut st, &sock, Instant::now(), true);
        let events = drain_events(&rx);
        let frames = audio_frames(&events);
        assert_eq!(frames[0][0], mulaw_decode(0x42));
    }

    #[test]
    fn mix_only_system_keys_on_mix_audio() {
        // Timer-driven path: no master anywhere, one mix client active.
        let (inst, rx) = test_instance_with_events(1);
        let mut st = state_with(vec![inst], vec![ready_client("m", 1)]);
        st.clients[0].mix = true;
        fill_window(&mut st.clients[0], 0x21, 90);
        let sock = test_socket();
        run_voting_cycle(&mut st, &sock, Instant::now(), false);
        let events = drain_events(&rx);
        assert!(events.contains(&ChannelEvent::RadioKey));
        let frames = audio_frames(&events);
        assert_eq!(frames[0][0], mulaw_decode(0x21));
    }

    #[test]
    fn priconn_suppresses_local_vote() {
        let (inst, rx) = test_instance_with_events(1);
        let mut st = state_with(vec![inst], vec![ready_client("a", 1)]);
        st.instances[0].priconn = true;
        fill_window(&mut st.clients[0], 0x21, 200);
        let sock = test_socket();
        run_voting_cycle(&mut st, &sock, Instant::now(), true);
        let events = drain_events(&rx);
        assert!(!events.contains(&ChannelEvent::RadioKey));
        let frames = audio_frames(&events);
        assert!(frames[0].iter().all(|&s| s == 0));
    }

    struct OneShotDtmf(Option<DtmfEvent>);
    impl crate::channel::DtmfDetector for OneShotDtmf {
        fn process(&mut self, _frame: &AudioFrame) -> Option<DtmfEvent> {
            self.0.take()
        }
    }

    #[test]
    fn dtmf_end_replaces_audio_and_reports() {
        let (inst, rx) = test_instance_with_events(1);
        let mut st = state_with(vec![inst], vec![ready_client("a", 1)]);
        st.instances[0].dtmf = Some(Box::new(OneShotDtmf(Some(DtmfEvent {
            digit: '5',
            duration_ms: 120,
        }))));
        fill_window(&mut st.clients[0], 0x21, 200);
        let sock = test_socket();
        run_voting_cycle(&mut st, &sock, Instant::now(), true);
        let events = drain_events(&rx);
        assert!(events.contains(&ChannelEvent::DtmfEnd {
            digit: '5',
            duration_ms: 120
        }));
        let frames = audio_frames(&events);
        assert!(frames[0].iter().all(|&s| s == 0));
    }

    #[test]
    fn mute_digit_squelches_without_report() {
        let (inst, rx) = test_instance_with_events(1);
        let mut st = state_with(vec![inst], vec![ready_client("a", 1)]);
        st.instances[0].dtmf = Some(Box::new(OneShotDtmf(Some(DtmfEvent {
            digit: 'm',
            duration_ms: 40,
        }))));
        fill_window(&mut st.clients[0], 0x21, 200);
        let sock = test_socket();
        run_voting_cycle(&mut st, &sock, Instant::now(), true);
        let events = drain_events(&rx);
        assert!(!events
            .iter()
            .any(|e| matches!(e, ChannelEvent::DtmfEnd { .. })));
        let frames = audio_frames(&events);
        assert!(frames[0].iter().all(|&s| s == 0));
    }
}
