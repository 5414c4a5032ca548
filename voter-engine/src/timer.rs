//! 20 ms timing thread.
//!
//! Free-running absolute-deadline tick. When no master timing source is
//! configured anywhere, this thread drives the drain/vote cycle itself;
//! otherwise it only advances the tick counter the reader compares the
//! master against.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::state::Shared;
use crate::time::walltime_now;
use crate::voting::run_voting_cycle;

const TICK: Duration = Duration::from_millis(20);

pub(crate) fn timer_loop(shared: Arc<Shared>) {
    log::debug!("timer thread started");
    let mut next_tick = Instant::now() + TICK;
    while shared.run.load(Ordering::SeqCst) {
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        }
        next_tick += TICK;
        // Reset if we've fallen too far behind.
        let now = Instant::now();
        if now > next_tick + TICK * 2 {
            next_tick = now + TICK;
        }

        let mut st = shared.state.lock();
        if !st.hasmaster {
            let (sec, _) = walltime_now();
            st.master_time.sec = sec as u32;
        }
        st.voter_timing_count = st.voter_timing_count.wrapping_add(1);
        if !st.hasmaster {
            run_voting_cycle(&mut st, &shared.socket, now, false);
            st.xmit_master_tick();
            st.timeout_scan(now);
            st.sanity_scan();
        }
    }
    log::debug!("timer thread exited");
}
