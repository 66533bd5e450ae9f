//! The background timer thread: force-closes connections that have gone
//! silent past their deadline, and periodically sweeps the fragment
//! reassembly table. Neither retransmits anything -- there is no
//! retransmission queue in this design, so a USER_TIMEOUT expiry simply
//! abandons the connection rather than retrying the outstanding segment.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use log::debug;

use crate::config;
use crate::ip::reassembly::ReassemblyTable;

use super::cb::CbTable;

/// Spawns the timer thread. It owns no resources of its own; both tables
/// are shared with the segment-receive loop under their respective
/// mutexes.
pub fn spawn(table: Arc<Mutex<CbTable>>, reassembly: Arc<Mutex<ReassemblyTable>>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut last_sweep = Instant::now();
        loop {
            thread::sleep(config::TIMER_TICK);
            let now = Instant::now();

            {
                let mut cbs = table.lock().unwrap();
                for idx in cbs.sweep_timeouts(now) {
                    debug!("cb {idx}: timer force-close");
                    let cond = cbs.cond(idx);
                    cbs.free(idx);
                    cond.notify_all();
                }
            }

            if now.duration_since(last_sweep) >= config::REASSEMBLY_SWEEP_INTERVAL {
                reassembly.lock().unwrap().sweep(now);
                last_sweep = now;
            }
        }
    })
}
