//! The connection control block and the segment-arrives event processor.
//! `CbTable` owns every CB; all mutation happens under the table's single
//! mutex (held by the caller, not by this module -- see `tcp::api`).

use std::sync::Arc;
use std::sync::Condvar;
use std::time::Instant;

use log::debug;

use crate::config;
use crate::util::WaitQueue;

use super::segment::{DecodedSegment, OutSegment};
use super::types::{in_window, le, lt, random_iss, Dual, RecvSpace, SendSpace, State};

#[derive(Debug)]
pub struct Cb {
    pub state: State,
    pub port: u16,
    pub peer: Dual,
    pub snd: SendSpace,
    pub iss: u32,
    pub rcv: RecvSpace,
    pub irs: u32,
    pub window: Box<[u8; config::RECV_WINDOW_SIZE]>,
    pub parent: Option<usize>,
    pub backlog: WaitQueue<usize>,
    pub timeout: Option<Instant>,
}

impl Cb {
    fn closed() -> Self {
        Cb {
            state: State::Closed,
            port: 0,
            peer: Dual { ipv4: std::net::Ipv4Addr::UNSPECIFIED, port: 0 },
            snd: SendSpace::default(),
            iss: 0,
            rcv: RecvSpace { wnd: config::RECV_WINDOW_SIZE as u16, ..Default::default() },
            irs: 0,
            window: Box::new([0u8; config::RECV_WINDOW_SIZE]),
            parent: None,
            backlog: WaitQueue::new(),
            timeout: None,
        }
    }

    /// Bytes currently sitting in the receive window buffer, available to
    /// `recv`.
    pub fn buffered(&self) -> usize {
        config::RECV_WINDOW_SIZE - self.rcv.wnd as usize
    }

    /// Drains up to `out.len()` bytes from the head of the receive window,
    /// shifting the remainder down and growing `rcv.wnd` back open.
    pub fn drain(&mut self, out: &mut [u8]) -> usize {
        let avail = self.buffered();
        let n = out.len().min(avail);
        out[..n].copy_from_slice(&self.window[..n]);
        self.window.copy_within(n..avail, 0);
        self.rcv.wnd += n as u16;
        n
    }
}

/// A slot in the fixed-size CB table: its occupancy flag, the CB itself,
/// and the condition variable API waiters block on.
pub struct CbSlot {
    pub used: bool,
    pub cb: Cb,
    pub cond: Arc<Condvar>,
}

impl CbSlot {
    fn free() -> Self {
        CbSlot { used: false, cb: Cb::closed(), cond: Arc::new(Condvar::new()) }
    }
}

/// Everything the segment-arrives processor decided should happen besides
/// mutating the CB in place: segments to emit, waiters to wake, and
/// whether the caller should promote this CB out of the pending set or
/// free its slot entirely.
#[derive(Default)]
pub struct Outcome {
    pub to_send: Vec<OutSegment>,
    pub wake_reader: bool,
    pub wake_writer: bool,
    pub wake_closer: bool,
    pub promote_established: bool,
    pub delete: bool,
}

impl Outcome {
    fn wake_all(&mut self) {
        self.wake_reader = true;
        self.wake_writer = true;
        self.wake_closer = true;
    }
}

pub struct LookupResult {
    pub exact: Option<usize>,
    pub free: Option<usize>,
    pub listen: Option<usize>,
}

/// The fixed-size (128-entry) CB table. The index into `slots` is the
/// socket handle handed back to applications.
pub struct CbTable {
    slots: Vec<CbSlot>,
}

impl CbTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(config::CB_TABLE_SIZE);
        slots.resize_with(config::CB_TABLE_SIZE, CbSlot::free);
        CbTable { slots }
    }

    pub fn get(&self, idx: usize) -> &Cb {
        &self.slots[idx].cb
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Cb {
        &mut self.slots[idx].cb
    }

    pub fn cond(&self, idx: usize) -> Arc<Condvar> {
        self.slots[idx].cond.clone()
    }

    pub fn is_used(&self, idx: usize) -> bool {
        self.slots[idx].used
    }

    /// Allocator for `open`: linear scan from index 0 for a free slot.
    pub fn alloc(&mut self) -> Option<usize> {
        let idx = self.slots.iter().position(|s| !s.used && s.cb.state == State::Closed)?;
        self.slots[idx] = CbSlot { used: true, cb: Cb::closed(), cond: Arc::new(Condvar::new()) };
        debug!("cb {idx}: allocated");
        Some(idx)
    }

    /// Marks a slot `used=false` so the allocator scanner can see it, but
    /// leaves `state` alone -- `close()` on a socket that still has
    /// unacknowledged segments in flight needs the CB to keep living in
    /// its current state (FIN_WAIT1, LAST_ACK, ...) until the peer
    /// finishes the teardown or the timer force-closes it.
    pub fn release(&mut self, idx: usize) {
        self.slots[idx].used = false;
    }

    /// Fully frees a slot: the inverse of `alloc`.
    pub fn free(&mut self, idx: usize) {
        self.slots[idx] = CbSlot::free();
        debug!("cb {idx}: freed");
    }

    /// Whether `port` is held by any non-free CB (used by `bind`).
    pub fn port_in_use(&self, port: u16) -> bool {
        self.slots.iter().any(|s| s.used && s.cb.port == port)
    }

    /// Scans the ephemeral range starting at `start_offset` (taken from
    /// `time % 1024` by the caller) for a port not already held by any
    /// CB, wrapping once around the range.
    pub fn alloc_ephemeral_port(&self, start_offset: u16) -> Option<u16> {
        let span = config::EPHEMERAL_PORT_MAX - config::EPHEMERAL_PORT_MIN + 1;
        let start = start_offset % span;
        (0..span)
            .map(|i| config::EPHEMERAL_PORT_MIN + (start + i) % span)
            .find(|port| !self.port_in_use(*port))
    }

    /// §4.8: a single linear scan that finds an exact 4-tuple match, the
    /// first free slot, and the first matching LISTEN CB, all in one pass.
    /// An exact match short-circuits the scan immediately.
    pub fn lookup_for_segment(&self, local_port: u16, peer: Dual) -> LookupResult {
        let mut free = None;
        let mut listen = None;
        for (i, slot) in self.slots.iter().enumerate() {
            // A connection stays matchable by its 4-tuple for as long as
            // its state isn't CLOSED, independent of `used`: `close()`
            // clears `used` the moment it's called so the slot is free
            // for `open` to reuse once the state machine actually reaches
            // CLOSED, but segments for the still-live teardown (FIN_WAIT1,
            // LAST_ACK, TIME_WAIT, ...) must keep finding this CB rather
            // than falling through to a stray RST.
            if slot.cb.state != State::Listen
                && slot.cb.state != State::Closed
                && slot.cb.port == local_port
                && slot.cb.peer == peer
            {
                return LookupResult { exact: Some(i), free, listen };
            }
            if free.is_none() && !slot.used && slot.cb.state == State::Closed {
                free = Some(i);
            }
            if listen.is_none() && slot.used && slot.cb.state == State::Listen && slot.cb.port == local_port {
                listen = Some(i);
            }
        }
        LookupResult { exact: None, free, listen }
    }

    /// Claims a free slot as a child of a LISTEN CB: copies `{state=
    /// LISTEN, port}` from the parent, sets `parent` and `peer`. The
    /// segment processor (run immediately after, by the caller) promotes
    /// it to SYN_RCVD.
    pub fn claim_child(&mut self, free_idx: usize, listen_idx: usize, peer: Dual) {
        let port = self.slots[listen_idx].cb.port;
        self.slots[free_idx] = CbSlot {
            used: true,
            cb: Cb { state: State::Listen, port, peer, ..Cb::closed() },
            cond: Arc::new(Condvar::new()),
        };
        self.slots[free_idx].cb.parent = Some(listen_idx);
    }

    pub fn on_segment(&mut self, idx: usize, seg: &DecodedSegment, now: Instant) -> Outcome {
        match self.slots[idx].cb.state {
            State::Listen => self.on_listen(idx, seg, now),
            State::SynSent => self.on_syn_sent(idx, seg, now),
            State::Closed => Outcome::default(),
            _ => self.on_synchronized(idx, seg, now),
        }
    }

    fn on_listen(&mut self, idx: usize, seg: &DecodedSegment, now: Instant) -> Outcome {
        let mut out = Outcome::default();
        if seg.rst {
            return out;
        }
        if seg.ack_flag {
            out.to_send.push(OutSegment::flags(seg.ack, 0, 0, false, false, false, true, false, vec![]));
            return out;
        }
        if seg.syn {
            let cb = &mut self.slots[idx].cb;
            cb.rcv.nxt = seg.seq.wrapping_add(1);
            cb.rcv.wnd = config::RECV_WINDOW_SIZE as u16;
            cb.irs = seg.seq;
            cb.iss = random_iss();
            cb.snd.una = cb.iss;
            cb.snd.nxt = cb.iss.wrapping_add(1);
            cb.snd.wnd = seg.wnd;
            cb.peer = seg.quad.src;
            cb.timeout = Some(now + config::USER_TIMEOUT);
            cb.state = State::SynRcvd;
            out.to_send.push(OutSegment::flags(cb.iss, cb.rcv.nxt, cb.rcv.wnd, true, true, false, false, false, vec![]));
            return out;
        }
        // neither RST, ACK, nor SYN: reset back to CLOSED and detach from parent
        out.delete = true;
        out
    }

    fn on_syn_sent(&mut self, idx: usize, seg: &DecodedSegment, now: Instant) -> Outcome {
        let mut out = Outcome::default();
        let (iss, snd_nxt, snd_una) = {
            let cb = &self.slots[idx].cb;
            (cb.iss, cb.snd.nxt, cb.snd.una)
        };

        if seg.ack_flag && (le(seg.ack, iss) || lt(snd_nxt, seg.ack)) {
            out.to_send.push(OutSegment::flags(seg.ack, 0, 0, false, false, false, true, false, vec![]));
            return out;
        }
        let ack_acceptable = seg.ack_flag && le(snd_una, seg.ack) && le(seg.ack, snd_nxt);

        if seg.rst {
            if ack_acceptable {
                out.delete = true;
                out.wake_all();
            }
            return out;
        }

        if seg.syn {
            let cb = &mut self.slots[idx].cb;
            cb.rcv.nxt = seg.seq.wrapping_add(1);
            cb.irs = seg.seq;
            if seg.ack_flag {
                cb.snd.una = seg.ack;
            }
            if lt(cb.iss, cb.snd.una) {
                cb.state = State::Established;
                cb.snd.wnd = seg.wnd;
                cb.snd.wl1 = seg.seq;
                cb.snd.wl2 = seg.ack;
                cb.timeout = None;
                out.to_send.push(OutSegment::flags(cb.snd.nxt, cb.rcv.nxt, cb.rcv.wnd, false, true, false, false, false, vec![]));
                out.promote_established = true;
                out.wake_all();
            } else {
                cb.state = State::SynRcvd;
                cb.timeout = Some(now + config::USER_TIMEOUT);
                out.to_send.push(OutSegment::flags(cb.iss, cb.rcv.nxt, cb.rcv.wnd, true, true, false, false, false, vec![]));
            }
        }
        // segments with neither SYN nor RST, and no acceptable ACK, are dropped
        out
    }

    fn on_synchronized(&mut self, idx: usize, seg: &DecodedSegment, now: Instant) -> Outcome {
        let mut out = Outcome::default();
        let plen = seg.payload.len() as u32;

        let (rcv_nxt, rcv_wnd) = {
            let cb = &self.slots[idx].cb;
            (cb.rcv.nxt, cb.rcv.wnd as u32)
        };
        let acceptable = if plen > 0 {
            rcv_wnd > 0
                && (in_window(seg.seq, rcv_nxt, rcv_wnd)
                    || in_window(seg.seq.wrapping_add(plen - 1), rcv_nxt, rcv_wnd))
        } else if rcv_wnd > 0 {
            in_window(seg.seq, rcv_nxt, rcv_wnd) || seg.seq == rcv_nxt
        } else {
            seg.seq == rcv_nxt
        };

        if !acceptable {
            if !seg.rst {
                let cb = &self.slots[idx].cb;
                out.to_send.push(OutSegment::flags(cb.snd.nxt, cb.rcv.nxt, cb.rcv.wnd, false, true, false, false, false, vec![]));
            }
            return out;
        }

        if seg.rst {
            out.delete = true;
            out.wake_all();
            return out;
        }

        if seg.syn {
            let cb = &self.slots[idx].cb;
            out.to_send.push(OutSegment::flags(cb.snd.nxt, 0, 0, false, false, false, true, false, vec![]));
            out.delete = true;
            out.wake_all();
            return out;
        }

        if !seg.ack_flag {
            return out;
        }

        let state = self.slots[idx].cb.state;
        if state == State::SynRcvd {
            let cb = &self.slots[idx].cb;
            if le(cb.snd.una, seg.ack) && le(seg.ack, cb.snd.nxt) {
                let cb = &mut self.slots[idx].cb;
                cb.state = State::Established;
                cb.snd.wnd = seg.wnd;
                cb.snd.wl1 = seg.seq;
                cb.snd.wl2 = seg.ack;
                cb.timeout = None;
                out.promote_established = true;
            } else {
                out.to_send.push(OutSegment::flags(seg.ack, 0, 0, false, false, false, true, false, vec![]));
                return out;
            }
        } else {
            let cb = &mut self.slots[idx].cb;
            if lt(cb.snd.una, seg.ack) && le(seg.ack, cb.snd.nxt) {
                cb.snd.una = seg.ack;
                if lt(cb.snd.wl1, seg.seq) || (cb.snd.wl1 == seg.seq && le(cb.snd.wl2, seg.ack)) {
                    cb.snd.wnd = seg.wnd;
                    cb.snd.wl1 = seg.seq;
                    cb.snd.wl2 = seg.ack;
                }
            }
            cb.timeout = if cb.snd.una == cb.snd.nxt {
                None
            } else {
                Some(now + config::USER_TIMEOUT)
            };

            if lt(cb.snd.nxt, seg.ack) {
                out.to_send.push(OutSegment::flags(cb.snd.nxt, cb.rcv.nxt, cb.rcv.wnd, false, true, false, false, false, vec![]));
                return out;
            }

            match cb.state {
                State::FinWait1 if cb.snd.una == cb.snd.nxt => cb.state = State::FinWait2,
                State::Closing if cb.snd.una == cb.snd.nxt => {
                    cb.state = State::TimeWait;
                    cb.timeout = Some(now + config::TIME_WAIT_TIMEOUT);
                }
                State::LastAck if cb.snd.una == cb.snd.nxt => {
                    out.delete = true;
                    out.wake_all();
                    return out;
                }
                State::TimeWait => {
                    cb.timeout = Some(now + config::TIME_WAIT_TIMEOUT);
                }
                _ => {}
            }
        }

        {
            let cb = &mut self.slots[idx].cb;
            if seg.urg && matches!(cb.state, State::Established | State::FinWait1 | State::FinWait2) {
                cb.rcv.up = cb.rcv.up.max(seg.urg_ptr as u32);
            }
        }

        {
            let cb = &mut self.slots[idx].cb;
            if matches!(cb.state, State::Established | State::FinWait1 | State::FinWait2) {
                if !seg.payload.is_empty() && seg.seq == cb.rcv.nxt {
                    let used = cb.buffered();
                    let n = seg.payload.len().min(cb.rcv.wnd as usize);
                    cb.window[used..used + n].copy_from_slice(&seg.payload[..n]);
                    cb.rcv.nxt = cb.rcv.nxt.wrapping_add(n as u32);
                    cb.rcv.wnd -= n as u16;
                    out.to_send.push(OutSegment::flags(cb.snd.nxt, cb.rcv.nxt, cb.rcv.wnd, false, true, false, false, false, vec![]));
                    out.wake_reader = true;
                } else if seg.psh && seg.payload.is_empty() {
                    out.to_send.push(OutSegment::flags(cb.snd.nxt, cb.rcv.nxt, cb.rcv.wnd, false, true, false, false, false, vec![]));
                    out.wake_reader = true;
                }
            }
        }

        if seg.fin {
            let cb = &mut self.slots[idx].cb;
            cb.rcv.nxt = cb.rcv.nxt.wrapping_add(1);
            out.to_send.push(OutSegment::flags(cb.snd.nxt, cb.rcv.nxt, cb.rcv.wnd, false, true, false, false, false, vec![]));
            let from = cb.state;
            match cb.state {
                State::SynRcvd | State::Established => cb.state = State::CloseWait,
                State::FinWait1 => cb.state = State::Closing,
                State::FinWait2 => {
                    cb.state = State::TimeWait;
                    cb.timeout = Some(now + config::TIME_WAIT_TIMEOUT);
                }
                State::TimeWait => cb.timeout = Some(now + config::TIME_WAIT_TIMEOUT),
                _ => {}
            }
            if cb.state != from {
                debug!("cb {idx}: {from:?} -> {:?} on FIN", cb.state);
            }
            out.wake_all();
        }

        out
    }

    /// The timer thread's scan: any CB with unacked data or sitting in
    /// TIME_WAIT whose deadline has passed is force-closed.
    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<usize> {
        let mut expired = vec![];
        for (i, slot) in self.slots.iter().enumerate() {
            if !slot.used {
                continue;
            }
            let cb = &slot.cb;
            let has_unacked = cb.snd.una != cb.snd.nxt;
            if has_unacked || cb.state == State::TimeWait {
                if let Some(deadline) = cb.timeout {
                    if deadline < now {
                        expired.push(i);
                    }
                }
            }
        }
        expired
    }
}

impl Default for CbTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn dual(ip: &str, port: u16) -> Dual {
        Dual { ipv4: ip.parse::<Ipv4Addr>().unwrap(), port }
    }

    fn seg(quad_src: Dual, quad_dst: Dual, seq: u32, ack: u32, wnd: u16, syn: bool, ack_flag: bool, fin: bool, rst: bool, psh: bool, payload: Vec<u8>) -> DecodedSegment {
        DecodedSegment {
            quad: super::super::types::Quad { src: quad_src, dst: quad_dst },
            seq,
            ack,
            wnd,
            syn,
            ack_flag,
            fin,
            rst,
            psh,
            urg: false,
            urg_ptr: 0,
            payload,
        }
    }

    /// §8 handshake scenario: active open from A to B.
    #[test]
    fn three_way_handshake_reaches_established_on_both_sides() {
        let a_addr = dual("10.0.0.1", 50000);
        let b_addr = dual("10.0.0.2", 9090);
        let now = Instant::now();

        let mut a = CbTable::new();
        let a_idx = a.alloc().unwrap();
        let iss_a = 1000u32;
        {
            let cb = a.get_mut(a_idx);
            cb.port = a_addr.port;
            cb.peer = b_addr;
            cb.iss = iss_a;
            cb.snd.una = iss_a;
            cb.snd.nxt = iss_a.wrapping_add(1);
            cb.rcv.wnd = config::RECV_WINDOW_SIZE as u16;
            cb.state = State::SynSent;
        }

        let mut b = CbTable::new();
        let listener = b.alloc().unwrap();
        {
            let cb = b.get_mut(listener);
            cb.port = b_addr.port;
            cb.state = State::Listen;
        }

        // A's SYN arrives at B.
        let syn = seg(a_addr, b_addr, iss_a, 0, a.get(a_idx).rcv.wnd, true, false, false, false, false, vec![]);
        let lookup = b.lookup_for_segment(b_addr.port, a_addr);
        let child = lookup.free.unwrap();
        assert_eq!(lookup.listen, Some(listener));
        b.claim_child(child, listener, a_addr);
        let out = b.on_segment(child, &syn, now);
        assert_eq!(b.get(child).state, State::SynRcvd);
        let synack = out.to_send.into_iter().next().expect("listen emits SYN,ACK");
        let iss_b = synack.seq;
        assert!(synack.syn && synack.ack_flag);
        assert_eq!(synack.ack, iss_a.wrapping_add(1));

        // B's SYN,ACK arrives at A.
        let synack_in = seg(b_addr, a_addr, synack.seq, synack.ack, synack.wnd, synack.syn, synack.ack_flag, synack.fin, synack.rst, synack.psh, synack.payload.clone());
        let out = a.on_segment(a_idx, &synack_in, now);
        assert_eq!(a.get(a_idx).state, State::Established);
        assert!(out.promote_established);
        let ack = out.to_send.into_iter().next().expect("syn_sent emits final ACK");
        assert_eq!(ack.seq, iss_a.wrapping_add(1));
        assert_eq!(ack.ack, iss_b.wrapping_add(1));

        // A's final ACK arrives at B.
        let ack_in = seg(a_addr, b_addr, ack.seq, ack.ack, ack.wnd, ack.syn, ack.ack_flag, ack.fin, ack.rst, ack.psh, ack.payload.clone());
        let out = b.on_segment(child, &ack_in, now);
        assert_eq!(b.get(child).state, State::Established);
        assert!(out.promote_established);

        assert_eq!(a.get(a_idx).snd.una, iss_a.wrapping_add(1));
        assert_eq!(a.get(a_idx).rcv.nxt, iss_b.wrapping_add(1));
        assert_eq!(b.get(child).snd.una, iss_b.wrapping_add(1));
        assert_eq!(b.get(child).rcv.nxt, iss_a.wrapping_add(1));
    }

    fn established_pair() -> (CbTable, usize, Dual, CbTable, usize, Dual, Instant) {
        let a_addr = dual("10.0.0.1", 50000);
        let b_addr = dual("10.0.0.2", 9090);
        let now = Instant::now();

        let mut a = CbTable::new();
        let a_idx = a.alloc().unwrap();
        {
            let cb = a.get_mut(a_idx);
            cb.port = a_addr.port;
            cb.peer = b_addr;
            cb.iss = 1000;
            cb.snd.una = 1001;
            cb.snd.nxt = 1001;
            cb.irs = 5000;
            cb.rcv.nxt = 5001;
            cb.rcv.wnd = config::RECV_WINDOW_SIZE as u16;
            cb.state = State::Established;
        }

        let mut b = CbTable::new();
        let b_idx = b.alloc().unwrap();
        {
            let cb = b.get_mut(b_idx);
            cb.port = b_addr.port;
            cb.peer = a_addr;
            cb.iss = 5000;
            cb.snd.una = 5001;
            cb.snd.nxt = 5001;
            cb.irs = 1000;
            cb.rcv.nxt = 1001;
            cb.rcv.wnd = config::RECV_WINDOW_SIZE as u16;
            cb.state = State::Established;
        }

        (a, a_idx, a_addr, b, b_idx, b_addr, now)
    }

    /// §8 data-exchange scenario.
    #[test]
    fn sent_payload_is_delivered_and_acked() {
        let (mut a, a_idx, a_addr, mut b, b_idx, b_addr, now) = established_pair();

        let payload = b"hello".to_vec();
        let data_seq = a.get(a_idx).snd.nxt;
        a.get_mut(a_idx).snd.nxt = data_seq.wrapping_add(payload.len() as u32);

        let data = seg(a_addr, b_addr, data_seq, a.get(a_idx).rcv.nxt, a.get(a_idx).rcv.wnd, false, true, false, false, true, payload.clone());
        let out = b.on_segment(b_idx, &data, now);
        let mut recvd = vec![0u8; 5];
        assert_eq!(b.get_mut(b_idx).drain(&mut recvd), 5);
        assert_eq!(&recvd, b"hello");

        let ack = out.to_send.into_iter().next().expect("text segment triggers an ACK");
        assert_eq!(ack.ack, data_seq.wrapping_add(5));

        let ack_in = seg(b_addr, a_addr, ack.seq, ack.ack, ack.wnd, ack.syn, ack.ack_flag, ack.fin, ack.rst, ack.psh, ack.payload.clone());
        a.on_segment(a_idx, &ack_in, now);
        assert_eq!(a.get(a_idx).snd.una, data_seq.wrapping_add(5));
    }

    /// §8 teardown scenario: initiator FIN -> FIN_WAIT1 -> FIN_WAIT2 ->
    /// TIME_WAIT; passive side FIN -> CLOSE_WAIT -> LAST_ACK -> freed.
    #[test]
    fn teardown_reaches_time_wait_and_frees_on_expiry() {
        let (mut a, a_idx, a_addr, mut b, b_idx, b_addr, now) = established_pair();

        // A closes: emits FIN.
        let fin_seq = a.get(a_idx).snd.nxt;
        a.get_mut(a_idx).snd.nxt = fin_seq.wrapping_add(1);
        a.get_mut(a_idx).state = State::FinWait1;

        let fin = seg(a_addr, b_addr, fin_seq, a.get(a_idx).rcv.nxt, a.get(a_idx).rcv.wnd, false, true, true, false, false, vec![]);
        let out = b.on_segment(b_idx, &fin, now);
        assert_eq!(b.get(b_idx).state, State::CloseWait);
        let ack = out.to_send.into_iter().next().expect("FIN triggers an ACK");

        let ack_in = seg(b_addr, a_addr, ack.seq, ack.ack, ack.wnd, ack.syn, ack.ack_flag, ack.fin, ack.rst, ack.psh, ack.payload.clone());
        a.on_segment(a_idx, &ack_in, now);
        assert_eq!(a.get(a_idx).state, State::FinWait2);

        // B's application closes: CLOSE_WAIT -> LAST_ACK, emits FIN.
        let b_fin_seq = b.get(b_idx).snd.nxt;
        b.get_mut(b_idx).snd.nxt = b_fin_seq.wrapping_add(1);
        b.get_mut(b_idx).state = State::LastAck;

        let b_fin = seg(b_addr, a_addr, b_fin_seq, b.get(b_idx).rcv.nxt, b.get(b_idx).rcv.wnd, false, true, true, false, false, vec![]);
        let out = a.on_segment(a_idx, &b_fin, now);
        assert_eq!(a.get(a_idx).state, State::TimeWait);
        let final_ack = out.to_send.into_iter().next().expect("FIN triggers an ACK");

        let final_ack_in = seg(a_addr, b_addr, final_ack.seq, final_ack.ack, final_ack.wnd, final_ack.syn, final_ack.ack_flag, final_ack.fin, final_ack.rst, final_ack.psh, final_ack.payload.clone());
        let out = b.on_segment(b_idx, &final_ack_in, now);
        assert!(out.delete);

        let past = now + config::TIME_WAIT_TIMEOUT + Duration::from_secs(1);
        assert_eq!(a.sweep_timeouts(past), vec![a_idx]);
    }

    /// A CB mid-teardown (released by the application's `close()`, so
    /// `used == false`, but not yet CLOSED) must still be the exact match
    /// for its 4-tuple -- the lookup that feeds the receive path has no
    /// other way to find it, and a miss here would RST a connection that
    /// is still tearing down in good order.
    #[test]
    fn released_cb_still_matches_its_4_tuple() {
        let (mut a, a_idx, a_addr, _b, _b_idx, b_addr, _now) = established_pair();
        a.get_mut(a_idx).state = State::FinWait1;
        a.slots[a_idx].used = false;

        let lookup = a.lookup_for_segment(a_addr.port, b_addr);
        assert_eq!(lookup.exact, Some(a_idx));
    }

    /// §8 reset scenario: a RST against an ESTABLISHED CB closes it and
    /// signals every waiter.
    #[test]
    fn rst_to_established_cb_closes_and_wakes_all() {
        let (mut a, a_idx, _a_addr, _b, _b_idx, b_addr, now) = established_pair();
        let rcv_nxt = a.get(a_idx).rcv.nxt;
        let rst = seg(b_addr, dual("10.0.0.1", 50000), rcv_nxt, 0, 0, false, false, false, true, false, vec![]);
        let out = a.on_segment(a_idx, &rst, now);
        assert!(out.delete);
        assert!(out.wake_reader && out.wake_writer && out.wake_closer);
    }

    /// §8 port-allocation property, scaled to the table's 128-slot
    /// capacity: repeatedly binding and releasing cycles through the
    /// ephemeral range without ever handing out a port already in use by
    /// a live CB.
    #[test]
    fn ephemeral_ports_stay_in_range_and_never_collide_while_live() {
        let mut table = CbTable::new();
        let mut live = Vec::new();
        for cycle in 0..2000u32 {
            let idx = match table.alloc() {
                Some(idx) => idx,
                None => {
                    let (old_idx, _) = live.remove(0);
                    table.free(old_idx);
                    table.alloc().unwrap()
                }
            };
            let port = table.alloc_ephemeral_port((cycle % 1024) as u16).expect("range has room");
            assert!((config::EPHEMERAL_PORT_MIN..=config::EPHEMERAL_PORT_MAX).contains(&port));
            assert!(!table.port_in_use(port));
            table.get_mut(idx).port = port;
            live.push((idx, port));
        }
    }
}
