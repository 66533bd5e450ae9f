//! The eight application verbs (§4.10): `open, bind, listen, accept,
//! connect, send, recv, close`. Every entry point takes the global CB
//! table's mutex for its whole duration except the blocking waits, which
//! release it while parked on the CB's condition variable and re-check
//! state on wake -- the condition alone never carries enough information.

use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log::{debug, trace, warn};

use crate::config;
use crate::err::Error;
use crate::{transmit_segment, Inner};

use super::segment::OutSegment;
use super::types::{random_iss, Dual, State};

/// A socket handle: an index into the shared CB table plus a reference to
/// the stack that owns it. Small and `Clone`, the way the distilled design
/// treats a non-negative integer handle.
#[derive(Clone)]
pub struct Socket {
    pub(crate) inner: Arc<Inner>,
    pub(crate) handle: usize,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("handle", &self.handle).finish()
    }
}

impl Socket {
    pub(crate) fn new(inner: Arc<Inner>, handle: usize) -> Self {
        Socket { inner, handle }
    }

    fn local(&self, port: u16) -> Dual {
        Dual { ipv4: self.inner.netif.unicast, port }
    }

    /// `bind(socket, port)`: requires `used && state == CLOSED` and the
    /// port held by no other non-free CB.
    pub fn bind(&self, port: u16) -> Result<(), Error> {
        let mut cbs = self.inner.cbs.lock().unwrap();
        if !cbs.is_used(self.handle) || cbs.get(self.handle).state != State::Closed {
            return Err(Error::IllegalState);
        }
        if cbs.port_in_use(port) {
            return Err(Error::PortInUse(port));
        }
        cbs.get_mut(self.handle).port = port;
        Ok(())
    }

    /// `listen(socket)`: requires `used && state == CLOSED && port != 0`.
    pub fn listen(&self) -> Result<(), Error> {
        let mut cbs = self.inner.cbs.lock().unwrap();
        let cb = cbs.get(self.handle);
        if !cbs.is_used(self.handle) || cb.state != State::Closed || cb.port == 0 {
            return Err(Error::IllegalState);
        }
        cbs.get_mut(self.handle).state = State::Listen;
        Ok(())
    }

    /// `accept(socket)`: requires `used && state == LISTEN`; waits while
    /// the state holds and the backlog is empty, then hands back the
    /// first established child.
    pub fn accept(&self) -> Result<Socket, Error> {
        let mut cbs = self.inner.cbs.lock().unwrap();
        if !cbs.is_used(self.handle) || cbs.get(self.handle).state != State::Listen {
            return Err(Error::IllegalState);
        }
        loop {
            if cbs.get(self.handle).state != State::Listen {
                return Err(Error::ConnectionClosed);
            }
            if let Some(child) = cbs.get_mut(self.handle).backlog.pop() {
                debug!("socket {}: accepted child {child}", self.handle);
                return Ok(Socket::new(self.inner.clone(), child));
            }
            let cond = cbs.cond(self.handle);
            cbs = cond.wait(cbs).unwrap();
        }
    }

    /// `connect(socket, addr, port)`: requires `used && state == CLOSED`.
    /// Allocates an ephemeral source port when the socket was not already
    /// bound, emits the initial SYN, then waits while `state == SYN_SENT`.
    pub fn connect(&self, addr: Ipv4Addr, port: u16) -> Result<(), Error> {
        let (local, peer, syn) = {
            let mut cbs = self.inner.cbs.lock().unwrap();
            if !cbs.is_used(self.handle) || cbs.get(self.handle).state != State::Closed {
                return Err(Error::IllegalState);
            }

            let local_port = if cbs.get(self.handle).port != 0 {
                cbs.get(self.handle).port
            } else {
                let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis();
                let start = (now_ms % 1024) as u16;
                cbs.alloc_ephemeral_port(start).ok_or_else(|| {
                    warn!("socket {}: ephemeral port range exhausted", self.handle);
                    Error::NoFreePort
                })?
            };

            let iss = random_iss();
            let peer = Dual { ipv4: addr, port };
            let cb = cbs.get_mut(self.handle);
            cb.port = local_port;
            cb.peer = peer;
            cb.iss = iss;
            cb.snd.una = iss;
            cb.snd.nxt = iss.wrapping_add(1);
            cb.rcv.wnd = config::RECV_WINDOW_SIZE as u16;
            cb.timeout = Some(Instant::now() + config::USER_TIMEOUT);
            cb.state = State::SynSent;

            let syn = OutSegment::flags(iss, 0, cb.rcv.wnd, true, false, false, false, false, vec![]);
            (self.local(local_port), peer, syn)
        };

        trace!("socket {}: connect emits SYN", self.handle);
        transmit_segment(&self.inner, local, peer, syn);

        let mut cbs = self.inner.cbs.lock().unwrap();
        while cbs.get(self.handle).state == State::SynSent {
            let cond = cbs.cond(self.handle);
            cbs = cond.wait(cbs).unwrap();
        }
        if cbs.get(self.handle).state != State::Established {
            return Err(Error::ConnectionReset);
        }
        Ok(())
    }

    /// `send(socket, buf, len)`: legal only in ESTABLISHED or CLOSE_WAIT,
    /// capped at MSS. The segment is framed from the pre-advance
    /// `snd.nxt`; only after framing does `snd.nxt` move, so the sequence
    /// number on the wire always matches what the peer's `rcv.nxt` is
    /// waiting for.
    pub fn send(&self, buf: &[u8]) -> Result<usize, Error> {
        let (local, peer, seg) = {
            let mut cbs = self.inner.cbs.lock().unwrap();
            let cb = cbs.get(self.handle);
            match cb.state {
                State::Established | State::CloseWait => {}
                State::Closed => return Err(Error::ConnectionClosed),
                State::FinWait1 | State::FinWait2 | State::Closing | State::TimeWait | State::LastAck => {
                    return Err(Error::ConnectionClosing)
                }
                _ => return Err(Error::IllegalState),
            }

            let len = buf.len().min(config::MSS);
            let seq = cb.snd.nxt;
            let peer = cb.peer;
            let local = self.local(cb.port);
            let seg = OutSegment::flags(seq, cb.rcv.nxt, cb.rcv.wnd, false, true, false, false, true, buf[..len].to_vec());

            let cb = cbs.get_mut(self.handle);
            cb.snd.nxt = cb.snd.nxt.wrapping_add(len as u32);
            cb.timeout = Some(Instant::now() + config::USER_TIMEOUT);
            (local, peer, seg)
        };

        let sent = seg.payload.len();
        transmit_segment(&self.inner, local, peer, seg);
        Ok(sent)
    }

    /// `recv(socket, buf, size)`: legal in ESTABLISHED/FIN_WAIT1/
    /// FIN_WAIT2/CLOSE_WAIT. Waits while the receive buffer is empty,
    /// except in CLOSE_WAIT with nothing left to deliver, which reports
    /// that the peer is gone rather than blocking forever.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut cbs = self.inner.cbs.lock().unwrap();
        loop {
            let cb = cbs.get(self.handle);
            if !matches!(cb.state, State::Established | State::FinWait1 | State::FinWait2 | State::CloseWait) {
                return Err(Error::ConnectionClosed);
            }
            if cb.buffered() > 0 {
                break;
            }
            if cb.state == State::CloseWait {
                return Err(Error::ConnectionClosing);
            }
            let cond = cbs.cond(self.handle);
            cbs = cond.wait(cbs).unwrap();
        }
        Ok(cbs.get_mut(self.handle).drain(buf))
    }

    /// `close(socket)`: dispatches on state per §4.10. Marks `used=false`
    /// on entry regardless of outcome so a slot mid-teardown is already
    /// invisible to `open`'s scanner.
    pub fn close(&self) -> Result<(), Error> {
        let emit = {
            let mut cbs = self.inner.cbs.lock().unwrap();
            cbs.release(self.handle);

            match cbs.get(self.handle).state {
                State::Closed => return Ok(()),
                State::Listen => {
                    // Children in the backlog reached ESTABLISHED but were
                    // never handed to an application; there is no orderly
                    // FIN to send on their behalf, so each gets a RST.
                    let mut rsts = Vec::new();
                    while let Some(child) = cbs.get_mut(self.handle).backlog.pop() {
                        let cb = cbs.get(child);
                        rsts.push((self.local(cb.port), cb.peer, OutSegment::flags(cb.snd.nxt, 0, 0, false, false, false, true, false, vec![])));
                        let cond = cbs.cond(child);
                        cbs.free(child);
                        cond.notify_all();
                    }
                    cbs.free(self.handle);
                    rsts
                }
                State::SynSent => {
                    cbs.free(self.handle);
                    vec![]
                }
                State::SynRcvd | State::Established => {
                    let cb = cbs.get(self.handle);
                    let seg = OutSegment::flags(cb.snd.nxt, cb.rcv.nxt, cb.rcv.wnd, false, true, true, false, false, vec![]);
                    let peer = cb.peer;
                    let local = self.local(cb.port);
                    let cb = cbs.get_mut(self.handle);
                    cb.snd.nxt = cb.snd.nxt.wrapping_add(1);
                    cb.state = State::FinWait1;
                    vec![(local, peer, seg)]
                }
                State::CloseWait => {
                    let cb = cbs.get(self.handle);
                    let seg = OutSegment::flags(cb.snd.nxt, cb.rcv.nxt, cb.rcv.wnd, false, true, true, false, false, vec![]);
                    let peer = cb.peer;
                    let local = self.local(cb.port);
                    let cb = cbs.get_mut(self.handle);
                    cb.snd.nxt = cb.snd.nxt.wrapping_add(1);
                    // RFC 793 has CLOSE_WAIT -> LAST_ACK on the application's
                    // close, not CLOSING (see DESIGN.md's note on this).
                    cb.state = State::LastAck;
                    vec![(local, peer, seg)]
                }
                State::FinWait1 | State::FinWait2 | State::Closing | State::TimeWait | State::LastAck => {
                    return Err(Error::ConnectionClosing);
                }
            }
        };

        for (local, peer, seg) in emit {
            transmit_segment(&self.inner, local, peer, seg);
        }
        Ok(())
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.recv(buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.send(buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
