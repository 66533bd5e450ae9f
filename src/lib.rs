//! A userland TCP/IPv4 network stack over a tun device: device RX feeds
//! IPv4 receive/reassembly, which feeds the TCP segment-arrives processor,
//! which fills per-connection receive buffers the application API drains.
//! Initialization order is device -> IP -> TCP, matching §9's ordering
//! note (there is no separate Ethernet/ARP layer here: a tun device is
//! already layer-3, see [`device`]'s module doc).

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use log::{error, trace, warn};

mod config;
mod err;
pub use err::Error;

pub mod device;
pub mod ip;
pub mod tcp;
mod util;

use device::{Driver, TunDriver};
use ip::reassembly::ReassemblyTable;
use ip::tx::IdGenerator;
use ip::{NetifIp, ProtocolRegistry};
use tcp::cb::CbTable;
use tcp::segment::{self, OutSegment};
use tcp::types::Dual;
pub use tcp::Socket;

/// Everything the stack's threads and the application API share. The CB
/// table and the reassembly table each carry their own mutex per §5's
/// "shared-resource policy"; they are never locked at the same time as
/// each other or nested under the device lock.
pub(crate) struct Inner {
    netif: NetifIp,
    cbs: Arc<Mutex<CbTable>>,
    reassembly: Arc<Mutex<ReassemblyTable>>,
    ids: IdGenerator,
    device: Mutex<TunDriver>,
    protocols: Mutex<ProtocolRegistry>,
}

/// The stack: owns the device receive thread and the timer thread for as
/// long as it's alive. Sockets hold an `Arc` to the same shared state, so
/// they keep working after the value returned by `new` is dropped as long
/// as at least one `Socket` or the background threads still reference it.
pub struct NetStack {
    inner: Arc<Inner>,
    rx: thread::JoinHandle<()>,
    timer: thread::JoinHandle<()>,
}

impl NetStack {
    /// Brings up a tun device under `name` with the given local address
    /// and netmask, then starts the receive and timer threads.
    pub fn new(name: &str, addr: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self, Error> {
        let mut device = TunDriver::new(name, addr, netmask)?;
        device.open()?;
        device.run()?;

        let mut protocols = ProtocolRegistry::new();
        protocols.add_protocol(config::IP_PROTOCOL_TCP);

        let cbs = Arc::new(Mutex::new(CbTable::new()));
        let reassembly = Arc::new(Mutex::new(ReassemblyTable::new()));

        let inner = Arc::new(Inner {
            netif: NetifIp::new(addr, netmask),
            cbs: cbs.clone(),
            reassembly: reassembly.clone(),
            ids: IdGenerator::new(),
            device: Mutex::new(device),
            protocols: Mutex::new(protocols),
        });

        let rx = {
            let inner = inner.clone();
            thread::spawn(move || rx_loop(inner))
        };
        let timer = tcp::timer::spawn(cbs, reassembly);

        Ok(NetStack { inner, rx, timer })
    }

    /// Registers an IP protocol number as one the receive path should
    /// dispatch instead of silently drop. TCP (6) is registered by `new`
    /// already; this exists for parity with §6's exposed interface and
    /// for tests that want to assert on the registry directly.
    pub fn add_protocol(&self, protocol: u8) {
        self.inner.protocols.lock().unwrap().add_protocol(protocol);
    }

    /// `open()`: claims a free CB table slot.
    pub fn open(&self) -> Result<Socket, Error> {
        let mut cbs = self.inner.cbs.lock().unwrap();
        let idx = cbs.alloc().ok_or(Error::NoFreeSocket)?;
        Ok(Socket::new(self.inner.clone(), idx))
    }

    /// Convenience wrapper over `open` + `bind` + `listen`, mirroring the
    /// shape of the `server`/`client` sample binaries.
    pub fn bind(&self, port: u16) -> Result<Socket, Error> {
        let socket = self.open()?;
        socket.bind(port)?;
        socket.listen()?;
        Ok(socket)
    }

    /// Convenience wrapper over `open` + `connect`.
    pub fn connect(&self, addr: Ipv4Addr, port: u16) -> Result<Socket, Error> {
        let socket = self.open()?;
        socket.connect(addr, port)?;
        Ok(socket)
    }

    /// Blocks forever, keeping the calling thread alive alongside the
    /// background receive and timer threads.
    pub fn join(self) {
        self.rx.join().unwrap();
        self.timer.join().unwrap();
    }
}

/// Frames `seg` between `local` and `peer` and hands it to IP transmit.
/// Transmit failures are logged and swallowed -- per §7, transport
/// failure is an observable condition for the caller of `send`/`connect`/
/// `close` (they see their own Result), not a reason to panic the
/// receive loop.
pub(crate) fn transmit_segment(inner: &Inner, local: Dual, peer: Dual, seg: OutSegment) {
    let wire = segment::encode(local, peer, &seg);
    let mut device = inner.device.lock().unwrap();
    if let Err(e) = ip::tx::transmit(&mut device, &inner.ids, &inner.netif, config::IP_PROTOCOL_TCP, &wire, peer.ipv4) {
        warn!("ip transmit to {} failed: {e}", peer.ipv4);
    }
}

fn rx_loop(inner: Arc<Inner>) {
    loop {
        let mut buf = [0u8; config::MTU];
        let n = {
            let mut device = inner.device.lock().unwrap();
            match device.poll_read(&mut buf, 100) {
                Ok(Some(n)) => n,
                Ok(None) => continue,
                Err(e) => {
                    error!("device read failed: {e}");
                    continue;
                }
            }
        };

        let Some(received) = ip::receive(&inner.netif, &buf[..n], &inner.reassembly) else {
            continue;
        };
        if !inner.protocols.lock().unwrap().is_registered(received.protocol) {
            trace!("dropping datagram for unregistered protocol {}", received.protocol);
            continue;
        }
        if received.protocol != config::IP_PROTOCOL_TCP {
            continue;
        }
        handle_tcp(&inner, received.src, received.dst, &received.payload);
    }
}

/// §4.8's lookup/allocate pass plus §4.9's segment-arrives dispatch, run
/// once per inbound TCP segment. The CB mutex is held for the lookup and
/// the state-machine step, then released before any reply segment is
/// framed and handed to IP transmit (which takes the device mutex) --
/// the two locks are never nested.
fn handle_tcp(inner: &Inner, ip_src: Ipv4Addr, ip_dst: Ipv4Addr, payload: &[u8]) {
    let Some(seg) = segment::decode(ip_src, ip_dst, payload) else {
        trace!("dropping tcp segment failing decode");
        return;
    };
    let local_port = seg.quad.dst.port;
    let peer = seg.quad.src;
    let local = Dual { ipv4: ip_dst, port: local_port };

    let to_send = {
        let mut cbs = inner.cbs.lock().unwrap();
        let lookup = cbs.lookup_for_segment(local_port, peer);

        let idx = if let Some(idx) = lookup.exact {
            idx
        } else if let (Some(free_idx), Some(listen_idx)) = (lookup.free, lookup.listen) {
            cbs.claim_child(free_idx, listen_idx, peer);
            free_idx
        } else {
            drop(cbs);
            if !seg.rst {
                let rst = segment::reset_for_closed(&seg);
                transmit_segment(inner, local, peer, rst);
            }
            return;
        };

        let out = cbs.on_segment(idx, &seg, Instant::now());

        if out.promote_established {
            if let Some(parent_idx) = cbs.get(idx).parent {
                cbs.get_mut(parent_idx).backlog.push(idx);
                cbs.cond(parent_idx).notify_all();
            }
            cbs.cond(idx).notify_all();
        } else if out.wake_reader || out.wake_writer || out.wake_closer {
            cbs.cond(idx).notify_all();
        }

        if out.delete {
            let cond = cbs.cond(idx);
            cbs.free(idx);
            cond.notify_all();
        }

        out.to_send
    };

    for seg_out in to_send {
        transmit_segment(inner, local, peer, seg_out);
    }
}
