//! The driver capability interface and a small per-type registry, standing
//! in for the Ethernet/ARP link layer that sits below this stack. The only
//! driver this crate ships is a tun device, which already delivers bare
//! IPv4 datagrams (no Ethernet framing, so no ARP resolution step is
//! needed at this layer) -- but the interface is shaped so a raw-socket or
//! tap driver could be registered under a different type tag without
//! touching anything above it.

use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, RawFd};

use nix::poll::{poll, PollFd, PollFlags};
use tidy_tuntap::Tun;

use crate::err::Error;

/// Identifies a device type for driver registration, mirroring the
/// `NETDEV_TYPE_*` tags a link-layer registry would dispatch on.
pub type DeviceType = u16;
pub const DEVICE_TYPE_TUN: DeviceType = 1;

/// The capability surface every device driver exposes. `run`/`stop` bracket
/// the device's lifetime (for a driver that owns a background receive
/// thread of its own); `tx` hands a single outbound frame to the device.
pub trait Driver: Send {
    fn open(&mut self) -> Result<(), Error>;
    fn close(&mut self) -> Result<(), Error>;
    fn run(&mut self) -> Result<(), Error>;
    fn stop(&mut self) -> Result<(), Error>;
    fn tx(&mut self, frame: &[u8]) -> Result<(), Error>;
}

/// A tun device driver. tun devices are layer-3: what arrives and departs
/// on the fd is a raw IPv4 datagram, already stripped of any link-layer
/// header, so `tx` writes `frame` (an IP datagram) straight through.
pub struct TunDriver {
    tun: Tun,
    running: bool,
}

impl TunDriver {
    pub fn new(name: &str, addr: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self, Error> {
        let tun = Tun::new(name, false)?;
        tun.set_addr(addr)?;
        tun.set_netmask(netmask)?;
        Ok(TunDriver {
            tun,
            running: false,
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.tun.as_raw_fd()
    }

    /// Blocks up to `timeout_ms` for the device to become readable, then
    /// reads at most one datagram into `buf`. Returns `None` on timeout.
    pub fn poll_read(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<Option<usize>, Error> {
        let mut pfd = [PollFd::new(self.raw_fd(), PollFlags::POLLIN)];
        if poll(&mut pfd[..], timeout_ms).map_err(|_| Error::Malformed("poll failed"))? == 0 {
            return Ok(None);
        }
        let n = self.tun.read(buf)?;
        Ok(Some(n))
    }
}

impl Driver for TunDriver {
    fn open(&mut self) -> Result<(), Error> {
        self.tun.bring_up()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.running = false;
        Ok(())
    }

    fn run(&mut self) -> Result<(), Error> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Error> {
        self.running = false;
        Ok(())
    }

    fn tx(&mut self, frame: &[u8]) -> Result<(), Error> {
        self.tun.write_all(frame)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_type_tags_are_distinct() {
        assert_eq!(DEVICE_TYPE_TUN, 1);
    }
}
