pub mod reassembly;
pub mod tx;

use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Instant;

use crate::config;
use crate::util::checksum;
use reassembly::{FragmentKey, ReassemblyTable};

/// A bound IPv4 interface: the stack's local identity on the network it
/// attaches to, plus the derived network/broadcast addresses used by the
/// receive-side destination check.
#[derive(Debug, Clone, Copy)]
pub struct NetifIp {
    pub unicast: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub network: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl NetifIp {
    pub fn new(unicast: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        let u = u32::from(unicast);
        let m = u32::from(netmask);
        NetifIp {
            unicast,
            netmask,
            network: Ipv4Addr::from(u & m),
            broadcast: Ipv4Addr::from((u & m) | !m),
            gateway: Ipv4Addr::UNSPECIFIED,
        }
    }

    fn accepts_destination(&self, dst: Ipv4Addr) -> bool {
        dst == self.unicast || dst == self.broadcast || dst == Ipv4Addr::BROADCAST
    }
}

/// A mapping from IP protocol number to the single registered consumer of
/// datagrams carrying it. Dispatch is first-match, mirroring a linked
/// registration list walked front to back.
#[derive(Default)]
pub struct ProtocolRegistry {
    registered: Vec<u8>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_protocol(&mut self, protocol: u8) {
        if !self.registered.contains(&protocol) {
            self.registered.push(protocol);
        }
    }

    pub fn is_registered(&self, protocol: u8) -> bool {
        self.registered.iter().any(|p| *p == protocol)
    }
}

struct ParsedHeader {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    id: u16,
    hdr_len: usize,
    total_len: usize,
    more_fragments: bool,
    frag_offset: usize,
}

/// Validates an IPv4 header in the order the design prescribes: minimum
/// length, version, header/total length, header checksum, TTL, then
/// destination match. Any failure drops the datagram silently.
fn parse_header(buf: &[u8], netif: &NetifIp) -> Option<ParsedHeader> {
    if buf.len() < config::IPV4_HEADER_LEN {
        return None;
    }
    if buf[0] >> 4 != 4 {
        return None;
    }
    let hdr_len = ((buf[0] & 0x0f) as usize) * 4;
    if hdr_len < config::IPV4_HEADER_LEN || hdr_len > buf.len() {
        return None;
    }
    let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if total_len < hdr_len || total_len > buf.len() {
        return None;
    }
    if checksum::checksum(&buf[..hdr_len], 0) != 0 {
        return None;
    }
    if buf[8] == 0 {
        return None; // ttl expired
    }
    let dst = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);
    if !netif.accepts_destination(dst) {
        return None;
    }

    let frag_word = u16::from_be_bytes([buf[6], buf[7]]);
    Some(ParsedHeader {
        src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
        dst,
        protocol: buf[9],
        id: u16::from_be_bytes([buf[4], buf[5]]),
        hdr_len,
        total_len,
        more_fragments: frag_word & config::IPV4_FLAG_MF != 0,
        frag_offset: ((frag_word & config::IPV4_FRAG_OFFSET_MASK) as usize) * 8,
    })
}

/// A complete (possibly reassembled) IPv4 payload ready for protocol
/// dispatch.
pub struct Received {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub payload: Vec<u8>,
}

/// Runs receive-side validation and, for fragmented traffic, folds the
/// fragment into the reassembly table. Returns `None` both for rejected
/// (malformed or misdirected) datagrams and for fragments that do not yet
/// complete a datagram.
pub fn receive(netif: &NetifIp, buf: &[u8], reassembly: &Mutex<ReassemblyTable>) -> Option<Received> {
    let header = parse_header(buf, netif)?;
    let fragment_payload = &buf[header.hdr_len..header.total_len];

    if header.more_fragments || header.frag_offset != 0 {
        let key = FragmentKey {
            src: header.src,
            dst: header.dst,
            id: header.id,
            protocol: header.protocol,
        };
        let payload = reassembly.lock().unwrap().insert(
            key,
            header.frag_offset,
            fragment_payload,
            header.more_fragments,
            Instant::now(),
        )?;
        Some(Received {
            src: header.src,
            dst: header.dst,
            protocol: header.protocol,
            payload,
        })
    } else {
        Some(Received {
            src: header.src,
            dst: header.dst,
            protocol: header.protocol,
            payload: fragment_payload.to_vec(),
        })
    }
}
