//! IPv4 transmit: ID allocation, MTU-bounded fragmentation, and datagram
//! framing. ARP resolution is not modeled here -- the tun device this
//! stack drives is layer-3, so every fragment is handed straight to the
//! device as if address resolution had already succeeded.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::config;
use crate::device::{Driver, TunDriver};
use crate::err::Error;
use crate::ip::NetifIp;
use crate::util::checksum;

/// Serializes 16-bit datagram IDs, monotonically increasing, one per
/// `transmit` call regardless of how many fragments it produces.
pub struct IdGenerator(Mutex<u16>);

impl IdGenerator {
    pub fn new() -> Self {
        IdGenerator(Mutex::new(0))
    }

    fn next(&self) -> u16 {
        let mut id = self.0.lock().unwrap();
        *id = id.wrapping_add(1);
        *id
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits `payload` into 8-byte-aligned fragments of at most
/// `MTU - IPV4_HEADER_LEN` bytes, setting MF on all but the last, and
/// writes each one to `device`. An empty payload still produces one
/// (header-only) datagram.
pub fn transmit(
    device: &mut TunDriver,
    ids: &IdGenerator,
    netif: &NetifIp,
    protocol: u8,
    payload: &[u8],
    dst: Ipv4Addr,
) -> Result<(), Error> {
    let id = ids.next();
    let max_payload = ((config::MTU - config::IPV4_HEADER_LEN) / 8) * 8;

    let mut offset = 0usize;
    loop {
        let remaining = payload.len() - offset;
        let chunk_len = remaining.min(max_payload);
        let more_fragments = offset + chunk_len < payload.len();
        let datagram = build_datagram(
            netif.unicast,
            dst,
            protocol,
            id,
            offset,
            more_fragments,
            &payload[offset..offset + chunk_len],
        );
        device.tx(&datagram)?;
        offset += chunk_len;
        if offset >= payload.len() {
            break;
        }
    }
    Ok(())
}

fn build_datagram(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    id: u16,
    offset: usize,
    more_fragments: bool,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = config::IPV4_HEADER_LEN + payload.len();
    let mut buf = vec![0u8; total_len];
    buf[0] = 0x45; // version 4, ihl 5 (no options)
    buf[1] = 0; // tos
    buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buf[4..6].copy_from_slice(&id.to_be_bytes());
    let frag_word = ((offset / 8) as u16 & config::IPV4_FRAG_OFFSET_MASK)
        | if more_fragments { config::IPV4_FLAG_MF } else { 0 };
    buf[6..8].copy_from_slice(&frag_word.to_be_bytes());
    buf[8] = 64; // ttl
    buf[9] = protocol;
    buf[10..12].copy_from_slice(&[0, 0]); // checksum, filled below
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());
    let hsum = checksum::checksum(&buf[..config::IPV4_HEADER_LEN], 0);
    buf[10..12].copy_from_slice(&hsum.to_be_bytes());
    buf[config::IPV4_HEADER_LEN..].copy_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_are_8_byte_aligned_except_the_last() {
        let payload = vec![0u8; 5000];
        let max_payload = ((config::MTU - config::IPV4_HEADER_LEN) / 8) * 8;
        assert_eq!(max_payload % 8, 0);
        let mut offset = 0;
        let mut fragment_lens = vec![];
        loop {
            let remaining = payload.len() - offset;
            let chunk = remaining.min(max_payload);
            fragment_lens.push(chunk);
            offset += chunk;
            if offset >= payload.len() {
                break;
            }
        }
        for &len in &fragment_lens[..fragment_lens.len() - 1] {
            assert_eq!(len % 8, 0);
        }
    }

    #[test]
    fn header_checksum_of_built_datagram_is_zero() {
        let buf = build_datagram(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            6,
            7,
            0,
            false,
            &[1, 2, 3, 4],
        );
        assert_eq!(checksum::checksum(&buf[..config::IPV4_HEADER_LEN], 0), 0);
    }
}
