//! TCP segment encode/decode: a fixed 20-byte header (no options), checksum
//! folded over the RFC-793 pseudo-header `{src, dst, 0, proto, tcp_len}`.

use std::net::Ipv4Addr;

use crate::config;
use crate::util::checksum;

use super::types::{Dual, Quad};

#[derive(Debug, Clone)]
pub struct DecodedSegment {
    pub quad: Quad,
    pub seq: u32,
    pub ack: u32,
    pub wnd: u16,
    pub syn: bool,
    pub ack_flag: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub urg: bool,
    pub urg_ptr: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OutSegment {
    pub seq: u32,
    pub ack: u32,
    pub wnd: u16,
    pub syn: bool,
    pub ack_flag: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub payload: Vec<u8>,
}

impl OutSegment {
    #[allow(clippy::too_many_arguments)]
    pub fn flags(
        seq: u32,
        ack: u32,
        wnd: u16,
        syn: bool,
        ack_flag: bool,
        fin: bool,
        rst: bool,
        psh: bool,
        payload: Vec<u8>,
    ) -> Self {
        OutSegment {
            seq,
            ack,
            wnd,
            syn,
            ack_flag,
            fin,
            rst,
            psh,
            payload,
        }
    }
}

/// Decodes and checksum-validates a TCP segment carried in a datagram whose
/// IPv4 source/destination are `ip_src`/`ip_dst`. Returns `None` on any
/// malformation (too short, bad data offset, bad checksum) -- dropped
/// silently, matching RFC behavior for wire-layer rejects.
pub fn decode(ip_src: Ipv4Addr, ip_dst: Ipv4Addr, buf: &[u8]) -> Option<DecodedSegment> {
    if buf.len() < config::TCP_HEADER_LEN {
        return None;
    }
    let data_offset = ((buf[12] >> 4) as usize) * 4;
    if data_offset < config::TCP_HEADER_LEN || data_offset > buf.len() {
        return None;
    }
    let pseudo = checksum::pseudo_header_sum(ip_src, ip_dst, config::IP_PROTOCOL_TCP, buf.len() as u16);
    if checksum::checksum(buf, pseudo) != 0 {
        return None;
    }

    let src_port = u16::from_be_bytes([buf[0], buf[1]]);
    let dst_port = u16::from_be_bytes([buf[2], buf[3]]);
    let seq = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let ack = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let flags = buf[13];
    let wnd = u16::from_be_bytes([buf[14], buf[15]]);
    let urg_ptr = u16::from_be_bytes([buf[18], buf[19]]);

    Some(DecodedSegment {
        quad: Quad {
            src: Dual { ipv4: ip_src, port: src_port },
            dst: Dual { ipv4: ip_dst, port: dst_port },
        },
        seq,
        ack,
        wnd,
        syn: flags & 0x02 != 0,
        ack_flag: flags & 0x10 != 0,
        fin: flags & 0x01 != 0,
        rst: flags & 0x04 != 0,
        psh: flags & 0x08 != 0,
        urg: flags & 0x20 != 0,
        urg_ptr,
        payload: buf[data_offset..].to_vec(),
    })
}

/// Serializes a 20-byte TCP header (`off = 5 << 4`, no options) plus
/// payload, from `local` to `peer`, with the pseudo-header checksum folded
/// in over the whole segment.
pub fn encode(local: Dual, peer: Dual, seg: &OutSegment) -> Vec<u8> {
    let total_len = config::TCP_HEADER_LEN + seg.payload.len();
    let mut buf = vec![0u8; total_len];
    buf[0..2].copy_from_slice(&local.port.to_be_bytes());
    buf[2..4].copy_from_slice(&peer.port.to_be_bytes());
    buf[4..8].copy_from_slice(&seg.seq.to_be_bytes());
    buf[8..12].copy_from_slice(&seg.ack.to_be_bytes());
    buf[12] = 5 << 4;

    let mut flags = 0u8;
    if seg.fin {
        flags |= 0x01;
    }
    if seg.syn {
        flags |= 0x02;
    }
    if seg.rst {
        flags |= 0x04;
    }
    if seg.psh {
        flags |= 0x08;
    }
    if seg.ack_flag {
        flags |= 0x10;
    }
    buf[13] = flags;
    buf[14..16].copy_from_slice(&seg.wnd.to_be_bytes());
    buf[config::TCP_HEADER_LEN..].copy_from_slice(&seg.payload);

    let pseudo = checksum::pseudo_header_sum(local.ipv4, peer.ipv4, config::IP_PROTOCOL_TCP, total_len as u16);
    let sum = checksum::checksum(&buf, pseudo);
    buf[16..18].copy_from_slice(&sum.to_be_bytes());
    buf
}

/// Builds the RST the CLOSED-state branch of the segment-arrives processor
/// sends in reply to any non-RST segment against a connection that does
/// not exist: `<SEQ=SEG.ACK><CTL=RST>` if ACK was set, else
/// `<SEQ=0><ACK=SEG.SEQ+LEN><CTL=RST,ACK>`.
pub fn reset_for_closed(seg: &DecodedSegment) -> OutSegment {
    if seg.ack_flag {
        OutSegment::flags(seg.ack, 0, 0, false, false, false, true, false, vec![])
    } else {
        let ack = seg.seq.wrapping_add(seg.payload.len() as u32);
        OutSegment::flags(0, ack, 0, false, true, false, true, false, vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dual(ip: &str, port: u16) -> Dual {
        Dual { ipv4: ip.parse().unwrap(), port }
    }

    #[test]
    fn encode_then_decode_preserves_fields() {
        let local = dual("10.0.0.1", 9090);
        let peer = dual("10.0.0.2", 5555);
        let seg = OutSegment::flags(100, 200, 65535, true, true, false, false, false, b"hi".to_vec());
        let wire = encode(local, peer, &seg);
        let decoded = decode(local.ipv4, peer.ipv4, &wire).expect("checksum should validate");
        assert_eq!(decoded.seq, 100);
        assert_eq!(decoded.ack, 200);
        assert!(decoded.syn);
        assert!(decoded.ack_flag);
        assert!(!decoded.fin);
        assert_eq!(decoded.payload, b"hi");
        assert_eq!(decoded.quad.src.port, 9090);
        assert_eq!(decoded.quad.dst.port, 5555);
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let local = dual("10.0.0.1", 9090);
        let peer = dual("10.0.0.2", 5555);
        let seg = OutSegment::flags(1, 1, 1000, false, true, false, false, false, b"payload".to_vec());
        let mut wire = encode(local, peer, &seg);
        *wire.last_mut().unwrap() ^= 0xff;
        assert!(decode(local.ipv4, peer.ipv4, &wire).is_none());
    }

    #[test]
    fn reset_for_closed_with_ack_echoes_ack_as_sequence() {
        let seg = DecodedSegment {
            quad: Quad { src: dual("1.2.3.4", 1), dst: dual("1.2.3.5", 2) },
            seq: 10,
            ack: 500,
            wnd: 0,
            syn: false,
            ack_flag: true,
            fin: false,
            rst: false,
            psh: false,
            urg: false,
            urg_ptr: 0,
            payload: vec![],
        };
        let rst = reset_for_closed(&seg);
        assert!(rst.rst);
        assert!(!rst.ack_flag);
        assert_eq!(rst.seq, 500);
    }

    #[test]
    fn reset_for_closed_without_ack_sets_ack_to_seq_plus_len() {
        let seg = DecodedSegment {
            quad: Quad { src: dual("1.2.3.4", 1), dst: dual("1.2.3.5", 2) },
            seq: 10,
            ack: 0,
            wnd: 0,
            syn: true,
            ack_flag: false,
            fin: false,
            rst: false,
            psh: false,
            urg: false,
            urg_ptr: 0,
            payload: vec![1, 2, 3],
        };
        let rst = reset_for_closed(&seg);
        assert!(rst.rst);
        assert!(rst.ack_flag);
        assert_eq!(rst.seq, 0);
        assert_eq!(rst.ack, 13);
    }
}
