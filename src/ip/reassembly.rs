//! IPv4 fragment reassembly, serialized by the table's own mutex
//! (kept distinct from the TCP mutex per the stack's concurrency model).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;

use log::warn;

use crate::config;
use crate::util::Bitmap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub id: u16,
    pub protocol: u8,
}

struct FragmentEntry {
    data: Box<[u8; 65535]>,
    bitmap: Bitmap,
    total_len: Option<usize>,
    last_seen: Instant,
}

impl FragmentEntry {
    fn new(now: Instant) -> Self {
        FragmentEntry {
            data: Box::new([0u8; 65535]),
            bitmap: Bitmap::new(),
            total_len: None,
            last_seen: now,
        }
    }

    fn is_complete(&self) -> bool {
        match self.total_len {
            Some(len) => self.bitmap.check(0, len),
            None => false,
        }
    }
}

#[derive(Default)]
pub struct ReassemblyTable {
    entries: HashMap<FragmentKey, FragmentEntry>,
}

impl ReassemblyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one fragment in. Returns the reconstructed payload once the
    /// datagram is fully covered; the entry is removed at that point, and
    /// only at that point -- a lookup that merely fails to find room for a
    /// new key never touches the live count.
    pub fn insert(
        &mut self,
        key: FragmentKey,
        offset: usize,
        payload: &[u8],
        more_fragments: bool,
        now: Instant,
    ) -> Option<Vec<u8>> {
        if !self.entries.contains_key(&key) {
            if self.entries.len() >= config::MAX_REASSEMBLIES {
                warn!("reassembly table full ({} entries), dropping fragment for id {}", config::MAX_REASSEMBLIES, key.id);
                return None;
            }
            self.entries.insert(key, FragmentEntry::new(now));
        }
        let entry = self.entries.get_mut(&key).expect("just inserted or present");
        let end = (offset + payload.len()).min(entry.data.len());
        let copy_len = end.saturating_sub(offset);
        entry.data[offset..end].copy_from_slice(&payload[..copy_len]);
        entry.bitmap.set(offset, copy_len);
        entry.last_seen = now;
        if !more_fragments {
            entry.total_len = Some(offset + copy_len);
        }
        if entry.is_complete() {
            let len = entry.total_len.expect("is_complete implies total_len is set");
            let data = entry.data[..len].to_vec();
            self.entries.remove(&key);
            Some(data)
        } else {
            None
        }
    }

    /// Evicts entries idle for longer than the reassembly timeout.
    pub fn sweep(&mut self, now: Instant) {
        self.entries
            .retain(|_, e| now.duration_since(e.last_seen) < config::REASSEMBLY_IDLE_TIMEOUT);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FragmentKey {
        FragmentKey {
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
            id: 42,
            protocol: 6,
        }
    }

    /// A 5000-byte datagram split per MTU=1500 (1480/1480/1480/560, MF on
    /// the first three) reassembles byte-for-byte regardless of arrival
    /// order.
    #[test]
    fn reassembles_out_of_order_fragments() {
        let payload: Vec<u8> = (0..5000).map(|i| (i % 256) as u8).collect();
        let chunks = [
            (0usize, 1480usize, true),
            (1480, 1480, true),
            (2960, 1480, true),
            (4440, 560, false),
        ];

        let mut table = ReassemblyTable::new();
        let now = Instant::now();
        let order = [3, 1, 0, 2];
        let mut result = None;
        for &idx in &order {
            let (offset, len, more) = chunks[idx];
            result = table.insert(key(), offset, &payload[offset..offset + len], more, now);
        }
        assert_eq!(result, Some(payload));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn idle_fragment_is_evicted_then_reallocated() {
        let mut table = ReassemblyTable::new();
        let t0 = Instant::now();
        let first_byte = [0xaa; 100];
        assert_eq!(table.insert(key(), 0, &first_byte, true, t0), None);
        assert_eq!(table.len(), 1);

        let past_timeout = t0 + config::REASSEMBLY_IDLE_TIMEOUT + std::time::Duration::from_secs(1);
        table.sweep(past_timeout);
        assert_eq!(table.len(), 0);

        // the missing piece arriving later allocates a fresh entry, not a
        // continuation of the evicted one.
        assert_eq!(table.insert(key(), 0, &first_byte, true, past_timeout), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn table_full_drops_new_keys() {
        let mut table = ReassemblyTable::new();
        let now = Instant::now();
        for id in 0..config::MAX_REASSEMBLIES as u16 {
            let mut k = key();
            k.id = id;
            table.insert(k, 0, &[0u8; 10], true, now);
        }
        assert_eq!(table.len(), config::MAX_REASSEMBLIES);

        let mut overflow_key = key();
        overflow_key.id = config::MAX_REASSEMBLIES as u16;
        assert_eq!(table.insert(overflow_key, 0, &[0u8; 10], true, now), None);
        assert_eq!(table.len(), config::MAX_REASSEMBLIES);
    }
}
