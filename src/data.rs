//! The data layer: fixed-layout linked record nodes written verbatim to
//! remote memory.
//!
//! # Layout
//!
//! Every record is self-describing and packed little-endian:
//!
//! ```text
//! offset  0  llink         RemotePointer (8)
//! offset  8  rlink         RemotePointer (8)
//! offset 16  crc           u16
//! offset 18  type          u32
//! offset 22  next          u32, next free slot index
//! offset 26  fingerprints  u8 x 16 (16 reserved regardless of capacity)
//! offset 42  pairs         {key[16], value[16]} x N
//! ```
//!
//! `N` is one of {10, 12, 14, 16} and is derived from `type`, so a reader
//! that fetched the largest layout can recover the true shape from the
//! header alone. The fingerprint array is always 16 bytes so a record can
//! morph to a larger capacity without moving data.

use crate::{KeyBuf, ValueBuf, KEY_SIZE, VALUE_SIZE};

pub const LLINK_OFFSET: usize = 0;
pub const RLINK_OFFSET: usize = 8;
pub const CRC_OFFSET: usize = 16;
pub const TYPE_OFFSET: usize = 18;
pub const NEXT_OFFSET: usize = 22;
pub const FINGERPRINT_OFFSET: usize = 26;
pub const PAIRS_OFFSET: usize = 42;

const PAIR_SIZE: usize = KEY_SIZE + VALUE_SIZE;

/// On-wire size of the largest record shape.
pub const MAX_RECORD_SIZE: usize = PAIRS_OFFSET + 16 * PAIR_SIZE;

/// Capacity of the compute-local scratch node used during splits: a full
/// type-16 record, the winner's own pair, and four handed-over requests.
pub const BUFFER_CAPACITY: usize = 21;

use crate::memory::RemotePointer;

/// Declared capacity class of a record node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum NodeType {
    Head = 1,
    Type10 = 10,
    Type12 = 12,
    Type14 = 14,
    Type16 = 16,
    /// Reserved for variable-length records; never constructed.
    Var = 99,
    NotSet = 0,
}

impl NodeType {
    pub fn from_wire(raw: u32) -> NodeType {
        match raw {
            1 => NodeType::Head,
            10 => NodeType::Type10,
            12 => NodeType::Type12,
            14 => NodeType::Type14,
            16 => NodeType::Type16,
            99 => NodeType::Var,
            _ => NodeType::NotSet,
        }
    }

    /// Number of key-value slots for this shape, 0 for non-data shapes.
    pub fn capacity(self) -> usize {
        match self {
            NodeType::Type10 => 10,
            NodeType::Type12 => 12,
            NodeType::Type14 => 14,
            NodeType::Type16 => 16,
            _ => 0,
        }
    }

    /// The smallest shape that holds `count` pairs.
    pub fn for_count(count: usize) -> NodeType {
        match count {
            0..=10 => NodeType::Type10,
            11..=12 => NodeType::Type12,
            13..=14 => NodeType::Type14,
            15..=16 => NodeType::Type16,
            _ => NodeType::NotSet,
        }
    }

    /// On-wire byte length of this shape.
    pub fn wire_size(self) -> usize {
        PAIRS_OFFSET + self.capacity() * PAIR_SIZE
    }
}

/// CRC16-CCITT: init 0xFFFF, polynomial 0x1021, no reflection.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// One-byte pre-filter hash of a key.
pub fn fingerprint(key: &[u8]) -> u8 {
    xxhash_rust::xxh3::xxh3_64(key) as u8
}

/// A record node, operated on in a local copy of its wire image.
///
/// The buffer is always the largest layout; the `type` field decides how
/// much of it is meaningful. Accessors read and write fields at their wire
/// offsets, so `as_bytes` can be handed to the transport verbatim.
#[derive(Clone)]
pub struct Record {
    buf: [u8; MAX_RECORD_SIZE],
}

impl Record {
    /// A fresh, empty record of the given shape.
    pub fn new(t: NodeType) -> Record {
        let mut r = Record {
            buf: [0u8; MAX_RECORD_SIZE],
        };
        r.set_node_type(t);
        r
    }

    /// Adopt a wire image fetched from remote memory. Bytes past `image`
    /// are zeroed so a later morph to a larger shape sees empty slots.
    pub fn from_wire(image: &[u8]) -> Record {
        let mut r = Record {
            buf: [0u8; MAX_RECORD_SIZE],
        };
        let n = image.len().min(MAX_RECORD_SIZE);
        r.buf[..n].copy_from_slice(&image[..n]);
        r
    }

    /// The wire image for this record's declared shape.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.node_type().wire_size()]
    }

    fn read_u64(&self, off: usize) -> u64 {
        u64::from_le_bytes(self.buf[off..off + 8].try_into().unwrap())
    }

    fn write_u64(&mut self, off: usize, v: u64) {
        self.buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn llink(&self) -> RemotePointer {
        RemotePointer::from_raw(self.read_u64(LLINK_OFFSET))
    }

    pub fn set_llink(&mut self, p: RemotePointer) {
        self.write_u64(LLINK_OFFSET, p.raw());
    }

    pub fn rlink(&self) -> RemotePointer {
        RemotePointer::from_raw(self.read_u64(RLINK_OFFSET))
    }

    pub fn set_rlink(&mut self, p: RemotePointer) {
        self.write_u64(RLINK_OFFSET, p.raw());
    }

    pub fn node_type(&self) -> NodeType {
        NodeType::from_wire(u32::from_le_bytes(
            self.buf[TYPE_OFFSET..TYPE_OFFSET + 4].try_into().unwrap(),
        ))
    }

    pub fn set_node_type(&mut self, t: NodeType) {
        self.buf[TYPE_OFFSET..TYPE_OFFSET + 4].copy_from_slice(&(t as u32).to_le_bytes());
    }

    pub fn next(&self) -> usize {
        u32::from_le_bytes(self.buf[NEXT_OFFSET..NEXT_OFFSET + 4].try_into().unwrap()) as usize
    }

    pub fn set_next(&mut self, next: usize) {
        self.buf[NEXT_OFFSET..NEXT_OFFSET + 4].copy_from_slice(&(next as u32).to_le_bytes());
    }

    pub fn fingerprint_at(&self, slot: usize) -> u8 {
        self.buf[FINGERPRINT_OFFSET + slot]
    }

    pub fn key_at(&self, slot: usize) -> &[u8] {
        let off = PAIRS_OFFSET + slot * PAIR_SIZE;
        &self.buf[off..off + KEY_SIZE]
    }

    pub fn value_at(&self, slot: usize) -> &[u8] {
        let off = PAIRS_OFFSET + slot * PAIR_SIZE + KEY_SIZE;
        &self.buf[off..off + VALUE_SIZE]
    }

    fn set_pair(&mut self, slot: usize, fp: u8, key: &KeyBuf, value: &ValueBuf) {
        self.buf[FINGERPRINT_OFFSET + slot] = fp;
        let off = PAIRS_OFFSET + slot * PAIR_SIZE;
        self.buf[off..off + KEY_SIZE].copy_from_slice(key);
        self.buf[off + KEY_SIZE..off + PAIR_SIZE].copy_from_slice(value);
    }

    /// Whether the record can take one more pair at its declared shape.
    pub fn available(&self) -> bool {
        self.next() < self.node_type().capacity()
    }

    /// Insert-if-absent at the declared capacity. Returns false when full;
    /// a duplicate key returns true without mutating anything.
    pub fn store(&mut self, key: &KeyBuf, value: &ValueBuf) -> bool {
        self.store_with_capacity(self.node_type().capacity(), key, value)
    }

    /// Insert-if-absent against an explicit slot limit. Used while a
    /// winner batches pending pairs into a node that will morph afterwards.
    pub fn store_with_capacity(&mut self, cap: usize, key: &KeyBuf, value: &ValueBuf) -> bool {
        if self.find(key).is_some() {
            return true;
        }
        let next = self.next();
        if next >= cap {
            return false;
        }
        self.set_pair(next, fingerprint(key), key, value);
        self.set_next(next + 1);
        true
    }

    /// Linear fingerprint filter, then key compare.
    pub fn find(&self, key: &KeyBuf) -> Option<ValueBuf> {
        let fp = fingerprint(key);
        for i in 0..self.next() {
            if self.fingerprint_at(i) != fp {
                continue;
            }
            if self.key_at(i) == key {
                return Some(self.value_at(i).try_into().unwrap());
            }
        }
        None
    }

    /// In-place value overwrite. False when the key is absent.
    pub fn update(&mut self, key: &KeyBuf, value: &ValueBuf) -> bool {
        let fp = fingerprint(key);
        for i in 0..self.next() {
            if self.fingerprint_at(i) != fp {
                continue;
            }
            if self.key_at(i) == key {
                let off = PAIRS_OFFSET + i * PAIR_SIZE + KEY_SIZE;
                self.buf[off..off + VALUE_SIZE].copy_from_slice(value);
                return true;
            }
        }
        false
    }

    /// Append every value whose key is >= `key` (unordered within the
    /// node) until `count` values have been gathered. Returns how many
    /// were appended.
    pub fn scan(&self, key: &KeyBuf, count: usize, out: &mut Vec<ValueBuf>) -> usize {
        let mut taken = 0;
        // scans run without CRC validation, so clamp a torn slot count
        let live = self.next().min(self.node_type().capacity());
        for i in 0..live {
            if out.len() >= count {
                break;
            }
            if self.key_at(i) >= &key[..] {
                out.push(self.value_at(i).try_into().unwrap());
                taken += 1;
            }
        }
        taken
    }

    /// Fill ratio at the declared shape, for stats.
    pub fn usage(&self) -> f64 {
        let cap = self.node_type().capacity();
        if cap == 0 {
            return 0.0;
        }
        self.next() as f64 / cap as f64
    }

    fn crc_region(&self) -> &[u8] {
        &self.buf[PAIRS_OFFSET..self.node_type().wire_size()]
    }

    pub fn stored_crc(&self) -> u16 {
        u16::from_le_bytes(self.buf[CRC_OFFSET..CRC_OFFSET + 2].try_into().unwrap())
    }

    /// Stamp the checksum. Called immediately before every write-back.
    pub fn seal(&mut self) {
        let crc = crc16_ccitt(self.crc_region());
        self.buf[CRC_OFFSET..CRC_OFFSET + 2].copy_from_slice(&crc.to_le_bytes());
    }

    /// Verify the checksum of a freshly fetched image.
    pub fn verify(&self) -> bool {
        self.node_type().capacity() != 0 && self.stored_crc() == crc16_ccitt(self.crc_region())
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("type", &self.node_type())
            .field("next", &self.next())
            .field("llink", &self.llink())
            .field("rlink", &self.rlink())
            .finish()
    }
}

/// Compute-local scratch node holding every pending pair during a split.
/// Never flushed to remote memory.
pub struct BufferNode {
    next: usize,
    fingerprints: [u8; BUFFER_CAPACITY],
    pairs: [(KeyBuf, ValueBuf); BUFFER_CAPACITY],
}

impl BufferNode {
    pub fn new() -> BufferNode {
        BufferNode {
            next: 0,
            fingerprints: [0u8; BUFFER_CAPACITY],
            pairs: [([0u8; KEY_SIZE], [0u8; VALUE_SIZE]); BUFFER_CAPACITY],
        }
    }

    /// Seed the scratch from a fetched record.
    pub fn from_record(r: &Record) -> BufferNode {
        let mut b = BufferNode::new();
        for i in 0..r.next() {
            b.fingerprints[i] = r.fingerprint_at(i);
            b.pairs[i].0.copy_from_slice(r.key_at(i));
            b.pairs[i].1.copy_from_slice(r.value_at(i));
        }
        b.next = r.next();
        b
    }

    pub fn len(&self) -> usize {
        self.next
    }

    pub fn is_empty(&self) -> bool {
        self.next == 0
    }

    pub fn key_at(&self, slot: usize) -> &KeyBuf {
        &self.pairs[slot].0
    }

    pub fn store(&mut self, key: &KeyBuf, value: &ValueBuf) -> bool {
        let fp = fingerprint(key);
        for i in 0..self.next {
            if self.fingerprints[i] == fp && &self.pairs[i].0 == key {
                return true;
            }
        }
        if self.next >= BUFFER_CAPACITY {
            return false;
        }
        self.fingerprints[self.next] = fp;
        self.pairs[self.next] = (*key, *value);
        self.next += 1;
        true
    }

    /// Pick the `left_count + 1` smallest pairs by repeated linear
    /// selection. Marks them in `picked` and records the selection order in
    /// `reorder`; `reorder[left_count]` is the right node's anchor slot.
    pub fn construct_reorder_map(&self, left_count: usize, reorder: &mut [usize], picked: &mut [bool]) {
        debug_assert!(left_count + 1 <= self.next);
        for r in reorder.iter_mut().take(left_count + 1) {
            let mut target = usize::MAX;
            for j in 0..self.next {
                if picked[j] {
                    continue;
                }
                if target == usize::MAX || self.pairs[j].0 < self.pairs[target].0 {
                    target = j;
                }
            }
            picked[target] = true;
            *r = target;
        }
    }

    /// Distribute the scratch into two fresh records. `picked` marks the
    /// slots that go left; everything else goes right. Slots keep their
    /// relative (drain) order, which fixes the tie-break for equal keys.
    pub fn distribute(&self, picked: &[bool], left: &mut Record, right: &mut Record) {
        for i in 0..self.next {
            let dst = if picked[i] { &mut *left } else { &mut *right };
            let slot = dst.next();
            dst.set_pair(slot, self.fingerprints[i], &self.pairs[i].0, &self.pairs[i].1);
            dst.set_next(slot + 1);
        }
    }
}

impl Default for BufferNode {
    fn default() -> Self {
        BufferNode::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(n: u64) -> KeyBuf {
        crate::workload::decimal_key(n)
    }

    #[test]
    fn wire_sizes() {
        assert_eq!(NodeType::Type10.wire_size(), 362);
        assert_eq!(NodeType::Type12.wire_size(), 426);
        assert_eq!(NodeType::Type14.wire_size(), 490);
        assert_eq!(NodeType::Type16.wire_size(), 554);
        assert_eq!(MAX_RECORD_SIZE, NodeType::Type16.wire_size());
    }

    #[test]
    fn crc_reference_vector() {
        // CRC-16/CCITT-FALSE check value
        assert_eq!(crc16_ccitt(b"123456789"), 0x29b1);
        assert_eq!(crc16_ccitt(b""), 0xffff);
    }

    #[test]
    fn store_find_update() {
        let mut r = Record::new(NodeType::Type10);
        for i in 0..10u64 {
            assert!(r.store(&k(i), &k(i * 100)));
        }
        assert!(!r.available());
        assert!(!r.store(&k(99), &k(99)));
        // duplicate returns true without consuming a slot
        assert!(r.store(&k(3), &k(42)));
        assert_eq!(r.next(), 10);
        assert_eq!(r.find(&k(3)), Some(k(300)));
        assert!(r.update(&k(3), &k(999)));
        assert_eq!(r.find(&k(3)), Some(k(999)));
        assert!(!r.update(&k(77), &k(0)));
        assert_eq!(r.find(&k(77)), None);
    }

    #[test]
    fn seal_and_verify() {
        let mut r = Record::new(NodeType::Type12);
        for i in 0..5u64 {
            r.store(&k(i), &k(i));
        }
        r.seal();
        assert!(r.verify());

        let mut tampered = Record::from_wire(r.as_bytes());
        assert!(tampered.verify());
        tampered.buf[PAIRS_OFFSET + 17] ^= 0x40;
        assert!(!tampered.verify());
    }

    #[test]
    fn morph_keeps_crc_region_consistent() {
        let mut r = Record::new(NodeType::Type10);
        for i in 0..10u64 {
            r.store(&k(i), &k(i));
        }
        // growing the shape exposes zeroed slots only
        r.set_node_type(NodeType::Type16);
        assert!(r.available());
        for i in 10..16u64 {
            assert!(r.store(&k(i), &k(i)));
        }
        r.seal();
        assert!(r.verify());
    }

    #[test]
    fn from_wire_zeroes_tail() {
        let mut r = Record::new(NodeType::Type10);
        r.store(&k(1), &k(1));
        r.seal();
        let fetched = Record::from_wire(r.as_bytes());
        assert!(fetched.verify());
        assert_eq!(&fetched.buf[NodeType::Type10.wire_size()..], &[0u8; 192][..]);
    }

    #[test]
    fn scan_gathers_at_least() {
        let mut r = Record::new(NodeType::Type16);
        for i in 0..16u64 {
            r.store(&k(i), &k(i));
        }
        let mut out = Vec::new();
        r.scan(&k(10), 100, &mut out);
        assert_eq!(out.len(), 6);
        let mut out = Vec::new();
        r.scan(&k(0), 4, &mut out);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn reorder_map_selects_smallest() {
        let mut b = BufferNode::new();
        for i in [9u64, 1, 8, 2, 7, 3, 6, 4, 5, 0, 10, 11] {
            assert!(b.store(&k(i), &k(i)));
        }
        let mut reorder = [0usize; BUFFER_CAPACITY];
        let mut picked = [false; BUFFER_CAPACITY];
        b.construct_reorder_map(5, &mut reorder, &mut picked);
        // the sixth-smallest key anchors the right node
        assert_eq!(b.key_at(reorder[5]), &k(5));
        picked[reorder[5]] = false;

        let mut left = Record::new(NodeType::Type10);
        let mut right = Record::new(NodeType::Type10);
        b.distribute(&picked, &mut left, &mut right);
        assert_eq!(left.next(), 5);
        assert_eq!(right.next(), 7);
        for i in 0..5u64 {
            assert!(left.find(&k(i)).is_some());
            assert!(right.find(&k(i)).is_none());
        }
        for i in 5..12u64 {
            assert!(right.find(&k(i)).is_some());
        }
    }
}
