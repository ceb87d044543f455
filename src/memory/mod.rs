//! Remote memory primitives shared by compute and memory nodes.

pub mod allocator;
pub mod remote;

use std::fmt;

use crate::PAGE_SIZE;

const KIND_SHIFT: u32 = 62;
const KIND_REMOTE: u64 = 0b10;
const NODE_SHIFT: u32 = 56;
const NODE_MASK: u64 = 0x3f;
const ADDR_MASK: u64 = 0x0000_ffff_ffff_ffff;

/// A 64-bit tagged pointer into a memory node's pool.
///
/// # Layout
///
/// ```text
/// 63 62 61          56 55      48 47                             0
/// +-----+-------------+----------+-------------------------------+
/// | kind|   node id   | reserved |       48-bit address          |
/// +-----+-------------+----------+-------------------------------+
/// ```
///
/// Kind `0b10` marks a remote pointer. The address is canonical (fits in 48
/// bits). The all-zero value is the null pointer, and two remote pointers
/// are equal iff their encoded bits are equal.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, bytemuck::Zeroable, bytemuck::Pod)]
pub struct RemotePointer(u64);

impl RemotePointer {
    /// The null remote pointer.
    pub const NULL: RemotePointer = RemotePointer(0);

    /// Encode a (node, address) pair. The address must be canonical; the
    /// upper 16 bits are discarded.
    pub fn encode(node: u8, addr: u64) -> Self {
        let meta = (KIND_REMOTE << KIND_SHIFT) | (((node as u64) & NODE_MASK) << NODE_SHIFT);
        RemotePointer(meta | (addr & ADDR_MASK))
    }

    /// Reconstruct from raw bits, e.g. bits read off the wire.
    pub fn from_raw(raw: u64) -> Self {
        RemotePointer(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// True when the kind bits mark this value as a remote pointer.
    pub fn is_remote(self) -> bool {
        (self.0 >> KIND_SHIFT) == KIND_REMOTE
    }

    pub fn node_id(self) -> u8 {
        ((self.0 >> NODE_SHIFT) & NODE_MASK) as u8
    }

    pub fn address(self) -> u64 {
        self.0 & ADDR_MASK
    }

    /// The address rounded down to the containing page.
    pub fn page(self) -> RemotePointer {
        RemotePointer::encode(self.node_id(), self.address() & !(PAGE_SIZE as u64 - 1))
    }

    /// A pointer `off` bytes further into the same node's pool.
    pub fn offset(self, off: u64) -> RemotePointer {
        RemotePointer::encode(self.node_id(), self.address() + off)
    }
}

impl fmt::Debug for RemotePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("RemotePointer(null)");
        }
        write!(
            f,
            "RemotePointer(node {}, {:#x})",
            self.node_id(),
            self.address()
        )
    }
}

/// Slot bitmap used by the memory node to hand out segments.
pub struct Bitmap {
    map: Vec<u8>,
    slots: usize,
}

impl Bitmap {
    pub fn new(slots: usize) -> Self {
        Bitmap {
            map: vec![0u8; slots.div_ceil(8)],
            slots,
        }
    }

    /// Find the first empty slot without claiming it.
    pub fn find_empty(&self) -> Option<usize> {
        for (i, byte) in self.map.iter().enumerate() {
            if *byte == 0xff {
                continue;
            }
            for j in 0..8 {
                let pos = i * 8 + j;
                if pos >= self.slots {
                    return None;
                }
                if byte & (1 << j) == 0 {
                    return Some(pos);
                }
            }
        }
        None
    }

    /// Claim and return the first empty slot.
    pub fn get_empty(&mut self) -> Option<usize> {
        let pos = self.find_empty()?;
        self.map[pos / 8] |= 1 << (pos % 8);
        Some(pos)
    }

    pub fn unset(&mut self, pos: usize) {
        if pos < self.slots {
            self.map[pos / 8] &= !(1 << (pos % 8));
        }
    }

    pub fn is_set(&self, pos: usize) -> bool {
        pos < self.slots && self.map[pos / 8] & (1 << (pos % 8)) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_roundtrip() {
        for node in [0u8, 1, 17, 63] {
            for addr in [0u64, 0x1000, 0xdead_beef, ADDR_MASK] {
                let p = RemotePointer::encode(node, addr);
                assert!(p.is_remote());
                assert_eq!(p.node_id(), node);
                assert_eq!(p.address(), addr);
            }
        }
    }

    #[test]
    fn pointer_page_rounds_down() {
        let p = RemotePointer::encode(3, 0x12345);
        assert_eq!(p.page().address(), 0x12000);
        assert_eq!(p.page().node_id(), 3);
    }

    #[test]
    fn null_pointer() {
        assert!(RemotePointer::NULL.is_null());
        assert!(!RemotePointer::NULL.is_remote());
        assert!(!RemotePointer::encode(0, 0).is_null());
    }

    #[test]
    fn bitmap_claims_in_order() {
        let mut b = Bitmap::new(10);
        assert_eq!(b.get_empty(), Some(0));
        assert_eq!(b.get_empty(), Some(1));
        b.unset(0);
        assert_eq!(b.find_empty(), Some(0));
        assert_eq!(b.get_empty(), Some(0));
        assert_eq!(b.get_empty(), Some(2));
    }

    #[test]
    fn bitmap_exhausts() {
        let mut b = Bitmap::new(3);
        for _ in 0..3 {
            assert!(b.get_empty().is_some());
        }
        assert_eq!(b.get_empty(), None);
        b.unset(1);
        assert_eq!(b.get_empty(), Some(1));
    }
}
