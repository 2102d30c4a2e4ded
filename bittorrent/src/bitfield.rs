// Compact piece-possession vector. A thin newtype over `bitvec` rather than a
// hand-rolled byte vector (c.f. the two ad-hoc Bitfield types in core/), since the
// wire codec already needs to round-trip the same MSB-first byte layout BEP 3 uses
// for the BITFIELD message.

use bitvec::prelude::*;

pub type BitVec = bitvec::vec::BitVec<u8, Msb0>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: BitVec,
    num_pieces: usize,
}

impl Bitfield {
    pub fn new(num_pieces: usize) -> Self {
        Self { bits: BitVec::repeat(false, num_pieces), num_pieces }
    }

    // Construct from a wire BITFIELD payload, masking off padding bits beyond
    // `num_pieces` inside the last byte per the fixed-length invariant.
    pub fn from_wire_bytes(bytes: &[u8], num_pieces: usize) -> Self {
        let mut bits: BitVec = BitVec::from_slice(bytes);
        bits.truncate(num_pieces.max(bits.len().min(num_pieces)));
        bits.resize(num_pieces, false);
        Self { bits, num_pieces }
    }

    pub fn to_wire_bytes(&self) -> Vec<u8> {
        self.bits.clone().into_vec()
    }

    pub fn have_none(num_pieces: usize) -> Self {
        Self::new(num_pieces)
    }

    pub fn have_all(num_pieces: usize) -> Self {
        Self { bits: BitVec::repeat(true, num_pieces), num_pieces }
    }

    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    pub fn set(&mut self, index: usize, value: bool) {
        if let Some(mut bit) = self.bits.get_mut(index) {
            *bit = value;
        }
    }

    pub fn count_set(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn count_zeros(&self) -> usize {
        self.bits.count_zeros()
    }

    pub fn len(&self) -> usize {
        self.num_pieces
    }

    pub fn is_empty(&self) -> bool {
        self.num_pieces == 0
    }

    // BEP 6 HAVE-ALL/HAVE-NONE replace, not merge: the caller is expected to
    // drop the previous bitfield entirely and install one of these.
    pub fn is_have_all(&self) -> bool {
        self.count_zeros() == 0
    }

    pub fn is_have_none(&self) -> bool {
        self.count_set() == 0
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_masks_padding() {
        let bf = Bitfield::have_all(10);
        let bytes = bf.to_wire_bytes();
        assert_eq!(bytes.len(), 2);
        let back = Bitfield::from_wire_bytes(&bytes, 10);
        assert_eq!(back, bf);
        // Bits 10..16 in the last byte must be zero, not counted.
        assert_eq!(back.count_set(), 10);
    }

    #[test]
    fn set_and_count() {
        let mut bf = Bitfield::new(4);
        assert!(bf.is_have_none());
        bf.set(1, true);
        bf.set(3, true);
        assert_eq!(bf.count_set(), 2);
        assert_eq!(bf.iter_set().collect::<Vec<_>>(), vec![1, 3]);
        assert!(!bf.is_have_all());
    }

    #[test]
    fn have_all_is_fully_set() {
        let bf = Bitfield::have_all(7);
        assert!(bf.is_have_all());
        assert_eq!(bf.count_set(), 7);
    }
}
