//! Wrapper types around Bitvec.
//!
//! Every bulk operation works in place on `self`, the pickers keep a few
//! scratch bitfields around and overwrite them on each call instead of
//! allocating new ones.
use std::{cell::RefCell, ops::RangeInclusive, rc::Rc};

use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// A bitfield that is owned somewhere else, but read by a picker on every
/// call. The owner may keep mutating it, i.e. the pieces that we already
/// have.
pub type SharedBitfield = Rc<RefCell<Bitfield>>;

/// Reserved bytes exchanged during handshake.
type ReservedAlias = BitArray<[u8; 8], Msb0>;

#[derive(Debug, Clone, Default, Copy, PartialEq, Eq)]
pub struct Reserved(pub ReservedAlias);

impl From<[u8; 8]> for Reserved {
    fn from(value: [u8; 8]) -> Self {
        Self(ReservedAlias::from(value))
    }
}

impl Reserved {
    /// Bit 61, BEP 6. Peers with the fast extension may let us download
    /// "allowed fast" pieces while they are choking us, and may suggest
    /// pieces.
    pub fn supports_fast(&self) -> bool {
        self.0[61]
    }
}

pub trait BitfieldExt {
    /// A bitfield of `pieces` bits, all false.
    fn from_piece(pieces: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; pieces]
    }

    /// Overwrite `self` with the bits of `other`.
    fn copy_bits_from(&mut self, other: &Bitfield) -> &mut Self;
    /// self = self & other
    fn and_with(&mut self, other: &Bitfield) -> &mut Self;
    /// self = self | other
    fn or_with(&mut self, other: &Bitfield) -> &mut Self;
    /// self = self & !other
    fn nand_with(&mut self, other: &Bitfield) -> &mut Self;
    /// self = !self
    fn invert(&mut self) -> &mut Self;
    fn set_all_bits(&mut self, value: bool) -> &mut Self;
    fn set_true(&mut self, range: RangeInclusive<usize>) -> &mut Self;
    fn set_false(&mut self, range: RangeInclusive<usize>) -> &mut Self;
    /// Index of the first set bit inside the inclusive range.
    fn first_true(&self, range: RangeInclusive<usize>) -> Option<usize>;
    /// Index of the first unset bit inside the inclusive range.
    fn first_false(&self, range: RangeInclusive<usize>) -> Option<usize>;
    fn all_true(&self) -> bool;
    fn all_false(&self) -> bool;
    fn true_count(&self) -> usize;
}

impl BitfieldExt for Bitfield {
    fn copy_bits_from(&mut self, other: &Bitfield) -> &mut Self {
        assert_eq!(self.len(), other.len(), "bitfield length mismatch");
        self.as_raw_mut_slice().copy_from_slice(other.as_raw_slice());
        self
    }

    fn and_with(&mut self, other: &Bitfield) -> &mut Self {
        assert_eq!(self.len(), other.len(), "bitfield length mismatch");
        for (a, b) in self.as_raw_mut_slice().iter_mut().zip(other.as_raw_slice())
        {
            *a &= *b;
        }
        self
    }

    fn or_with(&mut self, other: &Bitfield) -> &mut Self {
        assert_eq!(self.len(), other.len(), "bitfield length mismatch");
        for (a, b) in self.as_raw_mut_slice().iter_mut().zip(other.as_raw_slice())
        {
            *a |= *b;
        }
        self
    }

    fn nand_with(&mut self, other: &Bitfield) -> &mut Self {
        assert_eq!(self.len(), other.len(), "bitfield length mismatch");
        for (a, b) in self.as_raw_mut_slice().iter_mut().zip(other.as_raw_slice())
        {
            *a &= !*b;
        }
        self
    }

    fn invert(&mut self) -> &mut Self {
        let bits = std::mem::take(self);
        *self = !bits;
        self
    }

    fn set_all_bits(&mut self, value: bool) -> &mut Self {
        self.fill(value);
        self
    }

    fn set_true(&mut self, range: RangeInclusive<usize>) -> &mut Self {
        let (start, end) = range.into_inner();
        self[start..end + 1].fill(true);
        self
    }

    fn set_false(&mut self, range: RangeInclusive<usize>) -> &mut Self {
        let (start, end) = range.into_inner();
        self[start..end + 1].fill(false);
        self
    }

    fn first_true(&self, range: RangeInclusive<usize>) -> Option<usize> {
        let (start, end) = range.into_inner();
        if start > end || start >= self.len() {
            return None;
        }
        let end = end.min(self.len() - 1);
        self[start..end + 1].first_one().map(|i| i + start)
    }

    fn first_false(&self, range: RangeInclusive<usize>) -> Option<usize> {
        let (start, end) = range.into_inner();
        if start > end || start >= self.len() {
            return None;
        }
        let end = end.min(self.len() - 1);
        self[start..end + 1].first_zero().map(|i| i + start)
    }

    fn all_true(&self) -> bool {
        self.all()
    }

    fn all_false(&self) -> bool {
        self.not_any()
    }

    fn true_count(&self) -> usize {
        self.count_ones()
    }
}
