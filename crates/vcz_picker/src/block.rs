//! The units that are requested from peers.
use crate::peer::PeerKey;

/// The default block_len that most clients support, some clients drop
/// the connection on blocks larger than this value.
///
/// Tha last block of a piece might be smallar.
pub const BLOCK_LEN: u32 = 16384;

/// The representation of a block of a piece.
///
/// When we ask a peer to give us a block, we send this struct,
/// using the "Request" message of the tcp wire protocol. This is also
/// what a peer answers with (minus the data) and what gets cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: usize,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's length in bytes. <= 16 KiB
    pub len: u32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self { index: 0, begin: 0, len: BLOCK_LEN }
    }
}

impl BlockInfo {
    pub fn new(index: usize, begin: u32, len: u32) -> Self {
        Self { index, begin, len }
    }

    /// Index of the block inside of its piece.
    pub fn block_index(&self) -> usize {
        (self.begin / BLOCK_LEN) as usize
    }

    pub fn segment(&self) -> Segment {
        Segment { piece: self.index, block: self.block_index() }
    }

    /// Validate the [`BlockInfo`]. Like most clients, we only support
    /// data <= 16kiB.
    pub fn is_valid(&self) -> bool {
        self.len <= BLOCK_LEN && self.begin % BLOCK_LEN == 0 && self.len > 0
    }
}

/// Identity of a requestable unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Segment {
    pub piece: usize,
    pub block: usize,
}

impl Segment {
    pub fn new(piece: usize, block: usize) -> Self {
        Self { piece, block }
    }
}

/// A block that was requested and is still tracked by a picker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ActiveRequest {
    pub segment: Segment,
    pub begin: u32,
    pub len: u32,
    pub peer: PeerKey,
    pub received: bool,
}

impl ActiveRequest {
    pub fn block_info(&self) -> BlockInfo {
        BlockInfo::new(self.segment.piece, self.begin, self.len)
    }
}
