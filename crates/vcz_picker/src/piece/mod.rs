//! Pieces that are being downloaded, and the state of each of their blocks.
pub mod pool;

pub use pool::PiecePool;

use crate::{
    block::{BlockInfo, BLOCK_LEN},
    peer::PeerKey,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlockState {
    #[default]
    Unrequested,
    RequestedBy(PeerKey),
    /// Received from the given peer, which is not necessarily the peer
    /// that requested it first.
    Received(PeerKey),
}

/// One slot of a [`Piece`]. The counters live on the piece, so all state
/// transitions go through [`Piece`].
#[derive(Clone, Copy, Debug)]
pub struct Block {
    piece_index: usize,
    index: usize,
    begin: u32,
    len: u32,
    state: BlockState,
    written: bool,
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.piece_index == other.piece_index && self.index == other.index
    }
}

impl Eq for Block {}

impl Block {
    fn new(piece_index: usize, index: usize, begin: u32, len: u32) -> Self {
        Self {
            piece_index,
            index,
            begin,
            len,
            state: BlockState::Unrequested,
            written: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    /// The peer that requested or delivered this block.
    pub fn owner(&self) -> Option<PeerKey> {
        match self.state {
            BlockState::Unrequested => None,
            BlockState::RequestedBy(peer) | BlockState::Received(peer) => {
                Some(peer)
            }
        }
    }

    /// Requested and not yet received.
    pub fn is_requested(&self) -> bool {
        matches!(self.state, BlockState::RequestedBy(_))
    }

    pub fn is_received(&self) -> bool {
        matches!(self.state, BlockState::Received(_))
    }

    pub fn is_unrequested(&self) -> bool {
        self.state == BlockState::Unrequested
    }

    pub fn is_written(&self) -> bool {
        self.written
    }

    pub fn block_info(&self) -> BlockInfo {
        BlockInfo::new(self.piece_index, self.begin, self.len)
    }
}

/// A piece that has at least one block requested.
///
/// Invariant: `0 <= total_received <= total_requested <= blocks.len()`,
/// where `total_requested` counts every block with an owner (received
/// blocks included).
#[derive(Clone, Debug)]
pub struct Piece {
    index: usize,
    length: u32,
    blocks: Vec<Block>,
    total_requested: usize,
    total_received: usize,
    total_written: usize,
    /// A peer cancelled or lost its requests on this piece, other peers may
    /// adopt it.
    pub abandoned: bool,
}

impl Piece {
    pub fn new(index: usize, length: u32) -> Self {
        let mut piece = Self {
            index,
            length: 0,
            blocks: Vec::new(),
            total_requested: 0,
            total_received: 0,
            total_written: 0,
            abandoned: false,
        };
        piece.reset(index, length);
        piece
    }

    /// Turn this piece into a brand new piece, keeping the allocation of
    /// the blocks.
    pub(crate) fn reset(&mut self, index: usize, length: u32) {
        assert!(length > 0, "piece {index} has no bytes");

        let count = length.div_ceil(BLOCK_LEN) as usize;

        self.index = index;
        self.length = length;
        self.total_requested = 0;
        self.total_received = 0;
        self.total_written = 0;
        self.abandoned = false;
        self.blocks.clear();
        self.blocks.extend((0..count).map(|i| {
            let begin = i as u32 * BLOCK_LEN;
            Block::new(index, i, begin, BLOCK_LEN.min(length - begin))
        }));
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn total_requested(&self) -> usize {
        self.total_requested
    }

    pub fn total_received(&self) -> usize {
        self.total_received
    }

    pub fn total_written(&self) -> usize {
        self.total_written
    }

    pub fn all_blocks_requested(&self) -> bool {
        self.total_requested == self.blocks.len()
    }

    pub fn all_blocks_received(&self) -> bool {
        self.total_received == self.blocks.len()
    }

    pub fn no_blocks_requested(&self) -> bool {
        self.total_requested == 0
    }

    /// First block that nobody requested.
    pub fn first_unrequested(&self) -> Option<usize> {
        self.blocks.iter().position(|b| b.is_unrequested())
    }

    /// Assign the block to `peer`. A block that is already requested by a
    /// different peer is handed over without being counted twice.
    ///
    /// # Panics
    ///
    /// If the block was received, or is already requested by `peer`.
    pub fn request(&mut self, block: usize, peer: PeerKey) -> BlockInfo {
        let b = &mut self.blocks[block];
        match b.state {
            BlockState::Unrequested => self.total_requested += 1,
            BlockState::RequestedBy(owner) if owner != peer => {}
            state => panic!(
                "block {block} of piece {} cannot be requested by {peer} \
                 in state {state:?}",
                self.index
            ),
        }
        b.state = BlockState::RequestedBy(peer);
        b.block_info()
    }

    /// Return the block to the unrequested state.
    ///
    /// # Panics
    ///
    /// If the block is not currently requested.
    pub fn cancel(&mut self, block: usize) -> BlockInfo {
        let b = &mut self.blocks[block];
        assert!(
            b.is_requested(),
            "block {block} of piece {} is not requested",
            self.index
        );
        b.state = BlockState::Unrequested;
        self.total_requested -= 1;
        b.block_info()
    }

    /// Mark the block as received from `peer`. Idempotent, returns false if
    /// the block was already received.
    pub fn set_received(&mut self, block: usize, peer: PeerKey) -> bool {
        let b = &mut self.blocks[block];
        match b.state {
            BlockState::Received(_) => return false,
            BlockState::Unrequested => self.total_requested += 1,
            BlockState::RequestedBy(_) => {}
        }
        b.state = BlockState::Received(peer);
        self.total_received += 1;
        true
    }

    /// Mark a received block as flushed to disk. Idempotent.
    pub fn set_written(&mut self, block: usize) {
        let b = &mut self.blocks[block];
        assert!(b.is_received(), "only received blocks can be written");
        if !b.written {
            b.written = true;
            self.total_written += 1;
        }
    }

    /// Distinct owners of the blocks of this piece, in block order.
    pub fn peers_involved(&self) -> Vec<PeerKey> {
        let mut peers = Vec::new();
        for peer in self.blocks.iter().filter_map(|b| b.owner()) {
            if !peers.contains(&peer) {
                peers.push(peer);
            }
        }
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: PeerKey = PeerKey(1);
    const B: PeerKey = PeerKey(2);

    fn assert_counts(piece: &Piece) {
        let received = piece.blocks().iter().filter(|b| b.is_received()).count();
        let owned = piece.blocks().iter().filter(|b| b.owner().is_some()).count();
        assert_eq!(piece.total_received(), received);
        assert_eq!(piece.total_requested(), owned);
        assert!(piece.total_received() <= piece.total_requested());
        assert!(piece.total_requested() <= piece.block_count());
    }

    #[test]
    fn blocks_are_partitioned() {
        let piece = Piece::new(3, BLOCK_LEN * 2 + 100);
        assert_eq!(piece.block_count(), 3);
        assert_eq!(piece.blocks()[0].block_info(), BlockInfo::new(3, 0, BLOCK_LEN));
        assert_eq!(
            piece.blocks()[2].block_info(),
            BlockInfo::new(3, BLOCK_LEN * 2, 100)
        );

        let piece = Piece::new(0, BLOCK_LEN * 4);
        assert_eq!(piece.block_count(), 4);
        assert_eq!(piece.blocks()[3].block_info().len, BLOCK_LEN);
    }

    #[test]
    fn request_cancel_receive() {
        let mut piece = Piece::new(0, BLOCK_LEN * 3);

        piece.request(0, A);
        piece.request(1, A);
        assert_eq!(piece.total_requested(), 2);
        assert_counts(&piece);

        // handing a requested block to another peer does not double count
        piece.request(1, B);
        assert_eq!(piece.total_requested(), 2);
        assert_eq!(piece.blocks()[1].owner(), Some(B));

        piece.cancel(1);
        assert_eq!(piece.total_requested(), 1);
        assert!(piece.blocks()[1].is_unrequested());
        assert_counts(&piece);

        assert!(piece.set_received(0, A));
        assert!(!piece.set_received(0, A));
        assert_eq!(piece.total_received(), 1);
        assert_counts(&piece);

        // receiving an unrequested block counts it as requested too
        assert!(piece.set_received(2, B));
        assert_eq!(piece.total_requested(), 2);
        assert_eq!(piece.total_received(), 2);
        assert_counts(&piece);

        assert_eq!(piece.first_unrequested(), Some(1));
        assert_eq!(piece.peers_involved(), vec![A, B]);
    }

    #[test]
    #[should_panic]
    fn cannot_request_twice_by_same_peer() {
        let mut piece = Piece::new(0, BLOCK_LEN);
        piece.request(0, A);
        piece.request(0, A);
    }

    #[test]
    #[should_panic]
    fn cannot_cancel_unrequested() {
        let mut piece = Piece::new(0, BLOCK_LEN);
        piece.cancel(0);
    }

    #[test]
    fn written_blocks() {
        let mut piece = Piece::new(0, BLOCK_LEN * 2);
        piece.request(0, A);
        piece.set_received(0, A);
        piece.set_written(0);
        piece.set_written(0);
        assert_eq!(piece.total_written(), 1);
        assert!(piece.blocks()[0].is_written());
    }

    #[test]
    fn blocks_equal_by_position() {
        let mut a = Piece::new(1, BLOCK_LEN * 2);
        let b = Piece::new(1, BLOCK_LEN * 2);
        a.request(0, A);
        assert_eq!(a.blocks()[0], b.blocks()[0]);
        assert_ne!(a.blocks()[0], b.blocks()[1]);
    }
}
