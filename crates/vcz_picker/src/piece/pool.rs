//! Free list of [`Piece`]s, so that the picker doesn't allocate a block
//! vector for every piece it starts.
use super::Piece;

/// How many pieces are kept around at most.
pub const MAX_POOLED_PIECES: usize = 64;

#[derive(Debug, Default)]
pub struct PiecePool {
    free: Vec<Piece>,
}

impl PiecePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh piece, recycled when possible. The returned piece has no
    /// state from its previous life.
    pub fn take(&mut self, index: usize, length: u32) -> Piece {
        match self.free.pop() {
            Some(mut piece) => {
                piece.reset(index, length);
                piece
            }
            None => Piece::new(index, length),
        }
    }

    /// Give a piece back. The piece is moved in, so it can't be touched
    /// again until it is handed out by [`PiecePool::take`].
    pub fn put(&mut self, piece: Piece) {
        if self.free.len() < MAX_POOLED_PIECES {
            self.free.push(piece);
        }
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{block::BLOCK_LEN, peer::PeerKey};

    #[test]
    fn recycled_piece_is_reset() {
        let mut pool = PiecePool::new();
        let mut piece = pool.take(4, BLOCK_LEN * 3);
        piece.request(0, PeerKey(1));
        piece.request(1, PeerKey(2));
        piece.set_received(0, PeerKey(1));
        piece.set_written(0);
        piece.abandoned = true;

        pool.put(piece);
        assert_eq!(pool.len(), 1);

        let piece = pool.take(9, BLOCK_LEN + 10);
        assert!(pool.is_empty());
        assert_eq!(piece.index(), 9);
        assert_eq!(piece.block_count(), 2);
        assert_eq!(piece.total_requested(), 0);
        assert_eq!(piece.total_received(), 0);
        assert_eq!(piece.total_written(), 0);
        assert!(!piece.abandoned);
        assert!(piece.blocks().iter().all(|b| b.is_unrequested() && !b.is_written()));
        assert_eq!(piece.blocks()[1].block_info().len, 10);
        assert_eq!(piece.blocks()[1].block_info().index, 9);
    }

    #[test]
    fn pool_is_bounded() {
        let mut pool = PiecePool::new();
        for i in 0..MAX_POOLED_PIECES + 10 {
            pool.put(Piece::new(i, BLOCK_LEN));
        }
        assert_eq!(pool.len(), MAX_POOLED_PIECES);
    }
}
