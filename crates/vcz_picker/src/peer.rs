//! A remote peer, as seen by the pickers and requesters.
use std::fmt::Display;

use crate::{
    bitfield::{Bitfield, BitfieldExt, Reserved},
    block::BLOCK_LEN,
};

/// How many requests a peer may have in flight before we know better,
/// i.e. before it tells us its `reqq`.
pub const NORMAL_REQUEST_AMOUNT: usize = 2;

/// Opaque identity of a connected peer. Blocks remember who requested them
/// by key, never by reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct PeerKey(pub u32);

impl Display for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

impl std::fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s)
    }
}

impl From<u32> for PeerKey {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<PeerKey> for u32 {
    fn from(value: PeerKey) -> Self {
        value.0
    }
}

/// Everything a picker needs to know about a peer connection. The
/// connection itself lives somewhere else, the pickers only read its state
/// and update the bookkeeping of requests.
pub trait Requester {
    fn key(&self) -> PeerKey;

    /// Pieces that the peer has.
    fn bitfield(&self) -> &Bitfield;

    /// If the peer is choking us, we can only download "allowed fast"
    /// pieces from it.
    fn is_choking(&self) -> bool;

    fn supports_fast_peer(&self) -> bool;

    fn allowed_fast_pieces(&self) -> &[usize];

    /// The picker removes the pieces that it started.
    fn allowed_fast_pieces_mut(&mut self) -> &mut Vec<usize>;

    fn suggested_pieces(&self) -> &[usize];

    fn suggested_pieces_mut(&mut self) -> &mut Vec<usize>;

    /// How many times in a row a piece that this peer helped to download
    /// failed the hash check.
    fn repeated_hash_fails(&self) -> u32;

    /// Requests sent to the peer that were not answered yet.
    fn outstanding_requests(&self) -> usize;

    fn set_outstanding_requests(&mut self, n: usize);

    fn max_pending_requests(&self) -> usize;

    /// Download rate from this peer, in bytes per second.
    fn download_speed(&self) -> u64;

    fn can_request_more_pieces(&self) -> bool {
        true
    }

    fn is_seeder(&self) -> bool {
        self.bitfield().all_true()
    }

    /// How many blocks to ask for at once. Roughly one second worth of
    /// data, at most one piece, at least [`NORMAL_REQUEST_AMOUNT`].
    fn preferred_request_amount(&self, piece_length: u32) -> usize {
        let per_second = (self.download_speed() / BLOCK_LEN as u64) as usize;
        let per_piece = piece_length.div_ceil(BLOCK_LEN) as usize;
        per_second.min(per_piece).max(NORMAL_REQUEST_AMOUNT)
    }
}

/// A plain implementation of [`Requester`], for callers that keep the
/// scheduling state of their peers in one place.
#[derive(Debug, Clone)]
pub struct Peer {
    pub key: PeerKey,
    pub bitfield: Bitfield,
    /// If peer is choking us, we can't download pieces from them.
    pub peer_choking: bool,
    pub supports_fast: bool,
    pub allowed_fast: Vec<usize>,
    pub suggested: Vec<usize>,
    pub repeated_hash_fails: u32,
    pub outstanding: usize,
    pub max_pending: usize,
    pub download_speed: u64,
}

impl Peer {
    /// A peer that has no pieces and is choking us, which is how every
    /// connection starts.
    pub fn new(key: impl Into<PeerKey>, pieces: usize) -> Self {
        Self {
            key: key.into(),
            bitfield: Bitfield::from_piece(pieces),
            peer_choking: true,
            supports_fast: false,
            allowed_fast: Vec::new(),
            suggested: Vec::new(),
            repeated_hash_fails: 0,
            outstanding: 0,
            max_pending: NORMAL_REQUEST_AMOUNT,
            download_speed: 0,
        }
    }

    /// A peer that has every piece.
    pub fn seeder(key: impl Into<PeerKey>, pieces: usize) -> Self {
        let mut peer = Self::new(key, pieces);
        peer.bitfield.set_all_bits(true);
        peer
    }

    pub fn unchoked(mut self) -> Self {
        self.peer_choking = false;
        self
    }

    pub fn with_reserved(mut self, reserved: Reserved) -> Self {
        self.supports_fast = reserved.supports_fast();
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// The peer announced that it has `piece`.
    pub fn have(&mut self, piece: usize) {
        self.bitfield.set(piece, true);
    }
}

impl Requester for Peer {
    fn key(&self) -> PeerKey {
        self.key
    }

    fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    fn is_choking(&self) -> bool {
        self.peer_choking
    }

    fn supports_fast_peer(&self) -> bool {
        self.supports_fast
    }

    fn allowed_fast_pieces(&self) -> &[usize] {
        &self.allowed_fast
    }

    fn allowed_fast_pieces_mut(&mut self) -> &mut Vec<usize> {
        &mut self.allowed_fast
    }

    fn suggested_pieces(&self) -> &[usize] {
        &self.suggested
    }

    fn suggested_pieces_mut(&mut self) -> &mut Vec<usize> {
        &mut self.suggested
    }

    fn repeated_hash_fails(&self) -> u32 {
        self.repeated_hash_fails
    }

    fn outstanding_requests(&self) -> usize {
        self.outstanding
    }

    fn set_outstanding_requests(&mut self, n: usize) {
        self.outstanding = n;
    }

    fn max_pending_requests(&self) -> usize {
        self.max_pending
    }

    fn download_speed(&self) -> u64 {
        self.download_speed
    }
}
