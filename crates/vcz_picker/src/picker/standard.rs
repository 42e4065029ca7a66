//! The core picker. It is the only picker that owns state about requests,
//! every filter ends up calling into it.
use std::{collections::BTreeMap, sync::Arc};

use hashbrown::HashMap;
use tracing::{debug, trace, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    block::{ActiveRequest, BlockInfo, Segment, BLOCK_LEN},
    error::Error,
    peer::{PeerKey, Requester},
    piece::{BlockState, Piece, PiecePool},
    torrent::TorrentInfo,
};

use super::{PiecePicker, ValidatedBlock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CandidateList {
    AllowedFast,
    Suggested,
}

/// Tracks every piece in flight.
///
/// A piece is "in flight" from the moment its first block is requested
/// until all of its blocks are received or nobody is requesting it
/// anymore. In endgame a piece may also have duplicates, copies of the
/// primary piece that let more than one peer request the same block.
#[derive(Debug, Default)]
pub struct StandardPicker {
    torrent: Option<Arc<TorrentInfo>>,
    /// Primary piece of each piece in flight, by index.
    requests: BTreeMap<usize, Piece>,
    /// Extra copies of a primary, in creation order.
    duplicates: HashMap<usize, Vec<Piece>>,
    /// The last piece that each peer started or continued.
    most_recent: HashMap<PeerKey, usize>,
    /// A bit is set for every key of `requests`.
    already_requested: Bitfield,
    /// Scratch space of `standard_pick`.
    can_request: Bitfield,
    pool: PiecePool,
}

fn has(bitfield: &Bitfield, index: usize) -> bool {
    bitfield.get(index).is_some_and(|b| *b)
}

/// The largest run of set bits in `start..=end`, never longer than
/// `wanted`. The first run that is long enough wins.
fn largest_run(
    bitfield: &Bitfield,
    start: usize,
    end: usize,
    wanted: usize,
) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    let mut cursor = start;

    while let Some(run_start) = bitfield.first_true(cursor..=end) {
        let run_end = bitfield.first_false(run_start..=end).unwrap_or(end + 1);
        let len = run_end - run_start;

        if len >= wanted {
            return Some((run_start, wanted));
        }
        if best.map_or(true, |(_, l)| len > l) {
            best = Some((run_start, len));
        }
        if run_end > end {
            break;
        }
        cursor = run_end;
    }

    best
}

impl StandardPicker {
    pub fn new() -> Self {
        Self::default()
    }

    fn torrent(&self) -> Arc<TorrentInfo> {
        match &self.torrent {
            Some(torrent) => torrent.clone(),
            None => panic!("the picker must be initialised before it is used"),
        }
    }

    fn last_piece(&self) -> usize {
        self.already_requested.len().saturating_sub(1)
    }

    /// The primary piece of `index`, if it is in flight.
    pub fn piece(&self, index: usize) -> Option<&Piece> {
        self.requests.get(&index)
    }

    /// Duplicates of the piece `index`.
    pub fn duplicates(&self, index: usize) -> &[Piece] {
        self.duplicates.get(&index).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn pieces_in_flight(&self) -> usize {
        self.requests.len()
    }

    fn has_duplicates(&self, index: usize) -> bool {
        self.duplicates.get(&index).is_some_and(|d| !d.is_empty())
    }

    /// Allocate a new primary piece and request its first block.
    fn start_piece(&mut self, index: usize, peer: PeerKey) -> BlockInfo {
        let length = self.torrent().bytes_per_piece(index);
        let mut piece = self.pool.take(index, length);
        let block = piece.request(0, peer);

        self.requests.insert(index, piece);
        self.already_requested.set(index, true);
        self.most_recent.insert(peer, index);

        debug!("{peer} started piece {index}");
        block
    }

    /// Take a piece out of the map of requests, and give it and its
    /// duplicates back to the pool.
    fn remove_piece(&mut self, index: usize) {
        if let Some(piece) = self.requests.remove(&index) {
            self.pool.put(piece);
        }
        if let Some(extras) = self.duplicates.remove(&index) {
            for piece in extras {
                self.pool.put(piece);
            }
        }
        self.already_requested.set(index, false);
        self.most_recent.retain(|_, i| *i != index);
    }

    /// A piece with no requests left on any of its copies.
    fn is_idle(&self, index: usize) -> bool {
        let primary = self.requests.get(&index).map_or(true, |p| p.no_blocks_requested());
        primary && self.duplicates(index).iter().all(|p| p.no_blocks_requested())
    }

    #[allow(clippy::too_many_arguments)]
    fn continue_existing(
        &mut self,
        peer: PeerKey,
        available: &Bitfield,
        start: usize,
        end: usize,
        max_duplicates: usize,
        allow_abandoned: bool,
        allow_any: bool,
    ) -> Option<BlockInfo> {
        if start > end {
            return None;
        }

        // the piece that this peer was working on, if any
        if let Some(&index) = self.most_recent.get(&peer) {
            if (start..=end).contains(&index) && has(available, index) {
                if let Some(piece) = self.requests.get_mut(&index) {
                    let extras = self.duplicates.get(&index).map_or(&[][..], Vec::as_slice);
                    if let Some(block) = first_free_block(piece, extras, peer) {
                        return Some(piece.request(block, peer));
                    }
                }
            }
        }

        for (&index, piece) in self.requests.range_mut(start..=end) {
            if piece.all_blocks_requested() || !has(available, index) {
                continue;
            }

            let owner = piece.blocks()[0].owner();
            let can_continue = allow_any
                || (allow_abandoned && piece.abandoned)
                || owner == Some(peer);

            if !can_continue {
                continue;
            }

            let extras = self.duplicates.get(&index).map_or(&[][..], Vec::as_slice);
            if let Some(block) = first_free_block(piece, extras, peer) {
                let block = piece.request(block, peer);
                self.most_recent.insert(peer, index);
                return Some(block);
            }
        }

        if max_duplicates < 2 {
            return None;
        }

        // every block of the pieces in range is requested, request the
        // same blocks again from this peer
        for (&index, primary) in self.requests.range(start..=end) {
            if !has(available, index) {
                continue;
            }

            let extras = self.duplicates.entry(index).or_default();
            let block = request_duplicate(
                primary,
                extras,
                &mut self.pool,
                peer,
                max_duplicates,
            );
            if extras.is_empty() {
                self.duplicates.remove(&index);
            }

            if block.is_some() {
                return block;
            }
        }

        None
    }

    /// Start a piece of the peer's "allowed fast" or "suggested" list.
    fn from_candidate_list(
        &mut self,
        peer: &mut dyn Requester,
        available: &Bitfield,
        start: usize,
        end: usize,
        kind: CandidateList,
    ) -> Option<BlockInfo> {
        if !peer.supports_fast_peer() {
            return None;
        }

        let key = peer.key();
        let pieces = self.already_requested.len();
        let list = match kind {
            CandidateList::AllowedFast => peer.allowed_fast_pieces_mut(),
            CandidateList::Suggested => peer.suggested_pieces_mut(),
        };

        // indices that don't exist on this torrent are never useful
        list.retain(|&index| index < pieces);

        let position = list.iter().position(|&index| {
            (start..=end).contains(&index)
                && has(available, index)
                && !self.already_requested[index]
        })?;

        let index = list.remove(position);
        trace!("{key} starting {kind:?} piece {index}");
        Some(self.start_piece(index, key))
    }

    /// Start new pieces, as many as needed to fill `requests`, preferring
    /// pieces that are next to each other.
    fn standard_pick(
        &mut self,
        peer: PeerKey,
        available: &Bitfield,
        start: usize,
        end: usize,
        requests: &mut [BlockInfo],
    ) -> usize {
        let torrent = self.torrent();
        let end = end.min(self.last_piece());
        if start > end {
            return 0;
        }

        let wanted_bytes = requests.len() as u64 * BLOCK_LEN as u64;
        let pieces_needed =
            wanted_bytes.div_ceil(torrent.piece_length as u64).max(1) as usize;

        self.can_request
            .copy_bits_from(available)
            .nand_with(&self.already_requested);

        let Some((run_start, run_len)) =
            largest_run(&self.can_request, start, end, pieces_needed)
        else {
            return 0;
        };

        let mut written = 0;

        for index in run_start..run_start + run_len {
            let mut piece = self.pool.take(index, torrent.bytes_per_piece(index));

            for block in 0..piece.block_count() {
                if written == requests.len() {
                    break;
                }
                requests[written] = piece.request(block, peer);
                written += 1;
            }

            self.requests.insert(index, piece);
            self.already_requested.set(index, true);
            self.most_recent.insert(peer, index);
            debug!("{peer} started piece {index}");

            if written == requests.len() {
                break;
            }
        }

        written
    }
}

/// First block of `piece` that nobody requested and that `peer` is not
/// already requesting on one of the duplicates.
fn first_free_block(piece: &Piece, extras: &[Piece], peer: PeerKey) -> Option<usize> {
    (0..piece.block_count()).find(|&i| {
        piece.blocks()[i].is_unrequested()
            && !extras
                .iter()
                .any(|e| e.blocks()[i].state() == BlockState::RequestedBy(peer))
    })
}

/// Request from `peer` the first block of `primary` that it does not
/// already own on any copy, creating a new copy when every existing one is
/// taken and there is room for one more.
fn request_duplicate(
    primary: &Piece,
    extras: &mut Vec<Piece>,
    pool: &mut PiecePool,
    peer: PeerKey,
    max_duplicates: usize,
) -> Option<BlockInfo> {
    for (block, b) in primary.blocks().iter().enumerate() {
        if !b.is_requested() || b.owner() == Some(peer) {
            continue;
        }
        if extras.iter().any(|e| e.blocks()[block].owner() == Some(peer)) {
            continue;
        }

        if let Some(extra) =
            extras.iter_mut().find(|e| e.blocks()[block].is_unrequested())
        {
            return Some(extra.request(block, peer));
        }

        if extras.len() + 1 < max_duplicates {
            let mut extra = pool.take(primary.index(), primary.length());
            for (i, b) in primary.blocks().iter().enumerate() {
                if let BlockState::Received(owner) = b.state() {
                    extra.set_received(i, owner);
                }
            }
            let request = extra.request(block, peer);
            extras.push(extra);
            debug!(
                "{peer} duplicating piece {}, {} copies",
                primary.index(),
                extras.len() + 1
            );
            return Some(request);
        }
    }

    None
}

/// Mark the block as received if `peer` is the one that requested it.
fn receive(piece: &mut Piece, peer: PeerKey, request: BlockInfo) -> Result<(), Error> {
    let block = request.block_index();
    let Some(b) = piece.blocks().get(block) else {
        return Err(Error::BlockUnknown(request));
    };

    if request.begin % BLOCK_LEN != 0 || b.block_info().len != request.len {
        return Err(Error::BlockUnknown(request));
    }

    match b.state() {
        BlockState::Received(_) => Err(Error::BlockAlreadyReceived(request)),
        BlockState::Unrequested => Err(Error::BlockNotRequested(request)),
        BlockState::RequestedBy(owner) if owner != peer => {
            Err(Error::WrongPeer(request))
        }
        BlockState::RequestedBy(_) => {
            piece.set_received(block, peer);
            Ok(())
        }
    }
}

fn active_requests(piece: &Piece) -> impl Iterator<Item = ActiveRequest> + '_ {
    piece.blocks().iter().filter_map(|b| match b.state() {
        BlockState::RequestedBy(peer) => {
            let info = b.block_info();
            Some(ActiveRequest {
                segment: Segment::new(info.index, b.index()),
                begin: info.begin,
                len: info.len,
                peer,
                received: false,
            })
        }
        _ => None,
    })
}

impl PiecePicker for StandardPicker {
    fn initialise(&mut self, torrent: Arc<TorrentInfo>) {
        let pieces = torrent.pieces_count();

        for (_, piece) in std::mem::take(&mut self.requests) {
            self.pool.put(piece);
        }
        for (_, extras) in self.duplicates.drain() {
            for piece in extras {
                self.pool.put(piece);
            }
        }
        self.most_recent.clear();
        self.already_requested = Bitfield::from_piece(pieces);
        self.can_request = Bitfield::from_piece(pieces);
        self.torrent = Some(torrent);
    }

    fn is_interesting(&mut self, _peer: &dyn Requester, bitfield: &Bitfield) -> bool {
        !bitfield.all_false()
    }

    fn pick_piece(
        &mut self,
        peer: &mut dyn Requester,
        available: &Bitfield,
        _others: &[&Bitfield],
        start: usize,
        end: usize,
        requests: &mut [BlockInfo],
    ) -> usize {
        if requests.is_empty() || start > end {
            return 0;
        }

        let key = peer.key();

        // finish what this peer started
        if let Some(block) =
            self.continue_existing(key, peer.bitfield(), start, end, 1, false, false)
        {
            requests[0] = block;
            return 1;
        }

        if peer.is_choking() {
            return match self.from_candidate_list(
                peer,
                available,
                start,
                end,
                CandidateList::AllowedFast,
            ) {
                Some(block) => {
                    requests[0] = block;
                    1
                }
                None => 0,
            };
        }

        // peers that keep sending corrupt data don't get to touch pieces
        // that other peers started
        if peer.repeated_hash_fails() == 0 {
            if let Some(block) =
                self.continue_existing(key, peer.bitfield(), start, end, 1, true, false)
            {
                requests[0] = block;
                return 1;
            }
        }

        if let Some(block) = self.from_candidate_list(
            peer,
            available,
            start,
            end,
            CandidateList::Suggested,
        ) {
            requests[0] = block;
            return 1;
        }

        self.standard_pick(key, available, start, end, requests)
    }

    fn continue_existing_request(
        &mut self,
        peer: &dyn Requester,
        start: usize,
        end: usize,
    ) -> Option<BlockInfo> {
        self.continue_existing(peer.key(), peer.bitfield(), start, end, 1, false, false)
    }

    fn continue_any_existing_request(
        &mut self,
        peer: &dyn Requester,
        available: &Bitfield,
        start: usize,
        end: usize,
        max_duplicates: usize,
    ) -> Option<BlockInfo> {
        if peer.repeated_hash_fails() != 0 {
            return None;
        }
        self.continue_existing(peer.key(), available, start, end, max_duplicates, true, true)
    }

    fn cancel_requests(
        &mut self,
        peer: &dyn Requester,
        start: usize,
        end: usize,
    ) -> Vec<BlockInfo> {
        let key = peer.key();
        let mut cancelled = Vec::new();

        if start > end {
            return cancelled;
        }

        let mut touched = Vec::new();

        for (&index, piece) in self.requests.range_mut(start..=end) {
            for block in 0..piece.block_count() {
                if piece.blocks()[block].state() == BlockState::RequestedBy(key) {
                    cancelled.push(piece.cancel(block));
                    piece.abandoned = true;
                    touched.push(index);
                }
            }
        }

        for (&index, extras) in self.duplicates.iter_mut() {
            if !(start..=end).contains(&index) {
                continue;
            }
            for extra in extras.iter_mut() {
                for block in 0..extra.block_count() {
                    if extra.blocks()[block].state() == BlockState::RequestedBy(key) {
                        cancelled.push(extra.cancel(block));
                        touched.push(index);
                    }
                }
            }
        }

        touched.sort_unstable();
        touched.dedup();
        for index in touched {
            if self.is_idle(index) {
                self.remove_piece(index);
            }
        }

        if self.most_recent.get(&key).is_some_and(|i| (start..=end).contains(i)) {
            self.most_recent.remove(&key);
        }

        if !cancelled.is_empty() {
            debug!("cancelled {} requests of {key}", cancelled.len());
        }

        cancelled
    }

    fn abort_requests(&mut self, peer: &dyn Requester) -> Vec<BlockInfo> {
        let last = self.last_piece();
        self.cancel_requests(peer, 0, last)
    }

    fn request_rejected(&mut self, peer: &dyn Requester, request: BlockInfo) -> bool {
        let key = peer.key();
        let index = request.index;
        let block = request.block_index();

        let owned_by_peer = |piece: &Piece| {
            piece.blocks().get(block).is_some_and(|b| {
                b.state() == BlockState::RequestedBy(key) && b.block_info() == request
            })
        };

        let mut found = false;

        if let Some(piece) = self.requests.get_mut(&index) {
            if owned_by_peer(piece) {
                piece.cancel(block);
                piece.abandoned = true;
                found = true;
            }
        }

        if !found {
            if let Some(extras) = self.duplicates.get_mut(&index) {
                if let Some(extra) = extras.iter_mut().find(|e| owned_by_peer(e)) {
                    extra.cancel(block);
                    found = true;
                }
            }
        }

        if !found {
            return false;
        }

        trace!("{key} rejected {request:?}");

        if self.is_idle(index) {
            self.remove_piece(index);
        }

        true
    }

    fn validate_piece(
        &mut self,
        peer: &mut dyn Requester,
        request: BlockInfo,
    ) -> Result<ValidatedBlock, Error> {
        let key = peer.key();
        let index = request.index;
        let has_duplicates = self.has_duplicates(index);

        let Some(primary) = self.requests.get_mut(&index) else {
            warn!("{key} sent {request:?} of a piece that is not in flight");
            return Err(Error::PieceNotRequested(index));
        };

        let mut result = receive(primary, key, request);

        if result.is_err() && has_duplicates {
            if let Some(extras) = self.duplicates.get_mut(&index) {
                if extras.iter_mut().any(|e| receive(e, key, request).is_ok()) {
                    result = Ok(());
                }
            }
        }

        if let Err(e) = result {
            warn!("{key} sent a block that was rejected: {e}");
            return Err(e);
        }

        let outstanding = peer.outstanding_requests();
        peer.set_outstanding_requests(outstanding.saturating_sub(1));

        // every copy learns about the block
        let block = request.block_index();
        primary.set_received(block, key);
        if let Some(extras) = self.duplicates.get_mut(&index) {
            for extra in extras.iter_mut() {
                extra.set_received(block, key);
            }
        }

        if !primary.all_blocks_received() {
            return Ok(ValidatedBlock::default());
        }

        let peers_involved = primary.peers_involved();
        self.remove_piece(index);
        debug!("piece {index} complete, downloaded from {peers_involved:?}");

        Ok(ValidatedBlock { piece_complete: true, peers_involved })
    }

    fn current_request_count(&self) -> usize {
        self.requests
            .values()
            .chain(self.duplicates.values().flatten())
            .map(|p| p.total_requested() - p.total_received())
            .sum()
    }

    fn current_received_count(&self) -> usize {
        self.requests.values().map(|p| p.total_received()).sum()
    }

    fn export_active_requests(&self) -> Vec<ActiveRequest> {
        self.requests
            .values()
            .chain(self.duplicates.values().flatten())
            .flat_map(active_requests)
            .collect()
    }
}
