//! Requesters keep the request pipeline of each peer full, using a chain of
//! [`PiecePicker`]s to decide what to ask for.
pub mod standard;
pub mod streaming;

pub use standard::StandardRequester;
pub use streaming::StreamingRequester;

use std::{cmp::Reverse, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    bitfield::{Bitfield, SharedBitfield},
    block::BlockInfo,
    peer::Requester,
    picker::PiecePicker,
    torrent::TorrentInfo,
};

/// Sends messages to peers. The requesters only decide what to send.
pub trait MessageEnqueuer {
    fn enqueue_request(&mut self, peer: &dyn Requester, block: BlockInfo);

    fn enqueue_requests(&mut self, peer: &dyn Requester, blocks: &[BlockInfo]) {
        for block in blocks {
            self.enqueue_request(peer, *block);
        }
    }

    fn enqueue_cancellation(&mut self, peer: &dyn Requester, block: BlockInfo);

    fn enqueue_cancellations(&mut self, peer: &dyn Requester, blocks: &[BlockInfo]) {
        for block in blocks {
            self.enqueue_cancellation(peer, *block);
        }
    }
}

/// Which filters the [`StandardRequester`] puts on top of the
/// [`StandardPicker`](crate::picker::StandardPicker).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct RequesterSettings {
    pub allow_prioritisation: bool,
    pub allow_randomised: bool,
    pub allow_rarest_first: bool,
}

impl Default for RequesterSettings {
    fn default() -> Self {
        Self {
            allow_prioritisation: true,
            allow_randomised: true,
            allow_rarest_first: true,
        }
    }
}

pub trait PieceRequester {
    /// Build the chain of pickers. The pieces of every bitfield of
    /// `ignoring` are never requested, i.e. the pieces that we have.
    fn initialise(&mut self, torrent: Arc<TorrentInfo>, ignoring: &[SharedBitfield]);

    /// The picker that owns the requests, to validate blocks and cancel
    /// requests as peers answer, choke or disconnect.
    ///
    /// # Panics
    ///
    /// If the requester was not initialised.
    fn picker(&mut self) -> &mut dyn PiecePicker;

    /// Some pieces are being requested from more than one peer.
    fn in_endgame(&self) -> bool;

    /// Forget every request of `peer`, after it choked us or disconnected.
    /// Returns the blocks that it will never send.
    fn abort_requests(&mut self, peer: &dyn Requester) -> Vec<BlockInfo> {
        self.picker().abort_requests(peer)
    }

    /// If we want something that `peer` has.
    fn is_interesting(&mut self, peer: &dyn Requester) -> bool {
        let bitfield = peer.bitfield();
        self.picker().is_interesting(peer, bitfield)
    }

    /// Enqueue requests to `peer` until its pipeline is full, or until
    /// there is nothing left to request from it.
    fn add_requests(
        &mut self,
        peer: &mut dyn Requester,
        available: &Bitfield,
        others: &[&Bitfield],
        enqueuer: &mut dyn MessageEnqueuer,
    );

    /// Call [`PieceRequester::add_requests`] for every peer, fastest peers
    /// first so that they get the pieces that are left.
    fn add_requests_all(
        &mut self,
        peers: &mut [&mut dyn Requester],
        enqueuer: &mut dyn MessageEnqueuer,
    ) {
        peers.sort_by_key(|peer| Reverse(peer.download_speed()));

        for i in 0..peers.len() {
            let (before, rest) = peers.split_at_mut(i);
            let Some((peer, after)) = rest.split_first_mut() else {
                break;
            };

            let others: Vec<&Bitfield> =
                before.iter().chain(after.iter()).map(|p| p.bitfield()).collect();
            let available = peer.bitfield().clone();

            self.add_requests(&mut **peer, &available, &others, enqueuer);
        }
    }
}

/// Enqueue `blocks` and count them as outstanding requests of `peer`.
pub(crate) fn send_requests(
    peer: &mut dyn Requester,
    enqueuer: &mut dyn MessageEnqueuer,
    blocks: &[BlockInfo],
) {
    if blocks.is_empty() {
        return;
    }
    enqueuer.enqueue_requests(&*peer, blocks);
    let outstanding = peer.outstanding_requests() + blocks.len();
    peer.set_outstanding_requests(outstanding);
}

/// Enqueue cancellations of `blocks`, which are no longer outstanding.
pub(crate) fn send_cancellations(
    peer: &mut dyn Requester,
    enqueuer: &mut dyn MessageEnqueuer,
    blocks: &[BlockInfo],
) {
    if blocks.is_empty() {
        return;
    }
    enqueuer.enqueue_cancellations(&*peer, blocks);
    let outstanding = peer.outstanding_requests().saturating_sub(blocks.len());
    peer.set_outstanding_requests(outstanding);
}
