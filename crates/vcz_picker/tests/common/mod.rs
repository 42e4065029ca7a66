//! Types shared by the integration tests.
//!
//! The tests drive the pickers and requesters the same way a torrent does:
//! peers are [`Peer`]s, messages end up in a [`Recorder`] instead of a
//! socket.
#![allow(dead_code)]

use std::{cell::RefCell, rc::Rc, sync::Arc};

use vcz_picker::{
    bitfield::Bitfield,
    block::{ActiveRequest, BlockInfo},
    error::Error,
    peer::{Peer, PeerKey, Requester},
    picker::{PiecePicker, ValidatedBlock},
    requester::MessageEnqueuer,
    torrent::TorrentInfo,
};

pub const PIECE_LEN: u32 = 256 * 1024;

/// A torrent of `pieces` pieces of 256KiB.
pub fn torrent(pieces: usize) -> Arc<TorrentInfo> {
    Arc::new(TorrentInfo::single_file(PIECE_LEN, PIECE_LEN as u64 * pieces as u64))
}

/// An unchoked peer that has every piece.
pub fn seeder(key: u32, pieces: usize, max_pending: usize) -> Peer {
    Peer::seeder(key, pieces).unchoked().with_max_pending(max_pending)
}

/// Every message that the requesters wanted to send.
#[derive(Default, Debug)]
pub struct Recorder {
    pub requests: Vec<(PeerKey, BlockInfo)>,
    pub cancellations: Vec<(PeerKey, BlockInfo)>,
}

impl Recorder {
    pub fn pieces(&self) -> Vec<usize> {
        self.requests.iter().map(|(_, b)| b.index).collect()
    }

    /// Requests sent to `peer`, oldest first.
    pub fn requests_of(&self, peer: PeerKey) -> Vec<BlockInfo> {
        self.requests.iter().filter(|(p, _)| *p == peer).map(|(_, b)| *b).collect()
    }
}

impl MessageEnqueuer for Recorder {
    fn enqueue_request(&mut self, peer: &dyn Requester, block: BlockInfo) {
        self.requests.push((peer.key(), block));
    }

    fn enqueue_cancellation(&mut self, peer: &dyn Requester, block: BlockInfo) {
        self.cancellations.push((peer.key(), block));
    }
}

/// Remembers every range that `pick_piece` was called with, and forwards
/// everything to `next`.
pub struct RangeRecorder<P: PiecePicker> {
    pub next: P,
    pub ranges: Rc<RefCell<Vec<(usize, usize)>>>,
}

impl<P: PiecePicker> RangeRecorder<P> {
    pub fn new(next: P) -> (Self, Rc<RefCell<Vec<(usize, usize)>>>) {
        let ranges = Rc::new(RefCell::new(Vec::new()));
        (Self { next, ranges: ranges.clone() }, ranges)
    }
}

impl<P: PiecePicker> PiecePicker for RangeRecorder<P> {
    fn initialise(&mut self, torrent: Arc<TorrentInfo>) {
        self.next.initialise(torrent)
    }

    fn is_interesting(&mut self, peer: &dyn Requester, bitfield: &Bitfield) -> bool {
        self.next.is_interesting(peer, bitfield)
    }

    fn pick_piece(
        &mut self,
        peer: &mut dyn Requester,
        available: &Bitfield,
        others: &[&Bitfield],
        start: usize,
        end: usize,
        requests: &mut [BlockInfo],
    ) -> usize {
        self.ranges.borrow_mut().push((start, end));
        self.next.pick_piece(peer, available, others, start, end, requests)
    }

    fn continue_existing_request(
        &mut self,
        peer: &dyn Requester,
        start: usize,
        end: usize,
    ) -> Option<BlockInfo> {
        self.next.continue_existing_request(peer, start, end)
    }

    fn continue_any_existing_request(
        &mut self,
        peer: &dyn Requester,
        available: &Bitfield,
        start: usize,
        end: usize,
        max_duplicates: usize,
    ) -> Option<BlockInfo> {
        self.next.continue_any_existing_request(peer, available, start, end, max_duplicates)
    }

    fn cancel_requests(
        &mut self,
        peer: &dyn Requester,
        start: usize,
        end: usize,
    ) -> Vec<BlockInfo> {
        self.next.cancel_requests(peer, start, end)
    }

    fn abort_requests(&mut self, peer: &dyn Requester) -> Vec<BlockInfo> {
        self.next.abort_requests(peer)
    }

    fn request_rejected(&mut self, peer: &dyn Requester, request: BlockInfo) -> bool {
        self.next.request_rejected(peer, request)
    }

    fn validate_piece(
        &mut self,
        peer: &mut dyn Requester,
        request: BlockInfo,
    ) -> Result<ValidatedBlock, Error> {
        self.next.validate_piece(peer, request)
    }

    fn current_request_count(&self) -> usize {
        self.next.current_request_count()
    }

    fn current_received_count(&self) -> usize {
        self.next.current_received_count()
    }

    fn export_active_requests(&self) -> Vec<ActiveRequest> {
        self.next.export_active_requests()
    }
}

/// Pick blocks for `peer` from the whole torrent until nothing is left,
/// `batch` blocks at a time.
pub fn drain(
    picker: &mut dyn PiecePicker,
    peer: &mut Peer,
    pieces: usize,
    batch: usize,
) -> Vec<BlockInfo> {
    let available = peer.bitfield.clone();
    let mut buf = vec![BlockInfo::default(); batch];
    let mut picked = Vec::new();

    loop {
        let n = picker.pick_piece(peer, &available, &[], 0, pieces - 1, &mut buf);
        if n == 0 {
            break;
        }
        peer.outstanding += n;
        picked.extend_from_slice(&buf[..n]);
    }

    picked
}
