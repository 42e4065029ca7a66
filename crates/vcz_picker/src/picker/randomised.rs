use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    block::BlockInfo,
    peer::Requester,
};

use super::{forward_to_next, PiecePicker};

/// Starts picking from a random point of the range, so that peers
/// don't all download the same pieces in the same order.
pub struct RandomisedPicker {
    next: Box<dyn PiecePicker>,
    rng: StdRng,
}

impl RandomisedPicker {
    pub fn new(next: Box<dyn PiecePicker>) -> Self {
        Self::with_rng(next, StdRng::from_entropy())
    }

    pub fn with_rng(next: Box<dyn PiecePicker>, rng: StdRng) -> Self {
        Self { next, rng }
    }
}

impl PiecePicker for RandomisedPicker {
    forward_to_next!(
        initialise,
        is_interesting,
        continue_existing_request,
        continue_any_existing_request,
        cancel_requests,
        abort_requests,
        request_rejected,
        validate_piece,
        current_request_count,
        current_received_count,
        export_active_requests,
    );

    fn pick_piece(
        &mut self,
        peer: &mut dyn Requester,
        available: &Bitfield,
        others: &[&Bitfield],
        start: usize,
        end: usize,
        requests: &mut [BlockInfo],
    ) -> usize {
        if available.all_false() {
            return 0;
        }

        // a batch of requests wants contiguous pieces, and a tiny range
        // has nothing to randomise
        if requests.len() > 1 || start > end || end - start < 2 {
            return self.next.pick_piece(peer, available, others, start, end, requests);
        }

        let midpoint = self.rng.gen_range(start + 1..end);

        let picked =
            self.next.pick_piece(peer, available, others, midpoint, end, requests);
        if picked > 0 {
            return picked;
        }

        self.next.pick_piece(peer, available, others, start, midpoint - 1, requests)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc, sync::Arc};

    use super::*;
    use crate::{
        block::{ActiveRequest, BLOCK_LEN},
        error::Error,
        peer::Peer,
        picker::{StandardPicker, ValidatedBlock},
        torrent::TorrentInfo,
    };

    /// Remembers the ranges it was asked to pick from, and never picks.
    struct Recorder {
        ranges: Rc<RefCell<Vec<(usize, usize)>>>,
    }

    impl PiecePicker for Recorder {
        fn initialise(&mut self, _: Arc<TorrentInfo>) {}

        fn is_interesting(&mut self, _: &dyn Requester, _: &Bitfield) -> bool {
            true
        }

        fn pick_piece(
            &mut self,
            _: &mut dyn Requester,
            _: &Bitfield,
            _: &[&Bitfield],
            start: usize,
            end: usize,
            _: &mut [BlockInfo],
        ) -> usize {
            self.ranges.borrow_mut().push((start, end));
            0
        }

        fn continue_existing_request(
            &mut self,
            _: &dyn Requester,
            _: usize,
            _: usize,
        ) -> Option<BlockInfo> {
            None
        }

        fn continue_any_existing_request(
            &mut self,
            _: &dyn Requester,
            _: &Bitfield,
            _: usize,
            _: usize,
            _: usize,
        ) -> Option<BlockInfo> {
            None
        }

        fn cancel_requests(&mut self, _: &dyn Requester, _: usize, _: usize) -> Vec<BlockInfo> {
            Vec::new()
        }

        fn abort_requests(&mut self, _: &dyn Requester) -> Vec<BlockInfo> {
            Vec::new()
        }

        fn request_rejected(&mut self, _: &dyn Requester, _: BlockInfo) -> bool {
            false
        }

        fn validate_piece(
            &mut self,
            _: &mut dyn Requester,
            request: BlockInfo,
        ) -> Result<ValidatedBlock, Error> {
            Err(Error::PieceNotRequested(request.index))
        }

        fn current_request_count(&self) -> usize {
            0
        }

        fn current_received_count(&self) -> usize {
            0
        }

        fn export_active_requests(&self) -> Vec<ActiveRequest> {
            Vec::new()
        }
    }

    fn recorder() -> (Box<dyn PiecePicker>, Rc<RefCell<Vec<(usize, usize)>>>) {
        let ranges = Rc::new(RefCell::new(Vec::new()));
        (Box::new(Recorder { ranges: ranges.clone() }), ranges)
    }

    #[test]
    fn splits_range_at_random_midpoint() {
        let (next, ranges) = recorder();
        let mut picker = RandomisedPicker::with_rng(next, StdRng::seed_from_u64(7));
        let mut peer = Peer::new(1, 40).unchoked();
        peer.have(20);
        let available = peer.bitfield.clone();
        let mut buf = [BlockInfo::default(); 1];

        assert_eq!(picker.pick_piece(&mut peer, &available, &[], 0, 39, &mut buf), 0);

        let midpoint = StdRng::seed_from_u64(7).gen_range(1..39);
        assert_eq!(*ranges.borrow(), vec![(midpoint, 39), (0, midpoint - 1)]);
    }

    #[test]
    fn passes_through() {
        let (next, ranges) = recorder();
        let mut picker = RandomisedPicker::with_rng(next, StdRng::seed_from_u64(1));
        let mut peer = Peer::seeder(1, 40).unchoked();
        let available = peer.bitfield.clone();

        // more than one request
        let mut buf = [BlockInfo::default(); 2];
        picker.pick_piece(&mut peer, &available, &[], 0, 39, &mut buf);
        // range too small
        let mut buf = [BlockInfo::default(); 1];
        picker.pick_piece(&mut peer, &available, &[], 5, 6, &mut buf);
        assert_eq!(*ranges.borrow(), vec![(0, 39), (5, 6)]);

        // nothing available, nothing to forward
        let empty = Bitfield::from_piece(40);
        picker.pick_piece(&mut peer, &empty, &[], 0, 39, &mut buf);
        assert_eq!(ranges.borrow().len(), 2);
    }

    #[test]
    fn falls_back_to_lower_half() {
        let mut next = StandardPicker::new();
        next.initialise(Arc::new(TorrentInfo::single_file(BLOCK_LEN, BLOCK_LEN as u64 * 40)));
        let mut picker = RandomisedPicker::with_rng(Box::new(next), StdRng::seed_from_u64(3));

        let mut peer = Peer::new(1, 40).unchoked();
        peer.have(0);
        let available = peer.bitfield.clone();
        let mut buf = [BlockInfo::default(); 1];

        assert_eq!(picker.pick_piece(&mut peer, &available, &[], 0, 39, &mut buf), 1);
        assert_eq!(buf[0].index, 0);
    }
}
