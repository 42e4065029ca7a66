use std::sync::Arc;

use crate::{
    bitfield::{Bitfield, BitfieldExt, SharedBitfield},
    block::BlockInfo,
    peer::Requester,
    torrent::TorrentInfo,
};

use super::{forward_to_next, PiecePicker};

/// Hides a set of pieces from the pickers below it, i.e. the pieces that we
/// already have, or pieces that are being hashed.
pub struct IgnoringPicker {
    next: Box<dyn PiecePicker>,
    ignored: SharedBitfield,
    temp: Bitfield,
}

impl IgnoringPicker {
    pub fn new(next: Box<dyn PiecePicker>, ignored: SharedBitfield) -> Self {
        Self { next, ignored, temp: Bitfield::new() }
    }

    /// Wrap `picker` with one filter per bitfield, the last bitfield is
    /// the outermost filter.
    pub fn wrap(
        picker: Box<dyn PiecePicker>,
        ignoring: &[SharedBitfield],
    ) -> Box<dyn PiecePicker> {
        ignoring.iter().fold(picker, |picker, ignored| {
            Box::new(Self::new(picker, ignored.clone()))
        })
    }

    /// Write `bitfield` minus the ignored pieces into `temp`. Returns false
    /// when nothing is ignored, and `bitfield` can be used as it is.
    fn mask(&mut self, bitfield: &Bitfield) -> bool {
        let ignored = self.ignored.borrow();
        if ignored.all_false() {
            return false;
        }
        self.temp.copy_bits_from(bitfield).nand_with(&ignored);
        true
    }
}

impl PiecePicker for IgnoringPicker {
    forward_to_next!(
        continue_existing_request,
        cancel_requests,
        abort_requests,
        request_rejected,
        validate_piece,
        current_request_count,
        current_received_count,
        export_active_requests,
    );

    fn initialise(&mut self, torrent: Arc<TorrentInfo>) {
        self.temp = Bitfield::from_piece(torrent.pieces_count());
        self.next.initialise(torrent);
    }

    fn is_interesting(&mut self, peer: &dyn Requester, bitfield: &Bitfield) -> bool {
        if !self.mask(bitfield) {
            return self.next.is_interesting(peer, bitfield);
        }
        !self.temp.all_false() && self.next.is_interesting(peer, &self.temp)
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
        if !self.mask(available) {
            return self.next.pick_piece(peer, available, others, start, end, requests);
        }
        if self.temp.all_false() {
            return 0;
        }
        self.next.pick_piece(peer, &self.temp, others, start, end, requests)
    }

    fn continue_any_existing_request(
        &mut self,
        peer: &dyn Requester,
        available: &Bitfield,
        start: usize,
        end: usize,
        max_duplicates: usize,
    ) -> Option<BlockInfo> {
        if !self.mask(available) {
            return self.next.continue_any_existing_request(
                peer,
                available,
                start,
                end,
                max_duplicates,
            );
        }
        if self.temp.all_false() {
            return None;
        }
        self.next.continue_any_existing_request(
            peer,
            &self.temp,
            start,
            end,
            max_duplicates,
        )
    }
}
