use std::sync::Arc;

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    block::BlockInfo,
    peer::Requester,
    torrent::TorrentInfo,
};

use super::{forward_to_next, PiecePicker};

/// Picks the pieces that the fewest other peers have first.
///
/// Instead of counting how many peers have each piece, it builds a stack
/// of bitfields: the bottom one is everything the peer has, and every
/// bitfield above it removes the pieces of one more peer. The top of the
/// stack is the rarest set of pieces that is not empty.
pub struct RarestFirstPicker {
    next: Box<dyn PiecePicker>,
    pieces: usize,
    rarest: Vec<Bitfield>,
    spares: Vec<Bitfield>,
}

impl RarestFirstPicker {
    pub fn new(next: Box<dyn PiecePicker>) -> Self {
        Self { next, pieces: 0, rarest: Vec::new(), spares: Vec::new() }
    }

    fn spare(&mut self) -> Bitfield {
        self.spares.pop().unwrap_or_else(|| Bitfield::from_piece(self.pieces))
    }

    fn generate_rarest_first(&mut self, available: &Bitfield, others: &[&Bitfield]) {
        self.spares.append(&mut self.rarest);

        let mut current = self.spare();
        current.copy_bits_from(available);
        self.rarest.push(current);

        for other in others {
            // seeders have every piece, they don't make anything rarer
            if other.all_true() {
                continue;
            }

            let mut next = self.spare();
            if let Some(last) = self.rarest.last() {
                next.copy_bits_from(last);
            }
            next.nand_with(other);

            if next.all_false() {
                self.spares.push(next);
                break;
            }
            self.rarest.push(next);
        }
    }
}

impl PiecePicker for RarestFirstPicker {
    forward_to_next!(
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

    fn initialise(&mut self, torrent: Arc<TorrentInfo>) {
        self.pieces = torrent.pieces_count();
        self.rarest.clear();
        self.spares.clear();
        self.next.initialise(torrent);
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
        if available.all_false() {
            return 0;
        }

        self.generate_rarest_first(available, others);

        while let Some(candidates) = self.rarest.pop() {
            let picked =
                self.next.pick_piece(peer, &candidates, others, start, end, requests);
            self.spares.push(candidates);

            if picked > 0 {
                self.spares.append(&mut self.rarest);
                return picked;
            }
        }

        0
    }
}
