use std::sync::Arc;

use tracing::debug;

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    block::BlockInfo,
    peer::Requester,
    torrent::{Priority, TorrentInfo},
};

use super::{forward_to_next, PiecePicker};

/// Picks pieces of higher priority files first. Files marked
/// [`Priority::DoNotDownload`] are never picked, unless they share a piece
/// with a file that is downloaded.
pub struct PriorityPicker {
    next: Box<dyn PiecePicker>,
    torrent: Option<Arc<TorrentInfo>>,
    /// `(file index, priority)`, highest priority first.
    files: Vec<(usize, Priority)>,
    /// One bitfield per distinct priority, highest first. A piece shared by
    /// files of different priorities only shows up in the highest one.
    prioritised: Vec<Bitfield>,
    /// Union of `prioritised`.
    all_prioritised: Bitfield,
    temp: Bitfield,
}

impl PriorityPicker {
    pub fn new(next: Box<dyn PiecePicker>) -> Self {
        Self {
            next,
            torrent: None,
            files: Vec::new(),
            prioritised: Vec::new(),
            all_prioritised: Bitfield::new(),
            temp: Bitfield::new(),
        }
    }

    /// Every file has the same priority, there is nothing to filter.
    fn is_uniform(&self) -> bool {
        self.files.windows(2).all(|w| w[0].1 == w[1].1)
    }

    /// Nothing is going to be downloaded.
    fn is_disabled(&self) -> bool {
        self.files.first().is_some_and(|(_, p)| *p == Priority::DoNotDownload)
    }

    /// Take a new snapshot of the priorities of the files if any of them
    /// changed since the last one.
    fn refresh(&mut self) {
        let Some(torrent) = self.torrent.clone() else {
            return;
        };

        let changed = self.files.len() != torrent.files.len()
            || self
                .files
                .iter()
                .any(|(i, priority)| torrent.files[*i].priority() != *priority);

        if changed {
            self.rebuild(&torrent);
        }
    }

    fn rebuild(&mut self, torrent: &TorrentInfo) {
        self.files = torrent
            .files
            .iter()
            .enumerate()
            .map(|(i, file)| (i, file.priority()))
            .collect();
        // stable, so files of the same priority keep their order
        self.files.sort_by(|a, b| b.1.cmp(&a.1));

        self.prioritised.clear();
        self.all_prioritised.set_all_bits(false);

        if self.is_uniform() {
            return;
        }

        let pieces = torrent.pieces_count();
        let mut previous = None;

        for &(i, priority) in &self.files {
            if priority == Priority::DoNotDownload {
                break;
            }
            if previous != Some(priority) {
                self.prioritised.push(Bitfield::from_piece(pieces));
                previous = Some(priority);
            }

            let file = &torrent.files[i];
            if file.length == 0 {
                continue;
            }
            if let Some(current) = self.prioritised.last_mut() {
                current.set_true(file.start_piece..=file.end_piece);
            }
        }

        // shared pieces go to the highest priority
        for bitfield in self.prioritised.iter_mut() {
            bitfield.nand_with(&self.all_prioritised);
            self.all_prioritised.or_with(bitfield);
        }

        debug!(
            "rebuilt {} priority buckets for {} files",
            self.prioritised.len(),
            self.files.len()
        );
    }
}

impl PiecePicker for PriorityPicker {
    forward_to_next!(
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
        let pieces = torrent.pieces_count();
        self.all_prioritised = Bitfield::from_piece(pieces);
        self.temp = Bitfield::from_piece(pieces);
        self.rebuild(&torrent);
        self.torrent = Some(torrent.clone());
        self.next.initialise(torrent);
    }

    fn is_interesting(&mut self, peer: &dyn Requester, bitfield: &Bitfield) -> bool {
        self.refresh();

        if self.is_disabled() {
            return false;
        }
        if self.is_uniform() {
            return self.next.is_interesting(peer, bitfield);
        }

        self.temp.copy_bits_from(&self.all_prioritised).and_with(bitfield);
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
        if available.all_false() {
            return 0;
        }

        self.refresh();

        if self.is_disabled() {
            return 0;
        }
        if self.is_uniform() {
            return self.next.pick_piece(peer, available, others, start, end, requests);
        }

        for i in 0..self.prioritised.len() {
            self.temp.copy_bits_from(&self.prioritised[i]).and_with(available);
            if self.temp.all_false() {
                continue;
            }

            let picked =
                self.next.pick_piece(peer, &self.temp, others, start, end, requests);
            if picked > 0 {
                return picked;
            }
        }

        0
    }
}
