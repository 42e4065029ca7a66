//! Download a file in the order it is read, i.e. by a video player.
//!
//! The pieces right after the read position are the "high priority"
//! window, they are requested first and from more than one peer. After
//! them comes a larger "low priority" window, and only then the rest of
//! the torrent.
use std::sync::Arc;

use hashbrown::HashMap;
use rand::rngs::StdRng;
use tracing::{debug, warn};

use crate::{
    bitfield::{Bitfield, SharedBitfield},
    block::BlockInfo,
    config::StreamingSettings,
    peer::{PeerKey, Requester},
    picker::{
        IgnoringPicker, PiecePicker, PriorityPicker, RandomisedPicker, RarestFirstPicker,
        SharedPicker, StandardPicker,
    },
    torrent::TorrentInfo,
};

use super::{send_cancellations, send_requests, MessageEnqueuer, PieceRequester};

/// The most requests a peer may have for pieces outside of both windows.
const MAX_REMAINDER_REQUESTS: usize = 2;

struct Pickers {
    /// The picker that owns the requests, shared by the other two.
    core: Box<dyn PiecePicker>,
    high: Box<dyn PiecePicker>,
    low: Box<dyn PiecePicker>,
}

pub struct StreamingRequester {
    settings: StreamingSettings,
    rng: Option<StdRng>,
    torrent: Option<Arc<TorrentInfo>>,
    pickers: Option<Pickers>,
    high_priority_index: usize,
    /// Bumped on every seek that moved the high priority index.
    seeks: u64,
    /// The last seek that each peer's requests were trimmed for.
    refreshed: HashMap<PeerKey, u64>,
    buffer: Vec<BlockInfo>,
}

impl StreamingRequester {
    pub fn new(settings: StreamingSettings) -> Self {
        Self {
            settings,
            rng: None,
            torrent: None,
            pickers: None,
            high_priority_index: 0,
            seeks: 0,
            refreshed: HashMap::new(),
            buffer: Vec::new(),
        }
    }

    /// Use `rng` to randomise picks of the low priority window.
    pub fn with_rng(settings: StreamingSettings, rng: StdRng) -> Self {
        Self { rng: Some(rng), ..Self::new(settings) }
    }

    pub fn high_priority_index(&self) -> usize {
        self.high_priority_index
    }

    pub fn high_priority_count(&self) -> usize {
        self.settings.high_priority_count
    }

    pub fn set_high_priority_count(&mut self, count: usize) {
        self.settings.high_priority_count = count.max(1);
    }

    fn piece_index(&self, file: usize, position: u64) -> Option<usize> {
        let torrent = self.torrent.as_ref()?;
        let file = torrent.files.get(file)?;
        let index = torrent.byte_offset_to_piece_index(file.offset + position);
        Some(index.min(file.end_piece))
    }

    /// The reader jumped to `position` of the file `file`. Requests of
    /// every peer outside of the new high priority window are cancelled,
    /// before new requests are added for that peer.
    pub fn seek_to_position(&mut self, file: usize, position: u64) {
        let Some(index) = self.piece_index(file, position) else {
            warn!("seek to unknown file {file}");
            return;
        };
        if index != self.high_priority_index {
            debug!("seek to piece {index}");
            self.high_priority_index = index;
            self.seeks += 1;
        }
    }

    /// The reader moved forward to `position` of the file `file`. Requests
    /// that were already sent are kept.
    pub fn read_to_position(&mut self, file: usize, position: u64) {
        if let Some(index) = self.piece_index(file, position) {
            self.high_priority_index = index;
        }
    }

    /// The last piece of the high priority window.
    fn high_priority_end(&self, last: usize) -> usize {
        let count = self.settings.high_priority_count.max(1);
        (self.high_priority_index + count - 1).min(last)
    }
}

/// Request from `peer` pieces of `start..=end` until it has
/// `max_requests` outstanding requests.
#[allow(clippy::too_many_arguments)]
fn fetch(
    picker: &mut dyn PiecePicker,
    peer: &mut dyn Requester,
    available: &Bitfield,
    others: &[&Bitfield],
    start: usize,
    end: usize,
    max_duplicates: usize,
    max_requests: usize,
    buffer: &mut [BlockInfo],
    enqueuer: &mut dyn MessageEnqueuer,
) {
    if start > end || buffer.is_empty() {
        return;
    }

    while peer.outstanding_requests() < max_requests {
        if let Some(block) = picker.continue_existing_request(peer, start, end) {
            send_requests(peer, enqueuer, &[block]);
            continue;
        }

        let room = (max_requests - peer.outstanding_requests()).min(buffer.len());
        let picked =
            picker.pick_piece(peer, available, others, start, end, &mut buffer[..room]);
        if picked > 0 {
            send_requests(peer, enqueuer, &buffer[..picked]);
            continue;
        }

        if max_duplicates > 1 && !peer.is_choking() {
            if let Some(block) = picker.continue_any_existing_request(
                peer,
                available,
                start,
                end,
                max_duplicates,
            ) {
                send_requests(peer, enqueuer, &[block]);
                continue;
            }
        }

        break;
    }
}

impl PieceRequester for StreamingRequester {
    fn initialise(&mut self, torrent: Arc<TorrentInfo>, ignoring: &[SharedBitfield]) {
        let shared = SharedPicker::new(StandardPicker::new());

        let randomised: Box<dyn PiecePicker> = match self.rng.clone() {
            Some(rng) => Box::new(RandomisedPicker::with_rng(Box::new(shared.clone()), rng)),
            None => Box::new(RandomisedPicker::new(Box::new(shared.clone()))),
        };
        let low = PriorityPicker::new(Box::new(RarestFirstPicker::new(randomised)));
        let mut low = IgnoringPicker::wrap(Box::new(low), ignoring);

        let high = PriorityPicker::new(Box::new(shared.clone()));
        let mut high = IgnoringPicker::wrap(Box::new(high), ignoring);

        high.initialise(torrent.clone());
        low.initialise(torrent.clone());

        debug!(
            "streaming requester for {} pieces, window of {}",
            torrent.pieces_count(),
            self.settings.high_priority_count
        );

        self.pickers = Some(Pickers { core: Box::new(shared), high, low });
        self.torrent = Some(torrent);
        self.high_priority_index = 0;
        self.seeks = 0;
        self.refreshed.clear();
    }

    fn picker(&mut self) -> &mut dyn PiecePicker {
        match self.pickers.as_mut() {
            Some(pickers) => pickers.core.as_mut(),
            None => panic!("the requester must be initialised before it is used"),
        }
    }

    fn in_endgame(&self) -> bool {
        false
    }

    fn abort_requests(&mut self, peer: &dyn Requester) -> Vec<BlockInfo> {
        self.refreshed.remove(&peer.key());
        self.picker().abort_requests(peer)
    }

    #[tracing::instrument(skip_all, fields(peer = %peer.key()))]
    fn add_requests(
        &mut self,
        peer: &mut dyn Requester,
        available: &Bitfield,
        others: &[&Bitfield],
        enqueuer: &mut dyn MessageEnqueuer,
    ) {
        let Some(torrent) = self.torrent.clone() else {
            warn!("requests were added before the requester was initialised");
            return;
        };

        let Some(last) = torrent.pieces_count().checked_sub(1) else {
            return;
        };
        let hp = self.high_priority_index.min(last);
        let high_end = self.high_priority_end(last);
        let low_count =
            self.settings.high_priority_count.max(1) * self.settings.low_priority_multiplier;
        let low_end = (high_end + low_count).min(last);
        let seeks = self.seeks;

        let Some(pickers) = self.pickers.as_mut() else {
            return;
        };

        // drop what this peer was downloading before the last seek
        let key = peer.key();
        if self.refreshed.get(&key).copied().unwrap_or(0) != seeks {
            self.refreshed.insert(key, seeks);

            let mut cancelled = Vec::new();
            if hp > 0 {
                cancelled.extend(pickers.core.cancel_requests(peer, 0, hp - 1));
            }
            if high_end < last {
                cancelled.extend(pickers.core.cancel_requests(peer, high_end + 1, last));
            }
            if !cancelled.is_empty() {
                debug!("cancelling {} requests outside of the window", cancelled.len());
            }
            send_cancellations(peer, enqueuer, &cancelled);
        }

        if !peer.can_request_more_pieces() || (peer.is_choking() && !peer.supports_fast_peer())
        {
            return;
        }

        let max = peer.max_pending_requests();
        let amount = peer.preferred_request_amount(torrent.piece_length);
        self.buffer.resize(amount, BlockInfo::default());
        let buffer = &mut self.buffer[..];

        // the next two pieces are needed right now, ask more than one peer
        let critical_end = (hp + 1).min(high_end);
        fetch(
            pickers.high.as_mut(),
            peer,
            available,
            others,
            hp,
            critical_end,
            2,
            max,
            buffer,
            enqueuer,
        );
        fetch(
            pickers.high.as_mut(),
            peer,
            available,
            others,
            hp,
            high_end,
            1,
            max,
            buffer,
            enqueuer,
        );

        if high_end < last {
            fetch(
                pickers.low.as_mut(),
                peer,
                available,
                others,
                high_end + 1,
                low_end,
                1,
                max,
                buffer,
                enqueuer,
            );
        }

        fetch(
            pickers.low.as_mut(),
            peer,
            available,
            others,
            0,
            last,
            1,
            max.min(MAX_REMAINDER_REQUESTS),
            buffer,
            enqueuer,
        );
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::{
        block::BLOCK_LEN,
        peer::Peer,
    };

    #[derive(Default)]
    struct Recorder {
        requests: Vec<(PeerKey, BlockInfo)>,
        cancellations: Vec<(PeerKey, BlockInfo)>,
    }

    impl MessageEnqueuer for Recorder {
        fn enqueue_request(&mut self, peer: &dyn Requester, block: BlockInfo) {
            self.requests.push((peer.key(), block));
        }

        fn enqueue_cancellation(&mut self, peer: &dyn Requester, block: BlockInfo) {
            self.cancellations.push((peer.key(), block));
        }
    }

    /// 20 pieces of 4 blocks, two files of 10 pieces.
    fn requester(count: usize) -> StreamingRequester {
        let settings = StreamingSettings { high_priority_count: count, low_priority_multiplier: 2 };
        let mut requester = StreamingRequester::with_rng(settings, StdRng::seed_from_u64(0));
        let len = BLOCK_LEN as u64 * 4 * 10;
        requester.initialise(
            Arc::new(TorrentInfo::new(BLOCK_LEN * 4, &[("a", len), ("b", len)])),
            &[],
        );
        requester
    }

    fn pieces(recorder: &Recorder) -> Vec<usize> {
        recorder.requests.iter().map(|(_, b)| b.index).collect()
    }

    #[test]
    fn window_first() {
        let mut requester = requester(3);
        requester.read_to_position(1, BLOCK_LEN as u64 * 4 * 2);
        assert_eq!(requester.high_priority_index(), 12);

        let mut peer = Peer::seeder(1, 20).unchoked().with_max_pending(16);
        let available = peer.bitfield.clone();
        let mut recorder = Recorder::default();

        requester.add_requests(&mut peer, &available, &[], &mut recorder);
        assert_eq!(peer.outstanding, 16);
        // the 3 pieces of the window, then the low priority window
        let pieces = pieces(&recorder);
        assert!(pieces[..12].iter().all(|i| (12..=14).contains(i)));
        assert!(pieces[12..].iter().all(|i| (15..=19).contains(i)));
    }

    #[test]
    fn critical_pieces_are_duplicated() {
        let mut requester = requester(3);
        let mut a = Peer::seeder(1, 20).unchoked().with_max_pending(8);
        let mut b = Peer::seeder(2, 20).unchoked().with_max_pending(4);
        let available = a.bitfield.clone();
        let mut recorder = Recorder::default();

        // a takes pieces 0 and 1
        requester.add_requests(&mut a, &available, &[], &mut recorder);
        assert_eq!(pieces(&recorder), vec![0, 0, 0, 0, 1, 1, 1, 1]);

        // b duplicates piece 0 instead of starting piece 2
        let mut recorder = Recorder::default();
        requester.add_requests(&mut b, &available, &[], &mut recorder);
        assert_eq!(pieces(&recorder), vec![0, 0, 0, 0]);
        assert_eq!(requester.picker().current_request_count(), 12);
    }

    #[test]
    fn remainder_is_capped() {
        let mut requester = requester(2);
        let mut peer = Peer::new(1, 20).unchoked().with_max_pending(10);
        peer.have(19);
        let available = peer.bitfield.clone();
        let mut recorder = Recorder::default();

        // nothing of either window is available
        requester.add_requests(&mut peer, &available, &[], &mut recorder);
        assert_eq!(pieces(&recorder), vec![19, 19]);
        assert_eq!(peer.outstanding, 2);

        requester.add_requests(&mut peer, &available, &[], &mut recorder);
        assert_eq!(recorder.requests.len(), 2);
    }

    #[test]
    fn seek_cancels_outside_window() {
        let mut requester = requester(2);
        let mut peer = Peer::seeder(1, 20).unchoked().with_max_pending(8);
        let available = peer.bitfield.clone();
        let mut recorder = Recorder::default();

        requester.add_requests(&mut peer, &available, &[], &mut recorder);
        assert_eq!(peer.outstanding, 8);

        // reading forward keeps the requests
        requester.read_to_position(0, BLOCK_LEN as u64 * 4);
        requester.add_requests(&mut peer, &available, &[], &mut recorder);
        assert!(recorder.cancellations.is_empty());

        requester.seek_to_position(0, BLOCK_LEN as u64 * 4 * 6);
        assert_eq!(requester.high_priority_index(), 6);

        let mut recorder = Recorder::default();
        requester.add_requests(&mut peer, &available, &[], &mut recorder);
        assert_eq!(recorder.cancellations.len(), 8);
        assert!(recorder.cancellations.iter().all(|(_, b)| b.index < 2));
        assert_eq!(pieces(&recorder), vec![6, 6, 6, 6, 7, 7, 7, 7]);
        assert_eq!(peer.outstanding, 8);

        // seeking to the same piece does not cancel anything
        requester.seek_to_position(0, BLOCK_LEN as u64 * 4 * 6 + 10);
        let mut recorder = Recorder::default();
        requester.add_requests(&mut peer, &available, &[], &mut recorder);
        assert!(recorder.cancellations.is_empty());
    }

    #[test]
    fn aborted_peer_is_forgotten() {
        let mut requester = requester(2);
        let mut peer = Peer::seeder(1, 20).unchoked().with_max_pending(4);
        let available = peer.bitfield.clone();
        let mut recorder = Recorder::default();

        requester.seek_to_position(0, BLOCK_LEN as u64 * 4 * 3);
        requester.add_requests(&mut peer, &available, &[], &mut recorder);
        assert!(requester.refreshed.contains_key(&PeerKey(1)));

        let aborted = requester.abort_requests(&peer);
        assert_eq!(aborted.len(), 4);
        assert!(requester.refreshed.is_empty());
        assert_eq!(requester.picker().current_request_count(), 0);
    }

    #[test]
    fn empty_torrent_has_nothing_to_request() {
        let mut requester = StreamingRequester::new(StreamingSettings::default());
        requester.initialise(Arc::new(TorrentInfo::single_file(BLOCK_LEN, 0)), &[]);
        let mut peer = Peer::seeder(1, 0).unchoked();
        let available = peer.bitfield.clone();
        let mut recorder = Recorder::default();

        requester.add_requests(&mut peer, &available, &[], &mut recorder);
        assert!(recorder.requests.is_empty());
    }

    #[test]
    fn position_is_clamped_to_file() {
        let mut requester = requester(2);
        requester.seek_to_position(0, u32::MAX as u64);
        assert_eq!(requester.high_priority_index(), 9);

        requester.seek_to_position(5, 0);
        assert_eq!(requester.high_priority_index(), 9);
    }
}
