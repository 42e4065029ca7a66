use std::sync::Arc;

use rand::rngs::StdRng;
use tracing::{debug, warn};

use crate::{
    bitfield::{Bitfield, SharedBitfield},
    block::BlockInfo,
    peer::Requester,
    picker::{
        IgnoringPicker, PiecePicker, PriorityPicker, RandomisedPicker, RarestFirstPicker,
        StandardPicker,
    },
    torrent::TorrentInfo,
};

use super::{send_requests, MessageEnqueuer, PieceRequester, RequesterSettings};

/// Downloads the whole torrent, in no particular order.
pub struct StandardRequester {
    settings: RequesterSettings,
    /// Seed of the randomised picker, entropy if `None`.
    rng: Option<StdRng>,
    torrent: Option<Arc<TorrentInfo>>,
    picker: Option<Box<dyn PiecePicker>>,
    in_endgame: bool,
    buffer: Vec<BlockInfo>,
}

impl StandardRequester {
    pub fn new(settings: RequesterSettings) -> Self {
        Self {
            settings,
            rng: None,
            torrent: None,
            picker: None,
            in_endgame: false,
            buffer: Vec::new(),
        }
    }

    /// Use `rng` to randomise picks, for reproducible runs.
    pub fn with_rng(settings: RequesterSettings, rng: StdRng) -> Self {
        Self { rng: Some(rng), ..Self::new(settings) }
    }

    pub fn settings(&self) -> RequesterSettings {
        self.settings
    }
}

impl PieceRequester for StandardRequester {
    fn initialise(&mut self, torrent: Arc<TorrentInfo>, ignoring: &[SharedBitfield]) {
        let mut picker: Box<dyn PiecePicker> = Box::new(StandardPicker::new());

        if self.settings.allow_randomised {
            picker = Box::new(match self.rng.clone() {
                Some(rng) => RandomisedPicker::with_rng(picker, rng),
                None => RandomisedPicker::new(picker),
            });
        }
        if self.settings.allow_rarest_first {
            picker = Box::new(RarestFirstPicker::new(picker));
        }
        if self.settings.allow_prioritisation {
            picker = Box::new(PriorityPicker::new(picker));
        }

        let mut picker = IgnoringPicker::wrap(picker, ignoring);
        picker.initialise(torrent.clone());

        debug!(
            "standard requester for {} pieces, {:?}",
            torrent.pieces_count(),
            self.settings
        );

        self.picker = Some(picker);
        self.torrent = Some(torrent);
        self.in_endgame = false;
    }

    fn picker(&mut self) -> &mut dyn PiecePicker {
        match self.picker.as_deref_mut() {
            Some(picker) => picker,
            None => panic!("the requester must be initialised before it is used"),
        }
    }

    fn in_endgame(&self) -> bool {
        self.in_endgame
    }

    #[tracing::instrument(skip_all, fields(peer = %peer.key()))]
    fn add_requests(
        &mut self,
        peer: &mut dyn Requester,
        available: &Bitfield,
        others: &[&Bitfield],
        enqueuer: &mut dyn MessageEnqueuer,
    ) {
        let (Some(picker), Some(torrent)) = (self.picker.as_mut(), self.torrent.as_ref())
        else {
            warn!("requests were added before the requester was initialised");
            return;
        };

        if !peer.can_request_more_pieces() {
            return;
        }

        let Some(last) = torrent.pieces_count().checked_sub(1) else {
            return;
        };
        let max = peer.max_pending_requests();
        let choking = peer.is_choking();
        let fast = peer.supports_fast_peer();

        // first finish the pieces that this peer is already working on
        if !choking || fast {
            while peer.outstanding_requests() < max {
                let Some(block) = picker.continue_existing_request(peer, 0, last) else {
                    break;
                };
                send_requests(peer, enqueuer, &[block]);
            }
        }

        if !choking || (fast && !peer.allowed_fast_pieces().is_empty()) {
            let amount = peer.preferred_request_amount(torrent.piece_length);
            self.buffer.resize(amount, BlockInfo::default());

            while peer.outstanding_requests() < max {
                let room = (max - peer.outstanding_requests()).min(amount);
                let buffer = &mut self.buffer[..room];

                let picked = picker.pick_piece(peer, available, others, 0, last, buffer);
                if picked == 0 {
                    break;
                }
                send_requests(peer, enqueuer, &self.buffer[..picked]);
            }
        }

        // nothing new to download from this peer, help with the pieces of
        // the other peers, duplicating blocks once we are close to the end
        if !choking && peer.outstanding_requests() == 0 {
            while peer.outstanding_requests() < max {
                let helped =
                    picker.continue_any_existing_request(peer, available, 0, last, 1);
                let block = match helped {
                    Some(block) => block,
                    None if self.in_endgame || peer.is_seeder() => {
                        let Some(block) =
                            picker.continue_any_existing_request(peer, available, 0, last, 2)
                        else {
                            break;
                        };
                        if !self.in_endgame {
                            debug!("entering endgame");
                            self.in_endgame = true;
                        }
                        block
                    }
                    None => break,
                };
                send_requests(peer, enqueuer, &[block]);
            }
        }
    }
}
