//! A swarm of fake peers that answer the requests of a [`PieceRequester`].
//!
//! Every round, leechers may choke or unchoke us, the requester fills the
//! pipeline of every peer, and then peers answer some of their pending
//! requests, either with the block or with a reject.
use std::{cell::RefCell, rc::Rc, sync::Arc};

use hashbrown::HashMap;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use tracing::{debug, info, warn};
use vcz_picker::{
    bitfield::{Bitfield, BitfieldExt, SharedBitfield},
    block::{BlockInfo, BLOCK_LEN},
    config::SwarmSettings,
    peer::{Peer, PeerKey, Requester},
    requester::{MessageEnqueuer, PieceRequester, StandardRequester, StreamingRequester},
    torrent::TorrentInfo,
};

use crate::error::Error;

/// Chance of a choked leecher unchoking us, every round.
const UNCHOKE_RATE: f64 = 0.3;
/// Chance of an unchoked leecher choking us, every round.
const CHOKE_RATE: f64 = 0.02;

pub enum Strategy {
    Standard(StandardRequester),
    Streaming(StreamingRequester),
}

impl Strategy {
    fn requester(&mut self) -> &mut dyn PieceRequester {
        match self {
            Strategy::Standard(r) => r,
            Strategy::Streaming(r) => r,
        }
    }
}

/// The wire between us and the swarm. Requests wait here until the peer
/// answers them.
#[derive(Default)]
struct Wire {
    pending: Vec<(PeerKey, BlockInfo)>,
    sent: usize,
    cancelled: usize,
}

impl MessageEnqueuer for Wire {
    fn enqueue_request(&mut self, peer: &dyn Requester, block: BlockInfo) {
        self.sent += 1;
        self.pending.push((peer.key(), block));
    }

    fn enqueue_cancellation(&mut self, peer: &dyn Requester, block: BlockInfo) {
        let key = peer.key();
        self.cancelled += 1;
        self.pending.retain(|r| *r != (key, block));
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Report {
    pub rounds: usize,
    pub pieces: usize,
    pub requests: usize,
    pub cancelled: usize,
    pub rejected: usize,
    /// Blocks that the picker refused, i.e. the losing side of a duplicate
    /// request.
    pub failed: usize,
    /// Requests dropped because the peer choked us.
    pub choked: usize,
    pub completion_order: Vec<usize>,
}

pub struct Swarm {
    settings: SwarmSettings,
    torrent: Arc<TorrentInfo>,
    strategy: Strategy,
    peers: Vec<Peer>,
    index: HashMap<PeerKey, usize>,
    have: SharedBitfield,
    wire: Wire,
    rng: StdRng,
}

impl Swarm {
    pub fn new(settings: SwarmSettings, mut strategy: Strategy) -> Result<Self, Error> {
        if settings.piece_length == 0 || settings.size == 0 {
            return Err(Error::InvalidSettings("the torrent is empty".into()));
        }
        if !(0.0..1.0).contains(&settings.reject_rate) {
            return Err(Error::InvalidSettings(format!(
                "reject_rate {} is not in [0, 1)",
                settings.reject_rate
            )));
        }
        if !(settings.deliver_rate > 0.0 && settings.deliver_rate <= 1.0) {
            return Err(Error::InvalidSettings(format!(
                "deliver_rate {} is not in (0, 1]",
                settings.deliver_rate
            )));
        }

        let torrent =
            Arc::new(TorrentInfo::single_file(settings.piece_length, settings.size));
        let pieces = torrent.pieces_count();
        let mut rng = StdRng::seed_from_u64(settings.seed);

        let mut peers = Vec::with_capacity(settings.seeders + settings.leechers);

        for _ in 0..settings.seeders {
            let key = peers.len() as u32 + 1;
            let mut peer = Peer::seeder(key, pieces).unchoked();
            peer.max_pending = rng.gen_range(2..=16);
            peer.download_speed = rng.gen_range(0..BLOCK_LEN as u64 * 32);
            peers.push(peer);
        }

        for i in 0..settings.leechers {
            let key = peers.len() as u32 + 1;
            let mut peer = Peer::new(key, pieces);
            for piece in 0..pieces {
                if rng.gen_bool(0.5) {
                    peer.have(piece);
                }
            }
            peer.max_pending = rng.gen_range(2..=16);
            peer.download_speed = rng.gen_range(0..BLOCK_LEN as u64 * 32);

            if i % 2 == 0 {
                peer.supports_fast = true;
                let mut owned: Vec<usize> = peer.bitfield.iter_ones().collect();
                owned.shuffle(&mut rng);
                owned.truncate(2);
                peer.allowed_fast = owned;
            }

            peers.push(peer);
        }

        let mut union = Bitfield::from_piece(pieces);
        for peer in &peers {
            union.or_with(&peer.bitfield);
        }
        let missing = pieces - union.true_count();
        if missing > 0 {
            return Err(Error::PiecesUnavailable(missing));
        }

        let index = peers.iter().enumerate().map(|(i, p)| (p.key, i)).collect();
        let have = Rc::new(RefCell::new(Bitfield::from_piece(pieces)));
        strategy.requester().initialise(torrent.clone(), &[have.clone()]);

        info!(
            "swarm of {} seeders and {} leechers, {pieces} pieces of {} bytes",
            settings.seeders, settings.leechers, settings.piece_length
        );

        Ok(Self {
            settings,
            torrent,
            strategy,
            peers,
            index,
            have,
            wire: Wire::default(),
            rng,
        })
    }

    /// Move the read position of a streaming download to `position`.
    pub fn seek(&mut self, position: u64) {
        match &mut self.strategy {
            Strategy::Streaming(r) => r.seek_to_position(0, position),
            Strategy::Standard(_) => warn!("seeking only works while streaming"),
        }
    }

    /// Run rounds until every piece is downloaded.
    pub fn run(&mut self) -> Result<Report, Error> {
        let mut report =
            Report { pieces: self.torrent.pieces_count(), ..Default::default() };

        for round in 1..=self.settings.rounds {
            self.update_chokes(&mut report);
            self.follow_reader();

            {
                let requester = self.strategy.requester();
                let mut peers: Vec<&mut dyn Requester> =
                    self.peers.iter_mut().map(|p| p as &mut dyn Requester).collect();
                requester.add_requests_all(&mut peers, &mut self.wire);
            }

            self.deliver(&mut report);

            if self.have.borrow().all_true() {
                report.rounds = round;
                report.requests = self.wire.sent;
                report.cancelled = self.wire.cancelled;
                return Ok(report);
            }
        }

        Err(Error::Stalled(self.settings.rounds))
    }

    fn update_chokes(&mut self, report: &mut Report) {
        let requester = self.strategy.requester();

        for peer in self.peers.iter_mut().filter(|p| !p.is_seeder()) {
            if peer.peer_choking {
                if self.rng.gen_bool(UNCHOKE_RATE) {
                    debug!("{} unchoked us", peer.key);
                    peer.peer_choking = false;
                }
                continue;
            }

            if !self.rng.gen_bool(CHOKE_RATE) {
                continue;
            }

            // a choke drops every request that the peer did not answer
            debug!("{} choked us", peer.key);
            peer.peer_choking = true;
            requester.abort_requests(&*peer);

            let key = peer.key;
            let before = self.wire.pending.len();
            self.wire.pending.retain(|(k, _)| *k != key);
            report.choked += before - self.wire.pending.len();
            peer.outstanding = 0;
        }
    }

    /// A video player reads the file as it is downloaded, from the first
    /// piece that is missing after the read position.
    fn follow_reader(&mut self) {
        let Strategy::Streaming(requester) = &mut self.strategy else {
            return;
        };
        let start = requester.high_priority_index();
        let last = self.torrent.pieces_count() - 1;
        let Some(next) = self.have.borrow().first_false(start..=last) else {
            return;
        };
        requester.read_to_position(0, next as u64 * self.torrent.piece_length as u64);
    }

    fn deliver(&mut self, report: &mut Report) {
        let requester = self.strategy.requester();
        let pending = std::mem::take(&mut self.wire.pending);

        for (key, block) in pending {
            if !self.rng.gen_bool(self.settings.deliver_rate) {
                self.wire.pending.push((key, block));
                continue;
            }

            let Some(peer) = self.index.get(&key).and_then(|&i| self.peers.get_mut(i))
            else {
                continue;
            };

            if self.rng.gen_bool(self.settings.reject_rate) {
                requester.picker().request_rejected(&*peer, block);
                peer.outstanding = peer.outstanding.saturating_sub(1);
                report.rejected += 1;
                continue;
            }

            match requester.picker().validate_piece(peer, block) {
                Ok(validated) if validated.piece_complete => {
                    debug!("piece {} complete", block.index);
                    self.have.borrow_mut().set(block.index, true);
                    report.completion_order.push(block.index);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("{key}: {e}");
                    peer.outstanding = peer.outstanding.saturating_sub(1);
                    report.failed += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use vcz_picker::{config::StreamingSettings, requester::RequesterSettings};

    use super::*;

    fn settings() -> SwarmSettings {
        SwarmSettings {
            piece_length: BLOCK_LEN * 4,
            size: BLOCK_LEN as u64 * 4 * 8,
            seeders: 1,
            leechers: 3,
            rounds: 5_000,
            reject_rate: 0.1,
            deliver_rate: 0.7,
            seed: 3,
        }
    }

    fn standard() -> Strategy {
        Strategy::Standard(StandardRequester::with_rng(
            RequesterSettings::default(),
            StdRng::seed_from_u64(1),
        ))
    }

    fn streaming(count: usize) -> Strategy {
        Strategy::Streaming(StreamingRequester::with_rng(
            StreamingSettings { high_priority_count: count, low_priority_multiplier: 2 },
            StdRng::seed_from_u64(1),
        ))
    }

    #[test]
    fn standard_download_finishes() {
        let mut swarm = Swarm::new(settings(), standard()).unwrap();
        let report = swarm.run().unwrap();

        let mut order = report.completion_order.clone();
        order.sort_unstable();
        assert_eq!(order, (0..8).collect::<Vec<_>>());
        assert_eq!(report.pieces, 8);
        assert!(report.requests >= 8 * 4);
        assert_eq!(swarm.strategy.requester().picker().current_request_count(), 0);
    }

    #[test]
    fn streaming_starts_at_seek() {
        let settings = SwarmSettings {
            seeders: 1,
            leechers: 0,
            reject_rate: 0.0,
            deliver_rate: 1.0,
            ..settings()
        };
        let mut swarm = Swarm::new(settings, streaming(2)).unwrap();
        swarm.seek(BLOCK_LEN as u64 * 4 * 5);

        let report = swarm.run().unwrap();
        assert_eq!(report.completion_order[0], 5);
        assert_eq!(report.completion_order.len(), 8);
    }

    #[test]
    fn unavailable_pieces() {
        let settings = SwarmSettings { seeders: 0, leechers: 0, ..settings() };
        assert!(matches!(
            Swarm::new(settings, standard()),
            Err(Error::PiecesUnavailable(8))
        ));
    }

    #[test]
    fn invalid_rates() {
        let settings = SwarmSettings { reject_rate: 1.0, ..settings() };
        assert!(matches!(
            Swarm::new(settings, standard()),
            Err(Error::InvalidSettings(_))
        ));
    }
}
