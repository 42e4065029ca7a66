//! Piece and block request scheduling for the BitTorrent protocol V1.
//!
//! This is the part of Vincenzo that decides what to download from each
//! peer. Given the pieces that every peer has, it picks which blocks to
//! request next, keeps track of the requests in flight, and validates the
//! blocks that peers send back.
//!
//! The crate does no I/O. Sending messages, hashing pieces and keeping
//! connections alive is the job of the caller, which tells the requesters
//! about peers through the [`peer::Requester`] trait and receives the
//! messages to send through [`requester::MessageEnqueuer`].
//!
//! Pickers are built as a chain of filters around one
//! [`picker::StandardPicker`], the only picker that owns state:
//!
//! * [`picker::IgnoringPicker`] hides pieces that we already have
//! * [`picker::PriorityPicker`] downloads files of higher priority first
//! * [`picker::RarestFirstPicker`] picks the pieces that few peers have
//! * [`picker::RandomisedPicker`] starts at a random point of the torrent
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use vcz_picker::{
//!     block::BlockInfo,
//!     peer::{Peer, Requester},
//!     requester::{MessageEnqueuer, PieceRequester, RequesterSettings, StandardRequester},
//!     torrent::TorrentInfo,
//! };
//!
//! struct Print;
//!
//! impl MessageEnqueuer for Print {
//!     fn enqueue_request(&mut self, peer: &dyn Requester, block: BlockInfo) {
//!         println!("request {block:?} from {}", peer.key());
//!     }
//!
//!     fn enqueue_cancellation(&mut self, peer: &dyn Requester, block: BlockInfo) {
//!         println!("cancel {block:?} of {}", peer.key());
//!     }
//! }
//!
//! let torrent = Arc::new(TorrentInfo::single_file(262_144, 262_144 * 40));
//! let mut requester = StandardRequester::new(RequesterSettings::default());
//! requester.initialise(torrent, &[]);
//!
//! let mut peer = Peer::seeder(1, 40).unchoked();
//! let available = peer.bitfield.clone();
//! requester.add_requests(&mut peer, &available, &[], &mut Print);
//! assert_eq!(peer.outstanding, 2);
//! ```

pub mod bitfield;
pub mod block;
pub mod config;
pub mod error;
pub mod peer;
pub mod picker;
pub mod piece;
pub mod requester;
pub mod torrent;
