//! Piece pickers decide which block to request next.
//!
//! [`StandardPicker`] owns all the bookkeeping of requested pieces. Every
//! other picker is a filter that wraps another picker (its `next`),
//! changes the arguments of some calls, and forwards everything else. A
//! chain is built from the inside out:
//!
//! ```ignore
//! let picker = StandardPicker::new();
//! let picker = RandomisedPicker::new(Box::new(picker));
//! let picker = RarestFirstPicker::new(Box::new(picker));
//! let picker = PriorityPicker::new(Box::new(picker));
//! let mut picker = IgnoringPicker::wrap(Box::new(picker), &[have]);
//! picker.initialise(torrent);
//! ```
//!
//! Ranges of pieces are inclusive on both ends.

/// Implement the given methods of [`PiecePicker`] by forwarding them,
/// untouched, to `self.next`.
///
/// ```ignore
/// impl PiecePicker for MyFilter {
///     forward_to_next!(initialise, cancel_requests);
///     // ...the rest of the methods
/// }
/// ```
macro_rules! forward_to_next {
    ( $($method: ident),* $(,)? ) => {
        $(
            forward_to_next!(@method $method);
        )*
    };
    (@method initialise) => {
        fn initialise(
            &mut self,
            torrent: std::sync::Arc<$crate::torrent::TorrentInfo>,
        ) {
            self.next.initialise(torrent)
        }
    };
    (@method is_interesting) => {
        fn is_interesting(
            &mut self,
            peer: &dyn $crate::peer::Requester,
            bitfield: &$crate::bitfield::Bitfield,
        ) -> bool {
            self.next.is_interesting(peer, bitfield)
        }
    };
    (@method pick_piece) => {
        fn pick_piece(
            &mut self,
            peer: &mut dyn $crate::peer::Requester,
            available: &$crate::bitfield::Bitfield,
            others: &[&$crate::bitfield::Bitfield],
            start: usize,
            end: usize,
            requests: &mut [$crate::block::BlockInfo],
        ) -> usize {
            self.next.pick_piece(peer, available, others, start, end, requests)
        }
    };
    (@method continue_existing_request) => {
        fn continue_existing_request(
            &mut self,
            peer: &dyn $crate::peer::Requester,
            start: usize,
            end: usize,
        ) -> Option<$crate::block::BlockInfo> {
            self.next.continue_existing_request(peer, start, end)
        }
    };
    (@method continue_any_existing_request) => {
        fn continue_any_existing_request(
            &mut self,
            peer: &dyn $crate::peer::Requester,
            available: &$crate::bitfield::Bitfield,
            start: usize,
            end: usize,
            max_duplicates: usize,
        ) -> Option<$crate::block::BlockInfo> {
            self.next.continue_any_existing_request(
                peer,
                available,
                start,
                end,
                max_duplicates,
            )
        }
    };
    (@method cancel_requests) => {
        fn cancel_requests(
            &mut self,
            peer: &dyn $crate::peer::Requester,
            start: usize,
            end: usize,
        ) -> Vec<$crate::block::BlockInfo> {
            self.next.cancel_requests(peer, start, end)
        }
    };
    (@method abort_requests) => {
        fn abort_requests(
            &mut self,
            peer: &dyn $crate::peer::Requester,
        ) -> Vec<$crate::block::BlockInfo> {
            self.next.abort_requests(peer)
        }
    };
    (@method request_rejected) => {
        fn request_rejected(
            &mut self,
            peer: &dyn $crate::peer::Requester,
            request: $crate::block::BlockInfo,
        ) -> bool {
            self.next.request_rejected(peer, request)
        }
    };
    (@method validate_piece) => {
        fn validate_piece(
            &mut self,
            peer: &mut dyn $crate::peer::Requester,
            request: $crate::block::BlockInfo,
        ) -> Result<$crate::picker::ValidatedBlock, $crate::error::Error> {
            self.next.validate_piece(peer, request)
        }
    };
    (@method current_request_count) => {
        fn current_request_count(&self) -> usize {
            self.next.current_request_count()
        }
    };
    (@method current_received_count) => {
        fn current_received_count(&self) -> usize {
            self.next.current_received_count()
        }
    };
    (@method export_active_requests) => {
        fn export_active_requests(&self) -> Vec<$crate::block::ActiveRequest> {
            self.next.export_active_requests()
        }
    };
}

pub(crate) use forward_to_next;

pub mod ignoring;
pub mod priority;
pub mod randomised;
pub mod rarest_first;
pub mod standard;

pub use ignoring::IgnoringPicker;
pub use priority::PriorityPicker;
pub use randomised::RandomisedPicker;
pub use rarest_first::RarestFirstPicker;
pub use standard::StandardPicker;

use std::{cell::RefCell, rc::Rc, sync::Arc};

use crate::{
    bitfield::Bitfield,
    block::{ActiveRequest, BlockInfo},
    error::Error,
    peer::{PeerKey, Requester},
    torrent::TorrentInfo,
};

/// A block that was accepted by [`PiecePicker::validate_piece`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedBlock {
    /// Every block of the piece was received, the piece can be hashed.
    pub piece_complete: bool,
    /// When the piece is complete, the peers that delivered its blocks.
    pub peers_involved: Vec<PeerKey>,
}

pub trait PiecePicker {
    /// Reset all state and size it to the given torrent.
    fn initialise(&mut self, torrent: Arc<TorrentInfo>);

    /// If the peer has at least one piece that we would download.
    fn is_interesting(&mut self, peer: &dyn Requester, bitfield: &Bitfield) -> bool;

    /// Fill `requests` with blocks to request from `peer`, chosen among the
    /// `available` pieces inside of `start..=end`. `others` are the
    /// bitfields of the other peers of the torrent.
    ///
    /// Returns how many requests were written.
    fn pick_piece(
        &mut self,
        peer: &mut dyn Requester,
        available: &Bitfield,
        others: &[&Bitfield],
        start: usize,
        end: usize,
        requests: &mut [BlockInfo],
    ) -> usize;

    /// Request the next block of a piece that `peer` started.
    fn continue_existing_request(
        &mut self,
        peer: &dyn Requester,
        start: usize,
        end: usize,
    ) -> Option<BlockInfo>;

    /// Help with any piece in flight, allowing each block to be requested
    /// from up to `max_duplicates` different peers.
    fn continue_any_existing_request(
        &mut self,
        peer: &dyn Requester,
        available: &Bitfield,
        start: usize,
        end: usize,
        max_duplicates: usize,
    ) -> Option<BlockInfo>;

    /// Cancel the requests of `peer` inside of `start..=end`, returning
    /// the requests that were cancelled.
    fn cancel_requests(
        &mut self,
        peer: &dyn Requester,
        start: usize,
        end: usize,
    ) -> Vec<BlockInfo>;

    /// Cancel every request of `peer`, i.e. when it disconnects.
    fn abort_requests(&mut self, peer: &dyn Requester) -> Vec<BlockInfo>;

    /// The peer rejected this exact request. Returns true if it was
    /// outstanding.
    fn request_rejected(&mut self, peer: &dyn Requester, request: BlockInfo) -> bool;

    /// Match a block delivered by `peer` against the outstanding requests.
    fn validate_piece(
        &mut self,
        peer: &mut dyn Requester,
        request: BlockInfo,
    ) -> Result<ValidatedBlock, Error>;

    /// Blocks requested and not received.
    fn current_request_count(&self) -> usize;

    /// Blocks received of pieces that are not complete yet.
    fn current_received_count(&self) -> usize;

    fn export_active_requests(&self) -> Vec<ActiveRequest>;
}

/// A filter that changes nothing, every call goes straight to `next`.
pub struct PiecePickerFilter {
    next: Box<dyn PiecePicker>,
}

impl PiecePickerFilter {
    pub fn new(next: Box<dyn PiecePicker>) -> Self {
        Self { next }
    }

    pub fn into_inner(self) -> Box<dyn PiecePicker> {
        self.next
    }
}

impl PiecePicker for PiecePickerFilter {
    forward_to_next!(
        initialise,
        is_interesting,
        pick_piece,
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
}

/// A picker shared by more than one chain of filters, the streaming
/// requester has two chains on top of the same [`StandardPicker`] so that
/// both see the same pieces in flight.
///
/// Not `Send`, every chain that holds a clone must be used from the same
/// thread, one call at a time. A call that re-enters the shared picker
/// while it is already borrowed panics.
pub struct SharedPicker<P: PiecePicker> {
    inner: Rc<RefCell<P>>,
}

impl<P: PiecePicker> Clone for SharedPicker<P> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<P: PiecePicker> SharedPicker<P> {
    pub fn new(picker: P) -> Self {
        Self { inner: Rc::new(RefCell::new(picker)) }
    }

    pub fn handle(&self) -> Rc<RefCell<P>> {
        self.inner.clone()
    }
}

impl<P: PiecePicker> PiecePicker for SharedPicker<P> {
    fn initialise(&mut self, torrent: Arc<TorrentInfo>) {
        self.inner.borrow_mut().initialise(torrent)
    }

    fn is_interesting(&mut self, peer: &dyn Requester, bitfield: &Bitfield) -> bool {
        self.inner.borrow_mut().is_interesting(peer, bitfield)
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
        self.inner
            .borrow_mut()
            .pick_piece(peer, available, others, start, end, requests)
    }

    fn continue_existing_request(
        &mut self,
        peer: &dyn Requester,
        start: usize,
        end: usize,
    ) -> Option<BlockInfo> {
        self.inner.borrow_mut().continue_existing_request(peer, start, end)
    }

    fn continue_any_existing_request(
        &mut self,
        peer: &dyn Requester,
        available: &Bitfield,
        start: usize,
        end: usize,
        max_duplicates: usize,
    ) -> Option<BlockInfo> {
        self.inner.borrow_mut().continue_any_existing_request(
            peer,
            available,
            start,
            end,
            max_duplicates,
        )
    }

    fn cancel_requests(
        &mut self,
        peer: &dyn Requester,
        start: usize,
        end: usize,
    ) -> Vec<BlockInfo> {
        self.inner.borrow_mut().cancel_requests(peer, start, end)
    }

    fn abort_requests(&mut self, peer: &dyn Requester) -> Vec<BlockInfo> {
        self.inner.borrow_mut().abort_requests(peer)
    }

    fn request_rejected(&mut self, peer: &dyn Requester, request: BlockInfo) -> bool {
        self.inner.borrow_mut().request_rejected(peer, request)
    }

    fn validate_piece(
        &mut self,
        peer: &mut dyn Requester,
        request: BlockInfo,
    ) -> Result<ValidatedBlock, Error> {
        self.inner.borrow_mut().validate_piece(peer, request)
    }

    fn current_request_count(&self) -> usize {
        self.inner.borrow().current_request_count()
    }

    fn current_received_count(&self) -> usize {
        self.inner.borrow().current_received_count()
    }

    fn export_active_requests(&self) -> Vec<ActiveRequest> {
        self.inner.borrow().export_active_requests()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bitfield::BitfieldExt, block::BLOCK_LEN, peer::Peer};

    fn torrent() -> Arc<TorrentInfo> {
        Arc::new(TorrentInfo::single_file(BLOCK_LEN * 2, BLOCK_LEN as u64 * 20))
    }

    #[test]
    fn base_filter_is_transparent() {
        let mut picker = PiecePickerFilter::new(Box::new(StandardPicker::new()));
        picker.initialise(torrent());

        let mut peer = Peer::seeder(1, 10).unchoked();
        let available = peer.bitfield.clone();
        let mut buf = [BlockInfo::default(); 1];

        assert!(picker.is_interesting(&peer, &available));
        assert_eq!(picker.pick_piece(&mut peer, &available, &[], 0, 9, &mut buf), 1);
        assert_eq!(buf[0], BlockInfo::new(0, 0, BLOCK_LEN));
        assert_eq!(picker.current_request_count(), 1);
        assert_eq!(picker.export_active_requests().len(), 1);
        assert_eq!(picker.cancel_requests(&peer, 0, 9), vec![buf[0]]);
        assert_eq!(picker.current_request_count(), 0);
    }

    #[test]
    fn shared_picker_sees_the_same_requests() {
        let shared = SharedPicker::new(StandardPicker::new());
        let mut a: Box<dyn PiecePicker> = Box::new(shared.clone());
        let b: Box<dyn PiecePicker> = Box::new(shared.clone());
        a.initialise(torrent());

        let mut peer = Peer::seeder(1, 10).unchoked();
        let mut available = Bitfield::from_piece(10);
        available.set_all_bits(true);
        let mut buf = [BlockInfo::default(); 2];

        assert_eq!(a.pick_piece(&mut peer, &available, &[], 0, 9, &mut buf), 2);
        assert_eq!(b.current_request_count(), 2);
        assert_eq!(shared.handle().borrow().current_request_count(), 2);
    }
}
