//! The parts of a torrent's metadata that scheduling depends on.
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::block::BLOCK_LEN;

/// Download priority of a file. Higher priorities are downloaded first.
#[repr(u8)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    DoNotDownload = 0,
    Lowest = 1,
    Low = 2,
    #[default]
    Normal = 4,
    High = 8,
    Highest = 16,
    Immediate = 32,
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        match value {
            0 => Priority::DoNotDownload,
            1 => Priority::Lowest,
            2 | 3 => Priority::Low,
            4..=7 => Priority::Normal,
            8..=15 => Priority::High,
            16..=31 => Priority::Highest,
            _ => Priority::Immediate,
        }
    }
}

/// A file of a torrent, and the range of pieces it covers.
#[derive(Debug)]
pub struct FileInfo {
    pub path: String,
    /// Offset of the first byte of the file, from the start of the torrent.
    pub offset: u64,
    pub length: u64,
    pub start_piece: usize,
    pub end_piece: usize,
    priority: AtomicU8,
}

impl FileInfo {
    pub fn new(
        path: impl Into<String>,
        offset: u64,
        length: u64,
        piece_length: u32,
    ) -> Self {
        let piece_length = piece_length as u64;
        let start_piece = (offset / piece_length) as usize;
        let end_piece = if length == 0 {
            start_piece
        } else {
            ((offset + length - 1) / piece_length) as usize
        };
        Self {
            path: path.into(),
            offset,
            length,
            start_piece,
            end_piece,
            priority: AtomicU8::new(Priority::default() as u8),
        }
    }

    pub fn priority(&self) -> Priority {
        Priority::from(self.priority.load(Ordering::Relaxed))
    }

    pub fn set_priority(&self, priority: Priority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }
}

/// A cache of the Info of a torrent. It is shared by every picker of the
/// torrent, only the priorities of the files are mutable.
#[derive(Debug)]
pub struct TorrentInfo {
    pub piece_length: u32,
    /// Sum of the length of all files.
    pub size: u64,
    pub files: Vec<FileInfo>,
}

impl TorrentInfo {
    /// Lay out the files one after the other, in the given order.
    pub fn new(piece_length: u32, files: &[(&str, u64)]) -> Self {
        assert!(piece_length > 0, "piece length must be larger than zero");

        let mut offset = 0;
        let files: Vec<FileInfo> = files
            .iter()
            .map(|(path, length)| {
                let file = FileInfo::new(*path, offset, *length, piece_length);
                offset += length;
                file
            })
            .collect();

        Self { piece_length, size: offset, files }
    }

    /// A torrent with a single file.
    pub fn single_file(piece_length: u32, size: u64) -> Self {
        Self::new(piece_length, &[("file", size)])
    }

    pub fn pieces_count(&self) -> usize {
        self.size.div_ceil(self.piece_length as u64) as usize
    }

    /// Length of the piece, the last piece might be smaller.
    pub fn bytes_per_piece(&self, index: usize) -> u32 {
        let pieces = self.pieces_count();
        assert!(index < pieces, "piece {index} out of range, torrent has {pieces}");

        if index == pieces - 1 {
            (self.size - self.piece_length as u64 * index as u64) as u32
        } else {
            self.piece_length
        }
    }

    pub fn blocks_per_piece(&self, index: usize) -> usize {
        self.bytes_per_piece(index).div_ceil(BLOCK_LEN) as usize
    }

    pub fn byte_offset_to_piece_index(&self, offset: u64) -> usize {
        (offset / self.piece_length as u64) as usize
    }
}
