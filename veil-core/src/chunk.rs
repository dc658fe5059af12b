//! Chunk coordinator: split a transfer into pieces, hand out pending ranges,
//! buffer received payloads under a capacity bound.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

pub use crate::protocol::Chunk;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u32 = 256 * 1024; // 256 KiB

/// Split a transfer into chunks by fixed size. The last chunk carries the remainder.
pub fn split_into_chunks(total_len: u64, chunk_size: u32) -> Vec<Chunk> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    let mut out = Vec::new();
    let mut offset = 0u64;
    while offset < total_len {
        let end = (offset + u64::from(size)).min(total_len);
        out.push(Chunk {
            offset,
            size: (end - offset) as u32,
        });
        offset = end;
    }
    out
}

/// A received chunk and its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub chunk: Chunk,
    pub data: Vec<u8>,
}

/// Ranges not handed out yet. Produced lazily from `next`, so a declared size
/// costs nothing until pieces move.
#[derive(Default)]
struct Pool {
    next: u64,
    returned: VecDeque<Chunk>,
    claimed: HashSet<u64>,
}

struct Buffer {
    pieces: VecDeque<Piece>,
    remaining: usize,
}

/// Per-transfer pacing state.
///
/// The sending side pops ranges from the pending pool; the receiving side
/// claims each expected range once. The pool and the receive buffer sit behind
/// separate locks so the network side and the disk side never contend. Neither
/// lock is held across an await.
pub struct ChunkCoordinator {
    size: u64,
    chunk_size: u32,
    max_in_flight: usize,
    count: usize,
    pending: Mutex<Pool>,
    buffer: Mutex<Buffer>,
    capacity: Notify,
    data: Notify,
}

impl ChunkCoordinator {
    pub fn new(size: u64, chunk_size: u32, max_in_flight: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        let count = size.div_ceil(u64::from(chunk_size)) as usize;
        Self {
            size,
            chunk_size,
            max_in_flight: max_in_flight.max(1),
            count,
            pending: Mutex::new(Pool::default()),
            buffer: Mutex::new(Buffer {
                pieces: VecDeque::new(),
                remaining: count,
            }),
            capacity: Notify::new(),
            data: Notify::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Total number of pieces.
    pub fn count(&self) -> usize {
        self.count
    }

    fn pool(&self) -> std::sync::MutexGuard<'_, Pool> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The range the split places at `offset`, if any.
    pub fn chunk_at(&self, offset: u64) -> Option<Chunk> {
        let step = u64::from(self.chunk_size);
        if offset >= self.size || offset % step != 0 {
            return None;
        }
        Some(Chunk {
            offset,
            size: (self.size - offset).min(step) as u32,
        })
    }

    /// Next range to request, or none when every range has been handed out.
    pub fn pop_chunk(&self) -> Option<Chunk> {
        let mut pool = self.pool();
        if let Some(chunk) = pool.returned.pop_front() {
            return Some(chunk);
        }
        let chunk = self.chunk_at(pool.next)?;
        pool.next += u64::from(chunk.size);
        Some(chunk)
    }

    /// Return a range that could not be delivered; it is handed out next.
    pub fn push_chunk(&self, chunk: Chunk) {
        self.pool().returned.push_front(chunk);
    }

    pub fn pending_chunks(&self) -> usize {
        let pool = self.pool();
        let fresh = (self.size - pool.next).div_ceil(u64::from(self.chunk_size));
        pool.returned.len() + fresh as usize
    }

    /// Accept an incoming range once. Only ranges of the split qualify; a
    /// misaligned, resized, out-of-range or repeated one is refused.
    pub fn claim(&self, chunk: Chunk) -> bool {
        self.chunk_at(chunk.offset) == Some(chunk) && self.pool().claimed.insert(chunk.offset)
    }

    /// Undo a claim whose piece could not be buffered.
    pub fn release(&self, chunk: Chunk) {
        self.pool().claimed.remove(&chunk.offset);
    }

    /// Deposit a received piece. A full buffer hands the piece back.
    pub fn push_data(&self, piece: Piece) -> Result<(), Piece> {
        {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            if buffer.pieces.len() >= self.max_in_flight {
                return Err(piece);
            }
            buffer.pieces.push_back(piece);
        }
        self.data.notify_one();
        Ok(())
    }

    /// Take one buffered piece. Empty buffer: none, and `remaining` is untouched.
    pub fn pop_data(&self) -> Option<Piece> {
        let piece = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            let piece = buffer.pieces.pop_front()?;
            buffer.remaining = buffer.remaining.saturating_sub(1);
            piece
        };
        self.capacity.notify_one();
        if self.finished() {
            self.data.notify_waiters();
        }
        Some(piece)
    }

    pub fn buffered(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pieces
            .len()
    }

    pub fn has_data_capacity(&self) -> bool {
        self.buffered() < self.max_in_flight
    }

    pub fn remaining(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remaining
    }

    pub fn finished(&self) -> bool {
        self.remaining() == 0
    }

    /// Wait until the buffer has room. Single producer per coordinator.
    pub async fn reserve(&self) {
        while !self.has_data_capacity() {
            self.capacity.notified().await;
        }
    }

    /// Wait for the next piece; none once the transfer is finished.
    pub async fn next_data(&self) -> Option<Piece> {
        loop {
            if let Some(piece) = self.pop_data() {
                return Some(piece);
            }
            if self.finished() {
                return None;
            }
            self.data.notified().await;
        }
    }
}
