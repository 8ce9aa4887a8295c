use std::sync::Mutex;

use bytes::BytesMut;

/// Resource budgets from spec.md §5: bounded concurrency for enrichment fetches
/// (API-bound) and store/link-check I/O, used with `futures_util::stream::
/// buffer_unordered`, the same bounded-fan-out idiom the teacher's `mapper.rs`/
/// `tasks.rs` use (there capped at 1; this crate's budgets call for more).
pub const API_WORKER_POOL_SIZE: usize = 8;
pub const IO_WORKER_POOL_SIZE: usize = 32;

const SMALL_BUFFER: usize = 64 * 1024;
const LARGE_BUFFER: usize = 32 * 1024 * 1024;

/// Two size-class buffer pool (64 KiB / 32 MiB, spec.md §5) for `DownloadFile`'s
/// streaming path. Buffers are `BytesMut` (the teacher's `dav_fs.rs` passes the same
/// crate's `Bytes` across its filesystem trait) and are returned on completion rather
/// than dropped, the one piece-level mechanism spec.md names that this crate doesn't
/// strictly need for correctness (it never does piece I/O itself) but still
/// implements, per DESIGN.md.
pub struct BufferPool {
    small: Mutex<Vec<BytesMut>>,
    large: Mutex<Vec<BytesMut>>,
}

/// Which size class a checked-out buffer belongs to, so it returns to the right pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferClass {
    Small,
    Large,
}

impl BufferPool {
    pub fn new() -> Self {
        Self { small: Mutex::new(Vec::new()), large: Mutex::new(Vec::new()) }
    }

    /// Picks the smallest class able to hold `expected_len` without reallocating.
    pub fn class_for(expected_len: u64) -> BufferClass {
        if expected_len as usize <= SMALL_BUFFER {
            BufferClass::Small
        } else {
            BufferClass::Large
        }
    }

    pub fn checkout(&self, class: BufferClass) -> BytesMut {
        let (pool, cap) = match class {
            BufferClass::Small => (&self.small, SMALL_BUFFER),
            BufferClass::Large => (&self.large, LARGE_BUFFER),
        };
        pool.lock().unwrap().pop().unwrap_or_else(|| BytesMut::with_capacity(cap))
    }

    pub fn release(&self, class: BufferClass, mut buf: BytesMut) {
        buf.clear();
        let pool = match class {
            BufferClass::Small => &self.small,
            BufferClass::Large => &self.large,
        };
        pool.lock().unwrap().push(buf);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
