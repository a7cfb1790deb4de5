use once_cell::sync::Lazy;
use std::sync::Mutex;

/// Small buffer size, used by the peek reader and the rewriter's rolling
/// window.
pub const SMALL_BUFFER_SIZE: usize = 8 * 1024;

/// Large buffer size, used for stream copies (websocket relay, codec
/// pipeline).
pub const LARGE_BUFFER_SIZE: usize = 32 * 1024;

const MAX_POOLED_PER_CLASS: usize = 64;

/// Global pool instance shared by all requests.
pub static GLOBAL_BUFFER_POOL: Lazy<BufferPool> = Lazy::new(BufferPool::new);

/// Freelists of reusable byte buffers in two capacity classes. Buffers are
/// handed out empty (length zero) with their capacity preserved.
pub struct BufferPool {
    small: Mutex<Vec<Vec<u8>>>,
    large: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            small: Mutex::new(Vec::new()),
            large: Mutex::new(Vec::new()),
        }
    }

    pub fn get_small(&self) -> Vec<u8> {
        self.small
            .lock()
            .expect("buffer pool lock")
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(SMALL_BUFFER_SIZE))
    }

    pub fn get_large(&self) -> Vec<u8> {
        self.large
            .lock()
            .expect("buffer pool lock")
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(LARGE_BUFFER_SIZE))
    }

    /// Return a buffer to the pool it came from, classified by capacity.
    /// Buffers of other sizes are dropped and left to the allocator.
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let list = match buf.capacity() {
            SMALL_BUFFER_SIZE => &self.small,
            LARGE_BUFFER_SIZE => &self.large,
            _ => return,
        };
        let mut list = list.lock().expect("buffer pool lock");
        if list.len() < MAX_POOLED_PER_CLASS {
            list.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused() {
        let pool = BufferPool::new();
        let mut buf = pool.get_small();
        buf.extend_from_slice(b"leftover data");
        let ptr = buf.as_ptr();
        pool.put(buf);

        let buf = pool.get_small();
        assert_eq!(buf.len(), 0, "returned buffers must come back empty");
        assert_eq!(buf.as_ptr(), ptr);
    }

    #[test]
    fn classification_by_capacity() {
        let pool = BufferPool::new();
        pool.put(pool.get_large());
        // A foreign-sized buffer is dropped, not pooled.
        pool.put(Vec::with_capacity(100));

        assert_eq!(pool.get_large().capacity(), LARGE_BUFFER_SIZE);
        assert_eq!(pool.get_small().capacity(), SMALL_BUFFER_SIZE);
    }

    #[test]
    fn grown_buffers_are_not_pooled() {
        let pool = BufferPool::new();
        let mut buf = pool.get_small();
        buf.resize(SMALL_BUFFER_SIZE * 4, 0);
        let grown_ptr = buf.as_ptr();
        pool.put(buf);

        let buf = pool.get_small();
        assert_ne!(buf.as_ptr(), grown_ptr);
    }
}
