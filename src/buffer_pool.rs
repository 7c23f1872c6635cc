use bytes::BytesMut;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, trace};

/// Pool of fixed-capacity buffers for datagrams that are received or assembled for sending.
///
/// Buffers are handed out by value, and each holder is responsible for returning the buffer
///  exactly once. The number of buffers handed out and not yet returned is tracked for
///  diagnostics.
pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
    in_use: AtomicUsize,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn num_in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn get_from_pool(&self) -> BytesMut {
        self.in_use.fetch_add(1, Ordering::AcqRel);
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);

        if buffer.capacity() != self.buf_size {
            debug!("returned buffer has capacity {} instead of {}: discarding it", buffer.capacity(), self.buf_size);
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use super::*;

    #[test]
    fn test_clear() {
        let pool = BufferPool::new(10, 10);

        let mut buf = pool.get_from_pool();
        buf.put_u8(1);

        pool.return_to_pool(buf);

        assert!(pool.get_from_pool().is_empty());
    }

    #[test]
    fn test_in_use() {
        let pool = BufferPool::new(10, 10);
        let a = pool.get_from_pool();
        let b = pool.get_from_pool();
        assert_eq!(pool.num_in_use(), 2);

        pool.return_to_pool(a);
        assert_eq!(pool.num_in_use(), 1);
        pool.return_to_pool(b);
        assert_eq!(pool.num_in_use(), 0);
    }

    #[test]
    fn test_reuse() {
        let pool = BufferPool::new(10, 1);
        let buf = pool.get_from_pool();
        let ptr = buf.as_ptr();
        pool.return_to_pool(buf);

        assert_eq!(pool.get_from_pool().as_ptr(), ptr);
    }

    #[test]
    fn test_discard_grown_buffer() {
        let pool = BufferPool::new(10, 10);
        let mut buf = pool.get_from_pool();
        buf.put_slice(&[0u8; 100]);
        pool.return_to_pool(buf);

        assert_eq!(pool.buffers.lock().unwrap().len(), 0);
    }
}
