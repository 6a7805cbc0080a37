use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// A reference-counted slice of a shared arena.
///
/// Replies coming off the wire are decoded into views of the receive buffer,
/// so parsing a message never copies payload bytes. Cloning is cheap and the
/// arena stays alive until the last slice is dropped.
#[derive(Clone, Default)]
pub struct ConstBuffer {
    arena: Arc<Vec<u8>>,
    start: usize,
    end: usize,
}

impl ConstBuffer {
    pub fn from_vec(data: Vec<u8>) -> ConstBuffer {
        let end = data.len();
        ConstBuffer {
            arena: Arc::new(data),
            start: 0,
            end,
        }
    }

    /// A sub-slice sharing this buffer's arena. `range` is relative to self.
    pub fn slice(&self, start: usize, end: usize) -> ConstBuffer {
        assert!(start <= end);
        assert!(self.start + end <= self.end);
        ConstBuffer {
            arena: Arc::clone(&self.arena),
            start: self.start + start,
            end: self.start + end,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl Deref for ConstBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.arena[self.start..self.end]
    }
}

impl AsRef<[u8]> for ConstBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl PartialEq for ConstBuffer {
    fn eq(&self, other: &Self) -> bool {
        self[..] == other[..]
    }
}
impl Eq for ConstBuffer {}

impl fmt::Debug for ConstBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConstBuffer({} bytes)", self.len())
    }
}

impl From<&[u8]> for ConstBuffer {
    fn from(data: &[u8]) -> ConstBuffer {
        ConstBuffer::from_vec(data.to_vec())
    }
}

/// An append-only scratch arena messages are built in.
///
/// `commit` freezes what has been written so far into a [ConstBuffer]; the
/// pool then starts a fresh arena on the next write. One pool lives per
/// builder or per connection, they are not shared between threads.
pub struct BufferPool {
    data: Vec<u8>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> BufferPool {
        BufferPool {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Freeze the accumulated bytes into a shared buffer.
    pub fn commit(&mut self) -> ConstBuffer {
        ConstBuffer::from_vec(std::mem::take(&mut self.data))
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(4096)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_slice_shares_arena() {
        let buf = ConstBuffer::from_vec(vec![1, 2, 3, 4, 5]);
        let mid = buf.slice(1, 4);
        assert_eq!(&mid[..], &[2, 3, 4]);
        let inner = mid.slice(1, 2);
        assert_eq!(&inner[..], &[3]);
        drop(buf);
        // arena must outlive the original handle
        assert_eq!(&inner[..], &[3]);
    }

    #[test]
    fn test_pool_commit_resets() {
        let mut pool = BufferPool::new(16);
        pool.data_mut().extend_from_slice(b"abc");
        let first = pool.commit();
        pool.data_mut().extend_from_slice(b"de");
        let second = pool.commit();
        assert_eq!(&first[..], b"abc");
        assert_eq!(&second[..], b"de");
    }
}
