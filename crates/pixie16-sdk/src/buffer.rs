//! Event buffer pool and queue.
//!
//! The pool pre-reserves a fixed count of word buffers; a [`Handle`] is a
//! scoped loan that returns its buffer (cleared) on drop. The queue feeds a
//! writer: it drains words across handle boundaries and can compact partial
//! buffers to keep the pool from starving during long runs.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::info;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct PoolInner {
    free: Vec<Vec<u32>>,
    number: usize,
    size: usize,
}

/// Fixed-size pool of reusable event buffers.
#[derive(Debug)]
pub struct Pool {
    inner: Mutex<PoolInner>,
    available: AtomicUsize,
    me: Weak<Pool>,
}

/// A buffer on loan from a pool. Dereferences to the word vector; dropping
/// it clears the buffer and returns it to the pool.
#[derive(Debug)]
pub struct Handle {
    buf: Vec<u32>,
    capacity: usize,
    pool: Arc<Pool>,
}

impl Pool {
    /// Create an empty pool; call [`Pool::create`] to populate it.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            inner: Mutex::new(PoolInner::default()),
            available: AtomicUsize::new(0),
            me: me.clone(),
        })
    }

    /// Pre-allocate `number` buffers of `size` words each.
    ///
    /// # Errors
    ///
    /// Returns `BufferPoolNotEmpty` if the pool is already created.
    pub fn create(&self, number: usize, size: usize) -> Result<()> {
        info!("pool create: num={number} size={size}");
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        if inner.number != 0 {
            return Err(Error::BufferPoolNotEmpty("pool is already created".into()));
        }
        inner.number = number;
        inner.size = size;
        inner.free = (0..number).map(|_| Vec::with_capacity(size)).collect();
        self.available.store(number, Ordering::Release);
        Ok(())
    }

    /// Release all buffers. Every loaned handle must have been returned.
    ///
    /// # Errors
    ///
    /// Returns `BufferPoolBusy` if buffers are still in flight.
    pub fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        if inner.number == 0 {
            return Ok(());
        }
        if self.available.load(Ordering::Acquire) != inner.number {
            return Err(Error::BufferPoolBusy("pool destroy made while busy".into()));
        }
        info!("pool destroy");
        inner.free.clear();
        inner.number = 0;
        inner.size = 0;
        self.available.store(0, Ordering::Release);
        Ok(())
    }

    /// Loan a buffer out.
    ///
    /// # Errors
    ///
    /// Returns `BufferPoolEmpty` when all buffers are in flight.
    pub fn request(&self) -> Result<Handle> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let buf = inner
            .free
            .pop()
            .ok_or_else(|| Error::BufferPoolEmpty("no buffers available".into()))?;
        self.available.fetch_sub(1, Ordering::AcqRel);
        let pool = self.me.upgrade().expect("pool constructed via Pool::new");
        Ok(Handle { buf, capacity: inner.size, pool })
    }

    /// Buffers currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// Whether no buffers are free.
    #[must_use]
    pub fn empty(&self) -> bool {
        self.available() == 0
    }

    /// Configured buffer count.
    #[must_use]
    pub fn number(&self) -> usize {
        self.inner.lock().expect("pool lock poisoned").number
    }

    fn release(&self, mut buf: Vec<u32>) {
        buf.clear();
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        inner.free.push(buf);
        self.available.fetch_add(1, Ordering::AcqRel);
    }
}

impl Handle {
    /// Words of capacity the pool reserved for this buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Deref for Handle {
    type Target = Vec<u32>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for Handle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

/// FIFO of buffer handles feeding a writer.
#[derive(Debug, Default)]
pub struct Queue {
    buffers: Mutex<VecDeque<Handle>>,
    size: AtomicUsize,
    count: AtomicUsize,
}

impl Queue {
    /// Append a handle. An empty handle is dropped straight back to its
    /// pool.
    pub fn push(&self, handle: Handle) {
        if handle.is_empty() {
            return;
        }
        let mut buffers = self.buffers.lock().expect("queue lock poisoned");
        self.size.fetch_add(handle.len(), Ordering::AcqRel);
        self.count.fetch_add(1, Ordering::AcqRel);
        buffers.push_back(handle);
    }

    /// Remove the front handle.
    #[must_use]
    pub fn pop(&self) -> Option<Handle> {
        let mut buffers = self.buffers.lock().expect("queue lock poisoned");
        let handle = buffers.pop_front()?;
        self.size.fetch_sub(handle.len(), Ordering::AcqRel);
        self.count.fetch_sub(1, Ordering::AcqRel);
        Some(handle)
    }

    /// Drain exactly `out.len()` words into `out`, releasing exhausted
    /// buffers. A partially drained tail buffer keeps its remaining words,
    /// moved to its front.
    ///
    /// # Errors
    ///
    /// Returns `BufferPoolNotEnough` if fewer words are queued than
    /// requested.
    pub fn copy_to(&self, out: &mut [u32]) -> Result<()> {
        let mut buffers = self.buffers.lock().expect("queue lock poisoned");
        if out.len() > self.size.load(Ordering::Acquire) {
            return Err(Error::BufferPoolNotEnough("not enough data in queue".into()));
        }
        let mut copied = 0;
        while copied < out.len() {
            let front = buffers.front_mut().expect("queue size accounted");
            let want = out.len() - copied;
            if want >= front.len() {
                out[copied..copied + front.len()].copy_from_slice(front);
                copied += front.len();
                self.size.fetch_sub(front.len(), Ordering::AcqRel);
                self.count.fetch_sub(1, Ordering::AcqRel);
                drop(buffers.pop_front());
            } else {
                out[copied..].copy_from_slice(&front[..want]);
                let left = front.len() - want;
                front.copy_within(want.., 0);
                front.truncate(left);
                self.size.fetch_sub(want, Ordering::AcqRel);
                copied += want;
            }
        }
        Ok(())
    }

    /// Coalesce later buffers into earlier partially-full ones. Idempotent;
    /// never changes the queued word count.
    pub fn compact(&self) {
        let mut buffers = self.buffers.lock().expect("queue lock poisoned");
        let mut to = 0;
        while to < buffers.len() {
            let spare = buffers[to].capacity().saturating_sub(buffers[to].len());
            if spare == 0 {
                to += 1;
                continue;
            }
            let mut moved = Vec::new();
            let mut from = to + 1;
            let mut room = spare;
            while room > 0 && from < buffers.len() {
                let take = room.min(buffers[from].len());
                moved.extend_from_slice(&buffers[from][..take]);
                let left = buffers[from].len() - take;
                buffers[from].copy_within(take.., 0);
                buffers[from].truncate(left);
                room -= take;
                from += 1;
            }
            if moved.is_empty() {
                to += 1;
                continue;
            }
            buffers[to].extend_from_slice(&moved);
            let drained = buffers
                .iter()
                .enumerate()
                .filter(|(i, b)| *i > to && b.is_empty())
                .count();
            buffers.retain(|b| !b.is_empty());
            self.count.fetch_sub(drained, Ordering::AcqRel);
            to += 1;
        }
    }

    /// Drop all queued buffers back to their pool.
    pub fn flush(&self) {
        let mut buffers = self.buffers.lock().expect("queue lock poisoned");
        buffers.clear();
        self.size.store(0, Ordering::Release);
        self.count.store(0, Ordering::Release);
    }

    /// Queued words.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Queued buffer count.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize, c: usize) -> Arc<Pool> {
        let pool = Pool::new();
        pool.create(n, c).unwrap();
        pool
    }

    #[test]
    fn create_twice_fails() {
        let p = pool(3, 64);
        assert_eq!(p.create(3, 64).unwrap_err().api_result(), 805);
    }

    #[test]
    fn exhaustion_and_release() {
        let p = pool(3, 1024);
        let a = p.request().unwrap();
        let _b = p.request().unwrap();
        let _c = p.request().unwrap();
        assert_eq!(p.request().unwrap_err().api_result(), 804);
        drop(a);
        assert!(p.request().is_ok());
    }

    #[test]
    fn destroy_busy_fails_then_recreate_restores() {
        let p = pool(2, 16);
        let h = p.request().unwrap();
        assert_eq!(p.destroy().unwrap_err().api_result(), 806);
        drop(h);
        p.destroy().unwrap();
        p.create(2, 16).unwrap();
        assert_eq!(p.available(), 2);
    }

    #[test]
    fn handle_returns_cleared() {
        let p = pool(1, 8);
        {
            let mut h = p.request().unwrap();
            h.extend_from_slice(&[1, 2, 3]);
        }
        let h = p.request().unwrap();
        assert!(h.is_empty());
    }

    fn fill(p: &Arc<Pool>, words: &[u32]) -> Handle {
        let mut h = p.request().unwrap();
        h.extend_from_slice(words);
        h
    }

    #[test]
    fn queue_accounts_sizes() {
        let p = pool(4, 256);
        let q = Queue::default();
        q.push(fill(&p, &[1; 100]));
        q.push(fill(&p, &[2; 50]));
        assert_eq!(q.size(), 150);
        assert_eq!(q.count(), 2);
        let h = q.pop().unwrap();
        assert_eq!(h.len(), 100);
        assert_eq!(q.size(), 50);
    }

    #[test]
    fn copy_drains_across_buffers_with_partial_tail() {
        let p = pool(4, 256);
        let q = Queue::default();
        let first: Vec<u32> = (0..100).collect();
        let second: Vec<u32> = (100..150).collect();
        let third: Vec<u32> = (150..180).collect();
        q.push(fill(&p, &first));
        q.push(fill(&p, &second));
        q.push(fill(&p, &third));

        let mut out = vec![0u32; 130];
        q.copy_to(&mut out).unwrap();
        let expect: Vec<u32> = (0..130).collect();
        assert_eq!(out, expect);

        // 50 words remain: the tail of buffer two plus buffer three.
        assert_eq!(q.size(), 50);
        assert_eq!(q.count(), 2);
        let mut rest = vec![0u32; 50];
        q.copy_to(&mut rest).unwrap();
        let expect: Vec<u32> = (130..180).collect();
        assert_eq!(rest, expect);
    }

    #[test]
    fn copy_too_much_fails() {
        let p = pool(2, 64);
        let q = Queue::default();
        q.push(fill(&p, &[7; 10]));
        let mut out = vec![0u32; 11];
        assert_eq!(q.copy_to(&mut out).unwrap_err().api_result(), 807);
    }

    #[test]
    fn compact_is_idempotent_and_size_preserving() {
        let p = pool(4, 100);
        let q = Queue::default();
        q.push(fill(&p, &[1; 60]));
        q.push(fill(&p, &[2; 60]));
        q.push(fill(&p, &[3; 30]));
        let before = q.size();
        q.compact();
        assert_eq!(q.size(), before);
        // 150 words fit into two 100-word buffers.
        assert_eq!(q.count(), 2);
        q.compact();
        assert_eq!(q.size(), before);
        assert_eq!(q.count(), 2);
    }

    #[test]
    fn flush_returns_buffers() {
        let p = pool(2, 16);
        let q = Queue::default();
        q.push(fill(&p, &[1; 4]));
        q.push(fill(&p, &[2; 4]));
        assert_eq!(p.available(), 0);
        q.flush();
        assert_eq!(p.available(), 2);
        assert_eq!(q.size(), 0);
    }
}
