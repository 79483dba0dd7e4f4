//! A single-owner object pool for reusing `Downloader` send buffers.
//!
//! Adapted from the teacher's `Pool<T>`/`BufferPool`: same get/put/Drop
//! shape, but backed by `Rc<RefCell<Vec<T>>>` instead of
//! `Arc<parking_lot::Mutex<Vec<T>>>`. spec.md §5 requires the content
//! manager core to run on a single thread with no internal locking, so
//! there is nothing here for a `Mutex` to protect.

use std::cell::RefCell;
use std::rc::Rc;

struct Inner<T> {
    items: RefCell<Vec<T>>,
    factory: Box<dyn Fn() -> T>,
    reset: Box<dyn Fn(&mut T)>,
    max_size: usize,
}

/// A reusable pool of `T`, handed out as `PooledItem<T>` that returns
/// itself on drop.
pub struct Pool<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Pool<T> {
    pub fn new<F, R>(factory: F, reset: R, max_size: usize) -> Self
    where
        F: Fn() -> T + 'static,
        R: Fn(&mut T) + 'static,
    {
        Self {
            inner: Rc::new(Inner {
                items: RefCell::new(Vec::with_capacity(max_size)),
                factory: Box::new(factory),
                reset: Box::new(reset),
                max_size,
            }),
        }
    }

    pub fn get(&self) -> PooledItem<T> {
        let item = self.inner.items.borrow_mut().pop();
        let item = item.unwrap_or_else(|| (self.inner.factory)());
        PooledItem {
            item: Some(item),
            pool: self.clone(),
        }
    }

    fn put(&self, mut item: T) {
        (self.inner.reset)(&mut item);
        let mut items = self.inner.items.borrow_mut();
        if items.len() < self.inner.max_size {
            items.push(item);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct PooledItem<T> {
    item: Option<T>,
    pool: Pool<T>,
}

impl<T> std::ops::Deref for PooledItem<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.item.as_ref().unwrap()
    }
}

impl<T> std::ops::DerefMut for PooledItem<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.item.as_mut().unwrap()
    }
}

impl<T> Drop for PooledItem<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.put(item);
        }
    }
}

/// Pool of reusable outbound send buffers, sized from `Config`.
pub struct BufferPool {
    pool: Pool<Vec<u8>>,
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, max_buffers: usize) -> Self {
        Self {
            pool: Pool::new(
                move || Vec::with_capacity(buffer_capacity),
                |buf| buf.clear(),
                max_buffers,
            ),
        }
    }

    pub fn get(&self) -> PooledItem<Vec<u8>> {
        self.pool.get()
    }
}

impl Clone for BufferPool {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reused_buffer_is_cleared_but_keeps_capacity() {
        let pool = BufferPool::new(64, 4);

        let mut buf = pool.get();
        buf.extend_from_slice(b"hello");
        drop(buf);

        let buf2 = pool.get();
        assert!(buf2.is_empty());
        assert!(buf2.capacity() >= 64);
    }

    #[test]
    fn pool_does_not_grow_past_max_size() {
        let pool: Pool<Vec<u8>> = Pool::new(Vec::new, |v| v.clear(), 2);
        let a = pool.get();
        let b = pool.get();
        let c = pool.get();
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.len(), 2);
    }
}
