// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use crate::utils::lock;
use crate::video_frame::FrameInfo;
use crate::video_frame::VideoFrame;

/// A buffer taken from a pool. It goes back to the pool when dropped, unless the pool itself is
/// gone, in which case it is simply freed.
#[derive(Debug)]
pub struct Pooled<T: Send + 'static> {
    inner: Option<T>,
    pool: Weak<Mutex<VecDeque<T>>>,
}

impl<T: Send + 'static> Pooled<T> {
    fn new(inner: T, pool: &Arc<Mutex<VecDeque<T>>>) -> Self {
        Self {
            inner: Some(inner),
            pool: Arc::downgrade(pool),
        }
    }
}

impl<T: Send + 'static> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `drop` takes the value out.
        match &self.inner {
            Some(inner) => inner,
            None => unreachable!("pooled buffer used after drop"),
        }
    }
}

impl<T: Send + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.inner {
            Some(inner) => inner,
            None => unreachable!("pooled buffer used after drop"),
        }
    }
}

impl<T: Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let (Some(pool), Some(inner)) = (self.pool.upgrade(), self.inner.take()) {
            lock(&pool).push_back(inner);
        }
    }
}

/// Fixed-size pool of reusable buffers. Buffers are created up front by `alloc_cb` on `resize`.
pub struct BufferPool<T: Send + 'static, P> {
    alloc_cb: Box<dyn FnMut(&P) -> T + Send + 'static>,
    pool: Option<Arc<Mutex<VecDeque<T>>>>,
}

impl<T: Send + 'static, P> BufferPool<T, P> {
    pub fn new(alloc_cb: impl FnMut(&P) -> T + Send + 'static) -> Self {
        Self {
            alloc_cb: Box::new(alloc_cb),
            pool: None,
        }
    }

    /// Replaces the pool content with `count` fresh buffers. Buffers still held from the
    /// previous pool are freed when dropped.
    pub fn resize(&mut self, params: &P, count: usize) {
        let mut pool: VecDeque<T> = VecDeque::new();
        for _i in 0..count {
            pool.push_back((self.alloc_cb)(params));
        }
        self.pool = Some(Arc::new(Mutex::new(pool)))
    }

    /// Takes a buffer out of the pool, or `None` if the pool is exhausted or was never sized.
    pub fn alloc(&self) -> Option<Pooled<T>> {
        let pool = self.pool.as_ref()?;
        let buffer = lock(pool).pop_front()?;
        Some(Pooled::new(buffer, pool))
    }

    /// Number of buffers currently available.
    pub fn num_free(&self) -> usize {
        self.pool.as_ref().map(|p| lock(p).len()).unwrap_or(0)
    }
}

pub type PooledVideoFrame<V> = Pooled<V>;

/// Pool of decoded frames, sized from the stream's [`FrameInfo`].
pub struct FramePool<V: VideoFrame> {
    inner: BufferPool<V, FrameInfo>,
}

impl<V: VideoFrame> FramePool<V> {
    pub fn new(alloc_cb: impl FnMut(&FrameInfo) -> V + Send + 'static) -> FramePool<V> {
        Self {
            inner: BufferPool::new(alloc_cb),
        }
    }

    pub fn resize(&mut self, info: &FrameInfo) {
        self.inner.resize(info, info.min_num_frames)
    }

    pub fn alloc(&self) -> Option<PooledVideoFrame<V>> {
        self.inner.alloc()
    }

    pub fn num_free(&self) -> usize {
        self.inner.num_free()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video_frame::PlanarFrame;
    use crate::Resolution;

    fn info(n: usize) -> FrameInfo {
        FrameInfo {
            resolution: Resolution::from((16, 16)),
            bit_depth: 8,
            min_num_frames: n,
            ..Default::default()
        }
    }

    #[test]
    fn frames_return_to_pool() {
        let mut pool = FramePool::new(PlanarFrame::new);
        assert!(pool.alloc().is_none());

        pool.resize(&info(2));
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        assert_eq!(a.resolution(), Resolution::from((16, 16)));

        drop(a);
        assert_eq!(pool.num_free(), 1);
        drop(b);
        assert_eq!(pool.num_free(), 2);
    }

    #[test]
    fn frames_outlive_resized_pool() {
        let mut pool = FramePool::new(PlanarFrame::new);
        pool.resize(&info(1));
        let old = pool.alloc().unwrap();
        pool.resize(&info(3));
        drop(old);
        assert_eq!(pool.num_free(), 3);
    }
}
