//! Lock-free single-producer single-consumer byte ring.
//!
//! The ring lives inside a shared mapping and is used by exactly one writer
//! and one reader, normally in two different processes. There is no lock:
//! the writer owns `head`, the reader owns `tail`, and every cursor update is
//! published with Release and observed with Acquire.
//!
//! Cursors run modulo `2 * C`. Equal cursors mean empty, a distance of `C`
//! means full, which works for any capacity, not only powers of two.
//!
//! ```text
//! ┌──────────────────────┬──────────────────────┬────────────────────────┐
//! │ head (writer, 64 B)  │ tail (reader, 64 B)  │ data: [u8; C]          │
//! └──────────────────────┴──────────────────────┴────────────────────────┘
//! ```

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use shmlink::consts::CACHE_LINE_SIZE;

#[repr(C, align(64))]
struct Cursor {
    value: AtomicUsize,
    _pad: [u8; CACHE_LINE_SIZE - size_of::<AtomicUsize>()],
}

impl Cursor {
    const fn new() -> Self {
        Self {
            value: AtomicUsize::new(0),
            _pad: [0; CACHE_LINE_SIZE - size_of::<AtomicUsize>()],
        }
    }
}

/// Fixed-capacity byte FIFO for one writer and one reader.
#[repr(C, align(64))]
pub struct RingBuffer<const C: usize> {
    head: Cursor,
    tail: Cursor,
    data: UnsafeCell<[u8; C]>,
}

// SAFETY: `data` is only written by the single producer in the free region
// and only read by the single consumer in the used region. The cursors,
// published with Release/Acquire, keep the two regions disjoint.
unsafe impl<const C: usize> Sync for RingBuffer<C> {}

impl<const C: usize> RingBuffer<C> {
    const WRAP: usize = 2 * C;

    /// Create an empty ring.
    pub const fn new() -> Self {
        Self {
            head: Cursor::new(),
            tail: Cursor::new(),
            data: UnsafeCell::new([0; C]),
        }
    }

    /// Capacity in bytes.
    pub const fn capacity(&self) -> usize {
        C
    }

    /// Reset both cursors to empty.
    ///
    /// Only valid before either side starts using the ring.
    pub fn init(&self) {
        self.head.value.store(0, Ordering::Relaxed);
        self.tail.value.store(0, Ordering::Release);
    }

    /// Bytes available to the reader.
    #[inline]
    pub fn used_space(&self) -> usize {
        let head = self.head.value.load(Ordering::Acquire);
        let tail = self.tail.value.load(Ordering::Acquire);
        Self::distance(head, tail)
    }

    /// Bytes available to the writer.
    #[inline]
    pub fn free_space(&self) -> usize {
        C - self.used_space()
    }

    /// Handle for the writing side.
    ///
    /// # Safety
    ///
    /// The caller must be the only writer of this ring, across all processes
    /// mapping it, for as long as the handle lives.
    pub unsafe fn producer(&self) -> Producer<'_, C> {
        Producer { ring: self }
    }

    /// Handle for the reading side.
    ///
    /// # Safety
    ///
    /// The caller must be the only reader of this ring, across all processes
    /// mapping it, for as long as the handle lives.
    pub unsafe fn consumer(&self) -> Consumer<'_, C> {
        Consumer { ring: self }
    }

    #[inline]
    fn distance(head: usize, tail: usize) -> usize {
        if head >= tail {
            head - tail
        } else {
            head + Self::WRAP - tail
        }
    }

    #[inline]
    fn advance(cursor: usize, by: usize) -> usize {
        let next = cursor + by;
        if next >= Self::WRAP { next - Self::WRAP } else { next }
    }

    #[inline]
    fn index(cursor: usize) -> usize {
        if cursor >= C { cursor - C } else { cursor }
    }

    fn base(&self) -> *mut u8 {
        self.data.get().cast::<u8>()
    }
}

impl<const C: usize> Default for RingBuffer<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Writing side of a [`RingBuffer`].
pub struct Producer<'a, const C: usize> {
    ring: &'a RingBuffer<C>,
}

impl<const C: usize> Producer<'_, C> {
    /// Bytes that can be written without overwriting unread data.
    ///
    /// Only the reader changes this concurrently, and only upwards, so the
    /// value is a safe lower bound for the next [`Producer::write`].
    #[inline]
    pub fn free_space(&self) -> usize {
        self.ring.free_space()
    }

    /// Copy `min(src.len(), free_space())` bytes in and publish them.
    ///
    /// Returns the number of bytes written.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let ring = self.ring;
        let head = ring.head.value.load(Ordering::Relaxed);
        let tail = ring.tail.value.load(Ordering::Acquire);
        let free = C - RingBuffer::<C>::distance(head, tail);
        debug_assert!(src.len() <= free, "write of {} bytes into {} free", src.len(), free);

        let n = src.len().min(free);
        if n == 0 {
            return 0;
        }

        let start = RingBuffer::<C>::index(head);
        let first = n.min(C - start);
        // SAFETY: [start, start + first) and [0, n - first) lie in the free
        // region, which the consumer never touches until `head` is published.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ring.base().add(start), first);
            std::ptr::copy_nonoverlapping(src.as_ptr().add(first), ring.base(), n - first);
        }

        ring.head
            .value
            .store(RingBuffer::<C>::advance(head, n), Ordering::Release);
        n
    }
}

/// Reading side of a [`RingBuffer`].
pub struct Consumer<'a, const C: usize> {
    ring: &'a RingBuffer<C>,
}

impl<const C: usize> Consumer<'_, C> {
    /// Bytes ready to be read.
    ///
    /// Only the writer changes this concurrently, and only upwards.
    #[inline]
    pub fn used_space(&self) -> usize {
        self.ring.used_space()
    }

    /// Copy `min(dst.len(), used_space())` bytes out and release the space.
    ///
    /// Returns the number of bytes read.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let ring = self.ring;
        let tail = ring.tail.value.load(Ordering::Relaxed);
        let head = ring.head.value.load(Ordering::Acquire);
        let n = dst.len().min(RingBuffer::<C>::distance(head, tail));
        if n == 0 {
            return 0;
        }

        let start = RingBuffer::<C>::index(tail);
        let first = n.min(C - start);
        // SAFETY: the used region was published by the producer's Release
        // store of `head`, observed by the Acquire load above.
        unsafe {
            std::ptr::copy_nonoverlapping(ring.base().add(start), dst.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(ring.base(), dst.as_mut_ptr().add(first), n - first);
        }

        ring.tail
            .value
            .store(RingBuffer::<C>::advance(tail, n), Ordering::Release);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn boxed<const C: usize>() -> Box<RingBuffer<C>> {
        Box::new(RingBuffer::new())
    }

    #[test]
    fn test_empty_ring() {
        let ring = boxed::<64>();
        assert_eq!(ring.capacity(), 64);
        assert_eq!(ring.used_space(), 0);
        assert_eq!(ring.free_space(), 64);
    }

    #[test]
    fn test_layout_alignment() {
        assert_eq!(std::mem::align_of::<RingBuffer<16>>(), 64);
        assert_eq!(std::mem::size_of::<RingBuffer<64>>(), 64 + 64 + 64);
    }

    #[test]
    fn test_fill_and_drain() {
        let ring = boxed::<8>();
        let (mut tx, mut rx) = unsafe { (ring.producer(), ring.consumer()) };

        assert_eq!(tx.write(b"abcdefgh"), 8);
        assert_eq!(ring.free_space(), 0);
        assert_eq!(ring.used_space(), 8);

        let mut out = [0u8; 8];
        assert_eq!(rx.read(&mut out), 8);
        assert_eq!(&out, b"abcdefgh");
        assert_eq!(ring.used_space(), 0);
    }

    #[test]
    fn test_wrap_around() {
        let ring = boxed::<8>();
        let (mut tx, mut rx) = unsafe { (ring.producer(), ring.consumer()) };
        let mut out = [0u8; 8];

        assert_eq!(tx.write(b"123456"), 6);
        assert_eq!(rx.read(&mut out[..4]), 4);
        assert_eq!(&out[..4], b"1234");

        // Crosses the end of the backing array.
        assert_eq!(tx.write(b"abcdef"), 6);
        assert_eq!(ring.used_space(), 8);
        assert_eq!(rx.read(&mut out), 8);
        assert_eq!(&out, b"56abcdef");
    }

    #[test]
    fn test_short_read_returns_available() {
        let ring = boxed::<32>();
        let (mut tx, mut rx) = unsafe { (ring.producer(), ring.consumer()) };

        tx.write(b"xyz");
        let mut out = [0u8; 16];
        assert_eq!(rx.read(&mut out), 3);
        assert_eq!(&out[..3], b"xyz");
        assert_eq!(rx.read(&mut out), 0);
    }

    #[test]
    fn test_init_resets_cursors() {
        let ring = boxed::<16>();
        unsafe { ring.producer() }.write(b"hello");
        ring.init();
        assert_eq!(ring.used_space(), 0);
    }

    #[test]
    fn test_cross_thread_stream() {
        const TOTAL: usize = 100_000;
        let ring: &'static RingBuffer<64> = Box::leak(boxed::<64>());

        let writer = std::thread::spawn(move || {
            let mut tx = unsafe { ring.producer() };
            let mut sent = 0usize;
            while sent < TOTAL {
                let chunk: Vec<u8> = (sent..TOTAL.min(sent + 13)).map(|i| i as u8).collect();
                let n = chunk.len().min(tx.free_space());
                sent += tx.write(&chunk[..n]);
            }
        });

        let mut rx = unsafe { ring.consumer() };
        let mut received = 0usize;
        let mut buf = [0u8; 7];
        while received < TOTAL {
            let n = rx.read(&mut buf);
            for (offset, byte) in buf[..n].iter().enumerate() {
                assert_eq!(*byte, (received + offset) as u8);
            }
            received += n;
        }
        writer.join().unwrap();
        assert_eq!(ring.used_space(), 0);
    }

    proptest! {
        #[test]
        fn prop_space_invariant_and_fifo_order(
            ops in proptest::collection::vec((any::<bool>(), 0usize..40), 1..200)
        ) {
            let ring = boxed::<37>();
            let (mut tx, mut rx) = unsafe { (ring.producer(), ring.consumer()) };
            let mut model = std::collections::VecDeque::new();
            let mut next = 0u8;

            for (is_write, len) in ops {
                if is_write {
                    let n = len.min(tx.free_space());
                    let chunk: Vec<u8> = (0..n).map(|_| { next = next.wrapping_add(1); next }).collect();
                    prop_assert_eq!(tx.write(&chunk), n);
                    model.extend(chunk);
                } else {
                    let mut out = vec![0u8; len];
                    let n = rx.read(&mut out);
                    prop_assert_eq!(n, len.min(model.len()));
                    let expected: Vec<u8> = model.drain(..n).collect();
                    prop_assert_eq!(&out[..n], &expected[..]);
                }
                prop_assert_eq!(ring.used_space() + ring.free_space(), 37);
                prop_assert_eq!(ring.used_space(), model.len());
            }
        }
    }
}
