//! Lock-free SPSC byte rings connecting host threads to USB callbacks.
//!
//! Head and tail are monotonic word indices; occupancy is their wrapping
//! difference and positions are masked into the power-of-two buffer. The
//! producer publishes `head` with release ordering after copying data in,
//! the consumer observes it with acquire ordering before copying data out,
//! so payload bytes are never read before they are visible.
//!
//! The USB side never blocks on a ring: a short playback ring yields
//! silence, a full capture ring drops the frame. Host-side handles expose
//! the same non-blocking operations and leave pacing to the caller.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct RingInner {
    buf: Box<[UnsafeCell<u8>]>,
    mask: usize,
    /// Producer-owned write index, monotonic.
    head: AtomicUsize,
    /// Consumer-owned read index, monotonic.
    tail: AtomicUsize,
}

// The SPSC discipline (one producer handle, one consumer handle, each !Clone)
// plus the acquire/release pairing on the indices makes the cell array safe
// to share.
unsafe impl Send for RingInner {}
unsafe impl Sync for RingInner {}

impl RingInner {
    #[inline]
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Copy `src` into the buffer starting at logical position `at`,
    /// wrapping at most once.
    unsafe fn copy_in(&self, at: usize, src: &[u8]) {
        let start = at & self.mask;
        let first = src.len().min(self.capacity() - start);
        unsafe {
            let base = self.buf.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(start), first);
            std::ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
        }
    }

    /// Copy out of the buffer starting at logical position `at`, wrapping at
    /// most once.
    unsafe fn copy_out(&self, at: usize, dst: &mut [u8]) {
        let start = at & self.mask;
        let first = dst.len().min(self.capacity() - start);
        unsafe {
            let base = self.buf.as_ptr() as *const u8;
            std::ptr::copy_nonoverlapping(base.add(start), dst.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), dst.len() - first);
        }
    }
}

/// Create a byte ring. `capacity` is rounded up to the next power of two.
pub fn byte_ring(capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(capacity > 0, "ring capacity must be non-zero");
    let capacity = capacity.next_power_of_two();
    let inner = Arc::new(RingInner {
        buf: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
        mask: capacity - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        RingProducer {
            inner: Arc::clone(&inner),
        },
        RingConsumer { inner },
    )
}

/// Writing half of a byte ring.
pub struct RingProducer {
    inner: Arc<RingInner>,
}

impl RingProducer {
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Bytes that can currently be written without overwriting unread data.
    pub fn free(&self) -> usize {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);
        self.inner.capacity() - head.wrapping_sub(tail)
    }

    /// Copy as much of `data` as fits. Returns the number of bytes written.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);
        let free = self.inner.capacity() - head.wrapping_sub(tail);
        let n = free.min(data.len());
        if n == 0 {
            return 0;
        }
        unsafe { self.inner.copy_in(head, &data[..n]) };
        self.inner.head.store(head.wrapping_add(n), Ordering::Release);
        n
    }

    /// All-or-nothing write. Returns `false` (and writes nothing) if `data`
    /// does not fit.
    pub fn write_all(&mut self, data: &[u8]) -> bool {
        if self.free() < data.len() {
            return false;
        }
        let head = self.inner.head.load(Ordering::Relaxed);
        unsafe { self.inner.copy_in(head, data) };
        self.inner
            .head
            .store(head.wrapping_add(data.len()), Ordering::Release);
        true
    }
}

/// Reading half of a byte ring.
pub struct RingConsumer {
    inner: Arc<RingInner>,
}

impl RingConsumer {
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Unread bytes currently in the ring.
    pub fn occupancy(&self) -> usize {
        let head = self.inner.head.load(Ordering::Acquire);
        let tail = self.inner.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    /// Copy up to `out.len()` bytes out. Returns the number of bytes read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let head = self.inner.head.load(Ordering::Acquire);
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let n = head.wrapping_sub(tail).min(out.len());
        if n == 0 {
            return 0;
        }
        unsafe { self.inner.copy_out(tail, &mut out[..n]) };
        self.inner.tail.store(tail.wrapping_add(n), Ordering::Release);
        n
    }

    /// All-or-nothing read. Returns `false` (and reads nothing) if fewer than
    /// `out.len()` bytes are available.
    pub fn read_exact(&mut self, out: &mut [u8]) -> bool {
        if self.occupancy() < out.len() {
            return false;
        }
        let tail = self.inner.tail.load(Ordering::Relaxed);
        unsafe { self.inner.copy_out(tail, out) };
        self.inner
            .tail
            .store(tail.wrapping_add(out.len()), Ordering::Release);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        let (producer, _consumer) = byte_ring(3000);
        assert_eq!(producer.capacity(), 4096);
    }

    #[test]
    fn test_write_then_read() {
        let (mut producer, mut consumer) = byte_ring(16);
        assert_eq!(producer.write(&[1, 2, 3, 4]), 4);
        assert_eq!(consumer.occupancy(), 4);

        let mut out = [0u8; 4];
        assert_eq!(consumer.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(consumer.occupancy(), 0);
    }

    #[test]
    fn test_partial_write_when_nearly_full() {
        let (mut producer, mut consumer) = byte_ring(8);
        assert_eq!(producer.write(&[0; 6]), 6);
        assert_eq!(producer.write(&[1, 2, 3, 4]), 2);
        assert_eq!(producer.free(), 0);

        let mut out = [0u8; 8];
        assert_eq!(consumer.read(&mut out), 8);
        assert_eq!(&out[6..], &[1, 2]);
    }

    #[test]
    fn test_write_all_is_all_or_nothing() {
        let (mut producer, mut consumer) = byte_ring(8);
        assert!(producer.write_all(&[0; 6]));
        assert!(!producer.write_all(&[0; 4]));
        assert_eq!(consumer.occupancy(), 6);
    }

    #[test]
    fn test_read_exact_is_all_or_nothing() {
        let (mut producer, mut consumer) = byte_ring(8);
        producer.write(&[9, 9, 9]);

        let mut out = [0u8; 4];
        assert!(!consumer.read_exact(&mut out));
        assert_eq!(consumer.occupancy(), 3);

        let mut out = [0u8; 3];
        assert!(consumer.read_exact(&mut out));
        assert_eq!(out, [9, 9, 9]);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let (mut producer, mut consumer) = byte_ring(8);
        let mut next_write = 0u8;
        let mut next_read = 0u8;

        // Cycle enough bytes through to wrap several times with the indices
        // straddling the buffer edge.
        for _ in 0..100 {
            for _ in 0..5 {
                if producer.write(&[next_write]) == 1 {
                    next_write = next_write.wrapping_add(1);
                }
            }
            let mut out = [0u8; 5];
            let n = consumer.read(&mut out);
            for &b in &out[..n] {
                assert_eq!(b, next_read);
                next_read = next_read.wrapping_add(1);
            }
        }
    }

    #[test]
    fn test_spsc_threads_preserve_byte_order() {
        use std::thread;

        const TOTAL: usize = 1 << 20;
        let (mut producer, mut consumer) = byte_ring(1024);

        let writer = thread::spawn(move || {
            let mut sent = 0usize;
            while sent < TOTAL {
                let chunk_len = (sent % 37) + 1;
                let chunk: Vec<u8> = (0..chunk_len)
                    .map(|i| ((sent + i) % 251) as u8)
                    .collect();
                let n = producer.write(&chunk);
                sent += n;
                if n == 0 {
                    thread::yield_now();
                }
            }
        });

        let reader = thread::spawn(move || {
            let mut received = 0usize;
            let mut out = [0u8; 64];
            while received < TOTAL {
                let n = consumer.read(&mut out);
                for &b in &out[..n] {
                    assert_eq!(b, (received % 251) as u8, "corrupt byte at {received}");
                    received += 1;
                }
                if n == 0 {
                    thread::yield_now();
                }
            }
        });

        writer.join().unwrap();
        reader.join().unwrap();
    }
}
