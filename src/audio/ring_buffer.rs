//! Lock-free Single-Producer Single-Consumer 字节环形缓冲区
//!
//! 设计目标：
//! - 零锁：生产者和消费者完全无锁操作
//! - 零分配：所有内存在创建时预分配
//! - 缓存友好：读写游标各自独占 cache line，避免 false sharing
//! - 内存锁定：可选 mlock 防止 page fault
//!
//! 以「区域」为单位访问：acquire 得到一段连续（不跨越环绕点）的内存，
//! 处理完后 release 实际使用的字节数。
//!
//! 用于硬件回调线程和模拟线程之间的数据传递：
//! - 播放：模拟线程生产，render 回调消费
//! - 录音：capture 回调生产，模拟线程消费

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

/// SPSC 字节环形缓冲区
///
/// 游标取值范围是 [0, 2 * capacity)，这样「满」和「空」不需要额外标志即可区分，
/// 而且容量不必是 2 的幂（按帧大小整数倍分配）。
pub struct RingBuffer {
    buffer: Box<[UnsafeCell<u8>]>,
    capacity: usize,

    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,

    memory_locked: AtomicBool,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// 创建指定字节容量的缓冲区，返回生产者/消费者两端
    ///
    /// 两端各自只能有一个持有者，这正是 SPSC 的前提。
    pub fn with_capacity(capacity: usize) -> (Producer, Consumer) {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");

        let buffer: Vec<UnsafeCell<u8>> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();

        let ring = Arc::new(Self {
            buffer: buffer.into_boxed_slice(),
            capacity,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
            memory_locked: AtomicBool::new(false),
        });

        (
            Producer {
                ring: ring.clone(),
                granted: 0,
            },
            Consumer { ring, granted: 0 },
        )
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前可读字节数
    #[inline]
    pub fn used_bytes(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        self.distance(read, write)
    }

    /// 当前可写字节数
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.capacity - self.used_bytes()
    }

    /// 清空缓冲区，游标回到 0
    ///
    /// # Safety
    ///
    /// 调用期间生产者和消费者都不能持有或申请区域。
    /// 流控制只在硬件回调停止后（start 之前）调用。
    pub unsafe fn reset(&self) {
        self.read_pos.store(0, Ordering::Release);
        self.write_pos.store(0, Ordering::Release);
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 返回是否成功锁定
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        let result = unsafe { libc::mlock(ptr, self.capacity) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Ring buffer memory locked: {} bytes", self.capacity);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&self) {
        if !self.memory_locked.swap(false, Ordering::AcqRel) {
            return;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        unsafe {
            libc::munlock(ptr, self.capacity);
        }
        log::debug!("Ring buffer memory unlocked");
    }

    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked.load(Ordering::Acquire)
    }

    /// from → to 之间的字节数（游标模 2*capacity）
    #[inline]
    fn distance(&self, from: usize, to: usize) -> usize {
        if to >= from {
            to - from
        } else {
            to + 2 * self.capacity - from
        }
    }

    #[inline]
    fn advance(&self, pos: usize, n: usize) -> usize {
        let next = pos + n;
        if next >= 2 * self.capacity {
            next - 2 * self.capacity
        } else {
            next
        }
    }

    #[inline]
    fn index(&self, pos: usize) -> usize {
        if pos >= self.capacity {
            pos - self.capacity
        } else {
            pos
        }
    }

    /// # Safety
    ///
    /// [offset, offset + len) 必须在容量范围内，且当前只有调用方访问这段内存
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn region_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.capacity);
        // UnsafeCell<u8> 与 u8 布局相同
        let base = self.buffer.as_ptr() as *mut u8;
        std::slice::from_raw_parts_mut(base.add(offset), len)
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

/// 生产者端：只推进写游标
pub struct Producer {
    ring: Arc<RingBuffer>,
    granted: usize,
}

impl Producer {
    /// 申请一段可写区域
    ///
    /// 返回的长度可能小于 `max_bytes`（空间不足或到达环绕点），调用方需要循环。
    /// 长度为 0 表示当前已满，不是错误。
    #[inline]
    pub fn acquire_write_region(&mut self, max_bytes: usize) -> &mut [u8] {
        let ring = &*self.ring;
        let write = ring.write_pos.load(Ordering::Relaxed);
        let read = ring.read_pos.load(Ordering::Acquire);

        let used = ring.distance(read, write);
        debug_assert!(used <= ring.capacity, "ring buffer invariant violated: used > capacity");

        let offset = ring.index(write);
        let len = max_bytes.min(ring.capacity - used).min(ring.capacity - offset);
        self.granted = len;

        // 写游标只由本端推进，[offset, offset+len) 不与消费者未释放的字节重叠
        unsafe { ring.region_mut(offset, len) }
    }

    /// 提交实际写入的字节数（不能超过最近一次申请到的长度）
    #[inline]
    pub fn release_write_region(&mut self, written: usize) {
        debug_assert!(written <= self.granted, "released more than granted");
        let written = written.min(self.granted);
        self.granted = 0;

        let ring = &*self.ring;
        let write = ring.write_pos.load(Ordering::Relaxed);
        ring.write_pos.store(ring.advance(write, written), Ordering::Release);
    }

    /// 循环写入整个切片，返回实际写入的字节数
    pub fn push_slice(&mut self, mut data: &[u8]) -> usize {
        let mut total = 0;
        while !data.is_empty() {
            let region = self.acquire_write_region(data.len());
            let n = region.len();
            if n == 0 {
                break;
            }
            region.copy_from_slice(&data[..n]);
            self.release_write_region(n);
            data = &data[n..];
            total += n;
        }
        total
    }

    #[inline]
    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }
}

/// 消费者端：只推进读游标
pub struct Consumer {
    ring: Arc<RingBuffer>,
    granted: usize,
}

impl Consumer {
    /// 申请一段可读区域
    ///
    /// 长度为 0 表示当前为空，不是错误。
    #[inline]
    pub fn acquire_read_region(&mut self, max_bytes: usize) -> &[u8] {
        let ring = &*self.ring;
        let read = ring.read_pos.load(Ordering::Relaxed);
        let write = ring.write_pos.load(Ordering::Acquire);

        let used = ring.distance(read, write);
        let offset = ring.index(read);
        let len = max_bytes.min(used).min(ring.capacity - offset);
        self.granted = len;

        unsafe { ring.region_mut(offset, len) }
    }

    /// 释放实际读取的字节数
    #[inline]
    pub fn release_read_region(&mut self, read: usize) {
        debug_assert!(read <= self.granted, "released more than granted");
        let read = read.min(self.granted);
        self.granted = 0;

        let ring = &*self.ring;
        let pos = ring.read_pos.load(Ordering::Relaxed);
        ring.read_pos.store(ring.advance(pos, read), Ordering::Release);
    }

    /// 循环读取到 `output`，返回实际读取的字节数
    pub fn pop_slice(&mut self, output: &mut [u8]) -> usize {
        let mut total = 0;
        while total < output.len() {
            let region = self.acquire_read_region(output.len() - total);
            let n = region.len();
            if n == 0 {
                break;
            }
            output[total..total + n].copy_from_slice(region);
            self.release_read_region(n);
            total += n;
        }
        total
    }

    #[inline]
    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn assert_conserved(ring: &RingBuffer) {
        assert_eq!(ring.used_bytes() + ring.free_bytes(), ring.capacity());
    }

    #[test]
    fn test_ring_buffer_basic() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(16);

        assert_eq!(tx.push_slice(&[1, 2, 3, 4]), 4);
        assert_eq!(rx.ring().used_bytes(), 4);

        let mut output = [0u8; 4];
        assert_eq!(rx.pop_slice(&mut output), 4);
        assert_eq!(output, [1, 2, 3, 4]);
        assert_eq!(rx.ring().used_bytes(), 0);
    }

    #[test]
    fn test_region_is_short_at_wrap_point() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(6);

        assert_eq!(tx.push_slice(&[1, 2, 3, 4]), 4);
        let mut out = [0u8; 3];
        assert_eq!(rx.pop_slice(&mut out), 3);

        // 写游标在 4，距离环绕点只剩 2 字节
        let region = tx.acquire_write_region(5);
        assert_eq!(region.len(), 2);
        region.copy_from_slice(&[5, 6]);
        tx.release_write_region(2);

        let region = tx.acquire_write_region(5);
        assert_eq!(region.len(), 3);
        region.copy_from_slice(&[7, 8, 9]);
        tx.release_write_region(3);

        // 满了
        assert_eq!(tx.acquire_write_region(1).len(), 0);
        tx.release_write_region(0);

        let mut all = [0u8; 6];
        assert_eq!(rx.pop_slice(&mut all), 6);
        assert_eq!(all, [4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_full_then_drain_4096() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(4096);

        let region = tx.acquire_write_region(4096);
        assert_eq!(region.len(), 4096);
        region.fill(0xAB);
        tx.release_write_region(4096);

        assert_eq!(tx.acquire_write_region(1).len(), 0);
        tx.release_write_region(0);

        let region = rx.acquire_read_region(4096);
        assert_eq!(region.len(), 4096);
        assert!(region.iter().all(|&b| b == 0xAB));
        rx.release_read_region(4096);

        assert_eq!(tx.acquire_write_region(4096).len(), 4096);
    }

    #[test]
    fn test_empty_read_returns_zero() {
        let (_tx, mut rx) = RingBuffer::with_capacity(4);
        assert_eq!(rx.acquire_read_region(4).len(), 0);
        rx.release_read_region(0);
    }

    #[test]
    fn test_partial_release_keeps_rest() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(8);
        let region = tx.acquire_write_region(8);
        region.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        // 只提交 3 字节
        tx.release_write_region(3);
        assert_eq!(rx.ring().used_bytes(), 3);

        let region = rx.acquire_read_region(8);
        assert_eq!(region, &[1, 2, 3]);
        rx.release_read_region(1);
        assert_eq!(rx.ring().used_bytes(), 2);
        assert_eq!(rx.ring().free_bytes(), 6);
    }

    #[test]
    fn test_used_plus_free_is_capacity() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);
        let (mut tx, mut rx) = RingBuffer::with_capacity(1000);

        for _ in 0..10_000 {
            if rng.gen_bool(0.5) {
                let want = rng.gen_range(0..=1200);
                let granted = tx.acquire_write_region(want).len();
                let commit = rng.gen_range(0..=granted);
                tx.release_write_region(commit);
            } else {
                let want = rng.gen_range(0..=1200);
                let granted = rx.acquire_read_region(want).len();
                let commit = rng.gen_range(0..=granted);
                rx.release_read_region(commit);
            }
            assert_conserved(tx.ring());
        }
    }

    #[test]
    fn test_reset_when_quiesced() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(32);
        tx.push_slice(&[7; 20]);
        let mut out = [0u8; 5];
        rx.pop_slice(&mut out);

        unsafe { tx.ring().reset() };
        assert_eq!(rx.ring().used_bytes(), 0);
        assert_eq!(tx.acquire_write_region(64).len(), 32);
    }

    #[test]
    fn test_concurrent_stream_keeps_order() {
        // 生产者写递增序列，消费者校验：任何覆盖未读字节的情况都会打乱顺序
        const TOTAL: usize = 1 << 20;
        let (mut tx, mut rx) = RingBuffer::with_capacity(1531);

        let producer = std::thread::spawn(move || {
            let mut next = 0usize;
            while next < TOTAL {
                let region = tx.acquire_write_region(TOTAL - next);
                let n = region.len();
                for (i, b) in region.iter_mut().enumerate() {
                    *b = ((next + i) % 251) as u8;
                }
                tx.release_write_region(n);
                next += n;
                if n == 0 {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0usize;
        while expected < TOTAL {
            let region = rx.acquire_read_region(TOTAL - expected);
            let n = region.len();
            for (i, &b) in region.iter().enumerate() {
                assert_eq!(b, ((expected + i) % 251) as u8);
            }
            rx.release_read_region(n);
            expected += n;
            if n == 0 {
                std::thread::yield_now();
            }
        }

        producer.join().unwrap();
    }

    #[test]
    fn test_memory_lock_flag_follows_unlock() {
        let (producer, _consumer) = RingBuffer::with_capacity(4096);
        let ring = producer.ring();
        assert!(!ring.is_memory_locked());

        // 受 RLIMIT_MEMLOCK 限制，mlock 可能失败；标志必须和返回值一致
        let locked = ring.lock_memory();
        assert_eq!(ring.is_memory_locked(), locked);

        ring.unlock_memory();
        assert!(!ring.is_memory_locked());
    }

    #[test]
    fn test_cache_padded_cursors() {
        assert!(std::mem::align_of::<CachePadded<AtomicUsize>>() >= 64);
    }
}
