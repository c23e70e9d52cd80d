//! Lock-free fan-out of captured PCM bytes
//!
//! The capture callback pushes every block into two independent bounded
//! queues, one per output channel. Each queue has exactly one producer (the
//! capture delivery thread) and one consumer (that channel's pump).
//!
//! Overflow policy is drop-oldest: a push never blocks and never discards the
//! bytes being pushed. Instead the producer advances the read position past
//! the oldest whole frames. The consumer commits a read with a CAS on the same
//! position, so a read that raced with an eviction is discarded and retried.
//!
//! Performance characteristics:
//! - Lock-free (no mutex contention)
//! - Producer is wait-free except for a CAS retry on concurrent reads
//! - No allocations in the hot path

use audiomirror_core::ChannelId;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Per-queue capacity used by the engine
pub const DEFAULT_FANOUT_CAPACITY: usize = 256 * 1024;

/// Bounded single-producer single-consumer byte queue with drop-oldest overflow
pub struct ByteQueue {
    /// Byte storage; atomics so a racing eviction never reads torn memory
    slots: Box<[AtomicU8]>,

    /// Total bytes ever written (wrapping)
    write_pos: CachePadded<AtomicUsize>,

    /// Total bytes ever consumed or evicted (wrapping)
    read_pos: CachePadded<AtomicUsize>,

    /// Bytes discarded by overflow
    dropped: AtomicU64,

    /// Capacity, power of 2
    capacity: usize,

    /// Capacity rounded down to whole frames
    usable: usize,

    mask: usize,

    /// Bytes per frame; reads and evictions happen in multiples of this
    align: usize,
}

impl ByteQueue {
    /// Create a queue holding `capacity` bytes of `align`-byte frames
    ///
    /// Capacity will be rounded up to the next power of 2.
    pub fn with_capacity(capacity: usize, align: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let align = align.clamp(1, capacity);

        Self {
            slots: (0..capacity).map(|_| AtomicU8::new(0)).collect(),
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
            dropped: AtomicU64::new(0),
            capacity,
            usable: capacity - capacity % align,
            mask: capacity - 1,
            align,
        }
    }

    /// Append `bytes`, evicting the oldest frames if the queue would overflow
    ///
    /// Must only be called from the single producer.
    pub fn push(&self, bytes: &[u8]) {
        // More than fits: only the newest whole frames survive
        let bytes = if bytes.len() > self.usable {
            let skipped = bytes.len() - self.usable;
            self.dropped.fetch_add(skipped as u64, Ordering::Relaxed);
            &bytes[skipped..]
        } else {
            bytes
        };
        if bytes.is_empty() {
            return;
        }

        let write = self.write_pos.load(Ordering::Relaxed);

        loop {
            let read = self.read_pos.load(Ordering::Acquire);
            let used = write.wrapping_sub(read);
            let free = self.usable.saturating_sub(used);
            if bytes.len() <= free {
                break;
            }

            let needed = bytes.len() - free;
            let evict = round_up(needed, self.align).min(used);
            if self
                .read_pos
                .compare_exchange(read, read.wrapping_add(evict), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.dropped.fetch_add(evict as u64, Ordering::Relaxed);
                break;
            }
        }

        for (i, byte) in bytes.iter().enumerate() {
            self.slots[write.wrapping_add(i) & self.mask].store(*byte, Ordering::Relaxed);
        }

        // Release: slot stores are visible before the new position
        self.write_pos
            .store(write.wrapping_add(bytes.len()), Ordering::Release);
    }

    /// Move up to `dst.len()` of the oldest bytes into `dst`, whole frames only
    ///
    /// Returns the number of bytes written; 0 means nothing is queued. Must
    /// only be called from the single consumer.
    pub fn pull(&self, dst: &mut [u8]) -> usize {
        loop {
            let read = self.read_pos.load(Ordering::Acquire);
            let write = self.write_pos.load(Ordering::Acquire);
            let available = write.wrapping_sub(read).min(self.capacity);

            let mut count = available.min(dst.len());
            count -= count % self.align;
            if count == 0 {
                return 0;
            }

            for (i, byte) in dst[..count].iter_mut().enumerate() {
                *byte = self.slots[read.wrapping_add(i) & self.mask].load(Ordering::Relaxed);
            }

            // A failed exchange means the producer evicted what we just copied
            if self
                .read_pos
                .compare_exchange(read, read.wrapping_add(count), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return count;
            }
        }
    }

    /// Bytes currently queued
    pub fn len(&self) -> usize {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        write.wrapping_sub(read).min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn block_align(&self) -> usize {
        self.align
    }

    /// Total bytes discarded by overflow since creation
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[inline]
fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// The pair of per-channel queues fed by the capture callback
pub struct FanoutBuffer {
    main: ByteQueue,
    aux: ByteQueue,
}

impl FanoutBuffer {
    pub fn new(capacity: usize, block_align: usize) -> Self {
        Self {
            main: ByteQueue::with_capacity(capacity, block_align),
            aux: ByteQueue::with_capacity(capacity, block_align),
        }
    }

    /// Write the same bytes into both queues
    pub fn push(&self, bytes: &[u8]) {
        self.main.push(bytes);
        self.aux.push(bytes);
    }

    pub fn pull(&self, channel: ChannelId, dst: &mut [u8]) -> usize {
        self.queue(channel).pull(dst)
    }

    pub fn queue(&self, channel: ChannelId) -> &ByteQueue {
        match channel {
            ChannelId::Main => &self.main,
            ChannelId::Aux => &self.aux,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn drain(queue: &ByteQueue) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            let n = queue.pull(&mut chunk);
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn test_push_pull_basic() {
        let queue = ByteQueue::with_capacity(16, 1);

        queue.push(&[1, 2, 3, 4]);
        assert_eq!(queue.len(), 4);

        let mut out = [0u8; 4];
        assert_eq!(queue.pull(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pull_empty_returns_zero() {
        let queue = ByteQueue::with_capacity(16, 4);
        let mut out = [0u8; 8];
        assert_eq!(queue.pull(&mut out), 0);
    }

    #[test]
    fn test_capacity_rounding() {
        let queue = ByteQueue::with_capacity(10, 1);
        assert_eq!(queue.capacity(), 16);
        assert_eq!(ByteQueue::with_capacity(DEFAULT_FANOUT_CAPACITY, 6).capacity(), 262_144);
    }

    #[test]
    fn test_pull_returns_whole_frames_only() {
        let queue = ByteQueue::with_capacity(64, 4);
        queue.push(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);

        let mut out = [0u8; 7];
        assert_eq!(queue.pull(&mut out), 4);
        assert_eq!(&out[..4], &[0, 1, 2, 3]);

        let mut out = [0u8; 16];
        assert_eq!(queue.pull(&mut out), 4);
        assert_eq!(&out[..4], &[4, 5, 6, 7]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_overflow_keeps_newest_bytes() {
        let queue = ByteQueue::with_capacity(8, 1);
        queue.push(&[1, 2, 3, 4, 5, 6]);
        queue.push(&[7, 8, 9, 10]);

        assert_eq!(queue.len(), 8);
        assert_eq!(queue.dropped_bytes(), 2);
        assert_eq!(drain(&queue), vec![3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_oversized_push_keeps_tail() {
        let queue = ByteQueue::with_capacity(8, 1);
        queue.push(&[0xAA, 0xBB]);
        let block: Vec<u8> = (0..20).collect();
        queue.push(&block);

        assert_eq!(drain(&queue), (12..20).collect::<Vec<u8>>());
        assert_eq!(queue.dropped_bytes(), 14);
    }

    #[test]
    fn test_overflow_evicts_whole_frames() {
        // 16 bytes of 6-byte frames: room for two frames
        let queue = ByteQueue::with_capacity(16, 6);
        queue.push(&[1; 6]);
        queue.push(&[2; 6]);
        queue.push(&[3; 6]);

        assert_eq!(queue.len(), 12);
        let out = drain(&queue);
        assert_eq!(&out[..6], &[2; 6]);
        assert_eq!(&out[6..], &[3; 6]);
    }

    #[test]
    fn test_fanout_feeds_both_queues() {
        let fanout = FanoutBuffer::new(64, 4);
        fanout.push(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut main = [0u8; 4];
        assert_eq!(fanout.pull(ChannelId::Main, &mut main), 4);
        assert_eq!(fanout.queue(ChannelId::Main).len(), 4);
        assert_eq!(fanout.queue(ChannelId::Aux).len(), 8);

        let mut aux = [0u8; 8];
        assert_eq!(fanout.pull(ChannelId::Aux, &mut aux), 8);
        assert_eq!(&aux[..4], &main);
    }

    #[test]
    fn test_concurrent_producer_consumer_stays_ordered() {
        let queue = Arc::new(ByteQueue::with_capacity(256, 4));
        let producer_queue = Arc::clone(&queue);

        let producer = thread::spawn(move || {
            for counter in 0u32..20_000 {
                producer_queue.push(&counter.to_le_bytes());
            }
        });

        let mut last: Option<u32> = None;
        let mut frame = [0u8; 64];
        let mut seen = 0usize;
        loop {
            let n = queue.pull(&mut frame);
            for chunk in frame[..n].chunks_exact(4) {
                let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                if let Some(previous) = last {
                    assert!(value > previous, "{value} after {previous}");
                }
                last = Some(value);
                seen += 1;
            }
            if n == 0 && producer.is_finished() && queue.is_empty() {
                break;
            }
        }
        producer.join().unwrap();

        assert_eq!(last, Some(19_999));
        let dropped_frames = (queue.dropped_bytes() / 4) as usize;
        assert_eq!(seen + dropped_frames, 20_000);
    }

    proptest! {
        #[test]
        fn prop_both_consumers_see_identical_bytes(
            blocks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..40),
            main_pull in 1usize..48,
            aux_pull in 1usize..48,
        ) {
            let fanout = FanoutBuffer::new(4096, 1);
            let mut main_seen = Vec::new();
            let mut aux_seen = Vec::new();
            let mut scratch = vec![0u8; 48];

            for block in &blocks {
                fanout.push(block);
                let n = fanout.pull(ChannelId::Main, &mut scratch[..main_pull]);
                main_seen.extend_from_slice(&scratch[..n]);
            }
            main_seen.extend(drain(fanout.queue(ChannelId::Main)));

            loop {
                let n = fanout.pull(ChannelId::Aux, &mut scratch[..aux_pull]);
                if n == 0 {
                    break;
                }
                aux_seen.extend_from_slice(&scratch[..n]);
            }

            let expected: Vec<u8> = blocks.concat();
            prop_assert_eq!(&main_seen, &expected);
            prop_assert_eq!(&aux_seen, &expected);
        }

        #[test]
        fn prop_overflow_retains_most_recent_capacity(
            data in prop::collection::vec(any::<u8>(), 0..600),
            split in 1usize..100,
        ) {
            let queue = ByteQueue::with_capacity(128, 1);
            for block in data.chunks(split) {
                queue.push(block);
            }

            let keep = data.len().min(128);
            let expected = data[data.len() - keep..].to_vec();
            prop_assert_eq!(drain(&queue), expected);
            prop_assert_eq!(queue.dropped_bytes() as usize, data.len() - keep);
        }
    }
}
