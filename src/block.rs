//! TS packet carriers and the fixed-capacity recycling pool.
//!
//! A [`TsBlock`] pairs 188 bytes of packet data with the wall-clock DTS the
//! demultiplexer stamped on arrival. Reference counting lives inside
//! [`Bytes`]: fan-out to outputs clones the handle, and the block is freed
//! when the last clone drops. The pool keeps a bounded free list of carrier
//! buffers so steady-state routing does not touch the allocator.

use bytes::{Bytes, BytesMut};

use crate::ts::{TsPacket, TS_SIZE};
use crate::Mtime;

/// One captured TS packet with its assigned DTS (µs, monotonic).
#[derive(Debug, Clone)]
pub struct TsBlock {
    /// The 188 packet bytes
    pub data: Bytes,
    /// Wall-clock timestamp assigned on capture, for retention/latency
    /// accounting
    pub dts: Mtime,
}

impl TsBlock {
    /// Wraps frozen packet bytes.
    pub fn new(data: Bytes, dts: Mtime) -> Self {
        Self { data, dts }
    }

    /// Borrow-only packet view.
    pub fn packet(&self) -> TsPacket<'_> {
        TsPacket(&self.data)
    }
}

/// Recycling allocator for 188-byte carrier buffers.
///
/// `alloc` hands out a zero-length buffer with packet capacity; `reclaim`
/// takes a dropped-to-unique `Bytes` back. Above the retention cap the
/// buffer is really released.
#[derive(Debug)]
pub struct BlockPool {
    free: Vec<BytesMut>,
    cap: usize,
}

impl BlockPool {
    /// Default number of retained carriers.
    pub const DEFAULT_CAP: usize = 500;

    /// Creates a pool retaining at most `cap` buffers.
    pub fn new(cap: usize) -> Self {
        Self {
            free: Vec::new(),
            cap,
        }
    }

    /// Returns a carrier sized for one TS packet.
    pub fn alloc(&mut self) -> BytesMut {
        let mut buf = self
            .free
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(TS_SIZE));
        buf.clear();
        buf.resize(TS_SIZE, 0);
        buf
    }

    /// Offers packet bytes back to the pool. Recycled only when this was
    /// the last reference; otherwise the handle is simply dropped and the
    /// memory lives on with the remaining holders.
    pub fn reclaim(&mut self, data: Bytes) {
        if self.free.len() >= self.cap {
            return;
        }
        if let Ok(buf) = data.try_into_mut() {
            if buf.capacity() >= TS_SIZE {
                self.free.push(buf);
            }
        }
    }

    /// Number of buffers currently retained.
    pub fn retained(&self) -> usize {
        self.free.len()
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_reclaim_cycle() {
        let mut pool = BlockPool::new(4);
        let buf = pool.alloc();
        assert_eq!(buf.len(), TS_SIZE);
        pool.reclaim(buf.freeze());
        assert_eq!(pool.retained(), 1);
        // The recycled buffer comes back out.
        let _ = pool.alloc();
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn test_shared_bytes_not_recycled() {
        let mut pool = BlockPool::new(4);
        let data = pool.alloc().freeze();
        let clone = data.clone();
        pool.reclaim(data);
        assert_eq!(pool.retained(), 0);
        drop(clone);
    }

    #[test]
    fn test_cap_enforced() {
        let mut pool = BlockPool::new(2);
        for _ in 0..5 {
            let data = pool.alloc().freeze();
            pool.reclaim(data);
        }
        assert!(pool.retained() <= 2);
    }

    #[test]
    fn test_block_packet_view() {
        let mut pool = BlockPool::new(1);
        let mut buf = pool.alloc();
        buf[0] = 0x47;
        buf[1] = 0x01;
        buf[2] = 0x02;
        let block = TsBlock::new(buf.freeze(), 42);
        assert!(block.packet().validate());
        assert_eq!(block.packet().pid(), 0x102);
        assert_eq!(block.dts, 42);
    }
}
