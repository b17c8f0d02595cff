//! Pooled byte buffers for retained originals, recovery payloads and
//! solver scratch.
//!
//! Buffers are plain `Vec<u8>` recycled through power-of-two size classes,
//! so the steady-state encode/decode loop allocates nothing. All growth
//! goes through `try_reserve_exact`: allocation failure comes back as
//! [`Error::OutOfMemory`] instead of aborting the process.

use crate::Error;

/// Smallest size class, 64 bytes. Keeps tiny voice packets from
/// fragmenting the freelists and matches the widest SIMD lane.
const MIN_CLASS_SHIFT: u32 = 6;

/// Largest size class, 128 KiB, covers the worst-case recovery payload
/// (65536 data bytes plus the length prefix).
const MAX_CLASS_SHIFT: u32 = 17;

const CLASS_COUNT: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;

/// Per-class cap on retained free buffers. Beyond this, freed buffers are
/// returned to the system allocator.
const MAX_FREE_PER_CLASS: usize = 64;

/// Recycling pool of variable-length byte buffers.
pub struct PacketPool {
    free: [Vec<Vec<u8>>; CLASS_COUNT],
}

impl PacketPool {
    pub fn new() -> Self {
        Self {
            free: std::array::from_fn(|_| Vec::new()),
        }
    }

    /// Size class index for a request of `bytes`.
    #[inline]
    fn class_of(bytes: usize) -> usize {
        let bits = usize::BITS - bytes.saturating_sub(1).leading_zeros();
        (bits.max(MIN_CLASS_SHIFT).min(MAX_CLASS_SHIFT) - MIN_CLASS_SHIFT) as usize
    }

    /// Rounded-up capacity for a request of `bytes`.
    #[inline]
    fn capacity_of(bytes: usize) -> usize {
        let class_cap = 1usize << (Self::class_of(bytes) as u32 + MIN_CLASS_SHIFT);
        // Oversized requests fall off the class ladder and are allocated exactly.
        class_cap.max(bytes)
    }

    /// Get a zero-filled buffer of exactly `bytes` length.
    pub fn allocate(&mut self, bytes: usize) -> Result<Vec<u8>, Error> {
        let class = Self::class_of(bytes);

        if let Some(mut buf) = self.free[class].pop() {
            if buf.capacity() >= bytes {
                buf.clear();
                buf.resize(bytes, 0);
                return Ok(buf);
            }
            // A buffer below its class capacity should not exist; drop it.
            debug_assert!(false, "undersized buffer in freelist");
        }

        let capacity = Self::capacity_of(bytes);
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| Error::OutOfMemory)?;
        buf.resize(bytes, 0);
        Ok(buf)
    }

    /// Grow `buf` to `bytes`, preserving content and zero-filling the tail.
    pub fn grow(&mut self, buf: &mut Vec<u8>, bytes: usize) -> Result<(), Error> {
        if bytes > buf.len() {
            let additional = Self::capacity_of(bytes) - buf.len();
            buf.try_reserve_exact(additional)
                .map_err(|_| Error::OutOfMemory)?;
            buf.resize(bytes, 0);
        }
        Ok(())
    }

    /// Return a buffer to its freelist.
    pub fn recycle(&mut self, buf: Vec<u8>) {
        if buf.capacity() < 1 << MIN_CLASS_SHIFT {
            return;
        }
        let class = Self::class_of(buf.capacity());
        let free = &mut self.free[class];
        if free.len() < MAX_FREE_PER_CLASS {
            free.push(buf);
        }
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}
