//! Sliding-window recovery encoder.
//!
//! The encoder retains up to [`Settings::window_packets`] recent originals,
//! retiring the oldest by count and by age on every submission. A recovery
//! packet is a GF(256) linear combination of the retained window, mixed
//! column by column with Cauchy coefficients; row `x_i == 0` degenerates to
//! a plain XOR across the window.
//!
//! Originals are stored in *prefixed* form, `(u16-LE length || data)`, so
//! emission mixes each column with a single multiply-accumulate pass and
//! the decoder can recover exact lengths from the same mixture.

use std::collections::VecDeque;
use std::rc::Rc;

use tracing::trace;

use crate::field::{matrix_element, muladd_mem, xor_mem};
use crate::pool::PacketPool;
use crate::protocol::{encode_length_prefix, truncate_sequence, RecoveryPacket};
use crate::{
    Clock, Error, MonotonicClock, Settings, ENCODE_OVERHEAD, MATRIX_ROW_COUNT,
    MAX_PACKET_BYTES, MAX_RECOVERY_COLUMNS,
};

/// One retained original.
struct WindowSlot {
    /// Prefixed form: 2-byte LE length, then the data.
    buffer: Vec<u8>,
    /// Submission time, for age-based retirement.
    t_usec: u64,
}

/// Streaming FEC encoder over a sliding window of originals.
pub struct Encoder {
    settings: Settings,
    clock: Rc<dyn Clock>,
    pool: PacketPool,

    /// Retained originals, oldest first. The sequence of the oldest is
    /// `next_sequence - window.len()`.
    window: VecDeque<WindowSlot>,

    /// Sequence expected from the next `add_original` call; `None` until
    /// the first original establishes the base.
    next_sequence: Option<u64>,

    /// Next Cauchy row to assign, wrapping modulo [`MATRIX_ROW_COUNT`].
    next_row: u8,

    fatal: Option<Error>,
}

impl Encoder {
    /// Create an encoder with the default monotonic clock.
    pub fn new(settings: Settings) -> Result<Self, Error> {
        Self::with_clock(settings, Rc::new(MonotonicClock::new()))
    }

    /// Create an encoder driven by a caller-supplied [`Clock`].
    pub fn with_clock(settings: Settings, clock: Rc<dyn Clock>) -> Result<Self, Error> {
        settings.validate()?;
        Ok(Self {
            settings,
            clock,
            pool: PacketPool::new(),
            window: VecDeque::with_capacity(settings.window_packets as usize),
            next_sequence: None,
            next_row: 0,
            fatal: None,
        })
    }

    /// Number of originals currently retained.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Sequence number the next submitted original must carry.
    pub fn next_sequence(&self) -> Option<u64> {
        self.next_sequence
    }

    /// Retain an outgoing original in the window.
    ///
    /// `sequence` must continue the stream: the first call establishes the
    /// base, every later call must be exactly one past the previous.
    /// `data` must be 1..=65536 bytes. The caller transmits the original
    /// itself, with its full sequence number, in its own protocol.
    pub fn add_original(&mut self, sequence: u64, data: &[u8]) -> Result<(), Error> {
        if let Some(err) = self.fatal {
            return Err(err);
        }
        if data.is_empty() || data.len() > MAX_PACKET_BYTES {
            return Err(Error::InvalidInput);
        }
        if let Some(next) = self.next_sequence {
            if sequence != next {
                return Err(Error::InvalidInput);
            }
        }

        let now = self.clock.now_usec();
        self.retire_expired(now);

        // Make room under the packet-count limit before appending.
        while self.window.len() >= self.settings.window_packets as usize {
            self.retire_oldest();
        }

        let mut buffer = match self.pool.allocate(ENCODE_OVERHEAD + data.len()) {
            Ok(buffer) => buffer,
            Err(err) => {
                self.fatal = Some(err);
                return Err(err);
            }
        };
        buffer[..ENCODE_OVERHEAD].copy_from_slice(&encode_length_prefix(data.len()));
        buffer[ENCODE_OVERHEAD..].copy_from_slice(data);

        self.window.push_back(WindowSlot {
            buffer,
            t_usec: now,
        });
        self.next_sequence = Some(sequence + 1);
        Ok(())
    }

    /// Produce a recovery packet covering the current window.
    ///
    /// The covered span is the newest `min(window, 128)` originals; older
    /// window members stay retained and remain coverable by later
    /// recoveries once the window slides. Returns
    /// [`Error::NeedsMoreData`] when nothing is retained.
    pub fn emit_recovery(&mut self) -> Result<RecoveryPacket, Error> {
        if let Some(err) = self.fatal {
            return Err(err);
        }

        let now = self.clock.now_usec();
        self.retire_expired(now);

        let next_sequence = match self.next_sequence {
            Some(next) if !self.window.is_empty() => next,
            _ => return Err(Error::NeedsMoreData),
        };

        let count = self.window.len().min(MAX_RECOVERY_COLUMNS);
        let skip = self.window.len() - count;
        let start_sequence = next_sequence - count as u64;

        let row = self.next_row;
        self.next_row = (self.next_row + 1) % MATRIX_ROW_COUNT as u8;

        let max_bytes = self
            .window
            .iter()
            .skip(skip)
            .map(|slot| slot.buffer.len() - ENCODE_OVERHEAD)
            .max()
            .unwrap_or(0);

        let mut payload = match self.pool.allocate(ENCODE_OVERHEAD + max_bytes) {
            Ok(payload) => payload,
            Err(err) => {
                self.fatal = Some(err);
                return Err(err);
            }
        };

        for (column, slot) in self.window.iter().skip(skip).enumerate() {
            if row == 0 {
                // First Cauchy row is all ones: pure XOR.
                xor_mem(&mut payload, &slot.buffer);
            } else {
                let coeff = matrix_element(row, column as u8);
                muladd_mem(&mut payload, &slot.buffer, coeff);
            }
        }

        trace!(
            start = start_sequence,
            count,
            row,
            bytes = payload.len(),
            "emitted recovery"
        );

        Ok(RecoveryPacket {
            sequence_start: truncate_sequence(start_sequence),
            count: count as u8,
            row,
            payload,
        })
    }

    /// Drop window members older than the time window.
    fn retire_expired(&mut self, now: u64) {
        let window_usec = self.settings.window_usec();
        while let Some(front) = self.window.front() {
            if now.saturating_sub(front.t_usec) <= window_usec {
                break;
            }
            self.retire_oldest();
        }
    }

    fn retire_oldest(&mut self) {
        if let Some(slot) = self.window.pop_front() {
            trace!(remaining = self.window.len(), "retired oldest original");
            self.pool.recycle(slot.buffer);
        }
    }
}
