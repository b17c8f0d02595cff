//! # CCat - The Cauchy Caterpillar
//!
//! Short-window streaming forward error correction over GF(256) for
//! low-latency realtime transports (voice, video, telemetry, game traffic).
//!
//! ## Overview
//!
//! A sender emits numbered *original* packets plus a configurable rate of
//! *recovery* packets, each a Cauchy-matrix linear combination of a sliding
//! window of the most recent originals. A receiver that loses arbitrary
//! originals and/or recoveries reconstructs missing originals from whatever
//! recovery packets arrive, and hands them back labelled with their original
//! sequence numbers.
//!
//! ```text
//! Time:      0   1   2   3   4   5   6   7   8   ...
//! Original:  S₀  S₁  S₂  S₃  S₄  S₅  S₆  S₇  S₈  ...
//!            └───┴───┴───┴──┐    └───┴───┴───┴──┐
//! Recovery:               R₀(covers S₀..S₃)   R₁(covers S₀..S₇)
//! ```
//!
//! The window slides by packet count (up to 192 originals) and by wall-clock
//! age, so protection always tracks the freshest data and stale packets are
//! abandoned rather than retransmitted. Within one window the code is MDS:
//! any K received packets (originals or recoveries) recover K originals.
//!
//! Unlike a block code, originals can be any length from 1 to 65536 bytes;
//! each recovery packet carries an in-band GF-mixed 2-byte length prefix per
//! covered original so the decoder can recover exact lengths.
//!
//! ## Example
//!
//! ```rust
//! use ccat::{CauchyCaterpillar, Settings};
//!
//! let mut sender = CauchyCaterpillar::new(Settings::default(), |_, _| {}).unwrap();
//! let mut receiver = CauchyCaterpillar::new(Settings::default(), |sequence, data| {
//!     println!("recovered packet {} ({} bytes)", sequence, data.len());
//! }).unwrap();
//!
//! // Originals travel with their sequence number in the caller's protocol.
//! sender.encode_original(0, b"hello").unwrap();
//! sender.encode_original(1, b"world").unwrap();
//!
//! // Periodically emit a recovery packet covering the current window.
//! let recovery = sender.encode_recovery().unwrap();
//!
//! // The receiver lost packet 1 but got packet 0 and the recovery.
//! receiver.decode_original(0, b"hello").unwrap();
//! receiver.decode_recovery(&recovery).unwrap(); // fires the callback for 1
//! ```
//!
//! ## What this crate is not
//!
//! CCat is not a reliable transport: packets outside the active window are
//! gone forever, and recovered originals are delivered in whatever order the
//! decoder resolves them. Socket I/O, duplicate suppression and the policy
//! for when to emit recovery packets all belong to the caller.

use std::fmt;
use std::rc::Rc;
use std::time::Instant;

// GF(256) with the same polynomial the C++ gf256 library selects by default,
// so coefficients match the reference codec on the wire.
use gf256::gf::gf;

#[gf(polynomial = 0x14d, generator = 0x2)]
pub type Gf256;

mod decoder;
mod encoder;
mod field;
mod pool;
mod protocol;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use pool::PacketPool;
pub use protocol::{RecoveryPacket, RECOVERY_HEADER_BYTES};

#[cfg(test)]
mod tests;

// =============================================================================
// Limits
// =============================================================================

/// Max original packets covered by one recovery (matrix columns).
/// 192 = 256 * 3/4, enabling up to 33% FEC, and a multiple of 64 so the
/// decoder's column bitsets pack into whole words.
pub const MATRIX_COLUMN_COUNT: usize = 192;

/// Recovery row identifier space (matrix rows).
pub const MATRIX_ROW_COUNT: usize = 256 - MATRIX_COLUMN_COUNT;

/// Cap on the span of a single emitted recovery and on the number of
/// unknowns attempted in one solver pass.
pub const MAX_RECOVERY_COLUMNS: usize = 128;

/// Cap on pending recovery rows held by the decoder.
pub const MAX_RECOVERY_ROWS: usize = MAX_RECOVERY_COLUMNS + 32;

/// Decoder slot ring size: twice the encoder window.
pub const DECODER_WINDOW_SIZE: usize = 2 * MATRIX_COLUMN_COUNT;

/// Largest original packet, in bytes.
pub const MAX_PACKET_BYTES: usize = 65536;

/// Smallest accepted time window.
pub const MIN_WINDOW_MSEC: u32 = 10;

/// Largest accepted time window.
pub const MAX_WINDOW_MSEC: u32 = 2_000_000_000;

/// Bytes of in-band length prefix mixed into each recovery payload.
pub const ENCODE_OVERHEAD: usize = 2;

// =============================================================================
// Errors
// =============================================================================

/// Error type for CCat operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Out-of-range argument: empty or oversized packet, bad count/row,
    /// non-consecutive encoder sequence, invalid settings
    InvalidInput,
    /// Recovery requested from an empty encoder window
    NeedsMoreData,
    /// Allocation failed; the instance is fatally errored
    OutOfMemory,
    /// Internal invariant violation; the instance is fatally errored
    Fatal,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidInput => write!(f, "invalid input"),
            Error::NeedsMoreData => write!(f, "encoder window is empty"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::Fatal => write!(f, "codec is in a fatal error state"),
        }
    }
}

impl std::error::Error for Error {}

// =============================================================================
// Settings
// =============================================================================

/// Codec configuration, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Maximum age of packets retained in the encoder and decoder windows,
    /// in milliseconds. Range: [`MIN_WINDOW_MSEC`]..=[`MAX_WINDOW_MSEC`].
    pub window_msec: u32,

    /// Maximum packets retained in the encoder window.
    /// Range: 1..=[`MATRIX_COLUMN_COUNT`].
    pub window_packets: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            window_msec: 100,
            window_packets: MATRIX_COLUMN_COUNT as u32,
        }
    }
}

impl Settings {
    /// Check that all fields are within range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.window_msec < MIN_WINDOW_MSEC || self.window_msec > MAX_WINDOW_MSEC {
            return Err(Error::InvalidInput);
        }
        if self.window_packets < 1 || self.window_packets > MATRIX_COLUMN_COUNT as u32 {
            return Err(Error::InvalidInput);
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn window_usec(&self) -> u64 {
        self.window_msec as u64 * 1000
    }
}

// =============================================================================
// Host clock
// =============================================================================

/// Monotonic microsecond time source.
///
/// The codec checks packet age against [`Settings::window_msec`] on every
/// entry point. The default [`MonotonicClock`] reads `std::time::Instant`;
/// tests and simulators can substitute a manual clock.
pub trait Clock {
    /// Microseconds since an arbitrary fixed origin. Must never go backwards.
    fn now_usec(&self) -> u64;
}

/// Default [`Clock`] backed by `std::time::Instant`.
#[derive(Debug)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_usec(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

// =============================================================================
// Codec facade
// =============================================================================

/// A bidirectional CCat codec: one [`Encoder`] and one [`Decoder`] sharing
/// settings and a time source.
///
/// Most applications run one instance per peer: originals going out pass
/// through [`encode_original`](Self::encode_original), recovery packets are
/// produced on the caller's schedule by
/// [`encode_recovery`](Self::encode_recovery), and everything arriving from
/// the peer is fed to [`decode_original`](Self::decode_original) /
/// [`decode_recovery`](Self::decode_recovery). Reconstructed packets are
/// delivered synchronously through the callback passed at construction.
///
/// Instances are single-threaded; distinct instances are independent.
pub struct CauchyCaterpillar {
    encoder: Encoder,
    decoder: Decoder,
}

impl CauchyCaterpillar {
    /// Create a codec with the default monotonic clock.
    ///
    /// `on_recovered` fires once per reconstructed original, with its
    /// sequence number and exact payload, inside the decode call that
    /// resolved it.
    pub fn new<F>(settings: Settings, on_recovered: F) -> Result<Self, Error>
    where
        F: FnMut(u64, &[u8]) + 'static,
    {
        Self::with_clock(settings, on_recovered, Rc::new(MonotonicClock::new()))
    }

    /// Create a codec driven by a caller-supplied [`Clock`].
    pub fn with_clock<F>(
        settings: Settings,
        on_recovered: F,
        clock: Rc<dyn Clock>,
    ) -> Result<Self, Error>
    where
        F: FnMut(u64, &[u8]) + 'static,
    {
        settings.validate()?;
        Ok(Self {
            encoder: Encoder::with_clock(settings, Rc::clone(&clock))?,
            decoder: Decoder::with_clock(settings, Box::new(on_recovered), clock)?,
        })
    }

    /// Add an outgoing original to the encoder window.
    ///
    /// The caller transmits `(sequence, data)` itself; CCat defines no wire
    /// format for originals. Sequence numbers must be consecutive.
    pub fn encode_original(&mut self, sequence: u64, data: &[u8]) -> Result<(), Error> {
        self.encoder.add_original(sequence, data)
    }

    /// Produce a recovery packet covering the current encoder window.
    pub fn encode_recovery(&mut self) -> Result<RecoveryPacket, Error> {
        self.encoder.emit_recovery()
    }

    /// Feed a received original to the decoder.
    pub fn decode_original(&mut self, sequence: u64, data: &[u8]) -> Result<(), Error> {
        self.decoder.on_original(sequence, data)
    }

    /// Feed a received recovery packet to the decoder.
    pub fn decode_recovery(&mut self, packet: &RecoveryPacket) -> Result<(), Error> {
        self.decoder.on_recovery(packet)
    }

    /// Access the encoder half.
    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    /// Access the decoder half.
    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }
}
