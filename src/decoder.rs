//! Sliding-window recovery decoder.
//!
//! The decoder keeps a ring of [`DECODER_WINDOW_SIZE`] slots keyed by
//! sequence number and a set of pending recovery rows. Every arriving
//! original is subtracted from the rows that cover it; a row left with a
//! single unknown is *peeled* (one GF division), and sets of overlapping
//! rows are fed to a Gaussian-elimination solver. Reconstructed originals
//! are delivered through the callback, in ascending sequence order within
//! a call, at most once per sequence for the life of the decoder.
//!
//! ## Pending row lifecycle
//!
//! ```text
//! OnRecovery ──► Live ──► Peeled away (one unknown, solved cheaply)
//!                  │ ────► Eliminated (all contributions subtracted)
//!                  │ ────► Solved (full Gaussian elimination)
//!                  └─────► Expired (window slide or set eviction)
//! ```
//!
//! Rows and slots reference each other only through sequence numbers and
//! column bits, never pointers.

use std::rc::Rc;

use tracing::{debug, trace};

use crate::field::{matrix_element, mul_mem_inplace, muladd_mem};
use crate::pool::PacketPool;
use crate::protocol::{decode_length_prefix, encode_length_prefix, expand_sequence, RecoveryPacket};
use crate::{
    Clock, Error, Gf256, MonotonicClock, Settings, DECODER_WINDOW_SIZE, ENCODE_OVERHEAD,
    MATRIX_COLUMN_COUNT, MAX_PACKET_BYTES, MAX_RECOVERY_COLUMNS, MAX_RECOVERY_ROWS,
};

const COLUMN_WORDS: usize = MATRIX_COLUMN_COUNT / 64;

/// Bitset over the columns of one recovery row.
#[derive(Debug, Clone, Copy, Default)]
struct ColumnSet {
    words: [u64; COLUMN_WORDS],
}

impl ColumnSet {
    #[inline]
    fn set(&mut self, column: usize) {
        self.words[column / 64] |= 1 << (column % 64);
    }

    #[inline]
    fn clear(&mut self, column: usize) {
        self.words[column / 64] &= !(1 << (column % 64));
    }

    #[inline]
    fn test(&self, column: usize) -> bool {
        self.words[column / 64] >> (column % 64) & 1 != 0
    }

    /// Lowest set column, if any.
    fn first(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, &word)| word != 0)
            .map(|(w, word)| w * 64 + word.trailing_zeros() as usize)
    }

    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &word)| {
            (0..64)
                .filter(move |bit| word >> bit & 1 != 0)
                .map(move |bit| w * 64 + bit)
        })
    }
}

/// A received original or a reconstructed one.
struct Slot {
    sequence: u64,
    /// Prefixed form: 2-byte LE length, then exactly the data.
    buffer: Vec<u8>,
}

/// One recovery packet awaiting enough information to resolve.
struct PendingRow {
    /// Full sequence of the first covered column.
    start: u64,
    count: usize,
    /// Cauchy row index x_i.
    row: u8,
    /// Mixed payload minus every contribution already known.
    payload: Vec<u8>,
    /// Columns whose originals are still unknown.
    unknowns: ColumnSet,
    num_unknowns: usize,
    /// Receive time, for age expiration and oldest-first eviction.
    t_usec: u64,
}

impl PendingRow {
    #[inline]
    fn covers(&self, sequence: u64) -> bool {
        sequence >= self.start && sequence - self.start < self.count as u64
    }

    #[inline]
    fn end(&self) -> u64 {
        self.start + self.count as u64
    }
}

/// Streaming FEC decoder with synchronous recovered-data delivery.
pub struct Decoder {
    settings: Settings,
    clock: Rc<dyn Clock>,
    pool: PacketPool,

    /// Slot ring keyed by `sequence % DECODER_WINDOW_SIZE`.
    slots: Vec<Option<Slot>>,

    /// Live recovery rows, at most [`MAX_RECOVERY_ROWS`].
    pending: Vec<PendingRow>,

    highest_seen: Option<u64>,

    on_recovered: Box<dyn FnMut(u64, &[u8])>,

    fatal: Option<Error>,
}

impl Decoder {
    /// Create a decoder with the default monotonic clock.
    pub fn new(
        settings: Settings,
        on_recovered: Box<dyn FnMut(u64, &[u8])>,
    ) -> Result<Self, Error> {
        Self::with_clock(settings, on_recovered, Rc::new(MonotonicClock::new()))
    }

    /// Create a decoder driven by a caller-supplied [`Clock`].
    pub fn with_clock(
        settings: Settings,
        on_recovered: Box<dyn FnMut(u64, &[u8])>,
        clock: Rc<dyn Clock>,
    ) -> Result<Self, Error> {
        settings.validate()?;
        Ok(Self {
            settings,
            clock,
            pool: PacketPool::new(),
            slots: (0..DECODER_WINDOW_SIZE).map(|_| None).collect(),
            pending: Vec::with_capacity(MAX_RECOVERY_ROWS),
            highest_seen: None,
            on_recovered,
            fatal: None,
        })
    }

    /// Highest sequence observed so far, from originals or recovery spans.
    pub fn highest_seen(&self) -> Option<u64> {
        self.highest_seen
    }

    /// Number of recovery rows currently waiting on missing originals.
    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    /// Feed a received original.
    ///
    /// A sequence already present (received or reconstructed) is a no-op.
    /// May fire the delivery callback for other packets that the new
    /// information unlocks.
    pub fn on_original(&mut self, sequence: u64, data: &[u8]) -> Result<(), Error> {
        if let Some(err) = self.fatal {
            return Err(err);
        }
        if data.is_empty() || data.len() > MAX_PACKET_BYTES {
            return Err(Error::InvalidInput);
        }

        let now = self.clock.now_usec();
        self.highest_seen = Some(self.highest_seen.map_or(sequence, |h| h.max(sequence)));
        self.slide(now);

        if sequence < self.window_floor() {
            trace!(sequence, "original below window, ignored");
            return Ok(());
        }
        if slot_for(&self.slots, sequence).is_some() {
            return Ok(());
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
        install_slot(&mut self.slots, &mut self.pool, sequence, buffer);

        let mut delivered = Vec::new();
        if eliminate_from_rows(&self.slots, &mut self.pending, sequence) {
            self.resolve(&mut delivered)?;
        }
        self.flush_deliveries(delivered);
        Ok(())
    }

    /// Feed a received recovery packet.
    ///
    /// Field violations (bad count, bad row, truncated payload) return
    /// [`Error::InvalidInput`] without touching state; recoveries that are
    /// merely useless (fully redundant, expired, or covering unrecoverable
    /// sequences) are dropped silently.
    pub fn on_recovery(&mut self, packet: &RecoveryPacket) -> Result<(), Error> {
        if let Some(err) = self.fatal {
            return Err(err);
        }
        packet.validate()?;

        let now = self.clock.now_usec();
        let start = match self.highest_seen {
            Some(recent) => expand_sequence(packet.sequence_start, recent),
            None => packet.sequence_start as u64,
        };
        let count = packet.count as usize;
        let end = start + count as u64 - 1;

        self.highest_seen = Some(self.highest_seen.map_or(end, |h| h.max(end)));
        self.slide(now);

        let floor = self.window_floor();
        if end < floor {
            debug!(start, count, "recovery below window, dropped");
            return Ok(());
        }

        // Columns below the window floor are only tolerable when their
        // originals are still held: the contribution can be subtracted.
        // An unknown below the floor can never be resolved, so the whole
        // row is useless.
        for column in 0..count {
            let sequence = start + column as u64;
            if sequence < floor && slot_for(&self.slots, sequence).is_none() {
                debug!(start, count, "recovery spans unrecoverable columns, dropped");
                return Ok(());
            }
        }

        // A repeated (row, span) replaces its older incarnation.
        if let Some(index) = self
            .pending
            .iter()
            .position(|r| r.row == packet.row && r.start == start && r.count == count)
        {
            let old = self.pending.swap_remove(index);
            self.pool.recycle(old.payload);
        }

        while self.pending.len() >= MAX_RECOVERY_ROWS {
            self.evict_oldest_row();
        }

        let mut payload = match self.pool.allocate(packet.payload.len()) {
            Ok(payload) => payload,
            Err(err) => {
                self.fatal = Some(err);
                return Err(err);
            }
        };
        payload.copy_from_slice(&packet.payload);

        let mut unknowns = ColumnSet::default();
        let mut num_unknowns = 0usize;
        for column in 0..count {
            let sequence = start + column as u64;
            match slot_for(&self.slots, sequence) {
                Some(slot) => {
                    let coeff = matrix_element(packet.row, column as u8);
                    muladd_mem(&mut payload, &slot.buffer, coeff);
                }
                None => {
                    unknowns.set(column);
                    num_unknowns += 1;
                }
            }
        }

        if num_unknowns == 0 {
            trace!(start, count, row = packet.row, "recovery fully redundant");
            self.pool.recycle(payload);
            return Ok(());
        }

        trace!(
            start,
            count,
            row = packet.row,
            num_unknowns,
            "recovery row admitted"
        );
        self.pending.push(PendingRow {
            start,
            count,
            row: packet.row,
            payload,
            unknowns,
            num_unknowns,
            t_usec: now,
        });

        let mut delivered = Vec::new();
        self.resolve(&mut delivered)?;
        self.flush_deliveries(delivered);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Window maintenance
    // -------------------------------------------------------------------------

    /// Oldest sequence still recoverable under the packet-count window.
    #[inline]
    fn window_floor(&self) -> u64 {
        match self.highest_seen {
            Some(highest) => (highest + 1).saturating_sub(DECODER_WINDOW_SIZE as u64),
            None => 0,
        }
    }

    /// Drop pending rows that aged out or slid entirely below the window.
    fn slide(&mut self, now: u64) {
        let floor = self.window_floor();
        let window_usec = self.settings.window_usec();
        let mut index = 0;
        while index < self.pending.len() {
            let row = &self.pending[index];
            if row.end() <= floor || now.saturating_sub(row.t_usec) > window_usec {
                let row = self.pending.swap_remove(index);
                trace!(start = row.start, row = row.row, "pending row expired");
                self.pool.recycle(row.payload);
            } else {
                index += 1;
            }
        }
    }

    fn evict_oldest_row(&mut self) {
        if let Some(index) = self
            .pending
            .iter()
            .enumerate()
            .min_by_key(|(_, row)| row.t_usec)
            .map(|(index, _)| index)
        {
            let row = self.pending.swap_remove(index);
            debug!(start = row.start, row = row.row, "pending row set full, evicted oldest");
            self.pool.recycle(row.payload);
        }
    }

    // -------------------------------------------------------------------------
    // Reconstruction
    // -------------------------------------------------------------------------

    /// Alternate peeling and solving until neither makes progress.
    fn resolve(&mut self, delivered: &mut Vec<u64>) -> Result<(), Error> {
        loop {
            self.run_peels(delivered);
            if !self.try_solve(delivered)? {
                return Ok(());
            }
        }
    }

    /// Resolve every pending row reduced to zero or one unknown, cascading
    /// each reconstruction back through the remaining rows.
    fn run_peels(&mut self, delivered: &mut Vec<u64>) {
        let floor = self.window_floor();
        loop {
            let Some(index) = self.pending.iter().position(|r| r.num_unknowns <= 1) else {
                return;
            };
            let row = self.pending.swap_remove(index);

            if row.num_unknowns == 0 {
                self.pool.recycle(row.payload);
                continue;
            }

            let column = row.unknowns.first().expect("one unknown recorded");
            let sequence = row.start + column as u64;
            let mut payload = row.payload;

            if sequence < floor {
                self.pool.recycle(payload);
                continue;
            }

            // payload = coeff * original; divide to recover the original.
            let coeff = matrix_element(row.row, column as u8);
            mul_mem_inplace(&mut payload, Gf256(1) / coeff);

            let bytes = decode_length_prefix([payload[0], payload[1]]);
            if ENCODE_OVERHEAD + bytes > payload.len() {
                debug!(sequence, bytes, "peeled length out of range, row dropped");
                self.pool.recycle(payload);
                continue;
            }
            payload.truncate(ENCODE_OVERHEAD + bytes);

            if slot_for(&self.slots, sequence).is_some() {
                self.pool.recycle(payload);
                continue;
            }

            trace!(sequence, bytes, "peeled original");
            install_slot(&mut self.slots, &mut self.pool, sequence, payload);
            delivered.push(sequence);
            eliminate_from_rows(&self.slots, &mut self.pending, sequence);
        }
    }

    /// Gaussian elimination over the pending set.
    ///
    /// Selects up to [`MAX_RECOVERY_COLUMNS`] unknowns and the rows whose
    /// unknowns all fall inside that selection. Rank below the unknown
    /// count delivers nothing; the rows stay for later rounds. Returns
    /// whether any original was reconstructed.
    fn try_solve(&mut self, delivered: &mut Vec<u64>) -> Result<bool, Error> {
        if self.pending.len() < 2 {
            return Ok(false);
        }
        let floor = self.window_floor();

        // Rows waiting on a sequence that already left the window can
        // never be completed.
        let mut index = 0;
        while index < self.pending.len() {
            let row = &self.pending[index];
            let dead = row
                .unknowns
                .iter()
                .any(|column| row.start + (column as u64) < floor);
            if dead {
                let row = self.pending.swap_remove(index);
                debug!(start = row.start, row = row.row, "row waits on expired sequence, dropped");
                self.pool.recycle(row.payload);
            } else {
                index += 1;
            }
        }

        let mut selected: Vec<u64> = Vec::new();
        for row in &self.pending {
            for column in row.unknowns.iter() {
                selected.push(row.start + column as u64);
            }
        }
        selected.sort_unstable();
        selected.dedup();
        if selected.is_empty() {
            return Ok(false);
        }
        selected.truncate(MAX_RECOVERY_COLUMNS);

        // Usable equations: rows whose unknowns are all selected.
        let mut usable: Vec<usize> = (0..self.pending.len())
            .filter(|&r| {
                let row = &self.pending[r];
                row.num_unknowns >= 1
                    && row
                        .unknowns
                        .iter()
                        .all(|column| selected.binary_search(&(row.start + column as u64)).is_ok())
            })
            .collect();

        let width = selected.len();
        if usable.len() < width {
            return Ok(false);
        }

        // All-ones rows (x_i == 0) make the cheapest pivots; front-load them.
        usable.sort_by_key(|&r| self.pending[r].row != 0);

        // Coefficient matrix: one equation per usable row, one column per
        // selected unknown. Already-eliminated contributions are zeros.
        let mut matrix: Vec<Vec<Gf256>> = usable
            .iter()
            .map(|&r| {
                let row = &self.pending[r];
                selected
                    .iter()
                    .map(|&sequence| {
                        if row.covers(sequence) {
                            let column = (sequence - row.start) as usize;
                            if row.unknowns.test(column) {
                                return matrix_element(row.row, column as u8);
                            }
                        }
                        Gf256(0)
                    })
                    .collect()
            })
            .collect();

        let work_bytes = usable
            .iter()
            .map(|&r| self.pending[r].payload.len())
            .max()
            .unwrap_or(0);
        let mut rhs: Vec<Vec<u8>> = Vec::with_capacity(usable.len());
        for &r in &usable {
            let mut work = match self.pool.allocate(work_bytes) {
                Ok(work) => work,
                Err(err) => {
                    self.fatal = Some(err);
                    for work in rhs {
                        self.pool.recycle(work);
                    }
                    return Err(err);
                }
            };
            let payload = &self.pending[r].payload;
            work[..payload.len()].copy_from_slice(payload);
            rhs.push(work);
        }

        // Forward elimination with partial pivoting.
        let height = rhs.len();
        for column in 0..width {
            let Some(pivot_row) = (column..height).find(|&r| matrix[r][column].0 != 0) else {
                // Rank deficient: deliver nothing, keep rows for later.
                trace!(unknowns = width, "solver rank deficient");
                for work in rhs {
                    self.pool.recycle(work);
                }
                return Ok(false);
            };
            matrix.swap(column, pivot_row);
            rhs.swap(column, pivot_row);

            let pivot_inv = Gf256(1) / matrix[column][column];
            for j in column..width {
                matrix[column][j] = matrix[column][j] * pivot_inv;
            }
            mul_mem_inplace(&mut rhs[column], pivot_inv);

            let (solved, remaining) = rhs.split_at_mut(column + 1);
            let pivot_rhs = &solved[column];
            for (offset, work) in remaining.iter_mut().enumerate() {
                let r = column + 1 + offset;
                let factor = matrix[r][column];
                if factor.0 == 0 {
                    continue;
                }
                for j in column..width {
                    let pivot_val = matrix[column][j];
                    matrix[r][j] = matrix[r][j] + pivot_val * factor;
                }
                muladd_mem(work, pivot_rhs, factor);
            }
        }

        // Back substitution.
        for column in (1..width).rev() {
            let (above, rest) = rhs.split_at_mut(column);
            let pivot_rhs = &rest[0];
            for (r, work) in above.iter_mut().enumerate() {
                let factor = matrix[r][column];
                if factor.0 != 0 {
                    muladd_mem(work, pivot_rhs, factor);
                }
            }
        }

        // The first `width` work buffers now hold the reconstructed
        // prefixed originals, in `selected` order.
        let mut reconstructed = false;
        for (k, work) in rhs.into_iter().enumerate() {
            if k >= width {
                self.pool.recycle(work);
                continue;
            }
            let sequence = selected[k];
            let bytes = decode_length_prefix([work[0], work[1]]);
            if ENCODE_OVERHEAD + bytes > work.len() {
                debug!(sequence, bytes, "solved length out of range, discarded");
                self.pool.recycle(work);
                continue;
            }
            if slot_for(&self.slots, sequence).is_some() {
                self.pool.recycle(work);
                continue;
            }
            let mut buffer = work;
            buffer.truncate(ENCODE_OVERHEAD + bytes);
            trace!(sequence, bytes, "solved original");
            install_slot(&mut self.slots, &mut self.pool, sequence, buffer);
            delivered.push(sequence);
            reconstructed = true;
        }

        if reconstructed {
            // Feed solutions back through the remaining rows; rows fully
            // consumed by this solve drop to zero unknowns and are
            // reclaimed by the next peel pass.
            for &sequence in delivered.iter() {
                eliminate_from_rows(&self.slots, &mut self.pending, sequence);
            }
        }
        Ok(reconstructed)
    }

    /// Fire the callback for this call's reconstructions, ascending.
    fn flush_deliveries(&mut self, mut delivered: Vec<u64>) {
        if delivered.is_empty() {
            return;
        }
        delivered.sort_unstable();
        delivered.dedup();

        let slots = &self.slots;
        let on_recovered = &mut self.on_recovered;
        for sequence in delivered {
            if let Some(slot) = slot_for(slots, sequence) {
                on_recovered(sequence, &slot.buffer[ENCODE_OVERHEAD..]);
            }
        }
    }
}

/// Slot lookup; `None` when the ring position holds a different sequence.
#[inline]
fn slot_for(slots: &[Option<Slot>], sequence: u64) -> Option<&Slot> {
    let index = (sequence % DECODER_WINDOW_SIZE as u64) as usize;
    slots[index]
        .as_ref()
        .filter(|slot| slot.sequence == sequence)
}

/// Claim the ring position for `sequence`, reclaiming any stale occupant.
fn install_slot(slots: &mut [Option<Slot>], pool: &mut PacketPool, sequence: u64, buffer: Vec<u8>) {
    let index = (sequence % DECODER_WINDOW_SIZE as u64) as usize;
    if let Some(stale) = slots[index].take() {
        pool.recycle(stale.buffer);
    }
    slots[index] = Some(Slot { sequence, buffer });
}

/// Subtract a now-known original from every pending row that still counts
/// it as unknown. Returns whether any row changed.
fn eliminate_from_rows(slots: &[Option<Slot>], pending: &mut [PendingRow], sequence: u64) -> bool {
    let Some(slot) = slot_for(slots, sequence) else {
        return false;
    };
    let mut changed = false;
    for row in pending.iter_mut() {
        if !row.covers(sequence) {
            continue;
        }
        let column = (sequence - row.start) as usize;
        if !row.unknowns.test(column) {
            continue;
        }
        let coeff = matrix_element(row.row, column as u8);
        muladd_mem(&mut row.payload, &slot.buffer, coeff);
        row.unknowns.clear(column);
        row.num_unknowns -= 1;
        changed = true;
    }
    changed
}
