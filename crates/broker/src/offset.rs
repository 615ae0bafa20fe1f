use std::fmt;

use serde::{Deserialize, Serialize};
use tidemark_util::UnixMillis;

pub const OFFSET_LEN: usize = 16;

const TIME_LEN: usize = 6;
const WORKER_LEN: usize = 4;
const SEQ_START: usize = TIME_LEN + WORKER_LEN;

/// Position identifier within a partition: 6 bytes of big-endian unix
/// milliseconds, 4 bytes of worker id, 6 bytes of big-endian sequence.
/// Bytewise comparison orders by time, then worker, then sequence.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Offset([u8; OFFSET_LEN]);

impl Offset {
    pub const ZERO: Offset = Offset([0; OFFSET_LEN]);
    pub const MAX: Offset = Offset([0xff; OFFSET_LEN]);
    pub const MAX_INDEX: u64 = (1 << 48) - 1;

    pub fn new(index: u64, time_ms: UnixMillis) -> Self {
        let mut b = [0u8; OFFSET_LEN];
        write_be48(&mut b[..TIME_LEN], time_ms);
        write_be48(&mut b[SEQ_START..], index);
        Offset(b)
    }

    /// Largest offset carrying a timestamp at or before `time_ms`. Used as
    /// the inclusive upper bound when fetching up to "now".
    pub fn upper_bound(time_ms: UnixMillis) -> Self {
        let mut b = [0xffu8; OFFSET_LEN];
        write_be48(&mut b[..TIME_LEN], time_ms);
        Offset(b)
    }

    pub(crate) fn from_parts(time_ms: UnixMillis, worker: u32, index: u64) -> Self {
        let mut b = [0u8; OFFSET_LEN];
        write_be48(&mut b[..TIME_LEN], time_ms);
        b[TIME_LEN..SEQ_START].copy_from_slice(&worker.to_be_bytes());
        write_be48(&mut b[SEQ_START..], index);
        Offset(b)
    }

    pub fn from_bytes(bytes: [u8; OFFSET_LEN]) -> Self {
        Offset(bytes)
    }

    pub fn try_from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; OFFSET_LEN] = slice.try_into().ok()?;
        Some(Offset(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; OFFSET_LEN] {
        &self.0
    }

    pub fn index(&self) -> u64 {
        read_be48(&self.0[SEQ_START..])
    }

    pub fn time_ms(&self) -> UnixMillis {
        read_be48(&self.0[..TIME_LEN])
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn equal(&self, other: &Offset) -> bool {
        self == other
    }

    pub fn before(&self, other: &Offset) -> bool {
        self < other
    }

    pub fn after(&self, other: &Offset) -> bool {
        self > other
    }
}

fn write_be48(dst: &mut [u8], v: u64) {
    let v = v.min((1 << 48) - 1);
    dst.copy_from_slice(&v.to_be_bytes()[2..]);
}

fn read_be48(src: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[2..].copy_from_slice(&src[..6]);
    u64::from_be_bytes(buf)
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Offset({self})")
    }
}

/// Per-partition offset assigner. The clock never moves backwards and the
/// sequence only grows, so assigned offsets are strictly increasing.
#[derive(Debug)]
pub struct OffsetGen {
    worker: u32,
    last_ms: UnixMillis,
    seq: u64,
}

impl OffsetGen {
    pub fn new() -> Self {
        Self {
            worker: fastrand::u32(..),
            last_ms: 0,
            seq: 0,
        }
    }

    /// Resume after the given tail offset. Bumps the timestamp floor past the
    /// tail so the next assignment compares greater regardless of worker id.
    pub fn seeded(tail: Offset) -> Self {
        let mut assigner = Self::new();
        assigner.last_ms = tail.time_ms() + 1;
        assigner.seq = tail.index();
        assigner
    }

    pub fn next(&mut self, now: UnixMillis) -> Offset {
        if now > self.last_ms {
            self.last_ms = now;
        }
        self.seq += 1;
        Offset::from_parts(self.last_ms, self.worker, self.seq)
    }
}

impl Default for OffsetGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_time_then_sequence() {
        let a = Offset::new(5, 100);
        let b = Offset::new(1, 200);
        let c = Offset::new(2, 200);

        assert!(a.before(&b));
        assert!(b.before(&c));
        assert!(c.after(&a));
        assert!(a.equal(&a));
        assert!(Offset::ZERO.before(&a));
        assert!(a.before(&Offset::MAX));
    }

    #[test]
    fn round_trips_index_and_time() {
        let off = Offset::new(42, 1_700_000_000_000);
        assert_eq!(off.index(), 42);
        assert_eq!(off.time_ms(), 1_700_000_000_000);

        let copy = Offset::try_from_slice(off.as_bytes()).unwrap();
        assert_eq!(copy, off);
        assert!(Offset::try_from_slice(&[0u8; 3]).is_none());
    }

    #[test]
    fn upper_bound_dominates_same_instant() {
        let off = Offset::from_parts(1000, u32::MAX, 99);
        assert!(off.before(&Offset::upper_bound(1000)));
        assert!(Offset::upper_bound(999).before(&off));
    }

    #[test]
    fn generator_is_strictly_increasing() {
        let mut assigner = OffsetGen::new();
        let mut prev = assigner.next(1000);
        // repeated instants and a clock that jumps backwards
        for now in [1000, 1000, 999, 1001, 500, 1002] {
            let next = assigner.next(now);
            assert!(prev.before(&next), "{prev} !< {next}");
            prev = next;
        }
    }

    #[test]
    fn seeded_generator_stays_above_tail() {
        let mut assigner = OffsetGen::new();
        let tail = assigner.next(2000);

        let mut resumed = OffsetGen::seeded(tail);
        let next = resumed.next(0);
        assert!(tail.before(&next));
    }
}
