//! Dense sliding HLL: `2^precision` registers of timestamped samples.

use crate::{estimate, Error, Result, MAX_PRECISION, MIN_PRECISION};

const GROWTH_FACTOR: f64 = 1.5;

/// One observation routed to a register: the time it was seen and the count
/// of leading zeros (plus one) of the hash after index extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub timestamp: i64,
    pub value: u64,
}

/// A register keeps only non-dominated samples: no surviving sample has a
/// newer-or-equal-valued successor, and none is older than the newest sample
/// by more than the window period.
#[derive(Debug, Clone, Default)]
pub struct Register {
    points: Vec<Sample>,
}

impl Register {
    pub(crate) fn from_samples(points: Vec<Sample>) -> Self {
        Self { points }
    }

    pub fn add(&mut self, p: Sample, window_period: u32) {
        let max_time = p.timestamp.saturating_sub(window_period as i64);
        // walk newest to oldest so swap_remove only moves samples we have
        // already visited
        let mut i = self.points.len();
        while i > 0 {
            i -= 1;
            let q = self.points[i];
            if q.value <= p.value || q.timestamp <= max_time {
                self.points.swap_remove(i);
            }
        }
        self.maybe_shrink();
        if self.points.len() == self.points.capacity() {
            let grown = (self.points.capacity() as f64 * GROWTH_FACTOR) as usize + 1;
            self.points.reserve_exact(grown - self.points.len());
        }
        self.points.push(p);
    }

    fn maybe_shrink(&mut self) {
        let len = self.points.len() as f64;
        let capacity = self.points.capacity() as f64;
        if len * GROWTH_FACTOR * GROWTH_FACTOR < capacity {
            self.points.shrink_to((capacity / GROWTH_FACTOR) as usize + 1);
        }
    }

    /// Effective register value over the trailing window: the max sample
    /// value among samples newer than `at - window`, or zero.
    pub fn value_at(&self, window: u64, at: i64) -> u64 {
        let min_time = at.saturating_sub(window.min(i64::MAX as u64) as i64);
        self.points
            .iter()
            .filter(|p| p.timestamp > min_time)
            .map(|p| p.value)
            .max()
            .unwrap_or(0)
    }

    /// Max sample value regardless of time.
    pub fn value_total(&self) -> u64 {
        self.points.iter().map(|p| p.value).max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.points
    }
}

#[derive(Debug, Clone)]
pub struct SlidingHll {
    precision: u8,
    window_period: u32,
    window_precision: u32,
    registers: Vec<Register>,
}

impl SlidingHll {
    pub fn new(precision: u8, window_period: u32, window_precision: u32) -> Result<Self> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return Err(Error::PrecisionOutOfRange);
        }
        Ok(Self {
            precision,
            window_period,
            window_precision,
            registers: vec![Register::default(); 1 << precision],
        })
    }

    pub(crate) fn from_parts(
        precision: u8,
        window_period: u32,
        window_precision: u32,
        registers: Vec<Register>,
    ) -> Result<Self> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return Err(Error::PrecisionOutOfRange);
        }
        debug_assert_eq!(registers.len(), 1 << precision);
        Ok(Self {
            precision,
            window_period,
            window_precision,
            registers,
        })
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    pub fn window_period(&self) -> u32 {
        self.window_period
    }

    pub fn window_precision(&self) -> u32 {
        self.window_precision
    }

    pub fn num_registers(&self) -> usize {
        self.registers.len()
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    pub fn add_hash_at(&mut self, hash: u64, timestamp: i64) {
        // top p bits pick the register
        let idx = (hash >> (64 - self.precision)) as usize;
        // shift out the index bits; the guard bit bounds the zero count
        let shifted = (hash << self.precision) | (1 << (self.precision - 1));
        let value = shifted.leading_zeros() as u64 + 1;
        let window_period = self.window_period;
        self.registers[idx].add(Sample { timestamp, value }, window_period);
    }

    pub fn register_at(&self, idx: usize, window: u64, at: i64) -> u64 {
        self.registers[idx].value_at(window, at)
    }

    /// Estimated count of distinct hashes seen within `window` seconds
    /// before `at`.
    pub fn size(&self, window: u64, at: i64) -> f64 {
        estimate::cardinality(self.precision, self.registers.iter().map(|r| r.value_at(window, at)))
    }

    /// Estimated count of distinct hashes seen over the whole retained
    /// history.
    pub fn size_total(&self) -> f64 {
        estimate::cardinality(self.precision, self.registers.iter().map(|r| r.value_total()))
    }
}

/// Cardinality of the union of several sliding HLLs over the same window.
/// All inputs must share a precision.
pub fn union_size(hlls: &[&SlidingHll], window: u64, at: i64) -> Result<f64> {
    let Some((first, rest)) = hlls.split_first() else {
        return Ok(0.0);
    };
    if rest.iter().any(|h| h.precision != first.precision) {
        return Err(Error::PrecisionMismatch);
    }
    let merged = (0..first.num_registers()).map(|i| {
        hlls.iter()
            .map(|h| h.register_at(i, window, at))
            .max()
            .unwrap_or(0)
    });
    Ok(estimate::cardinality(first.precision, merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_xoshiro::{
        rand_core::{RngCore, SeedableRng},
        Xoshiro256PlusPlus,
    };

    #[test]
    fn precision_bounds() {
        assert_eq!(SlidingHll::new(3, 100, 1).unwrap_err(), Error::PrecisionOutOfRange);
        assert_eq!(SlidingHll::new(19, 100, 1).unwrap_err(), Error::PrecisionOutOfRange);
        for p in MIN_PRECISION..=MAX_PRECISION {
            let h = SlidingHll::new(p, 100, 1).unwrap();
            assert_eq!(h.num_registers(), 1 << p);
        }
    }

    #[test]
    fn register_keeps_only_non_dominated_samples() {
        let values = [8, 9, 6, 6, 7, 4, 5, 2, 9, 1];
        let expected_len = [1, 1, 2, 2, 2, 3, 3, 4, 1, 2];
        let mut r = Register::default();
        for (value, expected) in values.into_iter().zip(expected_len) {
            r.add(Sample { timestamp: 100, value }, 100);
            assert_eq!(r.len(), expected);
        }
    }

    #[test]
    fn register_expires_samples_outside_window_period() {
        let mut r = Register::default();
        r.add(Sample { timestamp: 100, value: 9 }, 50);
        r.add(Sample { timestamp: 120, value: 3 }, 50);
        assert_eq!(r.len(), 2);
        // 100 <= 151 - 50, so the older sample is dropped
        r.add(Sample { timestamp: 151, value: 1 }, 50);
        assert_eq!(r.len(), 2);
        assert_eq!(r.value_at(100, 151), 3);
    }

    #[test]
    fn register_dominance_invariant_holds_after_random_adds() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let mut r = Register::default();
        let mut now = 0i64;
        for _ in 0..10_000 {
            now += 1 + (rng.next_u64() % 3) as i64;
            let value = rng.next_u64() % 20 + 1;
            r.add(Sample { timestamp: now, value }, 100);
        }
        // between any two survivors, the newer must carry a strictly
        // smaller value and must not outdate the older by a full window
        for a in r.samples() {
            for b in r.samples() {
                if b.timestamp > a.timestamp {
                    assert!(b.value < a.value, "{a:?} dominated by {b:?}");
                    assert!(b.timestamp - a.timestamp <= 100, "{a:?} expired by {b:?}");
                }
            }
        }
    }

    #[test]
    fn windowed_register_query() {
        let mut r = Register::default();
        r.add(Sample { timestamp: 10, value: 5 }, 1000);
        r.add(Sample { timestamp: 20, value: 3 }, 1000);
        assert_eq!(r.value_at(5, 21), 3);
        assert_eq!(r.value_at(15, 21), 5);
        assert_eq!(r.value_at(5, 40), 0);
        assert_eq!(r.value_total(), 5);
    }

    #[test]
    fn size_total_tracks_distinct_hashes() {
        let mut h = SlidingHll::new(14, 86400, 1).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        for _ in 0..10_000 {
            h.add_hash_at(rng.next_u64(), 100);
        }
        let est = h.size_total();
        assert!((9900.0..=10100.0).contains(&est), "estimate {est} out of range");
    }

    #[test]
    fn windowed_size_counts_only_recent_keys() {
        let mut h = SlidingHll::new(14, 86400, 1).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        // 1000 distinct keys at each of t = 0..10
        for t in 0..10 {
            for _ in 0..1000 {
                h.add_hash_at(rng.next_u64(), t);
            }
        }
        for w in 1..=10u64 {
            let est = h.size(w, 9);
            let expected = (w * 1000) as f64;
            let err = (est - expected).abs() / expected;
            assert!(err < 0.03, "window {w}: estimate {est} vs {expected}");
        }
    }

    #[test]
    fn union_matches_combined_set() {
        let mut a = SlidingHll::new(12, 86400, 1).unwrap();
        let mut b = SlidingHll::new(12, 86400, 1).unwrap();
        let mut combined = SlidingHll::new(12, 86400, 1).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(9);
        for _ in 0..3000 {
            let h = rng.next_u64();
            a.add_hash_at(h, 50);
            combined.add_hash_at(h, 50);
        }
        for _ in 0..3000 {
            let h = rng.next_u64();
            b.add_hash_at(h, 60);
            combined.add_hash_at(h, 60);
        }
        let unioned = union_size(&[&a, &b], 100, 60).unwrap();
        assert_eq!(unioned, combined.size(100, 60));
    }

    #[test]
    fn union_rejects_mismatched_precision() {
        let a = SlidingHll::new(12, 100, 1).unwrap();
        let b = SlidingHll::new(13, 100, 1).unwrap();
        assert_eq!(union_size(&[&a, &b], 10, 10).unwrap_err(), Error::PrecisionMismatch);
    }

    #[test]
    fn union_of_nothing_is_empty() {
        assert_eq!(union_size(&[], 10, 10).unwrap(), 0.0);
    }
}
