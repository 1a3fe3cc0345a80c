//! Numeric building blocks for bucket statistics.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

/// Welford's online mean/variance. Population variance, no catastrophic
/// cancellation on large, tightly clustered values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Welford {
    n: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> Option<f64> {
        (self.n > 0).then_some(self.mean)
    }

    pub fn variance(&self) -> Option<f64> {
        (self.n > 0).then(|| (self.m2 / self.n as f64).max(0.0))
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }
}

impl FromIterator<f64> for Welford {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut w = Welford::new();
        for x in iter {
            w.push(x);
        }
        w
    }
}

/// Linear interpolation between order statistics, rank = p/100 * (n - 1).
///
/// `values` is sorted in place. `p` is clamped to [0, 100].
pub fn percentile(values: &mut [f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(values[lo] + (values[hi] - values[lo]) * frac)
}

// ---------------------------------------------------------------------------
// Distinct counting
// ---------------------------------------------------------------------------

/// Exact distinct values kept before switching to the sketch.
pub const EXACT_DISTINCT_LIMIT: usize = 10_000;

const HLL_PRECISION: u32 = 14;

/// HyperLogLog with 2^14 registers; standard error about 1.04 / sqrt(m) = 0.81%.
#[derive(Debug, Clone)]
pub struct HyperLogLog {
    registers: Vec<u8>,
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self {
            registers: vec![0; 1 << HLL_PRECISION],
        }
    }
}

impl HyperLogLog {
    pub fn insert<T: Hash + ?Sized>(&mut self, item: &T) {
        let mut hasher = DefaultHasher::new();
        item.hash(&mut hasher);
        self.insert_hash(hasher.finish());
    }

    fn insert_hash(&mut self, hash: u64) {
        let idx = (hash >> (64 - HLL_PRECISION)) as usize;
        let rest = (hash << HLL_PRECISION) | (1 << (HLL_PRECISION - 1));
        let rho = rest.leading_zeros() as u8 + 1;
        if rho > self.registers[idx] {
            self.registers[idx] = rho;
        }
    }

    pub fn estimate(&self) -> u64 {
        let m = self.registers.len() as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2f64.powi(-(r as i32)))
            .sum();
        let raw = alpha * m * m / sum;
        let zeros = self.registers.iter().filter(|&&r| r == 0).count();
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            // Linear counting for small cardinalities
            m * (m / zeros as f64).ln()
        } else {
            raw
        };
        estimate.round() as u64
    }
}

/// Exact below [`EXACT_DISTINCT_LIMIT`] values, HyperLogLog above it.
#[derive(Debug, Clone)]
pub enum DistinctCounter {
    Exact(HashSet<String>),
    Sketch(Box<HyperLogLog>),
}

impl Default for DistinctCounter {
    fn default() -> Self {
        Self::Exact(HashSet::new())
    }
}

impl DistinctCounter {
    pub fn insert(&mut self, value: String) {
        match self {
            Self::Exact(set) => {
                set.insert(value);
                if set.len() > EXACT_DISTINCT_LIMIT {
                    let mut sketch = HyperLogLog::default();
                    for v in set.iter() {
                        sketch.insert(v.as_str());
                    }
                    *self = Self::Sketch(Box::new(sketch));
                }
            }
            Self::Sketch(sketch) => sketch.insert(value.as_str()),
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            Self::Exact(set) => set.len() as u64,
            Self::Sketch(sketch) => sketch.estimate(),
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_of_five() {
        let mut v = vec![5.0, 1.0, 4.0, 2.0, 3.0];
        assert_eq!(percentile(&mut v, 50.0), Some(3.0));
    }

    #[test]
    fn test_percentile_interpolates() {
        let mut v = vec![1.0, 2.0, 3.0, 4.0];
        // rank = 0.9 * 3 = 2.7 -> 3 + 0.7 * (4 - 3)
        let p90 = percentile(&mut v, 90.0).unwrap();
        assert!((p90 - 3.7).abs() < 1e-9);
        assert_eq!(percentile(&mut v, 0.0), Some(1.0));
        assert_eq!(percentile(&mut v, 100.0), Some(4.0));
        assert_eq!(percentile(&mut [], 50.0), None);
    }

    #[test]
    fn test_constant_series_has_zero_std_dev() {
        let w: Welford = [2.0, 2.0, 2.0, 2.0].into_iter().collect();
        assert_eq!(w.std_dev(), Some(0.0));
        assert_eq!(w.mean(), Some(2.0));
    }

    #[test]
    fn test_welford_is_stable_for_large_offsets() {
        let base = 1e9;
        let w: Welford = [base + 4.0, base + 7.0, base + 13.0, base + 16.0]
            .into_iter()
            .collect();
        // Population variance of {4, 7, 13, 16} is 22.5
        assert!((w.variance().unwrap() - 22.5).abs() < 1e-6);
        assert_eq!(Welford::new().mean(), None);
    }

    #[test]
    fn test_distinct_counter_switches_to_sketch() {
        let mut counter = DistinctCounter::default();
        for i in 0..100 {
            counter.insert(format!("v{}", i % 10));
        }
        assert!(counter.is_exact());
        assert_eq!(counter.count(), 10);

        let n = 50_000u64;
        for i in 0..n {
            counter.insert(format!("user-{i}"));
        }
        assert!(!counter.is_exact());
        let est = counter.count() as f64;
        let expected = (n + 10) as f64;
        // Well inside 5 standard errors.
        assert!((est - expected).abs() / expected < 0.05, "estimate {est}");
    }
}
