//! Rate-aware batch sizing and planning.

use std::ops::Range;

/// Largest batch that, worked sequentially at both rate limits, finishes in
/// roughly `window_secs`.
///
/// Each item costs one call against each of the two rate-limited
/// dependencies, so the slower limit is the bottleneck. Never returns less
/// than one item when `max_batch_size >= 1`, so very low rates still progress.
pub fn optimal_batch_size(rate_a: f64, rate_b: f64, window_secs: f64, max_batch_size: usize) -> usize {
    // `as` saturates: negative or NaN capacities become 0.
    let capacity_a = (rate_a * window_secs).floor() as usize;
    let capacity_b = (rate_b * window_secs).floor() as usize;
    let size = capacity_a.min(capacity_b).min(max_batch_size);
    if max_batch_size == 0 { 0 } else { size.max(1) }
}

/// Split of `total` items into consecutive batches of at most `batch_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    total: usize,
    batch_size: usize,
}

impl BatchPlan {
    /// `batch_size` of zero is treated as one.
    pub fn new(total: usize, batch_size: usize) -> Self {
        Self {
            total,
            batch_size: batch_size.max(1),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn total_batches(&self) -> usize {
        self.total.div_ceil(self.batch_size)
    }

    /// 0-based batch index containing item `index`.
    pub fn batch_of(&self, index: usize) -> usize {
        index / self.batch_size
    }

    /// Item range of 0-based batch `batch`; empty past the end.
    pub fn bounds(&self, batch: usize) -> Range<usize> {
        let start = batch.saturating_mul(self.batch_size).min(self.total);
        let end = start.saturating_add(self.batch_size).min(self.total);
        start..end
    }

    pub fn batches(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        (0..self.total_batches()).map(|b| self.bounds(b))
    }
}
