//! Label predicates for filtered search.
//!
//! Filtered searches still explore nodes that fail the predicate so the
//! graph walk stays navigable; failing nodes are only excluded from the
//! result set. A predicate may report a `valid_ratio` so the engine can
//! widen the beam proactively.

use crate::types::LabelId;
use roaring::RoaringTreemap;

/// A predicate over vector labels.
pub trait FilterPredicate: Send + Sync {
    /// True iff results with this label may be yielded.
    fn accepts(&self, label: LabelId) -> bool;

    /// Estimated fraction of the corpus this predicate accepts, in (0, 1].
    fn valid_ratio(&self) -> f32 {
        1.0
    }
}

/// Filter backed by a closure.
pub struct ClosureFilter<F> {
    accept: F,
    valid_ratio: f32,
}

impl<F> ClosureFilter<F>
where
    F: Fn(LabelId) -> bool + Send + Sync,
{
    /// Wrap a closure with an assumed valid ratio of 1.0.
    pub fn new(accept: F) -> Self {
        Self {
            accept,
            valid_ratio: 1.0,
        }
    }

    /// Set the estimated valid ratio.
    pub fn with_valid_ratio(mut self, valid_ratio: f32) -> Self {
        self.valid_ratio = valid_ratio;
        self
    }
}

impl<F> FilterPredicate for ClosureFilter<F>
where
    F: Fn(LabelId) -> bool + Send + Sync,
{
    fn accepts(&self, label: LabelId) -> bool {
        (self.accept)(label)
    }

    fn valid_ratio(&self) -> f32 {
        self.valid_ratio
    }
}

/// Filter backed by an explicit label set.
pub struct BitmapFilter {
    labels: RoaringTreemap,
    valid_ratio: f32,
}

impl BitmapFilter {
    /// Build a filter accepting exactly the given labels. `corpus_len` is
    /// used to estimate the valid ratio.
    pub fn new(labels: impl IntoIterator<Item = LabelId>, corpus_len: usize) -> Self {
        let labels: RoaringTreemap = labels.into_iter().map(LabelId::as_u64).collect();
        let valid_ratio = if corpus_len == 0 {
            1.0
        } else {
            ((labels.len() as f64 / corpus_len as f64) as f32).clamp(f32::MIN_POSITIVE, 1.0)
        };
        Self {
            labels,
            valid_ratio,
        }
    }
}

impl FilterPredicate for BitmapFilter {
    fn accepts(&self, label: LabelId) -> bool {
        self.labels.contains(label.as_u64())
    }

    fn valid_ratio(&self) -> f32 {
        self.valid_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_filter() {
        let filter = ClosureFilter::new(|label: LabelId| label.as_u64() % 2 == 1)
            .with_valid_ratio(0.5);
        assert!(filter.accepts(LabelId::new(3)));
        assert!(!filter.accepts(LabelId::new(4)));
        assert_eq!(filter.valid_ratio(), 0.5);
    }

    #[test]
    fn test_bitmap_filter_ratio() {
        let filter = BitmapFilter::new((0..25u64).map(LabelId::new), 100);
        assert!(filter.accepts(LabelId::new(24)));
        assert!(!filter.accepts(LabelId::new(25)));
        assert!((filter.valid_ratio() - 0.25).abs() < 1e-6);
    }
}
