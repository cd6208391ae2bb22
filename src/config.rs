//! Index, build, and search configuration.
//!
//! All parameter structs derive serde so callers can decode them from JSON
//! parameter blobs; `validate` methods reject out-of-range values before any
//! work starts.

use crate::error::{QuiverError, Result};
use serde::{Deserialize, Serialize};

/// Supported distance metrics.
///
/// Cosine is realized as inner product over l2-normalized vectors: both
/// appended vectors and queries are normalized on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Squared Euclidean distance.
    L2,
    /// Inner product distance: `1 - dot(a, b)`.
    Ip,
    /// Inner product over normalized vectors.
    Cosine,
}

/// Vector encodings supported by the flatten cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// 4 bytes per dimension, no loss.
    Fp32,
    /// 2 bytes per dimension, truncated mantissa.
    Bf16,
    /// 1 byte per dimension with per-dimension lower/diff tables.
    Sq8,
    /// Half a byte per dimension with per-dimension lower/diff tables.
    Sq4,
    /// Half a byte per dimension, one global scale.
    Sq4Uniform,
    /// 1 byte per dimension, one global scale.
    Sq8Uniform,
}

impl Encoding {
    /// Encoded payload size in bytes for a vector of dimension `dim`,
    /// excluding quantizer tables.
    pub fn code_size(self, dim: usize) -> usize {
        match self {
            Encoding::Fp32 => dim * 4,
            Encoding::Bf16 => dim * 2,
            Encoding::Sq8 | Encoding::Sq8Uniform => dim,
            Encoding::Sq4 | Encoding::Sq4Uniform => dim.div_ceil(2),
        }
    }

    /// Whether this encoding carries one global scale instead of per-dim
    /// tables.
    pub fn is_uniform(self) -> bool {
        matches!(self, Encoding::Sq4Uniform | Encoding::Sq8Uniform)
    }
}

/// Options fixed at index creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Vector dimensionality.
    pub dim: usize,
    /// Distance metric.
    pub metric: Metric,
    /// Corpus encoding.
    #[serde(default = "defaults::encoding")]
    pub encoding: Encoding,
    /// Cap on out-degree per node.
    #[serde(default = "defaults::max_degree")]
    pub max_degree: usize,
    /// Beam width during insertion.
    #[serde(default = "defaults::ef_construction")]
    pub ef_construction: usize,
    /// Diversity pruning slack applied when selecting neighbors; >= 1.0,
    /// larger keeps denser graphs.
    #[serde(default = "defaults::alpha_hnsw")]
    pub alpha: f32,
    /// Byte granularity of the backing block store.
    #[serde(default = "defaults::block_size")]
    pub block_size: u64,
}

impl IndexOptions {
    /// Create options with defaults for everything but dimension and metric.
    pub fn new(dim: usize, metric: Metric) -> Self {
        Self {
            dim,
            metric,
            encoding: defaults::encoding(),
            max_degree: defaults::max_degree(),
            ef_construction: defaults::ef_construction(),
            alpha: defaults::alpha_hnsw(),
            block_size: defaults::block_size(),
        }
    }

    /// Set the corpus encoding.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the out-degree cap.
    pub fn with_max_degree(mut self, max_degree: usize) -> Self {
        self.max_degree = max_degree;
        self
    }

    /// Set the construction beam width.
    pub fn with_ef_construction(mut self, ef_construction: usize) -> Self {
        self.ef_construction = ef_construction;
        self
    }

    /// Set the diversity pruning slack.
    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    /// Check parameter ranges.
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(QuiverError::invalid_argument("dim must be positive"));
        }
        if self.max_degree < 2 {
            return Err(QuiverError::invalid_argument("max_degree must be >= 2"));
        }
        if self.ef_construction == 0 {
            return Err(QuiverError::invalid_argument(
                "ef_construction must be positive",
            ));
        }
        if self.alpha < 1.0 {
            return Err(QuiverError::invalid_argument("alpha must be >= 1.0"));
        }
        if self.encoding.is_uniform() && self.metric == Metric::L2 {
            return Err(QuiverError::invalid_argument(
                "uniform encodings support ip and cosine metrics only",
            ));
        }
        Ok(())
    }
}

/// Parameters for the ODescent bulk builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OdescentParams {
    /// Number of refinement rounds.
    #[serde(default = "defaults::turns")]
    pub turns: usize,
    /// Per-round neighbor sampling rate in (0, 1].
    #[serde(default = "defaults::sample_rate")]
    pub sample_rate: f32,
    /// Diversity pruning slack; >= 1.0, larger keeps denser graphs.
    #[serde(default = "defaults::alpha")]
    pub alpha: f32,
    /// Lower bound enforced by the in-degree repair phase.
    #[serde(default = "defaults::min_in_degree")]
    pub min_in_degree: usize,
    /// Run the diversity pruning and reverse-edge phases after refinement.
    #[serde(default = "defaults::pruning")]
    pub pruning: bool,
    /// Seed for the builder's RNG; builds are deterministic per seed and
    /// block partition.
    #[serde(default)]
    pub seed: u64,
}

impl Default for OdescentParams {
    fn default() -> Self {
        Self {
            turns: defaults::turns(),
            sample_rate: defaults::sample_rate(),
            alpha: defaults::alpha(),
            min_in_degree: defaults::min_in_degree(),
            pruning: defaults::pruning(),
            seed: 0,
        }
    }
}

impl OdescentParams {
    /// Check parameter ranges.
    pub fn validate(&self) -> Result<()> {
        if self.turns == 0 {
            return Err(QuiverError::invalid_argument("turns must be positive"));
        }
        if !(self.sample_rate > 0.0 && self.sample_rate <= 1.0) {
            return Err(QuiverError::invalid_argument(
                "sample_rate must be in (0, 1]",
            ));
        }
        if self.alpha < 1.0 {
            return Err(QuiverError::invalid_argument("alpha must be >= 1.0"));
        }
        Ok(())
    }
}

/// Per-query search parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchParams {
    /// Beam width during search.
    pub ef_search: usize,
    /// Estimated fraction of the corpus the active filter accepts; values
    /// below 1.0 widen the effective beam to `ceil(ef_search / valid_ratio)`.
    #[serde(default = "defaults::valid_ratio")]
    pub valid_ratio: f32,
}

impl SearchParams {
    /// Create search parameters with the given beam width.
    pub fn new(ef_search: usize) -> Self {
        Self {
            ef_search,
            valid_ratio: 1.0,
        }
    }

    /// Set the filter validity ratio.
    pub fn with_valid_ratio(mut self, valid_ratio: f32) -> Self {
        self.valid_ratio = valid_ratio;
        self
    }

    /// Beam width after widening for the filter validity ratio.
    pub fn effective_ef(&self) -> usize {
        if self.valid_ratio > 0.0 && self.valid_ratio < 1.0 {
            (self.ef_search as f32 / self.valid_ratio).ceil() as usize
        } else {
            self.ef_search
        }
    }

    /// Check parameter ranges.
    pub fn validate(&self) -> Result<()> {
        if self.ef_search == 0 {
            return Err(QuiverError::invalid_argument("ef_search must be positive"));
        }
        if !(self.valid_ratio > 0.0 && self.valid_ratio <= 1.0) {
            return Err(QuiverError::invalid_argument(
                "valid_ratio must be in (0, 1]",
            ));
        }
        Ok(())
    }
}

mod defaults {
    use super::Encoding;

    pub(super) fn encoding() -> Encoding {
        Encoding::Fp32
    }
    pub(super) fn max_degree() -> usize {
        32
    }
    pub(super) fn ef_construction() -> usize {
        200
    }
    pub(super) fn alpha_hnsw() -> f32 {
        1.0
    }
    pub(super) fn block_size() -> u64 {
        128 * 1024 * 1024
    }
    pub(super) fn turns() -> usize {
        10
    }
    pub(super) fn sample_rate() -> f32 {
        0.3
    }
    pub(super) fn alpha() -> f32 {
        1.2
    }
    pub(super) fn min_in_degree() -> usize {
        1
    }
    pub(super) fn pruning() -> bool {
        true
    }
    pub(super) fn valid_ratio() -> f32 {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_zero_dim() {
        let opts = IndexOptions::new(0, Metric::L2);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_validate_uniform_l2() {
        let opts = IndexOptions::new(64, Metric::L2).with_encoding(Encoding::Sq8Uniform);
        assert!(opts.validate().is_err());

        let opts = IndexOptions::new(64, Metric::Ip).with_encoding(Encoding::Sq8Uniform);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_code_sizes() {
        assert_eq!(Encoding::Fp32.code_size(128), 512);
        assert_eq!(Encoding::Bf16.code_size(128), 256);
        assert_eq!(Encoding::Sq8.code_size(128), 128);
        assert_eq!(Encoding::Sq4.code_size(128), 64);
        assert_eq!(Encoding::Sq4.code_size(129), 65);
    }

    #[test]
    fn test_effective_ef_widens_for_filters() {
        let params = SearchParams::new(100).with_valid_ratio(0.5);
        assert_eq!(params.effective_ef(), 200);

        let params = SearchParams::new(100);
        assert_eq!(params.effective_ef(), 100);
    }

    #[test]
    fn test_odescent_params_ranges() {
        let mut params = OdescentParams::default();
        assert!(params.validate().is_ok());
        params.sample_rate = 0.0;
        assert!(params.validate().is_err());
        params.sample_rate = 0.3;
        params.alpha = 0.5;
        assert!(params.validate().is_err());
    }
}
