//! The flatten data cell: owner of the encoded corpus.
//!
//! Vectors are encoded on append and laid out over the block store at a
//! fixed stride. The stride is rounded up to a 4-byte multiple and payloads
//! never straddle a block boundary, so every access is a zero-copy,
//! 4-byte-aligned slice into one block.
//!
//! Reads are lock-free and safe to share across threads after build; append
//! is serialized by the caller.

use crate::config::{Encoding, Metric};
use crate::distance::{kernels, KernelTable};
use crate::error::{QuiverError, Result};
use crate::io::BlockStore;
use crate::quant::{Quantizer, SQ4_UNIFORM_BIAS, SQ8_UNIFORM_BIAS};
use crate::types::InnerId;
use std::borrow::Cow;
use std::io::{Read, Write};

/// Encoded corpus addressed by dense [`InnerId`]s.
pub struct FlattenCell {
    quantizer: Quantizer,
    metric: Metric,
    store: BlockStore,
    /// Bytes reserved per vector; >= code size, multiple of 4.
    stride: usize,
    /// Vectors per block under the no-straddle layout.
    per_block: usize,
    count: u32,
    /// Per-vector raw code sums; populated for uniform encodings only.
    code_sums: Vec<f32>,
    table: &'static KernelTable,
}

impl FlattenCell {
    /// Create an empty cell for a trained quantizer.
    pub fn new(quantizer: Quantizer, metric: Metric, block_size: u64) -> Result<Self> {
        if quantizer.encoding().is_uniform() && metric == Metric::L2 {
            return Err(QuiverError::invalid_argument(
                "uniform encodings support ip and cosine metrics only",
            ));
        }
        let store = BlockStore::new(block_size);
        let stride = quantizer.code_size().next_multiple_of(4);
        let per_block = (store.block_size() as usize) / stride;
        if per_block == 0 {
            return Err(QuiverError::invalid_argument(format!(
                "block size {} cannot hold one {}-byte vector",
                store.block_size(),
                stride
            )));
        }
        Ok(Self {
            quantizer,
            metric,
            store,
            stride,
            per_block,
            count: 0,
            code_sums: Vec::new(),
            table: kernels(),
        })
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.count as usize
    }

    /// True if no vectors are stored.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Vector dimensionality.
    pub fn dim(&self) -> usize {
        self.quantizer.dim()
    }

    /// Corpus encoding.
    pub fn encoding(&self) -> Encoding {
        self.quantizer.encoding()
    }

    /// Distance metric.
    pub fn metric(&self) -> Metric {
        self.metric
    }

    #[inline]
    fn offset(&self, id: InnerId) -> u64 {
        let id = id.index();
        let block = (id / self.per_block) as u64;
        let slot = (id % self.per_block) as u64;
        block * self.store.block_size() + slot * self.stride as u64
    }

    /// Borrow the encoded payload of a stored vector.
    #[inline]
    fn code(&self, id: InnerId) -> &[u8] {
        match self
            .store
            .direct_read(self.offset(id), self.quantizer.code_size() as u64)
        {
            Some(Cow::Borrowed(bytes)) => bytes,
            // The stride layout keeps payloads inside one block; an owned or
            // missing read means the id was out of range.
            _ => {
                debug_assert!(false, "flatten payload escaped its block");
                &[]
            }
        }
    }

    /// Encode and append a vector, returning its internal id. Vectors are
    /// normalized first under the cosine metric.
    pub fn push(&mut self, vector: &[f32]) -> Result<InnerId> {
        if vector.len() != self.dim() {
            return Err(QuiverError::dimension_mismatch(self.dim(), vector.len()));
        }
        let normalized;
        let vector = if self.metric == Metric::Cosine {
            normalized = crate::distance::scalar::normalize(vector).0;
            normalized.as_slice()
        } else {
            vector
        };

        let id = InnerId::new(self.count);
        let mut codes = Vec::with_capacity(self.stride);
        self.quantizer.encode(vector, &mut codes)?;
        self.store.write(&codes, self.offset(id))?;
        if self.encoding().is_uniform() {
            self.code_sums.push(self.quantizer.code_sum(&codes));
        }
        self.count += 1;
        Ok(id)
    }

    /// Normalize a query for the cosine metric; other metrics borrow it
    /// unchanged. Call once per search, not per distance.
    pub fn prepare_query<'a>(&self, query: &'a [f32]) -> Result<Cow<'a, [f32]>> {
        if query.len() != self.dim() {
            return Err(QuiverError::dimension_mismatch(self.dim(), query.len()));
        }
        if self.metric == Metric::Cosine {
            Ok(Cow::Owned(crate::distance::scalar::normalize(query).0))
        } else {
            Ok(Cow::Borrowed(query))
        }
    }

    /// Distance between a prepared query and a stored vector.
    pub fn compute_query(&self, query: &[f32], id: InnerId) -> f32 {
        let codes = self.code(id);
        let dim = self.dim();
        let t = self.table;
        match (&self.quantizer, self.metric) {
            (Quantizer::Fp32 { .. }, Metric::L2) => (t.fp32_l2sq)(query, fp32_view(codes)),
            (Quantizer::Fp32 { .. }, _) => 1.0 - (t.fp32_ip)(query, fp32_view(codes)),
            (Quantizer::Bf16 { .. }, Metric::L2) => {
                let stored = bf16_view(codes);
                let mut sum = 0.0f32;
                for d in 0..dim {
                    let diff = query[d] - crate::distance::scalar::bf16_to_f32(stored[d]);
                    sum += diff * diff;
                }
                sum
            }
            (Quantizer::Bf16 { .. }, _) => {
                let stored = bf16_view(codes);
                let mut sum = 0.0f32;
                for d in 0..dim {
                    sum += query[d] * crate::distance::scalar::bf16_to_f32(stored[d]);
                }
                1.0 - sum
            }
            (Quantizer::Sq8 { lower, diff, .. }, Metric::L2) => {
                (t.sq8_l2sq)(query, codes, lower, diff)
            }
            (Quantizer::Sq8 { lower, diff, .. }, _) => {
                1.0 - (t.sq8_ip)(query, codes, lower, diff)
            }
            (Quantizer::Sq4 { lower, diff, .. }, Metric::L2) => {
                (t.sq4_l2sq)(query, codes, lower, diff)
            }
            (Quantizer::Sq4 { lower, diff, .. }, _) => {
                1.0 - (t.sq4_ip)(query, codes, lower, diff)
            }
            (Quantizer::Sq8Uniform { scale, .. }, _) => {
                // ip = scale * sum(q * (code - bias)) without encoding the query
                let mut sum = 0.0f32;
                for d in 0..dim {
                    sum += query[d] * (codes[d] as f32 - SQ8_UNIFORM_BIAS);
                }
                1.0 - scale * sum
            }
            (Quantizer::Sq4Uniform { scale, .. }, _) => {
                let mut sum = 0.0f32;
                for d in 0..dim {
                    let code = crate::distance::scalar::sq4_extract(codes, d) as f32;
                    sum += query[d] * (code - SQ4_UNIFORM_BIAS);
                }
                1.0 - scale * sum
            }
        }
    }

    /// Distance between two stored vectors.
    pub fn compute_pair(&self, a: InnerId, b: InnerId) -> f32 {
        let ca = self.code(a);
        let cb = self.code(b);
        let dim = self.dim();
        let t = self.table;
        match (&self.quantizer, self.metric) {
            (Quantizer::Fp32 { .. }, Metric::L2) => (t.fp32_l2sq)(fp32_view(ca), fp32_view(cb)),
            (Quantizer::Fp32 { .. }, _) => 1.0 - (t.fp32_ip)(fp32_view(ca), fp32_view(cb)),
            (Quantizer::Bf16 { .. }, Metric::L2) => (t.bf16_l2sq)(bf16_view(ca), bf16_view(cb)),
            (Quantizer::Bf16 { .. }, _) => 1.0 - (t.bf16_ip)(bf16_view(ca), bf16_view(cb)),
            (Quantizer::Sq8 { lower, diff, .. }, Metric::L2) => {
                (t.sq8_codes_l2sq)(ca, cb, lower, diff)
            }
            (Quantizer::Sq8 { lower, diff, .. }, _) => {
                1.0 - (t.sq8_codes_ip)(ca, cb, lower, diff)
            }
            (Quantizer::Sq4 { lower, diff, .. }, Metric::L2) => {
                (t.sq4_codes_l2sq)(ca, cb, lower, diff, dim)
            }
            (Quantizer::Sq4 { lower, diff, .. }, _) => {
                1.0 - (t.sq4_codes_ip)(ca, cb, lower, diff, dim)
            }
            (Quantizer::Sq8Uniform { scale, .. }, _) => {
                let raw = (t.sq8_uniform_ip)(ca, cb);
                1.0 - self.unbias_uniform(raw, a, b, SQ8_UNIFORM_BIAS, *scale)
            }
            (Quantizer::Sq4Uniform { scale, .. }, _) => {
                let raw = (t.sq4_uniform_ip)(ca, cb, dim);
                1.0 - self.unbias_uniform(raw, a, b, SQ4_UNIFORM_BIAS, *scale)
            }
        }
    }

    /// Recover the true inner product from a raw biased code product:
    /// `ip = scale^2 * (raw - bias*(sum_a + sum_b) + d*bias^2)`.
    #[inline]
    fn unbias_uniform(&self, raw: f32, a: InnerId, b: InnerId, bias: f32, scale: f32) -> f32 {
        let sum_a = self.code_sums[a.index()];
        let sum_b = self.code_sums[b.index()];
        let d = self.dim() as f32;
        scale * scale * (raw - bias * (sum_a + sum_b) + d * bias * bias)
    }

    /// Hint the cache for an upcoming access to `id`.
    #[inline]
    pub fn prefetch(&self, id: InnerId) {
        self.store.prefetch(self.offset(id));
    }

    /// Decode a stored vector back to f32. Lossy for quantized encodings.
    pub fn decode(&self, id: InnerId) -> Vec<f32> {
        self.quantizer.decode(self.code(id))
    }

    /// Serialize the cell: encoding tag, metric tag, dim, count, quantizer
    /// parameters, uniform code sums, then the backing block store.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[encoding_tag(self.encoding()), metric_tag(self.metric)])?;
        writer.write_all(&(self.dim() as u32).to_le_bytes())?;
        writer.write_all(&self.count.to_le_bytes())?;
        self.quantizer.write_params(writer)?;
        for sum in &self.code_sums {
            writer.write_all(&sum.to_le_bytes())?;
        }
        self.store.serialize(writer)
    }

    /// Rebuild a cell from [`serialize`](Self::serialize) output.
    pub fn deserialize<R: Read>(reader: &mut R) -> Result<Self> {
        let mut tags = [0u8; 2];
        reader.read_exact(&mut tags)?;
        let encoding = encoding_from_tag(tags[0])?;
        let metric = metric_from_tag(tags[1])?;

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        let dim = u32::from_le_bytes(buf) as usize;
        if dim == 0 {
            return Err(QuiverError::corrupt("zero dimension in flatten cell"));
        }
        reader.read_exact(&mut buf)?;
        let count = u32::from_le_bytes(buf);

        let quantizer = Quantizer::read_params(encoding, dim, reader)?;
        let mut code_sums = Vec::new();
        if encoding.is_uniform() {
            code_sums.reserve(count as usize);
            for _ in 0..count {
                reader.read_exact(&mut buf)?;
                code_sums.push(f32::from_le_bytes(buf));
            }
        }
        let store = BlockStore::deserialize(reader)?;

        let stride = quantizer.code_size().next_multiple_of(4);
        let per_block = (store.block_size() as usize) / stride;
        if per_block == 0 {
            return Err(QuiverError::corrupt("block size below vector stride"));
        }
        let needed_blocks = (count as usize).div_ceil(per_block) as u64;
        if count > 0 && store.capacity() < needed_blocks * store.block_size() {
            return Err(QuiverError::corrupt("flatten store truncated"));
        }

        Ok(Self {
            quantizer,
            metric,
            store,
            stride,
            per_block,
            count,
            code_sums,
            table: kernels(),
        })
    }
}

/// Reinterpret a payload as f32s.
#[inline]
fn fp32_view(bytes: &[u8]) -> &[f32] {
    debug_assert_eq!(bytes.as_ptr() as usize % 4, 0);
    debug_assert_eq!(bytes.len() % 4, 0);
    // SAFETY: block bases are 64-byte aligned and payload offsets are
    // multiples of the 4-byte stride, so the pointer is f32-aligned; any
    // bit pattern is a valid f32.
    unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, bytes.len() / 4) }
}

/// Reinterpret a payload as u16 BF16 bit patterns.
#[inline]
fn bf16_view(bytes: &[u8]) -> &[u16] {
    debug_assert_eq!(bytes.as_ptr() as usize % 2, 0);
    debug_assert_eq!(bytes.len() % 2, 0);
    // SAFETY: same alignment argument as fp32_view with a 2-byte type.
    unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const u16, bytes.len() / 2) }
}

fn encoding_tag(encoding: Encoding) -> u8 {
    match encoding {
        Encoding::Fp32 => 0,
        Encoding::Bf16 => 1,
        Encoding::Sq8 => 2,
        Encoding::Sq4 => 3,
        Encoding::Sq4Uniform => 4,
        Encoding::Sq8Uniform => 5,
    }
}

fn encoding_from_tag(tag: u8) -> Result<Encoding> {
    Ok(match tag {
        0 => Encoding::Fp32,
        1 => Encoding::Bf16,
        2 => Encoding::Sq8,
        3 => Encoding::Sq4,
        4 => Encoding::Sq4Uniform,
        5 => Encoding::Sq8Uniform,
        _ => return Err(QuiverError::corrupt(format!("unknown encoding tag {tag}"))),
    })
}

fn metric_tag(metric: Metric) -> u8 {
    match metric {
        Metric::L2 => 0,
        Metric::Ip => 1,
        Metric::Cosine => 2,
    }
}

fn metric_from_tag(tag: u8) -> Result<Metric> {
    Ok(match tag {
        0 => Metric::L2,
        1 => Metric::Ip,
        2 => Metric::Cosine,
        _ => return Err(QuiverError::corrupt(format!("unknown metric tag {tag}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::scalar;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn rows(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect()
    }

    fn cell_with(encoding: Encoding, metric: Metric, data: &[Vec<f32>]) -> FlattenCell {
        let dim = data[0].len();
        let quantizer =
            Quantizer::fit(encoding, dim, data.iter().map(|r| r.as_slice())).unwrap();
        let mut cell = FlattenCell::new(quantizer, metric, 4096).unwrap();
        for row in data {
            cell.push(row).unwrap();
        }
        cell
    }

    #[test]
    fn test_fp32_pair_matches_scalar() {
        let data = rows(64, 24, 1);
        let cell = cell_with(Encoding::Fp32, Metric::L2, &data);
        assert_eq!(cell.len(), 64);

        for (a, b) in [(0usize, 1usize), (5, 40), (63, 0)] {
            let expected = scalar::fp32_l2sq(&data[a], &data[b]);
            let got = cell.compute_pair(InnerId::new(a as u32), InnerId::new(b as u32));
            assert!((expected - got).abs() < 1e-4, "{expected} vs {got}");
        }
    }

    #[test]
    fn test_query_pair_consistency_fp32() {
        let data = rows(32, 16, 2);
        let cell = cell_with(Encoding::Fp32, Metric::L2, &data);
        // compute_query against a stored row equals compute_pair.
        let q = cell.prepare_query(&data[3]).unwrap();
        let via_query = cell.compute_query(&q, InnerId::new(9));
        let via_pair = cell.compute_pair(InnerId::new(3), InnerId::new(9));
        assert!((via_query - via_pair).abs() < 1e-4);
    }

    #[test]
    fn test_sq8_query_close_to_exact() {
        let data = rows(128, 32, 3);
        let cell = cell_with(Encoding::Sq8, Metric::L2, &data);
        let q = &data[0];
        for b in [1u32, 17, 99] {
            let exact = scalar::fp32_l2sq(q, &data[b as usize]);
            let approx = cell.compute_query(q, InnerId::new(b));
            // SQ8 over [-1,1]^32: quantization noise stays small.
            assert!(
                (exact - approx).abs() < 0.05 * (1.0 + exact),
                "exact {exact} vs approx {approx}"
            );
        }
    }

    #[test]
    fn test_uniform_ip_unbiasing() {
        let data = rows(32, 16, 4);
        let cell = cell_with(Encoding::Sq8Uniform, Metric::Ip, &data);
        for (a, b) in [(0usize, 1usize), (3, 30)] {
            let exact = 1.0 - scalar::fp32_ip(&data[a], &data[b]);
            let approx = cell.compute_pair(InnerId::new(a as u32), InnerId::new(b as u32));
            assert!(
                (exact - approx).abs() < 0.1,
                "exact {exact} vs approx {approx}"
            );
        }
    }

    #[test]
    fn test_cosine_normalizes_on_push() {
        let data = vec![vec![3.0f32, 4.0, 0.0, 0.0], vec![0.0, 5.0, 0.0, 0.0]];
        let cell = cell_with(Encoding::Fp32, Metric::Cosine, &data);
        let decoded = cell.decode(InnerId::new(0));
        assert!((scalar::fp32_ip(&decoded, &decoded) - 1.0).abs() < 1e-5);

        // Identical direction: distance ~ 1 - cos = 1 - (3/5 * 0 + 4/5 * 1)
        let q = cell.prepare_query(&[0.0, 1.0, 0.0, 0.0]).unwrap();
        let dist = cell.compute_query(&q, InnerId::new(0));
        assert!((dist - (1.0 - 0.8)).abs() < 1e-5);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let data = rows(100, 20, 5);
        let cell = cell_with(Encoding::Sq8, Metric::L2, &data);

        let mut bytes = Vec::new();
        cell.serialize(&mut bytes).unwrap();
        let restored = FlattenCell::deserialize(&mut bytes.as_slice()).unwrap();

        assert_eq!(restored.len(), cell.len());
        assert_eq!(restored.dim(), cell.dim());
        assert_eq!(restored.encoding(), cell.encoding());
        for (a, b) in [(0u32, 1u32), (50, 99)] {
            let before = cell.compute_pair(InnerId::new(a), InnerId::new(b));
            let after = restored.compute_pair(InnerId::new(a), InnerId::new(b));
            assert_eq!(before, after);
        }
    }

    #[test]
    fn test_push_rejects_wrong_dim() {
        let data = rows(4, 8, 6);
        let mut cell = cell_with(Encoding::Fp32, Metric::L2, &data);
        assert!(matches!(
            cell.push(&[0.0; 9]),
            Err(QuiverError::DimensionMismatch { .. })
        ));
        // Failed push leaves the cell unchanged.
        assert_eq!(cell.len(), 4);
    }

    #[test]
    fn test_payloads_span_many_blocks() {
        // 4 KiB blocks, 96-byte stride: forces multiple blocks and exercises
        // the no-straddle layout.
        let data = rows(300, 24, 7);
        let cell = cell_with(Encoding::Fp32, Metric::L2, &data);
        for i in [0usize, 42, 255, 299] {
            let decoded = cell.decode(InnerId::new(i as u32));
            assert_eq!(decoded, data[i], "row {i} corrupted by block layout");
        }
    }
}
