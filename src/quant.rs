//! Vector encoders over a closed set of encodings.
//!
//! [`Quantizer`] is a tagged sum, not a trait object: the flatten cell
//! matches on it once per operation and calls straight into the width
//! kernels, keeping virtual dispatch out of the hot path.
//!
//! Scalar-quantized variants carry per-dimension `lower`/`diff` tables and
//! decode as `code / levels * diff + lower`. Uniform variants carry a single
//! global scale and encode biased around zero: `code = round(v / scale) + B`
//! with `B = 128` (SQ8) or `B = 8` (SQ4); the cell undoes the bias using
//! per-vector code sums.

use crate::config::Encoding;
use crate::distance::scalar::{f32_to_bf16, sq4_extract};
use crate::error::{QuiverError, Result};
use std::io::{Read, Write};

/// Bias added to uniform SQ8 codes so negative components survive.
pub const SQ8_UNIFORM_BIAS: f32 = 128.0;
/// Bias added to uniform SQ4 codes.
pub const SQ4_UNIFORM_BIAS: f32 = 8.0;

/// A trained encoder for one of the supported encodings.
#[derive(Debug, Clone)]
pub enum Quantizer {
    /// Raw little-endian f32 bytes.
    Fp32 { dim: usize },
    /// Truncated-mantissa 16-bit floats.
    Bf16 { dim: usize },
    /// 8-bit codes with per-dimension tables.
    Sq8 {
        dim: usize,
        lower: Vec<f32>,
        diff: Vec<f32>,
    },
    /// 4-bit packed codes with per-dimension tables.
    Sq4 {
        dim: usize,
        lower: Vec<f32>,
        diff: Vec<f32>,
    },
    /// 4-bit packed codes with one global scale.
    Sq4Uniform { dim: usize, scale: f32 },
    /// 8-bit codes with one global scale.
    Sq8Uniform { dim: usize, scale: f32 },
}

impl Quantizer {
    /// Train a quantizer of the given encoding over `samples`.
    ///
    /// FP32 and BF16 need no training and ignore the samples. SQ8/SQ4 scan
    /// per-dimension min/max; uniform variants scan the global max-abs.
    pub fn fit<'a, I>(encoding: Encoding, dim: usize, samples: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a [f32]>,
    {
        if dim == 0 {
            return Err(QuiverError::invalid_argument("dim must be positive"));
        }
        match encoding {
            Encoding::Fp32 => Ok(Self::Fp32 { dim }),
            Encoding::Bf16 => Ok(Self::Bf16 { dim }),
            Encoding::Sq8 | Encoding::Sq4 => {
                let mut lower = vec![f32::MAX; dim];
                let mut upper = vec![f32::MIN; dim];
                let mut seen = false;
                for row in samples {
                    if row.len() != dim {
                        return Err(QuiverError::dimension_mismatch(dim, row.len()));
                    }
                    seen = true;
                    for d in 0..dim {
                        lower[d] = lower[d].min(row[d]);
                        upper[d] = upper[d].max(row[d]);
                    }
                }
                if !seen {
                    return Err(QuiverError::invalid_argument(
                        "scalar quantization requires at least one training vector",
                    ));
                }
                let diff: Vec<f32> = lower
                    .iter()
                    .zip(upper.iter())
                    .map(|(lo, hi)| (hi - lo).max(0.0))
                    .collect();
                match encoding {
                    Encoding::Sq8 => Ok(Self::Sq8 { dim, lower, diff }),
                    _ => Ok(Self::Sq4 { dim, lower, diff }),
                }
            }
            Encoding::Sq8Uniform | Encoding::Sq4Uniform => {
                let mut max_abs = 0.0f32;
                let mut seen = false;
                for row in samples {
                    if row.len() != dim {
                        return Err(QuiverError::dimension_mismatch(dim, row.len()));
                    }
                    seen = true;
                    for &v in row {
                        max_abs = max_abs.max(v.abs());
                    }
                }
                if !seen {
                    return Err(QuiverError::invalid_argument(
                        "uniform quantization requires at least one training vector",
                    ));
                }
                match encoding {
                    Encoding::Sq8Uniform => Ok(Self::Sq8Uniform {
                        dim,
                        scale: if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 },
                    }),
                    _ => Ok(Self::Sq4Uniform {
                        dim,
                        scale: if max_abs > 0.0 { max_abs / 7.0 } else { 1.0 },
                    }),
                }
            }
        }
    }

    /// The encoding tag.
    pub fn encoding(&self) -> Encoding {
        match self {
            Self::Fp32 { .. } => Encoding::Fp32,
            Self::Bf16 { .. } => Encoding::Bf16,
            Self::Sq8 { .. } => Encoding::Sq8,
            Self::Sq4 { .. } => Encoding::Sq4,
            Self::Sq4Uniform { .. } => Encoding::Sq4Uniform,
            Self::Sq8Uniform { .. } => Encoding::Sq8Uniform,
        }
    }

    /// Vector dimensionality.
    pub fn dim(&self) -> usize {
        match self {
            Self::Fp32 { dim }
            | Self::Bf16 { dim }
            | Self::Sq8 { dim, .. }
            | Self::Sq4 { dim, .. }
            | Self::Sq4Uniform { dim, .. }
            | Self::Sq8Uniform { dim, .. } => *dim,
        }
    }

    /// Encoded payload size per vector in bytes.
    pub fn code_size(&self) -> usize {
        self.encoding().code_size(self.dim())
    }

    /// Global scale of a uniform quantizer.
    pub fn uniform_scale(&self) -> Option<f32> {
        match self {
            Self::Sq4Uniform { scale, .. } | Self::Sq8Uniform { scale, .. } => Some(*scale),
            _ => None,
        }
    }

    /// Encode `vector`, appending exactly [`code_size`](Self::code_size)
    /// bytes to `out`.
    pub fn encode(&self, vector: &[f32], out: &mut Vec<u8>) -> Result<()> {
        if vector.len() != self.dim() {
            return Err(QuiverError::dimension_mismatch(self.dim(), vector.len()));
        }
        match self {
            Self::Fp32 { .. } => {
                for &v in vector {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            Self::Bf16 { .. } => {
                for &v in vector {
                    out.extend_from_slice(&f32_to_bf16(v).to_le_bytes());
                }
            }
            Self::Sq8 { lower, diff, .. } => {
                for d in 0..vector.len() {
                    out.push(quantize_component(vector[d], lower[d], diff[d], 255.0));
                }
            }
            Self::Sq4 { lower, diff, .. } => {
                let mut byte = 0u8;
                for d in 0..vector.len() {
                    let code = quantize_component(vector[d], lower[d], diff[d], 15.0);
                    if d & 1 == 0 {
                        byte = code;
                    } else {
                        out.push(byte | (code << 4));
                    }
                }
                if vector.len() & 1 == 1 {
                    out.push(byte);
                }
            }
            Self::Sq8Uniform { scale, .. } => {
                for &v in vector {
                    let code = (v / scale).round() + SQ8_UNIFORM_BIAS;
                    out.push(code.clamp(0.0, 255.0) as u8);
                }
            }
            Self::Sq4Uniform { scale, .. } => {
                let mut byte = 0u8;
                for (d, &v) in vector.iter().enumerate() {
                    let code = ((v / scale).round() + SQ4_UNIFORM_BIAS).clamp(0.0, 15.0) as u8;
                    if d & 1 == 0 {
                        byte = code;
                    } else {
                        out.push(byte | (code << 4));
                    }
                }
                if vector.len() & 1 == 1 {
                    out.push(byte);
                }
            }
        }
        Ok(())
    }

    /// Decode a code payload back to f32. Lossy for everything but FP32.
    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        let dim = self.dim();
        match self {
            Self::Fp32 { .. } => codes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Self::Bf16 { .. } => codes
                .chunks_exact(2)
                .map(|c| crate::distance::scalar::bf16_to_f32(u16::from_le_bytes([c[0], c[1]])))
                .collect(),
            Self::Sq8 { lower, diff, .. } => (0..dim)
                .map(|d| codes[d] as f32 / 255.0 * diff[d] + lower[d])
                .collect(),
            Self::Sq4 { lower, diff, .. } => (0..dim)
                .map(|d| sq4_extract(codes, d) as f32 / 15.0 * diff[d] + lower[d])
                .collect(),
            Self::Sq8Uniform { scale, .. } => (0..dim)
                .map(|d| (codes[d] as f32 - SQ8_UNIFORM_BIAS) * scale)
                .collect(),
            Self::Sq4Uniform { scale, .. } => (0..dim)
                .map(|d| (sq4_extract(codes, d) as f32 - SQ4_UNIFORM_BIAS) * scale)
                .collect(),
        }
    }

    /// Sum of the raw codes of a payload, used by the cell to unbias uniform
    /// inner products.
    pub fn code_sum(&self, codes: &[u8]) -> f32 {
        match self {
            Self::Sq8Uniform { .. } => codes.iter().map(|&c| c as u32).sum::<u32>() as f32,
            Self::Sq4Uniform { dim, .. } => (0..*dim)
                .map(|d| sq4_extract(codes, d) as u32)
                .sum::<u32>() as f32,
            _ => 0.0,
        }
    }

    /// Serialize the quantizer parameters: per-dimension `lower` then `diff`
    /// tables for SQ8/SQ4, one global scale for uniform variants, nothing
    /// for FP32/BF16. All little-endian f32.
    pub fn write_params<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            Self::Fp32 { .. } | Self::Bf16 { .. } => {}
            Self::Sq8 { lower, diff, .. } | Self::Sq4 { lower, diff, .. } => {
                for v in lower.iter().chain(diff.iter()) {
                    writer.write_all(&v.to_le_bytes())?;
                }
            }
            Self::Sq4Uniform { scale, .. } | Self::Sq8Uniform { scale, .. } => {
                writer.write_all(&scale.to_le_bytes())?;
            }
        }
        Ok(())
    }

    /// Rebuild a quantizer from [`write_params`](Self::write_params) output.
    pub fn read_params<R: Read>(encoding: Encoding, dim: usize, reader: &mut R) -> Result<Self> {
        fn read_f32<R: Read>(reader: &mut R) -> Result<f32> {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            Ok(f32::from_le_bytes(buf))
        }

        match encoding {
            Encoding::Fp32 => Ok(Self::Fp32 { dim }),
            Encoding::Bf16 => Ok(Self::Bf16 { dim }),
            Encoding::Sq8 | Encoding::Sq4 => {
                let mut lower = Vec::with_capacity(dim);
                for _ in 0..dim {
                    lower.push(read_f32(reader)?);
                }
                let mut diff = Vec::with_capacity(dim);
                for _ in 0..dim {
                    let v = read_f32(reader)?;
                    if v < 0.0 || !v.is_finite() {
                        return Err(QuiverError::corrupt("negative or non-finite diff table"));
                    }
                    diff.push(v);
                }
                match encoding {
                    Encoding::Sq8 => Ok(Self::Sq8 { dim, lower, diff }),
                    _ => Ok(Self::Sq4 { dim, lower, diff }),
                }
            }
            Encoding::Sq8Uniform => Ok(Self::Sq8Uniform {
                dim,
                scale: read_f32(reader)?,
            }),
            Encoding::Sq4Uniform => Ok(Self::Sq4Uniform {
                dim,
                scale: read_f32(reader)?,
            }),
        }
    }
}

#[inline]
fn quantize_component(value: f32, lower: f32, diff: f32, levels: f32) -> u8 {
    if diff <= 0.0 {
        return 0;
    }
    ((value - lower) / diff * levels).round().clamp(0.0, levels) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn rows(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect()
    }

    #[test]
    fn test_sq8_roundtrip_error_bound() {
        let dim = 32;
        let data = rows(100, dim, 3);
        let quantizer =
            Quantizer::fit(Encoding::Sq8, dim, data.iter().map(|r| r.as_slice())).unwrap();

        let (lower, diff) = match &quantizer {
            Quantizer::Sq8 { lower, diff, .. } => (lower.clone(), diff.clone()),
            _ => unreachable!(),
        };

        for row in &data {
            let mut codes = Vec::new();
            quantizer.encode(row, &mut codes).unwrap();
            let decoded = quantizer.decode(&codes);
            for d in 0..dim {
                assert!(
                    (decoded[d] - row[d]).abs() <= diff[d] / 255.0 + 1e-6,
                    "dim {d}: {} vs {} (diff {})",
                    decoded[d],
                    row[d],
                    diff[d]
                );
                assert!(row[d] >= lower[d]);
            }
        }
    }

    #[test]
    fn test_sq4_packs_two_per_byte() {
        let dim = 5;
        let data = rows(20, dim, 4);
        let quantizer =
            Quantizer::fit(Encoding::Sq4, dim, data.iter().map(|r| r.as_slice())).unwrap();
        assert_eq!(quantizer.code_size(), 3);

        let mut codes = Vec::new();
        quantizer.encode(&data[0], &mut codes).unwrap();
        assert_eq!(codes.len(), 3);

        let decoded = quantizer.decode(&codes);
        assert_eq!(decoded.len(), dim);
    }

    #[test]
    fn test_bf16_encode_decode() {
        let quantizer = Quantizer::fit(Encoding::Bf16, 4, std::iter::empty()).unwrap();
        let v = [1.0f32, -2.5, 0.125, 100.0];
        let mut codes = Vec::new();
        quantizer.encode(&v, &mut codes).unwrap();
        assert_eq!(codes.len(), 8);

        let decoded = quantizer.decode(&codes);
        for d in 0..4 {
            assert!((decoded[d] - v[d]).abs() <= v[d].abs() / 256.0 + 1e-9);
        }
    }

    #[test]
    fn test_uniform_bias_roundtrip() {
        let dim = 16;
        let data = rows(50, dim, 5);
        let quantizer =
            Quantizer::fit(Encoding::Sq8Uniform, dim, data.iter().map(|r| r.as_slice())).unwrap();
        let scale = quantizer.uniform_scale().unwrap();

        let mut codes = Vec::new();
        quantizer.encode(&data[0], &mut codes).unwrap();
        let decoded = quantizer.decode(&codes);
        for d in 0..dim {
            assert!((decoded[d] - data[0][d]).abs() <= scale / 2.0 + 1e-6);
        }

        // Code sum matches a direct recount.
        let expected: u32 = codes.iter().map(|&c| c as u32).sum();
        assert_eq!(quantizer.code_sum(&codes), expected as f32);
    }

    #[test]
    fn test_params_roundtrip() {
        let dim = 8;
        let data = rows(30, dim, 6);
        for encoding in [
            Encoding::Fp32,
            Encoding::Bf16,
            Encoding::Sq8,
            Encoding::Sq4,
            Encoding::Sq8Uniform,
            Encoding::Sq4Uniform,
        ] {
            let quantizer =
                Quantizer::fit(encoding, dim, data.iter().map(|r| r.as_slice())).unwrap();
            let mut params = Vec::new();
            quantizer.write_params(&mut params).unwrap();

            let restored =
                Quantizer::read_params(encoding, dim, &mut params.as_slice()).unwrap();
            let mut a = Vec::new();
            let mut b = Vec::new();
            quantizer.encode(&data[0], &mut a).unwrap();
            restored.encode(&data[0], &mut b).unwrap();
            assert_eq!(a, b, "encoding {encoding:?} params did not round-trip");
        }
    }

    #[test]
    fn test_fit_rejects_dimension_mismatch() {
        let data = rows(5, 8, 7);
        let result = Quantizer::fit(Encoding::Sq8, 16, data.iter().map(|r| r.as_slice()));
        assert!(result.is_err());
    }

    #[test]
    fn test_constant_dimension_encodes_to_zero() {
        let data = vec![vec![0.5f32; 4]; 10];
        let quantizer =
            Quantizer::fit(Encoding::Sq8, 4, data.iter().map(|r| r.as_slice())).unwrap();
        let mut codes = Vec::new();
        quantizer.encode(&data[0], &mut codes).unwrap();
        // Zero range: every code collapses to 0 and decodes to lower.
        assert_eq!(codes, vec![0u8; 4]);
        assert_eq!(quantizer.decode(&codes), vec![0.5f32; 4]);
    }
}
