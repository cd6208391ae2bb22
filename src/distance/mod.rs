//! Distance computation: scalar references, SIMD kernels, and the
//! process-wide dispatcher.
//!
//! CPU features are probed exactly once, on first use, and the most capable
//! compiled implementation is installed behind a plain function pointer per
//! (encoding, metric) slot. Readers never synchronize after initialization;
//! callers grab the concrete pointer once per search, not per distance call.
//!
//! Fallback order on x86_64 is avx512 -> avx2 -> scalar (the `avx512` cargo
//! feature requires nightly Rust); aarch64 uses NEON unconditionally.

pub mod scalar;
pub mod simd;

use std::sync::OnceLock;

/// Function pointers for every kernel slot, resolved once per process.
///
/// Slots without a SIMD specialization hold the scalar reference.
#[derive(Clone, Copy)]
pub struct KernelTable {
    /// FP32 inner product.
    pub fp32_ip: fn(&[f32], &[f32]) -> f32,
    /// FP32 squared L2.
    pub fp32_l2sq: fn(&[f32], &[f32]) -> f32,
    /// BF16 inner product.
    pub bf16_ip: fn(&[u16], &[u16]) -> f32,
    /// BF16 squared L2.
    pub bf16_l2sq: fn(&[u16], &[u16]) -> f32,
    /// SQ8 query-to-code inner product.
    pub sq8_ip: fn(&[f32], &[u8], &[f32], &[f32]) -> f32,
    /// SQ8 query-to-code squared L2.
    pub sq8_l2sq: fn(&[f32], &[u8], &[f32], &[f32]) -> f32,
    /// SQ8 code-to-code inner product.
    pub sq8_codes_ip: fn(&[u8], &[u8], &[f32], &[f32]) -> f32,
    /// SQ8 code-to-code squared L2.
    pub sq8_codes_l2sq: fn(&[u8], &[u8], &[f32], &[f32]) -> f32,
    /// SQ4 query-to-code inner product.
    pub sq4_ip: fn(&[f32], &[u8], &[f32], &[f32]) -> f32,
    /// SQ4 query-to-code squared L2.
    pub sq4_l2sq: fn(&[f32], &[u8], &[f32], &[f32]) -> f32,
    /// SQ4 code-to-code inner product.
    pub sq4_codes_ip: fn(&[u8], &[u8], &[f32], &[f32], usize) -> f32,
    /// SQ4 code-to-code squared L2.
    pub sq4_codes_l2sq: fn(&[u8], &[u8], &[f32], &[f32], usize) -> f32,
    /// SQ4-uniform code-to-code integer inner product (unscaled).
    pub sq4_uniform_ip: fn(&[u8], &[u8], usize) -> f32,
    /// SQ8-uniform code-to-code integer inner product (unscaled).
    pub sq8_uniform_ip: fn(&[u8], &[u8]) -> f32,
    /// Human-readable name of the selected instruction set.
    pub isa: &'static str,
}

impl std::fmt::Debug for KernelTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelTable").field("isa", &self.isa).finish()
    }
}

fn scalar_table() -> KernelTable {
    KernelTable {
        fp32_ip: scalar::fp32_ip,
        fp32_l2sq: scalar::fp32_l2sq,
        bf16_ip: scalar::bf16_ip,
        bf16_l2sq: scalar::bf16_l2sq,
        sq8_ip: scalar::sq8_ip,
        sq8_l2sq: scalar::sq8_l2sq,
        sq8_codes_ip: scalar::sq8_codes_ip,
        sq8_codes_l2sq: scalar::sq8_codes_l2sq,
        sq4_ip: scalar::sq4_ip,
        sq4_l2sq: scalar::sq4_l2sq,
        sq4_codes_ip: scalar::sq4_codes_ip,
        sq4_codes_l2sq: scalar::sq4_codes_l2sq,
        sq4_uniform_ip: scalar::sq4_uniform_codes_ip,
        sq8_uniform_ip: scalar::sq8_uniform_codes_ip,
        isa: "scalar",
    }
}

fn detect() -> KernelTable {
    #[allow(unused_mut)]
    let mut table = scalar_table();

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            table.fp32_ip = simd::fp32_ip_avx2_entry;
            table.fp32_l2sq = simd::fp32_l2sq_avx2_entry;
            table.sq8_ip = simd::sq8_ip_avx2_entry;
            table.sq8_l2sq = simd::sq8_l2sq_avx2_entry;
            table.sq8_uniform_ip = simd::sq8_uniform_ip_avx2_entry;
            table.isa = "avx2";
        }
        #[cfg(feature = "avx512")]
        if is_x86_feature_detected!("avx512f")
            && is_x86_feature_detected!("avx2")
            && is_x86_feature_detected!("fma")
        {
            table.fp32_ip = simd::fp32_ip_avx512_entry;
            table.fp32_l2sq = simd::fp32_l2sq_avx512_entry;
            table.isa = "avx512";
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        table.fp32_ip = simd::fp32_ip_neon;
        table.fp32_l2sq = simd::fp32_l2sq_neon;
        table.isa = "neon";
    }

    table
}

static KERNELS: OnceLock<KernelTable> = OnceLock::new();

/// The process-wide kernel table, probing CPU features on first call.
#[inline]
pub fn kernels() -> &'static KernelTable {
    KERNELS.get_or_init(detect)
}
