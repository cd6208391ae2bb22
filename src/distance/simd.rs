//! SIMD kernel implementations with width cascades.
//!
//! Supported instruction sets:
//! - **AVX-512F** (x86_64): 16 floats per iteration. Requires nightly Rust
//!   and the `avx512` cargo feature; tails fall through to the AVX2 kernel.
//! - **AVX2+FMA** (x86_64): 8 floats per iteration; scalar epilogue.
//! - **NEON** (aarch64): 4 floats per iteration; scalar epilogue.
//!
//! Every kernel here is an unsafe `target_feature` function. Installation
//! into the process-wide kernel table happens in [`super::kernels`], which
//! probes CPU features exactly once; the safe wrappers below are only ever
//! installed after the matching probe succeeded.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

#[cfg(target_arch = "aarch64")]
use std::arch::aarch64::*;

// =============================================================================
// AVX-512 kernels (x86_64, nightly + `avx512` feature)
// =============================================================================

/// Compute the FP32 inner product using AVX-512 intrinsics.
///
/// # Safety
/// The caller must ensure AVX-512F (and AVX2+FMA for the tail) is available.
#[cfg(all(target_arch = "x86_64", feature = "avx512"))]
#[target_feature(enable = "avx512f")]
#[inline]
pub unsafe fn fp32_ip_avx512(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let mut i = 0;
    let mut sum = _mm512_setzero_ps();

    while i + 16 <= len {
        let va = _mm512_loadu_ps(a.as_ptr().add(i));
        let vb = _mm512_loadu_ps(b.as_ptr().add(i));
        sum = _mm512_fmadd_ps(va, vb, sum);
        i += 16;
    }

    let total = _mm512_reduce_add_ps(sum);
    // Tail (0-15 lanes) delegates to the next-narrower kernel.
    total + fp32_ip_avx2(&a[i..], &b[i..])
}

/// Compute the FP32 squared Euclidean distance using AVX-512 intrinsics.
///
/// # Safety
/// The caller must ensure AVX-512F (and AVX2+FMA for the tail) is available.
#[cfg(all(target_arch = "x86_64", feature = "avx512"))]
#[target_feature(enable = "avx512f")]
#[inline]
pub unsafe fn fp32_l2sq_avx512(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let mut i = 0;
    let mut sum = _mm512_setzero_ps();

    while i + 16 <= len {
        let va = _mm512_loadu_ps(a.as_ptr().add(i));
        let vb = _mm512_loadu_ps(b.as_ptr().add(i));
        let diff = _mm512_sub_ps(va, vb);
        sum = _mm512_fmadd_ps(diff, diff, sum);
        i += 16;
    }

    let total = _mm512_reduce_add_ps(sum);
    total + fp32_l2sq_avx2(&a[i..], &b[i..])
}

// =============================================================================
// AVX2+FMA kernels (x86_64)
// =============================================================================

/// Horizontal sum of an AVX2 register.
#[cfg(target_arch = "x86_64")]
#[inline]
unsafe fn hsum256(v: __m256) -> f32 {
    let arr: [f32; 8] = std::mem::transmute(v);
    arr.iter().sum()
}

/// Compute the FP32 inner product using AVX2 and FMA intrinsics.
///
/// # Safety
/// The caller must ensure AVX2 and FMA CPU features are available.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
#[inline]
pub unsafe fn fp32_ip_avx2(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let mut i = 0;
    let mut sum = _mm256_setzero_ps();

    while i + 8 <= len {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        sum = _mm256_fmadd_ps(va, vb, sum);
        i += 8;
    }

    let mut total = hsum256(sum);
    while i < len {
        total += a[i] * b[i];
        i += 1;
    }
    total
}

/// Compute the FP32 squared Euclidean distance using AVX2 and FMA intrinsics.
///
/// # Safety
/// The caller must ensure AVX2 and FMA CPU features are available.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
#[inline]
pub unsafe fn fp32_l2sq_avx2(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let mut i = 0;
    let mut sum = _mm256_setzero_ps();

    while i + 8 <= len {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        let diff = _mm256_sub_ps(va, vb);
        sum = _mm256_fmadd_ps(diff, diff, sum);
        i += 8;
    }

    let mut total = hsum256(sum);
    while i < len {
        let diff = a[i] - b[i];
        total += diff * diff;
        i += 1;
    }
    total
}

/// Decode 8 SQ8 codes starting at `i` and widen to an AVX2 float register.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
#[inline]
unsafe fn sq8_decode8_avx2(codes: *const u8, lower: *const f32, diff: *const f32) -> __m256 {
    let raw = _mm_loadl_epi64(codes as *const __m128i);
    let widened = _mm256_cvtepi32_ps(_mm256_cvtepu8_epi32(raw));
    let scaled = _mm256_mul_ps(widened, _mm256_set1_ps(1.0 / 255.0));
    _mm256_fmadd_ps(scaled, _mm256_loadu_ps(diff), _mm256_loadu_ps(lower))
}

/// Inner product between a raw query and SQ8 codes using AVX2.
///
/// # Safety
/// The caller must ensure AVX2 and FMA CPU features are available.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
#[inline]
pub unsafe fn sq8_ip_avx2(query: &[f32], codes: &[u8], lower: &[f32], diff: &[f32]) -> f32 {
    let len = query.len();
    let mut i = 0;
    let mut sum = _mm256_setzero_ps();

    while i + 8 <= len {
        let decoded = sq8_decode8_avx2(
            codes.as_ptr().add(i),
            lower.as_ptr().add(i),
            diff.as_ptr().add(i),
        );
        let q = _mm256_loadu_ps(query.as_ptr().add(i));
        sum = _mm256_fmadd_ps(q, decoded, sum);
        i += 8;
    }

    let mut total = hsum256(sum);
    while i < len {
        total += query[i] * (codes[i] as f32 / 255.0 * diff[i] + lower[i]);
        i += 1;
    }
    total
}

/// Squared Euclidean distance between a raw query and SQ8 codes using AVX2.
///
/// # Safety
/// The caller must ensure AVX2 and FMA CPU features are available.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
#[inline]
pub unsafe fn sq8_l2sq_avx2(query: &[f32], codes: &[u8], lower: &[f32], diff: &[f32]) -> f32 {
    let len = query.len();
    let mut i = 0;
    let mut sum = _mm256_setzero_ps();

    while i + 8 <= len {
        let decoded = sq8_decode8_avx2(
            codes.as_ptr().add(i),
            lower.as_ptr().add(i),
            diff.as_ptr().add(i),
        );
        let q = _mm256_loadu_ps(query.as_ptr().add(i));
        let delta = _mm256_sub_ps(q, decoded);
        sum = _mm256_fmadd_ps(delta, delta, sum);
        i += 8;
    }

    let mut total = hsum256(sum);
    while i < len {
        let val = query[i] - (codes[i] as f32 / 255.0 * diff[i] + lower[i]);
        total += val * val;
        i += 1;
    }
    total
}

/// Raw integer inner product of SQ8-uniform codes using AVX2 integer lanes.
///
/// # Safety
/// The caller must ensure the AVX2 CPU feature is available.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[inline]
pub unsafe fn sq8_uniform_ip_avx2(codes1: &[u8], codes2: &[u8]) -> f32 {
    let len = codes1.len();
    let mut i = 0;
    let mut sum = _mm256_setzero_si256();

    // Widen u8 -> i16 and use the 16-bit multiply-add into i32 lanes.
    while i + 16 <= len {
        let v1 = _mm256_cvtepu8_epi16(_mm_loadu_si128(codes1.as_ptr().add(i) as *const __m128i));
        let v2 = _mm256_cvtepu8_epi16(_mm_loadu_si128(codes2.as_ptr().add(i) as *const __m128i));
        sum = _mm256_add_epi32(sum, _mm256_madd_epi16(v1, v2));
        i += 16;
    }

    let lanes: [i32; 8] = std::mem::transmute(sum);
    let mut total: i32 = lanes.iter().sum();
    while i < len {
        total += codes1[i] as i32 * codes2[i] as i32;
        i += 1;
    }
    total as f32
}

// =============================================================================
// NEON kernels (aarch64)
// =============================================================================
// NEON is always available on aarch64, so no runtime probe is required.

/// Compute the FP32 inner product using NEON intrinsics.
#[cfg(target_arch = "aarch64")]
#[inline]
pub fn fp32_ip_neon(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let mut i = 0;
    let mut sum = unsafe { vdupq_n_f32(0.0) };

    while i + 4 <= len {
        unsafe {
            let va = vld1q_f32(a.as_ptr().add(i));
            let vb = vld1q_f32(b.as_ptr().add(i));
            sum = vfmaq_f32(sum, va, vb);
        }
        i += 4;
    }

    let mut total = unsafe { vaddvq_f32(sum) };
    while i < len {
        total += a[i] * b[i];
        i += 1;
    }
    total
}

/// Compute the FP32 squared Euclidean distance using NEON intrinsics.
#[cfg(target_arch = "aarch64")]
#[inline]
pub fn fp32_l2sq_neon(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let mut i = 0;
    let mut sum = unsafe { vdupq_n_f32(0.0) };

    while i + 4 <= len {
        unsafe {
            let va = vld1q_f32(a.as_ptr().add(i));
            let vb = vld1q_f32(b.as_ptr().add(i));
            let diff = vsubq_f32(va, vb);
            sum = vfmaq_f32(sum, diff, diff);
        }
        i += 4;
    }

    let mut total = unsafe { vaddvq_f32(sum) };
    while i < len {
        let diff = a[i] - b[i];
        total += diff * diff;
        i += 1;
    }
    total
}

// =============================================================================
// Safe wrappers for table installation
// =============================================================================
// Each wrapper is only ever installed into the kernel table after the
// matching feature probe succeeded, so the unsafe call inside is sound.

#[cfg(all(target_arch = "x86_64", feature = "avx512"))]
pub(super) fn fp32_ip_avx512_entry(a: &[f32], b: &[f32]) -> f32 {
    unsafe { fp32_ip_avx512(a, b) }
}

#[cfg(all(target_arch = "x86_64", feature = "avx512"))]
pub(super) fn fp32_l2sq_avx512_entry(a: &[f32], b: &[f32]) -> f32 {
    unsafe { fp32_l2sq_avx512(a, b) }
}

#[cfg(target_arch = "x86_64")]
pub(super) fn fp32_ip_avx2_entry(a: &[f32], b: &[f32]) -> f32 {
    unsafe { fp32_ip_avx2(a, b) }
}

#[cfg(target_arch = "x86_64")]
pub(super) fn fp32_l2sq_avx2_entry(a: &[f32], b: &[f32]) -> f32 {
    unsafe { fp32_l2sq_avx2(a, b) }
}

#[cfg(target_arch = "x86_64")]
pub(super) fn sq8_ip_avx2_entry(query: &[f32], codes: &[u8], lower: &[f32], diff: &[f32]) -> f32 {
    unsafe { sq8_ip_avx2(query, codes, lower, diff) }
}

#[cfg(target_arch = "x86_64")]
pub(super) fn sq8_l2sq_avx2_entry(query: &[f32], codes: &[u8], lower: &[f32], diff: &[f32]) -> f32 {
    unsafe { sq8_l2sq_avx2(query, codes, lower, diff) }
}

#[cfg(target_arch = "x86_64")]
pub(super) fn sq8_uniform_ip_avx2_entry(codes1: &[u8], codes2: &[u8]) -> f32 {
    unsafe { sq8_uniform_ip_avx2(codes1, codes2) }
}
