//! SIMD-accelerated distance kernels with safe runtime dispatch.
//!
//! Design goals:
//! - Always safe to run: never executes unsupported instructions (no SIGILL).
//! - One binary works across a wide range of CPUs: AVX2(+FMA) on x86_64,
//!   NEON on aarch64, scalar everywhere else.
//! - Vectors shorter than one 8-lane chunk always take the scalar path.
//!
//! Semantics: cosine of a zero (or degenerate) vector is 0. NaN and ±inf
//! inputs propagate through every kernel; the HNSW layer orders NaN as worse
//! than any finite distance.

use serde::{Deserialize, Serialize};

/// Minimum length before the widened path is worth dispatching.
const SIMD_MIN_LEN: usize = 8;

/// Distance family served by the vector indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceKind {
    /// 1 - cosine similarity (lower = closer).
    Cosine,
    /// Euclidean distance.
    L2,
    /// Negated dot product (lower = closer).
    Dot,
}

impl DistanceKind {
    /// Ordering-compatible distance: lower is always closer.
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceKind::Cosine => 1.0 - cosine_similarity(a, b),
            DistanceKind::L2 => l2_distance(a, b),
            DistanceKind::Dot => -dot_product(a, b),
        }
    }

    /// Similarity presented to callers: cosine in [-1, 1], negated L2, raw dot.
    #[inline]
    pub fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceKind::Cosine => cosine_similarity(a, b),
            DistanceKind::L2 => -l2_distance(a, b),
            DistanceKind::Dot => dot_product(a, b),
        }
    }
}

/// Returns the dot product of `a` and `b`.
///
/// # Panics
/// Panics if `a.len() != b.len()`.
#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "vector length mismatch: {} vs {}", a.len(), b.len());
    if a.len() < SIMD_MIN_LEN {
        return dot_scalar(a, b);
    }

    #[cfg(target_arch = "x86_64")]
    unsafe {
        if std::is_x86_feature_detected!("avx2") && std::is_x86_feature_detected!("fma") {
            return dot_avx2(a, b);
        }
    }

    #[cfg(target_arch = "aarch64")]
    unsafe {
        if std::arch::is_aarch64_feature_detected!("neon") {
            return dot_neon(a, b);
        }
    }

    dot_scalar(a, b)
}

/// Returns the Euclidean (L2) distance between `a` and `b`.
///
/// # Panics
/// Panics if `a.len() != b.len()`.
#[inline]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "vector length mismatch: {} vs {}", a.len(), b.len());
    if a.len() < SIMD_MIN_LEN {
        return l2_scalar(a, b);
    }

    #[cfg(target_arch = "x86_64")]
    unsafe {
        if std::is_x86_feature_detected!("avx2") && std::is_x86_feature_detected!("fma") {
            return l2_avx2(a, b);
        }
    }

    #[cfg(target_arch = "aarch64")]
    unsafe {
        if std::arch::is_aarch64_feature_detected!("neon") {
            return l2_neon(a, b);
        }
    }

    l2_scalar(a, b)
}

/// Returns the L2 norm of `v`.
#[inline]
pub fn l2_norm(v: &[f32]) -> f32 {
    if v.len() < SIMD_MIN_LEN {
        return sum_squares_scalar(v).sqrt();
    }

    #[cfg(target_arch = "x86_64")]
    unsafe {
        if std::is_x86_feature_detected!("avx2") && std::is_x86_feature_detected!("fma") {
            return sum_squares_avx2(v).sqrt();
        }
    }

    #[cfg(target_arch = "aarch64")]
    unsafe {
        if std::arch::is_aarch64_feature_detected!("neon") {
            return sum_squares_neon(v).sqrt();
        }
    }

    sum_squares_scalar(v).sqrt()
}

/// Cosine similarity of `a` and `b`; 0 when either vector has zero norm.
///
/// # Panics
/// Panics if `a.len() != b.len()`.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "vector length mismatch: {} vs {}", a.len(), b.len());
    if a.is_empty() {
        return 0.0;
    }

    let (dot, norm_a_sq, norm_b_sq) = dot_and_norms(a, b);
    if norm_a_sq == 0.0 || norm_b_sq == 0.0 {
        return 0.0;
    }
    dot / (norm_a_sq.sqrt() * norm_b_sq.sqrt())
}

/// Dot product plus both squared norms in one pass.
#[inline]
fn dot_and_norms(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
    if a.len() >= SIMD_MIN_LEN {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            if std::is_x86_feature_detected!("avx2") && std::is_x86_feature_detected!("fma") {
                return dot_and_norms_avx2(a, b);
            }
        }

        #[cfg(target_arch = "aarch64")]
        unsafe {
            if std::arch::is_aarch64_feature_detected!("neon") {
                return dot_and_norms_neon(a, b);
            }
        }
    }

    let mut dot = 0.0;
    let mut na = 0.0;
    let mut nb = 0.0;
    for i in 0..a.len() {
        dot += a[i] * b[i];
        na += a[i] * a[i];
        nb += b[i] * b[i];
    }
    (dot, na, nb)
}

// ===== scalar baselines =====

#[inline]
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0;
    for i in 0..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

#[inline]
fn sum_squares_scalar(v: &[f32]) -> f32 {
    let mut sum = 0.0;
    for &x in v {
        sum += x * x;
    }
    sum
}

#[inline]
fn l2_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0;
    for i in 0..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum.sqrt()
}

// ===== x86_64 AVX2 kernels =====

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

#[cfg(target_arch = "x86_64")]
#[inline]
unsafe fn hsum256(v: __m256) -> f32 {
    let mut tmp = [0.0f32; 8];
    _mm256_storeu_ps(tmp.as_mut_ptr(), v);
    tmp.iter().sum()
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[target_feature(enable = "fma")]
unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let mut acc = _mm256_setzero_ps();
    let chunks = len / 8;
    for i in 0..chunks {
        let off = i * 8;
        let va = _mm256_loadu_ps(a.as_ptr().add(off));
        let vb = _mm256_loadu_ps(b.as_ptr().add(off));
        acc = _mm256_fmadd_ps(va, vb, acc);
    }
    let mut sum = hsum256(acc);
    for i in (chunks * 8)..len {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[target_feature(enable = "fma")]
unsafe fn sum_squares_avx2(v: &[f32]) -> f32 {
    let len = v.len();
    let mut acc = _mm256_setzero_ps();
    let chunks = len / 8;
    for i in 0..chunks {
        let x = _mm256_loadu_ps(v.as_ptr().add(i * 8));
        acc = _mm256_fmadd_ps(x, x, acc);
    }
    let mut sum = hsum256(acc);
    for &x in v.iter().skip(chunks * 8) {
        sum += x * x;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[target_feature(enable = "fma")]
unsafe fn l2_avx2(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let mut acc = _mm256_setzero_ps();
    let chunks = len / 8;
    for i in 0..chunks {
        let off = i * 8;
        let va = _mm256_loadu_ps(a.as_ptr().add(off));
        let vb = _mm256_loadu_ps(b.as_ptr().add(off));
        let d = _mm256_sub_ps(va, vb);
        acc = _mm256_fmadd_ps(d, d, acc);
    }
    let mut sum = hsum256(acc);
    for i in (chunks * 8)..len {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum.sqrt()
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[target_feature(enable = "fma")]
unsafe fn dot_and_norms_avx2(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
    let len = a.len();
    let mut dot = _mm256_setzero_ps();
    let mut na = _mm256_setzero_ps();
    let mut nb = _mm256_setzero_ps();
    let chunks = len / 8;
    for i in 0..chunks {
        let off = i * 8;
        let va = _mm256_loadu_ps(a.as_ptr().add(off));
        let vb = _mm256_loadu_ps(b.as_ptr().add(off));
        dot = _mm256_fmadd_ps(va, vb, dot);
        na = _mm256_fmadd_ps(va, va, na);
        nb = _mm256_fmadd_ps(vb, vb, nb);
    }
    let mut dot_sum = hsum256(dot);
    let mut na_sum = hsum256(na);
    let mut nb_sum = hsum256(nb);
    for i in (chunks * 8)..len {
        dot_sum += a[i] * b[i];
        na_sum += a[i] * a[i];
        nb_sum += b[i] * b[i];
    }
    (dot_sum, na_sum, nb_sum)
}

// ===== aarch64 NEON kernels =====

#[cfg(target_arch = "aarch64")]
use std::arch::aarch64::*;

#[cfg(target_arch = "aarch64")]
#[inline]
unsafe fn hadd_f32x4(v: float32x4_t) -> f32 {
    let sum2 = vadd_f32(vget_low_f32(v), vget_high_f32(v));
    let sum1 = vpadd_f32(sum2, sum2);
    vget_lane_f32(sum1, 0)
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn dot_neon(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let mut acc: float32x4_t = vdupq_n_f32(0.0);
    let chunks = len / 4;
    for i in 0..chunks {
        let off = i * 4;
        let va = vld1q_f32(a.as_ptr().add(off));
        let vb = vld1q_f32(b.as_ptr().add(off));
        acc = vmlaq_f32(acc, va, vb);
    }
    let mut sum = hadd_f32x4(acc);
    for i in (chunks * 4)..len {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn sum_squares_neon(v: &[f32]) -> f32 {
    let mut acc: float32x4_t = vdupq_n_f32(0.0);
    let chunks = v.len() / 4;
    for i in 0..chunks {
        let x = vld1q_f32(v.as_ptr().add(i * 4));
        acc = vmlaq_f32(acc, x, x);
    }
    let mut sum = hadd_f32x4(acc);
    for &x in v.iter().skip(chunks * 4) {
        sum += x * x;
    }
    sum
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn l2_neon(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let mut acc: float32x4_t = vdupq_n_f32(0.0);
    let chunks = len / 4;
    for i in 0..chunks {
        let off = i * 4;
        let va = vld1q_f32(a.as_ptr().add(off));
        let vb = vld1q_f32(b.as_ptr().add(off));
        let d = vsubq_f32(va, vb);
        acc = vmlaq_f32(acc, d, d);
    }
    let mut sum = hadd_f32x4(acc);
    for i in (chunks * 4)..len {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum.sqrt()
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn dot_and_norms_neon(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
    let len = a.len();
    let mut dot: float32x4_t = vdupq_n_f32(0.0);
    let mut na: float32x4_t = vdupq_n_f32(0.0);
    let mut nb: float32x4_t = vdupq_n_f32(0.0);
    let chunks = len / 4;
    for i in 0..chunks {
        let off = i * 4;
        let va = vld1q_f32(a.as_ptr().add(off));
        let vb = vld1q_f32(b.as_ptr().add(off));
        dot = vmlaq_f32(dot, va, vb);
        na = vmlaq_f32(na, va, va);
        nb = vmlaq_f32(nb, vb, vb);
    }
    let mut dot_sum = hadd_f32x4(dot);
    let mut na_sum = hadd_f32x4(na);
    let mut nb_sum = hadd_f32x4(nb);
    for i in (chunks * 4)..len {
        dot_sum += a[i] * b[i];
        na_sum += a[i] * a[i];
        nb_sum += b[i] * b[i];
    }
    (dot_sum, na_sum, nb_sum)
}
