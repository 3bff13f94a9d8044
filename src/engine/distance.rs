//! Distance kernels with manual unrolling so the compiler auto-vectorizes.

use crate::engine::MetricType;

/// Inner product.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let len = a.len().min(b.len());
    let mut sum = [0.0f32; 4];
    let mut i = 0;

    while i + 4 <= len {
        sum[0] += a[i] * b[i];
        sum[1] += a[i + 1] * b[i + 1];
        sum[2] += a[i + 2] * b[i + 2];
        sum[3] += a[i + 3] * b[i + 3];
        i += 4;
    }

    let mut total = sum[0] + sum[1] + sum[2] + sum[3];
    while i < len {
        total += a[i] * b[i];
        i += 1;
    }
    total
}

/// Squared euclidean distance.
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let len = a.len().min(b.len());
    let mut sum = [0.0f32; 4];
    let mut i = 0;

    while i + 4 <= len {
        let d0 = a[i] - b[i];
        let d1 = a[i + 1] - b[i + 1];
        let d2 = a[i + 2] - b[i + 2];
        let d3 = a[i + 3] - b[i + 3];
        sum[0] += d0 * d0;
        sum[1] += d1 * d1;
        sum[2] += d2 * d2;
        sum[3] += d3 * d3;
        i += 4;
    }

    let mut total = sum[0] + sum[1] + sum[2] + sum[3];
    while i < len {
        let d = a[i] - b[i];
        total += d * d;
        i += 1;
    }
    total
}

/// Distance as reported to callers: squared L2, or raw similarity for IP.
pub fn distance(metric: MetricType, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        MetricType::L2 => l2_squared(a, b),
        MetricType::InnerProduct => dot_product(a, b),
    }
}
