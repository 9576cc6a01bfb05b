//! Pure element-wise kernels invoked by executors through custom map operations.
//!
//! Every kernel is stateless, reads only its inputs and writes every element of its output, so
//! it is safe to run on any partition of the data.

/// `dst[i] = exp(src[i])`
pub fn exp(src: &[f32], dst: &mut [f32]) {
    debug_assert_eq!(src.len(), dst.len());
    for (out, &x) in dst.iter_mut().zip(src) {
        *out = x.exp();
    }
}

/// `dst[i] = 1 - src[i]`
pub fn one_minus(src: &[f32], dst: &mut [f32]) {
    debug_assert_eq!(src.len(), dst.len());
    for (out, &x) in dst.iter_mut().zip(src) {
        *out = 1.0 - x;
    }
}

/// Logistic function. Saturates to exactly 0 or 1 for large magnitudes, never NaN for finite input.
pub fn sigmoid(src: &[f32], dst: &mut [f32]) {
    debug_assert_eq!(src.len(), dst.len());
    for (out, &x) in dst.iter_mut().zip(src) {
        *out = 1.0 / (1.0 + (-x).exp());
    }
}

/// `dst[i] = max(lhs[i], rhs[i])`
pub fn max(lhs: &[f32], rhs: &[f32], dst: &mut [f32]) {
    debug_assert_eq!(lhs.len(), dst.len());
    debug_assert_eq!(rhs.len(), dst.len());
    for ((out, &a), &b) in dst.iter_mut().zip(lhs).zip(rhs) {
        *out = a.max(b);
    }
}
