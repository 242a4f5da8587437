/// Scale an embedding to unit L2 length in place. Zero vectors are left untouched.
pub(crate) fn l2_normalize_in_place(v: &mut [f32]) {
    let norm = v.iter().map(|x| f64::from(*x) * f64::from(*x)).sum::<f64>().sqrt();
    if norm > 0.0 {
        let inv = (1.0 / norm) as f32;
        v.iter_mut().for_each(|x| *x *= inv);
    }
}

/// Per-channel `(x - mean) / std` over a CHW buffer.
pub(crate) fn standardize_chw(pixels: &mut [f32], plane: usize, mean: &[f32; 3], std: &[f32; 3]) {
    for (channel, chunk) in pixels.chunks_mut(plane).enumerate().take(3) {
        let (m, s) = (mean[channel], std[channel]);
        chunk.iter_mut().for_each(|p| *p = (*p - m) / s);
    }
}
