//! Unit normalization and grid orientation corrections.
//!
//! Both operations mutate a freshly decoded grid exactly once, right
//! after decoding and before the raw file is written. Neither is
//! idempotent: applying a second time is a correctness bug, so nothing
//! downstream of the raw files ever calls into this module.

/// Apply `value * scale + offset` to every cell.
pub fn multiply_add(data: &mut [f32], scale: f32, offset: f32) {
    for v in data.iter_mut() {
        *v = *v * scale + offset;
    }
}

/// Rotate each grid row by half its width, turning a 0..360 longitude
/// layout into -180..180.
pub fn shift_longitude_180(data: &mut [f32], nx: usize) {
    debug_assert_eq!(data.len() % nx, 0);
    for row in data.chunks_exact_mut(nx) {
        row.rotate_left(nx / 2);
    }
}
