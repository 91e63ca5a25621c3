//! Per-column fiber centroid detection.
//!
//! Each column is replaced by the mean of the columns within
//! [`CENTROID_COLUMN_HALF_WIDTH`] of it, local maxima above `mx_cut` times the column
//! maximum are kept, and every peak is refined to the vertex of the parabola through
//! the peak and its two neighbours.
use nalgebra::DMatrix;

use crate::constants::CENTROID_COLUMN_HALF_WIDTH;

/// Sub-pixel vertex of the parabola through `(-1, a)`, `(0, b)`, `(1, c)`.
#[inline]
fn parabolic_offset(a: f64, b: f64, c: f64) -> f64 {
    let den = a - 2.0 * b + c;
    if den == 0.0 {
        0.0
    } else {
        (0.5 * (a - c) / den).clamp(-0.5, 0.5)
    }
}

/// Centroids found in one averaged column profile.
pub fn profile_centroids(profile: &[f64], mx_cut: f64) -> Vec<f64> {
    let n = profile.len();
    if n < 3 {
        return Vec::new();
    }
    let mx = profile
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if mx <= 0.0 {
        return Vec::new();
    }
    let cut = mx_cut * mx;

    (1..n - 1)
        .filter(|&r| {
            let (a, b, c) = (profile[r - 1], profile[r], profile[r + 1]);
            b > cut && b > a && b >= c
        })
        .map(|r| r as f64 + parabolic_offset(profile[r - 1], profile[r], profile[r + 1]))
        .collect()
}

/// Detect fiber centroids in every column of `image`.
///
/// Arguments
/// -----------------
/// * `image`: Calibrated image (rows × columns).
/// * `mx_cut`: Detection threshold as a fraction of the column maximum.
///
/// Return
/// ----------
/// * One ascending list of row centroids per column.
pub fn find_centroids(image: &DMatrix<f64>, mx_cut: f64) -> Vec<Vec<f64>> {
    let (n, d) = image.shape();
    let mut profile = vec![0.0; n];
    (0..d)
        .map(|c| {
            let lo = c.saturating_sub(CENTROID_COLUMN_HALF_WIDTH);
            let hi = (c + CENTROID_COLUMN_HALF_WIDTH + 1).min(d);
            let width = (hi - lo) as f64;
            for (r, p) in profile.iter_mut().enumerate() {
                *p = (lo..hi).map(|k| image[(r, k)]).sum::<f64>() / width;
            }
            profile_centroids(&profile, mx_cut)
        })
        .collect()
}

#[cfg(test)]
mod centroids_test {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_symmetric_peak() {
        let profile = [0.0, 1.0, 4.0, 1.0, 0.0, 0.0, 2.0, 6.0, 6.0, 2.0, 0.0];
        let c = profile_centroids(&profile, 0.1);
        assert_eq!(c.len(), 2);
        assert_abs_diff_eq!(c[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(c[1], 7.5, epsilon = 1e-12);
    }

    #[test]
    fn test_threshold_and_empty() {
        let profile = [0.0, 10.0, 0.0, 0.5, 0.0];
        assert_eq!(profile_centroids(&profile, 0.1), vec![1.0]);
        assert!(profile_centroids(&[0.0; 8], 0.1).is_empty());
    }

    #[test]
    fn test_columns() {
        let image = DMatrix::from_fn(20, 6, |r, _| {
            let dy = r as f64 - 9.3;
            (-0.5 * dy * dy / 1.5f64.powi(2)).exp()
        });
        let centroids = find_centroids(&image, 0.1);
        assert_eq!(centroids.len(), 6);
        for col in centroids {
            assert_eq!(col.len(), 1);
            assert_abs_diff_eq!(col[0], 9.3, epsilon = 0.1);
        }
    }
}
