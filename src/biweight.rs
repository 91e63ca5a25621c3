//! # Biweight robust statistics
//!
//! Outlier-resistant estimators used throughout the reduction:
//!
//! * [`biweight_location`] – iteratively reweighted Tukey biweight estimate of the
//!   central location of a sample (overscan level, trace shifts, filters).
//! * [`biweight_scale`] – biweight midvariance based estimate of the spread (cosmic-ray
//!   threshold noise).
//! * [`biweight_filter`] – running biweight location over a window, with an excluded
//!   central zone, used to smooth spectra, master curves and throughput ratios.
//!
//! Non-finite samples are ignored by every estimator.
use std::cmp::Ordering;

use crate::constants::{BIWEIGHT_C, BIWEIGHT_IGNORE_CENTRAL, BIWEIGHT_MAX_ITER};

fn cmp_f64(a: &f64, b: &f64) -> Ordering {
    a.partial_cmp(b).unwrap_or(Ordering::Equal)
}

/// Median of a scratch buffer (reordered in place).
///
/// Return
/// ----------
/// * `None` for an empty buffer.
pub fn median_in_place(values: &mut [f64]) -> Option<f64> {
    let n = values.len();
    if n == 0 {
        return None;
    }
    let mid = n / 2;
    let (lower, upper, _) = values.select_nth_unstable_by(mid, cmp_f64);
    let upper = *upper;
    if n % 2 == 1 {
        Some(upper)
    } else {
        let lower_max = lower.iter().copied().max_by(cmp_f64).unwrap_or(upper);
        Some(0.5 * (lower_max + upper))
    }
}

/// Median of the finite values of a slice.
pub fn median(data: &[f64]) -> Option<f64> {
    let mut buf: Vec<f64> = data.iter().copied().filter(|v| v.is_finite()).collect();
    median_in_place(&mut buf)
}

/// Biweight location of the finite values of `data`.
///
/// The estimate starts from the median and is refined by reweighting each sample with
/// `(1 - u²)²`, `u = (x - M) / (c · MAD)`, until the location stops moving.
///
/// Return
/// ----------
/// * `None` if `data` holds no finite value.
pub fn biweight_location(data: &[f64]) -> Option<f64> {
    let finite: Vec<f64> = data.iter().copied().filter(|v| v.is_finite()).collect();
    biweight_location_finite(&finite, &mut Vec::with_capacity(finite.len()))
}

fn biweight_location_finite(finite: &[f64], scratch: &mut Vec<f64>) -> Option<f64> {
    scratch.clear();
    scratch.extend_from_slice(finite);
    let mut location = median_in_place(scratch)?;

    for _ in 0..BIWEIGHT_MAX_ITER {
        scratch.clear();
        scratch.extend(finite.iter().map(|x| (x - location).abs()));
        let mad = median_in_place(scratch).unwrap_or(0.0);
        if mad == 0.0 {
            return Some(location);
        }

        let (num, den) = finite.iter().fold((0.0, 0.0), |(num, den), &x| {
            let d = x - location;
            let u = d / (BIWEIGHT_C * mad);
            if u.abs() < 1.0 {
                let w = (1.0 - u * u).powi(2);
                (num + d * w, den + w)
            } else {
                (num, den)
            }
        });
        if den == 0.0 {
            break;
        }

        let next = location + num / den;
        let converged = (next - location).abs() <= 1e-10 * location.abs().max(1.0);
        location = next;
        if converged {
            break;
        }
    }
    Some(location)
}

/// Biweight scale (square root of the biweight midvariance) of the finite values of `data`.
///
/// Return
/// ----------
/// * `None` if fewer than two finite values are available.
pub fn biweight_scale(data: &[f64]) -> Option<f64> {
    let finite: Vec<f64> = data.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() < 2 {
        return None;
    }
    let location = median(&finite)?;
    let mad = median(&finite.iter().map(|x| (x - location).abs()).collect::<Vec<_>>())?;
    if mad == 0.0 {
        return Some(0.0);
    }
    let c = 9.0;
    let (num, den) = finite.iter().fold((0.0, 0.0), |(num, den), &x| {
        let d = x - location;
        let u = d / (c * mad);
        if u.abs() < 1.0 {
            let u2 = u * u;
            (
                num + d * d * (1.0 - u2).powi(4),
                den + (1.0 - u2) * (1.0 - 5.0 * u2),
            )
        } else {
            (num, den)
        }
    });
    if den == 0.0 {
        return Some(0.0);
    }
    Some((finite.len() as f64).sqrt() * num.sqrt() / den.abs())
}

/// Running biweight location of `a` with the default central exclusion.
///
/// See also
/// ------------
/// * [`biweight_filter_ignoring`] – Same filter with a custom central exclusion.
pub fn biweight_filter(a: &[f64], order: usize) -> Vec<f64> {
    biweight_filter_ignoring(a, order, BIWEIGHT_IGNORE_CENTRAL)
}

/// Running biweight location of `a` over a window of `order` samples, skipping the
/// `ignore_central` samples centred on the output position.
///
/// Both widths are rounded up to the next odd number. Windows are truncated at the
/// array edges. When the exclusion leaves no finite sample, the full window is used,
/// and when that is empty too the input value is passed through.
///
/// Arguments
/// -----------------
/// * `a`: Input sequence (e.g. a spectrum or a wavelength-ordered master array).
/// * `order`: Window width in samples.
/// * `ignore_central`: Width of the excluded central zone in samples.
///
/// Return
/// ----------
/// * The filtered sequence, same length as `a`.
pub fn biweight_filter_ignoring(a: &[f64], order: usize, ignore_central: usize) -> Vec<f64> {
    let order = if order % 2 == 0 { order + 1 } else { order };
    let ignore = if ignore_central % 2 == 0 {
        ignore_central + 1
    } else {
        ignore_central
    };
    let half = order / 2;
    let half_ignore = ignore / 2;
    let n = a.len();

    let mut window = Vec::with_capacity(order);
    let mut scratch = Vec::with_capacity(order);
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(n);

            window.clear();
            window.extend(
                (lo..hi)
                    .filter(|&j| j.abs_diff(i) > half_ignore)
                    .map(|j| a[j])
                    .filter(|v| v.is_finite()),
            );
            if window.is_empty() {
                window.extend(a[lo..hi].iter().copied().filter(|v| v.is_finite()));
            }
            biweight_location_finite(&window, &mut scratch).unwrap_or(a[i])
        })
        .collect()
}
