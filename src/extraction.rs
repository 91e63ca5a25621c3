//! # Spectrum extraction
//!
//! Projects a calibrated image onto the fiber profiles to obtain one flux value per
//! fiber and column, and the inverse operation: re-projecting per-fiber spectra into a
//! synthetic image.
//!
//! ## Column model
//!
//! At column `c`, fiber `f` with trace `t_f(c)` contributes the discrete weights
//!
//! ```text
//! w_f(r) = P_f(r - t_f(c)) / Σ_{|r' - t_f(c)| <= fsize} P_f(r' - t_f(c))
//! ```
//!
//! where the normalising sum runs over the full window, including rows that fall off
//! the detector. The pixel values of the column are modelled as `Σ_f a_f · w_f(r)`, and
//! the amplitudes `a_f` solve the normal equations built over unmasked rows. Only
//! fibers whose windows overlap couple in the system.
//!
//! With this normalisation a fiber fully on the detector deposits exactly its amplitude
//! when re-projected by [`model_image`], so extraction and re-projection are inverse
//! operations.
use nalgebra::{DMatrix, DVector};

use crate::{fiber::registry::FiberRegistry, fiber::Fiber, panacea_errors::PanaceaError};

/// Normalised profile weights of one fiber at one column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnProfile {
    /// First detector row covered by `weights`.
    pub first_row: usize,
    pub weights: Vec<f64>,
}

impl ColumnProfile {
    pub fn end_row(&self) -> usize {
        self.first_row + self.weights.len()
    }

    fn overlaps(&self, other: &ColumnProfile) -> bool {
        self.first_row < other.end_row() && other.first_row < self.end_row()
    }
}

/// Build the weights of a fiber centred on `trace_y`.
///
/// Return
/// ----------
/// * `None` when the profile window has no positive weight or lies fully off the detector.
pub fn column_profile(
    trace_y: f64,
    nrows: usize,
    fsize: f64,
    profile: impl Fn(f64) -> f64,
) -> Option<ColumnProfile> {
    if !trace_y.is_finite() {
        return None;
    }
    let lo = (trace_y - fsize).ceil() as i64;
    let hi = (trace_y + fsize).floor() as i64;

    let mut total = 0.0;
    let mut kept = Vec::new();
    let mut first_row = None;
    for r in lo..=hi {
        let w = profile(r as f64 - trace_y).max(0.0);
        total += w;
        if r >= 0 && (r as usize) < nrows {
            first_row.get_or_insert(r as usize);
            kept.push(w);
        }
    }
    let first_row = first_row?;
    if total <= 0.0 {
        return None;
    }
    kept.iter_mut().for_each(|w| *w /= total);
    Some(ColumnProfile {
        first_row,
        weights: kept,
    })
}

/// Solve a symmetric positive system, by Cholesky when possible, SVD otherwise.
pub(crate) fn solve_normal_equations(
    a: DMatrix<f64>,
    b: DVector<f64>,
) -> Result<DVector<f64>, PanaceaError> {
    match a.clone().cholesky() {
        Some(chol) => Ok(chol.solve(&b)),
        None => a
            .svd(true, true)
            .solve(&b, 1e-12)
            .map_err(|e| PanaceaError::SingularSystem(e.to_string())),
    }
}

/// Amplitudes of every fiber at column `col`.
///
/// Fibers without a profile, or whose rows are all masked, get a zero amplitude.
pub fn solve_column(
    image: &DMatrix<f64>,
    mask: Option<&DMatrix<bool>>,
    col: usize,
    profiles: &[Option<ColumnProfile>],
) -> Result<Vec<f64>, PanaceaError> {
    let n = profiles.len();
    let usable = |r: usize| mask.map_or(true, |m| !m[(r, col)]) && image[(r, col)].is_finite();

    let mut a = DMatrix::<f64>::zeros(n, n);
    let mut b = DVector::<f64>::zeros(n);
    for (i, pi) in profiles.iter().enumerate() {
        let Some(pi) = pi else { continue };
        for (k, &w) in pi.weights.iter().enumerate() {
            let r = pi.first_row + k;
            if usable(r) {
                a[(i, i)] += w * w;
                b[i] += w * image[(r, col)];
            }
        }
        for (j, pj) in profiles.iter().enumerate().skip(i + 1) {
            let Some(pj) = pj else { continue };
            if !pi.overlaps(pj) {
                continue;
            }
            let start = pi.first_row.max(pj.first_row);
            let end = pi.end_row().min(pj.end_row());
            let s: f64 = (start..end)
                .filter(|&r| usable(r))
                .map(|r| pi.weights[r - pi.first_row] * pj.weights[r - pj.first_row])
                .sum();
            a[(i, j)] = s;
            a[(j, i)] = s;
        }
    }
    for i in 0..n {
        if a[(i, i)] <= 0.0 {
            a[(i, i)] = 1.0;
            b[i] = 0.0;
        }
    }

    Ok(solve_normal_equations(a, b)?.iter().copied().collect())
}

/// Extract with an arbitrary per-fiber profile.
///
/// Arguments
/// -----------------
/// * `image`: Calibrated image.
/// * `mask`: Optional bad-pixel mask (`true` = excluded).
/// * `traces`: One trace per fiber, full column length.
/// * `fsize`: Profile half-width in pixels.
/// * `cols`: Columns to extract.
/// * `profile`: `profile(fiber, column, dx)`, the unnormalised profile value at signed
///   distance `dx` from the trace.
///
/// Return
/// ----------
/// * One full-length spectrum per fiber; columns outside `cols` are zero.
pub fn extract_with<F>(
    image: &DMatrix<f64>,
    mask: Option<&DMatrix<bool>>,
    traces: &[&[f64]],
    fsize: f64,
    cols: &[usize],
    profile: F,
) -> Result<Vec<Vec<f64>>, PanaceaError>
where
    F: Fn(usize, usize, f64) -> f64,
{
    let (nrows, d) = image.shape();
    let mut spectra = vec![vec![0.0; d]; traces.len()];
    for &c in cols.iter().filter(|&&c| c < d) {
        let profiles: Vec<Option<ColumnProfile>> = traces
            .iter()
            .enumerate()
            .map(|(f, trace)| column_profile(trace[c], nrows, fsize, |dx| profile(f, c, dx)))
            .collect();
        let amps = solve_column(image, mask, c, &profiles)?;
        for (spec, a) in spectra.iter_mut().zip(amps) {
            spec[c] = a;
        }
    }
    Ok(spectra)
}

fn fiber_traces(fibers: &FiberRegistry) -> Result<Vec<&[f64]>, PanaceaError> {
    fibers.iter().map(Fiber::trace_values).collect()
}

/// Extract every fiber of `fibers` with its own fiber model.
///
/// `cols = None` extracts every column.
pub fn extract_spectra(
    image: &DMatrix<f64>,
    mask: Option<&DMatrix<bool>>,
    fibers: &FiberRegistry,
    fsize: f64,
    cols: Option<&[usize]>,
) -> Result<Vec<Vec<f64>>, PanaceaError> {
    let traces = fiber_traces(fibers)?;
    let models = fibers
        .iter()
        .map(Fiber::model)
        .collect::<Result<Vec<_>, _>>()?;
    let all: Vec<usize>;
    let cols = match cols {
        Some(c) => c,
        None => {
            all = (0..image.ncols()).collect();
            &all
        }
    };
    extract_with(image, mask, &traces, fsize, cols, |f, c, dx| {
        models[f].value(c, dx)
    })
}

/// Re-project one spectrum per fiber into image space.
///
/// Arguments
/// -----------------
/// * `shape`: `(rows, columns)` of the output image.
/// * `fibers`: Fibers with trace and fiber model.
/// * `fsize`: Profile half-width in pixels.
/// * `select`: Picks the spectrum to project (sky, continuum, extracted spectrum...).
///   Fibers for which it returns `None` contribute nothing.
pub fn model_image<'a, S>(
    shape: (usize, usize),
    fibers: &'a FiberRegistry,
    fsize: f64,
    select: S,
) -> Result<DMatrix<f64>, PanaceaError>
where
    S: Fn(&'a Fiber) -> Option<&'a [f64]>,
{
    let (nrows, d) = shape;
    let mut out = DMatrix::<f64>::zeros(nrows, d);
    for fiber in fibers {
        let Some(values) = select(fiber) else { continue };
        let trace = fiber.trace_values()?;
        let model = fiber.model()?;
        for c in 0..d.min(values.len()).min(trace.len()) {
            if let Some(p) = column_profile(trace[c], nrows, fsize, |dx| model.value(c, dx)) {
                for (k, w) in p.weights.iter().enumerate() {
                    out[(p.first_row + k, c)] += w * values[c];
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod extraction_test {
    use super::*;
    use approx::assert_relative_eq;

    fn gauss(dx: f64) -> f64 {
        (-0.5 * dx * dx / 2.25).exp()
    }

    #[test]
    fn test_profile_normalisation_off_edge() {
        let p = column_profile(1.0, 30, 4.0, gauss).unwrap();
        assert_eq!(p.first_row, 0);
        let kept: f64 = p.weights.iter().sum();
        assert!(kept < 1.0);

        let inside = column_profile(15.3, 30, 4.0, gauss).unwrap();
        assert_relative_eq!(inside.weights.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(column_profile(-20.0, 30, 4.0, gauss).is_none());
    }

    #[test]
    fn test_overlapping_fibers_recovered() {
        let nrows = 40;
        let traces = [vec![12.0, 12.2], vec![17.5, 17.7], vec![23.0, 23.2]];
        let amps = [100.0, 250.0, 40.0];
        let mut image = DMatrix::<f64>::zeros(nrows, 2);
        for c in 0..2 {
            for (t, a) in traces.iter().zip(amps) {
                let p = column_profile(t[c], nrows, 8.0, gauss).unwrap();
                for (k, w) in p.weights.iter().enumerate() {
                    image[(p.first_row + k, c)] += a * w;
                }
            }
        }
        let refs: Vec<&[f64]> = traces.iter().map(|t| t.as_slice()).collect();
        let spectra =
            extract_with(&image, None, &refs, 8.0, &[0, 1], |_, _, dx| gauss(dx)).unwrap();
        for (spec, a) in spectra.iter().zip(amps) {
            assert_relative_eq!(spec[0], a, epsilon = 1e-8);
            assert_relative_eq!(spec[1], a, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_mask_excludes_pixels() {
        let nrows = 20;
        let p = column_profile(10.0, nrows, 6.0, gauss).unwrap();
        let mut image = DMatrix::<f64>::zeros(nrows, 1);
        for (k, w) in p.weights.iter().enumerate() {
            image[(p.first_row + k, 0)] = 50.0 * w;
        }
        image[(10, 0)] = 1e6;
        let mut mask = DMatrix::from_element(nrows, 1, false);
        mask[(10, 0)] = true;

        let trace = [10.0];
        let spectra = extract_with(&image, Some(&mask), &[&trace[..]], 6.0, &[0], |_, _, dx| {
            gauss(dx)
        })
        .unwrap();
        assert_relative_eq!(spectra[0][0], 50.0, epsilon = 1e-8);
    }
}
