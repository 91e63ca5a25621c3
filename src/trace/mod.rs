//! # Fiber traces
//!
//! Locates every fiber's centroid row at every column of a calibrated image, or marks
//! the fiber dead.
//!
//! ## Algorithm
//!
//! 1. Detect candidate centroids in every column ([`centroids::find_centroids`]).
//! 2. Pick the reference column nearest to `col_frac · D` and define the standard fiber
//!    positions there, either from the detected centroids or from a reference geometry
//!    ([`reference_positions`]), sorted by row.
//! 3. Match each standard position to the nearest centroid within `fdist_ref`; an
//!    unmatched position makes that fiber dead.
//! 4. Walk outward from the reference column in both directions. Each live fiber is
//!    matched to the nearest centroid within `fdist` of its last matched row; a miss
//!    leaves a gap at that column.
//! 5. Fibers matched at every column get a polynomial fit evaluated everywhere.
//! 6. Fibers with gaps are fitted on their matched columns, the gaps are filled from
//!    the offset to an adjacent finalized fiber (the next one first, then the previous
//!    one) or from the polynomial, and the polynomial is refit on the completed set.
//! 7. Dead fibers copy the trace of their nearest live fiber, shifted by the difference
//!    of the two standard positions.
//!
//! A measured trace can also be compared with a calibration trace set
//! ([`find_shift`]) to move the calibration traces onto the current frame.
pub mod centroids;
pub mod summary;

use hifitime::Epoch;
use nalgebra::DMatrix;
use tracing::{debug, info};

use crate::{
    amplifier::AmpContext,
    biweight::{biweight_filter, biweight_location},
    calibration::library::{closest_reference_date, CalibrationLibrary},
    constants::{SHIFT_COLUMN_FRACTION, SHIFT_FILTER_SIZE, SHIFT_HALF_WIDTH},
    fiber::{
        property::{resample_columns, FiberProperty},
        registry::FiberRegistry,
        Fiber,
    },
    panacea_errors::PanaceaError,
    params::ReductionParams,
    polynomial::{interp, Polynomial},
};
use centroids::find_centroids;

/// Outcome of [`find_traces`].
#[derive(Debug, Clone, PartialEq)]
pub struct TraceReport {
    /// Reference column index.
    pub ref_col: usize,
    /// Standard fiber positions at the reference column, ascending.
    pub standard: Vec<f64>,
    /// `(dead, source)` index pairs used to fill dead fibers.
    pub dead: Vec<(usize, usize)>,
    /// Number of live fibers that had at least one unmatched column.
    pub gap_fibers: usize,
}

/// Column nearest to `col_frac · columns` (the lower one on ties).
pub fn reference_column(columns: usize, col_frac: f64) -> usize {
    let target = columns as f64 * col_frac;
    (0..columns)
        .min_by(|&a, &b| {
            (a as f64 - target)
                .abs()
                .total_cmp(&(b as f64 - target).abs())
        })
        .unwrap_or(0)
}

/// Reference fiber positions for an amplifier, sorted by row.
///
/// The geometry date is `fiber_date` when given, otherwise the library date closest to
/// `obs_date`.
pub fn reference_positions(
    library: &dyn CalibrationLibrary,
    ctx: &AmpContext,
    obs_date: Epoch,
    fiber_date: Option<&str>,
) -> Result<Vec<f64>, PanaceaError> {
    let date = match fiber_date {
        Some(date) => date.to_string(),
        None => closest_reference_date(library, obs_date)?,
    };
    let mut positions = library.fiber_locations(&date, ctx)?;
    positions.sort_by(f64::total_cmp);
    info!(date = %date, fibers = positions.len(), "reference fiber geometry loaded");
    Ok(positions)
}

/// Nearest value of an ascending list to `target`.
fn nearest(sorted: &[f64], target: f64) -> Option<f64> {
    let idx = sorted.partition_point(|&v| v < target);
    let below = idx.checked_sub(1).map(|i| sorted[i]);
    let above = sorted.get(idx).copied();
    match (below, above) {
        (Some(b), Some(a)) => Some(if target - b <= a - target { b } else { a }),
        (b, a) => b.or(a),
    }
}

fn walk(
    fibers: &mut FiberRegistry,
    good: &[usize],
    centroids: &[Vec<f64>],
    ref_col: usize,
    columns: impl Iterator<Item = usize>,
    fdist: f64,
) {
    let mut last: Vec<f64> = good
        .iter()
        .map(|&i| fibers[i].trace_observed[ref_col].unwrap_or(f64::NAN))
        .collect();
    for c in columns {
        let ys = &centroids[c];
        if ys.is_empty() {
            continue;
        }
        for (k, &i) in good.iter().enumerate() {
            if let Some(y) = nearest(ys, last[k]) {
                if (y - last[k]).abs() < fdist {
                    fibers[i].trace_observed[c] = Some(y);
                    last[k] = y;
                }
            }
        }
    }
}

/// Fill the gaps of fiber `i` and refit its trace.
fn complete_gapped_trace(
    fibers: &mut FiberRegistry,
    i: usize,
    neighbour: Option<usize>,
    order: usize,
) -> Result<usize, PanaceaError> {
    let d = fibers.columns();
    fibers[i].fit_trace_poly(order)?;

    let observed = fibers[i].trace_observed.clone();
    let (sel_x, sel_y): (Vec<f64>, Vec<f64>) = observed
        .iter()
        .enumerate()
        .filter_map(|(c, v)| v.map(|y| (c as f64, y)))
        .unzip();

    let filled: Vec<f64> = match neighbour.and_then(|nb| fibers[nb].trace.clone()) {
        Some(nb_trace) => {
            let dif: Vec<f64> = sel_x
                .iter()
                .zip(&sel_y)
                .map(|(&x, &y)| y - nb_trace[x as usize])
                .collect();
            observed
                .iter()
                .enumerate()
                .map(|(c, v)| v.unwrap_or_else(|| interp(c as f64, &sel_x, &dif) + nb_trace[c]))
                .collect()
        }
        None => {
            let poly = fibers[i]
                .trace_poly
                .clone()
                .ok_or_else(|| {
                    PanaceaError::MissingStageOutput(format!("trace of fiber {}", i + 1))
                })?;
            observed
                .iter()
                .enumerate()
                .map(|(c, v)| v.unwrap_or_else(|| poly.eval(c as f64 / d as f64)))
                .collect()
        }
    };

    let u: Vec<f64> = (0..d).map(|c| c as f64 / d as f64).collect();
    fibers[i].trace_poly = Some(Polynomial::fit(&u, &filled, order)?);
    fibers[i].eval_trace_poly();
    Ok(d - sel_x.len())
}

/// Measure the trace of every fiber on `image`.
///
/// Arguments
/// -----------------
/// * `image`: Calibrated image.
/// * `fibers`: Registry to fill; it is resized to the number of standard positions.
/// * `params`: `fdist`, `fdist_ref`, `col_frac`, `mx_cut`, `trace_poly_order`.
/// * `reference`: Reference geometry positions; `None` uses the centroids of the
///   reference column.
///
/// Return
/// ----------
/// * A [`TraceReport`] describing the reference column and the dead-fiber fill.
/// * [`PanaceaError::NoLiveNeighbor`] if a dead fiber has no live fiber to copy from.
///
/// See also
/// ------------
/// * [`FiberRegistry::fill_dead`] – Neighbour search used for dead fibers.
pub fn find_traces(
    image: &DMatrix<f64>,
    fibers: &mut FiberRegistry,
    params: &ReductionParams,
    reference: Option<&[f64]>,
) -> Result<TraceReport, PanaceaError> {
    let d = image.ncols();
    if d != fibers.columns() {
        return Err(PanaceaError::ShapeMismatch {
            expected: (image.nrows(), fibers.columns()),
            found: image.shape(),
            context: "trace image".into(),
        });
    }
    let centroids = find_centroids(image, params.mx_cut);
    let ref_col = reference_column(d, params.col_frac);

    let standard: Vec<f64> = match reference {
        Some(positions) => {
            let mut s = positions.to_vec();
            s.sort_by(f64::total_cmp);
            s
        }
        None => centroids.get(ref_col).cloned().unwrap_or_default(),
    };
    if standard.is_empty() {
        return Err(PanaceaError::MissingStageOutput(format!(
            "no fiber detected at reference column {ref_col}"
        )));
    }

    fibers.ensure_len(standard.len());
    fibers.truncate(standard.len());
    for (i, &pos) in standard.iter().enumerate() {
        let fiber = &mut fibers[i];
        fiber.init_trace_info();
        match nearest(&centroids[ref_col], pos) {
            Some(y) if (y - pos).abs() < params.fdist_ref => {
                fiber.trace_observed[ref_col] = Some(y)
            }
            _ => {
                fiber.dead = true;
                debug!(fiber = i + 1, position = pos, "no centroid at reference column");
            }
        }
    }

    let good = fibers.good_indices();
    walk(fibers, &good, &centroids, ref_col, (0..ref_col).rev(), params.fdist);
    walk(fibers, &good, &centroids, ref_col, ref_col + 1..d, params.fdist);

    for &i in &good {
        if fibers[i].is_trace_complete() {
            fibers[i].fit_trace_poly(params.trace_poly_order)?;
            fibers[i].eval_trace_poly();
        }
    }

    let mut gap_fibers = 0;
    for (k, &i) in good.iter().enumerate() {
        if fibers[i].is_trace_complete() {
            continue;
        }
        let neighbour = [good.get(k + 1).copied(), k.checked_sub(1).map(|j| good[j])]
            .into_iter()
            .flatten()
            .find(|&nb| fibers[nb].trace.is_some());
        let gaps = complete_gapped_trace(fibers, i, neighbour, params.trace_poly_order)?;
        gap_fibers += 1;
        debug!(fiber = i + 1, gaps, neighbour = ?neighbour.map(|n| n + 1), "trace gaps filled");
    }

    let dead = fibers.fill_dead(&[FiberProperty::Trace])?;
    for &(i, src) in &dead {
        let offset = standard[i] - standard[src];
        let fiber = &mut fibers[i];
        if let Some(trace) = &mut fiber.trace {
            trace.iter_mut().for_each(|y| *y += offset);
        }
        if let Some(poly) = &mut fiber.trace_poly {
            if let Some(c0) = poly.coeffs.first_mut() {
                *c0 += offset;
            }
        }
        fiber
            .trace_observed
            .iter_mut()
            .flatten()
            .for_each(|y| *y += offset);
    }

    info!(
        fibers = standard.len(),
        dead = dead.len(),
        gap_fibers,
        ref_col,
        "traces measured"
    );
    Ok(TraceReport {
        ref_col,
        standard,
        dead,
        gap_fibers,
    })
}

/// Offset between measured traces and a calibration trace set.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceShift {
    /// Robust shift per fiber (measured − calibration).
    pub per_fiber: Vec<f64>,
    /// `per_fiber` smoothed across fibers.
    pub smoothed: Vec<f64>,
    /// Robust location of all per-fiber shifts.
    pub net: f64,
}

impl TraceShift {
    /// Add the smoothed shift of each fiber to its trace.
    pub fn apply(&self, fibers: &mut FiberRegistry) {
        for (fiber, &shift) in fibers.iter_mut().zip(&self.smoothed) {
            if let Some(trace) = &mut fiber.trace {
                trace.iter_mut().for_each(|y| *y += shift);
            }
            if let Some(c0) = fiber.trace_poly.as_mut().and_then(|p| p.coeffs.first_mut()) {
                *c0 += shift;
            }
        }
    }
}

/// Compare measured traces with calibration traces near `0.8 · D`.
///
/// Return
/// ----------
/// * `Ok(None)` when fewer traces have been measured than calibration records exist.
/// * The per-fiber, smoothed and net shifts otherwise.
pub fn find_shift(
    fibers: &FiberRegistry,
    calibration: &[Fiber],
) -> Result<Option<TraceShift>, PanaceaError> {
    if fibers.is_empty() || fibers.len() < calibration.len() {
        debug!("no trace measured yet, so no shift measured");
        return Ok(None);
    }
    let d = fibers.columns();
    let col = SHIFT_COLUMN_FRACTION * d as f64;
    let low = (col - SHIFT_HALF_WIDTH as f64).max(0.0) as usize;
    let high = ((col + SHIFT_HALF_WIDTH as f64 + 1.0) as usize).min(d);
    if low >= high {
        return Ok(None);
    }

    let per_fiber = fibers
        .iter()
        .zip(calibration)
        .map(|(fiber, cal)| {
            let trace = fiber.trace_values()?;
            let cal_trace = cal.trace_values()?;
            let cal_trace = if cal.columns == d {
                cal_trace.to_vec()
            } else {
                resample_columns(cal_trace, d)
            };
            let diffs: Vec<f64> = (low..high).map(|c| trace[c] - cal_trace[c]).collect();
            Ok(biweight_location(&diffs).unwrap_or(0.0))
        })
        .collect::<Result<Vec<f64>, PanaceaError>>()?;

    let net = biweight_location(&per_fiber).unwrap_or(0.0);
    let smoothed = biweight_filter(&per_fiber, SHIFT_FILTER_SIZE);
    info!(net_shift = net, "trace shift measured");
    Ok(Some(TraceShift {
        per_fiber,
        smoothed,
        net,
    }))
}

#[cfg(test)]
mod trace_test {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn gaussian_frame(rows: usize, cols: usize, centers: &[f64], tilt: f64) -> DMatrix<f64> {
        DMatrix::from_fn(rows, cols, |r, c| {
            centers
                .iter()
                .map(|&y0| {
                    let dy = r as f64 - (y0 + tilt * c as f64);
                    1000.0 * (-0.5 * dy * dy / 2.0).exp()
                })
                .sum()
        })
    }

    #[test]
    fn test_reference_column() {
        assert_eq!(reference_column(100, 0.47), 47);
        assert_eq!(reference_column(10, 0.45), 4);
        assert_eq!(reference_column(1, 0.9), 0);
    }

    #[test]
    fn test_nearest() {
        let ys = [1.0, 5.0, 9.0];
        assert_eq!(nearest(&ys, 6.0), Some(5.0));
        assert_eq!(nearest(&ys, 8.0), Some(9.0));
        assert_eq!(nearest(&ys, -3.0), Some(1.0));
        assert_eq!(nearest(&[], 2.0), None);
    }

    #[test]
    fn test_traces_follow_tilt() {
        let centers = [10.0, 20.0, 30.0, 40.0];
        let image = gaussian_frame(52, 40, &centers, 0.05);
        let params = ReductionParams::builder().trace_poly_order(2).build().unwrap();
        let mut fibers = FiberRegistry::new(40);
        let report = find_traces(&image, &mut fibers, &params, None).unwrap();

        assert_eq!(fibers.len(), 4);
        assert!(report.dead.is_empty());
        for (fiber, &y0) in fibers.iter().zip(&centers) {
            let trace = fiber.trace_values().unwrap();
            assert_abs_diff_eq!(trace[0], y0, epsilon = 0.1);
            assert_abs_diff_eq!(trace[39], y0 + 0.05 * 39.0, epsilon = 0.1);
        }
    }

    #[test]
    fn test_missing_fiber_is_dead() {
        let image = gaussian_frame(52, 30, &[10.0, 20.0, 40.0], 0.0);
        let params = ReductionParams::builder().build().unwrap();
        let mut fibers = FiberRegistry::new(30);
        let reference = [10.0, 20.0, 30.0, 40.0];
        let report = find_traces(&image, &mut fibers, &params, Some(&reference)).unwrap();

        assert_eq!(fibers.dead_indices(), vec![2]);
        assert_eq!(report.dead, vec![(2, 1)]);
        let dead = fibers[2].trace_values().unwrap();
        let src = fibers[1].trace_values().unwrap();
        for (a, b) in dead.iter().zip(src) {
            assert_abs_diff_eq!(a - b, 10.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_shift_against_calibration() {
        let d = 60;
        let mut fibers = FiberRegistry::new(d);
        fibers.ensure_len(3);
        let mut cal = Vec::new();
        for (i, fiber) in fibers.iter_mut().enumerate() {
            fiber.trace = Some(vec![10.0 * i as f64 + 0.4; d]);
            let mut record = Fiber::new(i + 1, d);
            record.trace = Some(vec![10.0 * i as f64; d]);
            cal.push(record);
        }
        let shift = find_shift(&fibers, &cal).unwrap().unwrap();
        assert_abs_diff_eq!(shift.net, 0.4, epsilon = 1e-9);

        let mut reloaded = FiberRegistry::new(d);
        reloaded.ensure_len(3);
        for (fiber, record) in reloaded.iter_mut().zip(&cal) {
            fiber.convert_property(record, FiberProperty::Trace);
        }
        shift.apply(&mut reloaded);
        assert_abs_diff_eq!(reloaded[2].trace_values().unwrap()[5], 20.4, epsilon = 1e-9);

        let empty = FiberRegistry::new(d);
        assert!(find_shift(&empty, &cal).unwrap().is_none());
    }
}
