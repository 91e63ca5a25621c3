//! # Fiber model
//!
//! Empirical cross-dispersion profile of each fiber: relative illumination as a
//! function of the signed row distance `dx` from the trace.
//!
//! ## Representation
//!
//! The profile is piecewise linear between bin positions `binx`, spanning
//! `[-fsize, fsize]`. The two end bins are pinned to zero. Interior bin positions are
//! the quantiles of the cumulative distribution of `|f''|`, where
//! `f(x) = exp(-½·|x/σ|^p)` is the default shape, so bins are denser where the
//! profile bends most.
//!
//! Bin amplitudes are fitted per column group (`fibmodel_y`, one row per group,
//! centred on the columns `fibmodel_x`) and then smoothed along the detector by one
//! polynomial per bin in `u = column / D`. [`FiberModel::evaluate`] expands those
//! polynomials at every column.
//!
//! ## Fit
//!
//! For each live fiber, a stamp made of its `fiber_group` nearest live fibers and one
//! column group is fitted with a single shared profile. Every fiber whose window
//! reaches the stamp contributes `s_f(c) · P(r - t_f(c))`, where the fiber amplitudes
//! `s_f(c)` come from an extraction with the current profiles. The amplitudes of the
//! interior bins solve a linear least-squares problem and the profile is normalised to
//! unit area. Extraction and fit alternate twice, starting from the default shape.
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    extraction::{extract_with, solve_normal_equations},
    fiber::{property::FiberProperty, registry::FiberRegistry},
    panacea_errors::PanaceaError,
    params::ReductionParams,
    polynomial::{interp, Polynomial},
};

/// Number of extraction/fit alternations.
const FIT_ITERATIONS: usize = 2;

/// Samples of the fine grid used to place the bins.
const BIN_GRID_SAMPLES: usize = 2001;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiberModel {
    /// Bin positions (signed pixels from the trace), ascending, endpoints at `±fsize`.
    pub binx: Vec<f64>,
    /// Column-group centres, in columns.
    pub fibmodel_x: Vec<f64>,
    /// Fitted bin amplitudes, one row per column group.
    pub fibmodel_y: Vec<Vec<f64>>,
    /// One polynomial per bin, in `u = column / D`.
    pub polys: Vec<Polynomial>,
    #[serde(skip)]
    dense: Vec<f64>,
    #[serde(skip)]
    columns: usize,
}

/// Default profile shape `exp(-½·|x/σ|^p)`.
pub fn default_profile(x: f64, sigma: f64, power: f64) -> f64 {
    (-0.5 * (x / sigma).abs().powf(power)).exp()
}

/// Bin positions: `nbins` interior quantiles of `|f''|` plus the endpoints `±fsize`.
pub fn profile_bins(nbins: usize, fsize: f64, sigma: f64, power: f64) -> Vec<f64> {
    let m = BIN_GRID_SAMPLES;
    let step = 2.0 * fsize / (m - 1) as f64;
    let x: Vec<f64> = (0..m).map(|i| -fsize + i as f64 * step).collect();
    let f: Vec<f64> = x.iter().map(|&v| default_profile(v, sigma, power)).collect();

    let mut curv = vec![0.0; m];
    for i in 1..m - 1 {
        curv[i] = ((f[i + 1] - 2.0 * f[i] + f[i - 1]) / (step * step)).abs();
    }
    curv[0] = curv[1];
    curv[m - 1] = curv[m - 2];

    let mut cdf = vec![0.0; m];
    for i in 1..m {
        cdf[i] = cdf[i - 1] + 0.5 * (curv[i] + curv[i - 1]) * step;
    }
    let total = cdf[m - 1];

    let mut bins = Vec::with_capacity(nbins + 2);
    bins.push(-fsize);
    if total > 0.0 {
        cdf.iter_mut().for_each(|v| *v /= total);
        bins.extend((0..nbins).map(|k| interp((k as f64 + 0.5) / nbins as f64, &cdf, &x)));
    } else {
        bins.extend((0..nbins).map(|k| -fsize + 2.0 * fsize * (k as f64 + 0.5) / nbins as f64));
    }
    bins.push(fsize);
    bins
}

/// Piecewise-linear profile value; zero outside the bins.
#[inline]
fn piecewise(binx: &[f64], amps: &[f64], dx: f64) -> f64 {
    let n = binx.len();
    if n < 2 || dx < binx[0] || dx > binx[n - 1] {
        return 0.0;
    }
    interp(dx, binx, amps)
}

/// Area under the piecewise-linear profile.
fn profile_area(binx: &[f64], amps: &[f64]) -> f64 {
    binx.windows(2)
        .zip(amps.windows(2))
        .map(|(x, a)| 0.5 * (a[0] + a[1]) * (x[1] - x[0]))
        .sum()
}

/// Default amplitudes at `binx`, normalised to unit area, end bins at zero.
fn default_amplitudes(binx: &[f64], params: &ReductionParams) -> Vec<f64> {
    let n = binx.len();
    let mut amps: Vec<f64> = binx
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            if i == 0 || i == n - 1 {
                0.0
            } else {
                default_profile(x, params.sigma, params.power)
            }
        })
        .collect();
    let area = profile_area(binx, &amps);
    if area > 0.0 {
        amps.iter_mut().for_each(|a| *a /= area);
    }
    amps
}

impl FiberModel {
    /// Model with constant default amplitudes.
    pub fn default_model(params: &ReductionParams, columns: usize) -> Self {
        let binx = profile_bins(params.fibmodel_nbins, params.fsize, params.sigma, params.power);
        let amps = default_amplitudes(&binx, params);
        let mut model = FiberModel {
            polys: amps.iter().map(|&a| Polynomial::new(vec![a])).collect(),
            fibmodel_x: Vec::new(),
            fibmodel_y: vec![amps],
            binx,
            dense: Vec::new(),
            columns: 0,
        };
        model.evaluate(columns);
        model
    }

    /// Model from per-group amplitudes, smoothed by one polynomial per bin.
    ///
    /// Arguments
    /// -----------------
    /// * `binx`: Bin positions.
    /// * `fibmodel_x`: Column-group centres.
    /// * `fibmodel_y`: Amplitudes, one row per group.
    /// * `order`: Polynomial order (lowered when there are few groups).
    /// * `columns`: Number of columns D.
    pub fn from_groups(
        binx: Vec<f64>,
        fibmodel_x: Vec<f64>,
        fibmodel_y: Vec<Vec<f64>>,
        order: usize,
        columns: usize,
    ) -> Result<Self, PanaceaError> {
        let d = columns as f64;
        let u: Vec<f64> = fibmodel_x.iter().map(|&x| x / d).collect();
        let polys = (0..binx.len())
            .map(|b| {
                let y: Vec<f64> = fibmodel_y.iter().map(|row| row[b]).collect();
                Polynomial::fit(&u, &y, order)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut model = FiberModel {
            binx,
            fibmodel_x,
            fibmodel_y,
            polys,
            dense: Vec::new(),
            columns: 0,
        };
        model.evaluate(columns);
        Ok(model)
    }

    pub fn nbins(&self) -> usize {
        self.binx.len()
    }

    /// Expand the bin polynomials at every column.
    pub fn evaluate(&mut self, columns: usize) {
        let nb = self.binx.len();
        let d = columns as f64;
        self.columns = columns;
        self.dense = Vec::with_capacity(columns * nb);
        for c in 0..columns {
            let u = c as f64 / d;
            for (b, poly) in self.polys.iter().enumerate() {
                let v = if b == 0 || b == nb - 1 { 0.0 } else { poly.eval(u) };
                self.dense.push(v);
            }
        }
    }

    /// Bin amplitudes at `col`; empty before [`evaluate`](FiberModel::evaluate).
    pub fn amplitudes(&self, col: usize) -> &[f64] {
        let nb = self.binx.len();
        if col >= self.columns {
            return &[];
        }
        &self.dense[col * nb..(col + 1) * nb]
    }

    /// Profile value at `col`, distance `dx` from the trace.
    pub fn value(&self, col: usize, dx: f64) -> f64 {
        let amps = self.amplitudes(col);
        if amps.is_empty() {
            return 0.0;
        }
        piecewise(&self.binx, amps, dx)
    }
}

/// Column-group boundaries `[lo, hi)`.
fn column_groups(columns: usize, col_group: usize) -> Vec<(usize, usize)> {
    let ng = col_group.clamp(1, columns.max(1));
    (0..ng)
        .map(|g| (g * columns / ng, (g + 1) * columns / ng))
        .filter(|(lo, hi)| hi > lo)
        .collect()
}

/// Fiber-group window of `size` fibers around position `k` among `n`.
fn fiber_window(k: usize, n: usize, size: usize) -> (usize, usize) {
    let size = size.clamp(1, n);
    let start = k.saturating_sub(size / 2).min(n - size);
    (start, start + size)
}

struct Stamp<'a> {
    traces: &'a [&'a [f64]],
    amplitudes: &'a [Vec<f64>],
    group: (usize, usize),
    cols: (usize, usize),
}

/// Fit one shared profile to a stamp.
fn fit_stamp(
    image: &DMatrix<f64>,
    mask: Option<&DMatrix<bool>>,
    binx: &[f64],
    fsize: f64,
    stamp: &Stamp<'_>,
) -> Result<Option<Vec<f64>>, PanaceaError> {
    let nrows = image.nrows();
    let nb = binx.len();
    let ni = nb - 2;
    let (g0, g1) = stamp.group;
    let (c0, c1) = stamp.cols;

    let first = stamp.traces[g0][c0..c1].iter().copied().fold(f64::INFINITY, f64::min);
    let last = stamp.traces[g1 - 1][c0..c1]
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let row_lo = (first - fsize).floor().max(0.0) as usize;
    let row_hi = ((last + fsize).ceil().max(0.0) as usize + 1).min(nrows);

    // Fibers able to reach the stamp rows.
    let contributors: Vec<usize> = (0..stamp.traces.len())
        .filter(|&f| {
            let t = stamp.traces[f];
            let (a, b) = (t[c0], t[c1 - 1]);
            a.min(b) < row_hi as f64 + fsize + 1.0 && a.max(b) > row_lo as f64 - fsize - 1.0
        })
        .collect();

    let mut ata = DMatrix::<f64>::zeros(ni, ni);
    let mut atb = DVector::<f64>::zeros(ni);
    let mut g = vec![0.0; nb];
    let mut npix = 0usize;

    for c in c0..c1 {
        for r in row_lo..row_hi {
            let x = image[(r, c)];
            if !x.is_finite() || mask.is_some_and(|m| m[(r, c)]) {
                continue;
            }
            g.iter_mut().for_each(|v| *v = 0.0);
            let mut touched = false;
            for &f in &contributors {
                let dx = r as f64 - stamp.traces[f][c];
                if dx <= binx[0] || dx >= binx[nb - 1] {
                    continue;
                }
                let j = binx.partition_point(|&b| b <= dx) - 1;
                let frac = (dx - binx[j]) / (binx[j + 1] - binx[j]);
                let s = stamp.amplitudes[f][c];
                g[j] += s * (1.0 - frac);
                g[j + 1] += s * frac;
                touched = true;
            }
            if !touched {
                continue;
            }
            npix += 1;
            let gi = &g[1..nb - 1];
            for p in 0..ni {
                if gi[p] == 0.0 {
                    continue;
                }
                atb[p] += gi[p] * x;
                for q in 0..ni {
                    ata[(p, q)] += gi[p] * gi[q];
                }
            }
        }
    }
    if npix < ni {
        return Ok(None);
    }
    // Light ridge keeps bins without samples at zero instead of singular.
    let ridge = 1e-10 * (0..ni).map(|p| ata[(p, p)]).sum::<f64>().max(1e-300) / ni as f64;
    for p in 0..ni {
        ata[(p, p)] += ridge;
    }

    let sol = solve_normal_equations(ata, atb)?;
    let mut amps = Vec::with_capacity(nb);
    amps.push(0.0);
    amps.extend(sol.iter().copied());
    amps.push(0.0);

    let area = profile_area(binx, &amps);
    if !(area.is_finite() && area > 0.0) {
        return Ok(None);
    }
    amps.iter_mut().for_each(|a| *a /= area);
    Ok(Some(amps))
}

/// Fit the fiber model of every fiber.
///
/// Live fibers get a fitted model (or the default one with `use_default_fibmodel`);
/// dead fibers copy the model of their nearest live fiber.
///
/// Arguments
/// -----------------
/// * `image`: Calibrated image.
/// * `mask`: Optional bad-pixel mask.
/// * `fibers`: Fibers with traces.
/// * `params`: `fibmodel_nbins`, `fsize`, `sigma`, `power`, `fiber_group`, `col_group`,
///   `fibmodel_poly_order`, `use_default_fibmodel`.
///
/// Return
/// ----------
/// * `Ok(())` once every fiber holds a model.
/// * [`PanaceaError::NoLiveNeighbor`] when a dead fiber has no live fiber to copy from.
pub fn fit_fibermodels(
    image: &DMatrix<f64>,
    mask: Option<&DMatrix<bool>>,
    fibers: &mut FiberRegistry,
    params: &ReductionParams,
) -> Result<(), PanaceaError> {
    let d = image.ncols();
    if params.use_default_fibmodel {
        let model = FiberModel::default_model(params, d);
        fibers.iter_mut().for_each(|f| f.fibmodel = Some(model.clone()));
        info!("default fiber model used");
        return Ok(());
    }

    let good = fibers.good_indices();
    if good.is_empty() {
        return Err(PanaceaError::NoLiveNeighbor(1));
    }
    let binx = profile_bins(params.fibmodel_nbins, params.fsize, params.sigma, params.power);
    let default_amps = default_amplitudes(&binx, params);
    let groups = column_groups(d, params.col_group);
    let group_of: Vec<usize> = groups
        .iter()
        .enumerate()
        .flat_map(|(g, &(lo, hi))| std::iter::repeat(g).take(hi - lo))
        .collect();

    let traces: Vec<&[f64]> = good
        .iter()
        .map(|&i| fibers[i].trace_values())
        .collect::<Result<_, _>>()?;
    let all_cols: Vec<usize> = (0..d).collect();

    // amps[fiber][group][bin]
    let mut amps: Vec<Vec<Vec<f64>>> =
        vec![vec![default_amps.clone(); groups.len()]; good.len()];
    for iteration in 0..FIT_ITERATIONS {
        let profile = |f: usize, c: usize, dx: f64| piecewise(&binx, &amps[f][group_of[c]], dx);
        let fiber_amps = extract_with(image, mask, &traces, params.fsize, &all_cols, profile)?;

        let mut fallback = 0usize;
        let mut next = amps.clone();
        for k in 0..good.len() {
            let window = fiber_window(k, good.len(), params.fiber_group);
            for (g, &cols) in groups.iter().enumerate() {
                let stamp = Stamp {
                    traces: &traces,
                    amplitudes: &fiber_amps,
                    group: window,
                    cols,
                };
                match fit_stamp(image, mask, &binx, params.fsize, &stamp)? {
                    Some(fit) => next[k][g] = fit,
                    None => fallback += 1,
                }
            }
        }
        amps = next;
        debug!(iteration, fallback, "fiber model stamps fitted");
    }

    let centres: Vec<f64> = groups
        .iter()
        .map(|&(lo, hi)| 0.5 * (lo + hi - 1) as f64)
        .collect();
    let order = params.fibmodel_poly_order;
    for (k, &i) in good.iter().enumerate() {
        let model = FiberModel::from_groups(
            binx.clone(),
            centres.clone(),
            std::mem::take(&mut amps[k]),
            order,
            d,
        )?;
        fibers[i].fibmodel = Some(model);
    }
    fibers.fill_dead(&[FiberProperty::FibModel])?;
    info!(fibers = good.len(), groups = groups.len(), "fiber models fitted");
    Ok(())
}
