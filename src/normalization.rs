//! # Fiber-to-fiber normalisation and master spectra
//!
//! A *master* spectrum merges the `(wavelength, value)` samples of every live fiber
//! into one wavelength-ordered sequence, smoothed by a running biweight. Three masters
//! are built from it:
//!
//! - the normalised master used as second-pass wavelength reference
//!   ([`master_normalized`]),
//! - the average spectrum behind the fiber-to-fiber throughput ([`fiber_to_fiber`]),
//! - the master sky ([`crate::sky`]).
//!
//! ## Fiber-to-fiber
//!
//! ```text
//! ratio_f = spectrum_f / interp(wavelength_f, master_wave, average)
//! ftf_f   = biweight_filter(ratio_f, filt_size_final)
//! ```
//!
//! Samples where the master is zero give a zero ratio.
use itertools::Itertools;
use ordered_float::OrderedFloat;
use tracing::info;

use crate::{
    biweight::biweight_filter,
    fiber::{registry::FiberRegistry, Fiber},
    panacea_errors::PanaceaError,
    params::ReductionParams,
    polynomial::interp_many,
};

/// A wavelength-ordered master curve.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasterCurve {
    pub wavelength: Vec<f64>,
    pub values: Vec<f64>,
}

impl MasterCurve {
    pub fn len(&self) -> usize {
        self.wavelength.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelength.is_empty()
    }

    /// Resample the curve at `wavelength`.
    pub fn at(&self, wavelength: &[f64]) -> Vec<f64> {
        interp_many(wavelength, &self.wavelength, &self.values)
    }
}

/// `a / b`, or zero when the quotient is not finite.
#[inline]
pub(crate) fn ratio(a: f64, b: f64) -> f64 {
    let r = a / b;
    if r.is_finite() {
        r
    } else {
        0.0
    }
}

/// Spectrum divided by its own running biweight.
pub fn normalized_spectrum(spectrum: &[f64], filt_size: usize) -> Vec<f64> {
    let smooth = biweight_filter(spectrum, filt_size);
    spectrum
        .iter()
        .zip(&smooth)
        .map(|(&s, &m)| ratio(s, m))
        .collect()
}

/// Merge the samples of every live fiber into one wavelength-ordered sequence.
///
/// Arguments
/// -----------------
/// * `fibers`: Fibers with a wavelength solution.
/// * `values`: Per-fiber values sampled on the fiber's wavelengths.
///
/// Return
/// ----------
/// * The sorted wavelengths and the matching values (unsmoothed).
/// * [`PanaceaError::EmptyMaster`] when no live fiber contributes a finite sample.
pub(crate) fn wavelength_ordered<F>(
    fibers: &FiberRegistry,
    values: F,
) -> Result<MasterCurve, PanaceaError>
where
    F: Fn(&Fiber) -> Result<Vec<f64>, PanaceaError>,
{
    let mut samples = Vec::new();
    for fiber in fibers.iter().filter(|f| !f.dead) {
        let wave = fiber.wavelength_values()?;
        let vals = values(fiber)?;
        samples.extend(
            wave.iter()
                .zip(vals)
                .filter(|(w, v)| w.is_finite() && v.is_finite())
                .map(|(&w, v)| (w, v)),
        );
    }
    if samples.is_empty() {
        return Err(PanaceaError::EmptyMaster);
    }
    let (wavelength, values): (Vec<f64>, Vec<f64>) = samples
        .into_iter()
        .sorted_by_key(|&(w, _)| OrderedFloat(w))
        .unzip();
    Ok(MasterCurve { wavelength, values })
}

/// Smooth a merged curve in place.
pub(crate) fn smooth_master(mut curve: MasterCurve, filt_size: usize) -> MasterCurve {
    curve.values = biweight_filter(&curve.values, filt_size);
    curve
}

/// Master of the self-normalised spectra of every live fiber.
///
/// Each spectrum is divided by its `filt_size_ind` running biweight, the results are
/// merged by wavelength and smoothed over `filt_size_agg` samples.
pub fn master_normalized(
    fibers: &FiberRegistry,
    params: &ReductionParams,
) -> Result<MasterCurve, PanaceaError> {
    let merged = wavelength_ordered(fibers, |fiber| {
        Ok(normalized_spectrum(fiber.spectrum_values()?, params.filt_size_ind))
    })?;
    Ok(smooth_master(merged, params.filt_size_agg))
}

/// Average spectrum of every live fiber, smoothed over `filt_size_agg` samples.
pub fn master_spectrum(
    fibers: &FiberRegistry,
    params: &ReductionParams,
) -> Result<MasterCurve, PanaceaError> {
    let merged = wavelength_ordered(fibers, |fiber| Ok(fiber.spectrum_values()?.to_vec()))?;
    Ok(smooth_master(merged, params.filt_size_agg))
}

/// Compute the fiber-to-fiber throughput of every fiber.
///
/// Dead fibers are normalised too, from their imputed wavelength and spectrum.
///
/// Arguments
/// -----------------
/// * `fibers`: Fibers with `wavelength` and `spectrum`.
/// * `params`: `filt_size_agg` (master) and `filt_size_final` (ratio smoothing).
///
/// Return
/// ----------
/// * The average master spectrum the ratios were taken against.
pub fn fiber_to_fiber(
    fibers: &mut FiberRegistry,
    params: &ReductionParams,
) -> Result<MasterCurve, PanaceaError> {
    let master = master_spectrum(fibers, params)?;
    for fiber in fibers.iter_mut() {
        let wave = fiber.wavelength_values()?;
        let reference = master.at(wave);
        let ratios: Vec<f64> = fiber
            .spectrum_values()?
            .iter()
            .zip(&reference)
            .map(|(&s, &m)| ratio(s, m))
            .collect();
        fiber.fiber_to_fiber = Some(biweight_filter(&ratios, params.filt_size_final));
    }
    info!(samples = master.len(), "fiber-to-fiber computed");
    Ok(master)
}
