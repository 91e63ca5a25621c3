//! # Sky and continuum
//!
//! Builds the per-fiber sky model and the image-space products of a science frame.
//!
//! ## Overview
//!
//! - The master sky merges `spectrum / fiber_to_fiber` of every live fiber by
//!   wavelength and smooths it over `filt_size_sky` samples.
//! - Each fiber's sky is `fiber_to_fiber × master sky` at the fiber's wavelengths.
//! - The sky frame re-projects the sky spectra through trace and fiber model; it is
//!   subtracted from the calibrated image.
//! - The continuum of each fiber is the running biweight of `spectrum - sky`,
//!   skipping `cont_ignore_central` samples around each position; it is re-projected
//!   and subtracted with the sky.
//! - The residual frame is the image minus the re-projection of the extracted spectra.
use nalgebra::DMatrix;
use tracing::{debug, info};

use crate::{
    amplifier::ImageProducts,
    biweight::biweight_filter_ignoring,
    extraction::model_image,
    fiber::registry::FiberRegistry,
    normalization::{ratio, smooth_master, wavelength_ordered, MasterCurve},
    panacea_errors::PanaceaError,
    params::ReductionParams,
};

/// Master sky from the throughput-corrected spectra of the live fibers.
pub fn master_sky(
    fibers: &FiberRegistry,
    params: &ReductionParams,
) -> Result<MasterCurve, PanaceaError> {
    let merged = wavelength_ordered(fibers, |fiber| {
        let spectrum = fiber.spectrum_values()?;
        let ftf = fiber.fiber_to_fiber_values()?;
        Ok(spectrum.iter().zip(ftf).map(|(&s, &t)| ratio(s, t)).collect())
    })?;
    Ok(smooth_master(merged, params.filt_size_sky))
}

/// Set `sky_spectrum = fiber_to_fiber × master` on every fiber.
pub fn assign_sky(fibers: &mut FiberRegistry, master: &MasterCurve) -> Result<(), PanaceaError> {
    for fiber in fibers.iter_mut() {
        let sky: Vec<f64> = master
            .at(fiber.wavelength_values()?)
            .into_iter()
            .zip(fiber.fiber_to_fiber_values()?)
            .map(|(m, &t)| m * t)
            .collect();
        fiber.sky_spectrum = Some(sky);
    }
    Ok(())
}

/// Set the smoothed continuum of every fiber.
pub fn assign_continuum(
    fibers: &mut FiberRegistry,
    params: &ReductionParams,
) -> Result<(), PanaceaError> {
    for fiber in fibers.iter_mut() {
        let sky = fiber.sky_spectrum.as_deref().ok_or_else(|| {
            PanaceaError::MissingStageOutput(format!("sky of fiber {}", fiber.fibnum))
        })?;
        let net: Vec<f64> = fiber
            .spectrum_values()?
            .iter()
            .zip(sky)
            .map(|(s, k)| s - k)
            .collect();
        fiber.continuum = Some(biweight_filter_ignoring(
            &net,
            params.cont_smooth,
            params.cont_ignore_central,
        ));
    }
    Ok(())
}

/// Output of [`sky_subtraction`].
#[derive(Debug, Clone, Default)]
pub struct SkyResult {
    /// Master sky, when it was computed rather than loaded.
    pub master: Option<MasterCurve>,
    pub products: ImageProducts,
}

/// Model the sky and continuum of every fiber and build the difference images.
///
/// Arguments
/// -----------------
/// * `image`: Calibrated image.
/// * `fibers`: Fibers with trace, model, wavelength, spectrum and fiber-to-fiber.
/// * `params`: `fsize`, `filt_size_sky`, `cont_smooth`, `cont_ignore_central`,
///   `make_skyframe`, `do_cont_sub`, `make_residual`.
/// * `sky_loaded`: `true` when every fiber already holds a sky spectrum from a prior
///   reduction; the master sky is then not recomputed.
///
/// Return
/// ----------
/// * The master sky (if computed) and the requested image products.
pub fn sky_subtraction(
    image: &DMatrix<f64>,
    fibers: &mut FiberRegistry,
    params: &ReductionParams,
    sky_loaded: bool,
) -> Result<SkyResult, PanaceaError> {
    let shape = image.shape();
    let mut result = SkyResult::default();
    if !sky_loaded {
        let master = master_sky(fibers, params)?;
        assign_sky(fibers, &master)?;
        debug!(samples = master.len(), "master sky built");
        result.master = Some(master);
    }

    let skyframe = if params.make_skyframe || params.do_cont_sub {
        Some(model_image(shape, fibers, params.fsize, |f| f.sky_spectrum.as_deref())?)
    } else {
        None
    };

    if params.do_cont_sub {
        assign_continuum(fibers, params)?;
        if let Some(sky) = &skyframe {
            let cont = model_image(shape, fibers, params.fsize, |f| f.continuum.as_deref())?;
            result.products.continuum_sub = Some(image - sky - &cont);
            result.products.cont_frame = Some(cont);
        }
    }
    if params.make_residual {
        let model = model_image(shape, fibers, params.fsize, |f| f.spectrum.as_deref())?;
        result.products.residual = Some(image - model);
    }
    if params.make_skyframe {
        if let Some(sky) = skyframe {
            result.products.clean_image = Some(image - &sky);
            result.products.skyframe = Some(sky);
        }
    }
    info!(
        skyframe = params.make_skyframe,
        continuum = params.do_cont_sub,
        residual = params.make_residual,
        "sky subtraction done"
    );
    Ok(result)
}
