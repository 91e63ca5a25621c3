//! # Image preparation
//!
//! Turns the raw frame of an [`Amplifier`] into a calibrated image with a propagated
//! error array. The steps run in a fixed order:
//!
//! 1. overscan subtraction (biweight location of `BIASSEC`, measured once),
//! 2. trim to `TRIMSEC`,
//! 3. gain multiplication (image and error),
//! 4. photon noise added in quadrature,
//! 5. master bias subtraction (when `bias_mult > 0`),
//! 6. master dark subtraction (when `dark_mult > 0`),
//! 7. pixel-flat division, zero flat pixels giving zero,
//! 8. orientation so that wavelength increases with column.
//!
//! [`Amplifier::prepare_image`] is guarded by a flag and is a no-op on a prepared frame.
use nalgebra::DMatrix;
use tracing::{debug, info};

use crate::{
    amplifier::Amplifier, biweight::biweight_location, calibration::CalibrationLibrary,
    constants::FLIPPED_AMPS, panacea_errors::PanaceaError, params::ReductionParams,
};

fn check_shape(
    expected: &DMatrix<f64>,
    found: &DMatrix<f64>,
    context: &str,
) -> Result<(), PanaceaError> {
    if expected.shape() != found.shape() {
        return Err(PanaceaError::ShapeMismatch {
            expected: expected.shape(),
            found: found.shape(),
            context: context.to_string(),
        });
    }
    Ok(())
}

/// Divide `image` and `error` by `flat`, mapping pixels where the flat is zero to zero.
pub fn apply_pixelflat(
    image: &mut DMatrix<f64>,
    error: &mut DMatrix<f64>,
    flat: &DMatrix<f64>,
) -> Result<(), PanaceaError> {
    check_shape(image, flat, "pixel flat")?;
    check_shape(image, error, "error array")?;
    for ((px, err), &f) in image.iter_mut().zip(error.iter_mut()).zip(flat.iter()) {
        if f != 0.0 {
            *px /= f;
            *err /= f;
        } else {
            *px = 0.0;
            *err = 0.0;
        }
    }
    Ok(())
}

/// Rotate a matrix by 180° (both axes reversed).
pub fn rotate_half_turn(m: &DMatrix<f64>) -> DMatrix<f64> {
    let (n, d) = m.shape();
    DMatrix::from_fn(n, d, |i, j| m[(n - 1 - i, d - 1 - j)])
}

impl Amplifier {
    /// Subtract the biweight location of the overscan region.
    ///
    /// The level is measured on the untrimmed frame and cached; a second call does nothing.
    pub fn subtract_overscan(&mut self) -> Result<(), PanaceaError> {
        if self.overscan.get().is_some() {
            return Ok(());
        }
        if self.trimmed {
            return Err(PanaceaError::MissingStageOutput(
                "overscan region already trimmed away".into(),
            ));
        }
        let region = self.header.biassec.extract(&self.image)?;
        let level = *self.overscan.get_or_try_init(|| {
            biweight_location(region.as_slice()).ok_or_else(|| {
                PanaceaError::InvalidHeader(format!(
                    "BIASSEC {} holds no finite pixel",
                    self.header.biassec
                ))
            })
        })?;
        self.image.add_scalar_mut(-level);
        debug!(amp = %self.label(), overscan = level, "overscan subtracted");
        Ok(())
    }

    /// Keep only the `TRIMSEC` region.
    pub fn trim_image(&mut self) -> Result<(), PanaceaError> {
        if !self.trimmed {
            self.image = self.header.trimsec.extract(&self.image)?;
            self.trimmed = true;
        }
        Ok(())
    }

    pub fn multiply_gain(&mut self) {
        let gain = self.header.gain;
        self.image *= gain;
        self.error *= gain;
    }

    /// Add Poisson noise in quadrature; negative pixels contribute nothing.
    pub fn calculate_photon_noise(&mut self) {
        self.error
            .zip_apply(&self.image, |err, px| *err = (*err * *err + px.max(0.0)).sqrt());
    }

    pub fn subtract_bias(
        &mut self,
        params: &ReductionParams,
        library: &dyn CalibrationLibrary,
    ) -> Result<(), PanaceaError> {
        if params.bias_mult > 0.0 {
            let ctx = &self.header.context;
            let bias = library.master_bias(&ctx.specid, &ctx.amp)?;
            check_shape(&self.image, &bias, "master bias")?;
            self.image -= bias * params.bias_mult;
        }
        Ok(())
    }

    pub fn subtract_dark(
        &mut self,
        params: &ReductionParams,
        library: &dyn CalibrationLibrary,
    ) -> Result<(), PanaceaError> {
        if params.dark_mult > 0.0 {
            let ctx = &self.header.context;
            let dark = library.master_dark(&ctx.specid, &ctx.amp)?;
            check_shape(&self.image, &dark, "master dark")?;
            self.image -= dark * params.dark_mult;
        }
        Ok(())
    }

    pub fn divide_pixelflat(
        &mut self,
        params: &ReductionParams,
        library: &dyn CalibrationLibrary,
    ) -> Result<(), PanaceaError> {
        if params.use_pixelflat {
            let ctx = &self.header.context;
            let flat = library.pixel_flat(&ctx.specid, &ctx.amp)?;
            apply_pixelflat(&mut self.image, &mut self.error, &flat)?;
        }
        Ok(())
    }

    /// Rotate the frame by 180° for amplifiers read out red to blue.
    pub fn orient_image(&mut self) {
        if FLIPPED_AMPS.contains(&self.header.context.amp.as_str()) {
            self.image = rotate_half_turn(&self.image);
            self.error = rotate_half_turn(&self.error);
        }
    }

    /// Run the full preparation sequence once.
    ///
    /// Arguments
    /// -----------------
    /// * `params`: Bias/dark multipliers and the pixel-flat switch.
    /// * `library`: Source of the master bias, dark and pixel-flat frames.
    ///
    /// Return
    /// ----------
    /// * `Ok(())` once the frame is prepared (immediately if it already was).
    /// * A [`PanaceaError`] if a master frame is missing or has the wrong shape.
    pub fn prepare_image(
        &mut self,
        params: &ReductionParams,
        library: &dyn CalibrationLibrary,
    ) -> Result<(), PanaceaError> {
        if self.prepared {
            return Ok(());
        }
        self.subtract_overscan()?;
        self.trim_image()?;
        self.multiply_gain();
        self.calculate_photon_noise();
        self.subtract_bias(params, library)?;
        self.subtract_dark(params, library)?;
        self.divide_pixelflat(params, library)?;
        self.orient_image();
        self.prepared = true;
        info!(
            amp = %self.label(),
            rows = self.rows(),
            cols = self.cols(),
            "image prepared"
        );
        Ok(())
    }
}
