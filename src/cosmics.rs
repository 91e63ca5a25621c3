//! Cosmic-ray masking hook.
//!
//! The detection algorithm itself lives outside this crate. A [`CosmicRayMasker`]
//! receives the sky-subtracted image and the read noise and returns a mask of the same
//! shape, `true` on pixels to exclude from extraction.
use nalgebra::DMatrix;

use crate::{
    biweight::{biweight_location, biweight_scale},
    panacea_errors::PanaceaError,
};

pub trait CosmicRayMasker {
    fn mask(&self, image: &DMatrix<f64>, rdnoise: f64) -> Result<DMatrix<bool>, PanaceaError>;
}

impl<F> CosmicRayMasker for F
where
    F: Fn(&DMatrix<f64>, f64) -> Result<DMatrix<bool>, PanaceaError>,
{
    fn mask(&self, image: &DMatrix<f64>, rdnoise: f64) -> Result<DMatrix<bool>, PanaceaError> {
        self(image, rdnoise)
    }
}

/// Mask of pixels more than `nsigma` noise sigmas above the biweight background.
///
/// The noise is the larger of the read noise and the biweight scale of the image, so
/// photon noise left in the residual does not trip the cut. A crude stand-in for a
/// real detector, useful in tests and quick looks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdMasker {
    pub nsigma: f64,
}

impl CosmicRayMasker for ThresholdMasker {
    fn mask(&self, image: &DMatrix<f64>, rdnoise: f64) -> Result<DMatrix<bool>, PanaceaError> {
        if rdnoise <= 0.0 {
            return Err(PanaceaError::InvalidParameter(format!(
                "read noise must be positive to threshold cosmics, got {rdnoise}"
            )));
        }
        let background = biweight_location(image.as_slice()).unwrap_or(0.0);
        let spread = biweight_scale(image.as_slice()).unwrap_or(0.0);
        let cut = background + self.nsigma * rdnoise.max(spread);
        Ok(image.map(|v| v > cut))
    }
}
