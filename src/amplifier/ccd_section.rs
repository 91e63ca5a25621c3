//! CCD section strings (`"[x1:x2,y1:y2]"`).
//!
//! Header sections follow the FITS convention: 1-based, inclusive on both ends, `x`
//! along columns and `y` along rows. [`CcdSection`] stores the equivalent 0-based,
//! half-open ranges so it can slice a [`DMatrix`] directly.
use std::{fmt, str::FromStr};

use nalgebra::DMatrix;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::panacea_errors::PanaceaError;

static SECTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\[\s*(\d+)\s*:\s*(\d+)\s*,\s*(\d+)\s*:\s*(\d+)\s*\]\s*$")
        .expect("static section regex")
});

/// Rectangular detector region, 0-based half-open (`x0..x1` columns, `y0..y1` rows).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcdSection {
    pub x0: usize,
    pub x1: usize,
    pub y0: usize,
    pub y1: usize,
}

impl CcdSection {
    pub fn rows(&self) -> usize {
        self.y1 - self.y0
    }

    pub fn cols(&self) -> usize {
        self.x1 - self.x0
    }

    /// Check that the section fits inside an image of shape `(nrows, ncols)`.
    pub fn fits_in(&self, nrows: usize, ncols: usize) -> bool {
        self.y1 <= nrows && self.x1 <= ncols
    }

    /// Copy the section out of `image`.
    ///
    /// Return
    /// ----------
    /// * The sub-image, or [`PanaceaError::ShapeMismatch`] when the section exceeds the image.
    pub fn extract(&self, image: &DMatrix<f64>) -> Result<DMatrix<f64>, PanaceaError> {
        if !self.fits_in(image.nrows(), image.ncols()) {
            return Err(PanaceaError::ShapeMismatch {
                expected: (self.y1, self.x1),
                found: image.shape(),
                context: format!("section {self} outside image"),
            });
        }
        Ok(image
            .view((self.y0, self.x0), (self.rows(), self.cols()))
            .into_owned())
    }
}

impl FromStr for CcdSection {
    type Err = PanaceaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = SECTION_RE
            .captures(s)
            .ok_or_else(|| PanaceaError::InvalidSection(s.to_string()))?;

        let mut v = [0usize; 4];
        for (k, slot) in v.iter_mut().enumerate() {
            *slot = caps[k + 1]
                .parse()
                .map_err(|_| PanaceaError::InvalidSection(s.to_string()))?;
        }
        let [x1, x2, y1, y2] = v;
        if x1 == 0 || y1 == 0 || x2 < x1 || y2 < y1 {
            return Err(PanaceaError::InvalidSection(s.to_string()));
        }

        Ok(CcdSection {
            x0: x1 - 1,
            x1: x2,
            y0: y1 - 1,
            y1: y2,
        })
    }
}

impl fmt::Display for CcdSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{},{}:{}]", self.x0 + 1, self.x1, self.y0 + 1, self.y1)
    }
}
