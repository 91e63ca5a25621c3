//! # Reduction parameters
//!
//! This module defines [`ReductionParams`](crate::params::ReductionParams), the configuration
//! consumed by every stage of an amplifier reduction, and its validating builder.
//!
//! ## Purpose
//!
//! The parameters are plain values: no stage reads global configuration or the
//! environment. A single [`ReductionParams`] instance is handed to the
//! [`Reduction`](crate::pipeline::Reduction) façade, which forwards the relevant
//! fields to each numerical routine.
//!
//! ## Groups of options
//!
//! 1. **Image preparation** – `dark_mult`, `bias_mult`, `use_pixelflat`.
//! 2. **Trace** – `fdist`, `fdist_ref`, `trace_poly_order`, `col_frac`, `mx_cut`,
//!    `use_trace_ref`, `fiber_date`, `calculate_shift`.
//! 3. **Fiber model** – `fibmodel_poly_order`, `use_default_fibmodel`, `fibmodel_nbins`,
//!    `fsize`, `sigma`, `power`, `fiber_group`, `col_group`.
//! 4. **Wavelength** – `wave_nbins`, `wave_order`, `default_fib`, `init_lims`, `wave_res`, `seed`.
//! 5. **Smoothing** – `filt_size_ind`, `filt_size_agg`, `filt_size_final`, `filt_size_sky`,
//!    `cont_smooth`, `cont_ignore_central`.
//! 6. **Products** – `make_residual`, `do_cont_sub`, `make_skyframe`, `refit`.
//!
//! ## Example
//!
//! ```rust
//! use panacea::params::ReductionParams;
//!
//! let params = ReductionParams::builder()
//!     .init_lims(3490.0, 5500.0)
//!     .fdist(2.0)
//!     .fdist_ref(4.0)
//!     .use_trace_ref(true)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(params.wave_nbins, 21);
//! ```
use std::cmp::Ordering::{Equal, Greater};

use crate::panacea_errors::PanaceaError;

/// Configuration of a single amplifier reduction.
///
/// Defaults
/// -----------------
/// The [`Default`] implementation reproduces the settings used for VIRUS twilight
/// and science frames:
///
/// * `dark_mult`: 1.0, `bias_mult`: 0.0, `use_pixelflat`: true
/// * `fdist`: 2.0 px, `fdist_ref`: 4.0 px, `trace_poly_order`: 3, `col_frac`: 0.47, `mx_cut`: 0.1
/// * `fibmodel_poly_order`: 3, `fibmodel_nbins`: 15, `fsize`: 8.0 px, `sigma`: 2.5, `power`: 2.5
/// * `fiber_group`: 8, `col_group`: 48
/// * `wave_nbins`: 21, `wave_order`: 3, `default_fib`: 0, `wave_res`: 1.9 Å, `seed`: 0
/// * `filt_size_ind`: 21, `filt_size_agg`: 51, `filt_size_final`: 51, `filt_size_sky`: 51
/// * `cont_smooth`: 25, `cont_ignore_central`: 7
/// * `make_residual`, `do_cont_sub`, `make_skyframe`: true; `refit`, `calculate_shift`,
///   `use_trace_ref`, `use_default_fibmodel`: false
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionParams {
    // --- Image preparation ---
    pub dark_mult: f64,
    pub bias_mult: f64,
    pub use_pixelflat: bool,

    // --- Trace ---
    /// Maximum centroid jump (px) between neighbouring columns.
    pub fdist: f64,
    /// Maximum distance (px) between a standard position and a centroid at the reference column.
    pub fdist_ref: f64,
    pub trace_poly_order: usize,
    /// Reference column as a fraction of the image width.
    pub col_frac: f64,
    /// Peak detection threshold as a fraction of the column maximum.
    pub mx_cut: f64,
    pub use_trace_ref: bool,
    /// Reference geometry date override (`YYYYMMDD`).
    pub fiber_date: Option<String>,
    pub calculate_shift: bool,

    // --- Fiber model ---
    pub fibmodel_poly_order: usize,
    pub use_default_fibmodel: bool,
    pub fibmodel_nbins: usize,
    /// Half-width (px) of the fiber profile.
    pub fsize: f64,
    pub sigma: f64,
    pub power: f64,
    pub fiber_group: usize,
    /// Number of column groups along the dispersion axis.
    pub col_group: usize,

    // --- Wavelength ---
    pub wave_nbins: usize,
    pub wave_order: usize,
    pub default_fib: usize,
    pub init_lims: Option<(f64, f64)>,
    /// Spectral resolution element (Å), sets the wavelength search step.
    pub wave_res: f64,
    /// Seed of the random generator used to pick a new seed fiber.
    pub seed: u64,

    // --- Smoothing ---
    pub filt_size_ind: usize,
    pub filt_size_agg: usize,
    pub filt_size_final: usize,
    pub filt_size_sky: usize,
    pub cont_smooth: usize,
    pub cont_ignore_central: usize,

    // --- Products ---
    pub make_residual: bool,
    pub do_cont_sub: bool,
    pub make_skyframe: bool,
    /// Recompute calibration products even for science frames.
    pub refit: bool,
}

impl ReductionParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new [`ReductionParamsBuilder`] starting from the defaults.
    pub fn builder() -> ReductionParamsBuilder {
        ReductionParamsBuilder::new()
    }
}

impl Default for ReductionParams {
    fn default() -> Self {
        ReductionParams {
            dark_mult: 1.0,
            bias_mult: 0.0,
            use_pixelflat: true,

            fdist: 2.0,
            fdist_ref: 4.0,
            trace_poly_order: 3,
            col_frac: 0.47,
            mx_cut: 0.1,
            use_trace_ref: false,
            fiber_date: None,
            calculate_shift: false,

            fibmodel_poly_order: 3,
            use_default_fibmodel: false,
            fibmodel_nbins: 15,
            fsize: 8.0,
            sigma: 2.5,
            power: 2.5,
            fiber_group: 8,
            col_group: 48,

            wave_nbins: 21,
            wave_order: 3,
            default_fib: 0,
            init_lims: None,
            wave_res: 1.9,
            seed: 0,

            filt_size_ind: 21,
            filt_size_agg: 51,
            filt_size_final: 51,
            filt_size_sky: 51,
            cont_smooth: 25,
            cont_ignore_central: 7,

            make_residual: true,
            do_cont_sub: true,
            make_skyframe: true,
            refit: false,
        }
    }
}

/// Builder for [`ReductionParams`], with validation.
#[derive(Debug, Clone, Default)]
pub struct ReductionParamsBuilder {
    params: ReductionParams,
}

impl ReductionParamsBuilder {
    pub fn new() -> Self {
        Self {
            params: ReductionParams::default(),
        }
    }

    // --- Image preparation ---
    pub fn dark_mult(mut self, v: f64) -> Self {
        self.params.dark_mult = v;
        self
    }
    pub fn bias_mult(mut self, v: f64) -> Self {
        self.params.bias_mult = v;
        self
    }
    pub fn use_pixelflat(mut self, v: bool) -> Self {
        self.params.use_pixelflat = v;
        self
    }

    // --- Trace ---
    pub fn fdist(mut self, v: f64) -> Self {
        self.params.fdist = v;
        self
    }
    pub fn fdist_ref(mut self, v: f64) -> Self {
        self.params.fdist_ref = v;
        self
    }
    pub fn trace_poly_order(mut self, v: usize) -> Self {
        self.params.trace_poly_order = v;
        self
    }
    pub fn col_frac(mut self, v: f64) -> Self {
        self.params.col_frac = v;
        self
    }
    pub fn mx_cut(mut self, v: f64) -> Self {
        self.params.mx_cut = v;
        self
    }
    pub fn use_trace_ref(mut self, v: bool) -> Self {
        self.params.use_trace_ref = v;
        self
    }
    pub fn fiber_date(mut self, v: impl Into<String>) -> Self {
        self.params.fiber_date = Some(v.into());
        self
    }
    pub fn calculate_shift(mut self, v: bool) -> Self {
        self.params.calculate_shift = v;
        self
    }

    // --- Fiber model ---
    pub fn fibmodel_poly_order(mut self, v: usize) -> Self {
        self.params.fibmodel_poly_order = v;
        self
    }
    pub fn use_default_fibmodel(mut self, v: bool) -> Self {
        self.params.use_default_fibmodel = v;
        self
    }
    pub fn fibmodel_nbins(mut self, v: usize) -> Self {
        self.params.fibmodel_nbins = v;
        self
    }
    pub fn fsize(mut self, v: f64) -> Self {
        self.params.fsize = v;
        self
    }
    pub fn sigma(mut self, v: f64) -> Self {
        self.params.sigma = v;
        self
    }
    pub fn power(mut self, v: f64) -> Self {
        self.params.power = v;
        self
    }
    pub fn fiber_group(mut self, v: usize) -> Self {
        self.params.fiber_group = v;
        self
    }
    pub fn col_group(mut self, v: usize) -> Self {
        self.params.col_group = v;
        self
    }

    // --- Wavelength ---
    pub fn wave_nbins(mut self, v: usize) -> Self {
        self.params.wave_nbins = v;
        self
    }
    pub fn wave_order(mut self, v: usize) -> Self {
        self.params.wave_order = v;
        self
    }
    pub fn default_fib(mut self, v: usize) -> Self {
        self.params.default_fib = v;
        self
    }
    pub fn init_lims(mut self, start: f64, end: f64) -> Self {
        self.params.init_lims = Some((start, end));
        self
    }
    pub fn wave_res(mut self, v: f64) -> Self {
        self.params.wave_res = v;
        self
    }
    pub fn seed(mut self, v: u64) -> Self {
        self.params.seed = v;
        self
    }

    // --- Smoothing ---
    pub fn filt_size_ind(mut self, v: usize) -> Self {
        self.params.filt_size_ind = v;
        self
    }
    pub fn filt_size_agg(mut self, v: usize) -> Self {
        self.params.filt_size_agg = v;
        self
    }
    pub fn filt_size_final(mut self, v: usize) -> Self {
        self.params.filt_size_final = v;
        self
    }
    pub fn filt_size_sky(mut self, v: usize) -> Self {
        self.params.filt_size_sky = v;
        self
    }
    pub fn cont_smooth(mut self, v: usize) -> Self {
        self.params.cont_smooth = v;
        self
    }
    pub fn cont_ignore_central(mut self, v: usize) -> Self {
        self.params.cont_ignore_central = v;
        self
    }

    // --- Products ---
    pub fn make_residual(mut self, v: bool) -> Self {
        self.params.make_residual = v;
        self
    }
    pub fn do_cont_sub(mut self, v: bool) -> Self {
        self.params.do_cont_sub = v;
        self
    }
    pub fn make_skyframe(mut self, v: bool) -> Self {
        self.params.make_skyframe = v;
        self
    }
    pub fn refit(mut self, v: bool) -> Self {
        self.params.refit = v;
        self
    }

    /// Return true iff x > 0.0 and comparable (i.e., not NaN).
    #[inline]
    fn gt0(x: f64) -> bool {
        x.partial_cmp(&0.0) == Some(Greater)
    }

    /// Return true iff x >= 0.0 and comparable (i.e., not NaN).
    #[inline]
    fn ge0(x: f64) -> bool {
        matches!(x.partial_cmp(&0.0), Some(Greater) | Some(Equal))
    }

    /// Finalize the builder and produce a [`ReductionParams`] instance.
    ///
    /// Validation rules
    /// -----------------
    /// * `dark_mult >= 0`, `bias_mult >= 0`.
    /// * `0 < fdist <= fdist_ref`.
    /// * `0 <= col_frac <= 1`, `0 < mx_cut < 1`.
    /// * `fsize > 0`, `sigma > 0`, `power > 0`, `fibmodel_nbins >= 2`.
    /// * `fiber_group >= 1`, `col_group >= 1`.
    /// * `wave_nbins > wave_order`, `wave_res > 0`, `init_lims` strictly increasing.
    /// * every filter window `>= 1`.
    ///
    /// Returns
    /// -----------------
    /// * `Ok(ReductionParams)` when all rules hold.
    /// * `Err(PanaceaError::InvalidParameter)` naming the first rule that fails.
    pub fn build(self) -> Result<ReductionParams, PanaceaError> {
        let p = &self.params;

        if !Self::ge0(p.dark_mult) || !Self::ge0(p.bias_mult) {
            return Err(PanaceaError::InvalidParameter(
                "dark_mult and bias_mult must be non-negative".into(),
            ));
        }
        if !Self::gt0(p.fdist) || !Self::gt0(p.fdist_ref) {
            return Err(PanaceaError::InvalidParameter(
                "fdist and fdist_ref must be > 0".into(),
            ));
        }
        if p.fdist > p.fdist_ref {
            return Err(PanaceaError::InvalidParameter(
                "fdist must not exceed fdist_ref".into(),
            ));
        }
        if !(0.0..=1.0).contains(&p.col_frac) {
            return Err(PanaceaError::InvalidParameter(
                "col_frac must lie in [0, 1]".into(),
            ));
        }
        if !Self::gt0(p.mx_cut) || p.mx_cut >= 1.0 {
            return Err(PanaceaError::InvalidParameter(
                "mx_cut must lie in (0, 1)".into(),
            ));
        }
        if !Self::gt0(p.fsize) || !Self::gt0(p.sigma) || !Self::gt0(p.power) {
            return Err(PanaceaError::InvalidParameter(
                "fsize, sigma and power must be > 0".into(),
            ));
        }
        if p.fibmodel_nbins < 2 {
            return Err(PanaceaError::InvalidParameter(
                "fibmodel_nbins must be >= 2".into(),
            ));
        }
        if p.fiber_group == 0 || p.col_group == 0 {
            return Err(PanaceaError::InvalidParameter(
                "fiber_group and col_group must be >= 1".into(),
            ));
        }
        if p.wave_nbins <= p.wave_order {
            return Err(PanaceaError::InvalidParameter(
                "wave_nbins must exceed wave_order".into(),
            ));
        }
        if !Self::gt0(p.wave_res) {
            return Err(PanaceaError::InvalidParameter(
                "wave_res must be > 0".into(),
            ));
        }
        if let Some((lo, hi)) = p.init_lims {
            if lo.partial_cmp(&hi) != Some(std::cmp::Ordering::Less) {
                return Err(PanaceaError::InvalidParameter(
                    "init_lims must be strictly increasing".into(),
                ));
            }
        }
        let windows = [
            p.filt_size_ind,
            p.filt_size_agg,
            p.filt_size_final,
            p.filt_size_sky,
            p.cont_smooth,
        ];
        if windows.iter().any(|&w| w == 0) {
            return Err(PanaceaError::InvalidParameter(
                "filter windows must be >= 1".into(),
            ));
        }

        Ok(self.params)
    }
}

#[cfg(test)]
mod params_test {
    use super::*;

    #[test]
    fn test_default_build() {
        let params = ReductionParams::builder().build().unwrap();
        assert_eq!(params, ReductionParams::default());
        assert_eq!(params.col_group, 48);
        assert_eq!(params.fibmodel_nbins, 15);
        assert!(params.init_lims.is_none());
    }

    #[test]
    fn test_invalid_tolerances() {
        let err = ReductionParams::builder()
            .fdist(5.0)
            .fdist_ref(4.0)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            PanaceaError::InvalidParameter("fdist must not exceed fdist_ref".into())
        );

        let err = ReductionParams::builder()
            .init_lims(5500.0, 3500.0)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            PanaceaError::InvalidParameter("init_lims must be strictly increasing".into())
        );

        assert!(ReductionParams::builder().wave_nbins(3).build().is_err());
        assert!(ReductionParams::builder().col_frac(f64::NAN).build().is_err());
    }
}
