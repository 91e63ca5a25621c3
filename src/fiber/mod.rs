//! # Fiber
//!
//! Per-fiber reduction state: trace, fiber model, wavelength solution, extracted
//! spectrum, throughput and sky/continuum models, plus the `dead` flag.
//!
//! Every per-column attribute is `None` until the stage that produces it has run (or
//! it has been loaded from a calibration store). A [`Fiber`] is identified by its
//! 1-based `fibnum`, which is also its position in the
//! [`FiberRegistry`](crate::fiber::registry::FiberRegistry).
//!
//! Polynomial attributes (`trace_poly`, `wave_poly`, the fiber-model bin polynomials)
//! are expressed in `u = column / columns` and can be re-evaluated on any binning.
pub mod property;
pub mod registry;

use serde::{Deserialize, Serialize};

use crate::{
    constants::FiberNumber, fibermodel::FiberModel, panacea_errors::PanaceaError,
    polynomial::Polynomial,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fiber {
    pub fibnum: FiberNumber,
    /// Number of columns (D) of the amplifier this fiber was measured on.
    pub columns: usize,
    pub dead: bool,
    /// Centroids matched during the trace walk; `None` where no centroid was matched.
    pub trace_observed: Vec<Option<f64>>,
    pub trace: Option<Vec<f64>>,
    pub trace_poly: Option<Polynomial>,
    pub fibmodel: Option<FiberModel>,
    pub wave_poly: Option<Polynomial>,
    pub wavelength: Option<Vec<f64>>,
    pub spectrum: Option<Vec<f64>>,
    pub fiber_to_fiber: Option<Vec<f64>>,
    pub sky_spectrum: Option<Vec<f64>>,
    pub continuum: Option<Vec<f64>>,
}

impl Fiber {
    pub fn new(fibnum: FiberNumber, columns: usize) -> Self {
        Fiber {
            fibnum,
            columns,
            dead: false,
            trace_observed: vec![None; columns],
            trace: None,
            trace_poly: None,
            fibmodel: None,
            wave_poly: None,
            wavelength: None,
            spectrum: None,
            fiber_to_fiber: None,
            sky_spectrum: None,
            continuum: None,
        }
    }

    /// Forget any previous trace measurement.
    pub fn init_trace_info(&mut self) {
        self.dead = false;
        self.trace_observed = vec![None; self.columns];
        self.trace = None;
        self.trace_poly = None;
    }

    /// Number of columns with a matched centroid.
    pub fn n_observed(&self) -> usize {
        self.trace_observed.iter().filter(|v| v.is_some()).count()
    }

    /// `true` when every column has a matched centroid.
    pub fn is_trace_complete(&self) -> bool {
        self.trace_observed.iter().all(Option::is_some)
    }

    /// Fit the trace polynomial to the matched centroids.
    ///
    /// Return
    /// ----------
    /// * [`PanaceaError::SingularSystem`] when no column has a centroid.
    pub fn fit_trace_poly(&mut self, order: usize) -> Result<(), PanaceaError> {
        let d = self.columns as f64;
        let (x, y): (Vec<f64>, Vec<f64>) = self
            .trace_observed
            .iter()
            .enumerate()
            .filter_map(|(c, v)| v.map(|y| (c as f64 / d, y)))
            .unzip();
        self.trace_poly = Some(Polynomial::fit(&x, &y, order)?);
        Ok(())
    }

    /// Evaluate the trace polynomial at every column.
    pub fn eval_trace_poly(&mut self) {
        if let Some(poly) = &self.trace_poly {
            self.trace = Some(poly.eval_columns(self.columns));
        }
    }

    /// Evaluate the wavelength polynomial at every column.
    pub fn eval_wave_poly(&mut self) {
        if let Some(poly) = &self.wave_poly {
            self.wavelength = Some(poly.eval_columns(self.columns));
        }
    }

    /// Evaluate the fiber-model bin polynomials at every column.
    pub fn eval_fibmodel_poly(&mut self) {
        if let Some(model) = &mut self.fibmodel {
            model.evaluate(self.columns);
        }
    }

    /// Re-evaluate every polynomial attribute after a load.
    pub fn evaluate_all(&mut self) {
        self.eval_fibmodel_poly();
        self.eval_wave_poly();
    }

    /// Borrow the trace, or fail naming the fiber.
    pub fn trace_values(&self) -> Result<&[f64], PanaceaError> {
        self.trace
            .as_deref()
            .ok_or_else(|| {
                PanaceaError::MissingStageOutput(format!("trace of fiber {}", self.fibnum))
            })
    }

    /// Borrow the extracted spectrum, or fail naming the fiber.
    pub fn spectrum_values(&self) -> Result<&[f64], PanaceaError> {
        self.spectrum.as_deref().ok_or_else(|| {
            PanaceaError::MissingStageOutput(format!("spectrum of fiber {}", self.fibnum))
        })
    }

    /// Borrow the wavelength array, or fail naming the fiber.
    pub fn wavelength_values(&self) -> Result<&[f64], PanaceaError> {
        self.wavelength.as_deref().ok_or_else(|| {
            PanaceaError::MissingStageOutput(format!("wavelength of fiber {}", self.fibnum))
        })
    }

    /// Borrow the fiber-to-fiber ratio, or fail naming the fiber.
    pub fn fiber_to_fiber_values(&self) -> Result<&[f64], PanaceaError> {
        self.fiber_to_fiber.as_deref().ok_or_else(|| {
            PanaceaError::MissingStageOutput(format!("fiber_to_fiber of fiber {}", self.fibnum))
        })
    }

    /// Borrow the fiber model, or fail naming the fiber.
    pub fn model(&self) -> Result<&FiberModel, PanaceaError> {
        self.fibmodel.as_ref().ok_or_else(|| {
            PanaceaError::MissingStageOutput(format!("fiber model of fiber {}", self.fibnum))
        })
    }
}
