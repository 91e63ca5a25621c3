//! Typed fiber properties and their transfer between fibers.
//!
//! A [`FiberProperty`] names one attribute of a [`Fiber`]. Properties are transferred in
//! two ways:
//!
//! * [`Fiber::copy_property`] – verbatim copy between fibers of the same amplifier
//!   (dead-fiber fill).
//! * [`Fiber::convert_property`] – load from a record measured on a possibly different
//!   binning. The fiber-model column-group centres are rescaled by the column ratio,
//!   `Trace` and `FiberToFiber` are resampled on fractional column position, every
//!   other property is evaluated from `u = column / D` and copied as is.
use std::fmt;

use crate::{fiber::Fiber, polynomial::interp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FiberProperty {
    Trace,
    FibModel,
    WavePoly,
    Wavelength,
    Spectrum,
    FiberToFiber,
    SkySpectrum,
    Continuum,
    Dead,
}

impl FiberProperty {
    /// Calibration products reused by science frames.
    pub const CALIBRATION: [FiberProperty; 5] = [
        FiberProperty::Trace,
        FiberProperty::FibModel,
        FiberProperty::WavePoly,
        FiberProperty::FiberToFiber,
        FiberProperty::Dead,
    ];

    pub const ALL: [FiberProperty; 9] = [
        FiberProperty::Trace,
        FiberProperty::FibModel,
        FiberProperty::WavePoly,
        FiberProperty::Wavelength,
        FiberProperty::Spectrum,
        FiberProperty::FiberToFiber,
        FiberProperty::SkySpectrum,
        FiberProperty::Continuum,
        FiberProperty::Dead,
    ];
}

impl fmt::Display for FiberProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FiberProperty::Trace => "trace",
            FiberProperty::FibModel => "fibmodel",
            FiberProperty::WavePoly => "wave_polyvals",
            FiberProperty::Wavelength => "wavelength",
            FiberProperty::Spectrum => "spectrum",
            FiberProperty::FiberToFiber => "fiber_to_fiber",
            FiberProperty::SkySpectrum => "sky_spectrum",
            FiberProperty::Continuum => "continuum",
            FiberProperty::Dead => "dead",
        };
        write!(f, "{name}")
    }
}

/// Resample `values`, tabulated on `0..values.len()` columns, onto `columns` columns
/// by fractional position.
pub fn resample_columns(values: &[f64], columns: usize) -> Vec<f64> {
    let src = values.len() as f64;
    let xp: Vec<f64> = (0..values.len()).map(|c| c as f64 / src).collect();
    let d = columns as f64;
    (0..columns)
        .map(|c| interp(c as f64 / d, &xp, values))
        .collect()
}

impl Fiber {
    /// `true` when `prop` holds a value on this fiber.
    pub fn has_property(&self, prop: FiberProperty) -> bool {
        match prop {
            FiberProperty::Trace => self.trace.is_some(),
            FiberProperty::FibModel => self.fibmodel.is_some(),
            FiberProperty::WavePoly => self.wave_poly.is_some(),
            FiberProperty::Wavelength => self.wavelength.is_some(),
            FiberProperty::Spectrum => self.spectrum.is_some(),
            FiberProperty::FiberToFiber => self.fiber_to_fiber.is_some(),
            FiberProperty::SkySpectrum => self.sky_spectrum.is_some(),
            FiberProperty::Continuum => self.continuum.is_some(),
            FiberProperty::Dead => true,
        }
    }

    /// Copy `prop` verbatim from `src`.
    ///
    /// Copying the trace also copies the matched centroids and the trace polynomial.
    pub fn copy_property(&mut self, src: &Fiber, prop: FiberProperty) {
        match prop {
            FiberProperty::Trace => {
                self.trace = src.trace.clone();
                self.trace_observed = src.trace_observed.clone();
                self.trace_poly = src.trace_poly.clone();
            }
            FiberProperty::FibModel => self.fibmodel = src.fibmodel.clone(),
            FiberProperty::WavePoly => {
                self.wave_poly = src.wave_poly.clone();
                self.wavelength = src.wavelength.clone();
            }
            FiberProperty::Wavelength => self.wavelength = src.wavelength.clone(),
            FiberProperty::Spectrum => self.spectrum = src.spectrum.clone(),
            FiberProperty::FiberToFiber => self.fiber_to_fiber = src.fiber_to_fiber.clone(),
            FiberProperty::SkySpectrum => self.sky_spectrum = src.sky_spectrum.clone(),
            FiberProperty::Continuum => self.continuum = src.continuum.clone(),
            FiberProperty::Dead => self.dead = src.dead,
        }
    }

    /// Load `prop` from `record`, converting between binnings when needed.
    ///
    /// Return
    /// ----------
    /// * `false` if `record` does not hold the property; this fiber is then left untouched.
    pub fn convert_property(&mut self, record: &Fiber, prop: FiberProperty) -> bool {
        if !record.has_property(prop) {
            return false;
        }
        let same_binning = record.columns == self.columns;
        match prop {
            FiberProperty::Trace => {
                if let Some(trace) = &record.trace {
                    self.trace = Some(if same_binning {
                        trace.clone()
                    } else {
                        resample_columns(trace, self.columns)
                    });
                }
                self.trace_poly = record.trace_poly.clone();
                self.trace_observed = if same_binning {
                    record.trace_observed.clone()
                } else {
                    vec![None; self.columns]
                };
            }
            FiberProperty::FiberToFiber => {
                if let Some(ftf) = &record.fiber_to_fiber {
                    self.fiber_to_fiber = Some(if same_binning {
                        ftf.clone()
                    } else {
                        resample_columns(ftf, self.columns)
                    });
                }
            }
            FiberProperty::FibModel => {
                if let Some(model) = &record.fibmodel {
                    let mut model = model.clone();
                    if !same_binning {
                        let ratio = self.columns as f64 / record.columns as f64;
                        model.fibmodel_x.iter_mut().for_each(|x| *x *= ratio);
                    }
                    model.evaluate(self.columns);
                    self.fibmodel = Some(model);
                }
            }
            FiberProperty::WavePoly => {
                self.wave_poly = record.wave_poly.clone();
                self.eval_wave_poly();
            }
            FiberProperty::Wavelength => self.wavelength = record.wavelength.clone(),
            FiberProperty::Spectrum => self.spectrum = record.spectrum.clone(),
            FiberProperty::SkySpectrum => self.sky_spectrum = record.sky_spectrum.clone(),
            FiberProperty::Continuum => self.continuum = record.continuum.clone(),
            FiberProperty::Dead => self.dead = record.dead,
        }
        true
    }
}

#[cfg(test)]
mod property_test {
    use super::*;
    use crate::polynomial::Polynomial;
    use approx::assert_relative_eq;

    #[test]
    fn test_resample_half_binning() {
        let values: Vec<f64> = (0..10).map(|c| 2.0 * c as f64).collect();
        let out = resample_columns(&values, 20);
        assert_eq!(out.len(), 20);
        assert_relative_eq!(out[0], 0.0);
        assert_relative_eq!(out[2], 2.0);
        assert_relative_eq!(out[3], 3.0);
    }

    #[test]
    fn test_convert_trace_and_wave() {
        let mut record = Fiber::new(1, 10);
        record.trace = Some((0..10).map(|c| 100.0 + c as f64).collect());
        record.wave_poly = Some(Polynomial::new(vec![3500.0, 2000.0]));

        let mut fiber = Fiber::new(1, 20);
        assert!(fiber.convert_property(&record, FiberProperty::Trace));
        assert!(fiber.convert_property(&record, FiberProperty::WavePoly));
        assert!(!fiber.convert_property(&record, FiberProperty::Spectrum));

        let trace = fiber.trace.as_ref().unwrap();
        assert_eq!(trace.len(), 20);
        assert_relative_eq!(trace[4], 102.0);
        let wave = fiber.wavelength.as_ref().unwrap();
        assert_relative_eq!(wave[10], 4500.0);
        assert!(fiber.spectrum.is_none());
    }
}
