//! # Reduction pipeline
//!
//! [`Reduction`] is the façade that wires the components together for one amplifier:
//! it owns the [`Amplifier`], the parameters, the shared calibration library and the
//! optional calibration (`calpath`) and sky (`skypath`) stores.
//!
//! ## Stage graph
//!
//! Every step is a [`Stage`] with a fixed list of prerequisites:
//!
//! ```text
//! Prepare → Trace → FiberModel → Extract → Wavelength → FiberToFiber → SkySubtraction
//! ```
//!
//! [`Reduction::run`] runs the missing prerequisites of a stage first, then the stage
//! itself, and records it as completed. Re-running a completed stage is a no-op;
//! [`Reduction::invalidate`] forgets a stage and everything downstream of it.
//!
//! ## Compute or load
//!
//! Twilight frames, or any frame with `refit`, compute trace, fiber model, wavelength
//! solution and fiber-to-fiber. Other frames load them from `calpath`, with the binning
//! conversion of [`Fiber::convert_property`](crate::fiber::Fiber::convert_property).
//! Extraction and sky subtraction always run on the frame itself.
use std::{collections::BTreeSet, fmt, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    amplifier::{Amplifier, ObservationType},
    calibration::{library::CalibrationLibrary, read_ordered, CalibrationStore},
    cosmics::CosmicRayMasker,
    extraction::extract_spectra,
    fiber::{property::FiberProperty, registry::FiberRegistry},
    fibermodel::fit_fibermodels,
    normalization::fiber_to_fiber,
    panacea_errors::PanaceaError,
    params::ReductionParams,
    sky::sky_subtraction,
    trace::{
        find_shift, find_traces, reference_positions, summary::TraceSummary, TraceReport,
        TraceShift,
    },
    wavelength::calibrate_wavelengths,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Prepare,
    Trace,
    FiberModel,
    Extract,
    Wavelength,
    FiberToFiber,
    SkySubtraction,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Prepare,
        Stage::Trace,
        Stage::FiberModel,
        Stage::Extract,
        Stage::Wavelength,
        Stage::FiberToFiber,
        Stage::SkySubtraction,
    ];

    /// Direct prerequisites.
    pub fn prerequisites(self) -> &'static [Stage] {
        match self {
            Stage::Prepare => &[],
            Stage::Trace => &[Stage::Prepare],
            Stage::FiberModel => &[Stage::Trace],
            Stage::Extract => &[Stage::FiberModel],
            Stage::Wavelength => &[Stage::Extract],
            Stage::FiberToFiber => &[Stage::Wavelength],
            Stage::SkySubtraction => &[Stage::FiberToFiber],
        }
    }

    /// Whether `self` depends, directly or not, on `other`.
    pub fn requires(self, other: Stage) -> bool {
        self.prerequisites()
            .iter()
            .any(|&p| p == other || p.requires(other))
    }

    /// Stages that depend on `self`.
    pub fn dependents(self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| s.requires(self))
            .collect()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Prepare => "prepare",
            Stage::Trace => "trace",
            Stage::FiberModel => "fibermodel",
            Stage::Extract => "extract",
            Stage::Wavelength => "wavelength",
            Stage::FiberToFiber => "fiber_to_fiber",
            Stage::SkySubtraction => "sky_subtraction",
        };
        write!(f, "{name}")
    }
}

/// Reduction of one amplifier.
pub struct Reduction {
    amp: Amplifier,
    params: ReductionParams,
    library: Arc<dyn CalibrationLibrary>,
    calpath: Option<Arc<dyn CalibrationStore>>,
    skypath: Option<Arc<dyn CalibrationStore>>,
    completed: BTreeSet<Stage>,
    trace_report: Option<TraceReport>,
    trace_shift: Option<TraceShift>,
}

impl fmt::Debug for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reduction")
            .field("amp", &self.amp.label())
            .field("completed", &self.completed)
            .field("calpath", &self.calpath.is_some())
            .field("skypath", &self.skypath.is_some())
            .finish()
    }
}

impl Reduction {
    pub fn new(
        amp: Amplifier,
        params: ReductionParams,
        library: Arc<dyn CalibrationLibrary>,
    ) -> Self {
        Reduction {
            amp,
            params,
            library,
            calpath: None,
            skypath: None,
            completed: BTreeSet::new(),
            trace_report: None,
            trace_shift: None,
        }
    }

    /// Store holding the calibration fibers of a prior twilight reduction.
    pub fn with_calpath(mut self, store: Arc<dyn CalibrationStore>) -> Self {
        self.calpath = Some(store);
        self
    }

    /// Store holding the sky spectra of a prior science reduction.
    pub fn with_skypath(mut self, store: Arc<dyn CalibrationStore>) -> Self {
        self.skypath = Some(store);
        self
    }

    pub fn amplifier(&self) -> &Amplifier {
        &self.amp
    }

    pub fn into_amplifier(self) -> Amplifier {
        self.amp
    }

    pub fn fibers(&self) -> &FiberRegistry {
        &self.amp.fibers
    }

    pub fn params(&self) -> &ReductionParams {
        &self.params
    }

    pub fn trace_report(&self) -> Option<&TraceReport> {
        self.trace_report.as_ref()
    }

    pub fn trace_shift(&self) -> Option<&TraceShift> {
        self.trace_shift.as_ref()
    }

    pub fn is_complete(&self, stage: Stage) -> bool {
        self.completed.contains(&stage)
    }

    /// Whether calibration products are computed from this frame.
    pub fn computes_calibration(&self) -> bool {
        self.params.refit || self.amp.header.obs_type == ObservationType::Twilight
    }

    /// Run `stage` and any missing prerequisite.
    ///
    /// Prerequisites are checked even when `stage` itself is complete: stages marked by
    /// a load may sit downstream of stages that never ran on this frame.
    pub fn run(&mut self, stage: Stage) -> Result<(), PanaceaError> {
        for &pre in stage.prerequisites() {
            self.run(pre)?;
        }
        if self.completed.contains(&stage) {
            return Ok(());
        }
        debug!(amp = %self.amp.label(), %stage, "running stage");
        self.execute(stage)?;
        self.completed.insert(stage);
        Ok(())
    }

    /// Run the full reduction: up to fiber-to-fiber for twilight frames, up to sky
    /// subtraction otherwise.
    pub fn reduce(&mut self) -> Result<(), PanaceaError> {
        let last = if self.amp.header.obs_type == ObservationType::Twilight {
            Stage::FiberToFiber
        } else {
            Stage::SkySubtraction
        };
        self.run(last)
    }

    /// Forget `stage` and every stage depending on it.
    pub fn invalidate(&mut self, stage: Stage) {
        self.completed.remove(&stage);
        for dep in stage.dependents() {
            self.completed.remove(&dep);
        }
    }

    fn calpath(&self) -> Result<Arc<dyn CalibrationStore>, PanaceaError> {
        self.calpath.clone().ok_or_else(|| {
            PanaceaError::MissingCalibration(format!(
                "no calibration store for {}",
                self.amp.label()
            ))
        })
    }

    /// Load `props` from the calibration store; an empty store is an error.
    fn load_from_calpath(&mut self, props: &[FiberProperty]) -> Result<usize, PanaceaError> {
        let store = self.calpath()?;
        let n = self
            .amp
            .fibers
            .load_properties(store.as_ref(), &self.amp.header.context, props)?;
        if n == 0 {
            return Err(PanaceaError::MissingCalibration(format!(
                "no calibration fiber for {}",
                self.amp.header.context
            )));
        }
        Ok(n)
    }

    fn reference_geometry(&self) -> Result<Option<Vec<f64>>, PanaceaError> {
        if !self.params.use_trace_ref {
            return Ok(None);
        }
        reference_positions(
            self.library.as_ref(),
            &self.amp.header.context,
            self.amp.header.date,
            self.params.fiber_date.as_deref(),
        )
        .map(Some)
    }

    fn execute(&mut self, stage: Stage) -> Result<(), PanaceaError> {
        match stage {
            Stage::Prepare => self.amp.prepare_image(&self.params, self.library.as_ref()),
            Stage::Trace => self.trace(),
            Stage::FiberModel => {
                if self.computes_calibration() {
                    fit_fibermodels(
                        &self.amp.image,
                        self.amp.mask.as_ref(),
                        &mut self.amp.fibers,
                        &self.params,
                    )
                } else {
                    self.load_from_calpath(&[FiberProperty::FibModel]).map(|_| ())
                }
            }
            Stage::Extract => {
                let spectra = extract_spectra(
                    &self.amp.image,
                    self.amp.mask.as_ref(),
                    &self.amp.fibers,
                    self.params.fsize,
                    None,
                )?;
                for (fiber, spectrum) in self.amp.fibers.iter_mut().zip(spectra) {
                    fiber.spectrum = Some(spectrum);
                }
                info!(amp = %self.amp.label(), fibers = self.amp.fibers.len(), "spectra extracted");
                Ok(())
            }
            Stage::Wavelength => {
                if self.computes_calibration() {
                    let (wave, flux) = self.library.reference_spectrum()?;
                    let report = calibrate_wavelengths(
                        &mut self.amp.fibers,
                        (wave.as_slice(), flux.as_slice()),
                        &self.params,
                    )?;
                    self.amp.masters.normalized = Some(report.master);
                    Ok(())
                } else {
                    self.load_from_calpath(&[FiberProperty::WavePoly]).map(|_| ())
                }
            }
            Stage::FiberToFiber => {
                if self.computes_calibration() {
                    let master = fiber_to_fiber(&mut self.amp.fibers, &self.params)?;
                    self.amp.masters.average = Some(master);
                    Ok(())
                } else {
                    self.load_from_calpath(&[FiberProperty::FiberToFiber]).map(|_| ())
                }
            }
            Stage::SkySubtraction => {
                let sky_loaded = self.load_sky();
                let result = sky_subtraction(
                    &self.amp.image,
                    &mut self.amp.fibers,
                    &self.params,
                    sky_loaded,
                )?;
                if let Some(master) = result.master {
                    self.amp.masters.sky = Some(master);
                }
                self.amp.products = result.products;
                Ok(())
            }
        }
    }

    fn trace(&mut self) -> Result<(), PanaceaError> {
        let reference = self.reference_geometry()?;
        if self.computes_calibration() {
            let report = find_traces(
                &self.amp.image,
                &mut self.amp.fibers,
                &self.params,
                reference.as_deref(),
            )?;
            self.trace_report = Some(report);
            return Ok(());
        }

        if self.params.calculate_shift {
            let store = self.calpath()?;
            let mut measured = FiberRegistry::new(self.amp.cols());
            find_traces(&self.amp.image, &mut measured, &self.params, reference.as_deref())?;
            let records = read_ordered(store.as_ref(), &self.amp.header.context)?;
            self.trace_shift = find_shift(&measured, &records)?;
        }
        self.load_from_calpath(&[FiberProperty::Trace, FiberProperty::Dead])?;
        if let Some(shift) = &self.trace_shift {
            shift.apply(&mut self.amp.fibers);
            debug!(net = shift.net, "calibration traces shifted");
        }
        Ok(())
    }

    /// Copy sky spectra from `skypath` when it holds one per fiber.
    fn load_sky(&mut self) -> bool {
        let Some(store) = self.skypath.clone() else {
            return false;
        };
        let mut scratch = FiberRegistry::new(self.amp.cols());
        let loaded = scratch.load_properties(
            store.as_ref(),
            &self.amp.header.context,
            &[FiberProperty::SkySpectrum],
        );
        let usable = matches!(loaded, Ok(n) if n == self.amp.fibers.len())
            && scratch.iter().all(|f| f.sky_spectrum.is_some());
        if !usable {
            warn!(
                amp = %self.amp.label(),
                "could not load sky spectra from skypath; computing the master sky instead"
            );
            self.skypath = None;
            return false;
        }
        for (fiber, record) in self.amp.fibers.iter_mut().zip(scratch.iter()) {
            fiber.convert_property(record, FiberProperty::SkySpectrum);
        }
        true
    }

    /// Re-extract only `cols`; other columns keep their current values.
    ///
    /// Stages downstream of the extraction are invalidated.
    pub fn extract_columns(&mut self, cols: &[usize]) -> Result<(), PanaceaError> {
        self.run(Stage::FiberModel)?;
        let spectra = extract_spectra(
            &self.amp.image,
            self.amp.mask.as_ref(),
            &self.amp.fibers,
            self.params.fsize,
            Some(cols),
        )?;
        let d = self.amp.cols();
        for (fiber, fresh) in self.amp.fibers.iter_mut().zip(spectra) {
            let spectrum = fiber.spectrum.get_or_insert_with(|| vec![0.0; d]);
            for &c in cols.iter().filter(|&&c| c < d) {
                spectrum[c] = fresh[c];
            }
        }
        for dep in Stage::Extract.dependents() {
            self.completed.remove(&dep);
        }
        Ok(())
    }

    /// Mask cosmic rays on the sky-subtracted image and invalidate the extraction.
    ///
    /// The next [`run`](Reduction::run) of an extraction-dependent stage excludes the
    /// masked pixels.
    pub fn clean_cosmics(&mut self, masker: &dyn CosmicRayMasker) -> Result<(), PanaceaError> {
        self.run(Stage::SkySubtraction)?;
        let clean = self.amp.products.clean_image.as_ref().ok_or_else(|| {
            PanaceaError::MissingStageOutput("sky-subtracted image (make_skyframe is off)".into())
        })?;
        let mask = masker.mask(clean, self.amp.header.rdnoise)?;
        let masked = mask.iter().filter(|m| **m).count();
        self.amp.mask = Some(mask);
        self.invalidate(Stage::Extract);
        info!(amp = %self.amp.label(), masked, "cosmic rays masked");
        Ok(())
    }

    /// Trace positions at three representative columns.
    pub fn trace_summary(&mut self) -> Result<TraceSummary, PanaceaError> {
        self.run(Stage::Trace)?;
        TraceSummary::from_fibers(&self.amp.fibers)
    }

    /// Persist every fiber record.
    pub fn save_fibers(&self, store: &mut dyn CalibrationStore) -> Result<(), PanaceaError> {
        self.amp.fibers.save(store, &self.amp.header.context)?;
        info!(amp = %self.amp.label(), fibers = self.amp.fibers.len(), "fibers saved");
        Ok(())
    }

    /// Replace the fibers with a previous run's records.
    pub fn load_fibers(&mut self, store: &dyn CalibrationStore) -> Result<usize, PanaceaError> {
        let n = self.amp.fibers.load_all(store, &self.amp.header.context)?;
        self.mark_loaded();
        Ok(n)
    }

    /// Load trace, fiber model, wavelength, fiber-to-fiber and dead flags from `calpath`.
    pub fn load_all_cal(&mut self) -> Result<usize, PanaceaError> {
        let n = self.load_from_calpath(&FiberProperty::CALIBRATION)?;
        self.mark_loaded();
        Ok(n)
    }

    /// Mark the stages whose outputs every fiber now holds.
    fn mark_loaded(&mut self) {
        let fibers = &self.amp.fibers;
        if fibers.is_empty() {
            return;
        }
        let all = |prop: FiberProperty| fibers.iter().all(|f| f.has_property(prop));
        let marks = [
            (Stage::Trace, all(FiberProperty::Trace)),
            (Stage::FiberModel, all(FiberProperty::FibModel)),
            (Stage::Extract, all(FiberProperty::Spectrum)),
            (Stage::Wavelength, all(FiberProperty::Wavelength)),
            (Stage::FiberToFiber, all(FiberProperty::FiberToFiber)),
        ];
        for (stage, done) in marks {
            if done {
                self.completed.insert(stage);
            }
        }
    }
}

#[cfg(test)]
mod pipeline_test {
    use super::*;

    #[test]
    fn test_stage_graph() {
        assert!(Stage::SkySubtraction.requires(Stage::Prepare));
        assert!(Stage::Wavelength.requires(Stage::Extract));
        assert!(!Stage::Trace.requires(Stage::Extract));
        assert_eq!(
            Stage::Extract.dependents(),
            vec![Stage::Wavelength, Stage::FiberToFiber, Stage::SkySubtraction]
        );
        assert!(Stage::SkySubtraction.dependents().is_empty());
        assert_eq!(Stage::FiberToFiber.to_string(), "fiber_to_fiber");
    }
}
