mod common;

use std::sync::Arc;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use common::SyntheticFrame;
use panacea::{
    calibration::{library::MemoryLibrary, CalibrationStore, MemoryStore},
    cosmics::ThresholdMasker,
    params::ReductionParams,
    pipeline::{Reduction, Stage},
    trace::reference_column,
};

const FIBERS: usize = 20;
const COLUMNS: usize = 300;

fn library(frame: &SyntheticFrame) -> Arc<MemoryLibrary> {
    Arc::new(frame.library(reference_column(frame.columns, 0.47)))
}

fn twilight() -> (SyntheticFrame, Reduction) {
    let frame = SyntheticFrame::new(FIBERS, COLUMNS);
    let mut reduction = Reduction::new(frame.amplifier(), frame.params(), library(&frame));
    reduction.reduce().unwrap();
    (frame, reduction)
}

fn calibration_store(twilight: &Reduction) -> Arc<dyn CalibrationStore> {
    let mut store = MemoryStore::new();
    twilight.save_fibers(&mut store).unwrap();
    Arc::new(store)
}

fn science(
    frame: &SyntheticFrame,
    params: ReductionParams,
    calpath: Arc<dyn CalibrationStore>,
) -> Reduction {
    Reduction::new(frame.amplifier(), params, library(frame)).with_calpath(calpath)
}

#[test]
fn test_twilight_reduction_recovers_geometry_and_wavelength() {
    let (frame, reduction) = twilight();

    assert!(reduction.computes_calibration());
    assert!(reduction.is_complete(Stage::FiberToFiber));
    assert!(!reduction.is_complete(Stage::SkySubtraction));

    let fibers = reduction.fibers();
    assert_eq!(fibers.len(), FIBERS);
    assert!(fibers.dead_indices().is_empty());

    let span = frame.wave_end() - frame.wave_start;
    for (i, fiber) in fibers.iter().enumerate() {
        let trace = fiber.trace.as_ref().unwrap();
        let wave = fiber.wavelength.as_ref().unwrap();
        let spectrum = fiber.spectrum.as_ref().unwrap();
        for c in [10, COLUMNS / 2, COLUMNS - 10] {
            assert_abs_diff_eq!(trace[c], frame.centre(i, c), epsilon = 0.2);
            assert_abs_diff_eq!(wave[c], frame.wavelength(c), epsilon = 0.01 * span);
            assert_relative_eq!(spectrum[c], frame.flux(i, c), max_relative = 0.03);
        }
    }

    let masters = &reduction.amplifier().masters;
    assert!(masters.normalized.as_ref().is_some_and(|m| !m.is_empty()));
    assert!(masters.average.as_ref().is_some_and(|m| !m.is_empty()));
    assert!(masters.sky.is_none());
}

#[test]
fn test_fiber_to_fiber_tracks_throughput() {
    let (frame, reduction) = twilight();
    let fibers = reduction.fibers();
    let c = COLUMNS / 2;
    let ftf0 = fibers[0].fiber_to_fiber.as_ref().unwrap()[c];
    for (i, fiber) in fibers.iter().enumerate().skip(1) {
        let ftf = fiber.fiber_to_fiber.as_ref().unwrap()[c];
        assert_relative_eq!(
            ftf / ftf0,
            frame.throughput[i] / frame.throughput[0],
            max_relative = 0.03
        );
    }
}

#[test]
fn test_science_frame_reuses_twilight_calibration() {
    let (twi_frame, twi) = twilight();
    let frame = SyntheticFrame {
        noise_seed: Some(7),
        ..twi_frame.clone()
    }
    .science();
    let mut sci = science(&frame, frame.params(), calibration_store(&twi));
    sci.reduce().unwrap();

    assert!(!sci.computes_calibration());
    assert!(sci.is_complete(Stage::SkySubtraction));
    for (fiber, cal) in sci.fibers().iter().zip(twi.fibers().iter()) {
        assert_eq!(fiber.trace, cal.trace);
        assert_eq!(fiber.wave_poly, cal.wave_poly);
        assert_eq!(fiber.fiber_to_fiber, cal.fiber_to_fiber);
    }

    let products = &sci.amplifier().products;
    let skyframe = products.skyframe.as_ref().unwrap();
    let clean = products.clean_image.as_ref().unwrap();
    assert!(products.cont_frame.is_some());
    assert!(products.continuum_sub.is_some());
    assert!(products.residual.is_some());
    assert!(sci.amplifier().masters.sky.is_some());

    // Every fiber lies fully on the detector: re-projection conserves flux.
    let sky_total: f64 = sci
        .fibers()
        .iter()
        .map(|f| f.sky_spectrum.as_ref().unwrap().iter().sum::<f64>())
        .sum();
    assert_relative_eq!(skyframe.sum(), sky_total, max_relative = 1e-9);

    // Sky continuum columns, away from the emission lines.
    let image = &sci.amplifier().image;
    for c in [25, 275] {
        let total: f64 = image.column(c).sum();
        let left: f64 = clean.column(c).sum();
        assert!(left.abs() < 0.03 * total, "column {c}: {left} of {total} left");
        for (i, fiber) in sci.fibers().iter().enumerate() {
            let sky = fiber.sky_spectrum.as_ref().unwrap()[c];
            assert_relative_eq!(sky, frame.flux(i, c), max_relative = 0.03);
        }
    }
}

#[test]
fn test_skypath_reuse_and_fallback() {
    let (twi_frame, twi) = twilight();
    let calpath = calibration_store(&twi);
    let frame = twi_frame.science();

    let mut first = science(&frame, frame.params(), calpath.clone());
    first.reduce().unwrap();
    let mut sky_store = MemoryStore::new();
    first.save_fibers(&mut sky_store).unwrap();

    let mut second =
        science(&frame, frame.params(), calpath.clone()).with_skypath(Arc::new(sky_store));
    second.reduce().unwrap();
    assert!(second.amplifier().masters.sky.is_none());
    for (a, b) in second.fibers().iter().zip(first.fibers().iter()) {
        assert_eq!(a.sky_spectrum, b.sky_spectrum);
    }

    let mut fallback =
        science(&frame, frame.params(), calpath).with_skypath(Arc::new(MemoryStore::new()));
    fallback.reduce().unwrap();
    assert!(fallback.amplifier().masters.sky.is_some());
}

#[test]
fn test_trace_shift_follows_science_frame() {
    let (twi_frame, twi) = twilight();
    let frame = SyntheticFrame {
        first_row: twi_frame.first_row + 0.6,
        ..twi_frame.clone()
    }
    .science();
    let params = ReductionParams::builder()
        .calculate_shift(true)
        .init_lims(frame.wave_start, frame.wave_end())
        .build()
        .unwrap();
    let mut sci = science(&frame, params, calibration_store(&twi));
    sci.run(Stage::Trace).unwrap();

    let shift = sci.trace_shift().unwrap();
    assert_eq!(shift.per_fiber.len(), FIBERS);
    assert_abs_diff_eq!(shift.net, 0.6, epsilon = 0.1);
    for (fiber, cal) in sci.fibers().iter().zip(twi.fibers().iter()) {
        let c = COLUMNS / 2;
        let moved = fiber.trace.as_ref().unwrap()[c] - cal.trace.as_ref().unwrap()[c];
        assert_abs_diff_eq!(moved, 0.6, epsilon = 0.1);
    }
}

#[test]
fn test_science_without_calpath_fails() {
    let frame = SyntheticFrame::new(FIBERS, COLUMNS).science();
    let mut sci = Reduction::new(frame.amplifier(), frame.params(), library(&frame));
    assert!(sci.reduce().is_err());
    assert!(sci.is_complete(Stage::Prepare));
    assert!(!sci.is_complete(Stage::Trace));
}

#[test]
fn test_cosmic_mask_invalidates_extraction() {
    let (twi_frame, twi) = twilight();
    let frame = twi_frame.science();
    let mut sci = science(&frame, frame.params(), calibration_store(&twi));
    sci.reduce().unwrap();
    let before = sci.fibers()[3].spectrum.clone();

    sci.clean_cosmics(&ThresholdMasker { nsigma: 1e6 }).unwrap();
    assert!(sci.amplifier().mask.is_some());
    assert!(sci.is_complete(Stage::FiberModel));
    assert!(!sci.is_complete(Stage::Extract));
    assert!(!sci.is_complete(Stage::SkySubtraction));

    // Nothing is masked at that threshold, so the new extraction matches the old one.
    sci.run(Stage::Extract).unwrap();
    assert_eq!(sci.fibers()[3].spectrum, before);
}

#[test]
fn test_partial_column_extraction() {
    let (frame, mut twi) = twilight();
    let before = twi.fibers()[2].spectrum.clone().unwrap();
    twi.extract_columns(&[100, 101]).unwrap();

    assert!(twi.is_complete(Stage::Extract));
    assert!(!twi.is_complete(Stage::Wavelength));
    let after = twi.fibers()[2].spectrum.as_ref().unwrap();
    assert_relative_eq!(after[100], before[100], max_relative = 1e-12);
    assert_relative_eq!(after[150], before[150], max_relative = 1e-12);
    assert_relative_eq!(after[101], frame.flux(2, 101), max_relative = 0.03);
}
