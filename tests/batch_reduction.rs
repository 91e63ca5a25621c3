mod common;

use std::sync::Arc;

use common::SyntheticFrame;
use panacea::{
    batch::reduce_batch,
    calibration::library::CalibrationLibrary,
    panacea_errors::PanaceaError,
    params::ReductionParams,
    pipeline::{Reduction, Stage},
    trace::reference_column,
};

#[test]
fn test_failing_amplifier_does_not_stop_the_batch() {
    let frame = SyntheticFrame::new(10, 160);
    let library: Arc<dyn CalibrationLibrary> =
        Arc::new(frame.library(reference_column(frame.columns, 0.47)));

    let good = |name: &str| {
        Reduction::new(frame.amplifier().with_name(name), frame.params(), library.clone())
    };
    // No initial wavelength range: fails at the wavelength stage.
    let bad = Reduction::new(
        frame.amplifier().with_name("no_init_lims"),
        ReductionParams::builder().sigma(frame.sigma).col_group(8).build().unwrap(),
        library.clone(),
    );

    let results = reduce_batch(vec![good("twi_a"), bad, good("twi_b")]);
    let labels: Vec<&str> = results.iter().map(|(label, _)| label.as_str()).collect();
    assert_eq!(labels, ["twi_a", "no_init_lims", "twi_b"]);

    for i in [0, 2] {
        let reduction = results[i].1.as_ref().unwrap();
        assert!(reduction.is_complete(Stage::FiberToFiber));
        assert_eq!(reduction.fibers().len(), 10);
    }
    assert_eq!(
        results[1].1.as_ref().unwrap_err(),
        &PanaceaError::MissingInitialWavelengthRange
    );

    let a = results[0].1.as_ref().unwrap();
    let b = results[2].1.as_ref().unwrap();
    for (fa, fb) in a.fibers().iter().zip(b.fibers().iter()) {
        assert_eq!(fa.wave_poly, fb.wave_poly);
    }
}

#[test]
fn test_jobs_sharing_a_label_all_return() {
    let frame = SyntheticFrame::new(10, 160);
    let library: Arc<dyn CalibrationLibrary> =
        Arc::new(frame.library(reference_column(frame.columns, 0.47)));

    // Two exposures of the same amplifier, neither named: both fall back to the context.
    let job = || Reduction::new(frame.amplifier(), frame.params(), library.clone());
    let results = reduce_batch(vec![job(), job()]);

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, results[1].0);
    assert_eq!(results[0].0, frame.header().context.to_string());
    for (_, result) in &results {
        assert!(result.as_ref().unwrap().is_complete(Stage::FiberToFiber));
    }
}

#[test]
fn test_empty_batch() {
    assert!(reduce_batch(Vec::new()).is_empty());
}
