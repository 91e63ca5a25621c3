mod common;

use std::sync::Arc;

use approx::assert_abs_diff_eq;
use common::SyntheticFrame;
use panacea::{
    fiber::property::FiberProperty,
    params::ReductionParams,
    pipeline::{Reduction, Stage},
    trace::reference_column,
};

const DEAD: usize = 56;

fn reduction(frame: &SyntheticFrame) -> Reduction {
    let ref_col = reference_column(frame.columns, 0.47);
    let mut library = frame.library(ref_col);
    // Older geometry, far off: picking it would kill every fiber.
    let stale: Vec<f64> = frame.positions_at(ref_col).iter().map(|y| y + 20.0).collect();
    library.insert_locations("20160101", &frame.header().context, stale);

    let params = ReductionParams::builder()
        .use_trace_ref(true)
        .build()
        .unwrap();
    Reduction::new(frame.amplifier(), params, Arc::new(library))
}

#[test]
fn test_dead_fiber_takes_neighbour_trace_plus_reference_offset() {
    let mut frame = SyntheticFrame::new(112, 64);
    frame.missing = vec![DEAD];
    let mut reduction = reduction(&frame);
    reduction.run(Stage::Trace).unwrap();

    let report = reduction.trace_report().unwrap();
    assert_eq!(report.ref_col, reference_column(64, 0.47));
    assert_eq!(report.standard.len(), 112);
    assert_eq!(report.dead, vec![(DEAD, DEAD - 1)]);

    let fibers = reduction.fibers();
    assert_eq!(fibers.len(), 112);
    assert_eq!(fibers.dead_indices(), vec![DEAD]);

    let dead = fibers[DEAD].trace.as_ref().unwrap();
    let source = fibers[DEAD - 1].trace.as_ref().unwrap();
    for c in 0..frame.columns {
        assert_abs_diff_eq!(dead[c] - source[c], frame.spacing, epsilon = 1e-9);
        assert_abs_diff_eq!(dead[c], frame.centre(DEAD, c), epsilon = 0.2);
    }

    for f in [0, DEAD - 1, DEAD + 1, 111] {
        let trace = fibers[f].trace.as_ref().unwrap();
        for c in [0, 31, 63] {
            assert_abs_diff_eq!(trace[c], frame.centre(f, c), epsilon = 0.2);
        }
    }
}

#[test]
fn test_trace_summary_reports_dead_fiber() {
    let mut frame = SyntheticFrame::new(112, 64);
    frame.missing = vec![DEAD];
    let mut reduction = reduction(&frame);
    let summary = reduction.trace_summary().unwrap();

    assert_eq!(summary.fibers.len(), 112);
    assert!(summary.fibers[DEAD].dead);
    assert!(!summary.fibers[DEAD + 1].dead);
    assert_eq!(summary.fibers[0].fibnum, 1);

    let mut csv = Vec::new();
    summary.write_csv(&mut csv).unwrap();
    let text = String::from_utf8(csv).unwrap();
    assert_eq!(text.lines().count(), 113);
}

#[test]
fn test_dead_fiber_gets_every_calibration_product() {
    let mut frame = SyntheticFrame::new(20, 300);
    frame.missing = vec![7];
    let ref_col = reference_column(frame.columns, 0.47);
    let library = frame.library(ref_col);
    let params = ReductionParams::builder()
        .use_trace_ref(true)
        .init_lims(frame.wave_start, frame.wave_end())
        .sigma(frame.sigma)
        .col_group(8)
        .fiber_group(6)
        .build()
        .unwrap();

    let mut reduction = Reduction::new(frame.amplifier(), params, Arc::new(library));
    reduction.reduce().unwrap();

    let fibers = reduction.fibers();
    assert_eq!(fibers.dead_indices(), vec![7]);
    for prop in [
        FiberProperty::Trace,
        FiberProperty::FibModel,
        FiberProperty::WavePoly,
        FiberProperty::Wavelength,
        FiberProperty::Spectrum,
        FiberProperty::FiberToFiber,
    ] {
        assert!(fibers.iter().all(|f| f.has_property(prop)), "{prop} missing");
    }
    assert_eq!(fibers[7].wave_poly, fibers[6].wave_poly);
    assert_eq!(
        fibers[7].fibmodel.as_ref().unwrap().polys,
        fibers[6].fibmodel.as_ref().unwrap().polys
    );
}
