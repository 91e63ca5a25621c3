//! # Batch reduction
//!
//! Runs independent [`Reduction`]s in parallel with rayon. Each amplifier owns its
//! image and fibers; only the read-only calibration library and stores are shared, so
//! no coordination is needed between workers.
//!
//! A failure stays local to its amplifier: the returned list holds one labelled
//! `Result` per job, in job order. Jobs sharing a label are all kept.
//!
//! ## Progress UI (feature: `progress`)
//! With the `progress` feature, a progress bar (via `indicatif`) reports completed
//! amplifiers.
use std::collections::HashSet;

use ahash::RandomState;
use rayon::prelude::*;
use tracing::{info, warn};

#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::{panacea_errors::PanaceaError, pipeline::Reduction};

/// Per-job outcome with its [`Amplifier::label`](crate::amplifier::Amplifier::label),
/// in the order the jobs were submitted.
pub type BatchResults = Vec<(String, Result<Reduction, PanaceaError>)>;

fn reduce_one(mut reduction: Reduction) -> (String, Result<Reduction, PanaceaError>) {
    let label = reduction.amplifier().label();
    match reduction.reduce() {
        Ok(()) => (label, Ok(reduction)),
        Err(err) => {
            warn!(amp = %label, error = %err, "amplifier reduction failed");
            (label, Err(err))
        }
    }
}

/// Labels occurring more than once in `jobs`, each reported once.
fn shared_labels(jobs: &[Reduction]) -> Vec<String> {
    let mut seen = HashSet::with_hasher(RandomState::new());
    let mut shared = HashSet::with_hasher(RandomState::new());
    jobs.iter()
        .map(|job| job.amplifier().label())
        .filter(|label| !seen.insert(label.clone()) && shared.insert(label.clone()))
        .collect()
}

fn summarize(results: &BatchResults) {
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    info!(total = results.len(), failed, "batch reduction done");
}

/// Reduce every amplifier of `jobs` in parallel.
///
/// Arguments
/// -----------------
/// * `jobs`: Fully configured reductions (amplifier, parameters, library, stores).
///
/// Return
/// ----------
/// * One `(label, result)` entry per job, in job order, with the completed
///   [`Reduction`] or its error.
///
/// See also
/// ------------
/// * [`Reduction::reduce`] – The per-amplifier sequence.
#[cfg(not(feature = "progress"))]
pub fn reduce_batch(jobs: Vec<Reduction>) -> BatchResults {
    for label in shared_labels(&jobs) {
        warn!(amp = %label, "several jobs share this label");
    }
    let results: BatchResults = jobs.into_par_iter().map(reduce_one).collect();
    summarize(&results);
    results
}

#[cfg(feature = "progress")]
pub fn reduce_batch(jobs: Vec<Reduction>) -> BatchResults {
    for label in shared_labels(&jobs) {
        warn!(amp = %label, "several jobs share this label");
    }
    let pb = ProgressBar::new(jobs.len().max(1) as u64);
    let template = "{bar:40.cyan/blue} {pos}/{len} amplifiers | ETA {eta}";
    if let Ok(style) = ProgressStyle::with_template(template) {
        pb.set_style(style);
    }
    let results: BatchResults = jobs
        .into_par_iter()
        .map(|job| {
            let out = reduce_one(job);
            pb.inc(1);
            out
        })
        .collect();
    pb.finish_and_clear();
    summarize(&results);
    results
}
