//! # Panacea
//!
//! Per-amplifier reduction engine for multi-fiber IFU spectrographs: from a raw
//! amplifier frame to traced, extracted, wavelength-calibrated, throughput-normalised
//! and sky-subtracted fiber spectra.
//!
//! The entry point is [`pipeline::Reduction`]; [`batch::reduce_batch`] runs many of
//! them in parallel.
pub mod amplifier;
pub mod batch;
pub mod biweight;
pub mod calibration;
pub mod constants;
pub mod cosmics;
pub mod extraction;
pub mod fiber;
pub mod fibermodel;
pub mod normalization;
pub mod panacea_errors;
pub mod params;
pub mod pipeline;
pub mod polynomial;
pub mod sky;
pub mod trace;
pub mod wavelength;
