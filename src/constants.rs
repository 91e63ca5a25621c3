//! # Constants and type definitions for Panacea
//!
//! This module centralizes the **instrument constants**, **numerical tolerances**, and
//! **common type aliases** shared by every stage of the amplifier reduction.
//!
//! ## Overview
//!
//! - Amplifier identifiers that need a 180° flip to run blue → red
//! - Tolerances of the wavelength seed guard
//! - Window sizes used by the trace-shift measurement
//! - Type aliases for pixels, wavelengths and fiber indices

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Position or distance expressed in detector pixels
pub type Pixel = f64;

/// Wavelength in Angstrom
pub type Angstrom = f64;

/// 1-based fiber number, stable across calibration reuse
pub type FiberNumber = usize;

// -------------------------------------------------------------------------------------------------
// Orientation
// -------------------------------------------------------------------------------------------------

/// Amplifiers read out in the reversed direction; their images are rotated by 180°
/// so that every amplifier runs blue → red from left to right.
pub const FLIPPED_AMPS: [&str; 2] = ["LU", "RL"];

// -------------------------------------------------------------------------------------------------
// Wavelength calibration
// -------------------------------------------------------------------------------------------------

/// Maximum distance (Angstrom) between the fitted endpoints of the seed fiber and the
/// requested initial range before the seed is rejected.
pub const WAVE_BOUNDARY_TOLERANCE: Angstrom = 100.0;

/// Number of seed fibers tried before the wavelength solution is declared impossible.
pub const MAX_SEED_ATTEMPTS: usize = 10;

/// Half-width of the shift search for a seed fiber, as a fraction of the initial range.
pub const SEED_SHIFT_FRACTION: f64 = 0.02;

/// Lower bound on the seed shift search half-width, in units of the spectral resolution.
pub const SEED_SHIFT_RESOLUTIONS: f64 = 25.0;

/// Shift search half-width for propagated fibers, in units of the spectral resolution.
pub const PROPAGATE_SHIFT_RESOLUTIONS: f64 = 4.0;

/// Relative dispersion range explored around the guess of a seed fiber.
pub const SEED_SLOPE_RANGE: f64 = 0.05;

/// Relative dispersion range explored around the guess of a propagated fiber.
pub const PROPAGATE_SLOPE_RANGE: f64 = 0.02;

// -------------------------------------------------------------------------------------------------
// Trace
// -------------------------------------------------------------------------------------------------

/// Half-width (columns) of the window used to compare a trace with its calibration trace.
pub const SHIFT_HALF_WIDTH: usize = 20;

/// Fractional column position of the trace-shift window.
pub const SHIFT_COLUMN_FRACTION: f64 = 0.8;

/// Biweight filter window used to smooth per-fiber trace shifts.
pub const SHIFT_FILTER_SIZE: usize = 25;

/// Half-width (columns) of the column average used by the centroid detector.
pub const CENTROID_COLUMN_HALF_WIDTH: usize = 2;

// -------------------------------------------------------------------------------------------------
// Robust statistics
// -------------------------------------------------------------------------------------------------

/// Tuning constant of the biweight location estimator
pub const BIWEIGHT_C: f64 = 6.0;

/// Maximum number of reweighting iterations of the biweight location
pub const BIWEIGHT_MAX_ITER: usize = 10;

/// Default central exclusion width of the biweight filter
pub const BIWEIGHT_IGNORE_CENTRAL: usize = 3;

/// Numerical epsilon used for floating-point comparisons
pub const EPS: f64 = 1e-12;
