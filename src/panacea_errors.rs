use thiserror::Error;

use crate::constants::FiberNumber;

#[derive(Error, Debug)]
pub enum PanaceaError {
    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("JSON (de)serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV writer error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Unable to parse number: {0}")]
    ParseFloatError(#[from] std::num::ParseFloatError),

    #[error("Malformed table {path} at line {line}: {reason}")]
    MalformedTable {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("Invalid CCD section string: {0}")]
    InvalidSection(String),

    #[error("Invalid or missing header card: {0}")]
    InvalidHeader(String),

    #[error("Invalid reduction parameter: {0}")]
    InvalidParameter(String),

    #[error("Array shape mismatch: expected {expected:?}, found {found:?} ({context})")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
        context: String,
    },

    #[error("Calibration files out of order: expected fiber {expected}, found {found}")]
    CalibrationOrderMismatch { expected: FiberNumber, found: String },

    #[error("No calibration available: {0}")]
    MissingCalibration(String),

    #[error("Stage output missing: {0}")]
    MissingStageOutput(String),

    #[error("An initial wavelength range is required to fit the wavelength solution")]
    MissingInitialWavelengthRange,

    #[error("No valid wavelength seed fiber after {0} attempts")]
    SeedRetryExhausted(usize),

    #[error("Fiber {0} has no live neighbor in either direction")]
    NoLiveNeighbor(FiberNumber),

    #[error("No live fiber available to build a master spectrum")]
    EmptyMaster,

    #[error("Linear system is singular: {0}")]
    SingularSystem(String),
}

impl PartialEq for PanaceaError {
    fn eq(&self, other: &Self) -> bool {
        use PanaceaError::*;
        match (self, other) {
            // Not comparable: equal if same variant
            (IoError(_), IoError(_)) => true,
            (JsonError(_), JsonError(_)) => true,
            (CsvError(_), CsvError(_)) => true,

            (FileNotFound(a), FileNotFound(b)) => a == b,
            (ParseFloatError(a), ParseFloatError(b)) => a == b,
            (
                MalformedTable {
                    path: pa, line: la, ..
                },
                MalformedTable {
                    path: pb, line: lb, ..
                },
            ) => pa == pb && la == lb,
            (InvalidSection(a), InvalidSection(b)) => a == b,
            (InvalidHeader(a), InvalidHeader(b)) => a == b,
            (InvalidParameter(a), InvalidParameter(b)) => a == b,
            (
                ShapeMismatch {
                    expected: ea,
                    found: fa,
                    ..
                },
                ShapeMismatch {
                    expected: eb,
                    found: fb,
                    ..
                },
            ) => ea == eb && fa == fb,
            (
                CalibrationOrderMismatch {
                    expected: ea,
                    found: fa,
                },
                CalibrationOrderMismatch {
                    expected: eb,
                    found: fb,
                },
            ) => ea == eb && fa == fb,
            (MissingCalibration(a), MissingCalibration(b)) => a == b,
            (MissingStageOutput(a), MissingStageOutput(b)) => a == b,
            (SeedRetryExhausted(a), SeedRetryExhausted(b)) => a == b,
            (NoLiveNeighbor(a), NoLiveNeighbor(b)) => a == b,
            (SingularSystem(a), SingularSystem(b)) => a == b,

            // Unit variants
            (MissingInitialWavelengthRange, MissingInitialWavelengthRange) => true,
            (EmptyMaster, EmptyMaster) => true,

            _ => false,
        }
    }
}
