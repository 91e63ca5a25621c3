//! # Amplifier
//!
//! One detector readout segment: its header geometry, its calibrated image and error
//! arrays, the ordered fiber collection and the master spectra derived from them.
//!
//! ## Overview
//!
//! - [`FrameHeader`] – the header cards the reduction needs (gain, read noise, sections,
//!   identifiers, observation date), built from key/value pairs with
//!   [`FrameHeader::from_cards`].
//! - [`Amplifier`] – owns the raw frame until
//!   [`prepare_image`](crate::amplifier::Amplifier::prepare_image) turns it into the
//!   trimmed, calibrated `image` with a matching `error` array.
//! - [`AmpContext`] – the identifiers (`specid`, `ifuslot`, `ifuid`, `amp`) that address
//!   calibration artifacts of this amplifier.
//!
//! ## Invariants
//!
//! * `image` and `error` always share the same shape once the frame is trimmed.
//! * `cols()` (D) excludes the overscan region, `rows()` (N) is the trimmed row count.
//! * The overscan level is estimated once and cached.
pub mod ccd_section;
pub mod image_prep;

use std::{collections::HashMap, fmt, str::FromStr};

use hifitime::Epoch;
use nalgebra::DMatrix;
use once_cell::sync::OnceCell;

use crate::{
    fiber::registry::FiberRegistry, normalization::MasterCurve, panacea_errors::PanaceaError,
};
use ccd_section::CcdSection;

/// Observation type read from `IMAGETYP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservationType {
    /// Twilight flat, the frame calibration products are computed from.
    Twilight,
    Science,
    Other(String),
}

impl From<&str> for ObservationType {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "twi" | "twilight" => ObservationType::Twilight,
            "sci" | "science" => ObservationType::Science,
            other => ObservationType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ObservationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservationType::Twilight => write!(f, "twi"),
            ObservationType::Science => write!(f, "sci"),
            ObservationType::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Identifiers addressing the calibration artifacts of one amplifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AmpContext {
    /// Spectrograph id, zero padded to three digits.
    pub specid: String,
    /// IFU slot, zero padded to three digits.
    pub ifuslot: String,
    pub ifuid: String,
    /// Amplifier name (`CCDPOS` + `CCDHALF`, e.g. `LU`).
    pub amp: String,
}

impl fmt::Display for AmpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.specid, self.ifuslot, self.ifuid, self.amp
        )
    }
}

/// Header values consumed by the reduction.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHeader {
    /// e-/ADU
    pub gain: f64,
    /// e-
    pub rdnoise: f64,
    pub trimsec: CcdSection,
    pub biassec: CcdSection,
    pub obs_type: ObservationType,
    pub context: AmpContext,
    /// Observation date (midnight UTC of `DATE-OBS`).
    pub date: Epoch,
    pub exptime: f64,
}

fn card_value(s: &str) -> &str {
    s.trim().trim_matches('\'').trim()
}

fn parse_obs_date(value: &str) -> Result<Epoch, PanaceaError> {
    let bad = || PanaceaError::InvalidHeader(format!("DATE-OBS = {value}"));
    let day_part = value.split('T').next().ok_or_else(bad)?;
    let mut fields = day_part.split('-');
    let mut next_num = || -> Result<u32, PanaceaError> {
        fields
            .next()
            .and_then(|f| f.trim().parse::<u32>().ok())
            .ok_or_else(bad)
    };
    let (year, month, day) = (next_num()?, next_num()?, next_num()?);
    Epoch::from_str(&format!("{year:04}-{month:02}-{day:02}T00:00:00 UTC")).map_err(|_| bad())
}

impl FrameHeader {
    /// Build a header from `(keyword, value)` cards.
    ///
    /// Required keywords: `GAIN`, `RDNOISE`, `CCDPOS`, `CCDHALF`, `TRIMSEC`, `BIASSEC`,
    /// `IMAGETYP`, `SPECID`, `IFUID`, `IFUSLOT`, `DATE-OBS`, `EXPTIME`. String values may
    /// carry FITS quotes and padding blanks.
    ///
    /// Return
    /// ----------
    /// * The parsed header, or [`PanaceaError::InvalidHeader`] naming the first missing or
    ///   malformed card.
    pub fn from_cards<K, V>(cards: impl IntoIterator<Item = (K, V)>) -> Result<Self, PanaceaError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let map: HashMap<String, String> = cards
            .into_iter()
            .map(|(k, v)| {
                (
                    k.as_ref().trim().to_ascii_uppercase(),
                    card_value(v.as_ref()).to_string(),
                )
            })
            .collect();

        let get = |key: &str| -> Result<&str, PanaceaError> {
            map.get(key)
                .map(String::as_str)
                .ok_or_else(|| PanaceaError::InvalidHeader(format!("missing {key}")))
        };
        let number = |key: &str| -> Result<f64, PanaceaError> {
            let v = get(key)?;
            v.parse::<f64>()
                .map_err(|_| PanaceaError::InvalidHeader(format!("{key} = {v}")))
        };
        let padded = |key: &str| -> Result<String, PanaceaError> {
            let v = get(key)?;
            v.parse::<u32>()
                .map(|n| format!("{n:03}"))
                .map_err(|_| PanaceaError::InvalidHeader(format!("{key} = {v}")))
        };

        let amp = format!(
            "{}{}",
            get("CCDPOS")?.replace(' ', ""),
            get("CCDHALF")?.replace(' ', "")
        );

        Ok(FrameHeader {
            gain: number("GAIN")?,
            rdnoise: number("RDNOISE")?,
            trimsec: get("TRIMSEC")?.parse()?,
            biassec: get("BIASSEC")?.parse()?,
            obs_type: ObservationType::from(get("IMAGETYP")?),
            context: AmpContext {
                specid: padded("SPECID")?,
                ifuslot: padded("IFUSLOT")?,
                ifuid: get("IFUID")?.replace(' ', ""),
                amp,
            },
            date: parse_obs_date(get("DATE-OBS")?)?,
            exptime: number("EXPTIME")?,
        })
    }
}

/// Wavelength-ordered composites built from all live fibers.
#[derive(Debug, Clone, Default)]
pub struct MasterSpectra {
    /// Normalised master used as second-pass wavelength reference.
    pub normalized: Option<MasterCurve>,
    /// Average spectrum behind the fiber-to-fiber throughput.
    pub average: Option<MasterCurve>,
    /// Master sky.
    pub sky: Option<MasterCurve>,
}

/// Image-space products of the sky and continuum stage.
#[derive(Debug, Clone, Default)]
pub struct ImageProducts {
    pub skyframe: Option<DMatrix<f64>>,
    pub clean_image: Option<DMatrix<f64>>,
    pub cont_frame: Option<DMatrix<f64>>,
    pub continuum_sub: Option<DMatrix<f64>>,
    pub residual: Option<DMatrix<f64>>,
}

/// One amplifier being reduced.
#[derive(Debug, Clone)]
pub struct Amplifier {
    pub name: Option<String>,
    pub header: FrameHeader,
    /// Raw frame before [`prepare_image`](Amplifier::prepare_image), calibrated afterwards.
    pub image: DMatrix<f64>,
    pub error: DMatrix<f64>,
    /// Pixels excluded from extraction (`true` = masked).
    pub mask: Option<DMatrix<bool>>,
    pub fibers: FiberRegistry,
    pub masters: MasterSpectra,
    pub products: ImageProducts,
    overscan: OnceCell<f64>,
    trimmed: bool,
    prepared: bool,
}

impl Amplifier {
    /// Wrap a raw frame.
    ///
    /// The error array is initialised to `rdnoise / gain` on the trimmed shape, or to
    /// zeros when the gain is not positive.
    ///
    /// Arguments
    /// -----------------
    /// * `header`: Parsed [`FrameHeader`].
    /// * `raw`: Untrimmed frame (rows × columns, overscan included).
    ///
    /// Return
    /// ----------
    /// * The new amplifier, or [`PanaceaError::ShapeMismatch`] if a header section
    ///   exceeds the raw frame.
    pub fn new(header: FrameHeader, raw: DMatrix<f64>) -> Result<Self, PanaceaError> {
        for (name, sec) in [("TRIMSEC", header.trimsec), ("BIASSEC", header.biassec)] {
            if !sec.fits_in(raw.nrows(), raw.ncols()) {
                return Err(PanaceaError::ShapeMismatch {
                    expected: (sec.y1, sec.x1),
                    found: raw.shape(),
                    context: format!("{name} {sec} outside raw frame"),
                });
            }
        }

        let (n, d) = (header.trimsec.rows(), header.trimsec.cols());
        let error = if header.gain > 0.0 {
            DMatrix::from_element(n, d, header.rdnoise / header.gain)
        } else {
            DMatrix::zeros(n, d)
        };

        Ok(Amplifier {
            name: None,
            image: raw,
            error,
            mask: None,
            fibers: FiberRegistry::new(d),
            masters: MasterSpectra::default(),
            products: ImageProducts::default(),
            overscan: OnceCell::new(),
            trimmed: false,
            prepared: false,
            header,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Number of trimmed rows (N).
    pub fn rows(&self) -> usize {
        self.header.trimsec.rows()
    }

    /// Number of trimmed columns (D).
    pub fn cols(&self) -> usize {
        self.header.trimsec.cols()
    }

    pub fn context(&self) -> &AmpContext {
        &self.header.context
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn is_trimmed(&self) -> bool {
        self.trimmed
    }

    /// Cached overscan level, if already measured.
    pub fn overscan_value(&self) -> Option<f64> {
        self.overscan.get().copied()
    }

    /// Label used in log records and batch results.
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.header.context.to_string())
    }
}
