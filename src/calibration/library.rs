//! # Calibration library
//!
//! Read-only instrument masters shared by every reduction: master bias and dark
//! frames, pixel flats, reference fiber positions (one set per calibration date) and
//! the reference spectrum template used by the wavelength solution.
//!
//! ## Directory layout
//!
//! [`DirectoryLibrary`] reads plain whitespace-separated tables under one root:
//!
//! ```text
//! lib_bias/masterbias_<specid>_<amp>.txt
//! lib_dark/masterdark_<specid>_<amp>.txt
//! PixelFlats/pixelflat_cam<specid>_<amp>.txt
//! Fiber_Locations/<YYYYMMDD>/fiber_loc_<specid>_<ifuslot>_<ifuid>_<amp>.txt
//! solar_spec/<specname>_temp.txt
//! ```
//!
//! Lines starting with `#` and blank lines are ignored. Frames are stored one detector
//! row per line.
use std::{collections::HashMap, fs, str::FromStr};

use camino::{Utf8Path, Utf8PathBuf};
use hifitime::Epoch;
use nalgebra::DMatrix;
use tracing::debug;

use crate::{amplifier::AmpContext, panacea_errors::PanaceaError};

/// Source of instrument master calibrations.
pub trait CalibrationLibrary: Send + Sync {
    fn master_bias(&self, specid: &str, amp: &str) -> Result<DMatrix<f64>, PanaceaError>;

    fn master_dark(&self, specid: &str, amp: &str) -> Result<DMatrix<f64>, PanaceaError>;

    fn pixel_flat(&self, specid: &str, amp: &str) -> Result<DMatrix<f64>, PanaceaError>;

    /// Dates (`YYYYMMDD`) for which reference fiber positions exist.
    fn reference_dates(&self) -> Result<Vec<String>, PanaceaError>;

    /// Reference fiber positions (rows at the reference column), in file order.
    fn fiber_locations(&self, date: &str, ctx: &AmpContext) -> Result<Vec<f64>, PanaceaError>;

    /// Reference spectrum as `(wavelength, flux)`.
    fn reference_spectrum(&self) -> Result<(Vec<f64>, Vec<f64>), PanaceaError>;
}

/// Parse a `YYYYMMDD` calibration date.
pub fn parse_calibration_date(date: &str) -> Result<Epoch, PanaceaError> {
    let bad = || PanaceaError::InvalidParameter(format!("calibration date {date}"));
    if date.len() != 8 || !date.chars().all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }
    Epoch::from_str(&format!(
        "{}-{}-{}T00:00:00 UTC",
        &date[..4],
        &date[4..6],
        &date[6..]
    ))
    .map_err(|_| bad())
}

/// Pick the reference date closest to `obs_date`.
///
/// Return
/// ----------
/// * The closest date (the earliest one on ties), or [`PanaceaError::MissingCalibration`]
///   when the library has no reference positions at all.
pub fn closest_reference_date(
    library: &dyn CalibrationLibrary,
    obs_date: Epoch,
) -> Result<String, PanaceaError> {
    let mut best: Option<(f64, String)> = None;
    let mut dates = library.reference_dates()?;
    dates.sort();
    for date in dates {
        let days = (obs_date - parse_calibration_date(&date)?).abs().to_seconds();
        if best.as_ref().map_or(true, |(d, _)| days < *d) {
            best = Some((days, date));
        }
    }
    best.map(|(_, d)| d)
        .ok_or_else(|| PanaceaError::MissingCalibration("no reference fiber positions".into()))
}

/// Read a whitespace-separated numeric table.
///
/// Return
/// ----------
/// * One `Vec<f64>` per non-empty, non-comment line.
/// * [`PanaceaError::MalformedTable`] on a non-numeric token.
pub fn read_table(path: &Utf8Path) -> Result<Vec<Vec<f64>>, PanaceaError> {
    if !path.is_file() {
        return Err(PanaceaError::FileNotFound(path.to_string()));
    }
    let text = fs::read_to_string(path)?;
    parse_table(&text, path.as_str())
}

fn parse_table(text: &str, origin: &str) -> Result<Vec<Vec<f64>>, PanaceaError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(i, line)| {
            line.split_whitespace()
                .map(|tok| {
                    tok.parse::<f64>().map_err(|e| PanaceaError::MalformedTable {
                        path: origin.to_string(),
                        line: i + 1,
                        reason: format!("{tok}: {e}"),
                    })
                })
                .collect()
        })
        .collect()
}

/// Turn table rows into a matrix; every row must have the same length.
pub fn table_to_matrix(rows: &[Vec<f64>], origin: &str) -> Result<DMatrix<f64>, PanaceaError> {
    let ncols = rows.first().map_or(0, Vec::len);
    if let Some((i, _)) = rows.iter().enumerate().find(|(_, r)| r.len() != ncols) {
        return Err(PanaceaError::MalformedTable {
            path: origin.to_string(),
            line: i + 1,
            reason: format!("expected {ncols} values"),
        });
    }
    Ok(DMatrix::from_row_iterator(
        rows.len(),
        ncols,
        rows.iter().flatten().copied(),
    ))
}

/// First column of a table.
fn first_column(rows: &[Vec<f64>], origin: &str) -> Result<Vec<f64>, PanaceaError> {
    rows.iter()
        .enumerate()
        .map(|(i, r)| {
            r.first().copied().ok_or_else(|| PanaceaError::MalformedTable {
                path: origin.to_string(),
                line: i + 1,
                reason: "empty row".into(),
            })
        })
        .collect()
}

/// Library read from a configuration directory.
#[derive(Debug, Clone)]
pub struct DirectoryLibrary {
    root: Utf8PathBuf,
    specname: Option<String>,
}

impl DirectoryLibrary {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        DirectoryLibrary {
            root: root.into(),
            specname: None,
        }
    }

    /// Base name of the reference spectrum template (`solar_spec/<specname>_temp.txt`).
    pub fn with_specname(mut self, specname: impl Into<String>) -> Self {
        self.specname = Some(specname.into());
        self
    }

    fn read_matrix(&self, path: Utf8PathBuf) -> Result<DMatrix<f64>, PanaceaError> {
        let rows = read_table(&path)?;
        debug!(path = %path, rows = rows.len(), "master frame read");
        table_to_matrix(&rows, path.as_str())
    }
}

impl CalibrationLibrary for DirectoryLibrary {
    fn master_bias(&self, specid: &str, amp: &str) -> Result<DMatrix<f64>, PanaceaError> {
        self.read_matrix(
            self.root
                .join("lib_bias")
                .join(format!("masterbias_{specid}_{amp}.txt")),
        )
    }

    fn master_dark(&self, specid: &str, amp: &str) -> Result<DMatrix<f64>, PanaceaError> {
        self.read_matrix(
            self.root
                .join("lib_dark")
                .join(format!("masterdark_{specid}_{amp}.txt")),
        )
    }

    fn pixel_flat(&self, specid: &str, amp: &str) -> Result<DMatrix<f64>, PanaceaError> {
        self.read_matrix(
            self.root
                .join("PixelFlats")
                .join(format!("pixelflat_cam{specid}_{amp}.txt")),
        )
    }

    fn reference_dates(&self) -> Result<Vec<String>, PanaceaError> {
        let dir = self.root.join("Fiber_Locations");
        if !dir.is_dir() {
            return Err(PanaceaError::FileNotFound(dir.to_string()));
        }
        let mut dates = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if parse_calibration_date(name).is_ok() {
                        dates.push(name.to_string());
                    }
                }
            }
        }
        Ok(dates)
    }

    fn fiber_locations(&self, date: &str, ctx: &AmpContext) -> Result<Vec<f64>, PanaceaError> {
        let path = self
            .root
            .join("Fiber_Locations")
            .join(date)
            .join(format!("fiber_loc_{ctx}.txt"));
        let rows = read_table(&path)?;
        first_column(&rows, path.as_str())
    }

    fn reference_spectrum(&self) -> Result<(Vec<f64>, Vec<f64>), PanaceaError> {
        let specname = self.specname.as_deref().ok_or_else(|| {
            PanaceaError::MissingCalibration("no reference spectrum name configured".into())
        })?;
        let path = self
            .root
            .join("solar_spec")
            .join(format!("{specname}_temp.txt"));
        let rows = read_table(&path)?;
        rows.iter()
            .enumerate()
            .map(|(i, r)| match r.as_slice() {
                [w, f, ..] => Ok((*w, *f)),
                _ => Err(PanaceaError::MalformedTable {
                    path: path.to_string(),
                    line: i + 1,
                    reason: "expected wavelength and flux".into(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|pairs| pairs.into_iter().unzip())
    }
}

/// Library held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryLibrary {
    bias: HashMap<(String, String), DMatrix<f64>>,
    dark: HashMap<(String, String), DMatrix<f64>>,
    flat: HashMap<(String, String), DMatrix<f64>>,
    locations: HashMap<(String, AmpContext), Vec<f64>>,
    reference: Option<(Vec<f64>, Vec<f64>)>,
}

fn lookup(
    map: &HashMap<(String, String), DMatrix<f64>>,
    kind: &str,
    specid: &str,
    amp: &str,
) -> Result<DMatrix<f64>, PanaceaError> {
    map.get(&(specid.to_string(), amp.to_string()))
        .cloned()
        .ok_or_else(|| PanaceaError::MissingCalibration(format!("{kind} for {specid} {amp}")))
}

impl MemoryLibrary {
    pub fn insert_bias(&mut self, specid: &str, amp: &str, frame: DMatrix<f64>) {
        self.bias.insert((specid.into(), amp.into()), frame);
    }

    pub fn insert_dark(&mut self, specid: &str, amp: &str, frame: DMatrix<f64>) {
        self.dark.insert((specid.into(), amp.into()), frame);
    }

    pub fn insert_flat(&mut self, specid: &str, amp: &str, frame: DMatrix<f64>) {
        self.flat.insert((specid.into(), amp.into()), frame);
    }

    pub fn insert_locations(&mut self, date: &str, ctx: &AmpContext, positions: Vec<f64>) {
        self.locations.insert((date.into(), ctx.clone()), positions);
    }

    pub fn set_reference_spectrum(&mut self, wavelength: Vec<f64>, flux: Vec<f64>) {
        self.reference = Some((wavelength, flux));
    }
}

impl CalibrationLibrary for MemoryLibrary {
    fn master_bias(&self, specid: &str, amp: &str) -> Result<DMatrix<f64>, PanaceaError> {
        lookup(&self.bias, "master bias", specid, amp)
    }

    fn master_dark(&self, specid: &str, amp: &str) -> Result<DMatrix<f64>, PanaceaError> {
        lookup(&self.dark, "master dark", specid, amp)
    }

    fn pixel_flat(&self, specid: &str, amp: &str) -> Result<DMatrix<f64>, PanaceaError> {
        lookup(&self.flat, "pixel flat", specid, amp)
    }

    fn reference_dates(&self) -> Result<Vec<String>, PanaceaError> {
        let mut dates: Vec<String> = self.locations.keys().map(|(d, _)| d.clone()).collect();
        dates.sort();
        dates.dedup();
        Ok(dates)
    }

    fn fiber_locations(&self, date: &str, ctx: &AmpContext) -> Result<Vec<f64>, PanaceaError> {
        self.locations
            .get(&(date.to_string(), ctx.clone()))
            .cloned()
            .ok_or_else(|| {
                PanaceaError::MissingCalibration(format!("fiber locations {date} {ctx}"))
            })
    }

    fn reference_spectrum(&self) -> Result<(Vec<f64>, Vec<f64>), PanaceaError> {
        self.reference
            .clone()
            .ok_or_else(|| PanaceaError::MissingCalibration("reference spectrum".into()))
    }
}

#[cfg(test)]
mod library_test {
    use super::*;

    fn ctx() -> AmpContext {
        AmpContext {
            specid: "021".into(),
            ifuslot: "075".into(),
            ifuid: "017".into(),
            amp: "LL".into(),
        }
    }

    #[test]
    fn test_parse_table() {
        let rows = parse_table("# header\n1 2 3\n\n4 5 6\n", "mem").unwrap();
        let m = table_to_matrix(&rows, "mem").unwrap();
        assert_eq!(m.shape(), (2, 3));
        assert_eq!(m[(1, 0)], 4.0);

        let err = parse_table("1 2\n3 x\n", "mem").unwrap_err();
        assert_eq!(
            err,
            PanaceaError::MalformedTable {
                path: "mem".into(),
                line: 2,
                reason: String::new()
            }
        );
        let ragged = parse_table("1 2\n3\n", "mem").unwrap();
        assert!(table_to_matrix(&ragged, "mem").is_err());
    }

    #[test]
    fn test_closest_date() {
        let mut lib = MemoryLibrary::default();
        for date in ["20161101", "20170310", "20170601"] {
            lib.insert_locations(date, &ctx(), vec![1.0]);
        }
        let obs = Epoch::from_str("2017-03-15T00:00:00 UTC").unwrap();
        assert_eq!(closest_reference_date(&lib, obs).unwrap(), "20170310");

        let empty = MemoryLibrary::default();
        assert!(closest_reference_date(&empty, obs).is_err());
    }

    #[test]
    fn test_directory_library() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("Fiber_Locations/20170310")).unwrap();
        fs::write(
            root.join("Fiber_Locations/20170310/fiber_loc_021_075_017_LL.txt"),
            "12.5 1\n4.0 2\n",
        )
        .unwrap();
        fs::create_dir_all(root.join("solar_spec")).unwrap();
        fs::write(root.join("solar_spec/virus_temp.txt"), "3500 1.0\n3501 1.5\n").unwrap();

        let lib = DirectoryLibrary::new(root.clone()).with_specname("virus");
        assert_eq!(lib.reference_dates().unwrap(), vec!["20170310".to_string()]);
        assert_eq!(
            lib.fiber_locations("20170310", &ctx()).unwrap(),
            vec![12.5, 4.0]
        );
        let (w, f) = lib.reference_spectrum().unwrap();
        assert_eq!(w, vec![3500.0, 3501.0]);
        assert_eq!(f, vec![1.0, 1.5]);
        assert!(matches!(
            lib.master_bias("021", "LL"),
            Err(PanaceaError::FileNotFound(_))
        ));
    }
}
