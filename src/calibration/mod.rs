//! # Calibration artifacts
//!
//! Two read paths feed a reduction besides the raw frame:
//!
//! * a [`CalibrationStore`] holding one [`Fiber`] record per fiber and amplifier,
//!   addressed by a [`FiberKey`]. A twilight reduction writes it; science reductions
//!   read trace, fiber model, wavelength and throughput back from it
//!   (`calpath`), or sky spectra from a previous science reduction (`skypath`).
//! * a [`CalibrationLibrary`] of read-only instrument masters: bias, dark and pixel-flat
//!   frames, reference fiber positions and the reference spectrum template.
//!
//! ## Ordering check
//!
//! [`read_ordered`] lists the records of an amplifier, sorted by name, and requires the
//! `i`-th record to be fiber `i + 1`. Any gap or stray record aborts the load with
//! [`PanaceaError::CalibrationOrderMismatch`], since the fiber index is the only link
//! between a record and its position on the detector.
pub mod directory_store;
pub mod library;

use std::collections::BTreeMap;

use crate::{
    amplifier::AmpContext, constants::FiberNumber, fiber::Fiber, panacea_errors::PanaceaError,
};

pub use directory_store::DirectoryStore;
pub use library::{CalibrationLibrary, DirectoryLibrary, MemoryLibrary};

/// Composite key of a persisted fiber record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberKey {
    pub index: FiberNumber,
    pub specid: String,
    pub ifuslot: String,
    pub ifuid: String,
    pub amp: String,
}

impl FiberKey {
    pub fn new(index: FiberNumber, ctx: &AmpContext) -> Self {
        FiberKey {
            index,
            specid: ctx.specid.clone(),
            ifuslot: ctx.ifuslot.clone(),
            ifuid: ctx.ifuid.clone(),
            amp: ctx.amp.clone(),
        }
    }

    /// Record name, e.g. `fiber_001_021_075_017_LU.json`.
    pub fn record_name(&self) -> String {
        format!(
            "fiber_{:03}_{}_{}_{}_{}.json",
            self.index, self.specid, self.ifuslot, self.ifuid, self.amp
        )
    }

    /// `true` if `name` is a record of the amplifier `ctx`, whatever its index.
    pub fn matches_context(name: &str, ctx: &AmpContext) -> bool {
        let suffix = format!("_{ctx}.json");
        name.starts_with("fiber_")
            && name.ends_with(&suffix)
            && name.len() > "fiber_".len() + suffix.len()
    }
}

/// Load/store capability for per-fiber records.
pub trait CalibrationStore: Send + Sync {
    /// Names of the records of `ctx`, in any order.
    fn list(&self, ctx: &AmpContext) -> Result<Vec<String>, PanaceaError>;

    /// Fetch one record; `Ok(None)` when it does not exist.
    fn get(&self, key: &FiberKey) -> Result<Option<Fiber>, PanaceaError>;

    fn put(&mut self, key: &FiberKey, fiber: &Fiber) -> Result<(), PanaceaError>;
}

/// Store kept in memory, keyed by record name.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: BTreeMap<String, Fiber>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop a record by name.
    pub fn remove(&mut self, name: &str) -> Option<Fiber> {
        self.records.remove(name)
    }

    /// Insert a record under an arbitrary name.
    pub fn insert_raw(&mut self, name: impl Into<String>, fiber: Fiber) {
        self.records.insert(name.into(), fiber);
    }
}

impl CalibrationStore for MemoryStore {
    fn list(&self, ctx: &AmpContext) -> Result<Vec<String>, PanaceaError> {
        Ok(self
            .records
            .keys()
            .filter(|name| FiberKey::matches_context(name, ctx))
            .cloned()
            .collect())
    }

    fn get(&self, key: &FiberKey) -> Result<Option<Fiber>, PanaceaError> {
        Ok(self.records.get(&key.record_name()).cloned())
    }

    fn put(&mut self, key: &FiberKey, fiber: &Fiber) -> Result<(), PanaceaError> {
        self.records.insert(key.record_name(), fiber.clone());
        Ok(())
    }
}

/// Read every record of `ctx` in fiber order.
///
/// Arguments
/// -----------------
/// * `store`: Store to read from.
/// * `ctx`: Amplifier identifiers.
///
/// Return
/// ----------
/// * The records, the `i`-th being fiber `i + 1`.
/// * [`PanaceaError::CalibrationOrderMismatch`] if the sorted names do not follow
///   `1..=n` exactly.
pub fn read_ordered(
    store: &dyn CalibrationStore,
    ctx: &AmpContext,
) -> Result<Vec<Fiber>, PanaceaError> {
    let mut names = store.list(ctx)?;
    names.sort();

    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let key = FiberKey::new(i + 1, ctx);
            if *name != key.record_name() {
                return Err(PanaceaError::CalibrationOrderMismatch {
                    expected: i + 1,
                    found: name.clone(),
                });
            }
            store
                .get(&key)?
                .ok_or_else(|| PanaceaError::FileNotFound(name.clone()))
        })
        .collect()
}
