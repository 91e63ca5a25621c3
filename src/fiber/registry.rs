//! # Fiber registry
//!
//! The ordered fiber collection of one amplifier. Position `i` always holds fiber
//! number `i + 1`, in spatial order across the detector.
//!
//! Besides plain access, the registry owns two cross-fiber mechanisms:
//!
//! * **Dead-fiber fill** – [`FiberRegistry::nearest_live`] searches outward from a dead
//!   fiber for the closest live one (smaller index distance first, then the lower
//!   index), and [`FiberRegistry::fill_dead`] copies the requested properties from it.
//! * **Persistence** – [`FiberRegistry::save`] writes one record per fiber to a
//!   [`CalibrationStore`]; [`FiberRegistry::load_properties`] reads selected properties
//!   back with binning conversion, and [`FiberRegistry::load_all`] replaces the whole
//!   collection.
use tracing::debug;

use crate::{
    amplifier::AmpContext,
    calibration::{read_ordered, CalibrationStore, FiberKey},
    fiber::{property::FiberProperty, Fiber},
    panacea_errors::PanaceaError,
};

#[derive(Debug, Clone, Default)]
pub struct FiberRegistry {
    columns: usize,
    fibers: Vec<Fiber>,
}

impl FiberRegistry {
    pub fn new(columns: usize) -> Self {
        FiberRegistry {
            columns,
            fibers: Vec::new(),
        }
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn len(&self) -> usize {
        self.fibers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fibers.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Fiber> {
        self.fibers.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Fiber> {
        self.fibers.iter_mut()
    }

    pub fn as_slice(&self) -> &[Fiber] {
        &self.fibers
    }

    pub fn get(&self, i: usize) -> Option<&Fiber> {
        self.fibers.get(i)
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut Fiber> {
        self.fibers.get_mut(i)
    }

    pub fn clear(&mut self) {
        self.fibers.clear();
    }

    /// Grow the collection to at least `n` fibers, numbering new fibers sequentially.
    pub fn ensure_len(&mut self, n: usize) {
        let columns = self.columns;
        while self.fibers.len() < n {
            let fibnum = self.fibers.len() + 1;
            self.fibers.push(Fiber::new(fibnum, columns));
        }
    }

    /// Keep only the first `n` fibers.
    pub fn truncate(&mut self, n: usize) {
        self.fibers.truncate(n);
    }

    pub fn good_indices(&self) -> Vec<usize> {
        (0..self.fibers.len())
            .filter(|&i| !self.fibers[i].dead)
            .collect()
    }

    pub fn dead_indices(&self) -> Vec<usize> {
        (0..self.fibers.len())
            .filter(|&i| self.fibers[i].dead)
            .collect()
    }

    /// Closest live fiber to position `i`.
    ///
    /// At equal index distance the lower index wins.
    ///
    /// Return
    /// ----------
    /// * The source index, or [`PanaceaError::NoLiveNeighbor`] when every other fiber is dead.
    pub fn nearest_live(&self, i: usize) -> Result<usize, PanaceaError> {
        let n = self.fibers.len();
        for j in 1..n.max(1) {
            if let Some(lo) = i.checked_sub(j) {
                if !self.fibers[lo].dead {
                    return Ok(lo);
                }
            }
            if i + j < n && !self.fibers[i + j].dead {
                return Ok(i + j);
            }
            if i < j && i + j >= n {
                break;
            }
        }
        Err(PanaceaError::NoLiveNeighbor(i + 1))
    }

    /// Copy `props` onto every dead fiber from its nearest live neighbour.
    ///
    /// Return
    /// ----------
    /// * `(dead, source)` index pairs, in increasing dead index order.
    pub fn fill_dead(
        &mut self,
        props: &[FiberProperty],
    ) -> Result<Vec<(usize, usize)>, PanaceaError> {
        let pairs = self
            .dead_indices()
            .into_iter()
            .map(|i| self.nearest_live(i).map(|src| (i, src)))
            .collect::<Result<Vec<_>, _>>()?;

        for &(dead, src) in &pairs {
            let source = self.fibers[src].clone();
            let target = &mut self.fibers[dead];
            for &prop in props {
                target.copy_property(&source, prop);
            }
            debug!(fiber = dead + 1, source = src + 1, "dead fiber filled from neighbour");
        }
        Ok(pairs)
    }

    /// Write every fiber to `store`.
    pub fn save(
        &self,
        store: &mut dyn CalibrationStore,
        ctx: &AmpContext,
    ) -> Result<(), PanaceaError> {
        for fiber in &self.fibers {
            store.put(&FiberKey::new(fiber.fibnum, ctx), fiber)?;
        }
        Ok(())
    }

    /// Load `props` from the records of `ctx`, resizing the collection to one fiber per
    /// record.
    ///
    /// A record that lacks a requested property leaves the fiber untouched for that
    /// property and is reported at `debug` level.
    ///
    /// Arguments
    /// -----------------
    /// * `store`: Store holding the records (calibration or sky path).
    /// * `ctx`: Amplifier identifiers.
    /// * `props`: Properties to transfer.
    ///
    /// Return
    /// ----------
    /// * The number of records read.
    /// * [`PanaceaError::CalibrationOrderMismatch`] if the records are not numbered `1..=n`.
    pub fn load_properties(
        &mut self,
        store: &dyn CalibrationStore,
        ctx: &AmpContext,
        props: &[FiberProperty],
    ) -> Result<usize, PanaceaError> {
        let records = read_ordered(store, ctx)?;
        self.ensure_len(records.len());
        self.truncate(records.len());
        for (fiber, record) in self.fibers.iter_mut().zip(records.iter()) {
            for &prop in props {
                if !fiber.convert_property(record, prop) {
                    debug!(
                        fiber = record.fibnum,
                        property = %prop,
                        "cannot load attribute from record"
                    );
                }
            }
        }
        Ok(records.len())
    }

    /// Replace the collection with the records of `ctx`.
    pub fn load_all(
        &mut self,
        store: &dyn CalibrationStore,
        ctx: &AmpContext,
    ) -> Result<usize, PanaceaError> {
        let mut records = read_ordered(store, ctx)?;
        records.iter_mut().for_each(Fiber::evaluate_all);
        self.fibers = records;
        Ok(self.fibers.len())
    }
}

impl<'a> IntoIterator for &'a FiberRegistry {
    type Item = &'a Fiber;
    type IntoIter = std::slice::Iter<'a, Fiber>;

    fn into_iter(self) -> Self::IntoIter {
        self.fibers.iter()
    }
}

impl std::ops::Index<usize> for FiberRegistry {
    type Output = Fiber;

    fn index(&self, i: usize) -> &Fiber {
        &self.fibers[i]
    }
}

impl std::ops::IndexMut<usize> for FiberRegistry {
    fn index_mut(&mut self, i: usize) -> &mut Fiber {
        &mut self.fibers[i]
    }
}

#[cfg(test)]
mod registry_test {
    use super::*;
    use crate::calibration::MemoryStore;

    fn registry(dead: &[usize], n: usize) -> FiberRegistry {
        let mut reg = FiberRegistry::new(5);
        reg.ensure_len(n);
        for (i, fiber) in reg.iter_mut().enumerate() {
            fiber.dead = dead.contains(&i);
            fiber.spectrum = Some(vec![i as f64; 5]);
        }
        reg
    }

    #[test]
    fn test_nearest_live_tie_break() {
        let reg = registry(&[2], 5);
        assert_eq!(reg.nearest_live(2).unwrap(), 1);

        let reg = registry(&[0, 1, 2], 5);
        assert_eq!(reg.nearest_live(0).unwrap(), 3);
        assert_eq!(reg.nearest_live(2).unwrap(), 3);

        let reg = registry(&[3, 4], 5);
        assert_eq!(reg.nearest_live(4).unwrap(), 2);
    }

    #[test]
    fn test_no_live_neighbor() {
        let reg = registry(&[0, 1, 2], 3);
        assert_eq!(
            reg.nearest_live(1).unwrap_err(),
            PanaceaError::NoLiveNeighbor(2)
        );
        let single = registry(&[0], 1);
        assert!(single.nearest_live(0).is_err());
    }

    #[test]
    fn test_fill_dead() {
        let mut reg = registry(&[0, 3], 5);
        let pairs = reg.fill_dead(&[FiberProperty::Spectrum]).unwrap();
        assert_eq!(pairs, vec![(0, 1), (3, 2)]);
        assert_eq!(reg[3].spectrum.as_deref(), Some(&[2.0; 5][..]));
        assert!(reg[3].dead);
    }

    #[test]
    fn test_load_properties_creates_fibers() {
        let ctx = AmpContext {
            specid: "021".into(),
            ifuslot: "075".into(),
            ifuid: "017".into(),
            amp: "LL".into(),
        };
        let mut store = MemoryStore::new();
        registry(&[1], 3).save(&mut store, &ctx).unwrap();

        let mut reg = FiberRegistry::new(5);
        let n = reg
            .load_properties(&store, &ctx, &[FiberProperty::Dead, FiberProperty::Trace])
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(reg.dead_indices(), vec![1]);
        assert!(reg[0].trace.is_none());
        assert!(reg[0].spectrum.is_none());
    }

    #[test]
    fn test_load_properties_drops_extra_fibers() {
        let ctx = AmpContext {
            specid: "021".into(),
            ifuslot: "075".into(),
            ifuid: "017".into(),
            amp: "LL".into(),
        };
        let mut store = MemoryStore::new();
        registry(&[], 3).save(&mut store, &ctx).unwrap();

        let mut reg = registry(&[4], 5);
        let n = reg
            .load_properties(&store, &ctx, &[FiberProperty::Dead])
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(reg.len(), 3);
        assert!(reg.dead_indices().is_empty());
    }
}
