//! Compact replica-set bitmap helper.

use std::fmt;

use crate::utils::ViewstampError;

use fixedbitset::FixedBitSet;

/// Compact bitmap for replica ID -> bool mapping, used for counting distinct
/// acknowledgers in quorum waits.
#[derive(Clone, PartialEq, Eq)]
pub struct ReplicaMap(FixedBitSet);

impl ReplicaMap {
    /// Creates a new bitmap for a cluster of given population. If `ones` is
    /// true, all slots are marked true initially.
    pub fn new(population: u8, ones: bool) -> Result<Self, ViewstampError> {
        if population == 0 {
            return Err(ViewstampError::msg("invalid bitmap size 0"));
        }
        let mut bitset = FixedBitSet::with_capacity(population as usize);
        if ones {
            bitset.set_range(.., true);
        }
        Ok(ReplicaMap(bitset))
    }

    /// Sets bit at index to given flag. Returns the previous flag.
    #[inline]
    pub fn set(&mut self, idx: u8, flag: bool) -> Result<bool, ViewstampError> {
        if idx as usize >= self.0.len() {
            return Err(ViewstampError::msg(format!(
                "index {} out of bound",
                idx
            )));
        }
        let old = self.0[idx as usize];
        self.0.set(idx as usize, flag);
        Ok(old)
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: u8) -> Result<bool, ViewstampError> {
        if idx as usize >= self.0.len() {
            return Err(ViewstampError::msg(format!(
                "index {} out of bound",
                idx
            )));
        }
        Ok(self.0[idx as usize])
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> u8 {
        self.0.len() as u8
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> u8 {
        self.0.count_ones(..) as u8
    }

    /// Clears all bits to false.
    #[inline]
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Allows `for (id, bit) in map.iter()`.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (u8, bool)> + '_ {
        (0..self.0.len()).map(|i| (i as u8, self.0[i]))
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for ReplicaMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ones: Vec<usize> = self.0.ones().collect();
        write!(f, "{{{}; {:?}}}", self.size(), ones)
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    fn bitmap_new_invalid() {
        assert!(ReplicaMap::new(0, true).is_err());
    }

    #[test]
    fn bitmap_set_get() -> Result<(), ViewstampError> {
        let mut map = ReplicaMap::new(7, false)?;
        assert_eq!(map.set(0, true), Ok(false));
        assert_eq!(map.set(0, true), Ok(true));
        assert!(map.set(2, true).is_ok());
        assert!(map.set(7, true).is_err());
        assert_eq!(map.get(0), Ok(true));
        assert_eq!(map.get(1), Ok(false));
        assert_eq!(map.get(2), Ok(true));
        assert!(map.get(7).is_err());
        Ok(())
    }

    #[test]
    fn bitmap_count_distinct() -> Result<(), ViewstampError> {
        let mut map = ReplicaMap::new(5, false)?;
        map.set(1, true)?;
        map.set(1, true)?;
        map.set(3, true)?;
        assert_eq!(map.count(), 2);
        map.clear();
        assert_eq!(map.count(), 0);
        Ok(())
    }

    #[test]
    fn bitmap_iter_debug() -> Result<(), ViewstampError> {
        let ref_map = [true, true, false, true, true];
        let mut map = ReplicaMap::new(5, true)?;
        map.set(2, false)?;
        for (id, flag) in map.iter() {
            assert_eq!(ref_map[id as usize], flag);
        }
        assert_eq!(format!("{:?}", map), "{5; [0, 1, 3, 4]}");
        Ok(())
    }
}
