//! Ordered interval map keyed by non-overlapping half-open `[low, high)` ranges.
//!
//! This is the portable equivalent of an intrusive red-black tree of
//! disjoint address ranges: a `BTreeMap` keyed by each range's `low`
//! bound gives us O(log n) insert/lookup/remove without embedding tree
//! links in the payload.

use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised by [`IntervalMap`] operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IntervalError {
    /// The inserted range overlaps a range already present in the map.
    #[error("range [{low:#x}, {high:#x}) overlaps an existing entry")]
    Overlap { low: u64, high: u64 },
}

struct Entry<V> {
    high: u64,
    value: V,
}

/// An ordered map of disjoint `[low, high)` ranges to values.
///
/// No two stored ranges ever overlap: [`insert`](Self::insert) rejects
/// a range that intersects an existing one instead of silently
/// replacing it.
pub struct IntervalMap<V> {
    entries: BTreeMap<u64, Entry<V>>,
}

impl<V> Default for IntervalMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> IntervalMap<V> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Insert `[low, high)` mapped to `value`.
    ///
    /// Fails with [`IntervalError::Overlap`] if the new range shares any
    /// byte with a range already present.
    pub fn insert(&mut self, low: u64, high: u64, value: V) -> Result<(), IntervalError> {
        debug_assert!(low < high);

        // The only candidate overlapping on the left is the entry whose
        // key is the greatest key <= low.
        if let Some((&cand_low, cand)) = self.entries.range(..=low).next_back() {
            if cand.high > low {
                return Err(IntervalError::Overlap { low, high });
            }
            let _ = cand_low;
        }
        // The only candidate overlapping on the right is the entry whose
        // key is the smallest key > low (it could start before `high`).
        if let Some((&cand_low, _)) = self.entries.range((low + 1)..).next() {
            if cand_low < high {
                return Err(IntervalError::Overlap { low, high });
            }
        }

        self.entries.insert(low, Entry { high, value });
        Ok(())
    }

    /// Return the value whose range contains point `p`, if any.
    pub fn search_point(&self, p: u64) -> Option<&V> {
        let (_, entry) = self.entries.range(..=p).next_back()?;
        if p < entry.high {
            Some(&entry.value)
        } else {
            None
        }
    }

    /// Mutable variant of [`search_point`](Self::search_point).
    pub fn search_point_mut(&mut self, p: u64) -> Option<&mut V> {
        let (_, entry) = self.entries.range_mut(..=p).next_back()?;
        if p < entry.high {
            Some(&mut entry.value)
        } else {
            None
        }
    }

    /// Return the value of the single stored range that fully contains
    /// `[lo, hi)`. Returns `None` if the request spans more than one
    /// stored range, or lands in a gap.
    pub fn search_range(&self, lo: u64, hi: u64) -> Option<&V> {
        let (&cand_low, entry) = self.entries.range(..=lo).next_back()?;
        if cand_low <= lo && entry.high >= hi {
            Some(&entry.value)
        } else {
            None
        }
    }

    /// Remove the range starting at `low`, returning its value.
    pub fn remove(&mut self, low: u64) -> Option<V> {
        self.entries.remove(&low).map(|e| e.value)
    }

    /// Mutable access to the value stored at exactly `low`.
    pub fn get_mut(&mut self, low: u64) -> Option<&mut V> {
        self.entries.get_mut(&low).map(|e| &mut e.value)
    }

    /// Like [`search_range`](Self::search_range) but returns the `low`
    /// key of the containing entry instead of the value, so the caller
    /// can later look it up again for a mutable update.
    pub fn search_range_key(&self, lo: u64, hi: u64) -> Option<u64> {
        let (&cand_low, entry) = self.entries.range(..=lo).next_back()?;
        if cand_low <= lo && entry.high >= hi {
            Some(cand_low)
        } else {
            None
        }
    }

    /// Find the `low` key of whichever stored range contains `p`, if any.
    pub fn key_containing(&self, p: u64) -> Option<u64> {
        let (&low, entry) = self.entries.range(..=p).next_back()?;
        if p < entry.high {
            Some(low)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_point_lookup() {
        let mut m = IntervalMap::new();
        m.insert(0x3f8, 0x400, "uart0").unwrap();
        m.insert(0x2f8, 0x300, "uart1").unwrap();

        assert_eq!(m.search_point(0x3f8), Some(&"uart0"));
        assert_eq!(m.search_point(0x3ff), Some(&"uart0"));
        assert_eq!(m.search_point(0x400), None);
        assert_eq!(m.search_point(0x2fc), Some(&"uart1"));
    }

    #[test]
    fn rejects_overlap() {
        let mut m = IntervalMap::new();
        m.insert(0x60, 0x62, "kbd").unwrap();
        assert_eq!(
            m.insert(0x61, 0x63, "bad"),
            Err(IntervalError::Overlap { low: 0x61, high: 0x63 })
        );
        assert_eq!(
            m.insert(0x5f, 0x61, "bad2"),
            Err(IntervalError::Overlap { low: 0x5f, high: 0x61 })
        );
        // Adjacent, non-overlapping ranges are fine.
        m.insert(0x62, 0x64, "ok").unwrap();
    }

    #[test]
    fn search_range_strict_containment() {
        let mut m = IntervalMap::new();
        m.insert(0x3f8, 0x400, "uart0").unwrap();
        assert_eq!(m.search_range(0x3f8, 0x3fc), Some(&"uart0"));
        assert_eq!(m.search_range(0x3fc, 0x400), Some(&"uart0"));
        // Spans beyond the stored range entirely.
        assert_eq!(m.search_range(0x3fe, 0x402), None);
        // Falls in an unmapped gap.
        assert_eq!(m.search_range(0x500, 0x502), None);
    }

    #[test]
    fn remove_then_reinsert() {
        let mut m = IntervalMap::new();
        m.insert(0x60, 0x62, "kbd").unwrap();
        assert_eq!(m.remove(0x60), Some("kbd"));
        assert_eq!(m.search_point(0x60), None);
        m.insert(0x60, 0x62, "kbd2").unwrap();
        assert_eq!(m.search_point(0x60), Some(&"kbd2"));
    }
}
