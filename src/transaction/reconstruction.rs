//! Bookkeeping of the file data extents received by an incoming transaction.
use std::collections::BTreeMap;

/// Ordered map of received extents, offset to length, plus the contiguous progress counter.
///
/// All bytes below [Self::contiguous] are received. Every extent starting at or below the
/// counter ends at or below it as well.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconstructionMap {
    extents: BTreeMap<u64, u64>,
    contiguous: u64,
    received_end: u64,
}

impl ReconstructionMap {
    /// Records an extent. Returns [false] if an extent of the same or a larger length is already
    /// recorded at this offset, or if the extent ends beyond [u64::MAX]. Nothing changes then.
    pub fn insert(&mut self, offset: u64, len: u64) -> bool {
        let Some(end) = offset.checked_add(len) else {
            return false;
        };
        if self.covers(offset, len) {
            return false;
        }
        self.extents.insert(offset, len);
        self.received_end = self.received_end.max(end);
        self.advance(offset.min(self.contiguous));
        true
    }

    /// Whether inserting the extent would be a no-op.
    pub fn covers(&self, offset: u64, len: u64) -> bool {
        len == 0
            || self
                .extents
                .get(&offset)
                .is_some_and(|existing| *existing >= len)
    }

    fn advance(&mut self, from: u64) {
        for (offset, len) in self.extents.range(from..) {
            if *offset > self.contiguous {
                break;
            }
            self.contiguous = self.contiguous.max(offset + len);
        }
    }

    /// Number of bytes received without any gap, starting at offset 0.
    pub fn contiguous(&self) -> u64 {
        self.contiguous
    }

    /// End of the highest extent received so far.
    pub fn received_end(&self) -> u64 {
        self.received_end
    }

    pub fn gap_detected(&self) -> bool {
        self.extents
            .range(self.contiguous.saturating_add(1)..)
            .next()
            .is_some()
    }

    /// Missing ranges as `[start, end)` pairs. If the file size is known, the range between the
    /// last extent and the end of the file is included.
    pub fn missing(&self, file_size: Option<u64>) -> Vec<(u64, u64)> {
        let mut missing = Vec::new();
        let mut expected = self.contiguous;
        for (offset, len) in self.extents.range(self.contiguous..) {
            if *offset > expected {
                missing.push((expected, *offset));
            }
            expected = expected.max(offset + len);
        }
        if let Some(file_size) = file_size {
            if expected < file_size {
                missing.push((expected, file_size));
            }
        }
        missing
    }
}
