// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::BTreeMap, fmt, str::FromStr};

use thiserror::Error;

use crate::protobuf::chromeos_update_engine::Extent;

/// Start block value marking an extent with no physical backing. Reads
/// produce zeros and writes are skipped since the destination is assumed to
/// already be zeroed.
pub const SPARSE_HOLE: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Extent {index} ({start_block}+{num_blocks}) exceeds integer bounds")]
    ExtentOverflow {
        index: usize,
        start_block: u64,
        num_blocks: u64,
    },
    #[error("Extents cover {actual} bytes, but expected {expected} bytes")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("Invalid position entry: {0:?}")]
    InvalidPosition(String),
}

type Result<T> = std::result::Result<T, Error>;

pub fn is_sparse_hole(extent: &Extent) -> bool {
    extent.start_block() == SPARSE_HOLE
}

/// Total number of blocks covered by `extents`, including sparse holes.
pub fn total_blocks(extents: &[Extent]) -> Option<u64> {
    extents
        .iter()
        .try_fold(0u64, |acc, e| acc.checked_add(e.num_blocks()))
}

/// Byte offset and length of an extent. The offset is [`None`] for sparse
/// holes.
pub fn byte_range(index: usize, extent: &Extent, block_size: u32) -> Result<(Option<u64>, u64)> {
    let overflow = || Error::ExtentOverflow {
        index,
        start_block: extent.start_block(),
        num_blocks: extent.num_blocks(),
    };

    let length = extent
        .num_blocks()
        .checked_mul(block_size.into())
        .ok_or_else(overflow)?;

    if is_sparse_hole(extent) {
        return Ok((None, length));
    }

    let offset = extent
        .start_block()
        .checked_mul(block_size.into())
        .ok_or_else(overflow)?;
    offset.checked_add(length).ok_or_else(overflow)?;

    Ok((Some(offset), length))
}

/// A set of blocks, stored as non-overlapping, non-adjacent half-open ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtentRanges {
    /// Start block -> end block (exclusive).
    ranges: BTreeMap<u64, u64>,
}

impl ExtentRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks in the set.
    pub fn blocks(&self) -> u64 {
        self.ranges.iter().map(|(start, end)| end - start).sum()
    }

    pub fn add_range(&mut self, mut start: u64, mut end: u64) {
        if start >= end {
            return;
        }

        // Absorb every range that overlaps or touches [start, end).
        let touching = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|&(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect::<Vec<_>>();

        for (s, e) in touching {
            self.ranges.remove(&s);
            start = start.min(s);
            end = end.max(e);
        }

        self.ranges.insert(start, end);
    }

    pub fn subtract_range(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }

        let overlapping = self
            .ranges
            .range(..end)
            .rev()
            .take_while(|&(_, &e)| e > start)
            .map(|(&s, &e)| (s, e))
            .collect::<Vec<_>>();

        for (s, e) in overlapping {
            self.ranges.remove(&s);

            if s < start {
                self.ranges.insert(s, start);
            }
            if e > end {
                self.ranges.insert(end, e);
            }
        }
    }

    /// Sparse holes have no physical blocks and are ignored.
    pub fn add_extents(&mut self, extents: &[Extent]) {
        for extent in extents.iter().filter(|e| !is_sparse_hole(e)) {
            let start = extent.start_block();
            self.add_range(start, start.saturating_add(extent.num_blocks()));
        }
    }

    /// Sparse holes have no physical blocks and are ignored.
    pub fn subtract_extents(&mut self, extents: &[Extent]) {
        for extent in extents.iter().filter(|e| !is_sparse_hole(e)) {
            let start = extent.start_block();
            self.subtract_range(start, start.saturating_add(extent.num_blocks()));
        }
    }
}

/// A single entry in a patch tool position list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Position {
    /// Absolute byte offset, or [`None`] for a sparse hole.
    pub offset: Option<u64>,
    pub length: u64,
}

/// Byte position list handed to the external patch tool. The string form is
/// `<offset>:<length>` entries joined by commas, where sparse holes have an
/// offset of `-1`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Positions(pub Vec<Position>);

impl Positions {
    /// Build a position list covering exactly `full_length` bytes of
    /// `extents`. The final entry is truncated if the extents extend past
    /// `full_length`.
    pub fn from_extents(extents: &[Extent], block_size: u32, full_length: u64) -> Result<Self> {
        let mut result = vec![];
        let mut length = 0u64;

        for (index, extent) in extents.iter().enumerate() {
            let (offset, extent_length) = byte_range(index, extent, block_size)?;
            let this_length = (full_length - length).min(extent_length);

            result.push(Position {
                offset,
                length: this_length,
            });
            length += this_length;
        }

        if length != full_length {
            return Err(Error::LengthMismatch {
                expected: full_length,
                actual: length,
            });
        }

        Ok(Self(result))
    }

    pub fn total_length(&self) -> u64 {
        self.0.iter().map(|p| p.length).sum()
    }
}

impl fmt::Display for Positions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, position) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }

            match position.offset {
                Some(offset) => write!(f, "{offset}:{}", position.length)?,
                None => write!(f, "-1:{}", position.length)?,
            }
        }

        Ok(())
    }
}

impl FromStr for Positions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::default());
        }

        s.split(',')
            .map(|entry| {
                let invalid = || Error::InvalidPosition(entry.to_owned());
                let (offset, length) = entry.split_once(':').ok_or_else(invalid)?;
                let offset = match offset {
                    "-1" => None,
                    o => Some(o.parse::<u64>().map_err(|_| invalid())?),
                };
                let length = length.parse::<u64>().map_err(|_| invalid())?;

                Ok(Position { offset, length })
            })
            .collect::<Result<_>>()
            .map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(start_block: u64, num_blocks: u64) -> Extent {
        Extent {
            start_block: Some(start_block),
            num_blocks: Some(num_blocks),
        }
    }

    #[test]
    fn ranges_merge_adjacent() {
        let mut ranges = ExtentRanges::new();
        ranges.add_range(4, 6);
        ranges.add_range(0, 2);
        ranges.add_range(2, 4);
        assert_eq!(ranges.ranges.iter().collect::<Vec<_>>(), [(&0, &6)]);
        assert_eq!(ranges.blocks(), 6);

        ranges.add_range(1, 3);
        assert_eq!(ranges.blocks(), 6);

        ranges.add_range(10, 12);
        assert_eq!(ranges.blocks(), 8);
    }

    #[test]
    fn ranges_subtract_splits() {
        let mut ranges = ExtentRanges::new();
        ranges.add_range(0, 10);
        ranges.add_range(20, 30);

        ranges.subtract_range(3, 5);
        assert_eq!(
            ranges.ranges.iter().collect::<Vec<_>>(),
            [(&0, &3), (&5, &10), (&20, &30)],
        );

        ranges.subtract_range(8, 25);
        assert_eq!(
            ranges.ranges.iter().collect::<Vec<_>>(),
            [(&0, &3), (&5, &8), (&25, &30)],
        );
        assert_eq!(ranges.blocks(), 11);
    }

    #[test]
    fn ranges_ignore_sparse_holes() {
        let mut ranges = ExtentRanges::new();
        ranges.add_extents(&[extent(SPARSE_HOLE, 4), extent(2, 2)]);
        assert_eq!(ranges.blocks(), 2);

        ranges.subtract_extents(&[extent(SPARSE_HOLE, 100)]);
        assert_eq!(ranges.blocks(), 2);
    }

    #[test]
    fn positions_string() {
        let extents = [extent(1, 2), extent(SPARSE_HOLE, 1), extent(10, 1)];
        let positions = Positions::from_extents(&extents, 4096, 3 * 4096 + 100).unwrap();

        assert_eq!(positions.to_string(), "4096:8192,-1:4096,40960:100");
        assert_eq!(positions.to_string().parse::<Positions>().unwrap(), positions);
    }

    #[test]
    fn positions_length_mismatch() {
        let extents = [extent(0, 1)];

        assert!(matches!(
            Positions::from_extents(&extents, 4096, 4097),
            Err(Error::LengthMismatch {
                expected: 4097,
                actual: 4096,
            })
        ));
    }

    #[test]
    fn positions_invalid() {
        assert!(matches!(
            "0:1,abc".parse::<Positions>(),
            Err(Error::InvalidPosition(e)) if e == "abc"
        ));
        assert_eq!("".parse::<Positions>().unwrap(), Positions::default());
    }
}
