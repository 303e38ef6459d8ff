#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifier of a fixed-size page within a single backing file.
///
/// The byte position of a page is `page id × page size`. Page ids are dense
/// and non-negative; the swapper never interprets page contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u64);

impl PageId {
    /// Byte offset of this page for the given page size, `None` on overflow.
    #[must_use]
    pub fn checked_offset(self, page_size: PageSize) -> Option<ByteOffset> {
        self.0
            .checked_mul(u64::from(page_size.get()))
            .map(ByteOffset)
    }

    /// The page `count` pages after this one, `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

/// Byte offset for positioned I/O (pread/pwrite semantics).
///
/// This is a unit-carrying wrapper to prevent mixing byte offsets and page
/// ids in channel signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// Validated page size (positive byte count).
///
/// Callers conventionally use powers of two, but the swapper itself only
/// requires positivity; direct-I/O construction additionally demands
/// block-size alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageSize(u32);

impl PageSize {
    /// Create a `PageSize` if `value` is positive.
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if value == 0 {
            return Err(ParseError::InvalidField {
                field: "page_size",
                reason: "must be positive",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Page size as a slice length.
    #[must_use]
    pub fn bytes(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_rejects_zero() {
        assert!(PageSize::new(0).is_err());
        assert_eq!(PageSize::new(8192).unwrap().get(), 8192);
    }

    #[test]
    fn page_size_allows_non_power_of_two() {
        // The swapper leaves power-of-two conventions to its callers.
        assert_eq!(PageSize::new(100).unwrap().bytes(), 100);
    }

    #[test]
    fn page_offset_is_checked() {
        let page_size = PageSize::new(8192).unwrap();
        assert_eq!(
            PageId(3).checked_offset(page_size),
            Some(ByteOffset(3 * 8192))
        );
        assert_eq!(PageId(u64::MAX).checked_offset(page_size), None);
    }

    #[test]
    fn byte_offset_checked_add() {
        assert_eq!(ByteOffset(8).checked_add(8), Some(ByteOffset(16)));
        assert_eq!(ByteOffset(u64::MAX).checked_add(1), None);
    }
}
