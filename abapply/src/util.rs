// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use num_traits::PrimInt;

pub const ZEROS: [u8; 16384] = [0u8; 16384];

/// A small wrapper to format a number as a size in bytes.
#[derive(Clone, Copy)]
pub struct NumBytes<T: PrimInt>(pub T);

impl<T: PrimInt + fmt::Display> fmt::Display for NumBytes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == T::one() {
            write!(f, "{} byte", self.0)
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}

impl<T: PrimInt + fmt::Debug> fmt::Debug for NumBytes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == T::one() {
            write!(f, "<{:?} byte>", self.0)
        } else {
            write!(f, "<{:?} bytes>", self.0)
        }
    }
}

/// A string that is displayed via its [`fmt::Debug`] representation. This is
/// used for storing things like [`std::process::Command`] in error types
/// without requiring the original value to be [`Send`] or [`Sync`].
#[derive(Clone)]
pub struct DebugString(String);

impl DebugString {
    pub fn new<T: fmt::Debug + ?Sized>(value: &T) -> Self {
        Self(format!("{value:?}"))
    }
}

impl fmt::Debug for DebugString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Format a hash for log messages. Hashes are shown in base64 since that is
/// how update servers advertise them.
pub fn hash_to_base64(hash: &[u8]) -> String {
    STANDARD.encode(hash)
}

/// Integer ratio of `part` to `total`, scaled to `norm`. `total` must not be
/// zero.
pub fn int_ratio(part: u64, total: u64, norm: u64) -> u64 {
    (u128::from(part) * u128::from(norm) / u128::from(total)) as u64
}
