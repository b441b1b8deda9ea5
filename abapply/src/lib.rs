// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

//! abapply is primarily an application, so semver covers the CLI only. The
//! Rust APIs may change in any release.
//!
//! The library half is split into the payload wire format ([`format`]), the
//! streaming applier and its persistence ([`update`]), and the small I/O and
//! crypto helpers they share.

pub mod cli;
pub mod crypto;
pub mod format;
pub mod hash;
pub mod protobuf;
pub mod stream;
pub mod update;
pub mod util;
