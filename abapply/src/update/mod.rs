// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

pub mod applier;
pub mod checkpoint;
pub mod operation;
pub mod patch;
pub mod plan;
pub mod prefs;
pub mod terminator;
